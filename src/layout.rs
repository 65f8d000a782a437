//! Layout Engine - Percent Widths to Page Geometry
//!
//! Under-specified tables are stretched to fill the content width. Over-specified
//! tables keep their proportions and widen the page instead; a printed invoice
//! must never truncate a column.

use serde::{Deserialize, Serialize};

use crate::print::PrintSpec;
use crate::templates::Column;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnGeometry {
    pub key: String,
    /// Width as authored, or the share handed to an unsized column.
    pub percent: f64,
    /// Width after scaling.
    pub scaled_percent: f64,
    pub width: f64,
    /// Distance from the left edge of the table.
    pub offset: f64,
}

/// Run of adjacent visible columns under one header band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnBand {
    /// `None` for an ungrouped single column.
    pub label: Option<String>,
    pub keys: Vec<String>,
    pub offset: f64,
    pub width: f64,
}

impl ColumnBand {
    pub fn span(&self) -> usize {
        self.keys.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layout {
    pub page_width: f64,
    /// Width of a 100% table on a standard page.
    pub content_width: f64,
    pub table_width: f64,
    /// Sum of the authored widths of visible columns.
    pub total_percent: f64,
    pub scale: f64,
    pub columns: Vec<ColumnGeometry>,
    pub bands: Vec<ColumnBand>,
}

impl Layout {
    /// Physical width of a visible column.
    pub fn width_of(&self, key: &str) -> Option<f64> {
        self.column(key).map(|c| c.width)
    }

    pub fn column(&self, key: &str) -> Option<&ColumnGeometry> {
        self.columns.iter().find(|c| c.key == key)
    }

    /// Table is wider than the standard page allows.
    pub fn overflows(&self) -> bool {
        self.total_percent > 100.0
    }
}

/// Read `"15%"`, `"15"` or `" 15.5 % "`. Anything else, or a negative width, is `None`.
pub fn parse_percent(width: &str) -> Option<f64> {
    let trimmed = width.trim();
    let number = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
    number.parse::<f64>()
        .ok()
        .filter(|n| n.is_finite() && *n >= 0.0)
}

pub fn compute_layout(columns: &[Column], spec: &PrintSpec) -> Layout {
    let visible: Vec<&Column> = columns.iter().filter(|c| c.visible).collect();
    let content_width = spec.content_width();

    let declared: Vec<f64> = visible.iter()
        .map(|c| c.width.as_deref().and_then(parse_percent).unwrap_or(0.0))
        .collect();
    let percents = fill_unsized(&declared);
    let total_percent: f64 = percents.iter().sum();

    // Nothing sized: split the table evenly instead of dividing by zero.
    let (scale, scaled): (f64, Vec<f64>) = if total_percent <= 0.0 {
        let even = if visible.is_empty() { 0.0 } else { 100.0 / visible.len() as f64 };
        (1.0, vec![even; visible.len()])
    } else if total_percent < 100.0 {
        let scale = 100.0 / total_percent;
        (scale, percents.iter().map(|p| p * scale).collect())
    } else {
        (1.0, percents.clone())
    };

    let mut offset = 0.0;
    let geometry: Vec<ColumnGeometry> = visible.iter()
        .zip(percents.iter().zip(&scaled))
        .map(|(column, (&percent, &scaled_percent))| {
            let width = scaled_percent / 100.0 * content_width;
            let cell = ColumnGeometry {
                key: column.key.clone(),
                percent,
                scaled_percent,
                width,
                offset,
            };
            offset += width;
            cell
        })
        .collect();

    let table_width = offset;
    let page_width = spec.page_width_mm.max(table_width + spec.horizontal_margins());
    let bands = group_bands(&visible, &geometry);

    Layout {
        page_width,
        content_width,
        table_width,
        total_percent,
        scale,
        columns: geometry,
        bands,
    }
}

/// Columns without a usable width share whatever the sized ones leave of 100%.
/// When nothing is left they get the average sized width, so no visible column
/// is printed zero wide.
fn fill_unsized(declared: &[f64]) -> Vec<f64> {
    let sized: Vec<f64> = declared.iter().copied().filter(|p| *p > 0.0).collect();
    let unsized_count = declared.len() - sized.len();
    if sized.is_empty() || unsized_count == 0 {
        return declared.to_vec();
    }

    let total: f64 = sized.iter().sum();
    let share = if total < 100.0 {
        (100.0 - total) / unsized_count as f64
    } else {
        total / sized.len() as f64
    };
    declared.iter()
        .map(|p| if *p > 0.0 { *p } else { share })
        .collect()
}

fn group_bands(visible: &[&Column], geometry: &[ColumnGeometry]) -> Vec<ColumnBand> {
    let mut bands: Vec<ColumnBand> = vec![];

    for (column, cell) in visible.iter().zip(geometry) {
        let label = column.group_label();
        let joins_previous = label.is_some()
            && bands.last().map_or(false, |band| band.label.as_deref() == label);

        if joins_previous {
            if let Some(band) = bands.last_mut() {
                band.keys.push(cell.key.clone());
                band.width += cell.width;
            }
            continue;
        }

        bands.push(ColumnBand {
            label: label.map(str::to_string),
            keys: vec![cell.key.clone()],
            offset: cell.offset,
            width: cell.width,
        });
    }

    bands
}
