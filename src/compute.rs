//! Row Computation Engine - Bounded Fixpoint over Formula Columns
//!
//! Formula columns may read other formula columns. Rather than ordering them
//! by dependency, every formula is re-evaluated each pass until a pass changes
//! nothing or the pass limit is hit. Cycles never converge and are cut off at
//! the limit; `RowComputation::converged` reports it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::expression::evaluate;
use crate::templates::{label_index, CellValue, Column, ComputedRow, RowValues};

/// Pass limit for preview and print.
pub const RENDER_PASSES: usize = 5;
/// Pass limit while the user is typing into a row.
pub const INTERACTIVE_PASSES: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum ComputeMode {
    /// Re-evaluate every formula column.
    #[default]
    Render,
    /// Skip the column being edited so its typed value is kept.
    Interactive { editing: Option<String> },
}

impl ComputeMode {
    pub fn max_passes(&self) -> usize {
        match self {
            ComputeMode::Render => RENDER_PASSES,
            ComputeMode::Interactive { .. } => INTERACTIVE_PASSES,
        }
    }

    fn skips(&self, key: &str) -> bool {
        matches!(self, ComputeMode::Interactive { editing: Some(editing) } if editing == key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowComputation {
    pub values: ComputedRow,
    pub passes: usize,
    /// A full pass completed without any value changing.
    pub converged: bool,
}

/// Compute one row. `position` is 1-based and feeds the serial column.
pub fn compute_row(row: &RowValues, columns: &[Column], position: usize, mode: &ComputeMode) -> RowComputation {
    let labels = label_index(columns);
    compute_with_labels(row, columns, position, mode, &labels)
}

/// Compute every row in order.
pub fn compute_rows(rows: &[RowValues], columns: &[Column], mode: &ComputeMode) -> Vec<RowComputation> {
    let labels = label_index(columns);
    rows.iter()
        .enumerate()
        .map(|(i, row)| compute_with_labels(row, columns, i + 1, mode, &labels))
        .collect()
}

fn compute_with_labels(
    row: &RowValues,
    columns: &[Column],
    position: usize,
    mode: &ComputeMode,
    labels: &HashMap<String, String>,
) -> RowComputation {
    let mut values = initial_values(row, columns, position);

    let formulas: Vec<(&str, &str)> = columns.iter()
        .filter(|c| !mode.skips(&c.key))
        .filter_map(|c| c.formula_text().map(|f| (c.key.as_str(), f)))
        .collect();

    let mut passes = 0;
    let mut converged = formulas.is_empty();

    while !converged && passes < mode.max_passes() {
        passes += 1;
        let mut changed = false;

        for (key, formula) in &formulas {
            let next = evaluate(formula, &values, labels);
            if values.get(*key) != Some(&next) {
                values.insert((*key).to_string(), next);
                changed = true;
            }
        }

        converged = !changed;
    }

    // The last allowed pass may have been the one that settled the row.
    if !converged && passes > 0 {
        converged = formulas.iter()
            .all(|(key, formula)| values.get(*key) == Some(&evaluate(formula, &values, labels)));
    }

    if !converged {
        log::warn!(
            "row {} did not settle after {} passes; formulas may be circular or too deep",
            position, passes
        );
    }

    RowComputation { values, passes, converged }
}

fn initial_values(row: &RowValues, columns: &[Column], position: usize) -> ComputedRow {
    let mut values = row.clone();

    for column in columns {
        let raw = row.get(&column.key).cloned().unwrap_or_default();
        let value = if column.is_serial() {
            CellValue::Number(position as f64)
        } else if column.column_type.is_numeric() {
            CellValue::Number(raw.as_number())
        } else {
            raw
        };
        values.insert(column.key.clone(), value);
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::ColumnType;
    use pretty_assertions::assert_eq;

    fn row(pairs: &[(&str, CellValue)]) -> RowValues {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn invoice_columns() -> Vec<Column> {
        vec![
            Column::new("sno", "S.No", ColumnType::Number),
            Column::new("desc", "Description", ColumnType::Text),
            Column::new("qty", "Quantity", ColumnType::Number),
            Column::new("price", "Price", ColumnType::Number),
            Column::formula("amt", "Amount", "[Quantity] * [Price]"),
        ]
    }

    #[test]
    fn test_amount_and_serial() {
        let raw = row(&[
            ("desc", CellValue::Text("Bolts".into())),
            ("qty", CellValue::Number(3.0)),
            ("price", CellValue::Number(12.5)),
        ]);
        let result = compute_row(&raw, &invoice_columns(), 4, &ComputeMode::Render);

        assert_eq!(result.values["amt"], CellValue::Number(37.5));
        assert_eq!(result.values["sno"], CellValue::Number(4.0));
        assert_eq!(result.values["desc"], CellValue::Text("Bolts".into()));
        assert!(result.converged);
        assert_eq!(result.passes, 2);
    }

    #[test]
    fn test_numeric_coercion() {
        let raw = row(&[("qty", CellValue::Text("two".into())), ("price", CellValue::Text("4.5 USD".into()))]);
        let result = compute_row(&raw, &invoice_columns(), 1, &ComputeMode::Render);

        assert_eq!(result.values["qty"], CellValue::Number(0.0));
        assert_eq!(result.values["price"], CellValue::Number(4.5));
        assert_eq!(result.values["amt"], CellValue::Number(0.0));
        assert_eq!(result.values["desc"], CellValue::Empty);
    }

    #[test]
    fn test_chained_formulas_declared_out_of_order() {
        let columns = vec![
            Column::formula("total", "Total", "[Net] + [Tax]"),
            Column::formula("tax", "Tax", "[Net] * 0.1"),
            Column::formula("net", "Net", "[Quantity] * [Price]"),
            Column::new("qty", "Quantity", ColumnType::Number),
            Column::new("price", "Price", ColumnType::Number),
        ];
        let raw = row(&[("qty", CellValue::Number(2.0)), ("price", CellValue::Number(50.0))]);
        let result = compute_row(&raw, &columns, 1, &ComputeMode::Render);

        assert_eq!(result.values["net"], CellValue::Number(100.0));
        assert_eq!(result.values["tax"], CellValue::Number(10.0));
        assert_eq!(result.values["total"], CellValue::Number(110.0));
        assert!(result.converged);
    }

    #[test]
    fn test_self_reference_is_cut_off() {
        let columns = vec![Column::formula("acc", "Acc", "[Acc] + 1")];
        let result = compute_row(&RowValues::new(), &columns, 1, &ComputeMode::Render);

        assert!(!result.converged);
        assert_eq!(result.passes, RENDER_PASSES);
        assert_eq!(result.values["acc"], CellValue::Number(RENDER_PASSES as f64));
    }

    #[test]
    fn test_mutual_cycle_terminates() {
        let columns = vec![
            Column::formula("a", "A", "[B] + 1"),
            Column::formula("b", "B", "[A] + 1"),
        ];
        let first = compute_row(&RowValues::new(), &columns, 1, &ComputeMode::Render);
        let second = compute_row(&RowValues::new(), &columns, 1, &ComputeMode::Render);

        assert!(!first.converged);
        assert_eq!(first, second);
    }

    #[test]
    fn test_interactive_keeps_edited_column() {
        let raw = row(&[
            ("qty", CellValue::Number(3.0)),
            ("price", CellValue::Number(10.0)),
            ("amt", CellValue::Number(99.0)),
        ]);
        let mode = ComputeMode::Interactive { editing: Some("amt".into()) };
        let result = compute_row(&raw, &invoice_columns(), 1, &mode);

        assert_eq!(result.values["amt"], CellValue::Number(99.0));
        assert!(result.converged);
        assert_eq!(result.passes, 0);
    }

    #[test]
    fn test_chain_settling_on_last_pass_converges() {
        let mut columns: Vec<Column> = (1..=RENDER_PASSES)
            .map(|i| {
                let source = if i == 1 { "Base".to_string() } else { format!("S{}", i - 1) };
                Column::formula(&format!("s{}", i), &format!("S{}", i), &format!("[{}] + 1", source))
            })
            .collect();
        columns.reverse();
        columns.push(Column::new("base", "Base", ColumnType::Number));

        let result = compute_row(&RowValues::new(), &columns, 1, &ComputeMode::Render);
        assert_eq!(result.values["s5"], CellValue::Number(5.0));
        assert_eq!(result.passes, RENDER_PASSES);
        assert!(result.converged);

        // One link deeper than the pass limit is still stale.
        columns.insert(0, Column::formula("s6", "S6", "[S5] + 1"));
        let result = compute_row(&RowValues::new(), &columns, 1, &ComputeMode::Render);
        assert!(!result.converged);
    }

    #[test]
    fn test_interactive_pass_limit() {
        let columns = vec![Column::formula("acc", "Acc", "[Acc] + 1")];
        let mode = ComputeMode::Interactive { editing: None };
        let result = compute_row(&RowValues::new(), &columns, 1, &mode);
        assert_eq!(result.passes, INTERACTIVE_PASSES);
    }

    #[test]
    fn test_failed_formula_does_not_block_siblings() {
        let columns = vec![
            Column::new("qty", "Quantity", ColumnType::Number),
            Column::new("rate", "Rate", ColumnType::Number),
            Column::formula("ratio", "Ratio", "[Quantity] / [Rate]"),
            Column::formula("double", "Double", "[Quantity] * 2"),
        ];
        let raw = row(&[("qty", CellValue::Number(4.0)), ("rate", CellValue::Number(0.0))]);
        let result = compute_row(&raw, &columns, 1, &ComputeMode::Render);

        assert_eq!(result.values["ratio"], CellValue::Empty);
        assert_eq!(result.values["double"], CellValue::Number(8.0));
    }

    #[test]
    fn test_extra_row_keys_survive() {
        let raw = row(&[("legacy", CellValue::Text("kept".into()))]);
        let result = compute_row(&raw, &invoice_columns(), 1, &ComputeMode::Render);
        assert_eq!(result.values["legacy"], CellValue::Text("kept".into()));
    }

    #[test]
    fn test_compute_rows_positions() {
        let rows = vec![RowValues::new(), RowValues::new(), RowValues::new()];
        let serials: Vec<_> = compute_rows(&rows, &invoice_columns(), &ComputeMode::Render)
            .into_iter()
            .map(|r| r.values["sno"].clone())
            .collect();
        assert_eq!(serials, vec![CellValue::Number(1.0), CellValue::Number(2.0), CellValue::Number(3.0)]);
    }
}
