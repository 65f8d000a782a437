//! Template Normalizer - Wire JSON to Internal Schema
//!
//! Two generations of the wire format are in circulation: a flat snake_case one
//! and a nested camelCase one. Every lookup tries both. Missing sections never
//! fail; they come back as empty sections with default styling.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::aggregate::{AggregateFn, Aggregation, Operator};
use crate::expression::parse_lenient;
use crate::MIN_ENGINE_VERSION;
use crate::templates::{
    Align, Column, ColumnType, FailureMode, Field, FieldGroup, Fill, HeaderSection, ItemTable,
    MetaSection, StyleConfig, SummaryField, Template, ValidationConfig,
};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Invalid template JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn normalize_str(json: &str) -> Result<Template, NormalizeError> {
    let value: Value = serde_json::from_str(json)?;
    Ok(normalize(&value))
}

/// Build a complete schema from whatever the wire carried.
pub fn normalize(external: &Value) -> Template {
    let root = Wire::of(external);
    let defaults = Template::default();

    Template {
        id: root.string("id"),
        name: root.string("name"),
        template_version: root.str("template_version")
            .or_else(|| root.str("version"))
            .map_or(defaults.template_version, str::to_string),
        engine_min_version: root.str("engine_min_version")
            .map_or(defaults.engine_min_version, engine_version),
        header: header(root.section("header")),
        meta: meta(root.section("meta")),
        billing: field_group(root.get("billing")),
        shipping: field_group(root.get("shipping")),
        table: item_table(root),
        summary: summary(root),
        footer: field_group(root.get("footer")),
        style: style(root),
        validation: ValidationConfig {
            failure_mode: root.section("validation").str("failure_mode")
                .map_or(FailureMode::default(), failure_mode),
        },
    }
}

/// Read-only view over an optional JSON object with dual-convention lookups.
#[derive(Clone, Copy)]
struct Wire<'a>(Option<&'a Map<String, Value>>);

impl<'a> Wire<'a> {
    fn of(value: &'a Value) -> Self {
        Wire(value.as_object())
    }

    /// Look up `snake_name`, then its camelCase spelling.
    fn get(&self, snake_name: &str) -> Option<&'a Value> {
        let map = self.0?;
        map.get(snake_name).or_else(|| map.get(&camel_case(snake_name)))
    }

    fn section(&self, name: &str) -> Wire<'a> {
        Wire(self.get(name).and_then(Value::as_object))
    }

    fn str(&self, name: &str) -> Option<&'a str> {
        self.get(name).and_then(Value::as_str)
    }

    fn string(&self, name: &str) -> String {
        match self.get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    }

    fn number(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_lenient(s),
            _ => None,
        }
    }

    fn flag(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    fn array(&self, name: &str) -> &'a [Value] {
        self.get(name)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn fill(&self, name: &str, missing: Fill) -> Fill {
        match self.get(name) {
            None => missing,
            Some(Value::String(s)) => Fill::from_wire(Some(s.as_str())),
            Some(_) => Fill::Unfilled,
        }
    }
}

fn camel_case(snake: &str) -> String {
    let mut out = String::with_capacity(snake.len());
    let mut upper = false;
    for c in snake.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Opacity may arrive as a fraction or as a percentage.
fn opacity(value: Option<f64>) -> f64 {
    match value {
        None => 1.0,
        Some(v) if v > 1.0 => (v / 100.0).clamp(0.0, 1.0),
        Some(v) => v.clamp(0.0, 1.0),
    }
}

/// Pad `"1"` and `"1.2"` to full semver. Anything else unparseable means the
/// oldest engine.
fn engine_version(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches(|c: char| c == 'v' || c == 'V');
    let parts = trimmed.split('.').count();
    let padded = match parts {
        1 => format!("{}.0.0", trimmed),
        2 => format!("{}.0", trimmed),
        _ => trimmed.to_string(),
    };

    match semver::Version::parse(&padded) {
        Ok(version) => version.to_string(),
        Err(e) => {
            log::warn!("engine_min_version {:?} is not a version ({}), using {}", raw, e, MIN_ENGINE_VERSION);
            MIN_ENGINE_VERSION.to_string()
        }
    }
}

fn failure_mode(name: &str) -> FailureMode {
    match name.trim().to_ascii_lowercase().as_str() {
        "warn" => FailureMode::Warn,
        "log" => FailureMode::Log,
        _ => FailureMode::Block,
    }
}

fn fields(values: &[Value]) -> Vec<Field> {
    values.iter()
        .filter_map(|value| {
            let wire = Wire::of(value);
            wire.0?;
            let label = wire.string("label");
            let key = match wire.string("key") {
                k if !k.is_empty() => k,
                _ => wire.string("id"),
            };
            Some(Field {
                key: if key.is_empty() { slug(&label) } else { key },
                value: wire.string("value"),
                visible: wire.flag("visible") != Some(false),
                bold: wire.flag("bold").unwrap_or(false),
                label,
            })
        })
        .collect()
}

fn slug(label: &str) -> String {
    label.trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// A section given either as `{title, fields}` or as a bare array of fields.
fn field_group(value: Option<&Value>) -> FieldGroup {
    match value {
        Some(Value::Array(items)) => FieldGroup { title: String::new(), fields: fields(items) },
        Some(section @ Value::Object(_)) => {
            let wire = Wire::of(section);
            FieldGroup { title: wire.string("title"), fields: fields(wire.array("fields")) }
        }
        _ => FieldGroup::default(),
    }
}

fn header(wire: Wire<'_>) -> HeaderSection {
    HeaderSection {
        title: wire.string("title"),
        fields: fields(wire.array("fields")),
        background: wire.fill("background_color", Fill::Unfilled),
        opacity: opacity(wire.number("opacity")),
    }
}

fn meta(wire: Wire<'_>) -> MetaSection {
    let layout = wire.get("column_layout").or_else(|| wire.get("column_count"));
    let column_count = match layout {
        Some(Value::Number(n)) => n.as_f64().map(|n| n.round().clamp(1.0, 4.0) as u8),
        Some(Value::String(s)) => s.chars()
            .find_map(|c| c.to_digit(10))
            .map(|d| d.clamp(1, 4) as u8),
        _ => None,
    };

    MetaSection {
        fields: fields(wire.array("fields")),
        column_count: column_count.unwrap_or(MetaSection::default().column_count),
    }
}

fn item_table(root: Wire<'_>) -> ItemTable {
    let section = ["items", "table", "item_table"]
        .iter()
        .map(|name| root.section(name))
        .find(|wire| wire.0.is_some())
        .unwrap_or(Wire(None));

    let mut wire_columns = section.array("columns");
    if wire_columns.is_empty() {
        wire_columns = root.array("columns");
    }

    ItemTable {
        columns: wire_columns.iter()
            .enumerate()
            .filter_map(|(i, value)| column(value, i))
            .collect(),
        header_fill: section.fill("header_color", Fill::Unfilled),
    }
}

fn column(value: &Value, index: usize) -> Option<Column> {
    let wire = Wire::of(value);
    wire.0?;

    let label = wire.string("label");
    let key = match wire.string("key") {
        k if !k.is_empty() => k,
        _ => format!("col_{}", index + 1),
    };

    let column_type = match wire.str("type").map(|t| t.trim().to_ascii_lowercase()) {
        None => ColumnType::Text,
        Some(t) => match t.as_str() {
            "text" => ColumnType::Text,
            "number" => ColumnType::Number,
            "formula" => ColumnType::Formula,
            "date" => ColumnType::Date,
            other => {
                log::warn!("column {:?} has unknown type {:?}, treating as text", key, other);
                ColumnType::Text
            }
        },
    };

    let width = match wire.get("width") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(format!("{}%", n)),
        _ => None,
    };

    let align = match wire.str("align").map(str::trim) {
        Some("left") => Align::Left,
        Some("center") => Align::Center,
        Some("right") => Align::Right,
        _ if column_type.is_numeric() => Align::Right,
        _ => Align::Left,
    };

    Some(Column {
        formula: wire.str("formula").map(str::to_string).filter(|f| !f.trim().is_empty()),
        group: wire.str("group").map(str::to_string).filter(|g| !g.trim().is_empty()),
        visible: wire.flag("visible") != Some(false),
        key,
        label,
        column_type,
        width,
        align,
    })
}

fn summary(root: Wire<'_>) -> Vec<SummaryField> {
    let items = match root.get("summary") {
        Some(Value::Array(items)) => items.as_slice(),
        Some(Value::Object(_)) => root.section("summary").array("fields"),
        _ => root.array("summary_fields"),
    };
    items.iter().filter_map(summary_field).collect()
}

fn summary_field(value: &Value) -> Option<SummaryField> {
    let wire = Wire::of(value);
    wire.0?;

    let key = wire.string("key");
    let aggregations = wire.array("aggregations")
        .iter()
        .filter(|a| a.is_object())
        .map(|a| {
            let link = Wire::of(a);
            Aggregation {
                function: aggregate_fn(&key, link.str("function")),
                source_column: link.string("source_column"),
                operator: operator(&key, link.str("operator")),
            }
        })
        .collect();

    let source_column = Some(wire.string("source_column")).filter(|s| !s.is_empty());
    let function = wire.str("function").map(|f| aggregate_fn(&key, Some(f)));

    Some(SummaryField {
        label: wire.string("label"),
        bold: wire.flag("bold").unwrap_or(false),
        source_column,
        function,
        aggregations,
        key,
    })
}

fn aggregate_fn(field: &str, name: Option<&str>) -> AggregateFn {
    match name {
        None => AggregateFn::Sum,
        Some(name) => AggregateFn::from_name(name).unwrap_or_else(|| {
            log::warn!("summary field {:?}: unknown function {:?}, using sum", field, name);
            AggregateFn::Sum
        }),
    }
}

fn operator(field: &str, symbol: Option<&str>) -> Operator {
    match symbol {
        None => Operator::Add,
        Some(symbol) => Operator::from_symbol(symbol).unwrap_or_else(|| {
            log::warn!("summary field {:?}: unknown operator {:?}, using +", field, symbol);
            Operator::Add
        }),
    }
}

fn style(root: Wire<'_>) -> StyleConfig {
    let wire = root.section("style");
    let defaults = StyleConfig::default();

    // Older templates kept the accent color at the top level.
    let accent_source = if wire.get("accent_color").is_some() { wire } else { root };

    StyleConfig {
        accent: accent_source.fill("accent_color", defaults.accent),
        font_family: wire.str("font_family")
            .filter(|f| !f.trim().is_empty())
            .map_or(defaults.font_family, str::to_string),
        font_size: wire.number("font_size")
            .or_else(|| wire.number("body_size"))
            .filter(|s| *s > 0.0)
            .unwrap_or(defaults.font_size),
        header_opacity: opacity(wire.number("header_opacity")),
    }
}
