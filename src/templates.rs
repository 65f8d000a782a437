//! Template Schema - Columns, Summary Lines, Styling
//!
//! A template is a value. Edits produce a new template; nothing here mutates
//! a schema that someone else may be holding.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::aggregate::{AggregateFn, Aggregation};
use crate::expression::{parse_lenient, rename_label};
use crate::normalize::normalize_str;

pub type TemplateId = String;

/// Raw line item: column key to the value the user typed.
pub type RowValues = BTreeMap<String, CellValue>;

/// Line item after formula resolution. Same shape as [`RowValues`].
pub type ComputedRow = BTreeMap<String, CellValue>;

pub const DEFAULT_ACCENT: &str = "#2563eb";
pub const FALLBACK_COLOR: &str = "#000000";

/// A single cell. `Empty` is the "no value" signal a failed formula yields.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Permissive numeric view: text is read by its numeric prefix, anything else is 0.
    pub fn as_number(&self) -> f64 {
        match self {
            CellValue::Empty => 0.0,
            CellValue::Number(n) if n.is_finite() => *n,
            CellValue::Number(_) => 0.0,
            CellValue::Text(s) => parse_lenient(s).unwrap_or(0.0),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(s.to_string())
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellValue::Empty => serializer.serialize_str(""),
            CellValue::Number(n) => serializer.serialize_f64(*n),
            CellValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for CellValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Number(f64),
            Text(String),
            Flag(bool),
            Null(()),
        }

        Ok(match Wire::deserialize(deserializer)? {
            Wire::Number(n) => CellValue::Number(n),
            Wire::Text(s) => CellValue::from(s.as_str()),
            Wire::Flag(b) => CellValue::Text(b.to_string()),
            Wire::Null(()) => CellValue::Empty,
        })
    }
}

/// Color slot that distinguishes "deliberately unfilled" from a real color.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fill {
    #[default]
    Unfilled,
    Filled(String),
}

impl Fill {
    /// Build from a wire value; `None` and blank strings are unfilled.
    pub fn from_wire(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(color) if !color.is_empty() => Fill::Filled(color.to_string()),
            _ => Fill::Unfilled,
        }
    }

    /// Color to paint with.
    pub fn resolve(&self) -> &str {
        match self {
            Fill::Filled(color) => color,
            Fill::Unfilled => FALLBACK_COLOR,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[default]
    Text,
    Number,
    Formula,
    Date,
}

impl ColumnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Number | ColumnType::Formula)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    #[default]
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub width: Option<String>,
    #[serde(default)]
    pub align: Align,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_true")]
    pub visible: bool,
}

fn default_true() -> bool { true }

impl Column {
    pub fn new(key: &str, label: &str, column_type: ColumnType) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            column_type,
            formula: None,
            width: None,
            align: if column_type.is_numeric() { Align::Right } else { Align::Left },
            group: None,
            visible: true,
        }
    }

    pub fn formula(key: &str, label: &str, formula: &str) -> Self {
        Self {
            formula: Some(formula.to_string()),
            ..Self::new(key, label, ColumnType::Formula)
        }
    }

    pub fn with_width(mut self, width: &str) -> Self {
        self.width = Some(width.to_string());
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    /// The running line number column.
    pub fn is_serial(&self) -> bool {
        self.key == "sno" || self.label.eq_ignore_ascii_case("s.no")
    }

    /// Formula text, only for formula-typed columns.
    pub fn formula_text(&self) -> Option<&str> {
        match self.column_type {
            ColumnType::Formula => self.formula.as_deref(),
            _ => None,
        }
    }

    /// Group label, ignoring blank group names.
    pub fn group_label(&self) -> Option<&str> {
        self.group.as_deref().map(str::trim).filter(|g| !g.is_empty())
    }
}

/// One entry of a header, meta, billing, shipping or footer block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub bold: bool,
}

impl Field {
    pub fn new(key: &str, label: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            value: String::new(),
            visible: true,
            bold: false,
        }
    }
}

/// A line of the totals panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SummaryField {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub source_column: Option<String>,
    #[serde(default)]
    pub function: Option<AggregateFn>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
}

/// Where a summary line gets its value from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SummarySource<'a> {
    Chain(&'a [Aggregation]),
    Single { column: &'a str, function: AggregateFn },
    Manual,
}

impl SummaryField {
    pub fn manual(key: &str, label: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            bold: false,
            source_column: None,
            function: None,
            aggregations: vec![],
        }
    }

    pub fn single(key: &str, label: &str, column: &str, function: AggregateFn) -> Self {
        Self {
            source_column: Some(column.to_string()),
            function: Some(function),
            ..Self::manual(key, label)
        }
    }

    pub fn chain(key: &str, label: &str, aggregations: Vec<Aggregation>) -> Self {
        Self {
            aggregations,
            ..Self::manual(key, label)
        }
    }

    pub fn source(&self) -> SummarySource<'_> {
        if !self.aggregations.is_empty() {
            return SummarySource::Chain(&self.aggregations);
        }
        match self.source_column.as_deref().filter(|c| !c.is_empty()) {
            Some(column) => SummarySource::Single {
                column,
                function: self.function.unwrap_or_default(),
            },
            None => SummarySource::Manual,
        }
    }

    /// Every column key this line reads.
    pub fn source_columns(&self) -> Vec<&str> {
        match self.source() {
            SummarySource::Chain(chain) => chain.iter().map(|a| a.source_column.as_str()).collect(),
            SummarySource::Single { column, .. } => vec![column],
            SummarySource::Manual => vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeaderSection {
    pub title: String,
    pub fields: Vec<Field>,
    pub background: Fill,
    /// 0..=1
    pub opacity: f64,
}

impl Default for HeaderSection {
    fn default() -> Self {
        Self {
            title: String::new(),
            fields: vec![],
            background: Fill::Unfilled,
            opacity: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetaSection {
    pub fields: Vec<Field>,
    pub column_count: u8,
}

impl Default for MetaSection {
    fn default() -> Self {
        Self { fields: vec![], column_count: 2 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldGroup {
    pub title: String,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemTable {
    pub columns: Vec<Column>,
    pub header_fill: Fill,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StyleConfig {
    pub accent: Fill,
    pub font_family: String,
    /// Body text size in points.
    pub font_size: f64,
    /// 0..=1
    pub header_opacity: f64,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            accent: Fill::Filled(DEFAULT_ACCENT.to_string()),
            font_family: "Inter".to_string(),
            font_size: 10.0,
            header_opacity: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    #[serde(default)]
    pub failure_mode: FailureMode,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    #[default]
    Block,
    Warn,
    Log,
}

/// The aggregate root handed to every stage of the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub template_version: String,
    pub engine_min_version: String,
    pub header: HeaderSection,
    pub meta: MetaSection,
    pub billing: FieldGroup,
    pub shipping: FieldGroup,
    pub table: ItemTable,
    pub summary: Vec<SummaryField>,
    pub footer: FieldGroup,
    pub style: StyleConfig,
    pub validation: ValidationConfig,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            template_version: "1.0.0".to_string(),
            engine_min_version: crate::MIN_ENGINE_VERSION.to_string(),
            header: HeaderSection::default(),
            meta: MetaSection::default(),
            billing: FieldGroup::default(),
            shipping: FieldGroup::default(),
            table: ItemTable::default(),
            summary: vec![],
            footer: FieldGroup::default(),
            style: StyleConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl Template {
    /// The built-in invoice used when no template is supplied.
    pub fn default_invoice() -> Self {
        let columns = vec![
            Column::new("sno", "S.No", ColumnType::Number).with_width("6%"),
            Column::new("desc", "Description", ColumnType::Text).with_width("40%"),
            Column::new("qty", "Quantity", ColumnType::Number).with_width("12%"),
            Column::new("price", "Price", ColumnType::Number).with_width("14%"),
            Column::new("tax", "Tax %", ColumnType::Number).with_width("10%"),
            Column::formula("amt", "Amount", "[Quantity] * [Price]").with_width("18%"),
        ];

        let summary = vec![
            SummaryField::single("subtotal", "Subtotal", "amt", AggregateFn::Sum),
            SummaryField::manual("discount", "Discount"),
            SummaryField {
                bold: true,
                ..SummaryField::single("total", "Total", "amt", AggregateFn::Sum)
            },
        ];

        Self {
            id: "default-invoice".to_string(),
            name: "Invoice".to_string(),
            header: HeaderSection {
                title: "INVOICE".to_string(),
                fields: vec![Field::new("company", "Company"), Field::new("address", "Address")],
                ..HeaderSection::default()
            },
            meta: MetaSection {
                fields: vec![
                    Field::new("invoice_no", "Invoice No"),
                    Field::new("date", "Date"),
                    Field::new("due_date", "Due Date"),
                ],
                column_count: 2,
            },
            billing: FieldGroup {
                title: "Bill To".to_string(),
                fields: vec![Field::new("bill_name", "Name"), Field::new("bill_address", "Address")],
            },
            shipping: FieldGroup {
                title: "Ship To".to_string(),
                fields: vec![Field::new("ship_name", "Name"), Field::new("ship_address", "Address")],
            },
            table: ItemTable { columns, header_fill: Fill::Filled(DEFAULT_ACCENT.to_string()) },
            summary,
            footer: FieldGroup {
                title: String::new(),
                fields: vec![Field::new("notes", "Notes")],
            },
            ..Self::default()
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.table.columns
    }

    pub fn column(&self, key: &str) -> Option<&Column> {
        self.table.columns.iter().find(|c| c.key == key)
    }

    /// Label to key map over every column, hidden ones included. First label wins.
    pub fn label_to_key(&self) -> HashMap<String, String> {
        label_index(&self.table.columns)
    }

    /// Apply one edit, returning the edited copy.
    pub fn apply(&self, edit: TemplateEdit) -> Result<Template, EditError> {
        let mut next = self.clone();
        let columns = &mut next.table.columns;

        match edit {
            TemplateEdit::AddColumn(column) => {
                if columns.iter().any(|c| c.key == column.key) {
                    return Err(EditError::DuplicateKey(column.key));
                }
                columns.push(column);
            }
            TemplateEdit::UpdateColumn(column) => {
                let slot = columns.iter_mut()
                    .find(|c| c.key == column.key)
                    .ok_or_else(|| EditError::UnknownColumn(column.key.clone()))?;
                *slot = column;
            }
            TemplateEdit::RemoveColumn(key) => {
                let index = position(columns, &key)?;
                columns.remove(index);
            }
            TemplateEdit::MoveColumn { key, to } => {
                let index = position(columns, &key)?;
                if to >= columns.len() {
                    return Err(EditError::IndexOutOfRange(to, columns.len()));
                }
                let column = columns.remove(index);
                columns.insert(to, column);
            }
            TemplateEdit::RenameColumn { key, label } => {
                let index = position(columns, &key)?;
                let old_label = std::mem::replace(&mut columns[index].label, label);
                let new_label = columns[index].label.trim().to_string();
                for column in columns.iter_mut() {
                    if let Some(formula) = column.formula.as_mut() {
                        *formula = rename_label(formula, &old_label, &new_label);
                    }
                }
            }
            TemplateEdit::AddSummaryField(field) => {
                if next.summary.iter().any(|f| f.key == field.key) {
                    return Err(EditError::DuplicateKey(field.key));
                }
                next.summary.push(field);
            }
            TemplateEdit::RemoveSummaryField(key) => {
                let before = next.summary.len();
                next.summary.retain(|f| f.key != key);
                if next.summary.len() == before {
                    return Err(EditError::UnknownSummaryField(key));
                }
            }
            TemplateEdit::SetAccentColor(fill) => {
                next.style.accent = fill;
            }
        }

        Ok(next)
    }
}

pub(crate) fn label_index(columns: &[Column]) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(columns.len());
    for column in columns {
        map.entry(column.label.trim().to_string())
            .or_insert_with(|| column.key.clone());
    }
    map
}

fn position(columns: &[Column], key: &str) -> Result<usize, EditError> {
    columns.iter()
        .position(|c| c.key == key)
        .ok_or_else(|| EditError::UnknownColumn(key.to_string()))
}

/// An edit made by the template builder.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateEdit {
    AddColumn(Column),
    /// Replace the column with the same key.
    UpdateColumn(Column),
    RemoveColumn(String),
    MoveColumn { key: String, to: usize },
    /// Relabel a column and rewrite formulas that reference the old label.
    RenameColumn { key: String, label: String },
    AddSummaryField(SummaryField),
    RemoveSummaryField(String),
    SetAccentColor(Fill),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Unknown summary field: {0}")]
    UnknownSummaryField(String),

    #[error("Index {0} out of range for {1} columns")]
    IndexOutOfRange(usize, usize),
}

/// Template registry - loads wire templates from disk and keeps them normalized
pub struct TemplateRegistry {
    templates: HashMap<TemplateId, Template>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self { templates: HashMap::new() }
    }

    /// Load every `*.json` in `dir`. Files that cannot be read or parsed are skipped.
    /// A template without an id takes the file stem.
    pub fn load_from_dir(dir: &Path) -> Result<Self, std::io::Error> {
        let mut registry = Self::new();
        if !dir.exists() {
            return Ok(registry);
        }

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    log::warn!("skipping template {}: {}", path.display(), e);
                    continue;
                }
            };
            match normalize_str(&content) {
                Ok(mut template) => {
                    if template.id.is_empty() {
                        template.id = path.file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default();
                    }
                    registry.register(template);
                }
                Err(e) => log::warn!("skipping template {}: {}", path.display(), e),
            }
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<&Template> {
        self.templates.get(id)
    }

    /// Templates sorted by id.
    pub fn list(&self) -> Vec<&Template> {
        let mut templates: Vec<_> = self.templates.values().collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }

    pub fn register(&mut self, template: Template) {
        self.templates.insert(template.id.clone(), template);
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Template::default_invoice());
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_cell_value_wire_forms() {
        let row: RowValues = serde_json::from_value(json!({
            "qty": 3, "desc": "Widget", "note": "", "gone": null
        })).unwrap();
        assert_eq!(row["qty"], CellValue::Number(3.0));
        assert_eq!(row["desc"], CellValue::Text("Widget".into()));
        assert_eq!(row["note"], CellValue::Empty);
        assert_eq!(row["gone"], CellValue::Empty);
        assert_eq!(serde_json::to_value(CellValue::Empty).unwrap(), json!(""));
    }

    #[test]
    fn test_cell_value_as_number() {
        assert_eq!(CellValue::Text("12abc".into()).as_number(), 12.0);
        assert_eq!(CellValue::Text("abc".into()).as_number(), 0.0);
        assert_eq!(CellValue::Number(f64::NAN).as_number(), 0.0);
        assert_eq!(CellValue::Empty.as_number(), 0.0);
    }

    #[test]
    fn test_fill_tri_state() {
        assert_eq!(Fill::from_wire(None), Fill::Unfilled);
        assert_eq!(Fill::from_wire(Some("  ")), Fill::Unfilled);
        assert_eq!(Fill::from_wire(Some("#fff")), Fill::Filled("#fff".into()));
        assert_eq!(Fill::Unfilled.resolve(), FALLBACK_COLOR);
    }

    #[test]
    fn test_summary_source_precedence() {
        let mut field = SummaryField::single("t", "Total", "amt", AggregateFn::Max);
        assert!(matches!(field.source(), SummarySource::Single { column: "amt", function: AggregateFn::Max }));

        field.aggregations = vec![Aggregation::new(AggregateFn::Sum, "qty", crate::aggregate::Operator::Add)];
        assert!(matches!(field.source(), SummarySource::Chain(_)));

        assert_eq!(SummaryField::manual("d", "Discount").source(), SummarySource::Manual);
    }

    #[test]
    fn test_apply_leaves_original_untouched() {
        let original = Template::default_invoice();
        let edited = original.apply(TemplateEdit::RemoveColumn("tax".into())).unwrap();

        assert!(original.column("tax").is_some());
        assert!(edited.column("tax").is_none());
        assert_eq!(original, Template::default_invoice());
    }

    #[test]
    fn test_rename_rewrites_formulas() {
        let edited = Template::default_invoice()
            .apply(TemplateEdit::RenameColumn { key: "qty".into(), label: "Units".into() })
            .unwrap();
        assert_eq!(edited.column("amt").unwrap().formula.as_deref(), Some("[Units] * [Price]"));
        assert_eq!(edited.label_to_key().get("Units").map(String::as_str), Some("qty"));
    }

    #[test]
    fn test_rename_rewrites_padded_tags() {
        let template = Template::default_invoice()
            .apply(TemplateEdit::UpdateColumn(Column::formula("amt", "Amount", "[ Quantity ] * [Price ]")))
            .unwrap()
            .apply(TemplateEdit::RenameColumn { key: "qty".into(), label: "Units".into() })
            .unwrap();
        assert_eq!(template.column("amt").unwrap().formula.as_deref(), Some("[Units] * [Price ]"));
    }

    #[test]
    fn test_edit_errors() {
        let template = Template::default_invoice();
        assert_eq!(
            template.apply(TemplateEdit::AddColumn(Column::new("qty", "Again", ColumnType::Number))),
            Err(EditError::DuplicateKey("qty".into()))
        );
        assert_eq!(
            template.apply(TemplateEdit::RemoveColumn("nope".into())),
            Err(EditError::UnknownColumn("nope".into()))
        );
        assert_eq!(
            template.apply(TemplateEdit::MoveColumn { key: "qty".into(), to: 99 }),
            Err(EditError::IndexOutOfRange(99, 6))
        );
        assert_eq!(
            template.apply(TemplateEdit::RemoveSummaryField("nope".into())),
            Err(EditError::UnknownSummaryField("nope".into()))
        );
    }

    #[test]
    fn test_move_column() {
        let edited = Template::default_invoice()
            .apply(TemplateEdit::MoveColumn { key: "amt".into(), to: 0 })
            .unwrap();
        assert_eq!(edited.columns()[0].key, "amt");
        assert_eq!(edited.columns()[1].key, "sno");
    }

    #[test]
    fn test_serial_column_detection() {
        assert!(Column::new("sno", "No.", ColumnType::Number).is_serial());
        assert!(Column::new("line", "S.NO", ColumnType::Number).is_serial());
        assert!(!Column::new("qty", "Quantity", ColumnType::Number).is_serial());
    }
}
