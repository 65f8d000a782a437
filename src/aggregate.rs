//! Aggregation Engine - Column Totals and Chained Summary Lines
//!
//! Every function is total: missing or non-numeric cells count as 0, an empty
//! row set aggregates to 0, and dividing by a zero aggregate leaves the running
//! result alone.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::templates::{ComputedRow, SummaryField, SummarySource, Template};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    #[default]
    Sum,
    /// Negated sum, for deduction lines.
    Sub,
    Mul,
    Avg,
    Max,
    Min,
}

impl AggregateFn {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sum" => Some(Self::Sum),
            "sub" => Some(Self::Sub),
            "mul" => Some(Self::Mul),
            "avg" => Some(Self::Avg),
            "max" => Some(Self::Max),
            "min" => Some(Self::Min),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Operator {
    #[default]
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Subtract,
    #[serde(rename = "*")]
    Multiply,
    #[serde(rename = "/")]
    Divide,
}

impl Operator {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol.trim() {
            "+" => Some(Self::Add),
            "-" => Some(Self::Subtract),
            "*" => Some(Self::Multiply),
            "/" => Some(Self::Divide),
            _ => None,
        }
    }

    /// Fold `value` into `running`. Division by zero is a no-op.
    pub fn combine(self, running: f64, value: f64) -> f64 {
        match self {
            Operator::Add => running + value,
            Operator::Subtract => running - value,
            Operator::Multiply => running * value,
            Operator::Divide if value == 0.0 => running,
            Operator::Divide => running / value,
        }
    }
}

/// One link of a chained summary line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Aggregation {
    #[serde(default)]
    pub function: AggregateFn,
    pub source_column: String,
    /// How this aggregate joins the running result. Ignored on the first link.
    #[serde(default)]
    pub operator: Operator,
}

impl Aggregation {
    pub fn new(function: AggregateFn, source_column: &str, operator: Operator) -> Self {
        Self {
            function,
            source_column: source_column.to_string(),
            operator,
        }
    }
}

/// Resolved summary line ready for the totals panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SummaryLine {
    pub key: String,
    pub label: String,
    pub bold: bool,
    pub value: f64,
}

/// Aggregate one column across all rows.
pub fn aggregate_column(column_key: &str, function: AggregateFn, rows: &[ComputedRow]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }

    let values: Vec<f64> = rows.iter()
        .map(|row| row.get(column_key).map_or(0.0, |v| v.as_number()))
        .collect();
    let sum: f64 = values.iter().sum();

    match function {
        AggregateFn::Sum => sum,
        AggregateFn::Sub => -sum,
        AggregateFn::Mul => values.iter().product(),
        AggregateFn::Avg => sum / values.len() as f64,
        AggregateFn::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregateFn::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
    }
}

/// Evaluate each link independently, then fold left to right with each link's operator.
pub fn aggregate_chain(aggregations: &[Aggregation], rows: &[ComputedRow]) -> f64 {
    let mut links = aggregations.iter()
        .map(|a| (a.operator, aggregate_column(&a.source_column, a.function, rows)));

    let Some((_, seed)) = links.next() else {
        return 0.0;
    };
    links.fold(seed, |running, (operator, value)| operator.combine(running, value))
}

/// Value of one summary line. Manual lines take `manual` or 0.
pub fn resolve_summary_field(field: &SummaryField, rows: &[ComputedRow], manual: Option<f64>) -> f64 {
    match field.source() {
        SummarySource::Chain(chain) => aggregate_chain(chain, rows),
        SummarySource::Single { column, function } => aggregate_column(column, function, rows),
        SummarySource::Manual => manual.filter(|v| v.is_finite()).unwrap_or(0.0),
    }
}

/// Resolve every summary line of a template. Manual values are keyed by field key.
pub fn resolve_summary(
    template: &Template,
    rows: &[ComputedRow],
    manual: &HashMap<String, f64>,
) -> Vec<SummaryLine> {
    template.summary.iter()
        .map(|field| SummaryLine {
            key: field.key.clone(),
            label: field.label.clone(),
            bold: field.bold,
            value: resolve_summary_field(field, rows, manual.get(&field.key).copied()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::CellValue;

    fn rows(column: &str, values: &[f64]) -> Vec<ComputedRow> {
        values.iter()
            .map(|v| {
                let mut row = ComputedRow::new();
                row.insert(column.to_string(), CellValue::Number(*v));
                row
            })
            .collect()
    }

    #[test]
    fn test_functions() {
        let data = rows("amt", &[10.0, 20.0, 30.0]);
        assert_eq!(aggregate_column("amt", AggregateFn::Sum, &data), 60.0);
        assert_eq!(aggregate_column("amt", AggregateFn::Sub, &data), -60.0);
        assert_eq!(aggregate_column("amt", AggregateFn::Mul, &data), 6000.0);
        assert_eq!(aggregate_column("amt", AggregateFn::Avg, &data), 20.0);
        assert_eq!(aggregate_column("amt", AggregateFn::Max, &data), 30.0);
        assert_eq!(aggregate_column("amt", AggregateFn::Min, &data), 10.0);
    }

    #[test]
    fn test_empty_rows_are_zero() {
        for function in [AggregateFn::Sum, AggregateFn::Mul, AggregateFn::Avg, AggregateFn::Max, AggregateFn::Min] {
            assert_eq!(aggregate_column("amt", function, &[]), 0.0);
        }
    }

    #[test]
    fn test_non_numeric_cells_count_as_zero() {
        let mut data = rows("amt", &[5.0]);
        let mut text = ComputedRow::new();
        text.insert("amt".into(), CellValue::Text("n/a".into()));
        data.push(text);
        data.push(ComputedRow::new());

        assert_eq!(aggregate_column("amt", AggregateFn::Sum, &data), 5.0);
        assert_eq!(aggregate_column("amt", AggregateFn::Min, &data), 0.0);
        assert_eq!(aggregate_column("amt", AggregateFn::Avg, &data), 5.0 / 3.0);
    }

    #[test]
    fn test_chain_subtotal_minus_discount_plus_tax() {
        let mut data = vec![];
        for (amt, disc, tax) in [(100.0, 10.0, 5.0), (50.0, 0.0, 2.5)] {
            let mut row = ComputedRow::new();
            row.insert("amt".into(), CellValue::Number(amt));
            row.insert("disc".into(), CellValue::Number(disc));
            row.insert("tax".into(), CellValue::Number(tax));
            data.push(row);
        }

        let chain = vec![
            Aggregation::new(AggregateFn::Sum, "amt", Operator::Add),
            Aggregation::new(AggregateFn::Sum, "disc", Operator::Subtract),
            Aggregation::new(AggregateFn::Sum, "tax", Operator::Add),
        ];
        assert_eq!(aggregate_chain(&chain, &data), 147.5);
    }

    #[test]
    fn test_chain_divide_by_zero_is_noop() {
        let data = rows("amt", &[8.0]);
        let chain = vec![
            Aggregation::new(AggregateFn::Sum, "amt", Operator::Add),
            Aggregation::new(AggregateFn::Sum, "missing", Operator::Divide),
        ];
        assert_eq!(aggregate_chain(&chain, &data), 8.0);
    }

    #[test]
    fn test_first_operator_ignored() {
        let data = rows("amt", &[8.0]);
        let chain = vec![Aggregation::new(AggregateFn::Sum, "amt", Operator::Subtract)];
        assert_eq!(aggregate_chain(&chain, &data), 8.0);
        assert_eq!(aggregate_chain(&[], &data), 0.0);
    }

    #[test]
    fn test_resolve_summary_field() {
        let data = rows("amt", &[10.0, 20.0, 30.0]);
        let single = SummaryField::single("total", "Total", "amt", AggregateFn::Sum);
        assert_eq!(resolve_summary_field(&single, &data, None), 60.0);

        let manual = SummaryField::manual("shipping", "Shipping");
        assert_eq!(resolve_summary_field(&manual, &data, Some(12.0)), 12.0);
        assert_eq!(resolve_summary_field(&manual, &data, None), 0.0);
    }

    #[test]
    fn test_operator_wire_symbols() {
        let op: Operator = serde_json::from_str("\"*\"").unwrap();
        assert_eq!(op, Operator::Multiply);
        assert_eq!(Operator::from_symbol(" / "), Some(Operator::Divide));
        assert_eq!(AggregateFn::from_name("AVG"), Some(AggregateFn::Avg));
        assert_eq!(AggregateFn::from_name("count"), None);
    }
}
