//! Validation System - Rule/Policy Separation
//!
//! Rules inspect a template and produce structured violations.
//! Policy (the template's failure mode) decides whether they invalidate it.
//!
//! Formula loops are the only errors; everything else the engine already
//! degrades per cell and is reported as a warning. Only the block policy stops a render. Under warn and log the engine still
//! degrades bad formulas to blank cells, and validation tells the builder why.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::compute::RENDER_PASSES;
use crate::expression::{parse_arithmetic, referenced_labels, sanitize, substitute, ExpressionError};
use crate::layout::parse_percent;
use crate::templates::{FailureMode, RowValues, Template};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    /// Column or summary field the violation is about.
    pub subject: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub remediation: Vec<String>,
}

impl ValidationViolation {
    fn new(rule: &str, severity: ViolationSeverity, subject: &str, message: String) -> Self {
        Self {
            rule: rule.to_string(),
            severity,
            message,
            subject: Some(subject.to_string()),
            expected: None,
            actual: None,
            remediation: vec![],
        }
    }

    fn expected(mut self, expected: String, actual: String) -> Self {
        self.expected = Some(expected);
        self.actual = Some(actual);
        self
    }

    fn remedy(mut self, remediation: &str) -> Self {
        self.remediation.push(remediation.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
    pub template_id: String,
    pub template_version: String,
}

impl ValidationResult {
    pub fn success(template: &Template, violations: Vec<ValidationViolation>) -> Self {
        Self {
            valid: true,
            violations,
            template_id: template.id.clone(),
            template_version: template.template_version.clone(),
        }
    }

    pub fn failure(template: &Template, violations: Vec<ValidationViolation>) -> Self {
        Self {
            valid: false,
            ..Self::success(template, violations)
        }
    }

    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }

    pub fn by_rule(&self, rule: &str) -> Vec<&ValidationViolation> {
        self.violations.iter().filter(|v| v.rule == rule).collect()
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule {
    fn name(&self) -> &'static str;
    fn validate(&self, template: &Template) -> Vec<ValidationViolation>;
}

// --- Concrete Rules ---

pub struct DuplicateKeyRule;

impl ValidationRule for DuplicateKeyRule {
    fn name(&self) -> &'static str { "duplicate_key" }

    fn validate(&self, template: &Template) -> Vec<ValidationViolation> {
        let mut seen = HashSet::new();
        template.columns().iter()
            .filter(|c| !seen.insert(c.key.as_str()))
            .map(|c| {
                ValidationViolation::new(
                    self.name(),
                    ViolationSeverity::Warning,
                    &c.key,
                    format!("Column key '{}' is used more than once", c.key),
                )
                .remedy("Give every column a unique key")
            })
            .collect()
    }
}

pub struct SelfReferenceRule;

impl ValidationRule for SelfReferenceRule {
    fn name(&self) -> &'static str { "self_reference" }

    fn validate(&self, template: &Template) -> Vec<ValidationViolation> {
        template.columns().iter()
            .filter_map(|c| c.formula_text().map(|f| (c, f)))
            .filter(|(c, f)| referenced_labels(f).iter().any(|l| l == c.label.trim()))
            .map(|(c, _)| {
                ValidationViolation::new(
                    self.name(),
                    ViolationSeverity::Error,
                    &c.key,
                    format!("Formula for '{}' references itself", c.label),
                )
                .remedy("Remove the column's own label from its formula")
            })
            .collect()
    }
}

pub struct CircularFormulaRule;

impl ValidationRule for CircularFormulaRule {
    fn name(&self) -> &'static str { "circular_formula" }

    fn validate(&self, template: &Template) -> Vec<ValidationViolation> {
        FormulaGraph::build(template)
            .cycles()
            .into_iter()
            .map(|cycle| {
                let path = cycle.join(" -> ");
                ValidationViolation::new(
                    self.name(),
                    ViolationSeverity::Error,
                    &cycle[0],
                    format!("Formula columns depend on each other in a loop: {} -> {}", path, cycle[0]),
                )
                .remedy("Break the loop so at least one column does not depend on the others")
            })
            .collect()
    }
}

pub struct UnknownReferenceRule;

impl ValidationRule for UnknownReferenceRule {
    fn name(&self) -> &'static str { "unknown_reference" }

    fn validate(&self, template: &Template) -> Vec<ValidationViolation> {
        let labels = template.label_to_key();
        let mut violations = vec![];

        for column in template.columns() {
            let Some(formula) = column.formula_text() else { continue };
            for label in referenced_labels(formula) {
                if !labels.contains_key(&label) {
                    violations.push(
                        ValidationViolation::new(
                            self.name(),
                            ViolationSeverity::Warning,
                            &column.key,
                            format!("Formula for '{}' references unknown column [{}], read as 0", column.label, label),
                        )
                        .remedy("Check the spelling against the column labels"),
                    );
                }
            }
        }
        violations
    }
}

pub struct FormulaSyntaxRule;

impl ValidationRule for FormulaSyntaxRule {
    fn name(&self) -> &'static str { "formula_syntax" }

    fn validate(&self, template: &Template) -> Vec<ValidationViolation> {
        let labels = template.label_to_key();
        let zeros = RowValues::new();

        template.columns().iter()
            .filter_map(|c| c.formula_text().map(|f| (c, f)))
            .filter_map(|(column, formula)| {
                let expression = sanitize(&substitute(formula, &zeros, &labels));
                let message = match parse_arithmetic(&expression) {
                    Ok(_) => return None,
                    Err(ExpressionError::Empty) => {
                        format!("Formula for '{}' has no arithmetic and will always be blank", column.label)
                    }
                    Err(e) => format!("Formula for '{}' cannot be evaluated and will be blank: {}", column.label, e),
                };
                Some(
                    ValidationViolation::new(self.name(), ViolationSeverity::Warning, &column.key, message)
                        .remedy("Use only column tags, numbers, + - * / and parentheses"),
                )
            })
            .collect()
    }
}

pub struct FormulaDepthRule;

impl ValidationRule for FormulaDepthRule {
    fn name(&self) -> &'static str { "formula_depth" }

    fn validate(&self, template: &Template) -> Vec<ValidationViolation> {
        let graph = FormulaGraph::build(template);
        graph.nodes.iter()
            .filter_map(|key| {
                let depth = graph.depth(key);
                (depth > RENDER_PASSES).then(|| {
                    ValidationViolation::new(
                        self.name(),
                        ViolationSeverity::Warning,
                        key,
                        format!("Formula chain ending at '{}' is {} columns deep; values may be stale", key, depth),
                    )
                    .expected(format!("<= {}", RENDER_PASSES), depth.to_string())
                    .remedy("Flatten the chain by referencing source columns directly")
                })
            })
            .collect()
    }
}

pub struct ColumnWidthRule;

impl ValidationRule for ColumnWidthRule {
    fn name(&self) -> &'static str { "column_width" }

    fn validate(&self, template: &Template) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        let mut total = 0.0;

        for column in template.columns().iter().filter(|c| c.visible) {
            match column.width.as_deref() {
                None => {}
                Some(width) => match parse_percent(width) {
                    Some(percent) => total += percent,
                    None => violations.push(
                        ValidationViolation::new(
                            self.name(),
                            ViolationSeverity::Warning,
                            &column.key,
                            format!("Width '{}' of '{}' is not a percentage, treated as 0%", width, column.label),
                        )
                        .remedy("Use a value like \"15%\""),
                    ),
                },
            }
        }

        if total > 100.0 {
            violations.push(ValidationViolation {
                subject: None,
                ..ValidationViolation::new(
                    self.name(),
                    ViolationSeverity::Warning,
                    "",
                    "Visible columns exceed the page width; the page will be widened".to_string(),
                )
                .expected("<= 100%".to_string(), format!("{}%", total))
                .remedy("Reduce column widths or hide columns")
            });
        }

        violations
    }
}

pub struct SummarySourceRule;

impl ValidationRule for SummarySourceRule {
    fn name(&self) -> &'static str { "summary_source" }

    fn validate(&self, template: &Template) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        for field in &template.summary {
            for source in field.source_columns() {
                if template.column(source).is_none() {
                    violations.push(
                        ValidationViolation::new(
                            self.name(),
                            ViolationSeverity::Warning,
                            &field.key,
                            format!("Summary line '{}' aggregates unknown column '{}', read as 0", field.label, source),
                        )
                        .remedy("Point the aggregation at an existing column key"),
                    );
                }
            }
        }
        violations
    }
}

/// Formula columns and the formula columns they read. Keys throughout.
struct FormulaGraph {
    nodes: Vec<String>,
    edges: HashMap<String, Vec<String>>,
}

impl FormulaGraph {
    fn build(template: &Template) -> Self {
        let labels = template.label_to_key();
        let formula_keys: HashSet<&str> = template.columns().iter()
            .filter(|c| c.formula_text().is_some())
            .map(|c| c.key.as_str())
            .collect();

        let mut nodes = vec![];
        let mut edges = HashMap::new();
        for column in template.columns() {
            let Some(formula) = column.formula_text() else { continue };
            let targets: Vec<String> = referenced_labels(formula).iter()
                .filter_map(|label| labels.get(label))
                .filter(|key| formula_keys.contains(key.as_str()) && **key != column.key)
                .cloned()
                .collect();
            nodes.push(column.key.clone());
            edges.insert(column.key.clone(), targets);
        }

        Self { nodes, edges }
    }

    fn targets(&self, key: &str) -> &[String] {
        self.edges.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Each distinct cycle once, as the list of keys along it.
    fn cycles(&self) -> Vec<Vec<String>> {
        let mut done: HashSet<&str> = HashSet::new();
        let mut raw: Vec<Vec<&str>> = vec![];
        for start in &self.nodes {
            self.walk(start, &mut vec![], &mut done, &mut raw);
        }

        let mut seen_sets: HashSet<Vec<&str>> = HashSet::new();
        raw.into_iter()
            .filter(|cycle| {
                let mut members = cycle.clone();
                members.sort_unstable();
                seen_sets.insert(members)
            })
            .map(|cycle| cycle.into_iter().map(str::to_string).collect())
            .collect()
    }

    fn walk<'g>(
        &'g self,
        key: &'g str,
        path: &mut Vec<&'g str>,
        done: &mut HashSet<&'g str>,
        cycles: &mut Vec<Vec<&'g str>>,
    ) {
        if let Some(at) = path.iter().position(|k| *k == key) {
            cycles.push(path[at..].to_vec());
            return;
        }
        if done.contains(key) {
            return;
        }

        path.push(key);
        for target in self.targets(key) {
            self.walk(target, path, done, cycles);
        }
        path.pop();
        done.insert(key);
    }

    /// Formula columns on the longest dependency chain ending at `key`. Cycles are cut.
    fn depth(&self, key: &str) -> usize {
        fn go<'g>(graph: &'g FormulaGraph, key: &'g str, stack: &mut Vec<&'g str>) -> usize {
            if stack.contains(&key) {
                return 0;
            }
            stack.push(key);
            let deepest = graph.targets(key).iter()
                .map(|t| go(graph, t, stack))
                .max()
                .unwrap_or(0);
            stack.pop();
            deepest + 1
        }
        go(self, key, &mut vec![])
    }
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(DuplicateKeyRule),
                Box::new(SelfReferenceRule),
                Box::new(CircularFormulaRule),
                Box::new(UnknownReferenceRule),
                Box::new(FormulaSyntaxRule),
                Box::new(FormulaDepthRule),
                Box::new(ColumnWidthRule),
                Box::new(SummarySourceRule),
            ],
        }
    }

    pub fn validate(&self, template: &Template) -> ValidationResult {
        let mut all_violations = vec![];

        for rule in &self.rules {
            let violations = rule.validate(template);
            all_violations.extend(violations);
        }

        // Apply failure mode policy
        let has_errors = all_violations.iter()
            .any(|v| v.severity == ViolationSeverity::Error);

        match template.validation.failure_mode {
            FailureMode::Block if has_errors => {
                ValidationResult::failure(template, all_violations)
            }
            FailureMode::Block | FailureMode::Warn => {
                ValidationResult::success(template, all_violations)
            }
            FailureMode::Log => {
                // Never block, just record
                for v in &all_violations {
                    log::info!("template {}: [{}] {}", template.id, v.rule, v.message);
                }
                ValidationResult::success(template, all_violations)
            }
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
