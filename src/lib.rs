//! InvoiceForge Core - Template Computation and Layout Engine
//!
//! # The Five Rules (Non-Negotiable)
//! 1. Templates Are Values
//! 2. Formulas Never Throw
//! 3. Iteration Is Bounded
//! 4. Pages Grow, Columns Never Shrink
//! 5. Same Input, Same Document

pub mod expression;
pub mod compute;
pub mod aggregate;
pub mod normalize;
pub mod layout;
pub mod templates;
pub mod validation;
pub mod hashing;
pub mod print;
pub mod pipeline;

pub use templates::{CellValue, Column, ColumnType, Fill, RowValues, ComputedRow, SummaryField, Template, TemplateEdit, TemplateId};
pub use expression::evaluate;
pub use compute::{compute_row, compute_rows, ComputeMode, RowComputation};
pub use aggregate::{aggregate_chain, aggregate_column, resolve_summary_field, AggregateFn, Aggregation, Operator};
pub use normalize::{normalize, normalize_str};
pub use layout::{compute_layout, Layout};
pub use validation::{ValidationResult, ValidationRule, ValidationViolation, ViolationSeverity};
pub use hashing::{canonical_json, document_fingerprint, template_fingerprint};
pub use print::{PrintAuthority, PrintSpec};
pub use pipeline::{PipelineError, RenderPipeline, RenderRequest, RenderedDocument};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const MIN_ENGINE_VERSION: &str = "1.0.0";
