//! Render Pipeline - Single Entry Point
//!
//! Every presentation surface (builder preview, invoice editor, print view)
//! goes through here so row math, totals and geometry are computed one way.
//!
//! CRITICAL: render MUST call validate_template internally. No bypass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::aggregate::{resolve_summary, SummaryLine};
use crate::compute::{compute_rows, ComputeMode, RowComputation};
use crate::hashing::document_fingerprint;
use crate::layout::{compute_layout, Layout};
use crate::normalize::normalize;
use crate::print::PrintSpec;
use crate::templates::{ComputedRow, RowValues, StyleConfig, Template, TemplateRegistry};
use crate::validation::{ValidationResult, Validator, ViolationSeverity};
use crate::ENGINE_VERSION;

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static VALIDATION_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_validation_call_count() -> u32 {
    VALIDATION_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_validation_call_count() {
    VALIDATION_CALL_COUNT.store(0, Ordering::SeqCst);
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Template version {0} requires engine >= {1}, current is {2}")]
    EngineVersionMismatch(String, String, String),

    #[error("Invalid version string: {0}")]
    InvalidVersion(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    #[serde(default)]
    pub template_id: String,
    /// Wire-format template that takes the place of the registry entry.
    #[serde(default)]
    pub template: Option<Value>,
    #[serde(default)]
    pub rows: Vec<RowValues>,
    /// Values for summary lines that have no aggregation, by field key.
    #[serde(default)]
    pub manual_values: HashMap<String, f64>,
    #[serde(default)]
    pub mode: ComputeMode,
}

/// Everything a painter needs. Pure function of its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentBody {
    pub rows: Vec<ComputedRow>,
    /// Every row's formulas settled within the pass limit.
    pub converged: bool,
    pub summary: Vec<SummaryLine>,
    pub layout: Layout,
    pub style: StyleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedDocument {
    pub id: String,
    pub template_id: String,
    pub template_version: String,
    pub engine_version: String,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
    pub validation: ValidationResult,
    #[serde(flatten)]
    pub body: DocumentBody,
}

/// Compute rows, totals and geometry for one document.
pub fn render_body(
    template: &Template,
    rows: &[RowValues],
    manual_values: &HashMap<String, f64>,
    mode: &ComputeMode,
    spec: &PrintSpec,
) -> DocumentBody {
    let computations = compute_rows(rows, template.columns(), mode);
    let converged = computations.iter().all(|c| c.converged);
    let rows: Vec<ComputedRow> = computations.into_iter().map(|c| c.values).collect();

    DocumentBody {
        summary: resolve_summary(template, &rows, manual_values),
        layout: compute_layout(template.columns(), spec),
        style: template.style.clone(),
        converged,
        rows,
    }
}

/// The render pipeline - single entry point for all document operations
pub struct RenderPipeline {
    registry: TemplateRegistry,
    validator: Validator,
    print: PrintSpec,
}

impl RenderPipeline {
    pub fn new(registry: TemplateRegistry) -> Self {
        Self {
            registry,
            validator: Validator::new(),
            print: PrintSpec::default(),
        }
    }

    pub fn with_print_spec(mut self, print: PrintSpec) -> Self {
        self.print = print;
        self
    }

    /// List all available templates
    pub fn list_templates(&self) -> Vec<&Template> {
        self.registry.list()
    }

    /// Get a specific template
    pub fn get_template(&self, id: &str) -> Option<&Template> {
        self.registry.get(id)
    }

    /// Validate a registered template
    pub fn validate_template(&self, template_id: &str) -> Result<ValidationResult, PipelineError> {
        let template = self.lookup(template_id)?;
        self.validate(template)
    }

    /// This is the ONLY validation entry point.
    fn validate(&self, template: &Template) -> Result<ValidationResult, PipelineError> {
        #[cfg(feature = "test-hooks")]
        VALIDATION_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        self.check_engine_version(template)?;
        Ok(self.validator.validate(template))
    }

    /// Formula resolution only, for the line-item editor.
    pub fn compute(
        &self,
        template_id: &str,
        rows: &[RowValues],
        mode: &ComputeMode,
    ) -> Result<Vec<RowComputation>, PipelineError> {
        let template = self.lookup(template_id)?;
        Ok(compute_rows(rows, template.columns(), mode))
    }

    /// Page geometry only, for the template builder.
    pub fn layout(&self, template_id: &str) -> Result<Layout, PipelineError> {
        let template = self.lookup(template_id)?;
        Ok(compute_layout(template.columns(), &self.print))
    }

    /// Render a document
    ///
    /// CRITICAL: This ALWAYS validates the template first. A template that fails
    /// validation under the block policy is never rendered.
    pub fn render(&self, request: &RenderRequest) -> Result<RenderedDocument, PipelineError> {
        let inline;
        let template = match &request.template {
            Some(wire) => {
                let mut normalized = normalize(wire);
                if normalized.id.is_empty() {
                    normalized.id = request.template_id.clone();
                }
                inline = normalized;
                &inline
            }
            None => self.lookup(&request.template_id)?,
        };

        // MANDATORY: Validation is always called.
        let validation = self.validate(template)?;
        if !validation.valid {
            let messages: Vec<_> = validation.violations.iter()
                .filter(|v| v.severity == ViolationSeverity::Error)
                .map(|v| format!("{}: {}", v.rule, v.message))
                .collect();
            return Err(PipelineError::ValidationFailed(messages.join("; ")));
        }

        let body = render_body(
            template,
            &request.rows,
            &request.manual_values,
            &request.mode,
            &self.print,
        );
        if !body.converged {
            log::warn!("template {}: some rows did not settle", template.id);
        }

        Ok(RenderedDocument {
            id: Uuid::new_v4().to_string(),
            template_id: template.id.clone(),
            template_version: template.template_version.clone(),
            engine_version: ENGINE_VERSION.to_string(),
            created_at: Utc::now(),
            fingerprint: document_fingerprint(template, &request.rows, ENGINE_VERSION)?,
            validation,
            body,
        })
    }

    fn lookup(&self, template_id: &str) -> Result<&Template, PipelineError> {
        self.registry.get(template_id)
            .ok_or_else(|| PipelineError::TemplateNotFound(template_id.to_string()))
    }

    fn check_engine_version(&self, template: &Template) -> Result<(), PipelineError> {
        let engine_ver = semver::Version::parse(ENGINE_VERSION)
            .map_err(|_| PipelineError::InvalidVersion(ENGINE_VERSION.to_string()))?;
        let min_ver = semver::Version::parse(template.engine_min_version.trim())
            .map_err(|_| PipelineError::InvalidVersion(template.engine_min_version.clone()))?;

        if engine_ver < min_ver {
            return Err(PipelineError::EngineVersionMismatch(
                template.template_version.clone(),
                template.engine_min_version.clone(),
                ENGINE_VERSION.to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for RenderPipeline {
    fn default() -> Self {
        Self::new(TemplateRegistry::default())
    }
}
