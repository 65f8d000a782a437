//! InvoiceForge CLI - JSON bridge for the web front end
//!
//! Commands: templates, validate, compute, layout, render
//! Outputs JSON to stdout
//! Returns 2 on validation failure

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

use invoiceforge_core::{
    templates::TemplateRegistry,
    ComputeMode, PrintSpec, RenderPipeline, RenderRequest, RowValues,
};

#[derive(Parser)]
#[command(name = "invoiceforge-cli")]
#[command(about = "InvoiceForge CLI - Invoice template engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to templates directory
    #[arg(short, long, default_value = "templates")]
    templates_dir: PathBuf,

    /// Page width in millimetres (user override)
    #[arg(long)]
    page_width: Option<f64>,

    /// Left/right margin in millimetres (user override)
    #[arg(long)]
    margin: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available templates
    Templates,

    /// Lint a template
    Validate {
        /// Template ID
        #[arg(short, long)]
        template: String,
    },

    /// Resolve formula columns for a list of rows
    Compute {
        /// Template ID
        #[arg(short, long)]
        template: String,

        /// JSON array of rows
        #[arg(short, long)]
        rows: String,

        /// Column key being edited; switches to interactive mode
        #[arg(long)]
        editing: Option<String>,
    },

    /// Column widths and page width for a template
    Layout {
        /// Template ID
        #[arg(short, long)]
        template: String,
    },

    /// Compute, total and lay out a full document
    Render {
        /// Template ID
        #[arg(short, long)]
        template: String,

        /// JSON payload (RenderRequest)
        #[arg(short, long)]
        payload: String,
    },
}

fn emit<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => println!(r#"{{"error": "Failed to serialize output: {}"}}"#, e),
    }
}

fn fail(message: String) -> ExitCode {
    emit(&serde_json::json!({"success": false, "error": message}));
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load templates
    let mut registry = match TemplateRegistry::load_from_dir(&cli.templates_dir) {
        Ok(r) => r,
        Err(e) => return fail(format!("Failed to load templates: {}", e)),
    };
    if registry.list().is_empty() {
        registry = TemplateRegistry::default();
    }

    let mut print = PrintSpec::default();
    if cli.page_width.is_some() || cli.margin.is_some() {
        print = match PrintSpec::from_user(
            cli.page_width.unwrap_or(print.page_width_mm),
            cli.margin.unwrap_or(print.margin_mm),
            print.dpi,
        ) {
            Ok(spec) => spec,
            Err(e) => return fail(e.to_string()),
        };
    }

    let pipeline = RenderPipeline::new(registry).with_print_spec(print);

    match cli.command {
        Commands::Templates => {
            let templates: Vec<_> = pipeline.list_templates()
                .iter()
                .map(|t| serde_json::json!({
                    "id": t.id,
                    "name": t.name,
                    "version": t.template_version,
                    "columns": t.columns().len(),
                    "summaryFields": t.summary.len(),
                }))
                .collect();

            emit(&templates);
            ExitCode::SUCCESS
        }

        Commands::Validate { template } => match pipeline.validate_template(&template) {
            Ok(result) => {
                emit(&result);
                if result.valid {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::from(2) // Validation failure
                }
            }
            Err(e) => fail(e.to_string()),
        },

        Commands::Compute { template, rows, editing } => {
            let rows: Vec<RowValues> = match serde_json::from_str(&rows) {
                Ok(r) => r,
                Err(e) => return fail(format!("Invalid rows: {}", e)),
            };
            let mode = match editing {
                Some(key) => ComputeMode::Interactive { editing: Some(key) },
                None => ComputeMode::Render,
            };

            match pipeline.compute(&template, &rows, &mode) {
                Ok(computed) => {
                    emit(&computed);
                    ExitCode::SUCCESS
                }
                Err(e) => fail(e.to_string()),
            }
        }

        Commands::Layout { template } => match pipeline.layout(&template) {
            Ok(layout) => {
                emit(&layout);
                ExitCode::SUCCESS
            }
            Err(e) => fail(e.to_string()),
        },

        Commands::Render { template, payload } => {
            let request: RenderRequest = match serde_json::from_str(&payload) {
                Ok(r) => r,
                Err(e) => return fail(format!("Invalid payload: {}", e)),
            };

            // Ensure template_id matches
            let request = RenderRequest {
                template_id: template,
                ..request
            };

            match pipeline.render(&request) {
                Ok(document) => {
                    emit(&serde_json::json!({
                        "success": true,
                        "document": document,
                    }));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    emit(&serde_json::json!({
                        "success": false,
                        "error": e.to_string(),
                    }));
                    ExitCode::from(2) // Render failure (validation)
                }
            }
        }
    }
}
