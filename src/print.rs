//! Print Authority System
//!
//! Page geometry comes from exactly one authority so layout code never has to
//! guess which source of margins wins.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const A4_WIDTH_MM: f64 = 210.0;
pub const LETTER_WIDTH_MM: f64 = 215.9;
pub const DEFAULT_MARGIN_MM: f64 = 15.0;
pub const MM_PER_INCH: f64 = 25.4;

/// PrintAuthority determines where page geometry comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintAuthority {
    /// System defaults (fallback)
    #[default]
    System,
    /// User-provided overrides (with validation)
    User,
}

#[derive(Debug, Error, PartialEq)]
pub enum PrintSpecError {
    #[error("Page width must be between 100 and 1000 mm, got {0}")]
    PageWidth(f64),

    #[error("Margin must be between 0 and 50 mm, got {0}")]
    Margin(f64),

    #[error("DPI must be between 72 and 1200, got {0}")]
    Dpi(u32),
}

/// Physical page the layout engine measures against. Lengths in millimetres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintSpec {
    pub authority: PrintAuthority,
    /// Standard page width; wide tables may grow past it, never below.
    pub page_width_mm: f64,
    /// Left and right margin, each.
    pub margin_mm: f64,
    /// Used only to express millimetres as device pixels.
    pub dpi: u32,
}

impl Default for PrintSpec {
    fn default() -> Self {
        Self {
            authority: PrintAuthority::System,
            page_width_mm: A4_WIDTH_MM,
            margin_mm: DEFAULT_MARGIN_MM,
            dpi: 96,
        }
    }
}

impl PrintSpec {
    /// Create from user with validation
    pub fn from_user(page_width_mm: f64, margin_mm: f64, dpi: u32) -> Result<Self, PrintSpecError> {
        if !(100.0..=1000.0).contains(&page_width_mm) {
            return Err(PrintSpecError::PageWidth(page_width_mm));
        }
        if !(0.0..=50.0).contains(&margin_mm) {
            return Err(PrintSpecError::Margin(margin_mm));
        }
        if !(72..=1200).contains(&dpi) {
            return Err(PrintSpecError::Dpi(dpi));
        }
        Ok(Self {
            authority: PrintAuthority::User,
            page_width_mm,
            margin_mm,
            dpi,
        })
    }

    /// Total horizontal margin.
    pub fn horizontal_margins(&self) -> f64 {
        self.margin_mm * 2.0
    }

    /// Width a 100% table occupies on a standard page.
    pub fn content_width(&self) -> f64 {
        (self.page_width_mm - self.horizontal_margins()).max(0.0)
    }

    pub fn to_pixels(&self, mm: f64) -> f64 {
        mm / MM_PER_INCH * f64::from(self.dpi)
    }
}
