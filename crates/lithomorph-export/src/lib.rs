//! lithomorph-export: Pure format serializers (sans-IO)
//!
//! Turns analysis results into files a user keeps: a CSV table of
//! per-feature measurements and an SVG overlay of surviving contours.

pub mod csv;
pub mod svg;

pub use csv::{CsvMetadata, record_to_csv, to_csv};
pub use svg::{SvgMetadata, build_path_data, to_svg};

/// Errors raised when a result cannot be exported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExportError {
    /// The run stopped before measurement.
    #[error("no measurements: the run stopped after stage `{0}`")]
    NotMeasured(lithomorph_pipeline::StageId),

    /// Measurement finished but nothing survived filtering.
    #[error("no features to export")]
    NoFeatures,
}
