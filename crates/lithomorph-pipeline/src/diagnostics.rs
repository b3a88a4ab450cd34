//! Pipeline diagnostics: timing, counts, and other metrics for each stage.
//!
//! Every stage reports a [`StageMetrics`] value describing the work it
//! did. [`analyze_with_diagnostics`](crate::analyze_with_diagnostics)
//! additionally times each stage through an injected [`Clock`], so the
//! core never reads the system time itself.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analyzer::{AnalysisKind, Measurements};
use crate::pipeline::{Advance, AnalysisContext, Pipeline, Stage, StageId, check_stop};
use crate::types::{GrayImage, PipelineError, ResultRecord, SourceImage, is_foreground};

/// Source of timestamps for stage timing.
pub trait Clock {
    /// Opaque timestamp.
    type Instant;

    /// Current timestamp.
    fn now(&self) -> Self::Instant;

    /// Time passed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Analysis kind that ran.
    pub kind: AnalysisKind,
    /// Source image width in pixels.
    pub image_width: u32,
    /// Source image height in pixels.
    pub image_height: u32,
    /// Every stage that ran after the input stage, in order.
    pub stages: Vec<StageDiagnostics>,
    /// Total wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Surviving features, `None` when the run stopped early.
    pub feature_count: Option<usize>,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Which stage.
    pub stage: StageId,
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics that vary by pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Gaussian pre-blur.
    Blur {
        /// Sigma used; `0` means the stage passed the image through.
        sigma: f32,
    },
    /// Thresholding.
    Binarize {
        /// Method name.
        method: String,
        /// Global threshold, for Global and Otsu.
        threshold: Option<u8>,
        /// Whether the mask was inverted.
        inverted: bool,
        /// Foreground cells in the mask.
        foreground_pixels: u64,
        /// Total cells.
        total_pixels: u64,
    },
    /// Opening, small-area removal, and closing.
    Morphology {
        /// Foreground cells before.
        foreground_before: u64,
        /// Foreground cells after.
        foreground_after: u64,
    },
    /// Region separation (pore and grain only).
    Separation {
        /// Whether marker flooding ran; `false` means plain labeling.
        flooded: bool,
        /// Seed components.
        seeds: usize,
        /// Labeled regions.
        regions: usize,
        /// Boundary cells.
        boundary_pixels: usize,
        /// Largest distance to background, in pixels.
        max_distance: f64,
    },
    /// Contour extraction, filtering, and merging.
    Detection {
        /// Features extracted.
        extracted: usize,
        /// Features surviving the filter.
        kept: usize,
        /// Groups fused by merging, `None` when merging is off.
        merged_groups: Option<usize>,
        /// Features after merging.
        output: usize,
    },
    /// Measurement and unit conversion.
    Measurement {
        /// Surviving features.
        count: usize,
        /// Summed area, px².
        total_area_px: f64,
        /// DPI used for conversion.
        dpi: f64,
        /// Whether the default DPI was substituted.
        degraded_dpi: bool,
    },
}

impl PipelineDiagnostics {
    /// Diagnostics of one stage, if it ran.
    #[must_use]
    pub fn stage(&self, id: StageId) -> Option<&StageDiagnostics> {
        self.stages.iter().find(|s| s.stage == id)
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!(
            "{} Diagnostics Report\n{}",
            self.kind.name(),
            "=".repeat(60)
        ));
        lines.push(format!(
            "Image: {}x{} ({} pixels)",
            self.image_width,
            self.image_height,
            u64::from(self.image_width) * u64::from(self.image_height),
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for diag in &self.stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            let name = diag.stage.to_string();
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        match self.feature_count {
            Some(n) => lines.push(format!("Features: {n}")),
            None => lines.push("Features: (stopped early)".to_owned()),
        }

        lines.join("\n")
    }
}

/// Run an analysis like [`analyze`](crate::analyze), timing every
/// stage with `clock`.
///
/// # Errors
///
/// Same as [`analyze`](crate::analyze).
pub fn analyze_with_diagnostics<C: Clock>(
    source: &SourceImage,
    context: &AnalysisContext,
    stop_at: Option<StageId>,
    clock: &C,
) -> Result<(ResultRecord, PipelineDiagnostics), PipelineError> {
    check_stop(context.kind, stop_at)?;
    let total_start = clock.now();
    let mut stage: Stage = Pipeline::new(source, context)?.into();
    let mut stages = Vec::new();

    while stop_at != Some(stage.id()) {
        let start = clock.now();
        match stage.advance()? {
            Advance::Next(next) => {
                let duration = clock.elapsed(&start);
                if let Some(metrics) = next.metrics() {
                    stages.push(StageDiagnostics {
                        stage: next.id(),
                        duration,
                        metrics,
                    });
                }
                stage = next;
            }
            Advance::Complete(done) => {
                stage = done;
                break;
            }
        }
    }

    let record = stage.into_record();
    let diagnostics = PipelineDiagnostics {
        kind: context.kind,
        image_width: record.dimensions().width,
        image_height: record.dimensions().height,
        stages,
        total_duration: clock.elapsed(&total_start),
        feature_count: record.measurements().map(Measurements::count),
    };
    Ok((record, diagnostics))
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Blur { sigma } => format!("sigma={sigma:.2}"),
        StageMetrics::Binarize {
            method,
            threshold,
            inverted,
            foreground_pixels,
            total_pixels,
        } => {
            #[allow(clippy::cast_precision_loss)]
            let density = if *total_pixels > 0 {
                *foreground_pixels as f64 / *total_pixels as f64 * 100.0
            } else {
                0.0
            };
            let t = threshold.map_or_else(String::new, |t| format!(" T={t}"));
            let inv = if *inverted { " inverted" } else { "" };
            format!("{method}{t}{inv} fg={foreground_pixels} ({density:.1}%)")
        }
        StageMetrics::Morphology {
            foreground_before,
            foreground_after,
        } => format!("fg {foreground_before}->{foreground_after}"),
        StageMetrics::Separation {
            flooded,
            seeds,
            regions,
            boundary_pixels,
            max_distance,
        } => {
            if *flooded {
                format!(
                    "{seeds} seeds -> {regions} regions, {boundary_pixels} boundary px (max dist {max_distance:.1})"
                )
            } else {
                format!("{regions} components (no flooding)")
            }
        }
        StageMetrics::Detection {
            extracted,
            kept,
            merged_groups,
            output,
        } => match merged_groups {
            Some(g) => format!("{extracted} extracted, {kept} kept, {g} fused -> {output}"),
            None => format!("{extracted} extracted, {kept} kept"),
        },
        StageMetrics::Measurement {
            count,
            total_area_px,
            dpi,
            degraded_dpi,
        } => {
            let note = if *degraded_dpi { " (default)" } else { "" };
            format!("{count} features, area={total_area_px:.0}px², dpi={dpi:.1}{note}")
        }
    }
}

/// Count foreground cells in a mask.
pub(crate) fn count_foreground(mask: &GrayImage) -> u64 {
    mask.pixels()
        .map(|p| u64::from(is_foreground(p.0[0])))
        .sum()
}
