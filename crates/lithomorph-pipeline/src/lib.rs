//! lithomorph-pipeline: Pure rock-core image analysis pipeline (sans-IO).
//!
//! Turns a grayscale photograph of a rock core into measurements of its
//! fractures, pores, or grains through:
//! blur -> binarize -> morphology -> region separation (pores, grains) ->
//! contour extraction -> filtering -> merging (fractures) -> measurement
//! -> unit conversion.
//!
//! This crate has **no I/O dependencies**: it operates on in-memory
//! images and returns structured data. Decoding files and writing
//! reports live in `lithomorph-bench` and `lithomorph-export`.

pub mod analyzer;
pub mod binarize;
pub mod blur;
pub mod contour;
pub mod diagnostics;
pub mod distance;
pub mod filter;
pub mod merge;
pub mod morphology;
pub mod params;
pub mod pipeline;
pub mod render;
pub mod resolution;
pub mod separate;
pub mod skeleton;
pub mod types;
pub mod units;

pub use analyzer::{AnalysisKind, FeatureMeasurement, Measurements};
pub use binarize::{Binarizer, ThresholdMethod};
pub use contour::{FeatureRecord, LengthMeasure, RotatedRect};
pub use diagnostics::{Clock, PipelineDiagnostics, analyze_with_diagnostics};
pub use params::{AnalysisParameters, ParamSpec, ParamValue};
pub use pipeline::{AnalysisContext, Pipeline, StageId};
pub use types::{
    Contour, Dimensions, PipelineError, PixelPoint, Point, RegionMap, Resolution, ResultRecord,
    SnapshotKey, SourceImage,
};
pub use units::{ResolvedDpi, UnitConverter};

/// Run an analysis.
///
/// With `stop_at` set, processing ends after that stage and the
/// returned record holds the snapshots collected so far and no
/// measurements.
///
/// # Pipeline steps
///
/// 1. Validate parameters and resolve the DPI
/// 2. Gaussian pre-blur
/// 3. Binarization (Global, Otsu, adaptive Gaussian, Niblack, Sauvola)
/// 4. Opening, small-component removal, closing
/// 5. Marker-controlled region separation (pore and grain only)
/// 6. Contour extraction and geometric filtering
/// 7. Fragment merging (fracture only, when enabled)
/// 8. Measurement, millimetre conversion, and visualization
///
/// Finding nothing is not an error: the record is flagged empty and
/// carries a message.
///
/// # Errors
///
/// Returns [`PipelineError::StageNotApplicable`] when `stop_at` names a
/// stage the kind never runs, [`PipelineError::UnknownParameter`] or
/// [`PipelineError::InvalidParameter`] for unusable parameters, and
/// [`PipelineError::EmptyImage`] for a zero-sized image.
pub fn analyze(
    source: &SourceImage,
    context: &AnalysisContext,
    stop_at: Option<StageId>,
) -> Result<ResultRecord, PipelineError> {
    pipeline::check_stop(context.kind, stop_at)?;
    let mut stage: pipeline::Stage = Pipeline::new(source, context)?.into();
    loop {
        if stop_at == Some(stage.id()) {
            return Ok(stage.into_record());
        }
        match stage.advance()? {
            pipeline::Advance::Next(next) => stage = next,
            pipeline::Advance::Complete(done) => return Ok(done.into_record()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::params::keys;
    use crate::types::GrayImage;

    fn speckled() -> SourceImage {
        SourceImage::new(GrayImage::from_fn(90, 70, |x, y| {
            let pore = (f64::from(x) - 30.0).hypot(f64::from(y) - 30.0) < 9.0
                || (f64::from(x) - 62.0).hypot(f64::from(y) - 45.0) < 12.0;
            image::Luma([if pore { 25 } else { 210 }])
        }))
    }

    #[test]
    fn full_run_measures() {
        let record = analyze(&speckled(), &AnalysisContext::new(AnalysisKind::Pore), None).unwrap();
        assert_eq!(record.completed_stage(), StageId::Measurement);
        assert_eq!(record.features().len(), 2);
        assert!(!record.is_empty());
    }

    #[test]
    fn stop_after_each_stage() {
        let context = AnalysisContext::new(AnalysisKind::Grain);
        for id in StageId::ALL {
            let record = analyze(&speckled(), &context, Some(id)).unwrap();
            assert_eq!(record.completed_stage(), id);
            assert_eq!(
                record.measurements().is_some(),
                id == StageId::Measurement,
                "{id}"
            );
        }
    }

    #[test]
    fn separation_stop_rejected_for_fracture() {
        let err = analyze(
            &speckled(),
            &AnalysisContext::new(AnalysisKind::Fracture),
            Some(StageId::Separation),
        )
        .unwrap_err();
        assert_eq!(
            err,
            PipelineError::StageNotApplicable {
                stage: StageId::Separation,
                kind: AnalysisKind::Fracture,
            }
        );
    }

    #[test]
    fn identical_inputs_give_identical_records() {
        let context = AnalysisContext::new(AnalysisKind::Pore).with(keys::THRESHOLD_METHOD, "sauvola");
        let a = analyze(&speckled(), &context, None).unwrap();
        let b = analyze(&speckled(), &context, None).unwrap();
        assert_eq!(a.features(), b.features());
        assert_eq!(a.measurements(), b.measurements());
        assert_eq!(a.snapshots(), b.snapshots());
        assert_eq!(a.visualization(), b.visualization());
    }

    #[test]
    fn record_survives_json() {
        let record = analyze(&speckled(), &AnalysisContext::new(AnalysisKind::Pore), None).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let back: ResultRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.features(), record.features());
        assert_eq!(back.measurements(), record.measurements());
        assert_eq!(back.visualization(), record.visualization());
        assert_eq!(back.snapshots(), record.snapshots());
    }
}
