//! Staged analysis: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! [`crate::analyze`] runs a whole analysis (or stops after a named
//! stage) in one call. [`Pipeline`] lets the caller drive execution one
//! step at a time instead:
//!
//! ```rust
//! # use lithomorph_pipeline::{AnalysisContext, AnalysisKind, Pipeline, PipelineError, SourceImage};
//! # fn run(source: &SourceImage) -> Result<(), PipelineError> {
//! let context = AnalysisContext::new(AnalysisKind::Fracture);
//! let record = Pipeline::new(source, &context)?
//!     .blur()
//!     .binarize()?
//!     .clean()
//!     .detect()
//!     .measure()
//!     .into_record();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next state,
//! carrying the snapshots collected so far. Every stage can also be
//! turned into a partial [`ResultRecord`] with
//! [`PipelineStage::into_record`].
//!
//! All parameters are parsed and validated when the pipeline is
//! created, so later stages fail only on conditions that depend on the
//! data.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::analyzer::{AnalysisKind, Measurements};
use crate::binarize::BinarizeConfig;
use crate::contour::{FeatureRecord, LengthMeasure, extract_components, extract_regions};
use crate::diagnostics::{StageMetrics, count_foreground};
use crate::filter::FilterConfig;
use crate::merge::{MergeConfig, merge};
use crate::morphology::MorphologyConfig;
use crate::params::{AnalysisParameters, ParamValue, keys};
use crate::render;
use crate::separate::{SeparationConfig, label_components, separate};
use crate::types::{
    Dimensions, GrayImage, PipelineError, RegionMap, ResultRecord, RgbImage, SnapshotKey,
    SourceImage,
};
use crate::units::{ResolvedDpi, UnitConverter};

/// Total number of stages a pore or grain analysis passes through.
/// Fracture analysis skips [`StageId::Separation`].
pub const STAGE_COUNT: usize = 7;

/// Names of the pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Input intensities.
    Gray,
    /// Gaussian pre-blur.
    Blurred,
    /// Thresholding.
    Binary,
    /// Morphological cleanup.
    Morph,
    /// Region separation (pore and grain only).
    Separation,
    /// Contour extraction, filtering, and merging.
    Detection,
    /// Measurement and unit conversion.
    Measurement,
}

impl StageId {
    /// Every stage in execution order.
    pub const ALL: [Self; STAGE_COUNT] = [
        Self::Gray,
        Self::Blurred,
        Self::Binary,
        Self::Morph,
        Self::Separation,
        Self::Detection,
        Self::Measurement,
    ];

    /// Stable lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gray => "gray",
            Self::Blurred => "blurred",
            Self::Binary => "binary",
            Self::Morph => "morph",
            Self::Separation => "separation",
            Self::Detection => "detection",
            Self::Measurement => "measurement",
        }
    }

    /// Zero-based position in [`Self::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether an analysis of `kind` ever reaches this stage.
    #[must_use]
    pub const fn runs_for(self, kind: AnalysisKind) -> bool {
        !matches!(self, Self::Separation) || kind.separates_regions()
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|id| id.name()).collect();
                format!("unknown stage `{s}` (expected one of: {})", names.join(", "))
            })
    }
}

/// What to analyze and with which parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisContext {
    /// Analysis kind.
    pub kind: AnalysisKind,
    /// Complete parameter set for `kind`.
    pub params: AnalysisParameters,
}

impl AnalysisContext {
    /// Context with the kind's default parameters.
    #[must_use]
    pub fn new(kind: AnalysisKind) -> Self {
        Self {
            kind,
            params: kind.default_parameters(),
        }
    }

    /// Context with an explicit parameter set.
    #[must_use]
    pub const fn with_params(kind: AnalysisKind, params: AnalysisParameters) -> Self {
        Self { kind, params }
    }

    /// Override one parameter.
    #[must_use = "returns the updated context"]
    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key, value);
        self
    }
}

/// Fail when `stop_at` names a stage `kind` never runs.
pub(crate) fn check_stop(kind: AnalysisKind, stop_at: Option<StageId>) -> Result<(), PipelineError> {
    match stop_at {
        Some(stage) if !stage.runs_for(kind) => {
            Err(PipelineError::StageNotApplicable { stage, kind })
        }
        _ => Ok(()),
    }
}

/// Typed stage configurations, parsed once up front.
#[derive(Debug, Clone)]
struct Plan {
    blur_sigma: f32,
    binarize: BinarizeConfig,
    morphology: MorphologyConfig,
    separation: Option<SeparationConfig>,
    length: LengthMeasure,
    filter: FilterConfig,
    merge: Option<MergeConfig>,
}

impl Plan {
    fn new(context: &AnalysisContext, units: &UnitConverter) -> Result<Self, PipelineError> {
        let kind = context.kind;
        let params = &context.params;

        let sigma = params.float(keys::BLUR_SIGMA)?;
        if !sigma.is_finite() || sigma < 0.0 {
            return Err(PipelineError::invalid(
                keys::BLUR_SIGMA,
                format!("{sigma} is not a non-negative number"),
            ));
        }
        #[allow(clippy::cast_possible_truncation)]
        let blur_sigma = sigma as f32;

        let separation = if kind.separates_regions() {
            SeparationConfig::from_params(params)?
        } else {
            None
        };
        let merge = if kind.merges_fragments() {
            MergeConfig::from_params(params, units)?
        } else {
            None
        };

        Ok(Self {
            blur_sigma,
            binarize: BinarizeConfig::from_params(params)?,
            morphology: MorphologyConfig::from_params(params)?,
            separation,
            length: kind.length_measure(),
            filter: FilterConfig::from_params(kind, params)?,
            merge,
        })
    }
}

/// State shared by every stage.
struct Run {
    kind: AnalysisKind,
    plan: Plan,
    dimensions: Dimensions,
    dpi: ResolvedDpi,
    units: UnitConverter,
    gray: GrayImage,
    snapshots: BTreeMap<SnapshotKey, GrayImage>,
}

impl Run {
    fn keep(&mut self, key: SnapshotKey, image: &GrayImage) {
        self.snapshots.insert(key, image.clone());
    }

    /// Record for a run that stopped after `completed`.
    fn partial(
        self,
        completed: StageId,
        visualization: RgbImage,
        features: Vec<FeatureRecord>,
    ) -> ResultRecord {
        ResultRecord {
            kind: self.kind,
            dimensions: self.dimensions,
            visualization,
            measurements: None,
            features,
            snapshots: self.snapshots,
            empty: false,
            message: None,
            dpi: self.dpi,
            completed,
        }
    }

    fn plain_visualization(&self) -> RgbImage {
        render::gray_to_rgb(&self.gray)
    }
}

fn visualize(gray: &GrayImage, regions: Option<&RegionMap>, features: &[FeatureRecord]) -> RgbImage {
    let mut canvas = render::gray_to_rgb(gray);
    match regions {
        Some(regions) => render::fill_regions(&mut canvas, regions, features),
        None => render::outline_features(&mut canvas, features, render::OUTLINE),
    }
    canvas
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
///
/// Parameters are validated and the DPI is resolved. Call
/// [`blur`](Self::blur) to advance.
#[must_use = "pipeline stages are consumed by advancing, call .blur() to continue"]
pub struct Pending {
    run: Run,
}

impl Pending {
    /// The input intensities.
    #[must_use]
    pub const fn gray(&self) -> &GrayImage {
        &self.run.gray
    }

    /// DPI that will be used for unit conversion.
    #[must_use]
    pub const fn dpi(&self) -> ResolvedDpi {
        self.run.dpi
    }

    /// Apply the Gaussian pre-blur and advance to [`Blurred`].
    pub fn blur(self) -> Blurred {
        let mut run = self.run;
        let sigma = run.plan.blur_sigma;
        let blurred = crate::blur::gaussian_blur(&run.gray, sigma);
        log::debug!("blur: sigma {sigma}");
        run.keep(SnapshotKey::Blurred, &blurred);
        Blurred { run, blurred }
    }
}

// ───────────────────────── Stage 1: Blurred ──────────────────────────

/// Pipeline state after the pre-blur.
#[must_use = "pipeline stages are consumed by advancing, call .binarize() to continue"]
pub struct Blurred {
    run: Run,
    blurred: GrayImage,
}

impl Blurred {
    /// The blurred image.
    #[must_use]
    pub const fn blurred(&self) -> &GrayImage {
        &self.blurred
    }

    /// Threshold into a binary mask and advance to [`Thresholded`].
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] when a local-window
    /// size is unusable.
    pub fn binarize(self) -> Result<Thresholded, PipelineError> {
        let mut run = self.run;
        let config = run.plan.binarize;
        let out = config.apply(&self.blurred)?;
        let foreground = count_foreground(&out.mask);
        log::debug!(
            "binarize: {} (threshold {:?}, invert {}), {foreground} foreground px",
            config.method,
            out.threshold,
            config.invert
        );
        run.keep(SnapshotKey::Binary, &out.mask);
        Ok(Thresholded {
            run,
            mask: out.mask,
            threshold: out.threshold,
            foreground,
        })
    }
}

// ──────────────────────── Stage 2: Thresholded ───────────────────────

/// Pipeline state after thresholding.
#[must_use = "pipeline stages are consumed by advancing, call .clean() to continue"]
pub struct Thresholded {
    run: Run,
    mask: GrayImage,
    threshold: Option<u8>,
    foreground: u64,
}

impl Thresholded {
    /// The binary mask.
    #[must_use]
    pub const fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Global threshold used, for Global and Otsu.
    #[must_use]
    pub const fn threshold(&self) -> Option<u8> {
        self.threshold
    }

    /// Run opening, small-area removal, and closing; advance to
    /// [`Cleaned`].
    pub fn clean(self) -> Cleaned {
        let mut run = self.run;
        let mask = run.plan.morphology.apply(&self.mask);
        let foreground_after = count_foreground(&mask);
        log::debug!(
            "morphology: foreground {} -> {foreground_after}",
            self.foreground
        );
        run.keep(SnapshotKey::Morph, &mask);
        Cleaned {
            run,
            mask,
            foreground_before: self.foreground,
            foreground_after,
        }
    }
}

// ───────────────────────── Stage 3: Cleaned ──────────────────────────

/// Pipeline state after morphological cleanup.
///
/// Pore and grain analysis continue with [`separate`](Self::separate);
/// fracture analysis continues with [`detect`](Self::detect).
#[must_use = "pipeline stages are consumed by advancing, call .separate() or .detect() to continue"]
pub struct Cleaned {
    run: Run,
    mask: GrayImage,
    foreground_before: u64,
    foreground_after: u64,
}

impl Cleaned {
    /// The cleaned mask.
    #[must_use]
    pub const fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Split touching regions and advance to [`Separated`].
    ///
    /// With `separation.enabled` off, connected components become the
    /// regions.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StageNotApplicable`] for fracture
    /// analysis.
    pub fn separate(self) -> Result<Separated, PipelineError> {
        let mut run = self.run;
        if !run.kind.separates_regions() {
            return Err(PipelineError::StageNotApplicable {
                stage: StageId::Separation,
                kind: run.kind,
            });
        }

        let (regions, metrics) = match &run.plan.separation {
            Some(config) => {
                let s = separate(&self.mask, config);
                let metrics = StageMetrics::Separation {
                    flooded: true,
                    seeds: s.seed_count,
                    regions: s.regions.region_count(),
                    boundary_pixels: s.regions.boundary_count(),
                    max_distance: s.distance.max(),
                };
                run.snapshots
                    .insert(SnapshotKey::SureBackground, s.sure_background);
                run.snapshots
                    .insert(SnapshotKey::Distance, s.distance.to_preview());
                run.snapshots.insert(SnapshotKey::Seeds, s.seeds);
                run.snapshots.insert(SnapshotKey::Unknown, s.unknown);
                (s.regions, metrics)
            }
            None => {
                let regions = label_components(&self.mask);
                let metrics = StageMetrics::Separation {
                    flooded: false,
                    seeds: 0,
                    regions: regions.region_count(),
                    boundary_pixels: 0,
                    max_distance: 0.0,
                };
                (regions, metrics)
            }
        };
        run.snapshots
            .insert(SnapshotKey::Regions, regions.to_preview());
        Ok(Separated {
            run,
            regions,
            metrics,
        })
    }

    /// Extract features straight from the cleaned mask and advance to
    /// [`Detected`].
    ///
    /// For pore and grain analysis this bypasses separation, so
    /// touching regions are measured as one.
    pub fn detect(self) -> Detected {
        let features = extract_components(&self.mask, self.run.plan.length);
        detect_from(self.run, None, features)
    }

    /// The stage this kind runs next.
    fn proceed(self) -> Result<Stage, PipelineError> {
        if self.run.kind.separates_regions() {
            Ok(Stage::Separated(self.separate()?))
        } else {
            Ok(Stage::Detected(self.detect()))
        }
    }
}

// ──────────────────────── Stage 4: Separated ─────────────────────────

/// Pipeline state after region separation.
#[must_use = "pipeline stages are consumed by advancing, call .detect() to continue"]
pub struct Separated {
    run: Run,
    regions: RegionMap,
    metrics: StageMetrics,
}

impl Separated {
    /// The region label map.
    #[must_use]
    pub const fn regions(&self) -> &RegionMap {
        &self.regions
    }

    /// Extract one feature per region and advance to [`Detected`].
    pub fn detect(self) -> Detected {
        let features = extract_regions(&self.regions, self.run.plan.length);
        detect_from(self.run, Some(self.regions), features)
    }
}

/// Filter, then merge when configured.
fn detect_from(run: Run, regions: Option<RegionMap>, features: Vec<FeatureRecord>) -> Detected {
    let extracted = features.len();
    let kept_features = run.plan.filter.apply(features);
    let kept = kept_features.len();
    let (features, merged_groups) = match &run.plan.merge {
        Some(config) => {
            let outcome = merge(kept_features, config);
            (outcome.features, Some(outcome.fused_groups))
        }
        None => (kept_features, None),
    };
    log::debug!(
        "detection: {extracted} extracted, {kept} kept, {} out",
        features.len()
    );
    Detected {
        run,
        regions,
        features,
        extracted,
        kept,
        merged_groups,
    }
}

// ───────────────────────── Stage 5: Detected ─────────────────────────

/// Pipeline state after feature extraction, filtering, and merging.
#[must_use = "pipeline stages are consumed by advancing, call .measure() to continue"]
pub struct Detected {
    run: Run,
    regions: Option<RegionMap>,
    features: Vec<FeatureRecord>,
    extracted: usize,
    kept: usize,
    merged_groups: Option<usize>,
}

impl Detected {
    /// Surviving features in discovery order.
    #[must_use]
    pub fn features(&self) -> &[FeatureRecord] {
        &self.features
    }

    /// Compute measurements, convert units, render the visualization,
    /// and advance to [`Measured`].
    pub fn measure(self) -> Measured {
        let kind = self.run.kind;
        let raw = kind.measure(&self.features, self.run.dimensions);
        let measurements = kind.post_process(raw, &self.run.units);
        let visualization = visualize(&self.run.gray, self.regions.as_ref(), &self.features);
        log::debug!(
            "measurement: {} features at {:.1} dpi{}",
            measurements.count(),
            self.run.dpi.dpi,
            if self.run.dpi.degraded { " (default)" } else { "" }
        );
        Measured {
            run: self.run,
            features: self.features,
            measurements,
            visualization,
        }
    }
}

// ──────────────────────── Stage 6: Measured ──────────────────────────

/// Final pipeline state.
#[must_use = "call .into_record() to extract the ResultRecord"]
pub struct Measured {
    run: Run,
    features: Vec<FeatureRecord>,
    measurements: Measurements,
    visualization: RgbImage,
}

impl Measured {
    /// Final measurements.
    #[must_use]
    pub const fn measurements(&self) -> &Measurements {
        &self.measurements
    }

    /// Consume the pipeline and return the finished record.
    pub fn into_record(self) -> ResultRecord {
        self.finish()
    }

    fn finish(self) -> ResultRecord {
        let kind = self.run.kind;
        let empty = kind.is_result_empty(&self.measurements);
        let message = empty.then(|| {
            log::info!("{kind}: {}", kind.empty_message());
            kind.empty_message().to_owned()
        });
        ResultRecord {
            kind,
            dimensions: self.run.dimensions,
            visualization: self.visualization,
            measurements: Some(self.measurements),
            features: self.features,
            snapshots: self.run.snapshots,
            empty,
            message,
            dpi: self.run.dpi,
            completed: StageId::Measurement,
        }
    }
}

// ──────────────────── PipelineStage trait + Stage enum ────────────────

/// The output produced by a single pipeline stage.
#[must_use]
pub enum StageOutput<'a> {
    /// Input intensities.
    Gray {
        /// The input image.
        gray: &'a GrayImage,
    },
    /// Gaussian blur result.
    Blurred {
        /// The blurred image.
        blurred: &'a GrayImage,
    },
    /// Thresholding result.
    Binary {
        /// The binary mask.
        mask: &'a GrayImage,
        /// Global threshold, for Global and Otsu.
        threshold: Option<u8>,
    },
    /// Morphology result.
    Morph {
        /// The cleaned mask.
        mask: &'a GrayImage,
    },
    /// Separation result.
    Separation {
        /// The region label map.
        regions: &'a RegionMap,
    },
    /// Detection result.
    Detection {
        /// Surviving features.
        features: &'a [FeatureRecord],
    },
    /// Final result.
    Measurement {
        /// Measurements with millimetre values.
        measurements: &'a Measurements,
        /// Rendered overlay.
        visualization: &'a RgbImage,
    },
}

/// Trait implemented by every pipeline stage, enabling uniform iteration.
///
/// Each stage struct implements it and [`Stage`] delegates to whichever
/// variant it holds.
pub trait PipelineStage: Sized {
    /// Which stage this is.
    const ID: StageId;

    /// The output this stage produced.
    fn output(&self) -> StageOutput<'_>;

    /// Stage-specific metrics for diagnostics.
    ///
    /// Returns `None` for [`Pending`], which has not processed anything.
    fn metrics(&self) -> Option<StageMetrics>;

    /// Advance to the next stage.
    ///
    /// Returns `Ok(None)` at the final stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] when the transition fails.
    fn next(self) -> Result<Option<Stage>, PipelineError>;

    /// Run all remaining stages and return the finished record.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if any remaining stage fails.
    fn complete(self) -> Result<ResultRecord, PipelineError>;

    /// Stop here and return a record of the work done so far.
    fn into_record(self) -> ResultRecord;
}

impl PipelineStage for Pending {
    const ID: StageId = StageId::Gray;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Gray {
            gray: &self.run.gray,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        None
    }

    fn next(self) -> Result<Option<Stage>, PipelineError> {
        Ok(Some(Stage::Blurred(self.blur())))
    }

    fn complete(self) -> Result<ResultRecord, PipelineError> {
        self.blur().complete()
    }

    fn into_record(self) -> ResultRecord {
        let visualization = self.run.plain_visualization();
        self.run.partial(Self::ID, visualization, Vec::new())
    }
}

impl PipelineStage for Blurred {
    const ID: StageId = StageId::Blurred;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Blurred {
            blurred: &self.blurred,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(StageMetrics::Blur {
            sigma: self.run.plan.blur_sigma,
        })
    }

    fn next(self) -> Result<Option<Stage>, PipelineError> {
        Ok(Some(Stage::Thresholded(self.binarize()?)))
    }

    fn complete(self) -> Result<ResultRecord, PipelineError> {
        self.binarize()?.complete()
    }

    fn into_record(self) -> ResultRecord {
        let visualization = self.run.plain_visualization();
        self.run.partial(Self::ID, visualization, Vec::new())
    }
}

impl PipelineStage for Thresholded {
    const ID: StageId = StageId::Binary;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Binary {
            mask: &self.mask,
            threshold: self.threshold,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        let config = self.run.plan.binarize;
        Some(StageMetrics::Binarize {
            method: config.method.name().to_owned(),
            threshold: self.threshold,
            inverted: config.invert,
            foreground_pixels: self.foreground,
            total_pixels: self.run.dimensions.pixel_count(),
        })
    }

    fn next(self) -> Result<Option<Stage>, PipelineError> {
        Ok(Some(Stage::Cleaned(self.clean())))
    }

    fn complete(self) -> Result<ResultRecord, PipelineError> {
        self.clean().complete()
    }

    fn into_record(self) -> ResultRecord {
        let visualization = self.run.plain_visualization();
        self.run.partial(Self::ID, visualization, Vec::new())
    }
}

impl PipelineStage for Cleaned {
    const ID: StageId = StageId::Morph;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Morph { mask: &self.mask }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(StageMetrics::Morphology {
            foreground_before: self.foreground_before,
            foreground_after: self.foreground_after,
        })
    }

    fn next(self) -> Result<Option<Stage>, PipelineError> {
        self.proceed().map(Some)
    }

    fn complete(self) -> Result<ResultRecord, PipelineError> {
        self.proceed()?.complete()
    }

    fn into_record(self) -> ResultRecord {
        let visualization = self.run.plain_visualization();
        self.run.partial(Self::ID, visualization, Vec::new())
    }
}

impl PipelineStage for Separated {
    const ID: StageId = StageId::Separation;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Separation {
            regions: &self.regions,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.metrics.clone())
    }

    fn next(self) -> Result<Option<Stage>, PipelineError> {
        Ok(Some(Stage::Detected(self.detect())))
    }

    fn complete(self) -> Result<ResultRecord, PipelineError> {
        self.detect().complete()
    }

    fn into_record(self) -> ResultRecord {
        let visualization = visualize(&self.run.gray, Some(&self.regions), &[]);
        self.run.partial(Self::ID, visualization, Vec::new())
    }
}

impl PipelineStage for Detected {
    const ID: StageId = StageId::Detection;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Detection {
            features: &self.features,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(StageMetrics::Detection {
            extracted: self.extracted,
            kept: self.kept,
            merged_groups: self.merged_groups,
            output: self.features.len(),
        })
    }

    fn next(self) -> Result<Option<Stage>, PipelineError> {
        Ok(Some(Stage::Measured(self.measure())))
    }

    fn complete(self) -> Result<ResultRecord, PipelineError> {
        Ok(self.measure().into_record())
    }

    fn into_record(self) -> ResultRecord {
        let visualization = visualize(&self.run.gray, self.regions.as_ref(), &self.features);
        self.run.partial(Self::ID, visualization, self.features)
    }
}

impl PipelineStage for Measured {
    const ID: StageId = StageId::Measurement;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Measurement {
            measurements: &self.measurements,
            visualization: &self.visualization,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(StageMetrics::Measurement {
            count: self.measurements.count(),
            total_area_px: self.measurements.total_area_px(),
            dpi: self.run.dpi.dpi,
            degraded_dpi: self.run.dpi.degraded,
        })
    }

    fn next(self) -> Result<Option<Stage>, PipelineError> {
        Ok(None)
    }

    fn complete(self) -> Result<ResultRecord, PipelineError> {
        Ok(self.finish())
    }

    fn into_record(self) -> ResultRecord {
        self.finish()
    }
}

/// Enum wrapping all pipeline stages for uniform, loopable access.
///
/// ```rust
/// # use lithomorph_pipeline::{AnalysisContext, AnalysisKind, Pipeline, PipelineError, SourceImage};
/// # use lithomorph_pipeline::pipeline::{Advance, Stage};
/// # fn run(source: &SourceImage) -> Result<(), PipelineError> {
/// let context = AnalysisContext::new(AnalysisKind::Pore);
/// let mut stage: Stage = Pipeline::new(source, &context)?.into();
/// loop {
///     match stage.advance()? {
///         Advance::Next(next) => stage = next,
///         Advance::Complete(done) => { stage = done; break; }
///     }
/// }
/// let record = stage.into_record();
/// # Ok(())
/// # }
/// ```
#[must_use]
pub enum Stage {
    /// See [`Pending`].
    Pending(Pending),
    /// See [`Blurred`].
    Blurred(Blurred),
    /// See [`Thresholded`].
    Thresholded(Thresholded),
    /// See [`Cleaned`].
    Cleaned(Cleaned),
    /// See [`Separated`].
    Separated(Separated),
    /// See [`Detected`].
    Detected(Detected),
    /// See [`Measured`].
    Measured(Measured),
}

/// Compile-time guard: adding a [`Stage`] variant makes this match
/// non-exhaustive, a reminder to bump [`STAGE_COUNT`].
#[allow(dead_code, clippy::match_same_arms)]
const fn _stage_count_guard(s: &Stage) {
    match s {
        Stage::Pending(_)
        | Stage::Blurred(_)
        | Stage::Thresholded(_)
        | Stage::Cleaned(_)
        | Stage::Separated(_)
        | Stage::Detected(_)
        | Stage::Measured(_) => {}
    }
}

/// Result of [`Stage::advance`]: either the next stage or the
/// completed final stage returned unchanged.
#[must_use]
pub enum Advance {
    /// The pipeline advanced to this next stage.
    Next(Stage),
    /// The pipeline was already at the final stage.
    Complete(Stage),
}

/// Delegate a method call to whichever `Stage` variant is active.
macro_rules! delegate {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        match $self {
            Self::Pending(s) => s.$method($($arg),*),
            Self::Blurred(s) => s.$method($($arg),*),
            Self::Thresholded(s) => s.$method($($arg),*),
            Self::Cleaned(s) => s.$method($($arg),*),
            Self::Separated(s) => s.$method($($arg),*),
            Self::Detected(s) => s.$method($($arg),*),
            Self::Measured(s) => s.$method($($arg),*),
        }
    };
}

impl Stage {
    /// Which stage this is.
    #[must_use]
    pub fn id(&self) -> StageId {
        delegate!(self, id)
    }

    /// Stable name of the current stage.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.id().name()
    }

    /// Zero-based index of the current stage.
    #[must_use]
    pub fn index(&self) -> usize {
        self.id().index()
    }

    /// The output this stage produced.
    pub fn output(&self) -> StageOutput<'_> {
        delegate!(self, output)
    }

    /// Stage-specific metrics for diagnostics.
    #[must_use]
    pub fn metrics(&self) -> Option<StageMetrics> {
        delegate!(self, metrics)
    }

    /// Whether the pipeline is at the final stage.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Measured(_))
    }

    /// Advance to the next stage. Returns `Ok(None)` (consuming the
    /// final stage) when already complete.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the transition fails.
    pub fn next(self) -> Result<Option<Self>, PipelineError> {
        delegate!(self, next)
    }

    /// Advance to the next stage, returning `self` unchanged if
    /// already complete.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the transition fails.
    pub fn advance(self) -> Result<Advance, PipelineError> {
        Ok(match self {
            Self::Pending(s) => Advance::Next(s.blur().into()),
            Self::Blurred(s) => Advance::Next(s.binarize()?.into()),
            Self::Thresholded(s) => Advance::Next(s.clean().into()),
            Self::Cleaned(s) => Advance::Next(s.proceed()?),
            Self::Separated(s) => Advance::Next(s.detect().into()),
            Self::Detected(s) => Advance::Next(s.measure().into()),
            done @ Self::Measured(_) => Advance::Complete(done),
        })
    }

    /// Run all remaining stages to completion.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if any remaining stage fails.
    pub fn complete(self) -> Result<ResultRecord, PipelineError> {
        delegate!(self, complete)
    }

    /// Stop here and return a record of the work done so far.
    pub fn into_record(self) -> ResultRecord {
        delegate!(self, into_record)
    }
}

// The trait's associated constant is not callable through `self`.
trait StageMetadata {
    fn id(&self) -> StageId;
}

impl<T: PipelineStage> StageMetadata for T {
    fn id(&self) -> StageId {
        T::ID
    }
}

impl From<Pending> for Stage {
    fn from(s: Pending) -> Self {
        Self::Pending(s)
    }
}

impl From<Blurred> for Stage {
    fn from(s: Blurred) -> Self {
        Self::Blurred(s)
    }
}

impl From<Thresholded> for Stage {
    fn from(s: Thresholded) -> Self {
        Self::Thresholded(s)
    }
}

impl From<Cleaned> for Stage {
    fn from(s: Cleaned) -> Self {
        Self::Cleaned(s)
    }
}

impl From<Separated> for Stage {
    fn from(s: Separated) -> Self {
        Self::Separated(s)
    }
}

impl From<Detected> for Stage {
    fn from(s: Detected) -> Self {
        Self::Detected(s)
    }
}

impl From<Measured> for Stage {
    fn from(s: Measured) -> Self {
        Self::Measured(s)
    }
}

// ───────────────────── Pipeline entry point ──────────────────────────

/// Incremental analysis pipeline.
///
/// Each stage method consumes the current state and returns the next,
/// making it a compile-time error to skip stages or call them out of
/// order.
pub struct Pipeline;

impl Pipeline {
    /// Validate parameters, resolve the DPI, and return the first
    /// stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownParameter`] or
    /// [`PipelineError::InvalidParameter`] when the parameters do not
    /// fit the kind's schema, and [`PipelineError::EmptyImage`] for a
    /// zero-sized image.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(source: &SourceImage, context: &AnalysisContext) -> Result<Pending, PipelineError> {
        context.params.validate(context.kind.schema())?;
        let dimensions = source.dimensions();
        if dimensions.width == 0 || dimensions.height == 0 {
            return Err(PipelineError::EmptyImage);
        }

        let dpi = ResolvedDpi::resolve(source.resolution());
        let units = UnitConverter::from_resolved(dpi);
        let plan = Plan::new(context, &units)?;
        log::debug!(
            "{} on {}x{} image",
            context.kind,
            dimensions.width,
            dimensions.height
        );

        let gray = source.pixels().clone();
        let mut snapshots = BTreeMap::new();
        snapshots.insert(SnapshotKey::Gray, gray.clone());
        Ok(Pending {
            run: Run {
                kind: context.kind,
                plan,
                dimensions,
                dpi,
                units,
                gray,
                snapshots,
            },
        })
    }
}
