//! Shared types for the lithomorph analysis pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::analyzer::{AnalysisKind, Measurements};
use crate::contour::FeatureRecord;
use crate::pipeline::StageId;
use crate::units::ResolvedDpi;

/// Re-export `GrayImage` so downstream crates can reference
/// masks and intermediate rasters without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbImage` so downstream crates can reference the
/// visualization without depending on `image` directly.
pub use image::RgbImage;

/// Mask value of a foreground cell.
pub const FOREGROUND: u8 = 255;

/// Mask value of a background cell.
pub const BACKGROUND: u8 = 0;

/// Whether a mask cell is foreground.
///
/// Any non-zero value counts, so masks produced outside this crate
/// (e.g. a hand-drawn PNG) still behave.
#[must_use]
pub const fn is_foreground(value: u8) -> bool {
    value != BACKGROUND
}

/// A 2D point in continuous image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    ///
    /// Avoids the square root for comparison purposes.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }
}

/// An integer pixel position, as produced by boundary tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PixelPoint {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl PixelPoint {
    /// Create a new pixel position.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The same position as a continuous [`Point`].
    #[must_use]
    pub fn to_point(self) -> Point {
        Point::new(f64::from(self.x), f64::from(self.y))
    }
}

/// A closed, ordered boundary of integer pixel positions.
///
/// The last point connects back to the first; the closing point is
/// not repeated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contour(Vec<PixelPoint>);

impl Contour {
    /// Create a contour from its boundary points.
    #[must_use]
    pub const fn new(points: Vec<PixelPoint>) -> Self {
        Self(points)
    }

    /// Returns `true` if the contour has no points.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of boundary points.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns a slice of all boundary points.
    #[must_use]
    pub fn points(&self) -> &[PixelPoint] {
        &self.0
    }

    /// Consumes the contour and returns the underlying points.
    #[must_use]
    pub fn into_points(self) -> Vec<PixelPoint> {
        self.0
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Total number of pixels.
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Resolution metadata attached to a source image.
///
/// Either axis may be missing; [`crate::units::UnitConverter`] decides
/// what to do about it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resolution {
    /// Horizontal dots per inch.
    pub horizontal_dpi: Option<f64>,
    /// Vertical dots per inch.
    pub vertical_dpi: Option<f64>,
}

impl Resolution {
    /// Resolution with both axes known.
    #[must_use]
    pub const fn new(horizontal_dpi: f64, vertical_dpi: f64) -> Self {
        Self {
            horizontal_dpi: Some(horizontal_dpi),
            vertical_dpi: Some(vertical_dpi),
        }
    }

    /// Same DPI on both axes.
    #[must_use]
    pub const fn uniform(dpi: f64) -> Self {
        Self::new(dpi, dpi)
    }
}

/// A grayscale source image plus whatever resolution metadata came
/// with it.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pixels: GrayImage,
    resolution: Resolution,
}

impl SourceImage {
    /// Wrap a grayscale image with no resolution metadata.
    #[must_use]
    pub fn new(pixels: GrayImage) -> Self {
        Self {
            pixels,
            resolution: Resolution::default(),
        }
    }

    /// Attach resolution metadata.
    #[must_use]
    pub const fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// The intensity grid.
    #[must_use]
    pub const fn pixels(&self) -> &GrayImage {
        &self.pixels
    }

    /// Resolution metadata.
    #[must_use]
    pub const fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Image dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.pixels.width(),
            height: self.pixels.height(),
        }
    }
}

/// Integer label per cell produced by region separation.
///
/// `0` is unlabeled, `-1` is a flooding boundary, positive values
/// identify regions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMap {
    width: u32,
    height: u32,
    labels: Vec<i32>,
}

impl RegionMap {
    /// Label of cells that belong to no region.
    pub const UNKNOWN: i32 = 0;

    /// Label of cells reached by two or more regions at once.
    pub const BOUNDARY: i32 = -1;

    /// A map with every cell unlabeled.
    #[must_use]
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            labels: vec![Self::UNKNOWN; width as usize * height as usize],
        }
    }

    /// Build a map from row-major labels.
    ///
    /// Returns `None` when the label count does not match the dimensions.
    #[must_use]
    pub fn from_labels(width: u32, height: u32, labels: Vec<i32>) -> Option<Self> {
        (labels.len() == width as usize * height as usize).then_some(Self {
            width,
            height,
            labels,
        })
    }

    /// Width in cells.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in cells.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Label at `(x, y)`. Out-of-range positions read as [`Self::UNKNOWN`].
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> i32 {
        if x >= self.width || y >= self.height {
            return Self::UNKNOWN;
        }
        self.labels[y as usize * self.width as usize + x as usize]
    }

    /// Row-major labels.
    #[must_use]
    pub fn labels(&self) -> &[i32] {
        &self.labels
    }

    /// Distinct positive labels in ascending order.
    #[must_use]
    pub fn region_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.labels.iter().copied().filter(|&l| l > 0).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Number of distinct regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.region_ids().len()
    }

    /// Number of boundary cells.
    #[must_use]
    pub fn boundary_count(&self) -> usize {
        self.labels.iter().filter(|&&l| l == Self::BOUNDARY).count()
    }

    /// Returns `true` when no cell carries a positive label.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.labels.iter().any(|&l| l > 0)
    }

    /// Binary mask of the cells carrying `label`.
    #[must_use]
    pub fn region_mask(&self, label: i32) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            if self.get(x, y) == label {
                image::Luma([FOREGROUND])
            } else {
                image::Luma([BACKGROUND])
            }
        })
    }

    /// Grayscale rendering for previews: boundaries white, regions
    /// spread over mid-gray levels, unlabeled black.
    #[must_use]
    pub fn to_preview(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            let label = self.get(x, y);
            let level = match label {
                Self::BOUNDARY => 255,
                l if l > 0 => {
                    #[allow(clippy::cast_possible_truncation)]
                    let spread = (l.unsigned_abs().wrapping_mul(37) % 160) as u8;
                    40 + spread
                }
                _ => 0,
            };
            image::Luma([level])
        })
    }
}

/// Names of the intermediate rasters kept for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKey {
    /// Input intensities.
    Gray,
    /// After the Gaussian pre-blur.
    Blurred,
    /// Binarizer output.
    Binary,
    /// After opening, small-area removal, and closing.
    Morph,
    /// Dilated foreground used as the confident background bound.
    SureBackground,
    /// Normalized distance map.
    Distance,
    /// Confident seed cores.
    Seeds,
    /// Cells left for flooding to decide.
    Unknown,
    /// Rendered region labels.
    Regions,
}

impl SnapshotKey {
    /// Stable lowercase name, also used for file names.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gray => "gray",
            Self::Blurred => "blurred",
            Self::Binary => "binary",
            Self::Morph => "morph",
            Self::SureBackground => "sure_background",
            Self::Distance => "distance",
            Self::Seeds => "seeds",
            Self::Unknown => "unknown",
            Self::Regions => "regions",
        }
    }
}

impl std::fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one analysis run.
///
/// Built once at the end of a run and never modified afterwards: all
/// fields are private and only readable through accessors.
///
/// Uses custom `Serialize`/`Deserialize` implementations because
/// `GrayImage` and `RgbImage` do not implement serde traits. Raster
/// images are serialized as `(width, height, raw_pixels)` tuples.
#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub(crate) kind: AnalysisKind,
    pub(crate) dimensions: Dimensions,
    pub(crate) visualization: RgbImage,
    pub(crate) measurements: Option<Measurements>,
    pub(crate) features: Vec<FeatureRecord>,
    pub(crate) snapshots: BTreeMap<SnapshotKey, GrayImage>,
    pub(crate) empty: bool,
    pub(crate) message: Option<String>,
    pub(crate) dpi: ResolvedDpi,
    pub(crate) completed: StageId,
}

impl ResultRecord {
    /// Which analysis produced this record.
    #[must_use]
    pub const fn kind(&self) -> AnalysisKind {
        self.kind
    }

    /// Source image dimensions.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Source image with detected features drawn over it.
    #[must_use]
    pub const fn visualization(&self) -> &RgbImage {
        &self.visualization
    }

    /// Final measurements, or `None` when the run stopped early.
    #[must_use]
    pub const fn measurements(&self) -> Option<&Measurements> {
        self.measurements.as_ref()
    }

    /// Surviving features in discovery order.
    #[must_use]
    pub fn features(&self) -> &[FeatureRecord] {
        &self.features
    }

    /// Intermediate rasters keyed by stage.
    #[must_use]
    pub const fn snapshots(&self) -> &BTreeMap<SnapshotKey, GrayImage> {
        &self.snapshots
    }

    /// A single intermediate raster.
    #[must_use]
    pub fn snapshot(&self, key: SnapshotKey) -> Option<&GrayImage> {
        self.snapshots.get(&key)
    }

    /// Whether the run finished with nothing detected.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.empty
    }

    /// Explanation accompanying an empty result.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Resolution used for unit conversion.
    #[must_use]
    pub const fn dpi(&self) -> ResolvedDpi {
        self.dpi
    }

    /// Last stage that ran.
    #[must_use]
    pub const fn completed_stage(&self) -> StageId {
        self.completed
    }
}

/// Serde-compatible proxy for `ResultRecord`.
#[derive(Serialize, Deserialize)]
struct ResultRecordProxy {
    kind: AnalysisKind,
    dimensions: Dimensions,
    visualization: (u32, u32, Vec<u8>),
    measurements: Option<Measurements>,
    features: Vec<FeatureRecord>,
    snapshots: BTreeMap<SnapshotKey, (u32, u32, Vec<u8>)>,
    empty: bool,
    message: Option<String>,
    dpi: ResolvedDpi,
    completed: StageId,
}

impl Serialize for ResultRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let proxy = ResultRecordProxy {
            kind: self.kind,
            dimensions: self.dimensions,
            visualization: (
                self.visualization.width(),
                self.visualization.height(),
                self.visualization.as_raw().clone(),
            ),
            measurements: self.measurements.clone(),
            features: self.features.clone(),
            snapshots: self
                .snapshots
                .iter()
                .map(|(k, img)| (*k, (img.width(), img.height(), img.as_raw().clone())))
                .collect(),
            empty: self.empty,
            message: self.message.clone(),
            dpi: self.dpi,
            completed: self.completed,
        };
        proxy.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ResultRecord {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = ResultRecordProxy::deserialize(deserializer)?;

        let visualization = RgbImage::from_raw(
            proxy.visualization.0,
            proxy.visualization.1,
            proxy.visualization.2,
        )
        .ok_or_else(|| serde::de::Error::custom("invalid visualization image dimensions"))?;

        let mut snapshots = BTreeMap::new();
        for (key, (w, h, raw)) in proxy.snapshots {
            let img = GrayImage::from_raw(w, h, raw).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid {key} snapshot dimensions"))
            })?;
            snapshots.insert(key, img);
        }

        Ok(Self {
            kind: proxy.kind,
            dimensions: proxy.dimensions,
            visualization,
            measurements: proxy.measurements,
            features: proxy.features,
            snapshots,
            empty: proxy.empty,
            message: proxy.message,
            dpi: proxy.dpi,
            completed: proxy.completed,
        })
    }
}

/// Errors that can occur during analysis.
///
/// Only configuration problems and unusable input are errors. Missing
/// DPI and "nothing detected" are ordinary outcomes reported on the
/// [`ResultRecord`].
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum PipelineError {
    /// A parameter is malformed, out of range, mistyped, or missing.
    #[error("invalid parameter `{key}`: {reason}")]
    InvalidParameter {
        /// Dotted parameter key.
        key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A parameter key is not part of the analysis kind's schema.
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),

    /// The source image has zero width or height.
    ///
    /// This is a failed input, like an image that did not decode, and
    /// not a detection outcome: there is no pixel grid to report a
    /// visualization or snapshots for. Any image with at least one pixel
    /// that contains no features yields an empty [`ResultRecord`]
    /// instead.
    #[error("input image is empty")]
    EmptyImage,

    /// The requested stop stage is never reached by this analysis kind.
    #[error("stage `{stage}` does not run for {kind} analysis")]
    StageNotApplicable {
        /// Requested stage.
        stage: StageId,
        /// Analysis kind in use.
        kind: AnalysisKind,
    },
}

impl PipelineError {
    /// Shorthand for [`PipelineError::InvalidParameter`].
    pub(crate) fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
