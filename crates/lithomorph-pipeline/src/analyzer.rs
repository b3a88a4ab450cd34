//! Analysis kinds: parameter schemas, measurements, and unit
//! post-processing.
//!
//! Fracture, pore, and grain analysis share one pipeline; this module
//! holds everything that differs between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::binarize::METHOD_NAMES;
use crate::contour::{FeatureRecord, LengthMeasure};
use crate::morphology::SHAPE_NAMES;
use crate::params::{AnalysisParameters, Constraint, ParamDefault, ParamSpec, keys};
use crate::types::Dimensions;
use crate::units::UnitConverter;

/// Which features an analysis looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    /// Thin, elongated cracks.
    Fracture,
    /// Voids, reported with porosity.
    Pore,
    /// Mineral grains, reported with area fraction and size.
    Grain,
}

impl AnalysisKind {
    /// Every kind, in a stable order.
    pub const ALL: [Self; 3] = [Self::Fracture, Self::Pore, Self::Grain];

    /// Stable identifier.
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Fracture => "fracture",
            Self::Pore => "pore",
            Self::Grain => "grain",
        }
    }

    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fracture => "Fracture analysis",
            Self::Pore => "Pore analysis",
            Self::Grain => "Grain analysis",
        }
    }

    /// Every parameter this kind accepts.
    #[must_use]
    pub const fn schema(self) -> &'static [ParamSpec] {
        match self {
            Self::Fracture => FRACTURE_SCHEMA,
            Self::Pore | Self::Grain => REGION_SCHEMA,
        }
    }

    /// A complete parameter set filled with schema defaults.
    #[must_use]
    pub fn default_parameters(self) -> AnalysisParameters {
        AnalysisParameters::from_schema(self.schema())
    }

    /// How feature length is measured.
    #[must_use]
    pub const fn length_measure(self) -> LengthMeasure {
        match self {
            Self::Fracture => LengthMeasure::Skeleton,
            Self::Pore | Self::Grain => LengthMeasure::RectLongSide,
        }
    }

    /// Whether touching features are split by region separation.
    #[must_use]
    pub const fn separates_regions(self) -> bool {
        matches!(self, Self::Pore | Self::Grain)
    }

    /// Whether close fragments may be merged.
    #[must_use]
    pub const fn merges_fragments(self) -> bool {
        matches!(self, Self::Fracture)
    }

    /// Pixel-unit measurements of the surviving features.
    #[must_use]
    pub fn measure(self, features: &[FeatureRecord], dimensions: Dimensions) -> Measurements {
        let details: Vec<FeatureMeasurement> = features.iter().map(FeatureMeasurement::from).collect();
        let count = details.len();
        let total_area_px: f64 = details.iter().map(|d| d.area_px).sum();
        #[allow(clippy::cast_precision_loss)]
        let image_area = dimensions.pixel_count() as f64;
        let fraction = if image_area > 0.0 {
            total_area_px / image_area
        } else {
            0.0
        };

        match self {
            Self::Fracture => Measurements::Fracture {
                count,
                total_area_px,
                total_length_px: details.iter().map(|d| d.length_px).sum(),
                total_area_mm2: None,
                total_length_mm: None,
                details,
            },
            Self::Pore => Measurements::Pore {
                count,
                total_area_px,
                porosity: fraction,
                total_area_mm2: None,
                details,
            },
            Self::Grain => {
                #[allow(clippy::cast_precision_loss)]
                let mean_equivalent_diameter_px = if count == 0 {
                    0.0
                } else {
                    details.iter().map(|d| d.equivalent_diameter_px).sum::<f64>() / count as f64
                };
                Measurements::Grain {
                    count,
                    total_area_px,
                    area_fraction: fraction,
                    mean_equivalent_diameter_px,
                    total_area_mm2: None,
                    mean_equivalent_diameter_mm: None,
                    details,
                }
            }
        }
    }

    /// Whether the measurements describe "nothing detected".
    #[must_use]
    pub const fn is_result_empty(self, measurements: &Measurements) -> bool {
        measurements.count() == 0
    }

    /// Message attached to an empty result.
    #[must_use]
    pub const fn empty_message(self) -> &'static str {
        match self {
            Self::Fracture => "no valid fractures detected",
            Self::Pore => "no valid pores detected",
            Self::Grain => "no valid grains detected",
        }
    }

    /// Fill in the millimetre fields.
    #[must_use = "returns the converted measurements"]
    pub fn post_process(self, measurements: Measurements, units: &UnitConverter) -> Measurements {
        let convert = |details: Vec<FeatureMeasurement>| -> Vec<FeatureMeasurement> {
            details
                .into_iter()
                .map(|d| FeatureMeasurement {
                    area_mm2: Some(units.area_px_to_mm2(d.area_px)),
                    length_mm: Some(units.px_to_mm(d.length_px)),
                    equivalent_diameter_mm: Some(units.px_to_mm(d.equivalent_diameter_px)),
                    ..d
                })
                .collect()
        };

        match measurements {
            Measurements::Fracture {
                count,
                total_area_px,
                total_length_px,
                details,
                ..
            } => Measurements::Fracture {
                count,
                total_area_px,
                total_length_px,
                total_area_mm2: Some(units.area_px_to_mm2(total_area_px)),
                total_length_mm: Some(units.px_to_mm(total_length_px)),
                details: convert(details),
            },
            Measurements::Pore {
                count,
                total_area_px,
                porosity,
                details,
                ..
            } => Measurements::Pore {
                count,
                total_area_px,
                porosity,
                total_area_mm2: Some(units.area_px_to_mm2(total_area_px)),
                details: convert(details),
            },
            Measurements::Grain {
                count,
                total_area_px,
                area_fraction,
                mean_equivalent_diameter_px,
                details,
                ..
            } => Measurements::Grain {
                count,
                total_area_px,
                area_fraction,
                mean_equivalent_diameter_px,
                total_area_mm2: Some(units.area_px_to_mm2(total_area_px)),
                mean_equivalent_diameter_mm: Some(units.px_to_mm(mean_equivalent_diameter_px)),
                details: convert(details),
            },
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for AnalysisKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.id() == s)
            .ok_or_else(|| format!("unknown analysis kind `{s}` (expected fracture, pore, or grain)"))
    }
}

/// Per-feature measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMeasurement {
    /// Area, px².
    pub area_px: f64,
    /// Length, px.
    pub length_px: f64,
    /// Perimeter, px.
    pub perimeter_px: f64,
    /// Long over short side of the rotated rectangle.
    pub aspect_ratio: f64,
    /// Orientation, degrees in `[0, 180)`.
    pub angle_deg: f64,
    /// Area over convex hull area.
    pub solidity: f64,
    /// Equal-area circle diameter, px.
    pub equivalent_diameter_px: f64,
    /// Area, mm², once converted.
    pub area_mm2: Option<f64>,
    /// Length, mm, once converted.
    pub length_mm: Option<f64>,
    /// Equal-area circle diameter, mm, once converted.
    pub equivalent_diameter_mm: Option<f64>,
}

impl From<&FeatureRecord> for FeatureMeasurement {
    fn from(f: &FeatureRecord) -> Self {
        Self {
            area_px: f.area,
            length_px: f.length,
            perimeter_px: f.perimeter,
            aspect_ratio: f.aspect_ratio,
            angle_deg: f.angle_deg,
            solidity: f.solidity,
            equivalent_diameter_px: f.equivalent_diameter,
            area_mm2: None,
            length_mm: None,
            equivalent_diameter_mm: None,
        }
    }
}

/// Summary statistics of one run.
///
/// Millimetre fields are `None` until [`AnalysisKind::post_process`]
/// fills them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Measurements {
    /// Fracture totals.
    Fracture {
        /// Surviving fractures.
        count: usize,
        /// Sum of areas, px².
        total_area_px: f64,
        /// Sum of skeleton lengths, px.
        total_length_px: f64,
        /// Sum of areas, mm².
        total_area_mm2: Option<f64>,
        /// Sum of skeleton lengths, mm.
        total_length_mm: Option<f64>,
        /// Per-fracture values.
        details: Vec<FeatureMeasurement>,
    },
    /// Pore totals.
    Pore {
        /// Surviving pores.
        count: usize,
        /// Sum of areas, px².
        total_area_px: f64,
        /// Total pore area over image area.
        porosity: f64,
        /// Sum of areas, mm².
        total_area_mm2: Option<f64>,
        /// Per-pore values.
        details: Vec<FeatureMeasurement>,
    },
    /// Grain totals.
    Grain {
        /// Surviving grains.
        count: usize,
        /// Sum of areas, px².
        total_area_px: f64,
        /// Total grain area over image area.
        area_fraction: f64,
        /// Mean equal-area diameter, px.
        mean_equivalent_diameter_px: f64,
        /// Sum of areas, mm².
        total_area_mm2: Option<f64>,
        /// Mean equal-area diameter, mm.
        mean_equivalent_diameter_mm: Option<f64>,
        /// Per-grain values.
        details: Vec<FeatureMeasurement>,
    },
}

impl Measurements {
    /// Number of surviving features.
    #[must_use]
    pub const fn count(&self) -> usize {
        match self {
            Self::Fracture { count, .. } | Self::Pore { count, .. } | Self::Grain { count, .. } => {
                *count
            }
        }
    }

    /// Sum of feature areas, px².
    #[must_use]
    pub const fn total_area_px(&self) -> f64 {
        match self {
            Self::Fracture { total_area_px, .. }
            | Self::Pore { total_area_px, .. }
            | Self::Grain { total_area_px, .. } => *total_area_px,
        }
    }

    /// Per-feature values.
    #[must_use]
    pub fn details(&self) -> &[FeatureMeasurement] {
        match self {
            Self::Fracture { details, .. }
            | Self::Pore { details, .. }
            | Self::Grain { details, .. } => details,
        }
    }
}

// ───────────────────────────── Schemas ─────────────────────────────

const fn spec(
    key: &'static str,
    default: ParamDefault,
    realtime: bool,
    constraint: Constraint,
    description: &'static str,
) -> ParamSpec {
    ParamSpec {
        key,
        default,
        realtime,
        constraint,
        description,
    }
}

const fn range(min: f64, max: f64) -> Constraint {
    Constraint::Range { min, max }
}

const fn odd(min: i64, max: i64) -> Constraint {
    Constraint::OddRange { min, max }
}

/// Entries every kind shares: pre-blur, thresholding, and morphology.
macro_rules! schema {
    (
        blur: $blur:expr,
        method: $method:expr,
        opening: $open:expr,
        min_area: $min_area:expr,
        closing: $close:expr,
        $($extra:expr),* $(,)?
    ) => {
        &[
            spec(keys::BLUR_SIGMA, ParamDefault::Float($blur), true, range(0.0, 10.0),
                "Gaussian pre-blur sigma, 0 disables"),
            spec(keys::THRESHOLD_METHOD, ParamDefault::Text($method), true,
                Constraint::OneOf(METHOD_NAMES), "Binarization method"),
            spec(keys::THRESHOLD_VALUE, ParamDefault::Int(128), true, range(0.0, 255.0),
                "Global threshold"),
            spec(keys::THRESHOLD_BLOCK_SIZE, ParamDefault::Int(51), true, odd(3, 101),
                "Adaptive Gaussian block size"),
            spec(keys::THRESHOLD_C, ParamDefault::Float(2.0), true, range(-50.0, 50.0),
                "Adaptive Gaussian offset"),
            spec(keys::THRESHOLD_WINDOW_SIZE, ParamDefault::Int(51), true, odd(3, 101),
                "Niblack/Sauvola window size"),
            spec(keys::THRESHOLD_K, ParamDefault::Float(0.2), true, range(-2.0, 2.0),
                "Niblack/Sauvola k"),
            spec(keys::THRESHOLD_R, ParamDefault::Float(128.0), true, range(1.0, 255.0),
                "Sauvola dynamic range"),
            spec(keys::THRESHOLD_INVERT, ParamDefault::Bool(true), true, Constraint::Any,
                "Treat dark pixels as foreground"),
            spec(keys::OPEN_ENABLED, ParamDefault::Bool($open), true, Constraint::Any,
                "Run opening"),
            spec(keys::OPEN_SHAPE, ParamDefault::Text("rect"), true,
                Constraint::OneOf(SHAPE_NAMES), "Opening kernel shape"),
            spec(keys::OPEN_KERNEL_SIZE, ParamDefault::Int(3), true, odd(1, 31),
                "Opening kernel size"),
            spec(keys::OPEN_ITERATIONS, ParamDefault::Int(2), true, range(1.0, 10.0),
                "Opening iterations"),
            spec(keys::MIN_COMPONENT_AREA, ParamDefault::Int($min_area), true,
                range(0.0, 1.0e6), "Drop components smaller than this after opening, px"),
            spec(keys::CLOSE_ENABLED, ParamDefault::Bool($close), true, Constraint::Any,
                "Run closing"),
            spec(keys::CLOSE_SHAPE, ParamDefault::Text("rect"), true,
                Constraint::OneOf(SHAPE_NAMES), "Closing kernel shape"),
            spec(keys::CLOSE_KERNEL_SIZE, ParamDefault::Int(3), true, odd(1, 31),
                "Closing kernel size"),
            spec(keys::CLOSE_ITERATIONS, ParamDefault::Int(1), true, range(1.0, 10.0),
                "Closing iterations"),
            $($extra),*
        ]
    };
}

static FRACTURE_SCHEMA: &[ParamSpec] = schema!(
    blur: 1.1,
    method: "sauvola",
    opening: true,
    min_area: 10,
    closing: true,
    spec(keys::FILTER_MIN_LENGTH, ParamDefault::Float(10.0), false, range(0.0, 1.0e6),
        "Minimum skeleton length, px"),
    spec(keys::FILTER_MIN_ASPECT_RATIO, ParamDefault::Float(5.0), false, range(1.0, 1.0e4),
        "Minimum aspect ratio"),
    spec(keys::MERGE_ENABLED, ParamDefault::Bool(false), false, Constraint::Any,
        "Merge nearby collinear fragments"),
    spec(keys::MERGE_MAX_DISTANCE_MM, ParamDefault::Float(2.0), false, range(0.0, 100.0),
        "Largest gap bridged, mm"),
    spec(keys::MERGE_MAX_ANGLE, ParamDefault::Float(15.0), false, range(0.0, 90.0),
        "Largest orientation difference, degrees"),
);

static REGION_SCHEMA: &[ParamSpec] = schema!(
    blur: 1.4,
    method: "otsu",
    opening: false,
    min_area: 0,
    closing: false,
    spec(keys::SEPARATION_ENABLED, ParamDefault::Bool(true), false, Constraint::Any,
        "Split touching regions"),
    spec(keys::SEPARATION_OPEN_KERNEL_SIZE, ParamDefault::Int(3), false, odd(1, 31),
        "Noise opening kernel size"),
    spec(keys::SEPARATION_OPEN_ITERATIONS, ParamDefault::Int(2), false, range(1.0, 10.0),
        "Noise opening iterations"),
    spec(keys::SEPARATION_BACKGROUND_KERNEL_SIZE, ParamDefault::Int(3), false, odd(1, 31),
        "Background dilation kernel size"),
    spec(keys::SEPARATION_BACKGROUND_ITERATIONS, ParamDefault::Int(1), false, range(1.0, 10.0),
        "Background dilation iterations"),
    spec(keys::SEPARATION_SEED_FRACTION, ParamDefault::Float(0.6), false, range(0.01, 0.99),
        "Seed cutoff as a fraction of the largest distance"),
    spec(keys::SEPARATION_SEED_DISTANCE, ParamDefault::Float(0.0), false, range(0.0, 1.0e4),
        "Fixed seed cutoff in px, 0 uses the fraction"),
    spec(keys::FILTER_MIN_AREA, ParamDefault::Float(20.0), false, range(0.0, 1.0e9),
        "Minimum area, px²"),
    spec(keys::FILTER_MIN_SOLIDITY, ParamDefault::Float(0.85), false, range(0.0, 1.0),
        "Minimum solidity"),
);
