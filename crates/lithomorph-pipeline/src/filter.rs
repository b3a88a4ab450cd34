//! Geometric feature filtering.
//!
//! A filter is a plain conjunction of threshold predicates. Features
//! keep their discovery order; only rejected ones drop out.

use std::fmt;

use crate::analyzer::AnalysisKind;
use crate::contour::FeatureRecord;
use crate::params::{AnalysisParameters, keys};
use crate::types::PipelineError;

/// One lower-bound test on a feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeaturePredicate {
    /// `length ≥ value`.
    MinLength(f64),
    /// `aspect_ratio ≥ value`.
    MinAspectRatio(f64),
    /// `area ≥ value`.
    MinArea(f64),
    /// `solidity ≥ value`.
    MinSolidity(f64),
}

impl FeaturePredicate {
    /// Whether `feature` passes this test.
    #[must_use]
    pub fn accepts(self, feature: &FeatureRecord) -> bool {
        match self {
            Self::MinLength(v) => feature.length >= v,
            Self::MinAspectRatio(v) => feature.aspect_ratio >= v,
            Self::MinArea(v) => feature.area >= v,
            Self::MinSolidity(v) => feature.solidity >= v,
        }
    }
}

impl fmt::Display for FeaturePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinLength(v) => write!(f, "length >= {v}"),
            Self::MinAspectRatio(v) => write!(f, "aspect_ratio >= {v}"),
            Self::MinArea(v) => write!(f, "area >= {v}"),
            Self::MinSolidity(v) => write!(f, "solidity >= {v}"),
        }
    }
}

/// Filter stage configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterConfig {
    /// All must hold.
    pub predicates: Vec<FeaturePredicate>,
}

impl FilterConfig {
    /// Predicates used for the given analysis kind.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] for a missing or
    /// negative threshold.
    pub fn from_params(
        kind: AnalysisKind,
        params: &AnalysisParameters,
    ) -> Result<Self, PipelineError> {
        let non_negative = |key: &str| -> Result<f64, PipelineError> {
            let v = params.float(key)?;
            if v < 0.0 {
                return Err(PipelineError::invalid(key, format!("{v} is negative")));
            }
            Ok(v)
        };
        let predicates = match kind {
            AnalysisKind::Fracture => vec![
                FeaturePredicate::MinLength(non_negative(keys::FILTER_MIN_LENGTH)?),
                FeaturePredicate::MinAspectRatio(non_negative(keys::FILTER_MIN_ASPECT_RATIO)?),
            ],
            AnalysisKind::Pore | AnalysisKind::Grain => vec![
                FeaturePredicate::MinArea(non_negative(keys::FILTER_MIN_AREA)?),
                FeaturePredicate::MinSolidity(non_negative(keys::FILTER_MIN_SOLIDITY)?),
            ],
        };
        Ok(Self { predicates })
    }

    /// Whether `feature` has positive area and passes every predicate.
    #[must_use]
    pub fn accepts(&self, feature: &FeatureRecord) -> bool {
        feature.area > 0.0 && self.predicates.iter().all(|p| p.accepts(feature))
    }

    /// Keep accepted features, preserving order.
    #[must_use = "returns the surviving features"]
    pub fn apply(&self, features: Vec<FeatureRecord>) -> Vec<FeatureRecord> {
        let before = features.len();
        let kept: Vec<_> = features.into_iter().filter(|f| self.accepts(f)).collect();
        log::debug!("filter: kept {} of {before} features", kept.len());
        kept
    }
}
