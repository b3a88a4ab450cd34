//! Typed analysis parameters and the static schema they are checked
//! against.
//!
//! Parameters travel as a flat map of dotted keys (`threshold.method`,
//! `morphology.open_iterations`, ...) to [`ParamValue`]s. Each analysis
//! kind publishes a `&'static [ParamSpec]` describing every key it
//! accepts: its default, its validity constraint, and whether a caller
//! may re-run the pipeline on every change ("realtime"). The core
//! validates against the schema but never acts on the realtime hint.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// Dotted parameter keys shared by every analysis kind.
pub mod keys {
    /// Gaussian pre-blur sigma (`0` disables).
    pub const BLUR_SIGMA: &str = "preprocess.blur_sigma";

    /// Binarization method name.
    pub const THRESHOLD_METHOD: &str = "threshold.method";
    /// Global threshold `T`.
    pub const THRESHOLD_VALUE: &str = "threshold.value";
    /// Adaptive Gaussian block size.
    pub const THRESHOLD_BLOCK_SIZE: &str = "threshold.block_size";
    /// Adaptive Gaussian offset `C`.
    pub const THRESHOLD_C: &str = "threshold.c";
    /// Niblack / Sauvola window size.
    pub const THRESHOLD_WINDOW_SIZE: &str = "threshold.window_size";
    /// Niblack / Sauvola `k`.
    pub const THRESHOLD_K: &str = "threshold.k";
    /// Sauvola dynamic range `r`.
    pub const THRESHOLD_R: &str = "threshold.r";
    /// Treat dark pixels as foreground.
    pub const THRESHOLD_INVERT: &str = "threshold.invert";

    /// Opening on/off.
    pub const OPEN_ENABLED: &str = "morphology.open_enabled";
    /// Opening kernel shape.
    pub const OPEN_SHAPE: &str = "morphology.open_shape";
    /// Opening kernel size.
    pub const OPEN_KERNEL_SIZE: &str = "morphology.open_kernel_size";
    /// Opening iterations.
    pub const OPEN_ITERATIONS: &str = "morphology.open_iterations";
    /// Minimum component area kept after opening (`0` disables).
    pub const MIN_COMPONENT_AREA: &str = "morphology.min_area";
    /// Closing on/off.
    pub const CLOSE_ENABLED: &str = "morphology.close_enabled";
    /// Closing kernel shape.
    pub const CLOSE_SHAPE: &str = "morphology.close_shape";
    /// Closing kernel size.
    pub const CLOSE_KERNEL_SIZE: &str = "morphology.close_kernel_size";
    /// Closing iterations.
    pub const CLOSE_ITERATIONS: &str = "morphology.close_iterations";

    /// Region separation on/off.
    pub const SEPARATION_ENABLED: &str = "separation.enabled";
    /// Noise-removal opening kernel size.
    pub const SEPARATION_OPEN_KERNEL_SIZE: &str = "separation.open_kernel_size";
    /// Noise-removal opening iterations.
    pub const SEPARATION_OPEN_ITERATIONS: &str = "separation.open_iterations";
    /// Confident-background dilation kernel size.
    pub const SEPARATION_BACKGROUND_KERNEL_SIZE: &str = "separation.background_kernel_size";
    /// Confident-background dilation iterations.
    pub const SEPARATION_BACKGROUND_ITERATIONS: &str = "separation.background_iterations";
    /// Seed threshold as a fraction of the maximum distance.
    pub const SEPARATION_SEED_FRACTION: &str = "separation.seed_fraction";
    /// Fixed seed threshold in pixels (`0` uses the fraction).
    pub const SEPARATION_SEED_DISTANCE: &str = "separation.seed_distance";

    /// Fracture minimum skeleton length (pixels).
    pub const FILTER_MIN_LENGTH: &str = "filtering.min_length";
    /// Fracture minimum aspect ratio.
    pub const FILTER_MIN_ASPECT_RATIO: &str = "filtering.min_aspect_ratio";
    /// Pore / grain minimum area (pixels²).
    pub const FILTER_MIN_AREA: &str = "filtering.min_area";
    /// Pore / grain minimum solidity.
    pub const FILTER_MIN_SOLIDITY: &str = "filtering.min_solidity";

    /// Fragment merging on/off.
    pub const MERGE_ENABLED: &str = "merging.enabled";
    /// Maximum gap between merged fragments (millimetres).
    pub const MERGE_MAX_DISTANCE_MM: &str = "merging.max_distance_mm";
    /// Maximum orientation difference between merged fragments (degrees).
    pub const MERGE_MAX_ANGLE: &str = "merging.max_angle_deg";
}

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean switch.
    Bool(bool),
    /// Integer (sizes, counts, thresholds).
    Int(i64),
    /// Real number.
    Float(f64),
    /// Enumerated name.
    Text(String),
}

impl ParamValue {
    /// Name of the value's type, for error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
        }
    }

    /// Numeric view; integers widen to `f64`.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Int(i) => Some(i as f64),
            Self::Float(f) => Some(f),
            Self::Bool(_) | Self::Text(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Compile-time default of a schema entry.
///
/// Mirrors [`ParamValue`] with a `&'static str` so schemas can live in
/// `static` arrays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamDefault {
    /// Boolean default.
    Bool(bool),
    /// Integer default.
    Int(i64),
    /// Real default.
    Float(f64),
    /// Enumerated default.
    Text(&'static str),
}

impl ParamDefault {
    /// Owned runtime value.
    #[must_use]
    pub fn to_value(self) -> ParamValue {
        match self {
            Self::Bool(b) => ParamValue::Bool(b),
            Self::Int(i) => ParamValue::Int(i),
            Self::Float(f) => ParamValue::Float(f),
            Self::Text(s) => ParamValue::Text(s.to_string()),
        }
    }
}

/// Validity constraint of a schema entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constraint {
    /// Any value of the right type.
    Any,
    /// Inclusive numeric range.
    Range {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
    /// Odd integer within an inclusive range (kernel and window sizes).
    OddRange {
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },
    /// One of a fixed set of names.
    OneOf(&'static [&'static str]),
}

/// Declarative description of one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    /// Dotted key.
    pub key: &'static str,
    /// Default value; also fixes the parameter's type.
    pub default: ParamDefault,
    /// Whether callers may recompute on every change.
    pub realtime: bool,
    /// Validity constraint.
    pub constraint: Constraint,
    /// One-line description for help output.
    pub description: &'static str,
}

impl ParamSpec {
    /// Check a value against this entry's type and constraint.
    ///
    /// Integers are accepted where a float is declared.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] on a type mismatch or
    /// constraint violation.
    pub fn check(&self, value: &ParamValue) -> Result<(), PipelineError> {
        let type_ok = matches!(
            (self.default, value),
            (ParamDefault::Bool(_), ParamValue::Bool(_))
                | (ParamDefault::Int(_), ParamValue::Int(_))
                | (ParamDefault::Float(_), ParamValue::Float(_) | ParamValue::Int(_))
                | (ParamDefault::Text(_), ParamValue::Text(_))
        );
        if !type_ok {
            return Err(PipelineError::invalid(
                self.key,
                format!(
                    "expected {}, got {} `{value}`",
                    self.default.to_value().type_name(),
                    value.type_name()
                ),
            ));
        }

        match (self.constraint, value) {
            (Constraint::Range { min, max }, v) => {
                let x = v.as_f64().unwrap_or(f64::NAN);
                if !x.is_finite() || x < min || x > max {
                    return Err(PipelineError::invalid(
                        self.key,
                        format!("{value} is outside [{min}, {max}]"),
                    ));
                }
            }
            (Constraint::OddRange { min, max }, ParamValue::Int(i)) => {
                if i % 2 == 0 {
                    return Err(PipelineError::invalid(
                        self.key,
                        format!("{i} must be odd"),
                    ));
                }
                if *i < min || *i > max {
                    return Err(PipelineError::invalid(
                        self.key,
                        format!("{i} is outside [{min}, {max}]"),
                    ));
                }
            }
            (Constraint::OneOf(names), ParamValue::Text(s)) => {
                if !names.contains(&s.as_str()) {
                    return Err(PipelineError::invalid(
                        self.key,
                        format!("`{s}` is not one of: {}", names.join(", ")),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Parse a command-line style string into a value of this entry's
    /// type, then check it.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if the text does not
    /// parse or the parsed value violates the constraint.
    pub fn parse(&self, raw: &str) -> Result<ParamValue, PipelineError> {
        let raw = raw.trim();
        let value = match self.default {
            ParamDefault::Bool(_) => match raw {
                "true" | "on" | "yes" | "1" => ParamValue::Bool(true),
                "false" | "off" | "no" | "0" => ParamValue::Bool(false),
                _ => {
                    return Err(PipelineError::invalid(
                        self.key,
                        format!("`{raw}` is not a boolean"),
                    ));
                }
            },
            ParamDefault::Int(_) => raw.parse::<i64>().map(ParamValue::Int).map_err(|e| {
                PipelineError::invalid(self.key, format!("`{raw}` is not an integer: {e}"))
            })?,
            ParamDefault::Float(_) => raw.parse::<f64>().map(ParamValue::Float).map_err(|e| {
                PipelineError::invalid(self.key, format!("`{raw}` is not a number: {e}"))
            })?,
            ParamDefault::Text(_) => ParamValue::Text(raw.to_string()),
        };
        self.check(&value)?;
        Ok(value)
    }
}

/// Look up a key in a schema.
#[must_use]
pub fn find_spec<'a>(schema: &'a [ParamSpec], key: &str) -> Option<&'a ParamSpec> {
    schema.iter().find(|s| s.key == key)
}

/// A parameter set for one analysis run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisParameters {
    values: BTreeMap<String, ParamValue>,
}

impl AnalysisParameters {
    /// An empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key of `schema` at its default.
    #[must_use]
    pub fn from_schema(schema: &[ParamSpec]) -> Self {
        Self {
            values: schema
                .iter()
                .map(|s| (s.key.to_string(), s.default.to_value()))
                .collect(),
        }
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Insert or replace a value, returning the previous one.
    pub fn insert(&mut self, key: &str, value: impl Into<ParamValue>) -> Option<ParamValue> {
        self.values.insert(key.to_string(), value.into())
    }

    /// Remove a key.
    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        self.values.remove(key)
    }

    /// Raw value of a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    /// Iterate over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of keys present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if no keys are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse and set a `key=value` override against `schema`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownParameter`] if `key` is not in
    /// `schema`, or [`PipelineError::InvalidParameter`] if the value does
    /// not parse or violates its constraint.
    pub fn set_from_str(
        &mut self,
        schema: &[ParamSpec],
        key: &str,
        raw: &str,
    ) -> Result<(), PipelineError> {
        let spec =
            find_spec(schema, key).ok_or_else(|| PipelineError::UnknownParameter(key.to_string()))?;
        let value = spec.parse(raw)?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Check every key against `schema`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::UnknownParameter`] for a key not in `schema`.
    /// - [`PipelineError::InvalidParameter`] for a missing key, a type
    ///   mismatch, or a constraint violation.
    pub fn validate(&self, schema: &[ParamSpec]) -> Result<(), PipelineError> {
        if let Some(key) = self.values.keys().find(|k| find_spec(schema, k).is_none()) {
            return Err(PipelineError::UnknownParameter(key.clone()));
        }
        for spec in schema {
            let value = self
                .values
                .get(spec.key)
                .ok_or_else(|| PipelineError::invalid(spec.key, "missing required parameter"))?;
            spec.check(value)?;
        }
        Ok(())
    }

    fn require(&self, key: &str) -> Result<&ParamValue, PipelineError> {
        self.values
            .get(key)
            .ok_or_else(|| PipelineError::invalid(key, "missing required parameter"))
    }

    fn mistyped(key: &str, expected: &str, value: &ParamValue) -> PipelineError {
        PipelineError::invalid(
            key,
            format!("expected {expected}, got {} `{value}`", value.type_name()),
        )
    }

    /// Real-valued parameter. Integers widen.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if missing or not numeric.
    pub fn float(&self, key: &str) -> Result<f64, PipelineError> {
        let value = self.require(key)?;
        value
            .as_f64()
            .ok_or_else(|| Self::mistyped(key, "float", value))
    }

    /// Integer parameter.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if missing or not an
    /// integer.
    pub fn int(&self, key: &str) -> Result<i64, PipelineError> {
        match self.require(key)? {
            ParamValue::Int(i) => Ok(*i),
            other => Err(Self::mistyped(key, "int", other)),
        }
    }

    /// Non-negative integer parameter narrowed to `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if missing, not an
    /// integer, negative, or too large.
    pub fn count(&self, key: &str) -> Result<u32, PipelineError> {
        let i = self.int(key)?;
        u32::try_from(i)
            .map_err(|_| PipelineError::invalid(key, format!("{i} must be a non-negative count")))
    }

    /// Boolean parameter.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if missing or not a bool.
    pub fn flag(&self, key: &str) -> Result<bool, PipelineError> {
        match self.require(key)? {
            ParamValue::Bool(b) => Ok(*b),
            other => Err(Self::mistyped(key, "bool", other)),
        }
    }

    /// Enumerated parameter.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if missing or not text.
    pub fn text(&self, key: &str) -> Result<&str, PipelineError> {
        match self.require(key)? {
            ParamValue::Text(s) => Ok(s),
            other => Err(Self::mistyped(key, "text", other)),
        }
    }
}
