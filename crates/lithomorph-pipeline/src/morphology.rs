//! Binary morphology: erosion, dilation, opening, closing, and
//! small-component removal.
//!
//! Pixels outside the image are background, so erosion eats in from
//! the image border and dilation never reads past it. Under that rule
//! opening is exactly idempotent for the symmetric kernels built here.

use std::fmt;

use image::GrayImage;
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::{Deserialize, Serialize};

use crate::params::{AnalysisParameters, keys};
use crate::types::{BACKGROUND, FOREGROUND, PipelineError, is_foreground};

/// Names accepted by the `*_shape` parameters.
pub const SHAPE_NAMES: &[&str] = &["rect", "ellipse", "cross"];

/// Shape of a structuring kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelShape {
    /// Full square.
    #[default]
    Rect,
    /// Inscribed ellipse, rasterized the way OpenCV does.
    Ellipse,
    /// Center row plus center column.
    Cross,
}

impl KernelShape {
    /// Stable lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Rect => "rect",
            Self::Ellipse => "ellipse",
            Self::Cross => "cross",
        }
    }

    /// Parse a shape name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rect" => Some(Self::Rect),
            "ellipse" => Some(Self::Ellipse),
            "cross" => Some(Self::Cross),
            _ => None,
        }
    }
}

impl fmt::Display for KernelShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A square, odd-sized structuring kernel stored as active offsets
/// relative to its center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuringElement {
    shape: KernelShape,
    size: u32,
    offsets: Vec<(i32, i32)>,
}

impl StructuringElement {
    /// Build a `size × size` kernel.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] (key `kernel_size`)
    /// if `size` is even or zero.
    pub fn new(shape: KernelShape, size: u32) -> Result<Self, PipelineError> {
        Self::for_key(shape, size, "kernel_size")
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn for_key(shape: KernelShape, size: u32, key: &str) -> Result<Self, PipelineError> {
        if size == 0 || size % 2 == 0 {
            return Err(PipelineError::invalid(
                key,
                format!("kernel size {size} must be odd and at least 1"),
            ));
        }
        let r = i32::try_from(size / 2)
            .map_err(|_| PipelineError::invalid(key, format!("kernel size {size} is too large")))?;

        let mut offsets = Vec::new();
        for dy in -r..=r {
            let (lo, hi) = match shape {
                KernelShape::Rect => (-r, r),
                KernelShape::Cross if dy == 0 => (-r, r),
                KernelShape::Cross => (0, 0),
                KernelShape::Ellipse => {
                    let half_width = if r == 0 {
                        0
                    } else {
                        let rf = f64::from(r);
                        let dyf = f64::from(dy);
                        (rf * (rf.mul_add(rf, -(dyf * dyf)) / (rf * rf)).sqrt()).round() as i32
                    };
                    (-half_width, half_width)
                }
            };
            offsets.extend((lo..=hi).map(|dx| (dx, dy)));
        }

        Ok(Self {
            shape,
            size,
            offsets,
        })
    }

    /// Kernel shape.
    #[must_use]
    pub const fn shape(&self) -> KernelShape {
        self.shape
    }

    /// Side length.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Active `(dx, dy)` offsets.
    #[must_use]
    pub fn offsets(&self) -> &[(i32, i32)] {
        &self.offsets
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn single_erode(mask: &GrayImage, se: &StructuringElement) -> GrayImage {
    let (w, h) = (i64::from(mask.width()), i64::from(mask.height()));
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let keep = se.offsets.iter().all(|&(dx, dy)| {
            let nx = i64::from(x) + i64::from(dx);
            let ny = i64::from(y) + i64::from(dy);
            nx >= 0
                && ny >= 0
                && nx < w
                && ny < h
                && is_foreground(mask.get_pixel(nx as u32, ny as u32).0[0])
        });
        image::Luma([if keep { FOREGROUND } else { BACKGROUND }])
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn single_dilate(mask: &GrayImage, se: &StructuringElement) -> GrayImage {
    let (w, h) = (i64::from(mask.width()), i64::from(mask.height()));
    let mut out = GrayImage::new(mask.width(), mask.height());
    for (x, y, p) in mask.enumerate_pixels() {
        if !is_foreground(p.0[0]) {
            continue;
        }
        for &(dx, dy) in &se.offsets {
            let nx = i64::from(x) + i64::from(dx);
            let ny = i64::from(y) + i64::from(dy);
            if nx >= 0 && ny >= 0 && nx < w && ny < h {
                out.put_pixel(nx as u32, ny as u32, image::Luma([FOREGROUND]));
            }
        }
    }
    out
}

/// Erode `iterations` times.
#[must_use = "returns the eroded mask"]
pub fn erode(mask: &GrayImage, se: &StructuringElement, iterations: u32) -> GrayImage {
    let mut out = normalize(mask);
    for _ in 0..iterations {
        out = single_erode(&out, se);
    }
    out
}

/// Dilate `iterations` times.
#[must_use = "returns the dilated mask"]
pub fn dilate(mask: &GrayImage, se: &StructuringElement, iterations: u32) -> GrayImage {
    let mut out = normalize(mask);
    for _ in 0..iterations {
        out = single_dilate(&out, se);
    }
    out
}

/// Opening: `iterations` erosions followed by `iterations` dilations.
#[must_use = "returns the opened mask"]
pub fn open(mask: &GrayImage, se: &StructuringElement, iterations: u32) -> GrayImage {
    dilate(&erode(mask, se, iterations), se, iterations)
}

/// Closing: `iterations` dilations followed by `iterations` erosions.
#[must_use = "returns the closed mask"]
pub fn close(mask: &GrayImage, se: &StructuringElement, iterations: u32) -> GrayImage {
    erode(&dilate(mask, se, iterations), se, iterations)
}

/// Drop 8-connected foreground components with fewer than `min_area`
/// pixels. `min_area == 0` keeps everything.
#[must_use = "returns the cleaned mask"]
pub fn remove_small_components(mask: &GrayImage, min_area: u32) -> GrayImage {
    let mask = normalize(mask);
    if min_area == 0 {
        return mask;
    }
    let labels = connected_components(&mask, Connectivity::Eight, image::Luma([BACKGROUND]));
    let mut areas: Vec<u64> = Vec::new();
    for p in labels.pixels() {
        let l = p.0[0] as usize;
        if l == 0 {
            continue;
        }
        if areas.len() <= l {
            areas.resize(l + 1, 0);
        }
        areas[l] += 1;
    }
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let l = labels.get_pixel(x, y).0[0] as usize;
        if l != 0 && areas[l] >= u64::from(min_area) {
            image::Luma([FOREGROUND])
        } else {
            image::Luma([BACKGROUND])
        }
    })
}

/// Map any non-zero cell to [`FOREGROUND`].
fn normalize(mask: &GrayImage) -> GrayImage {
    let mut out = mask.clone();
    for p in out.pixels_mut() {
        if is_foreground(p.0[0]) {
            p.0[0] = FOREGROUND;
        }
    }
    out
}

/// One kernel operation with its repeat count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MorphOp {
    /// Kernel.
    pub element: StructuringElement,
    /// Number of repetitions (≥ 1).
    pub iterations: u32,
}

impl MorphOp {
    /// Build from explicit parts.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] for a bad kernel size
    /// or zero iterations.
    pub fn new(shape: KernelShape, size: u32, iterations: u32) -> Result<Self, PipelineError> {
        Self::checked(shape, size, iterations, "kernel_size", "iterations")
    }

    pub(crate) fn checked(
        shape: KernelShape,
        size: u32,
        iterations: u32,
        size_key: &str,
        iterations_key: &str,
    ) -> Result<Self, PipelineError> {
        if iterations == 0 {
            return Err(PipelineError::invalid(iterations_key, "must be at least 1"));
        }
        Ok(Self {
            element: StructuringElement::for_key(shape, size, size_key)?,
            iterations,
        })
    }

    fn from_keys(
        params: &AnalysisParameters,
        shape_key: &str,
        size_key: &str,
        iterations_key: &str,
    ) -> Result<Self, PipelineError> {
        let name = params.text(shape_key)?;
        let shape = KernelShape::from_name(name).ok_or_else(|| {
            PipelineError::invalid(
                shape_key,
                format!("`{name}` is not one of: {}", SHAPE_NAMES.join(", ")),
            )
        })?;
        Self::checked(
            shape,
            params.count(size_key)?,
            params.count(iterations_key)?,
            size_key,
            iterations_key,
        )
    }
}

/// Morphology stage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MorphologyConfig {
    /// Opening, if enabled.
    pub opening: Option<MorphOp>,
    /// Minimum component area kept after opening (`0` disables).
    pub min_area: u32,
    /// Closing, if enabled.
    pub closing: Option<MorphOp>,
}

impl MorphologyConfig {
    /// Read the stage configuration from a parameter set.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] for a missing or
    /// invalid morphology parameter.
    pub fn from_params(params: &AnalysisParameters) -> Result<Self, PipelineError> {
        let opening = if params.flag(keys::OPEN_ENABLED)? {
            Some(MorphOp::from_keys(
                params,
                keys::OPEN_SHAPE,
                keys::OPEN_KERNEL_SIZE,
                keys::OPEN_ITERATIONS,
            )?)
        } else {
            None
        };
        let closing = if params.flag(keys::CLOSE_ENABLED)? {
            Some(MorphOp::from_keys(
                params,
                keys::CLOSE_SHAPE,
                keys::CLOSE_KERNEL_SIZE,
                keys::CLOSE_ITERATIONS,
            )?)
        } else {
            None
        };
        Ok(Self {
            opening,
            min_area: params.count(keys::MIN_COMPONENT_AREA)?,
            closing,
        })
    }

    /// Opening, then small-component removal, then closing.
    #[must_use = "returns the cleaned mask"]
    pub fn apply(&self, mask: &GrayImage) -> GrayImage {
        let mut out = match &self.opening {
            Some(op) => open(mask, &op.element, op.iterations),
            None => normalize(mask),
        };
        if self.min_area > 0 {
            out = remove_small_components(&out, self.min_area);
        }
        if let Some(op) = &self.closing {
            out = close(&out, &op.element, op.iterations);
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn count_fg(mask: &GrayImage) -> usize {
        mask.pixels().filter(|p| p.0[0] == FOREGROUND).count()
    }

    fn square(size: u32, x0: u32, y0: u32, side: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let inside = (x0..x0 + side).contains(&x) && (y0..y0 + side).contains(&y);
            image::Luma([if inside { FOREGROUND } else { BACKGROUND }])
        })
    }

    /// Deterministic speckle with blobs of assorted sizes.
    fn speckle() -> GrayImage {
        GrayImage::from_fn(48, 48, |x, y| {
            let v = (x * 7 + y * 13) ^ (x * y / 3);
            image::Luma([if v % 5 < 3 { FOREGROUND } else { BACKGROUND }])
        })
    }

    #[test]
    fn kernel_offset_counts() {
        assert_eq!(
            StructuringElement::new(KernelShape::Rect, 3)
                .unwrap()
                .offsets()
                .len(),
            9
        );
        assert_eq!(
            StructuringElement::new(KernelShape::Cross, 5)
                .unwrap()
                .offsets()
                .len(),
            9
        );
        assert_eq!(
            StructuringElement::new(KernelShape::Ellipse, 3)
                .unwrap()
                .offsets()
                .len(),
            5
        );
        assert_eq!(
            StructuringElement::new(KernelShape::Ellipse, 5)
                .unwrap()
                .offsets()
                .len(),
            17
        );
        assert_eq!(
            StructuringElement::new(KernelShape::Ellipse, 1)
                .unwrap()
                .offsets(),
            &[(0, 0)]
        );
    }

    #[test]
    fn even_or_zero_kernel_rejected() {
        assert!(matches!(
            StructuringElement::new(KernelShape::Rect, 4),
            Err(PipelineError::InvalidParameter { .. })
        ));
        assert!(StructuringElement::new(KernelShape::Cross, 0).is_err());
    }

    #[test]
    fn zero_iterations_rejected() {
        assert!(MorphOp::new(KernelShape::Rect, 3, 0).is_err());
    }

    #[test]
    fn erosion_treats_outside_as_background() {
        let full = GrayImage::from_pixel(6, 6, image::Luma([FOREGROUND]));
        let se = StructuringElement::new(KernelShape::Rect, 3).unwrap();
        let eroded = erode(&full, &se, 1);
        assert_eq!(eroded.get_pixel(0, 0).0[0], BACKGROUND);
        assert_eq!(eroded.get_pixel(5, 3).0[0], BACKGROUND);
        assert_eq!(eroded.get_pixel(3, 3).0[0], FOREGROUND);
        assert_eq!(count_fg(&eroded), 16);
    }

    #[test]
    fn opening_removes_isolated_pixel_keeps_square() {
        let mut mask = square(20, 5, 5, 6);
        mask.put_pixel(16, 16, image::Luma([FOREGROUND]));
        let se = StructuringElement::new(KernelShape::Rect, 3).unwrap();
        let opened = open(&mask, &se, 1);
        assert_eq!(opened, square(20, 5, 5, 6));
    }

    #[test]
    fn opening_is_idempotent() {
        for (shape, size, iterations) in [
            (KernelShape::Rect, 3, 1),
            (KernelShape::Ellipse, 5, 2),
            (KernelShape::Cross, 3, 2),
        ] {
            let se = StructuringElement::new(shape, size).unwrap();
            let once = open(&speckle(), &se, iterations);
            let twice = open(&once, &se, iterations);
            assert_eq!(once, twice, "{shape} {size}x{size} x{iterations}");
        }
    }

    #[test]
    fn closing_bridges_one_pixel_gap() {
        let mask = GrayImage::from_fn(20, 9, |x, y| {
            let on = (3..6).contains(&y) && x != 10 && (2..18).contains(&x);
            image::Luma([if on { FOREGROUND } else { BACKGROUND }])
        });
        let se = StructuringElement::new(KernelShape::Rect, 3).unwrap();
        let closed = close(&mask, &se, 1);
        assert_eq!(closed.get_pixel(10, 4).0[0], FOREGROUND);
    }

    #[test]
    fn small_components_dropped() {
        let mut mask = square(20, 2, 2, 4);
        mask.put_pixel(15, 15, image::Luma([FOREGROUND]));
        mask.put_pixel(16, 16, image::Luma([FOREGROUND]));
        let cleaned = remove_small_components(&mask, 3);
        assert_eq!(cleaned, square(20, 2, 2, 4));
        assert_eq!(remove_small_components(&mask, 0), mask);
    }

    #[test]
    fn diagonal_neighbours_count_as_one_component() {
        let mut mask = GrayImage::new(10, 10);
        for i in 0..4 {
            mask.put_pixel(i, i, image::Luma([FOREGROUND]));
        }
        assert_eq!(count_fg(&remove_small_components(&mask, 4)), 4);
    }

    #[test]
    fn disabled_config_is_identity() {
        let mask = speckle();
        assert_eq!(MorphologyConfig::default().apply(&mask), mask);
    }

    #[test]
    fn config_from_params() {
        let params = AnalysisParameters::new()
            .with(keys::OPEN_ENABLED, true)
            .with(keys::OPEN_SHAPE, "ellipse")
            .with(keys::OPEN_KERNEL_SIZE, 5_i64)
            .with(keys::OPEN_ITERATIONS, 2_i64)
            .with(keys::MIN_COMPONENT_AREA, 10_i64)
            .with(keys::CLOSE_ENABLED, false)
            .with(keys::CLOSE_SHAPE, "rect")
            .with(keys::CLOSE_KERNEL_SIZE, 3_i64)
            .with(keys::CLOSE_ITERATIONS, 1_i64);
        let config = MorphologyConfig::from_params(&params).unwrap();
        let opening = config.opening.unwrap();
        assert_eq!(opening.element.shape(), KernelShape::Ellipse);
        assert_eq!(opening.element.size(), 5);
        assert_eq!(opening.iterations, 2);
        assert_eq!(config.min_area, 10);
        assert!(config.closing.is_none());
    }

    #[test]
    fn config_from_params_reports_offending_key() {
        let params = AnalysisParameters::new()
            .with(keys::OPEN_ENABLED, true)
            .with(keys::OPEN_SHAPE, "rect")
            .with(keys::OPEN_KERNEL_SIZE, 4_i64)
            .with(keys::OPEN_ITERATIONS, 1_i64)
            .with(keys::MIN_COMPONENT_AREA, 0_i64)
            .with(keys::CLOSE_ENABLED, false);
        let err = MorphologyConfig::from_params(&params).unwrap_err();
        assert!(
            matches!(err, PipelineError::InvalidParameter { ref key, .. } if key == keys::OPEN_KERNEL_SIZE)
        );
    }
}
