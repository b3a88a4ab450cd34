//! Binarization: grayscale intensities to a foreground/background mask.
//!
//! This module defines the [`Binarizer`] trait and the
//! [`ThresholdMethod`] enum selecting one of five algorithms:
//!
//! | Method | Foreground when |
//! |---|---|
//! | Global | `p ≥ T` |
//! | Otsu | `p > T*` (histogram-optimal `T*`) |
//! | Adaptive Gaussian | `p ≥ gaussian_mean − C` |
//! | Niblack | `p ≥ mean + k·stdev` |
//! | Sauvola | `p ≥ mean·(1 + k·(stdev/r − 1))` |
//!
//! Local statistics for Niblack and Sauvola come from summed-area
//! tables over a window clipped to the image, so each pixel costs O(1)
//! regardless of window size. The adaptive Gaussian mean is the
//! image blurred with [`imageproc::filter::gaussian_blur_f32`].

use std::fmt;

use image::GrayImage;

use crate::params::{AnalysisParameters, keys};
use crate::types::{BACKGROUND, FOREGROUND, PipelineError};

/// Otsu threshold reported when every candidate has zero
/// between-class variance (a perfectly uniform image).
pub const OTSU_FLAT_THRESHOLD: u8 = 127;

/// Names accepted by `threshold.method`.
pub const METHOD_NAMES: &[&str] = &["global", "otsu", "adaptive_gaussian", "niblack", "sauvola"];

/// Selects which binarization algorithm to use, with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ThresholdMethod {
    /// Fixed intensity threshold.
    Global {
        /// Threshold `T`.
        threshold: u8,
    },
    /// Otsu's histogram method.
    #[default]
    Otsu,
    /// Gaussian-weighted local mean minus a constant.
    AdaptiveGaussian {
        /// Odd kernel size ≥ 3.
        block_size: u32,
        /// Offset subtracted from the local mean.
        c: f64,
    },
    /// Niblack local threshold.
    Niblack {
        /// Odd window size ≥ 3.
        window_size: u32,
        /// Standard-deviation weight (typically negative).
        k: f64,
    },
    /// Sauvola local threshold.
    Sauvola {
        /// Odd window size ≥ 3.
        window_size: u32,
        /// Standard-deviation weight.
        k: f64,
        /// Dynamic range of the standard deviation.
        r: f64,
    },
}

impl ThresholdMethod {
    /// Stable name as used by `threshold.method`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Global { .. } => "global",
            Self::Otsu => "otsu",
            Self::AdaptiveGaussian { .. } => "adaptive_gaussian",
            Self::Niblack { .. } => "niblack",
            Self::Sauvola { .. } => "sauvola",
        }
    }

    /// Read the method selected by `threshold.method` together with
    /// the parameters that method uses. Unused parameters are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] for an unknown method
    /// name or a missing/mistyped parameter.
    pub fn from_params(params: &AnalysisParameters) -> Result<Self, PipelineError> {
        let method = params.text(keys::THRESHOLD_METHOD)?;
        match method {
            "global" => {
                let t = params.int(keys::THRESHOLD_VALUE)?;
                let threshold = u8::try_from(t).map_err(|_| {
                    PipelineError::invalid(keys::THRESHOLD_VALUE, format!("{t} is outside [0, 255]"))
                })?;
                Ok(Self::Global { threshold })
            }
            "otsu" => Ok(Self::Otsu),
            "adaptive_gaussian" => Ok(Self::AdaptiveGaussian {
                block_size: params.count(keys::THRESHOLD_BLOCK_SIZE)?,
                c: params.float(keys::THRESHOLD_C)?,
            }),
            "niblack" => Ok(Self::Niblack {
                window_size: params.count(keys::THRESHOLD_WINDOW_SIZE)?,
                k: params.float(keys::THRESHOLD_K)?,
            }),
            "sauvola" => Ok(Self::Sauvola {
                window_size: params.count(keys::THRESHOLD_WINDOW_SIZE)?,
                k: params.float(keys::THRESHOLD_K)?,
                r: params.float(keys::THRESHOLD_R)?,
            }),
            other => Err(PipelineError::invalid(
                keys::THRESHOLD_METHOD,
                format!("`{other}` is not one of: {}", METHOD_NAMES.join(", ")),
            )),
        }
    }
}

impl fmt::Display for ThresholdMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A thresholded mask plus the global threshold that produced it, if
/// the method has one.
#[derive(Debug, Clone)]
pub struct Binarized {
    /// Foreground `255`, background `0`.
    pub mask: GrayImage,
    /// Threshold applied (Global and Otsu only).
    pub threshold: Option<u8>,
}

/// Trait for binarization strategies.
pub trait Binarizer {
    /// Threshold `image` into a binary mask.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] when a window or
    /// block size is even or below 3, or Sauvola's `r` is not positive.
    fn binarize(&self, image: &GrayImage) -> Result<Binarized, PipelineError>;
}

impl Binarizer for ThresholdMethod {
    fn binarize(&self, image: &GrayImage) -> Result<Binarized, PipelineError> {
        match *self {
            Self::Global { threshold } => Ok(Binarized {
                mask: map_mask(image, |_, _, p| p >= threshold),
                threshold: Some(threshold),
            }),
            Self::Otsu => {
                let t = otsu_threshold(image);
                Ok(Binarized {
                    mask: map_mask(image, |_, _, p| p > t),
                    threshold: Some(t),
                })
            }
            Self::AdaptiveGaussian { block_size, c } => {
                check_window(keys::THRESHOLD_BLOCK_SIZE, block_size)?;
                let mean = gaussian_local_mean(image, block_size);
                Ok(Binarized {
                    mask: map_mask(image, |x, y, p| {
                        f64::from(p) >= f64::from(mean.get_pixel(x, y).0[0]) - c
                    }),
                    threshold: None,
                })
            }
            Self::Niblack { window_size, k } => {
                check_window(keys::THRESHOLD_WINDOW_SIZE, window_size)?;
                let stats = LocalStats::new(image);
                let half = window_size / 2;
                Ok(Binarized {
                    mask: map_mask(image, |x, y, p| {
                        let (mean, stdev) = stats.window(x, y, half);
                        f64::from(p) >= k.mul_add(stdev, mean)
                    }),
                    threshold: None,
                })
            }
            Self::Sauvola { window_size, k, r } => {
                check_window(keys::THRESHOLD_WINDOW_SIZE, window_size)?;
                if !(r.is_finite() && r > 0.0) {
                    return Err(PipelineError::invalid(
                        keys::THRESHOLD_R,
                        format!("{r} must be positive"),
                    ));
                }
                let stats = LocalStats::new(image);
                let half = window_size / 2;
                Ok(Binarized {
                    mask: map_mask(image, |x, y, p| {
                        let (mean, stdev) = stats.window(x, y, half);
                        f64::from(p) >= mean * k.mul_add(stdev / r - 1.0, 1.0)
                    }),
                    threshold: None,
                })
            }
        }
    }
}

/// Binarization stage configuration: method plus optional inversion.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BinarizeConfig {
    /// Algorithm and its parameters.
    pub method: ThresholdMethod,
    /// Flip the mask so dark pixels become foreground.
    pub invert: bool,
}

impl BinarizeConfig {
    /// Read the stage configuration from a parameter set.
    ///
    /// # Errors
    ///
    /// Propagates [`ThresholdMethod::from_params`] failures and a
    /// missing `threshold.invert`.
    pub fn from_params(params: &AnalysisParameters) -> Result<Self, PipelineError> {
        Ok(Self {
            method: ThresholdMethod::from_params(params)?,
            invert: params.flag(keys::THRESHOLD_INVERT)?,
        })
    }

    /// Threshold and optionally invert.
    ///
    /// # Errors
    ///
    /// See [`Binarizer::binarize`].
    pub fn apply(&self, image: &GrayImage) -> Result<Binarized, PipelineError> {
        let mut out = self.method.binarize(image)?;
        if self.invert {
            for p in out.mask.pixels_mut() {
                p.0[0] = FOREGROUND - p.0[0];
            }
        }
        Ok(out)
    }
}

fn check_window(key: &str, size: u32) -> Result<(), PipelineError> {
    if size < 3 {
        return Err(PipelineError::invalid(key, format!("{size} is below 3")));
    }
    if size % 2 == 0 {
        return Err(PipelineError::invalid(key, format!("{size} must be odd")));
    }
    Ok(())
}

fn map_mask(image: &GrayImage, fg: impl Fn(u32, u32, u8) -> bool) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        if fg(x, y, image.get_pixel(x, y).0[0]) {
            image::Luma([FOREGROUND])
        } else {
            image::Luma([BACKGROUND])
        }
    })
}

/// Otsu's threshold over a 256-bin histogram.
///
/// Class 0 holds levels `0..=T`. Among equal variance maxima the
/// smallest `T` wins. When no split has positive between-class
/// variance the result is [`OTSU_FLAT_THRESHOLD`].
#[must_use]
pub fn otsu_threshold(image: &GrayImage) -> u8 {
    let mut hist = [0u64; 256];
    for p in image.pixels() {
        hist[usize::from(p.0[0])] += 1;
    }
    let total: u64 = hist.iter().sum();
    let weighted_total: u64 = hist
        .iter()
        .zip(0u64..)
        .map(|(&count, level)| count * level)
        .sum();

    let mut best_t = None;
    let mut best_var = 0.0f64;
    let mut w0 = 0u64;
    let mut sum0 = 0u64;
    for (t, &count) in (0u8..=255).zip(hist.iter()) {
        w0 += count;
        sum0 += u64::from(t) * count;
        if w0 == 0 {
            continue;
        }
        let w1 = total - w0;
        if w1 == 0 {
            break;
        }
        #[allow(clippy::cast_precision_loss)]
        let var = {
            let m0 = sum0 as f64 / w0 as f64;
            let m1 = (weighted_total - sum0) as f64 / w1 as f64;
            let d = m0 - m1;
            w0 as f64 * w1 as f64 * d * d
        };
        if var > best_var {
            best_var = var;
            best_t = Some(t);
        }
    }
    best_t.unwrap_or(OTSU_FLAT_THRESHOLD)
}

/// Gaussian-weighted local mean over a `size × size` block, sigma
/// from the OpenCV automatic rule. Borders are clamped by `imageproc`.
#[allow(clippy::cast_possible_truncation)]
fn gaussian_local_mean(image: &GrayImage, size: u32) -> GrayImage {
    crate::blur::gaussian_blur(image, crate::blur::sigma_for_kernel(size) as f32)
}

/// Summed-area tables of intensity and squared intensity.
struct LocalStats {
    width: usize,
    height: usize,
    sum: Vec<u64>,
    sum_sq: Vec<u64>,
}

impl LocalStats {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sum_sq = vec![0u64; stride * (h + 1)];
        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let v = u64::from(image.as_raw()[y * w + x]);
                row += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sq;
            }
        }
        Self {
            width: w,
            height: h,
            sum,
            sum_sq,
        }
    }

    /// Mean and population standard deviation over the square window
    /// of radius `half` around `(x, y)`, clipped to the image.
    #[allow(clippy::cast_precision_loss)]
    fn window(&self, x: u32, y: u32, half: u32) -> (f64, f64) {
        let (x, y, half) = (x as usize, y as usize, half as usize);
        let x0 = x.saturating_sub(half);
        let y0 = y.saturating_sub(half);
        let x1 = (x + half + 1).min(self.width);
        let y1 = (y + half + 1).min(self.height);
        let stride = self.width + 1;
        let rect = |t: &[u64]| t[y1 * stride + x1] + t[y0 * stride + x0] - t[y0 * stride + x1] - t[y1 * stride + x0];
        let n = ((x1 - x0) * (y1 - y0)) as f64;
        let mean = rect(&self.sum) as f64 / n;
        let var = (rect(&self.sum_sq) as f64 / n - mean * mean).max(0.0);
        (mean, var.sqrt())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn two_level() -> GrayImage {
        GrayImage::from_fn(20, 20, |x, y| {
            if (x + y) % 3 == 0 {
                image::Luma([200])
            } else {
                image::Luma([50])
            }
        })
    }

    /// Bright 200 field with a dark 50 vertical line two pixels wide.
    fn dark_line() -> GrayImage {
        GrayImage::from_fn(40, 40, |x, _| {
            if (19..21).contains(&x) {
                image::Luma([50])
            } else {
                image::Luma([200])
            }
        })
    }

    #[test]
    fn global_125_selects_exactly_the_bright_level() {
        let img = two_level();
        let out = ThresholdMethod::Global { threshold: 125 }
            .binarize(&img)
            .unwrap();
        for (p, m) in img.pixels().zip(out.mask.pixels()) {
            assert_eq!(m.0[0] == FOREGROUND, p.0[0] == 200);
        }
        assert_eq!(out.threshold, Some(125));
    }

    #[test]
    fn global_threshold_is_inclusive() {
        let img = GrayImage::from_pixel(3, 3, image::Luma([125]));
        let out = ThresholdMethod::Global { threshold: 125 }
            .binarize(&img)
            .unwrap();
        assert!(out.mask.pixels().all(|p| p.0[0] == FOREGROUND));
    }

    #[test]
    fn otsu_two_level_picks_smallest_maximizer() {
        // Every T in 50..200 splits the classes identically; the
        // smallest wins.
        assert_eq!(otsu_threshold(&two_level()), 50);
        let out = ThresholdMethod::Otsu.binarize(&two_level()).unwrap();
        for (p, m) in two_level().pixels().zip(out.mask.pixels()) {
            assert_eq!(m.0[0] == FOREGROUND, p.0[0] == 200);
        }
    }

    #[test]
    fn otsu_uniform_image_falls_back_to_midpoint() {
        let img = GrayImage::from_pixel(8, 8, image::Luma([90]));
        assert_eq!(otsu_threshold(&img), OTSU_FLAT_THRESHOLD);
        assert_eq!(otsu_threshold(&GrayImage::new(0, 0)), OTSU_FLAT_THRESHOLD);
    }

    #[test]
    fn otsu_is_deterministic_on_gradient() {
        #[allow(clippy::cast_possible_truncation)]
        let img = GrayImage::from_fn(64, 64, |x, y| image::Luma([((x * 3 + y) % 256) as u8]));
        let a = otsu_threshold(&img);
        let b = otsu_threshold(&img);
        assert_eq!(a, b);
    }

    #[test]
    fn even_and_small_windows_rejected() {
        let img = GrayImage::new(10, 10);
        for method in [
            ThresholdMethod::AdaptiveGaussian {
                block_size: 4,
                c: 2.0,
            },
            ThresholdMethod::AdaptiveGaussian {
                block_size: 1,
                c: 2.0,
            },
            ThresholdMethod::Niblack {
                window_size: 10,
                k: -0.2,
            },
            ThresholdMethod::Sauvola {
                window_size: 2,
                k: 0.2,
                r: 128.0,
            },
        ] {
            assert!(
                matches!(
                    method.binarize(&img),
                    Err(PipelineError::InvalidParameter { .. })
                ),
                "{method} accepted a bad window"
            );
        }
    }

    #[test]
    fn sauvola_rejects_non_positive_r() {
        let img = GrayImage::new(10, 10);
        let method = ThresholdMethod::Sauvola {
            window_size: 3,
            k: 0.2,
            r: 0.0,
        };
        assert!(method.binarize(&img).is_err());
    }

    #[test]
    fn adaptive_gaussian_finds_local_bright_patch() {
        let img = GrayImage::from_fn(30, 30, |x, y| {
            if (12..18).contains(&x) && (12..18).contains(&y) {
                image::Luma([200])
            } else {
                image::Luma([100])
            }
        });
        let out = ThresholdMethod::AdaptiveGaussian {
            block_size: 15,
            c: -5.0,
        }
        .binarize(&img)
        .unwrap();
        assert_eq!(out.mask.get_pixel(15, 15).0[0], FOREGROUND);
        assert_eq!(out.mask.get_pixel(2, 2).0[0], BACKGROUND);
        assert_eq!(out.threshold, None);
    }

    #[test]
    fn sauvola_inverted_extracts_dark_line() {
        let config = BinarizeConfig {
            method: ThresholdMethod::Sauvola {
                window_size: 15,
                k: 0.2,
                r: 128.0,
            },
            invert: true,
        };
        let out = config.apply(&dark_line()).unwrap();
        assert_eq!(out.mask.get_pixel(19, 20).0[0], FOREGROUND);
        assert_eq!(out.mask.get_pixel(20, 5).0[0], FOREGROUND);
        assert_eq!(out.mask.get_pixel(5, 20).0[0], BACKGROUND);
        assert_eq!(out.mask.get_pixel(35, 35).0[0], BACKGROUND);
    }

    #[test]
    fn niblack_inverted_extracts_dark_line() {
        let config = BinarizeConfig {
            method: ThresholdMethod::Niblack {
                window_size: 15,
                k: -0.2,
            },
            invert: true,
        };
        let out = config.apply(&dark_line()).unwrap();
        assert_eq!(out.mask.get_pixel(20, 20).0[0], FOREGROUND);
        assert_eq!(out.mask.get_pixel(2, 2).0[0], BACKGROUND);
    }

    #[test]
    fn local_stats_clip_window_at_corner() {
        let img = GrayImage::from_fn(4, 4, |x, y| image::Luma([u8::from(x == 0 && y == 0) * 40]));
        let stats = LocalStats::new(&img);
        // 2x2 window at the corner: one 40 and three 0s.
        let (mean, stdev) = stats.window(0, 0, 1);
        assert!((mean - 10.0).abs() < 1e-9);
        assert!((stdev - 300f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn adaptive_gaussian_compares_against_blurred_image() {
        let img = GrayImage::from_fn(24, 24, |x, y| {
            image::Luma([u8::try_from((x * 7 + y * 3) % 256).unwrap()])
        });
        let out = ThresholdMethod::AdaptiveGaussian {
            block_size: 7,
            c: 0.0,
        }
        .binarize(&img)
        .unwrap();
        let mean = crate::blur::gaussian_blur(&img, 1.4);
        for (x, y, p) in img.enumerate_pixels() {
            let expected = if p.0[0] >= mean.get_pixel(x, y).0[0] {
                FOREGROUND
            } else {
                BACKGROUND
            };
            assert_eq!(out.mask.get_pixel(x, y).0[0], expected, "({x}, {y})");
        }
    }

    #[test]
    fn adaptive_gaussian_flat_image_is_all_foreground() {
        let img = GrayImage::from_pixel(9, 5, image::Luma([90]));
        let out = ThresholdMethod::AdaptiveGaussian {
            block_size: 3,
            c: 0.0,
        }
        .binarize(&img)
        .unwrap();
        assert!(out.mask.pixels().all(|p| p.0[0] == FOREGROUND));
    }

    #[test]
    fn from_params_reads_selected_method() {
        let params = AnalysisParameters::new()
            .with(keys::THRESHOLD_METHOD, "sauvola")
            .with(keys::THRESHOLD_WINDOW_SIZE, 25_i64)
            .with(keys::THRESHOLD_K, 0.3)
            .with(keys::THRESHOLD_R, 100_i64);
        assert_eq!(
            ThresholdMethod::from_params(&params).unwrap(),
            ThresholdMethod::Sauvola {
                window_size: 25,
                k: 0.3,
                r: 100.0
            }
        );
    }

    #[test]
    fn from_params_rejects_unknown_method() {
        let params = AnalysisParameters::new().with(keys::THRESHOLD_METHOD, "triangle");
        assert!(ThresholdMethod::from_params(&params).is_err());
    }
}
