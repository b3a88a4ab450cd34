//! Gaussian pre-blur applied before binarization.
//!
//! Wraps [`imageproc::filter::gaussian_blur_f32`] to suppress sensor
//! noise and grain texture that would otherwise fragment the
//! thresholded mask.

use image::GrayImage;

/// Apply Gaussian blur to a grayscale image.
///
/// Higher `sigma` values produce more smoothing. Non-positive or
/// non-finite sigma values return the image unchanged, since
/// `imageproc`'s underlying function panics on `sigma <= 0.0`.
#[must_use = "returns the blurred image"]
pub fn gaussian_blur(image: &GrayImage, sigma: f32) -> GrayImage {
    if !sigma.is_finite() || sigma <= 0.0 {
        return image.clone();
    }

    imageproc::filter::gaussian_blur_f32(image, sigma)
}

/// Sigma matching an OpenCV-style `k × k` Gaussian kernel with
/// automatic sigma.
#[must_use]
pub fn sigma_for_kernel(size: u32) -> f64 {
    0.3f64.mul_add(f64::from(size.saturating_sub(1)).mul_add(0.5, -1.0), 0.8)
}
