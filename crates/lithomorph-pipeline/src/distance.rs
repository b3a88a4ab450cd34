//! Exact Euclidean distance transform of a binary mask.
//!
//! Felzenszwalb & Huttenlocher separable lower-envelope algorithm: a 1D
//! squared-distance pass along every row, then along every column. The
//! mask is padded with one ring of background so that cells outside the
//! image count as background.

use image::GrayImage;

use crate::types::is_foreground;

/// Stand-in for "infinitely far" that keeps the envelope arithmetic finite.
const FAR: f64 = 1e20;

/// Per-cell distance to the nearest background cell, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMap {
    width: u32,
    height: u32,
    values: Vec<f64>,
}

impl DistanceMap {
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

    /// Distance at `(x, y)`. Out-of-range coordinates read as `0.0`.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> f64 {
        if x >= self.width || y >= self.height {
            return 0.0;
        }
        self.values[y as usize * self.width as usize + x as usize]
    }

    /// Row-major distances.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Largest distance, `0.0` for an all-background mask.
    #[must_use]
    pub fn max(&self) -> f64 {
        self.values.iter().copied().fold(0.0, f64::max)
    }

    /// Distances scaled linearly so the maximum maps to 255.
    #[must_use]
    pub fn to_preview(&self) -> GrayImage {
        let max = self.max();
        GrayImage::from_fn(self.width, self.height, |x, y| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let level = if max > 0.0 {
                (self.get(x, y) / max * 255.0).round().clamp(0.0, 255.0) as u8
            } else {
                0
            };
            image::Luma([level])
        })
    }
}

/// Compute the exact Euclidean distance of every foreground cell to the
/// nearest background cell. Background cells get `0.0`.
#[must_use = "returns the distance map"]
pub fn euclidean_distance(mask: &GrayImage) -> DistanceMap {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let (pw, ph) = (w + 2, h + 2);

    let mut grid = vec![0.0_f64; pw * ph];
    for (x, y, p) in mask.enumerate_pixels() {
        if is_foreground(p.0[0]) {
            grid[(y as usize + 1) * pw + x as usize + 1] = FAR;
        }
    }

    let mut line = vec![0.0_f64; pw.max(ph)];
    for row in 0..ph {
        line[..pw].copy_from_slice(&grid[row * pw..(row + 1) * pw]);
        let out = squared_distance_1d(&line[..pw]);
        grid[row * pw..(row + 1) * pw].copy_from_slice(&out);
    }
    for col in 0..pw {
        for row in 0..ph {
            line[row] = grid[row * pw + col];
        }
        let out = squared_distance_1d(&line[..ph]);
        for (row, d) in out.into_iter().enumerate() {
            grid[row * pw + col] = d;
        }
    }

    let mut values = Vec::with_capacity(w * h);
    for y in 0..h {
        let start = (y + 1) * pw + 1;
        values.extend(grid[start..start + w].iter().map(|d| d.sqrt()));
    }

    DistanceMap {
        width: mask.width(),
        height: mask.height(),
        values,
    }
}

/// 1D squared distance transform of a sampled function `f`.
#[allow(clippy::cast_precision_loss)]
fn squared_distance_1d(f: &[f64]) -> Vec<f64> {
    let n = f.len();
    if n == 0 {
        return Vec::new();
    }
    // Parabola vertices and the boundaries between them.
    let mut v = vec![0_usize; n];
    let mut z = vec![0.0_f64; n + 1];
    let mut k = 0_usize;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;

    let intersect = |q: usize, p: usize| -> f64 {
        let (qf, pf) = (q as f64, p as f64);
        (qf.mul_add(qf, f[q]) - pf.mul_add(pf, f[p])) / (2.0 * (qf - pf))
    };

    for q in 1..n {
        let mut s = intersect(q, v[k]);
        // z[0] is -inf, so this stops at k == 0 at the latest.
        while s <= z[k] {
            k -= 1;
            s = intersect(q, v[k]);
        }
        k += 1;
        v[k] = q;
        z[k] = s;
        z[k + 1] = f64::INFINITY;
    }

    let mut out = vec![0.0_f64; n];
    k = 0;
    for (q, slot) in out.iter_mut().enumerate() {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let d = q as f64 - v[k] as f64;
        *slot = d.mul_add(d, f[v[k]]);
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::FOREGROUND;

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn brute_force(mask: &GrayImage) -> Vec<f64> {
        let (w, h) = (i64::from(mask.width()), i64::from(mask.height()));
        let mut background = Vec::new();
        for y in -1..=h {
            for x in -1..=w {
                let outside = x < 0 || y < 0 || x >= w || y >= h;
                if outside || !is_foreground(mask.get_pixel(x as u32, y as u32).0[0]) {
                    background.push((x, y));
                }
            }
        }
        let mut out = Vec::new();
        for y in 0..h {
            for x in 0..w {
                let d = background
                    .iter()
                    .map(|&(bx, by)| ((bx - x).pow(2) + (by - y).pow(2)) as f64)
                    .fold(f64::INFINITY, f64::min)
                    .sqrt();
                let fg = is_foreground(mask.get_pixel(x as u32, y as u32).0[0]);
                out.push(if fg { d } else { 0.0 });
            }
        }
        out
    }

    #[test]
    fn all_background_is_zero() {
        let map = euclidean_distance(&GrayImage::new(5, 4));
        assert!(map.values().iter().all(|&d| d == 0.0));
        assert!(map.max().abs() < f64::EPSILON);
        assert!(map.to_preview().pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn full_foreground_measures_to_image_edge() {
        let mask = GrayImage::from_pixel(7, 7, image::Luma([FOREGROUND]));
        let map = euclidean_distance(&mask);
        assert!((map.get(0, 0) - 1.0).abs() < 1e-9);
        assert!((map.get(3, 3) - 4.0).abs() < 1e-9);
        assert!((map.max() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn matches_brute_force_on_irregular_mask() {
        let mask = GrayImage::from_fn(23, 17, |x, y| {
            let on = (x * 5 + y * 3) % 11 != 0 && !(x == 12 && y > 4);
            image::Luma([if on { FOREGROUND } else { 0 }])
        });
        let map = euclidean_distance(&mask);
        for (got, want) in map.values().iter().zip(brute_force(&mask)) {
            assert!((got - want).abs() < 1e-9, "got {got}, want {want}");
        }
    }

    #[test]
    fn preview_peaks_at_max() {
        let mask = GrayImage::from_fn(9, 9, |x, y| {
            image::Luma([if (2..7).contains(&x) && (2..7).contains(&y) {
                FOREGROUND
            } else {
                0
            }])
        });
        let preview = euclidean_distance(&mask).to_preview();
        assert_eq!(preview.get_pixel(4, 4).0[0], 255);
        assert_eq!(preview.get_pixel(0, 0).0[0], 0);
    }
}
