//! Result visualization.
//!
//! Fractures are outlined on the source image; pores and grains are
//! tinted with a stable per-label colour and region boundaries are
//! painted red.

use std::collections::BTreeSet;
use std::hash::Hasher;

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use siphasher::sip::SipHasher13;

use crate::contour::FeatureRecord;
use crate::types::{GrayImage, PixelPoint, RegionMap};

/// Outline colour for fractures.
pub const OUTLINE: Rgb<u8> = Rgb([0, 255, 0]);

/// Colour of separation boundaries.
pub const BOUNDARY: Rgb<u8> = Rgb([255, 0, 0]);

/// Weight of the label colour when tinting a region.
const TINT: f32 = 0.5;

/// Grayscale source as RGB.
#[must_use]
pub fn gray_to_rgb(gray: &GrayImage) -> RgbImage {
    RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        let v = gray.get_pixel(x, y).0[0];
        Rgb([v, v, v])
    })
}

/// Stable colour for a region label. Every channel stays in `64..=255`
/// so tints remain visible on dark backgrounds.
#[must_use]
pub fn label_color(label: i32) -> Rgb<u8> {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(&label.to_le_bytes());
    let h = hasher.finish().to_le_bytes();
    let channel = |b: u8| 64 + b % 192;
    Rgb([channel(h[0]), channel(h[1]), channel(h[2])])
}

/// Draw each feature's outer contour as a closed polyline, two pixels
/// thick.
pub fn outline_features(canvas: &mut RgbImage, features: &[FeatureRecord], color: Rgb<u8>) {
    for feature in features {
        let points = feature.contour.points();
        let Some(&first) = points.first() else {
            continue;
        };
        if points.len() == 1 {
            put(canvas, first, color);
            continue;
        }
        let closing = std::iter::once((points[points.len() - 1], first));
        let segments = points.windows(2).map(|w| (w[0], w[1])).chain(closing);
        for (a, b) in segments {
            for (dx, dy) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)] {
                draw_line_segment_mut(
                    canvas,
                    (as_f32(a.x) + dx, as_f32(a.y) + dy),
                    (as_f32(b.x) + dx, as_f32(b.y) + dy),
                    color,
                );
            }
        }
    }
}

/// Tint the regions that produced `features` and paint boundaries.
///
/// A feature's label is read at its first contour point, which always
/// lies on the region it was traced from.
pub fn fill_regions(canvas: &mut RgbImage, regions: &RegionMap, features: &[FeatureRecord]) {
    let kept: BTreeSet<i32> = features
        .iter()
        .filter_map(|f| f.contour.points().first())
        .filter_map(|p| Some(regions.get(u32::try_from(p.x).ok()?, u32::try_from(p.y).ok()?)))
        .filter(|&label| label > 0)
        .collect();

    for (x, y, pixel) in canvas.enumerate_pixels_mut() {
        let label = regions.get(x, y);
        if label == RegionMap::BOUNDARY {
            *pixel = BOUNDARY;
        } else if kept.contains(&label) {
            *pixel = blend(*pixel, label_color(label));
        }
    }
}

fn blend(base: Rgb<u8>, tint: Rgb<u8>) -> Rgb<u8> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let mix = |a: u8, b: u8| f32::from(b).mul_add(TINT, f32::from(a) * (1.0 - TINT)).round() as u8;
    Rgb([
        mix(base.0[0], tint.0[0]),
        mix(base.0[1], tint.0[1]),
        mix(base.0[2], tint.0[2]),
    ])
}

#[allow(clippy::cast_precision_loss)]
const fn as_f32(v: i32) -> f32 {
    v as f32
}

fn put(canvas: &mut RgbImage, p: PixelPoint, color: Rgb<u8>) {
    if let (Ok(x), Ok(y)) = (u32::try_from(p.x), u32::try_from(p.y))
        && x < canvas.width()
        && y < canvas.height()
    {
        canvas.put_pixel(x, y, color);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::contour::{LengthMeasure, extract_components, extract_regions};
    use crate::types::{BACKGROUND, FOREGROUND};

    fn square_mask() -> GrayImage {
        GrayImage::from_fn(20, 20, |x, y| {
            let on = (5..15).contains(&x) && (5..15).contains(&y);
            image::Luma([if on { FOREGROUND } else { BACKGROUND }])
        })
    }

    #[test]
    fn label_colors_are_stable_and_bright() {
        assert_eq!(label_color(7), label_color(7));
        assert_ne!(label_color(1), label_color(2));
        for label in 1..50 {
            assert!(label_color(label).0.iter().all(|&c| c >= 64));
        }
    }

    #[test]
    fn outline_marks_contour_green() {
        let features = extract_components(&square_mask(), LengthMeasure::Skeleton);
        let mut canvas = gray_to_rgb(&GrayImage::new(20, 20));
        outline_features(&mut canvas, &features, OUTLINE);
        assert_eq!(*canvas.get_pixel(5, 5), OUTLINE);
        assert_eq!(*canvas.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*canvas.get_pixel(10, 10), Rgb([0, 0, 0]));
    }

    #[test]
    fn only_kept_regions_are_tinted() {
        let mask = GrayImage::from_fn(30, 10, |x, y| {
            let on = (1..9).contains(&y) && ((1..9).contains(&x) || (20..28).contains(&x));
            image::Luma([if on { FOREGROUND } else { BACKGROUND }])
        });
        let regions = crate::separate::label_components(&mask);
        let features = extract_regions(&regions, LengthMeasure::RectLongSide);
        assert_eq!(features.len(), 2);

        let gray = GrayImage::from_pixel(30, 10, image::Luma([100]));
        let mut canvas = gray_to_rgb(&gray);
        fill_regions(&mut canvas, &regions, &features[..1]);
        assert_ne!(*canvas.get_pixel(4, 4), Rgb([100, 100, 100]));
        assert_eq!(*canvas.get_pixel(24, 4), Rgb([100, 100, 100]));
        assert_eq!(*canvas.get_pixel(15, 4), Rgb([100, 100, 100]));
    }

    #[test]
    fn boundaries_are_red() {
        let labels = vec![1, RegionMap::BOUNDARY, 2, 0];
        let regions = RegionMap::from_labels(2, 2, labels).unwrap();
        let mut canvas = gray_to_rgb(&GrayImage::new(2, 2));
        fill_regions(&mut canvas, &regions, &[]);
        assert_eq!(*canvas.get_pixel(1, 0), BOUNDARY);
        assert_eq!(*canvas.get_pixel(0, 0), Rgb([0, 0, 0]));
    }
}
