//! Contour extraction and per-feature geometry.
//!
//! Every connected foreground component (or every positive region of a
//! [`RegionMap`]) is cropped, hole-filled, and traced with
//! `imageproc::contours::find_contours`. The largest outer border
//! becomes the feature's [`Contour`]; shape measurements come from that
//! polygon and its `geo` convex hull and minimum rotated rectangle.

use std::collections::{BTreeMap, VecDeque};

use geo::{Area, ConvexHull, Coord, LineString, MinimumRotatedRect, Polygon};
use image::GrayImage;
use imageproc::contours::{BorderType, find_contours};
use serde::{Deserialize, Serialize};

use crate::separate::label_components;
use crate::skeleton::{skeleton_length, zhang_suen};
use crate::types::{BACKGROUND, Contour, FOREGROUND, PixelPoint, Point, RegionMap, is_foreground};

/// How a feature's length is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthMeasure {
    /// Path length of the Zhang–Suen skeleton of the filled component.
    #[default]
    Skeleton,
    /// Long side of the minimum rotated rectangle.
    RectLongSide,
}

/// Minimum-area rectangle enclosing a contour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotatedRect {
    /// Rectangle center.
    pub center: Point,
    /// Length of the side the angle refers to.
    pub width: f64,
    /// Length of the other side.
    pub height: f64,
    /// Direction of the `width` side in degrees, `[0, 180)`.
    pub angle_deg: f64,
}

impl RotatedRect {
    /// Longer side.
    #[must_use]
    pub fn long_side(&self) -> f64 {
        self.width.max(self.height)
    }

    /// Shorter side.
    #[must_use]
    pub fn short_side(&self) -> f64 {
        self.width.min(self.height)
    }
}

/// Geometry of one detected feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    /// Outer boundary in image coordinates. Merged fracture fragments
    /// carry their convex hull polygon here.
    pub contour: Contour,
    /// Polygon area of the contour, px².
    pub area: f64,
    /// Closed contour length, px.
    pub perimeter: f64,
    /// Skeleton length or rectangle long side, px.
    pub length: f64,
    /// Minimum rotated rectangle.
    pub rect: RotatedRect,
    /// Long side over short side, `≥ 1`.
    pub aspect_ratio: f64,
    /// Direction of the long side in degrees, `[0, 180)`.
    pub angle_deg: f64,
    /// Convex hull area, px².
    pub hull_area: f64,
    /// `area / hull_area`, in `(0, 1]`.
    pub solidity: f64,
    /// Diameter of the circle with the same area, px.
    pub equivalent_diameter: f64,
    /// Cells in the filled component.
    pub pixel_count: u64,
}

/// Closed-polygon (shoelace) area of a point ring.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn polygon_area(points: &[PixelPoint]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| i64::from(a.x) * i64::from(b.y) - i64::from(b.x) * i64::from(a.y))
        .sum();
    twice.unsigned_abs() as f64 / 2.0
}

/// Closed-polyline length of a point ring.
#[must_use]
pub fn perimeter(points: &[PixelPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.to_point().distance(b.to_point()))
        .sum()
}

/// Fold an angle in degrees into `[0, 180)`.
#[must_use]
pub fn normalize_angle(deg: f64) -> f64 {
    let a = deg.rem_euclid(180.0);
    if a >= 180.0 { 0.0 } else { a }
}

fn to_polygon(points: &[PixelPoint]) -> Polygon<f64> {
    let ring: Vec<Coord<f64>> = points
        .iter()
        .map(|p| Coord {
            x: f64::from(p.x),
            y: f64::from(p.y),
        })
        .collect();
    Polygon::new(LineString::new(ring), vec![])
}

fn rotated_rect(hull: &Polygon<f64>) -> Option<RotatedRect> {
    let rect = hull.minimum_rotated_rect()?;
    let c = &rect.exterior().0;
    if c.len() < 4 {
        return None;
    }
    let (e1, e2) = (c[1] - c[0], c[2] - c[1]);
    let center = Point::new(
        (c[0].x + c[1].x + c[2].x + c[3].x) / 4.0,
        (c[0].y + c[1].y + c[2].y + c[3].y) / 4.0,
    );
    Some(RotatedRect {
        center,
        width: e1.x.hypot(e1.y),
        height: e2.x.hypot(e2.y),
        angle_deg: normalize_angle(e1.y.atan2(e1.x).to_degrees()),
    })
}

/// Fill background cells not 4-connected to the image border.
#[must_use = "returns the filled mask"]
pub fn fill_holes(mask: &GrayImage) -> GrayImage {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let background: Vec<bool> = mask.pixels().map(|p| !is_foreground(p.0[0])).collect();
    let mut outside = vec![false; w * h];
    let mut queue = VecDeque::new();

    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let border = x == 0 || y == 0 || x + 1 == w || y + 1 == h;
            if border && background[i] {
                outside[i] = true;
                queue.push_back(i);
            }
        }
    }
    while let Some(i) = queue.pop_front() {
        let (x, y) = (i % w, i / w);
        let next = [
            (y > 0).then(|| i - w),
            (x > 0).then(|| i - 1),
            (x + 1 < w).then(|| i + 1),
            (y + 1 < h).then(|| i + w),
        ];
        for n in next.into_iter().flatten() {
            if background[n] && !outside[n] {
                outside[n] = true;
                queue.push_back(n);
            }
        }
    }

    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let filled = !outside[y as usize * w + x as usize];
        image::Luma([if filled { FOREGROUND } else { BACKGROUND }])
    })
}

/// Measure one filled component.
///
/// `filled` must have a background border; `origin` is the image
/// position of its top-left cell. Returns `None` when the outer border
/// has fewer than three points or encloses no area.
#[must_use]
pub fn measure_filled(
    filled: &GrayImage,
    origin: PixelPoint,
    length: LengthMeasure,
) -> Option<FeatureRecord> {
    let outer = find_contours::<i32>(filled)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .map(|c| {
            c.points
                .into_iter()
                .map(|p| PixelPoint::new(p.x + origin.x, p.y + origin.y))
                .collect::<Vec<_>>()
        })
        .fold(None::<(f64, Vec<PixelPoint>)>, |best, pts| {
            let area = polygon_area(&pts);
            match best {
                Some((best_area, _)) if best_area >= area => best,
                _ => Some((area, pts)),
            }
        });

    let (area, points) = outer?;
    if points.len() < 3 || area <= 0.0 {
        return None;
    }

    let polygon = to_polygon(&points);
    let hull = polygon.convex_hull();
    let hull_area = hull.unsigned_area();
    let rect = rotated_rect(&hull)?;
    let (long, short) = (rect.long_side(), rect.short_side());
    if short <= 0.0 || hull_area <= 0.0 {
        return None;
    }
    let angle_deg = if rect.width >= rect.height {
        rect.angle_deg
    } else {
        normalize_angle(rect.angle_deg + 90.0)
    };

    let length = match length {
        LengthMeasure::Skeleton => skeleton_length(&zhang_suen(filled)),
        LengthMeasure::RectLongSide => long,
    };
    let pixel_count = filled.pixels().filter(|p| is_foreground(p.0[0])).count() as u64;

    Some(FeatureRecord {
        perimeter: perimeter(&points),
        contour: Contour::new(points),
        area,
        length,
        rect,
        aspect_ratio: long / short,
        angle_deg,
        hull_area,
        solidity: (area / hull_area).min(1.0),
        equivalent_diameter: 2.0 * (area / std::f64::consts::PI).sqrt(),
        pixel_count,
    })
}

/// Inclusive bounding box.
#[derive(Debug, Clone, Copy)]
struct Bounds {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

/// One feature per positive region, in ascending label order.
#[must_use = "returns the extracted features"]
pub fn extract_regions(map: &RegionMap, length: LengthMeasure) -> Vec<FeatureRecord> {
    let mut bounds: BTreeMap<i32, Bounds> = BTreeMap::new();
    for y in 0..map.height() {
        for x in 0..map.width() {
            let l = map.get(x, y);
            if l <= 0 {
                continue;
            }
            bounds
                .entry(l)
                .and_modify(|b| {
                    b.min_x = b.min_x.min(x);
                    b.min_y = b.min_y.min(y);
                    b.max_x = b.max_x.max(x);
                    b.max_y = b.max_y.max(y);
                })
                .or_insert(Bounds {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                });
        }
    }

    let mut features = Vec::with_capacity(bounds.len());
    for (label, b) in bounds {
        let crop = GrayImage::from_fn(b.max_x - b.min_x + 3, b.max_y - b.min_y + 3, |x, y| {
            // Out-of-range reads are unlabeled, which keeps the padding ring clear.
            let inside = x >= 1 && y >= 1 && map.get(b.min_x + x - 1, b.min_y + y - 1) == label;
            image::Luma([if inside { FOREGROUND } else { BACKGROUND }])
        });
        #[allow(clippy::cast_possible_wrap)]
        let origin = PixelPoint::new(b.min_x as i32 - 1, b.min_y as i32 - 1);
        match measure_filled(&fill_holes(&crop), origin, length) {
            Some(feature) => features.push(feature),
            None => log::trace!("region {label} is not measurable, skipped"),
        }
    }
    features
}

/// One feature per 8-connected foreground component, in raster order
/// of each component's first cell.
#[must_use = "returns the extracted features"]
pub fn extract_components(mask: &GrayImage, length: LengthMeasure) -> Vec<FeatureRecord> {
    extract_regions(&label_components(mask), length)
}
