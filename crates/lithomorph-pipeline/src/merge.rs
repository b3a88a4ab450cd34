//! Fusion of nearby, similarly oriented fracture fragments.
//!
//! # Algorithm
//!
//! 1. Build one R\*-tree of contour points per feature.
//! 2. For every pair whose orientations differ by at most the angle
//!    limit, find the minimum point-to-point distance with
//!    nearest-neighbour queries and union the pair when it is within
//!    the distance limit.
//! 3. Each union–find component with more than one member is replaced
//!    by the convex hull of all member points. The hull polygon becomes
//!    the fused contour; the measurements come from its rasterization,
//!    so length is the skeleton length of the fused shape.
//!
//! A single pass: fused features are not compared again.

use std::collections::HashMap;

use geo::{ConvexHull, Coord, Intersects, MultiPoint, Polygon};
use image::GrayImage;
use petgraph::unionfind::UnionFind;
use rstar::RTree;

use crate::contour::{FeatureRecord, LengthMeasure, fill_holes, measure_filled};
use crate::params::{AnalysisParameters, keys};
use crate::types::{BACKGROUND, Contour, FOREGROUND, PipelineError, PixelPoint};
use crate::units::UnitConverter;

/// Merge stage configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeConfig {
    /// Largest gap bridged, in pixels.
    pub max_distance_px: f64,
    /// Largest orientation difference, in degrees.
    pub max_angle_deg: f64,
}

impl MergeConfig {
    /// Read the merge configuration, converting the millimetre distance
    /// limit with `units`. Returns `None` when merging is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] for a missing or
    /// negative limit.
    pub fn from_params(
        params: &AnalysisParameters,
        units: &UnitConverter,
    ) -> Result<Option<Self>, PipelineError> {
        if !params.flag(keys::MERGE_ENABLED)? {
            return Ok(None);
        }
        let distance_mm = params.float(keys::MERGE_MAX_DISTANCE_MM)?;
        if distance_mm < 0.0 {
            return Err(PipelineError::invalid(
                keys::MERGE_MAX_DISTANCE_MM,
                format!("{distance_mm} is negative"),
            ));
        }
        let max_angle_deg = params.float(keys::MERGE_MAX_ANGLE)?;
        if !(0.0..=90.0).contains(&max_angle_deg) {
            return Err(PipelineError::invalid(
                keys::MERGE_MAX_ANGLE,
                format!("{max_angle_deg} is not in [0, 90]"),
            ));
        }
        Ok(Some(Self {
            max_distance_px: units.mm_to_px(distance_mm),
            max_angle_deg,
        }))
    }
}

/// Undirected difference between two orientations in degrees, in
/// `[0, 90]`.
#[must_use]
pub fn angle_difference(a: f64, b: f64) -> f64 {
    let d = (a - b).abs() % 180.0;
    d.min(180.0 - d)
}

fn point_tree(feature: &FeatureRecord) -> RTree<[f64; 2]> {
    RTree::bulk_load(
        feature
            .contour
            .points()
            .iter()
            .map(|p| [f64::from(p.x), f64::from(p.y)])
            .collect(),
    )
}

/// Smallest distance between any point of `a` and any point of `tree`.
fn min_distance(a: &FeatureRecord, tree: &RTree<[f64; 2]>) -> f64 {
    a.contour
        .points()
        .iter()
        .filter_map(|p| {
            let q = [f64::from(p.x), f64::from(p.y)];
            tree.nearest_neighbor(&q)
                .map(|n| (n[0] - q[0]).hypot(n[1] - q[1]))
        })
        .fold(f64::INFINITY, f64::min)
}

/// Outcome of a merge pass.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Features after fusion, ordered by each group's first member.
    pub features: Vec<FeatureRecord>,
    /// Number of groups that fused two or more inputs.
    pub fused_groups: usize,
}

/// Fuse features that are close and similarly oriented.
#[must_use = "returns the merged features"]
pub fn merge(features: Vec<FeatureRecord>, config: &MergeConfig) -> MergeOutcome {
    let n = features.len();
    if n < 2 {
        return MergeOutcome {
            features,
            fused_groups: 0,
        };
    }

    let trees: Vec<RTree<[f64; 2]>> = features.iter().map(point_tree).collect();
    let mut uf = UnionFind::<usize>::new(n);
    for i in 0..n {
        for j in i + 1..n {
            if angle_difference(features[i].angle_deg, features[j].angle_deg)
                > config.max_angle_deg
            {
                continue;
            }
            // Query the larger tree with the smaller point set.
            let d = if features[i].contour.len() <= features[j].contour.len() {
                min_distance(&features[i], &trees[j])
            } else {
                min_distance(&features[j], &trees[i])
            };
            if d <= config.max_distance_px {
                uf.union(i, j);
            }
        }
    }

    let mut group_of_root: HashMap<usize, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for i in 0..n {
        let root = uf.find_mut(i);
        let g = *group_of_root.entry(root).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[g].push(i);
    }

    let mut slots: Vec<Option<FeatureRecord>> = features.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(groups.len());
    let mut fused_groups = 0;
    for members in groups {
        if let [only] = members.as_slice() {
            out.extend(slots[*only].take());
            continue;
        }
        let taken: Vec<FeatureRecord> = members.iter().filter_map(|&i| slots[i].take()).collect();
        if let Some(fused) = fuse(&taken) {
            fused_groups += 1;
            out.push(fused);
        } else {
            log::warn!(
                "merge: hull of {} fragments is not measurable, keeping them apart",
                taken.len()
            );
            out.extend(taken);
        }
    }

    log::debug!("merge: {n} features in, {} out, {fused_groups} fused groups", out.len());
    MergeOutcome {
        features: out,
        fused_groups,
    }
}

/// Convex hull of all member points.
///
/// The returned contour is the hull polygon itself. Every other field is
/// measured from the rasterized hull, so `area` and `perimeter` are those
/// of the hull's pixel border rather than of the polygon.
fn fuse(members: &[FeatureRecord]) -> Option<FeatureRecord> {
    let points: MultiPoint<f64> = members
        .iter()
        .flat_map(|f| f.contour.points())
        .map(|p| geo::Point::new(f64::from(p.x), f64::from(p.y)))
        .collect();
    let hull = points.convex_hull();
    let (mask, origin) = rasterize(&hull)?;
    let mut fused = measure_filled(&fill_holes(&mask), origin, LengthMeasure::Skeleton)?;
    fused.contour = hull_contour(&hull);
    Some(fused)
}

/// Hull vertices as an open ring. Hull vertices are input points, so
/// the coordinates are whole pixels.
#[allow(clippy::cast_possible_truncation)]
fn hull_contour(hull: &Polygon<f64>) -> Contour {
    let ring = &hull.exterior().0;
    let open = ring.split_last().map_or(&ring[..], |(_, rest)| rest);
    Contour::new(
        open.iter()
            .map(|c| PixelPoint::new(c.x.round() as i32, c.y.round() as i32))
            .collect(),
    )
}

/// Cells whose centers touch `polygon`, cropped with a one-cell
/// background margin. Returns the crop and the image position of its
/// top-left cell.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn rasterize(polygon: &Polygon<f64>) -> Option<(GrayImage, PixelPoint)> {
    let coords: &[Coord<f64>] = &polygon.exterior().0;
    let min_x = coords.iter().map(|c| c.x).fold(f64::INFINITY, f64::min);
    let min_y = coords.iter().map(|c| c.y).fold(f64::INFINITY, f64::min);
    let max_x = coords.iter().map(|c| c.x).fold(f64::NEG_INFINITY, f64::max);
    let max_y = coords.iter().map(|c| c.y).fold(f64::NEG_INFINITY, f64::max);
    if !(min_x.is_finite() && min_y.is_finite() && max_x.is_finite() && max_y.is_finite()) {
        return None;
    }

    let origin = PixelPoint::new(min_x.floor() as i32 - 1, min_y.floor() as i32 - 1);
    let width = (max_x.ceil() - min_x.floor()) as u32 + 3;
    let height = (max_y.ceil() - min_y.floor()) as u32 + 3;
    let mask = GrayImage::from_fn(width, height, |x, y| {
        let center = geo::Point::new(
            f64::from(origin.x) + f64::from(x),
            f64::from(origin.y) + f64::from(y),
        );
        let inside = polygon.intersects(&center);
        image::Luma([if inside { FOREGROUND } else { BACKGROUND }])
    });
    Some((mask, origin))
}
