//! Marker-controlled flooding that splits touching pores or grains.
//!
//! The cleaned mask is opened once more, its distance transform picks
//! confident cores as seeds, and a priority flood grows the seeds
//! through the uncertain band between the cores and the dilated
//! foreground. Cells reached by two seeds at once become boundaries.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use image::GrayImage;
use imageproc::region_labelling::{Connectivity, connected_components};

use crate::distance::{DistanceMap, euclidean_distance};
use crate::morphology::{self, KernelShape, MorphOp};
use crate::params::{AnalysisParameters, keys};
use crate::types::{BACKGROUND, FOREGROUND, PipelineError, RegionMap, is_foreground};

/// How seed cores are picked from the distance map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeedThreshold {
    /// Cells farther than `fraction · max_distance` from background.
    Fraction(f64),
    /// Cells farther than a fixed distance in pixels.
    Distance(f64),
}

impl SeedThreshold {
    fn cutoff(self, max_distance: f64) -> f64 {
        match self {
            Self::Fraction(fraction) => fraction * max_distance,
            Self::Distance(distance) => distance,
        }
    }
}

/// Region separation configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SeparationConfig {
    /// Noise-removal opening (rectangular kernel).
    pub opening: MorphOp,
    /// Dilation that bounds the confident background.
    pub background: MorphOp,
    /// Seed selection rule.
    pub seeds: SeedThreshold,
}

impl SeparationConfig {
    /// Read the separation configuration. Returns `None` when
    /// separation is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] for a missing or
    /// invalid separation parameter.
    pub fn from_params(params: &AnalysisParameters) -> Result<Option<Self>, PipelineError> {
        if !params.flag(keys::SEPARATION_ENABLED)? {
            return Ok(None);
        }
        let opening = rect_op(
            params,
            keys::SEPARATION_OPEN_KERNEL_SIZE,
            keys::SEPARATION_OPEN_ITERATIONS,
        )?;
        let background = rect_op(
            params,
            keys::SEPARATION_BACKGROUND_KERNEL_SIZE,
            keys::SEPARATION_BACKGROUND_ITERATIONS,
        )?;

        let distance = params.float(keys::SEPARATION_SEED_DISTANCE)?;
        let seeds = if distance > 0.0 {
            SeedThreshold::Distance(distance)
        } else {
            let fraction = params.float(keys::SEPARATION_SEED_FRACTION)?;
            if !(fraction > 0.0 && fraction < 1.0) {
                return Err(PipelineError::invalid(
                    keys::SEPARATION_SEED_FRACTION,
                    format!("{fraction} is not in (0, 1)"),
                ));
            }
            SeedThreshold::Fraction(fraction)
        };

        Ok(Some(Self {
            opening,
            background,
            seeds,
        }))
    }
}

fn rect_op(
    params: &AnalysisParameters,
    size_key: &str,
    iterations_key: &str,
) -> Result<MorphOp, PipelineError> {
    MorphOp::checked(
        KernelShape::Rect,
        params.count(size_key)?,
        params.count(iterations_key)?,
        size_key,
        iterations_key,
    )
}

/// Everything the separator produced, intermediates included.
#[derive(Debug, Clone)]
pub struct Separation {
    /// Final labels, restricted to the opened foreground.
    pub regions: RegionMap,
    /// Opened foreground.
    pub opened: GrayImage,
    /// Dilated foreground.
    pub sure_background: GrayImage,
    /// Distance transform of the opened foreground.
    pub distance: DistanceMap,
    /// Seed cores.
    pub seeds: GrayImage,
    /// Cells the flood had to decide.
    pub unknown: GrayImage,
    /// Number of seed components.
    pub seed_count: usize,
}

/// Label 8-connected foreground components `1..=n` in raster order of
/// their first cell.
#[must_use = "returns the region map"]
pub fn label_components(mask: &GrayImage) -> RegionMap {
    let raw = connected_components(mask, Connectivity::Eight, image::Luma([BACKGROUND]));
    let mut remap: Vec<i32> = Vec::new();
    let mut next = 0;
    let labels = raw
        .pixels()
        .map(|p| {
            let l = p.0[0] as usize;
            if l == 0 {
                return RegionMap::UNKNOWN;
            }
            if remap.len() <= l {
                remap.resize(l + 1, 0);
            }
            if remap[l] == 0 {
                next += 1;
                remap[l] = next;
            }
            remap[l]
        })
        .collect();
    RegionMap::from_labels(mask.width(), mask.height(), labels)
        .unwrap_or_else(|| RegionMap::empty(mask.width(), mask.height()))
}

/// A queued cell. Lower `priority` pops first, then lower `seq`.
#[derive(Debug, Clone, Copy)]
struct Cell {
    priority: f64,
    seq: u64,
    index: usize,
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cell {}

impl PartialOrd for Cell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cell {
    // Reversed so the max-heap pops the lowest priority first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn neighbours4(index: usize, width: usize, height: usize) -> impl Iterator<Item = usize> {
    let (x, y) = (index % width, index / width);
    [
        (y > 0).then(|| index - width),
        (x > 0).then(|| index - 1),
        (x + 1 < width).then(|| index + 1),
        (y + 1 < height).then(|| index + width),
    ]
    .into_iter()
    .flatten()
}

/// Split the foreground of `mask` into separate regions.
#[must_use = "returns the separation result"]
pub fn separate(mask: &GrayImage, config: &SeparationConfig) -> Separation {
    let (w, h) = (mask.width(), mask.height());
    let opened = morphology::open(mask, &config.opening.element, config.opening.iterations);
    let sure_background = morphology::dilate(
        &opened,
        &config.background.element,
        config.background.iterations,
    );
    let distance = euclidean_distance(&opened);
    let max_distance = distance.max();

    let cutoff = config.seeds.cutoff(max_distance);
    let seeds = GrayImage::from_fn(w, h, |x, y| {
        let seed = max_distance > 0.0 && distance.get(x, y) > cutoff;
        image::Luma([if seed { FOREGROUND } else { BACKGROUND }])
    });
    let unknown = GrayImage::from_fn(w, h, |x, y| {
        let u = is_foreground(sure_background.get_pixel(x, y).0[0])
            && !is_foreground(seeds.get_pixel(x, y).0[0]);
        image::Luma([if u { FOREGROUND } else { BACKGROUND }])
    });

    let markers = label_components(&seeds);
    let seed_count = markers.region_count();
    log::debug!("separation: max distance {max_distance:.2}, cutoff {cutoff:.2}, {seed_count} seeds");

    let regions = if seed_count == 0 {
        RegionMap::empty(w, h)
    } else {
        flood(&markers, &unknown, &distance, max_distance, &opened)
    };

    Separation {
        regions,
        opened,
        sure_background,
        distance,
        seeds,
        unknown,
        seed_count,
    }
}

fn flood(
    markers: &RegionMap,
    unknown: &GrayImage,
    distance: &DistanceMap,
    max_distance: f64,
    opened: &GrayImage,
) -> RegionMap {
    let (width, height) = (markers.width() as usize, markers.height() as usize);
    let mut labels = markers.labels().to_vec();
    let floodable: Vec<bool> = unknown.pixels().map(|p| is_foreground(p.0[0])).collect();
    let mut queued = vec![false; labels.len()];
    let mut heap = BinaryHeap::new();
    let mut seq = 0_u64;

    let mut push = |heap: &mut BinaryHeap<Cell>, queued: &mut [bool], index: usize| {
        queued[index] = true;
        heap.push(Cell {
            priority: max_distance - distance.values()[index],
            seq,
            index,
        });
        seq += 1;
    };

    for index in 0..labels.len() {
        if labels[index] > 0 {
            for n in neighbours4(index, width, height) {
                if floodable[n] && labels[n] == RegionMap::UNKNOWN && !queued[n] {
                    push(&mut heap, &mut queued, n);
                }
            }
        }
    }

    while let Some(Cell { index, .. }) = heap.pop() {
        if labels[index] != RegionMap::UNKNOWN {
            continue;
        }
        let mut found = RegionMap::UNKNOWN;
        let mut conflict = false;
        for n in neighbours4(index, width, height) {
            let l = labels[n];
            if l > 0 {
                if found == RegionMap::UNKNOWN {
                    found = l;
                } else if found != l {
                    conflict = true;
                }
            }
        }
        if conflict {
            labels[index] = RegionMap::BOUNDARY;
            continue;
        }
        if found == RegionMap::UNKNOWN {
            continue;
        }
        labels[index] = found;
        for n in neighbours4(index, width, height) {
            if floodable[n] && labels[n] == RegionMap::UNKNOWN && !queued[n] {
                push(&mut heap, &mut queued, n);
            }
        }
    }

    for (label, p) in labels.iter_mut().zip(opened.pixels()) {
        if !is_foreground(p.0[0]) {
            *label = RegionMap::UNKNOWN;
        }
    }

    RegionMap::from_labels(markers.width(), markers.height(), labels)
        .unwrap_or_else(|| RegionMap::empty(markers.width(), markers.height()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn disc_mask(width: u32, height: u32, discs: &[(f64, f64, f64)]) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let inside = discs.iter().any(|&(cx, cy, r)| {
                let (dx, dy) = (f64::from(x) - cx, f64::from(y) - cy);
                dx.hypot(dy) <= r
            });
            image::Luma([if inside { FOREGROUND } else { BACKGROUND }])
        })
    }

    fn config(fraction: f64) -> SeparationConfig {
        with_seeds(SeedThreshold::Fraction(fraction))
    }

    fn with_seeds(seeds: SeedThreshold) -> SeparationConfig {
        SeparationConfig {
            opening: MorphOp::new(KernelShape::Rect, 3, 2).unwrap(),
            background: MorphOp::new(KernelShape::Rect, 3, 1).unwrap(),
            seeds,
        }
    }

    #[test]
    fn overlapping_discs_split_near_bisector() {
        let mask = disc_mask(90, 80, &[(30.0, 40.0, 20.0), (60.0, 40.0, 20.0)]);
        let result = separate(&mask, &config(0.75));
        assert_eq!(result.seed_count, 2);
        assert_eq!(result.regions.region_count(), 2);
        assert!(result.regions.boundary_count() > 0);

        let width = result.regions.width() as usize;
        for (i, &l) in result.regions.labels().iter().enumerate() {
            if l == RegionMap::BOUNDARY {
                #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
                let x = (i % width) as i64;
                assert!((x - 45).abs() <= 3, "boundary cell at x = {x}");
            }
        }
        // Left disc keeps the lower label: seeds are numbered in raster order.
        assert_eq!(result.regions.get(20, 40), 1);
        assert_eq!(result.regions.get(70, 40), 2);
    }

    #[test]
    fn single_disc_gives_one_region() {
        let mask = disc_mask(60, 60, &[(30.0, 30.0, 15.0)]);
        let result = separate(&mask, &config(0.6));
        assert_eq!(result.regions.region_count(), 1);
        assert_eq!(result.regions.boundary_count(), 0);
    }

    #[test]
    fn all_background_gives_empty_map() {
        let result = separate(&GrayImage::new(30, 20), &config(0.6));
        assert_eq!(result.seed_count, 0);
        assert!(result.regions.is_empty());
    }

    #[test]
    fn unreachable_fixed_seed_distance_gives_empty_map() {
        let mask = disc_mask(40, 40, &[(20.0, 20.0, 8.0)]);
        let config = with_seeds(SeedThreshold::Distance(100.0));
        assert!(separate(&mask, &config).regions.is_empty());
    }

    #[test]
    fn labels_stay_inside_opened_foreground() {
        let mask = disc_mask(90, 80, &[(30.0, 40.0, 20.0), (60.0, 40.0, 20.0)]);
        let result = separate(&mask, &config(0.6));
        for (l, p) in result.regions.labels().iter().zip(result.opened.pixels()) {
            if *l != RegionMap::UNKNOWN {
                assert!(is_foreground(p.0[0]));
            }
        }
    }

    #[test]
    fn separation_is_deterministic() {
        let mask = disc_mask(90, 80, &[(30.0, 40.0, 20.0), (58.0, 44.0, 18.0)]);
        let a = separate(&mask, &config(0.6));
        let b = separate(&mask, &config(0.6));
        assert_eq!(a.regions, b.regions);
    }

    #[test]
    fn components_numbered_in_raster_order() {
        let mut mask = GrayImage::new(10, 10);
        mask.put_pixel(8, 1, image::Luma([FOREGROUND]));
        mask.put_pixel(1, 5, image::Luma([FOREGROUND]));
        mask.put_pixel(2, 6, image::Luma([FOREGROUND]));
        let map = label_components(&mask);
        assert_eq!(map.get(8, 1), 1);
        assert_eq!(map.get(1, 5), 2);
        assert_eq!(map.get(2, 6), 2);
    }

    #[test]
    fn from_params_disabled_is_none() {
        let params = AnalysisParameters::new().with(keys::SEPARATION_ENABLED, false);
        assert!(SeparationConfig::from_params(&params).unwrap().is_none());
    }

    #[test]
    fn from_params_prefers_fixed_distance() {
        let params = AnalysisParameters::new()
            .with(keys::SEPARATION_ENABLED, true)
            .with(keys::SEPARATION_OPEN_KERNEL_SIZE, 3_i64)
            .with(keys::SEPARATION_OPEN_ITERATIONS, 2_i64)
            .with(keys::SEPARATION_BACKGROUND_KERNEL_SIZE, 3_i64)
            .with(keys::SEPARATION_BACKGROUND_ITERATIONS, 1_i64)
            .with(keys::SEPARATION_SEED_FRACTION, 0.6)
            .with(keys::SEPARATION_SEED_DISTANCE, 4.0);
        let config = SeparationConfig::from_params(&params).unwrap().unwrap();
        assert_eq!(config.seeds, SeedThreshold::Distance(4.0));
    }

    #[test]
    fn from_params_rejects_fraction_out_of_range() {
        let params = AnalysisParameters::new()
            .with(keys::SEPARATION_ENABLED, true)
            .with(keys::SEPARATION_OPEN_KERNEL_SIZE, 3_i64)
            .with(keys::SEPARATION_OPEN_ITERATIONS, 2_i64)
            .with(keys::SEPARATION_BACKGROUND_KERNEL_SIZE, 3_i64)
            .with(keys::SEPARATION_BACKGROUND_ITERATIONS, 1_i64)
            .with(keys::SEPARATION_SEED_FRACTION, 1.5)
            .with(keys::SEPARATION_SEED_DISTANCE, 0.0);
        assert!(SeparationConfig::from_params(&params).is_err());
    }
}
