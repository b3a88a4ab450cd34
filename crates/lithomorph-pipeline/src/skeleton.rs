//! Zhang–Suen thinning and skeleton path length.
//!
//! Fracture length is the length of the medial skeleton of the filled
//! component, not the perimeter or bounding box, so curved and
//! branching fractures measure what they look like.

use image::GrayImage;

use crate::types::{BACKGROUND, FOREGROUND, is_foreground};

/// Thin a binary mask to a one-pixel-wide skeleton. Cells outside the
/// image are background.
#[must_use = "returns the skeleton"]
pub fn zhang_suen(mask: &GrayImage) -> GrayImage {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let mut cells: Vec<bool> = mask.pixels().map(|p| is_foreground(p.0[0])).collect();
    let mut doomed = Vec::new();

    loop {
        let mut changed = false;
        for first_pass in [true, false] {
            doomed.clear();
            for y in 0..h {
                for x in 0..w {
                    if cells[y * w + x] && removable(&cells, w, h, x, y, first_pass) {
                        doomed.push(y * w + x);
                    }
                }
            }
            for &i in &doomed {
                cells[i] = false;
            }
            changed |= !doomed.is_empty();
        }
        if !changed {
            break;
        }
    }

    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let on = cells[y as usize * w + x as usize];
        image::Luma([if on { FOREGROUND } else { BACKGROUND }])
    })
}

/// Neighbours `P2..=P9`, clockwise from north.
fn ring(cells: &[bool], w: usize, h: usize, x: usize, y: usize) -> [bool; 8] {
    let at = |dx: isize, dy: isize| -> bool {
        match (x.checked_add_signed(dx), y.checked_add_signed(dy)) {
            (Some(nx), Some(ny)) if nx < w && ny < h => cells[ny * w + nx],
            _ => false,
        }
    };
    [
        at(0, -1),
        at(1, -1),
        at(1, 0),
        at(1, 1),
        at(0, 1),
        at(-1, 1),
        at(-1, 0),
        at(-1, -1),
    ]
}

fn removable(cells: &[bool], w: usize, h: usize, x: usize, y: usize, first_pass: bool) -> bool {
    let p = ring(cells, w, h, x, y);
    let neighbours = p.iter().filter(|&&v| v).count();
    if !(2..=6).contains(&neighbours) {
        return false;
    }
    let transitions = (0..8).filter(|&i| !p[i] && p[(i + 1) % 8]).count();
    if transitions != 1 {
        return false;
    }
    let [p2, _, p4, _, p6, _, p8, _] = p;
    if first_pass {
        !(p2 && p4 && p6) && !(p4 && p6 && p8)
    } else {
        !(p2 && p4 && p8) && !(p2 && p6 && p8)
    }
}

/// Total length of the 8-connected paths through a skeleton.
///
/// Each orthogonal link counts 1. A diagonal link counts √2 only when
/// neither of the two cells it cuts across is set, so an L-shaped step
/// is not counted twice.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn skeleton_length(skeleton: &GrayImage) -> f64 {
    let (w, h) = (skeleton.width(), skeleton.height());
    let on = |x: i64, y: i64| -> bool {
        x >= 0
            && y >= 0
            && x < i64::from(w)
            && y < i64::from(h)
            && is_foreground(skeleton.get_pixel(x as u32, y as u32).0[0])
    };

    let mut orthogonal = 0_u64;
    let mut diagonal = 0_u64;
    for y in 0..i64::from(h) {
        for x in 0..i64::from(w) {
            if !on(x, y) {
                continue;
            }
            if on(x + 1, y) {
                orthogonal += 1;
            }
            if on(x, y + 1) {
                orthogonal += 1;
            }
            if on(x + 1, y + 1) && !on(x + 1, y) && !on(x, y + 1) {
                diagonal += 1;
            }
            if on(x - 1, y + 1) && !on(x - 1, y) && !on(x, y + 1) {
                diagonal += 1;
            }
        }
    }
    (diagonal as f64).mul_add(std::f64::consts::SQRT_2, orthogonal as f64)
}
