//! Pixel ↔ millimetre conversion.

use serde::{Deserialize, Serialize};

use crate::types::Resolution;

/// Millimetres per inch.
pub const MM_PER_INCH: f64 = 25.4;

/// DPI assumed when the image carries no usable resolution.
pub const DEFAULT_DPI: f64 = 96.0;

/// The DPI a run actually used.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDpi {
    /// Dots per inch.
    pub dpi: f64,
    /// `true` when [`DEFAULT_DPI`] was substituted.
    pub degraded: bool,
}

impl ResolvedDpi {
    /// Pick the horizontal DPI, falling back to vertical, then to
    /// [`DEFAULT_DPI`].
    #[must_use]
    pub fn resolve(resolution: Resolution) -> Self {
        let usable = |v: Option<f64>| v.filter(|d| d.is_finite() && *d > 0.0);
        match usable(resolution.horizontal_dpi).or_else(|| usable(resolution.vertical_dpi)) {
            Some(dpi) => Self {
                dpi,
                degraded: false,
            },
            None => {
                log::warn!("no usable DPI in image metadata, assuming {DEFAULT_DPI}");
                Self {
                    dpi: DEFAULT_DPI,
                    degraded: true,
                }
            }
        }
    }
}

/// Converts lengths and areas between pixels and millimetres at a fixed
/// DPI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConverter {
    dpi: f64,
}

impl UnitConverter {
    /// Converter for a known-good DPI. Non-positive or non-finite
    /// values fall back to [`DEFAULT_DPI`].
    #[must_use]
    pub fn new(dpi: f64) -> Self {
        let dpi = if dpi.is_finite() && dpi > 0.0 {
            dpi
        } else {
            DEFAULT_DPI
        };
        Self { dpi }
    }

    /// Converter for a resolved DPI.
    #[must_use]
    pub fn from_resolved(resolved: ResolvedDpi) -> Self {
        Self::new(resolved.dpi)
    }

    /// DPI in use.
    #[must_use]
    pub const fn dpi(&self) -> f64 {
        self.dpi
    }

    /// Length in pixels to millimetres.
    #[must_use]
    pub fn px_to_mm(&self, px: f64) -> f64 {
        px / self.dpi * MM_PER_INCH
    }

    /// Length in millimetres to pixels.
    #[must_use]
    pub fn mm_to_px(&self, mm: f64) -> f64 {
        mm / MM_PER_INCH * self.dpi
    }

    /// Area in square pixels to square millimetres.
    #[must_use]
    pub fn area_px_to_mm2(&self, px2: f64) -> f64 {
        let mm_per_px = MM_PER_INCH / self.dpi;
        px2 * mm_per_px * mm_per_px
    }

    /// Area in square millimetres to square pixels.
    #[must_use]
    pub fn area_mm2_to_px(&self, mm2: f64) -> f64 {
        let px_per_mm = self.dpi / MM_PER_INCH;
        mm2 * px_per_mm * px_per_mm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_inch_is_dpi_pixels() {
        let units = UnitConverter::new(300.0);
        assert!((units.px_to_mm(300.0) - 25.4).abs() < 1e-9);
        assert!((units.mm_to_px(25.4) - 300.0).abs() < 1e-9);
        assert!((units.area_px_to_mm2(90_000.0) - 645.16).abs() < 1e-6);
    }

    #[test]
    fn conversions_round_trip() {
        let units = UnitConverter::new(137.5);
        for v in [0.0, 1.0, 12.345, 4096.0] {
            assert!((units.mm_to_px(units.px_to_mm(v)) - v).abs() < 1e-9 * v.max(1.0));
            assert!(
                (units.area_mm2_to_px(units.area_px_to_mm2(v)) - v).abs() < 1e-9 * v.max(1.0)
            );
        }
    }

    #[test]
    fn resolve_prefers_horizontal() {
        let r = ResolvedDpi::resolve(Resolution::new(300.0, 150.0));
        assert!((r.dpi - 300.0).abs() < f64::EPSILON);
        assert!(!r.degraded);
    }

    #[test]
    fn resolve_falls_back_to_vertical() {
        let r = ResolvedDpi::resolve(Resolution {
            horizontal_dpi: Some(0.0),
            vertical_dpi: Some(200.0),
        });
        assert!((r.dpi - 200.0).abs() < f64::EPSILON);
        assert!(!r.degraded);
    }

    #[test]
    fn missing_dpi_is_degraded() {
        let r = ResolvedDpi::resolve(Resolution::default());
        assert!((r.dpi - DEFAULT_DPI).abs() < f64::EPSILON);
        assert!(r.degraded);

        let r = ResolvedDpi::resolve(Resolution::new(-5.0, f64::NAN));
        assert!(r.degraded);
    }

    #[test]
    fn invalid_converter_dpi_uses_default() {
        assert!((UnitConverter::new(0.0).dpi() - DEFAULT_DPI).abs() < f64::EPSILON);
    }
}
