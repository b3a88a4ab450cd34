//! Integration test: encoded images through the public analysis API.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::cell::Cell;
use std::time::Duration;

use image::{GrayImage, ImageEncoder, Luma};
use lithomorph_pipeline::params::keys;
use lithomorph_pipeline::{
    AnalysisContext, AnalysisKind, Clock, Measurements, PipelineError, SnapshotKey, SourceImage,
    StageId, analyze, analyze_with_diagnostics, resolution,
};

fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .is_test(true)
        .try_init();
}

/// Clock that advances by one millisecond per reading.
struct StepClock(Cell<u64>);

impl Clock for StepClock {
    type Instant = u64;

    fn now(&self) -> u64 {
        let t = self.0.get() + 1;
        self.0.set(t);
        t
    }

    fn elapsed(&self, since: &u64) -> Duration {
        Duration::from_millis(self.now() - since)
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF_u32;
    for &b in bytes {
        crc ^= u32::from(b);
        for _ in 0..8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

/// Encode `gray` as PNG with a `pHYs` chunk declaring `dpi`.
fn png_with_dpi(gray: &GrayImage, dpi: f64) -> Vec<u8> {
    let mut plain = Vec::new();
    image::codecs::png::PngEncoder::new(&mut plain)
        .write_image(
            gray.as_raw(),
            gray.width(),
            gray.height(),
            image::ExtendedColorType::L8,
        )
        .unwrap();

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let per_metre = (dpi / 0.0254).round() as u32;
    let mut body = b"pHYs".to_vec();
    body.extend_from_slice(&per_metre.to_be_bytes());
    body.extend_from_slice(&per_metre.to_be_bytes());
    body.push(1);

    let mut chunk = 9_u32.to_be_bytes().to_vec();
    chunk.extend_from_slice(&body);
    chunk.extend_from_slice(&crc32(&body).to_be_bytes());

    // Signature (8) + IHDR chunk (4 + 4 + 13 + 4).
    let ihdr_end = 33;
    let mut out = plain[..ihdr_end].to_vec();
    out.extend_from_slice(&chunk);
    out.extend_from_slice(&plain[ihdr_end..]);
    out
}

fn decode(bytes: &[u8]) -> SourceImage {
    let gray = image::load_from_memory(bytes).unwrap().to_luma8();
    SourceImage::new(gray).with_resolution(resolution::read_dpi(bytes))
}

/// Thin dark crack running diagonally across a light core.
fn cracked_core() -> GrayImage {
    GrayImage::from_fn(160, 120, |x, y| {
        let (fx, fy) = (f64::from(x), f64::from(y));
        let off_line = (fy - (0.5f64.mul_add(fx, 20.0))).abs();
        let on = off_line < 3.0 && (15.0..145.0).contains(&fx);
        Luma([if on { 25 } else { 215 }])
    })
}

/// Two overlapping dark pores.
fn touching_pores() -> GrayImage {
    GrayImage::from_fn(112, 80, |x, y| {
        let inside =
            |cx: f64, cy: f64| (f64::from(x) - cx).hypot(f64::from(y) - cy) <= 20.0;
        let on = inside(38.0, 40.0) || inside(74.0, 40.0);
        Luma([if on { 30 } else { 220 }])
    })
}

#[test]
fn png_resolution_reaches_measurements() {
    init_logging();
    let bytes = png_with_dpi(&cracked_core(), 300.0);
    let source = decode(&bytes);
    let dpi = source.resolution().horizontal_dpi.unwrap();
    assert!((dpi - 300.0).abs() < 0.1, "{dpi}");

    let record = analyze(&source, &AnalysisContext::new(AnalysisKind::Fracture), None).unwrap();
    assert!(!record.dpi().degraded);
    assert!(!record.is_empty());
    assert_eq!(record.features().len(), 1);

    match record.measurements().unwrap() {
        Measurements::Fracture {
            total_length_px,
            total_length_mm,
            ..
        } => {
            let expected = total_length_px * 25.4 / record.dpi().dpi;
            assert!((total_length_mm.unwrap() - expected).abs() < 1e-9);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn plain_png_falls_back_to_default_dpi() {
    init_logging();
    let mut bytes = Vec::new();
    let gray = touching_pores();
    image::codecs::png::PngEncoder::new(&mut bytes)
        .write_image(
            gray.as_raw(),
            gray.width(),
            gray.height(),
            image::ExtendedColorType::L8,
        )
        .unwrap();

    let record = analyze(&decode(&bytes), &AnalysisContext::new(AnalysisKind::Pore), None).unwrap();
    assert!(record.dpi().degraded);
    assert!((record.dpi().dpi - 96.0).abs() < f64::EPSILON);
}

#[test]
fn overlapping_pores_split_near_bisector() {
    init_logging();
    let source = SourceImage::new(touching_pores());
    let record = analyze(&source, &AnalysisContext::new(AnalysisKind::Pore), None).unwrap();
    assert_eq!(record.features().len(), 2);

    let mut right_edges: Vec<i32> = record
        .features()
        .iter()
        .map(|f| f.contour.points().iter().map(|p| p.x).max().unwrap())
        .collect();
    right_edges.sort_unstable();
    // The left pore's right edge sits on the split line at x = 56.
    assert!((50..=62).contains(&right_edges[0]), "{right_edges:?}");
}

#[test]
fn global_threshold_splits_two_levels() {
    init_logging();
    let gray = GrayImage::from_fn(40, 20, |x, _| Luma([if x < 20 { 50 } else { 200 }]));
    let context = AnalysisContext::new(AnalysisKind::Fracture)
        .with(keys::BLUR_SIGMA, 0.0)
        .with(keys::THRESHOLD_METHOD, "global")
        .with(keys::THRESHOLD_VALUE, 125_i64)
        .with(keys::THRESHOLD_INVERT, false);
    let record = analyze(&SourceImage::new(gray), &context, Some(StageId::Binary)).unwrap();

    let binary = record.snapshot(SnapshotKey::Binary).unwrap();
    for (x, _, p) in binary.enumerate_pixels() {
        let expected = if x < 20 { 0 } else { 255 };
        assert_eq!(p.0[0], expected, "x = {x}");
    }
}

#[test]
fn blank_core_is_empty_not_an_error() {
    init_logging();
    let source = SourceImage::new(GrayImage::from_pixel(80, 60, Luma([240])));
    for kind in AnalysisKind::ALL {
        let record = analyze(&source, &AnalysisContext::new(kind), None).unwrap();
        assert!(record.is_empty(), "{kind}");
        assert!(record.message().is_some());
        assert!(record.features().is_empty());
    }
}

#[test]
fn zero_sized_image_fails_but_single_pixel_is_empty() {
    init_logging();
    for kind in AnalysisKind::ALL {
        let context = AnalysisContext::new(kind);
        let err = analyze(&SourceImage::new(GrayImage::new(0, 0)), &context, None).unwrap_err();
        assert_eq!(err, PipelineError::EmptyImage);

        let dot = SourceImage::new(GrayImage::from_pixel(1, 1, Luma([128])));
        let record = analyze(&dot, &context, None).unwrap();
        assert!(record.is_empty(), "{kind}");
        assert!(record.message().is_some());
    }
}

#[test]
fn staged_preview_collects_separation_snapshots() {
    init_logging();
    let source = SourceImage::new(touching_pores());
    let record = analyze(
        &source,
        &AnalysisContext::new(AnalysisKind::Grain),
        Some(StageId::Separation),
    )
    .unwrap();
    let keys: Vec<SnapshotKey> = record.snapshots().keys().copied().collect();
    assert_eq!(
        keys,
        [
            SnapshotKey::Gray,
            SnapshotKey::Blurred,
            SnapshotKey::Binary,
            SnapshotKey::Morph,
            SnapshotKey::SureBackground,
            SnapshotKey::Distance,
            SnapshotKey::Seeds,
            SnapshotKey::Unknown,
            SnapshotKey::Regions,
        ]
    );
    assert!(record.measurements().is_none());
}

#[test]
fn unknown_parameter_is_rejected() {
    let context = AnalysisContext::new(AnalysisKind::Grain).with(keys::MERGE_ENABLED, true);
    let err = analyze(&SourceImage::new(touching_pores()), &context, None).unwrap_err();
    assert_eq!(
        err,
        PipelineError::UnknownParameter(keys::MERGE_ENABLED.to_owned())
    );
}

#[test]
fn diagnostics_match_plain_run() {
    init_logging();
    let source = SourceImage::new(touching_pores());
    let context = AnalysisContext::new(AnalysisKind::Pore);
    let clock = StepClock(Cell::new(0));

    let (record, diagnostics) = analyze_with_diagnostics(&source, &context, None, &clock).unwrap();
    let plain = analyze(&source, &context, None).unwrap();
    assert_eq!(record.features(), plain.features());
    assert_eq!(record.measurements(), plain.measurements());

    assert_eq!(diagnostics.feature_count, Some(2));
    assert_eq!(diagnostics.stages.len(), StageId::ALL.len() - 1);
    assert!(diagnostics.total_duration > Duration::ZERO);

    let report = diagnostics.report();
    assert!(report.contains("Features: 2"), "{report}");

    let json = serde_json::to_string_pretty(&diagnostics).unwrap();
    assert!(json.contains("\"total_duration\""));
}
