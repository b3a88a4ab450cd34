//! CSV export serializer.
//!
//! One row per surviving feature, preceded by `#` comment lines that
//! carry the source, analysis kind, DPI, and totals. Millimetre cells
//! are left empty when the measurements were never converted.
//!
//! This is a pure function with no I/O -- it returns a `String`.

use std::fmt::Write;

use lithomorph_pipeline::{
    AnalysisKind, FeatureMeasurement, Measurements, ResolvedDpi, ResultRecord,
};

use crate::ExportError;

/// Column names of the detail table.
pub const HEADER: &str = "id,area_px,length_px,perimeter_px,aspect_ratio,angle_deg,solidity,\
                          equivalent_diameter_px,area_mm2,length_mm,equivalent_diameter_mm";

/// Metadata to embed as `#`-prefixed comment lines above the table.
#[derive(Debug, Clone, Default)]
pub struct CsvMetadata<'a> {
    /// Source image name, emitted as `# Source: <title>`.
    pub title: Option<&'a str>,

    /// Parameter set JSON, emitted as `# Parameters: <json>`.
    pub params_json: Option<&'a str>,
}

/// Serialize measurements into a CSV string.
///
/// # Examples
///
/// ```
/// use lithomorph_export::{CsvMetadata, to_csv};
/// use lithomorph_pipeline::{Measurements, ResolvedDpi};
///
/// let measurements = Measurements::Pore {
///     count: 0,
///     total_area_px: 0.0,
///     porosity: 0.0,
///     total_area_mm2: None,
///     details: Vec::new(),
/// };
/// let dpi = ResolvedDpi { dpi: 96.0, degraded: true };
/// let csv = to_csv(&measurements, dpi, &CsvMetadata::default());
/// assert!(csv.contains("# Analysis: pore"));
/// assert!(csv.contains("# DPI: 96 (assumed)"));
/// ```
#[must_use]
pub fn to_csv(measurements: &Measurements, dpi: ResolvedDpi, metadata: &CsvMetadata<'_>) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# lithomorph");
    if let Some(title) = metadata.title {
        for line in title.lines() {
            let _ = writeln!(out, "# Source: {line}");
        }
    }
    let _ = writeln!(out, "# Analysis: {}", kind_of(measurements).id());
    if dpi.degraded {
        let _ = writeln!(out, "# DPI: {} (assumed)", dpi.dpi);
    } else {
        let _ = writeln!(out, "# DPI: {}", dpi.dpi);
    }
    for (label, value) in summary(measurements) {
        let _ = writeln!(out, "# {label}: {value}");
    }
    if let Some(params_json) = metadata.params_json {
        for line in params_json.lines() {
            let _ = writeln!(out, "# Parameters: {line}");
        }
    }

    let _ = writeln!(out, "{HEADER}");
    for (i, detail) in measurements.details().iter().enumerate() {
        write_row(&mut out, i + 1, detail);
    }

    out
}

/// Serialize a finished [`ResultRecord`].
///
/// # Errors
///
/// Returns [`ExportError::NotMeasured`] for a record from a run that
/// stopped early, and [`ExportError::NoFeatures`] when nothing was
/// detected.
pub fn record_to_csv(record: &ResultRecord, metadata: &CsvMetadata<'_>) -> Result<String, ExportError> {
    let measurements = record
        .measurements()
        .ok_or(ExportError::NotMeasured(record.completed_stage()))?;
    if measurements.details().is_empty() {
        return Err(ExportError::NoFeatures);
    }
    Ok(to_csv(measurements, record.dpi(), metadata))
}

const fn kind_of(measurements: &Measurements) -> AnalysisKind {
    match measurements {
        Measurements::Fracture { .. } => AnalysisKind::Fracture,
        Measurements::Pore { .. } => AnalysisKind::Pore,
        Measurements::Grain { .. } => AnalysisKind::Grain,
    }
}

fn summary(measurements: &Measurements) -> Vec<(&'static str, String)> {
    let mut lines = vec![
        ("Count", measurements.count().to_string()),
        ("Total area px2", number(measurements.total_area_px())),
    ];
    match measurements {
        Measurements::Fracture {
            total_length_px,
            total_area_mm2,
            total_length_mm,
            ..
        } => {
            lines.push(("Total length px", number(*total_length_px)));
            lines.push(("Total area mm2", optional(*total_area_mm2)));
            lines.push(("Total length mm", optional(*total_length_mm)));
        }
        Measurements::Pore {
            porosity,
            total_area_mm2,
            ..
        } => {
            lines.push(("Porosity", number(*porosity)));
            lines.push(("Total area mm2", optional(*total_area_mm2)));
        }
        Measurements::Grain {
            area_fraction,
            mean_equivalent_diameter_px,
            total_area_mm2,
            mean_equivalent_diameter_mm,
            ..
        } => {
            lines.push(("Area fraction", number(*area_fraction)));
            lines.push(("Mean equivalent diameter px", number(*mean_equivalent_diameter_px)));
            lines.push(("Total area mm2", optional(*total_area_mm2)));
            lines.push(("Mean equivalent diameter mm", optional(*mean_equivalent_diameter_mm)));
        }
    }
    lines
}

fn write_row(out: &mut String, id: usize, d: &FeatureMeasurement) {
    let _ = writeln!(
        out,
        "{id},{},{},{},{},{},{},{},{},{},{}",
        number(d.area_px),
        number(d.length_px),
        number(d.perimeter_px),
        number(d.aspect_ratio),
        number(d.angle_deg),
        number(d.solidity),
        number(d.equivalent_diameter_px),
        optional(d.area_mm2),
        optional(d.length_mm),
        optional(d.equivalent_diameter_mm),
    );
}

/// Four decimal places.
fn number(v: f64) -> String {
    format!("{v:.4}")
}

fn optional(v: Option<f64>) -> String {
    v.map(number).unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn detail(area: f64, mm: bool) -> FeatureMeasurement {
        FeatureMeasurement {
            area_px: area,
            length_px: 40.0,
            perimeter_px: 84.5,
            aspect_ratio: 8.0,
            angle_deg: 12.25,
            solidity: 0.9,
            equivalent_diameter_px: 7.0,
            area_mm2: mm.then_some(area * 0.01),
            length_mm: mm.then_some(4.0),
            equivalent_diameter_mm: mm.then_some(0.7),
        }
    }

    fn fractures(mm: bool) -> Measurements {
        Measurements::Fracture {
            count: 2,
            total_area_px: 300.0,
            total_length_px: 80.0,
            total_area_mm2: mm.then_some(3.0),
            total_length_mm: mm.then_some(8.0),
            details: vec![detail(100.0, mm), detail(200.0, mm)],
        }
    }

    fn measured() -> ResolvedDpi {
        ResolvedDpi {
            dpi: 254.0,
            degraded: false,
        }
    }

    fn table(csv: &str) -> Vec<&str> {
        csv.lines().filter(|l| !l.starts_with('#')).collect()
    }

    #[test]
    fn one_row_per_feature_after_header() {
        let csv = to_csv(&fractures(true), measured(), &CsvMetadata::default());
        let rows = table(&csv);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], HEADER);
        assert!(rows[1].starts_with("1,100.0000,40.0000,84.5000,8.0000,12.2500,"));
        assert!(rows[2].starts_with("2,200.0000,"));
        assert!(rows[2].ends_with(",2.0000,4.0000,0.7000"));
    }

    #[test]
    fn every_row_has_header_width() {
        let csv = to_csv(&fractures(false), measured(), &CsvMetadata::default());
        let width = HEADER.split(',').count();
        for row in table(&csv) {
            assert_eq!(row.split(',').count(), width, "{row}");
        }
    }

    #[test]
    fn unconverted_millimetres_are_blank() {
        let csv = to_csv(&fractures(false), measured(), &CsvMetadata::default());
        assert!(table(&csv)[1].ends_with(",,,"));
        assert!(csv.contains("# Total area mm2: \n"));
    }

    #[test]
    fn header_comments() {
        let metadata = CsvMetadata {
            title: Some("core-12"),
            params_json: Some("{\"threshold.method\":\"sauvola\"}"),
        };
        let csv = to_csv(&fractures(true), measured(), &metadata);
        let comments: Vec<&str> = csv.lines().take_while(|l| l.starts_with('#')).collect();
        assert_eq!(comments[0], "# lithomorph");
        assert_eq!(comments[1], "# Source: core-12");
        assert_eq!(comments[2], "# Analysis: fracture");
        assert_eq!(comments[3], "# DPI: 254");
        assert!(comments.contains(&"# Count: 2"));
        assert!(comments.contains(&"# Total length px: 80.0000"));
        assert_eq!(
            *comments.last().unwrap(),
            "# Parameters: {\"threshold.method\":\"sauvola\"}"
        );
    }

    #[test]
    fn grain_summary_lines() {
        let grains = Measurements::Grain {
            count: 1,
            total_area_px: 50.0,
            area_fraction: 0.25,
            mean_equivalent_diameter_px: 7.98,
            total_area_mm2: None,
            mean_equivalent_diameter_mm: None,
            details: vec![detail(50.0, false)],
        };
        let dpi = ResolvedDpi {
            dpi: 96.0,
            degraded: true,
        };
        let csv = to_csv(&grains, dpi, &CsvMetadata::default());
        assert!(csv.contains("# Analysis: grain\n"));
        assert!(csv.contains("# DPI: 96 (assumed)\n"));
        assert!(csv.contains("# Area fraction: 0.2500\n"));
        assert!(csv.contains("# Mean equivalent diameter px: 7.9800\n"));
    }
}
