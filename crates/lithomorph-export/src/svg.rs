//! SVG export serializer.
//!
//! Converts feature contours into an SVG overlay in image pixel
//! coordinates, one closed `<path>` per feature, using the [`svg`]
//! crate for document construction, XML escaping, and path data
//! formatting.
//!
//! Fractures are stroked in the same green as the raster
//! visualization; pores and grains get a stable colour per feature.
//!
//! This is a pure function with no I/O -- it returns a `String`.

use svg::Document;
use svg::node::element::path::Data;
use svg::node::element::{Description, Element, Path, Title};
use svg::node::{Node, Text, Value};

use lithomorph_pipeline::render::{OUTLINE, label_color};
use lithomorph_pipeline::{AnalysisKind, Contour, Dimensions, FeatureRecord};

/// Metadata to embed in the SVG document.
///
/// All fields are optional. Text values are XML-escaped by the `svg`
/// crate.
#[derive(Debug, Clone, Default)]
pub struct SvgMetadata<'a> {
    /// Document title, emitted as `<title>`.
    ///
    /// Typically the source image file stem.
    pub title: Option<&'a str>,

    /// Document description, emitted as `<desc>`.
    pub description: Option<&'a str>,

    /// Parameter set JSON, emitted inside `<metadata>` as a namespaced
    /// `<lithomorph:parameters>` element so the overlay records how it
    /// was produced.
    pub params_json: Option<&'a str>,
}

/// Build a closed SVG path `d` attribute string from a contour.
///
/// Returns an empty string for contours with fewer than 2 points.
///
/// # Examples
///
/// ```
/// use lithomorph_pipeline::{Contour, PixelPoint};
/// use lithomorph_export::build_path_data;
///
/// let contour = Contour::new(vec![
///     PixelPoint::new(1, 2),
///     PixelPoint::new(5, 2),
///     PixelPoint::new(5, 6),
/// ]);
/// assert_eq!(build_path_data(&contour), "M1,2 L5,2 L5,6 z");
/// ```
#[must_use]
pub fn build_path_data(contour: &Contour) -> String {
    let points = contour.points();
    if points.len() < 2 {
        return String::new();
    }

    let first = points[0];
    let mut data = Data::new().move_to((f64::from(first.x), f64::from(first.y)));
    for p in &points[1..] {
        data = data.line_to((f64::from(p.x), f64::from(p.y)));
    }
    String::from(Value::from(data.close()))
}

/// Serialize feature contours into an SVG string sized to the source
/// image.
///
/// # Examples
///
/// ```
/// use lithomorph_pipeline::{AnalysisKind, Dimensions};
/// use lithomorph_export::{SvgMetadata, to_svg};
///
/// let dims = Dimensions { width: 640, height: 480 };
/// let metadata = SvgMetadata {
///     title: Some("core-7"),
///     ..SvgMetadata::default()
/// };
/// let svg = to_svg(&[], AnalysisKind::Pore, dims, &metadata);
/// assert!(svg.contains("<title>core-7</title>"));
/// assert!(svg.contains(r#"viewBox="0 0 640 480""#));
/// ```
#[must_use]
pub fn to_svg(
    features: &[FeatureRecord],
    kind: AnalysisKind,
    dimensions: Dimensions,
    metadata: &SvgMetadata<'_>,
) -> String {
    let w = dimensions.width;
    let h = dimensions.height;
    let mut doc = Document::new()
        .set("width", w)
        .set("height", h)
        .set("viewBox", (0, 0, w, h));

    if let Some(title) = metadata.title {
        doc = doc.add(Title::new(title));
    }

    if let Some(description) = metadata.description {
        doc = doc.add(Description::new().add(Text::new(description)));
    }

    if let Some(params_json) = metadata.params_json {
        let mut params_el = Element::new("lithomorph:parameters");
        params_el.assign("xmlns:lithomorph", "urn:lithomorph:analysis");
        params_el.assign("kind", kind.id());
        params_el.append(Text::new(params_json));
        let mut metadata_el = Element::new("metadata");
        metadata_el.append(params_el);
        doc = doc.add(metadata_el);
    }

    for (i, feature) in features.iter().enumerate() {
        let d = build_path_data(&feature.contour);
        if d.is_empty() {
            continue;
        }

        let path = Path::new()
            .set("id", format!("feature-{}", i + 1))
            .set("d", d)
            .set("fill", "none")
            .set("stroke", stroke(kind, i))
            .set("stroke-width", 2);
        doc = doc.add(path);
    }

    // The svg crate omits the XML declaration, so we prepend it.
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{doc}\n")
}

fn stroke(kind: AnalysisKind, index: usize) -> String {
    let color = match kind {
        AnalysisKind::Fracture => OUTLINE,
        AnalysisKind::Pore | AnalysisKind::Grain => {
            label_color(i32::try_from(index + 1).unwrap_or(i32::MAX))
        }
    };
    let [r, g, b] = color.0;
    format!("#{r:02x}{g:02x}{b:02x}")
}
