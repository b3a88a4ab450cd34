//! Resolution metadata from encoded image bytes.
//!
//! The `image` crate decodes pixels but drops density metadata, so the
//! few headers that carry it are read directly: PNG `pHYs`, JPEG JFIF
//! `APP0`, and the BMP info header. When those carry nothing usable the
//! EXIF `XResolution`/`YResolution`/`ResolutionUnit` tags are read with
//! `kamadak-exif`, which is where most camera JPEGs keep their density.
//! Anything unrecognized yields an unknown [`Resolution`]; unit
//! conversion then falls back to the default DPI.

use std::io::Cursor;

use crate::types::Resolution;

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";
const INCHES_PER_METRE: f64 = 0.0254;
const CM_PER_INCH: f64 = 2.54;

/// Read horizontal and vertical DPI from an encoded PNG, JPEG, or BMP.
///
/// The format's own density header wins; EXIF resolution tags are the
/// fallback.
#[must_use]
pub fn read_dpi(bytes: &[u8]) -> Resolution {
    let header = if bytes.starts_with(PNG_SIGNATURE) {
        png_dpi(bytes)
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        jpeg_dpi(bytes)
    } else if bytes.starts_with(b"BM") {
        bmp_dpi(bytes)
    } else {
        None
    };
    header
        .filter(|r| r.horizontal_dpi.is_some() || r.vertical_dpi.is_some())
        .or_else(|| exif_dpi(bytes))
        .unwrap_or_default()
}

/// Density from EXIF IFD0. A missing `ResolutionUnit` means inches.
fn exif_dpi(bytes: &[u8]) -> Option<Resolution> {
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()?;
    let scale = match exif
        .get_field(exif::Tag::ResolutionUnit, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
    {
        None | Some(2) => 1.0,
        Some(3) => CM_PER_INCH,
        Some(_) => return None,
    };
    let rational = |tag| match &exif.get_field(tag, exif::In::PRIMARY)?.value {
        exif::Value::Rational(values) => values.first().map(exif::Rational::to_f64),
        _ => None,
    };
    let found = Resolution {
        horizontal_dpi: rational(exif::Tag::XResolution).and_then(|v| positive(v * scale)),
        vertical_dpi: rational(exif::Tag::YResolution).and_then(|v| positive(v * scale)),
    };
    (found.horizontal_dpi.is_some() || found.vertical_dpi.is_some()).then_some(found)
}

fn be_u16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

fn be_u32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

fn le_i32(bytes: &[u8], at: usize) -> Option<i32> {
    Some(i32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

fn positive(v: f64) -> Option<f64> {
    (v.is_finite() && v > 0.0).then_some(v)
}

fn png_dpi(bytes: &[u8]) -> Option<Resolution> {
    let mut at = PNG_SIGNATURE.len();
    loop {
        let len = be_u32(bytes, at)? as usize;
        let kind = bytes.get(at + 4..at + 8)?;
        let data = at + 8;
        match kind {
            b"pHYs" => {
                let x = be_u32(bytes, data)?;
                let y = be_u32(bytes, data + 4)?;
                // Unit 0 only states an aspect ratio.
                if *bytes.get(data + 8)? != 1 {
                    return None;
                }
                return Some(Resolution {
                    horizontal_dpi: positive(f64::from(x) * INCHES_PER_METRE),
                    vertical_dpi: positive(f64::from(y) * INCHES_PER_METRE),
                });
            }
            b"IDAT" | b"IEND" => return None,
            _ => at = data.checked_add(len)?.checked_add(4)?,
        }
    }
}

fn jpeg_dpi(bytes: &[u8]) -> Option<Resolution> {
    let mut at = 2;
    loop {
        if *bytes.get(at)? != 0xFF {
            return None;
        }
        let marker = *bytes.get(at + 1)?;
        // Start of scan: no more header segments.
        if marker == 0xDA {
            return None;
        }
        let len = usize::from(be_u16(bytes, at + 2)?);
        let data = at + 4;
        if marker == 0xE0 && bytes.get(data..data + 5)? == b"JFIF\0" {
            let units = *bytes.get(data + 7)?;
            let x = f64::from(be_u16(bytes, data + 8)?);
            let y = f64::from(be_u16(bytes, data + 10)?);
            let scale = match units {
                1 => 1.0,
                2 => CM_PER_INCH,
                _ => return None,
            };
            return Some(Resolution {
                horizontal_dpi: positive(x * scale),
                vertical_dpi: positive(y * scale),
            });
        }
        at = at.checked_add(2)?.checked_add(len)?;
    }
}

fn bmp_dpi(bytes: &[u8]) -> Option<Resolution> {
    const INFO_HEADER: usize = 14;
    let header_size = u32::from_le_bytes(bytes.get(INFO_HEADER..INFO_HEADER + 4)?.try_into().ok()?);
    // BITMAPCOREHEADER (12 bytes) has no density fields.
    if header_size < 40 {
        return None;
    }
    let x = le_i32(bytes, INFO_HEADER + 24)?;
    let y = le_i32(bytes, INFO_HEADER + 28)?;
    Some(Resolution {
        horizontal_dpi: positive(f64::from(x) * INCHES_PER_METRE),
        vertical_dpi: positive(f64::from(y) * INCHES_PER_METRE),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn png_with_phys(x_ppm: u32, y_ppm: u32, unit: u8) -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        // IHDR (contents irrelevant here).
        bytes.extend(13_u32.to_be_bytes());
        bytes.extend(b"IHDR");
        bytes.extend([0_u8; 13]);
        bytes.extend([0_u8; 4]);
        // pHYs
        bytes.extend(9_u32.to_be_bytes());
        bytes.extend(b"pHYs");
        bytes.extend(x_ppm.to_be_bytes());
        bytes.extend(y_ppm.to_be_bytes());
        bytes.push(unit);
        bytes.extend([0_u8; 4]);
        bytes.extend(0_u32.to_be_bytes());
        bytes.extend(b"IEND");
        bytes.extend([0_u8; 4]);
        bytes
    }

    fn jfif(units: u8, x: u16, y: u16) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
        bytes.extend(16_u16.to_be_bytes());
        bytes.extend(b"JFIF\0");
        bytes.extend([1, 1, units]);
        bytes.extend(x.to_be_bytes());
        bytes.extend(y.to_be_bytes());
        bytes.extend([0, 0]);
        bytes.extend([0xFF, 0xDA]);
        bytes
    }

    fn bmp(x_ppm: i32, y_ppm: i32) -> Vec<u8> {
        let mut bytes = b"BM".to_vec();
        bytes.extend([0_u8; 12]);
        bytes.extend(40_u32.to_le_bytes());
        bytes.extend([0_u8; 20]);
        bytes.extend(x_ppm.to_le_bytes());
        bytes.extend(y_ppm.to_le_bytes());
        bytes.extend([0_u8; 8]);
        bytes
    }

    /// JPEG whose only metadata is an EXIF `APP1` segment.
    fn exif_jpeg(dpi: u32, unit: u16) -> Vec<u8> {
        let entry = |tag: u16, kind: u16, value: [u8; 4]| {
            let mut e = tag.to_be_bytes().to_vec();
            e.extend(kind.to_be_bytes());
            e.extend(1_u32.to_be_bytes());
            e.extend(value);
            e
        };
        let mut unit_value = [0_u8; 4];
        unit_value[..2].copy_from_slice(&unit.to_be_bytes());

        // Big-endian TIFF header, IFD0 at offset 8 with three entries,
        // rationals after it at offsets 50 and 58.
        let mut tiff = b"MM\0\x2A".to_vec();
        tiff.extend(8_u32.to_be_bytes());
        tiff.extend(3_u16.to_be_bytes());
        tiff.extend(entry(0x011A, 5, 50_u32.to_be_bytes()));
        tiff.extend(entry(0x011B, 5, 58_u32.to_be_bytes()));
        tiff.extend(entry(0x0128, 3, unit_value));
        tiff.extend(0_u32.to_be_bytes());
        for _ in 0..2 {
            tiff.extend(dpi.to_be_bytes());
            tiff.extend(1_u32.to_be_bytes());
        }

        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE1];
        bytes.extend(u16::try_from(8 + tiff.len()).unwrap().to_be_bytes());
        bytes.extend(b"Exif\0\0");
        bytes.extend(tiff);
        bytes.extend([0xFF, 0xD9]);
        bytes
    }

    fn close(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 0.05)
    }

    #[test]
    fn png_phys_in_metres() {
        let r = read_dpi(&png_with_phys(11_811, 5_906, 1));
        assert!(close(r.horizontal_dpi, 300.0), "{r:?}");
        assert!(close(r.vertical_dpi, 150.0), "{r:?}");
    }

    #[test]
    fn png_phys_without_unit_is_unknown() {
        assert_eq!(read_dpi(&png_with_phys(1, 1, 0)), Resolution::default());
    }

    #[test]
    fn jfif_dots_per_inch_and_per_cm() {
        let r = read_dpi(&jfif(1, 72, 72));
        assert!(close(r.horizontal_dpi, 72.0));
        let r = read_dpi(&jfif(2, 100, 50));
        assert!(close(r.horizontal_dpi, 254.0));
        assert!(close(r.vertical_dpi, 127.0));
        assert_eq!(read_dpi(&jfif(0, 1, 1)), Resolution::default());
    }

    #[test]
    fn exif_only_jpeg_reads_resolution_tags() {
        let r = read_dpi(&exif_jpeg(300, 2));
        assert!(close(r.horizontal_dpi, 300.0), "{r:?}");
        assert!(close(r.vertical_dpi, 300.0), "{r:?}");

        let r = read_dpi(&exif_jpeg(100, 3));
        assert!(close(r.horizontal_dpi, 254.0), "{r:?}");
    }

    #[test]
    fn jfif_density_wins_over_exif() {
        let with_exif = |units| {
            let mut bytes = jfif(units, 72, 72);
            bytes.truncate(bytes.len() - 2);
            bytes.extend(&exif_jpeg(300, 2)[2..]);
            bytes
        };
        assert!(close(read_dpi(&with_exif(1)).horizontal_dpi, 72.0));
        // An aspect-only JFIF header defers to EXIF.
        assert!(close(read_dpi(&with_exif(0)).horizontal_dpi, 300.0));
    }

    #[test]
    fn bmp_pixels_per_metre() {
        let r = read_dpi(&bmp(3_780, 0));
        assert!(close(r.horizontal_dpi, 96.0), "{r:?}");
        assert_eq!(r.vertical_dpi, None);
    }

    #[test]
    fn truncated_or_unknown_input_is_unknown() {
        assert_eq!(read_dpi(&[]), Resolution::default());
        assert_eq!(read_dpi(b"GIF89a"), Resolution::default());
        let mut png = png_with_phys(11_811, 11_811, 1);
        png.truncate(30);
        assert_eq!(read_dpi(&png), Resolution::default());
    }
}
