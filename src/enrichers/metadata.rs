use anyhow::Result;
use async_trait::async_trait;
use std::io::Cursor;
use tokio_util::sync::CancellationToken;

use super::original_bytes;
use crate::enrichment::{Enricher, EnricherKind};
use crate::photo::{image_dimensions, Enrichment, ImageMetadata, Photo, SourceData};

pub struct MetadataEnricher;

fn text(exif: &exif::Exif, tag: exif::Tag) -> Option<String> {
    exif.get_field(tag, exif::In::PRIMARY)
        .map(|f| f.display_value().to_string().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
}

fn rational(exif: &exif::Exif, tag: exif::Tag) -> Option<f64> {
    match &exif.get_field(tag, exif::In::PRIMARY)?.value {
        exif::Value::Rational(v) => v.first().map(|r| r.to_f64()),
        _ => None,
    }
}

fn coordinate(exif: &exif::Exif, value: exif::Tag, reference: exif::Tag, negative: char) -> Option<f64> {
    let exif::Value::Rational(dms) = &exif.get_field(value, exif::In::PRIMARY)?.value else {
        return None;
    };
    if dms.len() < 3 {
        return None;
    }
    let decimal = dms_to_decimal(dms[0].to_f64(), dms[1].to_f64(), dms[2].to_f64());
    let hemisphere = exif
        .get_field(reference, exif::In::PRIMARY)?
        .display_value()
        .to_string();
    Some(if hemisphere.contains(negative) { -decimal } else { decimal })
}

/// Format, dimensions and EXIF details of an encoded image. Missing or
/// unreadable EXIF leaves the camera fields empty.
pub fn extract_metadata(bytes: &[u8]) -> ImageMetadata {
    let mut metadata = ImageMetadata {
        format: image::guess_format(bytes).ok().map(|f| format!("{:?}", f)),
        ..Default::default()
    };

    if let Some((width, height)) = image_dimensions(bytes) {
        metadata.width = Some(width);
        metadata.height = Some(height);
    }

    let Ok(exif) = exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) else {
        return metadata;
    };

    metadata.camera_make = text(&exif, exif::Tag::Make);
    metadata.camera_model = text(&exif, exif::Tag::Model);
    metadata.lens = text(&exif, exif::Tag::LensModel);
    metadata.focal_length = rational(&exif, exif::Tag::FocalLength);
    metadata.aperture = rational(&exif, exif::Tag::FNumber);
    metadata.shutter_speed = exif
        .get_field(exif::Tag::ExposureTime, exif::In::PRIMARY)
        .map(|f| f.display_value().to_string());
    metadata.iso = exif
        .get_field(exif::Tag::PhotographicSensitivity, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .map(|iso| iso as i32);
    metadata.taken_at = text(&exif, exif::Tag::DateTimeOriginal);
    metadata.gps_latitude = coordinate(&exif, exif::Tag::GPSLatitude, exif::Tag::GPSLatitudeRef, 'S');
    metadata.gps_longitude = coordinate(&exif, exif::Tag::GPSLongitude, exif::Tag::GPSLongitudeRef, 'W');

    metadata
}

fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64) -> f64 {
    degrees + minutes / 60.0 + seconds / 3600.0
}

#[async_trait]
impl Enricher for MetadataEnricher {
    fn kind(&self) -> EnricherKind {
        EnricherKind::Metadata
    }

    async fn enrich(&self, _photo: &Photo, source: &SourceData, _cancel: &CancellationToken) -> Result<Enrichment> {
        let original = original_bytes(source)?;
        let metadata = tokio::task::spawn_blocking(move || extract_metadata(&original)).await?;
        Ok(Enrichment {
            metadata: Some(metadata),
            ..Default::default()
        })
    }
}
