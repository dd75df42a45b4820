//! Enrichers that run without a vision vendor, plus the face enricher that
//! talks to the configured face provider.

mod analyze;
mod face;
mod metadata;
mod preview;
mod thumbnail;

pub use analyze::{AnalyzeEnricher, ColorEnricher};
pub use face::FaceEnricher;
pub use metadata::{extract_metadata, MetadataEnricher};
pub use preview::PreviewEnricher;
pub use thumbnail::ThumbnailEnricher;

use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;

use crate::config::EnrichmentConfig;
use crate::enrichment::EnricherCatalog;
use crate::faces::FaceProvider;
use crate::photo::{PreviewImage, SourceData};

/// Catalog of every enricher this crate ships. The face enricher is only
/// registered when a provider is available.
pub fn local_catalog(config: &EnrichmentConfig, faces: Option<Arc<dyn FaceProvider>>) -> EnricherCatalog {
    let mut catalog = EnricherCatalog::new()
        .with(Arc::new(PreviewEnricher::new(config.preview_max_side)))
        .with(Arc::new(MetadataEnricher))
        .with(Arc::new(ThumbnailEnricher::new(config.thumbnail_size)))
        .with(Arc::new(AnalyzeEnricher))
        .with(Arc::new(ColorEnricher));
    if let Some(provider) = faces {
        catalog.register(Arc::new(FaceEnricher::new(provider)));
    }
    catalog
}

fn original_bytes(source: &SourceData) -> Result<Arc<Vec<u8>>> {
    source
        .original
        .clone()
        .ok_or_else(|| anyhow!("source data has no original image"))
}

fn preview_image(source: &SourceData) -> Result<&PreviewImage> {
    source
        .preview
        .as_ref()
        .ok_or_else(|| anyhow!("preview has not been produced"))
}

/// JPEG-encode, dropping alpha since the encoder cannot store it.
fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut bytes = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)?;
    Ok(bytes)
}
