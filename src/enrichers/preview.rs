use anyhow::Result;
use async_trait::async_trait;
use image::imageops::FilterType;
use image::GenericImageView;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{encode_jpeg, original_bytes};
use crate::enrichment::{Enricher, EnricherKind};
use crate::photo::{Enrichment, Photo, PreviewImage, SourceData};

/// Decodes the original once and hands later enrichers a bounded JPEG.
pub struct PreviewEnricher {
    max_side: u32,
}

impl PreviewEnricher {
    pub fn new(max_side: u32) -> Self {
        Self {
            max_side: max_side.max(1),
        }
    }
}

/// Downscale so neither side exceeds `max_side`. The digest is taken over the
/// original bytes so identical files share it.
pub fn build_preview(original: &[u8], max_side: u32) -> Result<PreviewImage> {
    let img = image::load_from_memory(original)?;
    let (width, height) = img.dimensions();

    let resized = if width > max_side || height > max_side {
        img.resize(max_side, max_side, FilterType::Triangle)
    } else {
        img
    };
    let (preview_width, preview_height) = resized.dimensions();

    Ok(PreviewImage {
        bytes: Arc::new(encode_jpeg(&resized)?),
        width: preview_width,
        height: preview_height,
        scale: f64::from(width) / f64::from(preview_width.max(1)),
        sha256: format!("{:x}", Sha256::digest(original)),
    })
}

#[async_trait]
impl Enricher for PreviewEnricher {
    fn kind(&self) -> EnricherKind {
        EnricherKind::Preview
    }

    async fn enrich(&self, _photo: &Photo, source: &SourceData, _cancel: &CancellationToken) -> Result<Enrichment> {
        let original = original_bytes(source)?;
        let max_side = self.max_side;
        let preview = tokio::task::spawn_blocking(move || build_preview(&original, max_side)).await??;

        Ok(Enrichment {
            preview: Some(preview),
            ..Default::default()
        })
    }
}
