use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{encode_jpeg, preview_image};
use crate::enrichment::{Enricher, EnricherKind};
use crate::photo::{Enrichment, Photo, SourceData};

/// Small JPEG that fits inside a `size` x `size` square, cut from the preview.
pub struct ThumbnailEnricher {
    size: u32,
}

impl ThumbnailEnricher {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }
}

#[async_trait]
impl Enricher for ThumbnailEnricher {
    fn kind(&self) -> EnricherKind {
        EnricherKind::Thumbnail
    }

    async fn enrich(&self, _photo: &Photo, source: &SourceData, _cancel: &CancellationToken) -> Result<Enrichment> {
        let preview = preview_image(source)?.bytes.clone();
        let size = self.size;
        let thumbnail = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let img = image::load_from_memory(&preview)?;
            encode_jpeg(&img.thumbnail(size, size))
        })
        .await??;

        Ok(Enrichment {
            thumbnail: Some(thumbnail),
            ..Default::default()
        })
    }
}
