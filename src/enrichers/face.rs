use anyhow::Result;
use async_trait::async_trait;
use image::DynamicImage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{encode_jpeg, preview_image};
use crate::enrichment::{Enricher, EnricherKind};
use crate::faces::{DetectedFace, Face, FaceProvider, IdentityStatus};
use crate::photo::{DetectedFaces, Enrichment, FaceDetectionStatus, Photo, PreviewImage, Rect, SourceData};

/// Detects faces on the preview and emits them, cropped, for identification.
pub struct FaceEnricher {
    provider: Arc<dyn FaceProvider>,
}

impl FaceEnricher {
    pub fn new(provider: Arc<dyn FaceProvider>) -> Self {
        Self { provider }
    }
}

fn scale_rect(rect: Rect, scale: f64) -> Rect {
    let s = |v: i32| (f64::from(v) * scale).round() as i32;
    Rect {
        x: s(rect.x),
        y: s(rect.y),
        width: s(rect.width),
        height: s(rect.height),
    }
}

/// Face records plus one crop per face, taken from the preview. Rectangles
/// are stored in original-image pixels.
fn build_faces(photo_id: i64, preview: &PreviewImage, detected: &[DetectedFace]) -> Result<DetectedFaces> {
    if detected.is_empty() {
        return Ok(DetectedFaces {
            status: FaceDetectionStatus::NotDetected,
            ..Default::default()
        });
    }

    let img: DynamicImage = image::load_from_memory(&preview.bytes)?;
    let mut faces = Vec::with_capacity(detected.len());
    let mut crops = Vec::with_capacity(detected.len());

    for found in detected {
        let preview_rect = found
            .bbox
            .map(|b| b.to_pixels(preview.width, preview.height))
            .filter(|r| r.width > 0 && r.height > 0);

        let crop = match preview_rect {
            Some(r) => encode_jpeg(&img.crop_imm(r.x as u32, r.y as u32, r.width as u32, r.height as u32))?,
            None => preview.bytes.to_vec(),
        };

        faces.push(Face {
            photo_id,
            rect: preview_rect.map(|r| scale_rect(r, preview.scale)),
            identity_status: IdentityStatus::ForReprocessing,
            age: found.age,
            gender: found.gender.clone(),
            ..Default::default()
        });
        crops.push(crop);
    }

    Ok(DetectedFaces {
        status: FaceDetectionStatus::Detected,
        faces,
        crops,
    })
}

#[async_trait]
impl Enricher for FaceEnricher {
    fn kind(&self) -> EnricherKind {
        EnricherKind::Face
    }

    async fn enrich(&self, photo: &Photo, source: &SourceData, cancel: &CancellationToken) -> Result<Enrichment> {
        let preview = preview_image(source)?.clone();
        let detected = self.provider.detect_faces(&preview.bytes, cancel).await?;
        debug!(photo_id = photo.id, provider = self.provider.name(), faces = detected.len(), "Faces detected");

        let photo_id = photo.id;
        let faces = tokio::task::spawn_blocking(move || build_faces(photo_id, &preview, &detected)).await??;

        Ok(Enrichment {
            faces: Some(faces),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichers::preview::build_preview;
    use crate::enrichers::tests::sample_png;
    use crate::error::ProviderError;
    use crate::faces::fake::{face, FakeProvider};
    use crate::faces::NormalizedBox;

    fn source() -> SourceData {
        let mut source = SourceData::from_bytes(sample_png(200, 100));
        source.preview = Some(build_preview(source.original.as_ref().unwrap(), 100).unwrap());
        source
    }

    #[tokio::test]
    async fn test_detected_faces_are_cropped_and_pending() {
        let provider = Arc::new(FakeProvider::new("fake"));
        let mut found = face("a");
        found.bbox = Some(NormalizedBox {
            left: 0.1,
            top: 0.2,
            width: 0.2,
            height: 0.4,
        });
        provider.script_detect(vec![Ok(vec![found, face("b")])]);

        let patch = FaceEnricher::new(provider)
            .enrich(&Photo::new(3), &source(), &CancellationToken::new())
            .await
            .unwrap();

        let detected = patch.faces.unwrap();
        assert_eq!(detected.status, FaceDetectionStatus::Detected);
        assert_eq!(detected.faces.len(), 2);
        assert_eq!(detected.crops.len(), 2);
        assert!(detected
            .faces
            .iter()
            .all(|f| f.identity_status == IdentityStatus::ForReprocessing && f.photo_id == 3));

        // Preview is 100x50 at scale 2, so the box maps back to 40x40 at (20, 20).
        let rect = detected.faces[0].rect.unwrap();
        assert_eq!((rect.x, rect.y, rect.width, rect.height), (20, 20, 40, 40));
        let crop = image::load_from_memory(&detected.crops[0]).unwrap();
        assert_eq!((crop.width(), crop.height()), (20, 20));
        assert!(detected.faces[1].rect.is_none());
    }

    #[tokio::test]
    async fn test_no_faces_sets_not_detected() {
        let provider = Arc::new(FakeProvider::new("fake"));
        provider.script_detect(vec![Ok(Vec::new())]);

        let patch = FaceEnricher::new(provider)
            .enrich(&Photo::new(3), &source(), &CancellationToken::new())
            .await
            .unwrap();

        let detected = patch.faces.unwrap();
        assert_eq!(detected.status, FaceDetectionStatus::NotDetected);
        assert!(detected.faces.is_empty());
    }

    #[tokio::test]
    async fn test_detection_timeout_fails_task() {
        let provider = Arc::new(FakeProvider::new("fake"));
        provider.script_detect(vec![Err(ProviderError::Timeout)]);

        let err = FaceEnricher::new(provider)
            .enrich(&Photo::new(3), &source(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<ProviderError>(), Some(&ProviderError::Timeout));
    }
}
