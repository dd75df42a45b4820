//! Photo records and the facts enrichers derive from them.
//!
//! Enrichers never touch a [`Photo`] directly. Each one returns an
//! [`Enrichment`] patch and the executor applies the patches of a wave once
//! every member of that wave has finished.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use crate::enrichment::EnricherKind;
use crate::faces::Face;

/// Camera and capture details read from EXIF.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,

    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub lens: Option<String>,

    pub focal_length: Option<f64>,
    pub aperture: Option<f64>,
    pub shutter_speed: Option<String>,
    pub iso: Option<i32>,

    pub taken_at: Option<String>,

    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
}

/// Downscaled working copy of the original, shared by later enrichers.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewImage {
    /// JPEG-encoded bytes.
    pub bytes: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    /// Original size divided by preview size (>= 1.0).
    pub scale: f64,
    pub sha256: String,
}

/// What the photo keeps about its preview once the run is over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewInfo {
    pub width: u32,
    pub height: u32,
    pub scale: f64,
    pub sha256: String,
}

impl From<&PreviewImage> for PreviewInfo {
    fn from(preview: &PreviewImage) -> Self {
        Self {
            width: preview.width,
            height: preview.height,
            scale: preview.scale,
            sha256: preview.sha256.clone(),
        }
    }
}

/// Opaque result of the general image-analysis call that caption, tag and
/// friends read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub provider: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caption {
    pub text: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColorInfo {
    pub accent: Option<String>,
    pub dominant_background: Option<String>,
    pub dominant_foreground: Option<String>,
    pub dominant_colors: Vec<String>,
    pub is_black_and_white: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdultScore {
    pub adult_score: f64,
    pub racy_score: f64,
    pub is_adult: bool,
    pub is_racy: bool,
}

/// Pixel rectangle in original-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDetection {
    pub name: String,
    pub confidence: f64,
    pub rect: Option<Rect>,
}

/// Outcome of face detection on the photo as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaceDetectionStatus {
    #[default]
    NotProcessed,
    NotDetected,
    Detected,
}

/// A photo and every fact derived from it so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub id: i64,
    pub path: Option<PathBuf>,

    pub metadata: Option<ImageMetadata>,
    pub preview: Option<PreviewInfo>,
    #[serde(skip)]
    pub thumbnail: Option<Vec<u8>>,
    pub captions: Vec<Caption>,
    pub tags: Vec<Tag>,
    pub categories: Vec<Category>,
    pub colors: Option<ColorInfo>,
    pub adult: Option<AdultScore>,
    pub objects: Vec<ObjectDetection>,
    pub faces: Vec<Face>,
    pub face_status: FaceDetectionStatus,

    /// Kinds that have been applied successfully at least once.
    pub enriched_with: BTreeSet<EnricherKind>,
    pub enriched_at: Option<DateTime<Utc>>,
}

impl Photo {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Per-run input shared by every enricher of one photo.
#[derive(Debug, Clone, Default)]
pub struct SourceData {
    pub path: Option<PathBuf>,
    pub original: Option<Arc<Vec<u8>>>,
    pub preview: Option<PreviewImage>,
    pub analysis: Option<ImageAnalysis>,
    /// Face crops in the same order as the faces the face enricher produced.
    pub face_images: Vec<Vec<u8>>,
}

impl SourceData {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            original: Some(Arc::new(bytes)),
            ..Default::default()
        }
    }

    /// Read the original file for `path`.
    pub async fn load(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let bytes = tokio::fs::read(&path).await?;
        Ok(Self {
            path: Some(path),
            original: Some(Arc::new(bytes)),
            ..Default::default()
        })
    }
}

/// Width and height of an encoded image, read from its header only.
pub fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Faces found by the face enricher along with their crops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectedFaces {
    pub status: FaceDetectionStatus,
    pub faces: Vec<Face>,
    pub crops: Vec<Vec<u8>>,
}

/// Patch returned by a single enricher. Every field is optional; enrichers
/// fill only what they own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub metadata: Option<ImageMetadata>,
    pub preview: Option<PreviewImage>,
    pub thumbnail: Option<Vec<u8>>,
    pub analysis: Option<ImageAnalysis>,
    pub captions: Option<Vec<Caption>>,
    pub tags: Option<Vec<Tag>>,
    pub categories: Option<Vec<Category>>,
    pub colors: Option<ColorInfo>,
    pub adult: Option<AdultScore>,
    pub objects: Option<Vec<ObjectDetection>>,
    pub faces: Option<DetectedFaces>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        *self == Enrichment::default()
    }

    /// Write the patch into the photo and the shared source data.
    pub fn apply(self, photo: &mut Photo, source: &mut SourceData) {
        if let Some(metadata) = self.metadata {
            photo.metadata = Some(metadata);
        }
        if let Some(preview) = self.preview {
            photo.preview = Some(PreviewInfo::from(&preview));
            source.preview = Some(preview);
        }
        if let Some(thumbnail) = self.thumbnail {
            photo.thumbnail = Some(thumbnail);
        }
        if let Some(analysis) = self.analysis {
            source.analysis = Some(analysis);
        }
        if let Some(captions) = self.captions {
            photo.captions = captions;
        }
        if let Some(tags) = self.tags {
            photo.tags = tags;
        }
        if let Some(categories) = self.categories {
            photo.categories = categories;
        }
        if let Some(colors) = self.colors {
            photo.colors = Some(colors);
        }
        if let Some(adult) = self.adult {
            photo.adult = Some(adult);
        }
        if let Some(objects) = self.objects {
            photo.objects = objects;
        }
        if let Some(detected) = self.faces {
            photo.face_status = detected.status;
            photo.faces = detected.faces;
            source.face_images = detected.crops;
        }
    }
}
