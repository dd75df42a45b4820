//! Persistence and blob-storage collaborators of the face engines.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::faces::{ExternalRef, Face, IdentityStatus, Person};

/// Identity fields written back after identification.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityUpdate {
    pub status: IdentityStatus,
    pub person_id: Option<i64>,
    pub confidence: f64,
}

impl IdentityUpdate {
    pub fn not_identified() -> Self {
        Self {
            status: IdentityStatus::NotIdentified,
            person_id: None,
            confidence: 0.0,
        }
    }

    pub fn identified(person_id: i64, confidence: f64) -> Self {
        Self {
            status: IdentityStatus::Identified,
            person_id: Some(person_id),
            confidence,
        }
    }
}

/// Which rendition of a photo to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhotoVariant {
    Original,
    Preview,
}

#[async_trait]
pub trait FaceRepository: Send + Sync {
    async fn list_persons(&self, cancel: &CancellationToken) -> Result<Vec<Person>, StoreError>;

    /// Faces that have a person assigned.
    async fn list_assigned_faces(&self, cancel: &CancellationToken) -> Result<Vec<Face>, StoreError>;

    async fn list_faces_by_status(
        &self,
        status: IdentityStatus,
        cancel: &CancellationToken,
    ) -> Result<Vec<Face>, StoreError>;

    /// Partial update of status, person and confidence. Nothing else changes.
    async fn update_face_identity(
        &self,
        face_id: i64,
        update: IdentityUpdate,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Partial update of the external reference. Nothing else changes.
    async fn update_face_external(
        &self,
        face_id: i64,
        external: ExternalRef,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Cropped image of a single face.
    async fn open_face(&self, face: &Face, cancel: &CancellationToken) -> Result<Vec<u8>, StoreError>;

    async fn open_photo(
        &self,
        photo_id: i64,
        variant: PhotoVariant,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, StoreError>;
}
