use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{BlobStore, FaceRepository, IdentityUpdate, PhotoVariant};
use crate::error::StoreError;
use crate::faces::{ExternalRef, Face, IdentityStatus, Person};
use crate::photo::Photo;

#[derive(Default)]
struct Inner {
    persons: BTreeMap<i64, Person>,
    faces: BTreeMap<i64, Face>,
    face_images: HashMap<i64, Vec<u8>>,
    photos: HashMap<(i64, PhotoVariant), Vec<u8>>,
}

/// Repository and blob store kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

fn check(cancel: &CancellationToken) -> Result<(), StoreError> {
    if cancel.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_person(&self, person: Person) {
        self.inner.write().await.persons.insert(person.id, person);
    }

    pub async fn insert_face(&self, face: Face, image: Option<Vec<u8>>) {
        let mut inner = self.inner.write().await;
        if let Some(image) = image {
            inner.face_images.insert(face.id, image);
        }
        inner.faces.insert(face.id, face);
    }

    pub async fn insert_photo(&self, photo_id: i64, variant: PhotoVariant, bytes: Vec<u8>) {
        self.inner.write().await.photos.insert((photo_id, variant), bytes);
    }

    /// Store the faces of an enriched photo together with their crops,
    /// assigning ids after the highest one already present.
    pub async fn import_faces(&self, photo: &mut Photo, crops: &[Vec<u8>]) {
        let mut inner = self.inner.write().await;
        let mut next_id = inner.faces.keys().next_back().copied().unwrap_or(0) + 1;
        for (i, face) in photo.faces.iter_mut().enumerate() {
            face.id = next_id;
            face.photo_id = photo.id;
            next_id += 1;
            if let Some(crop) = crops.get(i) {
                inner.face_images.insert(face.id, crop.clone());
            }
            inner.faces.insert(face.id, face.clone());
        }
    }

    pub async fn face(&self, face_id: i64) -> Option<Face> {
        self.inner.read().await.faces.get(&face_id).cloned()
    }

    pub async fn faces(&self) -> Vec<Face> {
        self.inner.read().await.faces.values().cloned().collect()
    }
}

#[async_trait]
impl FaceRepository for MemoryStore {
    async fn list_persons(&self, cancel: &CancellationToken) -> Result<Vec<Person>, StoreError> {
        check(cancel)?;
        Ok(self.inner.read().await.persons.values().cloned().collect())
    }

    async fn list_assigned_faces(&self, cancel: &CancellationToken) -> Result<Vec<Face>, StoreError> {
        check(cancel)?;
        Ok(self
            .inner
            .read()
            .await
            .faces
            .values()
            .filter(|f| f.person_id.is_some())
            .cloned()
            .collect())
    }

    async fn list_faces_by_status(
        &self,
        status: IdentityStatus,
        cancel: &CancellationToken,
    ) -> Result<Vec<Face>, StoreError> {
        check(cancel)?;
        Ok(self
            .inner
            .read()
            .await
            .faces
            .values()
            .filter(|f| f.identity_status == status)
            .cloned()
            .collect())
    }

    async fn update_face_identity(
        &self,
        face_id: i64,
        update: IdentityUpdate,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        check(cancel)?;
        let mut inner = self.inner.write().await;
        let face = inner.faces.get_mut(&face_id).ok_or(StoreError::NotFound {
            entity: "face",
            id: face_id,
        })?;
        face.identity_status = update.status;
        face.person_id = update.person_id;
        face.identified_with_confidence = update.confidence;
        Ok(())
    }

    async fn update_face_external(
        &self,
        face_id: i64,
        external: ExternalRef,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        check(cancel)?;
        let mut inner = self.inner.write().await;
        let face = inner.faces.get_mut(&face_id).ok_or(StoreError::NotFound {
            entity: "face",
            id: face_id,
        })?;
        face.external = Some(external);
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn open_face(&self, face: &Face, cancel: &CancellationToken) -> Result<Vec<u8>, StoreError> {
        check(cancel)?;
        self.inner
            .read()
            .await
            .face_images
            .get(&face.id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "face image",
                id: face.id,
            })
    }

    async fn open_photo(
        &self,
        photo_id: i64,
        variant: PhotoVariant,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, StoreError> {
        check(cancel)?;
        self.inner
            .read()
            .await
            .photos
            .get(&(photo_id, variant))
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "photo",
                id: photo_id,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_update_touches_only_identity_fields() {
        let store = MemoryStore::new();
        let face = Face {
            id: 1,
            photo_id: 10,
            age: Some(33.0),
            external: Some(ExternalRef::new("local", "local:1")),
            ..Default::default()
        };
        store.insert_face(face, None).await;

        store
            .update_face_identity(1, IdentityUpdate::identified(4, 0.91), &CancellationToken::new())
            .await
            .unwrap();

        let face = store.face(1).await.unwrap();
        assert_eq!(face.identity_status, IdentityStatus::Identified);
        assert_eq!(face.person_id, Some(4));
        assert_eq!(face.age, Some(33.0));
        assert_eq!(face.external, Some(ExternalRef::new("local", "local:1")));
    }

    #[tokio::test]
    async fn test_missing_face_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_face_external(99, ExternalRef::new("azure", "x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { id: 99, .. }));
    }

    #[tokio::test]
    async fn test_import_faces_assigns_ids_and_crops() {
        let store = MemoryStore::new();
        store.insert_face(Face { id: 5, ..Default::default() }, None).await;

        let mut photo = Photo::new(2);
        photo.faces = vec![Face::default(), Face::default()];
        store.import_faces(&mut photo, &[vec![1], vec![2]]).await;

        assert_eq!(photo.faces[0].id, 6);
        assert_eq!(photo.faces[1].id, 7);
        let cancel = CancellationToken::new();
        assert_eq!(store.open_face(&photo.faces[1], &cancel).await.unwrap(), vec![2]);
        assert_eq!(store.faces().await.len(), 3);
    }
}
