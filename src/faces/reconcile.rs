//! Keeps a provider's users and indexed faces in line with local persons and
//! their assigned faces.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::model::{ExternalRef, Face, Person};
use super::provider::FaceProvider;
use crate::error::{FaceServiceError, ProviderError, ReconcileItemError};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{BlobStore, FaceRepository};

#[derive(Debug, Default)]
pub struct PersonSyncReport {
    pub collection_created: bool,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub failures: Vec<ReconcileItemError>,
}

impl PersonSyncReport {
    /// True when the run changed nothing remotely.
    pub fn is_converged(&self) -> bool {
        !self.collection_created && self.created.is_empty() && self.deleted.is_empty()
    }
}

/// A remote face associated with a user that no local face refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmatchedFace {
    pub user_key: String,
    pub external_id: String,
}

#[derive(Debug, Default)]
pub struct FaceSyncReport {
    pub indexed: Vec<(i64, String)>,
    pub already_indexed: usize,
    /// Faces owned by another provider or by a person pinned elsewhere.
    pub skipped: usize,
    pub unmatched_remote: Vec<UnmatchedFace>,
    pub failures: Vec<ReconcileItemError>,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub persons: PersonSyncReport,
    pub faces: FaceSyncReport,
}

pub struct FaceReconciler {
    provider: Arc<dyn FaceProvider>,
    repository: Arc<dyn FaceRepository>,
    blobs: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    max_parallelism: usize,
}

impl FaceReconciler {
    pub fn new(
        provider: Arc<dyn FaceProvider>,
        repository: Arc<dyn FaceRepository>,
        blobs: Arc<dyn BlobStore>,
        retry: RetryPolicy,
        max_parallelism: usize,
    ) -> Self {
        Self {
            provider,
            repository,
            blobs,
            retry,
            max_parallelism: max_parallelism.max(1),
        }
    }

    fn eligible<'a>(&self, persons: &'a [Person]) -> impl Iterator<Item = &'a Person> {
        let name = self.provider.name();
        persons.iter().filter(move |p| p.syncs_to(name))
    }

    /// Make the remote user set equal to the local persons eligible for this
    /// provider. A converged state issues no create or delete calls.
    pub async fn sync_persons(&self, cancel: &CancellationToken) -> Result<PersonSyncReport, FaceServiceError> {
        let provider = &self.provider;
        let mut report = PersonSyncReport::default();

        let exists = with_retry(&self.retry, cancel, "collection_exists", || provider.collection_exists(cancel)).await?;
        if !exists {
            with_retry(&self.retry, cancel, "create_collection", || provider.create_collection(cancel)).await?;
            info!(provider = provider.name(), "Created face collection");
            report.collection_created = true;
        }

        let remote: BTreeSet<String> = with_retry(&self.retry, cancel, "list_users", || provider.list_users(cancel))
            .await?
            .into_iter()
            .collect();
        let persons = self.repository.list_persons(cancel).await?;
        let local: BTreeSet<String> = self.eligible(&persons).map(Person::user_key).collect();

        for user_key in local.difference(&remote) {
            match with_retry(&self.retry, cancel, "create_user", || provider.create_user(user_key, cancel)).await {
                Ok(()) => report.created.push(user_key.clone()),
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled.into()),
                Err(e) => {
                    warn!(provider = provider.name(), user_key, error = %e, "Failed to create user");
                    report.failures.push(ReconcileItemError::User {
                        user_key: user_key.clone(),
                        source: e,
                    });
                }
            }
        }

        for user_key in remote.difference(&local) {
            match with_retry(&self.retry, cancel, "delete_user", || provider.delete_user(user_key, cancel)).await {
                Ok(()) => report.deleted.push(user_key.clone()),
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled.into()),
                Err(e) => {
                    warn!(provider = provider.name(), user_key, error = %e, "Failed to delete user");
                    report.failures.push(ReconcileItemError::User {
                        user_key: user_key.clone(),
                        source: e,
                    });
                }
            }
        }

        info!(
            provider = provider.name(),
            created = report.created.len(),
            deleted = report.deleted.len(),
            failed = report.failures.len(),
            "Persons synced"
        );
        Ok(report)
    }

    async fn index_one(&self, face: &Face, user_key: &str, cancel: &CancellationToken) -> Result<String, ReconcileItemError> {
        let provider = &self.provider;
        let face_error = |source| ReconcileItemError::FaceProvider {
            face_id: face.id,
            source,
        };

        let image = self
            .blobs
            .open_face(face, cancel)
            .await
            .map_err(|source| ReconcileItemError::FaceStore {
                face_id: face.id,
                source,
            })?;

        // Single attempt: a call that timed out may still have indexed the
        // sample, and a retry would leave a duplicate behind remotely.
        let external_id = provider
            .index_face(user_key, &image, cancel)
            .await
            .map_err(face_error)?
            .ok_or(ReconcileItemError::NothingIndexed { face_id: face.id })?;

        let ids = [external_id.clone()];
        with_retry(&self.retry, cancel, "associate_faces", || provider.associate_faces(user_key, &ids, cancel))
            .await
            .map_err(face_error)?;

        self.repository
            .update_face_external(face.id, ExternalRef::new(provider.name(), external_id.clone()), cancel)
            .await
            .map_err(|source| ReconcileItemError::FaceStore {
                face_id: face.id,
                source,
            })?;

        debug!(face_id = face.id, user_key, external_id = %external_id, "Face indexed");
        Ok(external_id)
    }

    /// Index every assigned face this provider does not know yet and report
    /// remote faces nothing local refers to.
    pub async fn sync_faces(&self, cancel: &CancellationToken) -> Result<FaceSyncReport, FaceServiceError> {
        let provider = &self.provider;
        let name = provider.name();
        let mut report = FaceSyncReport::default();

        let persons = self.repository.list_persons(cancel).await?;
        let users: HashMap<i64, String> = self.eligible(&persons).map(|p| (p.id, p.user_key())).collect();
        let faces = self.repository.list_assigned_faces(cancel).await?;

        let mut known: HashSet<String> = HashSet::new();
        let mut pending: Vec<(&Face, &str)> = Vec::new();
        for face in &faces {
            if let Some(external) = &face.external {
                if external.is_for(name) {
                    known.insert(external.external_id.clone());
                    report.already_indexed += 1;
                } else {
                    report.skipped += 1;
                }
                continue;
            }
            match face.person_id.and_then(|id| users.get(&id)) {
                Some(user_key) => pending.push((face, user_key.as_str())),
                None => report.skipped += 1,
            }
        }

        info!(provider = name, pending = pending.len(), already = report.already_indexed, "Syncing faces");

        let results: Vec<Result<(i64, String), ReconcileItemError>> = stream::iter(pending)
            .map(|(face, user_key)| async move {
                self.index_one(face, user_key, cancel)
                    .await
                    .map(|external_id| (face.id, external_id))
            })
            .buffer_unordered(self.max_parallelism)
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled.into());
        }

        for result in results {
            match result {
                Ok((face_id, external_id)) => {
                    known.insert(external_id.clone());
                    report.indexed.push((face_id, external_id));
                }
                Err(e) => {
                    error!(provider = name, error = %e, "Face sync failed");
                    report.failures.push(e);
                }
            }
        }
        report.indexed.sort();

        let mut user_keys: Vec<&String> = users.values().collect();
        user_keys.sort();
        for user_key in user_keys {
            match with_retry(&self.retry, cancel, "list_faces", || provider.list_faces(user_key, cancel)).await {
                Ok(remote) => report.unmatched_remote.extend(
                    remote
                        .into_iter()
                        .filter(|id| !known.contains(id))
                        .map(|external_id| UnmatchedFace {
                            user_key: user_key.clone(),
                            external_id,
                        }),
                ),
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled.into()),
                Err(e) => report.failures.push(ReconcileItemError::User {
                    user_key: user_key.clone(),
                    source: e,
                }),
            }
        }
        if !report.unmatched_remote.is_empty() {
            warn!(
                provider = name,
                count = report.unmatched_remote.len(),
                "Remote faces without a local counterpart need manual review"
            );
        }

        info!(
            provider = name,
            indexed = report.indexed.len(),
            failed = report.failures.len(),
            "Faces synced"
        );
        Ok(report)
    }

    /// Sync persons, then faces, then let the provider train.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<ReconcileReport, FaceServiceError> {
        let persons = self.sync_persons(cancel).await?;
        let faces = self.sync_faces(cancel).await?;

        let provider = &self.provider;
        with_retry(&self.retry, cancel, "train", || provider.train(cancel)).await?;

        Ok(ReconcileReport { persons, faces })
    }
}
