use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{Candidate, Face, IdentityStatus};
use super::provider::FaceProvider;
use crate::error::{FaceServiceError, ProviderError};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{BlobStore, FaceRepository, IdentityUpdate};

/// What happened to one face.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifyOutcome {
    Identified { person_id: i64, confidence: f64 },
    NotIdentified,
    /// Provider unavailable; the face is left as it was for a later pass.
    Deferred,
    /// Face was not waiting for identification.
    Skipped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IdentificationReport {
    pub identified: usize,
    pub not_identified: usize,
    pub deferred: usize,
}

impl IdentificationReport {
    fn record(&mut self, outcome: &IdentifyOutcome) {
        match outcome {
            IdentifyOutcome::Identified { .. } => self.identified += 1,
            IdentifyOutcome::NotIdentified => self.not_identified += 1,
            IdentifyOutcome::Deferred => self.deferred += 1,
            IdentifyOutcome::Skipped => {}
        }
    }
}

/// Highest-confidence candidate that resolves to a local person.
///
/// Candidates are scanned in full since providers do not promise any order.
/// Ties keep the candidate seen first. Candidates whose user key matches no
/// local person are dropped before the comparison.
pub fn select_best_candidate(
    candidates: &[Candidate],
    persons: &HashMap<String, i64>,
) -> Option<(i64, f64)> {
    let mut best: Option<(i64, f64)> = None;
    for candidate in candidates {
        let Some(person_id) = persons.get(&candidate.user_key) else {
            warn!(user_key = %candidate.user_key, "Candidate does not resolve to a local person");
            continue;
        };
        if best.map_or(true, |(_, confidence)| candidate.confidence > confidence) {
            best = Some((*person_id, candidate.confidence));
        }
    }
    best
}

/// Resolves faces waiting for identification against one provider.
pub struct FaceIdentifier {
    provider: Arc<dyn FaceProvider>,
    repository: Arc<dyn FaceRepository>,
    blobs: Arc<dyn BlobStore>,
    retry: RetryPolicy,
}

impl FaceIdentifier {
    pub fn new(
        provider: Arc<dyn FaceProvider>,
        repository: Arc<dyn FaceRepository>,
        blobs: Arc<dyn BlobStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            repository,
            blobs,
            retry,
        }
    }

    async fn person_keys(&self, cancel: &CancellationToken) -> Result<HashMap<String, i64>, FaceServiceError> {
        Ok(self
            .repository
            .list_persons(cancel)
            .await?
            .into_iter()
            .map(|p| (p.user_key(), p.id))
            .collect())
    }

    /// Identify a single face from its image and persist the result.
    pub async fn identify_face(
        &self,
        face: &Face,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> Result<IdentifyOutcome, FaceServiceError> {
        let persons = self.person_keys(cancel).await?;
        self.identify_with(face, image, &persons, cancel).await
    }

    async fn identify_with(
        &self,
        face: &Face,
        image: &[u8],
        persons: &HashMap<String, i64>,
        cancel: &CancellationToken,
    ) -> Result<IdentifyOutcome, FaceServiceError> {
        if face.identity_status != IdentityStatus::ForReprocessing {
            return Ok(IdentifyOutcome::Skipped);
        }

        let provider = &self.provider;
        let detected = match with_retry(&self.retry, cancel, "detect_faces", || {
            provider.detect_faces(image, cancel)
        })
        .await
        {
            Ok(detected) => detected,
            Err(e) if e.is_retryable() => {
                warn!(face_id = face.id, error = %e, "Face detection unavailable, deferring");
                return Ok(IdentifyOutcome::Deferred);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(first) = detected.first() else {
            debug!(face_id = face.id, "No face detected in sample");
            return self.store(face.id, IdentityUpdate::not_identified(), cancel).await;
        };

        let tokens = [first.token.clone()];
        let results = match with_retry(&self.retry, cancel, "identify", || provider.identify(&tokens, cancel)).await {
            Ok(results) => results,
            Err(e) if e.is_retryable() => {
                warn!(face_id = face.id, error = %e, "Identification unavailable, deferring");
                return Ok(IdentifyOutcome::Deferred);
            }
            Err(e) => return Err(e.into()),
        };

        let candidates = results
            .into_iter()
            .find(|r| r.token == tokens[0])
            .map(|r| r.candidates)
            .unwrap_or_default();

        let update = match select_best_candidate(&candidates, persons) {
            Some((person_id, confidence)) => IdentityUpdate::identified(person_id, confidence),
            None => IdentityUpdate::not_identified(),
        };
        self.store(face.id, update, cancel).await
    }

    async fn store(
        &self,
        face_id: i64,
        update: IdentityUpdate,
        cancel: &CancellationToken,
    ) -> Result<IdentifyOutcome, FaceServiceError> {
        let outcome = match update.person_id {
            Some(person_id) => IdentifyOutcome::Identified {
                person_id,
                confidence: update.confidence,
            },
            None => IdentifyOutcome::NotIdentified,
        };
        self.repository.update_face_identity(face_id, update, cancel).await?;
        debug!(face_id, outcome = ?outcome, "Face identity updated");
        Ok(outcome)
    }

    /// Identify every face waiting for it. Stops at the first permanent
    /// provider or storage failure.
    pub async fn identify_pending(&self, cancel: &CancellationToken) -> Result<IdentificationReport, FaceServiceError> {
        let persons = self.person_keys(cancel).await?;
        let faces = self
            .repository
            .list_faces_by_status(IdentityStatus::ForReprocessing, cancel)
            .await?;
        info!(provider = self.provider.name(), faces = faces.len(), "Identifying pending faces");

        let mut report = IdentificationReport::default();
        for face in &faces {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled.into());
            }
            let image = self.blobs.open_face(face, cancel).await?;
            let outcome = self.identify_with(face, &image, &persons, cancel).await?;
            report.record(&outcome);
        }

        info!(
            identified = report.identified,
            not_identified = report.not_identified,
            deferred = report.deferred,
            "Identification pass finished"
        );
        Ok(report)
    }
}
