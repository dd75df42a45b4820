//! Error types shared across the scheduler and the face engines.

use thiserror::Error;

use crate::enrichment::EnricherKind;

/// Task set cannot be scheduled as given.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("enricher {task} requires {missing}, which is not part of this run")]
    MissingDependency {
        task: EnricherKind,
        missing: EnricherKind,
    },

    #[error("enricher {0} was supplied more than once")]
    DuplicateKind(EnricherKind),

    #[error("no enricher registered for active kind {0}")]
    NotRegistered(EnricherKind),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("dependency cycle among enrichers: {}", format_kinds(.remaining))]
    Cycle { remaining: Vec<EnricherKind> },

    #[error("enricher {kind} failed: {source:#}")]
    Task {
        kind: EnricherKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("enrichment cancelled")]
    Cancelled,
}

fn format_kinds(kinds: &[EnricherKind]) -> String {
    kinds
        .iter()
        .map(|k| k.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure talking to a face-recognition provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,

    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("provider rejected the request: {0}")]
    Permanent(String),

    #[error("provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Timeouts and 5xx-style failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Timeout | ProviderError::Transient(_))
    }
}

/// Failure from the persistence or blob-storage collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("storage cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Failure syncing one user or one face. Collected, never fatal to the batch.
#[derive(Debug, Error)]
pub enum ReconcileItemError {
    #[error("user {user_key}: {source}")]
    User {
        user_key: String,
        #[source]
        source: ProviderError,
    },

    #[error("face {face_id}: {source}")]
    FaceProvider {
        face_id: i64,
        #[source]
        source: ProviderError,
    },

    #[error("face {face_id}: {source}")]
    FaceStore {
        face_id: i64,
        #[source]
        source: StoreError,
    },

    #[error("face {face_id}: provider indexed no face in the sample")]
    NothingIndexed { face_id: i64 },
}

/// Failure that stops a reconcile or identification pass as a whole.
#[derive(Debug, Error)]
pub enum FaceServiceError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Transient("503".into()).is_retryable());
        assert!(!ProviderError::Permanent("400".into()).is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
    }

    #[test]
    fn test_messages_name_the_kinds() {
        let err = ConfigurationError::MissingDependency {
            task: EnricherKind::Tag,
            missing: EnricherKind::Analyze,
        };
        assert_eq!(
            err.to_string(),
            "enricher tag requires analyze, which is not part of this run"
        );

        let err = ExecutorError::Cycle {
            remaining: vec![EnricherKind::Caption, EnricherKind::Tag],
        };
        assert_eq!(err.to_string(), "dependency cycle among enrichers: caption, tag");
    }
}
