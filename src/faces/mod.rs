pub mod aws;
pub mod azure;
mod http;
pub mod identify;
pub mod local;
pub mod model;
pub mod provider;
pub mod reconcile;

#[cfg(test)]
pub(crate) mod fake;

pub use identify::{select_best_candidate, FaceIdentifier, IdentificationReport, IdentifyOutcome};
pub use model::{Candidate, ExternalRef, Face, IdentityStatus, NormalizedBox, Person};
pub use provider::{create_provider, DetectedFace, FaceProvider, IdentifyResult};
pub use reconcile::{FaceReconciler, FaceSyncReport, PersonSyncReport, ReconcileReport, UnmatchedFace};
