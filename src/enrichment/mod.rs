//! Enrichment scheduling: enricher contract, dependency executor and the
//! per-photo pipeline.

pub mod diff;
pub mod executor;
pub mod kind;
pub mod pipeline;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::photo::{Enrichment, Photo, SourceData};

pub use diff::{expand_with_dependencies, missing_kinds};
pub use executor::{DependencyExecutor, ExecutionReport};
pub use kind::EnricherKind;
pub use pipeline::{ActiveEnrichers, BatchOutcome, EnricherCatalog, EnrichmentPipeline};

/// One unit of photo analysis.
///
/// Implementations read the photo as left by earlier waves plus the shared
/// source data, and return a patch. They must not assume anything about other
/// members of their own wave.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn kind(&self) -> EnricherKind;

    /// Kinds that must finish before this enricher starts.
    fn prerequisites(&self) -> &[EnricherKind] {
        self.kind().prerequisites()
    }

    async fn enrich(
        &self,
        photo: &Photo,
        source: &SourceData,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Enrichment>;
}
