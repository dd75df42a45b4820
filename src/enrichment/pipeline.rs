use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::diff::{expand_with_dependencies, missing_kinds};
use super::executor::{DependencyExecutor, ExecutionReport};
use super::{Enricher, EnricherKind};
use crate::config::EnrichmentConfig;
use crate::error::{ConfigurationError, ExecutorError};
use crate::photo::{Photo, SourceData};

/// Decides which enricher kinds are switched on.
pub trait ActiveEnrichers: Send + Sync {
    fn active_kinds(&self) -> BTreeSet<EnricherKind>;
}

impl ActiveEnrichers for BTreeSet<EnricherKind> {
    fn active_kinds(&self) -> BTreeSet<EnricherKind> {
        self.clone()
    }
}

/// Static registry of enricher implementations, one per kind.
#[derive(Clone, Default)]
pub struct EnricherCatalog {
    enrichers: BTreeMap<EnricherKind, Arc<dyn Enricher>>,
}

impl EnricherCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an enricher, replacing any previous one of the same kind.
    pub fn register(&mut self, enricher: Arc<dyn Enricher>) -> Option<Arc<dyn Enricher>> {
        self.enrichers.insert(enricher.kind(), enricher)
    }

    pub fn with(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.register(enricher);
        self
    }

    pub fn kinds(&self) -> BTreeSet<EnricherKind> {
        self.enrichers.keys().copied().collect()
    }

    pub fn get(&self, kind: EnricherKind) -> Option<&Arc<dyn Enricher>> {
        self.enrichers.get(&kind)
    }

    /// Task set for `kinds`, failing on the first kind nobody registered.
    pub fn select(
        &self,
        kinds: &BTreeSet<EnricherKind>,
    ) -> Result<Vec<Arc<dyn Enricher>>, ConfigurationError> {
        kinds
            .iter()
            .map(|kind| {
                self.enrichers
                    .get(kind)
                    .cloned()
                    .ok_or(ConfigurationError::NotRegistered(*kind))
            })
            .collect()
    }
}

/// Result of one photo in a batch run.
pub struct BatchOutcome {
    pub photo: Photo,
    pub source: SourceData,
    pub result: Result<ExecutionReport, ExecutorError>,
}

/// Drives one dependency-executor run per photo.
pub struct EnrichmentPipeline {
    catalog: EnricherCatalog,
    executor: DependencyExecutor,
    max_parallel_photos: usize,
}

impl EnrichmentPipeline {
    pub fn new(catalog: EnricherCatalog, config: &EnrichmentConfig) -> Self {
        info!(
            enrichers = catalog.enrichers.len(),
            names = %catalog.kinds().iter().map(|k| k.name()).collect::<Vec<_>>().join(", "),
            "Enrichment pipeline initialized"
        );
        Self {
            catalog,
            executor: DependencyExecutor::new().with_timings(config.log_timings),
            max_parallel_photos: config.max_parallel_photos.max(1),
        }
    }

    pub fn catalog(&self) -> &EnricherCatalog {
        &self.catalog
    }

    /// Waves the active kinds would run in.
    pub fn plan(&self, active: &BTreeSet<EnricherKind>) -> Result<Vec<Vec<EnricherKind>>, ExecutorError> {
        let tasks = self.catalog.select(active)?;
        DependencyExecutor::plan(&tasks)
    }

    /// Enrich `photo` with every active kind.
    ///
    /// The run works on a copy; `photo` and `source` are only overwritten
    /// when every enricher succeeded. On error the caller must not save the
    /// photo as enriched.
    pub async fn run(
        &self,
        photo: &mut Photo,
        source: &mut SourceData,
        active: &BTreeSet<EnricherKind>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, ExecutorError> {
        let tasks = self.catalog.select(active)?;

        let mut working = photo.clone();
        let mut working_source = source.clone();
        match self
            .executor
            .execute(&tasks, &mut working, &mut working_source, cancel)
            .await
        {
            Ok(report) => {
                working.enriched_at = Some(Utc::now());
                *photo = working;
                *source = working_source;
                debug!(photo_id = photo.id, executed = report.executed(), ms = report.elapsed.as_millis() as u64, "Photo enriched");
                Ok(report)
            }
            Err(e) => {
                warn!(photo_id = photo.id, error = %e, "Enrichment failed, photo left unchanged");
                Err(e)
            }
        }
    }

    /// Run only what the photo is missing from the active set.
    pub async fn run_missing(
        &self,
        photo: &mut Photo,
        source: &mut SourceData,
        active: &BTreeSet<EnricherKind>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, ExecutorError> {
        let kinds = expand_with_dependencies(&missing_kinds(photo, active));
        if kinds.is_empty() {
            debug!(photo_id = photo.id, "Nothing to re-enrich");
            return Ok(ExecutionReport::default());
        }
        self.run(photo, source, &kinds, cancel).await
    }

    /// Enrich several independent photos concurrently. Outcomes come back in
    /// input order.
    pub async fn run_batch(
        &self,
        items: Vec<(Photo, SourceData)>,
        active: &BTreeSet<EnricherKind>,
        cancel: &CancellationToken,
    ) -> Vec<BatchOutcome> {
        let total = items.len();
        info!(count = total, parallel = self.max_parallel_photos, "Batch enrichment started");

        let outcomes: Vec<BatchOutcome> = stream::iter(items)
            .map(|(mut photo, mut source)| async move {
                let result = self.run(&mut photo, &mut source, active, cancel).await;
                BatchOutcome {
                    photo,
                    source,
                    result,
                }
            })
            .buffered(self.max_parallel_photos)
            .collect()
            .await;

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(count = total, failed, "Batch enrichment completed");
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::executor::tests::{catalog_recorders, Event, Recorder};
    use crate::photo::Tag;
    use std::sync::Mutex;

    fn catalog(tasks: Vec<Arc<dyn Enricher>>) -> EnricherCatalog {
        tasks.into_iter().fold(EnricherCatalog::new(), |c, t| c.with(t))
    }

    fn all() -> BTreeSet<EnricherKind> {
        EnricherKind::ALL.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_run_filters_to_active_kinds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = EnrichmentPipeline::new(catalog(catalog_recorders(&log)), &EnrichmentConfig::default());
        let active: BTreeSet<_> = [EnricherKind::Preview, EnricherKind::Thumbnail].into_iter().collect();

        let mut photo = Photo::new(5);
        let mut source = SourceData::default();
        let report = pipeline
            .run(&mut photo, &mut source, &active, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.executed(), 2);
        assert_eq!(photo.enriched_with, active);
        assert!(photo.enriched_at.is_some());
        let log = log.lock().unwrap();
        assert!(!log.contains(&Event::Start(EnricherKind::Analyze)));
    }

    #[tokio::test]
    async fn test_active_kind_without_prerequisite_is_configuration_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = EnrichmentPipeline::new(catalog(catalog_recorders(&log)), &EnrichmentConfig::default());
        let active: BTreeSet<_> = [EnricherKind::Preview, EnricherKind::Caption].into_iter().collect();

        let mut photo = Photo::new(5);
        let mut source = SourceData::default();
        let err = pipeline
            .run(&mut photo, &mut source, &active, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExecutorError::Configuration(ConfigurationError::MissingDependency {
                task: EnricherKind::Caption,
                missing: EnricherKind::Analyze
            })
        ));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_active_kind_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = EnrichmentPipeline::new(
            catalog(vec![Arc::new(Recorder::new(EnricherKind::Preview, &log))]),
            &EnrichmentConfig::default(),
        );

        let err = pipeline.plan(&all()).unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::Configuration(ConfigurationError::NotRegistered(EnricherKind::Metadata))
        ));
    }

    #[tokio::test]
    async fn test_failed_run_leaves_photo_untouched() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = catalog_recorders(&log);
        tasks.retain(|t| t.kind() != EnricherKind::Adult);
        tasks.push(Arc::new(Recorder::new(EnricherKind::Adult, &log).failing()));
        let pipeline = EnrichmentPipeline::new(catalog(tasks), &EnrichmentConfig::default());

        let mut photo = Photo::new(9);
        photo.tags.push(Tag {
            name: "before".to_string(),
            confidence: 1.0,
        });
        let before = photo.clone();
        let mut source = SourceData::default();

        let err = pipeline
            .run(&mut photo, &mut source, &all(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Task { kind: EnricherKind::Adult, .. }));
        assert_eq!(photo, before);
    }

    #[tokio::test]
    async fn test_run_missing_skips_applied_kinds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = EnrichmentPipeline::new(catalog(catalog_recorders(&log)), &EnrichmentConfig::default());

        let mut photo = Photo::new(3);
        photo.enriched_with = [EnricherKind::Preview, EnricherKind::Analyze, EnricherKind::Tag]
            .into_iter()
            .collect();
        let mut source = SourceData::default();
        let active: BTreeSet<_> = [EnricherKind::Tag, EnricherKind::Color].into_iter().collect();

        let report = pipeline
            .run_missing(&mut photo, &mut source, &active, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            report.waves,
            vec![
                vec![EnricherKind::Preview],
                vec![EnricherKind::Analyze],
                vec![EnricherKind::Color]
            ]
        );
        assert!(!log.lock().unwrap().contains(&Event::Start(EnricherKind::Tag)));
    }

    #[tokio::test]
    async fn test_batch_keeps_photos_independent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = EnrichmentPipeline::new(catalog(catalog_recorders(&log)), &EnrichmentConfig::default());

        let items = (1..=6).map(|id| (Photo::new(id), SourceData::default())).collect();
        let outcomes = pipeline
            .run_batch(items, &all(), &CancellationToken::new())
            .await;

        assert_eq!(outcomes.len(), 6);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.photo.id, i as i64 + 1);
            assert!(outcome.result.is_ok());
            assert_eq!(outcome.photo.enriched_with.len(), 11);
        }
    }
}
