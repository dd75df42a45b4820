//! Wave-based dependency executor.
//!
//! Every task carries a readiness counter equal to the number of its
//! prerequisites. Tasks whose counter reaches zero go to the ready queue, and
//! each wave drains that queue completely: all members run concurrently, the
//! executor waits for the whole wave, then decrements the counters of their
//! dependents to form the next wave. An empty ready queue with tasks left over
//! means those tasks form a cycle.
//!
//! Validation and wave planning happen before the first task starts, so a
//! missing prerequisite or a cycle never leaves a half-enriched photo behind.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Enricher, EnricherKind};
use crate::error::{ConfigurationError, ExecutorError};
use crate::photo::{Enrichment, Photo, SourceData};

/// Summary of a successful run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    pub waves: Vec<Vec<EnricherKind>>,
    pub elapsed: Duration,
}

impl ExecutionReport {
    pub fn executed(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }
}

/// Readiness counters for one task set.
struct Schedule {
    remaining: BTreeMap<EnricherKind, usize>,
    dependents: HashMap<EnricherKind, Vec<EnricherKind>>,
}

impl Schedule {
    fn new<'a>(
        declared: impl IntoIterator<Item = (EnricherKind, &'a [EnricherKind])>,
    ) -> Result<Self, ConfigurationError> {
        let declared: Vec<(EnricherKind, BTreeSet<EnricherKind>)> = declared
            .into_iter()
            .map(|(kind, prereqs)| (kind, prereqs.iter().copied().collect()))
            .collect();

        let mut remaining = BTreeMap::new();
        for (kind, _) in &declared {
            if remaining.insert(*kind, 0).is_some() {
                return Err(ConfigurationError::DuplicateKind(*kind));
            }
        }

        let mut dependents: HashMap<EnricherKind, Vec<EnricherKind>> = HashMap::new();
        for (kind, prereqs) in &declared {
            for prereq in prereqs {
                if !remaining.contains_key(prereq) {
                    return Err(ConfigurationError::MissingDependency {
                        task: *kind,
                        missing: *prereq,
                    });
                }
                dependents.entry(*prereq).or_default().push(*kind);
            }
            remaining.insert(*kind, prereqs.len());
        }

        Ok(Self {
            remaining,
            dependents,
        })
    }

    fn into_waves(mut self) -> Result<Vec<Vec<EnricherKind>>, ExecutorError> {
        let mut ready: Vec<EnricherKind> = self
            .remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(kind, _)| *kind)
            .collect();
        let mut waves = Vec::new();

        while !self.remaining.is_empty() {
            if ready.is_empty() {
                return Err(ExecutorError::Cycle {
                    remaining: self.remaining.keys().copied().collect(),
                });
            }

            let wave = std::mem::take(&mut ready);
            for kind in &wave {
                self.remaining.remove(kind);
            }
            for kind in &wave {
                for dependent in self.dependents.get(kind).into_iter().flatten() {
                    if let Some(count) = self.remaining.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push(*dependent);
                        }
                    }
                }
            }
            ready.sort();
            waves.push(wave);
        }

        Ok(waves)
    }
}

/// Runs a set of enrichers for one photo in dependency waves.
#[derive(Debug, Clone, Default)]
pub struct DependencyExecutor {
    log_timings: bool,
}

impl DependencyExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timings(mut self, log_timings: bool) -> Self {
        self.log_timings = log_timings;
        self
    }

    /// Validate `tasks` and compute their waves without running anything.
    pub fn plan(tasks: &[Arc<dyn Enricher>]) -> Result<Vec<Vec<EnricherKind>>, ExecutorError> {
        Schedule::new(tasks.iter().map(|t| (t.kind(), t.prerequisites())))?.into_waves()
    }

    /// Run `tasks` against `photo`, applying each wave's patches after the
    /// wave has fully drained.
    ///
    /// If a task fails, the rest of its wave still runs to completion and the
    /// first failure (in completion order) is returned; no later wave starts.
    /// Patches from the failed wave are discarded.
    pub async fn execute(
        &self,
        tasks: &[Arc<dyn Enricher>],
        photo: &mut Photo,
        source: &mut SourceData,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, ExecutorError> {
        let started = Instant::now();
        let waves = Self::plan(tasks)?;
        let by_kind: HashMap<EnricherKind, &Arc<dyn Enricher>> =
            tasks.iter().map(|t| (t.kind(), t)).collect();

        debug!(photo_id = photo.id, waves = waves.len(), tasks = tasks.len(), "Executing enrichers");

        for (index, wave) in waves.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }

            let (patches, failure) = {
                let photo_view: &Photo = photo;
                let source_view: &SourceData = source;
                let mut running: FuturesUnordered<_> = wave
                    .iter()
                    .map(|kind| {
                        let enricher = by_kind[kind];
                        async move {
                            let task_started = Instant::now();
                            let result = enricher.enrich(photo_view, source_view, cancel).await;
                            (*kind, result, task_started.elapsed())
                        }
                    })
                    .collect();

                let mut patches: Vec<(EnricherKind, Enrichment)> = Vec::with_capacity(wave.len());
                let mut failure: Option<ExecutorError> = None;
                while let Some((kind, result, elapsed)) = running.next().await {
                    match result {
                        Ok(patch) => {
                            if self.log_timings {
                                info!(photo_id = photo_view.id, enricher = %kind, wave = index, ms = elapsed.as_millis() as u64, "Enricher completed");
                            } else {
                                debug!(photo_id = photo_view.id, enricher = %kind, wave = index, ms = elapsed.as_millis() as u64, "Enricher completed");
                            }
                            patches.push((kind, patch));
                        }
                        Err(e) => {
                            warn!(photo_id = photo_view.id, enricher = %kind, wave = index, error = %e, "Enricher failed");
                            if failure.is_none() {
                                failure = Some(ExecutorError::Task { kind, source: e });
                            }
                        }
                    }
                }
                (patches, failure)
            };

            if cancel.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }
            if let Some(err) = failure {
                return Err(err);
            }

            let mut patches = patches;
            patches.sort_by_key(|(kind, _)| *kind);
            for (kind, patch) in patches {
                patch.apply(photo, source);
                photo.enriched_with.insert(kind);
            }
        }

        Ok(ExecutionReport {
            waves,
            elapsed: started.elapsed(),
        })
    }
}
