//! Works out which enrichers still need to run for an already processed photo.

use std::collections::BTreeSet;

use super::EnricherKind;
use crate::photo::Photo;

/// Active kinds the photo has not been enriched with yet, together with the
/// prerequisites they need.
///
/// Data-provider kinds (preview, analyze) are pulled in again whenever a
/// missing dependent needs them, even if the photo already carries them,
/// because their output is only kept for the duration of a run.
pub fn missing_kinds(photo: &Photo, active: &BTreeSet<EnricherKind>) -> BTreeSet<EnricherKind> {
    let mut to_run = BTreeSet::new();
    for kind in active {
        if !photo.enriched_with.contains(kind) {
            add_with_prerequisites(*kind, photo, &mut to_run);
        }
    }
    to_run
}

fn add_with_prerequisites(kind: EnricherKind, photo: &Photo, to_run: &mut BTreeSet<EnricherKind>) {
    if !to_run.insert(kind) {
        return;
    }
    for prereq in kind.prerequisites() {
        if prereq.is_data_provider() || !photo.enriched_with.contains(prereq) {
            add_with_prerequisites(*prereq, photo, to_run);
        }
    }
}

/// `kinds` plus everything they transitively depend on.
pub fn expand_with_dependencies(kinds: &BTreeSet<EnricherKind>) -> BTreeSet<EnricherKind> {
    let mut expanded = BTreeSet::new();
    let mut stack: Vec<EnricherKind> = kinds.iter().copied().collect();
    while let Some(kind) = stack.pop() {
        if expanded.insert(kind) {
            stack.extend(kind.prerequisites().iter().copied());
        }
    }
    expanded
}
