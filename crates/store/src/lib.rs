//! Reconq store: last-observed snapshot per resource identity and change classification.
//!
//! The cache performs no locking of its own. The owning queue serializes every call.

#![forbid(unsafe_code)]

use std::collections::hash_map::Entry;

use reconq_core::{ComparisonResult, Resource, Uid};
use rustc_hash::FxHashMap;
use tracing::trace;

/// One snapshot per identity, replaced on each accepted update. No history is kept.
pub struct EntityCache<R> {
    entries: FxHashMap<Uid, R>,
}

impl<R: Resource> EntityCache<R> {
    pub fn new() -> Self { Self { entries: FxHashMap::default() } }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Store `resource` and classify it against the previous snapshot.
    ///
    /// The incoming snapshot always replaces the stored one, so fields outside `spec` and
    /// `status` (deletion timestamp, resource version) stay current even on `NotModified`.
    /// Returns the snapshot now held by the cache.
    pub fn upsert(&mut self, resource: R) -> (R, ComparisonResult) {
        match self.entries.entry(resource.uid().to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(resource.clone());
                (resource, ComparisonResult::New)
            }
            Entry::Occupied(mut slot) => {
                let stored = slot.get_mut();
                let cmp = if stored.spec() != resource.spec() {
                    ComparisonResult::Modified
                } else if stored.status() != resource.status() {
                    ComparisonResult::StatusModified
                } else {
                    trace!(uid = %resource.uid(), "cache entry unchanged");
                    ComparisonResult::NotModified
                };
                *stored = resource.clone();
                (resource, cmp)
            }
        }
    }

    pub fn get(&self, uid: &str) -> Option<&R> { self.entries.get(uid) }

    /// Drop the entry for `resource`; absent entries are ignored.
    pub fn remove(&mut self, resource: &R) -> Option<R> { self.entries.remove(resource.uid()) }

    pub fn clear(&mut self) { self.entries.clear(); }
}

impl<R: Resource> Default for EntityCache<R> {
    fn default() -> Self { Self::new() }
}
