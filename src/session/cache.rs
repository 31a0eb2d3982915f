//! Bounded LRU cache of parsed directory objects, keyed by object id, with
//! a revision check so a stale entry is evicted the moment the on-disk
//! file changes under it — e.g. housekeeping touched the same account
//! between two commands of this session.

use crate::config::DiscSet;
use crate::dr::DirectoryRecord;
use crate::sos;
use moka::sync::Cache;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
struct CachedDir {
    record: Arc<DirectoryRecord>,
    revision: sos::Revision,
}

/// Private to one session (spec.md §5: "no cross-process sharing of
/// in-memory state" — here, no cross-task sharing either).
pub struct DirectoryCache {
    cache: Cache<u64, CachedDir>,
}

impl DirectoryCache {
    pub fn new(max_size: u64) -> Self {
        DirectoryCache {
            cache: Cache::new(max_size),
        }
    }

    /// Returns the cached record for `object_id` if its on-disk revision at
    /// `rel_path` still matches; otherwise evicts it and returns `None` so
    /// the caller reloads from disk.
    pub fn get_if_fresh(
        &self,
        object_id: u64,
        disc_set: &DiscSet,
        rel_path: &Path,
    ) -> Option<Arc<DirectoryRecord>> {
        let cached = self.cache.get(&object_id)?;
        match sos::exists_with_revision(disc_set, rel_path) {
            Some((_, revision)) if revision == cached.revision => Some(cached.record),
            _ => {
                self.cache.invalidate(&object_id);
                None
            }
        }
    }

    pub fn insert(&self, object_id: u64, record: Arc<DirectoryRecord>, revision: sos::Revision) {
        self.cache.insert(object_id, CachedDir { record, revision });
    }

    pub fn invalidate(&self, object_id: u64) {
        self.cache.invalidate(&object_id);
    }

    /// Flushes the whole cache. Anything borrowed from it before this call
    /// is stale; `session::SessionContext` scopes mutations so a flush
    /// never runs while such a borrow is alive (spec.md §9).
    pub fn flush(&self) {
        self.cache.invalidate_all();
    }

    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }
}
