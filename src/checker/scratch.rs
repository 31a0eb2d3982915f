//! Scratch table the checker accumulates during phases 1-2: one row per
//! object discovered on disk, updated in place as later phases learn more
//! about it.

use std::collections::HashMap;

/// What phase 1's magic-byte classification found an object to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchKind {
    File,
    Directory,
}

/// One row of the scratch table, keyed by object id.
#[derive(Debug, Clone)]
pub struct ScratchEntry {
    pub kind: ScratchKind,
    /// Container id as read from the object itself (a directory's own
    /// `container_id` field, or the container a DR entry claims for a
    /// child — phase 2 may rewrite this for a child whose claimed
    /// container disagrees with where it was actually found).
    pub container_id: u64,
    pub size_blocks: u64,
    /// Set by phase 2 the first time some directory's entry list contains
    /// this object. An object that never gets this bit set is an orphan.
    pub contained: bool,
}

/// Accumulated state across all six phases for one account's object tree.
#[derive(Debug, Default)]
pub struct ScratchTable {
    pub entries: HashMap<u64, ScratchEntry>,
    /// Objects phase 2 found referenced with a container id that disagreed
    /// with the directory actually holding the reference; phase 5 corrects
    /// these on the child object itself.
    pub container_mismatches: Vec<(u64, u64)>,
}

impl ScratchTable {
    pub fn new() -> Self {
        ScratchTable::default()
    }

    pub fn insert(&mut self, object_id: u64, kind: ScratchKind, container_id: u64, size_blocks: u64) {
        self.entries.insert(
            object_id,
            ScratchEntry {
                kind,
                container_id,
                size_blocks,
                contained: false,
            },
        );
    }

    pub fn mark_contained(&mut self, object_id: u64) {
        if let Some(e) = self.entries.get_mut(&object_id) {
            e.contained = true;
        }
    }

    pub fn orphans(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.contained)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn record_container_mismatch(&mut self, object_id: u64, actual_container: u64) {
        self.container_mismatches.push((object_id, actual_container));
    }
}
