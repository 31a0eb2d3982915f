//! Property tests for `DirectoryRecord::check_and_fix`: arbitrary, possibly
//! inconsistent entry sets (duplicate object ids, multiple entries sharing
//! a name, pre-existing deleted/old-version flags) always settle into a
//! consistent record after one pass, and a second pass never finds anything
//! left to do.

use coldvault::dr::{entry_flags, DirectoryRecord, Entry};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

fn entry_strategy() -> impl Strategy<Value = (String, u64, u64, bool)> {
    (
        prop_oneof![Just("a".to_string()), Just("b".to_string()), Just("c".to_string())],
        1u64..20,
        0u64..1000,
        any::<bool>(),
    )
}

fn build_record(raw: &[(String, u64, u64, bool)]) -> DirectoryRecord {
    let mut dir = DirectoryRecord::new(1, 1, Vec::new(), 0);
    for (name, id, mtime, deleted) in raw {
        let mut flags = entry_flags::FILE;
        if *deleted {
            flags |= entry_flags::DELETED;
        }
        dir.entries.push(Entry {
            name: name.as_bytes().to_vec(),
            object_id: *id,
            mtime: *mtime,
            size_blocks: 1,
            flags,
            attr_hash: 0,
            depends_newer: 0,
            depends_older: 0,
            attrs_blob: Vec::new(),
        });
    }
    dir
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// One pass of `check_and_fix` always reaches a fixed point: running it
    /// again finds nothing left to change.
    #[test]
    fn check_and_fix_reaches_a_fixed_point(raw in vec(entry_strategy(), 0..12)) {
        let mut dir = build_record(&raw);
        dir.check_and_fix();
        let changed_again = dir.check_and_fix();
        prop_assert!(!changed_again, "a second pass must find nothing left to fix");
    }

    /// After a fixup pass, every object id appears at most once, every name
    /// has at most one current (non-deleted, non-old-version) entry, and no
    /// dependency pointer refers to an object id that no longer exists.
    #[test]
    fn check_and_fix_produces_a_consistent_record(raw in vec(entry_strategy(), 0..12)) {
        let mut dir = build_record(&raw);
        dir.check_and_fix();

        let mut seen_ids = HashSet::new();
        for e in &dir.entries {
            prop_assert!(seen_ids.insert(e.object_id), "duplicate object id {} survived fixup", e.object_id);
        }

        let mut current_per_name: HashMap<Vec<u8>, usize> = HashMap::new();
        for e in &dir.entries {
            if e.is_current() {
                *current_per_name.entry(e.name.clone()).or_insert(0) += 1;
            }
        }
        for (name, count) in &current_per_name {
            prop_assert!(*count <= 1, "name {:?} has {} current entries after fixup", name, count);
        }

        let ids: HashSet<u64> = dir.entries.iter().map(|e| e.object_id).collect();
        for e in &dir.entries {
            if e.depends_newer != 0 {
                prop_assert!(ids.contains(&e.depends_newer), "dangling depends_newer {}", e.depends_newer);
            }
            if e.depends_older != 0 {
                prop_assert!(ids.contains(&e.depends_older), "dangling depends_older {}", e.depends_older);
            }
        }

        // An entry flagged both deleted and old-version is never left that
        // way -- check_and_fix demotes such conflicts to deleted-only.
        for e in &dir.entries {
            prop_assert!(!(e.is_deleted() && e.is_old_version()), "entry {} is both deleted and old-version", e.object_id);
        }
    }
}
