//! Directory record: a directory object serialized as an ordered entry
//! list, and the idempotent structural fixup the consistency checker
//! leans on to bring a directory back into a self-consistent shape.
//!
//! Patch dependency chains are represented the way the on-disk format
//! does: `depends_newer`/`depends_older` are indices into the same
//! directory's entry list by object id, not an external linked list.

use crate::error::DrError;
use crate::wire::{read_blob, write_blob, read_blob16, write_blob16, U16Be, U32Be, U64Be};
use std::io::{Read, Write};

pub const DIR_MAGIC: u32 = 0x4449_525f; // 'DIR_'

/// Per-entry flags. `File` and `Dir` are mutually exclusive; the rest are
/// independent bits on top of whichever of those two is set.
pub mod entry_flags {
    pub const FILE: u16 = 1;
    pub const DIR: u16 = 2;
    pub const OLD_VERSION: u16 = 4;
    pub const DELETED: u16 = 8;
    /// Set on a patch entry whose reverse-diff against the newer version
    /// turned out to be a completely different encoding rather than a true
    /// patch (spec.md §4.3); such an entry carries no dependency link.
    pub const REVERSED_DIFF_COMPLETELY_DIFFERENT: u16 = 16;
}

/// One entry in a directory's ordered list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: Vec<u8>,
    pub object_id: u64,
    pub mtime: u64,
    pub size_blocks: u64,
    pub flags: u16,
    pub attr_hash: u64,
    /// Object id of the entry that is a newer version of this same name,
    /// 0 if none.
    pub depends_newer: u64,
    /// Object id of the entry that is an older version of this same name,
    /// 0 if none.
    pub depends_older: u64,
    pub attrs_blob: Vec<u8>,
}

impl Entry {
    pub fn is_file(&self) -> bool {
        self.flags & entry_flags::FILE != 0
    }

    pub fn is_dir(&self) -> bool {
        self.flags & entry_flags::DIR != 0
    }

    pub fn is_old_version(&self) -> bool {
        self.flags & entry_flags::OLD_VERSION != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & entry_flags::DELETED != 0
    }

    /// "Current" means neither an old version nor deleted — spec.md §3's
    /// invariant that at most one entry per name is current.
    pub fn is_current(&self) -> bool {
        !self.is_old_version() && !self.is_deleted()
    }
}

/// A directory object: an ordered entry list plus its own attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub object_id: u64,
    pub container_id: u64,
    pub attrs_blob: Vec<u8>,
    pub attr_mtime: u64,
    pub entries: Vec<Entry>,
}

impl DirectoryRecord {
    pub fn new(object_id: u64, container_id: u64, attrs_blob: Vec<u8>, attr_mtime: u64) -> Self {
        DirectoryRecord {
            object_id,
            container_id,
            attrs_blob,
            attr_mtime,
            entries: Vec::new(),
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        U32Be(DIR_MAGIC).write_to(w)?;
        U64Be(self.object_id).write_to(w)?;
        U64Be(self.container_id).write_to(w)?;
        write_blob(w, &self.attrs_blob)?;
        U64Be(self.attr_mtime).write_to(w)?;
        U64Be(self.entries.len() as u64).write_to(w)?;
        for e in &self.entries {
            write_blob16(w, &e.name)?;
            U64Be(e.object_id).write_to(w)?;
            U64Be(e.mtime).write_to(w)?;
            U64Be(e.size_blocks).write_to(w)?;
            U16Be(e.flags).write_to(w)?;
            U64Be(e.attr_hash).write_to(w)?;
            U64Be(e.depends_newer).write_to(w)?;
            U64Be(e.depends_older).write_to(w)?;
            write_blob(w, &e.attrs_blob)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, DrError> {
        let magic = U32Be::read_from(r).map_err(|_| DrError::Truncated)?.get();
        if magic != DIR_MAGIC {
            return Err(DrError::BadMagic);
        }
        let object_id = U64Be::read_from(r).map_err(|_| DrError::Truncated)?.get();
        let container_id = U64Be::read_from(r).map_err(|_| DrError::Truncated)?.get();
        let attrs_blob = read_blob(r).map_err(|_| DrError::Truncated)?;
        let attr_mtime = U64Be::read_from(r).map_err(|_| DrError::Truncated)?.get();
        let count = U64Be::read_from(r).map_err(|_| DrError::Truncated)?.get();
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = read_blob16(r).map_err(|_| DrError::Truncated)?;
            let object_id = U64Be::read_from(r).map_err(|_| DrError::Truncated)?.get();
            let mtime = U64Be::read_from(r).map_err(|_| DrError::Truncated)?.get();
            let size_blocks = U64Be::read_from(r).map_err(|_| DrError::Truncated)?.get();
            let flags = U16Be::read_from(r).map_err(|_| DrError::Truncated)?.get();
            let attr_hash = U64Be::read_from(r).map_err(|_| DrError::Truncated)?.get();
            let depends_newer = U64Be::read_from(r).map_err(|_| DrError::Truncated)?.get();
            let depends_older = U64Be::read_from(r).map_err(|_| DrError::Truncated)?.get();
            let attrs_blob = read_blob(r).map_err(|_| DrError::Truncated)?;
            entries.push(Entry {
                name,
                object_id,
                mtime,
                size_blocks,
                flags,
                attr_hash,
                depends_newer,
                depends_older,
                attrs_blob,
            });
        }
        Ok(DirectoryRecord {
            object_id,
            container_id,
            attrs_blob,
            attr_mtime,
            entries,
        })
    }

    /// Idempotent structural fixup. Returns `true` iff something changed.
    /// The checker calls this up to twice per directory and relies on the
    /// second call reporting no change.
    pub fn check_and_fix(&mut self) -> bool {
        let mut changed = false;

        // 1. Remove duplicate entries for the same object id, keeping the
        // first occurrence.
        let mut seen = std::collections::HashSet::new();
        let before = self.entries.len();
        self.entries.retain(|e| seen.insert(e.object_id));
        if self.entries.len() != before {
            changed = true;
        }

        // 2. An entry flagged both current-implying-OldVersion and Deleted
        // is kept as Deleted only (Deleted wins; demote away the
        // OldVersion bit so the two states aren't conflated).
        for e in &mut self.entries {
            if e.is_deleted() && e.is_old_version() {
                e.flags &= !entry_flags::OLD_VERSION;
                changed = true;
            }
        }

        // 3. Rebuild dependsNewer/dependsOlder from modification-time
        // ordering within each name group, and demote every entry but the
        // newest in a group to OldVersion.
        use std::collections::BTreeMap;
        let mut by_name: BTreeMap<Vec<u8>, Vec<usize>> = BTreeMap::new();
        for (i, e) in self.entries.iter().enumerate() {
            by_name.entry(e.name.clone()).or_default().push(i);
        }

        for indices in by_name.values() {
            // Entries flagged REVERSED_DIFF_COMPLETELY_DIFFERENT carry no
            // dependency link (spec.md §4.3) and never join the mtime
            // chain, even when other versions of the same name do.
            let (chain_indices, flagged_indices): (Vec<usize>, Vec<usize>) = indices
                .iter()
                .copied()
                .partition(|&i| self.entries[i].flags & entry_flags::REVERSED_DIFF_COMPLETELY_DIFFERENT == 0);

            for &i in &flagged_indices {
                let e = &mut self.entries[i];
                if e.depends_newer != 0 || e.depends_older != 0 {
                    e.depends_newer = 0;
                    e.depends_older = 0;
                    changed = true;
                }
            }

            if chain_indices.len() < 2 {
                if let Some(&i) = chain_indices.first() {
                    let e = &mut self.entries[i];
                    if e.depends_newer != 0 || e.depends_older != 0 {
                        e.depends_newer = 0;
                        e.depends_older = 0;
                        changed = true;
                    }
                }
                continue;
            }
            let mut ordered = chain_indices.clone();
            ordered.sort_by_key(|&i| self.entries[i].mtime);
            for (pos, &i) in ordered.iter().enumerate() {
                let newer = if pos + 1 < ordered.len() {
                    self.entries[ordered[pos + 1]].object_id
                } else {
                    0
                };
                let older = if pos > 0 {
                    self.entries[ordered[pos - 1]].object_id
                } else {
                    0
                };
                let is_newest = pos + 1 == ordered.len();
                let e = &mut self.entries[i];
                if e.depends_newer != newer {
                    e.depends_newer = newer;
                    changed = true;
                }
                if e.depends_older != older {
                    e.depends_older = older;
                    changed = true;
                }
                if !is_newest && !e.is_deleted() && !e.is_old_version() {
                    e.flags |= entry_flags::OLD_VERSION;
                    changed = true;
                }
            }
        }

        // 4. Drop dependency pointers to nonexistent entries (can't happen
        // from step 3's own bookkeeping, but guards against a corrupt
        // on-disk record with stale links).
        let ids: std::collections::HashSet<u64> = self.entries.iter().map(|e| e.object_id).collect();
        for e in &mut self.entries {
            if e.depends_newer != 0 && !ids.contains(&e.depends_newer) {
                e.depends_newer = 0;
                changed = true;
            }
            if e.depends_older != 0 && !ids.contains(&e.depends_older) {
                e.depends_older = 0;
                changed = true;
            }
        }

        changed
    }

    pub fn find_current(&self, name: &[u8]) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name && e.is_current())
    }

    pub fn find_by_id(&self, object_id: u64) -> Option<&Entry> {
        self.entries.iter().find(|e| e.object_id == object_id)
    }

    pub fn find_by_id_mut(&mut self, object_id: u64) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.object_id == object_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(name: &str, id: u64, mtime: u64, flags: u16) -> Entry {
        Entry {
            name: name.as_bytes().to_vec(),
            object_id: id,
            mtime,
            size_blocks: 1,
            flags,
            attr_hash: 0,
            depends_newer: 0,
            depends_older: 0,
            attrs_blob: Vec::new(),
        }
    }

    #[test]
    fn roundtrips_through_wire_format() {
        let mut dir = DirectoryRecord::new(2, 1, vec![9, 9], 42);
        dir.entries.push(entry("x1", 3, 100, entry_flags::FILE));
        let mut bytes = Vec::new();
        dir.write_to(&mut bytes).unwrap();
        let mut cursor = &bytes[..];
        let back = DirectoryRecord::read_from(&mut cursor).unwrap();
        assert_eq!(back, dir);
    }

    #[test]
    fn check_and_fix_links_a_patch_chain_by_mtime() {
        let mut dir = DirectoryRecord::new(2, 1, Vec::new(), 0);
        dir.entries.push(entry("x1", 10, 100, entry_flags::FILE));
        dir.entries.push(entry("x1", 20, 200, entry_flags::FILE));

        let changed = dir.check_and_fix();
        assert!(changed);

        let older = dir.find_by_id(10).unwrap();
        assert!(older.is_old_version());
        assert_eq!(older.depends_newer, 20);
        let newer = dir.find_by_id(20).unwrap();
        assert!(newer.is_current());
        assert_eq!(newer.depends_older, 10);
    }

    #[test]
    fn check_and_fix_is_idempotent() {
        let mut dir = DirectoryRecord::new(2, 1, Vec::new(), 0);
        dir.entries.push(entry("x1", 10, 100, entry_flags::FILE));
        dir.entries.push(entry("x1", 20, 200, entry_flags::FILE));
        dir.entries.push(entry("x2", 30, 50, entry_flags::FILE));

        dir.check_and_fix();
        let changed_again = dir.check_and_fix();
        assert!(!changed_again);
    }

    #[test]
    fn check_and_fix_removes_duplicate_object_ids() {
        let mut dir = DirectoryRecord::new(2, 1, Vec::new(), 0);
        dir.entries.push(entry("x1", 10, 100, entry_flags::FILE));
        dir.entries.push(entry("x1", 10, 100, entry_flags::FILE));

        let changed = dir.check_and_fix();
        assert!(changed);
        assert_eq!(dir.entries.len(), 1);
    }

    #[test]
    fn check_and_fix_leaves_completely_different_entries_unlinked() {
        let mut dir = DirectoryRecord::new(2, 1, Vec::new(), 0);
        dir.entries.push(entry(
            "x1",
            10,
            100,
            entry_flags::FILE | entry_flags::REVERSED_DIFF_COMPLETELY_DIFFERENT,
        ));
        dir.entries.push(entry("x1", 20, 200, entry_flags::FILE));

        dir.check_and_fix();

        let flagged = dir.find_by_id(10).unwrap();
        assert_eq!(flagged.depends_newer, 0);
        assert_eq!(flagged.depends_older, 0);
        assert!(!flagged.is_old_version());

        let newer = dir.find_by_id(20).unwrap();
        assert_eq!(newer.depends_newer, 0);
        assert_eq!(newer.depends_older, 0);
    }

    #[test]
    fn check_and_fix_demotes_old_version_when_also_deleted() {
        let mut dir = DirectoryRecord::new(2, 1, Vec::new(), 0);
        dir.entries
            .push(entry("x1", 10, 100, entry_flags::FILE | entry_flags::OLD_VERSION | entry_flags::DELETED));

        dir.check_and_fix();
        let e = dir.find_by_id(10).unwrap();
        assert!(e.is_deleted());
        assert!(!e.is_old_version());
    }
}
