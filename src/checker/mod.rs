//! Consistency checker (CC): an offline tool that walks an account's whole
//! object tree and brings it back into a self-consistent state, expecting
//! to hold the account's write lock for the duration (spec.md §4.7).
//!
//! Six phases, run in order and never interleaved with a live session:
//! scan every object on disk, walk every directory fixing up entries
//! against what was actually found, ensure the root exists, reattach
//! anything left unreferenced into `lost+found`, correct container-ID
//! disagreements, and finally rewrite the account's usage counters from
//! the repaired tree.

pub mod scratch;

use crate::account::AccountState;
use crate::config::{Config, DiscSet};
use crate::dr::{entry_flags, DirectoryRecord, Entry};
use crate::efc::{self, ObjectKind};
use crate::error::{ScError, SosError};
use crate::ons::ObjectNamespace;
use crate::session::ROOT_OBJECT_ID;
use crate::sos;
use scratch::{ScratchKind, ScratchTable};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct CheckOptions {
    pub fix: bool,
}

/// Summary handed back to the caller (the `boxcheck` CLI prints it).
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckReport {
    pub objects_scanned: u64,
    pub errors_found: u64,
    pub orphans_reattached: u64,
    pub lost_and_found_created: bool,
}

pub struct Checker {
    disc_set: DiscSet,
    ns: ObjectNamespace,
    account_root: String,
    block_size: usize,
    segment_bits: u32,
    fix: bool,
    account: AccountState,
    table: ScratchTable,
    dirs: HashMap<u64, DirectoryRecord>,
    errors: u64,
    orphans_reattached: u64,
    lost_and_found_created: bool,
}

impl Checker {
    /// Runs all six phases and returns the report plus the (possibly
    /// rewritten) account state. Nothing is written to disk unless
    /// `options.fix` is set.
    pub fn run(
        config: &Config,
        disc_set: DiscSet,
        account_root: String,
        account: AccountState,
        options: CheckOptions,
    ) -> Result<(CheckReport, AccountState), ScError> {
        let ns = ObjectNamespace::new(config.segment_length_bits)?;
        let mut checker = Checker {
            disc_set,
            ns,
            account_root,
            block_size: config.block_size as usize,
            segment_bits: config.segment_length_bits,
            fix: options.fix,
            account,
            table: ScratchTable::new(),
            dirs: HashMap::new(),
            errors: 0,
            orphans_reattached: 0,
            lost_and_found_created: false,
        };

        info!(account_id = checker.account.account_id, "phase 1: scanning objects");
        checker.phase1_scan_objects()?;
        info!(objects = checker.table.entries.len(), "phase 1 complete");

        info!("phase 2: walking directories");
        checker.phase2_walk_directories();

        info!("phase 3: ensuring root exists");
        checker.phase3_ensure_root()?;

        info!("phase 4: reattaching orphans");
        checker.phase4_reattach_orphans()?;

        info!("phase 5: secondary container-id fixups");
        checker.phase5_secondary_fixups();

        if checker.fix {
            checker.persist_directories()?;
        }

        info!("phase 6: rewriting account state");
        checker.phase6_rewrite_account_state();

        if checker.fix {
            checker.persist_account_state()?;
        }

        info!(errors = checker.errors, "check complete");
        let report = CheckReport {
            objects_scanned: checker.table.entries.len() as u64,
            errors_found: checker.errors,
            orphans_reattached: checker.orphans_reattached,
            lost_and_found_created: checker.lost_and_found_created,
        };
        Ok((report, checker.account))
    }

    // --- phase 1: scan objects -------------------------------------------

    fn phase1_scan_objects(&mut self) -> Result<(), ScError> {
        let root = PathBuf::from(self.account_root.clone());
        self.scan_dir(root, 0, 1)
    }

    fn scan_dir(&mut self, rel_dir: PathBuf, start_id: u64, level: u32) -> Result<(), ScError> {
        let leaf_names = sos::read_directory(&self.disc_set, &rel_dir)
            .map_err(|e| ScError::Sos(SosError::Io(e.to_string())))?;
        for name in leaf_names {
            match self.parse_leaf_name(&name, start_id) {
                Some(object_id) => self.check_and_add_object(object_id, &rel_dir.join(&name))?,
                None => {
                    if name != "info" || start_id != 0 {
                        self.errors += 1;
                        if self.fix {
                            self.remove_object_files(&rel_dir.join(&name));
                        }
                    }
                }
            }
        }

        for name in self.list_subdirs(&rel_dir) {
            if name.len() == 2 {
                if let Ok(n) = u8::from_str_radix(&name, 16) {
                    if (n as u32) < (1 << self.segment_bits) {
                        let child_id = start_id | ((n as u64) << (level * self.segment_bits));
                        self.scan_dir(rel_dir.join(&name), child_id, level + 1)?;
                        continue;
                    }
                }
            }
            self.errors += 1;
        }
        Ok(())
    }

    fn parse_leaf_name(&self, name: &str, start_id: u64) -> Option<u64> {
        let hex = name.strip_prefix('o')?;
        if hex.len() != 2 {
            return None;
        }
        let n = u8::from_str_radix(hex, 16).ok()?;
        if (n as u32) >= (1 << self.segment_bits) {
            return None;
        }
        Some(start_id | n as u64)
    }

    fn list_subdirs(&self, rel_dir: &Path) -> Vec<String> {
        let mut names = std::collections::BTreeSet::new();
        for disc in &self.disc_set.discs {
            let full = disc.join(rel_dir);
            if let Ok(entries) = std::fs::read_dir(&full) {
                for entry in entries.flatten() {
                    if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                        if let Some(name) = entry.file_name().to_str() {
                            names.insert(name.to_string());
                        }
                    }
                }
            }
        }
        names.into_iter().collect()
    }

    fn check_and_add_object(&mut self, object_id: u64, rel_path: &Path) -> Result<(), ScError> {
        let reader = match sos::open_read(&self.disc_set, rel_path, self.block_size) {
            Ok(r) => r,
            Err(_) => {
                // Already quarantined by the read path if a stripe was
                // corrupt; nothing more for us to clean up here.
                self.errors += 1;
                return Ok(());
            }
        };
        let bytes = reader.into_bytes();
        if bytes.len() < 4 {
            self.errors += 1;
            if self.fix {
                self.remove_object_files(rel_path);
            }
            return Ok(());
        }
        let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        match efc::classify_magic(magic) {
            ObjectKind::FileV1 | ObjectKind::FileV0 => {
                match efc::read_stream(&mut Cursor::new(&bytes[..])) {
                    Ok(file) => {
                        let size = sos::block_count_of(&self.disc_set, rel_path, self.block_size)?;
                        self.table.insert(object_id, ScratchKind::File, file.container_id, size);
                    }
                    Err(_) => {
                        self.errors += 1;
                        if self.fix {
                            self.remove_object_files(rel_path);
                        }
                    }
                }
            }
            ObjectKind::Directory => {
                let mut cursor = &bytes[..];
                match DirectoryRecord::read_from(&mut cursor) {
                    Ok(dir) => {
                        let size = sos::block_count_of(&self.disc_set, rel_path, self.block_size)?;
                        self.table.insert(object_id, ScratchKind::Directory, dir.container_id, size);
                        self.dirs.insert(object_id, dir);
                    }
                    Err(_) => {
                        self.errors += 1;
                        if self.fix {
                            self.remove_object_files(rel_path);
                        }
                    }
                }
            }
            ObjectKind::Unknown => {
                self.errors += 1;
                if self.fix {
                    self.remove_object_files(rel_path);
                }
            }
        }
        Ok(())
    }

    fn remove_object_files(&self, rel_path: &Path) {
        let _ = std::fs::remove_file(sos::write_path(self.disc_set.disc(0), rel_path));
        let roles = sos::roles_for(rel_path);
        for disc_idx in [roles.stripe1_disc, roles.stripe2_disc, roles.parity_disc] {
            let _ = std::fs::remove_file(sos::stripe_path(self.disc_set.disc(disc_idx), rel_path));
        }
    }

    // --- phase 2: walk directories ----------------------------------------

    /// For every directory found in phase 1: idempotent structural fixup,
    /// then reconcile its entries against the scan table. A missing child
    /// (neither a file nor a directory exists for that id) is dropped from
    /// its parent and counted as an error in both cases — see DESIGN.md for
    /// why a missing directory reference isn't fabricated as a placeholder.
    fn phase2_walk_directories(&mut self) {
        let dir_ids: Vec<u64> = self.dirs.keys().copied().collect();
        for dir_id in dir_ids {
            let mut dir = self.dirs.remove(&dir_id).unwrap();
            if dir.check_and_fix() {
                self.errors += 1;
            }

            let mut bad_ids = std::collections::HashSet::new();
            let mut to_mark_contained = Vec::new();
            let mut size_fixes = Vec::new();

            for (idx, e) in dir.entries.iter().enumerate() {
                match self.table.entries.get(&e.object_id) {
                    None => {
                        bad_ids.insert(e.object_id);
                        self.errors += 1;
                    }
                    Some(child) => {
                        let kind_matches = match child.kind {
                            ScratchKind::File => e.is_file(),
                            ScratchKind::Directory => e.is_dir(),
                        };
                        if !kind_matches || child.contained {
                            bad_ids.insert(e.object_id);
                            self.errors += 1;
                        } else {
                            to_mark_contained.push(e.object_id);
                            if child.container_id != dir_id {
                                self.table.record_container_mismatch(e.object_id, dir_id);
                            }
                            if e.is_file() && e.size_blocks != child.size_blocks {
                                size_fixes.push((idx, child.size_blocks));
                            }
                        }
                    }
                }
            }

            for id in to_mark_contained {
                self.table.mark_contained(id);
            }
            for (idx, size) in size_fixes {
                dir.entries[idx].size_blocks = size;
            }
            if !bad_ids.is_empty() {
                dir.entries.retain(|e| !bad_ids.contains(&e.object_id));
                dir.check_and_fix();
            }

            self.dirs.insert(dir_id, dir);
        }
    }

    // --- phase 3: root ------------------------------------------------------

    fn phase3_ensure_root(&mut self) -> Result<(), ScError> {
        if self.dirs.contains_key(&ROOT_OBJECT_ID) {
            self.table.mark_contained(ROOT_OBJECT_ID);
            return Ok(());
        }
        self.errors += 1;
        let root = DirectoryRecord::new(ROOT_OBJECT_ID, ROOT_OBJECT_ID, Vec::new(), 0);
        let size = if self.fix { self.write_directory(&root)? } else { 0 };
        self.table.insert(ROOT_OBJECT_ID, ScratchKind::Directory, ROOT_OBJECT_ID, size);
        self.table.mark_contained(ROOT_OBJECT_ID);
        self.dirs.insert(ROOT_OBJECT_ID, root);
        Ok(())
    }

    fn write_directory(&self, dir: &DirectoryRecord) -> Result<u64, ScError> {
        let rel = self.ns.object_path(dir.object_id, &self.account_root)?;
        let mut bytes = Vec::new();
        dir.write_to(&mut bytes)
            .map_err(|e| ScError::Sos(SosError::Io(e.to_string())))?;
        let mut w = sos::open_write(&self.disc_set, &rel, self.block_size)?;
        w.write_all(&bytes)?;
        w.commit(true)?;
        Ok(sos::block_count_of(&self.disc_set, &rel, self.block_size)?)
    }

    // --- phase 4: reattach orphans -------------------------------------------

    fn phase4_reattach_orphans(&mut self) -> Result<(), ScError> {
        let orphans: Vec<u64> = self
            .table
            .orphans()
            .into_iter()
            .filter(|&id| id != ROOT_OBJECT_ID)
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }
        self.orphans_reattached = orphans.len() as u64;
        self.errors += orphans.len() as u64;

        let lost_and_found_id = self.ensure_lost_and_found();
        let mut lost_and_found = self.dirs.remove(&lost_and_found_id).unwrap();

        for orphan_id in orphans {
            let kind = self.table.entries.get(&orphan_id).map(|e| e.kind);
            let size = self.table.entries.get(&orphan_id).map(|e| e.size_blocks).unwrap_or(0);
            let (name, flags) = match kind {
                Some(ScratchKind::File) => (format!("file{orphan_id:06}"), entry_flags::FILE),
                Some(ScratchKind::Directory) => (format!("dir{orphan_id:06}"), entry_flags::DIR),
                None => continue,
            };
            lost_and_found.entries.push(Entry {
                name: name.into_bytes(),
                object_id: orphan_id,
                mtime: 0,
                size_blocks: size,
                flags,
                attr_hash: 0,
                depends_newer: 0,
                depends_older: 0,
                attrs_blob: Vec::new(),
            });
            self.table.mark_contained(orphan_id);

            if kind == Some(ScratchKind::Directory) {
                if let Some(mut child_dir) = self.dirs.remove(&orphan_id) {
                    child_dir.container_id = lost_and_found_id;
                    self.dirs.insert(orphan_id, child_dir);
                }
                self.table.record_container_mismatch(orphan_id, lost_and_found_id);
            }
        }

        self.dirs.insert(lost_and_found_id, lost_and_found);
        Ok(())
    }

    /// Finds the root's existing `lost+found` entry, or allocates a fresh
    /// directory for it. The new id comes from the account's own allocator
    /// so it can never collide with an id already in the tree.
    fn ensure_lost_and_found(&mut self) -> u64 {
        if let Some(root) = self.dirs.get(&ROOT_OBJECT_ID) {
            if let Some(existing) = root.entries.iter().find(|e| e.name == b"lost+found" && e.is_dir()) {
                return existing.object_id;
            }
        }

        let new_id = self.account.allocate_object_id();
        let new_dir = DirectoryRecord::new(new_id, ROOT_OBJECT_ID, Vec::new(), 0);
        self.dirs.insert(new_id, new_dir);
        self.table.insert(new_id, ScratchKind::Directory, ROOT_OBJECT_ID, 0);
        self.table.mark_contained(new_id);
        self.lost_and_found_created = true;

        let mut root = self.dirs.remove(&ROOT_OBJECT_ID).expect("phase 3 guarantees root exists");
        root.entries.push(Entry {
            name: b"lost+found".to_vec(),
            object_id: new_id,
            mtime: 0,
            size_blocks: 0,
            flags: entry_flags::DIR,
            attr_hash: 0,
            depends_newer: 0,
            depends_older: 0,
            attrs_blob: Vec::new(),
        });
        self.dirs.insert(ROOT_OBJECT_ID, root);
        new_id
    }

    // --- phase 5: secondary fixups --------------------------------------------

    /// Rewrites a directory object's own stored `container_id` where phase 2
    /// found it disagreeing with the directory that actually references it.
    /// Files are left alone here — a file's own container id is informational
    /// and expected to lag behind a move (see spec.md §4.7).
    fn phase5_secondary_fixups(&mut self) {
        let mismatches = std::mem::take(&mut self.table.container_mismatches);
        for (object_id, correct_container) in mismatches {
            if let Some(dir) = self.dirs.get_mut(&object_id) {
                dir.container_id = correct_container;
            }
            if let Some(entry) = self.table.entries.get_mut(&object_id) {
                entry.container_id = correct_container;
            }
        }
    }

    fn persist_directories(&mut self) -> Result<(), ScError> {
        let ids: Vec<u64> = self.dirs.keys().copied().collect();
        for id in ids {
            let dir = self.dirs.get(&id).expect("id came from self.dirs.keys()").clone();
            let size = self.write_directory(&dir)?;
            if let Some(entry) = self.table.entries.get_mut(&id) {
                entry.size_blocks = size;
            }
        }
        Ok(())
    }

    // --- phase 6: rewrite account state ----------------------------------------

    fn phase6_rewrite_account_state(&mut self) {
        let mut blocks_used = 0u64;
        let mut blocks_in_old_files = 0u64;
        let mut blocks_in_deleted_files = 0u64;
        let mut blocks_in_directories = 0u64;
        let mut max_object_id = 0u64;

        for (&object_id, entry) in &self.table.entries {
            max_object_id = max_object_id.max(object_id);
            if let ScratchKind::Directory = entry.kind {
                blocks_in_directories += entry.size_blocks;
            }
        }
        for dir in self.dirs.values() {
            for e in &dir.entries {
                if !e.is_file() {
                    continue;
                }
                if e.is_deleted() {
                    blocks_in_deleted_files += e.size_blocks;
                } else if e.is_old_version() {
                    blocks_in_old_files += e.size_blocks;
                } else {
                    blocks_used += e.size_blocks;
                }
            }
        }

        self.account
            .set_counters(blocks_used, blocks_in_old_files, blocks_in_deleted_files, blocks_in_directories);
        if max_object_id > self.account.last_object_id_used() {
            self.account.reset_last_object_id_used(max_object_id);
        }
    }

    fn persist_account_state(&self) -> Result<(), ScError> {
        let mut bytes = Vec::new();
        self.account
            .write_to(&mut bytes)
            .map_err(|e| ScError::Sos(SosError::Io(e.to_string())))?;
        let info_path = self.disc_set.disc(0).join(format!("{}info", self.account_root));
        std::fs::write(&info_path, &bytes).map_err(|e| ScError::Sos(SosError::Io(e.to_string())))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::efc::{self as efc_mod, FileAttributes};
    use crate::crypto::AccountKeys;
    use tempfile::tempdir;

    fn test_config() -> Config {
        Config {
            disc_sets: Vec::new(),
            block_size: 1024,
            segment_length_bits: 8,
            max_cache_size: 32,
            max_wait_for_housekeeping_release_secs: 4,
            store_info_save_delay: 96,
            default_soft_quota: 1_000_000,
            default_hard_quota: 2_000_000,
            accounts: Vec::new(),
            housekeeping_interval_secs: 300,
            retention_secs: 7 * 24 * 3600,
        }
    }

    fn disc_set(dir: &tempfile::TempDir) -> DiscSet {
        DiscSet {
            discs: [dir.path().join("d0"), dir.path().join("d1"), dir.path().join("d2")],
        }
    }

    fn write_root(disc_set: &DiscSet, account_root: &str, block_size: usize) {
        let ns = ObjectNamespace::new(8).unwrap();
        let root = DirectoryRecord::new(ROOT_OBJECT_ID, ROOT_OBJECT_ID, Vec::new(), 0);
        let rel = ns.object_path(ROOT_OBJECT_ID, account_root).unwrap();
        let mut bytes = Vec::new();
        root.write_to(&mut bytes).unwrap();
        let mut w = sos::open_write(disc_set, &rel, block_size).unwrap();
        w.write_all(&bytes).unwrap();
        w.commit(true).unwrap();
    }

    fn write_orphan_file(disc_set: &DiscSet, account_root: &str, object_id: u64, block_size: usize) {
        let ns = ObjectNamespace::new(8).unwrap();
        let keys = AccountKeys::new([1u8; 32], [2u8; 32]);
        let attrs = FileAttributes {
            uid: 0,
            gid: 0,
            mode: 0o644,
            mtime: 0,
            attr_mtime: 0,
            symlink_target: None,
            xattrs: Vec::new(),
        };
        let encoded = efc_mod::encode_full(b"orphaned content", &attrs, &keys, ROOT_OBJECT_ID).unwrap();
        let mut bytes = Vec::new();
        efc_mod::write_stream(&encoded, &mut bytes).unwrap();
        let rel = ns.object_path(object_id, account_root).unwrap();
        let mut w = sos::open_write(disc_set, &rel, block_size).unwrap();
        w.write_all(&bytes).unwrap();
        w.commit(true).unwrap();
    }

    #[test]
    fn missing_root_is_recreated_when_fixing() {
        let dir = tempdir().unwrap();
        let ds = disc_set(&dir);
        let config = test_config();
        let account = AccountState::new(1, config.default_soft_quota, config.default_hard_quota);

        let (report, _account) = Checker::run(
            &config,
            ds,
            "acct1/".to_string(),
            account,
            CheckOptions { fix: true },
        )
        .unwrap();

        assert!(report.errors_found >= 1);
    }

    #[test]
    fn orphan_file_is_reattached_into_lost_and_found() {
        let dir = tempdir().unwrap();
        let ds = disc_set(&dir);
        let config = test_config();
        write_root(&ds, "acct1/", config.block_size as usize);
        write_orphan_file(&ds, "acct1/", 5, config.block_size as usize);
        let account = AccountState::new(1, config.default_soft_quota, config.default_hard_quota);

        let (report, account) = Checker::run(
            &config,
            ds.clone(),
            "acct1/".to_string(),
            account,
            CheckOptions { fix: true },
        )
        .unwrap();

        assert_eq!(report.orphans_reattached, 1);
        assert!(report.lost_and_found_created);

        let ns = ObjectNamespace::new(8).unwrap();
        let root_rel = ns.object_path(ROOT_OBJECT_ID, "acct1/").unwrap();
        let reader = sos::open_read(&ds, &root_rel, config.block_size as usize).unwrap();
        let bytes = reader.into_bytes();
        let mut cursor = &bytes[..];
        let root = DirectoryRecord::read_from(&mut cursor).unwrap();
        let lost_and_found = root.find_current(b"lost+found").expect("lost+found entry");
        assert!(lost_and_found.is_dir());

        assert!(account.blocks_used > 0);
    }

    #[test]
    fn second_run_after_fix_finds_nothing_left_to_fix() {
        let dir = tempdir().unwrap();
        let ds = disc_set(&dir);
        let config = test_config();
        write_root(&ds, "acct1/", config.block_size as usize);
        write_orphan_file(&ds, "acct1/", 5, config.block_size as usize);
        let account = AccountState::new(1, config.default_soft_quota, config.default_hard_quota);

        let (_, account) = Checker::run(
            &config,
            ds.clone(),
            "acct1/".to_string(),
            account,
            CheckOptions { fix: true },
        )
        .unwrap();

        let (report, _) = Checker::run(&config, ds, "acct1/".to_string(), account, CheckOptions { fix: true })
            .unwrap();

        assert_eq!(report.orphans_reattached, 0);
        assert!(!report.lost_and_found_created);
        assert_eq!(report.errors_found, 0);
    }
}
