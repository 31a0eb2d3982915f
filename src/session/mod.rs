//! Session context (SC): per-connection server state — lock acquisition,
//! the directory cache, object allocation, and the add/delete/move/
//! undelete operations spec.md §4.6 names.

pub mod cache;
pub mod lock;

use crate::account::AccountState;
use crate::config::{Config, DiscSet};
use crate::crypto::AccountKeys;
use crate::dr::{entry_flags, DirectoryRecord, Entry};
use crate::efc::{self, patch, EncodedFile};
use crate::error::{AsError, ScError, SosError};
use crate::ons::ObjectNamespace;
use crate::sos;
use cache::DirectoryCache;
use std::path::PathBuf;
use std::sync::Arc;

pub const ROOT_OBJECT_ID: u64 = 1;

/// Per-connection state on the server. Not `Send`-shared: each connection
/// owns one of these privately, matching spec.md §5's "private to the
/// session's child process".
pub struct SessionContext {
    config: Config,
    disc_set: DiscSet,
    ns: ObjectNamespace,
    keys: AccountKeys,
    account_root: String,
    account: AccountState,
    cache: DirectoryCache,
    lock: Option<lock::AccountLock>,
    read_only: bool,
    save_delay_counter: u32,
}

impl SessionContext {
    /// Creates a session for an already-existing account, acquiring the
    /// write lock unless `read_only`.
    pub fn login(
        config: Config,
        disc_set: DiscSet,
        keys: AccountKeys,
        account: AccountState,
        account_root: String,
        read_only: bool,
        request_release: impl FnMut(),
    ) -> Result<Self, ScError> {
        let ns = ObjectNamespace::new(config.segment_length_bits)?;
        let lock = if read_only {
            None
        } else {
            let lock_path = ns.write_lock_path(disc_set.disc(0), &account_root);
            Some(lock::AccountLock::acquire(&lock_path, &config, request_release)?)
        };
        let max_cache = config.max_cache_size;
        let save_delay_counter = config.store_info_save_delay;
        Ok(SessionContext {
            config,
            disc_set,
            ns,
            keys,
            account_root,
            account,
            cache: DirectoryCache::new(max_cache),
            lock,
            read_only,
            save_delay_counter,
        })
    }

    pub fn account(&self) -> &AccountState {
        &self.account
    }

    /// Raw bytes of the directory object itself, for `GetDirectory`.
    pub fn get_directory_stream(&self, id: u64) -> Result<Vec<u8>, ScError> {
        let dir = self.load_directory(id)?;
        let mut bytes = Vec::new();
        dir.write_to(&mut bytes)
            .map_err(|e| ScError::Sos(SosError::Io(e.to_string())))?;
        Ok(bytes)
    }

    /// Entries of directory `id` whose flags intersect `flags_filter`
    /// (`ListDirectory`). A filter of `0` matches every entry, following
    /// the convention that an empty mask means "no restriction".
    pub fn list_directory(&self, id: u64, flags_filter: u16) -> Result<Vec<Entry>, ScError> {
        let dir = self.load_directory(id)?;
        Ok(dir
            .entries
            .iter()
            .filter(|e| flags_filter == 0 || e.flags & flags_filter != 0)
            .cloned()
            .collect())
    }

    /// Snapshot of usage counters and quotas for `GetAccountUsage`.
    pub fn account_usage(&self) -> (u64, u64, u64, u64, u64, u64) {
        let a = &self.account;
        (
            a.blocks_used,
            a.blocks_in_old_files,
            a.blocks_in_deleted_files,
            a.blocks_in_directories,
            a.soft_limit,
            a.hard_limit,
        )
    }

    /// Raw bytes of the encoded-file stream for `file_id`, verified as a
    /// well-formed member of `in_dir` before being handed back (spec.md
    /// §4.8's `GetFile`).
    pub fn get_file(&self, in_dir: u64, file_id: u64) -> Result<Vec<u8>, ScError> {
        let dir = self.load_directory(in_dir)?;
        dir.find_by_id(file_id)
            .filter(|e| e.is_file())
            .ok_or(ScError::ObjectDoesNotExist)?;
        self.read_file_object(file_id)
    }

    /// The block index of a stored file, fetched by the file's own object
    /// id (`GetBlockIndexByID`) — used by a client diffing a new upload
    /// against a version it already knows the id of.
    pub fn get_block_index_by_id(&self, file_id: u64) -> Result<Vec<efc::BlockIndexEntry>, ScError> {
        let bytes = self.read_file_object(file_id)?;
        let file = efc::read_stream(&mut std::io::Cursor::new(&bytes[..])).map_err(ScError::Efc)?;
        Ok(file.block_index)
    }

    /// The block index of the current entry named `name` in `in_dir`
    /// (`GetBlockIndexByName`) — lets a client diff against "whatever the
    /// server currently has at this path" without already knowing its id.
    pub fn get_block_index_by_name(
        &self,
        in_dir: u64,
        name: &[u8],
    ) -> Result<(u64, Vec<efc::BlockIndexEntry>), ScError> {
        let dir = self.load_directory(in_dir)?;
        let entry = dir
            .find_current(name)
            .filter(|e| e.is_file())
            .ok_or(ScError::ObjectDoesNotExist)?;
        let file_id = entry.object_id;
        Ok((file_id, self.get_block_index_by_id(file_id)?))
    }

    /// Replaces the attributes of directory `id` in place, bumping its
    /// attribute-mtime (`ChangeDirAttributes`).
    pub fn change_dir_attributes(
        &mut self,
        id: u64,
        attrs_blob: Vec<u8>,
        attr_mtime: u64,
    ) -> Result<(), ScError> {
        self.require_writable()?;
        let mut dir = (*self.load_directory(id)?).clone();
        dir.attrs_blob = attrs_blob;
        dir.attr_mtime = attr_mtime;
        self.save_directory(&dir)
    }

    pub fn set_client_store_marker(&mut self, marker: u64) -> Result<(), ScError> {
        self.require_writable()?;
        self.account.set_client_store_marker(marker);
        self.save_store_info(true)
    }

    /// `Finished`: force an immediate (non-deferred) AS flush. The account
    /// lock itself is released by dropping the `SessionContext`.
    pub fn finish(&mut self) -> Result<(), ScError> {
        self.save_store_info(false)
    }

    fn require_writable(&self) -> Result<(), ScError> {
        if self.read_only {
            Err(ScError::ReadOnlySession)
        } else {
            Ok(())
        }
    }

    fn object_rel_path(&self, id: u64) -> Result<PathBuf, ScError> {
        Ok(self.ns.object_path(id, &self.account_root)?)
    }

    fn info_path(&self) -> PathBuf {
        self.disc_set.disc(0).join(format!("{}info", self.account_root))
    }

    // --- directory loading/saving ---------------------------------------

    pub fn load_directory(&self, id: u64) -> Result<Arc<DirectoryRecord>, ScError> {
        let rel = self.object_rel_path(id)?;
        if let Some(cached) = self.cache.get_if_fresh(id, &self.disc_set, &rel) {
            return Ok(cached);
        }
        let reader = sos::open_read(&self.disc_set, &rel, self.config.block_size as usize)?;
        let bytes = reader.into_bytes();
        let dir = DirectoryRecord::read_from(&mut &bytes[..])?;
        let record = Arc::new(dir);
        if let Some((_, revision)) = sos::exists_with_revision(&self.disc_set, &rel) {
            self.cache.insert(id, record.clone(), revision);
        }
        Ok(record)
    }

    /// Writes `dir` via SOS; if its block size changed, propagates the new
    /// size into the entry for `dir` inside its own container (spec.md
    /// §4.6 "save_directory").
    pub fn save_directory(&mut self, dir: &DirectoryRecord) -> Result<(), ScError> {
        let new_size = self.write_directory_raw(dir)?;
        if dir.object_id != ROOT_OBJECT_ID {
            self.propagate_size_to_container(dir.object_id, dir.container_id, new_size)?;
        }
        Ok(())
    }

    fn propagate_size_to_container(
        &mut self,
        child_id: u64,
        container_id: u64,
        new_size: u64,
    ) -> Result<(), ScError> {
        let mut container = (*self.load_directory(container_id)?).clone();
        let needs_write = match container.find_by_id_mut(child_id) {
            Some(entry) if entry.size_blocks != new_size => {
                entry.size_blocks = new_size;
                true
            }
            _ => false,
        };
        if needs_write {
            self.write_directory_raw(&container)?;
        }
        Ok(())
    }

    /// Writes a directory and returns its new block size. `save_directory`
    /// is the public entry point; this is the shared primitive so
    /// propagation only ever climbs one hop rather than cascading.
    fn write_directory_raw(&mut self, dir: &DirectoryRecord) -> Result<u64, ScError> {
        let rel = self.object_rel_path(dir.object_id)?;
        let mut bytes = Vec::new();
        dir.write_to(&mut bytes)
            .map_err(|e| ScError::Sos(SosError::Io(e.to_string())))?;
        let mut w = sos::open_write(&self.disc_set, &rel, self.config.block_size as usize)?;
        w.write_all(&bytes)?;
        w.commit(true)?;

        let new_size = sos::block_count_of(&self.disc_set, &rel, self.config.block_size as usize)?;
        if let Some((_, revision)) = sos::exists_with_revision(&self.disc_set, &rel) {
            self.cache.insert(dir.object_id, Arc::new(dir.clone()), revision);
        } else {
            self.cache.invalidate(dir.object_id);
        }
        Ok(new_size)
    }

    fn write_file_object(&self, id: u64, bytes: &[u8]) -> Result<u64, ScError> {
        let rel = self.object_rel_path(id)?;
        let mut w = sos::open_write(&self.disc_set, &rel, self.config.block_size as usize)?;
        w.write_all(bytes)?;
        w.commit(true)?;
        Ok(sos::block_count_of(&self.disc_set, &rel, self.config.block_size as usize)?)
    }

    fn read_file_object(&self, id: u64) -> Result<Vec<u8>, ScError> {
        let rel = self.object_rel_path(id)?;
        let reader = sos::open_read(&self.disc_set, &rel, self.config.block_size as usize)?;
        Ok(reader.into_bytes())
    }

    fn remove_file_object(&self, id: u64) {
        if let Ok(rel) = self.object_rel_path(id) {
            let _ = std::fs::remove_file(sos::write_path(self.disc_set.disc(0), &rel));
        }
    }

    // --- account-state save cadence --------------------------------------

    /// Mirrors `BackupStoreContext::SaveStoreInfo`: a dirty account state is
    /// flushed immediately when `allow_delay` is false (critical
    /// operations) or the deferral budget is exhausted; otherwise a bounded
    /// number of deferred mutations (`STORE_INFO_SAVE_DELAY`) are allowed to
    /// accumulate before a forced flush.
    pub fn save_store_info(&mut self, allow_delay: bool) -> Result<(), ScError> {
        if !self.account.is_dirty() {
            return Ok(());
        }
        if !allow_delay || self.save_delay_counter == 0 {
            self.flush_store_info()?;
            self.save_delay_counter = self.config.store_info_save_delay;
        } else {
            self.save_delay_counter -= 1;
        }
        Ok(())
    }

    fn flush_store_info(&mut self) -> Result<(), ScError> {
        let mut bytes = Vec::new();
        self.account
            .write_to(&mut bytes)
            .map_err(|e| ScError::Sos(SosError::Io(e.to_string())))?;
        std::fs::write(self.info_path(), &bytes).map_err(|e| ScError::Sos(SosError::Io(e.to_string())))?;
        self.account.mark_clean();
        Ok(())
    }

    // --- file operations --------------------------------------------------

    /// Uploads a new file into `in_dir`. `diff_from_id`, if non-zero, names
    /// an existing current file entry this upload is a patch against; the
    /// server combines it into a standalone object, reverse-encodes the old
    /// version as a patch over the new one, and relinks the directory
    /// entries accordingly (spec.md §4.6).
    pub fn add_file(
        &mut self,
        in_dir: u64,
        mtime: u64,
        attr_hash: u64,
        diff_from_id: u64,
        name: Vec<u8>,
        mark_older: bool,
        encoded_stream: &[u8],
    ) -> Result<u64, ScError> {
        self.require_writable()?;
        efc::verify(encoded_stream).map_err(ScError::Efc)?;
        let incoming = efc::read_stream(&mut std::io::Cursor::new(encoded_stream)).map_err(ScError::Efc)?;

        let new_id = self.account.allocate_object_id();

        let (new_bytes, reverse_patch) = if diff_from_id != 0 {
            let previous_bytes = self.read_file_object(diff_from_id)?;
            let previous =
                efc::read_stream(&mut std::io::Cursor::new(&previous_bytes[..])).map_err(ScError::Efc)?;
            if previous.is_patch() {
                // The server always keeps the newest version of a chain as
                // a full file, so a diff target must itself be full.
                return Err(ScError::Efc(crate::error::EfcError::NoPreviousVersionForPatch));
            }
            let previous_chunks = patch::decode_literal_chunks(&previous, &self.keys).map_err(ScError::Efc)?;
            let combined_plaintext =
                patch::combine_plaintext(&incoming, &previous_chunks, &self.keys).map_err(ScError::Efc)?;
            let decrypted_attrs =
                efc::FileAttributes::decrypt(&incoming.attrs_blob, &self.keys).map_err(ScError::Efc)?;
            let full_encoded =
                efc::encode_full(&combined_plaintext, &decrypted_attrs, &self.keys, in_dir).map_err(ScError::Efc)?;

            let mut new_bytes = Vec::new();
            efc::write_stream(&full_encoded, &mut new_bytes)
                .map_err(|e| ScError::Sos(SosError::Io(e.to_string())))?;

            let previous_plaintext: Vec<u8> = previous_chunks.concat();
            let reverse = patch::reverse_diff(
                &previous_plaintext,
                previous.attrs_blob.clone(),
                &full_encoded.block_index,
                previous.container_id,
                new_id,
                &self.keys,
            )
            .map_err(ScError::Efc)?;
            (new_bytes, Some((diff_from_id, reverse)))
        } else {
            (encoded_stream.to_vec(), None)
        };

        let new_size = match self.write_file_object(new_id, &new_bytes) {
            Ok(size) => size,
            Err(e) => {
                self.remove_file_object(new_id);
                return Err(e);
            }
        };

        if self.account.would_exceed_hard_limit(new_size) {
            self.remove_file_object(new_id);
            return Err(ScError::As(AsError::AddedFileExceedsStorageLimit));
        }

        if let Err(e) =
            self.link_new_file_entry(in_dir, new_id, name, mtime, attr_hash, new_size, mark_older, reverse_patch)
        {
            self.remove_file_object(new_id);
            return Err(e);
        }

        self.account.change_blocks_used(new_size as i64)?;
        self.save_store_info(true)?;
        Ok(new_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn link_new_file_entry(
        &mut self,
        in_dir: u64,
        new_id: u64,
        name: Vec<u8>,
        mtime: u64,
        attr_hash: u64,
        new_size: u64,
        mark_older: bool,
        reverse_patch: Option<(u64, Option<EncodedFile>)>,
    ) -> Result<(), ScError> {
        let mut dir = (*self.load_directory(in_dir)?).clone();

        if mark_older {
            for e in dir.entries.iter_mut() {
                if e.name == name && e.is_current() {
                    e.flags |= entry_flags::OLD_VERSION;
                }
            }
        }

        // Only a genuine back-reference patch links the new entry to the
        // old one; a "completely different" reverse diff (old stored as a
        // second full file) carries no dependency link (spec.md §4.3).
        let depends_older = match &reverse_patch {
            Some((old_id, Some(_))) => *old_id,
            _ => 0,
        };

        dir.entries.push(Entry {
            name,
            object_id: new_id,
            mtime,
            size_blocks: new_size,
            flags: entry_flags::FILE,
            attr_hash,
            depends_newer: 0,
            depends_older,
            attrs_blob: Vec::new(),
        });

        if let Some((old_id, reverse)) = reverse_patch {
            match reverse {
                Some(reverse_file) => {
                    let mut bytes = Vec::new();
                    efc::write_stream(&reverse_file, &mut bytes)
                        .map_err(|e| ScError::Sos(SosError::Io(e.to_string())))?;
                    let old_size = self.write_file_object(old_id, &bytes)?;
                    if let Some(old_entry) = dir.find_by_id_mut(old_id) {
                        old_entry.flags |= entry_flags::OLD_VERSION;
                        old_entry.depends_newer = new_id;
                        old_entry.size_blocks = old_size;
                    }
                    self.account.change_blocks_used(-(old_size as i64))?;
                    self.account.change_blocks_in_old_files(old_size as i64)?;
                }
                None => {
                    if let Some(old_entry) = dir.find_by_id_mut(old_id) {
                        old_entry.flags |=
                            entry_flags::OLD_VERSION | entry_flags::REVERSED_DIFF_COMPLETELY_DIFFERENT;
                        let old_size = old_entry.size_blocks;
                        self.account.change_blocks_used(-(old_size as i64))?;
                        self.account.change_blocks_in_old_files(old_size as i64)?;
                    }
                }
            }
        }

        dir.check_and_fix();
        self.save_directory(&dir)
    }

    pub fn delete_file(&mut self, name: &[u8], in_dir: u64) -> Result<(bool, u64), ScError> {
        self.require_writable()?;
        let mut dir = (*self.load_directory(in_dir)?).clone();
        let mut existed = false;
        let mut representative = 0u64;
        let mut deleted_blocks = 0i64;
        for e in dir.entries.iter_mut() {
            if e.name == name && !e.is_deleted() {
                existed = true;
                if e.is_current() {
                    representative = e.object_id;
                }
                e.flags |= entry_flags::DELETED;
                deleted_blocks += e.size_blocks as i64;
            }
        }
        if existed {
            self.account.change_blocks_used(-deleted_blocks)?;
            self.account.change_blocks_in_deleted_files(deleted_blocks)?;
            self.save_directory(&dir)?;
            self.save_store_info(true)?;
        }
        Ok((existed, representative))
    }

    pub fn undelete_file(&mut self, id: u64, in_dir: u64) -> Result<(), ScError> {
        self.require_writable()?;
        let mut dir = (*self.load_directory(in_dir)?).clone();
        let mut restored_blocks = 0i64;
        for e in dir.entries.iter_mut() {
            if e.object_id == id && e.is_deleted() {
                e.flags &= !entry_flags::DELETED;
                restored_blocks += e.size_blocks as i64;
            }
        }
        if restored_blocks != 0 {
            self.account.change_blocks_in_deleted_files(-restored_blocks)?;
            self.account.change_blocks_used(restored_blocks)?;
            self.save_directory(&dir)?;
            self.save_store_info(true)?;
        }
        Ok(())
    }

    // --- directory operations ---------------------------------------------

    pub fn add_directory(
        &mut self,
        in_dir: u64,
        name: Vec<u8>,
        attrs_blob: Vec<u8>,
        attr_mtime: u64,
        mtime: u64,
    ) -> Result<(u64, bool), ScError> {
        self.require_writable()?;
        let parent = self.load_directory(in_dir)?;
        if let Some(existing) = parent.find_current(&name) {
            if existing.is_dir() {
                return Ok((existing.object_id, true));
            }
        }

        let new_id = self.account.allocate_object_id();
        let new_dir = DirectoryRecord::new(new_id, in_dir, attrs_blob.clone(), attr_mtime);
        let new_size = self.write_directory_raw(&new_dir)?;

        let mut parent = (*parent).clone();
        parent.entries.push(Entry {
            name,
            object_id: new_id,
            mtime,
            size_blocks: new_size,
            flags: entry_flags::DIR,
            attr_hash: 0,
            depends_newer: 0,
            depends_older: 0,
            attrs_blob,
        });
        self.save_directory(&parent)?;
        self.account.change_blocks_in_directories(new_size as i64)?;
        self.save_store_info(true)?;
        Ok((new_id, false))
    }

    /// Depth-first delete (or undelete) of a directory: recurse into
    /// subdirectories first, then flip flags on this directory's own file
    /// entries and finally on its entry in the parent.
    pub fn delete_directory(&mut self, id: u64, undelete: bool) -> Result<(), ScError> {
        self.require_writable()?;
        let dir = self.load_directory(id)?;
        let child_dir_ids: Vec<u64> = dir
            .entries
            .iter()
            .filter(|e| e.is_dir())
            .map(|e| e.object_id)
            .collect();
        for child in child_dir_ids {
            self.delete_directory(child, undelete)?;
        }

        let mut dir = (*self.load_directory(id)?).clone();
        let mut delta = 0i64;
        for e in dir.entries.iter_mut().filter(|e| e.is_file()) {
            if undelete {
                if e.is_deleted() {
                    e.flags &= !entry_flags::DELETED;
                    delta += e.size_blocks as i64;
                }
            } else if !e.is_deleted() {
                e.flags |= entry_flags::DELETED;
                delta += e.size_blocks as i64;
            }
        }
        if delta != 0 {
            if undelete {
                self.account.change_blocks_in_deleted_files(-delta)?;
                self.account.change_blocks_used(delta)?;
            } else {
                self.account.change_blocks_used(-delta)?;
                self.account.change_blocks_in_deleted_files(delta)?;
            }
        }
        self.save_directory(&dir)?;

        if dir.container_id != dir.object_id {
            let mut parent = (*self.load_directory(dir.container_id)?).clone();
            if let Some(entry) = parent.find_by_id_mut(id) {
                if undelete {
                    entry.flags &= !entry_flags::DELETED;
                    self.account.remove_deleted_directory(id);
                } else {
                    entry.flags |= entry_flags::DELETED;
                    self.account.add_deleted_directory(id);
                }
            }
            self.save_directory(&parent)?;
        }
        self.save_store_info(true)?;
        Ok(())
    }

    /// Moves `obj_id` from `from_dir` to `to_dir`, possibly under
    /// `new_name`. Fails if the target name is already occupied in
    /// `to_dir` (excluding deleted entries when `allow_over_deleted`).
    pub fn move_object(
        &mut self,
        obj_id: u64,
        from_dir: u64,
        to_dir: u64,
        new_name: Vec<u8>,
        move_all_with_same_name: bool,
        allow_over_deleted: bool,
    ) -> Result<(), ScError> {
        self.require_writable()?;
        let source = (*self.load_directory(from_dir)?).clone();
        let mut dest = (*self.load_directory(to_dir)?).clone();

        let name_occupied = dest
            .entries
            .iter()
            .any(|e| e.name == new_name && (!allow_over_deleted || !e.is_deleted()));
        if name_occupied {
            return Err(ScError::NameAlreadyExistsInDirectory);
        }

        let moving_name = source
            .find_by_id(obj_id)
            .map(|e| e.name.clone())
            .ok_or(ScError::ObjectDoesNotExist)?;

        let object_id = source.object_id;
        let container_id = source.container_id;
        let attrs_blob = source.attrs_blob.clone();
        let attr_mtime = source.attr_mtime;
        let (moved, remaining): (Vec<Entry>, Vec<Entry>) = source
            .entries
            .into_iter()
            .partition(|e| e.object_id == obj_id || (move_all_with_same_name && e.name == moving_name));
        if moved.is_empty() {
            return Err(ScError::ObjectDoesNotExist);
        }

        for mut e in moved.clone() {
            e.name = new_name.clone();
            dest.entries.push(e);
        }
        self.save_directory(&dest)?;

        let updated_source = DirectoryRecord {
            object_id,
            container_id,
            attrs_blob,
            attr_mtime,
            entries: remaining,
        };
        if let Err(err) = self.save_directory(&updated_source) {
            let moved_ids: Vec<u64> = moved.iter().map(|e| e.object_id).collect();
            let mut dest_rollback = (*self.load_directory(to_dir)?).clone();
            dest_rollback.entries.retain(|e| !moved_ids.contains(&e.object_id));
            let _ = self.save_directory(&dest_rollback);
            return Err(err);
        }

        for moved_entry in &moved {
            if moved_entry.is_dir() {
                let mut child = (*self.load_directory(moved_entry.object_id)?).clone();
                child.container_id = to_dir;
                self.save_directory(&child)?;
            }
        }

        Ok(())
    }
}
