//! Account state (AS): the per-account header file tracking usage
//! counters, quotas, the object-id allocator, and the deleted-directory
//! list awaiting housekeeping.
//!
//! Mutations mark the in-memory state dirty rather than writing
//! immediately; [`session`](crate::session) decides when a dirty `AccountState`
//! actually gets flushed (`STORE_INFO_SAVE_DELAY`).

use crate::error::AsError;
use crate::wire::{U32Be, U64Be};
use std::io::{Read, Write};

pub const INFO_MAGIC: u32 = 0x3483_2476;

/// Persistent per-account header plus the variable-length deleted-directory
/// tail, and the in-memory dirty bit that drives deferred flushing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    pub account_id: u64,
    pub client_store_marker: u64,
    last_object_id_used: u64,
    pub blocks_used: u64,
    pub blocks_in_old_files: u64,
    pub blocks_in_deleted_files: u64,
    pub blocks_in_directories: u64,
    pub soft_limit: u64,
    pub hard_limit: u64,
    pub deleted_directories: Vec<u64>,
    dirty: bool,
}

impl AccountState {
    /// A fresh account with an empty root directory already accounted for
    /// as object id 1 (the caller still needs to actually create it).
    pub fn new(account_id: u64, soft_limit: u64, hard_limit: u64) -> Self {
        AccountState {
            account_id,
            client_store_marker: 0,
            last_object_id_used: 1,
            blocks_used: 0,
            blocks_in_old_files: 0,
            blocks_in_deleted_files: 0,
            blocks_in_directories: 0,
            soft_limit,
            hard_limit,
            deleted_directories: Vec::new(),
            dirty: true,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn last_object_id_used(&self) -> u64 {
        self.last_object_id_used
    }

    /// Allocates the next object id. The original implementation set its
    /// dirty flag after an early `return`, so the flag was never actually
    /// set on this path (spec.md §9 Open Questions); here the flag is set
    /// before the new id is handed out; the id counter itself is never
    /// reused even if this update fails to reach disk, matching spec.md
    /// §3's "IDs are never reused even if allocation failed to durably
    /// update the counter".
    pub fn allocate_object_id(&mut self) -> u64 {
        self.dirty = true;
        self.last_object_id_used += 1;
        self.last_object_id_used
    }

    /// Used only by the checker (§4.7 phase 6) to reset the counter to the
    /// true maximum object id found on disk.
    pub fn reset_last_object_id_used(&mut self, value: u64) {
        self.last_object_id_used = value;
        self.dirty = true;
    }

    pub fn change_blocks_used(&mut self, delta: i64) -> Result<(), AsError> {
        self.blocks_used = apply_delta(self.blocks_used, delta)?;
        self.dirty = true;
        Ok(())
    }

    pub fn change_blocks_in_old_files(&mut self, delta: i64) -> Result<(), AsError> {
        self.blocks_in_old_files = apply_delta(self.blocks_in_old_files, delta)?;
        self.dirty = true;
        Ok(())
    }

    pub fn change_blocks_in_deleted_files(&mut self, delta: i64) -> Result<(), AsError> {
        self.blocks_in_deleted_files = apply_delta(self.blocks_in_deleted_files, delta)?;
        self.dirty = true;
        Ok(())
    }

    pub fn change_blocks_in_directories(&mut self, delta: i64) -> Result<(), AsError> {
        self.blocks_in_directories = apply_delta(self.blocks_in_directories, delta)?;
        self.dirty = true;
        Ok(())
    }

    /// Replaces all four counters at once — used only by the consistency
    /// checker's phase 6, which recomputes them from a full object scan.
    pub fn set_counters(&mut self, used: u64, old: u64, deleted: u64, dirs: u64) {
        self.blocks_used = used;
        self.blocks_in_old_files = old;
        self.blocks_in_deleted_files = deleted;
        self.blocks_in_directories = dirs;
        self.dirty = true;
    }

    pub fn would_exceed_hard_limit(&self, additional_blocks: u64) -> bool {
        self.blocks_used.saturating_add(additional_blocks) > self.hard_limit
    }

    pub fn add_deleted_directory(&mut self, dir_id: u64) {
        self.deleted_directories.push(dir_id);
        self.dirty = true;
    }

    pub fn remove_deleted_directory(&mut self, dir_id: u64) -> bool {
        if let Some(pos) = self.deleted_directories.iter().position(|&d| d == dir_id) {
            self.deleted_directories.remove(pos);
            self.dirty = true;
            true
        } else {
            false
        }
    }

    pub fn set_client_store_marker(&mut self, marker: u64) {
        self.client_store_marker = marker;
        self.dirty = true;
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        U32Be(INFO_MAGIC).write_to(w)?;
        U64Be(self.account_id).write_to(w)?;
        U64Be(self.client_store_marker).write_to(w)?;
        U64Be(self.last_object_id_used).write_to(w)?;
        U64Be(self.blocks_used).write_to(w)?;
        U64Be(self.blocks_in_old_files).write_to(w)?;
        U64Be(self.blocks_in_deleted_files).write_to(w)?;
        U64Be(self.blocks_in_directories).write_to(w)?;
        U64Be(self.soft_limit).write_to(w)?;
        U64Be(self.hard_limit).write_to(w)?;
        U64Be(self.deleted_directories.len() as u64).write_to(w)?;
        for id in &self.deleted_directories {
            U64Be(*id).write_to(w)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, AsError> {
        let magic = U32Be::read_from(r).map_err(|_| AsError::Truncated)?.get();
        if magic != INFO_MAGIC {
            return Err(AsError::BadMagic);
        }
        let account_id = U64Be::read_from(r).map_err(|_| AsError::Truncated)?.get();
        let client_store_marker = U64Be::read_from(r).map_err(|_| AsError::Truncated)?.get();
        let last_object_id_used = U64Be::read_from(r).map_err(|_| AsError::Truncated)?.get();
        let blocks_used = U64Be::read_from(r).map_err(|_| AsError::Truncated)?.get();
        let blocks_in_old_files = U64Be::read_from(r).map_err(|_| AsError::Truncated)?.get();
        let blocks_in_deleted_files = U64Be::read_from(r).map_err(|_| AsError::Truncated)?.get();
        let blocks_in_directories = U64Be::read_from(r).map_err(|_| AsError::Truncated)?.get();
        let soft_limit = U64Be::read_from(r).map_err(|_| AsError::Truncated)?.get();
        let hard_limit = U64Be::read_from(r).map_err(|_| AsError::Truncated)?.get();
        let num_deleted = U64Be::read_from(r).map_err(|_| AsError::Truncated)?.get();
        let mut deleted_directories = Vec::with_capacity(num_deleted as usize);
        for _ in 0..num_deleted {
            deleted_directories.push(U64Be::read_from(r).map_err(|_| AsError::Truncated)?.get());
        }
        Ok(AccountState {
            account_id,
            client_store_marker,
            last_object_id_used,
            blocks_used,
            blocks_in_old_files,
            blocks_in_deleted_files,
            blocks_in_directories,
            soft_limit,
            hard_limit,
            deleted_directories,
            dirty: false,
        })
    }
}

fn apply_delta(current: u64, delta: i64) -> Result<u64, AsError> {
    let result = current as i64 + delta;
    if result < 0 {
        return Err(AsError::CountersWentNegative);
    }
    Ok(result as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_object_id_sets_dirty_before_returning() {
        let mut acct = AccountState::new(1, 10_000, 20_000);
        acct.mark_clean();
        let id = acct.allocate_object_id();
        assert_eq!(id, 2);
        assert!(acct.is_dirty());
    }

    #[test]
    fn object_ids_are_never_reused() {
        let mut acct = AccountState::new(1, 10_000, 20_000);
        let a = acct.allocate_object_id();
        let b = acct.allocate_object_id();
        assert_eq!((a, b), (2, 3));
    }

    #[test]
    fn change_blocks_used_rejects_going_negative() {
        let mut acct = AccountState::new(1, 10_000, 20_000);
        acct.change_blocks_used(5).unwrap();
        assert_eq!(
            acct.change_blocks_used(-10),
            Err(AsError::CountersWentNegative)
        );
    }

    #[test]
    fn hard_limit_enforcement() {
        let mut acct = AccountState::new(1, 50, 100);
        acct.change_blocks_used(95).unwrap();
        assert!(!acct.would_exceed_hard_limit(5));
        assert!(acct.would_exceed_hard_limit(6));
    }

    #[test]
    fn roundtrips_through_wire_format() {
        let mut acct = AccountState::new(7, 1000, 2000);
        acct.change_blocks_used(42).unwrap();
        acct.add_deleted_directory(99);
        let mut bytes = Vec::new();
        acct.write_to(&mut bytes).unwrap();
        let mut cursor = &bytes[..];
        let back = AccountState::read_from(&mut cursor).unwrap();
        assert_eq!(back.account_id, 7);
        assert_eq!(back.blocks_used, 42);
        assert_eq!(back.deleted_directories, vec![99]);
        assert!(!back.is_dirty());
    }
}
