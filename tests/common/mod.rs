//! Shared scaffolding for the integration tests: a throwaway three-disc
//! set, a minimal `Config`, and the bit of account bootstrap that would
//! otherwise be duplicated in every scenario (write the root directory
//! object, build an `AccountState`, open a session against it).

use coldvault::account::AccountState;
use coldvault::config::{Config, DiscSet};
use coldvault::crypto::AccountKeys;
use coldvault::dr::DirectoryRecord;
use coldvault::ons::ObjectNamespace;
use coldvault::session::{SessionContext, ROOT_OBJECT_ID};
use coldvault::sos;
use tempfile::TempDir;

pub const BLOCK_SIZE: u32 = 1024;
pub const SEGMENT_BITS: u32 = 8;

pub fn disc_set(dir: &TempDir) -> DiscSet {
    DiscSet {
        discs: [dir.path().join("d0"), dir.path().join("d1"), dir.path().join("d2")],
    }
}

pub fn test_config() -> Config {
    Config {
        disc_sets: Vec::new(),
        block_size: BLOCK_SIZE,
        segment_length_bits: SEGMENT_BITS,
        max_cache_size: 32,
        max_wait_for_housekeeping_release_secs: 1,
        store_info_save_delay: 96,
        default_soft_quota: 10_000,
        default_hard_quota: 20_000,
        accounts: Vec::new(),
        housekeeping_interval_secs: 300,
        retention_secs: 7 * 24 * 3600,
    }
}

pub fn keys() -> AccountKeys {
    AccountKeys::new([11u8; 32], [22u8; 32])
}

/// Mirrors `sos`'s private `.rf` stripe-file naming convention. `sos`'s own
/// path helpers are crate-private, so tests that need to knock out a
/// specific stripe (to exercise degraded reads or orphan creation) rebuild
/// the same suffix here rather than reaching into the module.
pub fn stripe_file_path(disc: &std::path::Path, rel_path: &std::path::Path) -> std::path::PathBuf {
    let mut s = rel_path.as_os_str().to_owned();
    s.push(".rf");
    disc.join(s)
}

/// Writes an empty root directory (object id 1) directly, the way
/// `server::bootstrap_account` would for a brand new account.
pub fn write_root(ds: &DiscSet, account_root: &str, block_size: u32) {
    let root = DirectoryRecord::new(ROOT_OBJECT_ID, ROOT_OBJECT_ID, Vec::new(), 0);
    let ns = ObjectNamespace::new(SEGMENT_BITS).unwrap();
    let rel = ns.object_path(ROOT_OBJECT_ID, account_root).unwrap();
    let mut bytes = Vec::new();
    root.write_to(&mut bytes).unwrap();
    let mut w = sos::open_write(ds, &rel, block_size as usize).unwrap();
    w.write_all(&bytes).unwrap();
    w.commit(true).unwrap();
}

/// Bootstraps a fresh account (root directory + `AccountState`) and opens
/// a session against it, mirroring `server::login`'s first-time path.
pub fn new_session(
    config: &Config,
    ds: &DiscSet,
    account_root: &str,
    account_id: u64,
    soft: u64,
    hard: u64,
    read_only: bool,
) -> SessionContext {
    write_root(ds, account_root, config.block_size);
    let account = AccountState::new(account_id, soft, hard);
    SessionContext::login(
        config.clone(),
        ds.clone(),
        keys(),
        account,
        account_root.to_string(),
        read_only,
        || {},
    )
    .unwrap()
}
