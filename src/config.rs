//! Static configuration, loaded once by the launcher and handed to the core
//! as an immutable value. The core never reads environment variables or
//! consults process-global state directly.

use serde::Deserialize;
use std::path::PathBuf;

/// A disc set is a fixed tuple of three filesystem roots that together form
/// one logical RAID-like storage unit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiscSet {
    pub discs: [PathBuf; 3],
}

impl DiscSet {
    pub fn disc(&self, index: usize) -> &std::path::Path {
        &self.discs[index]
    }
}

/// Static registry entry for one tenant: which disc set it lives on, the
/// directory-name prefix under that disc set's roots, and its symmetric
/// keys. Quotas default to the registry-wide defaults when absent so most
/// entries only need to name an id, a disc set, and a root.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub account_id: u64,
    pub disc_set: usize,
    /// Root directory name for this account, relative to each disc in its
    /// disc set, e.g. `"0001/"` (spec.md §6's `<root>` prefix).
    pub root: String,
    pub attributes_key: [u8; 32],
    pub file_data_key: [u8; 32],
    pub soft_quota: Option<u64>,
    pub hard_quota: Option<u64>,
}

/// Immutable configuration shared by every session and by `boxcheck`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Disc sets available to the store, indexed by disc-set id.
    pub disc_sets: Vec<DiscSet>,
    /// Striping block size in bytes (nominally 1024 or 2048).
    pub block_size: u32,
    /// Number of low bits of an object id consumed per path segment.
    pub segment_length_bits: u32,
    /// Bounded LRU size for the per-session directory cache.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,
    /// Seconds a write session waits for housekeeping to release the
    /// account lock before failing with `CouldNotLockStoreAccount`.
    #[serde(default = "default_housekeeping_wait_secs")]
    pub max_wait_for_housekeeping_release_secs: u64,
    /// Number of deferred account-state mutations allowed before a forced
    /// flush to disk.
    #[serde(default = "default_store_info_save_delay")]
    pub store_info_save_delay: u32,
    /// Default soft quota (blocks) for newly created accounts.
    pub default_soft_quota: u64,
    /// Default hard quota (blocks) for newly created accounts.
    pub default_hard_quota: u64,
    /// Known tenants. The launcher (out of scope per spec.md §1) is
    /// responsible for provisioning entries here; the core only reads them.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Seconds between housekeeping sweeps over every account.
    #[serde(default = "default_housekeeping_interval_secs")]
    pub housekeeping_interval_secs: u64,
    /// Entries older than this many seconds past being marked
    /// old-version/deleted are purged by housekeeping (spec.md §2's
    /// "retention window").
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_housekeeping_interval_secs() -> u64 {
    300
}

fn default_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_max_cache_size() -> u64 {
    32
}

fn default_housekeeping_wait_secs() -> u64 {
    4
}

fn default_store_info_save_delay() -> u32 {
    96
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn disc_set(&self, id: usize) -> Option<&DiscSet> {
        self.disc_sets.get(id)
    }

    pub fn account(&self, account_id: u64) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.account_id == account_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            block_size = 2048
            segment_length_bits = 8
            default_soft_quota = 10000
            default_hard_quota = 20000

            [[disc_sets]]
            discs = ["/tmp/disc0", "/tmp/disc1", "/tmp/disc2"]
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.block_size, 2048);
        assert_eq!(cfg.max_cache_size, 32);
        assert_eq!(cfg.max_wait_for_housekeeping_release_secs, 4);
        assert_eq!(cfg.store_info_save_delay, 96);
        assert_eq!(cfg.disc_sets.len(), 1);
    }
}
