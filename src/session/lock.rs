//! Advisory lock on an account's write-lock file (spec.md §4.6, §5): at
//! most one write-enabled session may hold it at a time. If housekeeping
//! is holding it, the acquiring session asks it (via a side-channel
//! closure) to release and retries for a bounded time before failing.

use crate::config::Config;
use crate::error::ScError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::{Duration, Instant};

/// Holds the advisory lock for the lifetime of a write-enabled session.
/// Dropping it releases the lock.
pub struct AccountLock {
    file: File,
}

impl AccountLock {
    fn try_acquire(path: &Path) -> std::io::Result<Option<File>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Non-blocking acquire used by housekeeping: `Ok(None)` means a
    /// session currently holds the lock, so this account's sweep is
    /// skipped for this pass rather than waited on.
    pub fn try_acquire_now(path: &Path) -> std::io::Result<Option<Self>> {
        Ok(Self::try_acquire(path)?.map(|file| AccountLock { file }))
    }

    /// Blocking acquire with the housekeeping-release handshake. Intended
    /// to run on a blocking thread (`tokio::task::spawn_blocking`) since it
    /// sleeps between retries.
    pub fn acquire(
        path: &Path,
        config: &Config,
        mut request_release: impl FnMut(),
    ) -> Result<Self, ScError> {
        let deadline =
            Instant::now() + Duration::from_secs(config.max_wait_for_housekeeping_release_secs);
        let mut asked_once = false;
        loop {
            match Self::try_acquire(path) {
                Ok(Some(file)) => return Ok(AccountLock { file }),
                Ok(None) => {
                    if !asked_once {
                        request_release();
                        asked_once = true;
                    }
                    if Instant::now() >= deadline {
                        return Err(ScError::CouldNotLockStoreAccount);
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(_) => return Err(ScError::CouldNotLockStoreAccount),
            }
        }
    }
}

impl Drop for AccountLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn test_config() -> Config {
        Config {
            disc_sets: Vec::new(),
            block_size: 1024,
            segment_length_bits: 8,
            max_cache_size: 32,
            max_wait_for_housekeeping_release_secs: 1,
            store_info_save_delay: 96,
            default_soft_quota: 1000,
            default_hard_quota: 2000,
            accounts: Vec::new(),
            housekeeping_interval_secs: 300,
            retention_secs: 7 * 24 * 3600,
        }
    }

    #[test]
    fn second_acquire_fails_after_timeout_while_first_holds_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("write.lock");
        let _first = AccountLock::acquire(&path, &test_config(), || {}).unwrap();

        let mut asked = false;
        let result = AccountLock::acquire(&path, &test_config(), || asked = true);
        assert!(result.is_err());
        assert!(asked);
    }

    #[test]
    fn lock_is_reacquirable_once_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("write.lock");
        {
            let _held = AccountLock::acquire(&path, &test_config(), || {}).unwrap();
        }
        assert!(AccountLock::acquire(&path, &test_config(), || {}).is_ok());
    }
}
