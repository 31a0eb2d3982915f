//! Background reclaim loop: periodically sweeps every configured account,
//! purging old-version and deleted directory entries that have sat past
//! the account's retention window, and answers the session-side "please
//! release the account" handshake (spec.md §4.6, §5).
//!
//! Unlike the consistency checker this never rebuilds the reference graph
//! from scratch — it only walks what the live directory tree already
//! names, deleting the tail of each patch chain (an entry with no older
//! dependent) once it has aged out.

use crate::account::AccountState;
use crate::config::{AccountConfig, Config, DiscSet};
use crate::dr::DirectoryRecord;
use crate::error::ScError;
use crate::ons::ObjectNamespace;
use crate::session::{lock::AccountLock, ROOT_OBJECT_ID};
use crate::sos;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Side-channel: a session that failed to acquire an account's write lock
/// posts the account id here; housekeeping checks it between accounts (and
/// between directories within an account) and drops its own hold early.
pub type ReleaseRequests = async_channel::Receiver<u64>;
pub type ReleaseSender = async_channel::Sender<u64>;

pub fn release_channel() -> (ReleaseSender, ReleaseRequests) {
    async_channel::unbounded()
}

/// Runs forever, sweeping every account in `config.accounts` once per
/// `config.housekeeping_interval_secs`. Intended to be spawned as its own
/// tokio task alongside the accept loop in `server.rs`.
pub async fn run_forever(config: Config, release_requests: ReleaseRequests) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.housekeeping_interval_secs));
    loop {
        ticker.tick().await;
        for account in config.accounts.clone() {
            drain_release_requests(&release_requests);
            if let Err(e) = sweep_account(&config, &account, &release_requests) {
                warn!(account_id = account.account_id, ?e, "housekeeping sweep failed");
            }
        }
    }
}

fn drain_release_requests(requests: &ReleaseRequests) {
    while requests.try_recv().is_ok() {}
}

fn was_release_requested_for(requests: &ReleaseRequests, account_id: u64) -> bool {
    let mut seen = false;
    while let Ok(id) = requests.try_recv() {
        seen |= id == account_id;
    }
    seen
}

fn sweep_account(
    config: &Config,
    account: &AccountConfig,
    release_requests: &ReleaseRequests,
) -> Result<(), ScError> {
    let disc_set = config
        .disc_set(account.disc_set)
        .cloned()
        .ok_or(ScError::ObjectDoesNotExist)?;
    let ns = ObjectNamespace::new(config.segment_length_bits)?;
    let lock_path = ns.write_lock_path(disc_set.disc(0), &account.root);

    let Some(_lock) = AccountLock::try_acquire_now(&lock_path).map_err(|_| ScError::CouldNotLockStoreAccount)?
    else {
        info!(account_id = account.account_id, "account busy, skipping this pass");
        return Ok(());
    };

    let info_path = disc_set.disc(0).join(format!("{}info", account.root));
    let bytes = std::fs::read(&info_path).map_err(|e| ScError::Sos(crate::error::SosError::Io(e.to_string())))?;
    let mut acct = AccountState::read_from(&mut &bytes[..]).map_err(ScError::As)?;

    let cutoff = now_secs().saturating_sub(config.retention_secs);
    let mut reclaimed_old = 0i64;
    let mut reclaimed_deleted = 0i64;
    purge_directory(
        &disc_set,
        &ns,
        &account.root,
        config.block_size as usize,
        ROOT_OBJECT_ID,
        cutoff,
        &mut reclaimed_old,
        &mut reclaimed_deleted,
        release_requests,
        account.account_id,
    )?;

    if reclaimed_old != 0 {
        acct.change_blocks_in_old_files(-reclaimed_old)?;
    }
    if reclaimed_deleted != 0 {
        acct.change_blocks_in_deleted_files(-reclaimed_deleted)?;
    }
    if acct.is_dirty() {
        let mut out = Vec::new();
        acct.write_to(&mut out).map_err(|e| ScError::Sos(crate::error::SosError::Io(e.to_string())))?;
        std::fs::write(&info_path, &out).map_err(|e| ScError::Sos(crate::error::SosError::Io(e.to_string())))?;
    }
    info!(
        account_id = account.account_id,
        reclaimed_old, reclaimed_deleted, "housekeeping pass complete"
    );
    Ok(())
}

/// Recursively purges `dir_id` and its file-entry subdirectories,
/// depth-first, bailing out early if a release was requested for this
/// account mid-walk.
#[allow(clippy::too_many_arguments)]
fn purge_directory(
    disc_set: &DiscSet,
    ns: &ObjectNamespace,
    account_root: &str,
    block_size: usize,
    dir_id: u64,
    cutoff: u64,
    reclaimed_old: &mut i64,
    reclaimed_deleted: &mut i64,
    release_requests: &ReleaseRequests,
    account_id: u64,
) -> Result<(), ScError> {
    if was_release_requested_for(release_requests, account_id) {
        return Ok(());
    }

    let rel = ns.object_path(dir_id, account_root)?;
    let reader = sos::open_read(disc_set, &rel, block_size)?;
    let bytes = reader.into_bytes();
    let mut dir = DirectoryRecord::read_from(&mut &bytes[..]).map_err(ScError::Dr)?;

    let child_dirs: Vec<u64> = dir.entries.iter().filter(|e| e.is_dir()).map(|e| e.object_id).collect();
    for child in child_dirs {
        purge_directory(
            disc_set,
            ns,
            account_root,
            block_size,
            child,
            cutoff,
            reclaimed_old,
            reclaimed_deleted,
            release_requests,
            account_id,
        )?;
    }

    let expired: Vec<u64> = dir
        .entries
        .iter()
        .filter(|e| {
            e.is_file()
                && e.depends_older == 0
                && (e.is_old_version() || e.is_deleted())
                && e.mtime <= cutoff
        })
        .map(|e| e.object_id)
        .collect();

    if expired.is_empty() {
        return Ok(());
    }

    let mut changed = false;
    for id in expired {
        let Some(pos) = dir.entries.iter().position(|e| e.object_id == id) else {
            continue;
        };
        let entry = dir.entries[pos].clone();
        if entry.is_old_version() {
            *reclaimed_old += entry.size_blocks as i64;
        } else {
            *reclaimed_deleted += entry.size_blocks as i64;
        }
        if let Ok(obj_rel) = ns.object_path(id, account_root) {
            let _ = std::fs::remove_file(sos::write_path(disc_set.disc(0), &obj_rel));
            for disc in &disc_set.discs {
                let _ = std::fs::remove_file(sos::stripe_path(disc, &obj_rel));
            }
        }
        if let Some(newer) = dir.entries.iter_mut().find(|e| e.depends_newer == id) {
            newer.depends_older = 0;
        }
        dir.entries.remove(pos);
        changed = true;
    }

    if changed {
        dir.check_and_fix();
        let mut out = Vec::new();
        dir.write_to(&mut out).map_err(|e| ScError::Sos(crate::error::SosError::Io(e.to_string())))?;
        let mut w = sos::open_write(disc_set, &rel, block_size)?;
        w.write_all(&out)?;
        w.commit(true)?;
    }
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
