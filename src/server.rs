//! Accept loop: one task per connection (spec.md §5's concurrency
//! redesign, see `SPEC_FULL.md` §D — a fork-per-connection process model
//! translated to a tokio task per connection rather than a thread-of-
//! control per process).
//!
//! Grounded on the teacher's `handle_forever`/`process_socket` shape
//! (`examples/RMamonts-nfs-mamont/src/lib.rs`), generalized from the
//! read-task/vfs-task/stream-writer pipeline to a single blocking task per
//! connection, since the session protocol here is a strict request/reply
//! loop rather than NFS's pipelined early-reply model.

use crate::account::AccountState;
use crate::config::{AccountConfig, Config};
use crate::dr::DirectoryRecord;
use crate::error::{ScError, SpError};
use crate::housekeeping::ReleaseSender;
use crate::ons::ObjectNamespace;
use crate::protocol::codec::{command_carries_stream, read_command, read_stream, write_response};
use crate::protocol::commands::{Command, Reply};
use crate::session::{SessionContext, ROOT_OBJECT_ID};
use crate::sos;
use std::net::TcpStream as StdTcpStream;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Accepts connections forever, handing each off to its own blocking task.
/// `release_requests` lets a session ask housekeeping to give up an
/// account's write lock (spec.md §4.6).
pub async fn handle_forever(
    listener: TcpListener,
    config: Config,
    release_requests: ReleaseSender,
) -> std::io::Result<()> {
    let config = Arc::new(config);
    loop {
        let (socket, peer) = listener.accept().await?;
        socket.set_nodelay(true)?;
        let config = config.clone();
        let release_requests = release_requests.clone();
        let std_socket = socket.into_std()?;
        tokio::task::spawn_blocking(move || {
            info!(%peer, "connection accepted");
            if let Err(e) = run_session(std_socket, &config, release_requests.clone()) {
                warn!(%peer, ?e, "session aborted");
            }
            info!(%peer, "connection closed");
        });
    }
}

/// One connection's whole lifetime, run synchronously on a blocking task:
/// read a command frame, dispatch it, write a response frame, repeat until
/// `Finished` or the peer disconnects. Matches spec.md §5's "private to
/// the session's child process" — nothing here is shared with any other
/// connection except the immutable `Config` and the release-request
/// channel.
fn run_session(
    socket: StdTcpStream,
    config: &Config,
    release_requests: ReleaseSender,
) -> Result<(), SpError> {
    let mut read_half = socket.try_clone().map_err(|_| SpError::ConnectionClosed)?;
    let mut write_half = socket;

    let mut session: Option<SessionContext> = None;

    loop {
        let command = match read_command(&mut read_half)? {
            Some(c) => c,
            None => return Ok(()),
        };

        let stream = if command_carries_stream(&command) {
            Some(read_stream(&mut read_half)?)
        } else {
            None
        };

        let result = dispatch(
            &command,
            stream,
            config,
            &mut session,
            &release_requests,
        );
        let is_finished = matches!(command, Command::Finished);

        write_response(&mut write_half, &result).map_err(|_| SpError::ConnectionClosed)?;

        if is_finished {
            return Ok(());
        }
    }
}

fn dispatch(
    command: &Command,
    stream: Option<Vec<u8>>,
    config: &Config,
    session: &mut Option<SessionContext>,
    release_requests: &ReleaseSender,
) -> Result<Reply, SpError> {
    match command {
        Command::Version => Ok(Reply::Version(1)),
        Command::Login(args) => {
            let account_cfg = config
                .account(args.account_id)
                .cloned()
                .ok_or(ScError::ObjectDoesNotExist)?;
            let release_requests = release_requests.clone();
            let closure_account_id = account_cfg.account_id;
            let new_session = login(config, &account_cfg, args.read_only, move || {
                let _ = release_requests.try_send(closure_account_id);
            })?;
            let root_dir_id = ROOT_OBJECT_ID;
            let client_store_marker = new_session.account().client_store_marker;
            *session = Some(new_session);
            Ok(Reply::LoggedIn { root_dir_id, client_store_marker })
        }
        other => {
            let sc = session.as_mut().ok_or(SpError::NotLoggedIn)?;
            dispatch_logged_in(other, stream, sc).map_err(SpError::from)
        }
    }
}

fn dispatch_logged_in(
    command: &Command,
    stream: Option<Vec<u8>>,
    sc: &mut SessionContext,
) -> Result<Reply, ScError> {
    match command {
        Command::Version | Command::Login(_) => Err(ScError::ObjectDoesNotExist),
        Command::GetAccountUsage => {
            let (blocks_used, blocks_in_old_files, blocks_in_deleted_files, blocks_in_directories, soft_limit, hard_limit) =
                sc.account_usage();
            Ok(Reply::AccountUsage {
                blocks_used,
                blocks_in_old_files,
                blocks_in_deleted_files,
                blocks_in_directories,
                soft_limit,
                hard_limit,
            })
        }
        Command::GetDirectory(id) => Ok(Reply::Stream(sc.get_directory_stream(*id)?)),
        Command::ListDirectory(args) => {
            let entries = sc.list_directory(args.id, args.flags_filter)?;
            let mut dir = DirectoryRecord::new(args.id, args.id, Vec::new(), 0);
            dir.entries = entries;
            let mut bytes = Vec::new();
            dir.write_to(&mut bytes).map_err(|e| ScError::Sos(crate::error::SosError::Io(e.to_string())))?;
            Ok(Reply::Stream(bytes))
        }
        Command::GetFile(args) => Ok(Reply::Stream(sc.get_file(args.in_dir, args.file_id)?)),
        Command::GetBlockIndexByID(id) => Ok(Reply::BlockIndex(sc.get_block_index_by_id(*id)?)),
        Command::GetBlockIndexByName(args) => {
            let (_, index) = sc.get_block_index_by_name(args.in_dir, &args.name)?;
            Ok(Reply::BlockIndex(index))
        }
        Command::StoreFile(args) => {
            let encoded = stream.ok_or(ScError::ObjectDoesNotExist)?;
            let id = sc.add_file(
                args.in_dir,
                args.mtime,
                args.attr_hash,
                args.diff_from,
                args.name.clone(),
                args.mark_older,
                &encoded,
            )?;
            Ok(Reply::ObjectId(id))
        }
        Command::DeleteFile(args) => {
            let (existed, id) = sc.delete_file(&args.name, args.in_dir)?;
            Ok(Reply::DeletedFile { existed, id })
        }
        Command::UndeleteFile(args) => {
            sc.undelete_file(args.id, args.in_dir)?;
            Ok(Reply::Ack)
        }
        Command::MoveObject(args) => {
            sc.move_object(
                args.id,
                args.from_dir,
                args.to_dir,
                args.name.clone(),
                args.move_all_with_same_name,
                args.allow_over_deleted,
            )?;
            Ok(Reply::Ack)
        }
        Command::CreateDirectory(args) => {
            let attrs_blob = stream.unwrap_or_default();
            let (id, already_existed) =
                sc.add_directory(args.in_dir, args.name.clone(), attrs_blob, args.attr_mtime, args.mtime)?;
            Ok(Reply::DirectoryCreated { id, already_existed })
        }
        Command::DeleteDirectory(id) => {
            sc.delete_directory(*id, false)?;
            Ok(Reply::Ack)
        }
        Command::UndeleteDirectory(id) => {
            sc.delete_directory(*id, true)?;
            Ok(Reply::Ack)
        }
        Command::ChangeDirAttributes(args) => {
            let attrs_blob = stream.unwrap_or_default();
            sc.change_dir_attributes(args.id, attrs_blob, args.attr_mtime)?;
            Ok(Reply::Ack)
        }
        Command::SetClientStoreMarker(marker) => {
            sc.set_client_store_marker(*marker)?;
            Ok(Reply::Ack)
        }
        Command::Finished => {
            sc.finish()?;
            Ok(Reply::Ack)
        }
    }
}

/// Opens a session for an existing account, bootstrapping a fresh `info`
/// file and empty root directory the first time this account is seen
/// (spec.md §3: "object ID 1 is the root directory").
fn login(
    config: &Config,
    account_cfg: &AccountConfig,
    read_only: bool,
    request_release: impl FnMut(),
) -> Result<SessionContext, ScError> {
    let disc_set = config.disc_set(account_cfg.disc_set).cloned().ok_or(ScError::ObjectDoesNotExist)?;
    let keys = crate::crypto::AccountKeys::new(account_cfg.attributes_key, account_cfg.file_data_key);

    let info_path = disc_set.disc(0).join(format!("{}info", account_cfg.root));
    let account = match std::fs::read(&info_path) {
        Ok(bytes) => AccountState::read_from(&mut &bytes[..])?,
        Err(_) => bootstrap_account(config, &disc_set, account_cfg)?,
    };

    SessionContext::login(
        config.clone(),
        disc_set,
        keys,
        account,
        account_cfg.root.clone(),
        read_only,
        request_release,
    )
}

fn bootstrap_account(
    config: &Config,
    disc_set: &crate::config::DiscSet,
    account_cfg: &AccountConfig,
) -> Result<AccountState, ScError> {
    let ns = ObjectNamespace::new(config.segment_length_bits)?;
    let root = DirectoryRecord::new(ROOT_OBJECT_ID, ROOT_OBJECT_ID, Vec::new(), 0);
    let rel = ns.object_path(ROOT_OBJECT_ID, &account_cfg.root)?;
    let mut bytes = Vec::new();
    root.write_to(&mut bytes).map_err(|e| ScError::Sos(crate::error::SosError::Io(e.to_string())))?;
    let mut w = sos::open_write(disc_set, &rel, config.block_size as usize)?;
    w.write_all(&bytes)?;
    w.commit(true)?;

    let soft = account_cfg.soft_quota.unwrap_or(config.default_soft_quota);
    let hard = account_cfg.hard_quota.unwrap_or(config.default_hard_quota);
    let mut account = AccountState::new(account_cfg.account_id, soft, hard);
    let root_size = sos::block_count_of(disc_set, &rel, config.block_size as usize)?;
    account.change_blocks_in_directories(root_size as i64)?;

    let info_path = disc_set.disc(0).join(format!("{}info", account_cfg.root));
    if let Some(parent) = info_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ScError::Sos(crate::error::SosError::Io(e.to_string())))?;
    }
    let mut out = Vec::new();
    account.write_to(&mut out).map_err(|e| ScError::Sos(crate::error::SosError::Io(e.to_string())))?;
    std::fs::write(&info_path, &out).map_err(|e| ScError::Sos(crate::error::SosError::Io(e.to_string())))?;
    account.mark_clean();
    Ok(account)
}
