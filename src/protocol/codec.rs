//! Wire framing for the session protocol (spec.md §4.8, §6): a fixed 4-byte
//! command id, the command's inline fields in network byte order, a
//! terminator byte, then optionally a single length-prefixed-chunk stream
//! ending with a zero-length frame.

use crate::error::SpError;
use crate::wire::{read_blob16, read_u8, write_blob16, write_u8, U16Be, U32Be, U64Be};
use std::io::{Read, Write};

use super::commands::*;

const FRAME_TERMINATOR: u8 = 0xff;

mod command_id {
    pub const VERSION: u32 = 1;
    pub const LOGIN: u32 = 2;
    pub const GET_ACCOUNT_USAGE: u32 = 3;
    pub const GET_DIRECTORY: u32 = 4;
    pub const LIST_DIRECTORY: u32 = 5;
    pub const GET_FILE: u32 = 6;
    pub const GET_BLOCK_INDEX_BY_ID: u32 = 7;
    pub const GET_BLOCK_INDEX_BY_NAME: u32 = 8;
    pub const STORE_FILE: u32 = 9;
    pub const DELETE_FILE: u32 = 10;
    pub const UNDELETE_FILE: u32 = 11;
    pub const MOVE_OBJECT: u32 = 12;
    pub const CREATE_DIRECTORY: u32 = 13;
    pub const DELETE_DIRECTORY: u32 = 14;
    pub const UNDELETE_DIRECTORY: u32 = 15;
    pub const CHANGE_DIR_ATTRIBUTES: u32 = 16;
    pub const SET_CLIENT_STORE_MARKER: u32 = 17;
    pub const FINISHED: u32 = 18;
}

fn read_terminator<R: Read>(r: &mut R) -> Result<(), SpError> {
    match read_u8(r) {
        Ok(FRAME_TERMINATOR) => Ok(()),
        Ok(_) => Err(SpError::UnexpectedCommand),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(SpError::ConnectionClosed),
        Err(_) => Err(SpError::ConnectionClosed),
    }
}

fn read_bool<R: Read>(r: &mut R) -> Result<bool, SpError> {
    match read_u8(r) {
        Ok(v) => Ok(v != 0),
        Err(_) => Err(SpError::ConnectionClosed),
    }
}

fn write_bool<W: Write>(w: &mut W, v: bool) -> std::io::Result<()> {
    write_u8(w, if v { 1 } else { 0 })
}

/// Reads one command frame. `Ok(None)` at the very start of a frame (before
/// any byte of the command id has been consumed) means the peer closed the
/// connection cleanly; any other I/O failure mid-frame is a protocol error.
pub fn read_command<R: Read>(r: &mut R) -> Result<Option<Command>, SpError> {
    let id = match U32Be::read_from(r) {
        Ok(v) => v.get(),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(SpError::ConnectionClosed),
    };
    let eof = |_| SpError::ConnectionClosed;

    let command = match id {
        command_id::VERSION => Command::Version,
        command_id::LOGIN => {
            let account_id = U64Be::read_from(r).map_err(eof)?.get();
            let read_only = read_bool(r)?;
            Command::Login(LoginArgs { account_id, read_only })
        }
        command_id::GET_ACCOUNT_USAGE => Command::GetAccountUsage,
        command_id::GET_DIRECTORY => Command::GetDirectory(U64Be::read_from(r).map_err(eof)?.get()),
        command_id::LIST_DIRECTORY => {
            let id = U64Be::read_from(r).map_err(eof)?.get();
            let flags_filter = U16Be::read_from(r).map_err(eof)?.get();
            Command::ListDirectory(ListDirectoryArgs { id, flags_filter })
        }
        command_id::GET_FILE => {
            let in_dir = U64Be::read_from(r).map_err(eof)?.get();
            let file_id = U64Be::read_from(r).map_err(eof)?.get();
            Command::GetFile(GetFileArgs { in_dir, file_id })
        }
        command_id::GET_BLOCK_INDEX_BY_ID => {
            Command::GetBlockIndexByID(U64Be::read_from(r).map_err(eof)?.get())
        }
        command_id::GET_BLOCK_INDEX_BY_NAME => {
            let in_dir = U64Be::read_from(r).map_err(eof)?.get();
            let name = read_blob16(r).map_err(eof)?;
            Command::GetBlockIndexByName(GetBlockIndexByNameArgs { in_dir, name })
        }
        command_id::STORE_FILE => {
            let in_dir = U64Be::read_from(r).map_err(eof)?.get();
            let mtime = U64Be::read_from(r).map_err(eof)?.get();
            let attr_hash = U64Be::read_from(r).map_err(eof)?.get();
            let diff_from = U64Be::read_from(r).map_err(eof)?.get();
            let mark_older = read_bool(r)?;
            let name = read_blob16(r).map_err(eof)?;
            Command::StoreFile(StoreFileArgs {
                in_dir,
                mtime,
                attr_hash,
                diff_from,
                mark_older,
                name,
            })
        }
        command_id::DELETE_FILE => {
            let in_dir = U64Be::read_from(r).map_err(eof)?.get();
            let name = read_blob16(r).map_err(eof)?;
            Command::DeleteFile(DeleteFileArgs { in_dir, name })
        }
        command_id::UNDELETE_FILE => {
            let in_dir = U64Be::read_from(r).map_err(eof)?.get();
            let id = U64Be::read_from(r).map_err(eof)?.get();
            Command::UndeleteFile(UndeleteFileArgs { in_dir, id })
        }
        command_id::MOVE_OBJECT => {
            let id = U64Be::read_from(r).map_err(eof)?.get();
            let from_dir = U64Be::read_from(r).map_err(eof)?.get();
            let to_dir = U64Be::read_from(r).map_err(eof)?.get();
            let move_all_with_same_name = read_bool(r)?;
            let allow_over_deleted = read_bool(r)?;
            let name = read_blob16(r).map_err(eof)?;
            Command::MoveObject(MoveObjectArgs {
                id,
                from_dir,
                to_dir,
                move_all_with_same_name,
                allow_over_deleted,
                name,
            })
        }
        command_id::CREATE_DIRECTORY => {
            let in_dir = U64Be::read_from(r).map_err(eof)?.get();
            let attr_mtime = U64Be::read_from(r).map_err(eof)?.get();
            let mtime = U64Be::read_from(r).map_err(eof)?.get();
            let name = read_blob16(r).map_err(eof)?;
            Command::CreateDirectory(CreateDirectoryArgs { in_dir, attr_mtime, mtime, name })
        }
        command_id::DELETE_DIRECTORY => Command::DeleteDirectory(U64Be::read_from(r).map_err(eof)?.get()),
        command_id::UNDELETE_DIRECTORY => {
            Command::UndeleteDirectory(U64Be::read_from(r).map_err(eof)?.get())
        }
        command_id::CHANGE_DIR_ATTRIBUTES => {
            let id = U64Be::read_from(r).map_err(eof)?.get();
            let attr_mtime = U64Be::read_from(r).map_err(eof)?.get();
            Command::ChangeDirAttributes(ChangeDirAttributesArgs { id, attr_mtime })
        }
        command_id::SET_CLIENT_STORE_MARKER => {
            Command::SetClientStoreMarker(U64Be::read_from(r).map_err(eof)?.get())
        }
        command_id::FINISHED => Command::Finished,
        _ => return Err(SpError::UnexpectedCommand),
    };

    read_terminator(r)?;
    Ok(Some(command))
}

/// Commands that are followed by a single stream (spec.md §4.8): the
/// connection loop reads inline fields via [`read_command`], then calls
/// [`read_stream`] exactly once before dispatching.
pub fn command_carries_stream(command: &Command) -> bool {
    matches!(
        command,
        Command::StoreFile(_) | Command::CreateDirectory(_) | Command::ChangeDirAttributes(_)
    )
}

/// Reads a length-prefixed-chunk stream, terminated by a zero-length frame.
pub fn read_stream<R: Read>(r: &mut R) -> Result<Vec<u8>, SpError> {
    let mut out = Vec::new();
    loop {
        let len = U32Be::read_from(r).map_err(|_| SpError::ConnectionClosed)?.get();
        if len == 0 {
            return Ok(out);
        }
        if out.len() + len as usize > MAX_STREAM_SIZE {
            return Err(SpError::FrameTooLarge);
        }
        let mut chunk = vec![0u8; len as usize];
        r.read_exact(&mut chunk).map_err(|_| SpError::ConnectionClosed)?;
        out.extend_from_slice(&chunk);
    }
}

/// Generous but bounded: a single session never needs an unlimited stream,
/// and an unbounded read is a memory-exhaustion vector for a misbehaving or
/// malicious peer (spec.md §7's framing-layer errors abort the connection).
const MAX_STREAM_SIZE: usize = 512 * 1024 * 1024;
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

pub fn write_stream<W: Write>(w: &mut W, data: &[u8]) -> std::io::Result<()> {
    for chunk in data.chunks(STREAM_CHUNK_SIZE) {
        U32Be(chunk.len() as u32).write_to(w)?;
        w.write_all(chunk)?;
    }
    U32Be(0).write_to(w)
}

/// Writes a whole response frame: a one-byte status tag (`0` = ok, `1` =
/// error) followed by either the reply's own encoding or a `u32` error
/// code (spec.md §7: "pairs the error with" a typed code the client can
/// act on without tearing down the connection).
pub fn write_response<W: Write>(w: &mut W, result: &Result<Reply, crate::error::SpError>) -> std::io::Result<()> {
    match result {
        Ok(reply) => {
            write_u8(w, 0)?;
            write_reply(w, reply)
        }
        Err(e) => {
            write_u8(w, 1)?;
            U32Be(e.code()).write_to(w)
        }
    }
}

pub fn write_reply<W: Write>(w: &mut W, reply: &Reply) -> std::io::Result<()> {
    match reply {
        Reply::Ack => U32Be(0).write_to(w),
        Reply::Version(v) => U32Be(*v).write_to(w),
        Reply::LoggedIn { root_dir_id, client_store_marker } => {
            U64Be(*root_dir_id).write_to(w)?;
            U64Be(*client_store_marker).write_to(w)
        }
        Reply::AccountUsage {
            blocks_used,
            blocks_in_old_files,
            blocks_in_deleted_files,
            blocks_in_directories,
            soft_limit,
            hard_limit,
        } => {
            U64Be(*blocks_used).write_to(w)?;
            U64Be(*blocks_in_old_files).write_to(w)?;
            U64Be(*blocks_in_deleted_files).write_to(w)?;
            U64Be(*blocks_in_directories).write_to(w)?;
            U64Be(*soft_limit).write_to(w)?;
            U64Be(*hard_limit).write_to(w)
        }
        Reply::Stream(bytes) => write_stream(w, bytes),
        Reply::ObjectId(id) => U64Be(*id).write_to(w),
        Reply::DeletedFile { existed, id } => {
            write_bool(w, *existed)?;
            U64Be(*id).write_to(w)
        }
        Reply::DirectoryCreated { id, already_existed } => {
            U64Be(*id).write_to(w)?;
            write_bool(w, *already_existed)
        }
        Reply::BlockIndex(entries) => crate::efc::blockindex::write_block_index(w, entries),
    }
}
