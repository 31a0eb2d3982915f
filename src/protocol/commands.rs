//! Per-command argument and result types (spec.md §4.8's command list).
//!
//! Every command is a plain struct of already-decoded fields; [`codec`]
//! handles turning wire bytes into these and back. Stream-carrying commands
//! (`StoreFile`, `CreateDirectory`, `ChangeDirAttributes`) pair their inline
//! fields here with a separate `Vec<u8>` read by the caller as the frame's
//! single trailing stream.

/// Dispatchable command, decoded from its 4-byte id plus inline fields.
/// `Version` and `Login` are handled specially by the connection loop before
/// any other command is accepted (spec.md §4.8's session-start invariant).
#[derive(Debug, Clone)]
pub enum Command {
    Version,
    Login(LoginArgs),
    GetAccountUsage,
    GetDirectory(u64),
    ListDirectory(ListDirectoryArgs),
    GetFile(GetFileArgs),
    GetBlockIndexByID(u64),
    GetBlockIndexByName(GetBlockIndexByNameArgs),
    StoreFile(StoreFileArgs),
    DeleteFile(DeleteFileArgs),
    UndeleteFile(UndeleteFileArgs),
    MoveObject(MoveObjectArgs),
    CreateDirectory(CreateDirectoryArgs),
    DeleteDirectory(u64),
    UndeleteDirectory(u64),
    ChangeDirAttributes(ChangeDirAttributesArgs),
    SetClientStoreMarker(u64),
    Finished,
}

#[derive(Debug, Clone)]
pub struct LoginArgs {
    pub account_id: u64,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct ListDirectoryArgs {
    pub id: u64,
    pub flags_filter: u16,
}

#[derive(Debug, Clone)]
pub struct GetFileArgs {
    pub in_dir: u64,
    pub file_id: u64,
}

#[derive(Debug, Clone)]
pub struct GetBlockIndexByNameArgs {
    pub in_dir: u64,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StoreFileArgs {
    pub in_dir: u64,
    pub mtime: u64,
    pub attr_hash: u64,
    pub diff_from: u64,
    pub mark_older: bool,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DeleteFileArgs {
    pub in_dir: u64,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct UndeleteFileArgs {
    pub in_dir: u64,
    pub id: u64,
}

#[derive(Debug, Clone)]
pub struct MoveObjectArgs {
    pub id: u64,
    pub from_dir: u64,
    pub to_dir: u64,
    pub move_all_with_same_name: bool,
    pub allow_over_deleted: bool,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CreateDirectoryArgs {
    pub in_dir: u64,
    pub attr_mtime: u64,
    pub mtime: u64,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ChangeDirAttributesArgs {
    pub id: u64,
    pub attr_mtime: u64,
}

/// Reply returned for a successfully dispatched command. Commands that only
/// ever signal success carry no payload (`Ack`); everything else carries
/// just the fields spec.md §4.8 lists as the command's return value.
#[derive(Debug, Clone)]
pub enum Reply {
    Ack,
    Version(u32),
    LoggedIn { root_dir_id: u64, client_store_marker: u64 },
    AccountUsage { blocks_used: u64, blocks_in_old_files: u64, blocks_in_deleted_files: u64, blocks_in_directories: u64, soft_limit: u64, hard_limit: u64 },
    Stream(Vec<u8>),
    ObjectId(u64),
    DeletedFile { existed: bool, id: u64 },
    DirectoryCreated { id: u64, already_existed: bool },
    BlockIndex(Vec<crate::efc::BlockIndexEntry>),
}
