//! Error taxonomy shared by every module.
//!
//! The store classifies failures by behavior, not by type: a [`Severity`]
//! tells a caller how to react (surface it, abort the session, just count
//! it) regardless of which module raised it.

/// How a caller is expected to react to an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Malformed on-disk or on-wire data. Surface to the caller; the
    /// checker quarantines and counts instead of stopping.
    Structural,
    /// Quota exceeded, lock unavailable, out of space. Surface to the
    /// client with a typed code; no partial state survives.
    Resource,
    /// Socket closed, timed out. Abort the in-flight command and close
    /// the session; no state change.
    Transport,
    /// A RAID stripe is missing or unreadable. Transparent if one stripe
    /// still exists, fatal otherwise.
    Integrity,
    /// An internal sanity check failed (negative counters, an expected
    /// cache entry missing). Fatal: abort the session, let the checker
    /// recover on its next run.
    Invariant,
}

/// Errors raised by the striped object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SosError {
    NotFound,
    AlreadyExists,
    Io(String),
    FileIsDamagedNotRecoverable,
    BothStripesUnreadable,
    InvalidRevision,
}

impl SosError {
    pub fn severity(&self) -> Severity {
        match self {
            SosError::NotFound | SosError::AlreadyExists => Severity::Structural,
            SosError::Io(_) => Severity::Transport,
            SosError::FileIsDamagedNotRecoverable | SosError::BothStripesUnreadable => {
                Severity::Integrity
            }
            SosError::InvalidRevision => Severity::Invariant,
        }
    }
}

/// Errors raised by the object namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnsError {
    ObjectIdIsZero,
    SegmentLengthOutOfRange,
}

impl OnsError {
    pub fn severity(&self) -> Severity {
        Severity::Invariant
    }
}

/// Errors raised by the encoded file codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EfcError {
    BadMagic,
    Truncated,
    BlockIndexMismatch,
    UnknownEncoding,
    AttributesBlockCorrupt,
    NoPreviousVersionForPatch,
    DecryptionFailed,
    EncryptionFailed,
}

impl EfcError {
    pub fn severity(&self) -> Severity {
        match self {
            EfcError::DecryptionFailed | EfcError::EncryptionFailed => Severity::Integrity,
            _ => Severity::Structural,
        }
    }
}

/// Errors raised by directory record handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrError {
    BadMagic,
    Truncated,
    DuplicateEntryId,
    DanglingDependency,
}

impl DrError {
    pub fn severity(&self) -> Severity {
        Severity::Structural
    }
}

/// Errors raised by account-state handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsError {
    BadMagic,
    Truncated,
    AddedFileExceedsStorageLimit,
    CountersWentNegative,
}

impl AsError {
    pub fn severity(&self) -> Severity {
        match self {
            AsError::AddedFileExceedsStorageLimit => Severity::Resource,
            AsError::CountersWentNegative => Severity::Invariant,
            AsError::BadMagic | AsError::Truncated => Severity::Structural,
        }
    }
}

/// Errors raised by the per-connection session context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScError {
    CouldNotLockStoreAccount,
    NameAlreadyExistsInDirectory,
    ObjectDoesNotExist,
    ReadOnlySession,
    Sos(SosError),
    Efc(EfcError),
    Dr(DrError),
    As(AsError),
    Ons(OnsError),
}

impl ScError {
    pub fn severity(&self) -> Severity {
        match self {
            ScError::CouldNotLockStoreAccount => Severity::Resource,
            ScError::NameAlreadyExistsInDirectory => Severity::Resource,
            ScError::ObjectDoesNotExist => Severity::Invariant,
            ScError::ReadOnlySession => Severity::Resource,
            ScError::Sos(e) => e.severity(),
            ScError::Efc(e) => e.severity(),
            ScError::Dr(e) => e.severity(),
            ScError::As(e) => e.severity(),
            ScError::Ons(e) => e.severity(),
        }
    }
}

impl From<SosError> for ScError {
    fn from(e: SosError) -> Self {
        ScError::Sos(e)
    }
}

impl From<EfcError> for ScError {
    fn from(e: EfcError) -> Self {
        ScError::Efc(e)
    }
}

impl From<DrError> for ScError {
    fn from(e: DrError) -> Self {
        ScError::Dr(e)
    }
}

impl From<AsError> for ScError {
    fn from(e: AsError) -> Self {
        ScError::As(e)
    }
}

impl From<OnsError> for ScError {
    fn from(e: OnsError) -> Self {
        ScError::Ons(e)
    }
}

/// Errors at the session-protocol framing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpError {
    NotLoggedIn,
    UnexpectedCommand,
    FrameTooLarge,
    ConnectionClosed,
    Sc(ScError),
}

impl SpError {
    pub fn severity(&self) -> Severity {
        match self {
            SpError::NotLoggedIn | SpError::UnexpectedCommand => Severity::Structural,
            SpError::FrameTooLarge | SpError::ConnectionClosed => Severity::Transport,
            SpError::Sc(e) => e.severity(),
        }
    }
}

impl From<ScError> for SpError {
    fn from(e: ScError) -> Self {
        SpError::Sc(e)
    }
}

impl SpError {
    /// Stable numeric code sent to the client in an error reply frame.
    /// Grouped by originating taxonomy so a client can tell roughly what
    /// went wrong without a shared string table.
    pub fn code(&self) -> u32 {
        match self {
            SpError::NotLoggedIn => 1,
            SpError::UnexpectedCommand => 2,
            SpError::FrameTooLarge => 3,
            SpError::ConnectionClosed => 4,
            SpError::Sc(ScError::CouldNotLockStoreAccount) => 100,
            SpError::Sc(ScError::NameAlreadyExistsInDirectory) => 101,
            SpError::Sc(ScError::ObjectDoesNotExist) => 102,
            SpError::Sc(ScError::ReadOnlySession) => 103,
            SpError::Sc(ScError::As(AsError::AddedFileExceedsStorageLimit)) => 104,
            SpError::Sc(ScError::Sos(SosError::FileIsDamagedNotRecoverable)) => 200,
            SpError::Sc(ScError::Sos(SosError::BothStripesUnreadable)) => 201,
            SpError::Sc(ScError::Efc(_)) => 300,
            SpError::Sc(ScError::Dr(_)) => 301,
            SpError::Sc(_) => 399,
        }
    }
}

/// Errors counted (never stopped on) by the consistency checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    CouldNotLockStoreAccount,
    CorruptObject(u64),
    OrphanedObject(u64),
    DanglingContainerRef(u64),
}
