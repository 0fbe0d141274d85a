//! MAPI-style error codes.
//!
//! Every fallible call in the core returns `Result<T, EcError>`. The
//! numeric values are the HRESULT-derived codes the wire protocol carries;
//! no other error type crosses an RPC boundary.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type EcResult<T> = Result<T, EcError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EcError {
    #[error("unknown user")]
    UnknownUser,
    #[error("server out of memory")]
    ServerOom,
    #[error("logon permission denied")]
    LoginPerm,
    #[error("not a search folder")]
    NotSearchFolder,
    #[error("no receive folder configured")]
    NoReceiveFolder,
    #[error("wrong server for this mailbox")]
    WrongServer,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("search folder scope violation")]
    SearchFolderScopeViolation,
    #[error("malformed RPC payload")]
    RpcFormat,
    #[error("null object handle")]
    NullObject,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("too many attachments")]
    MaxAttachmentExceeded,
    #[error("named property id space exhausted")]
    NpQuotaExceeded,
    #[error("row not expanded")]
    NotExpanded,
    #[error("row not collapsed")]
    NotCollapsed,
    #[error("destination object is null")]
    DstNullObject,
    #[error("message attachment cycle")]
    MsgCycle,
    #[error("too many recipients")]
    TooManyRecips,
    #[error("rejected")]
    Rejected,
    #[error("invalid object handle")]
    RpcInvalidHandle,
    #[error("completed with warnings")]
    WarnWithErrors,
    #[error("client change newer")]
    SyncClientChangeNewer,
    #[error("call failed")]
    Error,
    #[error("stream size error")]
    StreamSizeError,
    #[error("operation not supported")]
    NotSupported,
    #[error("invalid entry id")]
    InvalidEntryId,
    #[error("invalid object")]
    InvalidObject,
    #[error("object modified by another writer")]
    ObjectModified,
    #[error("object deleted")]
    ObjectDeleted,
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("not found")]
    NotFound,
    #[error("logon failure")]
    LoginFailure,
    #[error("unable to abort")]
    UnableToAbort,
    #[error("network or RPC failure")]
    Network,
    #[error("restriction too complex")]
    TooComplex,
    #[error("value too big")]
    TooBig,
    #[error("computed property")]
    Computed,
    #[error("corrupt data")]
    CorruptData,
    #[error("table empty")]
    TableEmpty,
    #[error("table too big")]
    TableTooBig,
    #[error("invalid bookmark")]
    InvalidBookmark,
    #[error("not in queue")]
    NotInQueue,
    #[error("duplicate name")]
    DuplicateName,
    #[error("not initialized")]
    NotInitialized,
    #[error("folder cycle")]
    RootFolder,
    #[error("ambiguous recipient")]
    AmbiguousRecip,
    #[error("sync: object deleted")]
    SyncObjectDeleted,
    #[error("sync: change ignored")]
    SyncIgnore,
    #[error("sync: conflict")]
    SyncConflict,
    #[error("sync: no parent")]
    SyncNoParent,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("out of memory")]
    OutOfMemory,
}

impl EcError {
    /// Numeric code carried on the wire and stored in PT_ERROR values.
    pub fn code(self) -> u32 {
        match self {
            Self::UnknownUser => 0x0000_03EB,
            Self::ServerOom => 0x0000_03F0,
            Self::LoginPerm => 0x0000_03F2,
            Self::NotSearchFolder => 0x0000_0461,
            Self::NoReceiveFolder => 0x0000_0463,
            Self::WrongServer => 0x0000_0478,
            Self::BufferTooSmall => 0x0000_047D,
            Self::SearchFolderScopeViolation => 0x0000_0490,
            Self::RpcFormat => 0x0000_04B6,
            Self::NullObject => 0x0000_04B9,
            Self::QuotaExceeded => 0x0000_04D9,
            Self::MaxAttachmentExceeded => 0x0000_04DB,
            Self::NotExpanded => 0x0000_04F7,
            Self::NotCollapsed => 0x0000_04F8,
            Self::DstNullObject => 0x0000_0503,
            Self::MsgCycle => 0x0000_0504,
            Self::TooManyRecips => 0x0000_0505,
            Self::Rejected => 0x0000_07EE,
            Self::RpcInvalidHandle => 0x0000_0A2E,
            Self::WarnWithErrors => 0x0004_0380,
            Self::SyncClientChangeNewer => 0x0004_0821,
            Self::Error => 0x8000_4005,
            Self::StreamSizeError => 0x8003_0070,
            Self::NotSupported => 0x8004_0102,
            Self::InvalidEntryId => 0x8004_0107,
            Self::InvalidObject => 0x8004_0108,
            Self::ObjectModified => 0x8004_0109,
            Self::ObjectDeleted => 0x8004_010A,
            Self::InsufficientResources => 0x8004_010E,
            Self::NotFound => 0x8004_010F,
            Self::LoginFailure => 0x8004_0111,
            Self::UnableToAbort => 0x8004_0114,
            Self::Network => 0x8004_0115,
            Self::TooComplex => 0x8004_0117,
            Self::TooBig => 0x8004_0305,
            Self::Computed => 0x8004_011A,
            Self::CorruptData => 0x8004_011B,
            Self::TableEmpty => 0x8004_0402,
            Self::TableTooBig => 0x8004_0403,
            Self::InvalidBookmark => 0x8004_0405,
            Self::NotInQueue => 0x8004_0601,
            Self::DuplicateName => 0x8004_0604,
            Self::NotInitialized => 0x8004_0605,
            Self::RootFolder => 0x8004_060B,
            Self::AmbiguousRecip => 0x8004_0700,
            Self::SyncObjectDeleted => 0x8004_0800,
            Self::SyncIgnore => 0x8004_0801,
            Self::SyncConflict => 0x8004_0802,
            Self::SyncNoParent => 0x8004_0803,
            Self::NpQuotaExceeded => 0x8004_0900,
            Self::AccessDenied => 0x8007_0005,
            Self::OutOfMemory => 0x8007_000E,
            Self::InvalidParam => 0x8007_0057,
        }
    }

    /// Inverse of [`code`](Self::code); unknown codes collapse to `Error`.
    pub fn from_code(code: u32) -> Self {
        match code {
            0x0000_03EB => Self::UnknownUser,
            0x0000_03F0 => Self::ServerOom,
            0x0000_03F2 => Self::LoginPerm,
            0x0000_0461 => Self::NotSearchFolder,
            0x0000_0463 => Self::NoReceiveFolder,
            0x0000_0478 => Self::WrongServer,
            0x0000_047D => Self::BufferTooSmall,
            0x0000_0490 => Self::SearchFolderScopeViolation,
            0x0000_04B6 => Self::RpcFormat,
            0x0000_04B9 => Self::NullObject,
            0x0000_04D9 => Self::QuotaExceeded,
            0x0000_04DB => Self::MaxAttachmentExceeded,
            0x0000_04F7 => Self::NotExpanded,
            0x0000_04F8 => Self::NotCollapsed,
            0x0000_0503 => Self::DstNullObject,
            0x0000_0504 => Self::MsgCycle,
            0x0000_0505 => Self::TooManyRecips,
            0x0000_07EE => Self::Rejected,
            0x0000_0A2E => Self::RpcInvalidHandle,
            0x0004_0380 => Self::WarnWithErrors,
            0x0004_0821 => Self::SyncClientChangeNewer,
            0x8003_0070 => Self::StreamSizeError,
            0x8004_0102 => Self::NotSupported,
            0x8004_0107 => Self::InvalidEntryId,
            0x8004_0108 => Self::InvalidObject,
            0x8004_0109 => Self::ObjectModified,
            0x8004_010A => Self::ObjectDeleted,
            0x8004_010E => Self::InsufficientResources,
            0x8004_010F => Self::NotFound,
            0x8004_0111 => Self::LoginFailure,
            0x8004_0114 => Self::UnableToAbort,
            0x8004_0115 => Self::Network,
            0x8004_0117 => Self::TooComplex,
            0x8004_0305 => Self::TooBig,
            0x8004_011A => Self::Computed,
            0x8004_011B => Self::CorruptData,
            0x8004_0402 => Self::TableEmpty,
            0x8004_0403 => Self::TableTooBig,
            0x8004_0405 => Self::InvalidBookmark,
            0x8004_0601 => Self::NotInQueue,
            0x8004_0604 => Self::DuplicateName,
            0x8004_0605 => Self::NotInitialized,
            0x8004_060B => Self::RootFolder,
            0x8004_0700 => Self::AmbiguousRecip,
            0x8004_0800 => Self::SyncObjectDeleted,
            0x8004_0801 => Self::SyncIgnore,
            0x8004_0802 => Self::SyncConflict,
            0x8004_0803 => Self::SyncNoParent,
            0x8004_0900 => Self::NpQuotaExceeded,
            0x8007_0005 => Self::AccessDenied,
            0x8007_000E => Self::OutOfMemory,
            0x8007_0057 => Self::InvalidParam,
            _ => Self::Error,
        }
    }
}

impl From<rusqlite::Error> for EcError {
    fn from(e: rusqlite::Error) -> Self {
        tracing::error!("sqlite: {e}");
        EcError::Error
    }
}

impl From<r2d2::Error> for EcError {
    fn from(e: r2d2::Error) -> Self {
        tracing::error!("connection pool: {e}");
        EcError::InsufficientResources
    }
}

impl From<std::io::Error> for EcError {
    fn from(e: std::io::Error) -> Self {
        tracing::error!("io: {e}");
        EcError::Network
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for e in [
            EcError::NotFound,
            EcError::AccessDenied,
            EcError::SyncConflict,
            EcError::DuplicateName,
            EcError::NpQuotaExceeded,
            EcError::RpcFormat,
        ] {
            assert_eq!(EcError::from_code(e.code()), e);
        }
    }

    #[test]
    fn unknown_code_collapses() {
        assert_eq!(EcError::from_code(0xDEAD_BEEF), EcError::Error);
        assert_eq!(EcError::from_code(EcError::Error.code()), EcError::Error);
    }
}
