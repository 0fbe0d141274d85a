//! The exmdb RPC: framing, the append-only call-id table, request and
//! response payloads, and the two endpoints (client pool, TCP server).
//!
//! Control-channel PDUs are `[u32 length][u8 call_id][payload]`; length
//! excludes itself. Responses are `[u8 code][u32 length][payload]` with
//! the length/payload present only on success. A zero-length PDU is a
//! keepalive ping, answered by a single success byte.

pub mod client;
pub mod notify;
pub mod request;
pub mod response;
pub mod server;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::types::{EcError, EcResult};

/// Idle timeout both endpoints agree on; the server closes idle control
/// connections after this, the client pings just before it.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

/// Hard cap on a single PDU.
pub const MAX_PDU_SIZE: u32 = 64 * 1024 * 1024;

/// The verb table. Opnums are wire contract and append-only; superseded
/// `*V1` slots are retained but answered with `bad_switch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallId {
    Connect = 0,
    ListenNotification = 1,
    PingStore = 2,
    GetAllNamedPropids = 3,
    GetNamedPropids = 4,
    GetNamedPropnames = 5,
    GetMappingGuid = 6,
    GetMappingReplid = 7,
    GetStoreAllProptags = 8,
    GetStoreProperties = 9,
    SetStoreProperties = 10,
    RemoveStoreProperties = 11,
    GetMboxPerm = 12,
    GetFolderByClassV1 = 13,
    SetFolderByClass = 14,
    GetFolderClassTable = 15,
    CheckFolderId = 16,
    QueryFolderMessages = 17,
    CheckFolderDeleted = 18,
    GetFolderByName = 19,
    CheckFolderPermission = 20,
    CreateFolderByProperties = 21,
    GetFolderAllProptags = 22,
    GetFolderProperties = 23,
    SetFolderProperties = 24,
    RemoveFolderProperties = 25,
    DeleteFolder = 26,
    EmptyFolderV1 = 27,
    CheckFolderCycle = 28,
    CopyFolderInternal = 29,
    GetSearchCriteria = 30,
    SetSearchCriteria = 31,
    MovecopyMessage = 32,
    MovecopyMessages = 33,
    MovecopyFolder = 34,
    DeleteMessages = 35,
    GetMessageBrief = 36,
    SumHierarchy = 37,
    LoadHierarchyTable = 38,
    SumContent = 39,
    LoadContentTable = 40,
    LoadPermTableV1 = 41,
    LoadRuleTable = 42,
    UnloadTable = 43,
    SumTable = 44,
    QueryTable = 45,
    MatchTable = 46,
    LocateTable = 47,
    ReadTableRow = 48,
    MarkTable = 49,
    GetTableAllProptags = 50,
    ExpandTable = 51,
    CollapseTable = 52,
    StoreTableState = 53,
    RestoreTableState = 54,
    CheckMessage = 55,
    CheckMessageDeleted = 56,
    LoadMessageInstance = 57,
    LoadEmbeddedInstance = 58,
    GetEmbeddedCn = 59,
    ReloadMessageInstance = 60,
    ClearMessageInstance = 61,
    ReadMessageInstance = 62,
    WriteMessageInstanceV1 = 63,
    LoadAttachmentInstance = 64,
    CreateAttachmentInstance = 65,
    ReadAttachmentInstance = 66,
    WriteAttachmentInstance = 67,
    DeleteMessageInstanceAttachment = 68,
    FlushInstanceV1 = 69,
    UnloadInstance = 70,
    GetInstanceAllProptags = 71,
    GetInstanceProperties = 72,
    SetInstanceProperties = 73,
    RemoveInstanceProperties = 74,
    CheckInstanceCycle = 75,
    EmptyMessageInstanceRcpts = 76,
    GetMessageInstanceRcptsNum = 77,
    GetMessageInstanceRcptsAllProptags = 78,
    GetMessageInstanceRcpts = 79,
    UpdateMessageInstanceRcpts = 80,
    EmptyMessageInstanceAttachments = 81,
    GetMessageInstanceAttachmentsNum = 82,
    GetMessageInstanceAttachmentTableAllProptags = 83,
    QueryMessageInstanceAttachmentTable = 84,
    SetMessageInstanceConflict = 85,
    GetMessageRcpts = 86,
    GetMessageProperties = 87,
    SetMessageProperties = 88,
    SetMessageReadState = 89,
    RemoveMessageProperties = 90,
    AllocateMessageId = 91,
    AllocateCn = 92,
    MarkModified = 93,
    GetMessageGroupId = 94,
    SetMessageGroupId = 95,
    SaveChangeIndices = 96,
    GetChangeIndices = 97,
    TryMarkSubmit = 98,
    ClearSubmit = 99,
    LinkMessage = 100,
    UnlinkMessage = 101,
    RuleNewMessage = 102,
    SetMessageTimer = 103,
    GetMessageTimer = 104,
    EmptyFolderPermission = 105,
    UpdateFolderPermission = 106,
    EmptyFolderRule = 107,
    UpdateFolderRule = 108,
    DeliverMessageV1 = 109,
    WriteMessage = 110,
    ReadMessage = 111,
    GetContentSync = 112,
    GetHierarchySync = 113,
    AllocateIds = 114,
    SubscribeNotification = 115,
    UnsubscribeNotification = 116,
    TransportNewMail = 117,
    ReloadContentTable = 118,
    CopyInstanceRcpts = 119,
    CopyInstanceAttachments = 120,
    CheckContactAddress = 121,
    GetPublicFolderUnreadCount = 122,
    Vacuum = 123,
    GetFolderByClass = 124,
    LoadPermissionTable = 125,
    WriteMessageInstance = 126,
    FlushInstance = 127,
    UnloadStore = 128,
    DeliverMessage = 129,
    NotifyNewMail = 130,
    StoreEidToUser = 131,
    EmptyFolder = 132,
    PurgeSoftdelete = 133,
    PurgeDatafiles = 134,
}

impl CallId {
    pub fn from_u8(v: u8) -> Option<Self> {
        use CallId as C;
        const TABLE: [CallId; 135] = [
            C::Connect,
            C::ListenNotification,
            C::PingStore,
            C::GetAllNamedPropids,
            C::GetNamedPropids,
            C::GetNamedPropnames,
            C::GetMappingGuid,
            C::GetMappingReplid,
            C::GetStoreAllProptags,
            C::GetStoreProperties,
            C::SetStoreProperties,
            C::RemoveStoreProperties,
            C::GetMboxPerm,
            C::GetFolderByClassV1,
            C::SetFolderByClass,
            C::GetFolderClassTable,
            C::CheckFolderId,
            C::QueryFolderMessages,
            C::CheckFolderDeleted,
            C::GetFolderByName,
            C::CheckFolderPermission,
            C::CreateFolderByProperties,
            C::GetFolderAllProptags,
            C::GetFolderProperties,
            C::SetFolderProperties,
            C::RemoveFolderProperties,
            C::DeleteFolder,
            C::EmptyFolderV1,
            C::CheckFolderCycle,
            C::CopyFolderInternal,
            C::GetSearchCriteria,
            C::SetSearchCriteria,
            C::MovecopyMessage,
            C::MovecopyMessages,
            C::MovecopyFolder,
            C::DeleteMessages,
            C::GetMessageBrief,
            C::SumHierarchy,
            C::LoadHierarchyTable,
            C::SumContent,
            C::LoadContentTable,
            C::LoadPermTableV1,
            C::LoadRuleTable,
            C::UnloadTable,
            C::SumTable,
            C::QueryTable,
            C::MatchTable,
            C::LocateTable,
            C::ReadTableRow,
            C::MarkTable,
            C::GetTableAllProptags,
            C::ExpandTable,
            C::CollapseTable,
            C::StoreTableState,
            C::RestoreTableState,
            C::CheckMessage,
            C::CheckMessageDeleted,
            C::LoadMessageInstance,
            C::LoadEmbeddedInstance,
            C::GetEmbeddedCn,
            C::ReloadMessageInstance,
            C::ClearMessageInstance,
            C::ReadMessageInstance,
            C::WriteMessageInstanceV1,
            C::LoadAttachmentInstance,
            C::CreateAttachmentInstance,
            C::ReadAttachmentInstance,
            C::WriteAttachmentInstance,
            C::DeleteMessageInstanceAttachment,
            C::FlushInstanceV1,
            C::UnloadInstance,
            C::GetInstanceAllProptags,
            C::GetInstanceProperties,
            C::SetInstanceProperties,
            C::RemoveInstanceProperties,
            C::CheckInstanceCycle,
            C::EmptyMessageInstanceRcpts,
            C::GetMessageInstanceRcptsNum,
            C::GetMessageInstanceRcptsAllProptags,
            C::GetMessageInstanceRcpts,
            C::UpdateMessageInstanceRcpts,
            C::EmptyMessageInstanceAttachments,
            C::GetMessageInstanceAttachmentsNum,
            C::GetMessageInstanceAttachmentTableAllProptags,
            C::QueryMessageInstanceAttachmentTable,
            C::SetMessageInstanceConflict,
            C::GetMessageRcpts,
            C::GetMessageProperties,
            C::SetMessageProperties,
            C::SetMessageReadState,
            C::RemoveMessageProperties,
            C::AllocateMessageId,
            C::AllocateCn,
            C::MarkModified,
            C::GetMessageGroupId,
            C::SetMessageGroupId,
            C::SaveChangeIndices,
            C::GetChangeIndices,
            C::TryMarkSubmit,
            C::ClearSubmit,
            C::LinkMessage,
            C::UnlinkMessage,
            C::RuleNewMessage,
            C::SetMessageTimer,
            C::GetMessageTimer,
            C::EmptyFolderPermission,
            C::UpdateFolderPermission,
            C::EmptyFolderRule,
            C::UpdateFolderRule,
            C::DeliverMessageV1,
            C::WriteMessage,
            C::ReadMessage,
            C::GetContentSync,
            C::GetHierarchySync,
            C::AllocateIds,
            C::SubscribeNotification,
            C::UnsubscribeNotification,
            C::TransportNewMail,
            C::ReloadContentTable,
            C::CopyInstanceRcpts,
            C::CopyInstanceAttachments,
            C::CheckContactAddress,
            C::GetPublicFolderUnreadCount,
            C::Vacuum,
            C::GetFolderByClass,
            C::LoadPermissionTable,
            C::WriteMessageInstance,
            C::FlushInstance,
            C::UnloadStore,
            C::DeliverMessage,
            C::NotifyNewMail,
            C::StoreEidToUser,
            C::EmptyFolder,
            C::PurgeSoftdelete,
            C::PurgeDatafiles,
        ];
        TABLE.get(usize::from(v)).copied()
    }
}

/// One-byte status codes of the response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Success = 0x00,
    AccessDeny = 0x01,
    MaxReached = 0x02,
    LackMemory = 0x03,
    MisconfigPrefix = 0x04,
    MisconfigMode = 0x05,
    ConnectIncomplete = 0x06,
    PullError = 0x07,
    DispatchError = 0x08,
    PushError = 0x09,
    BadSwitch = 0x0A,
    Invalid = 0xFF,
}

impl ResponseCode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x00 => Self::Success,
            0x01 => Self::AccessDeny,
            0x02 => Self::MaxReached,
            0x03 => Self::LackMemory,
            0x04 => Self::MisconfigPrefix,
            0x05 => Self::MisconfigMode,
            0x06 => Self::ConnectIncomplete,
            0x07 => Self::PullError,
            0x08 => Self::DispatchError,
            0x09 => Self::PushError,
            0x0A => Self::BadSwitch,
            _ => Self::Invalid,
        }
    }

    pub fn strerror(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::AccessDeny => "access denied",
            Self::MaxReached => "maximum connections reached in server",
            Self::LackMemory => "server out of memory",
            Self::MisconfigPrefix => "prefix not served by this server",
            Self::MisconfigMode => "prefix has type mismatch",
            Self::ConnectIncomplete => "no prior connect PDU on this socket",
            Self::PullError => "invalid request payload",
            Self::DispatchError => "dispatch error",
            Self::PushError => "response serialization error",
            Self::BadSwitch => "unknown or retired opnum",
            Self::Invalid => "invalid response code",
        }
    }
}

/// Write one `[len][payload]` frame.
pub fn write_frame(sock: &mut TcpStream, payload: &[u8]) -> EcResult<()> {
    let len = u32::try_from(payload.len()).map_err(|_| EcError::TooBig)?;
    sock.write_all(&len.to_le_bytes())?;
    sock.write_all(payload)?;
    sock.flush()?;
    Ok(())
}

/// Read one `[len][payload]` frame; a zero length yields an empty vec
/// (ping). `timeout` of `None` blocks indefinitely.
pub fn read_frame(sock: &mut TcpStream, timeout: Option<Duration>) -> EcResult<Vec<u8>> {
    sock.set_read_timeout(timeout)?;
    let mut len_buf = [0u8; 4];
    sock.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len == 0 {
        return Ok(Vec::new());
    }
    if len > MAX_PDU_SIZE {
        return Err(EcError::TooBig);
    }
    let mut buf = vec![0u8; len as usize];
    sock.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callid_round_trip() {
        assert_eq!(CallId::from_u8(0), Some(CallId::Connect));
        assert_eq!(CallId::from_u8(134), Some(CallId::PurgeDatafiles));
        assert_eq!(CallId::from_u8(135), None);
        assert_eq!(CallId::from_u8(CallId::GetContentSync as u8), Some(CallId::GetContentSync));
    }

    #[test]
    fn response_code_mapping() {
        assert_eq!(ResponseCode::from_u8(0), ResponseCode::Success);
        assert_eq!(ResponseCode::from_u8(0x0A), ResponseCode::BadSwitch);
        assert_eq!(ResponseCode::from_u8(0xEE), ResponseCode::Invalid);
    }
}
