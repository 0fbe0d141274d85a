//! Request payloads, one variant per verb.
//!
//! Every store verb travels as `[call_id][dir][payload]`; `connect` and
//! `listen_notification` have no directory. Payload field order below is
//! the wire contract shared with the server dispatcher.

use crate::codec::{ExtPull, ExtPush};
use crate::store::permissions::PermissionOp;
use crate::store::rules::{decode_actions, encode_actions, RuleOp};
use crate::store::sync::ContentSyncFlags;
use crate::store::{AttachmentContent, MessageContent};
use crate::types::propval::{PropList, PropName};
use crate::types::restriction::{Restriction, SortOrderSet};
use crate::types::{EcError, EcResult};

use super::CallId;

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub prefix: String,
    pub remote_id: String,
    pub b_private: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenRequest {
    pub remote_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Connect(ConnectRequest),
    ListenNotification(ListenRequest),
    Store { dir: String, body: StoreRequest },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreRequest {
    PingStore,
    GetAllNamedPropids,
    GetNamedPropids { create: bool, names: Vec<PropName> },
    GetNamedPropnames { propids: Vec<u16> },
    GetMappingGuid { replid: u16 },
    GetMappingReplid { guid: uuid::Uuid },
    GetStoreAllProptags,
    GetStoreProperties { proptags: Vec<u32> },
    SetStoreProperties { propvals: PropList },
    RemoveStoreProperties { proptags: Vec<u32> },
    GetMboxPerm { username: String },
    SetFolderByClass { folder_id: u64, str_class: String },
    GetFolderClassTable,
    CheckFolderId { folder_id: u64 },
    QueryFolderMessages { folder_id: u64 },
    CheckFolderDeleted { folder_id: u64 },
    GetFolderByName { parent_id: u64, str_name: String },
    CheckFolderPermission { folder_id: u64, username: String },
    CreateFolderByProperties {
        parent_id: u64,
        folder_type: u32,
        str_name: String,
        propvals: PropList,
        open_existing: bool,
    },
    GetFolderAllProptags { folder_id: u64 },
    GetFolderProperties { folder_id: u64, proptags: Vec<u32> },
    SetFolderProperties { folder_id: u64, propvals: PropList },
    RemoveFolderProperties { folder_id: u64, proptags: Vec<u32> },
    DeleteFolder { folder_id: u64, hard: bool },
    CheckFolderCycle { src_fid: u64, dst_fid: u64 },
    CopyFolderInternal { src_fid: u64, dst_fid: u64, include_subfolders: bool },
    GetSearchCriteria { folder_id: u64 },
    SetSearchCriteria {
        folder_id: u64,
        search_flags: u32,
        restriction: Option<Restriction>,
        folder_ids: Vec<u64>,
    },
    MovecopyMessage { message_id: u64, dst_fid: u64, dst_id: u64, b_move: bool },
    MovecopyMessages { src_fid: u64, dst_fid: u64, message_ids: Vec<u64>, b_move: bool },
    MovecopyFolder {
        src_fid: u64,
        dst_fid: u64,
        str_new: Option<String>,
        b_copy: bool,
    },
    DeleteMessages { folder_id: u64, message_ids: Vec<u64>, hard: bool },
    GetMessageBrief { message_id: u64 },
    SumHierarchy { folder_id: u64, recursive: bool },
    LoadHierarchyTable {
        folder_id: u64,
        username: Option<String>,
        table_flags: u32,
        restriction: Option<Restriction>,
    },
    SumContent { folder_id: u64, fai: bool, deleted: bool },
    LoadContentTable {
        folder_id: u64,
        username: Option<String>,
        table_flags: u32,
        restriction: Option<Restriction>,
        sorts: Option<SortOrderSet>,
    },
    LoadRuleTable { folder_id: u64, username: Option<String> },
    UnloadTable { table_id: u32 },
    SumTable { table_id: u32 },
    QueryTable { table_id: u32, proptags: Vec<u32>, start_pos: u32, row_needed: i32 },
    MatchTable {
        table_id: u32,
        forward: bool,
        start_pos: u32,
        restriction: Restriction,
        proptags: Vec<u32>,
    },
    LocateTable { table_id: u32, inst_id: u64, inst_num: u32 },
    ReadTableRow { table_id: u32, proptags: Vec<u32>, inst_id: u64, inst_num: u32 },
    MarkTable { table_id: u32, position: u32 },
    GetTableAllProptags { table_id: u32 },
    ExpandTable { table_id: u32, inst_id: u64 },
    CollapseTable { table_id: u32, inst_id: u64 },
    StoreTableState { table_id: u32, inst_id: u64, inst_num: u32 },
    RestoreTableState { table_id: u32, state_id: u32 },
    CheckMessage { folder_id: u64, message_id: u64 },
    CheckMessageDeleted { message_id: u64 },
    LoadMessageInstance { folder_id: u64, message_id: u64, b_new: bool, b_fai: bool },
    LoadEmbeddedInstance { attachment_instance: u32, b_new: bool },
    GetEmbeddedCn { instance_id: u32 },
    ReloadMessageInstance { instance_id: u32 },
    ClearMessageInstance { instance_id: u32 },
    ReadMessageInstance { instance_id: u32 },
    LoadAttachmentInstance { message_instance: u32, attachment_num: u32 },
    CreateAttachmentInstance { message_instance: u32 },
    ReadAttachmentInstance { instance_id: u32 },
    WriteAttachmentInstance { instance_id: u32, content: AttachmentContent, force: bool },
    DeleteMessageInstanceAttachment { message_instance: u32, attachment_num: u32 },
    UnloadInstance { instance_id: u32 },
    GetInstanceAllProptags { instance_id: u32 },
    GetInstanceProperties { instance_id: u32, proptags: Vec<u32> },
    SetInstanceProperties { instance_id: u32, propvals: PropList },
    RemoveInstanceProperties { instance_id: u32, proptags: Vec<u32> },
    CheckInstanceCycle { instance_id: u32, message_id: u64 },
    EmptyMessageInstanceRcpts { instance_id: u32 },
    GetMessageInstanceRcptsNum { instance_id: u32 },
    GetMessageInstanceRcptsAllProptags { instance_id: u32 },
    GetMessageInstanceRcpts { instance_id: u32, row_id: u32, need_count: u16 },
    UpdateMessageInstanceRcpts { instance_id: u32, rows: Vec<PropList> },
    EmptyMessageInstanceAttachments { instance_id: u32 },
    GetMessageInstanceAttachmentsNum { instance_id: u32 },
    GetMessageInstanceAttachmentTableAllProptags { instance_id: u32 },
    QueryMessageInstanceAttachmentTable {
        instance_id: u32,
        proptags: Vec<u32>,
        start_pos: u32,
        row_needed: i32,
    },
    SetMessageInstanceConflict { instance_id: u32, content: MessageContent },
    GetMessageRcpts { message_id: u64 },
    GetMessageProperties { message_id: u64, proptags: Vec<u32> },
    SetMessageProperties { message_id: u64, propvals: PropList },
    SetMessageReadState { username: String, message_id: u64, mark_as_read: bool },
    RemoveMessageProperties { message_id: u64, proptags: Vec<u32> },
    AllocateMessageId { folder_id: u64 },
    AllocateCn,
    MarkModified { message_id: u64 },
    GetMessageGroupId { message_id: u64 },
    SetMessageGroupId { message_id: u64, group_id: u32 },
    SaveChangeIndices {
        message_id: u64,
        cn: u64,
        indices: Vec<u32>,
        ungrouped_proptags: Vec<u32>,
    },
    GetChangeIndices { message_id: u64, cn: u64 },
    TryMarkSubmit { message_id: u64 },
    ClearSubmit { message_id: u64 },
    LinkMessage { folder_id: u64, message_id: u64 },
    UnlinkMessage { folder_id: u64, message_id: u64 },
    RuleNewMessage { username: String, folder_id: u64, message_id: u64 },
    SetMessageTimer { message_id: u64, timer_id: u32 },
    GetMessageTimer { message_id: u64 },
    EmptyFolderPermission { folder_id: u64 },
    UpdateFolderPermission { folder_id: u64, freebusy: bool, ops: Vec<PermissionOp> },
    EmptyFolderRule { folder_id: u64 },
    UpdateFolderRule { folder_id: u64, ops: Vec<RuleOp> },
    WriteMessage { folder_id: u64, content: MessageContent, fail_on_conflict: bool },
    ReadMessage { message_id: u64 },
    GetContentSync {
        folder_id: u64,
        username: Option<String>,
        given: Vec<u8>,
        seen: Vec<u8>,
        seen_fai: Vec<u8>,
        read: Vec<u8>,
        flags: ContentSyncFlags,
    },
    GetHierarchySync {
        folder_id: u64,
        username: Option<String>,
        given: Vec<u8>,
        seen: Vec<u8>,
    },
    AllocateIds { count: u32 },
    SubscribeNotification {
        remote_id: Option<String>,
        notification_type: u16,
        whole: bool,
        folder_id: u64,
        message_id: u64,
    },
    UnsubscribeNotification { sub_id: u32 },
    TransportNewMail {
        folder_id: u64,
        message_id: u64,
        message_flags: u32,
        str_class: String,
    },
    ReloadContentTable { table_id: u32 },
    CopyInstanceRcpts { src_instance: u32, dst_instance: u32 },
    CopyInstanceAttachments { src_instance: u32, dst_instance: u32 },
    CheckContactAddress { address: String },
    GetPublicFolderUnreadCount { username: String, folder_id: u64 },
    Vacuum,
    GetFolderByClass { str_class: String },
    LoadPermissionTable { folder_id: u64, table_flags: u32 },
    WriteMessageInstance { instance_id: u32, content: MessageContent, force: bool },
    FlushInstance { instance_id: u32 },
    UnloadStore,
    DeliverMessage { from_address: String, account: String, raw: Vec<u8> },
    NotifyNewMail { folder_id: u64, message_id: u64 },
    StoreEidToUser { eid: u64 },
    EmptyFolder { folder_id: u64, flags: u32 },
    PurgeSoftdelete { folder_id: u64, cutoff: i64 },
    PurgeDatafiles,
}

fn push_opt_str(push: &mut ExtPush, v: Option<&String>) {
    push.opt(v, |p, s| p.str(s));
}

fn pull_opt_str(pull: &mut ExtPull) -> EcResult<Option<String>> {
    pull.opt(|p| p.str())
}

fn push_opt_restriction(push: &mut ExtPush, v: Option<&Restriction>) {
    push.opt(v, |p, r| p.restriction(r));
}

fn pull_opt_restriction(pull: &mut ExtPull) -> EcResult<Option<Restriction>> {
    pull.opt(|p| p.restriction())
}

fn push_u64_list(push: &mut ExtPush, v: &[u64]) {
    push.u32(v.len() as u32);
    for x in v {
        push.u64(*x);
    }
}

fn pull_u64_list(pull: &mut ExtPull) -> EcResult<Vec<u64>> {
    let n = pull.u32()? as usize;
    (0..n).map(|_| pull.u64()).collect()
}

fn push_u32_list(push: &mut ExtPush, v: &[u32]) {
    push.u32(v.len() as u32);
    for x in v {
        push.u32(*x);
    }
}

fn pull_u32_list(pull: &mut ExtPull) -> EcResult<Vec<u32>> {
    let n = pull.u32()? as usize;
    (0..n).map(|_| pull.u32()).collect()
}

fn push_proplists(push: &mut ExtPush, v: &[PropList]) {
    push.u32(v.len() as u32);
    for list in v {
        push.proplist(list);
    }
}

fn pull_proplists(pull: &mut ExtPull) -> EcResult<Vec<PropList>> {
    let n = pull.u32()? as usize;
    (0..n).map(|_| pull.proplist()).collect()
}

fn push_permission_ops(push: &mut ExtPush, ops: &[PermissionOp]) {
    push.u16(ops.len() as u16);
    for op in ops {
        match op {
            PermissionOp::Add { username, rights } => {
                push.u8(0x01);
                push.str(username);
                push.u32(*rights);
            }
            PermissionOp::Modify { member_id, rights } => {
                push.u8(0x02);
                push.u64(*member_id);
                push.u32(*rights);
            }
            PermissionOp::Remove { member_id } => {
                push.u8(0x04);
                push.u64(*member_id);
            }
        }
    }
}

fn pull_permission_ops(pull: &mut ExtPull) -> EcResult<Vec<PermissionOp>> {
    let n = pull.u16()? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(match pull.u8()? {
            0x01 => PermissionOp::Add { username: pull.str()?, rights: pull.u32()? },
            0x02 => PermissionOp::Modify { member_id: pull.u64()?, rights: pull.u32()? },
            0x04 => PermissionOp::Remove { member_id: pull.u64()? },
            _ => return Err(EcError::RpcFormat),
        });
    }
    Ok(out)
}

fn push_rule_ops(push: &mut ExtPush, ops: &[RuleOp]) {
    push.u16(ops.len() as u16);
    for op in ops {
        match op {
            RuleOp::Add { name, provider, sequence, state, condition, actions } => {
                push.u8(0x01);
                push.str(name);
                push.str(provider);
                push.u32(*sequence);
                push.u32(*state);
                push_opt_restriction(push, condition.as_ref());
                push.bin(&encode_actions(actions));
            }
            RuleOp::Modify { rule_id, sequence, state, condition, actions } => {
                push.u8(0x02);
                push.u64(*rule_id);
                push.opt(sequence.as_ref(), |p, s| p.u32(*s));
                push.opt(state.as_ref(), |p, s| p.u32(*s));
                push_opt_restriction(push, condition.as_ref());
                push.opt(actions.as_ref(), |p, a| p.bin(&encode_actions(a)));
            }
            RuleOp::Remove { rule_id } => {
                push.u8(0x04);
                push.u64(*rule_id);
            }
        }
    }
}

fn pull_rule_ops(pull: &mut ExtPull) -> EcResult<Vec<RuleOp>> {
    let n = pull.u16()? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(match pull.u8()? {
            0x01 => RuleOp::Add {
                name: pull.str()?,
                provider: pull.str()?,
                sequence: pull.u32()?,
                state: pull.u32()?,
                condition: pull_opt_restriction(pull)?,
                actions: decode_actions(&pull.bin()?)?,
            },
            0x02 => RuleOp::Modify {
                rule_id: pull.u64()?,
                sequence: pull.opt(|p| p.u32())?,
                state: pull.opt(|p| p.u32())?,
                condition: pull_opt_restriction(pull)?,
                actions: match pull.opt(|p| p.bin())? {
                    Some(blob) => Some(decode_actions(&blob)?),
                    None => None,
                },
            },
            0x04 => RuleOp::Remove { rule_id: pull.u64()? },
            _ => return Err(EcError::RpcFormat),
        });
    }
    Ok(out)
}

fn push_sync_flags(push: &mut ExtPush, flags: &ContentSyncFlags) {
    push.bool(flags.normal);
    push.bool(flags.fai);
    push.bool(flags.read_state);
}

fn pull_sync_flags(pull: &mut ExtPull) -> EcResult<ContentSyncFlags> {
    Ok(ContentSyncFlags {
        normal: pull.bool()?,
        fai: pull.bool()?,
        read_state: pull.bool()?,
    })
}

impl StoreRequest {
    pub fn call_id(&self) -> CallId {
        use StoreRequest as R;
        match self {
            R::PingStore => CallId::PingStore,
            R::GetAllNamedPropids => CallId::GetAllNamedPropids,
            R::GetNamedPropids { .. } => CallId::GetNamedPropids,
            R::GetNamedPropnames { .. } => CallId::GetNamedPropnames,
            R::GetMappingGuid { .. } => CallId::GetMappingGuid,
            R::GetMappingReplid { .. } => CallId::GetMappingReplid,
            R::GetStoreAllProptags => CallId::GetStoreAllProptags,
            R::GetStoreProperties { .. } => CallId::GetStoreProperties,
            R::SetStoreProperties { .. } => CallId::SetStoreProperties,
            R::RemoveStoreProperties { .. } => CallId::RemoveStoreProperties,
            R::GetMboxPerm { .. } => CallId::GetMboxPerm,
            R::SetFolderByClass { .. } => CallId::SetFolderByClass,
            R::GetFolderClassTable => CallId::GetFolderClassTable,
            R::CheckFolderId { .. } => CallId::CheckFolderId,
            R::QueryFolderMessages { .. } => CallId::QueryFolderMessages,
            R::CheckFolderDeleted { .. } => CallId::CheckFolderDeleted,
            R::GetFolderByName { .. } => CallId::GetFolderByName,
            R::CheckFolderPermission { .. } => CallId::CheckFolderPermission,
            R::CreateFolderByProperties { .. } => CallId::CreateFolderByProperties,
            R::GetFolderAllProptags { .. } => CallId::GetFolderAllProptags,
            R::GetFolderProperties { .. } => CallId::GetFolderProperties,
            R::SetFolderProperties { .. } => CallId::SetFolderProperties,
            R::RemoveFolderProperties { .. } => CallId::RemoveFolderProperties,
            R::DeleteFolder { .. } => CallId::DeleteFolder,
            R::CheckFolderCycle { .. } => CallId::CheckFolderCycle,
            R::CopyFolderInternal { .. } => CallId::CopyFolderInternal,
            R::GetSearchCriteria { .. } => CallId::GetSearchCriteria,
            R::SetSearchCriteria { .. } => CallId::SetSearchCriteria,
            R::MovecopyMessage { .. } => CallId::MovecopyMessage,
            R::MovecopyMessages { .. } => CallId::MovecopyMessages,
            R::MovecopyFolder { .. } => CallId::MovecopyFolder,
            R::DeleteMessages { .. } => CallId::DeleteMessages,
            R::GetMessageBrief { .. } => CallId::GetMessageBrief,
            R::SumHierarchy { .. } => CallId::SumHierarchy,
            R::LoadHierarchyTable { .. } => CallId::LoadHierarchyTable,
            R::SumContent { .. } => CallId::SumContent,
            R::LoadContentTable { .. } => CallId::LoadContentTable,
            R::LoadRuleTable { .. } => CallId::LoadRuleTable,
            R::UnloadTable { .. } => CallId::UnloadTable,
            R::SumTable { .. } => CallId::SumTable,
            R::QueryTable { .. } => CallId::QueryTable,
            R::MatchTable { .. } => CallId::MatchTable,
            R::LocateTable { .. } => CallId::LocateTable,
            R::ReadTableRow { .. } => CallId::ReadTableRow,
            R::MarkTable { .. } => CallId::MarkTable,
            R::GetTableAllProptags { .. } => CallId::GetTableAllProptags,
            R::ExpandTable { .. } => CallId::ExpandTable,
            R::CollapseTable { .. } => CallId::CollapseTable,
            R::StoreTableState { .. } => CallId::StoreTableState,
            R::RestoreTableState { .. } => CallId::RestoreTableState,
            R::CheckMessage { .. } => CallId::CheckMessage,
            R::CheckMessageDeleted { .. } => CallId::CheckMessageDeleted,
            R::LoadMessageInstance { .. } => CallId::LoadMessageInstance,
            R::LoadEmbeddedInstance { .. } => CallId::LoadEmbeddedInstance,
            R::GetEmbeddedCn { .. } => CallId::GetEmbeddedCn,
            R::ReloadMessageInstance { .. } => CallId::ReloadMessageInstance,
            R::ClearMessageInstance { .. } => CallId::ClearMessageInstance,
            R::ReadMessageInstance { .. } => CallId::ReadMessageInstance,
            R::LoadAttachmentInstance { .. } => CallId::LoadAttachmentInstance,
            R::CreateAttachmentInstance { .. } => CallId::CreateAttachmentInstance,
            R::ReadAttachmentInstance { .. } => CallId::ReadAttachmentInstance,
            R::WriteAttachmentInstance { .. } => CallId::WriteAttachmentInstance,
            R::DeleteMessageInstanceAttachment { .. } => CallId::DeleteMessageInstanceAttachment,
            R::UnloadInstance { .. } => CallId::UnloadInstance,
            R::GetInstanceAllProptags { .. } => CallId::GetInstanceAllProptags,
            R::GetInstanceProperties { .. } => CallId::GetInstanceProperties,
            R::SetInstanceProperties { .. } => CallId::SetInstanceProperties,
            R::RemoveInstanceProperties { .. } => CallId::RemoveInstanceProperties,
            R::CheckInstanceCycle { .. } => CallId::CheckInstanceCycle,
            R::EmptyMessageInstanceRcpts { .. } => CallId::EmptyMessageInstanceRcpts,
            R::GetMessageInstanceRcptsNum { .. } => CallId::GetMessageInstanceRcptsNum,
            R::GetMessageInstanceRcptsAllProptags { .. } => {
                CallId::GetMessageInstanceRcptsAllProptags
            }
            R::GetMessageInstanceRcpts { .. } => CallId::GetMessageInstanceRcpts,
            R::UpdateMessageInstanceRcpts { .. } => CallId::UpdateMessageInstanceRcpts,
            R::EmptyMessageInstanceAttachments { .. } => CallId::EmptyMessageInstanceAttachments,
            R::GetMessageInstanceAttachmentsNum { .. } => {
                CallId::GetMessageInstanceAttachmentsNum
            }
            R::GetMessageInstanceAttachmentTableAllProptags { .. } => {
                CallId::GetMessageInstanceAttachmentTableAllProptags
            }
            R::QueryMessageInstanceAttachmentTable { .. } => {
                CallId::QueryMessageInstanceAttachmentTable
            }
            R::SetMessageInstanceConflict { .. } => CallId::SetMessageInstanceConflict,
            R::GetMessageRcpts { .. } => CallId::GetMessageRcpts,
            R::GetMessageProperties { .. } => CallId::GetMessageProperties,
            R::SetMessageProperties { .. } => CallId::SetMessageProperties,
            R::SetMessageReadState { .. } => CallId::SetMessageReadState,
            R::RemoveMessageProperties { .. } => CallId::RemoveMessageProperties,
            R::AllocateMessageId { .. } => CallId::AllocateMessageId,
            R::AllocateCn => CallId::AllocateCn,
            R::MarkModified { .. } => CallId::MarkModified,
            R::GetMessageGroupId { .. } => CallId::GetMessageGroupId,
            R::SetMessageGroupId { .. } => CallId::SetMessageGroupId,
            R::SaveChangeIndices { .. } => CallId::SaveChangeIndices,
            R::GetChangeIndices { .. } => CallId::GetChangeIndices,
            R::TryMarkSubmit { .. } => CallId::TryMarkSubmit,
            R::ClearSubmit { .. } => CallId::ClearSubmit,
            R::LinkMessage { .. } => CallId::LinkMessage,
            R::UnlinkMessage { .. } => CallId::UnlinkMessage,
            R::RuleNewMessage { .. } => CallId::RuleNewMessage,
            R::SetMessageTimer { .. } => CallId::SetMessageTimer,
            R::GetMessageTimer { .. } => CallId::GetMessageTimer,
            R::EmptyFolderPermission { .. } => CallId::EmptyFolderPermission,
            R::UpdateFolderPermission { .. } => CallId::UpdateFolderPermission,
            R::EmptyFolderRule { .. } => CallId::EmptyFolderRule,
            R::UpdateFolderRule { .. } => CallId::UpdateFolderRule,
            R::WriteMessage { .. } => CallId::WriteMessage,
            R::ReadMessage { .. } => CallId::ReadMessage,
            R::GetContentSync { .. } => CallId::GetContentSync,
            R::GetHierarchySync { .. } => CallId::GetHierarchySync,
            R::AllocateIds { .. } => CallId::AllocateIds,
            R::SubscribeNotification { .. } => CallId::SubscribeNotification,
            R::UnsubscribeNotification { .. } => CallId::UnsubscribeNotification,
            R::TransportNewMail { .. } => CallId::TransportNewMail,
            R::ReloadContentTable { .. } => CallId::ReloadContentTable,
            R::CopyInstanceRcpts { .. } => CallId::CopyInstanceRcpts,
            R::CopyInstanceAttachments { .. } => CallId::CopyInstanceAttachments,
            R::CheckContactAddress { .. } => CallId::CheckContactAddress,
            R::GetPublicFolderUnreadCount { .. } => CallId::GetPublicFolderUnreadCount,
            R::Vacuum => CallId::Vacuum,
            R::GetFolderByClass { .. } => CallId::GetFolderByClass,
            R::LoadPermissionTable { .. } => CallId::LoadPermissionTable,
            R::WriteMessageInstance { .. } => CallId::WriteMessageInstance,
            R::FlushInstance { .. } => CallId::FlushInstance,
            R::UnloadStore => CallId::UnloadStore,
            R::DeliverMessage { .. } => CallId::DeliverMessage,
            R::NotifyNewMail { .. } => CallId::NotifyNewMail,
            R::StoreEidToUser { .. } => CallId::StoreEidToUser,
            R::EmptyFolder { .. } => CallId::EmptyFolder,
            R::PurgeSoftdelete { .. } => CallId::PurgeSoftdelete,
            R::PurgeDatafiles => CallId::PurgeDatafiles,
        }
    }

    fn encode_payload(&self, push: &mut ExtPush) {
        use StoreRequest as R;
        match self {
            R::PingStore
            | R::GetAllNamedPropids
            | R::GetStoreAllProptags
            | R::GetFolderClassTable
            | R::AllocateCn
            | R::Vacuum
            | R::UnloadStore
            | R::PurgeDatafiles => {}
            R::GetNamedPropids { create, names } => {
                push.bool(*create);
                push.propnames(names);
            }
            R::GetNamedPropnames { propids } => {
                push.u16(propids.len() as u16);
                for id in propids {
                    push.u16(*id);
                }
            }
            R::GetMappingGuid { replid } => push.u16(*replid),
            R::GetMappingReplid { guid } => push.guid(*guid),
            R::GetStoreProperties { proptags } => push_u32_list(push, proptags),
            R::SetStoreProperties { propvals } => push.proplist(propvals),
            R::RemoveStoreProperties { proptags } => push_u32_list(push, proptags),
            R::GetMboxPerm { username } => push.str(username),
            R::SetFolderByClass { folder_id, str_class } => {
                push.u64(*folder_id);
                push.str(str_class);
            }
            R::CheckFolderId { folder_id }
            | R::QueryFolderMessages { folder_id }
            | R::CheckFolderDeleted { folder_id }
            | R::GetFolderAllProptags { folder_id }
            | R::GetSearchCriteria { folder_id }
            | R::EmptyFolderPermission { folder_id }
            | R::EmptyFolderRule { folder_id }
            | R::AllocateMessageId { folder_id } => push.u64(*folder_id),
            R::GetFolderByName { parent_id, str_name } => {
                push.u64(*parent_id);
                push.str(str_name);
            }
            R::CheckFolderPermission { folder_id, username } => {
                push.u64(*folder_id);
                push.str(username);
            }
            R::CreateFolderByProperties {
                parent_id,
                folder_type,
                str_name,
                propvals,
                open_existing,
            } => {
                push.u64(*parent_id);
                push.u32(*folder_type);
                push.str(str_name);
                push.proplist(propvals);
                push.bool(*open_existing);
            }
            R::GetFolderProperties { folder_id, proptags }
            | R::RemoveFolderProperties { folder_id, proptags } => {
                push.u64(*folder_id);
                push_u32_list(push, proptags);
            }
            R::SetFolderProperties { folder_id, propvals } => {
                push.u64(*folder_id);
                push.proplist(propvals);
            }
            R::DeleteFolder { folder_id, hard } => {
                push.u64(*folder_id);
                push.bool(*hard);
            }
            R::CheckFolderCycle { src_fid, dst_fid } => {
                push.u64(*src_fid);
                push.u64(*dst_fid);
            }
            R::CopyFolderInternal { src_fid, dst_fid, include_subfolders } => {
                push.u64(*src_fid);
                push.u64(*dst_fid);
                push.bool(*include_subfolders);
            }
            R::SetSearchCriteria { folder_id, search_flags, restriction, folder_ids } => {
                push.u64(*folder_id);
                push.u32(*search_flags);
                push_opt_restriction(push, restriction.as_ref());
                push_u64_list(push, folder_ids);
            }
            R::MovecopyMessage { message_id, dst_fid, dst_id, b_move } => {
                push.u64(*message_id);
                push.u64(*dst_fid);
                push.u64(*dst_id);
                push.bool(*b_move);
            }
            R::MovecopyMessages { src_fid, dst_fid, message_ids, b_move } => {
                push.u64(*src_fid);
                push.u64(*dst_fid);
                push_u64_list(push, message_ids);
                push.bool(*b_move);
            }
            R::MovecopyFolder { src_fid, dst_fid, str_new, b_copy } => {
                push.u64(*src_fid);
                push.u64(*dst_fid);
                push_opt_str(push, str_new.as_ref());
                push.bool(*b_copy);
            }
            R::DeleteMessages { folder_id, message_ids, hard } => {
                push.u64(*folder_id);
                push_u64_list(push, message_ids);
                push.bool(*hard);
            }
            R::GetMessageBrief { message_id }
            | R::CheckMessageDeleted { message_id }
            | R::GetMessageRcpts { message_id }
            | R::MarkModified { message_id }
            | R::GetMessageGroupId { message_id }
            | R::TryMarkSubmit { message_id }
            | R::ClearSubmit { message_id }
            | R::GetMessageTimer { message_id }
            | R::ReadMessage { message_id } => push.u64(*message_id),
            R::SumHierarchy { folder_id, recursive } => {
                push.u64(*folder_id);
                push.bool(*recursive);
            }
            R::LoadHierarchyTable { folder_id, username, table_flags, restriction } => {
                push.u64(*folder_id);
                push_opt_str(push, username.as_ref());
                push.u32(*table_flags);
                push_opt_restriction(push, restriction.as_ref());
            }
            R::SumContent { folder_id, fai, deleted } => {
                push.u64(*folder_id);
                push.bool(*fai);
                push.bool(*deleted);
            }
            R::LoadContentTable { folder_id, username, table_flags, restriction, sorts } => {
                push.u64(*folder_id);
                push_opt_str(push, username.as_ref());
                push.u32(*table_flags);
                push_opt_restriction(push, restriction.as_ref());
                push.opt(sorts.as_ref(), |p, s| p.sort_order_set(s));
            }
            R::LoadRuleTable { folder_id, username } => {
                push.u64(*folder_id);
                push_opt_str(push, username.as_ref());
            }
            R::UnloadTable { table_id }
            | R::SumTable { table_id }
            | R::GetTableAllProptags { table_id }
            | R::ReloadContentTable { table_id } => push.u32(*table_id),
            R::QueryTable { table_id, proptags, start_pos, row_needed } => {
                push.u32(*table_id);
                push_u32_list(push, proptags);
                push.u32(*start_pos);
                push.u32(*row_needed as u32);
            }
            R::MatchTable { table_id, forward, start_pos, restriction, proptags } => {
                push.u32(*table_id);
                push.bool(*forward);
                push.u32(*start_pos);
                push.restriction(restriction);
                push_u32_list(push, proptags);
            }
            R::LocateTable { table_id, inst_id, inst_num } => {
                push.u32(*table_id);
                push.u64(*inst_id);
                push.u32(*inst_num);
            }
            R::ReadTableRow { table_id, proptags, inst_id, inst_num } => {
                push.u32(*table_id);
                push_u32_list(push, proptags);
                push.u64(*inst_id);
                push.u32(*inst_num);
            }
            R::MarkTable { table_id, position } => {
                push.u32(*table_id);
                push.u32(*position);
            }
            R::ExpandTable { table_id, inst_id } | R::CollapseTable { table_id, inst_id } => {
                push.u32(*table_id);
                push.u64(*inst_id);
            }
            R::StoreTableState { table_id, inst_id, inst_num } => {
                push.u32(*table_id);
                push.u64(*inst_id);
                push.u32(*inst_num);
            }
            R::RestoreTableState { table_id, state_id } => {
                push.u32(*table_id);
                push.u32(*state_id);
            }
            R::CheckMessage { folder_id, message_id }
            | R::LinkMessage { folder_id, message_id }
            | R::UnlinkMessage { folder_id, message_id }
            | R::NotifyNewMail { folder_id, message_id } => {
                push.u64(*folder_id);
                push.u64(*message_id);
            }
            R::LoadMessageInstance { folder_id, message_id, b_new, b_fai } => {
                push.u64(*folder_id);
                push.u64(*message_id);
                push.bool(*b_new);
                push.bool(*b_fai);
            }
            R::LoadEmbeddedInstance { attachment_instance, b_new } => {
                push.u32(*attachment_instance);
                push.bool(*b_new);
            }
            R::GetEmbeddedCn { instance_id }
            | R::ReloadMessageInstance { instance_id }
            | R::ClearMessageInstance { instance_id }
            | R::ReadMessageInstance { instance_id }
            | R::ReadAttachmentInstance { instance_id }
            | R::UnloadInstance { instance_id }
            | R::GetInstanceAllProptags { instance_id }
            | R::EmptyMessageInstanceRcpts { instance_id }
            | R::GetMessageInstanceRcptsNum { instance_id }
            | R::GetMessageInstanceRcptsAllProptags { instance_id }
            | R::EmptyMessageInstanceAttachments { instance_id }
            | R::GetMessageInstanceAttachmentsNum { instance_id }
            | R::GetMessageInstanceAttachmentTableAllProptags { instance_id }
            | R::FlushInstance { instance_id } => push.u32(*instance_id),
            R::LoadAttachmentInstance { message_instance, attachment_num }
            | R::DeleteMessageInstanceAttachment { message_instance, attachment_num } => {
                push.u32(*message_instance);
                push.u32(*attachment_num);
            }
            R::CreateAttachmentInstance { message_instance } => push.u32(*message_instance),
            R::WriteAttachmentInstance { instance_id, content, force } => {
                push.u32(*instance_id);
                content.encode(push);
                push.bool(*force);
            }
            R::GetInstanceProperties { instance_id, proptags }
            | R::RemoveInstanceProperties { instance_id, proptags } => {
                push.u32(*instance_id);
                push_u32_list(push, proptags);
            }
            R::SetInstanceProperties { instance_id, propvals } => {
                push.u32(*instance_id);
                push.proplist(propvals);
            }
            R::CheckInstanceCycle { instance_id, message_id } => {
                push.u32(*instance_id);
                push.u64(*message_id);
            }
            R::GetMessageInstanceRcpts { instance_id, row_id, need_count } => {
                push.u32(*instance_id);
                push.u32(*row_id);
                push.u16(*need_count);
            }
            R::UpdateMessageInstanceRcpts { instance_id, rows } => {
                push.u32(*instance_id);
                push_proplists(push, rows);
            }
            R::QueryMessageInstanceAttachmentTable {
                instance_id,
                proptags,
                start_pos,
                row_needed,
            } => {
                push.u32(*instance_id);
                push_u32_list(push, proptags);
                push.u32(*start_pos);
                push.u32(*row_needed as u32);
            }
            R::SetMessageInstanceConflict { instance_id, content } => {
                push.u32(*instance_id);
                content.encode(push);
            }
            R::GetMessageProperties { message_id, proptags }
            | R::RemoveMessageProperties { message_id, proptags } => {
                push.u64(*message_id);
                push_u32_list(push, proptags);
            }
            R::SetMessageProperties { message_id, propvals } => {
                push.u64(*message_id);
                push.proplist(propvals);
            }
            R::SetMessageReadState { username, message_id, mark_as_read } => {
                push.str(username);
                push.u64(*message_id);
                push.bool(*mark_as_read);
            }
            R::SetMessageGroupId { message_id, group_id } => {
                push.u64(*message_id);
                push.u32(*group_id);
            }
            R::SaveChangeIndices { message_id, cn, indices, ungrouped_proptags } => {
                push.u64(*message_id);
                push.u64(*cn);
                push_u32_list(push, indices);
                push_u32_list(push, ungrouped_proptags);
            }
            R::GetChangeIndices { message_id, cn } => {
                push.u64(*message_id);
                push.u64(*cn);
            }
            R::RuleNewMessage { username, folder_id, message_id } => {
                push.str(username);
                push.u64(*folder_id);
                push.u64(*message_id);
            }
            R::SetMessageTimer { message_id, timer_id } => {
                push.u64(*message_id);
                push.u32(*timer_id);
            }
            R::UpdateFolderPermission { folder_id, freebusy, ops } => {
                push.u64(*folder_id);
                push.bool(*freebusy);
                push_permission_ops(push, ops);
            }
            R::UpdateFolderRule { folder_id, ops } => {
                push.u64(*folder_id);
                push_rule_ops(push, ops);
            }
            R::WriteMessage { folder_id, content, fail_on_conflict } => {
                push.u64(*folder_id);
                content.encode(push);
                push.bool(*fail_on_conflict);
            }
            R::GetContentSync { folder_id, username, given, seen, seen_fai, read, flags } => {
                push.u64(*folder_id);
                push_opt_str(push, username.as_ref());
                push.bin(given);
                push.bin(seen);
                push.bin(seen_fai);
                push.bin(read);
                push_sync_flags(push, flags);
            }
            R::GetHierarchySync { folder_id, username, given, seen } => {
                push.u64(*folder_id);
                push_opt_str(push, username.as_ref());
                push.bin(given);
                push.bin(seen);
            }
            R::AllocateIds { count } => push.u32(*count),
            R::SubscribeNotification {
                remote_id,
                notification_type,
                whole,
                folder_id,
                message_id,
            } => {
                push_opt_str(push, remote_id.as_ref());
                push.u16(*notification_type);
                push.bool(*whole);
                push.u64(*folder_id);
                push.u64(*message_id);
            }
            R::UnsubscribeNotification { sub_id } => push.u32(*sub_id),
            R::TransportNewMail { folder_id, message_id, message_flags, str_class } => {
                push.u64(*folder_id);
                push.u64(*message_id);
                push.u32(*message_flags);
                push.str(str_class);
            }
            R::CopyInstanceRcpts { src_instance, dst_instance }
            | R::CopyInstanceAttachments { src_instance, dst_instance } => {
                push.u32(*src_instance);
                push.u32(*dst_instance);
            }
            R::CheckContactAddress { address } => push.str(address),
            R::GetPublicFolderUnreadCount { username, folder_id } => {
                push.str(username);
                push.u64(*folder_id);
            }
            R::GetFolderByClass { str_class } => push.str(str_class),
            R::LoadPermissionTable { folder_id, table_flags } => {
                push.u64(*folder_id);
                push.u32(*table_flags);
            }
            R::WriteMessageInstance { instance_id, content, force } => {
                push.u32(*instance_id);
                content.encode(push);
                push.bool(*force);
            }
            R::DeliverMessage { from_address, account, raw } => {
                push.str(from_address);
                push.str(account);
                push.bin(raw);
            }
            R::StoreEidToUser { eid } => push.u64(*eid),
            R::EmptyFolder { folder_id, flags } => {
                push.u64(*folder_id);
                push.u32(*flags);
            }
            R::PurgeSoftdelete { folder_id, cutoff } => {
                push.u64(*folder_id);
                push.u64(*cutoff as u64);
            }
        }
    }

    pub fn decode_payload(call_id: CallId, pull: &mut ExtPull) -> EcResult<Self> {
        use StoreRequest as R;
        Ok(match call_id {
            CallId::PingStore => R::PingStore,
            CallId::GetAllNamedPropids => R::GetAllNamedPropids,
            CallId::GetNamedPropids => {
                R::GetNamedPropids { create: pull.bool()?, names: pull.propnames()? }
            }
            CallId::GetNamedPropnames => {
                let n = pull.u16()? as usize;
                let propids = (0..n).map(|_| pull.u16()).collect::<EcResult<_>>()?;
                R::GetNamedPropnames { propids }
            }
            CallId::GetMappingGuid => R::GetMappingGuid { replid: pull.u16()? },
            CallId::GetMappingReplid => R::GetMappingReplid { guid: pull.guid()? },
            CallId::GetStoreAllProptags => R::GetStoreAllProptags,
            CallId::GetStoreProperties => {
                R::GetStoreProperties { proptags: pull_u32_list(pull)? }
            }
            CallId::SetStoreProperties => R::SetStoreProperties { propvals: pull.proplist()? },
            CallId::RemoveStoreProperties => {
                R::RemoveStoreProperties { proptags: pull_u32_list(pull)? }
            }
            CallId::GetMboxPerm => R::GetMboxPerm { username: pull.str()? },
            CallId::SetFolderByClass => {
                R::SetFolderByClass { folder_id: pull.u64()?, str_class: pull.str()? }
            }
            CallId::GetFolderClassTable => R::GetFolderClassTable,
            CallId::CheckFolderId => R::CheckFolderId { folder_id: pull.u64()? },
            CallId::QueryFolderMessages => R::QueryFolderMessages { folder_id: pull.u64()? },
            CallId::CheckFolderDeleted => R::CheckFolderDeleted { folder_id: pull.u64()? },
            CallId::GetFolderByName => {
                R::GetFolderByName { parent_id: pull.u64()?, str_name: pull.str()? }
            }
            CallId::CheckFolderPermission => {
                R::CheckFolderPermission { folder_id: pull.u64()?, username: pull.str()? }
            }
            CallId::CreateFolderByProperties => R::CreateFolderByProperties {
                parent_id: pull.u64()?,
                folder_type: pull.u32()?,
                str_name: pull.str()?,
                propvals: pull.proplist()?,
                open_existing: pull.bool()?,
            },
            CallId::GetFolderAllProptags => R::GetFolderAllProptags { folder_id: pull.u64()? },
            CallId::GetFolderProperties => R::GetFolderProperties {
                folder_id: pull.u64()?,
                proptags: pull_u32_list(pull)?,
            },
            CallId::SetFolderProperties => R::SetFolderProperties {
                folder_id: pull.u64()?,
                propvals: pull.proplist()?,
            },
            CallId::RemoveFolderProperties => R::RemoveFolderProperties {
                folder_id: pull.u64()?,
                proptags: pull_u32_list(pull)?,
            },
            CallId::DeleteFolder => {
                R::DeleteFolder { folder_id: pull.u64()?, hard: pull.bool()? }
            }
            CallId::CheckFolderCycle => {
                R::CheckFolderCycle { src_fid: pull.u64()?, dst_fid: pull.u64()? }
            }
            CallId::CopyFolderInternal => R::CopyFolderInternal {
                src_fid: pull.u64()?,
                dst_fid: pull.u64()?,
                include_subfolders: pull.bool()?,
            },
            CallId::GetSearchCriteria => R::GetSearchCriteria { folder_id: pull.u64()? },
            CallId::SetSearchCriteria => R::SetSearchCriteria {
                folder_id: pull.u64()?,
                search_flags: pull.u32()?,
                restriction: pull_opt_restriction(pull)?,
                folder_ids: pull_u64_list(pull)?,
            },
            CallId::MovecopyMessage => R::MovecopyMessage {
                message_id: pull.u64()?,
                dst_fid: pull.u64()?,
                dst_id: pull.u64()?,
                b_move: pull.bool()?,
            },
            CallId::MovecopyMessages => R::MovecopyMessages {
                src_fid: pull.u64()?,
                dst_fid: pull.u64()?,
                message_ids: pull_u64_list(pull)?,
                b_move: pull.bool()?,
            },
            CallId::MovecopyFolder => R::MovecopyFolder {
                src_fid: pull.u64()?,
                dst_fid: pull.u64()?,
                str_new: pull_opt_str(pull)?,
                b_copy: pull.bool()?,
            },
            CallId::DeleteMessages => R::DeleteMessages {
                folder_id: pull.u64()?,
                message_ids: pull_u64_list(pull)?,
                hard: pull.bool()?,
            },
            CallId::GetMessageBrief => R::GetMessageBrief { message_id: pull.u64()? },
            CallId::SumHierarchy => {
                R::SumHierarchy { folder_id: pull.u64()?, recursive: pull.bool()? }
            }
            CallId::LoadHierarchyTable => R::LoadHierarchyTable {
                folder_id: pull.u64()?,
                username: pull_opt_str(pull)?,
                table_flags: pull.u32()?,
                restriction: pull_opt_restriction(pull)?,
            },
            CallId::SumContent => R::SumContent {
                folder_id: pull.u64()?,
                fai: pull.bool()?,
                deleted: pull.bool()?,
            },
            CallId::LoadContentTable => R::LoadContentTable {
                folder_id: pull.u64()?,
                username: pull_opt_str(pull)?,
                table_flags: pull.u32()?,
                restriction: pull_opt_restriction(pull)?,
                sorts: pull.opt(|p| p.sort_order_set())?,
            },
            CallId::LoadRuleTable => R::LoadRuleTable {
                folder_id: pull.u64()?,
                username: pull_opt_str(pull)?,
            },
            CallId::UnloadTable => R::UnloadTable { table_id: pull.u32()? },
            CallId::SumTable => R::SumTable { table_id: pull.u32()? },
            CallId::QueryTable => R::QueryTable {
                table_id: pull.u32()?,
                proptags: pull_u32_list(pull)?,
                start_pos: pull.u32()?,
                row_needed: pull.u32()? as i32,
            },
            CallId::MatchTable => R::MatchTable {
                table_id: pull.u32()?,
                forward: pull.bool()?,
                start_pos: pull.u32()?,
                restriction: pull.restriction()?,
                proptags: pull_u32_list(pull)?,
            },
            CallId::LocateTable => R::LocateTable {
                table_id: pull.u32()?,
                inst_id: pull.u64()?,
                inst_num: pull.u32()?,
            },
            CallId::ReadTableRow => R::ReadTableRow {
                table_id: pull.u32()?,
                proptags: pull_u32_list(pull)?,
                inst_id: pull.u64()?,
                inst_num: pull.u32()?,
            },
            CallId::MarkTable => {
                R::MarkTable { table_id: pull.u32()?, position: pull.u32()? }
            }
            CallId::GetTableAllProptags => R::GetTableAllProptags { table_id: pull.u32()? },
            CallId::ExpandTable => {
                R::ExpandTable { table_id: pull.u32()?, inst_id: pull.u64()? }
            }
            CallId::CollapseTable => {
                R::CollapseTable { table_id: pull.u32()?, inst_id: pull.u64()? }
            }
            CallId::StoreTableState => R::StoreTableState {
                table_id: pull.u32()?,
                inst_id: pull.u64()?,
                inst_num: pull.u32()?,
            },
            CallId::RestoreTableState => R::RestoreTableState {
                table_id: pull.u32()?,
                state_id: pull.u32()?,
            },
            CallId::CheckMessage => {
                R::CheckMessage { folder_id: pull.u64()?, message_id: pull.u64()? }
            }
            CallId::CheckMessageDeleted => R::CheckMessageDeleted { message_id: pull.u64()? },
            CallId::LoadMessageInstance => R::LoadMessageInstance {
                folder_id: pull.u64()?,
                message_id: pull.u64()?,
                b_new: pull.bool()?,
                b_fai: pull.bool()?,
            },
            CallId::LoadEmbeddedInstance => R::LoadEmbeddedInstance {
                attachment_instance: pull.u32()?,
                b_new: pull.bool()?,
            },
            CallId::GetEmbeddedCn => R::GetEmbeddedCn { instance_id: pull.u32()? },
            CallId::ReloadMessageInstance => {
                R::ReloadMessageInstance { instance_id: pull.u32()? }
            }
            CallId::ClearMessageInstance => {
                R::ClearMessageInstance { instance_id: pull.u32()? }
            }
            CallId::ReadMessageInstance => R::ReadMessageInstance { instance_id: pull.u32()? },
            CallId::LoadAttachmentInstance => R::LoadAttachmentInstance {
                message_instance: pull.u32()?,
                attachment_num: pull.u32()?,
            },
            CallId::CreateAttachmentInstance => {
                R::CreateAttachmentInstance { message_instance: pull.u32()? }
            }
            CallId::ReadAttachmentInstance => {
                R::ReadAttachmentInstance { instance_id: pull.u32()? }
            }
            CallId::WriteAttachmentInstance => R::WriteAttachmentInstance {
                instance_id: pull.u32()?,
                content: AttachmentContent::decode(pull)?,
                force: pull.bool()?,
            },
            CallId::DeleteMessageInstanceAttachment => R::DeleteMessageInstanceAttachment {
                message_instance: pull.u32()?,
                attachment_num: pull.u32()?,
            },
            CallId::UnloadInstance => R::UnloadInstance { instance_id: pull.u32()? },
            CallId::GetInstanceAllProptags => {
                R::GetInstanceAllProptags { instance_id: pull.u32()? }
            }
            CallId::GetInstanceProperties => R::GetInstanceProperties {
                instance_id: pull.u32()?,
                proptags: pull_u32_list(pull)?,
            },
            CallId::SetInstanceProperties => R::SetInstanceProperties {
                instance_id: pull.u32()?,
                propvals: pull.proplist()?,
            },
            CallId::RemoveInstanceProperties => R::RemoveInstanceProperties {
                instance_id: pull.u32()?,
                proptags: pull_u32_list(pull)?,
            },
            CallId::CheckInstanceCycle => R::CheckInstanceCycle {
                instance_id: pull.u32()?,
                message_id: pull.u64()?,
            },
            CallId::EmptyMessageInstanceRcpts => {
                R::EmptyMessageInstanceRcpts { instance_id: pull.u32()? }
            }
            CallId::GetMessageInstanceRcptsNum => {
                R::GetMessageInstanceRcptsNum { instance_id: pull.u32()? }
            }
            CallId::GetMessageInstanceRcptsAllProptags => {
                R::GetMessageInstanceRcptsAllProptags { instance_id: pull.u32()? }
            }
            CallId::GetMessageInstanceRcpts => R::GetMessageInstanceRcpts {
                instance_id: pull.u32()?,
                row_id: pull.u32()?,
                need_count: pull.u16()?,
            },
            CallId::UpdateMessageInstanceRcpts => R::UpdateMessageInstanceRcpts {
                instance_id: pull.u32()?,
                rows: pull_proplists(pull)?,
            },
            CallId::EmptyMessageInstanceAttachments => {
                R::EmptyMessageInstanceAttachments { instance_id: pull.u32()? }
            }
            CallId::GetMessageInstanceAttachmentsNum => {
                R::GetMessageInstanceAttachmentsNum { instance_id: pull.u32()? }
            }
            CallId::GetMessageInstanceAttachmentTableAllProptags => {
                R::GetMessageInstanceAttachmentTableAllProptags { instance_id: pull.u32()? }
            }
            CallId::QueryMessageInstanceAttachmentTable => {
                R::QueryMessageInstanceAttachmentTable {
                    instance_id: pull.u32()?,
                    proptags: pull_u32_list(pull)?,
                    start_pos: pull.u32()?,
                    row_needed: pull.u32()? as i32,
                }
            }
            CallId::SetMessageInstanceConflict => R::SetMessageInstanceConflict {
                instance_id: pull.u32()?,
                content: MessageContent::decode(pull)?,
            },
            CallId::GetMessageRcpts => R::GetMessageRcpts { message_id: pull.u64()? },
            CallId::GetMessageProperties => R::GetMessageProperties {
                message_id: pull.u64()?,
                proptags: pull_u32_list(pull)?,
            },
            CallId::SetMessageProperties => R::SetMessageProperties {
                message_id: pull.u64()?,
                propvals: pull.proplist()?,
            },
            CallId::SetMessageReadState => R::SetMessageReadState {
                username: pull.str()?,
                message_id: pull.u64()?,
                mark_as_read: pull.bool()?,
            },
            CallId::RemoveMessageProperties => R::RemoveMessageProperties {
                message_id: pull.u64()?,
                proptags: pull_u32_list(pull)?,
            },
            CallId::AllocateMessageId => R::AllocateMessageId { folder_id: pull.u64()? },
            CallId::AllocateCn => R::AllocateCn,
            CallId::MarkModified => R::MarkModified { message_id: pull.u64()? },
            CallId::GetMessageGroupId => R::GetMessageGroupId { message_id: pull.u64()? },
            CallId::SetMessageGroupId => R::SetMessageGroupId {
                message_id: pull.u64()?,
                group_id: pull.u32()?,
            },
            CallId::SaveChangeIndices => R::SaveChangeIndices {
                message_id: pull.u64()?,
                cn: pull.u64()?,
                indices: pull_u32_list(pull)?,
                ungrouped_proptags: pull_u32_list(pull)?,
            },
            CallId::GetChangeIndices => {
                R::GetChangeIndices { message_id: pull.u64()?, cn: pull.u64()? }
            }
            CallId::TryMarkSubmit => R::TryMarkSubmit { message_id: pull.u64()? },
            CallId::ClearSubmit => R::ClearSubmit { message_id: pull.u64()? },
            CallId::LinkMessage => {
                R::LinkMessage { folder_id: pull.u64()?, message_id: pull.u64()? }
            }
            CallId::UnlinkMessage => {
                R::UnlinkMessage { folder_id: pull.u64()?, message_id: pull.u64()? }
            }
            CallId::RuleNewMessage => R::RuleNewMessage {
                username: pull.str()?,
                folder_id: pull.u64()?,
                message_id: pull.u64()?,
            },
            CallId::SetMessageTimer => {
                R::SetMessageTimer { message_id: pull.u64()?, timer_id: pull.u32()? }
            }
            CallId::GetMessageTimer => R::GetMessageTimer { message_id: pull.u64()? },
            CallId::EmptyFolderPermission => {
                R::EmptyFolderPermission { folder_id: pull.u64()? }
            }
            CallId::UpdateFolderPermission => R::UpdateFolderPermission {
                folder_id: pull.u64()?,
                freebusy: pull.bool()?,
                ops: pull_permission_ops(pull)?,
            },
            CallId::EmptyFolderRule => R::EmptyFolderRule { folder_id: pull.u64()? },
            CallId::UpdateFolderRule => R::UpdateFolderRule {
                folder_id: pull.u64()?,
                ops: pull_rule_ops(pull)?,
            },
            CallId::WriteMessage => R::WriteMessage {
                folder_id: pull.u64()?,
                content: MessageContent::decode(pull)?,
                fail_on_conflict: pull.bool()?,
            },
            CallId::ReadMessage => R::ReadMessage { message_id: pull.u64()? },
            CallId::GetContentSync => R::GetContentSync {
                folder_id: pull.u64()?,
                username: pull_opt_str(pull)?,
                given: pull.bin()?,
                seen: pull.bin()?,
                seen_fai: pull.bin()?,
                read: pull.bin()?,
                flags: pull_sync_flags(pull)?,
            },
            CallId::GetHierarchySync => R::GetHierarchySync {
                folder_id: pull.u64()?,
                username: pull_opt_str(pull)?,
                given: pull.bin()?,
                seen: pull.bin()?,
            },
            CallId::AllocateIds => R::AllocateIds { count: pull.u32()? },
            CallId::SubscribeNotification => R::SubscribeNotification {
                remote_id: pull_opt_str(pull)?,
                notification_type: pull.u16()?,
                whole: pull.bool()?,
                folder_id: pull.u64()?,
                message_id: pull.u64()?,
            },
            CallId::UnsubscribeNotification => {
                R::UnsubscribeNotification { sub_id: pull.u32()? }
            }
            CallId::TransportNewMail => R::TransportNewMail {
                folder_id: pull.u64()?,
                message_id: pull.u64()?,
                message_flags: pull.u32()?,
                str_class: pull.str()?,
            },
            CallId::ReloadContentTable => R::ReloadContentTable { table_id: pull.u32()? },
            CallId::CopyInstanceRcpts => R::CopyInstanceRcpts {
                src_instance: pull.u32()?,
                dst_instance: pull.u32()?,
            },
            CallId::CopyInstanceAttachments => R::CopyInstanceAttachments {
                src_instance: pull.u32()?,
                dst_instance: pull.u32()?,
            },
            CallId::CheckContactAddress => R::CheckContactAddress { address: pull.str()? },
            CallId::GetPublicFolderUnreadCount => R::GetPublicFolderUnreadCount {
                username: pull.str()?,
                folder_id: pull.u64()?,
            },
            CallId::Vacuum => R::Vacuum,
            CallId::GetFolderByClass => R::GetFolderByClass { str_class: pull.str()? },
            CallId::LoadPermissionTable => R::LoadPermissionTable {
                folder_id: pull.u64()?,
                table_flags: pull.u32()?,
            },
            CallId::WriteMessageInstance => R::WriteMessageInstance {
                instance_id: pull.u32()?,
                content: MessageContent::decode(pull)?,
                force: pull.bool()?,
            },
            CallId::FlushInstance => R::FlushInstance { instance_id: pull.u32()? },
            CallId::UnloadStore => R::UnloadStore,
            CallId::DeliverMessage => R::DeliverMessage {
                from_address: pull.str()?,
                account: pull.str()?,
                raw: pull.bin()?,
            },
            CallId::NotifyNewMail => {
                R::NotifyNewMail { folder_id: pull.u64()?, message_id: pull.u64()? }
            }
            CallId::StoreEidToUser => R::StoreEidToUser { eid: pull.u64()? },
            CallId::EmptyFolder => {
                R::EmptyFolder { folder_id: pull.u64()?, flags: pull.u32()? }
            }
            CallId::PurgeSoftdelete => R::PurgeSoftdelete {
                folder_id: pull.u64()?,
                cutoff: pull.u64()? as i64,
            },
            CallId::PurgeDatafiles => R::PurgeDatafiles,
            // connection-level and retired opnums never reach here
            CallId::Connect
            | CallId::ListenNotification
            | CallId::GetFolderByClassV1
            | CallId::EmptyFolderV1
            | CallId::LoadPermTableV1
            | CallId::WriteMessageInstanceV1
            | CallId::FlushInstanceV1
            | CallId::DeliverMessageV1 => return Err(EcError::NotSupported),
        })
    }
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut push = ExtPush::new();
        match self {
            Request::Connect(c) => {
                push.u8(CallId::Connect as u8);
                push.str(&c.prefix);
                push.str(&c.remote_id);
                push.bool(c.b_private);
            }
            Request::ListenNotification(l) => {
                push.u8(CallId::ListenNotification as u8);
                push.str(&l.remote_id);
            }
            Request::Store { dir, body } => {
                push.u8(body.call_id() as u8);
                push.str(dir);
                body.encode_payload(&mut push);
            }
        }
        push.into_bytes()
    }

    /// Decode one PDU (after the length prefix). Unknown or retired
    /// opnums surface as `NotSupported` so the server can answer
    /// `bad_switch`.
    pub fn decode(bytes: &[u8]) -> EcResult<Request> {
        let mut pull = ExtPull::new(bytes);
        let call_id = CallId::from_u8(pull.u8()?).ok_or(EcError::NotSupported)?;
        let req = match call_id {
            CallId::Connect => Request::Connect(ConnectRequest {
                prefix: pull.str()?,
                remote_id: pull.str()?,
                b_private: pull.bool()?,
            }),
            CallId::ListenNotification => {
                Request::ListenNotification(ListenRequest { remote_id: pull.str()? })
            }
            _ => {
                let dir = pull.str()?;
                let body = StoreRequest::decode_payload(call_id, &mut pull)?;
                Request::Store { dir, body }
            }
        };
        if pull.remaining() != 0 {
            return Err(EcError::RpcFormat);
        }
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::propval::{tags, PropValue};
    use crate::types::restriction::FL_SUBSTRING;

    fn round_trip(req: Request) {
        let bytes = req.encode();
        assert_eq!(Request::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn connect_round_trip() {
        round_trip(Request::Connect(ConnectRequest {
            prefix: "/var/lib/oxmdb/user@example.com".into(),
            remote_id: "123.abcdef".into(),
            b_private: true,
        }));
    }

    #[test]
    fn simple_store_verbs_round_trip() {
        for body in [
            StoreRequest::PingStore,
            StoreRequest::CheckFolderId { folder_id: 0x0001_0000_0000_000d },
            StoreRequest::AllocateIds { count: 64 },
            StoreRequest::GetMessageProperties {
                message_id: 0x0001_0000_0000_1234,
                proptags: vec![tags::PR_SUBJECT, tags::PR_MID],
            },
            StoreRequest::EmptyFolder { folder_id: 13, flags: 0x1D },
        ] {
            round_trip(Request::Store { dir: "/tmp/s".into(), body });
        }
    }

    #[test]
    fn compound_verbs_round_trip() {
        let mut propvals = PropList::new();
        propvals.set(tags::PR_DISPLAY_NAME, PropValue::Unicode("Invoices".into()));
        round_trip(Request::Store {
            dir: "/tmp/s".into(),
            body: StoreRequest::CreateFolderByProperties {
                parent_id: 9,
                folder_type: 1,
                str_name: "Invoices".into(),
                propvals,
                open_existing: false,
            },
        });

        round_trip(Request::Store {
            dir: "/tmp/s".into(),
            body: StoreRequest::SetSearchCriteria {
                folder_id: 0x105,
                search_flags: 0x2,
                restriction: Some(Restriction::Content {
                    fuzzy_level: FL_SUBSTRING,
                    proptag: tags::PR_SUBJECT,
                    propval: PropValue::Unicode("x".into()),
                }),
                folder_ids: vec![0x0d, 0x0a],
            },
        });

        let mut content = MessageContent::default();
        content.props.set(tags::PR_SUBJECT, PropValue::Unicode("wire".into()));
        round_trip(Request::Store {
            dir: "/tmp/s".into(),
            body: StoreRequest::WriteMessage {
                folder_id: 0x0d,
                content,
                fail_on_conflict: true,
            },
        });
    }

    #[test]
    fn retired_opnum_is_not_supported() {
        let mut push = ExtPush::new();
        push.u8(CallId::EmptyFolderV1 as u8);
        push.str("/tmp/s");
        assert_eq!(
            Request::decode(&push.into_bytes()).unwrap_err(),
            EcError::NotSupported
        );
    }
}
