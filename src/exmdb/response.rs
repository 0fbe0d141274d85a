//! Response payloads.
//!
//! The response frame is `[u8 code][u32 length][payload]`; the payload is
//! present only on success and its shape is fixed by the request's call
//! id, so decoding takes the originating [`CallId`].

use uuid::Uuid;

use crate::codec::{ExtPull, ExtPush};
use crate::store::sync::{ContentSyncResult, HierarchySyncResult};
use crate::store::{AttachmentContent, MessageContent};
use crate::types::propval::{PropList, PropName};
use crate::types::restriction::Restriction;
use crate::types::{EcError, EcResult};

use super::CallId;

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Unit,
    Bool(bool),
    U16(u16),
    U32(u32),
    U64(u64),
    OptU32(Option<u32>),
    OptU64(Option<u64>),
    Guid(Uuid),
    Propids(Vec<u16>),
    Propnames(Vec<Option<PropName>>),
    Proptags(Vec<u32>),
    Propvals(PropList),
    Problems(Vec<u32>),
    Rows(Vec<PropList>),
    Message(MessageContent),
    Attachment(AttachmentContent),
    Table { table_id: u32, row_count: u32 },
    CreatedFolder { folder_id: u64, is_existing: bool },
    SearchCriteria { status: u32, restriction: Option<Restriction>, scope: Vec<u64> },
    Match(Option<(u32, PropList)>),
    Locate { position: u32, row_type: u32 },
    Mark { inst_id: u64, inst_num: u32, row_type: u32 },
    ExpandCollapse { position: u32, count: u32 },
    CreatedAttachment { instance_id: u32, attachment_num: u32 },
    ChangeIndices { indices: Vec<u32>, ungrouped_proptags: Vec<u32> },
    ContentSync(ContentSyncResult),
    HierarchySync(HierarchySyncResult),
    ClassTable(Vec<(String, u64, i64)>),
    FolderClass { folder_id: u64, rendered_class: String },
    EidToUser { username: String, store_dir: String },
    Delivered { folder_id: u64, message_id: u64, accepted: bool },
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

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut push = ExtPush::new();
        match self {
            Response::Unit => {}
            Response::Bool(v) => push.bool(*v),
            Response::U16(v) => push.u16(*v),
            Response::U32(v) => push.u32(*v),
            Response::U64(v) => push.u64(*v),
            Response::OptU32(v) => push.opt(v.as_ref(), |p, x| p.u32(*x)),
            Response::OptU64(v) => push.opt(v.as_ref(), |p, x| p.u64(*x)),
            Response::Guid(g) => push.guid(*g),
            Response::Propids(ids) => {
                push.u16(ids.len() as u16);
                for id in ids {
                    push.u16(*id);
                }
            }
            Response::Propnames(names) => {
                push.u16(names.len() as u16);
                for name in names {
                    push.opt(name.as_ref(), |p, n| p.propname(n));
                }
            }
            Response::Proptags(tags) | Response::Problems(tags) => push_u32_list(&mut push, tags),
            Response::Propvals(list) => push.proplist(list),
            Response::Rows(rows) => push_proplists(&mut push, rows),
            Response::Message(m) => m.encode(&mut push),
            Response::Attachment(a) => a.encode(&mut push),
            Response::Table { table_id, row_count } => {
                push.u32(*table_id);
                push.u32(*row_count);
            }
            Response::CreatedFolder { folder_id, is_existing } => {
                push.u64(*folder_id);
                push.bool(*is_existing);
            }
            Response::SearchCriteria { status, restriction, scope } => {
                push.u32(*status);
                push.opt(restriction.as_ref(), |p, r| p.restriction(r));
                push_u64_list(&mut push, scope);
            }
            Response::Match(hit) => match hit {
                None => push.u8(0),
                Some((pos, row)) => {
                    push.u8(1);
                    push.u32(*pos);
                    push.proplist(row);
                }
            },
            Response::Locate { position, row_type } => {
                push.u32(*position);
                push.u32(*row_type);
            }
            Response::Mark { inst_id, inst_num, row_type } => {
                push.u64(*inst_id);
                push.u32(*inst_num);
                push.u32(*row_type);
            }
            Response::ExpandCollapse { position, count } => {
                push.u32(*position);
                push.u32(*count);
            }
            Response::CreatedAttachment { instance_id, attachment_num } => {
                push.u32(*instance_id);
                push.u32(*attachment_num);
            }
            Response::ChangeIndices { indices, ungrouped_proptags } => {
                push_u32_list(&mut push, indices);
                push_u32_list(&mut push, ungrouped_proptags);
            }
            Response::ContentSync(r) => {
                push_u64_list(&mut push, &r.fai_mids);
                push.u64(r.fai_total);
                push_u64_list(&mut push, &r.normal_mids);
                push.u64(r.normal_total);
                push_u64_list(&mut push, &r.updated_mids);
                push_u64_list(&mut push, &r.deleted_mids);
                push_u64_list(&mut push, &r.nolonger_mids);
                push_u64_list(&mut push, &r.read_mids);
                push_u64_list(&mut push, &r.unread_mids);
                push.u64(r.last_cn);
                push.u64(r.last_readcn);
            }
            Response::HierarchySync(r) => {
                push_u64_list(&mut push, &r.changed_fids);
                push_u64_list(&mut push, &r.deleted_fids);
                push.u64(r.last_cn);
            }
            Response::ClassTable(rows) => {
                push.u32(rows.len() as u32);
                for (class, fid, modified) in rows {
                    push.str(class);
                    push.u64(*fid);
                    push.u64(*modified as u64);
                }
            }
            Response::FolderClass { folder_id, rendered_class } => {
                push.u64(*folder_id);
                push.str(rendered_class);
            }
            Response::EidToUser { username, store_dir } => {
                push.str(username);
                push.str(store_dir);
            }
            Response::Delivered { folder_id, message_id, accepted } => {
                push.bool(*accepted);
                push.u64(*folder_id);
                push.u64(*message_id);
            }
        }
        push.into_bytes()
    }

    /// Decode a success payload, shaped by the call that produced it.
    pub fn decode(call_id: CallId, bytes: &[u8]) -> EcResult<Response> {
        use CallId as C;
        let mut pull = ExtPull::new(bytes);
        let resp = match call_id {
            C::PingStore
            | C::RemoveStoreProperties
            | C::SetFolderByClass
            | C::RemoveFolderProperties
            | C::DeleteFolder
            | C::CopyFolderInternal
            | C::SetSearchCriteria
            | C::MovecopyMessage
            | C::UnloadTable
            | C::ReloadMessageInstance
            | C::ClearMessageInstance
            | C::DeleteMessageInstanceAttachment
            | C::UnloadInstance
            | C::RemoveInstanceProperties
            | C::EmptyMessageInstanceRcpts
            | C::UpdateMessageInstanceRcpts
            | C::EmptyMessageInstanceAttachments
            | C::SetMessageInstanceConflict
            | C::RemoveMessageProperties
            | C::MarkModified
            | C::SetMessageGroupId
            | C::SaveChangeIndices
            | C::ClearSubmit
            | C::LinkMessage
            | C::UnlinkMessage
            | C::RuleNewMessage
            | C::SetMessageTimer
            | C::EmptyFolderPermission
            | C::UpdateFolderPermission
            | C::EmptyFolderRule
            | C::UpdateFolderRule
            | C::UnsubscribeNotification
            | C::TransportNewMail
            | C::CopyInstanceRcpts
            | C::CopyInstanceAttachments
            | C::Vacuum
            | C::UnloadStore
            | C::NotifyNewMail
            | C::PurgeSoftdelete
            | C::PurgeDatafiles => Response::Unit,
            C::CheckFolderId
            | C::CheckFolderDeleted
            | C::CheckFolderCycle
            | C::CheckMessage
            | C::CheckMessageDeleted
            | C::CheckInstanceCycle
            | C::CheckContactAddress
            | C::TryMarkSubmit
            | C::EmptyFolder
            | C::DeleteMessages
            | C::MovecopyMessages => Response::Bool(pull.bool()?),
            C::GetMessageInstanceRcptsNum
            | C::GetMessageInstanceAttachmentsNum
            | C::GetMappingReplid => Response::U16(pull.u16()?),
            C::GetMboxPerm
            | C::CheckFolderPermission
            | C::SumHierarchy
            | C::SumContent
            | C::SumTable
            | C::StoreTableState
            | C::RestoreTableState
            | C::ReloadContentTable
            | C::LoadMessageInstance
            | C::LoadEmbeddedInstance
            | C::LoadAttachmentInstance
            | C::SubscribeNotification
            | C::GetPublicFolderUnreadCount => Response::U32(pull.u32()?),
            C::MovecopyFolder
            | C::AllocateMessageId
            | C::AllocateCn
            | C::AllocateIds
            | C::SetMessageReadState
            | C::FlushInstance
            | C::WriteMessage => Response::U64(pull.u64()?),
            C::GetMessageGroupId | C::GetMessageTimer => {
                Response::OptU32(pull.opt(|p| p.u32())?)
            }
            C::GetFolderByName | C::GetEmbeddedCn => Response::OptU64(pull.opt(|p| p.u64())?),
            C::GetMappingGuid => Response::Guid(pull.guid()?),
            C::GetAllNamedPropids | C::GetNamedPropids => {
                let n = pull.u16()? as usize;
                Response::Propids((0..n).map(|_| pull.u16()).collect::<EcResult<_>>()?)
            }
            C::GetNamedPropnames => {
                let n = pull.u16()? as usize;
                Response::Propnames(
                    (0..n)
                        .map(|_| pull.opt(|p| p.propname()))
                        .collect::<EcResult<_>>()?,
                )
            }
            C::GetStoreAllProptags
            | C::GetFolderAllProptags
            | C::GetTableAllProptags
            | C::GetInstanceAllProptags
            | C::GetMessageInstanceRcptsAllProptags
            | C::GetMessageInstanceAttachmentTableAllProptags => {
                Response::Proptags(pull_u32_list(&mut pull)?)
            }
            C::GetStoreProperties
            | C::GetFolderProperties
            | C::GetMessageProperties
            | C::GetInstanceProperties
            | C::ReadTableRow => Response::Propvals(pull.proplist()?),
            C::SetStoreProperties
            | C::SetFolderProperties
            | C::SetMessageProperties
            | C::SetInstanceProperties
            | C::WriteMessageInstance
            | C::WriteAttachmentInstance => Response::Problems(pull_u32_list(&mut pull)?),
            C::QueryFolderMessages
            | C::QueryTable
            | C::GetMessageInstanceRcpts
            | C::QueryMessageInstanceAttachmentTable
            | C::GetMessageRcpts => Response::Rows(pull_proplists(&mut pull)?),
            C::GetMessageBrief | C::ReadMessageInstance | C::ReadMessage => {
                Response::Message(MessageContent::decode(&mut pull)?)
            }
            C::ReadAttachmentInstance => {
                Response::Attachment(AttachmentContent::decode(&mut pull)?)
            }
            C::LoadHierarchyTable
            | C::LoadContentTable
            | C::LoadRuleTable
            | C::LoadPermissionTable => Response::Table {
                table_id: pull.u32()?,
                row_count: pull.u32()?,
            },
            C::CreateFolderByProperties => Response::CreatedFolder {
                folder_id: pull.u64()?,
                is_existing: pull.bool()?,
            },
            C::GetSearchCriteria => Response::SearchCriteria {
                status: pull.u32()?,
                restriction: pull.opt(|p| p.restriction())?,
                scope: pull_u64_list(&mut pull)?,
            },
            C::MatchTable => Response::Match(match pull.u8()? {
                0 => None,
                _ => Some((pull.u32()?, pull.proplist()?)),
            }),
            C::LocateTable => Response::Locate {
                position: pull.u32()?,
                row_type: pull.u32()?,
            },
            C::MarkTable => Response::Mark {
                inst_id: pull.u64()?,
                inst_num: pull.u32()?,
                row_type: pull.u32()?,
            },
            C::ExpandTable | C::CollapseTable => Response::ExpandCollapse {
                position: pull.u32()?,
                count: pull.u32()?,
            },
            C::CreateAttachmentInstance => Response::CreatedAttachment {
                instance_id: pull.u32()?,
                attachment_num: pull.u32()?,
            },
            C::GetChangeIndices => Response::ChangeIndices {
                indices: pull_u32_list(&mut pull)?,
                ungrouped_proptags: pull_u32_list(&mut pull)?,
            },
            C::GetContentSync => Response::ContentSync(ContentSyncResult {
                fai_mids: pull_u64_list(&mut pull)?,
                fai_total: pull.u64()?,
                normal_mids: pull_u64_list(&mut pull)?,
                normal_total: pull.u64()?,
                updated_mids: pull_u64_list(&mut pull)?,
                deleted_mids: pull_u64_list(&mut pull)?,
                nolonger_mids: pull_u64_list(&mut pull)?,
                read_mids: pull_u64_list(&mut pull)?,
                unread_mids: pull_u64_list(&mut pull)?,
                last_cn: pull.u64()?,
                last_readcn: pull.u64()?,
            }),
            C::GetHierarchySync => Response::HierarchySync(HierarchySyncResult {
                changed_fids: pull_u64_list(&mut pull)?,
                deleted_fids: pull_u64_list(&mut pull)?,
                last_cn: pull.u64()?,
            }),
            C::GetFolderClassTable => {
                let n = pull.u32()? as usize;
                let mut rows = Vec::with_capacity(n);
                for _ in 0..n {
                    rows.push((pull.str()?, pull.u64()?, pull.u64()? as i64));
                }
                Response::ClassTable(rows)
            }
            C::GetFolderByClass => Response::FolderClass {
                folder_id: pull.u64()?,
                rendered_class: pull.str()?,
            },
            C::StoreEidToUser => Response::EidToUser {
                username: pull.str()?,
                store_dir: pull.str()?,
            },
            C::DeliverMessage => Response::Delivered {
                accepted: pull.bool()?,
                folder_id: pull.u64()?,
                message_id: pull.u64()?,
            },
            C::Connect
            | C::ListenNotification
            | C::GetFolderByClassV1
            | C::EmptyFolderV1
            | C::LoadPermTableV1
            | C::WriteMessageInstanceV1
            | C::FlushInstanceV1
            | C::DeliverMessageV1 => return Err(EcError::NotSupported),
        };
        if pull.remaining() != 0 {
            return Err(EcError::RpcFormat);
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::propval::{tags, PropValue};

    fn round_trip(call_id: CallId, resp: Response) {
        let bytes = resp.encode();
        assert_eq!(Response::decode(call_id, &bytes).unwrap(), resp);
    }

    #[test]
    fn scalar_responses() {
        round_trip(CallId::PingStore, Response::Unit);
        round_trip(CallId::CheckFolderId, Response::Bool(true));
        round_trip(CallId::AllocateCn, Response::U64(0x0001_0000_0000_0042));
        round_trip(CallId::GetMessageTimer, Response::OptU32(None));
        round_trip(CallId::GetFolderByName, Response::OptU64(Some(0x105)));
        round_trip(CallId::GetMappingGuid, Response::Guid(Uuid::new_v4()));
    }

    #[test]
    fn compound_responses() {
        let mut list = PropList::new();
        list.set(tags::PR_SUBJECT, PropValue::Unicode("s".into()));
        round_trip(CallId::GetMessageProperties, Response::Propvals(list.clone()));
        round_trip(CallId::QueryTable, Response::Rows(vec![list.clone(), PropList::new()]));
        round_trip(
            CallId::LoadContentTable,
            Response::Table { table_id: 3, row_count: 17 },
        );
        round_trip(
            CallId::CreateFolderByProperties,
            Response::CreatedFolder { folder_id: 0x200, is_existing: false },
        );
        round_trip(CallId::MatchTable, Response::Match(Some((4, list))));
        round_trip(CallId::MatchTable, Response::Match(None));
    }

    #[test]
    fn content_sync_response() {
        let result = ContentSyncResult {
            fai_mids: vec![1, 2],
            fai_total: 2,
            normal_mids: vec![3],
            normal_total: 5,
            updated_mids: vec![3],
            deleted_mids: vec![9],
            nolonger_mids: vec![],
            read_mids: vec![3],
            unread_mids: vec![],
            last_cn: 77,
            last_readcn: 12,
        };
        round_trip(CallId::GetContentSync, Response::ContentSync(result));
    }

    #[test]
    fn shape_mismatch_is_rpc_format() {
        let bytes = Response::U64(7).encode();
        assert!(Response::decode(CallId::PingStore, &bytes).is_err());
    }
}
