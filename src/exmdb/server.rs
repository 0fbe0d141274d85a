//! The exmdb TCP server: accept loop, per-connection threads, and the
//! dispatcher that maps request payloads onto store calls.
//!
//! A control connection must open with `connect` naming a served prefix;
//! every later PDU on it is a store verb. A `listen_notification`
//! connection instead becomes the peer's notification channel and is fed
//! from the per-remote queue until the reader stops acknowledging.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::ics::{IdSet, ReplType};
use crate::store::search::search_flags;
use crate::store::{Engine, Store};
use crate::types::{EcError, EcResult};

use super::notify::NotifyDatagram;
use super::request::{Request, StoreRequest};
use super::response::Response;
use super::{read_frame, write_frame, ResponseCode, SOCKET_TIMEOUT};

/// One prefix this server is willing to serve.
#[derive(Debug, Clone)]
pub struct ServedPrefix {
    pub prefix: String,
    pub private: bool,
}

pub struct ExmdbServer {
    engine: Arc<Engine>,
    prefixes: Vec<ServedPrefix>,
    stop: Arc<AtomicBool>,
    accept_thread: Option<std::thread::JoinHandle<()>>,
    local_addr: std::net::SocketAddr,
}

impl ExmdbServer {
    /// Bind and start serving. Connection handling runs on detached
    /// threads; `stop` tears the accept loop down.
    pub fn start(
        bind: &str,
        engine: Arc<Engine>,
        prefixes: Vec<ServedPrefix>,
    ) -> EcResult<Self> {
        let listener = TcpListener::bind(bind)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        info!("exmdb server listening on {local_addr}");
        let stop = Arc::new(AtomicBool::new(false));
        let accept_stop = Arc::clone(&stop);
        let accept_engine = Arc::clone(&engine);
        let accept_prefixes = prefixes.clone();
        let accept_thread = std::thread::Builder::new()
            .name("exmdb/accept".into())
            .spawn(move || {
                while !accept_stop.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((sock, peer)) => {
                            debug!("accepted exmdb connection from {peer}");
                            let engine = Arc::clone(&accept_engine);
                            let prefixes = accept_prefixes.clone();
                            let _ = std::thread::Builder::new()
                                .name("exmdb/conn".into())
                                .spawn(move || {
                                    if let Err(e) = serve_connection(sock, engine, prefixes) {
                                        debug!("connection from {peer} ended: {e}");
                                    }
                                });
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(100));
                        }
                        Err(e) => {
                            warn!("accept failed: {e}");
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
            })
            .map_err(|_| EcError::InsufficientResources)?;
        Ok(Self { engine, prefixes, stop, accept_thread: Some(accept_thread), local_addr })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn prefixes(&self) -> &[ServedPrefix] {
        &self.prefixes
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.accept_thread.take() {
            let _ = h.join();
        }
    }
}

impl Drop for ExmdbServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn find_prefix<'a>(prefixes: &'a [ServedPrefix], dir: &str) -> Option<&'a ServedPrefix> {
    prefixes.iter().find(|p| dir.starts_with(&p.prefix))
}

fn respond_code(sock: &mut TcpStream, code: ResponseCode) -> EcResult<()> {
    sock.write_all(&[code as u8])?;
    sock.flush()?;
    Ok(())
}

fn respond_success(sock: &mut TcpStream, payload: &[u8]) -> EcResult<()> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(ResponseCode::Success as u8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    sock.write_all(&out)?;
    sock.flush()?;
    Ok(())
}

/// A store-level error travels as `dispatch_error` plus the 4-byte code.
fn respond_ec(sock: &mut TcpStream, err: EcError) -> EcResult<()> {
    let mut out = Vec::with_capacity(9);
    out.push(ResponseCode::DispatchError as u8);
    out.extend_from_slice(&4u32.to_le_bytes());
    out.extend_from_slice(&err.code().to_le_bytes());
    sock.write_all(&out)?;
    sock.flush()?;
    Ok(())
}

fn serve_connection(
    mut sock: TcpStream,
    engine: Arc<Engine>,
    prefixes: Vec<ServedPrefix>,
) -> EcResult<()> {
    let mut connected = false;
    loop {
        let payload = match read_frame(&mut sock, Some(SOCKET_TIMEOUT)) {
            Ok(p) => p,
            // idle timeout or peer close: the server side hangs up
            Err(_) => return Ok(()),
        };
        if payload.is_empty() {
            respond_code(&mut sock, ResponseCode::Success)?;
            continue;
        }
        let request = match Request::decode(&payload) {
            Ok(r) => r,
            Err(EcError::NotSupported) => {
                respond_code(&mut sock, ResponseCode::BadSwitch)?;
                continue;
            }
            Err(_) => {
                respond_code(&mut sock, ResponseCode::PullError)?;
                return Ok(());
            }
        };
        match request {
            Request::Connect(c) => {
                let Some(served) = find_prefix(&prefixes, &c.prefix) else {
                    respond_code(&mut sock, ResponseCode::MisconfigPrefix)?;
                    return Ok(());
                };
                if served.private != c.b_private {
                    respond_code(&mut sock, ResponseCode::MisconfigMode)?;
                    return Ok(());
                }
                connected = true;
                // success plus four zero bytes of payload length
                respond_success(&mut sock, &[])?;
            }
            Request::ListenNotification(l) => {
                respond_success(&mut sock, &[])?;
                return serve_notifications(sock, engine, &l.remote_id);
            }
            Request::Store { dir, body } => {
                if !connected {
                    respond_code(&mut sock, ResponseCode::ConnectIncomplete)?;
                    return Ok(());
                }
                if find_prefix(&prefixes, &dir).is_none() {
                    respond_ec(&mut sock, EcError::WrongServer)?;
                    continue;
                }
                match dispatch(&engine, &dir, body) {
                    Ok(resp) => respond_success(&mut sock, &resp.encode())?,
                    Err(e) => respond_ec(&mut sock, e)?,
                }
            }
        }
    }
}

/// Pump the per-remote notification queue onto the listen connection.
fn serve_notifications(
    mut sock: TcpStream,
    engine: Arc<Engine>,
    remote_id: &str,
) -> EcResult<()> {
    let rx = engine.sink().register_remote(remote_id);
    info!("notification channel attached for {remote_id}");
    let result = (|| -> EcResult<()> {
        loop {
            match rx.recv_timeout(SOCKET_TIMEOUT / 2) {
                Ok(dg) => {
                    let wire = NotifyDatagram {
                        dir: dg.dir.display().to_string(),
                        sub_ids: vec![dg.sub_id],
                        notify: dg.notify,
                    };
                    write_frame(&mut sock, &wire.encode())?;
                    let mut ack = [0u8; 1];
                    sock.set_read_timeout(Some(SOCKET_TIMEOUT))?;
                    sock.read_exact(&mut ack)?;
                    if ResponseCode::from_u8(ack[0]) != ResponseCode::Success {
                        return Err(EcError::Network);
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    // keepalive so a dead reader is noticed
                    write_frame(&mut sock, &[])?;
                    let mut ack = [0u8; 1];
                    sock.set_read_timeout(Some(SOCKET_TIMEOUT))?;
                    sock.read_exact(&mut ack)?;
                }
                Err(flume::RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    })();
    engine.sink().unregister_remote(remote_id);
    info!("notification channel for {remote_id} detached");
    result
}

fn parse_idset(store: &Arc<Store>, blob: &[u8]) -> EcResult<IdSet> {
    let mut set = IdSet::deserialize(blob, ReplType::Guid)?;
    set.register_mapping(store.clone());
    set.resolve()?;
    Ok(set)
}

/// Map one store request onto the engine. This is the single point where
/// the wire protocol meets the store API.
pub fn dispatch(engine: &Arc<Engine>, dir: &str, body: StoreRequest) -> EcResult<Response> {
    use StoreRequest as R;
    if matches!(body, R::UnloadStore) {
        engine.unload_store(Path::new(dir))?;
        return Ok(Response::Unit);
    }
    let store = engine.open_store(Path::new(dir))?;
    Ok(match body {
        R::UnloadStore => unreachable!("handled above"),
        R::PingStore => {
            store.ping()?;
            Response::Unit
        }
        R::GetAllNamedPropids => Response::Propids(store.get_all_named_propids()?),
        R::GetNamedPropids { create, names } => {
            Response::Propids(store.get_named_propids(&names, create)?)
        }
        R::GetNamedPropnames { propids } => {
            Response::Propnames(store.get_named_propnames(&propids)?)
        }
        R::GetMappingGuid { replid } => Response::Guid(store.get_mapping_guid(replid)?),
        R::GetMappingReplid { guid } => Response::U16(store.get_mapping_replid(guid)?),
        R::GetStoreAllProptags => Response::Proptags(store.get_store_all_proptags()?),
        R::GetStoreProperties { proptags } => {
            Response::Propvals(store.get_store_properties(&proptags)?)
        }
        R::SetStoreProperties { propvals } => {
            Response::Problems(store.set_store_properties(&propvals)?)
        }
        R::RemoveStoreProperties { proptags } => {
            store.remove_store_properties(&proptags)?;
            Response::Unit
        }
        R::GetMboxPerm { username } => Response::U32(store.get_mbox_perm(&username)?),
        R::SetFolderByClass { folder_id, str_class } => {
            store.set_folder_by_class(folder_id, &str_class)?;
            Response::Unit
        }
        R::GetFolderClassTable => Response::ClassTable(store.get_folder_class_table()?),
        R::CheckFolderId { folder_id } => Response::Bool(store.check_folder_id(folder_id)?),
        R::QueryFolderMessages { folder_id } => {
            Response::Rows(store.query_folder_messages(folder_id)?)
        }
        R::CheckFolderDeleted { folder_id } => {
            Response::Bool(store.check_folder_deleted(folder_id)?)
        }
        R::GetFolderByName { parent_id, str_name } => {
            Response::OptU64(store.get_folder_by_name(parent_id, &str_name)?)
        }
        R::CheckFolderPermission { folder_id, username } => {
            Response::U32(store.check_folder_permission(folder_id, &username)?)
        }
        R::CreateFolderByProperties {
            parent_id,
            folder_type,
            str_name,
            propvals,
            open_existing,
        } => {
            let created =
                store.create_folder(parent_id, folder_type, &str_name, &propvals, open_existing)?;
            Response::CreatedFolder {
                folder_id: created.folder_id,
                is_existing: created.is_existing,
            }
        }
        R::GetFolderAllProptags { folder_id } => {
            Response::Proptags(store.get_folder_all_proptags(folder_id)?)
        }
        R::GetFolderProperties { folder_id, proptags } => {
            Response::Propvals(store.get_folder_properties(folder_id, &proptags)?)
        }
        R::SetFolderProperties { folder_id, propvals } => {
            Response::Problems(store.set_folder_properties(folder_id, &propvals)?)
        }
        R::RemoveFolderProperties { folder_id, proptags } => {
            store.remove_folder_properties(folder_id, &proptags)?;
            Response::Unit
        }
        R::DeleteFolder { folder_id, hard } => {
            store.delete_folder(folder_id, hard)?;
            Response::Unit
        }
        R::CheckFolderCycle { src_fid, dst_fid } => {
            Response::Bool(store.check_folder_cycle(src_fid, dst_fid)?)
        }
        R::CopyFolderInternal { src_fid, dst_fid, include_subfolders } => {
            store.copy_folder_internal(src_fid, dst_fid, include_subfolders)?;
            Response::Unit
        }
        R::GetSearchCriteria { folder_id } => {
            let criteria = store.get_search_criteria(folder_id)?;
            Response::SearchCriteria {
                status: criteria.status,
                restriction: criteria.restriction,
                scope: criteria.scope,
            }
        }
        R::SetSearchCriteria { folder_id, search_flags: flags, restriction, folder_ids } => {
            if flags & (search_flags::RESTART | search_flags::STOP) == 0 && restriction.is_none() {
                return Err(EcError::InvalidParam);
            }
            store.set_search_criteria(folder_id, flags, restriction, &folder_ids)?;
            Response::Unit
        }
        R::MovecopyMessage { message_id, dst_fid, dst_id, b_move } => {
            store.movecopy_message(message_id, dst_fid, dst_id, b_move)?;
            Response::Unit
        }
        R::MovecopyMessages { src_fid, dst_fid, message_ids, b_move } => {
            Response::Bool(store.movecopy_messages(src_fid, dst_fid, &message_ids, b_move)?)
        }
        R::MovecopyFolder { src_fid, dst_fid, str_new, b_copy } => {
            Response::U64(store.movecopy_folder(src_fid, dst_fid, str_new.as_deref(), b_copy)?)
        }
        R::DeleteMessages { folder_id, message_ids, hard } => {
            Response::Bool(store.delete_messages(folder_id, &message_ids, hard)?)
        }
        R::GetMessageBrief { message_id } => Response::Message(store.get_message_brief(message_id)?),
        R::SumHierarchy { folder_id, recursive } => {
            Response::U32(store.sum_hierarchy(folder_id, recursive)?)
        }
        R::LoadHierarchyTable { folder_id, username, table_flags, restriction } => {
            let (table_id, row_count) = store.load_hierarchy_table(
                folder_id,
                username.as_deref(),
                table_flags,
                restriction,
            )?;
            Response::Table { table_id, row_count }
        }
        R::SumContent { folder_id, fai, deleted } => {
            Response::U32(store.sum_content(folder_id, fai, deleted)?)
        }
        R::LoadContentTable { folder_id, username, table_flags, restriction, sorts } => {
            let (table_id, row_count) = store.load_content_table(
                folder_id,
                username.as_deref(),
                table_flags,
                restriction,
                sorts,
            )?;
            Response::Table { table_id, row_count }
        }
        R::LoadRuleTable { folder_id, username } => {
            let (table_id, row_count) =
                store.load_rule_table(folder_id, username.as_deref(), None)?;
            Response::Table { table_id, row_count }
        }
        R::UnloadTable { table_id } => {
            store.unload_table(table_id)?;
            Response::Unit
        }
        R::SumTable { table_id } => Response::U32(store.sum_table(table_id)?),
        R::QueryTable { table_id, proptags, start_pos, row_needed } => {
            Response::Rows(store.query_table(table_id, &proptags, start_pos, row_needed)?)
        }
        R::MatchTable { table_id, forward, start_pos, restriction, proptags } => Response::Match(
            store.match_table(table_id, forward, start_pos, &restriction, &proptags)?,
        ),
        R::LocateTable { table_id, inst_id, inst_num } => {
            let (position, row_type) = store.locate_table(table_id, inst_id, inst_num)?;
            Response::Locate { position, row_type }
        }
        R::ReadTableRow { table_id, proptags, inst_id, inst_num } => {
            Response::Propvals(store.read_table_row(table_id, &proptags, inst_id, inst_num)?)
        }
        R::MarkTable { table_id, position } => {
            let (inst_id, inst_num, row_type) = store.mark_table(table_id, position)?;
            Response::Mark { inst_id, inst_num, row_type }
        }
        R::GetTableAllProptags { table_id } => {
            Response::Proptags(store.get_table_all_proptags(table_id)?)
        }
        R::ExpandTable { table_id, inst_id } => {
            let (position, count) = store.expand_table(table_id, inst_id)?;
            Response::ExpandCollapse { position, count }
        }
        R::CollapseTable { table_id, inst_id } => {
            let (position, count) = store.collapse_table(table_id, inst_id)?;
            Response::ExpandCollapse { position, count }
        }
        R::StoreTableState { table_id, inst_id, inst_num } => {
            Response::U32(store.store_table_state(table_id, inst_id, inst_num)?)
        }
        R::RestoreTableState { table_id, state_id } => {
            Response::U32(store.restore_table_state(table_id, state_id)?)
        }
        R::CheckMessage { folder_id, message_id } => {
            Response::Bool(store.check_message(folder_id, message_id)?)
        }
        R::CheckMessageDeleted { message_id } => {
            Response::Bool(store.check_message_deleted(message_id)?)
        }
        R::LoadMessageInstance { folder_id, message_id, b_new, b_fai } => {
            Response::U32(store.load_message_instance(folder_id, message_id, b_new, b_fai)?)
        }
        R::LoadEmbeddedInstance { attachment_instance, b_new } => {
            Response::U32(store.load_embedded_instance(attachment_instance, b_new)?)
        }
        R::GetEmbeddedCn { instance_id } => Response::OptU64(store.get_embedded_cn(instance_id)?),
        R::ReloadMessageInstance { instance_id } => {
            store.reload_message_instance(instance_id)?;
            Response::Unit
        }
        R::ClearMessageInstance { instance_id } => {
            store.clear_message_instance(instance_id)?;
            Response::Unit
        }
        R::ReadMessageInstance { instance_id } => {
            Response::Message(store.read_message_instance(instance_id)?)
        }
        R::LoadAttachmentInstance { message_instance, attachment_num } => {
            Response::U32(store.load_attachment_instance(message_instance, attachment_num)?)
        }
        R::CreateAttachmentInstance { message_instance } => {
            let (instance_id, attachment_num) = store.create_attachment_instance(message_instance)?;
            Response::CreatedAttachment { instance_id, attachment_num }
        }
        R::ReadAttachmentInstance { instance_id } => {
            Response::Attachment(store.read_attachment_instance(instance_id)?)
        }
        R::WriteAttachmentInstance { instance_id, content, force } => {
            Response::Problems(store.write_attachment_instance(instance_id, &content, force)?)
        }
        R::DeleteMessageInstanceAttachment { message_instance, attachment_num } => {
            store.delete_message_instance_attachment(message_instance, attachment_num)?;
            Response::Unit
        }
        R::UnloadInstance { instance_id } => {
            store.unload_instance(instance_id)?;
            Response::Unit
        }
        R::GetInstanceAllProptags { instance_id } => {
            Response::Proptags(store.get_instance_all_proptags(instance_id)?)
        }
        R::GetInstanceProperties { instance_id, proptags } => {
            Response::Propvals(store.get_instance_properties(instance_id, &proptags)?)
        }
        R::SetInstanceProperties { instance_id, propvals } => {
            Response::Problems(store.set_instance_properties(instance_id, &propvals)?)
        }
        R::RemoveInstanceProperties { instance_id, proptags } => {
            store.remove_instance_properties(instance_id, &proptags)?;
            Response::Unit
        }
        R::CheckInstanceCycle { instance_id, message_id } => {
            Response::Bool(store.check_instance_cycle(instance_id, message_id)?)
        }
        R::EmptyMessageInstanceRcpts { instance_id } => {
            store.empty_message_instance_rcpts(instance_id)?;
            Response::Unit
        }
        R::GetMessageInstanceRcptsNum { instance_id } => {
            Response::U16(store.get_message_instance_rcpts_num(instance_id)?)
        }
        R::GetMessageInstanceRcptsAllProptags { instance_id } => {
            Response::Proptags(store.get_message_instance_rcpts_all_proptags(instance_id)?)
        }
        R::GetMessageInstanceRcpts { instance_id, row_id, need_count } => {
            Response::Rows(store.get_message_instance_rcpts(instance_id, row_id, need_count)?)
        }
        R::UpdateMessageInstanceRcpts { instance_id, rows } => {
            store.update_message_instance_rcpts(instance_id, &rows)?;
            Response::Unit
        }
        R::EmptyMessageInstanceAttachments { instance_id } => {
            store.empty_message_instance_attachments(instance_id)?;
            Response::Unit
        }
        R::GetMessageInstanceAttachmentsNum { instance_id } => {
            Response::U16(store.get_message_instance_attachments_num(instance_id)?)
        }
        R::GetMessageInstanceAttachmentTableAllProptags { instance_id } => {
            Response::Proptags(store.get_message_instance_attachment_table_all_proptags(instance_id)?)
        }
        R::QueryMessageInstanceAttachmentTable { instance_id, proptags, start_pos, row_needed } => {
            Response::Rows(store.query_message_instance_attachment_table(
                instance_id,
                &proptags,
                start_pos,
                row_needed,
            )?)
        }
        R::SetMessageInstanceConflict { instance_id, content } => {
            store.set_message_instance_conflict(instance_id, &content)?;
            Response::Unit
        }
        R::GetMessageRcpts { message_id } => Response::Rows(store.get_message_rcpts(message_id)?),
        R::GetMessageProperties { message_id, proptags } => {
            Response::Propvals(store.get_message_properties(message_id, &proptags)?)
        }
        R::SetMessageProperties { message_id, propvals } => {
            Response::Problems(store.set_message_properties(message_id, &propvals)?)
        }
        R::SetMessageReadState { username, message_id, mark_as_read } => {
            Response::U64(store.set_message_read_state(&username, message_id, mark_as_read)?)
        }
        R::RemoveMessageProperties { message_id, proptags } => {
            store.remove_message_properties(message_id, &proptags)?;
            Response::Unit
        }
        R::AllocateMessageId { folder_id } => Response::U64(store.allocate_message_id(folder_id)?),
        R::AllocateCn => Response::U64(store.allocate_cn()?),
        R::MarkModified { message_id } => {
            store.mark_modified(message_id)?;
            Response::Unit
        }
        R::GetMessageGroupId { message_id } => {
            Response::OptU32(store.get_message_group_id(message_id)?)
        }
        R::SetMessageGroupId { message_id, group_id } => {
            store.set_message_group_id(message_id, group_id)?;
            Response::Unit
        }
        R::SaveChangeIndices { message_id, cn, indices, ungrouped_proptags } => {
            store.save_change_indices(message_id, cn, &indices, &ungrouped_proptags)?;
            Response::Unit
        }
        R::GetChangeIndices { message_id, cn } => {
            let (indices, ungrouped_proptags) = store.get_change_indices(message_id, cn)?;
            Response::ChangeIndices { indices, ungrouped_proptags }
        }
        R::TryMarkSubmit { message_id } => Response::Bool(store.try_mark_submit(message_id)?),
        R::ClearSubmit { message_id } => {
            store.clear_submit(message_id)?;
            Response::Unit
        }
        R::LinkMessage { folder_id, message_id } => {
            store.link_message(folder_id, message_id)?;
            Response::Unit
        }
        R::UnlinkMessage { folder_id, message_id } => {
            store.unlink_message(folder_id, message_id)?;
            Response::Unit
        }
        R::RuleNewMessage { username, folder_id, message_id } => {
            store.rule_new_message(&username, folder_id, message_id)?;
            Response::Unit
        }
        R::SetMessageTimer { message_id, timer_id } => {
            store.set_message_timer(message_id, timer_id)?;
            Response::Unit
        }
        R::GetMessageTimer { message_id } => {
            Response::OptU32(store.get_message_timer(message_id)?)
        }
        R::EmptyFolderPermission { folder_id } => {
            store.empty_folder_permission(folder_id)?;
            Response::Unit
        }
        R::UpdateFolderPermission { folder_id, freebusy, ops } => {
            store.update_folder_permission(folder_id, freebusy, &ops)?;
            Response::Unit
        }
        R::EmptyFolderRule { folder_id } => {
            store.empty_folder_rule(folder_id)?;
            Response::Unit
        }
        R::UpdateFolderRule { folder_id, ops } => {
            store.update_folder_rule(folder_id, &ops)?;
            Response::Unit
        }
        R::WriteMessage { folder_id, content, fail_on_conflict } => {
            Response::U64(store.write_message(folder_id, &content, fail_on_conflict)?)
        }
        R::ReadMessage { message_id } => Response::Message(store.read_message(message_id)?),
        R::GetContentSync { folder_id, username, given, seen, seen_fai, read, flags } => {
            let given = parse_idset(&store, &given)?;
            let seen = parse_idset(&store, &seen)?;
            let seen_fai = parse_idset(&store, &seen_fai)?;
            let read = parse_idset(&store, &read)?;
            Response::ContentSync(store.get_content_sync(
                folder_id,
                username.as_deref(),
                &given,
                &seen,
                &seen_fai,
                &read,
                flags,
            )?)
        }
        R::GetHierarchySync { folder_id, username, given, seen } => {
            let given = parse_idset(&store, &given)?;
            let seen = parse_idset(&store, &seen)?;
            Response::HierarchySync(store.get_hierarchy_sync(
                folder_id,
                username.as_deref(),
                &given,
                &seen,
            )?)
        }
        R::AllocateIds { count } => Response::U64(store.allocate_ids(count)?),
        R::SubscribeNotification {
            remote_id,
            notification_type,
            whole,
            folder_id,
            message_id,
        } => Response::U32(store.subscribe_notification(
            remote_id.as_deref(),
            notification_type,
            whole,
            folder_id,
            message_id,
        )?),
        R::UnsubscribeNotification { sub_id } => {
            store.unsubscribe_notification(sub_id)?;
            Response::Unit
        }
        R::TransportNewMail { folder_id, message_id, message_flags, str_class } => {
            store.transport_new_mail(folder_id, message_id, message_flags, &str_class)?;
            Response::Unit
        }
        R::ReloadContentTable { table_id } => Response::U32(store.reload_content_table(table_id)?),
        R::CopyInstanceRcpts { src_instance, dst_instance } => {
            store.copy_instance_rcpts(src_instance, dst_instance)?;
            Response::Unit
        }
        R::CopyInstanceAttachments { src_instance, dst_instance } => {
            store.copy_instance_attachments(src_instance, dst_instance)?;
            Response::Unit
        }
        R::CheckContactAddress { address } => {
            Response::Bool(store.check_contact_address(&address)?)
        }
        R::GetPublicFolderUnreadCount { username, folder_id } => {
            Response::U32(store.get_public_folder_unread_count(&username, folder_id)?)
        }
        R::Vacuum => {
            store.vacuum()?;
            Response::Unit
        }
        R::GetFolderByClass { str_class } => {
            let (folder_id, rendered_class) = store.get_folder_by_class(&str_class)?;
            Response::FolderClass { folder_id, rendered_class }
        }
        R::LoadPermissionTable { folder_id, table_flags } => {
            let (table_id, row_count) = store.load_permission_table(folder_id, table_flags)?;
            Response::Table { table_id, row_count }
        }
        R::WriteMessageInstance { instance_id, content, force } => {
            Response::Problems(store.write_message_instance(instance_id, &content, force)?)
        }
        R::FlushInstance { instance_id } => Response::U64(store.flush_instance(instance_id)?),
        R::DeliverMessage { from_address, account, raw } => {
            let result = store.deliver_message(
                &from_address,
                &account,
                &raw,
                engine.limits.max_message,
            )?;
            match result {
                crate::store::delivery::DeliverResult::Delivered { folder_id, message_id } => {
                    Response::Delivered { folder_id, message_id, accepted: true }
                }
                crate::store::delivery::DeliverResult::Rejected => {
                    Response::Delivered { folder_id: 0, message_id: 0, accepted: false }
                }
            }
        }
        R::NotifyNewMail { folder_id, message_id } => {
            store.transport_new_mail(folder_id, message_id, 0, "IPM.Note")?;
            Response::Unit
        }
        R::StoreEidToUser { eid } => {
            let (username, store_dir) = store.store_eid_to_user(eid)?;
            Response::EidToUser { username, store_dir }
        }
        R::EmptyFolder { folder_id, flags } => Response::Bool(store.empty_folder(folder_id, flags)?),
        R::PurgeSoftdelete { folder_id, cutoff } => {
            store.purge_softdelete(folder_id, cutoff)?;
            Response::Unit
        }
        R::PurgeDatafiles => {
            store.purge_datafiles()?;
            Response::Unit
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema;
    use crate::store::Limits;

    #[test]
    fn dispatch_ping_and_folder_check() {
        let tmp = tempfile::tempdir().unwrap();
        schema::provision(tmp.path(), "u@example.com", true).unwrap();
        let engine = Engine::new(Limits::default());
        let dir = tmp.path().to_str().unwrap();

        let resp = dispatch(&engine, dir, StoreRequest::PingStore).unwrap();
        assert_eq!(resp, Response::Unit);

        let resp = dispatch(
            &engine,
            dir,
            StoreRequest::CheckFolderId { folder_id: crate::types::private_fid::INBOX },
        )
        .unwrap();
        assert_eq!(resp, Response::Bool(true));
    }

    #[test]
    fn unload_store_via_dispatch() {
        let tmp = tempfile::tempdir().unwrap();
        schema::provision(tmp.path(), "u@example.com", true).unwrap();
        let engine = Engine::new(Limits::default());
        let dir = tmp.path().to_str().unwrap();
        dispatch(&engine, dir, StoreRequest::PingStore).unwrap();
        dispatch(&engine, dir, StoreRequest::UnloadStore).unwrap();
        assert!(engine.open_dirs().is_empty());
    }
}
