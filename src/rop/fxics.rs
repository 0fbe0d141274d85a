//! FastTransfer and ICS contexts: the streaming producer/consumer state
//! behind `ropFastTransfer*` and `ropSync*`.

use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::exmdb::client::ExmdbClient;
use crate::exmdb::request::StoreRequest;
use crate::exmdb::response::Response;
use crate::ics::{IcsMode, IcsState, IdSet, ReplMapping, ReplType};
use crate::store::sync::ContentSyncFlags;
use crate::store::{AttachmentContent, MessageContent};
use crate::types::propval::{folder_type, tags, PropList, PropValue, TaggedPropval};
use crate::types::{EcError, EcResult, REPLID_LOCAL};

use super::ftstream::{markers, FtRecord, FtStreamParser, FtStreamProducer};

/// `ropFastTransferSourceGetBuffer` status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TransferStatus {
    Error = 0x0000,
    Partial = 0x0001,
    NoRoom = 0x0002,
    Done = 0x0003,
}

/// Replica mapping of a single-store logon: replid 1 is the mailbox GUID.
pub struct LogonMapping {
    pub guid: Uuid,
}

impl ReplMapping for LogonMapping {
    fn replid_to_guid(&self, replid: u16) -> Option<Uuid> {
        (replid == REPLID_LOCAL).then_some(self.guid)
    }
    fn guid_to_replid(&self, guid: Uuid) -> Option<u16> {
        (guid == self.guid).then_some(REPLID_LOCAL)
    }
}

fn expect_u64(resp: Response) -> EcResult<u64> {
    match resp {
        Response::U64(v) => Ok(v),
        _ => Err(EcError::RpcFormat),
    }
}

fn expect_message(resp: Response) -> EcResult<MessageContent> {
    match resp {
        Response::Message(m) => Ok(m),
        _ => Err(EcError::RpcFormat),
    }
}

/// Serialize one message into the stream within its scope markers.
fn stream_message(
    producer: &mut FtStreamProducer,
    content: &MessageContent,
    fai: bool,
    embedded: bool,
) -> EcResult<()> {
    let open = if embedded {
        markers::START_EMBED
    } else if fai {
        markers::START_FAI_MSG
    } else {
        markers::START_MESSAGE
    };
    producer.write_marker(open)?;
    producer.write_proplist(&content.props)?;
    for rcpt in &content.recipients {
        producer.write_marker(markers::START_RECIP)?;
        producer.write_proplist(rcpt)?;
        producer.write_marker(markers::END_TO_RECIP)?;
    }
    for att in &content.attachments {
        producer.write_marker(markers::NEW_ATTACH)?;
        producer.write_proplist(&att.props)?;
        if let Some(embedded_msg) = &att.embedded {
            stream_message(producer, embedded_msg, false, true)?;
        }
        producer.write_marker(markers::END_ATTACH)?;
    }
    producer.write_marker(if embedded { markers::END_EMBED } else { markers::END_MESSAGE })?;
    Ok(())
}

/// A configured FastTransfer download: the stream is fully produced at
/// configure time; `get_buffer` pages it out.
pub struct FastDownCtx {
    producer: FtStreamProducer,
}

impl FastDownCtx {
    /// Copy a full message (CopyTo / CopyProperties on a message).
    pub fn for_message(
        store_dir: &Path,
        client: &ExmdbClient,
        dir: &str,
        mid: u64,
        only_tags: Option<&[u32]>,
    ) -> EcResult<Self> {
        let content =
            expect_message(client.call(dir, StoreRequest::ReadMessage { message_id: mid })?)?;
        let content = filter_content(content, only_tags);
        let mut producer = FtStreamProducer::new(store_dir);
        stream_message(&mut producer, &content, false, false)?;
        Ok(Self { producer })
    }

    /// Copy a batch of messages (CopyMessages).
    pub fn for_messages(
        store_dir: &Path,
        client: &ExmdbClient,
        dir: &str,
        mids: &[u64],
    ) -> EcResult<Self> {
        let mut producer = FtStreamProducer::new(store_dir);
        for &mid in mids {
            let content =
                expect_message(client.call(dir, StoreRequest::ReadMessage { message_id: mid })?)?;
            let fai = content
                .props
                .get(tags::PR_ASSOCIATED)
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            stream_message(&mut producer, &content, fai, false)?;
        }
        Ok(Self { producer })
    }

    /// Copy a folder subtree (CopyFolder / CopyTo on a folder).
    pub fn for_folder(
        store_dir: &Path,
        client: &ExmdbClient,
        dir: &str,
        folder_id: u64,
        recursive: bool,
    ) -> EcResult<Self> {
        let mut producer = FtStreamProducer::new(store_dir);
        stream_folder(&mut producer, client, dir, folder_id, true, recursive)?;
        Ok(Self { producer })
    }

    pub fn get_buffer(&mut self, max_len: u32) -> EcResult<(Vec<u8>, TransferStatus)> {
        let (chunk, last) = self.producer.read_buffer(max_len)?;
        let status = if last { TransferStatus::Done } else { TransferStatus::Partial };
        Ok((chunk, status))
    }
}

fn filter_content(mut content: MessageContent, only_tags: Option<&[u32]>) -> MessageContent {
    if let Some(only) = only_tags {
        content.props = content
            .props
            .iter()
            .filter(|tp| only.contains(&tp.tag))
            .cloned()
            .collect();
    }
    content
}

fn stream_folder(
    producer: &mut FtStreamProducer,
    client: &ExmdbClient,
    dir: &str,
    folder_id: u64,
    top: bool,
    recursive: bool,
) -> EcResult<()> {
    producer.write_marker(if top { markers::START_TOP_FLD } else { markers::START_SUB_FLD })?;
    let props = match client.call(
        dir,
        StoreRequest::GetFolderProperties {
            folder_id,
            proptags: vec![
                tags::PR_DISPLAY_NAME,
                tags::PR_COMMENT,
                tags::PR_CREATION_TIME,
                tags::PR_LAST_MODIFICATION_TIME,
                tags::PR_CHANGE_KEY,
                tags::PR_PREDECESSOR_CHANGE_LIST,
                tags::PR_SOURCE_KEY,
                tags::PR_CONTAINER_CLASS,
            ],
        },
    )? {
        Response::Propvals(p) => p,
        _ => return Err(EcError::RpcFormat),
    };
    producer.write_proplist(&props)?;
    let mids = match client.call(dir, StoreRequest::QueryFolderMessages { folder_id })? {
        Response::Rows(rows) => rows
            .iter()
            .filter_map(|r| r.get(tags::PR_MID).and_then(|v| v.as_u64()))
            .collect::<Vec<_>>(),
        _ => return Err(EcError::RpcFormat),
    };
    for mid in mids {
        let content =
            expect_message(client.call(dir, StoreRequest::ReadMessage { message_id: mid })?)?;
        stream_message(producer, &content, false, false)?;
    }
    if recursive {
        let (table_id, _) = match client.call(
            dir,
            StoreRequest::LoadHierarchyTable {
                folder_id,
                username: None,
                table_flags: 0,
                restriction: None,
            },
        )? {
            Response::Table { table_id, row_count } => (table_id, row_count),
            _ => return Err(EcError::RpcFormat),
        };
        let rows = match client.call(
            dir,
            StoreRequest::QueryTable {
                table_id,
                proptags: vec![tags::PR_FOLDER_ID],
                start_pos: 0,
                row_needed: -1,
            },
        )? {
            Response::Rows(rows) => rows,
            _ => return Err(EcError::RpcFormat),
        };
        let _ = client.call(dir, StoreRequest::UnloadTable { table_id });
        for row in rows {
            if let Some(child) = row.get(tags::PR_FOLDER_ID).and_then(|v| v.as_u64()) {
                stream_folder(producer, client, dir, child, false, true)?;
            }
        }
    }
    producer.write_marker(markers::END_FOLDER)?;
    Ok(())
}

enum UploadScope {
    Folder { folder_id: u64, props: PropList, materialized: bool },
    Message { content: MessageContent, fai: bool },
    Recipient { props: PropList },
    Attachment { content: AttachmentContent },
    Embedded { content: MessageContent },
    /// ICS change header between INCRSYNCCHG and INCRSYNCMESSAGE.
    IcsHeader { props: PropList },
    /// Swallows stream-level meta properties (deletions, state blocks).
    Meta,
}

/// A configured FastTransfer upload: consumes stream chunks, rebuilding
/// folders and messages through store calls as scopes close.
pub struct FastUpCtx {
    dir: String,
    parser: FtStreamParser,
    scopes: Vec<UploadScope>,
    root_folder_id: u64,
    /// Message ids created by this upload, in commit order.
    pub imported: Vec<u64>,
}

impl FastUpCtx {
    pub fn new(dir: &str, target_folder: u64) -> Self {
        Self {
            dir: dir.to_owned(),
            parser: FtStreamParser::new(),
            scopes: Vec::new(),
            root_folder_id: target_folder,
            imported: Vec::new(),
        }
    }

    fn current_folder(&self) -> u64 {
        for scope in self.scopes.iter().rev() {
            if let UploadScope::Folder { folder_id, materialized: true, .. } = scope {
                return *folder_id;
            }
        }
        self.root_folder_id
    }

    /// Make sure the innermost folder scope exists in the store; folders
    /// materialize lazily once their property run is complete.
    fn materialize_folder(&mut self, client: &ExmdbClient) -> EcResult<()> {
        let parent = {
            let mut parent = self.root_folder_id;
            for scope in self.scopes.iter() {
                if let UploadScope::Folder { folder_id, materialized: true, .. } = scope {
                    parent = *folder_id;
                }
            }
            parent
        };
        let dir = self.dir.clone();
        if let Some(UploadScope::Folder { folder_id, props, materialized }) =
            self.scopes.last_mut()
        {
            if *materialized {
                return Ok(());
            }
            let name = props
                .get(tags::PR_DISPLAY_NAME)
                .and_then(|v| v.as_str())
                .map(str::to_owned)
                .unwrap_or_else(|| "Imported Folder".to_owned());
            let resp = client.call(
                &dir,
                StoreRequest::CreateFolderByProperties {
                    parent_id: parent,
                    folder_type: folder_type::GENERIC,
                    str_name: name,
                    propvals: props.clone(),
                    open_existing: true,
                },
            )?;
            let Response::CreatedFolder { folder_id: fid, .. } = resp else {
                return Err(EcError::RpcFormat);
            };
            *folder_id = fid;
            *materialized = true;
        }
        Ok(())
    }

    /// Feed one chunk; on return every complete record has been applied.
    pub fn put_buffer(&mut self, client: &ExmdbClient, bytes: &[u8]) -> EcResult<u16> {
        self.parser.feed(bytes)?;
        while let Some(record) = self.parser.next()? {
            self.apply(client, record)?;
        }
        Ok(TransferStatus::Done as u16)
    }

    fn apply(&mut self, client: &ExmdbClient, record: FtRecord) -> EcResult<()> {
        // a meta scope ends at the next marker
        if matches!(record, FtRecord::Marker(_))
            && matches!(self.scopes.last(), Some(UploadScope::Meta))
        {
            self.scopes.pop();
        }
        match record {
            FtRecord::Marker(markers::START_TOP_FLD) => {
                self.scopes.push(UploadScope::Folder {
                    folder_id: self.root_folder_id,
                    props: PropList::new(),
                    materialized: true,
                });
            }
            FtRecord::Marker(markers::START_SUB_FLD) => {
                self.scopes.push(UploadScope::Folder {
                    folder_id: 0,
                    props: PropList::new(),
                    materialized: false,
                });
            }
            FtRecord::Marker(markers::END_FOLDER) => {
                // an empty folder still has to exist
                if matches!(
                    self.scopes.last(),
                    Some(UploadScope::Folder { materialized: false, .. })
                ) {
                    self.materialize_folder(client)?;
                }
                match self.scopes.pop() {
                    Some(UploadScope::Folder { .. }) => {}
                    _ => return Err(EcError::RpcFormat),
                }
            }
            FtRecord::Marker(m @ (markers::START_MESSAGE | markers::START_FAI_MSG)) => {
                if matches!(
                    self.scopes.last(),
                    Some(UploadScope::Folder { materialized: false, .. })
                ) {
                    self.materialize_folder(client)?;
                }
                self.scopes.push(UploadScope::Message {
                    content: MessageContent::default(),
                    fai: m == markers::START_FAI_MSG,
                });
            }
            FtRecord::Marker(markers::END_MESSAGE) => {
                let Some(UploadScope::Message { mut content, fai }) = self.scopes.pop() else {
                    return Err(EcError::RpcFormat);
                };
                if fai {
                    content.props.set(tags::PR_ASSOCIATED, PropValue::Bool(true));
                }
                // the importing store mints local ids and source keys;
                // clients of the source replica re-download
                content.props.remove(tags::PR_MID);
                content.props.remove(tags::PR_SOURCE_KEY);
                content.props.remove(tags::PR_PARENT_SOURCE_KEY);
                let folder_id = self.current_folder();
                let mid = expect_u64(client.call(
                    &self.dir,
                    StoreRequest::WriteMessage { folder_id, content, fail_on_conflict: false },
                )?)?;
                self.imported.push(mid);
            }
            FtRecord::Marker(markers::START_RECIP) => {
                self.scopes.push(UploadScope::Recipient { props: PropList::new() });
            }
            FtRecord::Marker(markers::END_TO_RECIP) => {
                let Some(UploadScope::Recipient { props }) = self.scopes.pop() else {
                    return Err(EcError::RpcFormat);
                };
                match self.scopes.last_mut() {
                    Some(
                        UploadScope::Message { content, .. }
                        | UploadScope::Embedded { content },
                    ) => content.recipients.push(props),
                    _ => return Err(EcError::RpcFormat),
                }
            }
            FtRecord::Marker(markers::NEW_ATTACH) => {
                self.scopes.push(UploadScope::Attachment {
                    content: AttachmentContent::default(),
                });
            }
            FtRecord::Marker(markers::END_ATTACH) => {
                let Some(UploadScope::Attachment { content }) = self.scopes.pop() else {
                    return Err(EcError::RpcFormat);
                };
                match self.scopes.last_mut() {
                    Some(
                        UploadScope::Message { content: msg, .. }
                        | UploadScope::Embedded { content: msg },
                    ) => msg.attachments.push(content),
                    _ => return Err(EcError::RpcFormat),
                }
            }
            FtRecord::Marker(markers::START_EMBED) => {
                if !matches!(self.scopes.last(), Some(UploadScope::Attachment { .. })) {
                    return Err(EcError::RpcFormat);
                }
                self.scopes.push(UploadScope::Embedded { content: MessageContent::default() });
            }
            FtRecord::Marker(markers::END_EMBED) => {
                let Some(UploadScope::Embedded { content }) = self.scopes.pop() else {
                    return Err(EcError::RpcFormat);
                };
                match self.scopes.last_mut() {
                    Some(UploadScope::Attachment { content: att }) => {
                        att.embedded = Some(Box::new(content));
                    }
                    _ => return Err(EcError::RpcFormat),
                }
            }
            FtRecord::Marker(markers::INCR_SYNC_CHG | markers::INCR_SYNC_CHG_PARTIAL) => {
                self.scopes.push(UploadScope::IcsHeader { props: PropList::new() });
            }
            FtRecord::Marker(markers::INCR_SYNC_MESSAGE) => {
                let Some(UploadScope::IcsHeader { props }) = self.scopes.pop() else {
                    return Err(EcError::RpcFormat);
                };
                let fai = props
                    .get(tags::PR_ASSOCIATED)
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                self.scopes.push(UploadScope::Message {
                    content: MessageContent::default(),
                    fai,
                });
            }
            FtRecord::Marker(
                markers::INCR_SYNC_DEL
                | markers::INCR_SYNC_READ
                | markers::INCR_SYNC_STATE_BEGIN,
            ) => {
                self.scopes.push(UploadScope::Meta);
            }
            FtRecord::Marker(markers::INCR_SYNC_END) => {
                if !self.scopes.is_empty() {
                    return Err(EcError::RpcFormat);
                }
            }
            FtRecord::Marker(_) => {
                // remaining markers (state end, progress) carry no scope
            }
            FtRecord::Prop(tp) => match self.scopes.last_mut() {
                Some(UploadScope::Folder { props, .. })
                | Some(UploadScope::IcsHeader { props }) => props.push(tp),
                Some(
                    UploadScope::Message { content, .. } | UploadScope::Embedded { content },
                ) => content.props.push(tp),
                Some(UploadScope::Recipient { props }) => props.push(tp),
                Some(UploadScope::Attachment { content }) => content.props.push(tp),
                Some(UploadScope::Meta) | None => {
                    // stream-level meta property (idsets, progress): the
                    // importing store mints its own identities
                }
            },
        }
        Ok(())
    }
}

/// Which object class an ICS download covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncScope {
    Contents,
    Hierarchy,
}

/// `ropSyncConfigure` download context: derives the delta lazily on the
/// first `get_buffer`, streams it FastTransfer-style, and finishes with
/// the updated state block.
pub struct IcsDownCtx {
    dir: String,
    folder_id: u64,
    username: Option<String>,
    scope: SyncScope,
    flags: ContentSyncFlags,
    pub state: IcsState,
    mapping: Arc<LogonMapping>,
    producer: FtStreamProducer,
    produced: bool,
}

impl IcsDownCtx {
    pub fn new(
        store_dir: &Path,
        dir: &str,
        folder_id: u64,
        username: Option<&str>,
        scope: SyncScope,
        flags: ContentSyncFlags,
        replica_guid: Uuid,
    ) -> Self {
        let mapping = Arc::new(LogonMapping { guid: replica_guid });
        let mode = match scope {
            SyncScope::Contents => IcsMode::ContentsDown,
            SyncScope::Hierarchy => IcsMode::HierarchyDown,
        };
        Self {
            dir: dir.to_owned(),
            folder_id,
            username: username.map(str::to_owned),
            scope,
            flags,
            state: IcsState::new(mode, mapping.clone()),
            mapping,
            producer: FtStreamProducer::new(store_dir),
            produced: false,
        }
    }

    /// Restore client-supplied state (`ropSyncUploadStateStream*`).
    pub fn restore_state(&mut self, blob: &[u8]) -> EcResult<()> {
        self.state.deserialize(blob, self.mapping.clone() as Arc<dyn ReplMapping>)
    }

    pub fn get_buffer(
        &mut self,
        client: &ExmdbClient,
        max_len: u32,
    ) -> EcResult<(Vec<u8>, TransferStatus)> {
        if !self.produced {
            match self.scope {
                SyncScope::Contents => self.produce_contents(client)?,
                SyncScope::Hierarchy => self.produce_hierarchy(client)?,
            }
            self.produced = true;
        }
        let (chunk, last) = self.producer.read_buffer(max_len)?;
        let status = if last { TransferStatus::Done } else { TransferStatus::Partial };
        Ok((chunk, status))
    }

    fn produce_contents(&mut self, client: &ExmdbClient) -> EcResult<()> {
        let delta = match client.call(
            &self.dir,
            StoreRequest::GetContentSync {
                folder_id: self.folder_id,
                username: self.username.clone(),
                given: self.state.given()?.serialize(ReplType::Guid)?,
                seen: self.state.seen().serialize(ReplType::Guid)?,
                seen_fai: self.state.seen_fai()?.serialize(ReplType::Guid)?,
                read: self.state.read()?.serialize(ReplType::Guid)?,
                flags: self.flags,
            },
        )? {
            Response::ContentSync(delta) => delta,
            _ => return Err(EcError::RpcFormat),
        };

        for (mids, fai) in [(&delta.normal_mids, false), (&delta.fai_mids, true)] {
            for &mid in mids.iter() {
                let content = expect_message(
                    client.call(&self.dir, StoreRequest::ReadMessage { message_id: mid })?,
                )?;
                self.producer.write_marker(markers::INCR_SYNC_CHG)?;
                let mut header = PropList::new();
                for tag in [
                    tags::PR_SOURCE_KEY,
                    tags::PR_LAST_MODIFICATION_TIME,
                    tags::PR_CHANGE_KEY,
                    tags::PR_PREDECESSOR_CHANGE_LIST,
                    tags::PR_MID,
                ] {
                    if let Some(v) = content.props.get(tag) {
                        header.set(tag, v.clone());
                    }
                }
                header.set(tags::PR_ASSOCIATED, PropValue::Bool(fai));
                self.producer.write_proplist(&header)?;
                self.producer.write_marker(markers::INCR_SYNC_MESSAGE)?;
                stream_message_body(&mut self.producer, &content)?;
                self.state.given_mut()?.append(mid);
            }
        }
        // everything up to the delta horizon counts as seen
        if delta.last_cn > 0 {
            self.state.seen_mut().append_range(REPLID_LOCAL, 1, delta.last_cn);
            self.state.seen_fai_mut()?.append_range(REPLID_LOCAL, 1, delta.last_cn);
        }

        if !delta.deleted_mids.is_empty() || !delta.nolonger_mids.is_empty() {
            self.producer.write_marker(markers::INCR_SYNC_DEL)?;
            let mut gone = IdSet::with_mapping(self.mapping.clone());
            for &mid in delta.deleted_mids.iter().chain(&delta.nolonger_mids) {
                gone.append(mid);
                self.state.given_mut()?.remove(mid);
            }
            self.producer.write_propval(&TaggedPropval::new(
                tags::META_TAG_IDSET_DELETED,
                PropValue::Binary(gone.serialize(ReplType::Guid)?),
            ))?;
        }

        if self.flags.read_state && (!delta.read_mids.is_empty() || !delta.unread_mids.is_empty())
        {
            self.producer.write_marker(markers::INCR_SYNC_READ)?;
            for (mids, tag) in [
                (&delta.read_mids, tags::META_TAG_IDSET_READ),
                (&delta.unread_mids, tags::META_TAG_IDSET_UNREAD),
            ] {
                if mids.is_empty() {
                    continue;
                }
                let mut set = IdSet::with_mapping(self.mapping.clone());
                for &mid in mids.iter() {
                    set.append(mid);
                }
                self.producer.write_propval(&TaggedPropval::new(
                    tag,
                    PropValue::Binary(set.serialize(ReplType::Guid)?),
                ))?;
            }
        }
        if delta.last_readcn > 0 {
            self.state.read_mut()?.append_range(REPLID_LOCAL, 1, delta.last_readcn);
        }

        self.write_state_block()?;
        self.producer.write_marker(markers::INCR_SYNC_END)?;
        Ok(())
    }

    fn produce_hierarchy(&mut self, client: &ExmdbClient) -> EcResult<()> {
        let delta = match client.call(
            &self.dir,
            StoreRequest::GetHierarchySync {
                folder_id: self.folder_id,
                username: self.username.clone(),
                given: self.state.given()?.serialize(ReplType::Guid)?,
                seen: self.state.seen().serialize(ReplType::Guid)?,
            },
        )? {
            Response::HierarchySync(delta) => delta,
            _ => return Err(EcError::RpcFormat),
        };
        for &fid in &delta.changed_fids {
            let props = match client.call(
                &self.dir,
                StoreRequest::GetFolderProperties {
                    folder_id: fid,
                    proptags: vec![
                        tags::PR_FOLDER_ID,
                        tags::PR_PARENT_FID,
                        tags::PR_DISPLAY_NAME,
                        tags::PR_CONTAINER_CLASS,
                        tags::PR_CHANGE_KEY,
                        tags::PR_PREDECESSOR_CHANGE_LIST,
                        tags::PR_SOURCE_KEY,
                        tags::PR_LAST_MODIFICATION_TIME,
                    ],
                },
            )? {
                Response::Propvals(p) => p,
                _ => return Err(EcError::RpcFormat),
            };
            self.producer.write_marker(markers::INCR_SYNC_CHG)?;
            self.producer.write_proplist(&props)?;
            self.state.given_mut()?.append(fid);
        }
        if delta.last_cn > 0 {
            self.state.seen_mut().append_range(REPLID_LOCAL, 1, delta.last_cn);
        }
        if !delta.deleted_fids.is_empty() {
            self.producer.write_marker(markers::INCR_SYNC_DEL)?;
            let mut gone = IdSet::with_mapping(self.mapping.clone());
            for &fid in &delta.deleted_fids {
                gone.append(fid);
                self.state.given_mut()?.remove(fid);
            }
            self.producer.write_propval(&TaggedPropval::new(
                tags::META_TAG_IDSET_DELETED,
                PropValue::Binary(gone.serialize(ReplType::Guid)?),
            ))?;
        }
        self.write_state_block()?;
        self.producer.write_marker(markers::INCR_SYNC_END)?;
        Ok(())
    }

    fn write_state_block(&mut self) -> EcResult<()> {
        self.producer.write_marker(markers::INCR_SYNC_STATE_BEGIN)?;
        let blob = self.state.serialize()?;
        self.producer.write_propval(&TaggedPropval::new(
            tags::META_TAG_IDSET_GIVEN,
            PropValue::Binary(blob),
        ))?;
        self.producer.write_marker(markers::INCR_SYNC_STATE_END)?;
        Ok(())
    }

    /// Serialized state for `ropSyncGetTransferState`.
    pub fn transfer_state(&self) -> EcResult<Vec<u8>> {
        self.state.serialize()
    }
}

fn stream_message_body(
    producer: &mut FtStreamProducer,
    content: &MessageContent,
) -> EcResult<()> {
    producer.write_proplist(&content.props)?;
    for rcpt in &content.recipients {
        producer.write_marker(markers::START_RECIP)?;
        producer.write_proplist(rcpt)?;
        producer.write_marker(markers::END_TO_RECIP)?;
    }
    for att in &content.attachments {
        producer.write_marker(markers::NEW_ATTACH)?;
        producer.write_proplist(&att.props)?;
        if let Some(embedded) = &att.embedded {
            stream_message(producer, embedded, false, true)?;
        }
        producer.write_marker(markers::END_ATTACH)?;
    }
    producer.write_marker(markers::END_MESSAGE)?;
    Ok(())
}

/// `ropSyncOpenCollector` upload context: applies imported changes and
/// keeps the server-side state current.
pub struct IcsUpCtx {
    dir: String,
    pub folder_id: u64,
    pub state: IcsState,
    mapping: Arc<LogonMapping>,
    /// In-flight `ropSyncUploadStateStream` run: target meta-tag + bytes.
    state_stream: Option<(u32, Vec<u8>)>,
}

impl IcsUpCtx {
    pub fn new(dir: &str, folder_id: u64, contents: bool, replica_guid: Uuid) -> Self {
        let mapping = Arc::new(LogonMapping { guid: replica_guid });
        let mode = if contents { IcsMode::ContentsUp } else { IcsMode::HierarchyUp };
        Self {
            dir: dir.to_owned(),
            folder_id,
            state: IcsState::new(mode, mapping.clone()),
            mapping,
            state_stream: None,
        }
    }

    pub fn state_stream_begin(&mut self, proptag: u32) -> EcResult<()> {
        if self.state_stream.is_some() {
            return Err(EcError::NotSupported);
        }
        self.state_stream = Some((proptag, Vec::new()));
        Ok(())
    }

    pub fn state_stream_continue(&mut self, bytes: &[u8]) -> EcResult<()> {
        match &mut self.state_stream {
            Some((_, buf)) => {
                buf.extend_from_slice(bytes);
                Ok(())
            }
            None => Err(EcError::NotInitialized),
        }
    }

    pub fn state_stream_end(&mut self) -> EcResult<()> {
        let (proptag, blob) = self.state_stream.take().ok_or(EcError::NotInitialized)?;
        let mapping = self.mapping.clone() as Arc<dyn ReplMapping>;
        let restore = |set_blob: &[u8]| -> EcResult<IdSet> {
            let mut set = IdSet::deserialize(set_blob, ReplType::Guid)?;
            set.register_mapping(mapping.clone());
            set.resolve()?;
            Ok(set)
        };
        match proptag {
            tags::META_TAG_IDSET_GIVEN => *self.state.given_mut()? = restore(&blob)?,
            tags::META_TAG_CNSET_SEEN => *self.state.seen_mut() = restore(&blob)?,
            tags::META_TAG_CNSET_SEEN_FAI => *self.state.seen_fai_mut()? = restore(&blob)?,
            tags::META_TAG_CNSET_READ => *self.state.read_mut()? = restore(&blob)?,
            _ => return Err(EcError::InvalidParam),
        }
        Ok(())
    }

    /// Import one message change; the new change number rolls into the
    /// seen set so the next state round-trip reflects the commit.
    pub fn import_message_change(
        &mut self,
        client: &ExmdbClient,
        mut content: MessageContent,
        fail_on_conflict: bool,
    ) -> EcResult<u64> {
        let fai = content
            .props
            .get(tags::PR_ASSOCIATED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        content.props.remove(tags::PR_MID);
        let mid = expect_u64(client.call(
            &self.dir,
            StoreRequest::WriteMessage {
                folder_id: self.folder_id,
                content,
                fail_on_conflict,
            },
        )?)?;
        let cn = match client.call(
            &self.dir,
            StoreRequest::GetMessageProperties {
                message_id: mid,
                proptags: vec![tags::PR_CHANGE_NUMBER],
            },
        )? {
            Response::Propvals(p) => {
                p.get(tags::PR_CHANGE_NUMBER).and_then(|v| v.as_u64()).unwrap_or(0)
            }
            _ => 0,
        };
        self.state.given_mut()?.append(mid);
        if cn != 0 {
            if fai {
                self.state.seen_fai_mut()?.append(cn);
            } else {
                self.state.seen_mut().append(cn);
            }
        }
        Ok(mid)
    }

    pub fn import_read_state(
        &mut self,
        client: &ExmdbClient,
        username: &str,
        changes: &[(u64, bool)],
    ) -> EcResult<()> {
        for &(mid, read) in changes {
            let cn = expect_u64(client.call(
                &self.dir,
                StoreRequest::SetMessageReadState {
                    username: username.to_owned(),
                    message_id: mid,
                    mark_as_read: read,
                },
            )?)?;
            self.state.read_mut()?.append(cn);
        }
        Ok(())
    }

    pub fn import_hierarchy_change(
        &mut self,
        client: &ExmdbClient,
        parent_id: u64,
        props: &PropList,
    ) -> EcResult<u64> {
        let name = props
            .get(tags::PR_DISPLAY_NAME)
            .and_then(|v| v.as_str())
            .ok_or(EcError::InvalidParam)?;
        let resp = client.call(
            &self.dir,
            StoreRequest::CreateFolderByProperties {
                parent_id,
                folder_type: folder_type::GENERIC,
                str_name: name.to_owned(),
                propvals: props.clone(),
                open_existing: true,
            },
        )?;
        let Response::CreatedFolder { folder_id, .. } = resp else {
            return Err(EcError::RpcFormat);
        };
        self.state.seen_mut().append(folder_id);
        Ok(folder_id)
    }

    pub fn import_deletes(
        &mut self,
        client: &ExmdbClient,
        mids: &[u64],
        hard: bool,
    ) -> EcResult<bool> {
        let resp = client.call(
            &self.dir,
            StoreRequest::DeleteMessages {
                folder_id: self.folder_id,
                message_ids: mids.to_vec(),
                hard,
            },
        )?;
        for &mid in mids {
            self.state.given_mut()?.remove(mid);
        }
        match resp {
            Response::Bool(partial) => Ok(partial),
            _ => Err(EcError::RpcFormat),
        }
    }

    pub fn import_message_move(
        &mut self,
        client: &ExmdbClient,
        src_mid: u64,
        dst_mid: u64,
    ) -> EcResult<()> {
        match client.call(
            &self.dir,
            StoreRequest::MovecopyMessage {
                message_id: src_mid,
                dst_fid: self.folder_id,
                dst_id: dst_mid,
                b_move: true,
            },
        )? {
            Response::Unit => {
                self.state.given_mut()?.append(dst_mid);
                Ok(())
            }
            _ => Err(EcError::RpcFormat),
        }
    }

    pub fn transfer_state(&self) -> EcResult<Vec<u8>> {
        self.state.serialize()
    }
}
