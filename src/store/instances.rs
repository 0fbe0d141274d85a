//! Instances: mutable scratch copies of messages and attachments.
//!
//! An instance lives in memory until `flush_instance` commits it under a
//! transaction (with change-number allocation and a staleness check
//! against the stored row) or `unload_instance` discards it. Readers of
//! the underlying message never see unflushed edits.

use crate::types::propval::{tags, PropList, PropValue};
use crate::types::{eid_gc, make_eid, EcError, EcResult, REPLID_LOCAL};

use super::messages::{
    self, is_computed_message_tag, message_row, read_message_content, touch_folder_quiet,
    write_message_content,
};
use super::notify::DbNotify;
use super::{allocate_eid, lock, AttachmentContent, MessageContent, Store};

#[derive(Debug, Clone)]
pub enum InstanceContent {
    Message(MessageContent),
    Attachment(AttachmentContent),
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: u32,
    /// Parent instance for attachment and embedded-message instances.
    pub parent: Option<u32>,
    pub folder_id: u64,
    /// Backing message id; 0 for a brand-new message.
    pub message_id: u64,
    /// Change number of the row when the instance was loaded; flush
    /// cross-checks it to reject writes over a newer committed state.
    pub loaded_cn: u64,
    pub b_new: bool,
    pub b_fai: bool,
    pub content: InstanceContent,
}

impl Instance {
    /// Backing message id, when the instance edits a persisted message.
    pub fn message_id(&self) -> Option<u64> {
        (self.message_id != 0 && matches!(self.content, InstanceContent::Message(_)))
            .then_some(self.message_id)
    }

    fn as_message(&self) -> EcResult<&MessageContent> {
        match &self.content {
            InstanceContent::Message(m) => Ok(m),
            InstanceContent::Attachment(_) => Err(EcError::NotSupported),
        }
    }

    fn as_message_mut(&mut self) -> EcResult<&mut MessageContent> {
        match &mut self.content {
            InstanceContent::Message(m) => Ok(m),
            InstanceContent::Attachment(_) => Err(EcError::NotSupported),
        }
    }

    fn as_attachment_mut(&mut self) -> EcResult<&mut AttachmentContent> {
        match &mut self.content {
            InstanceContent::Attachment(a) => Ok(a),
            InstanceContent::Message(_) => Err(EcError::NotSupported),
        }
    }
}

impl Store {
    fn with_instance<T>(
        &self,
        instance_id: u32,
        f: impl FnOnce(&mut Instance) -> EcResult<T>,
    ) -> EcResult<T> {
        let mut map = lock(&self.instances);
        let inst = map.get_mut(&instance_id).ok_or(EcError::NullObject)?;
        f(inst)
    }

    /// Open an instance over an existing message, or a blank one when
    /// `b_new` (the message id is allocated at flush).
    pub fn load_message_instance(
        &self,
        folder_id: u64,
        mid: u64,
        b_new: bool,
        b_fai: bool,
    ) -> EcResult<u32> {
        let (content, loaded_cn, message_id) = if b_new {
            (MessageContent::default(), 0, mid)
        } else {
            let conn = self.reader()?;
            let row = message_row(&conn, mid)?.ok_or(EcError::NotFound)?;
            (read_message_content(self, &conn, mid)?, row.change_number, mid)
        };
        let id = self.next_instance_id();
        lock(&self.instances).insert(
            id,
            Instance {
                id,
                parent: None,
                folder_id,
                message_id,
                loaded_cn,
                b_new,
                b_fai,
                content: InstanceContent::Message(content),
            },
        );
        Ok(id)
    }

    /// Open the embedded message of an attachment instance.
    pub fn load_embedded_instance(&self, attachment_instance: u32, b_new: bool) -> EcResult<u32> {
        let (folder_id, content) = self.with_instance(attachment_instance, |inst| {
            let folder_id = inst.folder_id;
            let att = inst.as_attachment_mut()?;
            let content = match (&att.embedded, b_new) {
                (Some(m), _) => (**m).clone(),
                (None, true) => MessageContent::default(),
                (None, false) => return Err(EcError::NotFound),
            };
            Ok((folder_id, content))
        })?;
        let id = self.next_instance_id();
        lock(&self.instances).insert(
            id,
            Instance {
                id,
                parent: Some(attachment_instance),
                folder_id,
                message_id: 0,
                loaded_cn: 0,
                b_new,
                b_fai: false,
                content: InstanceContent::Message(content),
            },
        );
        Ok(id)
    }

    /// Change number of the embedded message, if the instance carries one.
    pub fn get_embedded_cn(&self, instance_id: u32) -> EcResult<Option<u64>> {
        self.with_instance(instance_id, |inst| {
            let m = inst.as_message()?;
            Ok(m.props.get(tags::PR_CHANGE_NUMBER).and_then(|v| v.as_u64()))
        })
    }

    /// Re-read the backing row, discarding in-memory edits.
    pub fn reload_message_instance(&self, instance_id: u32) -> EcResult<()> {
        let (mid,) = self.with_instance(instance_id, |inst| {
            if inst.b_new || inst.message_id == 0 {
                return Err(EcError::NotSupported);
            }
            Ok((inst.message_id,))
        })?;
        let conn = self.reader()?;
        let row = message_row(&conn, mid)?.ok_or(EcError::ObjectDeleted)?;
        let content = read_message_content(self, &conn, mid)?;
        self.with_instance(instance_id, |inst| {
            inst.content = InstanceContent::Message(content);
            inst.loaded_cn = row.change_number;
            inst.b_new = false;
            Ok(())
        })
    }

    pub fn clear_message_instance(&self, instance_id: u32) -> EcResult<()> {
        self.with_instance(instance_id, |inst| {
            *inst.as_message_mut()? = MessageContent::default();
            Ok(())
        })
    }

    pub fn read_message_instance(&self, instance_id: u32) -> EcResult<MessageContent> {
        self.with_instance(instance_id, |inst| inst.as_message().cloned())
    }

    /// Replace instance content wholesale (FastTransfer upload path).
    pub fn write_message_instance(
        &self,
        instance_id: u32,
        content: &MessageContent,
        force: bool,
    ) -> EcResult<Vec<u32>> {
        self.with_instance(instance_id, |inst| {
            let m = inst.as_message_mut()?;
            let mut problems = Vec::new();
            if force {
                *m = content.clone();
            } else {
                for tp in content.props.iter() {
                    if is_computed_message_tag(tp.tag) {
                        problems.push(tp.tag);
                        continue;
                    }
                    m.props.set(tp.tag, tp.value.clone());
                }
                if !content.recipients.is_empty() {
                    m.recipients = content.recipients.clone();
                }
                if !content.attachments.is_empty() {
                    m.attachments = content.attachments.clone();
                }
            }
            Ok(problems)
        })
    }

    pub fn load_attachment_instance(
        &self,
        message_instance: u32,
        attachment_num: u32,
    ) -> EcResult<u32> {
        let (folder_id, att) = self.with_instance(message_instance, |inst| {
            let folder_id = inst.folder_id;
            let m = inst.as_message()?;
            let att = m
                .attachments
                .get(attachment_num as usize)
                .cloned()
                .ok_or(EcError::NotFound)?;
            Ok((folder_id, att))
        })?;
        let id = self.next_instance_id();
        lock(&self.instances).insert(
            id,
            Instance {
                id,
                parent: Some(message_instance),
                folder_id,
                message_id: 0,
                loaded_cn: 0,
                b_new: false,
                b_fai: false,
                content: InstanceContent::Attachment(att),
            },
        );
        Ok(id)
    }

    pub fn create_attachment_instance(&self, message_instance: u32) -> EcResult<(u32, u32)> {
        let (folder_id, num) = self.with_instance(message_instance, |inst| {
            let folder_id = inst.folder_id;
            let m = inst.as_message_mut()?;
            let num = m.attachments.len() as u32;
            let mut att = AttachmentContent::default();
            att.props.set(tags::PR_ATTACH_NUM, PropValue::Long(num));
            m.attachments.push(att.clone());
            Ok((folder_id, num))
        })?;
        let id = self.next_instance_id();
        let mut att = AttachmentContent::default();
        att.props.set(tags::PR_ATTACH_NUM, PropValue::Long(num));
        lock(&self.instances).insert(
            id,
            Instance {
                id,
                parent: Some(message_instance),
                folder_id,
                message_id: 0,
                loaded_cn: 0,
                b_new: true,
                b_fai: false,
                content: InstanceContent::Attachment(att),
            },
        );
        Ok((id, num))
    }

    pub fn read_attachment_instance(&self, instance_id: u32) -> EcResult<AttachmentContent> {
        self.with_instance(instance_id, |inst| match &inst.content {
            InstanceContent::Attachment(a) => Ok(a.clone()),
            InstanceContent::Message(_) => Err(EcError::NotSupported),
        })
    }

    pub fn write_attachment_instance(
        &self,
        instance_id: u32,
        content: &AttachmentContent,
        force: bool,
    ) -> EcResult<Vec<u32>> {
        self.with_instance(instance_id, |inst| {
            let a = inst.as_attachment_mut()?;
            if force {
                *a = content.clone();
            } else {
                for tp in content.props.iter() {
                    a.props.set(tp.tag, tp.value.clone());
                }
                if content.embedded.is_some() {
                    a.embedded = content.embedded.clone();
                }
            }
            Ok(Vec::new())
        })
    }

    pub fn delete_message_instance_attachment(
        &self,
        message_instance: u32,
        attachment_num: u32,
    ) -> EcResult<()> {
        self.with_instance(message_instance, |inst| {
            let m = inst.as_message_mut()?;
            if attachment_num as usize >= m.attachments.len() {
                return Err(EcError::NotFound);
            }
            m.attachments.remove(attachment_num as usize);
            Ok(())
        })
    }

    /// Commit an instance.
    ///
    /// Message instances write through to the database: new messages get a
    /// fresh id, existing ones are staleness-checked against the change
    /// number observed at load. Attachment instances merge back into their
    /// parent message instance in memory.
    pub fn flush_instance(&self, instance_id: u32) -> EcResult<u64> {
        let inst = {
            let map = lock(&self.instances);
            map.get(&instance_id).cloned().ok_or(EcError::NullObject)?
        };
        match inst.content {
            InstanceContent::Attachment(ref att) => {
                let parent = inst.parent.ok_or(EcError::NullObject)?;
                let att = att.clone();
                self.with_instance(parent, |pinst| {
                    let m = pinst.as_message_mut()?;
                    let num = att
                        .props
                        .get(tags::PR_ATTACH_NUM)
                        .and_then(|v| v.as_u32())
                        .unwrap_or(m.attachments.len() as u32)
                        as usize;
                    if num < m.attachments.len() {
                        m.attachments[num] = att.clone();
                    } else {
                        m.attachments.push(att.clone());
                    }
                    Ok(())
                })?;
                Ok(0)
            }
            InstanceContent::Message(ref content) => {
                if let Some(parent) = inst.parent {
                    // embedded message: merge into the owning attachment
                    let content = content.clone();
                    self.with_instance(parent, |pinst| {
                        let a = pinst.as_attachment_mut()?;
                        a.embedded = Some(Box::new(content.clone()));
                        Ok(())
                    })?;
                    return Ok(0);
                }
                let mid = self.with_write(|txn, ctx| {
                    let conn = txn.conn();
                    let mid = if inst.message_id != 0 {
                        inst.message_id
                    } else {
                        allocate_eid(conn)?
                    };
                    let existing = message_row(conn, mid)?;
                    match &existing {
                        Some(row) => {
                            if !inst.b_new && row.change_number != inst.loaded_cn {
                                return Err(EcError::ObjectModified);
                            }
                            conn.execute(
                                "UPDATE messages SET is_associated = ?1, is_deleted = 0
                                 WHERE message_id = ?2",
                                rusqlite::params![i64::from(inst.b_fai), mid as i64],
                            )?;
                        }
                        None => {
                            let cn = super::allocate_cn(conn)?;
                            conn.execute(
                                "INSERT INTO messages
                                    (message_id, parent_fid, is_associated, change_number)
                                 VALUES (?1, ?2, ?3, ?4)",
                                rusqlite::params![
                                    mid as i64,
                                    inst.folder_id as i64,
                                    i64::from(inst.b_fai),
                                    eid_gc(cn) as i64
                                ],
                            )?;
                        }
                    }
                    write_message_content(self, conn, mid, content, ctx)?;
                    messages::touch_message(self, conn, mid)?;
                    touch_folder_quiet(self, conn, inst.folder_id)?;
                    ctx.notify(match existing {
                        Some(_) => DbNotify::MessageModified {
                            folder_id: inst.folder_id,
                            message_id: mid,
                        },
                        None => DbNotify::MessageCreated {
                            folder_id: inst.folder_id,
                            message_id: mid,
                        },
                    });
                    Ok(mid)
                })?;
                // refresh the staleness marker from the committed row
                let committed_cn = {
                    let conn = self.reader()?;
                    message_row(&conn, mid)?.map(|r| r.change_number).unwrap_or(0)
                };
                self.with_instance(instance_id, |i| {
                    i.message_id = mid;
                    i.b_new = false;
                    i.loaded_cn = committed_cn;
                    Ok(())
                })?;
                Ok(mid)
            }
        }
    }

    /// Discard an instance and everything opened under it.
    pub fn unload_instance(&self, instance_id: u32) -> EcResult<()> {
        let mut map = lock(&self.instances);
        if map.remove(&instance_id).is_none() {
            return Err(EcError::NullObject);
        }
        let orphans: Vec<u32> = map
            .values()
            .filter(|i| i.parent == Some(instance_id))
            .map(|i| i.id)
            .collect();
        drop(map);
        for id in orphans {
            let _ = self.unload_instance(id);
        }
        Ok(())
    }

    pub fn get_instance_all_proptags(&self, instance_id: u32) -> EcResult<Vec<u32>> {
        self.with_instance(instance_id, |inst| {
            Ok(match &inst.content {
                InstanceContent::Message(m) => m.props.tags(),
                InstanceContent::Attachment(a) => a.props.tags(),
            })
        })
    }

    pub fn get_instance_properties(&self, instance_id: u32, want: &[u32]) -> EcResult<PropList> {
        self.with_instance(instance_id, |inst| {
            let bag = match &inst.content {
                InstanceContent::Message(m) => &m.props,
                InstanceContent::Attachment(a) => &a.props,
            };
            let mut out = PropList::new();
            for &tag in want {
                if let Some(v) = bag.get(tag) {
                    out.set(tag, v.clone());
                    continue;
                }
                match tag {
                    tags::PR_MID if inst.message_id != 0 => {
                        out.set(tag, PropValue::I8(inst.message_id));
                    }
                    tags::PR_CHANGE_NUMBER if inst.loaded_cn != 0 => {
                        out.set(tag, PropValue::I8(make_eid(REPLID_LOCAL, inst.loaded_cn)));
                    }
                    tags::PR_ASSOCIATED => {
                        out.set(tag, PropValue::Bool(inst.b_fai));
                    }
                    _ => {}
                }
            }
            Ok(out)
        })
    }

    pub fn set_instance_properties(&self, instance_id: u32, values: &PropList) -> EcResult<Vec<u32>> {
        self.with_instance(instance_id, |inst| {
            let mut problems = Vec::new();
            let bag = match &mut inst.content {
                InstanceContent::Message(m) => &mut m.props,
                InstanceContent::Attachment(a) => &mut a.props,
            };
            for tp in values.iter() {
                if is_computed_message_tag(tp.tag) {
                    problems.push(tp.tag);
                    continue;
                }
                bag.set(tp.tag, tp.value.clone());
            }
            Ok(problems)
        })
    }

    pub fn remove_instance_properties(&self, instance_id: u32, tags_: &[u32]) -> EcResult<()> {
        self.with_instance(instance_id, |inst| {
            let bag = match &mut inst.content {
                InstanceContent::Message(m) => &mut m.props,
                InstanceContent::Attachment(a) => &mut a.props,
            };
            for &tag in tags_ {
                bag.remove(tag);
            }
            Ok(())
        })
    }

    /// Would embedding `mid` under this instance close a message cycle?
    pub fn check_instance_cycle(&self, instance_id: u32, mid: u64) -> EcResult<bool> {
        let map = lock(&self.instances);
        let mut cursor = map.get(&instance_id);
        while let Some(inst) = cursor {
            if inst.message_id != 0 && inst.message_id == mid {
                return Ok(true);
            }
            cursor = inst.parent.and_then(|p| map.get(&p));
        }
        Ok(false)
    }

    pub fn copy_instance_rcpts(&self, src_instance: u32, dst_instance: u32) -> EcResult<()> {
        let rcpts = self.with_instance(src_instance, |inst| Ok(inst.as_message()?.recipients.clone()))?;
        self.with_instance(dst_instance, |inst| {
            inst.as_message_mut()?.recipients = rcpts.clone();
            Ok(())
        })
    }

    pub fn copy_instance_attachments(&self, src_instance: u32, dst_instance: u32) -> EcResult<()> {
        let atts = self.with_instance(src_instance, |inst| Ok(inst.as_message()?.attachments.clone()))?;
        self.with_instance(dst_instance, |inst| {
            inst.as_message_mut()?.attachments = atts.clone();
            Ok(())
        })
    }

    // ---- recipient subtable ----

    pub fn empty_message_instance_rcpts(&self, instance_id: u32) -> EcResult<()> {
        self.with_instance(instance_id, |inst| {
            inst.as_message_mut()?.recipients.clear();
            Ok(())
        })
    }

    pub fn get_message_instance_rcpts_num(&self, instance_id: u32) -> EcResult<u16> {
        self.with_instance(instance_id, |inst| Ok(inst.as_message()?.recipients.len() as u16))
    }

    pub fn get_message_instance_rcpts_all_proptags(&self, instance_id: u32) -> EcResult<Vec<u32>> {
        self.with_instance(instance_id, |inst| {
            let mut out = Vec::new();
            for rcpt in &inst.as_message()?.recipients {
                for tag in rcpt.tags() {
                    if !out.contains(&tag) {
                        out.push(tag);
                    }
                }
            }
            Ok(out)
        })
    }

    pub fn get_message_instance_rcpts(
        &self,
        instance_id: u32,
        row_begin: u32,
        need_count: u16,
    ) -> EcResult<Vec<PropList>> {
        self.with_instance(instance_id, |inst| {
            let rcpts = &inst.as_message()?.recipients;
            let out = rcpts
                .iter()
                .enumerate()
                .filter(|(i, _)| *i as u32 >= row_begin)
                .take(usize::from(need_count))
                .map(|(i, r)| {
                    let mut r = r.clone();
                    r.set(tags::PR_ROWID, PropValue::Long(i as u32));
                    r
                })
                .collect();
            Ok(out)
        })
    }

    /// Apply recipient-row edits keyed by PR_ROWID; a row reduced to just
    /// its rowid is a deletion.
    pub fn update_message_instance_rcpts(
        &self,
        instance_id: u32,
        rows: &[PropList],
    ) -> EcResult<()> {
        self.with_instance(instance_id, |inst| {
            let rcpts = &mut inst.as_message_mut()?.recipients;
            for row in rows {
                let rowid = row
                    .get(tags::PR_ROWID)
                    .and_then(|v| v.as_u32())
                    .ok_or(EcError::InvalidParam)? as usize;
                let is_delete = row.len() <= 1;
                if is_delete {
                    if rowid < rcpts.len() {
                        rcpts.remove(rowid);
                    }
                    continue;
                }
                if rowid < rcpts.len() {
                    rcpts[rowid] = row.clone();
                } else {
                    rcpts.push(row.clone());
                }
            }
            Ok(())
        })
    }

    // ---- attachment subtable ----

    pub fn empty_message_instance_attachments(&self, instance_id: u32) -> EcResult<()> {
        self.with_instance(instance_id, |inst| {
            inst.as_message_mut()?.attachments.clear();
            Ok(())
        })
    }

    pub fn get_message_instance_attachments_num(&self, instance_id: u32) -> EcResult<u16> {
        self.with_instance(instance_id, |inst| Ok(inst.as_message()?.attachments.len() as u16))
    }

    pub fn get_message_instance_attachment_table_all_proptags(
        &self,
        instance_id: u32,
    ) -> EcResult<Vec<u32>> {
        self.with_instance(instance_id, |inst| {
            let mut out = vec![tags::PR_ATTACH_NUM];
            for att in &inst.as_message()?.attachments {
                for tag in att.props.tags() {
                    if !out.contains(&tag) {
                        out.push(tag);
                    }
                }
            }
            Ok(out)
        })
    }

    pub fn query_message_instance_attachment_table(
        &self,
        instance_id: u32,
        want: &[u32],
        start_pos: u32,
        row_needed: i32,
    ) -> EcResult<Vec<PropList>> {
        self.with_instance(instance_id, |inst| {
            let atts = &inst.as_message()?.attachments;
            let take = if row_needed < 0 { atts.len() } else { row_needed as usize };
            let out = atts
                .iter()
                .enumerate()
                .filter(|(i, _)| *i as u32 >= start_pos)
                .take(take)
                .map(|(i, a)| {
                    let mut row = PropList::new();
                    for &tag in want {
                        if tag == tags::PR_ATTACH_NUM {
                            row.set(tag, PropValue::Long(i as u32));
                        } else if let Some(v) = a.props.get(tag) {
                            row.set(tag, v.clone());
                        }
                    }
                    row
                })
                .collect();
            Ok(out)
        })
    }

    /// Record an import conflict on the instance: keep the rival version
    /// as an embedded attachment and flag the message status.
    pub fn set_message_instance_conflict(
        &self,
        instance_id: u32,
        rival: &MessageContent,
    ) -> EcResult<()> {
        self.with_instance(instance_id, |inst| {
            let m = inst.as_message_mut()?;
            let status = m
                .props
                .get(tags::PR_MESSAGE_STATUS)
                .and_then(|v| v.as_u32())
                .unwrap_or(0);
            m.props.set(
                tags::PR_MESSAGE_STATUS,
                PropValue::Long(status | messages::MSGSTATUS_IN_CONFLICT),
            );
            let mut att = AttachmentContent::default();
            att.props
                .set(tags::PR_ATTACH_NUM, PropValue::Long(m.attachments.len() as u32));
            att.embedded = Some(Box::new(rival.clone()));
            m.attachments.push(att);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::types::private_fid;

    #[test]
    fn instance_edits_invisible_until_flush() {
        let (_tmp, _engine, store) = temp_store();
        let mut content = MessageContent::default();
        content.props.set(tags::PR_SUBJECT, PropValue::Unicode("original".into()));
        let mid = store.write_message(private_fid::INBOX, &content, false).unwrap();

        let inst = store
            .load_message_instance(private_fid::INBOX, mid, false, false)
            .unwrap();
        let mut edit = PropList::new();
        edit.set(tags::PR_SUBJECT, PropValue::Unicode("edited".into()));
        store.set_instance_properties(inst, &edit).unwrap();

        // concurrent reader still sees the committed subject
        let read = store.get_message_properties(mid, &[tags::PR_SUBJECT]).unwrap();
        assert_eq!(read.get(tags::PR_SUBJECT).and_then(|v| v.as_str()), Some("original"));

        store.flush_instance(inst).unwrap();
        let read = store.get_message_properties(mid, &[tags::PR_SUBJECT]).unwrap();
        assert_eq!(read.get(tags::PR_SUBJECT).and_then(|v| v.as_str()), Some("edited"));
        store.unload_instance(inst).unwrap();
    }

    #[test]
    fn flush_detects_stale_instance() {
        let (_tmp, _engine, store) = temp_store();
        let mut content = MessageContent::default();
        content.props.set(tags::PR_SUBJECT, PropValue::Unicode("s".into()));
        let mid = store.write_message(private_fid::INBOX, &content, false).unwrap();

        let inst = store
            .load_message_instance(private_fid::INBOX, mid, false, false)
            .unwrap();
        // another writer commits first
        let mut update = PropList::new();
        update.set(tags::PR_SUBJECT, PropValue::Unicode("raced".into()));
        store.set_message_properties(mid, &update).unwrap();

        assert_eq!(store.flush_instance(inst).unwrap_err(), EcError::ObjectModified);
        store.reload_message_instance(inst).unwrap();
        store.flush_instance(inst).unwrap();
    }

    #[test]
    fn new_instance_allocates_id_on_flush() {
        let (_tmp, _engine, store) = temp_store();
        let inst = store
            .load_message_instance(private_fid::DRAFT, 0, true, false)
            .unwrap();
        let mut edit = PropList::new();
        edit.set(tags::PR_SUBJECT, PropValue::Unicode("draft".into()));
        store.set_instance_properties(inst, &edit).unwrap();
        let mid = store.flush_instance(inst).unwrap();
        assert!(mid != 0);
        assert!(store.check_message(private_fid::DRAFT, mid).unwrap());
    }

    #[test]
    fn attachment_subtable_flow() {
        let (_tmp, _engine, store) = temp_store();
        let inst = store
            .load_message_instance(private_fid::DRAFT, 0, true, false)
            .unwrap();
        let (att_inst, num) = store.create_attachment_instance(inst).unwrap();
        assert_eq!(num, 0);
        let mut edit = PropList::new();
        edit.set(tags::PR_ATTACH_LONG_FILENAME, PropValue::Unicode("a.txt".into()));
        store.set_instance_properties(att_inst, &edit).unwrap();
        store.flush_instance(att_inst).unwrap();

        assert_eq!(store.get_message_instance_attachments_num(inst).unwrap(), 1);
        let rows = store
            .query_message_instance_attachment_table(
                inst,
                &[tags::PR_ATTACH_NUM, tags::PR_ATTACH_LONG_FILENAME],
                0,
                -1,
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get(tags::PR_ATTACH_LONG_FILENAME).and_then(|v| v.as_str()),
            Some("a.txt")
        );
        store.delete_message_instance_attachment(inst, 0).unwrap();
        assert_eq!(store.get_message_instance_attachments_num(inst).unwrap(), 0);
    }

    #[test]
    fn rcpt_subtable_update_and_delete() {
        let (_tmp, _engine, store) = temp_store();
        let inst = store
            .load_message_instance(private_fid::DRAFT, 0, true, false)
            .unwrap();
        let mut row = PropList::new();
        row.set(tags::PR_ROWID, PropValue::Long(0));
        row.set(tags::PR_SMTP_ADDRESS, PropValue::Unicode("a@example.com".into()));
        store.update_message_instance_rcpts(inst, &[row]).unwrap();
        assert_eq!(store.get_message_instance_rcpts_num(inst).unwrap(), 1);

        let mut del = PropList::new();
        del.set(tags::PR_ROWID, PropValue::Long(0));
        store.update_message_instance_rcpts(inst, &[del]).unwrap();
        assert_eq!(store.get_message_instance_rcpts_num(inst).unwrap(), 0);
    }
}
