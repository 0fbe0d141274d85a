//! Message CRUD, read state, submit state, linking, and the PCL-checked
//! import path (`write_message`).

use rusqlite::{params, Connection, OptionalExtension};

use crate::types::propval::{msgflags, tags, PropList, PropValue, TaggedPropval};
use crate::types::{eid_gc, make_eid, EcError, EcResult, Pcl, PclCompare, Xid, REPLID_LOCAL};

use super::notify::DbNotify;
use super::{
    allocate_cn, allocate_eid, props, AttachmentContent, MessageContent, Store, WriteCtx,
};

/// `PR_MESSAGE_STATUS` bit recording an import conflict.
pub const MSGSTATUS_IN_CONFLICT: u32 = 0x0800;

#[derive(Debug, Clone, Copy)]
pub struct MessageRow {
    pub message_id: u64,
    pub parent_fid: u64,
    pub is_associated: bool,
    pub is_deleted: bool,
    pub read_state: bool,
    pub change_number: u64,
    pub read_cn: Option<u64>,
}

pub(crate) fn message_row(conn: &Connection, mid: u64) -> EcResult<Option<MessageRow>> {
    let row = conn
        .query_row(
            "SELECT parent_fid, is_associated, is_deleted, read_state, change_number, read_cn
             FROM messages WHERE message_id = ?1",
            [mid as i64],
            |r| {
                Ok(MessageRow {
                    message_id: mid,
                    parent_fid: r.get::<_, Option<i64>>(0)?.unwrap_or(0) as u64,
                    is_associated: r.get::<_, i64>(1)? != 0,
                    is_deleted: r.get::<_, i64>(2)? != 0,
                    read_state: r.get::<_, i64>(3)? != 0,
                    change_number: r.get::<_, i64>(4)? as u64,
                    read_cn: r.get::<_, Option<i64>>(5)?.map(|v| v as u64),
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Message ids in a folder. `assoc` filters FAI vs normal; `None` takes
/// both. Soft-deleted rows are included only with `include_deleted`.
pub(crate) fn message_ids_in(
    conn: &Connection,
    folder_id: u64,
    assoc: Option<bool>,
    include_deleted: bool,
) -> EcResult<Vec<u64>> {
    let mut sql = String::from("SELECT message_id FROM messages WHERE parent_fid = ?1");
    if let Some(a) = assoc {
        sql.push_str(if a { " AND is_associated = 1" } else { " AND is_associated = 0" });
    }
    if !include_deleted {
        sql.push_str(" AND is_deleted = 0");
    }
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map([folder_id as i64], |r| r.get::<_, i64>(0).map(|v| v as u64))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub(crate) fn count_messages(conn: &Connection, folder_id: u64, fai: bool) -> EcResult<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE parent_fid = ?1 AND is_associated = ?2 AND is_deleted = 0",
        params![folder_id as i64, i64::from(fai)],
        |r| r.get(0),
    )?;
    Ok(n as u64)
}

fn attachment_ids(conn: &Connection, mid: u64) -> EcResult<Vec<i64>> {
    let mut stmt = conn
        .prepare("SELECT attachment_id FROM attachments WHERE message_id = ?1 ORDER BY attachment_id")?;
    let ids = stmt
        .query_map([mid as i64], |r| r.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn embedded_message_id(conn: &Connection, attachment_id: i64) -> EcResult<Option<u64>> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT message_id FROM messages WHERE parent_attid = ?1",
            [attachment_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id.map(|v| v as u64))
}

/// Delete one message row. Hard deletion releases cid references and every
/// sub-row (embedded messages included); soft deletion only flips the flag.
pub(crate) fn delete_message_row(
    store: &Store,
    conn: &Connection,
    mid: u64,
    hard: bool,
    ctx: &mut WriteCtx,
) -> EcResult<()> {
    if !hard {
        conn.execute("UPDATE messages SET is_deleted = 1 WHERE message_id = ?1", [mid as i64])?;
        conn.execute("DELETE FROM search_result WHERE message_id = ?1", [mid as i64])?;
        return Ok(());
    }
    for att in attachment_ids(conn, mid)? {
        if let Some(embedded) = embedded_message_id(conn, att)? {
            delete_message_row(store, conn, embedded, true, ctx)?;
        }
        props::release_cids(
            conn,
            store.dir(),
            "attachment_properties",
            Some(("attachment_id", att)),
            ctx,
        )?;
    }
    props::release_cids(
        conn,
        store.dir(),
        "message_properties",
        Some(("message_id", mid as i64)),
        ctx,
    )?;
    conn.execute("DELETE FROM search_result WHERE message_id = ?1", [mid as i64])?;
    conn.execute("DELETE FROM messages WHERE message_id = ?1", [mid as i64])?;
    let _ = std::fs::remove_file(store.dir().join("eml").join(eid_gc(mid).to_string()));
    Ok(())
}

/// Write a full message body (props, recipients, attachments) under an
/// existing `messages` row, replacing whatever was there.
pub(crate) fn write_message_content(
    store: &Store,
    conn: &Connection,
    mid: u64,
    content: &MessageContent,
    ctx: &mut WriteCtx,
) -> EcResult<()> {
    // drop old sub-rows first; property writes below manage cid refs
    for att in attachment_ids(conn, mid)? {
        if let Some(embedded) = embedded_message_id(conn, att)? {
            delete_message_row(store, conn, embedded, true, ctx)?;
        }
        props::release_cids(
            conn,
            store.dir(),
            "attachment_properties",
            Some(("attachment_id", att)),
            ctx,
        )?;
    }
    conn.execute("DELETE FROM attachments WHERE message_id = ?1", [mid as i64])?;
    conn.execute(
        "DELETE FROM recipients WHERE message_id = ?1",
        [mid as i64],
    )?;
    props::release_cids(
        conn,
        store.dir(),
        "message_properties",
        Some(("message_id", mid as i64)),
        ctx,
    )?;
    conn.execute("DELETE FROM message_properties WHERE message_id = ?1", [mid as i64])?;

    let key = Some(("message_id", mid as i64));
    for tp in content.props.iter() {
        if is_computed_message_tag(tp.tag) {
            continue;
        }
        props::write_prop_cid(conn, store.dir(), "message_properties", key, tp, ctx)?;
    }
    for rcpt in &content.recipients {
        conn.execute("INSERT INTO recipients (message_id) VALUES (?1)", [mid as i64])?;
        let rid = conn.last_insert_rowid();
        for tp in rcpt.iter() {
            props::write_prop(conn, "recipients_properties", Some(("recipient_id", rid)), tp)?;
        }
    }
    for att in &content.attachments {
        write_attachment_content(store, conn, mid, att, ctx)?;
    }
    let size = estimate_size(content);
    conn.execute(
        "UPDATE messages SET message_size = ?1 WHERE message_id = ?2",
        params![size as i64, mid as i64],
    )?;
    Ok(())
}

pub(crate) fn write_attachment_content(
    store: &Store,
    conn: &Connection,
    mid: u64,
    att: &AttachmentContent,
    ctx: &mut WriteCtx,
) -> EcResult<()> {
    conn.execute("INSERT INTO attachments (message_id) VALUES (?1)", [mid as i64])?;
    let aid = conn.last_insert_rowid();
    for tp in att.props.iter() {
        props::write_prop_cid(
            conn,
            store.dir(),
            "attachment_properties",
            Some(("attachment_id", aid)),
            tp,
            ctx,
        )?;
    }
    if let Some(embedded) = &att.embedded {
        let sub_mid = allocate_eid(conn)?;
        let cn = allocate_cn(conn)?;
        conn.execute(
            "INSERT INTO messages (message_id, parent_attid, change_number) VALUES (?1, ?2, ?3)",
            params![sub_mid as i64, aid, eid_gc(cn) as i64],
        )?;
        write_message_content(store, conn, sub_mid, embedded, ctx)?;
    }
    Ok(())
}

pub(crate) fn read_message_content(
    store: &Store,
    conn: &Connection,
    mid: u64,
) -> EcResult<MessageContent> {
    let row = message_row(conn, mid)?.ok_or(EcError::NotFound)?;
    let key = Some(("message_id", mid as i64));
    let mut content = MessageContent {
        props: props::read_all_props(conn, store.dir(), "message_properties", key)?,
        ..Default::default()
    };
    content.props.set(tags::PR_MID, PropValue::I8(mid));
    content.props.set(
        tags::PR_CHANGE_NUMBER,
        PropValue::I8(make_eid(REPLID_LOCAL, row.change_number)),
    );
    content.props.set(tags::PR_ASSOCIATED, PropValue::Bool(row.is_associated));
    content.props.set(tags::PR_READ, PropValue::Bool(row.read_state));

    let mut stmt = conn.prepare(
        "SELECT recipient_id FROM recipients WHERE message_id = ?1 ORDER BY recipient_id",
    )?;
    let rids = stmt
        .query_map([mid as i64], |r| r.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for (i, rid) in rids.iter().enumerate() {
        let mut rp = props::read_all_props(
            conn,
            store.dir(),
            "recipients_properties",
            Some(("recipient_id", *rid)),
        )?;
        rp.set(tags::PR_ROWID, PropValue::Long(i as u32));
        content.recipients.push(rp);
    }
    for (i, aid) in attachment_ids(conn, mid)?.into_iter().enumerate() {
        let mut ap = props::read_all_props(
            conn,
            store.dir(),
            "attachment_properties",
            Some(("attachment_id", aid)),
        )?;
        ap.set(tags::PR_ATTACH_NUM, PropValue::Long(i as u32));
        let embedded = match embedded_message_id(conn, aid)? {
            Some(sub) => Some(Box::new(read_message_content(store, conn, sub)?)),
            None => None,
        };
        content.attachments.push(AttachmentContent { props: ap, embedded });
    }
    Ok(content)
}

/// Copy a message into `dst_fid` under a fresh id; cid references are
/// shared, not duplicated.
pub(crate) fn copy_message_row(
    store: &Store,
    conn: &Connection,
    src_mid: u64,
    dst_fid: u64,
    ctx: &mut WriteCtx,
) -> EcResult<u64> {
    let new_mid = allocate_eid(conn)?;
    copy_message_to(store, conn, src_mid, dst_fid, new_mid, ctx)
}

pub(crate) fn copy_message_to(
    store: &Store,
    conn: &Connection,
    src_mid: u64,
    dst_fid: u64,
    new_mid: u64,
    ctx: &mut WriteCtx,
) -> EcResult<u64> {
    let row = message_row(conn, src_mid)?.ok_or(EcError::NotFound)?;
    let cn = allocate_cn(conn)?;
    conn.execute(
        "INSERT INTO messages
            (message_id, parent_fid, is_associated, read_state, change_number, message_size)
         SELECT ?1, ?2, is_associated, read_state, ?3, message_size
         FROM messages WHERE message_id = ?4",
        params![new_mid as i64, dst_fid as i64, eid_gc(cn) as i64, src_mid as i64],
    )?;
    conn.execute(
        "INSERT INTO message_properties (message_id, proptag, propval)
         SELECT ?1, proptag, propval FROM message_properties WHERE message_id = ?2",
        params![new_mid as i64, src_mid as i64],
    )?;
    // shared cid references gain a count each
    let mut stmt = conn
        .prepare("SELECT propval FROM message_properties WHERE message_id = ?1")?;
    let blobs = stmt
        .query_map([new_mid as i64], |r| r.get::<_, Vec<u8>>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    for blob in blobs {
        if let Some(cid) = props::stored_cid_ref(&blob) {
            super::cid::incref(conn, cid)?;
        }
    }
    let mut stmt = conn.prepare(
        "SELECT recipient_id FROM recipients WHERE message_id = ?1 ORDER BY recipient_id",
    )?;
    let rids = stmt
        .query_map([src_mid as i64], |r| r.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    for rid in rids {
        conn.execute("INSERT INTO recipients (message_id) VALUES (?1)", [new_mid as i64])?;
        let new_rid = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO recipients_properties (recipient_id, proptag, propval)
             SELECT ?1, proptag, propval FROM recipients_properties WHERE recipient_id = ?2",
            params![new_rid, rid],
        )?;
    }
    for aid in attachment_ids(conn, src_mid)? {
        conn.execute("INSERT INTO attachments (message_id) VALUES (?1)", [new_mid as i64])?;
        let new_aid = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO attachment_properties (attachment_id, proptag, propval)
             SELECT ?1, proptag, propval FROM attachment_properties WHERE attachment_id = ?2",
            params![new_aid, aid],
        )?;
        let mut stmt = conn
            .prepare("SELECT propval FROM attachment_properties WHERE attachment_id = ?1")?;
        let blobs = stmt
            .query_map([new_aid], |r| r.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        for blob in blobs {
            if let Some(cid) = props::stored_cid_ref(&blob) {
                super::cid::incref(conn, cid)?;
            }
        }
        if let Some(embedded) = embedded_message_id(conn, aid)? {
            let sub_mid = allocate_eid(conn)?;
            let sub_cn = allocate_cn(conn)?;
            conn.execute(
                "INSERT INTO messages (message_id, parent_attid, change_number)
                 VALUES (?1, ?2, ?3)",
                params![sub_mid as i64, new_aid, eid_gc(sub_cn) as i64],
            )?;
            let content = read_message_content(store, conn, embedded)?;
            write_message_content(store, conn, sub_mid, &content, ctx)?;
        }
    }
    // fresh identity for the copy
    let key = Some(("message_id", new_mid as i64));
    let xid = Xid::from_cn(store.mailbox_guid(), eid_gc(cn));
    let mut pcl = Pcl::new();
    pcl.append(xid);
    props::write_prop(
        conn,
        "message_properties",
        key,
        &TaggedPropval::new(tags::PR_CHANGE_KEY, PropValue::Binary(xid.serialize())),
    )?;
    props::write_prop(
        conn,
        "message_properties",
        key,
        &TaggedPropval::new(tags::PR_PREDECESSOR_CHANGE_LIST, PropValue::Binary(pcl.serialize())),
    )?;
    props::write_prop(
        conn,
        "message_properties",
        key,
        &TaggedPropval::new(
            tags::PR_SOURCE_KEY,
            PropValue::Binary(
                Xid { guid: store.mailbox_guid(), gc: eid_gc(new_mid), gc_len: 6 }.serialize(),
            ),
        ),
    )?;
    Ok(new_mid)
}

/// Bump a message's change number and change-key properties.
pub(crate) fn touch_message(store: &Store, conn: &Connection, mid: u64) -> EcResult<u64> {
    let cn = allocate_cn(conn)?;
    conn.execute(
        "UPDATE messages SET change_number = ?1 WHERE message_id = ?2",
        params![eid_gc(cn) as i64, mid as i64],
    )?;
    let key = Some(("message_id", mid as i64));
    let xid = Xid::from_cn(store.mailbox_guid(), eid_gc(cn));
    let old = props::read_props(
        conn,
        store.dir(),
        "message_properties",
        key,
        &[tags::PR_PREDECESSOR_CHANGE_LIST],
    )?;
    let mut pcl = match old.get(tags::PR_PREDECESSOR_CHANGE_LIST).and_then(|v| v.as_bytes()) {
        Some(blob) => Pcl::deserialize(blob)?,
        None => Pcl::new(),
    };
    pcl.append(xid);
    for tp in [
        TaggedPropval::new(tags::PR_CHANGE_KEY, PropValue::Binary(xid.serialize())),
        TaggedPropval::new(tags::PR_PREDECESSOR_CHANGE_LIST, PropValue::Binary(pcl.serialize())),
        TaggedPropval::new(
            tags::PR_LAST_MODIFICATION_TIME,
            PropValue::SysTime(crate::types::filetime_now()),
        ),
    ] {
        props::write_prop(conn, "message_properties", key, &tp)?;
    }
    Ok(cn)
}

fn estimate_size(content: &MessageContent) -> usize {
    let mut push = crate::codec::ExtPush::new();
    content.encode(&mut push);
    push.len()
}

pub(crate) fn is_computed_message_tag(tag: u32) -> bool {
    matches!(
        tag,
        tags::PR_MID | tags::PR_CHANGE_NUMBER | tags::PR_ASSOCIATED | tags::PR_READ
    )
}

impl Store {
    pub fn allocate_message_id(&self, _folder_id: u64) -> EcResult<u64> {
        self.with_write(|txn, _| allocate_eid(txn.conn()))
    }

    pub fn allocate_cn(&self) -> EcResult<u64> {
        self.with_write(|txn, _| allocate_cn(txn.conn()))
    }

    pub fn allocate_ids(&self, count: u32) -> EcResult<u64> {
        if count == 0 || count > super::schema::EID_RANGE as u32 {
            return Err(EcError::InvalidParam);
        }
        self.with_write(|txn, _| super::allocate_eid_range(txn.conn(), count))
    }

    /// Is the message present (and live) in the given folder?
    pub fn check_message(&self, folder_id: u64, mid: u64) -> EcResult<bool> {
        let conn = self.reader()?;
        Ok(match message_row(&conn, mid)? {
            Some(row) => row.parent_fid == folder_id && !row.is_deleted,
            None => false,
        })
    }

    pub fn check_message_deleted(&self, mid: u64) -> EcResult<bool> {
        let conn = self.reader()?;
        Ok(match message_row(&conn, mid)? {
            Some(row) => row.is_deleted,
            None => true,
        })
    }

    pub fn get_message_properties(&self, mid: u64, want: &[u32]) -> EcResult<PropList> {
        let conn = self.reader()?;
        let row = message_row(&conn, mid)?.ok_or(EcError::NotFound)?;
        let key = Some(("message_id", mid as i64));
        let mut out = props::read_props(&conn, self.dir(), "message_properties", key, want)?;
        for &tag in want {
            let value = match tag {
                tags::PR_MID => Some(PropValue::I8(mid)),
                tags::PR_CHANGE_NUMBER => {
                    Some(PropValue::I8(make_eid(REPLID_LOCAL, row.change_number)))
                }
                tags::PR_ASSOCIATED => Some(PropValue::Bool(row.is_associated)),
                tags::PR_READ => Some(PropValue::Bool(row.read_state)),
                tags::PR_PARENT_FID => Some(PropValue::I8(row.parent_fid)),
                tags::PR_MESSAGE_SIZE => {
                    let size: i64 = conn.query_row(
                        "SELECT message_size FROM messages WHERE message_id = ?1",
                        [mid as i64],
                        |r| r.get(0),
                    )?;
                    Some(PropValue::Long(size as u32))
                }
                _ => None,
            };
            if let Some(v) = value {
                out.set(tag, v);
            }
        }
        Ok(out)
    }

    pub fn set_message_properties(&self, mid: u64, values: &PropList) -> EcResult<Vec<u32>> {
        let mut problems = Vec::new();
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            let row = message_row(conn, mid)?.ok_or(EcError::NotFound)?;
            let key = Some(("message_id", mid as i64));
            for tp in values.iter() {
                if is_computed_message_tag(tp.tag) || tp.tag == tags::PR_PARENT_FID {
                    problems.push(tp.tag);
                    continue;
                }
                props::write_prop_cid(conn, self.dir(), "message_properties", key, tp, ctx)?;
            }
            touch_message(self, conn, mid)?;
            ctx.notify(DbNotify::MessageModified { folder_id: row.parent_fid, message_id: mid });
            Ok(())
        })?;
        Ok(problems)
    }

    pub fn remove_message_properties(&self, mid: u64, tags_: &[u32]) -> EcResult<()> {
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            let row = message_row(conn, mid)?.ok_or(EcError::NotFound)?;
            let key = Some(("message_id", mid as i64));
            for &tag in tags_ {
                props::remove_prop_cid(conn, self.dir(), "message_properties", key, tag, ctx)?;
            }
            touch_message(self, conn, mid)?;
            ctx.notify(DbNotify::MessageModified { folder_id: row.parent_fid, message_id: mid });
            Ok(())
        })
    }

    /// Flip the read state. Public stores track it per user.
    pub fn set_message_read_state(&self, username: &str, mid: u64, read: bool) -> EcResult<u64> {
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            let row = message_row(conn, mid)?.ok_or(EcError::NotFound)?;
            let cn = allocate_cn(conn)?;
            if self.is_private() {
                conn.execute(
                    "UPDATE messages SET read_state = ?1, read_cn = ?2 WHERE message_id = ?3",
                    params![i64::from(read), eid_gc(cn) as i64, mid as i64],
                )?;
            } else if read {
                conn.execute(
                    "REPLACE INTO read_states (message_id, username) VALUES (?1, ?2)",
                    params![mid as i64, username],
                )?;
                conn.execute(
                    "UPDATE messages SET read_cn = ?1 WHERE message_id = ?2",
                    params![eid_gc(cn) as i64, mid as i64],
                )?;
            } else {
                conn.execute(
                    "DELETE FROM read_states WHERE message_id = ?1 AND username = ?2",
                    params![mid as i64, username],
                )?;
                conn.execute(
                    "UPDATE messages SET read_cn = ?1 WHERE message_id = ?2",
                    params![eid_gc(cn) as i64, mid as i64],
                )?;
            }
            ctx.notify(DbNotify::MessageModified { folder_id: row.parent_fid, message_id: mid });
            Ok(cn)
        })
    }

    /// Delete a batch from one folder. Held instances and foreign rows are
    /// skipped; the partial flag reports it.
    pub fn delete_messages(&self, folder_id: u64, mids: &[u64], hard: bool) -> EcResult<bool> {
        let held: Vec<u64> = super::lock(&self.instances)
            .values()
            .filter_map(|inst| inst.message_id())
            .collect();
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            let mut partial = false;
            for &mid in mids {
                match message_row(conn, mid)? {
                    Some(row) if row.parent_fid == folder_id && !row.is_deleted => {
                        if held.contains(&mid) {
                            partial = true;
                            continue;
                        }
                        delete_message_row(self, conn, mid, hard, ctx)?;
                        ctx.notify(DbNotify::MessageDeleted { folder_id, message_id: mid });
                    }
                    _ => partial = true,
                }
            }
            touch_folder_quiet(self, conn, folder_id)?;
            Ok(partial)
        })
    }

    /// Move or copy one message to `dst_fid` under the caller-allocated
    /// `dst_mid`.
    pub fn movecopy_message(
        &self,
        src_mid: u64,
        dst_fid: u64,
        dst_mid: u64,
        move_it: bool,
    ) -> EcResult<()> {
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            let row = message_row(conn, src_mid)?.ok_or(EcError::NotFound)?;
            if super::folders::folder_row(conn, dst_fid)?.is_none() {
                return Err(EcError::NotFound);
            }
            copy_message_to(self, conn, src_mid, dst_fid, dst_mid, ctx)?;
            if move_it {
                delete_message_row(self, conn, src_mid, true, ctx)?;
                ctx.notify(DbNotify::MessageMoved {
                    folder_id: dst_fid,
                    message_id: dst_mid,
                    old_folder_id: row.parent_fid,
                    old_message_id: src_mid,
                });
            } else {
                ctx.notify(DbNotify::MessageCopied { folder_id: dst_fid, message_id: dst_mid });
            }
            touch_folder_quiet(self, conn, dst_fid)?;
            if move_it {
                touch_folder_quiet(self, conn, row.parent_fid)?;
            }
            Ok(())
        })
    }

    /// Batch move/copy; ids that fail are skipped and flagged partial.
    pub fn movecopy_messages(
        &self,
        src_fid: u64,
        dst_fid: u64,
        mids: &[u64],
        move_them: bool,
    ) -> EcResult<bool> {
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            if super::folders::folder_row(conn, dst_fid)?.is_none() {
                return Err(EcError::NotFound);
            }
            let mut partial = false;
            for &mid in mids {
                let row = match message_row(conn, mid)? {
                    Some(r) if r.parent_fid == src_fid && !r.is_deleted => r,
                    _ => {
                        partial = true;
                        continue;
                    }
                };
                let new_mid = copy_message_row(self, conn, mid, dst_fid, ctx)?;
                if move_them {
                    delete_message_row(self, conn, mid, true, ctx)?;
                    ctx.notify(DbNotify::MessageMoved {
                        folder_id: dst_fid,
                        message_id: new_mid,
                        old_folder_id: row.parent_fid,
                        old_message_id: mid,
                    });
                } else {
                    ctx.notify(DbNotify::MessageCopied { folder_id: dst_fid, message_id: new_mid });
                }
            }
            touch_folder_quiet(self, conn, dst_fid)?;
            if move_them {
                touch_folder_quiet(self, conn, src_fid)?;
            }
            Ok(partial)
        })
    }

    /// Subject, sender, delivery time and recipient summary of a message.
    pub fn get_message_brief(&self, mid: u64) -> EcResult<MessageContent> {
        let conn = self.reader()?;
        let full = read_message_content(self, &conn, mid)?;
        let mut brief = MessageContent::default();
        for tag in [
            tags::PR_SUBJECT,
            tags::PR_SENDER_NAME,
            tags::PR_SENDER_EMAIL_ADDRESS,
            tags::PR_MESSAGE_DELIVERY_TIME,
            tags::PR_CLIENT_SUBMIT_TIME,
            tags::PR_MESSAGE_CLASS,
            tags::PR_INTERNET_MESSAGE_ID,
            tags::PR_MID,
        ] {
            if let Some(v) = full.props.get(tag) {
                brief.props.set(tag, v.clone());
            }
        }
        brief.recipients = full.recipients;
        for att in &full.attachments {
            let mut ap = PropList::new();
            for tag in [tags::PR_ATTACH_LONG_FILENAME, tags::PR_ATTACH_METHOD, tags::PR_ATTACH_NUM]
            {
                if let Some(v) = att.props.get(tag) {
                    ap.set(tag, v.clone());
                }
            }
            brief.attachments.push(AttachmentContent { props: ap, embedded: None });
        }
        Ok(brief)
    }

    pub fn get_message_rcpts(&self, mid: u64) -> EcResult<Vec<PropList>> {
        let conn = self.reader()?;
        Ok(read_message_content(self, &conn, mid)?.recipients)
    }

    pub fn get_message_group_id(&self, mid: u64) -> EcResult<Option<u32>> {
        let conn = self.reader()?;
        let gid: Option<i64> = conn
            .query_row("SELECT group_id FROM messages WHERE message_id = ?1", [mid as i64], |r| {
                r.get(0)
            })
            .optional()?
            .flatten();
        Ok(gid.map(|g| g as u32))
    }

    pub fn set_message_group_id(&self, mid: u64, group_id: u32) -> EcResult<()> {
        self.with_write(|txn, _| {
            let n = txn.conn().execute(
                "UPDATE messages SET group_id = ?1 WHERE message_id = ?2",
                params![i64::from(group_id), mid as i64],
            )?;
            if n == 0 {
                return Err(EcError::NotFound);
            }
            Ok(())
        })
    }

    /// Record which property groups one committed change touched.
    pub fn save_change_indices(
        &self,
        mid: u64,
        cn: u64,
        indices: &[u32],
        ungrouped: &[u32],
    ) -> EcResult<()> {
        let mut ip = crate::codec::ExtPush::new();
        for &i in indices {
            ip.u32(i);
        }
        let mut tp = crate::codec::ExtPush::new();
        for &t in ungrouped {
            tp.u32(t);
        }
        self.with_write(|txn, _| {
            txn.conn().execute(
                "INSERT INTO message_changes (message_id, change_number, indices, proptags)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    mid as i64,
                    eid_gc(cn) as i64,
                    ip.into_bytes(),
                    tp.into_bytes()
                ],
            )?;
            Ok(())
        })
    }

    /// Property-group indices of every change since (exclusive) `cn`.
    pub fn get_change_indices(&self, mid: u64, cn: u64) -> EcResult<(Vec<u32>, Vec<u32>)> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT indices, proptags FROM message_changes
             WHERE message_id = ?1 AND change_number > ?2",
        )?;
        let rows = stmt
            .query_map(params![mid as i64, eid_gc(cn) as i64], |r| {
                Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut indices = Vec::new();
        let mut ungrouped = Vec::new();
        for (iblob, tblob) in rows {
            let mut pull = crate::codec::ExtPull::new(&iblob);
            while pull.remaining() >= 4 {
                let v = pull.u32()?;
                if !indices.contains(&v) {
                    indices.push(v);
                }
            }
            let mut pull = crate::codec::ExtPull::new(&tblob);
            while pull.remaining() >= 4 {
                let v = pull.u32()?;
                if !ungrouped.contains(&v) {
                    ungrouped.push(v);
                }
            }
        }
        Ok((indices, ungrouped))
    }

    /// Atomically claim the submit flag; a second claim fails until
    /// [`clear_submit`](Self::clear_submit).
    pub fn try_mark_submit(&self, mid: u64) -> EcResult<bool> {
        self.with_write(|txn, _| {
            let conn = txn.conn();
            let key = Some(("message_id", mid as i64));
            let flags = props::read_props(conn, self.dir(), "message_properties", key, &[tags::PR_MESSAGE_FLAGS])?
                .get(tags::PR_MESSAGE_FLAGS)
                .and_then(|v| v.as_u32())
                .unwrap_or(0);
            if flags & msgflags::SUBMITTED != 0 {
                return Ok(false);
            }
            props::write_prop(
                conn,
                "message_properties",
                key,
                &TaggedPropval::new(
                    tags::PR_MESSAGE_FLAGS,
                    PropValue::Long(flags | msgflags::SUBMITTED),
                ),
            )?;
            Ok(true)
        })
    }

    pub fn clear_submit(&self, mid: u64) -> EcResult<()> {
        self.with_write(|txn, _| {
            let conn = txn.conn();
            let key = Some(("message_id", mid as i64));
            let flags = props::read_props(conn, self.dir(), "message_properties", key, &[tags::PR_MESSAGE_FLAGS])?
                .get(tags::PR_MESSAGE_FLAGS)
                .and_then(|v| v.as_u32())
                .unwrap_or(0);
            props::write_prop(
                conn,
                "message_properties",
                key,
                &TaggedPropval::new(
                    tags::PR_MESSAGE_FLAGS,
                    PropValue::Long(flags & !msgflags::SUBMITTED),
                ),
            )?;
            Ok(())
        })
    }

    /// Link a message into a search folder's result view.
    pub fn link_message(&self, folder_id: u64, mid: u64) -> EcResult<()> {
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            match super::folders::folder_row(conn, folder_id)? {
                Some((_, false, true)) => {}
                Some(_) => return Err(EcError::NotSearchFolder),
                None => return Err(EcError::NotFound),
            }
            if message_row(conn, mid)?.is_none() {
                return Err(EcError::NotFound);
            }
            conn.execute(
                "REPLACE INTO search_result (folder_id, message_id) VALUES (?1, ?2)",
                params![folder_id as i64, mid as i64],
            )?;
            ctx.notify(DbNotify::MessageCreated { folder_id, message_id: mid });
            Ok(())
        })
    }

    pub fn unlink_message(&self, folder_id: u64, mid: u64) -> EcResult<()> {
        self.with_write(|txn, ctx| {
            let n = txn.conn().execute(
                "DELETE FROM search_result WHERE folder_id = ?1 AND message_id = ?2",
                params![folder_id as i64, mid as i64],
            )?;
            if n == 0 {
                return Err(EcError::NotFound);
            }
            ctx.notify(DbNotify::MessageDeleted { folder_id, message_id: mid });
            Ok(())
        })
    }

    pub fn set_message_timer(&self, mid: u64, timer_id: u32) -> EcResult<()> {
        self.with_write(|txn, _| {
            let n = txn.conn().execute(
                "UPDATE messages SET timer_id = ?1 WHERE message_id = ?2",
                params![i64::from(timer_id), mid as i64],
            )?;
            if n == 0 {
                return Err(EcError::NotFound);
            }
            Ok(())
        })
    }

    pub fn get_message_timer(&self, mid: u64) -> EcResult<Option<u32>> {
        let conn = self.reader()?;
        let t: Option<i64> = conn
            .query_row("SELECT timer_id FROM messages WHERE message_id = ?1", [mid as i64], |r| {
                r.get(0)
            })
            .optional()?
            .flatten();
        Ok(t.map(|v| v as u32))
    }

    /// Import/replace a full message. The stored and candidate predecessor
    /// change lists decide whether the write applies (spec conflict rules).
    pub fn write_message(
        &self,
        folder_id: u64,
        content: &MessageContent,
        fail_on_conflict: bool,
    ) -> EcResult<u64> {
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            if super::folders::folder_row(conn, folder_id)?.is_none() {
                return Err(EcError::NotFound);
            }
            let mid = match content.props.get(tags::PR_MID).and_then(|v| v.as_u64()) {
                Some(mid) => mid,
                None => allocate_eid(conn)?,
            };
            let candidate_pcl = match content
                .props
                .get(tags::PR_PREDECESSOR_CHANGE_LIST)
                .and_then(|v| v.as_bytes())
            {
                Some(blob) => Pcl::deserialize(blob)?,
                None => Pcl::new(),
            };
            let existing = message_row(conn, mid)?;
            let mut conflict = false;
            if let Some(row) = &existing {
                let stored = props::read_props(
                    conn,
                    self.dir(),
                    "message_properties",
                    Some(("message_id", mid as i64)),
                    &[tags::PR_PREDECESSOR_CHANGE_LIST],
                )?;
                let stored_pcl = match stored
                    .get(tags::PR_PREDECESSOR_CHANGE_LIST)
                    .and_then(|v| v.as_bytes())
                {
                    Some(blob) => Pcl::deserialize(blob)?,
                    None => Pcl::new(),
                };
                match Pcl::compare(&candidate_pcl, &stored_pcl) {
                    PclCompare::OlderOrEqual => return Err(EcError::SyncIgnore),
                    PclCompare::Newer => {}
                    PclCompare::Conflict => {
                        if fail_on_conflict {
                            return Err(EcError::SyncConflict);
                        }
                        conflict = true;
                    }
                }
            }

            let is_fai = content
                .props
                .get(tags::PR_ASSOCIATED)
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let cn = allocate_cn(conn)?;
            match existing {
                Some(_) => {
                    conn.execute(
                        "UPDATE messages SET parent_fid = ?1, is_associated = ?2,
                                change_number = ?3, is_deleted = 0
                         WHERE message_id = ?4",
                        params![
                            folder_id as i64,
                            i64::from(is_fai),
                            eid_gc(cn) as i64,
                            mid as i64
                        ],
                    )?;
                }
                None => {
                    conn.execute(
                        "INSERT INTO messages (message_id, parent_fid, is_associated, change_number)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![mid as i64, folder_id as i64, i64::from(is_fai), eid_gc(cn) as i64],
                    )?;
                }
            }
            write_message_content(self, conn, mid, content, ctx)?;

            // merge histories and stamp the local change
            let key = Some(("message_id", mid as i64));
            let xid = Xid::from_cn(self.mailbox_guid(), eid_gc(cn));
            let mut pcl = candidate_pcl;
            if conflict {
                let stored = props::read_props(
                    conn,
                    self.dir(),
                    "message_properties",
                    key,
                    &[tags::PR_MESSAGE_STATUS],
                )?;
                let status = stored
                    .get(tags::PR_MESSAGE_STATUS)
                    .and_then(|v| v.as_u32())
                    .unwrap_or(0);
                props::write_prop(
                    conn,
                    "message_properties",
                    key,
                    &TaggedPropval::new(
                        tags::PR_MESSAGE_STATUS,
                        PropValue::Long(status | MSGSTATUS_IN_CONFLICT),
                    ),
                )?;
            }
            pcl.append(xid);
            let change_key = content
                .props
                .get(tags::PR_CHANGE_KEY)
                .and_then(|v| v.as_bytes())
                .map(<[u8]>::to_vec)
                .unwrap_or_else(|| xid.serialize());
            props::write_prop(
                conn,
                "message_properties",
                key,
                &TaggedPropval::new(tags::PR_CHANGE_KEY, PropValue::Binary(change_key)),
            )?;
            props::write_prop(
                conn,
                "message_properties",
                key,
                &TaggedPropval::new(
                    tags::PR_PREDECESSOR_CHANGE_LIST,
                    PropValue::Binary(pcl.serialize()),
                ),
            )?;
            if content.props.get(tags::PR_SOURCE_KEY).is_none() {
                props::write_prop(
                    conn,
                    "message_properties",
                    key,
                    &TaggedPropval::new(
                        tags::PR_SOURCE_KEY,
                        PropValue::Binary(
                            Xid { guid: self.mailbox_guid(), gc: eid_gc(mid), gc_len: 6 }
                                .serialize(),
                        ),
                    ),
                )?;
            }
            match existing {
                Some(_) => ctx.notify(DbNotify::MessageModified { folder_id, message_id: mid }),
                None => ctx.notify(DbNotify::MessageCreated { folder_id, message_id: mid }),
            }
            touch_folder_quiet(self, conn, folder_id)?;
            Ok(mid)
        })
    }

    pub fn read_message(&self, mid: u64) -> EcResult<MessageContent> {
        let conn = self.reader()?;
        read_message_content(self, &conn, mid)
    }

    /// Bump the change number without touching the body.
    pub fn mark_modified(&self, mid: u64) -> EcResult<()> {
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            let row = message_row(conn, mid)?.ok_or(EcError::NotFound)?;
            touch_message(self, conn, mid)?;
            ctx.notify(DbNotify::MessageModified { folder_id: row.parent_fid, message_id: mid });
            Ok(())
        })
    }

    /// Normal messages of a folder with their brief properties.
    pub fn query_folder_messages(&self, folder_id: u64) -> EcResult<Vec<PropList>> {
        let conn = self.reader()?;
        let mut out = Vec::new();
        for mid in message_ids_in(&conn, folder_id, Some(false), false)? {
            out.push(self.get_message_properties(
                mid,
                &[
                    tags::PR_MID,
                    tags::PR_SUBJECT,
                    tags::PR_SENDER_EMAIL_ADDRESS,
                    tags::PR_MESSAGE_DELIVERY_TIME,
                    tags::PR_MESSAGE_SIZE,
                    tags::PR_READ,
                ],
            )?);
        }
        Ok(out)
    }

    /// Does any contact folder hold this email address?
    pub fn check_contact_address(&self, address: &str) -> EcResult<bool> {
        let conn = self.reader()?;
        let contacts = crate::types::private_fid::CONTACTS;
        for mid in message_ids_in(&conn, contacts, Some(false), false)? {
            let got = self.get_message_properties(
                mid,
                &[tags::PR_EMAIL_ADDRESS, tags::PR_SMTP_ADDRESS],
            )?;
            for tag in [tags::PR_EMAIL_ADDRESS, tags::PR_SMTP_ADDRESS] {
                if got
                    .get(tag)
                    .and_then(|v| v.as_str())
                    .is_some_and(|s| s.eq_ignore_ascii_case(address))
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Unread count of a public folder for one user.
    pub fn get_public_folder_unread_count(&self, username: &str, folder_id: u64) -> EcResult<u32> {
        if self.is_private() {
            return Err(EcError::NotSupported);
        }
        let conn = self.reader()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.parent_fid = ?1 AND m.is_associated = 0 AND m.is_deleted = 0
               AND NOT EXISTS (SELECT 1 FROM read_states r
                               WHERE r.message_id = m.message_id AND r.username = ?2)",
            params![folder_id as i64, username],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }

    /// Hard-remove soft-deleted folders and messages older than `cutoff`
    /// (unix seconds; 0 sweeps everything).
    pub fn purge_softdelete(&self, folder_id: u64, cutoff: i64) -> EcResult<()> {
        let _ = cutoff; // deletion time is not tracked per row; full sweep
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            let mids: Vec<u64> = {
                let mut stmt = conn.prepare(
                    "SELECT message_id FROM messages WHERE parent_fid = ?1 AND is_deleted = 1",
                )?;
                let rows = stmt.query_map([folder_id as i64], |r| r.get::<_, i64>(0).map(|v| v as u64))?
                    .collect::<Result<_, _>>()?;
                rows
            };
            for mid in mids {
                delete_message_row(self, conn, mid, true, ctx)?;
            }
            let fids: Vec<u64> = {
                let mut stmt = conn.prepare(
                    "SELECT folder_id FROM folders WHERE parent_id = ?1 AND is_deleted = 1",
                )?;
                let rows = stmt.query_map([folder_id as i64], |r| r.get::<_, i64>(0).map(|v| v as u64))?
                    .collect::<Result<_, _>>()?;
                rows
            };
            for fid in fids {
                super::folders::hard_delete_tree(self, conn, fid, ctx)?;
            }
            Ok(())
        })
    }

    /// Garbage-collect `cid/` and orphaned `eml/` files.
    pub fn purge_datafiles(&self) -> EcResult<()> {
        super::cid::audit(self)?;
        let conn = self.reader()?;
        let eml_dir = self.dir().join("eml");
        for entry in std::fs::read_dir(&eml_dir)? {
            let entry = entry?;
            let Some(gc) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            let mid = make_eid(REPLID_LOCAL, gc);
            if message_row(&conn, mid)?.is_none() {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}

/// Folder bookkeeping after content changes: bump `PR_LOCAL_COMMIT_TIME_MAX`
/// and the hierarchy change number without emitting a folder notification.
pub(crate) fn touch_folder_quiet(store: &Store, conn: &Connection, folder_id: u64) -> EcResult<()> {
    if super::folders::folder_row(conn, folder_id)?.is_none() {
        return Ok(());
    }
    props::write_prop(
        conn,
        "folder_properties",
        Some(("folder_id", folder_id as i64)),
        &TaggedPropval::new(
            tags::PR_LOCAL_COMMIT_TIME_MAX,
            PropValue::SysTime(crate::types::filetime_now()),
        ),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::types::private_fid;

    fn simple_message(subject: &str) -> MessageContent {
        let mut content = MessageContent::default();
        content.props.set(tags::PR_SUBJECT, PropValue::Unicode(subject.into()));
        content.props.set(tags::PR_MESSAGE_CLASS, PropValue::Unicode("IPM.Note".into()));
        let mut rcpt = PropList::new();
        rcpt.set(tags::PR_SMTP_ADDRESS, PropValue::Unicode("to@example.com".into()));
        content.recipients.push(rcpt);
        content
    }

    #[test]
    fn write_and_read_round_trip() {
        let (_tmp, _engine, store) = temp_store();
        let mid = store
            .write_message(private_fid::INBOX, &simple_message("hello"), false)
            .unwrap();
        assert!(store.check_message(private_fid::INBOX, mid).unwrap());

        let back = store.read_message(mid).unwrap();
        assert_eq!(back.props.get(tags::PR_SUBJECT).and_then(|v| v.as_str()), Some("hello"));
        assert_eq!(back.recipients.len(), 1);
        assert!(back.props.get(tags::PR_CHANGE_KEY).is_some());
        assert!(back.props.get(tags::PR_PREDECESSOR_CHANGE_LIST).is_some());
    }

    #[test]
    fn cn_advances_and_pcl_grows() {
        let (_tmp, _engine, store) = temp_store();
        let mid = store
            .write_message(private_fid::INBOX, &simple_message("v1"), false)
            .unwrap();
        let before = store
            .get_message_properties(mid, &[tags::PR_CHANGE_NUMBER, tags::PR_PREDECESSOR_CHANGE_LIST])
            .unwrap();
        let cn_before = before.get(tags::PR_CHANGE_NUMBER).and_then(|v| v.as_u64()).unwrap();
        let pcl_before = Pcl::deserialize(
            before.get(tags::PR_PREDECESSOR_CHANGE_LIST).unwrap().as_bytes().unwrap(),
        )
        .unwrap();

        let mut update = PropList::new();
        update.set(tags::PR_SUBJECT, PropValue::Unicode("v2".into()));
        store.set_message_properties(mid, &update).unwrap();

        let after = store
            .get_message_properties(mid, &[tags::PR_CHANGE_NUMBER, tags::PR_PREDECESSOR_CHANGE_LIST])
            .unwrap();
        let cn_after = after.get(tags::PR_CHANGE_NUMBER).and_then(|v| v.as_u64()).unwrap();
        let pcl_after = Pcl::deserialize(
            after.get(tags::PR_PREDECESSOR_CHANGE_LIST).unwrap().as_bytes().unwrap(),
        )
        .unwrap();
        assert!(eid_gc(cn_after) > eid_gc(cn_before));
        assert!(pcl_after.includes(&pcl_before));
    }

    #[test]
    fn conflict_matrix() {
        let (_tmp, _engine, store) = temp_store();
        let mid = store
            .write_message(private_fid::INBOX, &simple_message("base"), false)
            .unwrap();
        let base = store.read_message(mid).unwrap();

        // client A: descends from base
        let mut a = base.clone();
        let mut pcl_a = Pcl::deserialize(
            base.props.get(tags::PR_PREDECESSOR_CHANGE_LIST).unwrap().as_bytes().unwrap(),
        )
        .unwrap();
        let guid_a = uuid::Uuid::new_v4();
        pcl_a.append(Xid::from_cn(guid_a, 1));
        a.props.set(tags::PR_PREDECESSOR_CHANGE_LIST, PropValue::Binary(pcl_a.serialize()));
        a.props.set(tags::PR_SUBJECT, PropValue::Unicode("from A".into()));
        store.write_message(private_fid::INBOX, &a, true).unwrap();

        // client B also descends from base only, so it now conflicts
        let mut b = base.clone();
        let mut pcl_b = Pcl::deserialize(
            base.props.get(tags::PR_PREDECESSOR_CHANGE_LIST).unwrap().as_bytes().unwrap(),
        )
        .unwrap();
        pcl_b.append(Xid::from_cn(uuid::Uuid::new_v4(), 1));
        b.props.set(tags::PR_PREDECESSOR_CHANGE_LIST, PropValue::Binary(pcl_b.serialize()));
        assert_eq!(
            store.write_message(private_fid::INBOX, &b, true).unwrap_err(),
            EcError::SyncConflict
        );

        // without FAILONCONFLICT the write applies and histories merge
        store.write_message(private_fid::INBOX, &b, false).unwrap();
        let merged = store
            .get_message_properties(
                mid,
                &[tags::PR_PREDECESSOR_CHANGE_LIST, tags::PR_MESSAGE_STATUS],
            )
            .unwrap();
        let merged_pcl = Pcl::deserialize(
            merged.get(tags::PR_PREDECESSOR_CHANGE_LIST).unwrap().as_bytes().unwrap(),
        )
        .unwrap();
        assert!(merged_pcl.includes(&pcl_b));
        let status = merged.get(tags::PR_MESSAGE_STATUS).and_then(|v| v.as_u32()).unwrap();
        assert_ne!(status & MSGSTATUS_IN_CONFLICT, 0);

        // a stale replay of base is ignored
        assert_eq!(
            store.write_message(private_fid::INBOX, &base, false).unwrap_err(),
            EcError::SyncIgnore
        );
    }

    #[test]
    fn move_between_folders() {
        let (_tmp, _engine, store) = temp_store();
        let mid = store
            .write_message(private_fid::INBOX, &simple_message("mv"), false)
            .unwrap();
        let dst_mid = store.allocate_message_id(private_fid::SENT_ITEMS).unwrap();
        store
            .movecopy_message(mid, private_fid::SENT_ITEMS, dst_mid, true)
            .unwrap();
        assert!(!store.check_message(private_fid::INBOX, mid).unwrap());
        assert!(store.check_message(private_fid::SENT_ITEMS, dst_mid).unwrap());
    }

    #[test]
    fn submit_flag_is_exclusive() {
        let (_tmp, _engine, store) = temp_store();
        let mid = store
            .write_message(private_fid::OUTBOX, &simple_message("s"), false)
            .unwrap();
        assert!(store.try_mark_submit(mid).unwrap());
        assert!(!store.try_mark_submit(mid).unwrap());
        store.clear_submit(mid).unwrap();
        assert!(store.try_mark_submit(mid).unwrap());
    }

    #[test]
    fn read_state_round_trip() {
        let (_tmp, _engine, store) = temp_store();
        let mid = store
            .write_message(private_fid::INBOX, &simple_message("r"), false)
            .unwrap();
        store.set_message_read_state("user@example.com", mid, true).unwrap();
        let got = store.get_message_properties(mid, &[tags::PR_READ]).unwrap();
        assert_eq!(got.get(tags::PR_READ).and_then(|v| v.as_bool()), Some(true));
    }
}
