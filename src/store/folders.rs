//! Folder tree CRUD.
//!
//! Folders live in `folders` + `folder_properties`. Every mutation
//! allocates a change number and rolls it into the folder's change key and
//! predecessor change list, which is what ICS hierarchy sync feeds on.

use rusqlite::{params, Connection, OptionalExtension};

use crate::types::propval::{folder_type, tags, PropList, PropValue, TaggedPropval};
use crate::types::{
    eid_gc, make_eid, EcError, EcResult, Pcl, Xid, CUSTOM_EID_BEGIN, REPLID_LOCAL,
};

use super::messages::{self, delete_message_row};
use super::notify::DbNotify;
use super::{allocate_cn, allocate_eid, props, Store, WriteCtx};

/// `delete_folder` / `empty_folder` flag bits.
pub mod del_flags {
    pub const MESSAGES: u32 = 0x01;
    pub const FOLDERS: u32 = 0x04;
    pub const ASSOCIATED: u32 = 0x08;
    pub const HARD_DELETE: u32 = 0x10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedFolder {
    pub folder_id: u64,
    pub is_existing: bool,
}

pub(crate) fn folder_row(conn: &Connection, folder_id: u64) -> EcResult<Option<(u64, bool, bool)>> {
    let row: Option<(Option<i64>, i64, i64)> = conn
        .query_row(
            "SELECT parent_id, is_deleted, is_search FROM folders WHERE folder_id = ?1",
            [folder_id as i64],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    Ok(row.map(|(parent, deleted, search)| {
        (parent.unwrap_or(0) as u64, deleted != 0, search != 0)
    }))
}

pub(crate) fn child_folder_ids(conn: &Connection, parent_id: u64) -> EcResult<Vec<u64>> {
    let mut stmt = conn.prepare(
        "SELECT folder_id FROM folders WHERE parent_id = ?1 AND is_deleted = 0",
    )?;
    let ids = stmt
        .query_map([parent_id as i64], |r| r.get::<_, i64>(0).map(|v| v as u64))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// True when `folder_id` equals or descends from `ancestor`.
pub(crate) fn is_descendant(conn: &Connection, ancestor: u64, folder_id: u64) -> EcResult<bool> {
    let mut cursor = folder_id;
    // the tree is shallow; 256 hops means a corrupted parent chain
    for _ in 0..256 {
        if cursor == ancestor {
            return Ok(true);
        }
        match folder_row(conn, cursor)? {
            Some((parent, _, _)) if parent != 0 && parent != cursor => cursor = parent,
            _ => return Ok(false),
        }
    }
    Err(EcError::CorruptData)
}

/// Bump the folder's change number and derived change-key properties.
pub(crate) fn touch_folder(store: &Store, conn: &Connection, folder_id: u64) -> EcResult<u64> {
    let cn = allocate_cn(conn)?;
    conn.execute(
        "UPDATE folders SET change_number = ?1 WHERE folder_id = ?2",
        params![eid_gc(cn) as i64, folder_id as i64],
    )?;
    let xid = Xid::from_cn(store.mailbox_guid(), eid_gc(cn));
    let key = Some(("folder_id", folder_id as i64));
    let old_pcl = props::read_props(
        conn,
        store.dir(),
        "folder_properties",
        key,
        &[tags::PR_PREDECESSOR_CHANGE_LIST],
    )?;
    let mut pcl = match old_pcl
        .get(tags::PR_PREDECESSOR_CHANGE_LIST)
        .and_then(|v| v.as_bytes())
    {
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
        props::write_prop(conn, "folder_properties", key, &tp)?;
    }
    Ok(cn)
}

fn find_child_by_name(conn: &Connection, parent_id: u64, name: &str) -> EcResult<Option<u64>> {
    for fid in child_folder_ids(conn, parent_id)? {
        let sql = "SELECT propval FROM folder_properties
                   WHERE folder_id = ?1 AND proptag = ?2";
        let blob: Option<Vec<u8>> = conn
            .query_row(sql, params![fid as i64, tags::PR_DISPLAY_NAME as i64], |r| r.get(0))
            .optional()?;
        if let Some(blob) = blob {
            let have = crate::codec::decode_propvalue(
                crate::types::propval::PT_UNICODE,
                &blob[1..],
            )?;
            if have.as_str().is_some_and(|s| s.eq_ignore_ascii_case(name)) {
                return Ok(Some(fid));
            }
        }
    }
    Ok(None)
}

impl Store {
    pub fn check_folder_id(&self, folder_id: u64) -> EcResult<bool> {
        let conn = self.reader()?;
        Ok(matches!(folder_row(&conn, folder_id)?, Some((_, false, _))))
    }

    pub fn check_folder_deleted(&self, folder_id: u64) -> EcResult<bool> {
        let conn = self.reader()?;
        match folder_row(&conn, folder_id)? {
            Some((_, deleted, _)) => Ok(deleted),
            None => Ok(true),
        }
    }

    /// Would moving `src` under `dst` create a cycle?
    pub fn check_folder_cycle(&self, src_fid: u64, dst_fid: u64) -> EcResult<bool> {
        let conn = self.reader()?;
        is_descendant(&conn, src_fid, dst_fid)
    }

    pub fn get_folder_by_name(&self, parent_id: u64, name: &str) -> EcResult<Option<u64>> {
        let conn = self.reader()?;
        find_child_by_name(&conn, parent_id, name)
    }

    pub fn create_folder(
        &self,
        parent_id: u64,
        ftype: u32,
        name: &str,
        extra: &PropList,
        open_existing: bool,
    ) -> EcResult<CreatedFolder> {
        if name.is_empty() || !matches!(ftype, folder_type::GENERIC | folder_type::SEARCH) {
            return Err(EcError::InvalidParam);
        }
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            match folder_row(conn, parent_id)? {
                Some((_, false, _)) => {}
                _ => return Err(EcError::NotFound),
            }
            if let Some(existing) = find_child_by_name(conn, parent_id, name)? {
                if !open_existing {
                    return Err(EcError::DuplicateName);
                }
                let (_, _, is_search) = folder_row(conn, existing)?.ok_or(EcError::NotFound)?;
                let same_type = is_search == (ftype == folder_type::SEARCH);
                if !same_type {
                    return Err(EcError::DuplicateName);
                }
                return Ok(CreatedFolder { folder_id: existing, is_existing: true });
            }

            let folder_id = allocate_eid(conn)?;
            let cn = allocate_cn(conn)?;
            conn.execute(
                "INSERT INTO folders (folder_id, parent_id, change_number, is_search)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    folder_id as i64,
                    parent_id as i64,
                    eid_gc(cn) as i64,
                    i64::from(ftype == folder_type::SEARCH)
                ],
            )?;
            let key = Some(("folder_id", folder_id as i64));
            let now = crate::types::filetime_now();
            let xid = Xid::from_cn(self.mailbox_guid(), eid_gc(cn));
            let mut pcl = Pcl::new();
            pcl.append(xid);
            let mut list = extra.clone();
            list.set(tags::PR_DISPLAY_NAME, PropValue::Unicode(name.to_owned()));
            list.set(tags::PR_FOLDER_TYPE, PropValue::Long(ftype));
            list.set(tags::PR_CREATION_TIME, PropValue::SysTime(now));
            list.set(tags::PR_LAST_MODIFICATION_TIME, PropValue::SysTime(now));
            list.set(tags::PR_CHANGE_KEY, PropValue::Binary(xid.serialize()));
            list.set(
                tags::PR_PREDECESSOR_CHANGE_LIST,
                PropValue::Binary(pcl.serialize()),
            );
            list.set(
                tags::PR_SOURCE_KEY,
                PropValue::Binary(
                    Xid { guid: self.mailbox_guid(), gc: eid_gc(folder_id), gc_len: 6 }
                        .serialize(),
                ),
            );
            for tp in list.iter() {
                props::write_prop(conn, "folder_properties", key, tp)?;
            }
            touch_folder(self, conn, parent_id)?;
            ctx.notify(DbNotify::FolderCreated { folder_id, parent_id });
            Ok(CreatedFolder { folder_id, is_existing: false })
        })
    }

    pub fn get_folder_all_proptags(&self, folder_id: u64) -> EcResult<Vec<u32>> {
        let conn = self.reader()?;
        if folder_row(&conn, folder_id)?.is_none() {
            return Err(EcError::NotFound);
        }
        let mut out =
            props::all_proptags(&conn, "folder_properties", Some(("folder_id", folder_id as i64)))?;
        for tag in [
            tags::PR_FOLDER_ID,
            tags::PR_PARENT_FID,
            tags::PR_CHANGE_NUMBER,
            tags::PR_CONTENT_COUNT,
            tags::PR_CONTENT_UNREAD,
            tags::PR_SUBFOLDERS,
        ] {
            if !out.contains(&tag) {
                out.push(tag);
            }
        }
        Ok(out)
    }

    pub fn get_folder_properties(&self, folder_id: u64, want: &[u32]) -> EcResult<PropList> {
        let conn = self.reader()?;
        let (parent, _deleted, _search) =
            folder_row(&conn, folder_id)?.ok_or(EcError::NotFound)?;
        let key = Some(("folder_id", folder_id as i64));
        let mut out = props::read_props(&conn, self.dir(), "folder_properties", key, want)?;
        for &tag in want {
            let value = match tag {
                tags::PR_FOLDER_ID => Some(PropValue::I8(folder_id)),
                tags::PR_PARENT_FID => Some(PropValue::I8(parent)),
                tags::PR_CHANGE_NUMBER => {
                    let cn: i64 = conn.query_row(
                        "SELECT change_number FROM folders WHERE folder_id = ?1",
                        [folder_id as i64],
                        |r| r.get(0),
                    )?;
                    Some(PropValue::I8(make_eid(REPLID_LOCAL, cn as u64)))
                }
                tags::PR_CONTENT_COUNT => {
                    Some(PropValue::Long(messages::count_messages(&conn, folder_id, false)? as u32))
                }
                tags::PR_CONTENT_UNREAD => {
                    let n: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM messages
                         WHERE parent_fid = ?1 AND is_associated = 0
                           AND is_deleted = 0 AND read_state = 0",
                        [folder_id as i64],
                        |r| r.get(0),
                    )?;
                    Some(PropValue::Long(n as u32))
                }
                tags::PR_SUBFOLDERS => {
                    Some(PropValue::Bool(!child_folder_ids(&conn, folder_id)?.is_empty()))
                }
                _ => None,
            };
            if let Some(v) = value {
                out.set(tag, v);
            }
        }
        Ok(out)
    }

    pub fn set_folder_properties(&self, folder_id: u64, values: &PropList) -> EcResult<Vec<u32>> {
        let mut problems = Vec::new();
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            if folder_row(conn, folder_id)?.is_none() {
                return Err(EcError::NotFound);
            }
            let key = Some(("folder_id", folder_id as i64));
            for tp in values.iter() {
                match tp.tag {
                    tags::PR_FOLDER_ID
                    | tags::PR_PARENT_FID
                    | tags::PR_CHANGE_NUMBER
                    | tags::PR_CONTENT_COUNT
                    | tags::PR_CONTENT_UNREAD
                    | tags::PR_SUBFOLDERS => problems.push(tp.tag),
                    _ => props::write_prop(conn, "folder_properties", key, tp)?,
                }
            }
            touch_folder(self, conn, folder_id)?;
            ctx.notify(DbNotify::FolderModified { folder_id });
            Ok(())
        })?;
        Ok(problems)
    }

    pub fn remove_folder_properties(&self, folder_id: u64, tags_: &[u32]) -> EcResult<()> {
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            let key = Some(("folder_id", folder_id as i64));
            for &tag in tags_ {
                props::remove_prop(conn, "folder_properties", key, tag)?;
            }
            touch_folder(self, conn, folder_id)?;
            ctx.notify(DbNotify::FolderModified { folder_id });
            Ok(())
        })
    }

    /// Delete a folder. Soft deletion leaves the row addressable; hard
    /// deletion removes the folder and every descendant. The folder must
    /// be empty of live children unless the caller emptied it first (use
    /// [`Store::empty_folder`] for the recursive flag semantics).
    pub fn delete_folder(&self, folder_id: u64, hard: bool) -> EcResult<()> {
        if eid_gc(folder_id) < CUSTOM_EID_BEGIN {
            return Err(EcError::AccessDenied);
        }
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            let (parent, _, _) = folder_row(conn, folder_id)?.ok_or(EcError::NotFound)?;
            if hard {
                hard_delete_tree(self, conn, folder_id, ctx)?;
            } else {
                conn.execute(
                    "UPDATE folders SET is_deleted = 1 WHERE folder_id = ?1",
                    [folder_id as i64],
                )?;
            }
            touch_folder(self, conn, parent)?;
            ctx.notify(DbNotify::FolderDeleted { folder_id, parent_id: parent });
            Ok(())
        })
    }

    /// Remove folder contents per `del_flags`. Messages pinned by an open
    /// instance are skipped and reported through the partial flag.
    pub fn empty_folder(&self, folder_id: u64, flags: u32) -> EcResult<bool> {
        let held: Vec<u64> = super::lock(&self.instances)
            .values()
            .filter_map(|inst| inst.message_id())
            .collect();
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            if folder_row(conn, folder_id)?.is_none() {
                return Err(EcError::NotFound);
            }
            let partial = empty_folder_tx(self, conn, folder_id, flags, &held, ctx)?;
            touch_folder(self, conn, folder_id)?;
            ctx.notify(DbNotify::FolderModified { folder_id });
            Ok(partial)
        })
    }

    /// Move or copy a folder under a new parent, optionally renaming it.
    pub fn movecopy_folder(
        &self,
        folder_id: u64,
        dst_parent_id: u64,
        new_name: Option<&str>,
        copy: bool,
    ) -> EcResult<u64> {
        if !copy && eid_gc(folder_id) < CUSTOM_EID_BEGIN {
            return Err(EcError::AccessDenied);
        }
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            let (old_parent, _, _) = folder_row(conn, folder_id)?.ok_or(EcError::NotFound)?;
            if folder_row(conn, dst_parent_id)?.is_none() {
                return Err(EcError::NotFound);
            }
            if is_descendant(conn, folder_id, dst_parent_id)? {
                return Err(EcError::RootFolder);
            }
            let name = match new_name {
                Some(n) => n.to_owned(),
                None => self
                    .folder_display_name(conn, folder_id)?
                    .unwrap_or_else(|| eid_gc(folder_id).to_string()),
            };
            if find_child_by_name(conn, dst_parent_id, &name)?.is_some() {
                return Err(EcError::DuplicateName);
            }

            if copy {
                let new_fid = copy_folder_tree(self, conn, folder_id, dst_parent_id, &name, ctx)?;
                touch_folder(self, conn, dst_parent_id)?;
                ctx.notify(DbNotify::FolderCopied { folder_id: new_fid, parent_id: dst_parent_id });
                Ok(new_fid)
            } else {
                conn.execute(
                    "UPDATE folders SET parent_id = ?1 WHERE folder_id = ?2",
                    params![dst_parent_id as i64, folder_id as i64],
                )?;
                props::write_prop(
                    conn,
                    "folder_properties",
                    Some(("folder_id", folder_id as i64)),
                    &TaggedPropval::new(tags::PR_DISPLAY_NAME, PropValue::Unicode(name)),
                )?;
                touch_folder(self, conn, folder_id)?;
                touch_folder(self, conn, old_parent)?;
                touch_folder(self, conn, dst_parent_id)?;
                ctx.notify(DbNotify::FolderMoved {
                    folder_id,
                    parent_id: dst_parent_id,
                    old_parent_id: old_parent,
                });
                Ok(folder_id)
            }
        })
    }

    /// Copy the contents (messages, and optionally subfolders) of `src`
    /// into `dst`, both already existing.
    pub fn copy_folder_internal(
        &self,
        src_fid: u64,
        dst_fid: u64,
        include_subfolders: bool,
    ) -> EcResult<()> {
        self.with_write(|txn, ctx| {
            let conn = txn.conn();
            if is_descendant(conn, src_fid, dst_fid)? && include_subfolders {
                return Err(EcError::RootFolder);
            }
            copy_folder_contents(self, conn, src_fid, dst_fid, include_subfolders, ctx)?;
            touch_folder(self, conn, dst_fid)?;
            ctx.notify(DbNotify::FolderModified { folder_id: dst_fid });
            Ok(())
        })
    }

    // ---- receive-folder routing ----

    /// Longest-prefix match over registered message classes.
    pub fn get_folder_by_class(&self, class: &str) -> EcResult<(u64, String)> {
        let conn = self.reader()?;
        let mut cursor = class.to_ascii_lowercase();
        loop {
            let hit: Option<i64> = conn
                .query_row(
                    "SELECT folder_id FROM receive_table WHERE class = ?1",
                    [cursor.as_str()],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(fid) = hit {
                return Ok((fid as u64, cursor));
            }
            match cursor.rfind('.') {
                Some(dot) => cursor.truncate(dot),
                None if cursor.is_empty() => return Err(EcError::NoReceiveFolder),
                None => cursor.clear(),
            }
        }
    }

    pub fn set_folder_by_class(&self, folder_id: u64, class: &str) -> EcResult<()> {
        self.with_write(|txn, _ctx| {
            let conn = txn.conn();
            if folder_id == 0 {
                conn.execute(
                    "DELETE FROM receive_table WHERE class = ?1",
                    [class.to_ascii_lowercase()],
                )?;
                return Ok(());
            }
            if folder_row(conn, folder_id)?.is_none() {
                return Err(EcError::NotFound);
            }
            conn.execute(
                "REPLACE INTO receive_table (class, folder_id, modified_time) VALUES (?1, ?2, ?3)",
                params![
                    class.to_ascii_lowercase(),
                    folder_id as i64,
                    chrono::Utc::now().timestamp()
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_folder_class_table(&self) -> EcResult<Vec<(String, u64, i64)>> {
        let conn = self.reader()?;
        let mut stmt =
            conn.prepare("SELECT class, folder_id, modified_time FROM receive_table ORDER BY class")?;
        let rows = stmt
            .query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64, r.get::<_, i64>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count folders under `folder_id` (direct children, or the whole
    /// subtree with `recursive`).
    pub fn sum_hierarchy(&self, folder_id: u64, recursive: bool) -> EcResult<u32> {
        let conn = self.reader()?;
        fn walk(conn: &Connection, fid: u64, recursive: bool) -> EcResult<u32> {
            let children = child_folder_ids(conn, fid)?;
            let mut n = children.len() as u32;
            if recursive {
                for c in children {
                    n += walk(conn, c, true)?;
                }
            }
            Ok(n)
        }
        walk(&conn, folder_id, recursive)
    }

    fn folder_display_name(&self, conn: &Connection, folder_id: u64) -> EcResult<Option<String>> {
        let got = props::read_props(
            conn,
            self.dir(),
            "folder_properties",
            Some(("folder_id", folder_id as i64)),
            &[tags::PR_DISPLAY_NAME],
        )?;
        Ok(got.get(tags::PR_DISPLAY_NAME).and_then(|v| v.as_str()).map(str::to_owned))
    }
}

pub(crate) fn hard_delete_tree(
    store: &Store,
    conn: &Connection,
    folder_id: u64,
    ctx: &mut WriteCtx,
) -> EcResult<()> {
    for child in child_folder_ids(conn, folder_id)? {
        hard_delete_tree(store, conn, child, ctx)?;
    }
    for mid in messages::message_ids_in(conn, folder_id, None, true)? {
        delete_message_row(store, conn, mid, true, ctx)?;
    }
    conn.execute("DELETE FROM search_scopes WHERE folder_id = ?1", [folder_id as i64])?;
    conn.execute("DELETE FROM search_result WHERE folder_id = ?1", [folder_id as i64])?;
    conn.execute("DELETE FROM permissions WHERE folder_id = ?1", [folder_id as i64])?;
    conn.execute("DELETE FROM rules WHERE folder_id = ?1", [folder_id as i64])?;
    conn.execute("DELETE FROM folders WHERE folder_id = ?1", [folder_id as i64])?;
    Ok(())
}

fn empty_folder_tx(
    store: &Store,
    conn: &Connection,
    folder_id: u64,
    flags: u32,
    held: &[u64],
    ctx: &mut WriteCtx,
) -> EcResult<bool> {
    let hard = flags & del_flags::HARD_DELETE != 0;
    let mut partial = false;
    let fai = match (flags & del_flags::MESSAGES != 0, flags & del_flags::ASSOCIATED != 0) {
        (true, true) => Some(None),
        (true, false) => Some(Some(false)),
        (false, true) => Some(Some(true)),
        (false, false) => None,
    };
    if let Some(assoc_filter) = fai {
        for mid in messages::message_ids_in(conn, folder_id, assoc_filter, false)? {
            if held.contains(&mid) {
                partial = true;
                continue;
            }
            delete_message_row(store, conn, mid, hard, ctx)?;
            ctx.notify(DbNotify::MessageDeleted { folder_id, message_id: mid });
        }
    }
    if flags & del_flags::FOLDERS != 0 {
        for child in child_folder_ids(conn, folder_id)? {
            if eid_gc(child) < CUSTOM_EID_BEGIN {
                partial = true;
                continue;
            }
            let sub_partial = empty_folder_tx(
                store,
                conn,
                child,
                flags | del_flags::MESSAGES | del_flags::ASSOCIATED,
                held,
                ctx,
            )?;
            if sub_partial {
                partial = true;
                continue;
            }
            if hard {
                hard_delete_tree(store, conn, child, ctx)?;
            } else {
                conn.execute(
                    "UPDATE folders SET is_deleted = 1 WHERE folder_id = ?1",
                    [child as i64],
                )?;
            }
            ctx.notify(DbNotify::FolderDeleted { folder_id: child, parent_id: folder_id });
        }
    }
    Ok(partial)
}

fn copy_folder_tree(
    store: &Store,
    conn: &Connection,
    src_fid: u64,
    dst_parent: u64,
    name: &str,
    ctx: &mut WriteCtx,
) -> EcResult<u64> {
    let new_fid = allocate_eid(conn)?;
    let cn = allocate_cn(conn)?;
    let (_, _, is_search) = folder_row(conn, src_fid)?.ok_or(EcError::NotFound)?;
    conn.execute(
        "INSERT INTO folders (folder_id, parent_id, change_number, is_search)
         VALUES (?1, ?2, ?3, ?4)",
        params![new_fid as i64, dst_parent as i64, eid_gc(cn) as i64, i64::from(is_search)],
    )?;
    // copy the property bag wholesale, then refresh identity props
    conn.execute(
        "INSERT INTO folder_properties (folder_id, proptag, propval)
         SELECT ?1, proptag, propval FROM folder_properties WHERE folder_id = ?2",
        params![new_fid as i64, src_fid as i64],
    )?;
    let key = Some(("folder_id", new_fid as i64));
    let xid = Xid::from_cn(store.mailbox_guid(), eid_gc(cn));
    let mut pcl = Pcl::new();
    pcl.append(xid);
    props::write_prop(
        conn,
        "folder_properties",
        key,
        &TaggedPropval::new(tags::PR_DISPLAY_NAME, PropValue::Unicode(name.to_owned())),
    )?;
    props::write_prop(
        conn,
        "folder_properties",
        key,
        &TaggedPropval::new(tags::PR_CHANGE_KEY, PropValue::Binary(xid.serialize())),
    )?;
    props::write_prop(
        conn,
        "folder_properties",
        key,
        &TaggedPropval::new(tags::PR_PREDECESSOR_CHANGE_LIST, PropValue::Binary(pcl.serialize())),
    )?;
    props::write_prop(
        conn,
        "folder_properties",
        key,
        &TaggedPropval::new(
            tags::PR_SOURCE_KEY,
            PropValue::Binary(
                Xid { guid: store.mailbox_guid(), gc: eid_gc(new_fid), gc_len: 6 }.serialize(),
            ),
        ),
    )?;
    copy_folder_contents(store, conn, src_fid, new_fid, true, ctx)?;
    Ok(new_fid)
}

fn copy_folder_contents(
    store: &Store,
    conn: &Connection,
    src_fid: u64,
    dst_fid: u64,
    include_subfolders: bool,
    ctx: &mut WriteCtx,
) -> EcResult<()> {
    for mid in messages::message_ids_in(conn, src_fid, None, false)? {
        messages::copy_message_row(store, conn, mid, dst_fid, ctx)?;
    }
    if include_subfolders {
        for child in child_folder_ids(conn, src_fid)? {
            let name = {
                let got = props::read_props(
                    conn,
                    store.dir(),
                    "folder_properties",
                    Some(("folder_id", child as i64)),
                    &[tags::PR_DISPLAY_NAME],
                )?;
                got.get(tags::PR_DISPLAY_NAME)
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
                    .unwrap_or_else(|| eid_gc(child).to_string())
            };
            copy_folder_tree(store, conn, child, dst_fid, &name, ctx)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::types::private_fid;

    #[test]
    fn create_open_and_duplicate() {
        let (_tmp, _engine, store) = temp_store();
        let created = store
            .create_folder(
                private_fid::IPMSUBTREE,
                folder_type::GENERIC,
                "Invoices",
                &PropList::new(),
                false,
            )
            .unwrap();
        assert!(!created.is_existing);
        assert!(eid_gc(created.folder_id) >= CUSTOM_EID_BEGIN);

        let dup = store.create_folder(
            private_fid::IPMSUBTREE,
            folder_type::GENERIC,
            "Invoices",
            &PropList::new(),
            false,
        );
        assert_eq!(dup.unwrap_err(), EcError::DuplicateName);

        let opened = store
            .create_folder(
                private_fid::IPMSUBTREE,
                folder_type::GENERIC,
                "invoices",
                &PropList::new(),
                true,
            )
            .unwrap();
        assert!(opened.is_existing);
        assert_eq!(opened.folder_id, created.folder_id);

        // same name, different type: still a collision
        let wrong_type = store.create_folder(
            private_fid::IPMSUBTREE,
            folder_type::SEARCH,
            "Invoices",
            &PropList::new(),
            true,
        );
        assert_eq!(wrong_type.unwrap_err(), EcError::DuplicateName);
    }

    #[test]
    fn created_folder_has_change_identity() {
        let (_tmp, _engine, store) = temp_store();
        let created = store
            .create_folder(
                private_fid::IPMSUBTREE,
                folder_type::GENERIC,
                "Keys",
                &PropList::new(),
                false,
            )
            .unwrap();
        let got = store
            .get_folder_properties(
                created.folder_id,
                &[
                    tags::PR_DISPLAY_NAME,
                    tags::PR_CHANGE_KEY,
                    tags::PR_PREDECESSOR_CHANGE_LIST,
                    tags::PR_CREATION_TIME,
                    tags::PR_PARENT_FID,
                ],
            )
            .unwrap();
        assert_eq!(got.get(tags::PR_DISPLAY_NAME).and_then(|v| v.as_str()), Some("Keys"));
        assert!(!got.get(tags::PR_CHANGE_KEY).unwrap().as_bytes().unwrap().is_empty());
        assert!(!got
            .get(tags::PR_PREDECESSOR_CHANGE_LIST)
            .unwrap()
            .as_bytes()
            .unwrap()
            .is_empty());
        assert_eq!(
            got.get(tags::PR_PARENT_FID).and_then(|v| v.as_u64()),
            Some(private_fid::IPMSUBTREE)
        );
        let now = crate::types::filetime_now();
        let created_at = got.get(tags::PR_CREATION_TIME).and_then(|v| v.as_u64()).unwrap();
        assert!(now - created_at < 2 * 10_000_000);
    }

    #[test]
    fn hard_delete_removes_subtree() {
        let (_tmp, _engine, store) = temp_store();
        let parent = store
            .create_folder(private_fid::IPMSUBTREE, folder_type::GENERIC, "A", &PropList::new(), false)
            .unwrap()
            .folder_id;
        let child = store
            .create_folder(parent, folder_type::GENERIC, "B", &PropList::new(), false)
            .unwrap()
            .folder_id;
        store.delete_folder(parent, true).unwrap();
        assert!(!store.check_folder_id(parent).unwrap());
        assert!(!store.check_folder_id(child).unwrap());
    }

    #[test]
    fn soft_delete_keeps_row() {
        let (_tmp, _engine, store) = temp_store();
        let fid = store
            .create_folder(private_fid::IPMSUBTREE, folder_type::GENERIC, "S", &PropList::new(), false)
            .unwrap()
            .folder_id;
        store.delete_folder(fid, false).unwrap();
        assert!(!store.check_folder_id(fid).unwrap());
        assert!(store.check_folder_deleted(fid).unwrap());
    }

    #[test]
    fn move_rejects_cycle() {
        let (_tmp, _engine, store) = temp_store();
        let a = store
            .create_folder(private_fid::IPMSUBTREE, folder_type::GENERIC, "A", &PropList::new(), false)
            .unwrap()
            .folder_id;
        let b = store
            .create_folder(a, folder_type::GENERIC, "B", &PropList::new(), false)
            .unwrap()
            .folder_id;
        assert_eq!(
            store.movecopy_folder(a, b, None, false).unwrap_err(),
            EcError::RootFolder
        );
        assert!(store.check_folder_cycle(a, b).unwrap());
        assert!(!store.check_folder_cycle(b, a).unwrap());
    }

    #[test]
    fn receive_class_longest_prefix() {
        let (_tmp, _engine, store) = temp_store();
        let fid = store
            .create_folder(private_fid::IPMSUBTREE, folder_type::GENERIC, "Notes", &PropList::new(), false)
            .unwrap()
            .folder_id;
        store.set_folder_by_class(fid, "IPM.Note.Custom").unwrap();
        let (hit, class) = store.get_folder_by_class("ipm.note.custom.sub").unwrap();
        assert_eq!(hit, fid);
        assert_eq!(class, "ipm.note.custom");
        // falls back to the empty-class inbox route
        let (inbox, _) = store.get_folder_by_class("report.ipm").unwrap();
        assert_eq!(inbox, private_fid::INBOX);
    }
}
