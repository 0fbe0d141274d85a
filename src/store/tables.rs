//! Server-side tables: cursors over folder children, folder contents,
//! permissions and rules.
//!
//! A table fixes its row set at load time (`reload_content_table` refreshes
//! it). Content tables support multi-level categorization from the sort
//! order; positions always index the currently visible rows.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::propval::{tags, PropList, PropValue};
use crate::types::restriction::{Restriction, SortOrderSet};
use crate::types::{rights, EcError, EcResult};

use super::messages::{self, message_row, read_message_content};
use super::{folders, lock, props, Store};

/// Table flag bits shared by the load verbs.
pub mod table_flags {
    pub const ASSOCIATED: u32 = 0x02;
    /// Hierarchy tables: include the whole subtree, with PR_DEPTH.
    pub const DEPTH: u32 = 0x04;
    pub const SOFT_DELETES: u32 = 0x20;
    pub const NO_NOTIFICATIONS: u32 = 0x80;
}

pub const ROW_TYPE_LEAF: u32 = 1;
pub const ROW_TYPE_HEADER: u32 = 3;

/// PidTagRowType / PidTagInstID synthesized on table rows.
pub const PR_ROW_TYPE: u32 = 0x0FF5_0003;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    Hierarchy,
    Content,
    Permission,
    Rule,
}

#[derive(Debug, Clone)]
pub struct TableRow {
    pub inst_id: u64,
    pub inst_num: u32,
    pub row_type: u32,
    pub depth: u16,
    /// Leaf rows under a header, for header rows.
    pub count: u32,
    /// Category value, header rows only.
    pub cat_value: Option<PropValue>,
    pub expanded: bool,
    /// Index of the owning header row in `rows`, if any.
    pub parent_header: Option<usize>,
}

pub struct Table {
    pub table_id: u32,
    pub ty: TableType,
    pub folder_id: u64,
    pub flags: u32,
    pub username: Option<String>,
    pub restriction: Option<Restriction>,
    pub sorts: Option<SortOrderSet>,
    pub rows: Vec<TableRow>,
}

impl Table {
    fn visible(&self, idx: usize) -> bool {
        let mut cursor = self.rows[idx].parent_header;
        while let Some(h) = cursor {
            if !self.rows[h].expanded {
                return false;
            }
            cursor = self.rows[h].parent_header;
        }
        true
    }

    fn visible_indices(&self) -> Vec<usize> {
        (0..self.rows.len()).filter(|&i| self.visible(i)).collect()
    }
}

/// Persisted form of a table's expansion state.
#[derive(Serialize, Deserialize)]
struct SavedTableState {
    folder_id: u64,
    ty_content: bool,
    collapsed_headers: Vec<u64>,
    position_inst_id: u64,
    position_inst_num: u32,
}

const HEADER_ID_BASE: u64 = 0x8000_0000_0000_0000;

fn build_content_rows(
    store: &Store,
    conn: &rusqlite::Connection,
    folder_id: u64,
    flags: u32,
    restriction: Option<&Restriction>,
    sorts: Option<&SortOrderSet>,
) -> EcResult<Vec<TableRow>> {
    let fai = flags & table_flags::ASSOCIATED != 0;
    let include_deleted = flags & table_flags::SOFT_DELETES != 0;

    let is_search = matches!(folders::folder_row(conn, folder_id)?, Some((_, _, true)));
    let mids: Vec<u64> = if is_search {
        let mut stmt = conn.prepare(
            "SELECT message_id FROM search_result WHERE folder_id = ?1",
        )?;
        let rows = stmt.query_map([folder_id as i64], |r| r.get::<_, i64>(0).map(|v| v as u64))?
            .collect::<Result<_, _>>()?;
        rows
    } else {
        messages::message_ids_in(conn, folder_id, Some(fai), include_deleted)?
    };

    let mut loaded: Vec<(u64, PropList)> = Vec::with_capacity(mids.len());
    for mid in mids {
        if is_search {
            match message_row(conn, mid)? {
                Some(row) if !row.is_deleted || include_deleted => {}
                _ => continue,
            }
        }
        let mut plist = read_message_content(store, conn, mid)?.props;
        plist.set(tags::PR_MID, PropValue::I8(mid));
        if let Some(res) = restriction {
            if !res.eval(&plist) {
                continue;
            }
        }
        loaded.push((mid, plist));
    }

    if let Some(sorts) = sorts {
        loaded.sort_by(|a, b| sorts.compare(&a.1, &b.1));
    }

    let ncat = sorts.map_or(0, |s| usize::from(s.ccategories.min(s.keys.len() as u16)));
    if ncat == 0 {
        return Ok(loaded
            .into_iter()
            .map(|(mid, _)| TableRow {
                inst_id: mid,
                inst_num: 0,
                row_type: ROW_TYPE_LEAF,
                depth: 0,
                count: 0,
                cat_value: None,
                expanded: false,
                parent_header: None,
            })
            .collect());
    }

    // group into category headers, one level per leading sort key
    let Some(sorts) = sorts else {
        return Err(EcError::InvalidParam);
    };
    let cexpanded = usize::from(sorts.cexpanded);
    let mut rows: Vec<TableRow> = Vec::new();
    let mut header_seq = 0u64;
    let mut open_headers: Vec<(usize, Option<PropValue>)> = Vec::new(); // (row idx, value) per level

    for (mid, plist) in &loaded {
        let values: Vec<Option<PropValue>> = (0..ncat)
            .map(|lvl| plist.get(sorts.keys[lvl].proptag).cloned())
            .collect();
        // find first level whose value diverges from the open chain
        let mut keep = 0;
        while keep < open_headers.len() && open_headers[keep].1 == values[keep] {
            keep += 1;
        }
        open_headers.truncate(keep);
        for lvl in keep..ncat {
            header_seq += 1;
            let parent = open_headers.last().map(|(idx, _)| *idx);
            let idx = rows.len();
            rows.push(TableRow {
                inst_id: HEADER_ID_BASE | header_seq,
                inst_num: 0,
                row_type: ROW_TYPE_HEADER,
                depth: lvl as u16,
                count: 0,
                cat_value: values[lvl].clone(),
                expanded: lvl < cexpanded,
                parent_header: parent,
            });
            open_headers.push((idx, values[lvl].clone()));
        }
        let parent = open_headers.last().map(|(idx, _)| *idx);
        rows.push(TableRow {
            inst_id: *mid,
            inst_num: 0,
            row_type: ROW_TYPE_LEAF,
            depth: ncat as u16,
            count: 0,
            cat_value: None,
            expanded: false,
            parent_header: parent,
        });
        for (hidx, _) in &open_headers {
            rows[*hidx].count += 1;
        }
    }
    Ok(rows)
}

fn build_hierarchy_rows(
    store: &Store,
    conn: &rusqlite::Connection,
    folder_id: u64,
    flags: u32,
    username: Option<&str>,
    restriction: Option<&Restriction>,
    depth: u16,
    rows: &mut Vec<TableRow>,
) -> EcResult<()> {
    for child in folders::child_folder_ids(conn, folder_id)? {
        if let Some(user) = username {
            let perm = store.check_folder_permission(child, user)?;
            if perm & (rights::VISIBLE | rights::READ_ANY | rights::OWNER) == 0 {
                continue;
            }
        }
        if let Some(res) = restriction {
            let plist = props::read_all_props(
                conn,
                store.dir(),
                "folder_properties",
                Some(("folder_id", child as i64)),
            )?;
            if !res.eval(&plist) {
                continue;
            }
        }
        rows.push(TableRow {
            inst_id: child,
            inst_num: 0,
            row_type: ROW_TYPE_LEAF,
            depth,
            count: 0,
            cat_value: None,
            expanded: false,
            parent_header: None,
        });
        if flags & table_flags::DEPTH != 0 {
            build_hierarchy_rows(
                store,
                conn,
                child,
                flags,
                username,
                restriction,
                depth + 1,
                rows,
            )?;
        }
    }
    Ok(())
}

impl Store {
    fn insert_table(&self, table: Table) -> (u32, u32) {
        let visible = table.visible_indices().len() as u32;
        let id = table.table_id;
        lock(&self.tables).insert(id, table);
        (id, visible)
    }

    pub fn load_hierarchy_table(
        &self,
        folder_id: u64,
        username: Option<&str>,
        flags: u32,
        restriction: Option<Restriction>,
    ) -> EcResult<(u32, u32)> {
        let conn = self.reader()?;
        if folders::folder_row(&conn, folder_id)?.is_none() {
            return Err(EcError::NotFound);
        }
        let mut rows = Vec::new();
        build_hierarchy_rows(
            self,
            &conn,
            folder_id,
            flags,
            username,
            restriction.as_ref(),
            0,
            &mut rows,
        )?;
        let table = Table {
            table_id: self.next_table_id(),
            ty: TableType::Hierarchy,
            folder_id,
            flags,
            username: username.map(str::to_owned),
            restriction,
            sorts: None,
            rows,
        };
        Ok(self.insert_table(table))
    }

    pub fn load_content_table(
        &self,
        folder_id: u64,
        username: Option<&str>,
        flags: u32,
        restriction: Option<Restriction>,
        sorts: Option<SortOrderSet>,
    ) -> EcResult<(u32, u32)> {
        let conn = self.reader()?;
        if folders::folder_row(&conn, folder_id)?.is_none() {
            return Err(EcError::NotFound);
        }
        let rows =
            build_content_rows(self, &conn, folder_id, flags, restriction.as_ref(), sorts.as_ref())?;
        let table = Table {
            table_id: self.next_table_id(),
            ty: TableType::Content,
            folder_id,
            flags,
            username: username.map(str::to_owned),
            restriction,
            sorts,
            rows,
        };
        Ok(self.insert_table(table))
    }

    pub fn load_permission_table(&self, folder_id: u64, flags: u32) -> EcResult<(u32, u32)> {
        let rows = self
            .load_permission_rows(folder_id)?
            .into_iter()
            .map(|row| TableRow {
                inst_id: row.member_id,
                inst_num: 0,
                row_type: ROW_TYPE_LEAF,
                depth: 0,
                count: 0,
                cat_value: None,
                expanded: false,
                parent_header: None,
            })
            .collect();
        let table = Table {
            table_id: self.next_table_id(),
            ty: TableType::Permission,
            folder_id,
            flags,
            username: None,
            restriction: None,
            sorts: None,
            rows,
        };
        Ok(self.insert_table(table))
    }

    pub fn load_rule_table(
        &self,
        folder_id: u64,
        username: Option<&str>,
        _restriction: Option<Restriction>,
    ) -> EcResult<(u32, u32)> {
        let rule_ids = self.rule_ids(folder_id)?;
        let rows = rule_ids
            .into_iter()
            .map(|rid| TableRow {
                inst_id: rid,
                inst_num: 0,
                row_type: ROW_TYPE_LEAF,
                depth: 0,
                count: 0,
                cat_value: None,
                expanded: false,
                parent_header: None,
            })
            .collect();
        let table = Table {
            table_id: self.next_table_id(),
            ty: TableType::Rule,
            folder_id,
            flags: 0,
            username: username.map(str::to_owned),
            restriction: None,
            sorts: None,
            rows,
        };
        Ok(self.insert_table(table))
    }

    pub fn unload_table(&self, table_id: u32) -> EcResult<()> {
        match lock(&self.tables).remove(&table_id) {
            Some(_) => Ok(()),
            None => Err(EcError::NotFound),
        }
    }

    pub fn sum_table(&self, table_id: u32) -> EcResult<u32> {
        let tables = lock(&self.tables);
        let table = tables.get(&table_id).ok_or(EcError::NotFound)?;
        Ok(table.visible_indices().len() as u32)
    }

    /// Live message/folder count without loading a table.
    pub fn sum_content(&self, folder_id: u64, fai: bool, deleted: bool) -> EcResult<u32> {
        let conn = self.reader()?;
        if deleted {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE parent_fid = ?1 AND is_associated = ?2 AND is_deleted = 1",
                rusqlite::params![folder_id as i64, i64::from(fai)],
                |r| r.get(0),
            )?;
            return Ok(n as u32);
        }
        Ok(messages::count_messages(&conn, folder_id, fai)? as u32)
    }

    fn row_props(&self, table: &Table, idx: usize, want: &[u32]) -> EcResult<PropList> {
        let row = &table.rows[idx];
        let mut out = PropList::new();
        if row.row_type == ROW_TYPE_HEADER {
            for &tag in want {
                match tag {
                    PR_ROW_TYPE => out.set(tag, PropValue::Long(ROW_TYPE_HEADER)),
                    tags::PR_DEPTH => out.set(tag, PropValue::Long(u32::from(row.depth))),
                    tags::PR_CONTENT_COUNT => out.set(tag, PropValue::Long(row.count)),
                    tags::PR_INSTID => out.set(tag, PropValue::I8(row.inst_id)),
                    tags::PR_INSTANCE_NUM => out.set(tag, PropValue::Long(row.inst_num)),
                    _ => {
                        if let (Some(sorts), Some(v)) = (&table.sorts, &row.cat_value) {
                            if usize::from(row.depth) < sorts.keys.len()
                                && sorts.keys[usize::from(row.depth)].proptag == tag
                            {
                                out.set(tag, v.clone());
                            }
                        }
                    }
                }
            }
            return Ok(out);
        }
        match table.ty {
            TableType::Content => {
                let mut fetched = self.get_message_properties(row.inst_id, want)?;
                for &tag in want {
                    match tag {
                        PR_ROW_TYPE => fetched.set(tag, PropValue::Long(ROW_TYPE_LEAF)),
                        tags::PR_DEPTH => {
                            fetched.set(tag, PropValue::Long(u32::from(row.depth)))
                        }
                        tags::PR_INSTID => fetched.set(tag, PropValue::I8(row.inst_id)),
                        tags::PR_INSTANCE_NUM => {
                            fetched.set(tag, PropValue::Long(row.inst_num))
                        }
                        _ => {}
                    }
                }
                Ok(fetched)
            }
            TableType::Hierarchy => {
                let mut fetched = self.get_folder_properties(row.inst_id, want)?;
                for &tag in want {
                    if tag == tags::PR_DEPTH {
                        fetched.set(tag, PropValue::Long(u32::from(row.depth)));
                    }
                }
                Ok(fetched)
            }
            TableType::Permission => {
                let rows = self.load_permission_rows(table.folder_id)?;
                let Some(perm) = rows.iter().find(|p| p.member_id == row.inst_id) else {
                    return Err(EcError::NotFound);
                };
                let mut out = PropList::new();
                for &tag in want {
                    match tag {
                        super::rules::PR_MEMBER_ID => out.set(tag, PropValue::I8(perm.member_id)),
                        super::rules::PR_MEMBER_NAME => {
                            out.set(tag, PropValue::Unicode(perm.username.clone()))
                        }
                        super::rules::PR_MEMBER_RIGHTS => {
                            out.set(tag, PropValue::Long(perm.rights))
                        }
                        _ => {}
                    }
                }
                Ok(out)
            }
            TableType::Rule => self.rule_row_props(row.inst_id, want),
        }
    }

    pub fn query_table(
        &self,
        table_id: u32,
        want: &[u32],
        start_pos: u32,
        row_needed: i32,
    ) -> EcResult<Vec<PropList>> {
        let (indices, snapshot) = {
            let tables = lock(&self.tables);
            let table = tables.get(&table_id).ok_or(EcError::NotFound)?;
            (table.visible_indices(), clone_table_meta(table))
        };
        let take = if row_needed < 0 { indices.len() } else { row_needed as usize };
        let mut out = Vec::new();
        for &idx in indices.iter().skip(start_pos as usize).take(take) {
            out.push(self.row_props(&snapshot, idx, want)?);
        }
        Ok(out)
    }

    /// Find the first visible row at or after `start_pos` matching the
    /// restriction; returns its position and requested columns.
    pub fn match_table(
        &self,
        table_id: u32,
        forward: bool,
        start_pos: u32,
        res: &Restriction,
        want: &[u32],
    ) -> EcResult<Option<(u32, PropList)>> {
        let (indices, snapshot) = {
            let tables = lock(&self.tables);
            let table = tables.get(&table_id).ok_or(EcError::NotFound)?;
            (table.visible_indices(), clone_table_meta(table))
        };
        let positions: Vec<u32> = if forward {
            (start_pos..indices.len() as u32).collect()
        } else {
            (0..=start_pos.min(indices.len().saturating_sub(1) as u32)).rev().collect()
        };
        for pos in positions {
            let idx = indices[pos as usize];
            if snapshot.rows[idx].row_type != ROW_TYPE_LEAF {
                continue;
            }
            let all = match snapshot.ty {
                TableType::Content => {
                    let conn = self.reader()?;
                    read_message_content(self, &conn, snapshot.rows[idx].inst_id)?.props
                }
                TableType::Hierarchy => {
                    let conn = self.reader()?;
                    props::read_all_props(
                        &conn,
                        self.dir(),
                        "folder_properties",
                        Some(("folder_id", snapshot.rows[idx].inst_id as i64)),
                    )?
                }
                _ => return Err(EcError::NotSupported),
            };
            if res.eval(&all) {
                let row = self.row_props(&snapshot, idx, want)?;
                return Ok(Some((pos, row)));
            }
        }
        Ok(None)
    }

    /// Position of an instance in the visible row set.
    pub fn locate_table(&self, table_id: u32, inst_id: u64, inst_num: u32) -> EcResult<(u32, u32)> {
        let tables = lock(&self.tables);
        let table = tables.get(&table_id).ok_or(EcError::NotFound)?;
        for (pos, &idx) in table.visible_indices().iter().enumerate() {
            let row = &table.rows[idx];
            if row.inst_id == inst_id && row.inst_num == inst_num {
                return Ok((pos as u32, row.row_type));
            }
        }
        Err(EcError::NotFound)
    }

    pub fn read_table_row(
        &self,
        table_id: u32,
        want: &[u32],
        inst_id: u64,
        inst_num: u32,
    ) -> EcResult<PropList> {
        let (idx, snapshot) = {
            let tables = lock(&self.tables);
            let table = tables.get(&table_id).ok_or(EcError::NotFound)?;
            let idx = table
                .rows
                .iter()
                .position(|r| r.inst_id == inst_id && r.inst_num == inst_num)
                .ok_or(EcError::NotFound)?;
            (idx, clone_table_meta(table))
        };
        self.row_props(&snapshot, idx, want)
    }

    /// Snapshot the row identity at a position (the bookmark the client
    /// re-locates with later).
    pub fn mark_table(&self, table_id: u32, position: u32) -> EcResult<(u64, u32, u32)> {
        let tables = lock(&self.tables);
        let table = tables.get(&table_id).ok_or(EcError::NotFound)?;
        let indices = table.visible_indices();
        let idx = *indices.get(position as usize).ok_or(EcError::InvalidBookmark)?;
        let row = &table.rows[idx];
        Ok((row.inst_id, row.inst_num, row.row_type))
    }

    pub fn get_table_all_proptags(&self, table_id: u32) -> EcResult<Vec<u32>> {
        let snapshot = {
            let tables = lock(&self.tables);
            let table = tables.get(&table_id).ok_or(EcError::NotFound)?;
            clone_table_meta(table)
        };
        let mut out = Vec::new();
        match snapshot.ty {
            TableType::Content => {
                let conn = self.reader()?;
                for row in &snapshot.rows {
                    if row.row_type != ROW_TYPE_LEAF {
                        continue;
                    }
                    for tag in props::all_proptags(
                        &conn,
                        "message_properties",
                        Some(("message_id", row.inst_id as i64)),
                    )? {
                        if !out.contains(&tag) {
                            out.push(tag);
                        }
                    }
                }
                for tag in [tags::PR_MID, tags::PR_INSTID, tags::PR_DEPTH, PR_ROW_TYPE] {
                    if !out.contains(&tag) {
                        out.push(tag);
                    }
                }
            }
            TableType::Hierarchy => {
                let conn = self.reader()?;
                for row in &snapshot.rows {
                    for tag in props::all_proptags(
                        &conn,
                        "folder_properties",
                        Some(("folder_id", row.inst_id as i64)),
                    )? {
                        if !out.contains(&tag) {
                            out.push(tag);
                        }
                    }
                }
            }
            TableType::Permission => {
                out = vec![
                    super::rules::PR_MEMBER_ID,
                    super::rules::PR_MEMBER_NAME,
                    super::rules::PR_MEMBER_RIGHTS,
                ];
            }
            TableType::Rule => {
                out = super::rules::rule_table_proptags();
            }
        }
        Ok(out)
    }

    pub fn expand_table(&self, table_id: u32, inst_id: u64) -> EcResult<(u32, u32)> {
        let mut tables = lock(&self.tables);
        let table = tables.get_mut(&table_id).ok_or(EcError::NotFound)?;
        let idx = table
            .rows
            .iter()
            .position(|r| r.inst_id == inst_id && r.row_type == ROW_TYPE_HEADER)
            .ok_or(EcError::NotFound)?;
        if table.rows[idx].expanded {
            return Err(EcError::NotCollapsed);
        }
        table.rows[idx].expanded = true;
        let position = table
            .visible_indices()
            .iter()
            .position(|&i| i == idx)
            .map(|p| p as u32)
            .unwrap_or(0);
        // rows revealed directly under this header
        let revealed = table
            .visible_indices()
            .iter()
            .filter(|&&i| {
                let mut cursor = table.rows[i].parent_header;
                while let Some(h) = cursor {
                    if h == idx {
                        return true;
                    }
                    cursor = table.rows[h].parent_header;
                }
                false
            })
            .count() as u32;
        Ok((position, revealed))
    }

    pub fn collapse_table(&self, table_id: u32, inst_id: u64) -> EcResult<(u32, u32)> {
        let mut tables = lock(&self.tables);
        let table = tables.get_mut(&table_id).ok_or(EcError::NotFound)?;
        let idx = table
            .rows
            .iter()
            .position(|r| r.inst_id == inst_id && r.row_type == ROW_TYPE_HEADER)
            .ok_or(EcError::NotFound)?;
        if !table.rows[idx].expanded {
            return Err(EcError::NotExpanded);
        }
        // count what disappears before flipping the flag
        let hidden = table
            .visible_indices()
            .iter()
            .filter(|&&i| {
                let mut cursor = table.rows[i].parent_header;
                while let Some(h) = cursor {
                    if h == idx {
                        return true;
                    }
                    cursor = table.rows[h].parent_header;
                }
                false
            })
            .count() as u32;
        table.rows[idx].expanded = false;
        let position = table
            .visible_indices()
            .iter()
            .position(|&i| i == idx)
            .map(|p| p as u32)
            .unwrap_or(0);
        Ok((position, hidden))
    }

    /// Persist expansion state + a position marker; survives the table.
    pub fn store_table_state(&self, table_id: u32, inst_id: u64, inst_num: u32) -> EcResult<u32> {
        let state = {
            let tables = lock(&self.tables);
            let table = tables.get(&table_id).ok_or(EcError::NotFound)?;
            SavedTableState {
                folder_id: table.folder_id,
                ty_content: table.ty == TableType::Content,
                collapsed_headers: table
                    .rows
                    .iter()
                    .filter(|r| r.row_type == ROW_TYPE_HEADER && !r.expanded)
                    .map(|r| r.inst_id)
                    .collect(),
                position_inst_id: inst_id,
                position_inst_num: inst_num,
            }
        };
        let json = serde_json::to_string(&state).map_err(|_| EcError::Error)?;
        self.with_write(|txn, _| {
            txn.conn()
                .execute("INSERT INTO table_states (state) VALUES (?1)", [json.as_str()])?;
            Ok(txn.conn().last_insert_rowid() as u32)
        })
    }

    /// Re-apply a saved state to a freshly loaded table; returns the
    /// position of the saved marker row, if still present.
    pub fn restore_table_state(&self, table_id: u32, state_id: u32) -> EcResult<u32> {
        let json: String = {
            let conn = self.reader()?;
            conn.query_row(
                "SELECT state FROM table_states WHERE state_id = ?1",
                [i64::from(state_id)],
                |r| r.get(0),
            )
            .map_err(|_| EcError::NotFound)?
        };
        let state: SavedTableState =
            serde_json::from_str(&json).map_err(|_| EcError::CorruptData)?;
        let mut tables = lock(&self.tables);
        let table = tables.get_mut(&table_id).ok_or(EcError::NotFound)?;
        for row in &mut table.rows {
            if row.row_type == ROW_TYPE_HEADER {
                row.expanded = !state.collapsed_headers.contains(&row.inst_id);
            }
        }
        let position = table
            .visible_indices()
            .iter()
            .enumerate()
            .find(|(_, &i)| {
                table.rows[i].inst_id == state.position_inst_id
                    && table.rows[i].inst_num == state.position_inst_num
            })
            .map(|(pos, _)| pos as u32)
            .unwrap_or(0);
        Ok(position)
    }

    /// Rebuild a content table's row set in place.
    pub fn reload_content_table(&self, table_id: u32) -> EcResult<u32> {
        let (folder_id, flags, restriction, sorts) = {
            let tables = lock(&self.tables);
            let table = tables.get(&table_id).ok_or(EcError::NotFound)?;
            if table.ty != TableType::Content {
                return Err(EcError::NotSupported);
            }
            (table.folder_id, table.flags, table.restriction.clone(), table.sorts.clone())
        };
        let conn = self.reader()?;
        let rows =
            build_content_rows(self, &conn, folder_id, flags, restriction.as_ref(), sorts.as_ref())?;
        let mut tables = lock(&self.tables);
        let table = tables.get_mut(&table_id).ok_or(EcError::NotFound)?;
        table.rows = rows;
        Ok(table.visible_indices().len() as u32)
    }
}

/// Clone what row fetching needs so the table lock is not held across
/// database I/O.
fn clone_table_meta(table: &Table) -> Table {
    Table {
        table_id: table.table_id,
        ty: table.ty,
        folder_id: table.folder_id,
        flags: table.flags,
        username: table.username.clone(),
        restriction: None,
        sorts: table.sorts.clone(),
        rows: table.rows.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::store::MessageContent;
    use crate::types::private_fid;
    use crate::types::restriction::SortKey;

    fn seed(store: &crate::store::Store, subject: &str, size: u32) -> u64 {
        let mut content = MessageContent::default();
        content.props.set(tags::PR_SUBJECT, PropValue::Unicode(subject.into()));
        content.props.set(tags::PR_MESSAGE_SIZE, PropValue::Long(size));
        store.write_message(private_fid::INBOX, &content, false).unwrap()
    }

    #[test]
    fn content_table_load_query_unload() {
        let (_tmp, _engine, store) = temp_store();
        seed(&store, "b", 2);
        seed(&store, "a", 1);
        let sorts = SortOrderSet {
            ccategories: 0,
            cexpanded: 0,
            keys: vec![SortKey { proptag: tags::PR_SUBJECT, descending: false }],
        };
        let (tid, count) = store
            .load_content_table(private_fid::INBOX, None, 0, None, Some(sorts))
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.sum_table(tid).unwrap(), 2);

        let rows = store
            .query_table(tid, &[tags::PR_SUBJECT, tags::PR_MID], 0, -1)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get(tags::PR_SUBJECT).and_then(|v| v.as_str()), Some("a"));
        assert_eq!(rows[1].get(tags::PR_SUBJECT).and_then(|v| v.as_str()), Some("b"));

        store.unload_table(tid).unwrap();
        assert_eq!(store.sum_table(tid).unwrap_err(), EcError::NotFound);
    }

    #[test]
    fn row_count_fixed_at_load() {
        let (_tmp, _engine, store) = temp_store();
        seed(&store, "one", 1);
        let (tid, count) = store
            .load_content_table(private_fid::INBOX, None, 0, None, None)
            .unwrap();
        assert_eq!(count, 1);
        seed(&store, "two", 2);
        // the loaded table does not see the new row until reload
        assert_eq!(store.sum_table(tid).unwrap(), 1);
        assert_eq!(store.reload_content_table(tid).unwrap(), 2);
    }

    #[test]
    fn categorized_expand_collapse() {
        let (_tmp, _engine, store) = temp_store();
        seed(&store, "x", 1);
        seed(&store, "x", 2);
        seed(&store, "y", 3);
        let sorts = SortOrderSet {
            ccategories: 1,
            cexpanded: 1,
            keys: vec![
                SortKey { proptag: tags::PR_SUBJECT, descending: false },
                SortKey { proptag: tags::PR_MESSAGE_SIZE, descending: false },
            ],
        };
        let (tid, visible) = store
            .load_content_table(private_fid::INBOX, None, 0, None, Some(sorts))
            .unwrap();
        // 2 headers + 3 leaves, all expanded
        assert_eq!(visible, 5);

        let rows = store.query_table(tid, &[PR_ROW_TYPE, tags::PR_CONTENT_COUNT], 0, 1).unwrap();
        assert_eq!(rows[0].get(PR_ROW_TYPE).and_then(|v| v.as_u32()), Some(ROW_TYPE_HEADER));
        assert_eq!(rows[0].get(tags::PR_CONTENT_COUNT).and_then(|v| v.as_u32()), Some(2));

        let (hdr_inst, _, rtype) = store.mark_table(tid, 0).unwrap();
        assert_eq!(rtype, ROW_TYPE_HEADER);
        let (_pos, hidden) = store.collapse_table(tid, hdr_inst).unwrap();
        assert_eq!(hidden, 2);
        assert_eq!(store.sum_table(tid).unwrap(), 3);
        assert_eq!(
            store.collapse_table(tid, hdr_inst).unwrap_err(),
            EcError::NotExpanded
        );
        let (_pos, revealed) = store.expand_table(tid, hdr_inst).unwrap();
        assert_eq!(revealed, 2);
        assert_eq!(store.sum_table(tid).unwrap(), 5);
    }

    #[test]
    fn state_save_restore() {
        let (_tmp, _engine, store) = temp_store();
        seed(&store, "x", 1);
        seed(&store, "y", 2);
        let sorts = SortOrderSet {
            ccategories: 1,
            cexpanded: 1,
            keys: vec![SortKey { proptag: tags::PR_SUBJECT, descending: false }],
        };
        let (tid, _) = store
            .load_content_table(private_fid::INBOX, None, 0, None, Some(sorts.clone()))
            .unwrap();
        let (hdr, _, _) = store.mark_table(tid, 0).unwrap();
        store.collapse_table(tid, hdr).unwrap();
        let state_id = store.store_table_state(tid, hdr, 0).unwrap();

        let (tid2, _) = store
            .load_content_table(private_fid::INBOX, None, 0, None, Some(sorts))
            .unwrap();
        // header ids are assigned in load order, so the saved id matches
        let pos = store.restore_table_state(tid2, state_id).unwrap();
        assert_eq!(pos, 0);
        assert_eq!(store.sum_table(tid2).unwrap(), 3);
    }

    #[test]
    fn hierarchy_table_depth() {
        let (_tmp, _engine, store) = temp_store();
        use crate::types::propval::folder_type;
        let a = store
            .create_folder(private_fid::IPMSUBTREE, folder_type::GENERIC, "A", &PropList::new(), false)
            .unwrap()
            .folder_id;
        store
            .create_folder(a, folder_type::GENERIC, "B", &PropList::new(), false)
            .unwrap();
        let (_tid, flat) = store
            .load_hierarchy_table(private_fid::IPMSUBTREE, None, 0, None)
            .unwrap();
        let (_tid2, deep) = store
            .load_hierarchy_table(private_fid::IPMSUBTREE, None, table_flags::DEPTH, None)
            .unwrap();
        assert_eq!(deep, flat + 1);
    }
}
