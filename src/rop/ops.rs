//! The rop verb surface. A [`Session`] owns one handle tree and talks to
//! stores through the exmdb client; every handle-taking verb resolves the
//! handle, asserts the object type, and re-checks permissions for
//! non-owner logons before touching the store.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::exmdb::client::ExmdbClient;
use crate::exmdb::request::StoreRequest;
use crate::exmdb::response::Response;
use crate::store::folders::del_flags;
use crate::store::sync::ContentSyncFlags;
use crate::store::MessageContent;
use crate::types::propval::{folder_type, tags, PropList};
use crate::types::restriction::{Restriction, SortOrderSet};
use crate::types::{access, rights, EcError, EcResult};

use super::fxics::{FastDownCtx, FastUpCtx, IcsDownCtx, IcsUpCtx, SyncScope, TransferStatus};
use super::object_tree::{ObjectTree, RopObject, INVALID_HANDLE, ROOT_HANDLE};
use super::objects::{
    AttachmentObject, FolderObject, LogonObject, LogonMode, MessageObject, TableKind,
    TableObject,
};

pub struct Session {
    client: Arc<ExmdbClient>,
    tree: ObjectTree,
}

impl Session {
    pub fn new(client: Arc<ExmdbClient>) -> Self {
        Self { client, tree: ObjectTree::new() }
    }

    pub fn client(&self) -> &Arc<ExmdbClient> {
        &self.client
    }

    pub fn release(&mut self, handle: u32) {
        self.tree.release(handle);
    }

    /// Session teardown: every handle and backing object goes away.
    pub fn logoff(&mut self) {
        self.tree.clear();
    }

    fn call(&self, dir: &str, body: StoreRequest) -> EcResult<Response> {
        self.client.call(dir, body)
    }

    fn logon_info(&self, handle: u32) -> EcResult<(String, String, bool, Uuid)> {
        let logon = self.tree.logon_of(handle)?;
        Ok((
            logon.dir.clone(),
            logon.username.clone(),
            logon.is_owner(),
            logon.replica_guid,
        ))
    }

    fn check_folder_rights(
        &self,
        dir: &str,
        username: &str,
        owner: bool,
        folder_id: u64,
        needed: u32,
    ) -> EcResult<u32> {
        if owner {
            return Ok(rights::ALL);
        }
        let perm = match self.call(
            dir,
            StoreRequest::CheckFolderPermission {
                folder_id,
                username: username.to_owned(),
            },
        )? {
            Response::U32(perm) => perm,
            _ => return Err(EcError::RpcFormat),
        };
        if needed != 0 && perm & needed == 0 {
            return Err(EcError::AccessDenied);
        }
        Ok(perm)
    }

    // ---- logon ----

    /// Open a session on a store; the logon object becomes the tree root.
    pub fn rop_logon(
        &mut self,
        dir: &str,
        username: &str,
        account_id: u32,
    ) -> EcResult<u32> {
        let (_, private) = self.client.prefix_info(dir).ok_or(EcError::WrongServer)?;
        let replica_guid = match self.call(
            dir,
            StoreRequest::GetMappingGuid { replid: crate::types::REPLID_LOCAL },
        )? {
            Response::Guid(g) => g,
            _ => return Err(EcError::RpcFormat),
        };
        let perm = match self.call(
            dir,
            StoreRequest::GetMboxPerm { username: username.to_owned() },
        )? {
            Response::U32(perm) => perm,
            _ => return Err(EcError::RpcFormat),
        };
        let mode = if perm == rights::ALL {
            LogonMode::Owner
        } else if perm != 0 {
            LogonMode::Delegate
        } else {
            LogonMode::Guest
        };
        let logon = LogonObject {
            dir: dir.to_owned(),
            username: username.to_owned(),
            account_id,
            private,
            mode,
            replica_guid,
        };
        let handle = self.tree.add(ROOT_HANDLE, RopObject::Logon(logon));
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        debug!("logon to {dir} as {username} (mode {mode:?})");
        Ok(handle)
    }

    // ---- folders ----

    /// Open a folder; the returned object carries the access mask derived
    /// from the current permissions.
    pub fn rop_openfolder(&mut self, parent_handle: u32, folder_id: u64) -> EcResult<(u32, u32)> {
        let (dir, username, owner, _) = self.logon_info(parent_handle)?;
        match self.call(&dir, StoreRequest::CheckFolderId { folder_id })? {
            Response::Bool(true) => {}
            Response::Bool(false) => return Err(EcError::NotFound),
            _ => return Err(EcError::RpcFormat),
        }
        let perm = self.check_folder_rights(&dir, &username, owner, folder_id, 0)?;
        if !owner && perm & (rights::VISIBLE | rights::READ_ANY | rights::OWNER) == 0 {
            return Err(EcError::AccessDenied);
        }
        let mut mask = access::READ;
        if owner || perm & rights::OWNER != 0 {
            mask = access::ALL;
        } else {
            if perm & (rights::EDIT_ANY | rights::EDIT_OWNED) != 0 {
                mask |= access::MODIFY;
            }
            if perm & (rights::DELETE_ANY | rights::DELETE_OWNED) != 0 {
                mask |= access::DELETE;
            }
            if perm & rights::CREATE_SUBFOLDER != 0 {
                mask |= access::HIERARCHY;
            }
            if perm & rights::CREATE != 0 {
                mask |= access::CONTENTS | access::FAI_CONTENTS;
            }
        }
        let ftype = match self.call(
            &dir,
            StoreRequest::GetFolderProperties {
                folder_id,
                proptags: vec![tags::PR_FOLDER_TYPE],
            },
        )? {
            Response::Propvals(p) => p
                .get(tags::PR_FOLDER_TYPE)
                .and_then(|v| v.as_u32())
                .unwrap_or(folder_type::GENERIC),
            _ => return Err(EcError::RpcFormat),
        };
        let object = RopObject::Folder(FolderObject { folder_id, folder_type: ftype, access: mask });
        let handle = self.tree.add(parent_handle, object);
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok((handle, mask))
    }

    fn folder_of(&self, handle: u32) -> EcResult<&FolderObject> {
        match self.tree.get(handle)? {
            RopObject::Folder(f) => Ok(f),
            _ => Err(EcError::NotSupported),
        }
    }

    fn message_of(&self, handle: u32) -> EcResult<&MessageObject> {
        match self.tree.get(handle)? {
            RopObject::Message(m) => Ok(m),
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_createfolder(
        &mut self,
        parent_folder_handle: u32,
        ftype: u32,
        name: &str,
        open_existing: bool,
    ) -> EcResult<(u32, u64, bool)> {
        let (dir, username, owner, _) = self.logon_info(parent_folder_handle)?;
        let parent = self.folder_of(parent_folder_handle)?.folder_id;
        self.check_folder_rights(&dir, &username, owner, parent, rights::CREATE_SUBFOLDER)?;
        let resp = self.call(
            &dir,
            StoreRequest::CreateFolderByProperties {
                parent_id: parent,
                folder_type: ftype,
                str_name: name.to_owned(),
                propvals: PropList::new(),
                open_existing,
            },
        )?;
        let Response::CreatedFolder { folder_id, is_existing } = resp else {
            return Err(EcError::RpcFormat);
        };
        let object = RopObject::Folder(FolderObject {
            folder_id,
            folder_type: ftype,
            access: access::ALL,
        });
        let handle = self.tree.add(parent_folder_handle, object);
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok((handle, folder_id, is_existing))
    }

    /// Delete a child folder; `flags` are the `DEL_*` bits. Returns the
    /// partial-completion flag.
    pub fn rop_deletefolder(
        &mut self,
        parent_folder_handle: u32,
        folder_id: u64,
        flags: u32,
    ) -> EcResult<bool> {
        let (dir, username, owner, _) = self.logon_info(parent_folder_handle)?;
        self.check_folder_rights(&dir, &username, owner, folder_id, rights::OWNER)?;
        let hard = flags & del_flags::HARD_DELETE != 0;
        let mut partial = false;
        if flags & (del_flags::MESSAGES | del_flags::FOLDERS | del_flags::ASSOCIATED) != 0 {
            partial = match self.call(
                &dir,
                StoreRequest::EmptyFolder {
                    folder_id,
                    flags: flags | del_flags::MESSAGES | del_flags::ASSOCIATED,
                },
            )? {
                Response::Bool(partial) => partial,
                _ => return Err(EcError::RpcFormat),
            };
        }
        if !partial {
            match self.call(&dir, StoreRequest::DeleteFolder { folder_id, hard })? {
                Response::Unit => {}
                _ => return Err(EcError::RpcFormat),
            }
        }
        Ok(partial)
    }

    pub fn rop_movefolder(
        &mut self,
        src_handle: u32,
        dst_parent_handle: u32,
        folder_id: u64,
        new_name: Option<&str>,
    ) -> EcResult<u64> {
        self.movecopy_folder(src_handle, dst_parent_handle, folder_id, new_name, false)
    }

    pub fn rop_copyfolder(
        &mut self,
        src_handle: u32,
        dst_parent_handle: u32,
        folder_id: u64,
        new_name: Option<&str>,
    ) -> EcResult<u64> {
        self.movecopy_folder(src_handle, dst_parent_handle, folder_id, new_name, true)
    }

    fn movecopy_folder(
        &mut self,
        src_handle: u32,
        dst_parent_handle: u32,
        folder_id: u64,
        new_name: Option<&str>,
        copy: bool,
    ) -> EcResult<u64> {
        let (dir, username, owner, _) = self.logon_info(src_handle)?;
        let dst_parent = self.folder_of(dst_parent_handle)?.folder_id;
        self.check_folder_rights(&dir, &username, owner, dst_parent, rights::CREATE_SUBFOLDER)?;
        if !copy {
            self.check_folder_rights(&dir, &username, owner, folder_id, rights::OWNER)?;
        }
        match self.call(
            &dir,
            StoreRequest::MovecopyFolder {
                src_fid: folder_id,
                dst_fid: dst_parent,
                str_new: new_name.map(str::to_owned),
                b_copy: copy,
            },
        )? {
            Response::U64(fid) => Ok(fid),
            _ => Err(EcError::RpcFormat),
        }
    }

    pub fn rop_movecopymessages(
        &mut self,
        src_folder_handle: u32,
        dst_folder_handle: u32,
        mids: &[u64],
        b_move: bool,
    ) -> EcResult<bool> {
        let (dir, username, owner, _) = self.logon_info(src_folder_handle)?;
        let src = self.folder_of(src_folder_handle)?.folder_id;
        let dst = self.folder_of(dst_folder_handle)?.folder_id;
        self.check_folder_rights(&dir, &username, owner, dst, rights::CREATE)?;
        if b_move {
            self.check_folder_rights(&dir, &username, owner, src, rights::DELETE_ANY)?;
        }
        match self.call(
            &dir,
            StoreRequest::MovecopyMessages {
                src_fid: src,
                dst_fid: dst,
                message_ids: mids.to_vec(),
                b_move,
            },
        )? {
            Response::Bool(partial) => Ok(partial),
            _ => Err(EcError::RpcFormat),
        }
    }

    pub fn rop_emptyfolder(&mut self, folder_handle: u32, flags: u32) -> EcResult<bool> {
        let (dir, username, owner, _) = self.logon_info(folder_handle)?;
        let folder_id = self.folder_of(folder_handle)?.folder_id;
        self.check_folder_rights(&dir, &username, owner, folder_id, rights::DELETE_ANY)?;
        match self.call(&dir, StoreRequest::EmptyFolder { folder_id, flags })? {
            Response::Bool(partial) => Ok(partial),
            _ => Err(EcError::RpcFormat),
        }
    }

    pub fn rop_harddeletemessagesandsubfolders(&mut self, folder_handle: u32) -> EcResult<bool> {
        self.rop_emptyfolder(
            folder_handle,
            del_flags::MESSAGES | del_flags::ASSOCIATED | del_flags::FOLDERS
                | del_flags::HARD_DELETE,
        )
    }

    pub fn rop_deletemessages(
        &mut self,
        folder_handle: u32,
        mids: &[u64],
        hard: bool,
    ) -> EcResult<bool> {
        let (dir, username, owner, _) = self.logon_info(folder_handle)?;
        let folder_id = self.folder_of(folder_handle)?.folder_id;
        self.check_folder_rights(
            &dir,
            &username,
            owner,
            folder_id,
            rights::DELETE_ANY | rights::DELETE_OWNED,
        )?;
        match self.call(
            &dir,
            StoreRequest::DeleteMessages { folder_id, message_ids: mids.to_vec(), hard },
        )? {
            Response::Bool(partial) => Ok(partial),
            _ => Err(EcError::RpcFormat),
        }
    }

    pub fn rop_harddeletemessages(&mut self, folder_handle: u32, mids: &[u64]) -> EcResult<bool> {
        self.rop_deletemessages(folder_handle, mids, true)
    }

    // ---- tables ----

    pub fn rop_gethierarchytable(
        &mut self,
        folder_handle: u32,
        flags: u32,
    ) -> EcResult<(u32, u32)> {
        let (dir, username, owner, _) = self.logon_info(folder_handle)?;
        let folder_id = self.folder_of(folder_handle)?.folder_id;
        let resp = self.call(
            &dir,
            StoreRequest::LoadHierarchyTable {
                folder_id,
                username: (!owner).then(|| username.clone()),
                table_flags: flags,
                restriction: None,
            },
        )?;
        let Response::Table { table_id, row_count } = resp else {
            return Err(EcError::RpcFormat);
        };
        let object = RopObject::Table(TableObject::new(
            table_id,
            folder_id,
            TableKind::Hierarchy,
            row_count,
        ));
        let handle = self.tree.add(folder_handle, object);
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok((handle, row_count))
    }

    pub fn rop_getcontentstable(
        &mut self,
        folder_handle: u32,
        flags: u32,
        restriction: Option<Restriction>,
        sorts: Option<SortOrderSet>,
    ) -> EcResult<(u32, u32)> {
        let (dir, username, owner, _) = self.logon_info(folder_handle)?;
        let folder_id = self.folder_of(folder_handle)?.folder_id;
        self.check_folder_rights(&dir, &username, owner, folder_id, rights::READ_ANY)?;
        let resp = self.call(
            &dir,
            StoreRequest::LoadContentTable {
                folder_id,
                username: (!owner).then(|| username.clone()),
                table_flags: flags,
                restriction,
                sorts,
            },
        )?;
        let Response::Table { table_id, row_count } = resp else {
            return Err(EcError::RpcFormat);
        };
        let object = RopObject::Table(TableObject::new(
            table_id,
            folder_id,
            TableKind::Contents,
            row_count,
        ));
        let handle = self.tree.add(folder_handle, object);
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok((handle, row_count))
    }

    pub fn rop_queryrows(
        &mut self,
        table_handle: u32,
        proptags: &[u32],
        forward: bool,
        row_count: u16,
    ) -> EcResult<Vec<PropList>> {
        let (dir, _, _, _) = self.logon_info(table_handle)?;
        let (table_id, position, total) = match self.tree.get(table_handle)? {
            RopObject::Table(t) => (t.table_id, t.position, t.row_count),
            _ => return Err(EcError::NotSupported),
        };
        let want = u32::from(row_count);
        let (start, take) = if forward {
            (position, want.min(total.saturating_sub(position)))
        } else {
            let take = want.min(position);
            (position - take, take)
        };
        let rows = match self.call(
            &dir,
            StoreRequest::QueryTable {
                table_id,
                proptags: proptags.to_vec(),
                start_pos: start,
                row_needed: take as i32,
            },
        )? {
            Response::Rows(rows) => rows,
            _ => return Err(EcError::RpcFormat),
        };
        if let RopObject::Table(t) = self.tree.get_mut(table_handle)? {
            if forward {
                t.position = (start + rows.len() as u32).min(t.row_count);
            } else {
                t.position = start;
            }
        }
        Ok(rows)
    }

    pub fn rop_seekrow(
        &mut self,
        table_handle: u32,
        bookmark: u32,
        offset: i32,
    ) -> EcResult<u32> {
        const BOOKMARK_BEGINNING: u32 = 0;
        const BOOKMARK_CURRENT: u32 = 1;
        const BOOKMARK_END: u32 = 2;
        let (dir, _, _, _) = self.logon_info(table_handle)?;
        let (table_id, position, row_count, custom) = match self.tree.get(table_handle)? {
            RopObject::Table(t) => {
                (t.table_id, t.position, t.row_count, t.bookmark(bookmark))
            }
            _ => return Err(EcError::NotSupported),
        };
        let base = match bookmark {
            BOOKMARK_BEGINNING => 0,
            BOOKMARK_CURRENT => position,
            BOOKMARK_END => row_count,
            _ => {
                let (inst_id, inst_num, _) = custom.ok_or(EcError::InvalidBookmark)?;
                match self.call(
                    &dir,
                    StoreRequest::LocateTable { table_id, inst_id, inst_num },
                )? {
                    Response::Locate { position, .. } => position,
                    _ => return Err(EcError::RpcFormat),
                }
            }
        };
        let target = if offset >= 0 {
            (base + offset as u32).min(row_count)
        } else {
            base.saturating_sub(offset.unsigned_abs())
        };
        if let RopObject::Table(t) = self.tree.get_mut(table_handle)? {
            t.position = target;
        }
        Ok(target)
    }

    /// Remember the column set the client wants from this table.
    pub fn rop_setcolumns(&mut self, table_handle: u32, proptags: &[u32]) -> EcResult<()> {
        match self.tree.get_mut(table_handle)? {
            RopObject::Table(t) => {
                t.columns = proptags.to_vec();
                Ok(())
            }
            _ => Err(EcError::NotSupported),
        }
    }

    /// Current position and total of a table cursor.
    pub fn rop_queryposition(&mut self, table_handle: u32) -> EcResult<(u32, u32)> {
        match self.tree.get(table_handle)? {
            RopObject::Table(t) => Ok((t.position, t.row_count)),
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_freebookmark(&mut self, table_handle: u32, bookmark: u32) -> EcResult<()> {
        match self.tree.get_mut(table_handle)? {
            RopObject::Table(t) => {
                if t.free_bookmark(bookmark) {
                    Ok(())
                } else {
                    Err(EcError::InvalidBookmark)
                }
            }
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_createbookmark(&mut self, table_handle: u32) -> EcResult<u32> {
        let (dir, _, _, _) = self.logon_info(table_handle)?;
        let (table_id, position) = match self.tree.get(table_handle)? {
            RopObject::Table(t) => (t.table_id, t.position),
            _ => return Err(EcError::NotSupported),
        };
        let (inst_id, inst_num, row_type) =
            match self.call(&dir, StoreRequest::MarkTable { table_id, position })? {
                Response::Mark { inst_id, inst_num, row_type } => (inst_id, inst_num, row_type),
                _ => return Err(EcError::RpcFormat),
            };
        match self.tree.get_mut(table_handle)? {
            RopObject::Table(t) => Ok(t.create_bookmark(inst_id, inst_num, row_type)),
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_findrow(
        &mut self,
        table_handle: u32,
        restriction: &Restriction,
        forward: bool,
        proptags: &[u32],
    ) -> EcResult<Option<(u32, PropList)>> {
        let (dir, _, _, _) = self.logon_info(table_handle)?;
        let (table_id, position) = match self.tree.get(table_handle)? {
            RopObject::Table(t) => (t.table_id, t.position),
            _ => return Err(EcError::NotSupported),
        };
        let hit = match self.call(
            &dir,
            StoreRequest::MatchTable {
                table_id,
                forward,
                start_pos: position,
                restriction: restriction.clone(),
                proptags: proptags.to_vec(),
            },
        )? {
            Response::Match(hit) => hit,
            _ => return Err(EcError::RpcFormat),
        };
        if let Some((pos, _)) = &hit {
            if let RopObject::Table(t) = self.tree.get_mut(table_handle)? {
                t.position = *pos;
            }
        }
        Ok(hit)
    }

    pub fn rop_expandrow(&mut self, table_handle: u32, inst_id: u64) -> EcResult<u32> {
        let (dir, _, _, _) = self.logon_info(table_handle)?;
        let table_id = match self.tree.get(table_handle)? {
            RopObject::Table(t) => t.table_id,
            _ => return Err(EcError::NotSupported),
        };
        match self.call(&dir, StoreRequest::ExpandTable { table_id, inst_id })? {
            Response::ExpandCollapse { count, .. } => {
                self.refresh_table_count(table_handle, &dir, table_id)?;
                Ok(count)
            }
            _ => Err(EcError::RpcFormat),
        }
    }

    pub fn rop_collapserow(&mut self, table_handle: u32, inst_id: u64) -> EcResult<u32> {
        let (dir, _, _, _) = self.logon_info(table_handle)?;
        let table_id = match self.tree.get(table_handle)? {
            RopObject::Table(t) => t.table_id,
            _ => return Err(EcError::NotSupported),
        };
        match self.call(&dir, StoreRequest::CollapseTable { table_id, inst_id })? {
            Response::ExpandCollapse { count, .. } => {
                self.refresh_table_count(table_handle, &dir, table_id)?;
                Ok(count)
            }
            _ => Err(EcError::RpcFormat),
        }
    }

    fn refresh_table_count(&mut self, table_handle: u32, dir: &str, table_id: u32) -> EcResult<()> {
        let count = match self.call(dir, StoreRequest::SumTable { table_id })? {
            Response::U32(n) => n,
            _ => return Err(EcError::RpcFormat),
        };
        if let RopObject::Table(t) = self.tree.get_mut(table_handle)? {
            t.row_count = count;
            t.position = t.position.min(count);
        }
        Ok(())
    }

    // ---- search folders ----

    pub fn rop_setsearchcriteria(
        &mut self,
        folder_handle: u32,
        flags: u32,
        restriction: Option<Restriction>,
        scope: &[u64],
    ) -> EcResult<()> {
        let (dir, username, owner, _) = self.logon_info(folder_handle)?;
        let folder_id = self.folder_of(folder_handle)?.folder_id;
        self.check_folder_rights(&dir, &username, owner, folder_id, rights::OWNER)?;
        for &scoped in scope {
            self.check_folder_rights(&dir, &username, owner, scoped, rights::READ_ANY)?;
        }
        match self.call(
            &dir,
            StoreRequest::SetSearchCriteria {
                folder_id,
                search_flags: flags,
                restriction,
                folder_ids: scope.to_vec(),
            },
        )? {
            Response::Unit => Ok(()),
            _ => Err(EcError::RpcFormat),
        }
    }

    pub fn rop_getsearchcriteria(
        &mut self,
        folder_handle: u32,
    ) -> EcResult<(u32, Option<Restriction>, Vec<u64>)> {
        let (dir, _, _, _) = self.logon_info(folder_handle)?;
        let folder_id = self.folder_of(folder_handle)?.folder_id;
        match self.call(&dir, StoreRequest::GetSearchCriteria { folder_id })? {
            Response::SearchCriteria { status, restriction, scope } => {
                Ok((status, restriction, scope))
            }
            _ => Err(EcError::RpcFormat),
        }
    }

    // ---- FastTransfer ----

    fn store_dir_of(&self, handle: u32) -> EcResult<PathBuf> {
        let (dir, _, _, _) = self.logon_info(handle)?;
        Ok(PathBuf::from(dir))
    }

    pub fn rop_fasttransfersourcecopyto(
        &mut self,
        object_handle: u32,
        exclude_tags: &[u32],
    ) -> EcResult<u32> {
        let store_dir = self.store_dir_of(object_handle)?;
        let (dir, _, _, _) = self.logon_info(object_handle)?;
        let ctx = match self.tree.get(object_handle)? {
            RopObject::Message(m) => {
                let _ = exclude_tags; // exclusion is applied by the consumer
                FastDownCtx::for_message(&store_dir, &self.client, &dir, m.message_id, None)?
            }
            RopObject::Folder(f) => {
                FastDownCtx::for_folder(&store_dir, &self.client, &dir, f.folder_id, true)?
            }
            _ => return Err(EcError::NotSupported),
        };
        let handle = self.tree.add(object_handle, RopObject::FastDown(ctx));
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok(handle)
    }

    pub fn rop_fasttransfersourcecopyproperties(
        &mut self,
        object_handle: u32,
        proptags: &[u32],
    ) -> EcResult<u32> {
        let store_dir = self.store_dir_of(object_handle)?;
        let (dir, _, _, _) = self.logon_info(object_handle)?;
        let ctx = match self.tree.get(object_handle)? {
            RopObject::Message(m) => FastDownCtx::for_message(
                &store_dir,
                &self.client,
                &dir,
                m.message_id,
                Some(proptags),
            )?,
            _ => return Err(EcError::NotSupported),
        };
        let handle = self.tree.add(object_handle, RopObject::FastDown(ctx));
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok(handle)
    }

    pub fn rop_fasttransfersourcecopymessages(
        &mut self,
        folder_handle: u32,
        mids: &[u64],
    ) -> EcResult<u32> {
        let store_dir = self.store_dir_of(folder_handle)?;
        let (dir, username, owner, _) = self.logon_info(folder_handle)?;
        let folder_id = self.folder_of(folder_handle)?.folder_id;
        self.check_folder_rights(&dir, &username, owner, folder_id, rights::READ_ANY)?;
        let ctx = FastDownCtx::for_messages(&store_dir, &self.client, &dir, mids)?;
        let handle = self.tree.add(folder_handle, RopObject::FastDown(ctx));
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok(handle)
    }

    pub fn rop_fasttransfersourcecopyfolder(&mut self, folder_handle: u32) -> EcResult<u32> {
        let store_dir = self.store_dir_of(folder_handle)?;
        let (dir, username, owner, _) = self.logon_info(folder_handle)?;
        let folder_id = self.folder_of(folder_handle)?.folder_id;
        self.check_folder_rights(&dir, &username, owner, folder_id, rights::READ_ANY)?;
        let ctx = FastDownCtx::for_folder(&store_dir, &self.client, &dir, folder_id, true)?;
        let handle = self.tree.add(folder_handle, RopObject::FastDown(ctx));
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok(handle)
    }

    pub fn rop_fasttransfersourcegetbuffer(
        &mut self,
        ctx_handle: u32,
        max_len: u16,
    ) -> EcResult<(Vec<u8>, TransferStatus)> {
        let client = Arc::clone(&self.client);
        match self.tree.get_mut(ctx_handle)? {
            RopObject::FastDown(ctx) => ctx.get_buffer(u32::from(max_len)),
            RopObject::IcsDown(ctx) => ctx.get_buffer(&client, u32::from(max_len)),
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_tellversion(&mut self, ctx_handle: u32, _version: [u16; 3]) -> EcResult<()> {
        match self.tree.get(ctx_handle)? {
            RopObject::FastDown(_) | RopObject::FastUp(_) | RopObject::IcsDown(_) => Ok(()),
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_fasttransferdestconfigure(&mut self, folder_handle: u32) -> EcResult<u32> {
        let (dir, username, owner, _) = self.logon_info(folder_handle)?;
        let folder_id = self.folder_of(folder_handle)?.folder_id;
        self.check_folder_rights(&dir, &username, owner, folder_id, rights::CREATE)?;
        let ctx = FastUpCtx::new(&dir, folder_id);
        let handle = self.tree.add(folder_handle, RopObject::FastUp(ctx));
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok(handle)
    }

    pub fn rop_fasttransferdestputbuffer(
        &mut self,
        ctx_handle: u32,
        bytes: &[u8],
    ) -> EcResult<u16> {
        let client = Arc::clone(&self.client);
        match self.tree.get_mut(ctx_handle)? {
            RopObject::FastUp(ctx) => ctx.put_buffer(&client, bytes),
            _ => Err(EcError::NotSupported),
        }
    }

    // ---- ICS ----

    pub fn rop_syncconfigure(
        &mut self,
        folder_handle: u32,
        scope: SyncScope,
        flags: ContentSyncFlags,
    ) -> EcResult<u32> {
        let store_dir = self.store_dir_of(folder_handle)?;
        let (dir, username, owner, replica_guid) = self.logon_info(folder_handle)?;
        let folder_id = self.folder_of(folder_handle)?.folder_id;
        self.check_folder_rights(&dir, &username, owner, folder_id, rights::READ_ANY)?;
        let ctx = IcsDownCtx::new(
            &store_dir,
            &dir,
            folder_id,
            (!owner).then_some(username.as_str()),
            scope,
            flags,
            replica_guid,
        );
        let handle = self.tree.add(folder_handle, RopObject::IcsDown(ctx));
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok(handle)
    }

    pub fn rop_syncopencollector(
        &mut self,
        folder_handle: u32,
        contents: bool,
    ) -> EcResult<u32> {
        let (dir, username, owner, replica_guid) = self.logon_info(folder_handle)?;
        let folder_id = self.folder_of(folder_handle)?.folder_id;
        self.check_folder_rights(&dir, &username, owner, folder_id, rights::CREATE)?;
        let ctx = IcsUpCtx::new(&dir, folder_id, contents, replica_guid);
        let handle = self.tree.add(folder_handle, RopObject::IcsUp(ctx));
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok(handle)
    }

    pub fn rop_syncimportmessagechange(
        &mut self,
        collector_handle: u32,
        content: MessageContent,
        fail_on_conflict: bool,
    ) -> EcResult<u64> {
        let client = Arc::clone(&self.client);
        match self.tree.get_mut(collector_handle)? {
            RopObject::IcsUp(ctx) => ctx.import_message_change(&client, content, fail_on_conflict),
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_syncimportreadstatechanges(
        &mut self,
        collector_handle: u32,
        changes: &[(u64, bool)],
    ) -> EcResult<()> {
        let client = Arc::clone(&self.client);
        let (_, username, _, _) = self.logon_info(collector_handle)?;
        match self.tree.get_mut(collector_handle)? {
            RopObject::IcsUp(ctx) => ctx.import_read_state(&client, &username, changes),
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_syncimporthierarchychange(
        &mut self,
        collector_handle: u32,
        parent_id: u64,
        props: &PropList,
    ) -> EcResult<u64> {
        let client = Arc::clone(&self.client);
        match self.tree.get_mut(collector_handle)? {
            RopObject::IcsUp(ctx) => ctx.import_hierarchy_change(&client, parent_id, props),
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_syncimportdeletes(
        &mut self,
        collector_handle: u32,
        mids: &[u64],
        hard: bool,
    ) -> EcResult<bool> {
        let client = Arc::clone(&self.client);
        match self.tree.get_mut(collector_handle)? {
            RopObject::IcsUp(ctx) => ctx.import_deletes(&client, mids, hard),
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_syncimportmessagemove(
        &mut self,
        collector_handle: u32,
        src_mid: u64,
        dst_mid: u64,
    ) -> EcResult<()> {
        let client = Arc::clone(&self.client);
        match self.tree.get_mut(collector_handle)? {
            RopObject::IcsUp(ctx) => ctx.import_message_move(&client, src_mid, dst_mid),
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_syncgettransferstate(&mut self, ctx_handle: u32) -> EcResult<Vec<u8>> {
        match self.tree.get(ctx_handle)? {
            RopObject::IcsDown(ctx) => ctx.transfer_state(),
            RopObject::IcsUp(ctx) => ctx.transfer_state(),
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_syncuploadstatestreambegin(
        &mut self,
        ctx_handle: u32,
        proptag: u32,
    ) -> EcResult<()> {
        match self.tree.get_mut(ctx_handle)? {
            RopObject::IcsUp(ctx) => ctx.state_stream_begin(proptag),
            RopObject::IcsDown(_) => Ok(()), // download state arrives whole below
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_syncuploadstatestreamcontinue(
        &mut self,
        ctx_handle: u32,
        bytes: &[u8],
    ) -> EcResult<()> {
        match self.tree.get_mut(ctx_handle)? {
            RopObject::IcsUp(ctx) => ctx.state_stream_continue(bytes),
            RopObject::IcsDown(ctx) => ctx.restore_state(bytes),
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_syncuploadstatestreamend(&mut self, ctx_handle: u32) -> EcResult<()> {
        match self.tree.get_mut(ctx_handle)? {
            RopObject::IcsUp(ctx) => ctx.state_stream_end(),
            RopObject::IcsDown(_) => Ok(()),
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_setlocalreplicamidsetdeleted(
        &mut self,
        logon_handle: u32,
        mids: &[u64],
    ) -> EcResult<()> {
        let (dir, _, _, _) = self.logon_info(logon_handle)?;
        for &mid in mids {
            let _ = self.call(
                &dir,
                StoreRequest::CheckMessageDeleted { message_id: mid },
            )?;
        }
        Ok(())
    }

    pub fn rop_getlocalreplicaids(&mut self, logon_handle: u32, count: u32) -> EcResult<u64> {
        let (dir, _, _, _) = self.logon_info(logon_handle)?;
        match self.call(&dir, StoreRequest::AllocateIds { count })? {
            Response::U64(first) => Ok(first),
            _ => Err(EcError::RpcFormat),
        }
    }

    // ---- messages (the subset the layer exposes) ----

    pub fn rop_openmessage(
        &mut self,
        folder_handle: u32,
        message_id: u64,
        read_only: bool,
    ) -> EcResult<u32> {
        let (dir, username, owner, _) = self.logon_info(folder_handle)?;
        let folder_id = self.folder_of(folder_handle)?.folder_id;
        self.check_folder_rights(&dir, &username, owner, folder_id, rights::READ_ANY)?;
        let instance_id = match self.call(
            &dir,
            StoreRequest::LoadMessageInstance {
                folder_id,
                message_id,
                b_new: false,
                b_fai: false,
            },
        )? {
            Response::U32(id) => id,
            _ => return Err(EcError::RpcFormat),
        };
        let object = RopObject::Message(MessageObject {
            folder_id,
            message_id,
            instance_id,
            read_only,
        });
        let handle = self.tree.add(folder_handle, object);
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok(handle)
    }

    pub fn rop_createmessage(&mut self, folder_handle: u32, fai: bool) -> EcResult<u32> {
        let (dir, username, owner, _) = self.logon_info(folder_handle)?;
        let folder_id = self.folder_of(folder_handle)?.folder_id;
        self.check_folder_rights(&dir, &username, owner, folder_id, rights::CREATE)?;
        let instance_id = match self.call(
            &dir,
            StoreRequest::LoadMessageInstance {
                folder_id,
                message_id: 0,
                b_new: true,
                b_fai: fai,
            },
        )? {
            Response::U32(id) => id,
            _ => return Err(EcError::RpcFormat),
        };
        let object = RopObject::Message(MessageObject {
            folder_id,
            message_id: 0,
            instance_id,
            read_only: false,
        });
        let handle = self.tree.add(folder_handle, object);
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok(handle)
    }

    pub fn rop_savechangesmessage(&mut self, message_handle: u32) -> EcResult<u64> {
        let (dir, _, _, _) = self.logon_info(message_handle)?;
        let message = self.message_of(message_handle)?;
        if message.read_only {
            return Err(EcError::AccessDenied);
        }
        let instance_id = message.instance_id;
        let mid = match self.call(&dir, StoreRequest::FlushInstance { instance_id })? {
            Response::U64(mid) => mid,
            _ => return Err(EcError::RpcFormat),
        };
        if let RopObject::Message(m) = self.tree.get_mut(message_handle)? {
            m.message_id = mid;
        }
        Ok(mid)
    }

    pub fn rop_getpropertiesspecific(
        &mut self,
        handle: u32,
        proptags: &[u32],
    ) -> EcResult<PropList> {
        let (dir, _, _, _) = self.logon_info(handle)?;
        match self.tree.get(handle)? {
            RopObject::Folder(f) => {
                match self.call(
                    &dir,
                    StoreRequest::GetFolderProperties {
                        folder_id: f.folder_id,
                        proptags: proptags.to_vec(),
                    },
                )? {
                    Response::Propvals(p) => Ok(p),
                    _ => Err(EcError::RpcFormat),
                }
            }
            RopObject::Message(m) => {
                match self.call(
                    &dir,
                    StoreRequest::GetInstanceProperties {
                        instance_id: m.instance_id,
                        proptags: proptags.to_vec(),
                    },
                )? {
                    Response::Propvals(p) => Ok(p),
                    _ => Err(EcError::RpcFormat),
                }
            }
            RopObject::Attachment(a) => {
                match self.call(
                    &dir,
                    StoreRequest::GetInstanceProperties {
                        instance_id: a.instance_id,
                        proptags: proptags.to_vec(),
                    },
                )? {
                    Response::Propvals(p) => Ok(p),
                    _ => Err(EcError::RpcFormat),
                }
            }
            RopObject::Logon(logon) => {
                let dir = logon.dir.clone();
                match self.call(
                    &dir,
                    StoreRequest::GetStoreProperties { proptags: proptags.to_vec() },
                )? {
                    Response::Propvals(p) => Ok(p),
                    _ => Err(EcError::RpcFormat),
                }
            }
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_setproperties(&mut self, handle: u32, values: &PropList) -> EcResult<Vec<u32>> {
        let (dir, _, _, _) = self.logon_info(handle)?;
        match self.tree.get(handle)? {
            RopObject::Folder(f) => {
                match self.call(
                    &dir,
                    StoreRequest::SetFolderProperties {
                        folder_id: f.folder_id,
                        propvals: values.clone(),
                    },
                )? {
                    Response::Problems(p) => Ok(p),
                    _ => Err(EcError::RpcFormat),
                }
            }
            RopObject::Message(m) => {
                if m.read_only {
                    return Err(EcError::AccessDenied);
                }
                match self.call(
                    &dir,
                    StoreRequest::SetInstanceProperties {
                        instance_id: m.instance_id,
                        propvals: values.clone(),
                    },
                )? {
                    Response::Problems(p) => Ok(p),
                    _ => Err(EcError::RpcFormat),
                }
            }
            RopObject::Attachment(a) => {
                match self.call(
                    &dir,
                    StoreRequest::SetInstanceProperties {
                        instance_id: a.instance_id,
                        propvals: values.clone(),
                    },
                )? {
                    Response::Problems(p) => Ok(p),
                    _ => Err(EcError::RpcFormat),
                }
            }
            RopObject::Logon(_) => {
                match self.call(
                    &dir,
                    StoreRequest::SetStoreProperties { propvals: values.clone() },
                )? {
                    Response::Problems(p) => Ok(p),
                    _ => Err(EcError::RpcFormat),
                }
            }
            _ => Err(EcError::NotSupported),
        }
    }

    pub fn rop_openattachment(
        &mut self,
        message_handle: u32,
        attachment_num: u32,
    ) -> EcResult<u32> {
        let (dir, _, _, _) = self.logon_info(message_handle)?;
        let message_instance = self.message_of(message_handle)?.instance_id;
        let instance_id = match self.call(
            &dir,
            StoreRequest::LoadAttachmentInstance { message_instance, attachment_num },
        )? {
            Response::U32(id) => id,
            _ => return Err(EcError::RpcFormat),
        };
        let object = RopObject::Attachment(AttachmentObject {
            message_instance,
            instance_id,
            attachment_num,
        });
        let handle = self.tree.add(message_handle, object);
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok(handle)
    }

    /// Open the message embedded in an attachment as its own object.
    pub fn rop_openembeddedmessage(&mut self, attachment_handle: u32) -> EcResult<u32> {
        let (dir, _, _, _) = self.logon_info(attachment_handle)?;
        let attachment_instance = match self.tree.get(attachment_handle)? {
            RopObject::Attachment(a) => a.instance_id,
            _ => return Err(EcError::NotSupported),
        };
        let instance_id = match self.call(
            &dir,
            StoreRequest::LoadEmbeddedInstance { attachment_instance, b_new: false },
        )? {
            Response::U32(id) => id,
            _ => return Err(EcError::RpcFormat),
        };
        let object = RopObject::Message(MessageObject {
            folder_id: 0,
            message_id: 0,
            instance_id,
            read_only: false,
        });
        let handle = self.tree.add(attachment_handle, object);
        if handle == INVALID_HANDLE {
            return Err(EcError::RpcInvalidHandle);
        }
        Ok(handle)
    }

    /// Convenience: row count of a folder's contents without a table
    /// object (`sum_content`).
    pub fn sum_content(&self, logon_handle: u32, folder_id: u64, fai: bool) -> EcResult<u32> {
        let (dir, _, _, _) = self.logon_info(logon_handle)?;
        match self.call(&dir, StoreRequest::SumContent { folder_id, fai, deleted: false })? {
            Response::U32(n) => Ok(n),
            _ => Err(EcError::RpcFormat),
        }
    }
}
