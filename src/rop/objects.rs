//! The typed objects living in the handle tree. These are thin state
//! holders; behavior lives in the session's rop functions, which combine
//! them with exmdb calls.

use std::collections::HashMap;

use uuid::Uuid;

/// How the logon's effective user relates to the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogonMode {
    Owner,
    Delegate,
    Guest,
}

pub struct LogonObject {
    pub dir: String,
    pub username: String,
    pub account_id: u32,
    pub private: bool,
    pub mode: LogonMode,
    pub replica_guid: Uuid,
}

impl LogonObject {
    /// Owner logons skip per-folder permission checks; the store repeats
    /// its own checks regardless.
    pub fn is_owner(&self) -> bool {
        self.mode == LogonMode::Owner
    }

    #[cfg(test)]
    pub fn for_test(dir: &str) -> Self {
        Self {
            dir: dir.to_owned(),
            username: "test@example.com".into(),
            account_id: 1,
            private: true,
            mode: LogonMode::Owner,
            replica_guid: Uuid::nil(),
        }
    }
}

pub struct FolderObject {
    pub folder_id: u64,
    pub folder_type: u32,
    /// MAPI_ACCESS_* mask computed at open time.
    pub access: u32,
}

impl FolderObject {
    #[cfg(test)]
    pub fn for_test(folder_id: u64) -> Self {
        Self { folder_id, folder_type: 1, access: crate::types::access::ALL }
    }
}

pub struct MessageObject {
    pub folder_id: u64,
    pub message_id: u64,
    /// Editing instance backing this object.
    pub instance_id: u32,
    pub read_only: bool,
}

pub struct AttachmentObject {
    pub message_instance: u32,
    pub instance_id: u32,
    pub attachment_num: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Hierarchy,
    Contents,
    Permissions,
    Rules,
}

/// Client-side cursor over a server table: current position plus the
/// bookmark map (bookmark ids resolve to row identities via the store's
/// mark/locate pair).
pub struct TableObject {
    pub table_id: u32,
    pub folder_id: u64,
    pub kind: TableKind,
    pub position: u32,
    pub row_count: u32,
    /// Column set last given to SetColumns.
    pub columns: Vec<u32>,
    bookmarks: HashMap<u32, (u64, u32, u32)>,
    next_bookmark: u32,
}

impl TableObject {
    pub fn new(table_id: u32, folder_id: u64, kind: TableKind, row_count: u32) -> Self {
        Self {
            table_id,
            folder_id,
            kind,
            position: 0,
            row_count,
            columns: Vec::new(),
            bookmarks: HashMap::new(),
            next_bookmark: 4, // 0..3 are the well-known BOOKMARK_* values
        }
    }

    pub fn create_bookmark(&mut self, inst_id: u64, inst_num: u32, row_type: u32) -> u32 {
        let id = self.next_bookmark;
        self.next_bookmark += 1;
        self.bookmarks.insert(id, (inst_id, inst_num, row_type));
        id
    }

    pub fn bookmark(&self, id: u32) -> Option<(u64, u32, u32)> {
        self.bookmarks.get(&id).copied()
    }

    pub fn free_bookmark(&mut self, id: u32) -> bool {
        self.bookmarks.remove(&id).is_some()
    }
}
