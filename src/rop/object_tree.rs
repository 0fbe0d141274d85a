//! The per-session object tree: typed objects addressable by 32-bit
//! handles, arranged so that closing a handle closes its descendants.
//!
//! Objects live in one arena keyed by handle; parent/child links are
//! handles, never references, which keeps the tree cycle-free and makes
//! the LIFO descendant close trivial.

use std::collections::HashMap;

use crate::types::{EcError, EcResult};

use super::fxics::{FastDownCtx, FastUpCtx, IcsDownCtx, IcsUpCtx};
use super::objects::{AttachmentObject, FolderObject, LogonObject, MessageObject, TableObject};

pub const ROOT_HANDLE: u32 = 0;
pub const INVALID_HANDLE: u32 = 0xFFFF_FFFF;

/// Objects per session; beyond this `add` yields `INVALID_HANDLE`.
pub const MAX_HANDLE_NUM: usize = 500;

/// The typed object behind a handle. One flat enum; operations dispatch
/// with a `match` on the variant.
pub enum RopObject {
    Logon(LogonObject),
    Folder(FolderObject),
    Message(MessageObject),
    Attachment(AttachmentObject),
    Table(TableObject),
    FastDown(FastDownCtx),
    FastUp(FastUpCtx),
    IcsDown(IcsDownCtx),
    IcsUp(IcsUpCtx),
}

impl RopObject {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Logon(_) => "logon",
            Self::Folder(_) => "folder",
            Self::Message(_) => "message",
            Self::Attachment(_) => "attachment",
            Self::Table(_) => "table",
            Self::FastDown(_) => "fastdownctx",
            Self::FastUp(_) => "fastupctx",
            Self::IcsDown(_) => "icsdownctx",
            Self::IcsUp(_) => "icsupctx",
        }
    }
}

struct ObjectNode {
    parent: u32,
    object: RopObject,
}

/// Arena of one session's objects.
#[derive(Default)]
pub struct ObjectTree {
    nodes: HashMap<u32, ObjectNode>,
    next_handle: u32,
}

impl ObjectTree {
    pub fn new() -> Self {
        Self { nodes: HashMap::new(), next_handle: ROOT_HANDLE }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add an object under `parent`. The first object must be the store
    /// logon at the root. Returns `INVALID_HANDLE` when the session is at
    /// its object cap or the parent does not exist.
    pub fn add(&mut self, parent: u32, object: RopObject) -> u32 {
        if self.nodes.len() >= MAX_HANDLE_NUM {
            return INVALID_HANDLE;
        }
        if self.nodes.is_empty() {
            if !matches!(object, RopObject::Logon(_)) {
                return INVALID_HANDLE;
            }
            self.nodes.insert(ROOT_HANDLE, ObjectNode { parent: INVALID_HANDLE, object });
            self.next_handle = 1;
            return ROOT_HANDLE;
        }
        if !self.nodes.contains_key(&parent) {
            return INVALID_HANDLE;
        }
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1) & 0x7FFF_FFFF;
        if self.next_handle == ROOT_HANDLE {
            self.next_handle = 1;
        }
        self.nodes.insert(handle, ObjectNode { parent, object });
        handle
    }

    pub fn get(&self, handle: u32) -> EcResult<&RopObject> {
        self.nodes.get(&handle).map(|n| &n.object).ok_or(EcError::NullObject)
    }

    pub fn get_mut(&mut self, handle: u32) -> EcResult<&mut RopObject> {
        self.nodes.get_mut(&handle).map(|n| &mut n.object).ok_or(EcError::NullObject)
    }

    pub fn parent_of(&self, handle: u32) -> Option<u32> {
        self.nodes.get(&handle).map(|n| n.parent)
    }

    /// Walk up to the logon object this handle belongs to.
    pub fn logon_of(&self, handle: u32) -> EcResult<&LogonObject> {
        let mut cursor = handle;
        loop {
            let node = self.nodes.get(&cursor).ok_or(EcError::NullObject)?;
            if let RopObject::Logon(logon) = &node.object {
                return Ok(logon);
            }
            if node.parent == INVALID_HANDLE {
                return Err(EcError::NullObject);
            }
            cursor = node.parent;
        }
    }

    /// Release a handle and every descendant, children before parents.
    /// The root logon is exempt from release.
    pub fn release(&mut self, handle: u32) {
        if handle == ROOT_HANDLE || handle > 0x7FFF_FFFF {
            return;
        }
        let mut doomed = vec![handle];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let parent = doomed[cursor];
            let children: Vec<u32> = self
                .nodes
                .iter()
                .filter(|(_, n)| n.parent == parent)
                .map(|(&h, _)| h)
                .collect();
            doomed.extend(children);
            cursor += 1;
        }
        // LIFO: deepest first
        for h in doomed.into_iter().rev() {
            self.nodes.remove(&h);
        }
    }

    /// Tear the whole session down, root included.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.next_handle = ROOT_HANDLE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rop::objects::LogonObject;

    fn logon() -> RopObject {
        RopObject::Logon(LogonObject::for_test("/tmp/x"))
    }

    fn folder(fid: u64) -> RopObject {
        RopObject::Folder(FolderObject::for_test(fid))
    }

    #[test]
    fn root_must_be_logon() {
        let mut tree = ObjectTree::new();
        assert_eq!(tree.add(ROOT_HANDLE, folder(1)), INVALID_HANDLE);
        assert_eq!(tree.add(ROOT_HANDLE, logon()), ROOT_HANDLE);
        let h = tree.add(ROOT_HANDLE, folder(0x0d));
        assert_ne!(h, INVALID_HANDLE);
        assert!(matches!(tree.get(h).unwrap(), RopObject::Folder(_)));
    }

    #[test]
    fn release_closes_descendants_but_not_logon() {
        let mut tree = ObjectTree::new();
        tree.add(ROOT_HANDLE, logon());
        let f = tree.add(ROOT_HANDLE, folder(0x0d));
        let m = tree.add(f, folder(0x0e));
        let a = tree.add(m, folder(0x0f));
        tree.release(f);
        assert!(tree.get(f).is_err());
        assert!(tree.get(m).is_err());
        assert!(tree.get(a).is_err());
        assert!(tree.get(ROOT_HANDLE).is_ok());

        // releasing the root is a no-op
        tree.release(ROOT_HANDLE);
        assert!(tree.get(ROOT_HANDLE).is_ok());
    }

    #[test]
    fn handle_cap() {
        let mut tree = ObjectTree::new();
        tree.add(ROOT_HANDLE, logon());
        let mut last = ROOT_HANDLE;
        for i in 0..(MAX_HANDLE_NUM - 1) {
            last = tree.add(ROOT_HANDLE, folder(i as u64 + 0x100));
            assert_ne!(last, INVALID_HANDLE, "failed at {i}");
        }
        assert_eq!(tree.add(ROOT_HANDLE, folder(0xFFFF)), INVALID_HANDLE);
        tree.release(last);
        assert_ne!(tree.add(ROOT_HANDLE, folder(0xFFFF)), INVALID_HANDLE);
    }
}
