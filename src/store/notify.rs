//! Notification synthesis and fan-out.
//!
//! Mutations synthesize a [`DbNotify`] describing the change. After the
//! transaction commits, every subscription whose filter matches gets a
//! copy: local subscribers through the registered callback, remote ones
//! through their per-remote bounded queue. Delivery is best-effort; a
//! backed-up queue drops the datagram and flags the subscriber for reset.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use tracing::warn;

use super::Store;
use crate::types::{EcError, EcResult};

/// Event-mask bits (`fnev*`).
pub mod fnev {
    pub const CRITICAL_ERROR: u16 = 0x0001;
    pub const NEW_MAIL: u16 = 0x0002;
    pub const OBJECT_CREATED: u16 = 0x0004;
    pub const OBJECT_DELETED: u16 = 0x0008;
    pub const OBJECT_MODIFIED: u16 = 0x0010;
    pub const OBJECT_MOVED: u16 = 0x0020;
    pub const OBJECT_COPIED: u16 = 0x0040;
    pub const SEARCH_COMPLETE: u16 = 0x0080;
    pub const TABLE_MODIFIED: u16 = 0x0100;
}

/// A change notification as synthesized by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum DbNotify {
    NewMail { folder_id: u64, message_id: u64, message_flags: u32, message_class: String },
    FolderCreated { folder_id: u64, parent_id: u64 },
    MessageCreated { folder_id: u64, message_id: u64 },
    FolderDeleted { folder_id: u64, parent_id: u64 },
    MessageDeleted { folder_id: u64, message_id: u64 },
    FolderModified { folder_id: u64 },
    MessageModified { folder_id: u64, message_id: u64 },
    FolderMoved { folder_id: u64, parent_id: u64, old_parent_id: u64 },
    FolderCopied { folder_id: u64, parent_id: u64 },
    MessageMoved { folder_id: u64, message_id: u64, old_folder_id: u64, old_message_id: u64 },
    MessageCopied { folder_id: u64, message_id: u64 },
    SearchCompleted { folder_id: u64 },
}

impl DbNotify {
    pub fn event_bit(&self) -> u16 {
        match self {
            Self::NewMail { .. } => fnev::NEW_MAIL,
            Self::FolderCreated { .. } | Self::MessageCreated { .. } => fnev::OBJECT_CREATED,
            Self::FolderDeleted { .. } | Self::MessageDeleted { .. } => fnev::OBJECT_DELETED,
            Self::FolderModified { .. } | Self::MessageModified { .. } => fnev::OBJECT_MODIFIED,
            Self::FolderMoved { .. } | Self::MessageMoved { .. } => fnev::OBJECT_MOVED,
            Self::FolderCopied { .. } | Self::MessageCopied { .. } => fnev::OBJECT_COPIED,
            Self::SearchCompleted { .. } => fnev::SEARCH_COMPLETE,
        }
    }

    pub fn folder_id(&self) -> u64 {
        match self {
            Self::NewMail { folder_id, .. }
            | Self::FolderCreated { folder_id, .. }
            | Self::MessageCreated { folder_id, .. }
            | Self::FolderDeleted { folder_id, .. }
            | Self::MessageDeleted { folder_id, .. }
            | Self::FolderModified { folder_id }
            | Self::MessageModified { folder_id, .. }
            | Self::FolderMoved { folder_id, .. }
            | Self::FolderCopied { folder_id, .. }
            | Self::MessageMoved { folder_id, .. }
            | Self::MessageCopied { folder_id, .. }
            | Self::SearchCompleted { folder_id } => *folder_id,
        }
    }

    pub fn message_id(&self) -> Option<u64> {
        match self {
            Self::NewMail { message_id, .. }
            | Self::MessageCreated { message_id, .. }
            | Self::MessageDeleted { message_id, .. }
            | Self::MessageModified { message_id, .. }
            | Self::MessageMoved { message_id, .. }
            | Self::MessageCopied { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }
}

/// One registered subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub sub_id: u32,
    /// `None` for in-process subscribers; otherwise the remote id of the
    /// notification channel the datagram goes out on.
    pub remote_id: Option<String>,
    pub event_mask: u16,
    /// Whole-store subscriptions ignore the folder/message scope.
    pub whole_store: bool,
    pub folder_id: u64,
    pub message_id: u64,
}

impl Subscription {
    pub fn matches(&self, n: &DbNotify) -> bool {
        if self.event_mask & n.event_bit() == 0 {
            return false;
        }
        if self.whole_store {
            return true;
        }
        if self.folder_id != 0 && self.folder_id != n.folder_id() {
            return false;
        }
        match (self.message_id, n.message_id()) {
            (0, _) => true,
            (want, Some(have)) => want == have,
            (_, None) => false,
        }
    }
}

/// A notification addressed to one subscriber.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub dir: PathBuf,
    pub sub_id: u32,
    pub notify: DbNotify,
}

type LocalCallback = Box<dyn Fn(&Path, u32, &DbNotify) + Send + Sync>;

/// Depth of each remote subscriber queue; beyond it datagrams are dropped.
const CHANNEL_HIGH_WATER: usize = 1024;

/// Routes datagrams out of the engine: a process-local callback for
/// in-process frontends, and one bounded queue per connected remote.
#[derive(Default)]
pub struct NotifySink {
    local: RwLock<Option<LocalCallback>>,
    remotes: Mutex<HashMap<String, flume::Sender<Datagram>>>,
}

impl NotifySink {
    pub fn set_local(&self, cb: LocalCallback) {
        *self.local.write().unwrap_or_else(|e| e.into_inner()) = Some(cb);
    }

    /// Register a remote's notification channel; returns the receive side
    /// the listen-connection thread drains.
    pub fn register_remote(&self, remote_id: &str) -> flume::Receiver<Datagram> {
        let (tx, rx) = flume::bounded(CHANNEL_HIGH_WATER);
        self.remotes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(remote_id.to_owned(), tx);
        rx
    }

    pub fn unregister_remote(&self, remote_id: &str) {
        self.remotes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(remote_id);
    }

    pub fn dispatch(&self, dir: &Path, sub: &Subscription, n: &DbNotify) {
        match &sub.remote_id {
            None => {
                if let Some(cb) = &*self.local.read().unwrap_or_else(|e| e.into_inner()) {
                    cb(dir, sub.sub_id, n);
                }
            }
            Some(remote) => {
                let remotes = self.remotes.lock().unwrap_or_else(|e| e.into_inner());
                let Some(tx) = remotes.get(remote) else { return };
                let dg = Datagram { dir: dir.to_owned(), sub_id: sub.sub_id, notify: n.clone() };
                if tx.try_send(dg).is_err() {
                    // backed-up or disconnected reader: drop, client resyncs
                    warn!("notification queue for {remote} full or gone; dropping");
                }
            }
        }
    }
}

impl Store {
    /// Register a subscription. `remote_id` is `None` for in-process
    /// frontends.
    pub fn subscribe_notification(
        &self,
        remote_id: Option<&str>,
        event_mask: u16,
        whole_store: bool,
        folder_id: u64,
        message_id: u64,
    ) -> EcResult<u32> {
        let sub_id = self.next_sub_id();
        let sub = Subscription {
            sub_id,
            remote_id: remote_id.map(str::to_owned),
            event_mask,
            whole_store,
            folder_id,
            message_id,
        };
        super::lock(&self.subscriptions).insert(sub_id, sub);
        Ok(sub_id)
    }

    pub fn unsubscribe_notification(&self, sub_id: u32) -> EcResult<()> {
        match super::lock(&self.subscriptions).remove(&sub_id) {
            Some(_) => Ok(()),
            None => Err(EcError::NotFound),
        }
    }

    /// Emit a new-mail notification for an already-delivered message, on
    /// behalf of the transport layer.
    pub fn transport_new_mail(
        &self,
        folder_id: u64,
        message_id: u64,
        message_flags: u32,
        message_class: &str,
    ) -> EcResult<()> {
        self.emit_notifies(vec![DbNotify::NewMail {
            folder_id,
            message_id,
            message_flags,
            message_class: message_class.to_owned(),
        }]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_filtering() {
        let sub = Subscription {
            sub_id: 1,
            remote_id: None,
            event_mask: fnev::OBJECT_CREATED | fnev::NEW_MAIL,
            whole_store: false,
            folder_id: 0x0d,
            message_id: 0,
        };
        assert!(sub.matches(&DbNotify::MessageCreated { folder_id: 0x0d, message_id: 7 }));
        assert!(!sub.matches(&DbNotify::MessageCreated { folder_id: 0x0a, message_id: 7 }));
        assert!(!sub.matches(&DbNotify::MessageDeleted { folder_id: 0x0d, message_id: 7 }));

        let whole = Subscription { whole_store: true, ..sub.clone() };
        assert!(whole.matches(&DbNotify::MessageCreated { folder_id: 0x0a, message_id: 7 }));
    }

    #[test]
    fn sink_drops_when_full() {
        let sink = NotifySink::default();
        let rx = sink.register_remote("r1");
        let sub = Subscription {
            sub_id: 9,
            remote_id: Some("r1".into()),
            event_mask: fnev::OBJECT_MODIFIED,
            whole_store: true,
            folder_id: 0,
            message_id: 0,
        };
        for _ in 0..(super::CHANNEL_HIGH_WATER + 10) {
            sink.dispatch(Path::new("/x"), &sub, &DbNotify::FolderModified { folder_id: 1 });
        }
        // queue capped at the high-water mark, the rest were dropped
        assert_eq!(rx.len(), super::CHANNEL_HIGH_WATER);
    }
}
