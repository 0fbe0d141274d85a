//! Wire form of notification datagrams carried on the listen channel.
//!
//! Frame: `[u32 length][payload]`; the reader answers with one status
//! byte. The payload addresses one or more subscription ids in a store
//! directory and carries the change description.

use crate::codec::{ExtPull, ExtPush};
use crate::store::notify::DbNotify;
use crate::types::{EcError, EcResult};

#[derive(Debug, Clone, PartialEq)]
pub struct NotifyDatagram {
    pub dir: String,
    pub sub_ids: Vec<u32>,
    pub notify: DbNotify,
}

mod kind {
    pub const NEW_MAIL: u8 = 0x01;
    pub const FOLDER_CREATED: u8 = 0x02;
    pub const MESSAGE_CREATED: u8 = 0x03;
    pub const FOLDER_DELETED: u8 = 0x04;
    pub const MESSAGE_DELETED: u8 = 0x05;
    pub const FOLDER_MODIFIED: u8 = 0x06;
    pub const MESSAGE_MODIFIED: u8 = 0x07;
    pub const FOLDER_MOVED: u8 = 0x08;
    pub const FOLDER_COPIED: u8 = 0x09;
    pub const MESSAGE_MOVED: u8 = 0x0A;
    pub const MESSAGE_COPIED: u8 = 0x0B;
    pub const SEARCH_COMPLETED: u8 = 0x0C;
}

pub fn encode_notify(push: &mut ExtPush, n: &DbNotify) {
    match n {
        DbNotify::NewMail { folder_id, message_id, message_flags, message_class } => {
            push.u8(kind::NEW_MAIL);
            push.u64(*folder_id);
            push.u64(*message_id);
            push.u32(*message_flags);
            push.str(message_class);
        }
        DbNotify::FolderCreated { folder_id, parent_id } => {
            push.u8(kind::FOLDER_CREATED);
            push.u64(*folder_id);
            push.u64(*parent_id);
        }
        DbNotify::MessageCreated { folder_id, message_id } => {
            push.u8(kind::MESSAGE_CREATED);
            push.u64(*folder_id);
            push.u64(*message_id);
        }
        DbNotify::FolderDeleted { folder_id, parent_id } => {
            push.u8(kind::FOLDER_DELETED);
            push.u64(*folder_id);
            push.u64(*parent_id);
        }
        DbNotify::MessageDeleted { folder_id, message_id } => {
            push.u8(kind::MESSAGE_DELETED);
            push.u64(*folder_id);
            push.u64(*message_id);
        }
        DbNotify::FolderModified { folder_id } => {
            push.u8(kind::FOLDER_MODIFIED);
            push.u64(*folder_id);
        }
        DbNotify::MessageModified { folder_id, message_id } => {
            push.u8(kind::MESSAGE_MODIFIED);
            push.u64(*folder_id);
            push.u64(*message_id);
        }
        DbNotify::FolderMoved { folder_id, parent_id, old_parent_id } => {
            push.u8(kind::FOLDER_MOVED);
            push.u64(*folder_id);
            push.u64(*parent_id);
            push.u64(*old_parent_id);
        }
        DbNotify::FolderCopied { folder_id, parent_id } => {
            push.u8(kind::FOLDER_COPIED);
            push.u64(*folder_id);
            push.u64(*parent_id);
        }
        DbNotify::MessageMoved { folder_id, message_id, old_folder_id, old_message_id } => {
            push.u8(kind::MESSAGE_MOVED);
            push.u64(*folder_id);
            push.u64(*message_id);
            push.u64(*old_folder_id);
            push.u64(*old_message_id);
        }
        DbNotify::MessageCopied { folder_id, message_id } => {
            push.u8(kind::MESSAGE_COPIED);
            push.u64(*folder_id);
            push.u64(*message_id);
        }
        DbNotify::SearchCompleted { folder_id } => {
            push.u8(kind::SEARCH_COMPLETED);
            push.u64(*folder_id);
        }
    }
}

pub fn decode_notify(pull: &mut ExtPull) -> EcResult<DbNotify> {
    Ok(match pull.u8()? {
        kind::NEW_MAIL => DbNotify::NewMail {
            folder_id: pull.u64()?,
            message_id: pull.u64()?,
            message_flags: pull.u32()?,
            message_class: pull.str()?,
        },
        kind::FOLDER_CREATED => DbNotify::FolderCreated {
            folder_id: pull.u64()?,
            parent_id: pull.u64()?,
        },
        kind::MESSAGE_CREATED => DbNotify::MessageCreated {
            folder_id: pull.u64()?,
            message_id: pull.u64()?,
        },
        kind::FOLDER_DELETED => DbNotify::FolderDeleted {
            folder_id: pull.u64()?,
            parent_id: pull.u64()?,
        },
        kind::MESSAGE_DELETED => DbNotify::MessageDeleted {
            folder_id: pull.u64()?,
            message_id: pull.u64()?,
        },
        kind::FOLDER_MODIFIED => DbNotify::FolderModified { folder_id: pull.u64()? },
        kind::MESSAGE_MODIFIED => DbNotify::MessageModified {
            folder_id: pull.u64()?,
            message_id: pull.u64()?,
        },
        kind::FOLDER_MOVED => DbNotify::FolderMoved {
            folder_id: pull.u64()?,
            parent_id: pull.u64()?,
            old_parent_id: pull.u64()?,
        },
        kind::FOLDER_COPIED => DbNotify::FolderCopied {
            folder_id: pull.u64()?,
            parent_id: pull.u64()?,
        },
        kind::MESSAGE_MOVED => DbNotify::MessageMoved {
            folder_id: pull.u64()?,
            message_id: pull.u64()?,
            old_folder_id: pull.u64()?,
            old_message_id: pull.u64()?,
        },
        kind::MESSAGE_COPIED => DbNotify::MessageCopied {
            folder_id: pull.u64()?,
            message_id: pull.u64()?,
        },
        kind::SEARCH_COMPLETED => DbNotify::SearchCompleted { folder_id: pull.u64()? },
        _ => return Err(EcError::RpcFormat),
    })
}

impl NotifyDatagram {
    pub fn encode(&self) -> Vec<u8> {
        let mut push = ExtPush::new();
        push.str(&self.dir);
        push.u32(self.sub_ids.len() as u32);
        for id in &self.sub_ids {
            push.u32(*id);
        }
        encode_notify(&mut push, &self.notify);
        push.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> EcResult<Self> {
        let mut pull = ExtPull::new(bytes);
        let dir = pull.str()?;
        let n = pull.u32()? as usize;
        let sub_ids = (0..n).map(|_| pull.u32()).collect::<EcResult<_>>()?;
        let notify = decode_notify(&mut pull)?;
        if pull.remaining() != 0 {
            return Err(EcError::RpcFormat);
        }
        Ok(Self { dir, sub_ids, notify })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_round_trip() {
        let dg = NotifyDatagram {
            dir: "/var/lib/oxmdb/u".into(),
            sub_ids: vec![3, 9],
            notify: DbNotify::NewMail {
                folder_id: 0x0d,
                message_id: 0x0001_0000_0000_1111,
                message_flags: 0,
                message_class: "IPM.Note".into(),
            },
        };
        assert_eq!(NotifyDatagram::decode(&dg.encode()).unwrap(), dg);
    }

    #[test]
    fn every_kind_round_trips() {
        let samples = [
            DbNotify::FolderCreated { folder_id: 1, parent_id: 2 },
            DbNotify::MessageDeleted { folder_id: 1, message_id: 5 },
            DbNotify::FolderMoved { folder_id: 1, parent_id: 2, old_parent_id: 3 },
            DbNotify::MessageMoved {
                folder_id: 1,
                message_id: 2,
                old_folder_id: 3,
                old_message_id: 4,
            },
            DbNotify::SearchCompleted { folder_id: 5 },
        ];
        for n in samples {
            let mut push = ExtPush::new();
            encode_notify(&mut push, &n);
            let bytes = push.into_bytes();
            assert_eq!(decode_notify(&mut ExtPull::new(&bytes)).unwrap(), n);
        }
    }
}
