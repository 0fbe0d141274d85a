//! Core identifier and property types shared by the store, the wire
//! protocol and the ROP layer.

mod error;
pub mod propval;
pub mod restriction;

pub use error::{EcError, EcResult};

use uuid::Uuid;

/// Replica id of the store-local replica. Entry ids minted by this store
/// always carry it in the high 16 bits.
pub const REPLID_LOCAL: u16 = 1;

/// First entry id available for regular allocation; everything below is
/// reserved for well-known folders.
pub const CUSTOM_EID_BEGIN: u64 = 0x100;

/// Entry ids are 64-bit: high 16 bits replica id, low 48 bits the GC value.
pub const GC_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

#[inline]
pub fn make_eid(replid: u16, gc: u64) -> u64 {
    debug_assert!(gc <= GC_MASK);
    (u64::from(replid) << 48) | (gc & GC_MASK)
}

#[inline]
pub fn eid_replid(eid: u64) -> u16 {
    (eid >> 48) as u16
}

#[inline]
pub fn eid_gc(eid: u64) -> u64 {
    eid & GC_MASK
}

/// Well-known folder ids of a private store.
pub mod private_fid {
    pub const ROOT: u64 = 0x01;
    pub const DEFERRED_ACTION: u64 = 0x02;
    pub const SPOOLER_QUEUE: u64 = 0x03;
    pub const SHORTCUTS: u64 = 0x04;
    pub const FINDER: u64 = 0x05;
    pub const VIEWS: u64 = 0x06;
    pub const COMMON_VIEWS: u64 = 0x07;
    pub const SCHEDULE: u64 = 0x08;
    pub const IPMSUBTREE: u64 = 0x09;
    pub const SENT_ITEMS: u64 = 0x0a;
    pub const DELETED_ITEMS: u64 = 0x0b;
    pub const OUTBOX: u64 = 0x0c;
    pub const INBOX: u64 = 0x0d;
    pub const DRAFT: u64 = 0x0e;
    pub const CALENDAR: u64 = 0x0f;
    pub const JOURNAL: u64 = 0x10;
    pub const NOTES: u64 = 0x11;
    pub const TASKS: u64 = 0x12;
    pub const CONTACTS: u64 = 0x13;
    pub const JUNK: u64 = 0x14;
    pub const CONFLICTS: u64 = 0x15;
    pub const SYNC_ISSUES: u64 = 0x16;
    pub const LOCAL_FAILURES: u64 = 0x17;
    pub const SERVER_FAILURES: u64 = 0x18;
}

/// Well-known folder ids of a public store.
pub mod public_fid {
    pub const ROOT: u64 = 0x01;
    pub const IPMSUBTREE: u64 = 0x02;
    pub const NONIPMSUBTREE: u64 = 0x03;
    pub const EFORMSREGISTRY: u64 = 0x04;
}

/// Folder permission rights (`frights*`).
pub mod rights {
    pub const READ_ANY: u32 = 0x0000_0001;
    pub const CREATE: u32 = 0x0000_0002;
    pub const SEND_AS: u32 = 0x0000_0004;
    pub const EDIT_OWNED: u32 = 0x0000_0008;
    pub const DELETE_OWNED: u32 = 0x0000_0010;
    pub const EDIT_ANY: u32 = 0x0000_0020;
    pub const DELETE_ANY: u32 = 0x0000_0040;
    pub const CREATE_SUBFOLDER: u32 = 0x0000_0080;
    pub const OWNER: u32 = 0x0000_0100;
    pub const CONTACT: u32 = 0x0000_0200;
    pub const VISIBLE: u32 = 0x0000_0400;
    pub const FREEBUSY_SIMPLE: u32 = 0x0000_0800;
    pub const FREEBUSY_DETAILED: u32 = 0x0000_1000;

    pub const ALL: u32 = READ_ANY | CREATE | EDIT_OWNED | DELETE_OWNED
        | EDIT_ANY | DELETE_ANY | CREATE_SUBFOLDER | OWNER | VISIBLE;
}

/// Object access mask computed at open time (`MAPI_ACCESS_*`).
pub mod access {
    pub const MODIFY: u32 = 0x01;
    pub const READ: u32 = 0x02;
    pub const DELETE: u32 = 0x04;
    pub const HIERARCHY: u32 = 0x08;
    pub const CONTENTS: u32 = 0x10;
    pub const FAI_CONTENTS: u32 = 0x20;

    pub const ALL: u32 = MODIFY | READ | DELETE | HIERARCHY | CONTENTS | FAI_CONTENTS;
}

/// A change key: (replica GUID, GC value). Serialized as 16 GUID bytes plus
/// a 1..=8 byte little-endian GC value; change numbers use 6 GC bytes for a
/// 22-byte binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Xid {
    pub guid: Uuid,
    pub gc: u64,
    /// Byte length of the serialized GC value.
    pub gc_len: u8,
}

impl Xid {
    /// XID for a change number minted by `replica_guid`.
    pub fn from_cn(guid: Uuid, cn: u64) -> Self {
        Self { guid, gc: cn & GC_MASK, gc_len: 6 }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + usize::from(self.gc_len));
        out.extend_from_slice(&guid_to_wire(self.guid));
        out.extend_from_slice(&self.gc.to_le_bytes()[..usize::from(self.gc_len)]);
        out
    }

    pub fn deserialize(bytes: &[u8]) -> EcResult<Self> {
        if bytes.len() < 17 || bytes.len() > 24 {
            return Err(EcError::InvalidParam);
        }
        let guid = guid_from_wire(&bytes[..16]).ok_or(EcError::InvalidParam)?;
        let mut gc_bytes = [0u8; 8];
        let gc_len = bytes.len() - 16;
        gc_bytes[..gc_len].copy_from_slice(&bytes[16..]);
        Ok(Self { guid, gc: u64::from_le_bytes(gc_bytes), gc_len: gc_len as u8 })
    }
}

/// GUIDs travel as the MAPI packet form: Data1/2/3 little-endian, Data4 raw.
pub fn guid_to_wire(g: Uuid) -> [u8; 16] {
    let (d1, d2, d3, d4) = g.as_fields();
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&d1.to_le_bytes());
    out[4..6].copy_from_slice(&d2.to_le_bytes());
    out[6..8].copy_from_slice(&d3.to_le_bytes());
    out[8..16].copy_from_slice(d4);
    out
}

pub fn guid_from_wire(bytes: &[u8]) -> Option<Uuid> {
    if bytes.len() != 16 {
        return None;
    }
    let d1 = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
    let d2 = u16::from_le_bytes(bytes[4..6].try_into().ok()?);
    let d3 = u16::from_le_bytes(bytes[6..8].try_into().ok()?);
    let d4: [u8; 8] = bytes[8..16].try_into().ok()?;
    Some(Uuid::from_fields(d1, d2, d3, &d4))
}

/// PR_PREDECESSOR_CHANGE_LIST: the vector-clock set of change keys a
/// persisted object descends from. At most one entry per replica GUID; an
/// entry covers every older GC value of that replica.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pcl {
    entries: std::collections::BTreeMap<Uuid, u64>,
}

/// Relationship between a candidate PCL and the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PclCompare {
    /// Candidate descends from stored: apply it.
    Newer,
    /// Stored already covers candidate: ignore it.
    OlderOrEqual,
    /// Divergent histories.
    Conflict,
}

impl Pcl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one XID, keeping the highest GC per replica.
    pub fn append(&mut self, xid: Xid) {
        let slot = self.entries.entry(xid.guid).or_insert(0);
        if xid.gc > *slot {
            *slot = xid.gc;
        }
    }

    pub fn merge(&mut self, other: &Pcl) {
        for (&guid, &gc) in &other.entries {
            self.append(Xid { guid, gc, gc_len: 6 });
        }
    }

    /// True when every entry of `other` is covered by this list.
    pub fn includes(&self, other: &Pcl) -> bool {
        other
            .entries
            .iter()
            .all(|(guid, gc)| self.entries.get(guid).is_some_and(|have| have >= gc))
    }

    pub fn compare(candidate: &Pcl, stored: &Pcl) -> PclCompare {
        if stored.includes(candidate) {
            PclCompare::OlderOrEqual
        } else if candidate.includes(stored) {
            PclCompare::Newer
        } else {
            PclCompare::Conflict
        }
    }

    pub fn contains(&self, xid: &Xid) -> bool {
        self.entries.get(&xid.guid).is_some_and(|have| *have >= xid.gc)
    }

    pub fn iter(&self) -> impl Iterator<Item = Xid> + '_ {
        self.entries
            .iter()
            .map(|(&guid, &gc)| Xid { guid, gc, gc_len: 6 })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire form: a sequence of `[u8 length][xid bytes]` records.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for xid in self.iter() {
            let bytes = xid.serialize();
            out.push(bytes.len() as u8);
            out.extend_from_slice(&bytes);
        }
        out
    }

    pub fn deserialize(mut bytes: &[u8]) -> EcResult<Self> {
        let mut pcl = Pcl::new();
        while !bytes.is_empty() {
            let len = usize::from(bytes[0]);
            bytes = &bytes[1..];
            if bytes.len() < len {
                return Err(EcError::CorruptData);
            }
            pcl.append(Xid::deserialize(&bytes[..len])?);
            bytes = &bytes[len..];
        }
        Ok(pcl)
    }
}

/// Convert a Unix timestamp (seconds) to a FILETIME (100 ns since 1601).
pub fn unix_to_filetime(secs: i64) -> u64 {
    const EPOCH_DIFF: i64 = 11_644_473_600;
    ((secs + EPOCH_DIFF) as u64).saturating_mul(10_000_000)
}

/// Inverse of [`unix_to_filetime`].
pub fn filetime_to_unix(ft: u64) -> i64 {
    const EPOCH_DIFF: i64 = 11_644_473_600;
    (ft / 10_000_000) as i64 - EPOCH_DIFF
}

/// Current wall clock as FILETIME.
pub fn filetime_now() -> u64 {
    unix_to_filetime(chrono::Utc::now().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eid_fields() {
        let eid = make_eid(REPLID_LOCAL, 0x1234);
        assert_eq!(eid_replid(eid), 1);
        assert_eq!(eid_gc(eid), 0x1234);
    }

    #[test]
    fn xid_round_trip() {
        let x = Xid::from_cn(Uuid::new_v4(), 0xABCDEF);
        let bytes = x.serialize();
        assert_eq!(bytes.len(), 22);
        assert_eq!(Xid::deserialize(&bytes).unwrap(), x);
    }

    #[test]
    fn pcl_ordering() {
        let g1 = Uuid::new_v4();
        let g2 = Uuid::new_v4();
        let mut old = Pcl::new();
        old.append(Xid::from_cn(g1, 5));

        let mut newer = old.clone();
        newer.append(Xid::from_cn(g1, 9));
        assert_eq!(Pcl::compare(&newer, &old), PclCompare::Newer);
        assert_eq!(Pcl::compare(&old, &newer), PclCompare::OlderOrEqual);

        let mut diverged = old.clone();
        diverged.append(Xid::from_cn(g2, 1));
        let mut other = old.clone();
        other.append(Xid::from_cn(g1, 7));
        // g2 entry vs higher g1 entry: neither covers the other
        let mut other2 = Pcl::new();
        other2.append(Xid::from_cn(g2, 3));
        assert_eq!(Pcl::compare(&diverged, &other2), PclCompare::Conflict);
        let _ = other;
    }

    #[test]
    fn pcl_serialize_round_trip() {
        let mut pcl = Pcl::new();
        pcl.append(Xid::from_cn(Uuid::new_v4(), 100));
        pcl.append(Xid::from_cn(Uuid::new_v4(), 7));
        let bytes = pcl.serialize();
        assert_eq!(Pcl::deserialize(&bytes).unwrap(), pcl);
    }

    #[test]
    fn filetime_round_trip() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(filetime_to_unix(unix_to_filetime(now)), now);
    }
}
