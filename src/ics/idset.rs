//! Replica-scoped ID-sets.
//!
//! An [`IdSet`] maps each replica to a sorted, coalesced list of 48-bit GC
//! ranges. Two wire forms exist: GLOBSET (ranges keyed by 16-bit replid)
//! and GUID-GLOBSET (keyed by replica GUID). The GLOBCNT command stream
//! inside either form follows MS-OXCFXICS: push (0x01..0x06), bitmask
//! (0x42), range (0x52), pop (0x50), end (0x00), over 6-byte big-endian
//! counter values.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::codec::{ExtPull, ExtPush};
use crate::types::{eid_gc, eid_replid, EcError, EcResult, GC_MASK};

/// Replica keying of the serialized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplType {
    Id,
    Guid,
}

/// Resolves between 16-bit replids and replica GUIDs. Registered on sets
/// that are deserialized from a replid-keyed blob or serialized into a
/// GUID-keyed one.
pub trait ReplMapping: Send + Sync {
    fn replid_to_guid(&self, replid: u16) -> Option<Uuid>;
    fn guid_to_replid(&self, guid: Uuid) -> Option<u16>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GcRange {
    low: u64,
    high: u64,
}

#[derive(Clone, Default)]
pub struct IdSet {
    ranges: BTreeMap<u16, Vec<GcRange>>,
    /// Ranges read from a GUID-keyed blob whose replid is not yet known.
    foreign: BTreeMap<Uuid, Vec<GcRange>>,
    mapping: Option<Arc<dyn ReplMapping>>,
}

impl std::fmt::Debug for IdSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdSet")
            .field("ranges", &self.ranges)
            .field("foreign", &self.foreign)
            .finish()
    }
}

impl PartialEq for IdSet {
    fn eq(&self, other: &Self) -> bool {
        self.ranges == other.ranges && self.foreign == other.foreign
    }
}

fn insert_range(list: &mut Vec<GcRange>, mut low: u64, mut high: u64) {
    debug_assert!(low <= high);
    let mut out = Vec::with_capacity(list.len() + 1);
    let mut placed = false;
    for r in list.iter() {
        if placed || r.high.saturating_add(1) < low {
            out.push(*r);
        } else if high.saturating_add(1) < r.low {
            out.push(GcRange { low, high });
            out.push(*r);
            placed = true;
        } else {
            // overlapping or adjacent: merge and keep scanning
            low = low.min(r.low);
            high = high.max(r.high);
        }
    }
    if !placed {
        out.push(GcRange { low, high });
    }
    *list = out;
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mapping(mapping: Arc<dyn ReplMapping>) -> Self {
        Self { mapping: Some(mapping), ..Self::default() }
    }

    pub fn register_mapping(&mut self, mapping: Arc<dyn ReplMapping>) {
        self.mapping = Some(mapping);
    }

    /// Add one entry id (replid in the high 16 bits).
    pub fn append(&mut self, eid: u64) {
        let gc = eid_gc(eid);
        insert_range(self.ranges.entry(eid_replid(eid)).or_default(), gc, gc);
    }

    /// Add an inclusive GC range under one replid.
    pub fn append_range(&mut self, replid: u16, low: u64, high: u64) {
        if low > high {
            return;
        }
        insert_range(
            self.ranges.entry(replid).or_default(),
            low & GC_MASK,
            high & GC_MASK,
        );
    }

    pub fn remove(&mut self, eid: u64) {
        let gc = eid_gc(eid);
        let Some(list) = self.ranges.get_mut(&eid_replid(eid)) else { return };
        let mut out = Vec::with_capacity(list.len() + 1);
        for r in list.iter() {
            if gc < r.low || gc > r.high {
                out.push(*r);
                continue;
            }
            if r.low < gc {
                out.push(GcRange { low: r.low, high: gc - 1 });
            }
            if gc < r.high {
                out.push(GcRange { low: gc + 1, high: r.high });
            }
        }
        *list = out;
        if list.is_empty() {
            self.ranges.remove(&eid_replid(eid));
        }
    }

    /// True when the set holds this entry id.
    pub fn contains(&self, eid: u64) -> bool {
        let gc = eid_gc(eid);
        self.ranges
            .get(&eid_replid(eid))
            .is_some_and(|list| list.iter().any(|r| r.low <= gc && gc <= r.high))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.foreign.is_empty()
    }

    /// Union with another set of the same keying.
    pub fn concatenate(&mut self, other: &IdSet) {
        for (&replid, list) in &other.ranges {
            for r in list {
                insert_range(self.ranges.entry(replid).or_default(), r.low, r.high);
            }
        }
        for (&guid, list) in &other.foreign {
            for r in list {
                insert_range(self.foreign.entry(guid).or_default(), r.low, r.high);
            }
        }
    }

    /// Enumerate every id in the set. Ranges are inclusive; this is meant
    /// for deletion lists, which are small.
    pub fn iter_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|(&replid, list)| {
            list.iter().flat_map(move |r| {
                (r.low..=r.high).map(move |gc| crate::types::make_eid(replid, gc))
            })
        })
    }

    /// Resolve foreign (GUID-keyed) ranges into replid-keyed ones via the
    /// registered mapping. Required before [`contains`]/[`iter_ids`] see
    /// entries from a deserialized GUID-GLOBSET. GUIDs the mapping does
    /// not know stay foreign; they round-trip through serialize untouched.
    pub fn resolve(&mut self) -> EcResult<()> {
        if self.foreign.is_empty() {
            return Ok(());
        }
        let mapping = self.mapping.clone().ok_or(EcError::NotInitialized)?;
        let foreign = std::mem::take(&mut self.foreign);
        for (guid, list) in foreign {
            match mapping.guid_to_replid(guid) {
                Some(replid) => {
                    for r in list {
                        insert_range(self.ranges.entry(replid).or_default(), r.low, r.high);
                    }
                }
                None => {
                    self.foreign.insert(guid, list);
                }
            }
        }
        Ok(())
    }

    /// Serialize. `Guid` keying resolves replids through the mapping and
    /// fails with `ecNotInitialized` when none is registered.
    pub fn serialize(&self, repl_type: ReplType) -> EcResult<Vec<u8>> {
        let mut push = ExtPush::new();
        match repl_type {
            ReplType::Id => {
                for (&replid, list) in &self.ranges {
                    push.u16(replid);
                    encode_globset(&mut push, list);
                }
            }
            ReplType::Guid => {
                let mapping = self.mapping.clone().ok_or(EcError::NotInitialized)?;
                for (&replid, list) in &self.ranges {
                    let guid =
                        mapping.replid_to_guid(replid).ok_or(EcError::NotFound)?;
                    push.guid(guid);
                    encode_globset(&mut push, list);
                }
                for (&guid, list) in &self.foreign {
                    push.guid(guid);
                    encode_globset(&mut push, list);
                }
            }
        }
        Ok(push.into_bytes())
    }

    /// Inverse of [`serialize`]. GUID-keyed input lands in the foreign map
    /// until [`resolve`] is called (or stays there if the replica is not
    /// local).
    pub fn deserialize(bytes: &[u8], repl_type: ReplType) -> EcResult<Self> {
        let mut pull = ExtPull::new(bytes);
        let mut set = IdSet::new();
        while pull.remaining() > 0 {
            match repl_type {
                ReplType::Id => {
                    let replid = pull.u16()?;
                    let list = decode_globset(&mut pull)?;
                    for r in list {
                        insert_range(set.ranges.entry(replid).or_default(), r.low, r.high);
                    }
                }
                ReplType::Guid => {
                    let guid = pull.guid()?;
                    let list = decode_globset(&mut pull)?;
                    for r in list {
                        insert_range(set.foreign.entry(guid).or_default(), r.low, r.high);
                    }
                }
            }
        }
        Ok(set)
    }
}

fn gc_to_be6(gc: u64) -> [u8; 6] {
    let b = gc.to_be_bytes();
    [b[2], b[3], b[4], b[5], b[6], b[7]]
}

fn be6_to_gc(b: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    out[2..8].copy_from_slice(b);
    u64::from_be_bytes(out)
}

fn encode_globset(push: &mut ExtPush, list: &[GcRange]) {
    for r in list {
        let low = gc_to_be6(r.low);
        let high = gc_to_be6(r.high);
        if r.low == r.high {
            // full six-byte push: a singleton, no explicit pop needed
            push.u8(0x06);
            push.bytes(&low);
            continue;
        }
        let common = low.iter().zip(high.iter()).take_while(|(a, b)| a == b).count();
        if common > 0 {
            push.u8(common as u8);
            push.bytes(&low[..common]);
        }
        push.u8(0x52);
        push.bytes(&low[common..]);
        push.bytes(&high[common..]);
        if common > 0 {
            push.u8(0x50);
        }
    }
    push.u8(0x00);
}

fn decode_globset(pull: &mut ExtPull) -> EcResult<Vec<GcRange>> {
    let mut out = Vec::new();
    let mut stack: Vec<u8> = Vec::with_capacity(6);
    let mut depths: Vec<usize> = Vec::new();
    loop {
        let cmd = pull.u8()?;
        match cmd {
            0x00 => {
                if !depths.is_empty() {
                    return Err(EcError::CorruptData);
                }
                return Ok(out);
            }
            0x01..=0x06 => {
                let n = usize::from(cmd);
                if stack.len() + n > 6 {
                    return Err(EcError::CorruptData);
                }
                let bytes = pull.bytes(n)?;
                stack.extend_from_slice(&bytes);
                if stack.len() == 6 {
                    let gc = be6_to_gc(&stack);
                    out.push(GcRange { low: gc, high: gc });
                    stack.truncate(stack.len() - n);
                } else {
                    depths.push(n);
                }
            }
            0x50 => {
                let n = depths.pop().ok_or(EcError::CorruptData)?;
                stack.truncate(stack.len() - n);
            }
            0x42 => {
                if stack.len() != 5 {
                    return Err(EcError::CorruptData);
                }
                let start = pull.u8()?;
                let mask = pull.u8()?;
                let mut full = [0u8; 6];
                full[..5].copy_from_slice(&stack);
                full[5] = start;
                let base = be6_to_gc(&full);
                let mut low = base;
                let mut prev = base;
                for bit in 0..8u8 {
                    if mask & (1 << bit) == 0 {
                        continue;
                    }
                    let gc = base + u64::from(bit) + 1;
                    if gc == prev + 1 {
                        prev = gc;
                    } else {
                        out.push(GcRange { low, high: prev });
                        low = gc;
                        prev = gc;
                    }
                }
                out.push(GcRange { low, high: prev });
            }
            0x52 => {
                let n = 6 - stack.len();
                let mut low = [0u8; 6];
                let mut high = [0u8; 6];
                low[..stack.len()].copy_from_slice(&stack);
                high[..stack.len()].copy_from_slice(&stack);
                low[stack.len()..].copy_from_slice(&pull.bytes(n)?);
                high[stack.len()..].copy_from_slice(&pull.bytes(n)?);
                let (lo, hi) = (be6_to_gc(&low), be6_to_gc(&high));
                if lo > hi {
                    return Err(EcError::CorruptData);
                }
                out.push(GcRange { low: lo, high: hi });
            }
            _ => return Err(EcError::CorruptData),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::make_eid;

    struct FixedMapping {
        replid: u16,
        guid: Uuid,
    }

    impl ReplMapping for FixedMapping {
        fn replid_to_guid(&self, replid: u16) -> Option<Uuid> {
            (replid == self.replid).then_some(self.guid)
        }
        fn guid_to_replid(&self, guid: Uuid) -> Option<u16> {
            (guid == self.guid).then_some(self.replid)
        }
    }

    #[test]
    fn append_coalesces_adjacent() {
        let mut set = IdSet::new();
        set.append(make_eid(1, 10));
        set.append(make_eid(1, 12));
        set.append(make_eid(1, 11));
        assert_eq!(set.ranges[&1], vec![GcRange { low: 10, high: 12 }]);
        assert!(set.contains(make_eid(1, 11)));
        assert!(!set.contains(make_eid(1, 13)));
        assert!(!set.contains(make_eid(2, 11)));
    }

    #[test]
    fn remove_splits_range() {
        let mut set = IdSet::new();
        set.append_range(1, 5, 9);
        set.remove(make_eid(1, 7));
        assert_eq!(
            set.ranges[&1],
            vec![GcRange { low: 5, high: 6 }, GcRange { low: 8, high: 9 }]
        );
    }

    #[test]
    fn concatenate_unions() {
        let mut a = IdSet::new();
        a.append_range(1, 1, 3);
        let mut b = IdSet::new();
        b.append_range(1, 3, 6);
        b.append(make_eid(2, 9));
        a.concatenate(&b);
        assert_eq!(a.ranges[&1], vec![GcRange { low: 1, high: 6 }]);
        assert!(a.contains(make_eid(2, 9)));
    }

    #[test]
    fn globset_round_trip_replid() {
        let mut set = IdSet::new();
        set.append_range(1, 1, 0x10);
        set.append(make_eid(1, 0x123456));
        set.append_range(5, 0xFF_0000, 0xFF_00FF);
        let bytes = set.serialize(ReplType::Id).unwrap();
        let back = IdSet::deserialize(&bytes, ReplType::Id).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn globset_round_trip_guid() {
        let guid = Uuid::new_v4();
        let mapping = Arc::new(FixedMapping { replid: 1, guid });
        let mut set = IdSet::with_mapping(mapping.clone());
        set.append_range(1, 100, 200);
        set.append(make_eid(1, 0xABCDEF));
        let bytes = set.serialize(ReplType::Guid).unwrap();

        let mut back = IdSet::deserialize(&bytes, ReplType::Guid).unwrap();
        assert!(!back.is_empty());
        back.register_mapping(mapping);
        back.resolve().unwrap();
        assert!(back.contains(make_eid(1, 150)));
        assert!(back.contains(make_eid(1, 0xABCDEF)));
        assert!(!back.contains(make_eid(1, 201)));
    }

    #[test]
    fn serialize_guid_without_mapping_fails() {
        let mut set = IdSet::new();
        set.append(make_eid(1, 1));
        assert_eq!(
            set.serialize(ReplType::Guid).unwrap_err(),
            EcError::NotInitialized
        );
    }

    #[test]
    fn empty_set_serializes_empty() {
        let set = IdSet::new();
        assert!(set.serialize(ReplType::Id).unwrap().is_empty());
        assert!(IdSet::deserialize(&[], ReplType::Id).unwrap().is_empty());
    }
}
