//! ICS synchronization state: the four ID-sets a sync context carries.

use std::sync::Arc;

use crate::codec::{ExtPull, ExtPush};
use crate::types::propval::{tags, PropList, PropValue};
use crate::types::{EcError, EcResult};

use super::idset::{IdSet, ReplMapping, ReplType};

/// Which sets a state allocates depends on the direction and scope of the
/// sync context it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcsMode {
    ContentsDown,
    HierarchyDown,
    ContentsUp,
    HierarchyUp,
}

pub struct IcsState {
    pub mode: IcsMode,
    seen: IdSet,
    given: Option<IdSet>,
    seen_fai: Option<IdSet>,
    read: Option<IdSet>,
}

impl IcsState {
    pub fn new(mode: IcsMode, mapping: Arc<dyn ReplMapping>) -> Self {
        let make = || IdSet::with_mapping(mapping.clone());
        let (given, seen_fai, read) = match mode {
            IcsMode::ContentsDown | IcsMode::ContentsUp => {
                (Some(make()), Some(make()), Some(make()))
            }
            IcsMode::HierarchyDown => (Some(make()), None, None),
            IcsMode::HierarchyUp => (None, None, None),
        };
        Self { mode, seen: make(), given, seen_fai, read }
    }

    pub fn seen(&self) -> &IdSet {
        &self.seen
    }

    pub fn seen_mut(&mut self) -> &mut IdSet {
        &mut self.seen
    }

    pub fn given(&self) -> EcResult<&IdSet> {
        self.given.as_ref().ok_or(EcError::NotInitialized)
    }

    pub fn given_mut(&mut self) -> EcResult<&mut IdSet> {
        self.given.as_mut().ok_or(EcError::NotInitialized)
    }

    pub fn seen_fai(&self) -> EcResult<&IdSet> {
        self.seen_fai.as_ref().ok_or(EcError::NotInitialized)
    }

    pub fn seen_fai_mut(&mut self) -> EcResult<&mut IdSet> {
        self.seen_fai.as_mut().ok_or(EcError::NotInitialized)
    }

    pub fn read(&self) -> EcResult<&IdSet> {
        self.read.as_ref().ok_or(EcError::NotInitialized)
    }

    pub fn read_mut(&mut self) -> EcResult<&mut IdSet> {
        self.read.as_mut().ok_or(EcError::NotInitialized)
    }

    /// Snapshot the state as a meta-tag property list blob, the form the
    /// client ships home and uploads on the next sync.
    pub fn serialize(&self) -> EcResult<Vec<u8>> {
        let mut props = PropList::new();
        if let Some(given) = &self.given {
            props.set(
                tags::META_TAG_IDSET_GIVEN,
                PropValue::Binary(given.serialize(ReplType::Guid)?),
            );
        }
        props.set(
            tags::META_TAG_CNSET_SEEN,
            PropValue::Binary(self.seen.serialize(ReplType::Guid)?),
        );
        if let Some(fai) = &self.seen_fai {
            props.set(
                tags::META_TAG_CNSET_SEEN_FAI,
                PropValue::Binary(fai.serialize(ReplType::Guid)?),
            );
        }
        if let Some(read) = &self.read {
            props.set(
                tags::META_TAG_CNSET_READ,
                PropValue::Binary(read.serialize(ReplType::Guid)?),
            );
        }
        let mut push = ExtPush::new();
        push.proplist(&props);
        Ok(push.into_bytes())
    }

    /// Restore from a serialized snapshot. Sets absent from the blob stay
    /// empty; sets the mode does not allocate are ignored.
    pub fn deserialize(&mut self, bytes: &[u8], mapping: Arc<dyn ReplMapping>) -> EcResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let props = ExtPull::new(bytes).proplist()?;
        let read_set = |tag: u32| -> EcResult<Option<IdSet>> {
            match props.get(tag).and_then(|v| v.as_bytes()) {
                None => Ok(None),
                Some(blob) => {
                    let mut set = IdSet::deserialize(blob, ReplType::Guid)?;
                    set.register_mapping(mapping.clone());
                    set.resolve()?;
                    Ok(Some(set))
                }
            }
        };
        if let Some(set) = read_set(tags::META_TAG_CNSET_SEEN)? {
            self.seen = set;
        }
        if self.given.is_some() {
            if let Some(set) = read_set(tags::META_TAG_IDSET_GIVEN)? {
                self.given = Some(set);
            }
        }
        if self.seen_fai.is_some() {
            if let Some(set) = read_set(tags::META_TAG_CNSET_SEEN_FAI)? {
                self.seen_fai = Some(set);
            }
        }
        if self.read.is_some() {
            if let Some(set) = read_set(tags::META_TAG_CNSET_READ)? {
                self.read = Some(set);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::make_eid;
    use uuid::Uuid;

    struct OneReplica(Uuid);

    impl ReplMapping for OneReplica {
        fn replid_to_guid(&self, replid: u16) -> Option<Uuid> {
            (replid == 1).then_some(self.0)
        }
        fn guid_to_replid(&self, guid: Uuid) -> Option<u16> {
            (guid == self.0).then_some(1)
        }
    }

    #[test]
    fn mode_gates_sets() {
        let mapping = Arc::new(OneReplica(Uuid::new_v4()));
        let mut up = IcsState::new(IcsMode::HierarchyUp, mapping.clone());
        assert_eq!(up.given_mut().unwrap_err(), EcError::NotInitialized);
        assert_eq!(up.read_mut().unwrap_err(), EcError::NotInitialized);
        up.seen_mut().append(make_eid(1, 3));

        let mut down = IcsState::new(IcsMode::ContentsDown, mapping);
        down.given_mut().unwrap().append(make_eid(1, 3));
        down.seen_fai_mut().unwrap().append(make_eid(1, 4));
        down.read_mut().unwrap().append(make_eid(1, 5));
    }

    #[test]
    fn state_round_trip() {
        let mapping = Arc::new(OneReplica(Uuid::new_v4()));
        let mut state = IcsState::new(IcsMode::ContentsDown, mapping.clone());
        state.given_mut().unwrap().append_range(1, 1, 40);
        state.seen_mut().append_range(1, 1, 37);
        state.seen_fai_mut().unwrap().append(make_eid(1, 12));
        state.read_mut().unwrap().append_range(1, 1, 20);

        let blob = state.serialize().unwrap();
        let mut restored = IcsState::new(IcsMode::ContentsDown, mapping.clone());
        restored.deserialize(&blob, mapping).unwrap();
        assert!(restored.given().unwrap().contains(make_eid(1, 40)));
        assert!(restored.seen().contains(make_eid(1, 37)));
        assert!(!restored.seen().contains(make_eid(1, 38)));
        assert!(restored.seen_fai().unwrap().contains(make_eid(1, 12)));
        assert!(restored.read().unwrap().contains(make_eid(1, 20)));
    }

    #[test]
    fn empty_blob_is_accepted() {
        let mapping = Arc::new(OneReplica(Uuid::new_v4()));
        let mut state = IcsState::new(IcsMode::ContentsUp, mapping.clone());
        state.deserialize(&[], mapping).unwrap();
        assert!(state.seen().is_empty());
    }
}
