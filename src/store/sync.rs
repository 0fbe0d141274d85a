//! ICS delta derivation: compare a client state against the store and
//! produce the change/deletion/read lists a download context streams out.

use crate::ics::IdSet;
use crate::types::{make_eid, rights, EcError, EcResult, REPLID_LOCAL};

use super::folders;
use super::messages::{self, message_row};
use super::Store;

/// Which message classes a content sync covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentSyncFlags {
    pub normal: bool,
    pub fai: bool,
    pub read_state: bool,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ContentSyncResult {
    /// Changed FAI messages, change-number order.
    pub fai_mids: Vec<u64>,
    pub fai_total: u64,
    /// Changed normal messages, change-number order.
    pub normal_mids: Vec<u64>,
    pub normal_total: u64,
    /// Subset of the changed ids the client already held.
    pub updated_mids: Vec<u64>,
    /// Ids the client holds that are gone from the folder.
    pub deleted_mids: Vec<u64>,
    /// Ids the client holds that it may no longer see (permission).
    pub nolonger_mids: Vec<u64>,
    pub read_mids: Vec<u64>,
    pub unread_mids: Vec<u64>,
    /// Highest change number covered by this delta.
    pub last_cn: u64,
    /// Highest read-state change number covered.
    pub last_readcn: u64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct HierarchySyncResult {
    /// Changed folders, parents before children.
    pub changed_fids: Vec<u64>,
    pub deleted_fids: Vec<u64>,
    pub last_cn: u64,
}

impl Store {
    /// Derive the content delta for one folder against a client state.
    pub fn get_content_sync(
        &self,
        folder_id: u64,
        username: Option<&str>,
        given: &IdSet,
        seen: &IdSet,
        seen_fai: &IdSet,
        read: &IdSet,
        flags: ContentSyncFlags,
    ) -> EcResult<ContentSyncResult> {
        let conn = self.reader()?;
        if folders::folder_row(&conn, folder_id)?.is_none() {
            return Err(EcError::NotFound);
        }
        if let Some(user) = username {
            let perm = self.check_folder_permission(folder_id, user)?;
            if perm & (rights::READ_ANY | rights::OWNER) == 0 {
                return Err(EcError::AccessDenied);
            }
        }

        let mut out = ContentSyncResult::default();
        let mut changed: Vec<(u64, u64, bool)> = Vec::new(); // (cn, mid, fai)
        let mut present: Vec<u64> = Vec::new();

        for mid in messages::message_ids_in(&conn, folder_id, None, false)? {
            let row = message_row(&conn, mid)?.ok_or(EcError::CorruptData)?;
            if row.is_associated && !flags.fai {
                continue;
            }
            if !row.is_associated && !flags.normal {
                continue;
            }
            present.push(mid);
            if row.is_associated {
                out.fai_total += 1;
            } else {
                out.normal_total += 1;
            }
            let cn_eid = make_eid(REPLID_LOCAL, row.change_number);
            let seen_set = if row.is_associated { seen_fai } else { seen };
            let unchanged = given.contains(mid) && seen_set.contains(cn_eid);
            if !unchanged {
                changed.push((row.change_number, mid, row.is_associated));
                if given.contains(mid) {
                    out.updated_mids.push(mid);
                }
            }
            out.last_cn = out.last_cn.max(row.change_number);

            if flags.read_state {
                if let Some(read_cn) = row.read_cn {
                    if !read.contains(make_eid(REPLID_LOCAL, read_cn)) {
                        if row.read_state {
                            out.read_mids.push(mid);
                        } else {
                            out.unread_mids.push(mid);
                        }
                    }
                    out.last_readcn = out.last_readcn.max(read_cn);
                }
            }
        }

        // the CN ordering is the contract ICS exposes to clients
        changed.sort_unstable_by_key(|&(cn, _, _)| cn);
        for (_, mid, fai) in changed {
            if fai {
                out.fai_mids.push(mid);
            } else {
                out.normal_mids.push(mid);
            }
        }

        // anything the client holds that is no longer visible here counts
        // as deleted, whether it was removed, moved away or soft-deleted
        for eid in given.iter_ids() {
            if !present.contains(&eid) {
                out.deleted_mids.push(eid);
            }
        }
        Ok(out)
    }

    /// Derive the hierarchy delta under one root folder.
    pub fn get_hierarchy_sync(
        &self,
        root_fid: u64,
        username: Option<&str>,
        given: &IdSet,
        seen: &IdSet,
    ) -> EcResult<HierarchySyncResult> {
        let conn = self.reader()?;
        if folders::folder_row(&conn, root_fid)?.is_none() {
            return Err(EcError::NotFound);
        }
        let mut out = HierarchySyncResult::default();
        let mut present = Vec::new();
        let mut stack = vec![root_fid];
        while let Some(fid) = stack.pop() {
            for child in folders::child_folder_ids(&conn, fid)? {
                stack.push(child);
                if let Some(user) = username {
                    let perm = self.check_folder_permission(child, user)?;
                    if perm & (rights::VISIBLE | rights::READ_ANY | rights::OWNER) == 0 {
                        continue;
                    }
                }
                present.push(child);
                let cn: i64 = conn.query_row(
                    "SELECT change_number FROM folders WHERE folder_id = ?1",
                    [child as i64],
                    |r| r.get(0),
                )?;
                let cn = cn as u64;
                let cn_eid = make_eid(REPLID_LOCAL, cn);
                if !(given.contains(child) && seen.contains(cn_eid)) {
                    out.changed_fids.push(child);
                }
                out.last_cn = out.last_cn.max(cn);
            }
        }
        for eid in given.iter_ids() {
            if !present.contains(&eid) {
                out.deleted_fids.push(eid);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::store::MessageContent;
    use crate::types::propval::{folder_type, tags, PropList, PropValue};
    use crate::types::private_fid;

    const ALL: ContentSyncFlags = ContentSyncFlags { normal: true, fai: true, read_state: true };

    fn deliver(store: &crate::store::Store, subject: &str) -> u64 {
        let mut m = MessageContent::default();
        m.props.set(tags::PR_SUBJECT, PropValue::Unicode(subject.into()));
        store.write_message(private_fid::INBOX, &m, false).unwrap()
    }

    #[test]
    fn fresh_state_sees_everything_then_nothing() {
        let (_tmp, _engine, store) = temp_store();
        let m1 = deliver(&store, "one");
        let m2 = deliver(&store, "two");

        let empty = IdSet::new();
        let delta = store
            .get_content_sync(private_fid::INBOX, None, &empty, &empty, &empty, &empty, ALL)
            .unwrap();
        assert_eq!(delta.normal_mids, vec![m1, m2]);
        assert!(delta.deleted_mids.is_empty());

        // feed the returned state back: nothing more to sync
        let mut given = IdSet::new();
        let mut seen = IdSet::new();
        for &mid in &delta.normal_mids {
            given.append(mid);
            let row = store.get_message_properties(mid, &[tags::PR_CHANGE_NUMBER]).unwrap();
            seen.append(row.get(tags::PR_CHANGE_NUMBER).and_then(|v| v.as_u64()).unwrap());
        }
        let again = store
            .get_content_sync(private_fid::INBOX, None, &given, &seen, &IdSet::new(), &IdSet::new(), ALL)
            .unwrap();
        assert!(again.normal_mids.is_empty());
        assert!(again.deleted_mids.is_empty());
        assert!(again.read_mids.is_empty());
    }

    #[test]
    fn deletion_and_update_detection() {
        let (_tmp, _engine, store) = temp_store();
        let m1 = deliver(&store, "keep");
        let m2 = deliver(&store, "delete me");

        let mut given = IdSet::new();
        let mut seen = IdSet::new();
        for &mid in &[m1, m2] {
            given.append(mid);
            let row = store.get_message_properties(mid, &[tags::PR_CHANGE_NUMBER]).unwrap();
            seen.append(row.get(tags::PR_CHANGE_NUMBER).and_then(|v| v.as_u64()).unwrap());
        }
        store.delete_messages(private_fid::INBOX, &[m2], true).unwrap();
        let mut update = PropList::new();
        update.set(tags::PR_SUBJECT, PropValue::Unicode("kept, edited".into()));
        store.set_message_properties(m1, &update).unwrap();

        let delta = store
            .get_content_sync(private_fid::INBOX, None, &given, &seen, &IdSet::new(), &IdSet::new(), ALL)
            .unwrap();
        assert_eq!(delta.normal_mids, vec![m1]);
        assert_eq!(delta.updated_mids, vec![m1]);
        assert_eq!(delta.deleted_mids, vec![m2]);
    }

    #[test]
    fn read_state_changes_surface() {
        let (_tmp, _engine, store) = temp_store();
        let mid = deliver(&store, "rs");
        store.set_message_read_state("user@example.com", mid, true).unwrap();
        let delta = store
            .get_content_sync(
                private_fid::INBOX,
                None,
                &IdSet::new(),
                &IdSet::new(),
                &IdSet::new(),
                &IdSet::new(),
                ALL,
            )
            .unwrap();
        assert_eq!(delta.read_mids, vec![mid]);
        assert!(delta.last_readcn > 0);
    }

    #[test]
    fn hierarchy_delta() {
        let (_tmp, _engine, store) = temp_store();
        let fid = store
            .create_folder(private_fid::IPMSUBTREE, folder_type::GENERIC, "H", &PropList::new(), false)
            .unwrap()
            .folder_id;
        let delta = store
            .get_hierarchy_sync(private_fid::ROOT, None, &IdSet::new(), &IdSet::new())
            .unwrap();
        assert!(delta.changed_fids.contains(&fid));
        assert!(delta.changed_fids.contains(&private_fid::INBOX));

        let mut given = IdSet::new();
        let mut seen = IdSet::new();
        for &f in &delta.changed_fids {
            given.append(f);
        }
        seen.append_range(crate::types::REPLID_LOCAL, 1, delta.last_cn);
        let again = store
            .get_hierarchy_sync(private_fid::ROOT, None, &given, &seen)
            .unwrap();
        assert!(again.changed_fids.is_empty());
        assert!(again.deleted_fids.is_empty());
    }
}
