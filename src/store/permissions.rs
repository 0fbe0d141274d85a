//! Folder ACLs.
//!
//! Rights are per (folder, username). The store owner bypasses every
//! check; for everyone else the ACL row (or the `default` row) decides,
//! and the well-known containers stay visible so the hierarchy can be
//! walked.

use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{private_fid, public_fid, rights, EcError, EcResult};

use super::Store;

/// Username of the ACL row that applies when no specific row matches.
pub const DEFAULT_MEMBER: &str = "default";

/// One ACL row, as loaded for a permission table or an update batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRow {
    pub member_id: u64,
    pub username: String,
    pub rights: u32,
}

/// Batched ACL edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionOp {
    Add { username: String, rights: u32 },
    Modify { member_id: u64, rights: u32 },
    Remove { member_id: u64 },
}

fn folder_acl(conn: &Connection, folder_id: u64, username: &str) -> EcResult<Option<u32>> {
    let specific: Option<i64> = conn
        .query_row(
            "SELECT permission FROM permissions WHERE folder_id = ?1 AND username = ?2",
            params![folder_id as i64, username],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(p) = specific {
        return Ok(Some(p as u32));
    }
    let default: Option<i64> = conn
        .query_row(
            "SELECT permission FROM permissions WHERE folder_id = ?1 AND username = ?2",
            params![folder_id as i64, DEFAULT_MEMBER],
            |r| r.get(0),
        )
        .optional()?;
    Ok(default.map(|p| p as u32))
}

impl Store {
    /// Rights of `username` on a folder. Owner logons get everything.
    pub fn check_folder_permission(&self, folder_id: u64, username: &str) -> EcResult<u32> {
        if self.is_owner(username) {
            return Ok(rights::ALL);
        }
        let conn = self.reader()?;
        let mut perm = folder_acl(&conn, folder_id, username)?.unwrap_or(0);
        let well_known = if self.is_private() {
            matches!(folder_id, private_fid::ROOT | private_fid::IPMSUBTREE)
        } else {
            folder_id == public_fid::ROOT
        };
        if well_known {
            perm |= rights::VISIBLE;
        }
        Ok(perm)
    }

    pub fn load_permission_rows(&self, folder_id: u64) -> EcResult<Vec<PermissionRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT member_id, username, permission FROM permissions
             WHERE folder_id = ?1 ORDER BY member_id",
        )?;
        let rows = stmt
            .query_map([folder_id as i64], |r| {
                Ok(PermissionRow {
                    member_id: r.get::<_, i64>(0)? as u64,
                    username: r.get(1)?,
                    rights: r.get::<_, i64>(2)? as u32,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn empty_folder_permission(&self, folder_id: u64) -> EcResult<()> {
        self.with_write(|txn, _ctx| {
            txn.conn()
                .execute("DELETE FROM permissions WHERE folder_id = ?1", [folder_id as i64])?;
            Ok(())
        })
    }

    pub fn update_folder_permission(
        &self,
        folder_id: u64,
        freebusy: bool,
        ops: &[PermissionOp],
    ) -> EcResult<()> {
        let _ = freebusy; // freebusy sub-rights ride in the mask itself
        self.with_write(|txn, _ctx| {
            let conn = txn.conn();
            for op in ops {
                match op {
                    PermissionOp::Add { username, rights } => {
                        conn.execute(
                            "REPLACE INTO permissions (folder_id, username, permission)
                             VALUES (?1, ?2, ?3)",
                            params![folder_id as i64, username, i64::from(*rights)],
                        )?;
                    }
                    PermissionOp::Modify { member_id, rights } => {
                        let n = conn.execute(
                            "UPDATE permissions SET permission = ?1
                             WHERE member_id = ?2 AND folder_id = ?3",
                            params![i64::from(*rights), *member_id as i64, folder_id as i64],
                        )?;
                        if n == 0 {
                            return Err(EcError::NotFound);
                        }
                    }
                    PermissionOp::Remove { member_id } => {
                        conn.execute(
                            "DELETE FROM permissions WHERE member_id = ?1 AND folder_id = ?2",
                            params![*member_id as i64, folder_id as i64],
                        )?;
                    }
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::types::private_fid;

    #[test]
    fn owner_bypasses_acl() {
        let (_tmp, _engine, store) = temp_store();
        let perm = store
            .check_folder_permission(private_fid::INBOX, "user@example.com")
            .unwrap();
        assert_eq!(perm, rights::ALL);
    }

    #[test]
    fn stranger_sees_only_wellknown_roots() {
        let (_tmp, _engine, store) = temp_store();
        let inbox = store
            .check_folder_permission(private_fid::INBOX, "other@example.com")
            .unwrap();
        assert_eq!(inbox, 0);
        let subtree = store
            .check_folder_permission(private_fid::IPMSUBTREE, "other@example.com")
            .unwrap();
        assert_eq!(subtree, rights::VISIBLE);
    }

    #[test]
    fn acl_rows_and_default() {
        let (_tmp, _engine, store) = temp_store();
        store
            .update_folder_permission(
                private_fid::INBOX,
                false,
                &[
                    PermissionOp::Add {
                        username: "delegate@example.com".into(),
                        rights: rights::READ_ANY | rights::VISIBLE,
                    },
                    PermissionOp::Add {
                        username: DEFAULT_MEMBER.into(),
                        rights: rights::VISIBLE,
                    },
                ],
            )
            .unwrap();
        assert_eq!(
            store
                .check_folder_permission(private_fid::INBOX, "delegate@example.com")
                .unwrap(),
            rights::READ_ANY | rights::VISIBLE
        );
        assert_eq!(
            store
                .check_folder_permission(private_fid::INBOX, "anyone@example.com")
                .unwrap(),
            rights::VISIBLE
        );

        let rows = store.load_permission_rows(private_fid::INBOX).unwrap();
        assert_eq!(rows.len(), 2);
        store.empty_folder_permission(private_fid::INBOX).unwrap();
        assert!(store.load_permission_rows(private_fid::INBOX).unwrap().is_empty());
    }
}
