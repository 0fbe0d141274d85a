//! Content-addressed property files under `<storedir>/cid/`.
//!
//! Every file has a refcount row in `cid_usage`. References are taken by
//! message/attachment property writes and by message copies; a decrement
//! to zero deletes the row in the same transaction and schedules the file
//! for unlink after commit.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::types::{EcError, EcResult};

use super::schema::{self, config_id};
use super::{Store, WriteCtx};

pub fn path(dir: &Path, cid: u64) -> PathBuf {
    dir.join("cid").join(cid.to_string())
}

pub fn read(dir: &Path, cid: u64) -> EcResult<Vec<u8>> {
    std::fs::read(path(dir, cid)).map_err(|e| {
        warn!("cid {cid} unreadable under {}: {e}", dir.display());
        EcError::NotFound
    })
}

/// Write a new content file and its refcount row. The file lands on disk
/// inside the transaction; the caller's ctx remembers it for cleanup if
/// the transaction aborts.
pub fn create(conn: &Connection, dir: &Path, bytes: &[u8], ctx: &mut WriteCtx) -> EcResult<u64> {
    let last = schema::get_config_i64(conn, config_id::LAST_CID)?.unwrap_or(0) as u64;
    let cid = last + 1;
    schema::set_config_i64(conn, config_id::LAST_CID, cid as i64)?;
    conn.execute("INSERT INTO cid_usage (cid, refcount) VALUES (?1, 1)", [cid as i64])?;
    let p = path(dir, cid);
    std::fs::write(&p, bytes)?;
    ctx.new_cid_files.push(p);
    Ok(cid)
}

/// Take one more reference on an existing content file.
pub fn incref(conn: &Connection, cid: u64) -> EcResult<()> {
    let n = conn.execute(
        "UPDATE cid_usage SET refcount = refcount + 1 WHERE cid = ?1",
        [cid as i64],
    )?;
    if n == 0 {
        return Err(EcError::CorruptData);
    }
    Ok(())
}

/// Drop one reference; at zero the row goes away and the file is queued
/// for unlink after commit.
pub fn decref(conn: &Connection, dir: &Path, cid: u64, ctx: &mut WriteCtx) -> EcResult<()> {
    let count: Option<i64> = conn
        .query_row("SELECT refcount FROM cid_usage WHERE cid = ?1", [cid as i64], |r| {
            r.get(0)
        })
        .optional()?;
    match count {
        None => {
            warn!("decref of unknown cid {cid}");
            Ok(())
        }
        Some(n) if n <= 1 => {
            conn.execute("DELETE FROM cid_usage WHERE cid = ?1", [cid as i64])?;
            ctx.dead_cid_files.push(path(dir, cid));
            Ok(())
        }
        Some(_) => {
            conn.execute(
                "UPDATE cid_usage SET refcount = refcount - 1 WHERE cid = ?1",
                [cid as i64],
            )?;
            Ok(())
        }
    }
}

/// Verify refcounts against the directory: complain about referenced files
/// that are missing, remove files nothing references.
pub fn audit(store: &Store) -> EcResult<()> {
    let conn = store.reader()?;
    let mut stmt = conn.prepare("SELECT cid FROM cid_usage")?;
    let referenced: std::collections::HashSet<u64> = stmt
        .query_map([], |r| r.get::<_, i64>(0).map(|c| c as u64))?
        .collect::<Result<_, _>>()?;

    for cid in &referenced {
        if !path(store.dir(), *cid).is_file() {
            warn!("cid {cid} is referenced but missing on disk");
        }
    }
    let cid_dir = store.dir().join("cid");
    for entry in std::fs::read_dir(&cid_dir)? {
        let entry = entry?;
        let Some(cid) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) else {
            continue;
        };
        if !referenced.contains(&cid) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;

    #[test]
    fn refcount_lifecycle() {
        let (_tmp, _engine, store) = temp_store();
        let cid = store
            .with_write(|txn, ctx| create(txn.conn(), store.dir(), b"payload", ctx))
            .unwrap();
        assert_eq!(read(store.dir(), cid).unwrap(), b"payload");

        store.with_write(|txn, _| incref(txn.conn(), cid)).unwrap();
        store
            .with_write(|txn, ctx| decref(txn.conn(), store.dir(), cid, ctx))
            .unwrap();
        // still one reference: file survives
        assert!(path(store.dir(), cid).is_file());

        store
            .with_write(|txn, ctx| decref(txn.conn(), store.dir(), cid, ctx))
            .unwrap();
        assert!(!path(store.dir(), cid).is_file());
    }

    #[test]
    fn aborted_txn_removes_fresh_file() {
        let (_tmp, _engine, store) = temp_store();
        let err = store
            .with_write(|txn, ctx| {
                create(txn.conn(), store.dir(), b"doomed", ctx)?;
                Err::<(), _>(EcError::InvalidParam)
            })
            .unwrap_err();
        assert_eq!(err, EcError::InvalidParam);
        // no file survived the rollback
        let n = std::fs::read_dir(store.dir().join("cid")).unwrap().count();
        assert_eq!(n, 0);
    }

    #[test]
    fn audit_removes_orphans() {
        let (_tmp, _engine, store) = temp_store();
        std::fs::write(store.dir().join("cid/999"), b"orphan").unwrap();
        audit(&store).unwrap();
        assert!(!store.dir().join("cid/999").is_file());
    }
}
