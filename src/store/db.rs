//! SQLite plumbing: connection pools, pragmas, and the write-transaction
//! guard with its commit busy-retry.

use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::types::{EcError, EcResult};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const COMMIT_RETRIES: u32 = 10;
const COMMIT_RETRY_SLEEP: Duration = Duration::from_secs(1);

pub const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA foreign_keys = ON;
     PRAGMA temp_store = MEMORY;";

/// Reader pool over one store database.
pub fn create_pool(db_path: &Path, readers: u32) -> EcResult<DbPool> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_init(|conn| conn.execute_batch(PRAGMAS));
    let pool = Pool::builder().max_size(readers).build(manager)?;
    Ok(pool)
}

/// The single writer connection of a store.
pub fn open_writer(db_path: &Path) -> EcResult<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(PRAGMAS)?;
    conn.busy_timeout(Duration::from_secs(10))?;
    Ok(conn)
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// `BEGIN IMMEDIATE` guard. Rolls back on drop unless committed; commit
/// retries `SQLITE_BUSY` before surfacing it.
pub struct WriteTxn<'a> {
    conn: &'a Connection,
    done: bool,
}

impl<'a> WriteTxn<'a> {
    pub fn begin(conn: &'a Connection) -> EcResult<Self> {
        conn.execute_batch("BEGIN IMMEDIATE").map_err(|e| {
            if is_busy(&e) {
                EcError::Error
            } else {
                EcError::from(e)
            }
        })?;
        Ok(Self { conn, done: false })
    }

    pub fn conn(&self) -> &Connection {
        self.conn
    }

    pub fn commit(mut self) -> EcResult<()> {
        let mut attempt = 0;
        loop {
            match self.conn.execute_batch("COMMIT TRANSACTION") {
                Ok(()) => {
                    self.done = true;
                    return Ok(());
                }
                Err(e) if is_busy(&e) && attempt < COMMIT_RETRIES => {
                    if attempt == 0 {
                        warn!(
                            "another process holds a query open on this \
                             database, blocking the commit; retrying"
                        );
                    }
                    attempt += 1;
                    std::thread::sleep(COMMIT_RETRY_SLEEP);
                }
                Err(e) => {
                    debug!("commit failed: {e}");
                    // Drop will roll back whatever remains.
                    return Err(EcError::from(e));
                }
            }
        }
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sqlite3");
        let conn = open_writer(&path).unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        {
            let txn = WriteTxn::begin(&conn).unwrap();
            txn.conn().execute("INSERT INTO t VALUES (1)", []).unwrap();
            // dropped uncommitted
        }
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 0);

        let txn = WriteTxn::begin(&conn).unwrap();
        txn.conn().execute("INSERT INTO t VALUES (2)", []).unwrap();
        txn.commit().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 1);
    }
}
