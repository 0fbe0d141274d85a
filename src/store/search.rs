//! Search folders: criteria storage and the asynchronous populator.
//!
//! `set_search_criteria` records scope + restriction on the folder row;
//! with the restart flag it clears `search_result` and spawns a populator
//! thread that walks the scope, evaluates the restriction per message and
//! inserts matches in batches. Population is cooperatively cancelled by a
//! newer `set_search_criteria` or by store unload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};

use crate::codec::{ExtPull, ExtPush};
use crate::types::restriction::Restriction;
use crate::types::{EcError, EcResult};

use super::folders;
use super::messages;
use super::notify::DbNotify;
use super::{lock, Store};

/// `set_search_criteria` flag bits.
pub mod search_flags {
    pub const STOP: u32 = 0x0000_0001;
    pub const RESTART: u32 = 0x0000_0002;
    pub const RECURSIVE: u32 = 0x0000_0004;
    pub const SHALLOW: u32 = 0x0000_0008;
    pub const STATIC: u32 = 0x0004_0000;
}

/// `get_search_criteria` status bits.
pub mod search_status {
    pub const RUNNING: u32 = 0x0000_0001;
    pub const RECURSIVE: u32 = 0x0000_0004;
    pub const COMPLETE: u32 = 0x0000_1000;
    pub const STATIC: u32 = 0x0001_0000;
    pub const STOPPED: u32 = 0x0002_0000;
}

const POPULATE_BATCH: usize = 64;

/// Handle on a running populator thread.
pub struct SearchJob {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SearchJob {
    pub fn cancel(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for SearchJob {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchCriteria {
    pub status: u32,
    pub restriction: Option<Restriction>,
    pub scope: Vec<u64>,
}

fn gather_scope(
    conn: &rusqlite::Connection,
    scope: &[u64],
    recursive: bool,
) -> EcResult<Vec<u64>> {
    let mut out = Vec::new();
    let mut queue: Vec<u64> = scope.to_vec();
    while let Some(fid) = queue.pop() {
        if out.contains(&fid) {
            continue;
        }
        out.push(fid);
        if recursive {
            queue.extend(folders::child_folder_ids(conn, fid)?);
        }
    }
    Ok(out)
}

impl Store {
    pub fn set_search_criteria(
        self: &Arc<Self>,
        folder_id: u64,
        flags: u32,
        restriction: Option<Restriction>,
        scope: &[u64],
    ) -> EcResult<()> {
        // cancel any populator already working this folder
        if let Some(job) = lock(&self.searches).remove(&folder_id) {
            job.cancel();
        }
        self.with_write(|txn, _| {
            let conn = txn.conn();
            match folders::folder_row(conn, folder_id)? {
                Some((_, false, true)) => {}
                Some(_) => return Err(EcError::NotSearchFolder),
                None => return Err(EcError::NotFound),
            }
            for &sf in scope {
                match folders::folder_row(conn, sf)? {
                    Some((_, false, false)) => {}
                    _ => return Err(EcError::SearchFolderScopeViolation),
                }
            }
            let blob = restriction.as_ref().map(|r| {
                let mut push = ExtPush::new();
                push.restriction(r);
                push.into_bytes()
            });
            conn.execute(
                "UPDATE folders SET search_flags = ?1, search_criteria = ?2 WHERE folder_id = ?3",
                params![i64::from(flags), blob, folder_id as i64],
            )?;
            if !scope.is_empty() {
                conn.execute(
                    "DELETE FROM search_scopes WHERE folder_id = ?1",
                    [folder_id as i64],
                )?;
                for &sf in scope {
                    conn.execute(
                        "INSERT OR IGNORE INTO search_scopes (folder_id, included_fid) VALUES (?1, ?2)",
                        params![folder_id as i64, sf as i64],
                    )?;
                }
            }
            if flags & search_flags::RESTART != 0 {
                conn.execute("DELETE FROM search_result WHERE folder_id = ?1", [folder_id as i64])?;
            }
            Ok(())
        })?;

        if flags & search_flags::RESTART != 0 && flags & search_flags::STOP == 0 {
            self.spawn_populator(folder_id)?;
        }
        Ok(())
    }

    pub fn get_search_criteria(&self, folder_id: u64) -> EcResult<SearchCriteria> {
        let conn = self.reader()?;
        let row: Option<(Option<i64>, Option<Vec<u8>>)> = conn
            .query_row(
                "SELECT search_flags, search_criteria FROM folders
                 WHERE folder_id = ?1 AND is_search = 1",
                [folder_id as i64],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (flags, blob) = row.ok_or(EcError::NotSearchFolder)?;
        let flags = flags.unwrap_or(0) as u32;
        let restriction = match blob {
            Some(b) => Some(ExtPull::new(&b).restriction()?),
            None => None,
        };
        let mut stmt =
            conn.prepare("SELECT included_fid FROM search_scopes WHERE folder_id = ?1")?;
        let scope = stmt
            .query_map([folder_id as i64], |r| r.get::<_, i64>(0).map(|v| v as u64))?
            .collect::<Result<Vec<_>, _>>()?;

        let running = lock(&self.searches).contains_key(&folder_id);
        let mut status = 0;
        if running {
            status |= search_status::RUNNING;
        } else if flags & search_flags::STOP != 0 {
            status |= search_status::STOPPED;
        } else {
            status |= search_status::COMPLETE;
        }
        if flags & search_flags::RECURSIVE != 0 {
            status |= search_status::RECURSIVE;
        }
        if flags & search_flags::STATIC != 0 {
            status |= search_status::STATIC;
        }
        Ok(SearchCriteria { status, restriction, scope })
    }

    fn spawn_populator(self: &Arc<Self>, folder_id: u64) -> EcResult<()> {
        let criteria = self.get_search_criteria(folder_id)?;
        let Some(restriction) = criteria.restriction else {
            return Ok(());
        };
        let recursive = {
            let conn = self.reader()?;
            let flags: Option<i64> = conn
                .query_row(
                    "SELECT search_flags FROM folders WHERE folder_id = ?1",
                    [folder_id as i64],
                    |r| r.get(0),
                )
                .optional()?
                .flatten();
            flags.unwrap_or(0) as u32 & search_flags::RECURSIVE != 0
        };
        let stop = Arc::new(AtomicBool::new(false));
        let store = Arc::clone(self);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("search/populate".into())
            .spawn(move || {
                if let Err(e) =
                    populate(&store, folder_id, &restriction, recursive, &thread_stop)
                {
                    warn!("search population of folder {folder_id:#x} failed: {e}");
                }
                // drop our own handle without joining it
                if let Some(mut job) = lock(&store.searches).remove(&folder_id) {
                    job.handle.take();
                }
                store.emit_notifies(vec![DbNotify::SearchCompleted { folder_id }]);
            })
            .map_err(|_| EcError::InsufficientResources)?;
        lock(&self.searches).insert(folder_id, SearchJob { stop, handle: Some(handle) });
        Ok(())
    }
}

fn populate(
    store: &Arc<Store>,
    folder_id: u64,
    restriction: &Restriction,
    recursive: bool,
    stop: &AtomicBool,
) -> EcResult<()> {
    let scope = {
        let conn = store.reader()?;
        let mut stmt =
            conn.prepare("SELECT included_fid FROM search_scopes WHERE folder_id = ?1")?;
        let roots: Vec<u64> = stmt
            .query_map([folder_id as i64], |r| r.get::<_, i64>(0).map(|v| v as u64))?
            .collect::<Result<_, _>>()?;
        gather_scope(&conn, &roots, recursive)?
    };
    debug!("populating search folder {folder_id:#x} over {} scope folders", scope.len());

    let mut batch: Vec<u64> = Vec::new();
    for scope_fid in scope {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mids = {
            let conn = store.reader()?;
            messages::message_ids_in(&conn, scope_fid, Some(false), false)?
        };
        for mid in mids {
            if stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            let matched = {
                let conn = store.reader()?;
                let content = messages::read_message_content(store, &conn, mid)?;
                restriction.eval(&content.props)
            };
            if matched {
                batch.push(mid);
                if batch.len() >= POPULATE_BATCH {
                    flush_batch(store, folder_id, &mut batch)?;
                }
            }
        }
    }
    flush_batch(store, folder_id, &mut batch)
}

fn flush_batch(store: &Arc<Store>, folder_id: u64, batch: &mut Vec<u64>) -> EcResult<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let mids = std::mem::take(batch);
    store.with_write(|txn, ctx| {
        for mid in &mids {
            txn.conn().execute(
                "INSERT OR IGNORE INTO search_result (folder_id, message_id) VALUES (?1, ?2)",
                params![folder_id as i64, *mid as i64],
            )?;
            ctx.notify(DbNotify::MessageCreated { folder_id, message_id: *mid });
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::store::MessageContent;
    use crate::types::propval::{folder_type, tags, PropList, PropValue};
    use crate::types::private_fid;
    use crate::types::restriction::FL_SUBSTRING;

    fn wait_complete(store: &Arc<Store>, fid: u64) {
        for _ in 0..200 {
            let status = store.get_search_criteria(fid).unwrap().status;
            if status & search_status::RUNNING == 0 {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("search did not finish");
    }

    #[test]
    fn populate_and_query() {
        let (_tmp, _engine, store) = temp_store();
        let mut m1 = MessageContent::default();
        m1.props.set(tags::PR_SUBJECT, PropValue::Unicode("project alpha".into()));
        store.write_message(private_fid::INBOX, &m1, false).unwrap();
        let mut m2 = MessageContent::default();
        m2.props.set(tags::PR_SUBJECT, PropValue::Unicode("lunch".into()));
        store.write_message(private_fid::INBOX, &m2, false).unwrap();

        let finder = store
            .create_folder(
                private_fid::FINDER,
                folder_type::SEARCH,
                "alpha search",
                &PropList::new(),
                false,
            )
            .unwrap()
            .folder_id;
        store
            .set_search_criteria(
                finder,
                search_flags::RESTART,
                Some(Restriction::Content {
                    fuzzy_level: FL_SUBSTRING,
                    proptag: tags::PR_SUBJECT,
                    propval: PropValue::Unicode("alpha".into()),
                }),
                &[private_fid::INBOX],
            )
            .unwrap();
        wait_complete(&store, finder);

        let (tid, rows) = store.load_content_table(finder, None, 0, None, None).unwrap();
        assert_eq!(rows, 1);
        store.unload_table(tid).unwrap();

        let criteria = store.get_search_criteria(finder).unwrap();
        assert!(criteria.status & search_status::COMPLETE != 0);
        assert_eq!(criteria.scope, vec![private_fid::INBOX]);
        assert!(criteria.restriction.is_some());
    }

    #[test]
    fn scope_must_be_generic_folders() {
        let (_tmp, _engine, store) = temp_store();
        let finder = store
            .create_folder(
                private_fid::FINDER,
                folder_type::SEARCH,
                "s",
                &PropList::new(),
                false,
            )
            .unwrap()
            .folder_id;
        // a search folder cannot scope another search folder
        let err = store
            .set_search_criteria(finder, search_flags::RESTART, Some(Restriction::Null), &[finder])
            .unwrap_err();
        assert_eq!(err, EcError::SearchFolderScopeViolation);
    }
}
