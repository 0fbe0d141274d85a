//! The per-user mailbox store.
//!
//! A store is one directory: `exmdb/exchange.sqlite3`, content-addressed
//! blobs under `cid/`, raw RFC822 renditions under `eml/`, and spool space
//! under `tmp/`. The [`Store`] struct owns the single writer connection and
//! a small reader pool; the [`Engine`] keeps the set of open stores and
//! routes notifications out of them.

pub mod cid;
pub mod db;
pub mod delivery;
pub mod folders;
pub mod instances;
pub mod messages;
pub mod named_props;
pub mod notify;
pub mod permissions;
pub mod props;
pub mod rules;
pub mod schema;
pub mod search;
pub mod sync;
pub mod tables;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use rusqlite::Connection;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::codec::{ExtPull, ExtPush};
use crate::ics::ReplMapping;
use crate::types::propval::{PropList, PropValue};
use crate::types::{eid_gc, EcError, EcResult, REPLID_LOCAL};

use db::{DbConnection, DbPool, WriteTxn};
use instances::Instance;
use notify::{DbNotify, NotifySink, Subscription};
use schema::config_id;
use search::SearchJob;
use tables::Table;

/// Recipient rows and attachments of one message, the unit FastTransfer
/// and `write_message`/`read_message` move around.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageContent {
    pub props: PropList,
    pub recipients: Vec<PropList>,
    pub attachments: Vec<AttachmentContent>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentContent {
    pub props: PropList,
    pub embedded: Option<Box<MessageContent>>,
}

impl MessageContent {
    pub fn encode(&self, push: &mut ExtPush) {
        push.proplist(&self.props);
        push.u16(self.recipients.len() as u16);
        for r in &self.recipients {
            push.proplist(r);
        }
        push.u16(self.attachments.len() as u16);
        for a in &self.attachments {
            a.encode(push);
        }
    }

    pub fn decode(pull: &mut ExtPull) -> EcResult<Self> {
        let props = pull.proplist()?;
        let nrcpt = pull.u16()? as usize;
        let recipients = (0..nrcpt).map(|_| pull.proplist()).collect::<EcResult<_>>()?;
        let natt = pull.u16()? as usize;
        let attachments = (0..natt)
            .map(|_| AttachmentContent::decode(pull))
            .collect::<EcResult<_>>()?;
        Ok(Self { props, recipients, attachments })
    }
}

impl AttachmentContent {
    pub fn encode(&self, push: &mut ExtPush) {
        push.proplist(&self.props);
        match &self.embedded {
            None => push.u8(0),
            Some(m) => {
                push.u8(1);
                m.encode(push);
            }
        }
    }

    pub fn decode(pull: &mut ExtPull) -> EcResult<Self> {
        let props = pull.proplist()?;
        let embedded = pull.opt(MessageContent::decode)?.map(Box::new);
        Ok(Self { props, embedded })
    }
}

/// One open mailbox store.
pub struct Store {
    dir: PathBuf,
    private: bool,
    mailbox_guid: Uuid,
    owner: String,
    pool: DbPool,
    writer: Mutex<Connection>,
    pub(crate) named_cache: RwLock<named_props::NamedCache>,
    pub(crate) instances: Mutex<HashMap<u32, Instance>>,
    next_instance_id: AtomicU32,
    pub(crate) tables: Mutex<HashMap<u32, Table>>,
    next_table_id: AtomicU32,
    pub(crate) subscriptions: Mutex<HashMap<u32, Subscription>>,
    next_sub_id: AtomicU32,
    pub(crate) searches: Mutex<HashMap<u64, SearchJob>>,
    sink: Arc<NotifySink>,
    corrupt: AtomicBool,
}

pub(crate) fn lock<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Store {
    fn open(dir: &Path, sink: Arc<NotifySink>) -> EcResult<Arc<Self>> {
        let db_path = dir.join("exmdb/exchange.sqlite3");
        if !db_path.is_file() {
            warn!("no store database under {}", dir.display());
            return Err(EcError::NotFound);
        }
        let writer = db::open_writer(&db_path)?;
        if !schema::integrity_check(&writer)? {
            error!("integrity_check failed for {}; refusing to serve", dir.display());
            return Err(EcError::Error);
        }
        let pool = db::create_pool(&db_path, 4)?;
        let mailbox_guid = schema::get_config_text(&writer, config_id::MAILBOX_GUID)?
            .and_then(|s| Uuid::parse_str(&s).ok())
            .ok_or(EcError::CorruptData)?;
        let owner =
            schema::get_config_text(&writer, config_id::OWNER)?.unwrap_or_default();
        let private =
            schema::get_config_i64(&writer, config_id::PRIVATE)?.unwrap_or(1) != 0;
        info!("opened store {} (guid {mailbox_guid})", dir.display());
        Ok(Arc::new(Self {
            dir: dir.to_owned(),
            private,
            mailbox_guid,
            owner,
            pool,
            writer: Mutex::new(writer),
            named_cache: RwLock::new(named_props::NamedCache::default()),
            instances: Mutex::new(HashMap::new()),
            next_instance_id: AtomicU32::new(1),
            tables: Mutex::new(HashMap::new()),
            next_table_id: AtomicU32::new(1),
            subscriptions: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU32::new(1),
            searches: Mutex::new(HashMap::new()),
            sink,
            corrupt: AtomicBool::new(false),
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn mailbox_guid(&self) -> Uuid {
        self.mailbox_guid
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// True when `username` bypasses folder ACLs.
    pub fn is_owner(&self, username: &str) -> bool {
        self.private && username.eq_ignore_ascii_case(&self.owner)
    }

    fn check_ok(&self) -> EcResult<()> {
        if self.corrupt.load(Ordering::Relaxed) {
            return Err(EcError::Error);
        }
        Ok(())
    }

    pub(crate) fn reader(&self) -> EcResult<DbConnection> {
        self.check_ok()?;
        Ok(self.pool.get()?)
    }

    /// Run a write verb under `BEGIN IMMEDIATE`. Notifications collected by
    /// the closure are emitted only after a successful commit; cid files
    /// recorded for deletion are unlinked then as well.
    pub(crate) fn with_write<T>(
        &self,
        f: impl FnOnce(&WriteTxn, &mut WriteCtx) -> EcResult<T>,
    ) -> EcResult<T> {
        self.check_ok()?;
        let conn = lock(&self.writer);
        let txn = WriteTxn::begin(&conn)?;
        let mut ctx = WriteCtx::default();
        let out = match f(&txn, &mut ctx) {
            Ok(out) => out,
            Err(e) => {
                drop(txn);
                // fresh cid files written for this aborted txn are garbage
                for path in ctx.new_cid_files {
                    let _ = std::fs::remove_file(path);
                }
                return Err(e);
            }
        };
        match txn.commit() {
            Ok(()) => {}
            Err(e) => {
                for path in ctx.new_cid_files {
                    let _ = std::fs::remove_file(path);
                }
                return Err(e);
            }
        }
        drop(conn);
        for path in ctx.dead_cid_files {
            let _ = std::fs::remove_file(path);
        }
        self.emit_notifies(ctx.notifies);
        Ok(out)
    }

    pub(crate) fn emit_notifies(&self, notifies: Vec<DbNotify>) {
        if notifies.is_empty() {
            return;
        }
        let subs = lock(&self.subscriptions);
        for n in &notifies {
            for sub in subs.values() {
                if sub.matches(n) {
                    self.sink.dispatch(&self.dir, sub, n);
                }
            }
        }
    }

    pub(crate) fn next_instance_id(&self) -> u32 {
        self.next_instance_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_table_id(&self) -> u32 {
        self.next_table_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_sub_id(&self) -> u32 {
        self.next_sub_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn mark_corrupt(&self) {
        error!("store {} marked unserviceable", self.dir.display());
        self.corrupt.store(true, Ordering::Relaxed);
    }

    // ---- metadata verbs ----

    /// Keepalive; also the cheapest way to assert the store is openable.
    pub fn ping(&self) -> EcResult<()> {
        self.check_ok()
    }

    pub fn get_mapping_guid(&self, replid: u16) -> EcResult<Uuid> {
        if replid == REPLID_LOCAL {
            Ok(self.mailbox_guid)
        } else {
            Err(EcError::NotFound)
        }
    }

    pub fn get_mapping_replid(&self, guid: Uuid) -> EcResult<u16> {
        if guid == self.mailbox_guid {
            Ok(REPLID_LOCAL)
        } else {
            Err(EcError::NotFound)
        }
    }

    /// Rebuild the database file in place and audit cid refcounts.
    pub fn vacuum(&self) -> EcResult<()> {
        self.check_ok()?;
        {
            let conn = lock(&self.writer);
            conn.execute_batch("VACUUM")?;
        }
        cid::audit(self)
    }

    // ---- store properties ----

    pub fn get_store_all_proptags(&self) -> EcResult<Vec<u32>> {
        let conn = self.reader()?;
        let mut tags = props::all_proptags(&conn, "store_properties", None)?;
        for tag in [
            crate::types::propval::tags::PR_STORE_RECORD_KEY,
            crate::types::propval::tags::PR_MESSAGE_SIZE,
        ] {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        Ok(tags)
    }

    pub fn get_store_properties(&self, tags: &[u32]) -> EcResult<PropList> {
        use crate::types::propval::tags as t;
        let conn = self.reader()?;
        let mut out = props::read_props(&conn, &self.dir, "store_properties", None, tags)?;
        for &tag in tags {
            match tag {
                t::PR_STORE_RECORD_KEY => out.set(
                    tag,
                    PropValue::Binary(crate::types::guid_to_wire(self.mailbox_guid).to_vec()),
                ),
                t::PR_MESSAGE_SIZE => {
                    let size: i64 = conn.query_row(
                        "SELECT COALESCE(SUM(message_size), 0) FROM messages WHERE is_deleted = 0",
                        [],
                        |r| r.get(0),
                    )?;
                    out.set(tag, PropValue::Long(size as u32));
                }
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn set_store_properties(&self, values: &PropList) -> EcResult<Vec<u32>> {
        let mut problems = Vec::new();
        self.with_write(|txn, _ctx| {
            for tp in values.iter() {
                if props::is_computed_store_tag(tp.tag) {
                    problems.push(tp.tag);
                    continue;
                }
                props::write_prop(txn.conn(), "store_properties", None, tp)?;
            }
            Ok(())
        })?;
        Ok(problems)
    }

    pub fn remove_store_properties(&self, tags: &[u32]) -> EcResult<()> {
        self.with_write(|txn, _ctx| {
            for &tag in tags {
                props::remove_prop(txn.conn(), "store_properties", None, tag)?;
            }
            Ok(())
        })
    }

    /// Effective rights of `username` over the mailbox as a whole: the
    /// union of its ACL entries, or everything for the owner.
    pub fn get_mbox_perm(&self, username: &str) -> EcResult<u32> {
        if self.is_owner(username) {
            return Ok(crate::types::rights::ALL);
        }
        let conn = self.reader()?;
        let mut stmt =
            conn.prepare("SELECT permission FROM permissions WHERE username = ?1")?;
        let mut rights = 0u32;
        let rows = stmt.query_map([username], |r| r.get::<_, i64>(0))?;
        for r in rows {
            rights |= r? as u32;
        }
        Ok(rights)
    }

    /// Resolve an entry id minted by this store back to its owning user.
    pub fn store_eid_to_user(&self, eid: u64) -> EcResult<(String, String)> {
        if eid_gc(eid) == 0 {
            return Err(EcError::InvalidParam);
        }
        Ok((self.owner.clone(), self.dir.display().to_string()))
    }

    /// Flush in-flight state ahead of unload: abandon editing instances,
    /// stop search populators, drop loaded tables.
    fn quiesce(&self) {
        for (_, job) in lock(&self.searches).drain() {
            job.cancel();
        }
        lock(&self.instances).clear();
        lock(&self.tables).clear();
        lock(&self.subscriptions).clear();
    }
}

impl ReplMapping for Store {
    fn replid_to_guid(&self, replid: u16) -> Option<Uuid> {
        (replid == REPLID_LOCAL).then_some(self.mailbox_guid)
    }
    fn guid_to_replid(&self, guid: Uuid) -> Option<u16> {
        (guid == self.mailbox_guid).then_some(REPLID_LOCAL)
    }
}

/// Mutable scratch state threaded through one write verb.
#[derive(Default)]
pub struct WriteCtx {
    pub notifies: Vec<DbNotify>,
    /// cid files created inside the transaction; deleted if it aborts.
    pub new_cid_files: Vec<PathBuf>,
    /// cid files whose refcount dropped to zero; deleted after commit.
    pub dead_cid_files: Vec<PathBuf>,
}

impl WriteCtx {
    pub fn notify(&mut self, n: DbNotify) {
        self.notifies.push(n);
    }
}

/// The set of open stores in this process.
pub struct Engine {
    stores: Mutex<HashMap<PathBuf, Arc<Store>>>,
    sink: Arc<NotifySink>,
    pub limits: Limits,
}

/// Per-verb upper bounds from the daemon configuration.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_rcpt: u32,
    pub max_message: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_rcpt: 256, max_message: 1024 }
    }
}

impl Engine {
    pub fn new(limits: Limits) -> Arc<Self> {
        Arc::new(Self {
            stores: Mutex::new(HashMap::new()),
            sink: Arc::new(NotifySink::default()),
            limits,
        })
    }

    pub fn sink(&self) -> &Arc<NotifySink> {
        &self.sink
    }

    /// Open (or return the already-open) store at `dir`.
    pub fn open_store(&self, dir: &Path) -> EcResult<Arc<Store>> {
        let mut stores = lock(&self.stores);
        if let Some(store) = stores.get(dir) {
            return Ok(store.clone());
        }
        let store = Store::open(dir, self.sink.clone())?;
        stores.insert(dir.to_owned(), store.clone());
        Ok(store)
    }

    /// Drop a store from the open set, flushing in-flight state.
    pub fn unload_store(&self, dir: &Path) -> EcResult<()> {
        let store = lock(&self.stores).remove(dir);
        match store {
            Some(store) => {
                store.quiesce();
                info!("unloaded store {}", dir.display());
                Ok(())
            }
            None => Err(EcError::NotFound),
        }
    }

    pub fn open_dirs(&self) -> Vec<PathBuf> {
        lock(&self.stores).keys().cloned().collect()
    }
}

// ---- id allocation (shared by folder/message/instance writers) ----

/// Allocate one eid from the store counter, extending the recorded range
/// when it runs out. Must be called inside a write transaction.
pub(crate) fn allocate_eid(conn: &Connection) -> EcResult<u64> {
    let current = schema::get_config_i64(conn, config_id::CURRENT_EID)?
        .ok_or(EcError::CorruptData)? as u64;
    let maximum = schema::get_config_i64(conn, config_id::MAXIMUM_EID)?
        .ok_or(EcError::CorruptData)? as u64;
    let next = current + 1;
    if next > maximum {
        let new_max = maximum + schema::EID_RANGE;
        conn.execute(
            "INSERT INTO allocated_eids (range_begin, range_end, allocate_time, is_system)
             VALUES (?1, ?2, ?3, 0)",
            rusqlite::params![
                (maximum + 1) as i64,
                new_max as i64,
                chrono::Utc::now().timestamp()
            ],
        )?;
        schema::set_config_i64(conn, config_id::MAXIMUM_EID, new_max as i64)?;
    }
    schema::set_config_i64(conn, config_id::CURRENT_EID, next as i64)?;
    Ok(crate::types::make_eid(REPLID_LOCAL, next))
}

/// Allocate a contiguous range of eids; returns the first.
pub(crate) fn allocate_eid_range(conn: &Connection, count: u32) -> EcResult<u64> {
    let first = allocate_eid(conn)?;
    for _ in 1..count {
        allocate_eid(conn)?;
    }
    Ok(first)
}

/// Allocate the next change number.
pub(crate) fn allocate_cn(conn: &Connection) -> EcResult<u64> {
    let last = schema::get_config_i64(conn, config_id::LAST_CHANGE_NUMBER)?
        .ok_or(EcError::CorruptData)? as u64;
    let next = last + 1;
    schema::set_config_i64(conn, config_id::LAST_CHANGE_NUMBER, next as i64)?;
    Ok(crate::types::make_eid(REPLID_LOCAL, next))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// A provisioned private store in a temp dir, for unit tests.
    pub fn temp_store() -> (tempfile::TempDir, Arc<Engine>, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        schema::provision(dir.path(), "user@example.com", true).unwrap();
        let engine = Engine::new(Limits::default());
        let store = engine.open_store(dir.path()).unwrap();
        (dir, engine, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eid_allocation_is_monotonic() {
        let (_tmp, _engine, store) = testutil::temp_store();
        let mut last = 0u64;
        for _ in 0..10 {
            let eid = store
                .with_write(|txn, _| allocate_eid(txn.conn()))
                .unwrap();
            assert!(eid_gc(eid) > eid_gc(last) || last == 0);
            assert!(eid_gc(eid) >= crate::types::CUSTOM_EID_BEGIN);
            last = eid;
        }
        let cn1 = store.with_write(|txn, _| allocate_cn(txn.conn())).unwrap();
        let cn2 = store.with_write(|txn, _| allocate_cn(txn.conn())).unwrap();
        assert!(eid_gc(cn2) > eid_gc(cn1));
    }

    #[test]
    fn unload_removes_store() {
        let (tmp, engine, _store) = testutil::temp_store();
        assert_eq!(engine.open_dirs().len(), 1);
        engine.unload_store(tmp.path()).unwrap();
        assert!(engine.open_dirs().is_empty());
        assert_eq!(engine.unload_store(tmp.path()).unwrap_err(), EcError::NotFound);
    }

    #[test]
    fn store_record_key_is_computed() {
        use crate::types::propval::tags;
        let (_tmp, _engine, store) = testutil::temp_store();
        let props = store
            .get_store_properties(&[tags::PR_STORE_RECORD_KEY])
            .unwrap();
        let key = props.get(tags::PR_STORE_RECORD_KEY).unwrap().as_bytes().unwrap();
        assert_eq!(key.len(), 16);
    }
}
