//! Store database schema and provisioning.
//!
//! `exchange.sqlite3` lives under `<storedir>/exmdb/`. The table set and
//! column names are part of the on-disk format; the rebuild tool copies
//! exactly these tables into a fresh file.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::types::propval::{folder_type, tags, PropValue};
use crate::types::{filetime_now, private_fid, public_fid, EcError, EcResult};

/// `configurations.config_id` keys.
pub mod config_id {
    pub const MAILBOX_GUID: i64 = 1;
    pub const CURRENT_EID: i64 = 2;
    pub const MAXIMUM_EID: i64 = 3;
    pub const LAST_CHANGE_NUMBER: i64 = 4;
    pub const LAST_ARTICLE_NUMBER: i64 = 5;
    pub const LAST_CID: i64 = 6;
    pub const SCHEMA_VERSION: i64 = 7;
    pub const DEFAULT_PERMISSION: i64 = 8;
    pub const ANONYMOUS_PERMISSION: i64 = 9;
    pub const OWNER: i64 = 10;
    pub const PRIVATE: i64 = 11;
}

/// Eids are handed out in ranges; each extension is recorded in
/// `allocated_eids` so a rebuild can prove no id was ever reused.
pub const EID_RANGE: u64 = 0x10000;

/// Tables of the store database, in rebuild copy order (parents first).
pub const TABLE_NAMES: &[&str] = &[
    "configurations",
    "allocated_eids",
    "named_properties",
    "store_properties",
    "permissions",
    "rules",
    "folders",
    "folder_properties",
    "receive_table",
    "messages",
    "message_properties",
    "message_changes",
    "recipients",
    "recipients_properties",
    "attachments",
    "attachment_properties",
    "search_scopes",
    "search_result",
    "read_states",
    "cid_usage",
    "table_states",
];

pub const SCHEMA: &str = "
    CREATE TABLE configurations (
        config_id    INTEGER PRIMARY KEY,
        config_value NONE NOT NULL
    );

    -- Every extension of the eid counter; ranges are never reissued.
    CREATE TABLE allocated_eids (
        range_begin   INTEGER NOT NULL,
        range_end     INTEGER NOT NULL,
        allocate_time INTEGER NOT NULL,
        is_system     INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE named_properties (
        propid INTEGER PRIMARY KEY,
        kind   INTEGER NOT NULL,
        guid   TEXT NOT NULL,
        lid    INTEGER,
        name   TEXT
    );
    CREATE UNIQUE INDEX idx_named_triple ON named_properties(guid, kind, lid, name);

    CREATE TABLE store_properties (
        proptag INTEGER PRIMARY KEY,
        propval BLOB NOT NULL
    );

    CREATE TABLE permissions (
        member_id  INTEGER PRIMARY KEY AUTOINCREMENT,
        folder_id  INTEGER NOT NULL,
        username   TEXT NOT NULL,
        permission INTEGER NOT NULL,
        UNIQUE (folder_id, username)
    );

    CREATE TABLE rules (
        rule_id   INTEGER PRIMARY KEY AUTOINCREMENT,
        folder_id INTEGER NOT NULL,
        sequence  INTEGER NOT NULL,
        state     INTEGER NOT NULL DEFAULT 1,
        name      TEXT,
        provider  TEXT,
        condition BLOB,
        actions   BLOB
    );
    CREATE INDEX idx_rules_folder ON rules(folder_id, sequence);

    CREATE TABLE folders (
        folder_id       INTEGER PRIMARY KEY,
        parent_id       INTEGER,
        change_number   INTEGER NOT NULL,
        is_search       INTEGER NOT NULL DEFAULT 0,
        is_deleted      INTEGER NOT NULL DEFAULT 0,
        search_flags    INTEGER,
        search_criteria BLOB
    );
    CREATE INDEX idx_folders_parent ON folders(parent_id);

    CREATE TABLE folder_properties (
        folder_id INTEGER NOT NULL REFERENCES folders(folder_id) ON DELETE CASCADE,
        proptag   INTEGER NOT NULL,
        propval   BLOB NOT NULL,
        PRIMARY KEY (folder_id, proptag)
    ) WITHOUT ROWID;

    -- Message-class routing for incoming delivery.
    CREATE TABLE receive_table (
        class         TEXT PRIMARY KEY,
        folder_id     INTEGER NOT NULL,
        modified_time INTEGER NOT NULL
    );

    CREATE TABLE messages (
        message_id    INTEGER PRIMARY KEY,
        parent_fid    INTEGER,
        parent_attid  INTEGER,
        is_associated INTEGER NOT NULL DEFAULT 0,
        is_deleted    INTEGER NOT NULL DEFAULT 0,
        read_state    INTEGER NOT NULL DEFAULT 0,
        read_cn       INTEGER,
        change_number INTEGER NOT NULL,
        message_size  INTEGER NOT NULL DEFAULT 0,
        group_id      INTEGER,
        timer_id      INTEGER
    );
    CREATE INDEX idx_messages_parent ON messages(parent_fid, is_associated, is_deleted);

    CREATE TABLE message_properties (
        message_id INTEGER NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
        proptag    INTEGER NOT NULL,
        propval    BLOB NOT NULL,
        PRIMARY KEY (message_id, proptag)
    ) WITHOUT ROWID;

    -- Per-commit property-group indices for conflict-narrowing clients.
    CREATE TABLE message_changes (
        message_id    INTEGER NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
        change_number INTEGER NOT NULL,
        indices       BLOB NOT NULL,
        proptags      BLOB NOT NULL
    );
    CREATE INDEX idx_changes_message ON message_changes(message_id);

    CREATE TABLE recipients (
        recipient_id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id   INTEGER NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE
    );
    CREATE INDEX idx_rcpts_message ON recipients(message_id);

    CREATE TABLE recipients_properties (
        recipient_id INTEGER NOT NULL REFERENCES recipients(recipient_id) ON DELETE CASCADE,
        proptag      INTEGER NOT NULL,
        propval      BLOB NOT NULL,
        PRIMARY KEY (recipient_id, proptag)
    ) WITHOUT ROWID;

    CREATE TABLE attachments (
        attachment_id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id    INTEGER NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE
    );
    CREATE INDEX idx_atts_message ON attachments(message_id);

    CREATE TABLE attachment_properties (
        attachment_id INTEGER NOT NULL REFERENCES attachments(attachment_id) ON DELETE CASCADE,
        proptag       INTEGER NOT NULL,
        propval       BLOB NOT NULL,
        PRIMARY KEY (attachment_id, proptag)
    ) WITHOUT ROWID;

    CREATE TABLE search_scopes (
        folder_id    INTEGER NOT NULL,
        included_fid INTEGER NOT NULL,
        PRIMARY KEY (folder_id, included_fid)
    ) WITHOUT ROWID;

    CREATE TABLE search_result (
        folder_id  INTEGER NOT NULL,
        message_id INTEGER NOT NULL,
        PRIMARY KEY (folder_id, message_id)
    ) WITHOUT ROWID;

    -- Per-user read state, public stores only.
    CREATE TABLE read_states (
        message_id INTEGER NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
        username   TEXT NOT NULL,
        PRIMARY KEY (message_id, username)
    ) WITHOUT ROWID;

    -- Reference counts for content-addressed cid/ files.
    CREATE TABLE cid_usage (
        cid      INTEGER PRIMARY KEY,
        refcount INTEGER NOT NULL
    );

    -- Saved table cursors (store_table_state / restore_table_state).
    CREATE TABLE table_states (
        state_id INTEGER PRIMARY KEY AUTOINCREMENT,
        state    TEXT NOT NULL
    );
";

pub fn get_config_i64(conn: &Connection, id: i64) -> EcResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT config_value FROM configurations WHERE config_id = ?1",
            [id],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn get_config_text(conn: &Connection, id: i64) -> EcResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT config_value FROM configurations WHERE config_id = ?1",
            [id],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn set_config_i64(conn: &Connection, id: i64, value: i64) -> EcResult<()> {
    conn.execute(
        "REPLACE INTO configurations (config_id, config_value) VALUES (?1, ?2)",
        params![id, value],
    )?;
    Ok(())
}

pub fn set_config_text(conn: &Connection, id: i64, value: &str) -> EcResult<()> {
    conn.execute(
        "REPLACE INTO configurations (config_id, config_value) VALUES (?1, ?2)",
        params![id, value],
    )?;
    Ok(())
}

fn seed_folder(
    conn: &Connection,
    folder_id: u64,
    parent: Option<u64>,
    name: &str,
    cn: u64,
) -> EcResult<()> {
    conn.execute(
        "INSERT INTO folders (folder_id, parent_id, change_number) VALUES (?1, ?2, ?3)",
        params![folder_id as i64, parent.map(|p| p as i64), cn as i64],
    )?;
    let now = filetime_now();
    let props: &[(u32, PropValue)] = &[
        (tags::PR_DISPLAY_NAME, PropValue::Unicode(name.to_owned())),
        (tags::PR_FOLDER_TYPE, PropValue::Long(folder_type::GENERIC)),
        (tags::PR_CREATION_TIME, PropValue::SysTime(now)),
        (tags::PR_LAST_MODIFICATION_TIME, PropValue::SysTime(now)),
    ];
    for (tag, value) in props {
        conn.execute(
            "INSERT INTO folder_properties (folder_id, proptag, propval) VALUES (?1, ?2, ?3)",
            params![folder_id as i64, *tag as i64, super::props::encode_stored(value)],
        )?;
    }
    Ok(())
}

/// Create a fresh store directory: `exmdb/exchange.sqlite3` with the
/// well-known folder skeleton, plus the `cid/`, `eml/` and `tmp/` trees.
/// Provisioning normally happens outside the daemon; the rebuild tool and
/// the test suites go through this.
pub fn provision(dir: &Path, owner: &str, private: bool) -> EcResult<()> {
    for sub in ["exmdb", "cid", "eml", "tmp/faststream"] {
        std::fs::create_dir_all(dir.join(sub))?;
    }
    let db_path = dir.join("exmdb/exchange.sqlite3");
    if db_path.exists() {
        return Err(EcError::DuplicateName);
    }
    let conn = Connection::open(&db_path)?;
    conn.execute_batch(super::db::PRAGMAS)?;
    conn.execute_batch(SCHEMA)?;

    let guid = Uuid::new_v4();
    set_config_text(&conn, config_id::MAILBOX_GUID, &guid.to_string())?;
    set_config_i64(&conn, config_id::CURRENT_EID, 0x100)?;
    set_config_i64(&conn, config_id::MAXIMUM_EID, EID_RANGE as i64)?;
    set_config_i64(&conn, config_id::LAST_CHANGE_NUMBER, 0)?;
    set_config_i64(&conn, config_id::LAST_ARTICLE_NUMBER, 0)?;
    set_config_i64(&conn, config_id::LAST_CID, 0)?;
    set_config_i64(&conn, config_id::SCHEMA_VERSION, 1)?;
    set_config_text(&conn, config_id::OWNER, owner)?;
    set_config_i64(&conn, config_id::PRIVATE, i64::from(private))?;
    conn.execute(
        "INSERT INTO allocated_eids (range_begin, range_end, allocate_time, is_system)
         VALUES (1, ?1, ?2, 1)",
        params![EID_RANGE as i64, chrono::Utc::now().timestamp()],
    )?;

    let mut cn = 0u64;
    let mut next_cn = || {
        cn += 1;
        cn
    };
    if private {
        use private_fid::*;
        seed_folder(&conn, ROOT, None, "Root Container", next_cn())?;
        for (fid, name) in [
            (DEFERRED_ACTION, "Deferred Action"),
            (SPOOLER_QUEUE, "Spooler Queue"),
            (SHORTCUTS, "Shortcuts"),
            (FINDER, "Finder"),
            (VIEWS, "Views"),
            (COMMON_VIEWS, "Common Views"),
            (SCHEDULE, "Schedule"),
            (IPMSUBTREE, "Top of Information Store"),
        ] {
            seed_folder(&conn, fid, Some(ROOT), name, next_cn())?;
        }
        for (fid, name) in [
            (SENT_ITEMS, "Sent Items"),
            (DELETED_ITEMS, "Deleted Items"),
            (OUTBOX, "Outbox"),
            (INBOX, "Inbox"),
            (DRAFT, "Drafts"),
            (CALENDAR, "Calendar"),
            (JOURNAL, "Journal"),
            (NOTES, "Notes"),
            (TASKS, "Tasks"),
            (CONTACTS, "Contacts"),
            (JUNK, "Junk Email"),
            (CONFLICTS, "Conflicts"),
            (SYNC_ISSUES, "Sync Issues"),
            (LOCAL_FAILURES, "Local Failures"),
            (SERVER_FAILURES, "Server Failures"),
        ] {
            seed_folder(&conn, fid, Some(IPMSUBTREE), name, next_cn())?;
        }
        conn.execute(
            "INSERT INTO receive_table (class, folder_id, modified_time) VALUES ('', ?1, ?2)",
            params![INBOX as i64, chrono::Utc::now().timestamp()],
        )?;
    } else {
        use public_fid::*;
        seed_folder(&conn, ROOT, None, "Root Container", next_cn())?;
        for (fid, name) in [
            (IPMSUBTREE, "IPM_SUBTREE"),
            (NONIPMSUBTREE, "NON_IPM_SUBTREE"),
            (EFORMSREGISTRY, "EFORMS REGISTRY"),
        ] {
            seed_folder(&conn, fid, Some(ROOT), name, next_cn())?;
        }
    }
    set_config_i64(&conn, config_id::LAST_CHANGE_NUMBER, cn as i64)?;
    Ok(())
}

/// `PRAGMA integrity_check` must report `ok` for the store to be served.
pub fn integrity_check(conn: &Connection) -> EcResult<bool> {
    let result: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
    Ok(result == "ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_creates_wellknown_tree() {
        let dir = tempfile::tempdir().unwrap();
        provision(dir.path(), "user@example.com", true).unwrap();
        let conn = Connection::open(dir.path().join("exmdb/exchange.sqlite3")).unwrap();
        assert!(integrity_check(&conn).unwrap());

        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM folders", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 24);
        let parent: i64 = conn
            .query_row(
                "SELECT parent_id FROM folders WHERE folder_id = ?1",
                [private_fid::INBOX as i64],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(parent as u64, private_fid::IPMSUBTREE);
        assert!(dir.path().join("cid").is_dir());
        assert!(dir.path().join("eml").is_dir());
    }

    #[test]
    fn provision_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        provision(dir.path(), "u", true).unwrap();
        assert_eq!(
            provision(dir.path(), "u", true).unwrap_err(),
            EcError::DuplicateName
        );
    }
}
