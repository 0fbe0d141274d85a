//! Property-table access shared by store, folder, message, recipient and
//! attachment property bags.
//!
//! Values are stored as a one-byte discriminator plus payload: `0` inline
//! (codec-encoded value) or `1` a content-id reference into `cid/`. Only
//! the message and attachment bags externalize large values.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::codec::{decode_propvalue, encode_propvalue};
use crate::types::propval::{
    change_tag_type, tag_type, tags, PropList, PropValue, TaggedPropval, PT_BINARY,
    PT_OBJECT, PT_STRING8, PT_UNICODE,
};
use crate::types::{EcError, EcResult};

use super::cid;
use super::WriteCtx;

/// Values at or above this many bytes move out to `cid/`.
pub const CID_THRESHOLD: usize = 4096;

const STORED_INLINE: u8 = 0;
const STORED_CIDREF: u8 = 1;

/// Key of a property bag: `None` is the store bag (single-row table).
pub type BagKey<'a> = Option<(&'a str, i64)>;

fn where_clause(key: BagKey) -> String {
    match key {
        None => String::new(),
        Some((col, _)) => format!(" WHERE {col} = ?1"),
    }
}

pub fn encode_stored(value: &PropValue) -> Vec<u8> {
    let mut out = vec![STORED_INLINE];
    out.extend_from_slice(&encode_propvalue(value));
    out
}

fn encode_cid_ref(cid: u64) -> Vec<u8> {
    let mut out = vec![STORED_CIDREF];
    out.extend_from_slice(&cid.to_le_bytes());
    out
}

pub fn stored_cid_ref(blob: &[u8]) -> Option<u64> {
    if blob.first() == Some(&STORED_CIDREF) && blob.len() == 9 {
        Some(u64::from_le_bytes(blob[1..9].try_into().ok()?))
    } else {
        None
    }
}

pub fn decode_stored(dir: &Path, tag: u32, blob: &[u8]) -> EcResult<PropValue> {
    match blob.first() {
        Some(&STORED_INLINE) => decode_propvalue(tag_type(tag), &blob[1..]),
        Some(&STORED_CIDREF) => {
            let cid = stored_cid_ref(blob).ok_or(EcError::CorruptData)?;
            let bytes = cid::read(dir, cid)?;
            Ok(match tag_type(tag) {
                PT_OBJECT => PropValue::Object(bytes),
                _ => PropValue::Binary(bytes),
            })
        }
        _ => Err(EcError::CorruptData),
    }
}

pub fn all_proptags(conn: &Connection, table: &str, key: BagKey) -> EcResult<Vec<u32>> {
    let sql = format!("SELECT proptag FROM {table}{}", where_clause(key));
    let mut stmt = conn.prepare(&sql)?;
    let map = |r: &rusqlite::Row<'_>| r.get::<_, i64>(0).map(|t| t as u32);
    let rows = match key {
        None => stmt.query_map([], map)?,
        Some((_, id)) => stmt.query_map([id], map)?,
    };
    rows.collect::<Result<Vec<_>, _>>().map_err(EcError::from)
}

fn load_raw(conn: &Connection, table: &str, key: BagKey) -> EcResult<Vec<(u32, Vec<u8>)>> {
    let sql = format!("SELECT proptag, propval FROM {table}{}", where_clause(key));
    let mut stmt = conn.prepare(&sql)?;
    let map = |r: &rusqlite::Row<'_>| {
        Ok((r.get::<_, i64>(0)? as u32, r.get::<_, Vec<u8>>(1)?))
    };
    let rows = match key {
        None => stmt.query_map([], map)?,
        Some((_, id)) => stmt.query_map([id], map)?,
    };
    rows.collect::<Result<Vec<_>, _>>().map_err(EcError::from)
}

/// Load the whole bag. cid references resolve through `dir` when given;
/// without it they come back as empty binaries (tag listing paths).
pub fn read_all_props(
    conn: &Connection,
    dir: &Path,
    table: &str,
    key: BagKey,
) -> EcResult<PropList> {
    let mut out = PropList::new();
    for (tag, blob) in load_raw(conn, table, key)? {
        out.set(tag, decode_stored(dir, tag, &blob)?);
    }
    Ok(out)
}

/// Fetch selected tags. A PT_UNICODE/PT_STRING8 request matches a value
/// stored at the other width.
pub fn read_props(
    conn: &Connection,
    dir: &Path,
    table: &str,
    key: BagKey,
    want: &[u32],
) -> EcResult<PropList> {
    let all = read_all_props(conn, dir, table, key)?;
    let mut out = PropList::new();
    for &tag in want {
        if let Some(v) = all.get(tag) {
            out.set(tag, v.clone());
            continue;
        }
        let ty = tag_type(tag);
        if ty == PT_UNICODE || ty == PT_STRING8 {
            let other = if ty == PT_UNICODE { PT_STRING8 } else { PT_UNICODE };
            if let Some(v) = all.get(change_tag_type(tag, other)) {
                if let Some(s) = v.as_str() {
                    out.set(
                        tag,
                        if ty == PT_UNICODE {
                            PropValue::Unicode(s.to_owned())
                        } else {
                            PropValue::String8(s.to_owned())
                        },
                    );
                }
            }
        }
    }
    Ok(out)
}

fn upsert(conn: &Connection, table: &str, key: BagKey, tag: u32, blob: &[u8]) -> EcResult<()> {
    match key {
        None => conn.execute(
            &format!("REPLACE INTO {table} (proptag, propval) VALUES (?1, ?2)"),
            params![tag as i64, blob],
        )?,
        Some((col, id)) => conn.execute(
            &format!("REPLACE INTO {table} ({col}, proptag, propval) VALUES (?1, ?2, ?3)"),
            params![id, tag as i64, blob],
        )?,
    };
    Ok(())
}

fn raw_value(conn: &Connection, table: &str, key: BagKey, tag: u32) -> EcResult<Option<Vec<u8>>> {
    let sql = match key {
        None => format!("SELECT propval FROM {table} WHERE proptag = ?1"),
        Some((col, _)) => {
            format!("SELECT propval FROM {table} WHERE {col} = ?1 AND proptag = ?2")
        }
    };
    let out = match key {
        None => conn
            .query_row(&sql, params![tag as i64], |r| r.get::<_, Vec<u8>>(0))
            .optional()?,
        Some((_, id)) => conn
            .query_row(&sql, params![id, tag as i64], |r| r.get::<_, Vec<u8>>(0))
            .optional()?,
    };
    Ok(out)
}

/// Write one property inline (bags without cid externalization).
pub fn write_prop(conn: &Connection, table: &str, key: BagKey, tp: &TaggedPropval) -> EcResult<()> {
    upsert(conn, table, key, tp.tag, &encode_stored(&tp.value))
}

/// Write one property into a cid-capable bag: large binaries move out to a
/// content file, and a replaced cid reference loses one refcount.
pub fn write_prop_cid(
    conn: &Connection,
    dir: &Path,
    table: &str,
    key: BagKey,
    tp: &TaggedPropval,
    ctx: &mut WriteCtx,
) -> EcResult<()> {
    if let Some(old) = raw_value(conn, table, key, tp.tag)? {
        if let Some(old_cid) = stored_cid_ref(&old) {
            cid::decref(conn, dir, old_cid, ctx)?;
        }
    }
    let externalize = matches!(tag_type(tp.tag), PT_BINARY | PT_OBJECT)
        && tp.value.as_bytes().is_some_and(|b| b.len() >= CID_THRESHOLD);
    if externalize {
        let bytes = tp.value.as_bytes().unwrap_or_default();
        let new_cid = cid::create(conn, dir, bytes, ctx)?;
        upsert(conn, table, key, tp.tag, &encode_cid_ref(new_cid))
    } else {
        upsert(conn, table, key, tp.tag, &encode_stored(&tp.value))
    }
}

pub fn remove_prop(conn: &Connection, table: &str, key: BagKey, tag: u32) -> EcResult<()> {
    let sql = match key {
        None => format!("DELETE FROM {table} WHERE proptag = ?1"),
        Some((col, _)) => format!("DELETE FROM {table} WHERE {col} = ?1 AND proptag = ?2"),
    };
    match key {
        None => conn.execute(&sql, params![tag as i64])?,
        Some((_, id)) => conn.execute(&sql, params![id, tag as i64])?,
    };
    Ok(())
}

pub fn remove_prop_cid(
    conn: &Connection,
    dir: &Path,
    table: &str,
    key: BagKey,
    tag: u32,
    ctx: &mut WriteCtx,
) -> EcResult<()> {
    if let Some(old) = raw_value(conn, table, key, tag)? {
        if let Some(old_cid) = stored_cid_ref(&old) {
            cid::decref(conn, dir, old_cid, ctx)?;
        }
    }
    remove_prop(conn, table, key, tag)
}

/// Release every cid reference held by one bag row, ahead of deleting it.
pub fn release_cids(
    conn: &Connection,
    dir: &Path,
    table: &str,
    key: BagKey,
    ctx: &mut WriteCtx,
) -> EcResult<()> {
    for (_tag, blob) in load_raw(conn, table, key)? {
        if let Some(cid) = stored_cid_ref(&blob) {
            cid::decref(conn, dir, cid, ctx)?;
        }
    }
    Ok(())
}

/// Store tags synthesized at read time; writes to them are rejected.
pub fn is_computed_store_tag(tag: u32) -> bool {
    matches!(tag, tags::PR_STORE_RECORD_KEY | tags::PR_MESSAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;

    #[test]
    fn inline_write_read_remove() {
        let (_tmp, _engine, store) = temp_store();
        store
            .with_write(|txn, _| {
                write_prop(
                    txn.conn(),
                    "store_properties",
                    None,
                    &TaggedPropval::new(tags::PR_COMMENT, PropValue::Unicode("hi".into())),
                )
            })
            .unwrap();
        let conn = store.reader().unwrap();
        let got = read_props(&conn, store.dir(), "store_properties", None, &[tags::PR_COMMENT])
            .unwrap();
        assert_eq!(got.get(tags::PR_COMMENT).and_then(|v| v.as_str()), Some("hi"));
        drop(conn);

        store
            .with_write(|txn, _| remove_prop(txn.conn(), "store_properties", None, tags::PR_COMMENT))
            .unwrap();
        let conn = store.reader().unwrap();
        assert!(all_proptags(&conn, "store_properties", None).unwrap().is_empty());
    }

    #[test]
    fn string_width_fallback() {
        let (_tmp, _engine, store) = temp_store();
        store
            .with_write(|txn, _| {
                write_prop(
                    txn.conn(),
                    "store_properties",
                    None,
                    &TaggedPropval::new(tags::PR_COMMENT, PropValue::Unicode("w".into())),
                )
            })
            .unwrap();
        let conn = store.reader().unwrap();
        let narrow = change_tag_type(tags::PR_COMMENT, PT_STRING8);
        let got =
            read_props(&conn, store.dir(), "store_properties", None, &[narrow]).unwrap();
        assert_eq!(got.get(narrow).and_then(|v| v.as_str()), Some("w"));
    }
}
