//! Named-property mapping.
//!
//! A (GUID, kind, LID-or-name) triple maps to a 16-bit propid starting at
//! 0x8000. Mappings are append-only for the lifetime of the store; ids are
//! never recycled, and an exhausted id space surfaces as
//! `ecNPQuotaExceeded`. A read-mostly cache fronts the table.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::types::propval::{PropName, NAMED_PROPID_BEGIN};
use crate::types::{EcError, EcResult};

use super::Store;

#[derive(Default)]
pub struct NamedCache {
    by_name: HashMap<PropName, u16>,
    by_id: HashMap<u16, PropName>,
}

impl NamedCache {
    fn insert(&mut self, name: PropName, id: u16) {
        self.by_name.insert(name.clone(), id);
        self.by_id.insert(id, name);
    }
}

fn name_fields(name: &PropName) -> (i64, String, Option<i64>, Option<&str>) {
    match name {
        PropName::Lid { guid, lid } => (0, guid.to_string(), Some(i64::from(*lid)), None),
        PropName::Name { guid, name } => (1, guid.to_string(), None, Some(name.as_str())),
    }
}

fn lookup(conn: &Connection, name: &PropName) -> EcResult<Option<u16>> {
    let (kind, guid, lid, text) = name_fields(name);
    let id: Option<i64> = conn
        .query_row(
            "SELECT propid FROM named_properties
             WHERE guid = ?1 AND kind = ?2 AND lid IS ?3 AND name IS ?4",
            params![guid, kind, lid, text],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id.map(|i| i as u16))
}

fn next_free_id(conn: &Connection) -> EcResult<u16> {
    let max: Option<i64> =
        conn.query_row("SELECT MAX(propid) FROM named_properties", [], |r| r.get(0))?;
    let next = match max {
        None => NAMED_PROPID_BEGIN,
        Some(m) if (m as u32) < 0xFFFF => m as u16 + 1,
        Some(_) => return Err(EcError::NpQuotaExceeded),
    };
    Ok(next)
}

impl Store {
    /// Map names to propids; with `create`, unmapped names get the next
    /// free id. A failed mapping reports id 0 in that slot.
    pub fn get_named_propids(&self, names: &[PropName], create: bool) -> EcResult<Vec<u16>> {
        let mut out = vec![0u16; names.len()];
        let mut missing = Vec::new();
        {
            let cache = self.named_cache.read().unwrap_or_else(|e| e.into_inner());
            for (i, name) in names.iter().enumerate() {
                match cache.by_name.get(name) {
                    Some(&id) => out[i] = id,
                    None => missing.push(i),
                }
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }

        if !create {
            let conn = self.reader()?;
            let mut cache = self.named_cache.write().unwrap_or_else(|e| e.into_inner());
            for &i in &missing {
                if let Some(id) = lookup(&conn, &names[i])? {
                    cache.insert(names[i].clone(), id);
                    out[i] = id;
                }
            }
            return Ok(out);
        }

        self.with_write(|txn, _ctx| {
            let conn = txn.conn();
            let mut cache = self.named_cache.write().unwrap_or_else(|e| e.into_inner());
            for &i in &missing {
                if let Some(id) = lookup(conn, &names[i])? {
                    cache.insert(names[i].clone(), id);
                    out[i] = id;
                    continue;
                }
                let id = next_free_id(conn)?;
                let (kind, guid, lid, text) = name_fields(&names[i]);
                conn.execute(
                    "INSERT INTO named_properties (propid, kind, guid, lid, name)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![i64::from(id), kind, guid, lid, text],
                )?;
                cache.insert(names[i].clone(), id);
                out[i] = id;
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Inverse mapping; unmapped ids yield `None` in their slot.
    pub fn get_named_propnames(&self, ids: &[u16]) -> EcResult<Vec<Option<PropName>>> {
        let mut out = vec![None; ids.len()];
        let mut missing = Vec::new();
        {
            let cache = self.named_cache.read().unwrap_or_else(|e| e.into_inner());
            for (i, id) in ids.iter().enumerate() {
                match cache.by_id.get(id) {
                    Some(name) => out[i] = Some(name.clone()),
                    None => missing.push(i),
                }
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }
        let conn = self.reader()?;
        let mut cache = self.named_cache.write().unwrap_or_else(|e| e.into_inner());
        for &i in &missing {
            let row: Option<(i64, String, Option<i64>, Option<String>)> = conn
                .query_row(
                    "SELECT kind, guid, lid, name FROM named_properties WHERE propid = ?1",
                    [i64::from(ids[i])],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )
                .optional()?;
            let Some((kind, guid, lid, text)) = row else { continue };
            let guid = Uuid::parse_str(&guid).map_err(|_| EcError::CorruptData)?;
            let name = match (kind, lid, text) {
                (0, Some(lid), _) => PropName::Lid { guid, lid: lid as u32 },
                (1, _, Some(name)) => PropName::Name { guid, name },
                _ => return Err(EcError::CorruptData),
            };
            cache.insert(name.clone(), ids[i]);
            out[i] = Some(name);
        }
        Ok(out)
    }

    /// Every mapping in the store, propid-ordered.
    pub fn get_all_named_propids(&self) -> EcResult<Vec<u16>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT propid FROM named_properties ORDER BY propid")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, i64>(0).map(|i| i as u16))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;

    #[test]
    fn create_is_idempotent() {
        let (_tmp, _engine, store) = temp_store();
        let name = PropName::Name { guid: Uuid::new_v4(), name: "Keywords".into() };
        let ids = store.get_named_propids(&[name.clone()], true).unwrap();
        assert!(ids[0] >= NAMED_PROPID_BEGIN);
        let again = store.get_named_propids(&[name.clone()], true).unwrap();
        assert_eq!(ids, again);

        let names = store.get_named_propnames(&[ids[0]]).unwrap();
        assert_eq!(names[0].as_ref(), Some(&name));
    }

    #[test]
    fn lookup_without_create_leaves_zero() {
        let (_tmp, _engine, store) = temp_store();
        let name = PropName::Lid { guid: Uuid::new_v4(), lid: 0x8205 };
        let ids = store.get_named_propids(&[name], false).unwrap();
        assert_eq!(ids[0], 0);
    }

    #[test]
    fn ids_are_sequential() {
        let (_tmp, _engine, store) = temp_store();
        let guid = Uuid::new_v4();
        let a = store
            .get_named_propids(&[PropName::Lid { guid, lid: 1 }], true)
            .unwrap()[0];
        let b = store
            .get_named_propids(&[PropName::Lid { guid, lid: 2 }], true)
            .unwrap()[0];
        assert_eq!(b, a + 1);
        assert_eq!(store.get_all_named_propids().unwrap(), vec![a, b]);
    }
}
