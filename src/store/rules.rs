//! Folder rules: storage, the rule table, and the subset of actions the
//! delivery path executes (`rule_new_message`).

use rusqlite::{params, Connection, OptionalExtension};

use crate::codec::{ExtPull, ExtPush};
use crate::types::propval::{tags, PropList, PropValue};
use crate::types::restriction::Restriction;
use crate::types::{EcError, EcResult};

use super::messages::{copy_message_row, delete_message_row, message_row};
use super::notify::DbNotify;
use super::Store;

pub const PR_MEMBER_ID: u32 = 0x6671_0014;
pub const PR_MEMBER_NAME: u32 = 0x6672_001F;
pub const PR_MEMBER_RIGHTS: u32 = 0x6673_0003;

pub const PR_RULE_ID: u32 = 0x6674_0014;
pub const PR_RULE_SEQUENCE: u32 = 0x6676_0003;
pub const PR_RULE_STATE: u32 = 0x6677_0003;
pub const PR_RULE_NAME: u32 = 0x6682_001F;
pub const PR_RULE_PROVIDER: u32 = 0x6681_001F;
pub const PR_RULE_CONDITION: u32 = 0x6679_00FD;
pub const PR_RULE_ACTIONS: u32 = 0x6680_00FE;

/// `PR_RULE_STATE` bit: the rule participates in evaluation.
pub const RULE_STATE_ENABLED: u32 = 0x01;

/// The actions the store executes itself. Anything beyond these is kept
/// verbatim for the owning client and skipped at delivery time.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleAction {
    MoveTo { folder_id: u64 },
    CopyTo { folder_id: u64 },
    Delete,
    MarkAsRead,
    /// Unexecuted opaque action, preserved for round-tripping.
    Other { op: u8, data: Vec<u8> },
}

pub fn encode_actions(actions: &[RuleAction]) -> Vec<u8> {
    let mut push = ExtPush::new();
    push.u16(actions.len() as u16);
    for a in actions {
        match a {
            RuleAction::MoveTo { folder_id } => {
                push.u8(0x01);
                push.u64(*folder_id);
            }
            RuleAction::CopyTo { folder_id } => {
                push.u8(0x02);
                push.u64(*folder_id);
            }
            RuleAction::Delete => push.u8(0x03),
            RuleAction::MarkAsRead => push.u8(0x04),
            RuleAction::Other { op, data } => {
                push.u8(*op);
                push.bin(data);
            }
        }
    }
    push.into_bytes()
}

pub fn decode_actions(bytes: &[u8]) -> EcResult<Vec<RuleAction>> {
    let mut pull = ExtPull::new(bytes);
    let n = pull.u16()? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let op = pull.u8()?;
        out.push(match op {
            0x01 => RuleAction::MoveTo { folder_id: pull.u64()? },
            0x02 => RuleAction::CopyTo { folder_id: pull.u64()? },
            0x03 => RuleAction::Delete,
            0x04 => RuleAction::MarkAsRead,
            other => RuleAction::Other { op: other, data: pull.bin()? },
        });
    }
    Ok(out)
}

/// Batched rule edit, mirroring the permission variant.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOp {
    Add {
        name: String,
        provider: String,
        sequence: u32,
        state: u32,
        condition: Option<Restriction>,
        actions: Vec<RuleAction>,
    },
    Modify {
        rule_id: u64,
        sequence: Option<u32>,
        state: Option<u32>,
        condition: Option<Restriction>,
        actions: Option<Vec<RuleAction>>,
    },
    Remove {
        rule_id: u64,
    },
}

fn encode_condition(res: &Restriction) -> Vec<u8> {
    let mut push = ExtPush::new();
    push.restriction(res);
    push.into_bytes()
}

impl Store {
    pub(crate) fn rule_ids(&self, folder_id: u64) -> EcResult<Vec<u64>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT rule_id FROM rules WHERE folder_id = ?1 ORDER BY sequence, rule_id",
        )?;
        let ids = stmt
            .query_map([folder_id as i64], |r| r.get::<_, i64>(0).map(|v| v as u64))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub(crate) fn rule_row_props(&self, rule_id: u64, want: &[u32]) -> EcResult<PropList> {
        let conn = self.reader()?;
        let row: Option<(i64, i64, Option<String>, Option<String>, Option<Vec<u8>>, Option<Vec<u8>>)> =
            conn.query_row(
                "SELECT sequence, state, name, provider, condition, actions
                 FROM rules WHERE rule_id = ?1",
                [rule_id as i64],
                |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
                },
            )
            .optional()?;
        let (sequence, state, name, provider, condition, actions) =
            row.ok_or(EcError::NotFound)?;
        let mut out = PropList::new();
        for &tag in want {
            match tag {
                PR_RULE_ID => out.set(tag, PropValue::I8(rule_id)),
                PR_RULE_SEQUENCE => out.set(tag, PropValue::Long(sequence as u32)),
                PR_RULE_STATE => out.set(tag, PropValue::Long(state as u32)),
                PR_RULE_NAME => {
                    if let Some(n) = &name {
                        out.set(tag, PropValue::Unicode(n.clone()));
                    }
                }
                PR_RULE_PROVIDER => {
                    if let Some(p) = &provider {
                        out.set(tag, PropValue::Unicode(p.clone()));
                    }
                }
                PR_RULE_CONDITION => {
                    if let Some(c) = &condition {
                        out.set(tag, PropValue::Binary(c.clone()));
                    }
                }
                PR_RULE_ACTIONS => {
                    if let Some(a) = &actions {
                        out.set(tag, PropValue::Binary(a.clone()));
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn empty_folder_rule(&self, folder_id: u64) -> EcResult<()> {
        self.with_write(|txn, _| {
            txn.conn().execute("DELETE FROM rules WHERE folder_id = ?1", [folder_id as i64])?;
            Ok(())
        })
    }

    pub fn update_folder_rule(&self, folder_id: u64, ops: &[RuleOp]) -> EcResult<()> {
        self.with_write(|txn, _| {
            let conn = txn.conn();
            for op in ops {
                match op {
                    RuleOp::Add { name, provider, sequence, state, condition, actions } => {
                        conn.execute(
                            "INSERT INTO rules
                                (folder_id, sequence, state, name, provider, condition, actions)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                            params![
                                folder_id as i64,
                                i64::from(*sequence),
                                i64::from(*state),
                                name,
                                provider,
                                condition.as_ref().map(encode_condition),
                                encode_actions(actions),
                            ],
                        )?;
                    }
                    RuleOp::Modify { rule_id, sequence, state, condition, actions } => {
                        if message_rule_exists(conn, folder_id, *rule_id)? {
                            if let Some(seq) = sequence {
                                conn.execute(
                                    "UPDATE rules SET sequence = ?1 WHERE rule_id = ?2",
                                    params![i64::from(*seq), *rule_id as i64],
                                )?;
                            }
                            if let Some(st) = state {
                                conn.execute(
                                    "UPDATE rules SET state = ?1 WHERE rule_id = ?2",
                                    params![i64::from(*st), *rule_id as i64],
                                )?;
                            }
                            if let Some(c) = condition {
                                conn.execute(
                                    "UPDATE rules SET condition = ?1 WHERE rule_id = ?2",
                                    params![encode_condition(c), *rule_id as i64],
                                )?;
                            }
                            if let Some(a) = actions {
                                conn.execute(
                                    "UPDATE rules SET actions = ?1 WHERE rule_id = ?2",
                                    params![encode_actions(a), *rule_id as i64],
                                )?;
                            }
                        } else {
                            return Err(EcError::NotFound);
                        }
                    }
                    RuleOp::Remove { rule_id } => {
                        conn.execute(
                            "DELETE FROM rules WHERE rule_id = ?1 AND folder_id = ?2",
                            params![*rule_id as i64, folder_id as i64],
                        )?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Run the folder's enabled rules against a freshly delivered message.
    /// Executes move/copy/delete/mark-read; other action kinds are logged
    /// and left to the owning client.
    pub fn rule_new_message(&self, username: &str, folder_id: u64, mid: u64) -> EcResult<()> {
        let rules: Vec<(u64, Option<Vec<u8>>, Option<Vec<u8>>)> = {
            let conn = self.reader()?;
            let mut stmt = conn.prepare(
                "SELECT rule_id, condition, actions FROM rules
                 WHERE folder_id = ?1 AND (state & ?2) != 0
                 ORDER BY sequence, rule_id",
            )?;
            let rows = stmt.query_map(params![folder_id as i64, i64::from(RULE_STATE_ENABLED)], |r| {
                Ok((r.get::<_, i64>(0)? as u64, r.get(1)?, r.get(2)?))
            })?
            .collect::<Result<_, _>>()?;
            rows
        };
        if rules.is_empty() {
            return Ok(());
        }
        let msg_props = {
            let conn = self.reader()?;
            super::messages::read_message_content(self, &conn, mid)?.props
        };
        for (rule_id, condition, actions) in rules {
            if let Some(cblob) = &condition {
                let res = ExtPull::new(cblob).restriction()?;
                if !res.eval(&msg_props) {
                    continue;
                }
            }
            let Some(ablob) = &actions else { continue };
            for action in decode_actions(ablob)? {
                match action {
                    RuleAction::MoveTo { folder_id: dst } => {
                        self.with_write(|txn, ctx| {
                            let conn = txn.conn();
                            if message_row(conn, mid)?.is_none() {
                                return Ok(());
                            }
                            let new_mid = copy_message_row(self, conn, mid, dst, ctx)?;
                            delete_message_row(self, conn, mid, true, ctx)?;
                            ctx.notify(DbNotify::MessageMoved {
                                folder_id: dst,
                                message_id: new_mid,
                                old_folder_id: folder_id,
                                old_message_id: mid,
                            });
                            Ok(())
                        })?;
                        // the message left this folder; later rules are moot
                        return Ok(());
                    }
                    RuleAction::CopyTo { folder_id: dst } => {
                        self.with_write(|txn, ctx| {
                            let new_mid = copy_message_row(self, txn.conn(), mid, dst, ctx)?;
                            ctx.notify(DbNotify::MessageCopied {
                                folder_id: dst,
                                message_id: new_mid,
                            });
                            Ok(())
                        })?;
                    }
                    RuleAction::Delete => {
                        self.with_write(|txn, ctx| {
                            delete_message_row(self, txn.conn(), mid, true, ctx)?;
                            ctx.notify(DbNotify::MessageDeleted { folder_id, message_id: mid });
                            Ok(())
                        })?;
                        return Ok(());
                    }
                    RuleAction::MarkAsRead => {
                        self.set_message_read_state(username, mid, true)?;
                    }
                    RuleAction::Other { op, .. } => {
                        tracing::debug!("rule {rule_id}: leaving action op {op:#x} to the client");
                    }
                }
            }
        }
        Ok(())
    }
}

fn message_rule_exists(conn: &Connection, folder_id: u64, rule_id: u64) -> EcResult<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM rules WHERE rule_id = ?1 AND folder_id = ?2",
        params![rule_id as i64, folder_id as i64],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

pub(crate) fn rule_table_proptags() -> Vec<u32> {
    vec![
        PR_RULE_ID,
        PR_RULE_SEQUENCE,
        PR_RULE_STATE,
        PR_RULE_NAME,
        PR_RULE_PROVIDER,
        PR_RULE_CONDITION,
        PR_RULE_ACTIONS,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::store::MessageContent;
    use crate::types::private_fid;
    use crate::types::restriction::FL_SUBSTRING;

    #[test]
    fn actions_round_trip() {
        let actions = vec![
            RuleAction::MoveTo { folder_id: 0x123 },
            RuleAction::MarkAsRead,
            RuleAction::Other { op: 0x20, data: vec![1, 2, 3] },
        ];
        assert_eq!(decode_actions(&encode_actions(&actions)).unwrap(), actions);
    }

    #[test]
    fn move_rule_fires_on_delivery_match() {
        let (_tmp, _engine, store) = temp_store();
        store
            .update_folder_rule(
                private_fid::INBOX,
                &[RuleOp::Add {
                    name: "file invoices".into(),
                    provider: "RuleOrganizer".into(),
                    sequence: 1,
                    state: RULE_STATE_ENABLED,
                    condition: Some(Restriction::Content {
                        fuzzy_level: FL_SUBSTRING,
                        proptag: tags::PR_SUBJECT,
                        propval: PropValue::Unicode("invoice".into()),
                    }),
                    actions: vec![RuleAction::MoveTo { folder_id: private_fid::JUNK }],
                }],
            )
            .unwrap();

        let mut content = MessageContent::default();
        content.props.set(tags::PR_SUBJECT, PropValue::Unicode("your invoice".into()));
        let mid = store.write_message(private_fid::INBOX, &content, false).unwrap();
        store.rule_new_message("user@example.com", private_fid::INBOX, mid).unwrap();

        assert!(!store.check_message(private_fid::INBOX, mid).unwrap());
        assert_eq!(store.sum_content(private_fid::JUNK, false, false).unwrap(), 1);
    }

    #[test]
    fn disabled_rule_is_skipped() {
        let (_tmp, _engine, store) = temp_store();
        store
            .update_folder_rule(
                private_fid::INBOX,
                &[RuleOp::Add {
                    name: "off".into(),
                    provider: "RuleOrganizer".into(),
                    sequence: 1,
                    state: 0,
                    condition: None,
                    actions: vec![RuleAction::Delete],
                }],
            )
            .unwrap();
        let mut content = MessageContent::default();
        content.props.set(tags::PR_SUBJECT, PropValue::Unicode("stay".into()));
        let mid = store.write_message(private_fid::INBOX, &content, false).unwrap();
        store.rule_new_message("user@example.com", private_fid::INBOX, mid).unwrap();
        assert!(store.check_message(private_fid::INBOX, mid).unwrap());
    }
}
