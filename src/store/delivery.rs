//! Local delivery: the LDA hands over a raw RFC822 message; the store
//! parses the envelope headers into properties, files the raw rendition
//! under `eml/`, routes by message class and fires the new-mail path.

use mailparse::MailHeaderMap;
use tracing::{debug, warn};

use crate::types::propval::{msgflags, tags, PropValue};
use crate::types::{eid_gc, unix_to_filetime, EcError, EcResult};

use super::notify::DbNotify;
use super::{MessageContent, Store};

/// Delivery outcome surfaced to the LDA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverResult {
    Delivered { folder_id: u64, message_id: u64 },
    /// Mailbox over quota or message too large.
    Rejected,
}

impl Store {
    /// Deliver one message to this mailbox. `from` is the envelope sender,
    /// `rcpt` the envelope recipient the routing ran for.
    pub fn deliver_message(
        &self,
        from: &str,
        rcpt: &str,
        raw: &[u8],
        max_message_size: u32,
    ) -> EcResult<DeliverResult> {
        if max_message_size != 0 && raw.len() > max_message_size as usize {
            warn!("message for {rcpt} exceeds max_message ({} bytes)", raw.len());
            return Ok(DeliverResult::Rejected);
        }
        let parsed = mailparse::parse_mail(raw).map_err(|e| {
            warn!("unparsable delivery for {rcpt}: {e}");
            EcError::InvalidParam
        })?;

        let mut content = MessageContent::default();
        content
            .props
            .set(tags::PR_MESSAGE_CLASS, PropValue::Unicode("IPM.Note".into()));
        let headers = &parsed.headers;
        if let Some(subject) = headers.get_first_value("Subject") {
            content.props.set(tags::PR_SUBJECT, PropValue::Unicode(subject));
        }
        if let Some(message_id) = headers.get_first_value("Message-ID") {
            content
                .props
                .set(tags::PR_INTERNET_MESSAGE_ID, PropValue::Unicode(message_id));
        }
        if let Some(from_hdr) = headers.get_first_value("From") {
            content.props.set(tags::PR_SENDER_NAME, PropValue::Unicode(from_hdr));
        }
        content
            .props
            .set(tags::PR_SENDER_EMAIL_ADDRESS, PropValue::Unicode(from.to_owned()));
        if let Some(to_hdr) = headers.get_first_value("To") {
            content.props.set(tags::PR_DISPLAY_TO, PropValue::Unicode(to_hdr));
        }
        let delivery_time = headers
            .get_first_value("Date")
            .and_then(|d| mailparse::dateparse(&d).ok())
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        content.props.set(
            tags::PR_MESSAGE_DELIVERY_TIME,
            PropValue::SysTime(unix_to_filetime(delivery_time)),
        );
        if let Ok(body) = parsed.get_body() {
            content.props.set(tags::PR_BODY, PropValue::Unicode(body));
        }
        content
            .props
            .set(tags::PR_MESSAGE_FLAGS, PropValue::Long(msgflags::UNMODIFIED));

        let (folder_id, _class) = self.get_folder_by_class("IPM.Note")?;
        let mid = self.write_message(folder_id, &content, false)?;

        // raw rendition for the IMAP/POP3 retrieval paths
        let eml_path = self.dir().join("eml").join(eid_gc(mid).to_string());
        if let Err(e) = std::fs::write(&eml_path, raw) {
            // absence is reconstructable from properties, so deliver anyway
            warn!("could not write {}: {e}", eml_path.display());
        }

        debug!("delivered message {mid:#x} from {from} into folder {folder_id:#x}");
        self.rule_new_message(rcpt, folder_id, mid)?;

        // the rule pass may have moved or dropped it
        let conn = self.reader()?;
        match super::messages::message_row(&conn, mid)? {
            Some(row) if !row.is_deleted => {
                self.emit_notifies(vec![DbNotify::NewMail {
                    folder_id: row.parent_fid,
                    message_id: mid,
                    message_flags: 0,
                    message_class: "IPM.Note".into(),
                }]);
                Ok(DeliverResult::Delivered { folder_id: row.parent_fid, message_id: mid })
            }
            _ => Ok(DeliverResult::Delivered { folder_id, message_id: mid }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::types::private_fid;

    const RAW: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: user@example.com\r\n\
Subject: greetings\r\n\
Message-ID: <m1@example.com>\r\n\
Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
\r\n\
Hello there.\r\n";

    #[test]
    fn delivers_into_inbox_with_eml() {
        let (_tmp, _engine, store) = temp_store();
        let result = store
            .deliver_message("alice@example.com", "user@example.com", RAW, 0)
            .unwrap();
        let DeliverResult::Delivered { folder_id, message_id } = result else {
            panic!("rejected");
        };
        assert_eq!(folder_id, private_fid::INBOX);

        let got = store
            .get_message_properties(message_id, &[tags::PR_SUBJECT, tags::PR_BODY])
            .unwrap();
        assert_eq!(got.get(tags::PR_SUBJECT).and_then(|v| v.as_str()), Some("greetings"));
        assert!(got.get(tags::PR_BODY).and_then(|v| v.as_str()).unwrap().contains("Hello"));
        assert!(store
            .dir()
            .join("eml")
            .join(eid_gc(message_id).to_string())
            .is_file());
    }

    #[test]
    fn oversized_message_rejected() {
        let (_tmp, _engine, store) = temp_store();
        let result = store
            .deliver_message("a@example.com", "user@example.com", RAW, 16)
            .unwrap();
        assert_eq!(result, DeliverResult::Rejected);
    }
}
