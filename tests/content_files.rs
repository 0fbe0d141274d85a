//! Content-addressed files end to end: large property values move out to
//! `cid/`, copies share references, deletion drops them, and delivery
//! leaves an `eml/` rendition behind.

use oxmdb::store::schema;
use oxmdb::store::{Engine, Limits, MessageContent};
use oxmdb::types::propval::{tags, PropValue};
use oxmdb::types::private_fid;

fn temp_store() -> (tempfile::TempDir, std::sync::Arc<oxmdb::store::Store>) {
    let tmp = tempfile::tempdir().unwrap();
    schema::provision(tmp.path(), "user@example.com", true).unwrap();
    let engine = Engine::new(Limits::default());
    let store = engine.open_store(tmp.path()).unwrap();
    (tmp, store)
}

fn cid_count(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir.join("cid")).unwrap().count()
}

#[test]
fn large_binary_externalizes_and_shares_on_copy() {
    let (tmp, store) = temp_store();
    let blob = vec![0x5Au8; 64 * 1024];
    let mut content = MessageContent::default();
    content.props.set(tags::PR_SUBJECT, PropValue::Unicode("big".into()));
    content.props.set(tags::PR_ATTACH_DATA_BIN, PropValue::Binary(blob.clone()));
    let mid = store.write_message(private_fid::INBOX, &content, false).unwrap();
    assert_eq!(cid_count(tmp.path()), 1);

    // reads resolve the reference transparently
    let back = store.read_message(mid).unwrap();
    assert_eq!(back.props.get(tags::PR_ATTACH_DATA_BIN).and_then(|v| v.as_bytes()), Some(&blob[..]));

    // a copy takes a reference, not a second file
    let dst = store.allocate_message_id(private_fid::SENT_ITEMS).unwrap();
    store.movecopy_message(mid, private_fid::SENT_ITEMS, dst, false).unwrap();
    assert_eq!(cid_count(tmp.path()), 1);

    // dropping one referent keeps the file; dropping both removes it
    store.delete_messages(private_fid::INBOX, &[mid], true).unwrap();
    assert_eq!(cid_count(tmp.path()), 1);
    store.delete_messages(private_fid::SENT_ITEMS, &[dst], true).unwrap();
    assert_eq!(cid_count(tmp.path()), 0);
}

#[test]
fn purge_datafiles_sweeps_orphans() {
    let (tmp, store) = temp_store();
    std::fs::write(tmp.path().join("cid/4242"), b"stray").unwrap();
    std::fs::write(tmp.path().join("eml/999999"), b"stray message").unwrap();
    store.purge_datafiles().unwrap();
    assert_eq!(cid_count(tmp.path()), 0);
    assert_eq!(std::fs::read_dir(tmp.path().join("eml")).unwrap().count(), 0);
}

#[test]
fn delivery_writes_eml_and_inbox_row() {
    let (tmp, store) = temp_store();
    let raw = b"From: a@example.com\r\nTo: user@example.com\r\nSubject: hi\r\n\r\nbody\r\n";
    let result = store
        .deliver_message("a@example.com", "user@example.com", raw, 0)
        .unwrap();
    let oxmdb::store::delivery::DeliverResult::Delivered { folder_id, message_id } = result
    else {
        panic!("delivery rejected");
    };
    assert_eq!(folder_id, private_fid::INBOX);
    let eml = tmp
        .path()
        .join("eml")
        .join(oxmdb::types::eid_gc(message_id).to_string());
    assert_eq!(std::fs::read(eml).unwrap(), raw);
}
