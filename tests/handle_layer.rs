//! Session/handle-layer flows against a real on-disk store: logon, open
//! and list, folder creation, and partial deletion with a held instance.

use std::sync::Arc;

use oxmdb::exmdb::client::{ExmdbClient, RemoteConfig};
use oxmdb::exmdb::request::StoreRequest;
use oxmdb::exmdb::response::Response;
use oxmdb::rop::Session;
use oxmdb::store::folders::del_flags;
use oxmdb::store::schema;
use oxmdb::store::{Engine, Limits, MessageContent};
use oxmdb::types::propval::{folder_type, tags, PropList, PropValue};
use oxmdb::types::{access, private_fid, EcError};

const OWNER: &str = "user@example.com";

fn local_setup() -> (tempfile::TempDir, Arc<Engine>, Arc<ExmdbClient>, String) {
    let tmp = tempfile::tempdir().unwrap();
    schema::provision(tmp.path(), OWNER, true).unwrap();
    let engine = Engine::new(Limits::default());
    let client = ExmdbClient::new(4, 0, None);
    client.set_local_engine(Arc::clone(&engine));
    client
        .run(vec![RemoteConfig {
            host: String::new(),
            port: 0,
            prefix: tmp.path().display().to_string(),
            private: true,
            local: true,
        }])
        .unwrap();
    let dir = tmp.path().display().to_string();
    (tmp, engine, Arc::new(client), dir)
}

fn seed_message(client: &ExmdbClient, dir: &str, folder_id: u64, subject: &str) -> u64 {
    let mut content = MessageContent::default();
    content.props.set(tags::PR_SUBJECT, PropValue::Unicode(subject.into()));
    match client
        .call(dir, StoreRequest::WriteMessage { folder_id, content, fail_on_conflict: false })
        .unwrap()
    {
        Response::U64(mid) => mid,
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn open_and_list_inbox() {
    let (_tmp, _engine, client, dir) = local_setup();
    let mut session = Session::new(Arc::clone(&client));
    let logon = session.rop_logon(&dir, OWNER, 1).unwrap();

    seed_message(&client, &dir, private_fid::INBOX, "one");
    seed_message(&client, &dir, private_fid::INBOX, "two");

    let (inbox, mask) = session.rop_openfolder(logon, private_fid::INBOX).unwrap();
    assert_eq!(mask, access::ALL);

    let (table, row_count) = session.rop_getcontentstable(inbox, 0, None, None).unwrap();
    assert_eq!(row_count, session.sum_content(logon, private_fid::INBOX, false).unwrap());
    assert_eq!(row_count, 2);

    let rows = session
        .rop_queryrows(table, &[tags::PR_SUBJECT, tags::PR_MID], true, 10)
        .unwrap();
    assert_eq!(rows.len(), 2);

    // closing the folder closes the table under it
    session.release(inbox);
    assert_eq!(
        session.rop_queryrows(table, &[tags::PR_SUBJECT], true, 1).unwrap_err(),
        EcError::NullObject
    );
}

#[test]
fn create_folder_with_change_identity() {
    let (_tmp, _engine, client, dir) = local_setup();
    let mut session = Session::new(client);
    let logon = session.rop_logon(&dir, OWNER, 1).unwrap();
    let (subtree, _) = session.rop_openfolder(logon, private_fid::IPMSUBTREE).unwrap();

    let (handle, folder_id, is_existing) = session
        .rop_createfolder(subtree, folder_type::GENERIC, "Invoices", false)
        .unwrap();
    assert!(!is_existing);

    let props = session
        .rop_getpropertiesspecific(
            handle,
            &[
                tags::PR_DISPLAY_NAME,
                tags::PR_CHANGE_KEY,
                tags::PR_PREDECESSOR_CHANGE_LIST,
                tags::PR_CREATION_TIME,
            ],
        )
        .unwrap();
    assert_eq!(props.get(tags::PR_DISPLAY_NAME).and_then(|v| v.as_str()), Some("Invoices"));
    assert!(!props.get(tags::PR_CHANGE_KEY).unwrap().as_bytes().unwrap().is_empty());
    assert!(!props
        .get(tags::PR_PREDECESSOR_CHANGE_LIST)
        .unwrap()
        .as_bytes()
        .unwrap()
        .is_empty());
    let now = oxmdb::types::filetime_now();
    let created = props.get(tags::PR_CREATION_TIME).and_then(|v| v.as_u64()).unwrap();
    assert!(now - created < 2 * 10_000_000);

    let dup = session.rop_createfolder(subtree, folder_type::GENERIC, "Invoices", false);
    assert_eq!(dup.unwrap_err(), EcError::DuplicateName);
    let _ = folder_id;
}

#[test]
fn message_edit_through_handles() {
    let (_tmp, _engine, client, dir) = local_setup();
    let mut session = Session::new(client);
    let logon = session.rop_logon(&dir, OWNER, 1).unwrap();
    let (drafts, _) = session.rop_openfolder(logon, private_fid::DRAFT).unwrap();

    let message = session.rop_createmessage(drafts, false).unwrap();
    let mut edit = PropList::new();
    edit.set(tags::PR_SUBJECT, PropValue::Unicode("draft".into()));
    let problems = session.rop_setproperties(message, &edit).unwrap();
    assert!(problems.is_empty());

    let mid = session.rop_savechangesmessage(message).unwrap();
    assert_ne!(mid, 0);
    assert_eq!(session.sum_content(logon, private_fid::DRAFT, false).unwrap(), 1);
}

#[test]
fn harddelete_folder_with_held_instance_is_partial() {
    let (_tmp, engine, client, dir) = local_setup();
    let mut session = Session::new(Arc::clone(&client));
    let logon = session.rop_logon(&dir, OWNER, 1).unwrap();
    let (subtree, _) = session.rop_openfolder(logon, private_fid::IPMSUBTREE).unwrap();
    let (_, folder_id, _) = session
        .rop_createfolder(subtree, folder_type::GENERIC, "Doomed", false)
        .unwrap();

    let mut mids = Vec::new();
    for i in 0..5 {
        mids.push(seed_message(&client, &dir, folder_id, &format!("m{i}")));
    }
    // one message is pinned by an open editing instance
    let store = engine.open_store(std::path::Path::new(&dir)).unwrap();
    let instance = store
        .load_message_instance(folder_id, mids[0], false, false)
        .unwrap();

    let partial = session
        .rop_deletefolder(subtree, folder_id, del_flags::MESSAGES | del_flags::HARD_DELETE)
        .unwrap();
    assert!(partial);
    // the folder survives, with exactly the pinned message left
    assert_eq!(session.sum_content(logon, folder_id, false).unwrap(), 1);

    store.unload_instance(instance).unwrap();
    let partial = session
        .rop_deletefolder(subtree, folder_id, del_flags::MESSAGES | del_flags::HARD_DELETE)
        .unwrap();
    assert!(!partial);
    match client.call(&dir, StoreRequest::CheckFolderId { folder_id }).unwrap() {
        Response::Bool(exists) => assert!(!exists),
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn search_folder_criteria_round_trip() {
    let (_tmp, _engine, client, dir) = local_setup();
    let mut session = Session::new(Arc::clone(&client));
    let logon = session.rop_logon(&dir, OWNER, 1).unwrap();
    seed_message(&client, &dir, private_fid::INBOX, "find me please");
    let (finder, _) = session.rop_openfolder(logon, private_fid::FINDER).unwrap();
    let (search, search_fid, _) = session
        .rop_createfolder(finder, folder_type::SEARCH, "needle", false)
        .unwrap();

    use oxmdb::store::search::{search_flags, search_status};
    use oxmdb::types::restriction::{Restriction, FL_SUBSTRING};
    session
        .rop_setsearchcriteria(
            search,
            search_flags::RESTART,
            Some(Restriction::Content {
                fuzzy_level: FL_SUBSTRING,
                proptag: tags::PR_SUBJECT,
                propval: PropValue::Unicode("needle".into()),
            }),
            &[private_fid::INBOX],
        )
        .unwrap();

    // population is asynchronous; wait for it to settle
    for _ in 0..200 {
        let (status, _, _) = session.rop_getsearchcriteria(search).unwrap();
        if status & search_status::RUNNING == 0 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    let (status, restriction, scope) = session.rop_getsearchcriteria(search).unwrap();
    assert!(status & search_status::COMPLETE != 0);
    assert!(restriction.is_some());
    assert_eq!(scope, vec![private_fid::INBOX]);
    let _ = search_fid;
}
