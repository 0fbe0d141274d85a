//! End-to-end ICS: export a folder's contents from one store, import the
//! byte stream into a second store, and verify the delta machinery goes
//! quiet once both sides agree.

use std::sync::Arc;

use oxmdb::exmdb::client::{ExmdbClient, RemoteConfig};
use oxmdb::exmdb::request::StoreRequest;
use oxmdb::exmdb::response::Response;
use oxmdb::rop::ftstream::{markers, FtRecord, FtStreamParser};
use oxmdb::rop::fxics::{SyncScope, TransferStatus};
use oxmdb::rop::Session;
use oxmdb::store::schema;
use oxmdb::store::sync::ContentSyncFlags;
use oxmdb::store::{Engine, Limits, MessageContent};
use oxmdb::types::propval::{tags, PropValue};
use oxmdb::types::private_fid;

const SYNC_ALL: ContentSyncFlags = ContentSyncFlags { normal: true, fai: true, read_state: true };

struct Mailbox {
    _tmp: tempfile::TempDir,
    client: Arc<ExmdbClient>,
    dir: String,
}

fn mailbox(owner: &str) -> Mailbox {
    let tmp = tempfile::tempdir().unwrap();
    schema::provision(tmp.path(), owner, true).unwrap();
    let engine = Engine::new(Limits::default());
    let client = ExmdbClient::new(4, 0, None);
    client.set_local_engine(engine);
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
    Mailbox { _tmp: tmp, client: Arc::new(client), dir }
}

fn seed(mb: &Mailbox, subject: &str, fai: bool) -> u64 {
    let mut content = MessageContent::default();
    content.props.set(tags::PR_SUBJECT, PropValue::Unicode(subject.into()));
    if fai {
        content.props.set(tags::PR_ASSOCIATED, PropValue::Bool(true));
    }
    match mb
        .client
        .call(
            &mb.dir,
            StoreRequest::WriteMessage {
                folder_id: private_fid::INBOX,
                content,
                fail_on_conflict: false,
            },
        )
        .unwrap()
    {
        Response::U64(mid) => mid,
        other => panic!("unexpected response {other:?}"),
    }
}

fn drain(session: &mut Session, ctx: u32) -> Vec<u8> {
    let mut stream = Vec::new();
    loop {
        let (chunk, status) = session.rop_fasttransfersourcegetbuffer(ctx, 4096).unwrap();
        stream.extend_from_slice(&chunk);
        match status {
            TransferStatus::Done => break,
            TransferStatus::Partial => {}
            other => panic!("unexpected transfer status {other:?}"),
        }
    }
    stream
}

fn count_changes(stream: &[u8]) -> usize {
    let mut parser = FtStreamParser::new();
    parser.feed(stream).unwrap();
    let mut n = 0;
    while let Some(record) = parser.next().unwrap() {
        if record == FtRecord::Marker(markers::INCR_SYNC_CHG) {
            n += 1;
        }
    }
    n
}

#[test]
fn content_sync_round_trip_to_empty_replica() {
    let source = mailbox("alice@example.com");
    let target = mailbox("bob@example.com");

    let m1 = seed(&source, "m1", false);
    let m2 = seed(&source, "m2", false);
    let m3 = seed(&source, "m3", false);
    let f1 = seed(&source, "f1 (rules)", true);

    // export from the source with a fresh (empty) state
    let mut src_session = Session::new(Arc::clone(&source.client));
    let src_logon = src_session.rop_logon(&source.dir, "alice@example.com", 1).unwrap();
    let (src_inbox, _) = src_session.rop_openfolder(src_logon, private_fid::INBOX).unwrap();
    let ctx = src_session
        .rop_syncconfigure(src_inbox, SyncScope::Contents, SYNC_ALL)
        .unwrap();
    let stream = drain(&mut src_session, ctx);
    assert_eq!(count_changes(&stream), 4);

    // import into the empty replica through the FastTransfer destination
    let mut dst_session = Session::new(Arc::clone(&target.client));
    let dst_logon = dst_session.rop_logon(&target.dir, "bob@example.com", 1).unwrap();
    let (dst_inbox, _) = dst_session.rop_openfolder(dst_logon, private_fid::INBOX).unwrap();
    let upload = dst_session.rop_fasttransferdestconfigure(dst_inbox).unwrap();
    for chunk in stream.chunks(1024) {
        dst_session.rop_fasttransferdestputbuffer(upload, chunk).unwrap();
    }

    assert_eq!(dst_session.sum_content(dst_logon, private_fid::INBOX, false).unwrap(), 3);
    assert_eq!(dst_session.sum_content(dst_logon, private_fid::INBOX, true).unwrap(), 1);

    // subjects and change keys survive the transfer
    let mut src_subjects = Vec::new();
    for mid in [m1, m2, m3, f1] {
        match source
            .client
            .call(
                &source.dir,
                StoreRequest::GetMessageProperties {
                    message_id: mid,
                    proptags: vec![tags::PR_SUBJECT, tags::PR_CHANGE_KEY],
                },
            )
            .unwrap()
        {
            Response::Propvals(p) => src_subjects.push((
                p.get(tags::PR_SUBJECT).and_then(|v| v.as_str()).unwrap().to_owned(),
                p.get(tags::PR_CHANGE_KEY).and_then(|v| v.as_bytes()).unwrap().to_vec(),
            )),
            other => panic!("unexpected response {other:?}"),
        }
    }
    let rows = match target
        .client
        .call(
            &target.dir,
            StoreRequest::QueryFolderMessages { folder_id: private_fid::INBOX },
        )
        .unwrap()
    {
        Response::Rows(rows) => rows,
        other => panic!("unexpected response {other:?}"),
    };
    for row in &rows {
        let mid = row.get(tags::PR_MID).and_then(|v| v.as_u64()).unwrap();
        let got = match target
            .client
            .call(
                &target.dir,
                StoreRequest::GetMessageProperties {
                    message_id: mid,
                    proptags: vec![tags::PR_SUBJECT, tags::PR_CHANGE_KEY],
                },
            )
            .unwrap()
        {
            Response::Propvals(p) => p,
            other => panic!("unexpected response {other:?}"),
        };
        let subject = got.get(tags::PR_SUBJECT).and_then(|v| v.as_str()).unwrap();
        let key = got.get(tags::PR_CHANGE_KEY).and_then(|v| v.as_bytes()).unwrap();
        assert!(src_subjects
            .iter()
            .any(|(s, k)| s == subject && k.as_slice() == key));
    }

    // a second sync with the post-export state yields no changes
    let state = src_session.rop_syncgettransferstate(ctx).unwrap();
    let ctx2 = src_session
        .rop_syncconfigure(src_inbox, SyncScope::Contents, SYNC_ALL)
        .unwrap();
    src_session.rop_syncuploadstatestreambegin(ctx2, tags::META_TAG_IDSET_GIVEN).unwrap();
    src_session.rop_syncuploadstatestreamcontinue(ctx2, &state).unwrap();
    src_session.rop_syncuploadstatestreamend(ctx2).unwrap();
    let stream2 = drain(&mut src_session, ctx2);
    assert_eq!(count_changes(&stream2), 0);
}

#[test]
fn collector_import_updates_state() {
    let target = mailbox("carol@example.com");
    let mut session = Session::new(Arc::clone(&target.client));
    let logon = session.rop_logon(&target.dir, "carol@example.com", 1).unwrap();
    let (inbox, _) = session.rop_openfolder(logon, private_fid::INBOX).unwrap();
    let collector = session.rop_syncopencollector(inbox, true).unwrap();

    let mut content = MessageContent::default();
    content.props.set(tags::PR_SUBJECT, PropValue::Unicode("imported".into()));
    let mid = session
        .rop_syncimportmessagechange(collector, content, false)
        .unwrap();
    assert_ne!(mid, 0);
    assert_eq!(session.sum_content(logon, private_fid::INBOX, false).unwrap(), 1);

    // read-state import rolls the read set forward
    session
        .rop_syncimportreadstatechanges(collector, &[(mid, true)])
        .unwrap();
    let state = session.rop_syncgettransferstate(collector).unwrap();
    assert!(!state.is_empty());

    // imported deletes drop the message and the given entry
    let partial = session.rop_syncimportdeletes(collector, &[mid], true).unwrap();
    assert!(!partial);
    assert_eq!(session.sum_content(logon, private_fid::INBOX, false).unwrap(), 0);
}

#[test]
fn hierarchy_sync_streams_folder_changes() {
    let source = mailbox("dave@example.com");
    let mut session = Session::new(Arc::clone(&source.client));
    let logon = session.rop_logon(&source.dir, "dave@example.com", 1).unwrap();
    let (root, _) = session.rop_openfolder(logon, private_fid::ROOT).unwrap();
    let ctx = session
        .rop_syncconfigure(root, SyncScope::Hierarchy, SYNC_ALL)
        .unwrap();
    let stream = drain(&mut session, ctx);
    // the well-known tree minus the root itself
    assert_eq!(count_changes(&stream), 23);
}
