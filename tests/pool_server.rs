//! Client/server over real sockets: handshake, pooled connections under
//! concurrency, bad_switch handling, and the notification channel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oxmdb::exmdb::client::{ExmdbClient, RemoteConfig};
use oxmdb::exmdb::request::StoreRequest;
use oxmdb::exmdb::response::Response;
use oxmdb::exmdb::server::{ExmdbServer, ServedPrefix};
use oxmdb::store::notify::fnev;
use oxmdb::store::schema;
use oxmdb::store::{Engine, Limits, MessageContent};
use oxmdb::types::propval::{tags, PropValue};
use oxmdb::types::{private_fid, EcError};

fn server_setup() -> (tempfile::TempDir, ExmdbServer, String) {
    let tmp = tempfile::tempdir().unwrap();
    schema::provision(tmp.path(), "user@example.com", true).unwrap();
    let engine = Engine::new(Limits::default());
    let prefix = tmp.path().display().to_string();
    let server = ExmdbServer::start(
        "127.0.0.1:0",
        engine,
        vec![ServedPrefix { prefix: prefix.clone(), private: true }],
    )
    .unwrap();
    (tmp, server, prefix)
}

fn remote_client(server: &ExmdbServer, prefix: &str, conn_max: u32) -> ExmdbClient {
    let client = ExmdbClient::new(conn_max, 1, Some(Duration::from_secs(10)));
    client
        .run(vec![RemoteConfig {
            host: "127.0.0.1".into(),
            port: server.local_addr().port(),
            prefix: prefix.to_owned(),
            private: true,
            local: false,
        }])
        .unwrap();
    client
}

#[test]
fn rpc_over_socket() {
    let (_tmp, server, prefix) = server_setup();
    let client = remote_client(&server, &prefix, 2);

    match client.call(&prefix, StoreRequest::PingStore).unwrap() {
        Response::Unit => {}
        other => panic!("unexpected response {other:?}"),
    }
    match client
        .call(&prefix, StoreRequest::CheckFolderId { folder_id: private_fid::INBOX })
        .unwrap()
    {
        Response::Bool(true) => {}
        other => panic!("unexpected response {other:?}"),
    }

    // a guest has no rights on the inbox, which is still a success reply
    match client
        .call(
            &prefix,
            StoreRequest::CheckFolderPermission {
                folder_id: private_fid::INBOX,
                username: "stranger@example.com".into(),
            },
        )
        .unwrap()
    {
        Response::U32(perm) => assert_eq!(perm, 0),
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn store_error_is_carried_in_band() {
    let (_tmp, server, prefix) = server_setup();
    let client = remote_client(&server, &prefix, 2);
    let err = client
        .call(&prefix, StoreRequest::GetMessageProperties {
            message_id: 0xDEAD,
            proptags: vec![tags::PR_SUBJECT],
        })
        .unwrap_err();
    assert_eq!(err, EcError::NotFound);
    // and the connection is still serviceable afterwards
    assert!(client.call(&prefix, StoreRequest::PingStore).is_ok());
}

#[test]
fn concurrent_calls_share_the_pool() {
    let (_tmp, server, prefix) = server_setup();
    let client = Arc::new(remote_client(&server, &prefix, 2));
    let completed = Arc::new(AtomicU32::new(0));
    let mut threads = Vec::new();
    for _ in 0..3 {
        let client = Arc::clone(&client);
        let prefix = prefix.clone();
        let completed = Arc::clone(&completed);
        threads.push(std::thread::spawn(move || {
            for _ in 0..25 {
                match client.call(&prefix, StoreRequest::PingStore) {
                    Ok(Response::Unit) => {}
                    other => panic!("ping failed: {other:?}"),
                }
            }
            completed.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    // no request was lost even with more callers than connections
    assert_eq!(completed.load(Ordering::Relaxed), 3);
}

#[test]
fn writes_round_trip_over_the_wire() {
    let (_tmp, server, prefix) = server_setup();
    let client = remote_client(&server, &prefix, 2);

    let mut content = MessageContent::default();
    content.props.set(tags::PR_SUBJECT, PropValue::Unicode("over the wire".into()));
    let mid = match client
        .call(
            &prefix,
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
    };
    match client
        .call(
            &prefix,
            StoreRequest::GetMessageProperties {
                message_id: mid,
                proptags: vec![tags::PR_SUBJECT],
            },
        )
        .unwrap()
    {
        Response::Propvals(p) => {
            assert_eq!(p.get(tags::PR_SUBJECT).and_then(|v| v.as_str()), Some("over the wire"));
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn notifications_reach_the_remote_subscriber() {
    let (_tmp, server, prefix) = server_setup();
    let client = ExmdbClient::new(2, 1, Some(Duration::from_secs(10)));
    let received = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&received);
    client.set_event_proc(Box::new(move |_dir, _sub_id, _notify| {
        seen.fetch_add(1, Ordering::Relaxed);
    }));
    client
        .run(vec![RemoteConfig {
            host: "127.0.0.1".into(),
            port: server.local_addr().port(),
            prefix: prefix.clone(),
            private: true,
            local: false,
        }])
        .unwrap();

    let sub_id = match client
        .call(
            &prefix,
            StoreRequest::SubscribeNotification {
                remote_id: Some(client.remote_id().to_owned()),
                notification_type: fnev::OBJECT_CREATED | fnev::NEW_MAIL,
                whole: true,
                folder_id: 0,
                message_id: 0,
            },
        )
        .unwrap()
    {
        Response::U32(id) => id,
        other => panic!("unexpected response {other:?}"),
    };
    assert_ne!(sub_id, 0);

    // wait for the listen channel, then provoke a change
    for attempt in 0..50 {
        let mut content = MessageContent::default();
        content
            .props
            .set(tags::PR_SUBJECT, PropValue::Unicode(format!("notify {attempt}")));
        client
            .call(
                &prefix,
                StoreRequest::WriteMessage {
                    folder_id: private_fid::INBOX,
                    content,
                    fail_on_conflict: false,
                },
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        if received.load(Ordering::Relaxed) > 0 {
            return;
        }
    }
    panic!("no notification arrived");
}
