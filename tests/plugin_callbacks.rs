//! The upward API plugins call into the core with: deferred teardown
//! (`close_pc`, `end_session`), event-handler notifications, and the
//! per-handle packet dump toggled over the admin API.

mod support;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use support::{attach, create_session, offer_sdp, testbed};

use boardwalk::events::{EventHandler, TYPE_SESSION};

struct RecordingHandler {
    events: Mutex<Vec<Value>>,
}

impl EventHandler for RecordingHandler {
    fn package(&self) -> &str {
        "test.recorder"
    }
    fn name(&self) -> &str {
        "Recording event handler"
    }
    fn handle_event(&self, event: Value) {
        self.events.lock().push(event);
    }
    fn handle_request(&self, request: Value) -> Option<Value> {
        Some(json!({ "echoed": request }))
    }
}

#[tokio::test]
async fn close_pc_hangs_up_off_the_plugin_stack() {
    let bed = testbed(|_| {});
    let mut client = bed.client();
    let session_id = create_session(&mut client).await;
    let handle_id = attach(&mut client, session_id, "mock.test").await;

    let reply = client
        .request(json!({
            "janus": "message",
            "transaction": "m1",
            "session_id": session_id,
            "handle_id": handle_id,
            "body": {},
            "jsep": { "type": "offer", "sdp": offer_sdp(), "trickle": false },
        }))
        .await;
    assert_eq!(reply["janus"], "ack");
    bed.mock.push_answer().await.unwrap();
    let kinds = [client.recv().await, client.recv().await];
    assert!(kinds.iter().any(|m| m["janus"] == "webrtcup"));

    bed.mock.core().close_pc(&bed.mock.last_session());

    // The hangup runs on the watchdog context, not under our stack.
    let event = client.recv().await;
    assert_eq!(event["janus"], "hangup");
    assert_eq!(event["reason"], "Close PC");
    assert_eq!(bed.mock.hangups.load(std::sync::atomic::Ordering::SeqCst), 1);

    // The handle itself survives a close_pc.
    let session = bed.gateway.sessions.find(session_id).unwrap();
    assert!(session.find_handle(handle_id).is_some());
}

#[tokio::test]
async fn end_session_removes_the_handle() {
    let bed = testbed(|_| {});
    let mut client = bed.client();
    let session_id = create_session(&mut client).await;
    let handle_id = attach(&mut client, session_id, "mock.test").await;

    bed.mock.core().end_session(&bed.mock.last_session());

    let session = bed.gateway.sessions.find(session_id).unwrap();
    let mut waited = Duration::ZERO;
    while session.find_handle(handle_id).is_some() {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
        assert!(waited < Duration::from_secs(2), "handle never removed");
    }
    assert_eq!(bed.mock.destroys.load(std::sync::atomic::Ordering::SeqCst), 1);
    // The session itself stays alive.
    assert!(bed.gateway.sessions.find(session_id).is_some());
}

#[tokio::test]
async fn pushes_are_at_most_once_during_teardown() {
    let bed = testbed(|_| {});
    let mut client = bed.client();
    let session_id = create_session(&mut client).await;
    let handle_id = attach(&mut client, session_id, "mock.test").await;
    let plugin_session = bed.mock.last_session();

    let reply = client
        .request(json!({
            "janus": "detach",
            "transaction": "d",
            "session_id": session_id,
            "handle_id": handle_id,
        }))
        .await;
    assert_eq!(reply["janus"], "success");

    // Neither push form may reach anything after the stop latch.
    assert!(bed
        .mock
        .push(json!({ "late": true }), None)
        .await
        .is_err());
    bed.mock.core().close_pc(&plugin_session);
    bed.mock.core().end_session(&plugin_session);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bed.mock.hangups.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(bed.mock.destroys.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn event_handlers_observe_the_session_lifecycle() {
    let bed = testbed(|_| {});
    let recorder = Arc::new(RecordingHandler {
        events: Mutex::new(Vec::new()),
    });
    bed.gateway.register_event_handler(recorder.clone());

    let mut client = bed.client();
    let session_id = create_session(&mut client).await;
    let handle_id = attach(&mut client, session_id, "mock.test").await;
    let reply = client
        .request(json!({
            "janus": "destroy",
            "transaction": "d",
            "session_id": session_id,
        }))
        .await;
    assert_eq!(reply["janus"], "success");

    let events = recorder.events.lock();
    let names: Vec<String> = events
        .iter()
        .map(|e| {
            e["event"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    assert!(names.contains(&"created".to_string()));
    assert!(names.contains(&"attached".to_string()));
    assert!(names.contains(&"detached".to_string()));
    assert!(names.contains(&"destroyed".to_string()));
    let created = events
        .iter()
        .find(|e| e["event"]["name"] == "created" && e["type"] == TYPE_SESSION)
        .unwrap();
    assert_eq!(created["session_id"].as_u64(), Some(session_id));
    let attached = events.iter().find(|e| e["event"]["name"] == "attached").unwrap();
    assert_eq!(attached["handle_id"].as_u64(), Some(handle_id));
    assert_eq!(attached["event"]["plugin"], "mock.test");
}

#[tokio::test]
async fn notify_event_tags_the_plugin_context() {
    let bed = testbed(|_| {});
    let recorder = Arc::new(RecordingHandler {
        events: Mutex::new(Vec::new()),
    });
    bed.gateway.register_event_handler(recorder.clone());

    let mut client = bed.client();
    let session_id = create_session(&mut client).await;
    let handle_id = attach(&mut client, session_id, "mock.test").await;

    bed.mock.core().notify_event(
        "mock.test",
        Some(&bed.mock.last_session()),
        json!({ "custom": 1 }),
    );

    let events = recorder.events.lock();
    let plugin_event = events
        .iter()
        .find(|e| e["event"]["plugin"] == "mock.test" && e["event"]["data"]["custom"] == 1)
        .expect("plugin event not dispatched");
    assert_eq!(plugin_event["session_id"].as_u64(), Some(session_id));
    assert_eq!(plugin_event["handle_id"].as_u64(), Some(handle_id));
}

#[tokio::test]
async fn query_eventhandler_round_trips() {
    let bed = testbed(|_| {});
    bed.gateway.register_event_handler(Arc::new(RecordingHandler {
        events: Mutex::new(Vec::new()),
    }));
    let mut admin = bed.client();

    let reply = admin
        .request_admin(json!({
            "janus": "query_eventhandler",
            "transaction": "q",
            "handler": "test.recorder",
            "request": { "ping": true },
        }))
        .await;
    assert_eq!(reply["janus"], "success");
    assert_eq!(reply["response"]["echoed"]["ping"], true);
}

#[tokio::test]
async fn text2pcap_toggles_per_handle() {
    let bed = testbed(|_| {});
    let mut admin = bed.client();
    let mut client = bed.client();
    let session_id = create_session(&mut client).await;
    let handle_id = attach(&mut client, session_id, "mock.test").await;

    let folder = std::env::temp_dir().display().to_string();
    let filename = format!("boardwalk-test-{session_id}.txt");
    let reply = admin
        .request_admin(json!({
            "janus": "start_text2pcap",
            "transaction": "p1",
            "session_id": session_id,
            "handle_id": handle_id,
            "folder": folder,
            "filename": filename,
        }))
        .await;
    assert_eq!(reply["janus"], "success");

    // Starting twice is an error.
    let reply = admin
        .request_admin(json!({
            "janus": "start_text2pcap",
            "transaction": "p2",
            "session_id": session_id,
            "handle_id": handle_id,
        }))
        .await;
    assert_eq!(reply["error"]["code"], 490);

    let reply = admin
        .request_admin(json!({
            "janus": "handle_info",
            "transaction": "p3",
            "session_id": session_id,
            "handle_id": handle_id,
        }))
        .await;
    assert_eq!(reply["info"]["dump-to-text2pcap"], true);
    assert!(reply["info"]["text2pcap-file"]
        .as_str()
        .unwrap()
        .contains(&filename));

    let reply = admin
        .request_admin(json!({
            "janus": "stop_text2pcap",
            "transaction": "p4",
            "session_id": session_id,
            "handle_id": handle_id,
        }))
        .await;
    assert_eq!(reply["janus"], "success");
    let reply = admin
        .request_admin(json!({
            "janus": "stop_text2pcap",
            "transaction": "p5",
            "session_id": session_id,
            "handle_id": handle_id,
        }))
        .await;
    assert_eq!(reply["error"]["code"], 490);
}
