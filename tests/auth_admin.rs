//! Authorization (API secret, admin secret, tokens with plugin ACLs) and
//! the admin/monitor API: status, live tuning, introspection.

mod support;

use serde_json::json;
use support::{attach, create_session, offer_sdp, testbed};

#[tokio::test]
async fn api_secret_gates_the_client_api() {
    let bed = testbed(|config| config.api_secret = Some("S".to_string()));
    let mut client = bed.client();

    let reply = client
        .request(json!({ "janus": "create", "transaction": "t1" }))
        .await;
    assert_eq!(reply["janus"], "error");
    assert_eq!(reply["error"]["code"], 403);

    let reply = client
        .request(json!({ "janus": "create", "transaction": "t2", "apisecret": "wrong" }))
        .await;
    assert_eq!(reply["error"]["code"], 403);

    let reply = client
        .request(json!({ "janus": "create", "transaction": "t3", "apisecret": "S" }))
        .await;
    assert_eq!(reply["janus"], "success");
    let session_id = reply["data"]["id"].as_u64().unwrap();

    // Every subsequent verb needs the secret too.
    let reply = client
        .request(json!({ "janus": "keepalive", "transaction": "t4", "session_id": session_id }))
        .await;
    assert_eq!(reply["error"]["code"], 403);

    // info and ping stay open.
    let reply = client
        .request(json!({ "janus": "ping", "transaction": "t5" }))
        .await;
    assert_eq!(reply["janus"], "pong");
}

#[tokio::test]
async fn tokens_are_an_alternative_credential() {
    let bed = testbed(|config| {
        config.api_secret = Some("S".to_string());
        config.token_auth = true;
        config.admin_secret = Some("adminpwd".to_string());
    });
    let mut admin = bed.client();
    let mut client = bed.client();

    // Mint a token over the admin API, allowed for every plugin.
    let reply = admin
        .request_admin(json!({
            "janus": "add_token",
            "transaction": "a1",
            "admin_secret": "adminpwd",
            "token": "tok",
        }))
        .await;
    assert_eq!(reply["janus"], "success", "{reply}");
    let allowed = reply["data"]["plugins"].as_array().unwrap();
    assert!(allowed.iter().any(|p| p == "echo.test"));

    let reply = client
        .request(json!({ "janus": "create", "transaction": "t1", "token": "tok" }))
        .await;
    assert_eq!(reply["janus"], "success");

    let reply = client
        .request(json!({ "janus": "create", "transaction": "t2", "token": "bad" }))
        .await;
    assert_eq!(reply["error"]["code"], 403);
}

#[tokio::test]
async fn token_plugin_acl_is_enforced_at_attach() {
    let bed = testbed(|config| config.token_auth = true);
    let mut admin = bed.client();
    let mut client = bed.client();

    let reply = admin
        .request_admin(json!({
            "janus": "add_token",
            "transaction": "a1",
            "token": "tok",
            "plugins": ["mock.test"],
        }))
        .await;
    assert_eq!(reply["janus"], "success");

    let reply = client
        .request(json!({ "janus": "create", "transaction": "t1", "token": "tok" }))
        .await;
    let session_id = reply["data"]["id"].as_u64().unwrap();

    // echo.test is not on the allow-list.
    let reply = client
        .request(json!({
            "janus": "attach",
            "transaction": "t2",
            "session_id": session_id,
            "plugin": "echo.test",
            "token": "tok",
        }))
        .await;
    assert_eq!(reply["error"]["code"], 405);

    // mock.test is.
    let reply = client
        .request(json!({
            "janus": "attach",
            "transaction": "t3",
            "session_id": session_id,
            "plugin": "mock.test",
            "token": "tok",
        }))
        .await;
    assert_eq!(reply["janus"], "success");

    // Disallow, then the attach fails again.
    let reply = admin
        .request_admin(json!({
            "janus": "disallow_token",
            "transaction": "a2",
            "token": "tok",
            "plugins": ["mock.test"],
        }))
        .await;
    assert_eq!(reply["janus"], "success");
    let reply = client
        .request(json!({
            "janus": "attach",
            "transaction": "t4",
            "session_id": session_id,
            "plugin": "mock.test",
            "token": "tok",
        }))
        .await;
    assert_eq!(reply["error"]["code"], 405);
}

#[tokio::test]
async fn token_management_lifecycle() {
    let bed = testbed(|config| config.token_auth = true);
    let mut admin = bed.client();

    let reply = admin
        .request_admin(json!({
            "janus": "add_token",
            "transaction": "a1",
            "token": "tok",
            "plugins": ["echo.test"],
        }))
        .await;
    assert_eq!(reply["data"]["plugins"], json!(["echo.test"]));

    let reply = admin
        .request_admin(json!({
            "janus": "allow_token",
            "transaction": "a2",
            "token": "tok",
            "plugins": ["mock.test"],
        }))
        .await;
    assert_eq!(reply["data"]["plugins"], json!(["echo.test", "mock.test"]));

    // allow_token on an unknown token is a lookup error.
    let reply = admin
        .request_admin(json!({
            "janus": "allow_token",
            "transaction": "a3",
            "token": "ghost",
            "plugins": ["echo.test"],
        }))
        .await;
    assert_eq!(reply["error"]["code"], 470);

    // allow_token needs a non-empty plugins array.
    let reply = admin
        .request_admin(json!({
            "janus": "allow_token",
            "transaction": "a4",
            "token": "tok",
        }))
        .await;
    assert_eq!(reply["error"]["code"], 467);

    let reply = admin
        .request_admin(json!({ "janus": "list_tokens", "transaction": "a5" }))
        .await;
    let tokens = reply["data"]["tokens"].as_array().unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0]["token"], "tok");

    let reply = admin
        .request_admin(json!({
            "janus": "remove_token",
            "transaction": "a6",
            "token": "tok",
        }))
        .await;
    assert_eq!(reply["janus"], "success");
    let reply = admin
        .request_admin(json!({ "janus": "list_tokens", "transaction": "a7" }))
        .await;
    assert_eq!(reply["data"]["tokens"], json!([]));
}

#[tokio::test]
async fn token_verbs_require_token_auth() {
    let bed = testbed(|_| {});
    let mut admin = bed.client();
    let reply = admin
        .request_admin(json!({ "janus": "list_tokens", "transaction": "a" }))
        .await;
    assert_eq!(reply["error"]["code"], 490);
}

#[tokio::test]
async fn admin_secret_is_checked_constant_time_and_separately() {
    let bed = testbed(|config| config.admin_secret = Some("adminpwd".to_string()));
    let mut admin = bed.client();

    let reply = admin
        .request_admin(json!({ "janus": "get_status", "transaction": "a1" }))
        .await;
    assert_eq!(reply["error"]["code"], 403);

    let reply = admin
        .request_admin(json!({
            "janus": "get_status",
            "transaction": "a2",
            "admin_secret": "adminpwd",
        }))
        .await;
    assert_eq!(reply["janus"], "success");

    // info is the one verb that needs no secret.
    let reply = admin
        .request_admin(json!({ "janus": "info", "transaction": "a3" }))
        .await;
    assert_eq!(reply["janus"], "server_info");
}

#[tokio::test]
async fn get_status_and_live_tuning() {
    let bed = testbed(|config| config.session_timeout = 60);
    let mut admin = bed.client();

    let reply = admin
        .request_admin(json!({ "janus": "get_status", "transaction": "s1" }))
        .await;
    assert_eq!(reply["status"]["session_timeout"], 60);
    assert_eq!(reply["status"]["token_auth"], false);
    assert_eq!(reply["status"]["max_nack_queue"], 300);

    let reply = admin
        .request_admin(json!({
            "janus": "set_session_timeout",
            "transaction": "s2",
            "timeout": 120,
        }))
        .await;
    assert_eq!(reply["timeout"], 120);
    assert_eq!(bed.gateway.tunables.session_timeout(), 120);

    // Log level bounds are validated.
    let reply = admin
        .request_admin(json!({
            "janus": "set_log_level",
            "transaction": "s3",
            "level": 9,
        }))
        .await;
    assert_eq!(reply["error"]["code"], 467);
    let reply = admin
        .request_admin(json!({
            "janus": "set_log_level",
            "transaction": "s4",
            "level": 6,
        }))
        .await;
    assert_eq!(reply["level"], 6);
    assert_eq!(bed.gateway.tunables.log_level(), 6);

    // NACK queue must be 0 or at least 200.
    let reply = admin
        .request_admin(json!({
            "janus": "set_max_nack_queue",
            "transaction": "s5",
            "max_nack_queue": 100,
        }))
        .await;
    assert_eq!(reply["error"]["code"], 467);
    let reply = admin
        .request_admin(json!({
            "janus": "set_max_nack_queue",
            "transaction": "s6",
            "max_nack_queue": 0,
        }))
        .await;
    assert_eq!(reply["max_nack_queue"], 0);

    let reply = admin
        .request_admin(json!({
            "janus": "set_log_timestamps",
            "transaction": "s7",
            "timestamps": true,
        }))
        .await;
    assert_eq!(reply["log_timestamps"], true);
    assert!(bed.gateway.tunables.log_timestamps());

    let reply = admin
        .request_admin(json!({
            "janus": "set_no_media_timer",
            "transaction": "s8",
            "no_media_timer": 5,
        }))
        .await;
    assert_eq!(reply["no_media_timer"], 5);
}

#[tokio::test]
async fn list_sessions_and_handles() {
    let bed = testbed(|_| {});
    let mut admin = bed.client();
    let mut client = bed.client();
    let session_id = create_session(&mut client).await;
    let handle_id = attach(&mut client, session_id, "mock.test").await;

    let reply = admin
        .request_admin(json!({ "janus": "list_sessions", "transaction": "l1" }))
        .await;
    let sessions = reply["sessions"].as_array().unwrap();
    assert!(sessions.iter().any(|s| s.as_u64() == Some(session_id)));

    let reply = admin
        .request_admin(json!({
            "janus": "list_handles",
            "transaction": "l2",
            "session_id": session_id,
        }))
        .await;
    let handles = reply["handles"].as_array().unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].as_u64(), Some(handle_id));
}

#[tokio::test]
async fn handle_info_reflects_negotiation_state() {
    let bed = testbed(|_| {});
    let mut admin = bed.client();
    let mut client = bed.client();
    let session_id = create_session(&mut client).await;
    let handle_id = attach(&mut client, session_id, "mock.test").await;

    let reply = admin
        .request_admin(json!({
            "janus": "handle_info",
            "transaction": "h1",
            "session_id": session_id,
            "handle_id": handle_id,
        }))
        .await;
    assert_eq!(reply["janus"], "success");
    let info = &reply["info"];
    assert_eq!(info["plugin"], "mock.test");
    assert_eq!(info["flags"]["got-offer"], false);
    assert_eq!(info["streams"], json!([]));

    let reply = client
        .request(json!({
            "janus": "message",
            "transaction": "m1",
            "session_id": session_id,
            "handle_id": handle_id,
            "body": {},
            "jsep": { "type": "offer", "sdp": offer_sdp() },
        }))
        .await;
    assert_eq!(reply["janus"], "ack");

    let reply = admin
        .request_admin(json!({
            "janus": "handle_info",
            "transaction": "h2",
            "session_id": session_id,
            "handle_id": handle_id,
        }))
        .await;
    let info = &reply["info"];
    assert_eq!(info["flags"]["got-offer"], true);
    assert_eq!(info["flags"]["got-answer"], false);
    assert_eq!(info["flags"]["has-audio"], true);
    assert_eq!(info["flags"]["has-video"], true);
    assert_eq!(info["ice-role"], "controlled");
    let stream = &info["streams"][0];
    assert_eq!(stream["id"], 1);
    assert_eq!(stream["ready"], 1);
    assert_eq!(stream["ssrc"]["audio-peer"], 1111);
    assert_eq!(stream["ssrc"]["video-peer"], 2222);
    assert_eq!(stream["ssrc"]["video-peer-sim-1"], 3333);
    assert!(info["sdps"]["remote"].as_str().is_some());
}

#[tokio::test]
async fn admin_rejects_unknown_paths_and_sessions() {
    let bed = testbed(|_| {});
    let mut admin = bed.client();

    let reply = admin
        .request_admin(json!({ "janus": "destroy", "transaction": "x" }))
        .await;
    assert_eq!(reply["error"]["code"], 457);

    let reply = admin
        .request_admin(json!({
            "janus": "list_handles",
            "transaction": "y",
            "session_id": 12345,
        }))
        .await;
    assert_eq!(reply["error"]["code"], 458);

    let reply = admin
        .request_admin(json!({ "janus": "query_eventhandler", "transaction": "z", "handler": "none" }))
        .await;
    assert_eq!(reply["error"]["code"], 460);
}
