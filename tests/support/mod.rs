//! Shared fixtures: a gateway wired to the in-process channel transport,
//! the echo plugin, and a scriptable mock plugin the tests drive directly.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use boardwalk::echo::EchoPlugin;
use boardwalk::errors::ApiError;
use boardwalk::plugin::{CoreCallbacks, Plugin, PluginResult, PluginSession};
use boardwalk::transport::{ChannelClient, ChannelTransport, OutboundMessage};
use boardwalk::{Config, Gateway};

/// Plugin whose asynchronous pushes are triggered by the test, so event
/// ordering stays deterministic.
pub struct MockPlugin {
    core: OnceLock<Arc<dyn CoreCallbacks>>,
    pub sessions: Mutex<Vec<Arc<PluginSession>>>,
    pub messages: Mutex<Vec<(String, Value, Option<Value>)>>,
    pub setups: AtomicUsize,
    pub hangups: AtomicUsize,
    pub destroys: AtomicUsize,
}

impl MockPlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            core: OnceLock::new(),
            sessions: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            setups: AtomicUsize::new(0),
            hangups: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        })
    }

    pub fn core(&self) -> Arc<dyn CoreCallbacks> {
        self.core.get().expect("plugin not registered").clone()
    }

    pub fn last_session(&self) -> Arc<PluginSession> {
        self.sessions.lock().last().expect("no plugin session").clone()
    }

    pub fn last_message(&self) -> (String, Value, Option<Value>) {
        self.messages.lock().last().expect("no message seen").clone()
    }

    /// Answers the most recent offer, echoing its SDP back.
    pub async fn push_answer(&self) -> Result<(), ApiError> {
        let (transaction, _, jsep) = self.last_message();
        let offer = jsep.expect("no jsep in last message");
        let sdp = offer["sdp"].as_str().expect("offer without sdp").to_string();
        let answer = json!({ "type": "answer", "sdp": sdp });
        self.core()
            .push_event(
                &self.last_session(),
                Some(&transaction),
                json!({ "mock": "answer" }),
                Some(answer),
            )
            .await
    }

    pub async fn push(&self, body: Value, jsep: Option<Value>) -> Result<(), ApiError> {
        self.core()
            .push_event(&self.last_session(), Some("mock-push"), body, jsep)
            .await
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn package(&self) -> &str {
        "mock.test"
    }

    fn name(&self) -> &str {
        "Mock plugin"
    }

    fn init(&self, core: Arc<dyn CoreCallbacks>) -> anyhow::Result<()> {
        let _ = self.core.set(core);
        Ok(())
    }

    async fn create_session(&self, session: &Arc<PluginSession>) -> Result<(), String> {
        self.sessions.lock().push(session.clone());
        Ok(())
    }

    async fn destroy_session(&self, _session: &Arc<PluginSession>) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }

    async fn handle_message(
        &self,
        _session: &Arc<PluginSession>,
        transaction: &str,
        body: Value,
        jsep: Option<Value>,
    ) -> PluginResult {
        self.messages
            .lock()
            .push((transaction.to_string(), body.clone(), jsep));
        if body.get("sync").and_then(Value::as_bool) == Some(true) {
            return PluginResult::Ok(json!({ "mock": "ok" }));
        }
        if body.get("fail").and_then(Value::as_bool) == Some(true) {
            return PluginResult::Error("mock failure".to_string());
        }
        PluginResult::OkWait(None)
    }

    async fn setup_media(&self, _session: &Arc<PluginSession>) {
        self.setups.fetch_add(1, Ordering::SeqCst);
    }

    async fn hangup_media(&self, _session: &Arc<PluginSession>) {
        self.hangups.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct TestBed {
    pub gateway: Arc<Gateway>,
    pub transport: Arc<ChannelTransport>,
    pub mock: Arc<MockPlugin>,
}

impl TestBed {
    pub fn client(&self) -> TestClient {
        TestClient {
            inner: ChannelClient::connect(self.gateway.clone(), self.transport.clone()),
        }
    }
}

pub fn testbed(configure: impl FnOnce(&mut Config)) -> TestBed {
    let mut config = Config::default();
    configure(&mut config);
    let gateway = Gateway::new(config);
    gateway.register_plugin(EchoPlugin::new()).unwrap();
    let mock = MockPlugin::new();
    gateway.register_plugin(mock.clone()).unwrap();
    let transport = ChannelTransport::new();
    gateway.register_transport(transport.clone());
    gateway.start();
    TestBed {
        gateway,
        transport,
        mock,
    }
}

pub struct TestClient {
    pub inner: ChannelClient,
}

impl TestClient {
    /// Client-API request: send and wait for the next delivery.
    pub async fn request(&mut self, message: Value) -> Value {
        self.inner.send(message);
        self.recv().await
    }

    /// Admin-API request.
    pub async fn request_admin(&mut self, message: Value) -> Value {
        self.inner.send_admin(message);
        self.recv().await
    }

    /// Next reply or event, with a guard against hangs.
    pub async fn recv(&mut self) -> Value {
        self.recv_outbound().await.payload
    }

    pub async fn recv_outbound(&mut self) -> OutboundMessage {
        tokio::time::timeout(Duration::from_secs(5), self.inner.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("transport channel closed")
    }
}

/// A realistic enough audio+video offer with credentials, a candidate and
/// simulcast video SSRCs.
pub fn offer_sdp() -> String {
    [
        "v=0",
        "o=- 1 1 IN IP4 192.168.0.2",
        "s=session",
        "t=0 0",
        "m=audio 9 UDP/TLS/RTP/SAVPF 111",
        "a=ice-ufrag:remoteu",
        "a=ice-pwd:remotepwd",
        "a=fingerprint:sha-256 AA:BB:CC",
        "a=setup:actpass",
        "a=candidate:1 1 udp 2013266431 192.168.0.2 40000 typ host",
        "a=ssrc:1111 cname:audio",
        "m=video 9 UDP/TLS/RTP/SAVPF 96",
        "a=ssrc:2222 cname:video",
        "a=ssrc:3333 cname:video",
    ]
    .join("\r\n")
}

/// Same offer with different ICE credentials, as a restarting browser
/// would send it.
pub fn restart_offer_sdp() -> String {
    offer_sdp()
        .replace("a=ice-ufrag:remoteu", "a=ice-ufrag:restartu")
        .replace("a=ice-pwd:remotepwd", "a=ice-pwd:restartpwd")
}

pub fn candidate_obj() -> Value {
    json!({
        "candidate": "candidate:2 1 udp 1677729535 203.0.113.4 41000 typ srflx",
        "sdpMid": "0",
        "sdpMLineIndex": 0,
    })
}

/// Runs `create` and returns the new session id.
pub async fn create_session(client: &mut TestClient) -> u64 {
    let reply = client
        .request(json!({ "janus": "create", "transaction": "create" }))
        .await;
    assert_eq!(reply["janus"], "success", "create failed: {reply}");
    reply["data"]["id"].as_u64().unwrap()
}

/// Attaches to a plugin and returns the new handle id.
pub async fn attach(client: &mut TestClient, session_id: u64, plugin: &str) -> u64 {
    let reply = client
        .request(json!({
            "janus": "attach",
            "transaction": "attach",
            "session_id": session_id,
            "plugin": plugin,
        }))
        .await;
    assert_eq!(reply["janus"], "success", "attach failed: {reply}");
    reply["data"]["id"].as_u64().unwrap()
}
