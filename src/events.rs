//! Event-handler subsystem. Handlers register at startup and receive typed
//! notifications about session, handle, negotiation and plugin activity;
//! dispatch is best-effort and must never block the signaling paths, so
//! handlers are expected to queue internally.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::protocol::ComponentInfo;

pub const TYPE_SESSION: u32 = 1 << 0;
pub const TYPE_HANDLE: u32 = 1 << 1;
pub const TYPE_JSEP: u32 = 1 << 3;
pub const TYPE_WEBRTC: u32 = 1 << 4;
pub const TYPE_MEDIA: u32 = 1 << 5;
pub const TYPE_PLUGIN: u32 = 1 << 6;
pub const TYPE_TRANSPORT: u32 = 1 << 7;
pub const TYPE_CORE: u32 = 1 << 8;

pub trait EventHandler: Send + Sync {
    fn package(&self) -> &str;
    fn name(&self) -> &str;
    fn author(&self) -> &str {
        "unknown"
    }
    fn description(&self) -> &str {
        ""
    }
    fn version(&self) -> u32 {
        1
    }
    fn version_string(&self) -> &str {
        "0.0.1"
    }
    /// Bitmask of `TYPE_*` values this handler wants.
    fn events_mask(&self) -> u32 {
        u32::MAX
    }
    fn handle_event(&self, event: Value);
    /// Admin `query_eventhandler` hook.
    fn handle_request(&self, _request: Value) -> Option<Value> {
        None
    }
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .insert(handler.package().to_string(), handler);
    }

    pub fn is_enabled(&self) -> bool {
        !self.handlers.read().is_empty()
    }

    pub fn get(&self, package: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.read().get(package).cloned()
    }

    pub fn metadata(&self) -> Vec<ComponentInfo> {
        self.handlers
            .read()
            .values()
            .map(|h| ComponentInfo {
                package: h.package().to_string(),
                name: h.name().to_string(),
                author: h.author().to_string(),
                description: h.description().to_string(),
                version: h.version(),
                version_string: h.version_string().to_string(),
            })
            .collect()
    }

    fn dispatch(&self, etype: u32, event: Value) {
        let handlers = self.handlers.read();
        for handler in handlers.values() {
            if handler.events_mask() & etype != 0 {
                handler.handle_event(event.clone());
            }
        }
    }

    fn envelope(etype: u32, session_id: u64, handle_id: u64, opaque_id: Option<&str>) -> Value {
        let mut event = json!({
            "type": etype,
            "timestamp": crate::monotonic_micros(),
        });
        if session_id > 0 {
            event["session_id"] = json!(session_id);
        }
        if handle_id > 0 {
            event["handle_id"] = json!(handle_id);
        }
        if let Some(opaque) = opaque_id {
            event["opaque_id"] = json!(opaque);
        }
        event
    }

    pub fn notify_session(&self, session_id: u64, name: &str, extra: Option<Value>) {
        if !self.is_enabled() {
            return;
        }
        let mut event = Self::envelope(TYPE_SESSION, session_id, 0, None);
        let mut body = json!({ "name": name });
        if let Some(extra) = extra {
            body["transport"] = extra;
        }
        event["event"] = body;
        self.dispatch(TYPE_SESSION, event);
    }

    pub fn notify_handle(
        &self,
        session_id: u64,
        handle_id: u64,
        opaque_id: Option<&str>,
        name: &str,
        plugin: &str,
    ) {
        if !self.is_enabled() {
            return;
        }
        let mut event = Self::envelope(TYPE_HANDLE, session_id, handle_id, opaque_id);
        event["event"] = json!({ "name": name, "plugin": plugin });
        self.dispatch(TYPE_HANDLE, event);
    }

    /// `owner` is "remote" for client-originated JSEPs, "local" for
    /// plugin-originated ones.
    pub fn notify_jsep(
        &self,
        session_id: u64,
        handle_id: u64,
        opaque_id: Option<&str>,
        owner: &str,
        jsep_type: &str,
        sdp: &str,
    ) {
        if !self.is_enabled() {
            return;
        }
        let mut event = Self::envelope(TYPE_JSEP, session_id, handle_id, opaque_id);
        event["event"] = json!({
            "owner": owner,
            "jsep": { "type": jsep_type, "sdp": sdp },
        });
        self.dispatch(TYPE_JSEP, event);
    }

    pub fn notify_webrtc(
        &self,
        session_id: u64,
        handle_id: u64,
        opaque_id: Option<&str>,
        body: Value,
    ) {
        if !self.is_enabled() {
            return;
        }
        let mut event = Self::envelope(TYPE_WEBRTC, session_id, handle_id, opaque_id);
        event["event"] = body;
        self.dispatch(TYPE_WEBRTC, event);
    }

    pub fn notify_plugin(
        &self,
        session_id: u64,
        handle_id: u64,
        opaque_id: Option<&str>,
        plugin: &str,
        body: Value,
    ) {
        if !self.is_enabled() {
            return;
        }
        let mut event = Self::envelope(TYPE_PLUGIN, session_id, handle_id, opaque_id);
        event["event"] = json!({ "plugin": plugin, "data": body });
        self.dispatch(TYPE_PLUGIN, event);
    }

    pub fn notify_transport(&self, transport: &str, instance_id: u64, body: Value) {
        if !self.is_enabled() {
            return;
        }
        let mut event = Self::envelope(TYPE_TRANSPORT, 0, 0, None);
        event["event"] = json!({
            "transport": transport,
            "id": instance_id,
            "data": body,
        });
        self.dispatch(TYPE_TRANSPORT, event);
    }
}
