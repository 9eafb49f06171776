//! Plugin-facing interface: the trait media plugins implement, the opaque
//! per-handle plugin session, and the callbacks the core exposes back to
//! plugins (`push_event`, the relay fast paths, deferred teardown).

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::dispatcher::Deferred;
use crate::errors::{code, ApiError};
use crate::gateway::Gateway;
use crate::negotiation::{self, WebRtcFlags};
use crate::protocol;
use crate::session::Handle;

/// Minimum plugin API version the core accepts. Plugins compiled against an
/// older interface are rejected at registration.
pub const PLUGIN_API_VERSION: u32 = 8;

/// Outcome of `handle_message`: a synchronous answer, an ack with more to
/// follow asynchronously, or an error forwarded verbatim to the client.
#[derive(Debug)]
pub enum PluginResult {
    Ok(Value),
    OkWait(Option<String>),
    Error(String),
}

/// The opaque per-handle context a plugin holds on to. It only weakly
/// references the owning handle, so a plugin keeping it past `end_session`
/// cannot extend the handle's life; every core entry point re-validates it.
pub struct PluginSession {
    handle: OnceLock<Weak<Handle>>,
    stopped: AtomicBool,
    /// Plugin-owned state slot.
    pub data: Mutex<Option<Box<dyn Any + Send>>>,
}

impl PluginSession {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            handle: OnceLock::new(),
            stopped: AtomicBool::new(false),
            data: Mutex::new(None),
        })
    }

    pub(crate) fn bind(&self, handle: &Arc<Handle>) {
        let _ = self.handle.set(Arc::downgrade(handle));
    }

    pub fn handle(&self) -> Option<Arc<Handle>> {
        self.handle.get().and_then(Weak::upgrade)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn api_version(&self) -> u32 {
        PLUGIN_API_VERSION
    }
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

    /// Called once at registration with the core's callback surface.
    fn init(&self, core: Arc<dyn CoreCallbacks>) -> Result<()>;
    fn destroy(&self) {}

    async fn create_session(&self, session: &Arc<PluginSession>) -> Result<(), String>;
    fn query_session(&self, _session: &Arc<PluginSession>) -> Option<Value> {
        None
    }
    async fn destroy_session(&self, session: &Arc<PluginSession>);

    async fn handle_message(
        &self,
        session: &Arc<PluginSession>,
        transaction: &str,
        body: Value,
        jsep: Option<Value>,
    ) -> PluginResult;

    /// The peer connection came up.
    async fn setup_media(&self, _session: &Arc<PluginSession>) {}
    /// The peer connection is going away.
    async fn hangup_media(&self, _session: &Arc<PluginSession>) {}

    fn incoming_rtp(&self, _session: &Arc<PluginSession>, _video: bool, _buf: &[u8]) {}
    fn incoming_rtcp(&self, _session: &Arc<PluginSession>, _video: bool, _buf: &[u8]) {}
    fn incoming_data(&self, _session: &Arc<PluginSession>, _buf: &[u8]) {}
}

/// The upward API plugins call into the core with.
#[async_trait]
pub trait CoreCallbacks: Send + Sync {
    /// Sends an event (optionally carrying a JSEP offer/answer) to the
    /// client that owns the plugin session.
    async fn push_event(
        &self,
        session: &Arc<PluginSession>,
        transaction: Option<&str>,
        body: Value,
        jsep: Option<Value>,
    ) -> Result<(), ApiError>;

    /// Media fast paths: silently dropped once the handle is stopped or
    /// alerted.
    fn relay_rtp(&self, session: &Arc<PluginSession>, video: bool, buf: &[u8]);
    fn relay_rtcp(&self, session: &Arc<PluginSession>, video: bool, buf: &[u8]);
    fn relay_data(&self, session: &Arc<PluginSession>, buf: &[u8]);

    /// Asks the core to hang up the peer connection. Runs on the watchdog
    /// context, never under the plugin's call stack.
    fn close_pc(&self, session: &Arc<PluginSession>);
    /// Asks the core to tear down the whole handle. Also deferred.
    fn end_session(&self, session: &Arc<PluginSession>);

    fn events_enabled(&self) -> bool;
    fn notify_event(&self, plugin: &str, session: Option<&Arc<PluginSession>>, event: Value);
}

fn live_handle(session: &Arc<PluginSession>) -> Result<Arc<Handle>, ApiError> {
    if session.is_stopped() {
        return Err(ApiError::from_code(code::SESSION_NOT_FOUND));
    }
    let handle = session
        .handle()
        .ok_or_else(|| ApiError::from_code(code::SESSION_NOT_FOUND))?;
    if handle.flags.is_set(WebRtcFlags::STOP) {
        return Err(ApiError::from_code(code::SESSION_NOT_FOUND));
    }
    Ok(handle)
}

#[async_trait]
impl CoreCallbacks for Gateway {
    async fn push_event(
        &self,
        plugin_session: &Arc<PluginSession>,
        transaction: Option<&str>,
        body: Value,
        jsep: Option<Value>,
    ) -> Result<(), ApiError> {
        let handle = live_handle(plugin_session)?;
        let session = handle
            .session()
            .filter(|s| !s.is_destroyed())
            .ok_or_else(|| ApiError::from_code(code::SESSION_NOT_FOUND))?;
        if !body.is_object() {
            debug!(handle = handle.id, "cannot push event: body is not an object");
            return Err(ApiError::from_code(code::INVALID_JSON_OBJECT));
        }

        let mut restart = false;
        let mut merged_jsep = None;
        let mut local_sdp_type = None;
        if let Some(jsep) = &jsep {
            let sdp_type = jsep.get("type").and_then(Value::as_str);
            let sdp = jsep.get("sdp").and_then(Value::as_str);
            restart = sdp.is_some()
                && jsep.get("restart").and_then(Value::as_bool).unwrap_or(false);
            if let (Some(sdp_type), Some(sdp)) = (sdp_type, sdp) {
                match negotiation::plugin_handle_sdp(self, &handle, sdp_type, sdp, restart).await {
                    Ok(merged) => {
                        local_sdp_type = Some(sdp_type.to_string());
                        merged_jsep = Some(merged);
                    }
                    Err(err) => {
                        if handle.flags.is_set(WebRtcFlags::STOP)
                            || handle.flags.is_set(WebRtcFlags::ALERT)
                        {
                            debug!(
                                handle = handle.id,
                                "cannot push event: handle not available anymore"
                            );
                            return Err(ApiError::from_code(code::HANDLE_NOT_FOUND));
                        }
                        debug!(handle = handle.id, %err, "cannot push event: problem with the SDP");
                        return Err(ApiError::new(code::JSEP_INVALID_SDP, err.reason));
                    }
                }
            }
        }

        let mut event = protocol::message("event", session.id, transaction);
        event["sender"] = json!(handle.id);
        event["plugindata"] = json!({
            "plugin": handle.plugin.package(),
            "data": body,
        });
        let merged_sdp = merged_jsep
            .as_ref()
            .and_then(|j| j.get("sdp"))
            .and_then(Value::as_str)
            .map(String::from);
        if let Some(jsep) = merged_jsep {
            event["jsep"] = jsep;
        }
        session.notify_event(event).await;

        if (restart || handle.flags.is_set(WebRtcFlags::RESEND_TRICKLES)) && self.full_trickle() {
            negotiation::resend_trickles(&handle).await;
        }

        if let (Some(sdp_type), Some(sdp)) = (local_sdp_type, merged_sdp) {
            self.events.notify_jsep(
                session.id,
                handle.id,
                handle.opaque_id.as_deref(),
                "local",
                &sdp_type,
                &sdp,
            );
        }
        Ok(())
    }

    fn relay_rtp(&self, session: &Arc<PluginSession>, video: bool, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let Ok(handle) = live_handle(session) else {
            return;
        };
        if handle.flags.is_set(WebRtcFlags::ALERT) {
            return;
        }
        let mut agent_guard = handle.agent.lock();
        if let Some(agent) = agent_guard.as_mut() {
            agent.record_rtp(video, buf.len(), true);
        }
    }

    fn relay_rtcp(&self, session: &Arc<PluginSession>, video: bool, buf: &[u8]) {
        // RTCP shares the RTP accounting on the facade.
        self.relay_rtp(session, video, buf);
    }

    fn relay_data(&self, session: &Arc<PluginSession>, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let Ok(handle) = live_handle(session) else {
            return;
        };
        if handle.flags.is_set(WebRtcFlags::ALERT) {
            return;
        }
        if !Gateway::SCTP_SUPPORT {
            warn!("asked to relay data, but data channel support is not compiled in");
            return;
        }
        let mut agent_guard = handle.agent.lock();
        if let Some(agent) = agent_guard.as_mut() {
            agent.record_data(buf.len(), true);
        }
    }

    fn close_pc(&self, session: &Arc<PluginSession>) {
        if live_handle(session).is_err() {
            return;
        }
        self.defer(Deferred::ClosePc(session.clone()));
    }

    fn end_session(&self, session: &Arc<PluginSession>) {
        if live_handle(session).is_err() {
            return;
        }
        self.defer(Deferred::EndSession(session.clone()));
    }

    fn events_enabled(&self) -> bool {
        self.events.is_enabled()
    }

    fn notify_event(&self, plugin: &str, session: Option<&Arc<PluginSession>>, event: Value) {
        if !event.is_object() {
            return;
        }
        let mut session_id = 0;
        let mut handle_id = 0;
        let mut opaque_id = None;
        if let Some(plugin_session) = session {
            let Ok(handle) = live_handle(plugin_session) else {
                return;
            };
            handle_id = handle.id;
            opaque_id = handle.opaque_id.clone();
            session_id = handle.session_id;
        }
        self.events
            .notify_plugin(session_id, handle_id, opaque_id.as_deref(), plugin, event);
    }
}
