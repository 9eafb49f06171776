//! Request ingestion and routing. One dispatcher task consumes the ingress
//! queue: admin verbs and cheap client verbs run on it directly, `message`
//! verbs (which may block inside a plugin for a long time) are spawned onto
//! the runtime so the queue never stalls behind a slow plugin.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::admin;
use crate::errors::ApiError;
use crate::gateway::Gateway;
use crate::negotiation::{self, WebRtcFlags};
use crate::plugin::PluginSession;
use crate::protocol;
use crate::session;
use crate::transport::{Transport, TransportSession};

/// An inbound message, immutable from dispatch onward: who to reply to,
/// the opaque request id the carrier wants echoed, and the decoded root.
pub struct Request {
    pub transport: Arc<dyn Transport>,
    pub instance: Arc<TransportSession>,
    pub request_id: Option<String>,
    pub admin: bool,
    pub message: Value,
}

impl Request {
    /// Sends a success payload back through the originating transport.
    pub async fn reply(&self, payload: Value) {
        debug!(
            transport = self.transport.package(),
            instance = self.instance.id,
            admin = self.admin,
            "sending API response"
        );
        if let Err(err) = self
            .transport
            .send_message(&self.instance, self.request_id.as_deref(), self.admin, payload)
            .await
        {
            debug!(%err, "failed to deliver response");
        }
    }

    /// Builds and sends the structured error reply.
    pub async fn reply_error(&self, session_id: u64, transaction: Option<&str>, err: ApiError) {
        debug!(
            code = err.code,
            reason = %err.reason,
            admin = self.admin,
            "returning API error"
        );
        self.reply(protocol::error_message(session_id, transaction, &err))
            .await;
    }
}

pub(crate) enum Inbound {
    Request(Request),
    /// Shutdown sentinel.
    Exit,
}

/// One-shots posted to the watchdog context so they never run under a
/// plugin's call stack.
pub(crate) enum Deferred {
    ClosePc(Arc<PluginSession>),
    EndSession(Arc<PluginSession>),
}

pub(crate) async fn run_dispatcher(gateway: Arc<Gateway>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    info!("requests handler started");
    while let Some(item) = rx.recv().await {
        let request = match item {
            Inbound::Exit => break,
            Inbound::Request(request) => request,
        };
        if request.admin {
            // Admin verbs serialize with respect to tuning changes.
            admin::process_request(&gateway, request).await;
            continue;
        }
        let verb = request
            .message
            .get("janus")
            .and_then(Value::as_str)
            .unwrap_or("");
        if verb.eq_ignore_ascii_case("message") {
            // Plugin-bound: may block arbitrarily, never on this task.
            let gateway = gateway.clone();
            tokio::spawn(async move {
                gateway.process_request(request).await;
            });
        } else {
            gateway.process_request(request).await;
        }
    }
    info!("requests handler stopped");
}

pub(crate) async fn run_watchdog(gateway: Arc<Gateway>, mut deferred: mpsc::UnboundedReceiver<Deferred>) {
    info!("sessions watchdog started");
    let mut ticker = interval(Duration::from_secs(2));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if gateway.is_stopping() {
                    break;
                }
                session::sweep_sessions(&gateway).await;
            }
            task = deferred.recv() => {
                let Some(task) = task else { break };
                run_deferred(&gateway, task).await;
            }
        }
    }
    info!("sessions watchdog stopped");
}

async fn run_deferred(gateway: &Gateway, task: Deferred) {
    match task {
        Deferred::ClosePc(plugin_session) => {
            let Some(handle) = plugin_session.handle() else {
                return;
            };
            if handle.flags.is_set(WebRtcFlags::STOP) || handle.flags.is_set(WebRtcFlags::ALERT) {
                return;
            }
            debug!(handle = handle.id, "plugin asked to hang up the peer connection");
            negotiation::webrtc_hangup(gateway, &handle, "Close PC").await;
        }
        Deferred::EndSession(plugin_session) => {
            let Some(handle) = plugin_session.handle() else {
                return;
            };
            if handle.flags.is_set(WebRtcFlags::STOP) {
                return;
            }
            let Some(session) = handle.session() else {
                return;
            };
            debug!(handle = handle.id, "plugin asked to end the handle");
            session.remove_handle(gateway, &handle).await;
        }
    }
}
