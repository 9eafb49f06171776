//! Transport-facing interface. Carriers (WebSocket, HTTP, ...) live outside
//! the core: they hand decoded envelopes in through [`crate::gateway::Gateway::incoming_request`]
//! and get replies and events back through their [`TransportSession`]'s
//! outbound channel. The in-process [`ChannelTransport`] here is the carrier
//! used by embedders and the integration tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::gateway::Gateway;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// A reply or event on its way out through a transport.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub request_id: Option<String>,
    pub admin: bool,
    pub payload: Value,
}

/// One client connection as seen by the core. Shared (`Arc`) between the
/// carrier, every in-flight request that arrived on it, and the sessions it
/// originated; the carrier marks it `gone` when the connection dies.
#[derive(Debug)]
pub struct TransportSession {
    pub id: u64,
    tx: mpsc::UnboundedSender<OutboundMessage>,
    gone: AtomicBool,
}

impl TransportSession {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
                tx,
                gone: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn send(&self, message: OutboundMessage) -> bool {
        !self.is_gone() && self.tx.send(message).is_ok()
    }

    pub fn mark_gone(&self) {
        self.gone.store(true, Ordering::Release);
    }

    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
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
    fn is_janus_api_enabled(&self) -> bool;
    fn is_admin_api_enabled(&self) -> bool;

    /// Delivers a reply or event to one connection. The default forwards to
    /// the session's outbound channel; carriers with their own write path
    /// may override.
    async fn send_message(
        &self,
        instance: &TransportSession,
        request_id: Option<&str>,
        admin: bool,
        payload: Value,
    ) -> Result<()> {
        let sent = instance.send(OutboundMessage {
            request_id: request_id.map(String::from),
            admin,
            payload,
        });
        if !sent {
            bail!("transport session {} is gone", instance.id);
        }
        Ok(())
    }

    /// A session was created on this connection.
    async fn session_created(&self, _instance: &TransportSession, _session_id: u64) {}

    /// A session bound to this connection is over. `forced` distinguishes a
    /// timeout/teardown from a client-requested destroy.
    async fn session_over(&self, _instance: &TransportSession, _session_id: u64, _forced: bool) {}
}

/// Lifecycle notifications recorded by the channel transport, mostly for
/// tests and embedders that poll instead of overriding the trait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    SessionCreated {
        instance: u64,
        session_id: u64,
    },
    SessionOver {
        instance: u64,
        session_id: u64,
        forced: bool,
    },
}

/// In-process carrier: a paired unbounded channel per connection.
pub struct ChannelTransport {
    events: Mutex<Vec<TransportEvent>>,
}

impl ChannelTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn package(&self) -> &str {
        "boardwalk.transport.channel"
    }

    fn name(&self) -> &str {
        "In-process channel transport"
    }

    fn description(&self) -> &str {
        "Paired-channel carrier for embedders and tests"
    }

    fn is_janus_api_enabled(&self) -> bool {
        true
    }

    fn is_admin_api_enabled(&self) -> bool {
        true
    }

    async fn session_created(&self, instance: &TransportSession, session_id: u64) {
        self.events.lock().push(TransportEvent::SessionCreated {
            instance: instance.id,
            session_id,
        });
    }

    async fn session_over(&self, instance: &TransportSession, session_id: u64, forced: bool) {
        self.events.lock().push(TransportEvent::SessionOver {
            instance: instance.id,
            session_id,
            forced,
        });
    }
}

/// One connected client over the channel transport.
pub struct ChannelClient {
    gateway: Arc<Gateway>,
    transport: Arc<ChannelTransport>,
    pub instance: Arc<TransportSession>,
    rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl ChannelClient {
    pub fn connect(gateway: Arc<Gateway>, transport: Arc<ChannelTransport>) -> Self {
        let (instance, rx) = TransportSession::new();
        Self {
            gateway,
            transport,
            instance,
            rx,
        }
    }

    /// Enqueues a client-API message.
    pub fn send(&self, message: Value) {
        self.gateway.incoming_request(
            self.transport.clone(),
            self.instance.clone(),
            None,
            false,
            message,
        );
    }

    /// Enqueues an admin-API message.
    pub fn send_admin(&self, message: Value) {
        self.gateway.incoming_request(
            self.transport.clone(),
            self.instance.clone(),
            None,
            true,
            message,
        );
    }

    /// Next reply or event delivered to this connection.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.rx.recv().await
    }

    /// The connection dropped: tell the core so bound sessions get reaped.
    pub async fn disconnect(&self) {
        self.instance.mark_gone();
        self.gateway.transport_gone(&self.instance).await;
    }
}
