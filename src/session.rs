//! Sessions, handles and the global registry, plus the idle sweeper that
//! reaps sessions with no recent activity.
//!
//! Ownership: the registry's map holds the strong reference to a session;
//! a session's handle map holds the strong references to its handles.
//! Everything else (in-flight requests, plugin sessions, callbacks) holds
//! `Arc` clones or `Weak` back-pointers for the duration of a call, so map
//! removal plus the last in-flight drop is what actually frees things.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::{code, ApiError};
use crate::gateway::Gateway;
use crate::ice::{IceAgent, PacketDump};
use crate::negotiation::{self, WebRtcFlags};
use crate::plugin::{Plugin, PluginSession};
use crate::protocol;
use crate::transport::{Transport, TransportSession};

/// Where to send replies and events for a session: the transport module it
/// was created on plus the connection it arrived over.
#[derive(Clone)]
pub struct SessionSource {
    pub transport: Arc<dyn Transport>,
    pub instance: Arc<TransportSession>,
}

pub struct Session {
    pub id: u64,
    /// Monotonic µs of the last authorized verb naming this session.
    last_activity: AtomicI64,
    destroyed: AtomicBool,
    timed_out: AtomicBool,
    source: Mutex<Option<SessionSource>>,
    handles: DashMap<u64, Arc<Handle>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .field("timed_out", &self.timed_out.load(Ordering::Relaxed))
            .finish()
    }
}

impl Session {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            last_activity: AtomicI64::new(crate::monotonic_micros()),
            destroyed: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            source: Mutex::new(None),
            handles: DashMap::new(),
        })
    }

    pub fn touch(&self) {
        self.last_activity
            .store(crate::monotonic_micros(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Flips the destroyed latch; true only for the caller that won.
    pub(crate) fn mark_destroyed(&self) -> bool {
        self.destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// Flips the timeout latch; only the sweeper calls this.
    pub(crate) fn mark_timed_out(&self) -> bool {
        self.timed_out
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn bind_source(&self, source: SessionSource) {
        *self.source.lock() = Some(source);
    }

    pub fn source(&self) -> Option<SessionSource> {
        self.source.lock().clone()
    }

    /// Sends an event to the session's transport binding, if it is still
    /// there. Events for sessions without a live binding are dropped.
    pub async fn notify_event(&self, event: Value) {
        if self.is_destroyed() {
            return;
        }
        let Some(source) = self.source() else {
            return;
        };
        if source.instance.is_gone() {
            return;
        }
        let _ = source
            .transport
            .send_message(&source.instance, None, false, event)
            .await;
    }

    pub fn find_handle(&self, handle_id: u64) -> Option<Arc<Handle>> {
        self.handles.get(&handle_id).map(|h| h.value().clone())
    }

    pub fn handle_ids(&self) -> Vec<u64> {
        self.handles.iter().map(|h| *h.key()).collect()
    }

    /// Destroys one handle and unlinks it.
    pub async fn remove_handle(&self, gateway: &Gateway, handle: &Arc<Handle>) {
        handle.destroy(gateway).await;
        self.handles.remove(&handle.id);
    }

    /// Destroys and unlinks every handle.
    pub async fn clear_handles(&self, gateway: &Gateway) {
        let handles: Vec<Arc<Handle>> = self.handles.iter().map(|h| h.value().clone()).collect();
        for handle in handles {
            handle.destroy(gateway).await;
            self.handles.remove(&handle.id);
        }
    }
}

/// One peer-connection attachment to a plugin, inside a session.
pub struct Handle {
    pub id: u64,
    pub session_id: u64,
    session: Weak<Session>,
    /// Client-chosen correlator, opaque to the core.
    pub opaque_id: Option<String>,
    /// Monotonic µs at creation.
    pub created: i64,
    pub plugin: Arc<dyn Plugin>,
    pub plugin_session: Arc<PluginSession>,
    pub flags: WebRtcFlags,
    pub agent: Mutex<Option<IceAgent>>,
    pub local_sdp: Mutex<Option<String>>,
    pub remote_sdp: Mutex<Option<String>>,
    pub pending_trickles: Mutex<Vec<TrickleCandidate>>,
    pub dump_packets: AtomicBool,
    pub packet_dump: Mutex<Option<PacketDump>>,
    /// Serializes offer/answer processing for this handle.
    pub(crate) negotiating: tokio::sync::Mutex<()>,
}

impl Handle {
    /// Creates a handle, attaches the plugin and links it into the session.
    pub(crate) async fn create(
        gateway: &Gateway,
        session: &Arc<Session>,
        plugin: Arc<dyn Plugin>,
        opaque_id: Option<String>,
    ) -> Result<Arc<Handle>, ApiError> {
        let mut id: u64 = rand::thread_rng().gen();
        while id == 0 || session.handles.contains_key(&id) {
            id = rand::thread_rng().gen();
        }
        let plugin_session = PluginSession::new();
        let handle = Arc::new(Handle {
            id,
            session_id: session.id,
            session: Arc::downgrade(session),
            opaque_id,
            created: crate::monotonic_micros(),
            plugin,
            plugin_session: plugin_session.clone(),
            flags: WebRtcFlags::new(),
            agent: Mutex::new(None),
            local_sdp: Mutex::new(None),
            remote_sdp: Mutex::new(None),
            pending_trickles: Mutex::new(Vec::new()),
            dump_packets: AtomicBool::new(false),
            packet_dump: Mutex::new(None),
            negotiating: tokio::sync::Mutex::new(()),
        });
        plugin_session.bind(&handle);
        if let Err(cause) = handle.plugin.create_session(&plugin_session).await {
            return Err(ApiError::new(
                code::PLUGIN_ATTACH,
                format!("Couldn't attach to plugin: {cause}"),
            ));
        }
        session.handles.insert(handle.id, handle.clone());
        debug!(session = session.id, handle = handle.id, plugin = handle.plugin.package(), "handle attached");
        gateway.events.notify_handle(
            session.id,
            handle.id,
            handle.opaque_id.as_deref(),
            "attached",
            handle.plugin.package(),
        );
        Ok(handle)
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    /// Tears down the handle: detaches the plugin, frees the WebRTC state.
    /// Idempotent through the STOP latch.
    pub(crate) async fn destroy(self: &Arc<Self>, gateway: &Gateway) {
        if !self.flags.set_once(WebRtcFlags::STOP) {
            return;
        }
        self.plugin_session.stop();
        self.plugin.destroy_session(&self.plugin_session).await;
        negotiation::webrtc_free(self);
        debug!(session = self.session_id, handle = self.id, "handle detached");
        gateway.events.notify_handle(
            self.session_id,
            self.id,
            self.opaque_id.as_deref(),
            "detached",
            self.plugin.package(),
        );
    }
}

/// A trickled candidate received before the answer landed, kept for replay.
#[derive(Debug, Clone)]
pub struct TrickleCandidate {
    pub transaction: String,
    /// A single candidate object or an array of them.
    pub candidate: Value,
    /// Monotonic µs at reception; stale entries are dropped at drain time.
    pub received: i64,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session. `id_hint == 0` means pick a random free id;
    /// a non-zero hint that is already taken is a conflict.
    pub fn create(&self, id_hint: u64) -> Result<Arc<Session>, ApiError> {
        let mut id = id_hint;
        loop {
            if id == 0 {
                id = rand::thread_rng().gen();
                if id == 0 {
                    continue;
                }
            }
            match self.sessions.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    if id_hint != 0 {
                        return Err(ApiError::new(
                            code::SESSION_CONFLICT,
                            "Session ID already in use",
                        ));
                    }
                    id = 0;
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    let session = Session::new(id);
                    info!(session = id, "creating new session");
                    entry.insert(session.clone());
                    return Ok(session);
                }
            }
        }
    }

    pub fn find(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    /// Unlinks a session from the registry. The caller is expected to
    /// follow up with `destroy_session`.
    pub fn remove(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.sessions.iter().map(|s| *s.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }
}

/// Destroys a session's contents. Does not remove it from the registry:
/// callers unlink first (under the map), then destroy, so a session is
/// never reachable in a destroyed state.
pub(crate) async fn destroy_session(gateway: &Gateway, session: &Arc<Session>) {
    if !session.mark_destroyed() {
        return;
    }
    info!(session = session.id, "destroying session");
    session.clear_handles(gateway).await;
}

/// One sweep of the sessions map: collect-then-reap so no map shard stays
/// locked while transports get notified. The CAS on the timeout latch keeps
/// a racing keepalive from resurrecting a session mid-reap and guarantees a
/// single timeout notification.
pub(crate) async fn sweep_sessions(gateway: &Gateway) {
    let timeout_secs = gateway.tunables.session_timeout();
    if timeout_secs < 1 {
        return;
    }
    let now = crate::monotonic_micros();
    let deadline = timeout_secs as i64 * 1_000_000;
    let mut expired = Vec::new();
    for session in gateway.sessions.snapshot() {
        if session.is_destroyed() {
            continue;
        }
        if now - session.last_activity() >= deadline && session.mark_timed_out() {
            expired.push(session);
        }
    }
    for session in expired {
        info!(session = session.id, "timeout expired for session");
        session.clear_handles(gateway).await;
        if let Some(source) = session.source() {
            let event = protocol::message("timeout", session.id, None);
            let _ = source
                .transport
                .send_message(&source.instance, None, false, event)
                .await;
            source
                .transport
                .session_over(&source.instance, session.id, true)
                .await;
        }
        gateway.events.notify_session(session.id, "timeout", None);
        gateway.sessions.remove(session.id);
        destroy_session(gateway, &session).await;
    }
}
