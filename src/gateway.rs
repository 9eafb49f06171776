//! The gateway core: registries of plugins, transports and sessions, the
//! ingress queue, and the client-API verb handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::AuthGate;
use crate::config::{Config, LogControl, Tunables};
use crate::dispatcher::{self, Deferred, Inbound, Request};
use crate::errors::{code, ApiError};
use crate::events::EventBus;
use crate::negotiation::{self, WebRtcFlags};
use crate::plugin::{CoreCallbacks, Plugin, PluginResult, PLUGIN_API_VERSION};
use crate::protocol::{self, ComponentInfo};
use crate::session::{self, Handle, Session, SessionRegistry, SessionSource, TrickleCandidate};
use crate::transport::{Transport, TransportSession};

pub struct Gateway {
    config: Config,
    pub tunables: Tunables,
    pub auth: AuthGate,
    pub sessions: SessionRegistry,
    pub events: EventBus,
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
    log_control: Option<LogControl>,
    requests_tx: mpsc::UnboundedSender<Inbound>,
    deferred_tx: mpsc::UnboundedSender<Deferred>,
    receivers: Mutex<Option<(mpsc::UnboundedReceiver<Inbound>, mpsc::UnboundedReceiver<Deferred>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
}

impl Gateway {
    /// Whether data-channel (SCTP) support was compiled in.
    pub const SCTP_SUPPORT: bool = false;

    pub fn new(config: Config) -> Arc<Self> {
        Self::with_log_control(config, None)
    }

    pub fn with_log_control(config: Config, log_control: Option<LogControl>) -> Arc<Self> {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tunables: Tunables::new(&config),
            auth: AuthGate::new(&config),
            sessions: SessionRegistry::new(),
            events: EventBus::new(),
            plugins: RwLock::new(HashMap::new()),
            transports: RwLock::new(HashMap::new()),
            log_control,
            requests_tx,
            deferred_tx,
            receivers: Mutex::new(Some((requests_rx, deferred_rx))),
            tasks: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            config,
        })
    }

    pub fn server_name(&self) -> &str {
        &self.config.server_name
    }

    pub fn local_ip(&self) -> &str {
        &self.config.local_ip
    }

    pub fn full_trickle(&self) -> bool {
        self.config.full_trickle
    }

    pub fn rfc4588(&self) -> bool {
        self.config.rfc4588
    }

    pub fn cleaning_deadline(&self) -> Duration {
        self.config.cleaning_deadline
    }

    pub fn trickle_expiry_micros(&self) -> i64 {
        self.config.trickle_expiry.as_micros() as i64
    }

    pub(crate) fn set_log_level(&self, level: i32) {
        self.tunables.set_log_level(level);
        if let Some(log_control) = &self.log_control {
            log_control.set_level(level);
        }
    }

    /// Registers a plugin, rejecting API-incompatible ones, and hands it the
    /// core callbacks through its `init` hook.
    pub fn register_plugin(self: &Arc<Self>, plugin: Arc<dyn Plugin>) -> Result<()> {
        if plugin.api_version() < PLUGIN_API_VERSION {
            bail!(
                "plugin '{}' was built against an older API ({} < {})",
                plugin.package(),
                plugin.api_version(),
                PLUGIN_API_VERSION
            );
        }
        plugin.init(self.clone() as Arc<dyn CoreCallbacks>)?;
        info!(plugin = plugin.package(), "plugin registered");
        self.plugins
            .write()
            .insert(plugin.package().to_string(), plugin);
        Ok(())
    }

    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        info!(transport = transport.package(), "transport registered");
        self.transports
            .write()
            .insert(transport.package().to_string(), transport);
    }

    pub fn register_event_handler(&self, handler: Arc<dyn crate::events::EventHandler>) {
        info!(handler = handler.package(), "event handler registered");
        self.events.register(handler);
    }

    pub fn find_plugin(&self, package: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.read().get(package).cloned()
    }

    pub fn plugin_packages(&self) -> Vec<String> {
        self.plugins.read().keys().cloned().collect()
    }

    pub fn plugin_metadata(&self) -> Vec<ComponentInfo> {
        self.plugins
            .read()
            .values()
            .map(|p| ComponentInfo {
                package: p.package().to_string(),
                name: p.name().to_string(),
                author: p.author().to_string(),
                description: p.description().to_string(),
                version: p.version(),
                version_string: p.version_string().to_string(),
            })
            .collect()
    }

    pub fn transport_metadata(&self) -> Vec<ComponentInfo> {
        self.transports
            .read()
            .values()
            .map(|t| ComponentInfo {
                package: t.package().to_string(),
                name: t.name().to_string(),
                author: t.author().to_string(),
                description: t.description().to_string(),
                version: t.version(),
                version_string: t.version_string().to_string(),
            })
            .collect()
    }

    /// At least one registered transport must speak the client API for the
    /// gateway to be reachable at all.
    pub fn has_janus_api_transport(&self) -> bool {
        self.transports
            .read()
            .values()
            .any(|t| t.is_janus_api_enabled())
    }

    /// Spawns the dispatcher and the sessions watchdog.
    pub fn start(self: &Arc<Self>) {
        let Some((requests_rx, deferred_rx)) = self.receivers.lock().take() else {
            return;
        };
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(dispatcher::run_dispatcher(
            self.clone(),
            requests_rx,
        )));
        tasks.push(tokio::spawn(dispatcher::run_watchdog(
            self.clone(),
            deferred_rx,
        )));
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Graceful shutdown: stop accepting requests, destroy every session,
    /// then stop the service tasks.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down gateway");
        for id in self.sessions.ids() {
            if let Some(session) = self.sessions.remove(id) {
                if let Some(source) = session.source() {
                    source
                        .transport
                        .session_over(&source.instance, session.id, true)
                        .await;
                }
                session::destroy_session(self, &session).await;
            }
        }
        let _ = self.requests_tx.send(Inbound::Exit);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        for plugin in self.plugins.read().values() {
            plugin.destroy();
        }
    }

    /// Transport-facing ingress: enqueue one decoded message.
    pub fn incoming_request(
        &self,
        transport: Arc<dyn Transport>,
        instance: Arc<TransportSession>,
        request_id: Option<String>,
        admin: bool,
        message: Value,
    ) {
        if self.is_stopping() {
            return;
        }
        debug!(
            transport = transport.package(),
            instance = instance.id,
            admin,
            "got API request"
        );
        let _ = self.requests_tx.send(Inbound::Request(Request {
            transport,
            instance,
            request_id,
            admin,
            message,
        }));
    }

    /// A transport connection died: every live session bound to it is
    /// destroyed and unlinked. No notifications; the channel is gone.
    pub async fn transport_gone(&self, instance: &Arc<TransportSession>) {
        debug!(instance = instance.id, "transport instance has gone away");
        let mut orphaned = Vec::new();
        for session in self.sessions.snapshot() {
            if session.is_destroyed() || session.is_timed_out() {
                continue;
            }
            let bound = session
                .source()
                .map(|source| source.instance.id == instance.id)
                .unwrap_or(false);
            if bound {
                orphaned.push(session);
            }
        }
        for session in orphaned {
            debug!(session = session.id, "marking session as over");
            self.sessions.remove(session.id);
            session::destroy_session(self, &session).await;
        }
    }

    pub(crate) fn defer(&self, task: Deferred) {
        let _ = self.deferred_tx.send(task);
    }

    /// Client-API entry point for one request. Every error goes through the
    /// single structured-error reply path.
    pub(crate) async fn process_request(self: &Arc<Self>, request: Request) {
        let root = request.message.clone();
        let session_id = root.get("session_id").and_then(Value::as_u64).unwrap_or(0);
        let handle_id = root.get("handle_id").and_then(Value::as_u64).unwrap_or(0);

        // Envelope validation.
        let transaction = match protocol::require_str(&root, "transaction") {
            Ok(t) => t.to_string(),
            Err(err) => return request.reply_error(session_id, None, err).await,
        };
        let transaction = transaction.as_str();
        let verb = match protocol::require_str(&root, "janus") {
            Ok(v) => v.to_ascii_lowercase(),
            Err(err) => return request.reply_error(session_id, None, err).await,
        };

        if session_id == 0 && handle_id == 0 {
            // Can only be a session create, an info or a ping.
            match verb.as_str() {
                "info" => {
                    return request
                        .reply(protocol::server_info(self, Some(transaction)))
                        .await
                }
                "ping" => {
                    return request
                        .reply(protocol::message("pong", 0, Some(transaction)))
                        .await
                }
                "create" => {}
                _ => {
                    return request
                        .reply_error(
                            session_id,
                            Some(transaction),
                            ApiError::new(
                                code::INVALID_REQUEST_PATH,
                                format!("Unhandled request '{verb}' at this path"),
                            ),
                        )
                        .await
                }
            }
            if let Err(err) = self.auth.check_message(&root) {
                return request.reply_error(session_id, Some(transaction), err).await;
            }
            return self.create_session_verb(&request, &root, transaction).await;
        }

        if session_id < 1 {
            warn!("invalid session id");
            return request
                .reply_error(
                    session_id,
                    Some(transaction),
                    ApiError::from_code(code::SESSION_NOT_FOUND),
                )
                .await;
        }

        if let Err(err) = self.auth.check_message(&root) {
            return request.reply_error(session_id, Some(transaction), err).await;
        }

        let Some(session) = self.sessions.find(session_id) else {
            warn!(session = session_id, "couldn't find session");
            return request
                .reply_error(
                    session_id,
                    Some(transaction),
                    ApiError::new(
                        code::SESSION_NOT_FOUND,
                        format!("No such session {session_id}"),
                    ),
                )
                .await;
        };
        session.touch();

        let mut handle = None;
        if handle_id > 0 {
            handle = session.find_handle(handle_id);
            if handle.is_none() {
                warn!(session = session_id, handle = handle_id, "couldn't find handle");
                return request
                    .reply_error(
                        session_id,
                        Some(transaction),
                        ApiError::new(
                            code::HANDLE_NOT_FOUND,
                            format!("No such handle {handle_id} in session {session_id}"),
                        ),
                    )
                    .await;
            }
        }

        let outcome = match verb.as_str() {
            "keepalive" => {
                debug!(session = session_id, "got a keep-alive");
                request
                    .reply(protocol::message("ack", session_id, Some(transaction)))
                    .await;
                Ok(())
            }
            "attach" => match handle {
                // Attach is a session-level command.
                Some(_) => Err(invalid_path(&verb)),
                None => self.attach_verb(&request, &root, &session, transaction).await,
            },
            "destroy" => match handle {
                Some(_) => Err(invalid_path(&verb)),
                None => {
                    self.destroy_verb(&request, &session, transaction).await;
                    Ok(())
                }
            },
            "detach" => match handle {
                None => Err(invalid_path(&verb)),
                Some(handle) => {
                    if handle.flags.is_set(WebRtcFlags::STOP) {
                        Err(ApiError::new(code::PLUGIN_DETACH, "No plugin to detach from"))
                    } else {
                        session.remove_handle(self, &handle).await;
                        request
                            .reply(protocol::message("success", session_id, Some(transaction)))
                            .await;
                        Ok(())
                    }
                }
            },
            "hangup" => match handle {
                None => Err(invalid_path(&verb)),
                Some(handle) => {
                    if handle.flags.is_set(WebRtcFlags::STOP) {
                        Err(ApiError::new(code::PLUGIN_DETACH, "No plugin attached"))
                    } else {
                        negotiation::webrtc_hangup(self, &handle, "Janus API").await;
                        request
                            .reply(protocol::message("success", session_id, Some(transaction)))
                            .await;
                        Ok(())
                    }
                }
            },
            "message" => match handle {
                None => Err(invalid_path(&verb)),
                Some(handle) => {
                    self.message_verb(&request, &root, &session, &handle, transaction)
                        .await
                }
            },
            "trickle" => match handle {
                None => Err(invalid_path(&verb)),
                Some(handle) => {
                    self.trickle_verb(&request, &root, &handle, transaction).await
                }
            },
            _ => Err(ApiError::new(
                code::UNKNOWN_REQUEST,
                format!("Unknown request '{verb}'"),
            )),
        };

        if let Err(err) = outcome {
            request.reply_error(session_id, Some(transaction), err).await;
        }
    }

    async fn create_session_verb(
        self: &Arc<Self>,
        request: &Request,
        root: &Value,
        transaction: &str,
    ) {
        let id_hint = match protocol::optional_uint(root, "id") {
            Ok(id) => id.unwrap_or(0),
            Err(err) => return request.reply_error(0, Some(transaction), err).await,
        };
        let session = match self.sessions.create(id_hint) {
            Ok(session) => session,
            Err(err) => return request.reply_error(id_hint, Some(transaction), err).await,
        };
        // Remember who to reply to for events on this session.
        session.bind_source(SessionSource {
            transport: request.transport.clone(),
            instance: request.instance.clone(),
        });
        request
            .transport
            .session_created(&request.instance, session.id)
            .await;
        self.events.notify_session(
            session.id,
            "created",
            Some(json!({
                "transport": request.transport.package(),
                "id": request.instance.id,
            })),
        );
        let mut reply = protocol::message("success", 0, Some(transaction));
        reply["data"] = json!({ "id": session.id });
        request.reply(reply).await;
    }

    async fn attach_verb(
        self: &Arc<Self>,
        request: &Request,
        root: &Value,
        session: &Arc<Session>,
        transaction: &str,
    ) -> Result<(), ApiError> {
        let package = protocol::require_str(root, "plugin")?;
        let opaque_id = protocol::optional_str(root, "opaque_id")?.map(String::from);
        let Some(plugin) = self.find_plugin(package) else {
            return Err(ApiError::new(
                code::PLUGIN_NOT_FOUND,
                format!("No such plugin '{package}'"),
            ));
        };
        if self.auth.is_token_auth_enabled() {
            if let Some(token) = root.get("token").and_then(Value::as_str) {
                if !self.auth.check_plugin(token, package) {
                    warn!(token, plugin = package, "token can't access plugin");
                    return Err(ApiError::new(
                        code::UNAUTHORIZED_PLUGIN,
                        format!("Provided token can't access plugin '{package}'"),
                    ));
                }
            }
        }
        let handle = Handle::create(self, session, plugin, opaque_id).await?;
        let mut reply = protocol::message("success", session.id, Some(transaction));
        reply["data"] = json!({ "id": handle.id });
        request.reply(reply).await;
        Ok(())
    }

    async fn destroy_verb(self: &Arc<Self>, request: &Request, session: &Arc<Session>, transaction: &str) {
        self.sessions.remove(session.id);
        if let Some(source) = session.source() {
            source
                .transport
                .session_over(&source.instance, session.id, false)
                .await;
        }
        session::destroy_session(self, session).await;
        request
            .reply(protocol::message("success", session.id, Some(transaction)))
            .await;
        self.events.notify_session(session.id, "destroyed", None);
    }

    async fn message_verb(
        self: &Arc<Self>,
        request: &Request,
        root: &Value,
        session: &Arc<Session>,
        handle: &Arc<Handle>,
        transaction: &str,
    ) -> Result<(), ApiError> {
        if handle.plugin_session.is_stopped() || handle.flags.is_set(WebRtcFlags::STOP) {
            return Err(ApiError::new(
                code::PLUGIN_MESSAGE,
                "No plugin to handle this message",
            ));
        }
        debug!(
            handle = handle.id,
            plugin = handle.plugin.package(),
            "there's a message for a plugin"
        );
        let body = protocol::require_object(root, "body")?.clone();

        let mut plugin_jsep = None;
        if let Some(jsep) = root.get("jsep").filter(|j| !j.is_null()) {
            if !jsep.is_object() {
                return Err(ApiError::new(code::INVALID_JSON_OBJECT, "Invalid jsep object"));
            }
            let prepared = negotiation::process_client_jsep(self, handle, jsep).await?;
            plugin_jsep = Some(prepared.plugin_jsep());
        }

        // The JSEP wait may have outlived the plugin; re-check before
        // handing the message over.
        if handle.plugin_session.is_stopped() || handle.flags.is_set(WebRtcFlags::STOP) {
            handle.flags.clear(WebRtcFlags::PROCESSING_OFFER);
            return Err(ApiError::new(
                code::PLUGIN_MESSAGE,
                "No plugin to handle this message",
            ));
        }

        let result = handle
            .plugin
            .handle_message(&handle.plugin_session, transaction, body, plugin_jsep)
            .await;
        match result {
            PluginResult::Ok(content) => {
                if !content.is_object() {
                    return Err(ApiError::new(
                        code::PLUGIN_MESSAGE,
                        "Plugin returned an invalid JSON response",
                    ));
                }
                let mut reply = protocol::message("success", session.id, Some(transaction));
                reply["sender"] = json!(handle.id);
                reply["plugindata"] = json!({
                    "plugin": handle.plugin.package(),
                    "data": content,
                });
                request.reply(reply).await;
                Ok(())
            }
            PluginResult::OkWait(hint) => {
                // The plugin will get back asynchronously.
                let mut reply = protocol::message("ack", session.id, Some(transaction));
                if let Some(hint) = hint {
                    reply["hint"] = json!(hint);
                }
                request.reply(reply).await;
                Ok(())
            }
            PluginResult::Error(text) => Err(ApiError::new(code::PLUGIN_MESSAGE, text)),
        }
    }

    async fn trickle_verb(
        self: &Arc<Self>,
        request: &Request,
        root: &Value,
        handle: &Arc<Handle>,
        transaction: &str,
    ) -> Result<(), ApiError> {
        if handle.plugin_session.is_stopped() || handle.flags.is_set(WebRtcFlags::STOP) {
            return Err(ApiError::new(
                code::PLUGIN_MESSAGE,
                "No plugin to handle this trickle candidate",
            ));
        }
        let candidate = root.get("candidate").filter(|c| !c.is_null());
        let candidates = root.get("candidates").filter(|c| !c.is_null());
        match (candidate, candidates) {
            (None, None) => {
                return Err(ApiError::new(
                    code::MISSING_MANDATORY_ELEMENT,
                    "Missing mandatory element (candidate|candidates)",
                ))
            }
            (Some(_), Some(_)) => {
                return Err(ApiError::new(
                    code::INVALID_JSON,
                    "Can't have both candidate and candidates",
                ))
            }
            _ => {}
        }
        if handle.flags.is_set(WebRtcFlags::CLEANING) {
            warn!(handle = handle.id, "got a trickle, but still cleaning a previous session");
            return Err(ApiError::new(
                code::WEBRTC_STATE,
                "Still cleaning a previous session",
            ));
        }
        if handle.flags.set_once(WebRtcFlags::TRICKLE) {
            // The peer trickles after all, negotiated or not.
            debug!(handle = handle.id, "peer supports trickle even if it didn't negotiate it");
        }

        let payload = candidate.or(candidates).cloned().unwrap_or(Value::Null);
        let no_stream = handle.agent.lock().is_none();
        let not_ready = handle.flags.is_set(WebRtcFlags::PROCESSING_OFFER)
            || !handle.flags.is_set(WebRtcFlags::GOT_OFFER)
            || !handle.flags.is_set(WebRtcFlags::GOT_ANSWER);
        if no_stream || not_ready {
            let cause = if no_stream {
                "no stream yet"
            } else if handle.flags.is_set(WebRtcFlags::PROCESSING_OFFER) {
                "processing the offer"
            } else if !handle.flags.is_set(WebRtcFlags::GOT_ANSWER) {
                "waiting for the answer"
            } else {
                "waiting for the offer"
            };
            debug!(handle = handle.id, cause, "queueing this trickle until we're done there");
            handle.pending_trickles.lock().push(TrickleCandidate {
                transaction: transaction.to_string(),
                candidate: payload,
                received: crate::monotonic_micros(),
            });
            // Ack right away; an event will report candidate failures.
            request
                .reply(protocol::message("ack", handle.session_id, Some(transaction)))
                .await;
            return Ok(());
        }

        if let Some(candidate) = candidate {
            negotiation::apply_trickle_payload(handle, candidate, false)?;
        } else if let Some(candidates) = candidates {
            if !candidates.is_array() {
                return Err(ApiError::new(
                    code::INVALID_ELEMENT_TYPE,
                    "candidates is not an array",
                ));
            }
            negotiation::apply_trickle_payload(handle, candidates, false)?;
        }
        // Reply right away, not to block the carrier.
        request
            .reply(protocol::message("ack", handle.session_id, Some(transaction)))
            .await;
        if handle.flags.is_set(WebRtcFlags::START) && !handle.flags.is_set(WebRtcFlags::READY) {
            negotiation::ice_ready(self, handle).await;
        }
        Ok(())
    }
}

fn invalid_path(verb: &str) -> ApiError {
    ApiError::new(
        code::INVALID_REQUEST_PATH,
        format!("Unhandled request '{verb}' at this path"),
    )
}
