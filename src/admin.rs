//! Admin/monitor API: introspection (sessions, handles, per-handle WebRTC
//! state) and live tuning of the gateway. All admin verbs run synchronously
//! on the dispatcher so tuning changes serialize naturally.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::config::{LOG_MAX, LOG_NONE};
use crate::dispatcher::Request;
use crate::errors::{code, ApiError};
use crate::gateway::Gateway;
use crate::ice::PacketDump;
use crate::negotiation::WebRtcFlags;
use crate::protocol;
use crate::session::{Handle, Session};

pub(crate) async fn process_request(gateway: &Arc<Gateway>, request: Request) {
    let root = request.message.clone();
    let session_id = root.get("session_id").and_then(Value::as_u64).unwrap_or(0);
    let handle_id = root.get("handle_id").and_then(Value::as_u64).unwrap_or(0);

    let transaction = match protocol::require_str(&root, "transaction") {
        Ok(t) => t.to_string(),
        Err(err) => return request.reply_error(session_id, None, err).await,
    };
    let transaction = transaction.as_str();
    let verb = match protocol::require_str(&root, "janus") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(err) => return request.reply_error(session_id, None, err).await,
    };

    let outcome = if session_id == 0 && handle_id == 0 {
        if verb == "info" {
            // The generic info request needs no secret.
            Ok(protocol::server_info(gateway, Some(transaction)))
        } else {
            match gateway.auth.check_admin(&root) {
                Err(err) => Err(err),
                Ok(()) => global_verb(gateway, &verb, &root, transaction),
            }
        }
    } else if session_id < 1 {
        warn!("invalid session id");
        Err(ApiError::from_code(code::SESSION_NOT_FOUND))
    } else {
        match gateway.auth.check_admin(&root) {
            Err(err) => Err(err),
            Ok(()) => scoped_verb(gateway, &verb, &root, session_id, handle_id, transaction),
        }
    };

    match outcome {
        Ok(reply) => request.reply(reply).await,
        Err(err) => request.reply_error(session_id, Some(transaction), err).await,
    }
}

/// Verbs with no session/handle scope: status, tuning, tokens, listing.
fn global_verb(
    gateway: &Arc<Gateway>,
    verb: &str,
    root: &Value,
    transaction: &str,
) -> Result<Value, ApiError> {
    match verb {
        "get_status" => {
            let tunables = &gateway.tunables;
            let mut reply = protocol::message("success", 0, Some(transaction));
            reply["status"] = json!({
                "token_auth": gateway.auth.is_token_auth_enabled(),
                "session_timeout": tunables.session_timeout(),
                "log_level": tunables.log_level(),
                "log_timestamps": tunables.log_timestamps(),
                "log_colors": tunables.log_colors(),
                "locking_debug": tunables.locking_debug(),
                "refcount_debug": tunables.refcount_debug(),
                "libnice_debug": tunables.ice_debug(),
                "max_nack_queue": tunables.max_nack_queue(),
                "no_media_timer": tunables.no_media_timer(),
            });
            Ok(reply)
        }
        "set_session_timeout" => {
            let timeout = protocol::require_uint(root, "timeout")?;
            gateway.tunables.set_session_timeout(timeout);
            let mut reply = protocol::message("success", 0, Some(transaction));
            reply["timeout"] = json!(timeout);
            Ok(reply)
        }
        "set_log_level" => {
            let level = match root.get("level") {
                None | Some(Value::Null) => {
                    return Err(ApiError::new(
                        code::MISSING_MANDATORY_ELEMENT,
                        "Missing mandatory element (level)",
                    ))
                }
                Some(v) => v.as_i64().ok_or_else(|| {
                    ApiError::new(
                        code::INVALID_ELEMENT_TYPE,
                        "Invalid element type (level should be a positive integer)",
                    )
                })? as i32,
            };
            if !(LOG_NONE..=LOG_MAX).contains(&level) {
                return Err(ApiError::new(
                    code::INVALID_ELEMENT_TYPE,
                    format!("Invalid element type (level should be between {LOG_NONE} and {LOG_MAX})"),
                ));
            }
            gateway.set_log_level(level);
            let mut reply = protocol::message("success", 0, Some(transaction));
            reply["level"] = json!(level);
            Ok(reply)
        }
        "set_locking_debug" => {
            let debug = protocol::require_bool(root, "debug")?;
            gateway.tunables.set_locking_debug(debug);
            let mut reply = protocol::message("success", 0, Some(transaction));
            reply["locking_debug"] = json!(debug);
            Ok(reply)
        }
        "set_refcount_debug" => {
            let debug = protocol::require_bool(root, "debug")?;
            gateway.tunables.set_refcount_debug(debug);
            let mut reply = protocol::message("success", 0, Some(transaction));
            reply["refcount_debug"] = json!(debug);
            Ok(reply)
        }
        "set_log_timestamps" => {
            let timestamps = protocol::require_bool(root, "timestamps")?;
            gateway.tunables.set_log_timestamps(timestamps);
            let mut reply = protocol::message("success", 0, Some(transaction));
            reply["log_timestamps"] = json!(timestamps);
            Ok(reply)
        }
        "set_log_colors" => {
            let colors = protocol::require_bool(root, "colors")?;
            gateway.tunables.set_log_colors(colors);
            let mut reply = protocol::message("success", 0, Some(transaction));
            reply["log_colors"] = json!(colors);
            Ok(reply)
        }
        "set_libnice_debug" => {
            let debug = protocol::require_bool(root, "debug")?;
            gateway.tunables.set_ice_debug(debug);
            let mut reply = protocol::message("success", 0, Some(transaction));
            reply["libnice_debug"] = json!(debug);
            Ok(reply)
        }
        "set_max_nack_queue" => {
            let mnq = protocol::require_uint(root, "max_nack_queue")?;
            if mnq > 0 && mnq < 200 {
                return Err(ApiError::new(
                    code::INVALID_ELEMENT_TYPE,
                    "Invalid element type (max_nack_queue, if provided, should be greater than 200)",
                ));
            }
            gateway.tunables.set_max_nack_queue(mnq as u32);
            let mut reply = protocol::message("success", 0, Some(transaction));
            reply["max_nack_queue"] = json!(gateway.tunables.max_nack_queue());
            Ok(reply)
        }
        "set_no_media_timer" => {
            let timer = protocol::require_uint(root, "no_media_timer")?;
            gateway.tunables.set_no_media_timer(timer as u32);
            let mut reply = protocol::message("success", 0, Some(transaction));
            reply["no_media_timer"] = json!(gateway.tunables.no_media_timer());
            Ok(reply)
        }
        "query_eventhandler" => {
            let package = protocol::require_str(root, "handler")?;
            let query = match root.get("request") {
                None | Some(Value::Null) => json!({}),
                Some(v) if v.is_object() => v.clone(),
                Some(_) => {
                    return Err(ApiError::new(
                        code::INVALID_ELEMENT_TYPE,
                        "Invalid element type (request should be an object)",
                    ))
                }
            };
            let Some(handler) = gateway.events.get(package) else {
                return Err(ApiError::new(code::PLUGIN_NOT_FOUND, "Invalid event handler"));
            };
            let Some(response) = handler.handle_request(query) else {
                return Err(ApiError::new(
                    code::UNKNOWN,
                    "Event handler doesn't support queries",
                ));
            };
            let mut reply = protocol::message("success", 0, Some(transaction));
            reply["response"] = response;
            Ok(reply)
        }
        "list_sessions" => {
            let mut reply = protocol::message("success", 0, Some(transaction));
            reply["sessions"] = json!(gateway.sessions.ids());
            Ok(reply)
        }
        "add_token" => token_verb(gateway, root, transaction, true, true),
        "allow_token" => token_verb(gateway, root, transaction, true, false),
        "disallow_token" => token_verb(gateway, root, transaction, false, false),
        "list_tokens" => {
            require_token_auth(gateway)?;
            let tokens: Vec<Value> = gateway
                .auth
                .list_tokens()
                .into_iter()
                .filter(|(_, plugins)| !plugins.is_empty())
                .map(|(token, plugins)| json!({ "token": token, "allowed_plugins": plugins }))
                .collect();
            let mut reply = protocol::message("success", 0, Some(transaction));
            reply["data"] = json!({ "tokens": tokens });
            Ok(reply)
        }
        "remove_token" => {
            require_token_auth(gateway)?;
            let token = protocol::require_str(root, "token")?;
            if !gateway.auth.remove_token(token) {
                return Err(ApiError::new(code::UNKNOWN, "Error removing token"));
            }
            Ok(protocol::message("success", 0, Some(transaction)))
        }
        _ => Err(ApiError::new(
            code::INVALID_REQUEST_PATH,
            format!("Unhandled request '{verb}' at this path"),
        )),
    }
}

fn require_token_auth(gateway: &Gateway) -> Result<(), ApiError> {
    if gateway.auth.is_token_auth_enabled() {
        Ok(())
    } else {
        Err(ApiError::new(
            code::UNKNOWN,
            "Token based authentication disabled",
        ))
    }
}

/// `add_token` / `allow_token` / `disallow_token`. Adding tolerates unknown
/// plugins in the list; allow/disallow reject them.
fn token_verb(
    gateway: &Arc<Gateway>,
    root: &Value,
    transaction: &str,
    allow: bool,
    add: bool,
) -> Result<Value, ApiError> {
    require_token_auth(gateway)?;
    let token = protocol::require_str(root, "token")?;
    let allowed = match root.get("plugins") {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.as_array().ok_or_else(|| {
            ApiError::new(
                code::INVALID_ELEMENT_TYPE,
                "Invalid element type (plugins should be an array)",
            )
        })?),
    };
    if !add && allowed.map(|a| a.is_empty()).unwrap_or(true) {
        return Err(ApiError::new(
            code::INVALID_ELEMENT_TYPE,
            "Invalid element type (plugins should be a non-empty array)",
        ));
    }
    if add {
        if !gateway.auth.add_token(token) {
            return Err(ApiError::new(code::UNKNOWN, "Error adding token"));
        }
    } else if !gateway.auth.check_token(token) {
        return Err(ApiError::new(
            code::TOKEN_NOT_FOUND,
            format!("Token {token} not found"),
        ));
    }
    match allowed {
        Some(list) if !list.is_empty() => {
            let mut packages = Vec::new();
            for entry in list {
                let Some(package) = entry.as_str() else {
                    if add {
                        warn!("invalid plugin passed to the token request, skipping");
                        continue;
                    }
                    return Err(ApiError::new(
                        code::INVALID_ELEMENT_TYPE,
                        "Invalid element type (some of the provided plugins are invalid)",
                    ));
                };
                if gateway.find_plugin(package).is_none() {
                    if add {
                        warn!(plugin = package, "no such plugin passed to the token request, skipping");
                        continue;
                    }
                    return Err(ApiError::new(
                        code::INVALID_ELEMENT_TYPE,
                        "Invalid element type (some of the provided plugins are invalid)",
                    ));
                }
                packages.push(package);
            }
            for package in packages {
                let ok = if allow {
                    gateway.auth.allow_plugin(token, package)
                } else {
                    gateway.auth.disallow_plugin(token, package)
                };
                if !ok {
                    warn!(plugin = package, "error changing plugin access for token");
                }
            }
        }
        _ => {
            // No limitation specified: allow all registered plugins.
            for package in gateway.plugin_packages() {
                if !gateway.auth.allow_plugin(token, &package) {
                    warn!(plugin = %package, "error allowing plugin access to token");
                }
            }
        }
    }
    let mut reply = protocol::message("success", 0, Some(transaction));
    reply["data"] = json!({ "plugins": gateway.auth.list_plugins(token) });
    Ok(reply)
}

/// Session- and handle-scoped verbs.
fn scoped_verb(
    gateway: &Arc<Gateway>,
    verb: &str,
    root: &Value,
    session_id: u64,
    handle_id: u64,
    transaction: &str,
) -> Result<Value, ApiError> {
    let Some(session) = gateway.sessions.find(session_id) else {
        warn!(session = session_id, "couldn't find session");
        return Err(ApiError::new(
            code::SESSION_NOT_FOUND,
            format!("No such session {session_id}"),
        ));
    };
    let handle = if handle_id > 0 {
        match session.find_handle(handle_id) {
            Some(handle) => Some(handle),
            None => {
                warn!(session = session_id, handle = handle_id, "couldn't find handle");
                return Err(ApiError::new(
                    code::HANDLE_NOT_FOUND,
                    format!("No such handle {handle_id} in session {session_id}"),
                ));
            }
        }
    } else {
        None
    };

    let Some(handle) = handle else {
        if verb != "list_handles" {
            return Err(ApiError::new(
                code::INVALID_REQUEST_PATH,
                format!("Unhandled request '{verb}' at this path"),
            ));
        }
        let mut reply = protocol::message("success", session_id, Some(transaction));
        reply["handles"] = json!(session.handle_ids());
        return Ok(reply);
    };

    match verb {
        "start_text2pcap" => {
            let folder = protocol::optional_str(root, "folder")?;
            let filename = protocol::optional_str(root, "filename")?;
            let truncate = protocol::optional_uint(root, "truncate")?.unwrap_or(0) as usize;
            if handle.packet_dump.lock().is_some() {
                return Err(ApiError::new(code::UNKNOWN, "text2pcap already started"));
            }
            let dump = PacketDump::create(folder, filename, truncate)
                .map_err(|_| ApiError::new(code::UNKNOWN, "Error starting text2pcap dump"))?;
            *handle.packet_dump.lock() = Some(dump);
            handle.dump_packets.store(true, Ordering::Release);
            Ok(protocol::message("success", session_id, Some(transaction)))
        }
        "stop_text2pcap" => {
            if handle.packet_dump.lock().is_none() {
                return Err(ApiError::new(code::UNKNOWN, "text2pcap not started"));
            }
            if handle
                .dump_packets
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                *handle.packet_dump.lock() = None;
            }
            Ok(protocol::message("success", session_id, Some(transaction)))
        }
        "handle_info" => {
            let mut reply = protocol::message("success", session_id, Some(transaction));
            reply["handle_id"] = json!(handle.id);
            reply["info"] = handle_summary(&session, &handle);
            Ok(reply)
        }
        _ => Err(ApiError::new(
            code::INVALID_REQUEST_PATH,
            format!("Unhandled request '{verb}' at this path"),
        )),
    }
}

fn flag_entry(map: &mut Map<String, Value>, name: &str, flags: &WebRtcFlags, flag: u32) {
    map.insert(name.to_string(), json!(flags.is_set(flag)));
}

fn handle_summary(session: &Arc<Session>, handle: &Arc<Handle>) -> Value {
    let mut info = json!({
        "session_id": session.id,
        "session_last_activity": session.last_activity(),
        "handle_id": handle.id,
        "created": handle.created,
        "current_time": crate::monotonic_micros(),
    });
    if let Some(source) = session.source() {
        info["session_transport"] = json!(source.transport.package());
    }
    if let Some(opaque_id) = &handle.opaque_id {
        info["opaque_id"] = json!(opaque_id);
    }
    if !handle.plugin_session.is_stopped() {
        info["plugin"] = json!(handle.plugin.package());
        if let Some(query) = handle.plugin.query_session(&handle.plugin_session) {
            if query.is_object() {
                info["plugin_specific"] = query;
            } else {
                warn!("ignoring invalid query response from the plugin (not an object)");
            }
        }
    }

    let flags = &handle.flags;
    let mut flag_map = Map::new();
    flag_entry(&mut flag_map, "got-offer", flags, WebRtcFlags::GOT_OFFER);
    flag_entry(&mut flag_map, "got-answer", flags, WebRtcFlags::GOT_ANSWER);
    flag_entry(&mut flag_map, "processing-offer", flags, WebRtcFlags::PROCESSING_OFFER);
    flag_entry(&mut flag_map, "starting", flags, WebRtcFlags::START);
    flag_entry(&mut flag_map, "ice-restart", flags, WebRtcFlags::ICE_RESTART);
    flag_entry(&mut flag_map, "ready", flags, WebRtcFlags::READY);
    flag_entry(&mut flag_map, "stopped", flags, WebRtcFlags::STOP);
    flag_entry(&mut flag_map, "alert", flags, WebRtcFlags::ALERT);
    flag_entry(&mut flag_map, "trickle", flags, WebRtcFlags::TRICKLE);
    flag_entry(&mut flag_map, "all-trickles", flags, WebRtcFlags::ALL_TRICKLES);
    flag_entry(&mut flag_map, "resend-trickles", flags, WebRtcFlags::RESEND_TRICKLES);
    flag_entry(&mut flag_map, "trickle-synced", flags, WebRtcFlags::TRICKLE_SYNCED);
    flag_entry(&mut flag_map, "data-channels", flags, WebRtcFlags::DATA_CHANNELS);
    flag_entry(&mut flag_map, "has-audio", flags, WebRtcFlags::HAS_AUDIO);
    flag_entry(&mut flag_map, "has-video", flags, WebRtcFlags::HAS_VIDEO);
    flag_entry(&mut flag_map, "rfc4588-rtx", flags, WebRtcFlags::RFC4588_RTX);
    flag_entry(&mut flag_map, "cleaning", flags, WebRtcFlags::CLEANING);
    info["flags"] = Value::Object(flag_map);

    {
        let guard = handle.agent.lock();
        if let Some(agent) = guard.as_ref() {
            info["agent-created"] = json!(agent.created);
            info["ice-mode"] = json!("full");
            info["ice-role"] = json!(if agent.controlling {
                "controlling"
            } else {
                "controlled"
            });
            info["streams"] = json!([stream_summary(agent)]);
        } else {
            info["streams"] = json!([]);
        }
    }

    let mut sdps = json!({});
    if let Some(local) = handle.local_sdp.lock().as_ref() {
        sdps["local"] = json!(local);
    }
    if let Some(remote) = handle.remote_sdp.lock().as_ref() {
        sdps["remote"] = json!(remote);
    }
    info["sdps"] = sdps;

    let pending = handle.pending_trickles.lock().len();
    if pending > 0 {
        info["pending-trickles"] = json!(pending);
    }
    if handle.dump_packets.load(Ordering::Acquire) {
        info["dump-to-text2pcap"] = json!(true);
        if let Some(dump) = handle.packet_dump.lock().as_ref() {
            info["text2pcap-file"] = json!(dump.path.display().to_string());
        }
    }
    info
}

fn stream_summary(agent: &crate::ice::IceAgent) -> Value {
    let stream = &agent.stream;
    let mut ssrc = json!({});
    if stream.audio_ssrc != 0 {
        ssrc["audio"] = json!(stream.audio_ssrc);
    }
    if stream.video_ssrc != 0 {
        ssrc["video"] = json!(stream.video_ssrc);
    }
    if stream.audio_ssrc_peer != 0 {
        ssrc["audio-peer"] = json!(stream.audio_ssrc_peer);
    }
    if stream.video_ssrc_peer[0] != 0 {
        ssrc["video-peer"] = json!(stream.video_ssrc_peer[0]);
    }
    if stream.video_ssrc_peer[1] != 0 {
        ssrc["video-peer-sim-1"] = json!(stream.video_ssrc_peer[1]);
    }
    if stream.video_ssrc_peer[2] != 0 {
        ssrc["video-peer-sim-2"] = json!(stream.video_ssrc_peer[2]);
    }
    let mut summary = json!({
        "id": stream.id,
        "ready": stream.cdone,
        "ssrc": ssrc,
        "direction": {
            "audio-send": stream.audio_send,
            "audio-recv": stream.audio_recv,
            "video-send": stream.video_send,
            "video-recv": stream.video_recv,
        },
        "candidates": {
            "local": stream.local_candidates,
            "remote": stream.remote_candidates,
        },
        "in_stats": {
            "audio_packets": stream.in_stats.audio.packets,
            "audio_bytes": stream.in_stats.audio.bytes,
            "video_packets": stream.in_stats.video.packets,
            "video_bytes": stream.in_stats.video.bytes,
            "data_packets": stream.in_stats.data.packets,
            "data_bytes": stream.in_stats.data.bytes,
        },
        "out_stats": {
            "audio_packets": stream.out_stats.audio.packets,
            "audio_bytes": stream.out_stats.audio.bytes,
            "video_packets": stream.out_stats.video.packets,
            "video_bytes": stream.out_stats.video.bytes,
            "data_packets": stream.out_stats.data.packets,
            "data_bytes": stream.out_stats.data.bytes,
        },
    });
    if stream.do_transport_wide_cc {
        summary["transport-wide-cc-ext-id"] = json!(stream.transport_wide_cc_ext_id);
    }
    if stream.checks_started {
        summary["checks-started"] = json!(true);
    }
    if stream.connected > 0 {
        summary["connected"] = json!(stream.connected);
    }
    summary
}
