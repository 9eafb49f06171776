//! Per-handle WebRTC negotiation: offer/answer classification, SDP
//! processing, trickle-candidate buffering and replay, renegotiation and
//! ICE-restart rules, and the teardown interlocks. State lives in an atomic
//! flag word consumed both here and by the collaborators.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::errors::{code, ApiError};
use crate::gateway::Gateway;
use crate::ice::{self, IceAgent, TrickleUpdate};
use crate::protocol;
use crate::sdp;
use crate::session::{Handle, TrickleCandidate};

/// Atomic flag word tracking a handle's WebRTC state.
#[derive(Debug, Default)]
pub struct WebRtcFlags(AtomicU32);

impl WebRtcFlags {
    pub const GOT_OFFER: u32 = 1 << 0;
    pub const GOT_ANSWER: u32 = 1 << 1;
    pub const PROCESSING_OFFER: u32 = 1 << 2;
    /// ICE is waiting for (more) remote candidates before starting checks.
    pub const START: u32 = 1 << 3;
    /// Initial negotiation completed.
    pub const READY: u32 = 1 << 4;
    /// Hard-stopped: the handle is going away, callbacks must bail.
    pub const STOP: u32 = 1 << 5;
    /// Soft-closed: hangup in progress, no further pushes.
    pub const ALERT: u32 = 1 << 6;
    pub const TRICKLE: u32 = 1 << 7;
    /// The peer said it has no further candidates.
    pub const ALL_TRICKLES: u32 = 1 << 8;
    /// Local candidates must be re-trickled (full-trickle ICE restart).
    pub const RESEND_TRICKLES: u32 = 1 << 9;
    pub const TRICKLE_SYNCED: u32 = 1 << 10;
    /// A requested ICE restart, cleared on completion.
    pub const ICE_RESTART: u32 = 1 << 11;
    /// Mid-teardown: gates any new offer/answer.
    pub const CLEANING: u32 = 1 << 12;
    pub const HAS_AUDIO: u32 = 1 << 13;
    pub const HAS_VIDEO: u32 = 1 << 14;
    pub const DATA_CHANNELS: u32 = 1 << 15;
    pub const RFC4588_RTX: u32 = 1 << 16;

    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn set(&self, flag: u32) {
        self.0.fetch_or(flag, Ordering::AcqRel);
    }

    /// Sets the flag; true only if it was clear before.
    pub fn set_once(&self, flag: u32) -> bool {
        self.0.fetch_or(flag, Ordering::AcqRel) & flag == 0
    }

    pub fn clear(&self, flag: u32) {
        self.0.fetch_and(!flag, Ordering::AcqRel);
    }

    pub fn is_set(&self, flag: u32) -> bool {
        self.0.load(Ordering::Acquire) & flag != 0
    }

    pub fn snapshot(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// A client JSEP after pre-parse, SDP processing and anonymization, ready
/// to hand to the plugin.
#[derive(Debug, Clone)]
pub struct PreparedJsep {
    pub jsep_type: String,
    /// Anonymized SDP body.
    pub sdp: String,
    pub renegotiation: bool,
    /// `{ssrc-0, ssrc-1, ssrc-2?}` when the peer is simulcasting.
    pub simulcast: Option<Value>,
}

impl PreparedJsep {
    /// The `jsep` object passed to the plugin's `handle_message`.
    pub fn plugin_jsep(&self) -> Value {
        let mut jsep = json!({ "type": self.jsep_type, "sdp": self.sdp });
        if let Some(simulcast) = &self.simulcast {
            jsep["simulcast"] = simulcast.clone();
        }
        if self.renegotiation {
            jsep["update"] = json!(true);
        }
        jsep
    }
}

/// Waits for a previous teardown to release the handle, polling every
/// 100 ms up to the configured deadline.
pub(crate) async fn cleaning_wait(handle: &Handle, deadline: Duration) -> Result<(), ApiError> {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while handle.flags.is_set(WebRtcFlags::CLEANING) {
        debug!(
            handle = handle.id,
            "still cleaning up a previous media session, waiting"
        );
        sleep(step).await;
        waited += step;
        if waited >= deadline {
            return Err(ApiError::new(
                code::WEBRTC_STATE,
                "Still cleaning a previous session",
            ));
        }
    }
    Ok(())
}

fn jsep_missing(key: &str) -> ApiError {
    ApiError::new(
        code::MISSING_MANDATORY_ELEMENT,
        format!("JSEP error: missing mandatory element ({key})"),
    )
}

fn jsep_wrong_type(key: &str, expected: &str) -> ApiError {
    ApiError::new(
        code::INVALID_ELEMENT_TYPE,
        format!("JSEP error: invalid element type ({key} should be {expected})"),
    )
}

/// Pulls the remote side's attributes out of an incoming SDP and applies
/// them to the handle's agent and media flags. For renegotiations, detects
/// an ICE restart from changed credentials instead of overwriting them.
fn apply_remote_sdp(
    handle: &Handle,
    parsed: &sdp::ParsedSdp,
    renegotiation: bool,
) -> Result<sdp::RemoteDetails, ApiError> {
    let details = sdp::remote_details(parsed);
    let flags = &handle.flags;
    if parsed.audio > 0 {
        flags.set(WebRtcFlags::HAS_AUDIO);
    } else {
        flags.clear(WebRtcFlags::HAS_AUDIO);
    }
    if parsed.video > 0 {
        flags.set(WebRtcFlags::HAS_VIDEO);
    } else {
        flags.clear(WebRtcFlags::HAS_VIDEO);
    }
    if parsed.data > 0 {
        flags.set(WebRtcFlags::DATA_CHANNELS);
    } else {
        flags.clear(WebRtcFlags::DATA_CHANNELS);
    }

    let mut guard = handle.agent.lock();
    let agent = guard
        .as_mut()
        .ok_or_else(|| ApiError::new(code::JSEP_INVALID_SDP, "Error processing SDP"))?;
    if !renegotiation {
        let (Some(ufrag), Some(pwd)) = (details.ufrag.as_deref(), details.pwd.as_deref()) else {
            return Err(ApiError::new(code::JSEP_INVALID_SDP, "Error processing SDP"));
        };
        if details.fingerprint.is_none() {
            return Err(ApiError::new(code::JSEP_INVALID_SDP, "Error processing SDP"));
        }
        agent.set_remote_credentials(ufrag, pwd);
        agent.stream.remote_fingerprint = details.fingerprint.clone();
        agent.stream.remote_hashing = details.fingerprint_hash.clone();
    } else if let (Some(ufrag), Some(pwd)) = (details.ufrag.as_deref(), details.pwd.as_deref()) {
        let changed = agent.stream.remote_ufrag.as_deref() != Some(ufrag)
            || agent.stream.remote_pwd.as_deref() != Some(pwd);
        if changed {
            flags.set(WebRtcFlags::ICE_RESTART);
        }
    }
    if let Some(ssrc) = details.audio_ssrc {
        agent.stream.audio_ssrc_peer = ssrc;
    }
    for (i, ssrc) in details.video_ssrcs.iter().take(3).enumerate() {
        agent.stream.video_ssrc_peer[i] = *ssrc;
    }
    Ok(details)
}

/// Client → plugin JSEP path, driven by the `message` verb. Returns the
/// prepared JSEP to pass along with the body.
pub(crate) async fn process_client_jsep(
    gateway: &Gateway,
    handle: &Arc<Handle>,
    jsep: &Value,
) -> Result<PreparedJsep, ApiError> {
    let jsep_type = match jsep.get("type") {
        None | Some(Value::Null) => return Err(jsep_missing("type")),
        Some(v) => v
            .as_str()
            .ok_or_else(|| jsep_wrong_type("type", "a string"))?
            .to_string(),
    };
    let sdp_body = match jsep.get("sdp") {
        None | Some(Value::Null) => return Err(jsep_missing("sdp")),
        Some(v) => v
            .as_str()
            .ok_or_else(|| jsep_wrong_type("sdp", "a string"))?
            .to_string(),
    };
    let do_trickle = match jsep.get("trickle") {
        None | Some(Value::Null) => true,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| jsep_wrong_type("trickle", "a boolean"))?,
    };

    cleaning_wait(handle, gateway.cleaning_deadline()).await?;
    let _negotiating = handle.negotiating.lock().await;

    let flags = &handle.flags;
    let offer = if jsep_type.eq_ignore_ascii_case("offer") {
        flags.set(WebRtcFlags::PROCESSING_OFFER);
        flags.set(WebRtcFlags::GOT_OFFER);
        flags.clear(WebRtcFlags::GOT_ANSWER);
        true
    } else if jsep_type.eq_ignore_ascii_case("answer") {
        flags.set(WebRtcFlags::GOT_ANSWER);
        false
    } else {
        return Err(ApiError::new(
            code::JSEP_UNKNOWN_TYPE,
            format!("JSEP error: unknown message type '{jsep_type}'"),
        ));
    };
    let fail = |err: ApiError| {
        flags.clear(WebRtcFlags::PROCESSING_OFFER);
        err
    };

    let mut parsed = sdp::preparse(&sdp_body).map_err(fail)?;
    gateway.events.notify_jsep(
        handle.session_id,
        handle.id,
        handle.opaque_id.as_deref(),
        "remote",
        &jsep_type,
        &sdp_body,
    );
    debug!(
        handle = handle.id,
        audio = parsed.audio,
        video = parsed.video,
        data = parsed.data,
        "remote SDP pre-parsed"
    );
    if parsed.audio > 1 {
        warn!(handle = handle.id, "more than one audio line, only negotiating one");
    }
    if parsed.video > 1 {
        warn!(handle = handle.id, "more than one video line, only negotiating one");
    }
    if parsed.data > 1 {
        warn!(handle = handle.id, "more than one data line, only negotiating one");
    }
    if parsed.data > 0 && !Gateway::SCTP_SUPPORT {
        warn!(
            handle = handle.id,
            "data channels negotiated, but support for them is not compiled in"
        );
    }

    let fresh = !flags.is_set(WebRtcFlags::READY) || flags.is_set(WebRtcFlags::ALERT);
    let mut renegotiation = false;
    if fresh {
        if offer {
            let agent = IceAgent::new(
                gateway.local_ip(),
                parsed.audio > 0,
                parsed.video > 0,
                parsed.data > 0,
                false,
            );
            if gateway.rfc4588() {
                flags.set(WebRtcFlags::RFC4588_RTX);
            }
            if do_trickle {
                flags.set(WebRtcFlags::TRICKLE);
            }
            flags.clear(WebRtcFlags::ALERT);
            *handle.agent.lock() = Some(agent);
        } else if handle.agent.lock().is_none() {
            warn!(handle = handle.id, "unexpected ANSWER (did we offer?)");
            return Err(fail(ApiError::new(
                code::UNEXPECTED_ANSWER,
                "Unexpected ANSWER (did we offer?)",
            )));
        }
        apply_remote_sdp(handle, &parsed, false).map_err(|_| {
            fail(ApiError::new(code::JSEP_INVALID_SDP, "Error processing SDP"))
        })?;
        if offer {
            let ext_id = sdp::extmap_id(&sdp_body, sdp::EXTMAP_TRANSPORT_WIDE_CC);
            let mut guard = handle.agent.lock();
            if let Some(agent) = guard.as_mut() {
                agent.stream.do_transport_wide_cc = true;
                agent.stream.transport_wide_cc_ext_id = ext_id.unwrap_or(-1);
            }
        } else {
            flags.set(WebRtcFlags::TRICKLE);
            ice_handle_answer(gateway, handle).await;
        }
    } else {
        info!(handle = handle.id, "negotiation update, checking what changed");
        let details = apply_remote_sdp(handle, &parsed, true).map_err(|_| {
            fail(ApiError::new(code::UNEXPECTED_ANSWER, "Error processing SDP"))
        })?;
        renegotiation = true;
        if flags.is_set(WebRtcFlags::ICE_RESTART) {
            info!(handle = handle.id, "restarting ICE");
            {
                let mut guard = handle.agent.lock();
                if let Some(agent) = guard.as_mut() {
                    if let (Some(ufrag), Some(pwd)) =
                        (details.ufrag.as_deref(), details.pwd.as_deref())
                    {
                        agent.set_remote_credentials(ufrag, pwd);
                    }
                    // Only offers restart here: an answer means we already
                    // restarted when we sent ours.
                    if offer {
                        agent.restart();
                    }
                }
            }
            if !offer {
                flags.clear(WebRtcFlags::ICE_RESTART);
            }
            if gateway.full_trickle() {
                flags.set(WebRtcFlags::RESEND_TRICKLES);
            }
        }
        if !offer
            && flags.is_set(WebRtcFlags::DATA_CHANNELS)
            && Gateway::SCTP_SUPPORT
        {
            warn!(handle = handle.id, "creating data channels");
        }
    }

    parsed.anonymize();
    let stripped = parsed.write();
    *handle.remote_sdp.lock() = Some(stripped.clone());

    let simulcast = if flags.is_set(WebRtcFlags::HAS_VIDEO) {
        let guard = handle.agent.lock();
        guard.as_ref().and_then(|agent| {
            let peer = agent.stream.video_ssrc_peer;
            if peer[1] != 0 {
                let mut simulcast = json!({ "ssrc-0": peer[0], "ssrc-1": peer[1] });
                if peer[2] != 0 {
                    simulcast["ssrc-2"] = json!(peer[2]);
                }
                Some(simulcast)
            } else {
                None
            }
        })
    } else {
        None
    };

    flags.clear(WebRtcFlags::PROCESSING_OFFER);
    Ok(PreparedJsep {
        jsep_type,
        sdp: stripped,
        renegotiation,
        simulcast,
    })
}

/// An answer just landed: replay the buffered trickles, then either wait
/// for more candidates or start connectivity checks right away.
pub(crate) async fn ice_handle_answer(gateway: &Gateway, handle: &Arc<Handle>) {
    handle.flags.clear(WebRtcFlags::PROCESSING_OFFER);
    let pending: Vec<TrickleCandidate> = {
        let mut guard = handle.pending_trickles.lock();
        guard.drain(..).collect()
    };
    if !pending.is_empty() {
        debug!(
            handle = handle.id,
            count = pending.len(),
            "processing pending trickle candidates"
        );
    }
    let expiry = gateway.trickle_expiry_micros();
    let now = crate::monotonic_micros();
    for trickle in pending {
        if now - trickle.received > expiry {
            debug!(handle = handle.id, "discarding stale trickle candidate");
            continue;
        }
        let _ = apply_trickle_payload(handle, &trickle.candidate, true);
    }
    if handle.flags.is_set(WebRtcFlags::TRICKLE) && !handle.flags.is_set(WebRtcFlags::ALL_TRICKLES)
    {
        debug!(
            handle = handle.id,
            "trickling is supported, waiting for remote candidates"
        );
        handle.flags.set(WebRtcFlags::START);
    } else {
        debug!(handle = handle.id, "sending connectivity checks");
        ice_ready(gateway, handle).await;
    }
}

fn apply_single_candidate(handle: &Handle, candidate: &Value) -> Result<(), ApiError> {
    match ice::parse_candidate(candidate)? {
        TrickleUpdate::Completed => {
            handle.flags.set(WebRtcFlags::ALL_TRICKLES);
            Ok(())
        }
        TrickleUpdate::Candidate { candidate, .. } => {
            let mut guard = handle.agent.lock();
            let agent = guard.as_mut().ok_or_else(|| {
                ApiError::new(code::TRICKLE_INVALID_STREAM, "No such stream")
            })?;
            agent.add_remote_candidate(candidate);
            Ok(())
        }
    }
}

/// Applies a buffered or direct trickle payload (object or array). Array
/// elements are parsed best-effort; `lenient` extends that to single
/// candidates, which is how the drain path ignores stale garbage.
pub(crate) fn apply_trickle_payload(
    handle: &Handle,
    payload: &Value,
    lenient: bool,
) -> Result<(), ApiError> {
    if let Some(array) = payload.as_array() {
        debug!(handle = handle.id, count = array.len(), "got multiple candidates");
        for candidate in array {
            let _ = apply_single_candidate(handle, candidate);
        }
        return Ok(());
    }
    match apply_single_candidate(handle, payload) {
        Err(_) if lenient => Ok(()),
        other => other,
    }
}

/// Connectivity point: start checks with the known candidates and, on first
/// establishment, fire `setup_media` and the `webrtcup` notification.
pub(crate) async fn ice_ready(gateway: &Gateway, handle: &Arc<Handle>) {
    {
        let mut guard = handle.agent.lock();
        match guard.as_mut() {
            Some(agent) => agent.start_checks(),
            None => return,
        }
    }
    handle.flags.clear(WebRtcFlags::START);
    handle.flags.clear(WebRtcFlags::ICE_RESTART);
    if handle.flags.set_once(WebRtcFlags::READY) {
        handle.plugin.setup_media(&handle.plugin_session).await;
        if let Some(session) = handle.session() {
            let mut event = protocol::message("webrtcup", session.id, None);
            event["sender"] = json!(handle.id);
            session.notify_event(event).await;
            gateway.events.notify_webrtc(
                session.id,
                handle.id,
                handle.opaque_id.as_deref(),
                json!({ "connection": "webrtcup" }),
            );
        }
    }
}

/// Waits for local candidate gathering, polling every 100 ms; aborted by
/// STOP/ALERT and by a gathering failure.
async fn gather_wait(handle: &Handle) -> Result<(), ApiError> {
    loop {
        if handle.flags.is_set(WebRtcFlags::STOP) || handle.flags.is_set(WebRtcFlags::ALERT) {
            warn!(handle = handle.id, "handle detached or PC closed, giving up");
            return Err(ApiError::new(
                code::HANDLE_NOT_FOUND,
                "Handle detached or PC closed",
            ));
        }
        let cdone = handle
            .agent
            .lock()
            .as_ref()
            .map(|agent| agent.stream.cdone)
            .unwrap_or(-1);
        if cdone < 0 {
            return Err(ApiError::new(
                code::JSEP_INVALID_SDP,
                "Error gathering candidates",
            ));
        }
        if cdone >= 1 {
            return Ok(());
        }
        debug!(handle = handle.id, "waiting for candidates-done callback");
        sleep(Duration::from_millis(100)).await;
    }
}

/// Plugin → client JSEP path: pre-parse, ICE setup or renegotiation, wait
/// for gathering, anonymize and merge in the local WebRTC attributes.
/// Returns the `jsep` object to attach to the outbound event.
pub(crate) async fn plugin_handle_sdp(
    gateway: &Gateway,
    handle: &Arc<Handle>,
    sdp_type: &str,
    sdp_body: &str,
    restart: bool,
) -> Result<Value, ApiError> {
    let flags = &handle.flags;
    let offer = if sdp_type.eq_ignore_ascii_case("offer") {
        flags.set(WebRtcFlags::GOT_OFFER);
        flags.clear(WebRtcFlags::GOT_ANSWER);
        true
    } else if sdp_type.eq_ignore_ascii_case("answer") {
        flags.set(WebRtcFlags::GOT_ANSWER);
        false
    } else {
        return Err(ApiError::new(
            code::JSEP_UNKNOWN_TYPE,
            format!("Unknown message type '{sdp_type}'"),
        ));
    };

    let mut parsed = sdp::preparse(sdp_body)?;
    let _negotiating = handle.negotiating.lock().await;
    let mut updating = false;
    if offer {
        if parsed.audio > 1 || parsed.video > 1 || parsed.data > 1 {
            warn!(handle = handle.id, "more than one media line of a kind, only negotiating one");
        }
        if parsed.data > 0 && !Gateway::SCTP_SUPPORT {
            warn!(
                handle = handle.id,
                "data channels negotiated, but support for them is not compiled in"
            );
        }
        cleaning_wait(handle, gateway.cleaning_deadline()).await?;
        let have_agent = handle.agent.lock().is_some();
        if !have_agent {
            if gateway.rfc4588() {
                flags.set(WebRtcFlags::RFC4588_RTX);
            }
            flags.set(WebRtcFlags::TRICKLE);
            let agent = IceAgent::new(
                gateway.local_ip(),
                parsed.audio > 0,
                parsed.video > 0,
                parsed.data > 0,
                true,
            );
            *handle.agent.lock() = Some(agent);
        } else {
            info!(handle = handle.id, "updating existing session");
            updating = true;
        }
    } else {
        let ext_id = sdp::extmap_id(sdp_body, sdp::EXTMAP_TRANSPORT_WIDE_CC);
        let mut guard = handle.agent.lock();
        if let Some(agent) = guard.as_mut() {
            agent.stream.do_transport_wide_cc = true;
            agent.stream.transport_wide_cc_ext_id = ext_id.unwrap_or(-1);
        }
    }

    if !updating {
        gather_wait(handle).await?;
    }

    parsed.anonymize();
    if offer && restart {
        let mut guard = handle.agent.lock();
        if let Some(agent) = guard.as_mut() {
            agent.restart();
        }
    }
    if flags.is_set(WebRtcFlags::RFC4588_RTX) {
        let ptypes = parsed.video_payload_types();
        let mut guard = handle.agent.lock();
        if let Some(agent) = guard.as_mut() {
            if agent.stream.rtx_payload_types.is_empty() && !ptypes.is_empty() {
                agent.stream.rtx_payload_types = sdp::pick_rtx_payload_types(&ptypes);
            }
        }
    }

    let merged = {
        let guard = handle.agent.lock();
        let agent = guard
            .as_ref()
            .ok_or_else(|| ApiError::new(code::JSEP_INVALID_SDP, "Error merging SDP"))?;
        let candidates: Vec<String> = if gateway.full_trickle() {
            Vec::new()
        } else {
            agent.stream.local_candidates.clone()
        };
        sdp::merge(
            &parsed,
            &sdp::MergeParams {
                ufrag: &agent.stream.local_ufrag,
                pwd: &agent.stream.local_pwd,
                fingerprint: &agent.local_fingerprint,
                candidates: &candidates,
                rtx_payload_types: &agent.stream.rtx_payload_types,
            },
        )
    };
    *handle.local_sdp.lock() = Some(merged.clone());

    if !updating {
        if offer {
            // Wait for the answer before touching trickle candidates.
            flags.set(WebRtcFlags::PROCESSING_OFFER);
        } else {
            debug!(handle = handle.id, "ready to set up remote candidates");
            ice_handle_answer(gateway, handle).await;
        }
    } else if !offer
        && flags.is_set(WebRtcFlags::READY)
        && flags.is_set(WebRtcFlags::DATA_CHANNELS)
        && Gateway::SCTP_SUPPORT
    {
        warn!(handle = handle.id, "creating data channels");
    }

    Ok(json!({ "type": sdp_type, "sdp": merged }))
}

/// Full-trickle: re-deliver the local candidates to the client as trickle
/// events, ending with a completed marker.
pub(crate) async fn resend_trickles(handle: &Arc<Handle>) {
    let Some(session) = handle.session() else {
        return;
    };
    let candidates: Vec<String> = handle
        .agent
        .lock()
        .as_ref()
        .map(|agent| agent.stream.local_candidates.clone())
        .unwrap_or_default();
    for candidate in candidates {
        let mut event = protocol::message("trickle", session.id, None);
        event["sender"] = json!(handle.id);
        event["candidate"] = json!({
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "candidate": format!("candidate:{candidate}"),
        });
        session.notify_event(event).await;
    }
    let mut done = protocol::message("trickle", session.id, None);
    done["sender"] = json!(handle.id);
    done["candidate"] = json!({ "completed": true });
    session.notify_event(done).await;
    handle.flags.clear(WebRtcFlags::RESEND_TRICKLES);
    handle.flags.set(WebRtcFlags::TRICKLE_SYNCED);
}

/// Hangs up the peer connection: idempotent through the ALERT latch, marks
/// CLEANING while the negotiated state is torn down, notifies the plugin
/// and the client. The handle survives and can renegotiate from scratch.
pub(crate) async fn webrtc_hangup(gateway: &Gateway, handle: &Arc<Handle>, reason: &str) {
    if handle.flags.is_set(WebRtcFlags::STOP) {
        return;
    }
    if !handle.flags.set_once(WebRtcFlags::ALERT) {
        return;
    }
    if handle.agent.lock().is_none() {
        // No peer connection to tear down.
        handle.flags.clear(WebRtcFlags::ALERT);
        return;
    }
    info!(handle = handle.id, reason, "hanging up peer connection");
    handle.flags.set(WebRtcFlags::CLEANING);
    if handle.flags.is_set(WebRtcFlags::READY) {
        handle.plugin.hangup_media(&handle.plugin_session).await;
    }
    if let Some(session) = handle.session() {
        let mut event = protocol::message("hangup", session.id, None);
        event["sender"] = json!(handle.id);
        event["reason"] = json!(reason);
        session.notify_event(event).await;
        gateway.events.notify_webrtc(
            session.id,
            handle.id,
            handle.opaque_id.as_deref(),
            json!({ "connection": "hangup", "reason": reason }),
        );
    }
    webrtc_free(handle);
}

/// Drops the agent and every piece of negotiated state. Clears all the
/// negotiation flags, CLEANING and ALERT included; STOP survives.
pub(crate) fn webrtc_free(handle: &Handle) {
    *handle.agent.lock() = None;
    handle.pending_trickles.lock().clear();
    *handle.local_sdp.lock() = None;
    *handle.remote_sdp.lock() = None;
    let flags = &handle.flags;
    for flag in [
        WebRtcFlags::GOT_OFFER,
        WebRtcFlags::GOT_ANSWER,
        WebRtcFlags::PROCESSING_OFFER,
        WebRtcFlags::START,
        WebRtcFlags::READY,
        WebRtcFlags::TRICKLE,
        WebRtcFlags::ALL_TRICKLES,
        WebRtcFlags::RESEND_TRICKLES,
        WebRtcFlags::TRICKLE_SYNCED,
        WebRtcFlags::ICE_RESTART,
        WebRtcFlags::HAS_AUDIO,
        WebRtcFlags::HAS_VIDEO,
        WebRtcFlags::DATA_CHANNELS,
        WebRtcFlags::RFC4588_RTX,
        WebRtcFlags::CLEANING,
        WebRtcFlags::ALERT,
    ] {
        flags.clear(flag);
    }
}
