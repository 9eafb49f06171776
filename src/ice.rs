//! ICE agent collaborator. The real ICE/DTLS machinery lives outside the
//! signaling core; this facade exposes the interface the negotiation state
//! machine drives (credentials, candidate bookkeeping, connectivity checks,
//! relay counters) and completes local gathering immediately, the way an
//! embedded agent reports it through its callbacks.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;

use crate::errors::{code, ApiError};

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(len)
        .collect()
}

fn random_fingerprint() -> String {
    let bytes: Vec<String> = (0..32)
        .map(|_| format!("{:02X}", rand::thread_rng().gen::<u8>()))
        .collect();
    bytes.join(":")
}

fn nonzero_ssrc() -> u32 {
    loop {
        let ssrc: u32 = rand::thread_rng().gen();
        if ssrc != 0 {
            return ssrc;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MediaStats {
    pub packets: u64,
    pub bytes: u64,
}

impl MediaStats {
    fn record(&mut self, len: usize) {
        self.packets += 1;
        self.bytes += len as u64;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StreamStats {
    pub audio: MediaStats,
    pub video: MediaStats,
    pub data: MediaStats,
}

/// The single negotiated stream of a peer connection (audio, video and data
/// are bundled).
#[derive(Debug)]
pub struct IceStream {
    pub id: u32,
    /// Local candidate gathering: 0 in progress, >= 1 done, < 0 failed.
    pub cdone: i32,
    pub local_ufrag: String,
    pub local_pwd: String,
    pub remote_ufrag: Option<String>,
    pub remote_pwd: Option<String>,
    pub remote_fingerprint: Option<String>,
    pub remote_hashing: Option<String>,
    pub local_candidates: Vec<String>,
    pub remote_candidates: Vec<String>,
    pub audio_ssrc: u32,
    pub video_ssrc: u32,
    pub audio_ssrc_peer: u32,
    /// Peer video SSRCs; slots past the first are simulcast substreams.
    pub video_ssrc_peer: [u32; 3],
    pub audio_send: bool,
    pub audio_recv: bool,
    pub video_send: bool,
    pub video_recv: bool,
    pub do_transport_wide_cc: bool,
    pub transport_wide_cc_ext_id: i32,
    pub rtx_payload_types: HashMap<u32, u32>,
    pub checks_started: bool,
    /// Monotonic µs when connectivity was established, 0 if not yet.
    pub connected: i64,
    pub in_stats: StreamStats,
    pub out_stats: StreamStats,
}

#[derive(Debug)]
pub struct IceAgent {
    pub created: i64,
    pub controlling: bool,
    pub local_fingerprint: String,
    pub stream: IceStream,
}

impl IceAgent {
    /// Sets up the local side of a peer connection. `controlling` is true
    /// when we sent the offer. Gathering completes immediately: the facade
    /// produces one host candidate per connection.
    pub fn new(local_ip: &str, audio: bool, video: bool, data: bool, controlling: bool) -> Self {
        let port: u16 = rand::thread_rng().gen_range(10_000..60_000);
        let candidate = format!("1 1 udp 2013266431 {local_ip} {port} typ host");
        Self {
            created: crate::monotonic_micros(),
            controlling,
            local_fingerprint: random_fingerprint(),
            stream: IceStream {
                id: 1,
                cdone: 1,
                local_ufrag: random_token(8),
                local_pwd: random_token(24),
                remote_ufrag: None,
                remote_pwd: None,
                remote_fingerprint: None,
                remote_hashing: None,
                local_candidates: vec![candidate],
                remote_candidates: Vec::new(),
                audio_ssrc: if audio { nonzero_ssrc() } else { 0 },
                video_ssrc: if video { nonzero_ssrc() } else { 0 },
                audio_ssrc_peer: 0,
                video_ssrc_peer: [0; 3],
                audio_send: audio,
                audio_recv: audio,
                video_send: video,
                video_recv: video,
                do_transport_wide_cc: false,
                transport_wide_cc_ext_id: -1,
                rtx_payload_types: HashMap::new(),
                checks_started: false,
                connected: 0,
                in_stats: StreamStats::default(),
                out_stats: StreamStats::default(),
            },
        }
    }

    pub fn set_remote_credentials(&mut self, ufrag: &str, pwd: &str) {
        self.stream.remote_ufrag = Some(ufrag.to_string());
        self.stream.remote_pwd = Some(pwd.to_string());
    }

    /// New local credentials for an ICE restart. Remote credentials stay
    /// until the peer's restarted SDP replaces them.
    pub fn restart(&mut self) {
        self.stream.local_ufrag = random_token(8);
        self.stream.local_pwd = random_token(24);
        self.stream.checks_started = false;
    }

    pub fn add_remote_candidate(&mut self, candidate: String) {
        self.stream.remote_candidates.push(candidate);
    }

    /// Starts connectivity checks with the candidates known so far. The
    /// facade connects immediately.
    pub fn start_checks(&mut self) {
        self.stream.checks_started = true;
        if self.stream.connected == 0 {
            self.stream.connected = crate::monotonic_micros();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.connected > 0
    }

    pub fn record_rtp(&mut self, video: bool, len: usize, outgoing: bool) {
        let stats = if outgoing {
            &mut self.stream.out_stats
        } else {
            &mut self.stream.in_stats
        };
        if video {
            stats.video.record(len);
        } else {
            stats.audio.record(len);
        }
    }

    pub fn record_data(&mut self, len: usize, outgoing: bool) {
        let stats = if outgoing {
            &mut self.stream.out_stats
        } else {
            &mut self.stream.in_stats
        };
        stats.data.record(len);
    }
}

/// One parsed trickle update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrickleUpdate {
    Candidate { mline_index: u32, candidate: String },
    /// `{completed: true}`: the peer has no further candidates.
    Completed,
}

/// Validates a single trickled candidate object. Only stream 0 exists:
/// everything is bundled.
pub fn parse_candidate(value: &Value) -> Result<TrickleUpdate, ApiError> {
    if !value.is_object() {
        return Err(ApiError::new(
            code::INVALID_JSON,
            "Can't parse candidate (not an object)",
        ));
    }
    if value.get("completed").and_then(Value::as_bool) == Some(true) {
        return Ok(TrickleUpdate::Completed);
    }
    let candidate = match value.get("candidate") {
        None | Some(Value::Null) => {
            return Err(ApiError::new(
                code::MISSING_MANDATORY_ELEMENT,
                "Missing mandatory element (candidate)",
            ))
        }
        Some(v) => v.as_str().ok_or_else(|| {
            ApiError::new(
                code::INVALID_ELEMENT_TYPE,
                "Invalid element type (candidate should be a string)",
            )
        })?,
    };
    if let Some(mid) = value.get("sdpMid") {
        if !mid.is_null() && !mid.is_string() {
            return Err(ApiError::new(
                code::INVALID_ELEMENT_TYPE,
                "Invalid element type (sdpMid should be a string)",
            ));
        }
    }
    let mline_index = match value.get("sdpMLineIndex") {
        None | Some(Value::Null) => 0,
        Some(v) => v.as_u64().ok_or_else(|| {
            ApiError::new(
                code::INVALID_ELEMENT_TYPE,
                "Invalid element type (sdpMLineIndex should be a positive integer)",
            )
        })? as u32,
    };
    // Audio, video and data are bundled on one stream: only the first two
    // m-lines can carry candidates.
    if mline_index > 1 {
        return Err(ApiError::new(
            code::TRICKLE_INVALID_STREAM,
            format!("No such stream for sdpMLineIndex {mline_index}"),
        ));
    }
    Ok(TrickleUpdate::Candidate {
        mline_index,
        candidate: candidate.to_string(),
    })
}

/// Per-handle text2pcap-style packet dump, toggled over the admin API. The
/// core only manages the file; the media plane writes into it.
#[derive(Debug)]
pub struct PacketDump {
    pub path: PathBuf,
    pub truncate: usize,
}

impl PacketDump {
    pub fn create(folder: Option<&str>, filename: Option<&str>, truncate: usize) -> io::Result<Self> {
        let mut path = PathBuf::from(folder.unwrap_or("."));
        match filename {
            Some(name) => path.push(name),
            None => path.push(format!("boardwalk-dump-{}.txt", random_token(8))),
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self { path, truncate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_gathers_immediately() {
        let agent = IceAgent::new("10.0.0.1", true, true, false, false);
        assert_eq!(agent.stream.cdone, 1);
        assert_eq!(agent.stream.local_candidates.len(), 1);
        assert!(agent.stream.local_candidates[0].contains("10.0.0.1"));
        assert_ne!(agent.stream.audio_ssrc, 0);
        assert!(!agent.is_connected());
    }

    #[test]
    fn restart_rotates_credentials() {
        let mut agent = IceAgent::new("10.0.0.1", true, false, false, false);
        agent.set_remote_credentials("ru", "rp");
        let (ufrag, pwd) = (
            agent.stream.local_ufrag.clone(),
            agent.stream.local_pwd.clone(),
        );
        agent.restart();
        assert_ne!(agent.stream.local_ufrag, ufrag);
        assert_ne!(agent.stream.local_pwd, pwd);
        assert_eq!(agent.stream.remote_ufrag.as_deref(), Some("ru"));
    }

    #[test]
    fn parse_candidate_validates_shape() {
        assert!(matches!(
            parse_candidate(&json!({"completed": true})),
            Ok(TrickleUpdate::Completed)
        ));
        assert!(matches!(
            parse_candidate(&json!({
                "candidate": "candidate:0 1 udp 1 1.2.3.4 5 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
            })),
            Ok(TrickleUpdate::Candidate { mline_index: 0, .. })
        ));
        assert_eq!(
            parse_candidate(&json!("str")).unwrap_err().code,
            code::INVALID_JSON
        );
        assert_eq!(
            parse_candidate(&json!({})).unwrap_err().code,
            code::MISSING_MANDATORY_ELEMENT
        );
        assert_eq!(
            parse_candidate(&json!({"candidate": 4})).unwrap_err().code,
            code::INVALID_ELEMENT_TYPE
        );
        assert_eq!(
            parse_candidate(&json!({"candidate": "c", "sdpMLineIndex": -1}))
                .unwrap_err()
                .code,
            code::INVALID_ELEMENT_TYPE
        );
    }

    #[test]
    fn relay_counters_accumulate() {
        let mut agent = IceAgent::new("10.0.0.1", true, true, true, false);
        agent.record_rtp(false, 100, false);
        agent.record_rtp(true, 200, false);
        agent.record_rtp(true, 300, true);
        agent.record_data(50, false);
        assert_eq!(agent.stream.in_stats.audio.packets, 1);
        assert_eq!(agent.stream.in_stats.audio.bytes, 100);
        assert_eq!(agent.stream.in_stats.video.bytes, 200);
        assert_eq!(agent.stream.out_stats.video.bytes, 300);
        assert_eq!(agent.stream.in_stats.data.bytes, 50);
    }
}
