//! SDP collaborator: the pre-parse, anonymize and merge passes the
//! negotiation state machine needs. This is deliberately a line-oriented
//! rewriter, not a full SDP stack — media-level semantics beyond what the
//! signaling core consumes stay with the media plane.

use std::collections::HashMap;

use crate::errors::{code, ApiError};

#[derive(Debug, Clone)]
pub struct ParsedSdp {
    lines: Vec<String>,
    /// Counts of m-lines per kind. More than one of a kind parses fine but
    /// only the first is negotiated.
    pub audio: usize,
    pub video: usize,
    pub data: usize,
}

pub fn preparse(sdp: &str) -> Result<ParsedSdp, ApiError> {
    let lines: Vec<String> = sdp
        .lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if lines.first().map(String::as_str) != Some("v=0") {
        return Err(ApiError::new(
            code::JSEP_INVALID_SDP,
            "Can't parse SDP (missing v=0)",
        ));
    }
    let mut audio = 0;
    let mut video = 0;
    let mut data = 0;
    for line in &lines {
        if line.starts_with("m=audio ") {
            audio += 1;
        } else if line.starts_with("m=video ") {
            video += 1;
        } else if line.starts_with("m=application ") && line.contains("SCTP") {
            data += 1;
        }
    }
    if audio + video + data == 0 {
        return Err(ApiError::new(
            code::JSEP_INVALID_SDP,
            "Can't parse SDP (no m-lines)",
        ));
    }
    Ok(ParsedSdp {
        lines,
        audio,
        video,
        data,
    })
}

fn is_sensitive(line: &str) -> bool {
    line.starts_with("a=candidate:")
        || line.starts_with("a=end-of-candidates")
        || line.starts_with("a=ice-ufrag:")
        || line.starts_with("a=ice-pwd:")
        || line.starts_with("a=fingerprint:")
}

impl ParsedSdp {
    /// Strips candidates, ICE credentials and fingerprints: the stripped
    /// body is what plugins see and what gets stored as the handle's SDP.
    pub fn anonymize(&mut self) {
        self.lines.retain(|l| !is_sensitive(l));
    }

    pub fn write(&self) -> String {
        let mut out = self.lines.join("\r\n");
        out.push_str("\r\n");
        out
    }

    /// Payload types advertised on the first video m-line.
    pub fn video_payload_types(&self) -> Vec<u32> {
        self.lines
            .iter()
            .find(|l| l.starts_with("m=video "))
            .map(|l| {
                l.split_whitespace()
                    .skip(3)
                    .filter_map(|pt| pt.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// WebRTC attributes of the remote side, pulled out of an incoming SDP
/// before it is anonymized.
#[derive(Debug, Clone, Default)]
pub struct RemoteDetails {
    pub ufrag: Option<String>,
    pub pwd: Option<String>,
    pub fingerprint: Option<String>,
    pub fingerprint_hash: Option<String>,
    pub audio_ssrc: Option<u32>,
    /// Distinct video SSRCs in order of appearance; more than one means the
    /// peer is simulcasting.
    pub video_ssrcs: Vec<u32>,
}

pub fn remote_details(parsed: &ParsedSdp) -> RemoteDetails {
    let mut details = RemoteDetails::default();
    let mut section = "";
    for line in &parsed.lines {
        if line.starts_with("m=audio ") {
            section = "audio";
        } else if line.starts_with("m=video ") {
            section = "video";
        } else if line.starts_with("m=") {
            section = "other";
        }
        if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
            details.ufrag.get_or_insert_with(|| value.to_string());
        } else if let Some(value) = line.strip_prefix("a=ice-pwd:") {
            details.pwd.get_or_insert_with(|| value.to_string());
        } else if let Some(value) = line.strip_prefix("a=fingerprint:") {
            if details.fingerprint.is_none() {
                let mut parts = value.splitn(2, ' ');
                details.fingerprint_hash = parts.next().map(String::from);
                details.fingerprint = parts.next().map(String::from);
            }
        } else if let Some(value) = line.strip_prefix("a=ssrc:") {
            let ssrc: Option<u32> = value.split_whitespace().next().and_then(|s| s.parse().ok());
            if let Some(ssrc) = ssrc {
                match section {
                    "audio" => {
                        details.audio_ssrc.get_or_insert(ssrc);
                    }
                    "video" => {
                        if !details.video_ssrcs.contains(&ssrc) && details.video_ssrcs.len() < 3 {
                            details.video_ssrcs.push(ssrc);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    details
}

/// Extension id for an RTP header extension (`a=extmap:<id> <uri>`), if the
/// SDP negotiates it.
pub fn extmap_id(sdp: &str, uri: &str) -> Option<i32> {
    for line in sdp.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("a=extmap:") {
            let mut parts = rest.splitn(2, ' ');
            let id = parts.next().and_then(|id| id.parse().ok());
            if parts.next() == Some(uri) {
                return id;
            }
        }
    }
    None
}

pub const EXTMAP_TRANSPORT_WIDE_CC: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

/// Picks an RTX payload type for every negotiated video payload type by
/// scanning the free ids in 96..=127. Returns an empty map when the id
/// space is exhausted for some type.
pub fn pick_rtx_payload_types(ptypes: &[u32]) -> HashMap<u32, u32> {
    let mut chosen: HashMap<u32, u32> = HashMap::new();
    for &pt in ptypes {
        let mut rtx = pt + 1;
        loop {
            if rtx > 127 {
                rtx = 96;
            }
            if rtx == pt {
                // Scanned the whole range without a free id.
                return HashMap::new();
            }
            if !ptypes.contains(&rtx) && !chosen.values().any(|&v| v == rtx) {
                break;
            }
            rtx += 1;
        }
        chosen.insert(pt, rtx);
    }
    chosen
}

/// Local WebRTC attributes to weave back into a plugin-provided SDP.
pub struct MergeParams<'a> {
    pub ufrag: &'a str,
    pub pwd: &'a str,
    pub fingerprint: &'a str,
    /// Local candidates to embed; empty under full-trickle, where the
    /// candidates travel out of band instead.
    pub candidates: &'a [String],
    pub rtx_payload_types: &'a HashMap<u32, u32>,
}

/// Enriches an anonymized SDP with the local ICE credentials, fingerprint
/// and (half-trickle) candidate lines, plus RTX payload types on the video
/// m-line when RFC 4588 was negotiated.
pub fn merge(parsed: &ParsedSdp, params: &MergeParams) -> String {
    let mut out: Vec<String> = Vec::with_capacity(parsed.lines.len() + 8);
    for line in &parsed.lines {
        if line.starts_with("m=") {
            let mut mline = line.clone();
            if line.starts_with("m=video ") && !params.rtx_payload_types.is_empty() {
                let mut rtx_ids: Vec<u32> = params.rtx_payload_types.values().copied().collect();
                rtx_ids.sort();
                for rtx in &rtx_ids {
                    mline.push_str(&format!(" {rtx}"));
                }
            }
            out.push(mline);
            out.push(format!("a=ice-ufrag:{}", params.ufrag));
            out.push(format!("a=ice-pwd:{}", params.pwd));
            out.push(format!("a=fingerprint:sha-256 {}", params.fingerprint));
            for candidate in params.candidates {
                out.push(format!("a=candidate:{candidate}"));
            }
            if !params.candidates.is_empty() {
                out.push("a=end-of-candidates".to_string());
            }
            if line.starts_with("m=video ") {
                let mut pairs: Vec<(u32, u32)> = params
                    .rtx_payload_types
                    .iter()
                    .map(|(&pt, &rtx)| (pt, rtx))
                    .collect();
                pairs.sort();
                for (pt, rtx) in pairs {
                    out.push(format!("a=rtpmap:{rtx} rtx/90000"));
                    out.push(format!("a=fmtp:{rtx} apt={pt}"));
                }
            }
        } else {
            out.push(line.clone());
        }
    }
    let mut merged = out.join("\r\n");
    merged.push_str("\r\n");
    merged
}
