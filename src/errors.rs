use thiserror::Error;

/// Wire error codes. These integers are part of the control-protocol
/// contract and must never be renumbered.
pub mod code {
    pub const UNAUTHORIZED: i32 = 403;
    pub const UNAUTHORIZED_PLUGIN: i32 = 405;
    pub const TRANSPORT_SPECIFIC: i32 = 450;
    pub const MISSING_REQUEST: i32 = 452;
    pub const UNKNOWN_REQUEST: i32 = 453;
    pub const INVALID_JSON: i32 = 454;
    pub const INVALID_JSON_OBJECT: i32 = 455;
    pub const MISSING_MANDATORY_ELEMENT: i32 = 456;
    pub const INVALID_REQUEST_PATH: i32 = 457;
    pub const SESSION_NOT_FOUND: i32 = 458;
    pub const HANDLE_NOT_FOUND: i32 = 459;
    pub const PLUGIN_NOT_FOUND: i32 = 460;
    pub const PLUGIN_ATTACH: i32 = 461;
    pub const PLUGIN_MESSAGE: i32 = 462;
    pub const PLUGIN_DETACH: i32 = 463;
    pub const JSEP_UNKNOWN_TYPE: i32 = 464;
    pub const JSEP_INVALID_SDP: i32 = 465;
    pub const TRICKLE_INVALID_STREAM: i32 = 466;
    pub const INVALID_ELEMENT_TYPE: i32 = 467;
    pub const SESSION_CONFLICT: i32 = 468;
    pub const UNEXPECTED_ANSWER: i32 = 469;
    pub const TOKEN_NOT_FOUND: i32 = 470;
    pub const WEBRTC_STATE: i32 = 471;
    pub const UNKNOWN: i32 = 490;
}

/// An error reply on its way back to the client: a fixed integer code plus
/// a human-readable reason.
#[derive(Debug, Clone, Error)]
#[error("{reason} ({code})")]
pub struct ApiError {
    pub code: i32,
    pub reason: String,
}

impl ApiError {
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Error with the stock reason for its code.
    pub fn from_code(code: i32) -> Self {
        Self::new(code, default_reason(code))
    }
}

fn default_reason(code: i32) -> &'static str {
    match code {
        code::UNAUTHORIZED => "Unauthorized request (wrong or missing secret/token)",
        code::UNAUTHORIZED_PLUGIN => "Unauthorized access to plugin (token is not allowed to)",
        code::TRANSPORT_SPECIFIC => "Transport specific error",
        code::MISSING_REQUEST => "Missing request",
        code::UNKNOWN_REQUEST => "Unknown request",
        code::INVALID_JSON => "Invalid JSON",
        code::INVALID_JSON_OBJECT => "Invalid JSON Object",
        code::MISSING_MANDATORY_ELEMENT => "Missing mandatory element",
        code::INVALID_REQUEST_PATH => "Invalid path for this request",
        code::SESSION_NOT_FOUND => "Session not found",
        code::HANDLE_NOT_FOUND => "Handle not found",
        code::PLUGIN_NOT_FOUND => "Plugin not found",
        code::PLUGIN_ATTACH => "Error attaching plugin",
        code::PLUGIN_MESSAGE => "Error sending message to plugin",
        code::PLUGIN_DETACH => "Error detaching from plugin",
        code::JSEP_UNKNOWN_TYPE => "Unsupported JSEP type",
        code::JSEP_INVALID_SDP => "Invalid SDP",
        code::TRICKLE_INVALID_STREAM => "Invalid stream",
        code::INVALID_ELEMENT_TYPE => "Invalid element type",
        code::SESSION_CONFLICT => "Session ID already in use",
        code::UNEXPECTED_ANSWER => "Unexpected ANSWER",
        code::TOKEN_NOT_FOUND => "Token not found",
        code::WEBRTC_STATE => "Wrong WebRTC state",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_reasons_cover_every_code() {
        for c in [
            code::UNAUTHORIZED,
            code::SESSION_NOT_FOUND,
            code::WEBRTC_STATE,
            code::UNKNOWN,
        ] {
            let err = ApiError::from_code(c);
            assert_eq!(err.code, c);
            assert!(!err.reason.is_empty());
        }
    }

    #[test]
    fn unknown_code_falls_back() {
        assert_eq!(ApiError::from_code(9999).reason, "Unknown error");
    }
}
