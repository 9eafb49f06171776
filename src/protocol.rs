//! Envelope helpers for the JSON control protocol: field validation in the
//! style the verb handlers need (missing element vs. wrong type are distinct
//! wire errors) and builders for the reply messages.

use serde_json::{json, Value};

use crate::errors::{code, ApiError};
use crate::gateway::Gateway;

/// Base reply envelope: `{janus: <status>, session_id?, transaction?}`.
pub fn message(status: &str, session_id: u64, transaction: Option<&str>) -> Value {
    let mut msg = json!({ "janus": status });
    if session_id > 0 {
        msg["session_id"] = json!(session_id);
    }
    if let Some(t) = transaction {
        msg["transaction"] = json!(t);
    }
    msg
}

/// Error reply envelope.
pub fn error_message(session_id: u64, transaction: Option<&str>, err: &ApiError) -> Value {
    let mut msg = message("error", session_id, transaction);
    msg["error"] = json!({ "code": err.code, "reason": err.reason });
    msg
}

fn missing(key: &str) -> ApiError {
    ApiError::new(
        code::MISSING_MANDATORY_ELEMENT,
        format!("Missing mandatory element ({key})"),
    )
}

fn wrong_type(key: &str, expected: &str) -> ApiError {
    ApiError::new(
        code::INVALID_ELEMENT_TYPE,
        format!("Invalid element type ({key} should be {expected})"),
    )
}

pub fn require_str<'a>(root: &'a Value, key: &str) -> Result<&'a str, ApiError> {
    match root.get(key) {
        None | Some(Value::Null) => Err(missing(key)),
        Some(v) => v.as_str().ok_or_else(|| wrong_type(key, "a string")),
    }
}

pub fn optional_str<'a>(root: &'a Value, key: &str) -> Result<Option<&'a str>, ApiError> {
    match root.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| wrong_type(key, "a string")),
    }
}

/// Positive integer, required.
pub fn require_uint(root: &Value, key: &str) -> Result<u64, ApiError> {
    match root.get(key) {
        None | Some(Value::Null) => Err(missing(key)),
        Some(v) => v
            .as_u64()
            .ok_or_else(|| wrong_type(key, "a positive integer")),
    }
}

/// Positive integer, optional. `Some(Null)` counts as absent.
pub fn optional_uint(root: &Value, key: &str) -> Result<Option<u64>, ApiError> {
    match root.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| wrong_type(key, "a positive integer")),
    }
}

pub fn require_bool(root: &Value, key: &str) -> Result<bool, ApiError> {
    match root.get(key) {
        None | Some(Value::Null) => Err(missing(key)),
        Some(v) => v.as_bool().ok_or_else(|| wrong_type(key, "a boolean")),
    }
}

pub fn optional_bool(root: &Value, key: &str) -> Result<Option<bool>, ApiError> {
    match root.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| wrong_type(key, "a boolean")),
    }
}

pub fn require_object<'a>(root: &'a Value, key: &str) -> Result<&'a Value, ApiError> {
    match root.get(key) {
        None | Some(Value::Null) => Err(missing(key)),
        Some(v) if v.is_object() => Ok(v),
        Some(_) => Err(wrong_type(key, "an object")),
    }
}

/// Server descriptor, shared by the client `info` verb and the admin API.
pub fn server_info(gateway: &Gateway, transaction: Option<&str>) -> Value {
    let mut info = message("server_info", 0, transaction);
    info["name"] = json!(crate::SERVER_NAME);
    info["version"] = json!(crate::API_VERSION);
    info["version_string"] = json!(crate::VERSION_STRING);
    info["author"] = json!(crate::SERVER_AUTHOR);
    info["server-name"] = json!(gateway.server_name());
    info["session-timeout"] = json!(gateway.tunables.session_timeout());
    info["data_channels"] = json!(Gateway::SCTP_SUPPORT);
    info["local-ip"] = json!(gateway.local_ip());
    info["full-trickle"] = json!(gateway.full_trickle());
    info["rfc-4588"] = json!(gateway.rfc4588());
    info["api_secret"] = json!(gateway.auth.has_api_secret());
    info["auth_token"] = json!(gateway.auth.is_token_auth_enabled());
    info["event_handlers"] = json!(gateway.events.is_enabled());

    let mut transports = serde_json::Map::new();
    for meta in gateway.transport_metadata() {
        transports.insert(
            meta.package.clone(),
            json!({
                "name": meta.name,
                "author": meta.author,
                "description": meta.description,
                "version_string": meta.version_string,
                "version": meta.version,
            }),
        );
    }
    info["transports"] = Value::Object(transports);

    let mut handlers = serde_json::Map::new();
    for meta in gateway.events.metadata() {
        handlers.insert(
            meta.package.clone(),
            json!({
                "name": meta.name,
                "author": meta.author,
                "description": meta.description,
                "version_string": meta.version_string,
                "version": meta.version,
            }),
        );
    }
    info["events"] = Value::Object(handlers);

    let mut plugins = serde_json::Map::new();
    for meta in gateway.plugin_metadata() {
        plugins.insert(
            meta.package.clone(),
            json!({
                "name": meta.name,
                "author": meta.author,
                "description": meta.description,
                "version_string": meta.version_string,
                "version": meta.version,
            }),
        );
    }
    info["plugins"] = Value::Object(plugins);

    info
}

/// Metadata row shared by transports, plugins and event handlers in
/// `server_info`.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub package: String,
    pub name: String,
    pub author: String,
    pub description: String,
    pub version: u32,
    pub version_string: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_omits_empty_fields() {
        let msg = message("ack", 0, None);
        assert_eq!(msg["janus"], "ack");
        assert!(msg.get("session_id").is_none());
        assert!(msg.get("transaction").is_none());

        let msg = message("success", 7, Some("t1"));
        assert_eq!(msg["session_id"], 7);
        assert_eq!(msg["transaction"], "t1");
    }

    #[test]
    fn missing_vs_wrong_type() {
        let root = json!({ "janus": 42 });
        assert_eq!(
            require_str(&root, "transaction").unwrap_err().code,
            code::MISSING_MANDATORY_ELEMENT
        );
        assert_eq!(
            require_str(&root, "janus").unwrap_err().code,
            code::INVALID_ELEMENT_TYPE
        );
    }

    #[test]
    fn uint_rejects_negative_and_strings() {
        let root = json!({ "id": -4, "other": "nope" });
        assert_eq!(
            require_uint(&root, "id").unwrap_err().code,
            code::INVALID_ELEMENT_TYPE
        );
        assert_eq!(
            optional_uint(&root, "other").unwrap_err().code,
            code::INVALID_ELEMENT_TYPE
        );
        assert_eq!(optional_uint(&root, "absent").unwrap(), None);
    }
}
