//! Authorization gate for the control protocol: an optional static API
//! secret, an optional admin secret, and an optional token store with
//! per-plugin allow-lists. Secrets are compared in constant time.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde_json::Value;

use crate::config::Config;
use crate::errors::{code, ApiError};

/// Compares the full length of both strings regardless of where they first
/// differ, so the comparison time leaks nothing about the secret.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if b.is_empty() {
        return a.is_empty();
    }
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len() {
        diff |= (a[i] ^ b[i % b.len()]) as usize;
    }
    diff == 0
}

pub struct AuthGate {
    api_secret: Option<String>,
    admin_secret: Option<String>,
    /// `Some` iff token-based authentication is enabled.
    tokens: Option<RwLock<HashMap<String, HashSet<String>>>>,
}

impl AuthGate {
    pub fn new(config: &Config) -> Self {
        Self {
            api_secret: config.api_secret.clone(),
            admin_secret: config.admin_secret.clone(),
            tokens: config.token_auth.then(|| RwLock::new(HashMap::new())),
        }
    }

    pub fn has_api_secret(&self) -> bool {
        self.api_secret.is_some()
    }

    pub fn is_token_auth_enabled(&self) -> bool {
        self.tokens.is_some()
    }

    /// Authorizes a client-API message: passes when nothing is configured,
    /// otherwise requires either the API secret or a valid token.
    pub fn check_message(&self, root: &Value) -> Result<(), ApiError> {
        if self.api_secret.is_none() && self.tokens.is_none() {
            return Ok(());
        }
        let mut secret_authorized = false;
        let mut token_authorized = false;
        if let Some(expected) = &self.api_secret {
            if let Some(supplied) = root.get("apisecret").and_then(Value::as_str) {
                secret_authorized = constant_time_eq(supplied, expected);
            }
        }
        if self.tokens.is_some() {
            if let Some(token) = root.get("token").and_then(Value::as_str) {
                token_authorized = self.check_token(token);
            }
        }
        if secret_authorized || token_authorized {
            Ok(())
        } else {
            Err(ApiError::from_code(code::UNAUTHORIZED))
        }
    }

    /// Authorizes an admin-API message against the admin secret, when one is
    /// configured.
    pub fn check_admin(&self, root: &Value) -> Result<(), ApiError> {
        let Some(expected) = &self.admin_secret else {
            return Ok(());
        };
        match root.get("admin_secret").and_then(Value::as_str) {
            Some(supplied) if constant_time_eq(supplied, expected) => Ok(()),
            _ => Err(ApiError::from_code(code::UNAUTHORIZED)),
        }
    }

    pub fn check_token(&self, token: &str) -> bool {
        match &self.tokens {
            Some(tokens) => tokens.read().contains_key(token),
            None => false,
        }
    }

    /// Whether `token` may attach to `package`. Only meaningful when token
    /// auth is enabled; a token that merely exists has no plugin access
    /// until allowed.
    pub fn check_plugin(&self, token: &str, package: &str) -> bool {
        match &self.tokens {
            Some(tokens) => tokens
                .read()
                .get(token)
                .map(|allowed| allowed.contains(package))
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn add_token(&self, token: &str) -> bool {
        match &self.tokens {
            Some(tokens) => {
                tokens
                    .write()
                    .entry(token.to_string())
                    .or_insert_with(HashSet::new);
                true
            }
            None => false,
        }
    }

    pub fn remove_token(&self, token: &str) -> bool {
        match &self.tokens {
            Some(tokens) => tokens.write().remove(token).is_some(),
            None => false,
        }
    }

    pub fn allow_plugin(&self, token: &str, package: &str) -> bool {
        match &self.tokens {
            Some(tokens) => match tokens.write().get_mut(token) {
                Some(allowed) => {
                    allowed.insert(package.to_string());
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn disallow_plugin(&self, token: &str, package: &str) -> bool {
        match &self.tokens {
            Some(tokens) => match tokens.write().get_mut(token) {
                Some(allowed) => {
                    allowed.remove(package);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn list_tokens(&self) -> Vec<(String, Vec<String>)> {
        match &self.tokens {
            Some(tokens) => tokens
                .read()
                .iter()
                .map(|(token, allowed)| {
                    let mut plugins: Vec<String> = allowed.iter().cloned().collect();
                    plugins.sort();
                    (token.clone(), plugins)
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn list_plugins(&self, token: &str) -> Vec<String> {
        match &self.tokens {
            Some(tokens) => tokens
                .read()
                .get(token)
                .map(|allowed| {
                    let mut plugins: Vec<String> = allowed.iter().cloned().collect();
                    plugins.sort();
                    plugins
                })
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate(api_secret: Option<&str>, token_auth: bool) -> AuthGate {
        let config = Config {
            api_secret: api_secret.map(String::from),
            admin_secret: Some("adminpass".to_string()),
            token_auth,
            ..Config::default()
        };
        AuthGate::new(&config)
    }

    #[test]
    fn open_gate_passes_everything() {
        let gate = gate(None, false);
        assert!(gate.check_message(&json!({})).is_ok());
    }

    #[test]
    fn api_secret_required_when_configured() {
        let gate = gate(Some("s3cret"), false);
        let err = gate.check_message(&json!({})).unwrap_err();
        assert_eq!(err.code, code::UNAUTHORIZED);
        assert!(gate
            .check_message(&json!({"apisecret": "s3cret"}))
            .is_ok());
        assert!(gate
            .check_message(&json!({"apisecret": "wrong"}))
            .is_err());
    }

    #[test]
    fn token_is_an_alternative_to_the_secret() {
        let gate = gate(Some("s3cret"), true);
        gate.add_token("tok");
        assert!(gate.check_message(&json!({"token": "tok"})).is_ok());
        assert!(gate.check_message(&json!({"token": "other"})).is_err());
    }

    #[test]
    fn plugin_acl_follows_allow_disallow() {
        let gate = gate(None, true);
        gate.add_token("tok");
        assert!(!gate.check_plugin("tok", "echo.test"));
        assert!(gate.allow_plugin("tok", "echo.test"));
        assert!(gate.check_plugin("tok", "echo.test"));
        assert!(gate.disallow_plugin("tok", "echo.test"));
        assert!(!gate.check_plugin("tok", "echo.test"));
        assert!(!gate.allow_plugin("missing", "echo.test"));
    }

    #[test]
    fn removing_a_token_revokes_it() {
        let gate = gate(None, true);
        gate.add_token("tok");
        assert!(gate.remove_token("tok"));
        assert!(!gate.check_token("tok"));
        assert!(!gate.remove_token("tok"));
    }

    #[test]
    fn admin_secret_is_separate() {
        let gate = gate(Some("s3cret"), false);
        assert!(gate.check_admin(&json!({"admin_secret": "adminpass"})).is_ok());
        assert!(gate.check_admin(&json!({"admin_secret": "s3cret"})).is_err());
        assert!(gate.check_admin(&json!({})).is_err());
    }

    #[test]
    fn constant_time_eq_handles_length_mismatch() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(!constant_time_eq("", "a"));
        assert!(!constant_time_eq("a", ""));
        assert!(constant_time_eq("", ""));
    }
}
