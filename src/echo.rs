//! Demo plugin: answers offers and bounces message bodies back. Anchors the
//! end-to-end tests and serves as the reference for the plugin surface
//! (synchronous results, asynchronous events, JSEP answers).

use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::plugin::{CoreCallbacks, Plugin, PluginResult, PluginSession};

pub struct EchoPlugin {
    core: OnceLock<Arc<dyn CoreCallbacks>>,
}

impl EchoPlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            core: OnceLock::new(),
        })
    }
}

/// The offer comes back as the answer, with the DTLS role flipped.
fn answer_sdp(offer: &str) -> String {
    offer.replace("a=setup:actpass", "a=setup:active")
}

#[async_trait]
impl Plugin for EchoPlugin {
    fn package(&self) -> &str {
        "echo.test"
    }

    fn name(&self) -> &str {
        "Echo test plugin"
    }

    fn description(&self) -> &str {
        "Bounces messages and SDPs right back at the sender"
    }

    fn version_string(&self) -> &str {
        "0.1.0"
    }

    fn init(&self, core: Arc<dyn CoreCallbacks>) -> Result<()> {
        self.core
            .set(core)
            .map_err(|_| anyhow!("echo plugin initialized twice"))
    }

    async fn create_session(&self, _session: &Arc<PluginSession>) -> Result<(), String> {
        Ok(())
    }

    fn query_session(&self, _session: &Arc<PluginSession>) -> Option<Value> {
        Some(json!({ "echo": true }))
    }

    async fn destroy_session(&self, _session: &Arc<PluginSession>) {}

    async fn handle_message(
        &self,
        session: &Arc<PluginSession>,
        transaction: &str,
        body: Value,
        jsep: Option<Value>,
    ) -> PluginResult {
        if body.get("sync").and_then(Value::as_bool) == Some(true) {
            return PluginResult::Ok(json!({ "echotest": "response", "result": "ok" }));
        }
        let Some(core) = self.core.get().cloned() else {
            return PluginResult::Error("Echo plugin not initialized".to_string());
        };
        let answer = jsep.as_ref().and_then(|jsep| {
            let offer = jsep.get("type").and_then(Value::as_str)? == "offer";
            let sdp = jsep.get("sdp").and_then(Value::as_str)?;
            offer.then(|| json!({ "type": "answer", "sdp": answer_sdp(sdp) }))
        });
        let session = session.clone();
        let transaction = transaction.to_string();
        tokio::spawn(async move {
            let body = json!({ "echotest": "event", "result": "ok" });
            if let Err(err) = core
                .push_event(&session, Some(&transaction), body, answer)
                .await
            {
                debug!(%err, "echo event push failed");
            }
        });
        PluginResult::OkWait(Some("Processing the echo asynchronously".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_flips_the_dtls_role() {
        let offer = "v=0\r\nm=audio 9 RTP 0\r\na=setup:actpass\r\n";
        let answer = answer_sdp(offer);
        assert!(answer.contains("a=setup:active"));
        assert!(!answer.contains("actpass"));
    }
}
