use clap::Parser;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "boardwalk")]
#[command(about = "WebRTC gateway signaling core")]
pub struct Cli {
    /// Port for the built-in WebSocket transport
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Public name of this instance
    #[arg(long)]
    pub server_name: Option<String>,

    /// Session idle timeout in seconds (0 disables the sweep)
    #[arg(short = 'S', long)]
    pub session_timeout: Option<u64>,

    /// Secret clients must present on the client API
    #[arg(long)]
    pub api_secret: Option<String>,

    /// Secret required on the admin API
    #[arg(long)]
    pub admin_secret: Option<String>,

    /// Enable token-based authentication
    #[arg(long)]
    pub token_auth: bool,

    /// Trickle local candidates instead of embedding them in the SDP
    #[arg(long)]
    pub full_trickle: bool,

    /// Negotiate RFC 4588 retransmissions by default
    #[arg(long)]
    pub rfc4588: bool,

    /// Log level, 0 (off) to 7 (everything)
    #[arg(short = 'l', long)]
    pub log_level: Option<i32>,
}

impl Cli {
    /// Command-line arguments win over the environment.
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(server_name) = self.server_name {
            config.server_name = server_name;
        }
        if let Some(session_timeout) = self.session_timeout {
            config.session_timeout = session_timeout;
        }
        // An empty secret means "no secret", same as in the environment.
        if self.api_secret.as_deref().is_some_and(|s| !s.is_empty()) {
            config.api_secret = self.api_secret;
        }
        if self.admin_secret.as_deref().is_some_and(|s| !s.is_empty()) {
            config.admin_secret = self.admin_secret;
        }
        if self.token_auth {
            config.token_auth = true;
        }
        if self.full_trickle {
            config.full_trickle = true;
        }
        if self.rfc4588 {
            config.rfc4588 = true;
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }
        config
    }
}
