use std::env;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

/// Default idle timeout for sessions, in seconds. A session with no
/// authorized activity for this long is swept; the API's `keepalive` verb
/// exists to refresh it. 0 disables the sweep (not recommended: sessions
/// abandoned by their transport are never reclaimed).
pub const DEFAULT_SESSION_TIMEOUT: u64 = 60;

/// Startup configuration, resolved from the environment with CLI overrides
/// applied on top.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub server_name: String,
    pub local_ip: String,
    pub session_timeout: u64,
    pub api_secret: Option<String>,
    pub admin_secret: Option<String>,
    pub token_auth: bool,
    pub full_trickle: bool,
    pub rfc4588: bool,
    pub log_level: i32,
    /// How long a buffered trickle candidate stays eligible for replay.
    pub trickle_expiry: Duration,
    /// How long an offer/answer waits for a previous teardown to finish.
    pub cleaning_deadline: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("BOARDWALK_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8188),
            server_name: env::var("BOARDWALK_SERVER_NAME")
                .unwrap_or_else(|_| "MyBoardwalkInstance".to_string()),
            local_ip: env::var("BOARDWALK_LOCAL_IP").unwrap_or_else(|_| "127.0.0.1".to_string()),
            session_timeout: env::var("BOARDWALK_SESSION_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(DEFAULT_SESSION_TIMEOUT),
            api_secret: env::var("BOARDWALK_API_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            admin_secret: env::var("BOARDWALK_ADMIN_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            token_auth: env_truthy("BOARDWALK_TOKEN_AUTH"),
            full_trickle: env_truthy("BOARDWALK_FULL_TRICKLE"),
            rfc4588: env_truthy("BOARDWALK_RFC4588"),
            log_level: env::var("BOARDWALK_LOG_LEVEL")
                .ok()
                .and_then(|l| l.parse().ok())
                .unwrap_or(4),
            trickle_expiry: Duration::from_secs(45),
            cleaning_deadline: Duration::from_secs(3),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8188,
            server_name: "MyBoardwalkInstance".to_string(),
            local_ip: "127.0.0.1".to_string(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            api_secret: None,
            admin_secret: None,
            token_auth: false,
            full_trickle: false,
            rfc4588: false,
            log_level: 4,
            trickle_expiry: Duration::from_secs(45),
            cleaning_deadline: Duration::from_secs(3),
        }
    }
}

fn env_truthy(key: &str) -> bool {
    env::var(key)
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

/// Live-tunable settings, readable from any thread and written only by the
/// admin API. Plain atomics: readers take a snapshot, there is nothing to
/// keep consistent across fields.
#[derive(Debug)]
pub struct Tunables {
    session_timeout: AtomicU64,
    log_level: AtomicI32,
    log_timestamps: AtomicBool,
    log_colors: AtomicBool,
    locking_debug: AtomicBool,
    refcount_debug: AtomicBool,
    ice_debug: AtomicBool,
    max_nack_queue: AtomicU32,
    no_media_timer: AtomicU32,
}

impl Tunables {
    pub fn new(config: &Config) -> Self {
        Self {
            session_timeout: AtomicU64::new(config.session_timeout),
            log_level: AtomicI32::new(config.log_level),
            log_timestamps: AtomicBool::new(false),
            log_colors: AtomicBool::new(true),
            locking_debug: AtomicBool::new(false),
            refcount_debug: AtomicBool::new(false),
            ice_debug: AtomicBool::new(false),
            max_nack_queue: AtomicU32::new(300),
            no_media_timer: AtomicU32::new(1),
        }
    }

    pub fn session_timeout(&self) -> u64 {
        self.session_timeout.load(Ordering::Relaxed)
    }

    pub fn set_session_timeout(&self, secs: u64) {
        self.session_timeout.store(secs, Ordering::Relaxed);
    }

    pub fn log_level(&self) -> i32 {
        self.log_level.load(Ordering::Relaxed)
    }

    pub fn set_log_level(&self, level: i32) {
        self.log_level.store(level, Ordering::Relaxed);
    }

    pub fn log_timestamps(&self) -> bool {
        self.log_timestamps.load(Ordering::Relaxed)
    }

    pub fn set_log_timestamps(&self, on: bool) {
        self.log_timestamps.store(on, Ordering::Relaxed);
    }

    pub fn log_colors(&self) -> bool {
        self.log_colors.load(Ordering::Relaxed)
    }

    pub fn set_log_colors(&self, on: bool) {
        self.log_colors.store(on, Ordering::Relaxed);
    }

    pub fn locking_debug(&self) -> bool {
        self.locking_debug.load(Ordering::Relaxed)
    }

    pub fn set_locking_debug(&self, on: bool) {
        self.locking_debug.store(on, Ordering::Relaxed);
    }

    pub fn refcount_debug(&self) -> bool {
        self.refcount_debug.load(Ordering::Relaxed)
    }

    pub fn set_refcount_debug(&self, on: bool) {
        self.refcount_debug.store(on, Ordering::Relaxed);
    }

    pub fn ice_debug(&self) -> bool {
        self.ice_debug.load(Ordering::Relaxed)
    }

    pub fn set_ice_debug(&self, on: bool) {
        self.ice_debug.store(on, Ordering::Relaxed);
    }

    pub fn max_nack_queue(&self) -> u32 {
        self.max_nack_queue.load(Ordering::Relaxed)
    }

    pub fn set_max_nack_queue(&self, value: u32) {
        self.max_nack_queue.store(value, Ordering::Relaxed);
    }

    pub fn no_media_timer(&self) -> u32 {
        self.no_media_timer.load(Ordering::Relaxed)
    }

    pub fn set_no_media_timer(&self, value: u32) {
        self.no_media_timer.store(value, Ordering::Relaxed);
    }
}

/// Numeric wire log levels: 0 = off .. 7 = everything.
pub const LOG_NONE: i32 = 0;
pub const LOG_MAX: i32 = 7;

fn level_directive(level: i32) -> &'static str {
    match level {
        i32::MIN..=0 => "off",
        1 | 2 => "error",
        3 => "warn",
        4 => "info",
        5 => "debug",
        _ => "trace",
    }
}

/// Handle onto the installed tracing filter, so the admin API can retune the
/// level at runtime.
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogControl {
    /// Install the global subscriber. `RUST_LOG` wins over the numeric level
    /// for the initial filter; `set_level` replaces whatever is installed.
    pub fn init(level: i32) -> Self {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));
        let (filter, handle) = reload::Layer::new(filter);
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        Self { handle }
    }

    pub fn set_level(&self, level: i32) {
        let _ = self.handle.reload(EnvFilter::new(level_directive(level)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunables_start_from_config() {
        let config = Config {
            session_timeout: 12,
            log_level: 6,
            ..Config::default()
        };
        let tunables = Tunables::new(&config);
        assert_eq!(tunables.session_timeout(), 12);
        assert_eq!(tunables.log_level(), 6);
        assert_eq!(tunables.max_nack_queue(), 300);
    }

    #[test]
    fn level_directives_clamp() {
        assert_eq!(level_directive(-3), "off");
        assert_eq!(level_directive(0), "off");
        assert_eq!(level_directive(2), "error");
        assert_eq!(level_directive(4), "info");
        assert_eq!(level_directive(9), "trace");
    }
}
