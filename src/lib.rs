//! Signaling core of a WebRTC gateway: a JSON control protocol toward
//! clients on one side, in-process media plugins on the other, and the
//! session/handle lifecycle plus the per-handle negotiation state machine
//! in between. Transports and media machinery plug in through the traits in
//! [`transport`] and [`plugin`].

pub mod admin;
pub mod auth;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod echo;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod ice;
pub mod negotiation;
pub mod plugin;
pub mod protocol;
pub mod sdp;
pub mod session;
pub mod transport;
pub mod websocket;

use std::time::Instant;

use once_cell::sync::Lazy;

pub use config::Config;
pub use errors::ApiError;
pub use gateway::Gateway;

pub const SERVER_NAME: &str = "Boardwalk WebRTC Gateway";
pub const SERVER_AUTHOR: &str = "The Boardwalk authors";
/// Wire-visible integer API version.
pub const API_VERSION: u32 = 3;
pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic microseconds since process start. Activity clocks, trickle
/// timestamps and admin diagnostics all use this scale.
pub fn monotonic_micros() -> i64 {
    EPOCH.elapsed().as_micros() as i64
}
