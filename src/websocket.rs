//! Built-in WebSocket carrier: serves the client API at `/janus` and the
//! admin API at `/admin`. Each connection gets a transport session; a
//! forward task drains its outbound channel into the socket.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::errors::{code, ApiError};
use crate::gateway::Gateway;
use crate::protocol;
use crate::transport::{OutboundMessage, Transport, TransportSession};

pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl Transport for WsTransport {
    fn package(&self) -> &str {
        "boardwalk.transport.ws"
    }

    fn name(&self) -> &str {
        "WebSocket transport"
    }

    fn description(&self) -> &str {
        "WebSocket carrier for the client and admin APIs"
    }

    fn is_janus_api_enabled(&self) -> bool {
        true
    }

    fn is_admin_api_enabled(&self) -> bool {
        true
    }
}

#[derive(Clone)]
struct WsState {
    gateway: Arc<Gateway>,
    transport: Arc<WsTransport>,
    admin: bool,
}

/// Serves both endpoints on the given listener until the process stops.
pub async fn serve(
    gateway: Arc<Gateway>,
    transport: Arc<WsTransport>,
    listener: TcpListener,
) -> Result<()> {
    let janus_routes = Router::new().route("/janus", get(ws_handler)).with_state(WsState {
        gateway: gateway.clone(),
        transport: transport.clone(),
        admin: false,
    });
    let admin_routes = Router::new().route("/admin", get(ws_handler)).with_state(WsState {
        gateway,
        transport,
        admin: true,
    });
    let app = Router::new()
        .merge(janus_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http());
    info!(addr = %listener.local_addr()?, "WebSocket transport listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(State(state): State<WsState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (instance, mut rx) = TransportSession::new();
    let (mut sender, mut receiver) = socket.split();
    debug!(instance = instance.id, admin = state.admin, "WebSocket connected");

    let forward = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&outbound.payload) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(instance = instance.id, %err, "WebSocket error");
                break;
            }
        };
        match frame {
            Message::Text(text) => ingest(&state, &instance, &text),
            Message::Binary(data) => {
                // Some clients send JSON in binary frames.
                if let Ok(text) = String::from_utf8(data) {
                    ingest(&state, &instance, &text);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    instance.mark_gone();
    state.gateway.transport_gone(&instance).await;
    forward.abort();
    debug!(instance = instance.id, "WebSocket disconnected");
}

fn ingest(state: &WsState, instance: &Arc<TransportSession>, text: &str) {
    match serde_json::from_str::<Value>(text) {
        Ok(message) if message.is_object() => {
            state.gateway.incoming_request(
                state.transport.clone(),
                instance.clone(),
                None,
                state.admin,
                message,
            );
        }
        _ => {
            // Malformed frames never reach the dispatcher; answer directly.
            let err = ApiError::from_code(code::INVALID_JSON);
            instance.send(OutboundMessage {
                request_id: None,
                admin: state.admin,
                payload: protocol::error_message(0, None, &err),
            });
        }
    }
}
