use clap::Parser;
use tracing::{error, info};

use boardwalk::cli::Cli;
use boardwalk::config::{Config, LogControl};
use boardwalk::echo::EchoPlugin;
use boardwalk::gateway::Gateway;
use boardwalk::websocket::{self, WsTransport};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = cli.apply(Config::from_env());
    let log_control = LogControl::init(config.log_level);

    info!(
        "Starting {} {} ({})",
        boardwalk::SERVER_NAME,
        boardwalk::VERSION_STRING,
        config.server_name
    );
    info!("Session timeout: {} seconds", config.session_timeout);
    if config.api_secret.is_some() {
        info!("Client API secret configured");
    }
    if config.token_auth {
        info!("Token-based authentication enabled");
    }

    let gateway = Gateway::with_log_control(config.clone(), Some(log_control));

    if let Err(err) = gateway.register_plugin(EchoPlugin::new()) {
        error!("Failed to register echo plugin: {err}");
        std::process::exit(1);
    }

    let transport = WsTransport::new();
    gateway.register_transport(transport.clone());
    if !gateway.has_janus_api_transport() {
        error!("No transport speaks the client API, giving up");
        std::process::exit(1);
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };

    gateway.start();

    {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(err) = websocket::serve(gateway, transport, listener).await {
                error!("WebSocket transport failed: {err}");
                std::process::exit(1);
            }
        });
    }

    // First signal starts the graceful shutdown, the third one forces it.
    wait_for_signal().await;
    println!("Stopping gateway, please wait...");
    tokio::spawn(async move {
        wait_for_signal().await;
        println!("In a hurry? Still freeing resources cleanly here!");
        wait_for_signal().await;
        println!("Ok, leaving immediately...");
        std::process::exit(1);
    });
    gateway.shutdown().await;
    info!("Bye!");
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
