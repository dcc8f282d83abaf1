//! Bulk sender server.
//!
//! This binary:
//! - Connects to the WhatsApp bridge and follows its session lifecycle
//! - Serves the contact, campaign and channel control API
//! - Streams progress and lifecycle events to observers over SSE
//!
//! On shutdown a running campaign is stopped and its in-flight send is
//! allowed to finish.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal, sync::mpsc};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bulksend::channel::{spawn_event_listener, spawn_session_monitor};
use bulksend::web::router;
use bulksend::{AppState, BridgeChannel, Config, MessagingChannel, Session};

/// Lifecycle events buffered between the bridge listener and the monitor
const CHANNEL_EVENT_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("server_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        country_code = %config.country_code,
        bridge_url = %config.bridge_url,
        default_delay_ms = config.default_delay_ms,
        auth_configured = config.auth_signing_key.is_some(),
        "config_loaded"
    );

    let bridge = Arc::new(BridgeChannel::new(
        config.bridge_url.clone(),
        Duration::from_millis(config.bridge_timeout_ms),
    ));
    let channel: Arc<dyn MessagingChannel> = bridge.clone();
    let session = Session::new();

    let state = AppState::new(config.clone(), Arc::clone(&channel), session.clone());

    // Bridge lifecycle → session state + observers
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_EVENT_BUFFER);
    let listener_task = spawn_event_listener(bridge.base_url().to_string(), event_tx);
    let monitor_task =
        spawn_session_monitor(channel, session, state.broadcaster.clone(), event_rx);

    let engine = state.engine.clone();
    let app = router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "server_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if engine.stop() {
        info!("campaign_stopped_for_shutdown");
    }
    engine.wait_idle().await;

    listener_task.abort();
    monitor_task.abort();

    info!("server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("server_shutting_down");
}
