//! # tailcast-server — Transports for the tailcast engine
//!
//! Two interchangeable delivery transports over one shared [`Engine`]:
//!
//! ```text
//!                  ┌──────────────┐
//!  ws clients ───► │  WsServer    │ ──┐
//!                  └──────────────┘   │    ┌────────────┐
//!                                     ├──► │   Engine   │ ◄── <log_dir>/*.log
//!                  ┌──────────────┐   │    └────────────┘
//!  http clients ─► │  sse::router │ ──┘
//!                  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON websocket control protocol
//! - [`ws`] — Websocket push transport
//! - [`sse`] — Server-Sent Events pull transport and health probe
//! - [`config`] — Server configuration and CLI
//! - [`error`] — Server error type

pub mod protocol;
pub mod ws;
pub mod sse;
pub mod config;
pub mod error;

use std::sync::Arc;

use tailcast_core::Engine;
use tokio::net::TcpListener;

// Re-exports for convenience
pub use config::{Cli, ServerConfig};
pub use error::ServerError;
pub use protocol::{ClientMessage, ServerMessage, StreamStatus};
pub use ws::{WsServer, WsStats};

/// Run both transports until Ctrl-C, then stop every tailer.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let engine = Arc::new(Engine::new(config.engine.clone()));
    engine.directory().create().await?;
    log::info!("Streaming logs from {}", engine.directory().root().display());

    let ws = WsServer::new(engine.clone(), config.outgoing_capacity);
    let ws_listener = TcpListener::bind(&config.ws_addr).await?;
    log::info!("Websocket server listening on {}", ws_listener.local_addr()?);

    let http_listener = TcpListener::bind(&config.http_addr).await?;
    log::info!("HTTP server listening on {}", http_listener.local_addr()?);
    let app = sse::router(engine.clone());

    if let Some(interval) = config.idle_eviction {
        log::info!("Evicting idle tailers every {interval:?}");
        tokio::spawn(evict_idle_loop(engine.clone(), interval));
    }

    let result = tokio::select! {
        result = ws.serve(ws_listener) => result,
        result = async { axum::serve(http_listener, app).await } => result.map_err(ServerError::from),
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutdown requested");
            Ok(())
        }
    };

    engine.shutdown().await;
    result
}

async fn evict_idle_loop(engine: Arc<Engine>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let evicted = engine.evict_idle().await;
        if !evicted.is_empty() {
            log::debug!("Idle eviction stopped {} tailers", evicted.len());
        }
    }
}
