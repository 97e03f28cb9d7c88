//! Server-Sent Events pull transport.
//!
//! Routes:
//! - `GET /logs/:deployment_id` — one `data:` event per delivered line
//! - `GET /deployments` — deployments with a log file
//! - `GET /health` — liveness probe

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::Stream;
use serde::Serialize;
use uuid::Uuid;

use tailcast_core::{DeliveryChannel, DeploymentId, Engine};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// HTTP routes over a shared engine.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/logs/:deployment_id", get(stream_logs))
        .route("/deployments", get(list_deployments))
        .route("/health", get(health_handler))
        .with_state(engine)
}

async fn stream_logs(
    State(engine): State<Arc<Engine>>,
    Path(raw): Path<String>,
) -> Response {
    let deployment = match DeploymentId::parse(&raw) {
        Ok(deployment) => deployment,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let subscriber = Uuid::new_v4();
    // Dropping the channel (client went away) unsubscribes.
    let channel = match engine.subscribe(&deployment, subscriber).await {
        Ok(channel) => channel,
        Err(e) => {
            log::error!("SSE subscribe to {deployment} failed: {e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };
    log::info!("SSE subscriber {subscriber} streaming deployment {deployment}");

    let sse = Sse::new(delivery_events(channel)).keep_alive(KeepAlive::default());
    ([(header::CACHE_CONTROL, "no-cache")], sse).into_response()
}

async fn list_deployments(State(engine): State<Arc<Engine>>) -> Response {
    match engine.deployments().await {
        Ok(deployments) => (StatusCode::OK, Json(deployments)).into_response(),
        Err(e) => {
            log::error!("Listing deployments failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    (StatusCode::OK, Json(response))
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

fn delivery_events(channel: DeliveryChannel) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold(channel, |mut channel| async move {
        loop {
            let line = channel.recv().await?;
            match Event::default().json_data(&line) {
                Ok(event) => return Some((Ok(event), channel)),
                Err(e) => log::error!("Failed to encode line for {}: {e}", channel.deployment_id()),
            }
        }
    })
}
