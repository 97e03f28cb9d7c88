//! JSON control protocol for the websocket transport.
//!
//! Every frame is a text frame holding one object tagged by `type`:
//! ```text
//! client → server   {"type":"start_streaming","deployment_id":"…"}
//!                   {"type":"stop_streaming","deployment_id":"…"}
//!                   {"type":"ping"}
//!
//! server → client   {"type":"status","status":"connected","client_id":"…","message":"…"}
//!                   {"type":"new_log","timestamp":"…","message":"…","raw_line":"…","is_historical":true}
//!                   {"type":"status","status":"streaming_started","deployment_id":"…","message":"…"}
//!                   {"type":"status","status":"streaming_stopped","deployment_id":"…","message":"…"}
//!                   {"type":"pong","timestamp":"…"}
//!                   {"type":"error","message":"…"}
//! ```

use serde::{Deserialize, Serialize};
use tailcast_core::{DeliveredLine, DeploymentId};
use uuid::Uuid;

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartStreaming { deployment_id: String },
    StopStreaming { deployment_id: String },
    Ping,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Connected,
    StreamingStarted,
    StreamingStopped,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        status: StreamStatus,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deployment_id: Option<String>,
    },
    NewLog(DeliveredLine),
    Pong {
        timestamp: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn connected(client_id: Uuid) -> Self {
        Self::Status {
            status: StreamStatus::Connected,
            message: "Connected to log streaming server".to_string(),
            client_id: Some(client_id),
            deployment_id: None,
        }
    }

    pub fn streaming_started(deployment: &DeploymentId) -> Self {
        Self::Status {
            status: StreamStatus::StreamingStarted,
            message: format!("Started streaming logs for {deployment}"),
            client_id: None,
            deployment_id: Some(deployment.to_string()),
        }
    }

    pub fn streaming_stopped(deployment: &DeploymentId) -> Self {
        Self::Status {
            status: StreamStatus::StreamingStopped,
            message: format!("Stopped streaming logs for {deployment}"),
            client_id: None,
            deployment_id: Some(deployment.to_string()),
        }
    }

    /// Pong stamped with the current time (RFC 3339).
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
