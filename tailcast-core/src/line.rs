//! Log record model.
//!
//! Record format on disk (one per line, `\n` terminated):
//! ```text
//! 2024-05-01T12:00:00.123456: message text
//! └──────── timestamp ──────┘  └─ message ─┘
//!                           ": " separator (first occurrence)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Separator between timestamp and message in a record.
pub const RECORD_SEPARATOR: &str = ": ";

const MAX_DEPLOYMENT_ID_LEN: usize = 128;

/// Rejected deployment identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid deployment id: {0:?}")]
pub struct InvalidDeploymentId(pub String);

/// Opaque deployment identifier.
///
/// Restricted to ASCII alphanumerics, `-` and `_` because it names a file
/// inside the log directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Validate `raw` as a deployment id.
    pub fn parse(raw: &str) -> Result<Self, InvalidDeploymentId> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_DEPLOYMENT_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(InvalidDeploymentId(raw.to_string()))
        }
    }

    /// Fresh id for a new deployment (hyphenless UUIDv4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// The id, which is also the log file's stem.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeploymentId {
    type Err = InvalidDeploymentId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeploymentId {
    type Error = InvalidDeploymentId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeploymentId> for String {
    fn from(id: DeploymentId) -> Self {
        id.0
    }
}

/// A parsed log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: String,
    pub message: String,
    /// Original record text, trimmed, without the line terminator.
    pub raw: String,
}

impl LogLine {
    /// Parse a `"<timestamp>: <message>"` record.
    ///
    /// Returns `None` for malformed records (no separator after trimming).
    pub fn parse(record: &str) -> Option<Self> {
        let raw = record.trim();
        let (timestamp, message) = raw.split_once(RECORD_SEPARATOR)?;
        Some(Self {
            timestamp: timestamp.to_string(),
            message: message.to_string(),
            raw: raw.to_string(),
        })
    }

    /// Parse raw record bytes, decoding invalid UTF-8 lossily.
    pub fn parse_bytes(record: &[u8]) -> Option<Self> {
        Self::parse(&String::from_utf8_lossy(record))
    }
}

/// A line read by a tailer, tagged with the offset just past its newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailedLine {
    pub line: LogLine,
    pub end_offset: u64,
}

/// Record shape handed to transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredLine {
    pub timestamp: String,
    pub message: String,
    pub raw_line: String,
    pub is_historical: bool,
}

impl DeliveredLine {
    pub fn historical(line: LogLine) -> Self {
        Self::from_line(line, true)
    }

    pub fn live(line: &LogLine) -> Self {
        Self::from_line(line.clone(), false)
    }

    fn from_line(line: LogLine, is_historical: bool) -> Self {
        Self {
            timestamp: line.timestamp,
            message: line.message,
            raw_line: line.raw,
            is_historical,
        }
    }
}
