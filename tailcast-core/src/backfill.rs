//! Bounded history for newly joining subscribers.
//!
//! Reads the whole source and keeps the last `max_lines` parsed records. The
//! returned `end_offset` is the offset just past the last complete record, so
//! a tailer started there neither repeats a backfilled line nor skips one.

use std::collections::VecDeque;
use std::io::ErrorKind;

use thiserror::Error;

use crate::line::{DeploymentId, LogLine};
use crate::source::LogDirectory;

/// Default number of historical lines sent to a new subscriber.
pub const DEFAULT_BACKFILL_LINES: usize = 50;

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("failed to read backfill for deployment {deployment}: {source}")]
    Io {
        deployment: DeploymentId,
        #[source]
        source: std::io::Error,
    },
}

/// Trailing records already on disk, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backfill {
    pub lines: Vec<LogLine>,
    pub end_offset: u64,
}

#[derive(Debug, Clone)]
pub struct BackfillReader {
    directory: LogDirectory,
}

impl BackfillReader {
    pub fn new(directory: LogDirectory) -> Self {
        Self { directory }
    }

    /// Last `max_lines` valid records of `deployment` plus the handoff offset.
    ///
    /// A deployment without a log file yet yields an empty backfill at offset 0.
    pub async fn read_tail(
        &self,
        deployment: &DeploymentId,
        max_lines: usize,
    ) -> Result<Backfill, BackfillError> {
        let path = self.directory.path_for(deployment);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("No log source yet for deployment {deployment}");
                return Ok(Backfill::default());
            }
            Err(source) => {
                return Err(BackfillError::Io {
                    deployment: deployment.clone(),
                    source,
                })
            }
        };

        let backfill = tail_records(&bytes, max_lines);
        log::debug!(
            "Backfill for deployment {deployment}: {} lines ending at offset {}",
            backfill.lines.len(),
            backfill.end_offset
        );
        Ok(backfill)
    }
}

/// Keep the last `max_lines` parsed records among the newline-terminated ones.
///
/// A trailing record without its newline is excluded and not counted in
/// `end_offset`.
pub fn tail_records(bytes: &[u8], max_lines: usize) -> Backfill {
    let complete = match bytes.iter().rposition(|b| *b == b'\n') {
        Some(last_newline) => &bytes[..=last_newline],
        None => &[][..],
    };
    let end_offset = complete.len() as u64;

    if max_lines == 0 {
        return Backfill {
            lines: Vec::new(),
            end_offset,
        };
    }

    let mut window = VecDeque::with_capacity(max_lines.min(1024));
    for record in complete.split(|b| *b == b'\n') {
        let Some(line) = LogLine::parse_bytes(record) else {
            continue;
        };
        if window.len() == max_lines {
            window.pop_front();
        }
        window.push_back(line);
    }

    Backfill {
        lines: window.into(),
        end_offset,
    }
}
