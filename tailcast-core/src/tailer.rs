//! Follows one deployment's log source from a byte offset.
//!
//! ```text
//!   wait for file (bounded backoff) ──► open + seek(file_offset)
//!                                            │
//!                      ┌─────────────────────▼──┐
//!                      │ read_until('\n')       │◄── sleep(poll_interval) at EOF
//!                      └─────────────────────┬──┘
//!                             complete record?
//!                    no: keep bytes buffered │ yes
//!                    offset unchanged        ▼
//!                               parse ─► publish ─► commit offset
//! ```
//!
//! The committed `file_offset` always sits on a record boundary and means
//! "fully delivered through here". Malformed records are skipped but still
//! committed so they are never retried.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::Stream;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

use crate::hub::BroadcastHub;
use crate::line::{DeploymentId, LogLine, TailedLine};

/// Tailer polling configuration.
#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// Sleep between reads at end-of-file. Also the first wait-for-creation delay.
    pub poll_interval: Duration,
    /// Upper bound for the wait-for-creation backoff.
    pub max_wait_backoff: Duration,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_wait_backoff: Duration::from_secs(1),
        }
    }
}

impl TailerConfig {
    /// Short intervals for tests.
    pub fn for_testing() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            max_wait_backoff: Duration::from_millis(40),
        }
    }

    /// Wait-for-creation delay after `current`: doubled, capped at
    /// `max_wait_backoff`.
    fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_wait_backoff)
    }
}

/// Fatal tailer errors. Waiting for a file that does not exist yet is not one.
#[derive(Debug, Error)]
pub enum TailError {
    #[error("log source for deployment {deployment} was removed")]
    SourceRemoved { deployment: DeploymentId },

    #[error("failed to read log source for deployment {deployment}: {source}")]
    Io {
        deployment: DeploymentId,
        #[source]
        source: std::io::Error,
    },
}

/// Position of a tailer in its source. Owned by exactly one [`Tailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailerState {
    deployment_id: DeploymentId,
    file_offset: u64,
}

impl TailerState {
    pub fn deployment_id(&self) -> &DeploymentId {
        &self.deployment_id
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }
}

/// A complete record read from the source but not yet committed.
#[derive(Debug)]
struct Record {
    line: Option<LogLine>,
    end_offset: u64,
}

/// Offset-tracked follower of one deployment's log file.
///
/// Publishes through [`Tailer::run`] or yields through [`Tailer::into_stream`];
/// either way it is consumed and cannot be restarted.
pub struct Tailer {
    state: TailerState,
    path: PathBuf,
    config: TailerConfig,
    reader: Option<BufReader<File>>,
    /// Bytes of a record whose newline has not been written yet.
    partial: Vec<u8>,
    /// Offset of the first byte in `partial`.
    record_start: u64,
}

impl Tailer {
    /// Tailer for `path` that resumes at `start_offset`, which must sit on
    /// a record boundary.
    pub fn new(
        deployment_id: DeploymentId,
        path: impl Into<PathBuf>,
        start_offset: u64,
        config: TailerConfig,
    ) -> Self {
        Self {
            state: TailerState {
                deployment_id,
                file_offset: start_offset,
            },
            path: path.into(),
            config,
            reader: None,
            partial: Vec::new(),
            record_start: start_offset,
        }
    }

    /// Committed position in the source.
    pub fn state(&self) -> &TailerState {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Follow the source forever, publishing every parsed line to `hub`.
    ///
    /// Returns only on a fatal error; cancellation is done by dropping the
    /// future.
    pub async fn run(mut self, hub: &BroadcastHub) -> Result<(), TailError> {
        log::info!(
            "Tailing {} for deployment {} from offset {}",
            self.path.display(),
            self.state.deployment_id,
            self.state.file_offset
        );

        loop {
            let Record { line, end_offset } = self.next_record().await?;
            match line {
                Some(line) => {
                    hub.publish(&self.state.deployment_id, TailedLine { line, end_offset })
                        .await;
                }
                None => {
                    log::debug!(
                        "Skipping malformed record in deployment {} ending at offset {end_offset}",
                        self.state.deployment_id
                    );
                }
            }
            self.state.file_offset = end_offset;
        }
    }

    /// The tailer as a lazy, unbounded, non-restartable sequence of lines.
    ///
    /// A record is committed once it has been yielded (or skipped as
    /// malformed). The stream ends after yielding its first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<LogLine, TailError>> {
        futures_util::stream::unfold(Some(self), |tailer| async move {
            let Some(mut tailer) = tailer else {
                return None;
            };
            loop {
                match tailer.next_record().await {
                    Ok(Record {
                        line: Some(line),
                        end_offset,
                    }) => {
                        tailer.state.file_offset = end_offset;
                        return Some((Ok(line), Some(tailer)));
                    }
                    Ok(Record {
                        line: None,
                        end_offset,
                    }) => {
                        tailer.state.file_offset = end_offset;
                    }
                    Err(e) => return Some((Err(e), None)),
                }
            }
        })
    }

    /// Read the next complete record, suspending at end-of-file.
    async fn next_record(&mut self) -> Result<Record, TailError> {
        loop {
            if self.reader.is_none() {
                let reader = self.open().await?;
                self.reader = Some(reader);
            }
            let Some(reader) = self.reader.as_mut() else {
                continue;
            };

            let read = reader.read_until(b'\n', &mut self.partial).await;
            match read {
                Err(e) => return Err(self.io_error(e)),
                Ok(0) => {
                    self.check_source().await?;
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Ok(_) if self.partial.last() == Some(&b'\n') => {
                    let end_offset = self.record_start + self.partial.len() as u64;
                    let line = LogLine::parse_bytes(&self.partial);
                    self.partial.clear();
                    self.record_start = end_offset;
                    return Ok(Record { line, end_offset });
                }
                // Partial record at EOF: keep it buffered until its newline arrives.
                Ok(_) => {}
            }
        }
    }

    /// Open the source at the committed offset, waiting for it to exist.
    async fn open(&mut self) -> Result<BufReader<File>, TailError> {
        let mut backoff = self.config.poll_interval;
        loop {
            match File::open(&self.path).await {
                Ok(mut file) => {
                    let len = file.metadata().await.map_err(|e| self.io_error(e))?.len();
                    if len < self.state.file_offset {
                        log::warn!(
                            "Log source {} is shorter than offset {}; restarting from 0",
                            self.path.display(),
                            self.state.file_offset
                        );
                        self.state.file_offset = 0;
                    }
                    file.seek(SeekFrom::Start(self.state.file_offset))
                        .await
                        .map_err(|e| self.io_error(e))?;
                    self.record_start = self.state.file_offset;
                    self.partial.clear();
                    log::debug!(
                        "Opened {} at offset {}",
                        self.path.display(),
                        self.state.file_offset
                    );
                    return Ok(BufReader::new(file));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    log::trace!(
                        "Waiting {backoff:?} for {} to appear",
                        self.path.display()
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = self.config.next_backoff(backoff);
                }
                Err(e) => return Err(self.io_error(e)),
            }
        }
    }

    /// At end-of-file: detect removal (fatal) and in-place truncation (restart).
    async fn check_source(&mut self) -> Result<(), TailError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.len() < self.record_start + self.partial.len() as u64 => {
                log::warn!(
                    "Log source {} truncated to {} bytes; restarting from 0",
                    self.path.display(),
                    meta.len()
                );
                self.state.file_offset = 0;
                self.reader = None;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(TailError::SourceRemoved {
                deployment: self.state.deployment_id.clone(),
            }),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> TailError {
        TailError::Io {
            deployment: self.state.deployment_id.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::io::Write;
    use tokio::time::timeout;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    fn deployment() -> DeploymentId {
        DeploymentId::parse("tailer-test").unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = TailerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.max_wait_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = TailerConfig::default();
        assert_eq!(
            config.next_backoff(Duration::from_millis(100)),
            Duration::from_millis(200)
        );
        assert_eq!(config.next_backoff(Duration::from_millis(800)), Duration::from_secs(1));

        let huge = TailerConfig {
            poll_interval: Duration::MAX,
            max_wait_backoff: Duration::MAX,
        };
        assert_eq!(huge.next_backoff(Duration::MAX), Duration::MAX);
    }

    #[tokio::test]
    async fn test_reads_from_start_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.log");
        append(&path, "t1: old\n");
        let start = std::fs::metadata(&path).unwrap().len();
        append(&path, "t2: new\n");

        let tailer = Tailer::new(deployment(), &path, start, TailerConfig::for_testing());
        let mut lines = Box::pin(tailer.into_stream());

        let line = timeout(Duration::from_secs(2), lines.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line.message, "new");
    }

    #[tokio::test]
    async fn test_waits_for_file_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.log");

        let tailer = Tailer::new(deployment(), &path, 0, TailerConfig::for_testing());
        let mut lines = Box::pin(tailer.into_stream());

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            append(&writer_path, "t: created later\n");
        });

        let line = timeout(Duration::from_secs(2), lines.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line.message, "created later");
    }

    #[tokio::test]
    async fn test_partial_record_not_consumed_until_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.log");
        append(&path, "t: first half");

        let mut tailer = Tailer::new(deployment(), &path, 0, TailerConfig::for_testing());

        // No newline yet: nothing comes out and the offset stays put.
        let pending = timeout(Duration::from_millis(100), tailer.next_record()).await;
        assert!(pending.is_err());
        assert_eq!(tailer.state().file_offset(), 0);

        append(&path, " and second half\n");
        let record = timeout(Duration::from_secs(2), tailer.next_record())
            .await
            .unwrap()
            .unwrap();
        let line = record.line.unwrap();
        assert_eq!(line.message, "first half and second half");
        assert_eq!(record.end_offset, std::fs::metadata(&path).unwrap().len());
    }

    #[tokio::test]
    async fn test_malformed_record_skipped_and_offset_advances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.log");
        append(&path, "t1: one\nnot-a-valid-record\nt3: three\n");

        let tailer = Tailer::new(deployment(), &path, 0, TailerConfig::for_testing());
        let mut lines = Box::pin(tailer.into_stream());

        let first = lines.next().await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(2), lines.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!((first.timestamp.as_str(), first.message.as_str()), ("t1", "one"));
        assert_eq!(
            (second.timestamp.as_str(), second.message.as_str()),
            ("t3", "three")
        );
    }

    #[tokio::test]
    async fn test_offset_tracks_committed_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.log");
        append(&path, "t1: one\ngarbage\n");

        let mut tailer = Tailer::new(deployment(), &path, 0, TailerConfig::for_testing());
        let first = tailer.next_record().await.unwrap();
        assert_eq!(first.end_offset, 8);
        // Reading does not commit.
        assert_eq!(tailer.state().file_offset(), 0);

        let second = tailer.next_record().await.unwrap();
        assert!(second.line.is_none());
        assert_eq!(second.end_offset, 16);
    }

    #[tokio::test]
    async fn test_source_removed_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.log");
        append(&path, "t: only\n");

        let tailer = Tailer::new(deployment(), &path, 0, TailerConfig::for_testing());
        let mut lines = Box::pin(tailer.into_stream());
        assert!(lines.next().await.unwrap().is_ok());

        std::fs::remove_file(&path).unwrap();
        let result = timeout(Duration::from_secs(2), lines.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TailError::SourceRemoved { .. })));

        // Non-restartable: the stream is over.
        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.log");
        append(&path, "t1: a fairly long first record\n");

        let tailer = Tailer::new(deployment(), &path, 0, TailerConfig::for_testing());
        let mut lines = Box::pin(tailer.into_stream());
        assert_eq!(
            lines.next().await.unwrap().unwrap().message,
            "a fairly long first record"
        );

        std::fs::write(&path, "t2: short\n").unwrap();
        let line = timeout(Duration::from_secs(2), lines.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line.message, "short");
    }
}
