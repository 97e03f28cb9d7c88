//! Server configuration and its command-line form.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tailcast_core::{
    EngineConfig, TailerConfig, DEFAULT_BACKFILL_LINES, DEFAULT_CHANNEL_CAPACITY,
    MAX_CHANNEL_CAPACITY,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Websocket transport bind address
    pub ws_addr: String,
    /// HTTP (Server-Sent Events) transport bind address
    pub http_addr: String,
    /// Tear down tailers nobody watches at this interval (None = never)
    pub idle_eviction: Option<Duration>,
    /// Messages queued per websocket connection before it is considered stuck
    pub outgoing_capacity: usize,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_addr: "127.0.0.1:6758".to_string(),
            http_addr: "127.0.0.1:5000".to_string(),
            idle_eviction: None,
            outgoing_capacity: 256,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral ports and short polling over `log_dir`.
    pub fn for_testing(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            ws_addr: "127.0.0.1:0".to_string(),
            http_addr: "127.0.0.1:0".to_string(),
            engine: EngineConfig::for_testing(log_dir),
            ..Self::default()
        }
    }
}

/// tailcast - stream deployment logs over websocket and Server-Sent Events
#[derive(Parser, Debug)]
#[command(name = "tailcast")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory holding one <deployment_id>.log file per deployment
    #[arg(long, env = "TAILCAST_LOG_DIR", default_value = "./logs")]
    pub log_dir: PathBuf,

    /// Websocket bind address
    #[arg(long, env = "TAILCAST_WS_ADDR", default_value = "127.0.0.1:6758")]
    pub ws_addr: String,

    /// HTTP bind address for Server-Sent Events
    #[arg(long, env = "TAILCAST_HTTP_ADDR", default_value = "127.0.0.1:5000")]
    pub http_addr: String,

    /// Historical lines sent to each new subscriber
    #[arg(long, env = "TAILCAST_BACKFILL_LINES", default_value_t = DEFAULT_BACKFILL_LINES)]
    pub backfill_lines: usize,

    /// Lines a subscriber may fall behind before the oldest are dropped
    #[arg(long, env = "TAILCAST_CHANNEL_CAPACITY", default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    pub channel_capacity: usize,

    /// Tailer polling interval at end of file, in milliseconds
    #[arg(long, env = "TAILCAST_POLL_INTERVAL_MS", default_value_t = 100)]
    pub poll_interval_ms: u64,

    /// Upper bound for the wait-for-file backoff, in milliseconds
    #[arg(long, env = "TAILCAST_MAX_WAIT_BACKOFF_MS", default_value_t = 1000)]
    pub max_wait_backoff_ms: u64,

    /// Evict tailers of unwatched deployments every N seconds (off when unset)
    #[arg(long, env = "TAILCAST_IDLE_EVICTION_SECS")]
    pub idle_eviction_secs: Option<u64>,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Resolve flags into a server configuration, clamping values the
    /// runtime cannot honour.
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            ws_addr: self.ws_addr,
            http_addr: self.http_addr,
            idle_eviction: self
                .idle_eviction_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            engine: EngineConfig {
                log_dir: self.log_dir,
                backfill_lines: self.backfill_lines,
                channel_capacity: self.channel_capacity.clamp(1, MAX_CHANNEL_CAPACITY),
                tailer: TailerConfig {
                    poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
                    max_wait_backoff: Duration::from_millis(self.max_wait_backoff_ms.max(1)),
                },
            },
            ..ServerConfig::default()
        }
    }
}
