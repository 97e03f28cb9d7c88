//! Engine facade: owns the hub and registry and implements subscribe.
//!
//! ```text
//! subscribe(D, S)
//!   1. hub.join(D, S)            channel is live from here on
//!   2. backfill.read_tail(D, N)  lines + end_offset E
//!   3. channel.push_backfill     historical first; live lines ending <= E skipped
//!   4. registry.ensure_tailer(D, E)
//! ```
//!
//! Joining before reading means no line appended after the backfill can be
//! missed, and the offset filter means none read by the backfill is repeated.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::backfill::{BackfillError, BackfillReader, DEFAULT_BACKFILL_LINES};
use crate::channel::DeliveryChannel;
use crate::hub::{BroadcastHub, DEFAULT_CHANNEL_CAPACITY};
use crate::line::{DeploymentId, InvalidDeploymentId};
use crate::registry::{FileTailerFactory, TailerFactory, TailerRegistry};
use crate::source::LogDirectory;
use crate::tailer::TailerConfig;

/// A subscriber's view of one deployment: backfill, then live lines.
pub type Subscription = DeliveryChannel;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Backfill(#[from] BackfillError),

    #[error(transparent)]
    InvalidDeploymentId(#[from] InvalidDeploymentId),

    #[error("failed to list log directory {path}: {source}")]
    ListDeployments {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding one `<deployment_id>.log` per deployment.
    pub log_dir: PathBuf,
    /// Historical lines sent to a new subscriber.
    pub backfill_lines: usize,
    /// Lines a subscriber may fall behind before the oldest are dropped.
    pub channel_capacity: usize,
    pub tailer: TailerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            backfill_lines: DEFAULT_BACKFILL_LINES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            tailer: TailerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Short polling intervals over `log_dir`.
    pub fn for_testing(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            tailer: TailerConfig::for_testing(),
            ..Self::default()
        }
    }
}

/// Log streaming engine: one hub, one tailer registry, one log directory.
///
/// Shared by every transport, usually behind an `Arc`.
pub struct Engine {
    config: EngineConfig,
    directory: LogDirectory,
    backfill: BackfillReader,
    hub: Arc<BroadcastHub>,
    registry: TailerRegistry,
}

impl Engine {
    /// Engine whose tailers follow files in `config.log_dir`.
    pub fn new(config: EngineConfig) -> Self {
        let hub = Arc::new(BroadcastHub::new(config.channel_capacity));
        let factory = Arc::new(FileTailerFactory::new(
            LogDirectory::new(&config.log_dir),
            config.tailer.clone(),
            hub.clone(),
        ));
        Self::build(config, hub, factory)
    }

    /// Engine with a custom tailer factory, e.g. one whose tailers never
    /// touch the filesystem.
    pub fn with_factory(config: EngineConfig, factory: Arc<dyn TailerFactory>) -> Self {
        let hub = Arc::new(BroadcastHub::new(config.channel_capacity));
        Self::build(config, hub, factory)
    }

    fn build(config: EngineConfig, hub: Arc<BroadcastHub>, factory: Arc<dyn TailerFactory>) -> Self {
        let directory = LogDirectory::new(&config.log_dir);
        Self {
            backfill: BackfillReader::new(directory.clone()),
            registry: TailerRegistry::new(factory, hub.clone()),
            directory,
            hub,
            config,
        }
    }

    /// Subscribe `subscriber` to `deployment`.
    ///
    /// The returned channel yields up to `backfill_lines` historical lines,
    /// then every line appended afterwards, with no gap and no repeat.
    /// Starts the deployment's tailer if none is running. Dropping the
    /// channel, or this future before it completes, unsubscribes.
    pub async fn subscribe(
        &self,
        deployment: &DeploymentId,
        subscriber: Uuid,
    ) -> Result<Subscription, EngineError> {
        let mut channel = self.hub.join(deployment, subscriber).await;

        let backfill = match self
            .backfill
            .read_tail(deployment, self.config.backfill_lines)
            .await
        {
            Ok(backfill) => backfill,
            Err(e) => {
                self.hub.leave(deployment, subscriber).await;
                return Err(e.into());
            }
        };
        let end_offset = backfill.end_offset;
        log::debug!(
            "Subscriber {subscriber} of deployment {deployment}: {} backfill lines, live from offset {end_offset}",
            backfill.lines.len()
        );
        channel.push_backfill(backfill);

        self.registry.ensure_tailer(deployment, end_offset).await;
        Ok(channel)
    }

    /// [`Engine::subscribe`] with an unvalidated deployment id.
    pub async fn subscribe_str(
        &self,
        deployment: &str,
        subscriber: Uuid,
    ) -> Result<Subscription, EngineError> {
        let deployment = DeploymentId::parse(deployment)?;
        self.subscribe(&deployment, subscriber).await
    }

    /// Remove a subscription. The deployment's tailer keeps running.
    pub async fn unsubscribe(&self, deployment: &DeploymentId, subscriber: Uuid) -> bool {
        self.hub.leave(deployment, subscriber).await
    }

    /// Start tailing `deployment` from its current end without a subscriber.
    pub async fn prewarm(&self, deployment: &DeploymentId) -> Result<bool, EngineError> {
        let backfill = self.backfill.read_tail(deployment, 0).await?;
        Ok(self
            .registry
            .ensure_tailer(deployment, backfill.end_offset)
            .await)
    }

    /// Start a tailer at `start_offset` unless one is running. See
    /// [`TailerRegistry::ensure_tailer`].
    pub async fn ensure_tailer(&self, deployment: &DeploymentId, start_offset: u64) -> bool {
        self.registry.ensure_tailer(deployment, start_offset).await
    }

    /// Stop `deployment`'s tailer. Its subscribers stay registered but
    /// receive nothing until a new tailer starts.
    pub async fn teardown(&self, deployment: &DeploymentId) -> bool {
        self.registry.teardown(deployment).await
    }

    /// Tear down tailers of deployments nobody is watching.
    pub async fn evict_idle(&self) -> Vec<DeploymentId> {
        self.registry.evict_idle().await
    }

    /// Deployments that have a log file.
    pub async fn deployments(&self) -> Result<Vec<DeploymentId>, EngineError> {
        self.directory
            .deployments()
            .await
            .map_err(|source| EngineError::ListDeployments {
                path: self.directory.root().to_path_buf(),
                source,
            })
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn registry(&self) -> &TailerRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &LogDirectory {
        &self.directory
    }
}
