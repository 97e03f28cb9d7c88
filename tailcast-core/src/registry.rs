//! Registry of running tailers: at most one per deployment.
//!
//! ```text
//! slots: RwLock<HashMap<DeploymentId, Arc<Slot>>>   (lookup / insert only)
//!          │
//!          └─► Slot
//!                ├─ gate: async Mutex      serializes ensure / teardown / evict per key
//!                └─ running: Option<RunningTailer { generation, cancel, join }>
//!
//! ensure_tailer ──► spawn(supervise(factory.create(..)))
//!                         ├─ cancelled  ──► stop quietly
//!                         └─ task ended ──► report to hub, clear own slot
//! ```
//!
//! A slot is removed from the map once its tailer has stopped and no caller
//! holds it, so the map only tracks deployments that are running or busy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::future::BoxFuture;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::hub::BroadcastHub;
use crate::line::DeploymentId;
use crate::source::LogDirectory;
use crate::tailer::{TailError, Tailer, TailerConfig};

/// Builds the future that runs one tailer until it fails.
pub trait TailerFactory: Send + Sync {
    fn create(
        &self,
        deployment: &DeploymentId,
        start_offset: u64,
    ) -> BoxFuture<'static, Result<(), TailError>>;
}

/// Follows `<deployment>.log` files in a log directory and publishes to a hub.
pub struct FileTailerFactory {
    directory: LogDirectory,
    config: TailerConfig,
    hub: Arc<BroadcastHub>,
}

impl FileTailerFactory {
    pub fn new(directory: LogDirectory, config: TailerConfig, hub: Arc<BroadcastHub>) -> Self {
        Self {
            directory,
            config,
            hub,
        }
    }
}

impl TailerFactory for FileTailerFactory {
    fn create(
        &self,
        deployment: &DeploymentId,
        start_offset: u64,
    ) -> BoxFuture<'static, Result<(), TailError>> {
        let tailer = Tailer::new(
            deployment.clone(),
            self.directory.path_for(deployment),
            start_offset,
            self.config.clone(),
        );
        let hub = self.hub.clone();
        Box::pin(async move { tailer.run(&hub).await })
    }
}

struct RunningTailer {
    generation: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    gate: tokio::sync::Mutex<()>,
    /// Never held across an await.
    running: Mutex<Option<RunningTailer>>,
}

impl Slot {
    fn running(&self) -> MutexGuard<'_, Option<RunningTailer>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type SlotMap = RwLock<HashMap<DeploymentId, Arc<Slot>>>;

/// Drop `deployment`'s slot if it is idle and `slot` is the only handle
/// outside the map.
async fn release_slot(slots: &SlotMap, deployment: &DeploymentId, slot: &Arc<Slot>) -> bool {
    let mut slots = slots.write().await;
    let Some(current) = slots.get(deployment) else {
        return false;
    };
    if !Arc::ptr_eq(current, slot) || Arc::strong_count(slot) > 2 || slot.running().is_some() {
        return false;
    }
    slots.remove(deployment);
    log::trace!("Released tailer slot for deployment {deployment}");
    true
}

/// Owns every deployment's tailer and starts at most one per deployment.
pub struct TailerRegistry {
    slots: Arc<SlotMap>,
    factory: Arc<dyn TailerFactory>,
    hub: Arc<BroadcastHub>,
    next_generation: AtomicU64,
}

impl TailerRegistry {
    pub fn new(factory: Arc<dyn TailerFactory>, hub: Arc<BroadcastHub>) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            factory,
            hub,
            next_generation: AtomicU64::new(0),
        }
    }

    /// Start a tailer for `deployment` at `start_offset` unless one is running.
    ///
    /// Returns whether a tailer was started.
    pub async fn ensure_tailer(&self, deployment: &DeploymentId, start_offset: u64) -> bool {
        let slot = self.slot(deployment).await;
        let _gate = slot.gate.lock().await;

        let mut running = slot.running();
        if running.is_some() {
            log::trace!("Tailer for deployment {deployment} already running");
            return false;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let task = self.factory.create(deployment, start_offset);
        let join = tokio::spawn(supervise(
            Arc::downgrade(&self.slots),
            slot.clone(),
            deployment.clone(),
            generation,
            cancel.clone(),
            task,
            self.hub.clone(),
        ));
        *running = Some(RunningTailer {
            generation,
            cancel,
            join,
        });
        log::info!("Started tailer for deployment {deployment} at offset {start_offset}");
        true
    }

    /// Cancel the tailer for `deployment`, wait for it to stop and drop its
    /// bookkeeping.
    ///
    /// Returns whether a tailer was running.
    pub async fn teardown(&self, deployment: &DeploymentId) -> bool {
        let Some(slot) = self.existing_slot(deployment).await else {
            return false;
        };
        let _gate = slot.gate.lock().await;
        let stopped = self.stop(&slot, deployment).await;
        release_slot(&self.slots, deployment, &slot).await;
        stopped
    }

    /// Tear down tailers whose deployment has no subscribers.
    ///
    /// Returns the evicted deployments.
    pub async fn evict_idle(&self) -> Vec<DeploymentId> {
        let mut evicted = Vec::new();
        for deployment in self.running().await {
            let Some(slot) = self.existing_slot(&deployment).await else {
                continue;
            };
            let _gate = slot.gate.lock().await;
            if self.hub.subscriber_count(&deployment).await > 0 {
                continue;
            }
            let stopped = self.stop(&slot, &deployment).await;
            release_slot(&self.slots, &deployment, &slot).await;
            if stopped {
                log::info!("Evicted idle tailer for deployment {deployment}");
                evicted.push(deployment);
            }
        }
        self.prune().await;
        evicted
    }

    /// Tear down every tailer.
    pub async fn shutdown(&self) {
        let deployments: Vec<DeploymentId> = self.slots.read().await.keys().cloned().collect();
        let mut stopped = 0;
        for deployment in &deployments {
            if self.teardown(deployment).await {
                stopped += 1;
            }
        }
        log::info!("Tailer registry shut down ({stopped} tailers stopped)");
    }

    /// Whether a tailer is currently following `deployment`.
    pub async fn is_running(&self, deployment: &DeploymentId) -> bool {
        match self.existing_slot(deployment).await {
            Some(slot) => slot.running().is_some(),
            None => false,
        }
    }

    /// Deployments with a running tailer, sorted.
    pub async fn running(&self) -> Vec<DeploymentId> {
        let slots = self.slots.read().await;
        let mut ids: Vec<DeploymentId> = slots
            .iter()
            .filter(|(_, slot)| slot.running().is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Deployments with bookkeeping in the registry.
    pub async fn slot_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Drop idle slots nobody holds, such as one whose tailer ended while
    /// its starter still held the slot.
    async fn prune(&self) {
        let mut slots = self.slots.write().await;
        slots.retain(|_, slot| Arc::strong_count(slot) > 1 || slot.running().is_some());
    }

    /// Caller holds the slot's gate.
    async fn stop(&self, slot: &Slot, deployment: &DeploymentId) -> bool {
        let Some(running) = slot.running().take() else {
            return false;
        };
        running.cancel.cancel();
        if let Err(e) = running.join.await {
            if e.is_panic() {
                log::error!("Tailer task for deployment {deployment} panicked: {e}");
            }
        }
        log::info!("Tore down tailer for deployment {deployment}");
        true
    }

    async fn existing_slot(&self, deployment: &DeploymentId) -> Option<Arc<Slot>> {
        self.slots.read().await.get(deployment).cloned()
    }

    async fn slot(&self, deployment: &DeploymentId) -> Arc<Slot> {
        // Fast path: read lock
        if let Some(slot) = self.existing_slot(deployment).await {
            return slot;
        }

        let mut slots = self.slots.write().await;
        // Double-check after acquiring write lock
        slots.entry(deployment.clone()).or_default().clone()
    }
}

/// Drive one tailer until it is cancelled or ends on its own.
async fn supervise(
    slots: Weak<SlotMap>,
    slot: Arc<Slot>,
    deployment: DeploymentId,
    generation: u64,
    cancel: CancellationToken,
    task: BoxFuture<'static, Result<(), TailError>>,
    hub: Arc<BroadcastHub>,
) {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = task => Some(result),
    };

    let Some(result) = outcome else {
        log::debug!("Tailer for deployment {deployment} cancelled");
        return;
    };
    match result {
        Ok(()) => log::info!("Tailer for deployment {deployment} finished"),
        Err(e) => hub.report_tailer_failure(&deployment, &e),
    }

    {
        let mut running = slot.running();
        if running.as_ref().is_some_and(|r| r.generation == generation) {
            *running = None;
        }
    }
    if let Some(slots) = slots.upgrade() {
        release_slot(&slots, &deployment, &slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Counts creations; tailers run until cancelled.
    #[derive(Default)]
    struct PendingFactory {
        created: AtomicUsize,
    }

    impl TailerFactory for PendingFactory {
        fn create(&self, _: &DeploymentId, _: u64) -> BoxFuture<'static, Result<(), TailError>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Box::pin(std::future::pending())
        }
    }

    /// Tailers fail right away.
    struct FailingFactory;

    impl TailerFactory for FailingFactory {
        fn create(
            &self,
            deployment: &DeploymentId,
            _: u64,
        ) -> BoxFuture<'static, Result<(), TailError>> {
            let deployment = deployment.clone();
            Box::pin(async move { Err(TailError::SourceRemoved { deployment }) })
        }
    }

    fn deployment(name: &str) -> DeploymentId {
        DeploymentId::parse(name).unwrap()
    }

    async fn wait_until_stopped(registry: &TailerRegistry, id: &DeploymentId) {
        timeout(Duration::from_secs(2), async {
            while registry.is_running(id).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let factory = Arc::new(PendingFactory::default());
        let registry = TailerRegistry::new(factory.clone(), Arc::new(BroadcastHub::default()));
        let id = deployment("d1");

        assert!(registry.ensure_tailer(&id, 0).await);
        assert!(!registry.ensure_tailer(&id, 0).await);
        assert!(registry.is_running(&id).await);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_starts_one_tailer() {
        let factory = Arc::new(PendingFactory::default());
        let registry = Arc::new(TailerRegistry::new(
            factory.clone(),
            Arc::new(BroadcastHub::default()),
        ));
        let id = deployment("busy");

        let calls = (0..32).map(|_| {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move { registry.ensure_tailer(&id, 0).await })
        });
        let started = futures_util::future::join_all(calls)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(started, 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_then_restart() {
        let factory = Arc::new(PendingFactory::default());
        let registry = TailerRegistry::new(factory.clone(), Arc::new(BroadcastHub::default()));
        let id = deployment("d1");

        assert!(!registry.teardown(&id).await);
        registry.ensure_tailer(&id, 0).await;
        assert!(registry.teardown(&id).await);
        assert!(!registry.is_running(&id).await);

        assert!(registry.ensure_tailer(&id, 0).await);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_tailer_clears_slot_and_reports() {
        let hub = Arc::new(BroadcastHub::default());
        let registry = TailerRegistry::new(Arc::new(FailingFactory), hub.clone());
        let id = deployment("doomed");

        assert!(registry.ensure_tailer(&id, 0).await);
        wait_until_stopped(&registry, &id).await;
        assert_eq!(hub.stats().await.tailer_failures, 1);

        // A later subscription may start a fresh one.
        assert!(registry.ensure_tailer(&id, 0).await);
    }

    #[tokio::test]
    async fn test_running_and_shutdown() {
        let registry = TailerRegistry::new(
            Arc::new(PendingFactory::default()),
            Arc::new(BroadcastHub::default()),
        );
        registry.ensure_tailer(&deployment("b"), 0).await;
        registry.ensure_tailer(&deployment("a"), 0).await;
        assert_eq!(registry.running().await, vec![deployment("a"), deployment("b")]);

        registry.shutdown().await;
        assert!(registry.running().await.is_empty());
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_watched_deployments() {
        let hub = Arc::new(BroadcastHub::default());
        let registry = TailerRegistry::new(Arc::new(PendingFactory::default()), hub.clone());
        let watched = deployment("watched");
        let idle = deployment("idle");

        let _channel = hub.join(&watched, uuid::Uuid::new_v4()).await;
        registry.ensure_tailer(&watched, 0).await;
        registry.ensure_tailer(&idle, 0).await;

        assert_eq!(registry.evict_idle().await, vec![idle.clone()]);
        assert!(registry.is_running(&watched).await);
        assert!(!registry.is_running(&idle).await);
    }

    #[tokio::test]
    async fn test_slots_released_after_teardown_and_eviction() {
        let registry = TailerRegistry::new(
            Arc::new(PendingFactory::default()),
            Arc::new(BroadcastHub::default()),
        );
        let torn = deployment("torn");
        let idle = deployment("idle");

        registry.ensure_tailer(&torn, 0).await;
        registry.ensure_tailer(&idle, 0).await;
        assert_eq!(registry.slot_count().await, 2);

        assert!(registry.teardown(&torn).await);
        assert_eq!(registry.slot_count().await, 1);

        assert_eq!(registry.evict_idle().await, vec![idle]);
        assert_eq!(registry.slot_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_tailer_releases_slot() {
        let registry = TailerRegistry::new(Arc::new(FailingFactory), Arc::new(BroadcastHub::default()));
        let id = deployment("gone");

        registry.ensure_tailer(&id, 0).await;
        wait_until_stopped(&registry, &id).await;
        timeout(Duration::from_secs(2), async {
            // The starter may still hold the slot when the tailer ends.
            while registry.slot_count().await > 0 {
                registry.evict_idle().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_clears_slots() {
        let registry = TailerRegistry::new(
            Arc::new(PendingFactory::default()),
            Arc::new(BroadcastHub::default()),
        );
        for name in ["a", "b", "c"] {
            registry.ensure_tailer(&deployment(name), 0).await;
        }
        registry.shutdown().await;
        assert_eq!(registry.slot_count().await, 0);
    }
}
