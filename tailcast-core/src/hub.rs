//! Per-deployment fan-out of tailed lines to subscriber delivery channels.
//!
//! Each deployment with at least one subscriber gets a room backed by one
//! tokio broadcast channel, so `publish` is a single O(1) send regardless of
//! subscriber count. Every subscriber holds its own receiver that can fall at
//! most `capacity` lines behind before the oldest unread lines are dropped.
//!
//! ```text
//!   Tailer ──publish──► rooms[deployment] ──► broadcast::Sender
//!                                                │   │   │
//!                                            rx1 │   │ rx2 ... (one per DeliveryChannel)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::DeliveryChannel;
use crate::line::{DeploymentId, TailedLine};
use crate::tailer::TailError;

/// Default per-subscriber buffer, in lines.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Upper bound on the per-subscriber buffer. tokio's broadcast channel
/// preallocates every slot and rejects capacities above `usize::MAX / 2`.
pub const MAX_CHANNEL_CAPACITY: usize = 1 << 20;

/// Snapshot of hub health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub lines_published: u64,
    /// Lines discarded from lagging subscribers' buffers.
    pub lines_dropped: u64,
    pub tailer_failures: u64,
    pub active_rooms: usize,
    pub active_subscribers: usize,
}

/// Lock-free counters shared with every delivery channel.
#[derive(Debug, Default)]
pub(crate) struct HubCounters {
    pub(crate) lines_published: AtomicU64,
    pub(crate) lines_dropped: AtomicU64,
    pub(crate) tailer_failures: AtomicU64,
}

#[derive(Debug, Default)]
struct RoomMembers {
    /// Subscriber id -> close signal of its current channel.
    members: HashMap<Uuid, CancellationToken>,
    /// Set once the room has been removed from the hub; joiners must retry.
    retired: bool,
}

/// Subscribers of one deployment.
struct BroadcastRoom {
    sender: broadcast::Sender<Arc<TailedLine>>,
    members: RwLock<RoomMembers>,
}

impl BroadcastRoom {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(RoomMembers::default()),
        }
    }
}

type RoomMap = RwLock<HashMap<DeploymentId, Arc<BroadcastRoom>>>;

/// A channel's registration in its room.
///
/// Dropping a membership that is still open (the channel was abandoned
/// without `leave`) removes it from the room in the background.
pub(crate) struct Membership {
    rooms: Weak<RoomMap>,
    deployment: DeploymentId,
    subscriber: Uuid,
    closed: CancellationToken,
}

impl Membership {
    pub(crate) fn deployment(&self) -> &DeploymentId {
        &self.deployment
    }

    pub(crate) fn subscriber(&self) -> Uuid {
        self.subscriber
    }

    pub(crate) fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if self.closed.is_cancelled() {
            // Already left, or replaced by a re-join.
            return;
        }
        // A cancelled token left in the room marks this membership as
        // abandoned; a re-join in the meantime installs a fresh one.
        self.closed.cancel();

        let Some(rooms) = self.rooms.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!(
                "Subscriber {} of deployment {} dropped outside a runtime; membership not removed",
                self.subscriber,
                self.deployment
            );
            return;
        };
        let deployment = self.deployment.clone();
        let subscriber = self.subscriber;
        runtime.spawn(async move {
            if remove_member(&rooms, &deployment, subscriber, Removal::Abandoned).await {
                log::info!("Subscriber {subscriber} dropped its channel for deployment {deployment}");
            }
        });
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Removal {
    /// `leave`: remove whatever channel the subscriber has.
    Any,
    /// Channel drop: remove only a membership whose channel is gone.
    Abandoned,
}

/// Remove `subscriber` from its room, retiring the room once empty.
async fn remove_member(
    rooms: &RoomMap,
    deployment: &DeploymentId,
    subscriber: Uuid,
    removal: Removal,
) -> bool {
    let Some(room) = rooms.read().await.get(deployment).cloned() else {
        return false;
    };

    let now_empty = {
        let mut members = room.members.write().await;
        let abandoned = match members.members.get(&subscriber) {
            Some(closed) => closed.is_cancelled(),
            None => return false,
        };
        if removal == Removal::Abandoned && !abandoned {
            return false;
        }
        if let Some(closed) = members.members.remove(&subscriber) {
            closed.cancel();
        }
        members.members.is_empty()
    };

    if now_empty {
        remove_if_empty(rooms, deployment).await;
    }
    true
}

async fn remove_if_empty(rooms: &RoomMap, deployment: &DeploymentId) -> bool {
    let mut rooms = rooms.write().await;
    let Some(room) = rooms.get(deployment).cloned() else {
        return false;
    };
    let mut members = room.members.write().await;
    if !members.members.is_empty() {
        return false;
    }
    members.retired = true;
    rooms.remove(deployment);
    log::debug!("Closed empty room for deployment {deployment}");
    true
}

/// Fans tailed lines out to every subscriber of a deployment.
///
/// Rooms are created on the first `join` and retired when the last member
/// leaves or drops its channel. Publishing never waits on subscribers.
pub struct BroadcastHub {
    rooms: Arc<RoomMap>,
    capacity: usize,
    counters: Arc<HubCounters>,
}

impl BroadcastHub {
    /// `capacity` bounds each subscriber's buffer, clamped to
    /// `1..=MAX_CHANNEL_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.clamp(1, MAX_CHANNEL_CAPACITY),
            counters: Arc::new(HubCounters::default()),
        }
    }

    /// Lines a subscriber may fall behind before the oldest are dropped.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register `subscriber` in the room for `deployment` and return its channel.
    ///
    /// The channel is live from this point on: every line published after
    /// `join` returns is buffered for it. Joining again with the same
    /// subscriber id closes the previous channel. Dropping the channel
    /// without `leave` removes the subscriber as well.
    pub async fn join(&self, deployment: &DeploymentId, subscriber: Uuid) -> DeliveryChannel {
        loop {
            let room = self.get_or_create(deployment).await;
            let mut members = room.members.write().await;
            if members.retired {
                // Lost a race with the last leave; the room is gone from the map.
                continue;
            }

            let closed = CancellationToken::new();
            if let Some(previous) = members.members.insert(subscriber, closed.clone()) {
                log::debug!(
                    "Subscriber {subscriber} re-joined deployment {deployment}; closing earlier channel"
                );
                previous.cancel();
            }
            let receiver = room.sender.subscribe();
            log::info!(
                "Subscriber {subscriber} joined deployment {deployment} ({} in room)",
                members.members.len()
            );

            let membership = Membership {
                rooms: Arc::downgrade(&self.rooms),
                deployment: deployment.clone(),
                subscriber,
                closed,
            };
            return DeliveryChannel::new(membership, receiver, self.counters.clone());
        }
    }

    /// Remove `subscriber` from `deployment` and close its channel.
    ///
    /// Drops the room when it becomes empty. Never touches the tailer.
    /// Returns whether the subscriber was registered.
    pub async fn leave(&self, deployment: &DeploymentId, subscriber: Uuid) -> bool {
        let removed = remove_member(&self.rooms, deployment, subscriber, Removal::Any).await;
        if removed {
            log::info!("Subscriber {subscriber} left deployment {deployment}");
        }
        removed
    }

    /// Push `line` to every channel registered for `deployment`.
    ///
    /// Never waits on subscribers. Returns the number of channels reached.
    pub async fn publish(&self, deployment: &DeploymentId, line: TailedLine) -> usize {
        self.counters.lines_published.fetch_add(1, Ordering::Relaxed);
        let Some(room) = self.room(deployment).await else {
            return 0;
        };
        let reached = room.sender.send(Arc::new(line)).unwrap_or(0);
        log::trace!("Published line to {reached} subscribers of deployment {deployment}");
        reached
    }

    /// Record that the tailer for `deployment` stopped on its own.
    pub fn report_tailer_failure(&self, deployment: &DeploymentId, error: &TailError) {
        self.counters.tailer_failures.fetch_add(1, Ordering::Relaxed);
        log::error!("Tailer for deployment {deployment} stopped: {error}");
    }

    /// Members currently registered for `deployment`.
    pub async fn subscriber_count(&self, deployment: &DeploymentId) -> usize {
        match self.room(deployment).await {
            Some(room) => room.members.read().await.members.len(),
            None => 0,
        }
    }

    /// Whether `subscriber` holds a channel for `deployment`.
    pub async fn is_subscribed(&self, deployment: &DeploymentId, subscriber: &Uuid) -> bool {
        match self.room(deployment).await {
            Some(room) => room.members.read().await.members.contains_key(subscriber),
            None => false,
        }
    }

    /// Number of open rooms, one per watched deployment.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Deployments that currently have at least one subscriber.
    pub async fn active_deployments(&self) -> Vec<DeploymentId> {
        let mut ids: Vec<DeploymentId> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Counters since creation plus current room and subscriber totals.
    pub async fn stats(&self) -> HubStats {
        let rooms: Vec<Arc<BroadcastRoom>> = self.rooms.read().await.values().cloned().collect();
        let mut active_subscribers = 0;
        for room in &rooms {
            active_subscribers += room.members.read().await.members.len();
        }
        HubStats {
            lines_published: self.counters.lines_published.load(Ordering::Relaxed),
            lines_dropped: self.counters.lines_dropped.load(Ordering::Relaxed),
            tailer_failures: self.counters.tailer_failures.load(Ordering::Relaxed),
            active_rooms: rooms.len(),
            active_subscribers,
        }
    }

    async fn room(&self, deployment: &DeploymentId) -> Option<Arc<BroadcastRoom>> {
        self.rooms.read().await.get(deployment).cloned()
    }

    async fn get_or_create(&self, deployment: &DeploymentId) -> Arc<BroadcastRoom> {
        // Fast path: read lock
        if let Some(room) = self.room(deployment).await {
            return room;
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(deployment) {
            return room.clone();
        }
        let room = Arc::new(BroadcastRoom::new(self.capacity));
        rooms.insert(deployment.clone(), room.clone());
        log::debug!("Opened room for deployment {deployment}");
        room
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
