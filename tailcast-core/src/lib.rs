//! # tailcast-core — Real-time log streaming engine
//!
//! Follows one append-only log file per deployment and fans every new line
//! out to the deployment's subscribers, after first handing each new
//! subscriber the tail of what is already on disk.
//!
//! ## Architecture
//!
//! ```text
//!  <log_dir>/<deployment>.log
//!        │ (appended by producers)
//!        ▼
//! ┌─────────────┐  publish   ┌──────────────┐  broadcast  ┌─────────────────┐
//! │   Tailer    │ ─────────► │ BroadcastHub │ ──────────► │ DeliveryChannel │ ──► transport
//! │ (1 per dep) │            │ (1 room/dep) │             │ (1 per sub)     │
//! └──────▲──────┘            └──────────────┘             └────────▲────────┘
//!        │ ensure / teardown                                      │ backfill first
//! ┌──────┴────────┐                                      ┌────────┴───────┐
//! │ TailerRegistry│                                      │ BackfillReader │
//! └───────────────┘                                      └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`line`] — Deployment ids and the `"<timestamp>: <message>"` record model
//! - [`source`] — Log directory layout
//! - [`tailer`] — Offset-tracking file follower
//! - [`backfill`] — Last-N-lines reader with an exact handoff offset
//! - [`hub`] — Per-deployment rooms and lock-free publish
//! - [`channel`] — Bounded per-subscriber delivery (drop-oldest)
//! - [`registry`] — At most one tailer per deployment
//! - [`engine`] — Subscribe / unsubscribe facade
//!
//! ## Guarantees
//!
//! | Property | How |
//! |----------|-----|
//! | One tailer per deployment | per-deployment gate in [`TailerRegistry`] |
//! | No gap, no repeat between backfill and live | join before backfill, offset filter |
//! | Tailer outlives its subscribers | `leave` never touches the registry |
//! | Slow subscriber never blocks others | bounded broadcast, drop-oldest |
//! | Abandoned subscriptions do not linger | dropping a [`DeliveryChannel`] leaves its room |

pub mod line;
pub mod source;
pub mod tailer;
pub mod backfill;
pub mod hub;
pub mod channel;
pub mod registry;
pub mod engine;

// Re-exports for convenience
pub use line::{
    DeliveredLine, DeploymentId, InvalidDeploymentId, LogLine, TailedLine, RECORD_SEPARATOR,
};
pub use source::LogDirectory;
pub use tailer::{TailError, Tailer, TailerConfig, TailerState};
pub use backfill::{Backfill, BackfillError, BackfillReader, DEFAULT_BACKFILL_LINES};
pub use hub::{BroadcastHub, HubStats, DEFAULT_CHANNEL_CAPACITY, MAX_CHANNEL_CAPACITY};
pub use channel::DeliveryChannel;
pub use registry::{FileTailerFactory, TailerFactory, TailerRegistry};
pub use engine::{Engine, EngineConfig, EngineError, Subscription};
