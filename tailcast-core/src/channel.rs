//! Per-subscriber delivery channel.
//!
//! Yields the backfill first (marked historical), then live lines from the
//! room's broadcast. Bounded: a subscriber that falls more than the hub's
//! capacity behind loses the oldest unread lines and continues in order from
//! the oldest retained one.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::backfill::Backfill;
use crate::hub::{HubCounters, Membership};
use crate::line::{DeliveredLine, DeploymentId, TailedLine};

/// One subscriber's ordered feed for one deployment.
///
/// Dropping the channel unregisters the subscriber from its room.
pub struct DeliveryChannel {
    membership: Membership,
    backlog: VecDeque<DeliveredLine>,
    live: broadcast::Receiver<Arc<TailedLine>>,
    /// Live lines ending at or before this offset are already in the backlog.
    resume_after: Option<u64>,
    dropped: u64,
    counters: Arc<HubCounters>,
}

impl DeliveryChannel {
    pub(crate) fn new(
        membership: Membership,
        live: broadcast::Receiver<Arc<TailedLine>>,
        counters: Arc<HubCounters>,
    ) -> Self {
        Self {
            membership,
            backlog: VecDeque::new(),
            live,
            resume_after: None,
            dropped: 0,
            counters,
        }
    }

    pub fn deployment_id(&self) -> &DeploymentId {
        self.membership.deployment()
    }

    pub fn subscriber_id(&self) -> Uuid {
        self.membership.subscriber()
    }

    /// Queue historical lines ahead of any live line.
    ///
    /// Live lines already covered by the backfill (ending at or before its
    /// `end_offset`) are discarded when they arrive.
    pub fn push_backfill(&mut self, backfill: Backfill) {
        self.backlog
            .extend(backfill.lines.into_iter().map(DeliveredLine::historical));
        self.resume_after = Some(backfill.end_offset);
    }

    /// Historical lines not yet received.
    pub fn pending_backfill(&self) -> usize {
        self.backlog.len()
    }

    /// Lines this subscriber lost to backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Closed by `leave` or by a re-join of the same subscriber.
    pub fn is_closed(&self) -> bool {
        self.membership.closed().is_cancelled()
    }

    /// Next line in delivery order; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<DeliveredLine> {
        if self.is_closed() {
            return None;
        }
        if let Some(line) = self.backlog.pop_front() {
            return Some(line);
        }

        loop {
            let received = tokio::select! {
                biased;
                _ = self.membership.closed().cancelled() => return None,
                received = self.live.recv() => received,
            };

            match received {
                Ok(tailed) => {
                    if let Some(resume_after) = self.resume_after {
                        if tailed.end_offset <= resume_after {
                            continue;
                        }
                        self.resume_after = None;
                    }
                    return Some(DeliveredLine::live(&tailed.line));
                }
                Err(RecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    self.counters
                        .lines_dropped
                        .fetch_add(skipped, Ordering::Relaxed);
                    log::warn!(
                        "Subscriber {} of deployment {} lagged; dropped {skipped} oldest lines",
                        self.subscriber_id(),
                        self.deployment_id()
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// The channel as a stream of delivered lines, ending when closed.
    pub fn into_stream(self) -> impl Stream<Item = DeliveredLine> {
        futures_util::stream::unfold(self, |mut channel| async move {
            let line = channel.recv().await?;
            Some((line, channel))
        })
    }
}

impl std::fmt::Debug for DeliveryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryChannel")
            .field("deployment_id", self.deployment_id())
            .field("subscriber_id", &self.subscriber_id())
            .field("pending_backfill", &self.backlog.len())
            .field("resume_after", &self.resume_after)
            .field("dropped", &self.dropped)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::BroadcastHub;
    use crate::line::LogLine;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    fn tailed(message: &str, end_offset: u64) -> TailedLine {
        TailedLine {
            line: LogLine::parse(&format!("t: {message}")).unwrap(),
            end_offset,
        }
    }

    fn deployment() -> DeploymentId {
        DeploymentId::parse("channel-test").unwrap()
    }

    #[tokio::test]
    async fn test_backfill_before_live() {
        let hub = BroadcastHub::new(16);
        let id = deployment();
        let mut channel = hub.join(&id, Uuid::new_v4()).await;

        hub.publish(&id, tailed("live", 30)).await;
        channel.push_backfill(Backfill {
            lines: vec![LogLine::parse("t: old").unwrap()],
            end_offset: 20,
        });
        assert_eq!(channel.pending_backfill(), 1);

        let first = channel.recv().await.unwrap();
        assert_eq!(first.message, "old");
        assert!(first.is_historical);

        let second = channel.recv().await.unwrap();
        assert_eq!(second.message, "live");
        assert!(!second.is_historical);
    }

    #[tokio::test]
    async fn test_live_lines_covered_by_backfill_are_skipped() {
        let hub = BroadcastHub::new(16);
        let id = deployment();
        let mut channel = hub.join(&id, Uuid::new_v4()).await;

        // A running tailer published these while the backfill was being read.
        hub.publish(&id, tailed("one", 10)).await;
        hub.publish(&id, tailed("two", 20)).await;
        hub.publish(&id, tailed("three", 30)).await;

        channel.push_backfill(Backfill {
            lines: vec![
                LogLine::parse("t: one").unwrap(),
                LogLine::parse("t: two").unwrap(),
            ],
            end_offset: 20,
        });

        let messages: Vec<String> = channel
            .into_stream()
            .take(3)
            .map(|line| line.message)
            .collect()
            .await;
        assert_eq!(messages, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_lagging_channel_drops_oldest_and_keeps_order() {
        let hub = BroadcastHub::new(4);
        let id = deployment();
        let mut channel = hub.join(&id, Uuid::new_v4()).await;

        for i in 0..10u64 {
            hub.publish(&id, tailed(&format!("line {i}"), (i + 1) * 10)).await;
        }

        let mut received = Vec::new();
        while let Ok(Some(line)) = timeout(Duration::from_millis(50), channel.recv()).await {
            received.push(line.message);
        }
        assert_eq!(received, vec!["line 6", "line 7", "line 8", "line 9"]);
        assert_eq!(channel.dropped(), 6);
        assert_eq!(hub.stats().await.lines_dropped, 6);
    }

    #[tokio::test]
    async fn test_closed_channel_ends_stream() {
        let hub = BroadcastHub::new(16);
        let id = deployment();
        let subscriber = Uuid::new_v4();
        let channel = hub.join(&id, subscriber).await;
        let mut stream = Box::pin(channel.into_stream());

        let hub = Arc::new(hub);
        let leaver = hub.clone();
        let leave_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            leaver.leave(&leave_id, subscriber).await;
        });

        let end = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(end.is_none());
    }
}
