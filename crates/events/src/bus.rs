//! In-process change-feed bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`FeedBus`] is the hand-off point between a realtime transport and the
//! engine. It is designed to be shared via `Arc<FeedBus>`.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use nearby_core::feed::{FeedRecord, Table};
use nearby_core::types::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::subscription::FeedSubscription;

// ---------------------------------------------------------------------------
// FeedEvent
// ---------------------------------------------------------------------------

/// A feed record stamped with its arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEvent {
    /// Monotonic per-bus sequence number, starting at 1.
    pub sequence: u64,

    /// The row-level mutation as delivered by the transport.
    pub record: FeedRecord,

    /// When the bus accepted the record (UTC).
    pub received_at: Timestamp,
}

// ---------------------------------------------------------------------------
// FeedBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out bus for change-feed records.
///
/// # Usage
///
/// ```rust
/// use nearby_core::feed::{FeedRecord, Table};
/// use nearby_events::FeedBus;
///
/// let bus = FeedBus::default();
/// let _subscription = bus.subscribe(&[Table::Profiles]);
///
/// bus.publish(FeedRecord::delete_key(Table::Profiles, Default::default()));
/// ```
pub struct FeedBus {
    sender: broadcast::Sender<FeedEvent>,
    sequence: AtomicU64,
}

impl FeedBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed records are dropped
    /// and slow subscribers observe a lag, which the engine answers with a
    /// full resync.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish a record to all current subscribers. Returns its sequence.
    ///
    /// If there are no active subscribers the record is silently dropped.
    pub fn publish(&self, record: FeedRecord) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let event = FeedEvent {
            sequence,
            record,
            received_at: Utc::now(),
        };
        // A send error only means there are zero receivers.
        let _ = self.sender.send(event);
        sequence
    }

    /// Subscribe to the given tables with a fresh cancellation token.
    pub fn subscribe(&self, tables: &[Table]) -> FeedSubscription {
        self.subscribe_with(tables, CancellationToken::new())
    }

    /// Subscribe to the given tables, cancelled together with `cancel`.
    pub fn subscribe_with(&self, tables: &[Table], cancel: CancellationToken) -> FeedSubscription {
        FeedSubscription::new(self.sender.subscribe(), tables, cancel)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for FeedBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use nearby_core::feed::FeedChange;
    use uuid::Uuid;

    use super::*;
    use crate::subscription::FeedItem;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = FeedBus::default();
        let mut sub = bus.subscribe(&[Table::Relationships]);

        let id = Uuid::new_v4();
        let seq = bus.publish(FeedRecord::delete_key(Table::Relationships, id));
        assert_eq!(seq, 1);

        match sub.next().await {
            Some(FeedItem::Change { sequence, change }) => {
                assert_eq!(sequence, 1);
                assert_eq!(change.table(), Table::Relationships);
                assert!(matches!(change, FeedChange::Relationship(_)));
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_record() {
        let bus = FeedBus::default();
        let mut sub1 = bus.subscribe(&[Table::Profiles]);
        let mut sub2 = bus.subscribe(&[Table::Profiles]);
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(FeedRecord::delete_key(Table::Profiles, Uuid::new_v4()));

        assert!(sub1.next().await.is_some());
        assert!(sub2.next().await.is_some());
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = FeedBus::default();
        // No subscribers, still no panic.
        assert_eq!(bus.publish(FeedRecord::delete_key(Table::Blocks, Uuid::nil())), 1);
        assert_eq!(bus.publish(FeedRecord::delete_key(Table::Blocks, Uuid::nil())), 2);
    }

    #[test]
    fn dropped_subscription_releases_receiver() {
        let bus = FeedBus::default();
        let sub = bus.subscribe(&[Table::Profiles]);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
