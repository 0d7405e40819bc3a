//! Cancellable, table-filtered change-feed subscription.
//!
//! A [`FeedSubscription`] decodes records into typed [`FeedChange`]s and
//! drops malformed ones with a warning. Cancellation is guaranteed: the
//! stream ends when its token is cancelled, when the bus is dropped, or when
//! the subscription itself is dropped (which also cancels the token).

use std::collections::HashSet;

use nearby_core::feed::{FeedChange, Table};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::FeedEvent;

/// One item yielded by [`FeedSubscription::next`].
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    /// A decoded change on a subscribed table.
    Change { sequence: u64, change: FeedChange },
    /// The subscriber fell behind and `n` records were lost.
    /// State derived from the feed must be resynchronised.
    Lagged(u64),
}

pub struct FeedSubscription {
    receiver: broadcast::Receiver<FeedEvent>,
    tables: HashSet<Table>,
    cancel: CancellationToken,
}

impl FeedSubscription {
    pub(crate) fn new(
        receiver: broadcast::Receiver<FeedEvent>,
        tables: &[Table],
        cancel: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            tables: tables.iter().copied().collect(),
            cancel,
        }
    }

    /// Token that ends this subscription when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn tables(&self) -> &HashSet<Table> {
        &self.tables
    }

    /// Wait for the next change on a subscribed table.
    ///
    /// Returns `None` once the subscription is cancelled or the bus closed.
    pub async fn next(&mut self) -> Option<FeedItem> {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                received = self.receiver.recv() => received,
            };

            match received {
                Ok(event) => {
                    if !self.tables.contains(&event.record.table) {
                        continue;
                    }
                    match event.record.decode() {
                        Ok(change) => {
                            return Some(FeedItem::Change {
                                sequence: event.sequence,
                                change,
                            })
                        }
                        Err(e) => {
                            tracing::warn!(
                                sequence = event.sequence,
                                table = ?event.record.table,
                                error = %e,
                                "Dropping malformed feed record"
                            );
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Feed subscription lagged");
                    return Some(FeedItem::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Feed bus closed, subscription ending");
                    return None;
                }
            }
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("tables", &self.tables)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
