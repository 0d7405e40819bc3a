//! Feed pump: drains a change-feed subscription into the session state.

use std::sync::Arc;

use nearby_events::{FeedItem, FeedSubscription};
use tokio::sync::Notify;

use crate::state::SharedSession;

/// Apply feed changes until the subscription ends.
///
/// A lagged subscription has lost changes, so a full resync is requested
/// from the poller instead of guessing.
pub async fn run(mut subscription: FeedSubscription, session: SharedSession, resync: Arc<Notify>) {
    tracing::info!(user_id = %session.me(), tables = ?subscription.tables(), "Feed pump started");

    while let Some(item) = subscription.next().await {
        match item {
            FeedItem::Change { sequence, change } => {
                tracing::trace!(sequence, table = ?change.table(), "Feed change received");
                session.update(|s| s.apply_feed(&change)).await;
            }
            FeedItem::Lagged(skipped) => {
                tracing::warn!(skipped, "Feed pump lagged, requesting resync");
                resync.notify_one();
            }
        }
    }

    tracing::info!(user_id = %session.me(), "Feed pump stopped");
}
