//! Per-session mutable state shared by the engine's tasks.
//!
//! Every mutation runs inside [`SharedSession::update`], which never holds
//! the lock across an await point and republishes the badge counts when
//! they change.

use std::sync::Arc;

use nearby_core::feed::{FeedChange, RowChange};
use nearby_core::geo::SelfMarker;
use nearby_core::notifications::{Badges, NotificationAggregator};
use nearby_core::roster::{Revision, RosterStore};
use nearby_core::types::UserId;
use tokio::sync::{watch, RwLock};

/// Tickets for a read issued now, one per store it will be merged into.
#[derive(Debug, Clone, Copy)]
pub struct Tickets {
    pub roster: Revision,
    pub badges: Revision,
}

/// Everything the engine knows about one signed-in user.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub roster: RosterStore,
    pub aggregator: NotificationAggregator,
    pub marker: SelfMarker,
}

impl SessionState {
    pub fn new(me: UserId, marker: SelfMarker) -> Self {
        Self {
            roster: RosterStore::new(me),
            aggregator: NotificationAggregator::new(me),
            marker,
        }
    }

    pub fn me(&self) -> UserId {
        self.roster.me()
    }

    pub fn begin_snapshot(&self) -> Tickets {
        Tickets {
            roster: self.roster.begin_snapshot(),
            badges: self.aggregator.begin_snapshot(),
        }
    }

    /// Dispatch one decoded feed change to the roster and the aggregator.
    pub fn apply_feed(&mut self, change: &FeedChange) {
        match change {
            FeedChange::Profile(row_change) => {
                let user_id = match row_change {
                    RowChange::Insert(row) | RowChange::Update(row) => row.id,
                    RowChange::Delete { key, .. } => *key,
                };
                let applied = self.roster.apply_change_event(row_change);
                tracing::debug!(user_id = %user_id, ?applied, "Profile change merged");
            }
            FeedChange::Relationship(row_change) => {
                let applied = self.roster.apply_relationship_event(row_change);
                tracing::debug!(?applied, "Relationship change merged");
                self.aggregator.apply(change);
            }
            FeedChange::Message(_) => {
                self.aggregator.apply(change);
            }
            FeedChange::Block(row_change) => {
                let applied = self.roster.apply_block_event(row_change);
                tracing::debug!(?applied, "Block change merged");
            }
        }
    }
}

/// Cloneable handle on a [`SessionState`].
#[derive(Debug, Clone)]
pub struct SharedSession {
    me: UserId,
    inner: Arc<RwLock<SessionState>>,
    badges: watch::Sender<Badges>,
}

impl SharedSession {
    pub fn new(state: SessionState, badges: watch::Sender<Badges>) -> Self {
        Self {
            me: state.me(),
            inner: Arc::new(RwLock::new(state)),
            badges,
        }
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    /// Read a projection of the state.
    pub async fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        let guard = self.inner.read().await;
        f(&guard)
    }

    /// Mutate the state synchronously, then publish badge changes.
    pub async fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let (result, badges) = {
            let mut guard = self.inner.write().await;
            let result = f(&mut guard);
            (result, guard.aggregator.badges())
        };
        self.badges.send_if_modified(|current| {
            if *current == badges {
                false
            } else {
                *current = badges;
                true
            }
        });
        result
    }
}
