//! Badge counts derived from relationship and message rows.
//!
//! Counts are always re-derived from the full retained state after every
//! change; counts carried in event payloads are never trusted.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::feed::{FeedChange, RowChange};
use crate::relationship::{RelationshipRow, RelationshipStatus};
use crate::roster::{Revision, Stamps};
use crate::types::{RowId, Timestamp, UserId};

/// A chat message row, reduced to the columns badge derivation reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: RowId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub is_system: bool,
    /// Users who deleted this message for themselves.
    #[serde(default)]
    pub deleted_for: Vec<UserId>,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

impl MessageRow {
    /// Whether this message counts as unread for `me`.
    pub fn is_unread_for(&self, me: UserId) -> bool {
        self.receiver_id == me && !self.read && !self.is_system && !self.deleted_for.contains(&me)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badges {
    /// Requests waiting on the local user.
    pub pending_requests: usize,
    /// Distinct senders with unread messages.
    pub unread_conversations: usize,
}

/// Rows of one table as last seen, with per-row feed stamps.
#[derive(Debug, Clone)]
struct Retained<T> {
    rows: HashMap<RowId, T>,
    stamps: Stamps,
    last_snapshot: Revision,
}

impl<T> Retained<T> {
    fn new() -> Self {
        Self {
            rows: HashMap::new(),
            stamps: Stamps::default(),
            last_snapshot: Revision::default(),
        }
    }

    fn upsert(&mut self, id: RowId, row: T, at: Revision) {
        self.stamps.touch(id, at);
        self.rows.insert(id, row);
    }

    fn remove(&mut self, id: RowId, at: Revision) {
        self.stamps.touch(id, at);
        self.rows.remove(&id);
    }

    /// Replace the rows with a read issued at `ticket`. Rows the feed
    /// touched after `ticket` keep their current state, present or not.
    /// Returns `false` when a newer read was already applied.
    fn replace(
        &mut self,
        ticket: Revision,
        fresh: impl IntoIterator<Item = (RowId, T)>,
    ) -> bool {
        if ticket < self.last_snapshot {
            return false;
        }
        self.last_snapshot = ticket;

        let mut next: HashMap<RowId, T> = fresh
            .into_iter()
            .filter(|(id, _)| !self.stamps.newer_than(id, ticket))
            .collect();
        for (id, row) in self.rows.drain() {
            if self.stamps.newer_than(&id, ticket) {
                next.insert(id, row);
            }
        }
        self.rows = next;
        self.stamps.prune_through(ticket);
        true
    }
}

/// Derives [`Badges`] from the retained relationship and message rows.
///
/// Feed events stamp the rows they touch with a [`Revision`]; a full read
/// is merged under the ticket taken from [`NotificationAggregator::begin_snapshot`]
/// before it was issued, so it never reverts a row the feed changed while
/// the read was in flight.
#[derive(Debug, Clone)]
pub struct NotificationAggregator {
    me: UserId,
    clock: Revision,
    relationships: Retained<RelationshipRow>,
    messages: Retained<MessageRow>,
    badges: Badges,
}

impl NotificationAggregator {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            clock: Revision::default(),
            relationships: Retained::new(),
            messages: Retained::new(),
            badges: Badges::default(),
        }
    }

    pub fn badges(&self) -> Badges {
        self.badges
    }

    /// Ticket to pass to the `replace_*` call that completes a read issued now.
    pub fn begin_snapshot(&self) -> Revision {
        self.clock
    }

    /// Fold a feed change in. Returns `true` when the badges changed.
    pub fn apply(&mut self, change: &FeedChange) -> bool {
        match change {
            FeedChange::Relationship(change) => {
                let at = self.tick();
                self.apply_relationship(change, at);
            }
            FeedChange::Message(change) => {
                let at = self.tick();
                self.apply_message(change, at);
            }
            FeedChange::Profile(_) | FeedChange::Block(_) => return false,
        }
        self.recompute()
    }

    /// Replace relationship state with a read issued at `ticket`.
    pub fn replace_relationships(
        &mut self,
        ticket: Revision,
        rows: impl IntoIterator<Item = RelationshipRow>,
    ) -> bool {
        let me = self.me;
        let fresh = rows
            .into_iter()
            .filter(|row| row.involves(me))
            .map(|row| (row.id, row));
        if !self.relationships.replace(ticket, fresh) {
            return false;
        }
        self.recompute()
    }

    /// Replace message state with a read issued at `ticket`.
    pub fn replace_messages(
        &mut self,
        ticket: Revision,
        rows: impl IntoIterator<Item = MessageRow>,
    ) -> bool {
        let me = self.me;
        let fresh = rows
            .into_iter()
            .filter(|row| row.receiver_id == me)
            .map(|row| (row.id, row));
        if !self.messages.replace(ticket, fresh) {
            return false;
        }
        self.recompute()
    }

    fn tick(&mut self) -> Revision {
        self.clock = Revision(self.clock.0 + 1);
        self.clock
    }

    fn apply_relationship(&mut self, change: &RowChange<RelationshipRow, RowId>, at: Revision) {
        match change {
            RowChange::Insert(row) | RowChange::Update(row) => {
                if row.involves(self.me) {
                    self.relationships.upsert(row.id, row.clone(), at);
                } else {
                    self.relationships.remove(row.id, at);
                }
            }
            RowChange::Delete { key, .. } => self.relationships.remove(*key, at),
        }
    }

    fn apply_message(&mut self, change: &RowChange<MessageRow, RowId>, at: Revision) {
        match change {
            RowChange::Insert(row) | RowChange::Update(row) => {
                if row.receiver_id == self.me {
                    self.messages.upsert(row.id, row.clone(), at);
                } else {
                    self.messages.remove(row.id, at);
                }
            }
            RowChange::Delete { key, .. } => self.messages.remove(*key, at),
        }
    }

    /// Re-derive both counts from the retained rows.
    pub fn recompute(&mut self) -> bool {
        let me = self.me;
        let pending_requests = self
            .relationships
            .rows
            .values()
            .filter(|r| r.receiver_id == me && r.status == RelationshipStatus::Pending)
            .count();
        let unread_conversations = self
            .messages
            .rows
            .values()
            .filter(|m| m.is_unread_for(me))
            .map(|m| m.sender_id)
            .collect::<HashSet<_>>()
            .len();

        let next = Badges {
            pending_requests,
            unread_conversations,
        };
        let changed = next != self.badges;
        self.badges = next;
        changed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
