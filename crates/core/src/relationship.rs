//! Friendship ("poke") state machine.
//!
//! States per pair: none -> pending -> accepted, pending -> declined,
//! any -> blocked, and pending/declined/blocked -> none via delete. A row
//! is owned by its requester; direction decides what a repeated poke means.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::{RowId, Timestamp, UserId};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipStatus {
    Pending,
    Accepted,
    Declined,
    Blocked,
}

impl RelationshipStatus {
    /// Whether an existing row may move from `self` to `next` by update.
    ///
    /// Leaving `declined`/`blocked` is only possible by deleting the row and
    /// inserting a fresh one, never by update.
    pub fn can_transition_to(self, next: RelationshipStatus) -> bool {
        use RelationshipStatus::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Accepted) | (Pending, Declined) | (Pending | Accepted | Declined, Blocked)
        )
    }

    /// Validate an update transition.
    pub fn transition(self, next: RelationshipStatus) -> Result<RelationshipStatus, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for RelationshipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RelationshipStatus::Pending => "pending",
            RelationshipStatus::Accepted => "accepted",
            RelationshipStatus::Declined => "declined",
            RelationshipStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Wire rows
// ---------------------------------------------------------------------------

/// A row of the relationships table. At most one row exists per unordered pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRow {
    pub id: RowId,
    pub requester_id: UserId,
    pub receiver_id: UserId,
    pub status: RelationshipStatus,
    #[serde(default)]
    pub requester_muted_until: Option<Timestamp>,
    #[serde(default)]
    pub receiver_muted_until: Option<Timestamp>,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

impl RelationshipRow {
    pub fn involves(&self, user: UserId) -> bool {
        self.requester_id == user || self.receiver_id == user
    }

    /// The other party relative to `me`, if `me` is a party at all.
    pub fn counterpart(&self, me: UserId) -> Option<UserId> {
        if self.requester_id == me {
            Some(self.receiver_id)
        } else if self.receiver_id == me {
            Some(self.requester_id)
        } else {
            None
        }
    }

    /// Whether this row connects exactly `a` and `b`, in either direction.
    pub fn connects(&self, a: UserId, b: UserId) -> bool {
        (self.requester_id == a && self.receiver_id == b)
            || (self.requester_id == b && self.receiver_id == a)
    }

    /// Project the row onto `me`: the counterpart and the local link fields.
    pub fn link_for(&self, me: UserId) -> Option<(UserId, RelationshipLink)> {
        let counterpart = self.counterpart(me)?;
        let muted_until = if self.requester_id == me {
            self.requester_muted_until
        } else {
            self.receiver_muted_until
        };
        Some((
            counterpart,
            RelationshipLink {
                row: RowRef::Stored(self.id),
                status: self.status,
                requester_id: self.requester_id,
                muted_until,
            },
        ))
    }

    pub fn apply_patch(&mut self, patch: &RelationshipPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(until) = patch.requester_muted_until {
            self.requester_muted_until = until;
        }
        if let Some(until) = patch.receiver_muted_until {
            self.receiver_muted_until = until;
        }
    }
}

/// Insert payload for a fresh request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRelationship {
    pub requester_id: UserId,
    pub receiver_id: UserId,
    pub status: RelationshipStatus,
}

impl NewRelationship {
    pub fn request(requester_id: UserId, receiver_id: UserId) -> Self {
        Self {
            requester_id,
            receiver_id,
            status: RelationshipStatus::Pending,
        }
    }
}

/// Field-level update for an existing row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RelationshipStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_muted_until: Option<Option<Timestamp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_muted_until: Option<Option<Timestamp>>,
}

impl RelationshipPatch {
    pub fn status(status: RelationshipStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Set the mute column that belongs to `me` on this link.
    pub fn mute(link: &RelationshipLink, me: UserId, until: Option<Timestamp>) -> Self {
        match link.direction(me) {
            Direction::Outgoing => Self {
                requester_muted_until: Some(until),
                ..Default::default()
            },
            Direction::Incoming => Self {
                receiver_muted_until: Some(until),
                ..Default::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Local link
// ---------------------------------------------------------------------------

/// Reference to a relationship row; temporary while an insert is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RowRef {
    Temporary(Uuid),
    Stored(RowId),
}

impl RowRef {
    pub fn temporary() -> Self {
        RowRef::Temporary(Uuid::new_v4())
    }

    pub fn stored_id(&self) -> Option<RowId> {
        match self {
            RowRef::Stored(id) => Some(*id),
            RowRef::Temporary(_) => None,
        }
    }
}

/// Who initiated the relationship, relative to the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Relationship fields stored on a roster entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipLink {
    pub row: RowRef,
    pub status: RelationshipStatus,
    pub requester_id: UserId,
    /// The local user's own mute of the counterpart.
    pub muted_until: Option<Timestamp>,
}

impl RelationshipLink {
    /// An optimistic pending request from `me` with a temporary id.
    pub fn provisional_request(me: UserId) -> Self {
        Self {
            row: RowRef::temporary(),
            status: RelationshipStatus::Pending,
            requester_id: me,
            muted_until: None,
        }
    }

    pub fn direction(&self, me: UserId) -> Direction {
        if self.requester_id == me {
            Direction::Outgoing
        } else {
            Direction::Incoming
        }
    }

    pub fn with_status(&self, status: RelationshipStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Mute is evaluated against the wall clock at read time only.
    pub fn is_muted(&self, now: Timestamp) -> bool {
        self.muted_until.is_some_and(|until| until > now)
    }
}

// ---------------------------------------------------------------------------
// Poke planning
// ---------------------------------------------------------------------------

/// What a poke must do given the locally known link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PokePlan {
    /// Already friends; nothing to write.
    AlreadyFriends,
    /// An outgoing request is already pending.
    AlreadyRequested,
    /// The counterpart asked first: poking back accepts their row.
    Accept { row: RowId },
    /// Delete a declined/blocked row, then insert a fresh request.
    Recreate { stale: RowId },
    /// Insert a fresh pending request.
    Request,
}

/// Decide what `me` poking the counterpart of `existing` means.
pub fn plan_poke(me: UserId, existing: Option<&RelationshipLink>) -> PokePlan {
    let Some(link) = existing else {
        return PokePlan::Request;
    };

    match (link.status, link.direction(me), link.row) {
        (RelationshipStatus::Accepted, _, _) => PokePlan::AlreadyFriends,
        (RelationshipStatus::Pending, Direction::Outgoing, _) => PokePlan::AlreadyRequested,
        (RelationshipStatus::Pending, Direction::Incoming, RowRef::Stored(row)) => {
            PokePlan::Accept { row }
        }
        (RelationshipStatus::Declined | RelationshipStatus::Blocked, _, RowRef::Stored(stale)) => {
            PokePlan::Recreate { stale }
        }
        // Temporary rows never exist on the server yet.
        (_, _, RowRef::Temporary(_)) => PokePlan::Request,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
