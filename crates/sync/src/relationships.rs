//! Friendship ("poke") actions with optimistic apply and rollback.
//!
//! Each action captures the counterpart's relationship fields, applies the
//! expected outcome to the roster synchronously, then issues the remote
//! write. A failed write restores the captured fields verbatim; a
//! successful insert swaps the temporary row id for the confirmed one.

use std::sync::Arc;

use nearby_core::error::CoreError;
use nearby_core::feed::RowChange;
use nearby_core::optimistic::OptimisticLink;
use nearby_core::relationship::{
    plan_poke, Direction, NewRelationship, PokePlan, RelationshipLink, RelationshipPatch,
    RelationshipRow, RelationshipStatus, RowRef,
};
use nearby_core::types::{RowId, Timestamp, UserId};

use crate::backend::{Backend, BackendError};
use crate::error::SyncError;
use crate::state::SharedSession;

/// Result of a successful [`RelationshipMachine::poke`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PokeOutcome {
    /// A fresh pending request was created.
    Requested,
    /// The counterpart's pending request was accepted.
    Accepted,
    /// Nothing to do: the pair are already friends.
    AlreadyFriends,
    /// Nothing to do: an outgoing request is already pending.
    AlreadyRequested,
}

/// Result of a successful [`RelationshipMachine::block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Blocked,
    AlreadyBlocked,
}

/// A poke that has been applied locally and awaits its remote writes.
struct PendingPoke {
    plan: PokePlan,
    edit: OptimisticLink,
}

#[derive(Clone)]
pub struct RelationshipMachine {
    session: SharedSession,
    backend: Arc<dyn Backend>,
}

impl RelationshipMachine {
    pub fn new(session: SharedSession, backend: Arc<dyn Backend>) -> Self {
        Self { session, backend }
    }

    fn me(&self) -> UserId {
        self.session.me()
    }

    // -----------------------------------------------------------------------
    // Poke
    // -----------------------------------------------------------------------

    /// Send a friend request, or accept the counterpart's pending one.
    ///
    /// A uniqueness conflict means the counterpart wrote first. The local
    /// edit is rolled back, relationships are re-read, and the poke is
    /// planned once more against the fresh state.
    pub async fn poke(&self, target: UserId) -> Result<PokeOutcome, SyncError> {
        self.ensure_other(target)?;

        let mut resynced = false;
        loop {
            let pending = match self.begin_poke(target).await {
                Ok(pending) => pending,
                Err(outcome) => return Ok(outcome),
            };
            match self.finish_poke(target, pending).await {
                Err(SyncError::Conflict(msg)) if !resynced => {
                    tracing::debug!(target_id = %target, conflict = %msg, "Poke raced, re-reading relationships");
                    self.resync().await?;
                    resynced = true;
                }
                Err(SyncError::Conflict(_)) => return Ok(PokeOutcome::AlreadyRequested),
                other => return other,
            }
        }
    }

    /// Plan the poke and apply its optimistic edit. `Err` carries a no-op
    /// outcome that needs no write.
    async fn begin_poke(&self, target: UserId) -> Result<PendingPoke, PokeOutcome> {
        let me = self.me();
        self.session
            .update(|s| {
                let existing = s.roster.relationship_with(&target).cloned();
                let plan = plan_poke(me, existing.as_ref());
                let next = match (plan, existing) {
                    (PokePlan::AlreadyFriends, _) => return Err(PokeOutcome::AlreadyFriends),
                    (PokePlan::AlreadyRequested, _) => return Err(PokeOutcome::AlreadyRequested),
                    (PokePlan::Accept { .. }, Some(link)) => link.with_status(RelationshipStatus::Accepted),
                    (PokePlan::Recreate { stale }, _) => {
                        s.roster.forget_row(&stale);
                        RelationshipLink::provisional_request(me)
                    }
                    (PokePlan::Accept { .. } | PokePlan::Request, _) => {
                        RelationshipLink::provisional_request(me)
                    }
                };
                let edit = OptimisticLink::apply(&mut s.roster, target, Some(next));
                Ok(PendingPoke { plan, edit })
            })
            .await
    }

    async fn finish_poke(&self, target: UserId, pending: PendingPoke) -> Result<PokeOutcome, SyncError> {
        let PendingPoke { plan, edit } = pending;
        let written = match plan {
            PokePlan::Accept { row } => self
                .backend
                .update_relationship(row, &RelationshipPatch::status(RelationshipStatus::Accepted))
                .await
                .map(|row| (row, PokeOutcome::Accepted)),
            PokePlan::Recreate { stale } => match self.delete_row(stale).await {
                Ok(()) => self.insert_request(target).await,
                Err(e) => Err(e),
            },
            _ => self.insert_request(target).await,
        };

        match written {
            Ok((row, outcome)) => {
                self.session
                    .update(|s| {
                        edit.commit(&mut s.roster, Some(&row));
                    })
                    .await;
                tracing::info!(target_id = %target, row_id = %row.id, ?outcome, "Poke confirmed");
                Ok(outcome)
            }
            Err(e) => {
                self.session.update(|s| edit.rollback(&mut s.roster)).await;
                tracing::debug!(target_id = %target, error = %e, "Poke rolled back");
                Err(e.into())
            }
        }
    }

    async fn insert_request(&self, target: UserId) -> Result<(RelationshipRow, PokeOutcome), BackendError> {
        self.backend
            .insert_relationship(&NewRelationship::request(self.me(), target))
            .await
            .map(|row| (row, PokeOutcome::Requested))
    }

    // -----------------------------------------------------------------------
    // Cancel, decline, mute
    // -----------------------------------------------------------------------

    /// Delete the relationship row with `target`.
    ///
    /// The row id leaves the counterpart cache before the delete is sent, so
    /// the echo of this delete is not mistaken for a remote cancellation.
    pub async fn cancel(&self, target: UserId) -> Result<(), SyncError> {
        self.ensure_other(target)?;

        let staged = self
            .session
            .update(|s| {
                let link = s.roster.relationship_with(&target).cloned()?;
                let row = link.row;
                if let RowRef::Stored(id) = row {
                    s.roster.forget_row(&id);
                }
                Some((row, OptimisticLink::apply(&mut s.roster, target, None)))
            })
            .await;

        let Some((row, edit)) = staged else {
            return Ok(());
        };
        let RowRef::Stored(id) = row else {
            self.session.update(|s| edit.rollback(&mut s.roster)).await;
            return Err(SyncError::StaleReference(
                "relationship insert still in flight".into(),
            ));
        };

        match self.delete_row(id).await {
            Ok(()) => {
                drop(edit);
                tracing::info!(target_id = %target, row_id = %id, "Relationship cancelled");
                Ok(())
            }
            Err(e) => {
                self.session.update(|s| edit.rollback(&mut s.roster)).await;
                Err(e.into())
            }
        }
    }

    /// Decline an incoming pending request.
    pub async fn decline(&self, target: UserId) -> Result<(), SyncError> {
        self.ensure_other(target)?;
        let me = self.me();

        let staged = self
            .session
            .update(|s| {
                let link = s.roster.relationship_with(&target).cloned().ok_or_else(|| {
                    CoreError::NotFound {
                        entity: "relationship",
                        id: target.to_string(),
                    }
                })?;
                if link.direction(me) != Direction::Incoming {
                    return Err(CoreError::Validation(
                        "only the receiver can decline a request".into(),
                    ));
                }
                link.status.transition(RelationshipStatus::Declined)?;
                let row = stored(&link)?;
                let next = link.with_status(RelationshipStatus::Declined);
                Ok((row, OptimisticLink::apply(&mut s.roster, target, Some(next))))
            })
            .await;
        let (row, edit) = staged?;

        let patch = RelationshipPatch::status(RelationshipStatus::Declined);
        self.write_patch(target, row, &patch, edit).await
    }

    /// Mute `target` until `until` (`None` unmutes).
    ///
    /// The mute is evaluated against the wall clock whenever it is read;
    /// nothing flips it back when it expires.
    pub async fn mute(&self, target: UserId, until: Option<Timestamp>) -> Result<(), SyncError> {
        self.ensure_other(target)?;
        let me = self.me();

        let staged = self
            .session
            .update(|s| {
                let link = s.roster.relationship_with(&target).cloned().ok_or_else(|| {
                    CoreError::NotFound {
                        entity: "relationship",
                        id: target.to_string(),
                    }
                })?;
                let row = stored(&link)?;
                let patch = RelationshipPatch::mute(&link, me, until);
                let next = RelationshipLink {
                    muted_until: until,
                    ..link
                };
                Ok::<_, CoreError>((row, patch, OptimisticLink::apply(&mut s.roster, target, Some(next))))
            })
            .await;
        let (row, patch, edit) = staged?;

        self.write_patch(target, row, &patch, edit).await
    }

    async fn write_patch(
        &self,
        target: UserId,
        row: RowId,
        patch: &RelationshipPatch,
        edit: OptimisticLink,
    ) -> Result<(), SyncError> {
        match self.backend.update_relationship(row, patch).await {
            Ok(updated) => {
                drop(edit);
                tracing::info!(target_id = %target, row_id = %updated.id, status = %updated.status, "Relationship updated");
                Ok(())
            }
            Err(e) => {
                self.session.update(|s| edit.rollback(&mut s.roster)).await;
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Block
    // -----------------------------------------------------------------------

    /// Block `target`, then delete any relationship row between the pair.
    ///
    /// A duplicate block is reported as [`BlockOutcome::AlreadyBlocked`].
    pub async fn block(&self, target: UserId) -> Result<BlockOutcome, SyncError> {
        self.ensure_other(target)?;

        let outcome = match self.backend.insert_block(self.me(), target).await {
            Ok(row) => {
                self.session
                    .update(|s| s.roster.apply_block_event(&RowChange::Insert(row)))
                    .await;
                BlockOutcome::Blocked
            }
            Err(BackendError::Conflict(_)) => {
                let applied = self.session.update(|s| s.roster.mark_blocked(target)).await;
                tracing::debug!(target_id = %target, ?applied, "Block already on record");
                BlockOutcome::AlreadyBlocked
            }
            Err(e) => return Err(e.into()),
        };

        let stale = self
            .session
            .update(|s| {
                let id = s.roster.relationship_with(&target)?.row.stored_id()?;
                s.roster.forget_row(&id);
                s.roster.set_link(target, None);
                Some(id)
            })
            .await;
        if let Some(id) = stale {
            if let Err(e) = self.delete_row(id).await {
                tracing::warn!(target_id = %target, row_id = %id, error = %e, "Relationship row survived block");
            }
        }

        tracing::info!(target_id = %target, ?outcome, "User blocked");
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Re-derive relationship fields from a fresh read.
    pub async fn resync(&self) -> Result<(), SyncError> {
        let tickets = self.session.read(|s| s.begin_snapshot()).await;
        let rows = self.backend.fetch_relationships(self.me()).await?;
        self.session
            .update(|s| {
                s.roster
                    .apply_relationship_snapshot(tickets.roster, rows.iter().cloned());
                s.aggregator.replace_relationships(tickets.badges, rows);
            })
            .await;
        Ok(())
    }

    /// Delete a row, treating an already-missing row as deleted.
    async fn delete_row(&self, id: RowId) -> Result<(), BackendError> {
        match self.backend.delete_relationship(id).await {
            Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn ensure_other(&self, target: UserId) -> Result<(), SyncError> {
        if target == self.me() {
            return Err(CoreError::Validation("cannot target yourself".into()).into());
        }
        Ok(())
    }
}

fn stored(link: &RelationshipLink) -> Result<RowId, CoreError> {
    link.row
        .stored_id()
        .ok_or_else(|| CoreError::Conflict("relationship insert still in flight".into()))
}
