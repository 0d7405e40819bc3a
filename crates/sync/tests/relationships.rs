//! Integration tests for the friendship (poke) flow.
//!
//! Each test drives one or two engines against a shared in-memory backend,
//! so the change feed echoes every write back just like the hosted backend.

#[macro_use]
mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use common::{at, quiet_config, visible_profile, Client};
use nearby_core::error::CoreError;
use nearby_core::relationship::{NewRelationship, RelationshipStatus, RowRef};
use nearby_core::types::UserId;
use nearby_sync::backend::{BackendError, RelationshipBackend};
use nearby_sync::memory::{MemoryBackend, Operation};
use nearby_sync::relationships::{BlockOutcome, PokeOutcome};
use nearby_sync::{NoticeKind, SyncError};
use uuid::Uuid;

async fn pair() -> (MemoryBackend, UserId, UserId) {
    common::init_tracing();
    let backend = MemoryBackend::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    backend
        .upsert_profile(visible_profile(a, "alice", at(52.3700, 4.8900)))
        .await
        .unwrap();
    backend
        .upsert_profile(visible_profile(b, "bob", at(52.3710, 4.8910)))
        .await
        .unwrap();
    (backend, a, b)
}

async fn status_seen_by(client: &Client, other: UserId) -> Option<RelationshipStatus> {
    client.engine.relationship_with(other).await.map(|l| l.status)
}

// ---------------------------------------------------------------------------
// Test: poke then cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poke_then_cancel_leaves_no_relationship_row() {
    let (backend, a, b) = pair().await;
    let alice = Client::start(&backend, a, quiet_config()).await;

    assert_eq!(alice.engine.poke(b).await.unwrap(), PokeOutcome::Requested);
    let link = alice.engine.relationship_with(b).await.unwrap();
    assert_eq!(link.status, RelationshipStatus::Pending);
    assert_matches!(link.row, RowRef::Stored(_));
    assert_eq!(backend.relationships().await.len(), 1);

    alice.engine.cancel(b).await.unwrap();
    assert!(backend.relationships().await.is_empty());
    assert!(alice.engine.relationship_with(b).await.is_none());

    // Late echoes of the insert and the delete settle on "none".
    tokio::time::sleep(Duration::from_millis(50)).await;
    eventually!(alice.engine.relationship_with(b).await.is_none());
}

#[tokio::test]
async fn poking_twice_is_already_requested() {
    let (backend, a, b) = pair().await;
    let alice = Client::start(&backend, a, quiet_config()).await;

    alice.engine.poke(b).await.unwrap();
    assert_eq!(
        alice.engine.poke(b).await.unwrap(),
        PokeOutcome::AlreadyRequested
    );
    assert_eq!(backend.relationships().await.len(), 1);
}

#[tokio::test]
async fn poking_yourself_is_rejected() {
    let (backend, a, _) = pair().await;
    let alice = Client::start(&backend, a, quiet_config()).await;

    let err = alice.engine.poke(a).await.unwrap_err();
    assert_matches!(err, SyncError::Core(CoreError::Validation(_)));
}

// ---------------------------------------------------------------------------
// Test: poke back accepts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn receiver_poke_accepts_without_second_row() {
    let (backend, a, b) = pair().await;
    let alice = Client::start(&backend, a, quiet_config()).await;

    backend
        .session(b)
        .insert_relationship(&NewRelationship::request(b, a))
        .await
        .unwrap();
    eventually!(status_seen_by(&alice, b).await == Some(RelationshipStatus::Pending));

    assert_eq!(alice.engine.poke(b).await.unwrap(), PokeOutcome::Accepted);

    let rows = backend.relationships().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, RelationshipStatus::Accepted);
    assert_eq!(rows[0].requester_id, b);
    assert_eq!(status_seen_by(&alice, b).await, Some(RelationshipStatus::Accepted));
}

#[tokio::test]
async fn a_pokes_b_then_b_pokes_back_both_see_accepted() {
    let (backend, a, b) = pair().await;
    let alice = Client::start(&backend, a, quiet_config()).await;
    let bob = Client::start(&backend, b, quiet_config()).await;

    assert_eq!(alice.engine.poke(b).await.unwrap(), PokeOutcome::Requested);
    eventually!(status_seen_by(&bob, a).await == Some(RelationshipStatus::Pending));

    assert_eq!(bob.engine.poke(a).await.unwrap(), PokeOutcome::Accepted);

    eventually!(status_seen_by(&alice, b).await == Some(RelationshipStatus::Accepted));
    assert_eq!(status_seen_by(&bob, a).await, Some(RelationshipStatus::Accepted));

    let alice_view = alice.engine.roster().await;
    let bob_view = bob.engine.roster().await;
    assert_eq!(
        alice_view[&b].relationship.as_ref().map(|l| l.status),
        Some(RelationshipStatus::Accepted)
    );
    assert_eq!(
        bob_view[&a].relationship.as_ref().map(|l| l.status),
        Some(RelationshipStatus::Accepted)
    );
    assert_eq!(backend.relationships().await.len(), 1);

    assert_eq!(
        alice.engine.poke(b).await.unwrap(),
        PokeOutcome::AlreadyFriends
    );
}

#[tokio::test]
async fn simultaneous_pokes_converge_on_one_accepted_row() {
    let (backend, a, b) = pair().await;
    let alice = Client::start(&backend, a, quiet_config()).await;

    // Bob's request may or may not have reached Alice's roster yet; either
    // way her poke ends up accepting it.
    backend
        .session(b)
        .insert_relationship(&NewRelationship::request(b, a))
        .await
        .unwrap();
    assert_eq!(alice.engine.poke(b).await.unwrap(), PokeOutcome::Accepted);

    let rows = backend.relationships().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, RelationshipStatus::Accepted);
}

// ---------------------------------------------------------------------------
// Test: rollback on failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_poke_rolls_back_and_notifies() {
    let (backend, a, b) = pair().await;
    let alice = Client::start(&backend, a, quiet_config()).await;
    let mut notices = alice.engine.notices();

    backend
        .fail_next(
            Operation::InsertRelationship,
            BackendError::Network("connection reset".into()),
        )
        .await;

    let err = alice.engine.poke(b).await.unwrap_err();
    assert_matches!(err, SyncError::Transient(_));
    assert!(alice.engine.relationship_with(b).await.is_none());
    assert!(backend.relationships().await.is_empty());

    let notice = notices.recv().await.unwrap();
    assert_eq!(notice.kind, NoticeKind::Transient);
}

#[tokio::test]
async fn stale_accept_restores_prior_link_verbatim() {
    let (backend, a, b) = pair().await;
    let alice = Client::start(&backend, a, quiet_config()).await;

    backend
        .session(b)
        .insert_relationship(&NewRelationship::request(b, a))
        .await
        .unwrap();
    eventually!(status_seen_by(&alice, b).await == Some(RelationshipStatus::Pending));
    let before = alice.engine.relationship_with(b).await.unwrap();

    backend
        .fail_next(
            Operation::UpdateRelationship,
            BackendError::NotFound("relationship".into()),
        )
        .await;
    let err = alice.engine.poke(b).await.unwrap_err();
    assert_matches!(err, SyncError::StaleReference(_));
    assert_eq!(alice.engine.relationship_with(b).await, Some(before));
}

#[tokio::test]
async fn failed_cancel_restores_pending_link() {
    let (backend, a, b) = pair().await;
    let alice = Client::start(&backend, a, quiet_config()).await;
    alice.engine.poke(b).await.unwrap();
    eventually!(alice
        .engine
        .relationship_with(b)
        .await
        .is_some_and(|l| matches!(l.row, RowRef::Stored(_))));

    backend
        .fail_next(
            Operation::DeleteRelationship,
            BackendError::Network("timeout".into()),
        )
        .await;
    assert_matches!(alice.engine.cancel(b).await, Err(SyncError::Transient(_)));
    assert_eq!(status_seen_by(&alice, b).await, Some(RelationshipStatus::Pending));
    assert_eq!(backend.relationships().await.len(), 1);
}

// ---------------------------------------------------------------------------
// Test: decline and re-request
// ---------------------------------------------------------------------------

#[tokio::test]
async fn declined_request_is_recreated_by_a_fresh_poke() {
    let (backend, a, b) = pair().await;
    let alice = Client::start(&backend, a, quiet_config()).await;

    backend
        .session(b)
        .insert_relationship(&NewRelationship::request(b, a))
        .await
        .unwrap();
    eventually!(status_seen_by(&alice, b).await == Some(RelationshipStatus::Pending));

    alice.engine.decline(b).await.unwrap();
    assert_eq!(status_seen_by(&alice, b).await, Some(RelationshipStatus::Declined));
    assert_eq!(
        backend.relationship_between(a, b).await.map(|r| r.status),
        Some(RelationshipStatus::Declined)
    );

    assert_eq!(alice.engine.poke(b).await.unwrap(), PokeOutcome::Requested);
    let rows = backend.relationships().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].requester_id, a);
    assert_eq!(rows[0].status, RelationshipStatus::Pending);
}

#[tokio::test]
async fn requester_cannot_decline_own_request() {
    let (backend, a, b) = pair().await;
    let alice = Client::start(&backend, a, quiet_config()).await;
    alice.engine.poke(b).await.unwrap();

    let err = alice.engine.decline(b).await.unwrap_err();
    assert_matches!(err, SyncError::Core(CoreError::Validation(_)));
    assert_eq!(status_seen_by(&alice, b).await, Some(RelationshipStatus::Pending));
}

// ---------------------------------------------------------------------------
// Test: mute
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mute_is_evaluated_at_read_time() {
    let (backend, a, b) = pair().await;
    let alice = Client::start(&backend, a, quiet_config()).await;
    alice.engine.poke(b).await.unwrap();

    let now = Utc::now();
    let until = now + chrono::Duration::hours(1);
    alice.engine.mute(b, Some(until)).await.unwrap();

    assert!(alice.engine.is_muted(b, now).await);
    assert!(!alice.engine.is_muted(b, now + chrono::Duration::hours(2)).await);
    assert_eq!(
        backend
            .relationship_between(a, b)
            .await
            .and_then(|r| r.requester_muted_until),
        Some(until)
    );
}

// ---------------------------------------------------------------------------
// Test: block
// ---------------------------------------------------------------------------

#[tokio::test]
async fn block_removes_entity_and_relationship_and_is_idempotent() {
    let (backend, a, b) = pair().await;
    let alice = Client::start(&backend, a, quiet_config()).await;
    alice.engine.poke(b).await.unwrap();
    assert!(alice.engine.roster().await.contains_key(&b));

    assert_eq!(alice.engine.block(b).await.unwrap(), BlockOutcome::Blocked);
    assert!(!alice.engine.roster().await.contains_key(&b));
    assert!(backend.relationships().await.is_empty());

    assert_eq!(
        alice.engine.block(b).await.unwrap(),
        BlockOutcome::AlreadyBlocked
    );
    assert_eq!(backend.blocks().await.len(), 1);

    // A later full re-fetch still hides the blocked user.
    alice.engine.poll_now().await.unwrap();
    assert!(!alice.engine.roster().await.contains_key(&b));
}
