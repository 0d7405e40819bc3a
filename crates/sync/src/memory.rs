//! In-process backend and scripted device location.
//!
//! [`MemoryBackend`] keeps every table in memory, enforces the same
//! uniqueness constraints as the hosted backend, and publishes a feed record
//! for every write (deletes carry only the primary key). Each signed-in user
//! talks to it through a [`MemorySession`]. Failures can be injected per
//! operation, and snapshot reads can be held open to reproduce slow fetches.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use nearby_core::blocking::BlockRow;
use nearby_core::feed::{FeedRecord, Table};
use nearby_core::geo::Coordinates;
use nearby_core::notifications::MessageRow;
use nearby_core::profile::{ProfilePatch, ProfileRow, SnapshotEntry, StoryFlags};
use nearby_core::relationship::{NewRelationship, RelationshipPatch, RelationshipRow};
use nearby_core::types::{RowId, UserId};
use nearby_events::{FeedBus, FeedSubscription};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{
    BackendError, Fix, LocationError, LocationProvider, PresenceBackend, ProfileBackend,
    RelationshipBackend,
};

/// Backend operations that can be counted and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CurrentUser,
    ReadProfile,
    PatchProfile,
    FetchProfiles,
    FetchBlocks,
    FetchRelationships,
    FetchInbox,
    InsertRelationship,
    UpdateRelationship,
    DeleteRelationship,
    InsertBlock,
}

#[derive(Debug, Default)]
struct Tables {
    profiles: IndexMap<UserId, ProfileRow>,
    stories: HashMap<UserId, StoryFlags>,
    relationships: IndexMap<RowId, RelationshipRow>,
    blocks: IndexMap<RowId, BlockRow>,
    messages: IndexMap<RowId, MessageRow>,
    failures: HashMap<Operation, VecDeque<BackendError>>,
    calls: HashMap<Operation, usize>,
}

impl Tables {
    /// Count the call and pop an injected failure, if any.
    fn enter(&mut self, op: Operation) -> Result<(), BackendError> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct SnapshotHoldInner {
    captured: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

/// Keeps one snapshot read open after it captured its data.
#[derive(Debug)]
pub struct SnapshotHold {
    captured: oneshot::Receiver<()>,
    release: oneshot::Sender<()>,
}

impl SnapshotHold {
    /// Wait until the held read has captured the tables.
    pub async fn captured(&mut self) {
        let _ = (&mut self.captured).await;
    }

    /// Let the held read return its (by now stale) result.
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

struct Shared {
    tables: Mutex<Tables>,
    bus: FeedBus,
    hold: Mutex<Option<SnapshotHoldInner>>,
}

/// Shared in-memory backend. Cheap to clone.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_capacity(nearby_events::bus::DEFAULT_CAPACITY)
    }

    /// Backend whose feed buffers at most `capacity` records per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                bus: FeedBus::new(capacity),
                hold: Mutex::new(None),
            }),
        }
    }

    /// A collaborator handle authenticated as `user`.
    pub fn session(&self, user: UserId) -> MemorySession {
        MemorySession {
            user,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn bus(&self) -> &FeedBus {
        &self.shared.bus
    }

    // -----------------------------------------------------------------------
    // Seeding and inspection
    // -----------------------------------------------------------------------

    /// Insert or replace a profile row, publishing the change.
    pub async fn upsert_profile(&self, row: ProfileRow) -> Result<(), BackendError> {
        let mut tables = self.shared.tables.lock().await;
        let record = match tables.profiles.insert(row.id, row.clone()) {
            Some(old) => FeedRecord::update(Table::Profiles, Some(&old), &row),
            None => FeedRecord::insert(Table::Profiles, &row),
        };
        self.publish(record)
    }

    pub async fn remove_profile(&self, id: UserId) {
        let mut tables = self.shared.tables.lock().await;
        if tables.profiles.shift_remove(&id).is_some() {
            self.shared.bus.publish(FeedRecord::delete_key(Table::Profiles, id));
        }
    }

    pub async fn profile(&self, id: UserId) -> Option<ProfileRow> {
        self.shared.tables.lock().await.profiles.get(&id).cloned()
    }

    /// Story flags returned with the next snapshot reads.
    pub async fn set_stories(&self, user: UserId, flags: StoryFlags) {
        self.shared.tables.lock().await.stories.insert(user, flags);
    }

    /// Deliver a message from `sender` to `receiver`.
    pub async fn send_message(&self, sender: UserId, receiver: UserId) -> Result<MessageRow, BackendError> {
        let row = MessageRow {
            id: Uuid::new_v4(),
            sender_id: sender,
            receiver_id: receiver,
            read: false,
            is_system: false,
            deleted_for: Vec::new(),
            created_at: Some(Utc::now()),
        };
        let mut tables = self.shared.tables.lock().await;
        tables.messages.insert(row.id, row.clone());
        self.publish(FeedRecord::insert(Table::Messages, &row))?;
        Ok(row)
    }

    pub async fn mark_read(&self, message: RowId) -> Result<(), BackendError> {
        let mut tables = self.shared.tables.lock().await;
        let row = tables
            .messages
            .get_mut(&message)
            .ok_or_else(|| BackendError::NotFound(format!("message {message}")))?;
        let old = row.clone();
        row.read = true;
        let new = row.clone();
        self.publish(FeedRecord::update(Table::Messages, Some(&old), &new))
    }

    pub async fn relationships(&self) -> Vec<RelationshipRow> {
        self.shared
            .tables
            .lock()
            .await
            .relationships
            .values()
            .cloned()
            .collect()
    }

    pub async fn relationship_between(&self, a: UserId, b: UserId) -> Option<RelationshipRow> {
        self.shared
            .tables
            .lock()
            .await
            .relationships
            .values()
            .find(|row| row.connects(a, b))
            .cloned()
    }

    pub async fn blocks(&self) -> Vec<BlockRow> {
        self.shared.tables.lock().await.blocks.values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Failure injection
    // -----------------------------------------------------------------------

    /// Make the next call of `op` fail with `err`.
    pub async fn fail_next(&self, op: Operation, err: BackendError) {
        self.shared
            .tables
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// How many times `op` has been called.
    pub async fn calls(&self, op: Operation) -> usize {
        self.shared
            .tables
            .lock()
            .await
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Hold the next visible-profiles read open after it captured its data.
    pub async fn hold_next_snapshot(&self) -> SnapshotHold {
        let (captured_tx, captured_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.shared.hold.lock().await = Some(SnapshotHoldInner {
            captured: captured_tx,
            release: release_rx,
        });
        SnapshotHold {
            captured: captured_rx,
            release: release_tx,
        }
    }

    fn publish(&self, record: Result<FeedRecord, nearby_core::CoreError>) -> Result<(), BackendError> {
        let record = record.map_err(|e| BackendError::Rejected(e.to_string()))?;
        self.shared.bus.publish(record);
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// [`MemoryBackend`] as seen by one signed-in user.
#[derive(Clone)]
pub struct MemorySession {
    user: UserId,
    shared: Arc<Shared>,
}

impl MemorySession {
    pub fn user(&self) -> UserId {
        self.user
    }

    fn backend(&self) -> MemoryBackend {
        MemoryBackend {
            shared: Arc::clone(&self.shared),
        }
    }

    fn require_self(&self, id: UserId, action: &str) -> Result<(), BackendError> {
        if id == self.user {
            Ok(())
        } else {
            Err(BackendError::Rejected(format!("{action} on behalf of another user")))
        }
    }
}

#[async_trait]
impl ProfileBackend for MemorySession {
    async fn current_user(&self) -> Result<UserId, BackendError> {
        self.shared.tables.lock().await.enter(Operation::CurrentUser)?;
        Ok(self.user)
    }

    async fn read_profile(&self, id: UserId) -> Result<ProfileRow, BackendError> {
        let mut tables = self.shared.tables.lock().await;
        tables.enter(Operation::ReadProfile)?;
        tables
            .profiles
            .get(&id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("profile {id}")))
    }

    async fn patch_profile(&self, id: UserId, patch: &ProfilePatch) -> Result<ProfileRow, BackendError> {
        let mut tables = self.shared.tables.lock().await;
        tables.enter(Operation::PatchProfile)?;
        self.require_self(id, "profile patch")?;

        let row = tables
            .profiles
            .entry(id)
            .or_insert_with(|| ProfileRow::new(id));
        let old = row.clone();
        row.apply_patch(patch);
        let new = row.clone();
        self.backend()
            .publish(FeedRecord::update(Table::Profiles, Some(&old), &new))?;
        Ok(new)
    }
}

#[async_trait]
impl PresenceBackend for MemorySession {
    async fn fetch_visible_profiles(&self, me: UserId) -> Result<Vec<SnapshotEntry>, BackendError> {
        let entries = {
            let mut tables = self.shared.tables.lock().await;
            tables.enter(Operation::FetchProfiles)?;
            tables
                .profiles
                .values()
                .filter(|row| row.id != me && row.visible_position().is_some())
                .map(|row| SnapshotEntry {
                    profile: row.clone(),
                    stories: tables.stories.get(&row.id).copied(),
                })
                .collect::<Vec<_>>()
        };

        let hold = self.shared.hold.lock().await.take();
        if let Some(hold) = hold {
            let _ = hold.captured.send(());
            let _ = hold.release.await;
        }
        Ok(entries)
    }

    async fn fetch_blocked_by_me(&self, me: UserId) -> Result<Vec<UserId>, BackendError> {
        let mut tables = self.shared.tables.lock().await;
        tables.enter(Operation::FetchBlocks)?;
        Ok(tables
            .blocks
            .values()
            .filter(|b| b.blocker_id == me)
            .map(|b| b.blocked_id)
            .collect())
    }

    async fn fetch_blocking_me(&self, me: UserId) -> Result<Vec<UserId>, BackendError> {
        let mut tables = self.shared.tables.lock().await;
        tables.enter(Operation::FetchBlocks)?;
        Ok(tables
            .blocks
            .values()
            .filter(|b| b.blocked_id == me)
            .map(|b| b.blocker_id)
            .collect())
    }

    async fn fetch_relationships(&self, me: UserId) -> Result<Vec<RelationshipRow>, BackendError> {
        let mut tables = self.shared.tables.lock().await;
        tables.enter(Operation::FetchRelationships)?;
        Ok(tables
            .relationships
            .values()
            .filter(|r| r.involves(me))
            .cloned()
            .collect())
    }

    async fn fetch_inbox(&self, me: UserId) -> Result<Vec<MessageRow>, BackendError> {
        let mut tables = self.shared.tables.lock().await;
        tables.enter(Operation::FetchInbox)?;
        Ok(tables
            .messages
            .values()
            .filter(|m| m.receiver_id == me)
            .cloned()
            .collect())
    }

    fn subscribe(&self, tables: &[Table], cancel: CancellationToken) -> FeedSubscription {
        self.shared.bus.subscribe_with(tables, cancel)
    }
}

#[async_trait]
impl RelationshipBackend for MemorySession {
    async fn insert_relationship(&self, new: &NewRelationship) -> Result<RelationshipRow, BackendError> {
        let mut tables = self.shared.tables.lock().await;
        tables.enter(Operation::InsertRelationship)?;
        self.require_self(new.requester_id, "relationship insert")?;
        if new.requester_id == new.receiver_id {
            return Err(BackendError::Rejected("relationship with self".into()));
        }
        if tables
            .relationships
            .values()
            .any(|r| r.connects(new.requester_id, new.receiver_id))
        {
            return Err(BackendError::Conflict(
                "relationship already exists for this pair".into(),
            ));
        }

        let row = RelationshipRow {
            id: Uuid::new_v4(),
            requester_id: new.requester_id,
            receiver_id: new.receiver_id,
            status: new.status,
            requester_muted_until: None,
            receiver_muted_until: None,
            created_at: Some(Utc::now()),
        };
        tables.relationships.insert(row.id, row.clone());
        self.backend()
            .publish(FeedRecord::insert(Table::Relationships, &row))?;
        Ok(row)
    }

    async fn update_relationship(
        &self,
        id: RowId,
        patch: &RelationshipPatch,
    ) -> Result<RelationshipRow, BackendError> {
        let mut tables = self.shared.tables.lock().await;
        tables.enter(Operation::UpdateRelationship)?;
        let row = tables
            .relationships
            .get_mut(&id)
            .ok_or_else(|| BackendError::NotFound(format!("relationship {id}")))?;
        if !row.involves(self.user) {
            return Err(BackendError::Rejected("not a party to this relationship".into()));
        }
        if let Some(status) = patch.status {
            row.status
                .transition(status)
                .map_err(|e| BackendError::Rejected(e.to_string()))?;
        }

        let old = row.clone();
        row.apply_patch(patch);
        let new = row.clone();
        self.backend()
            .publish(FeedRecord::update(Table::Relationships, Some(&old), &new))?;
        Ok(new)
    }

    async fn delete_relationship(&self, id: RowId) -> Result<(), BackendError> {
        let mut tables = self.shared.tables.lock().await;
        tables.enter(Operation::DeleteRelationship)?;
        let involved = tables
            .relationships
            .get(&id)
            .map(|row| row.involves(self.user))
            .ok_or_else(|| BackendError::NotFound(format!("relationship {id}")))?;
        if !involved {
            return Err(BackendError::Rejected("not a party to this relationship".into()));
        }
        tables.relationships.shift_remove(&id);
        self.shared
            .bus
            .publish(FeedRecord::delete_key(Table::Relationships, id));
        Ok(())
    }

    async fn insert_block(&self, blocker: UserId, blocked: UserId) -> Result<BlockRow, BackendError> {
        let mut tables = self.shared.tables.lock().await;
        tables.enter(Operation::InsertBlock)?;
        self.require_self(blocker, "block insert")?;
        if tables
            .blocks
            .values()
            .any(|b| b.blocker_id == blocker && b.blocked_id == blocked)
        {
            return Err(BackendError::Conflict("already blocked".into()));
        }

        let row = BlockRow {
            id: Uuid::new_v4(),
            blocker_id: blocker,
            blocked_id: blocked,
            created_at: Some(Utc::now()),
        };
        tables.blocks.insert(row.id, row.clone());
        self.backend().publish(FeedRecord::insert(Table::Blocks, &row))?;
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// Scripted location
// ---------------------------------------------------------------------------

const WATCH_BUFFER: usize = 64;

#[derive(Debug, Default)]
struct Script {
    position: Option<Coordinates>,
    one_shots: VecDeque<Result<Fix, LocationError>>,
    watcher: Option<mpsc::Sender<Result<Fix, LocationError>>>,
    watch_error: Option<LocationError>,
}

/// Device location driven by the caller.
#[derive(Debug, Default)]
pub struct ScriptedLocation {
    script: Mutex<Script>,
}

impl ScriptedLocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device whose one-shot fixes report `position`.
    pub fn at(position: Coordinates) -> Self {
        Self {
            script: Mutex::new(Script {
                position: Some(position),
                ..Script::default()
            }),
        }
    }

    pub async fn set_position(&self, position: Coordinates) {
        self.script.lock().await.position = Some(position);
    }

    /// Answer the next one-shot request with `result`.
    pub async fn queue_one_shot(&self, result: Result<Fix, LocationError>) {
        self.script.lock().await.one_shots.push_back(result);
    }

    /// Refuse the next one-shot request.
    pub async fn deny_next(&self) {
        self.queue_one_shot(Err(LocationError::PermissionDenied)).await;
    }

    /// Make the next `watch` call fail.
    pub async fn fail_next_watch(&self, err: LocationError) {
        self.script.lock().await.watch_error = Some(err);
    }

    /// Deliver a callback to the running watch. Returns `false` when no
    /// watch is listening.
    pub async fn push(&self, update: Result<Fix, LocationError>) -> bool {
        let script = self.script.lock().await;
        match &script.watcher {
            Some(watcher) => watcher.try_send(update).is_ok(),
            None => false,
        }
    }

    pub async fn push_fix(&self, position: Coordinates) -> bool {
        self.push(Ok(Fix::now(position))).await
    }

    /// Whether a watch is currently running.
    pub async fn is_watching(&self) -> bool {
        self.script
            .lock()
            .await
            .watcher
            .as_ref()
            .is_some_and(|w| !w.is_closed())
    }
}

#[async_trait]
impl LocationProvider for ScriptedLocation {
    async fn current_position(&self, _timeout: Duration) -> Result<Fix, LocationError> {
        let mut script = self.script.lock().await;
        if let Some(result) = script.one_shots.pop_front() {
            return result;
        }
        script
            .position
            .map(Fix::now)
            .ok_or_else(|| LocationError::Unavailable("no scripted position".into()))
    }

    async fn watch(&self) -> Result<mpsc::Receiver<Result<Fix, LocationError>>, LocationError> {
        let mut script = self.script.lock().await;
        if let Some(err) = script.watch_error.take() {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        script.watcher = Some(tx);
        Ok(rx)
    }
}
