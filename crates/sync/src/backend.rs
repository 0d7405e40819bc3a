//! Collaborator interfaces consumed by the engine.
//!
//! The engine never talks to a transport directly. The authentication and
//! profile collaborator, the storage/realtime collaborator and the device
//! location API are all reached through the traits below, so the same
//! engine runs against a real backend or [`crate::memory::MemoryBackend`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nearby_core::blocking::BlockRow;
use nearby_core::feed::Table;
use nearby_core::geo::Coordinates;
use nearby_core::notifications::MessageRow;
use nearby_core::profile::{ProfilePatch, ProfileRow, SnapshotEntry};
use nearby_core::relationship::{NewRelationship, RelationshipPatch, RelationshipRow};
use nearby_core::types::{RowId, Timestamp, UserId};
use nearby_events::FeedSubscription;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure reported by a backend collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The request did not complete (connection, timeout, 5xx).
    #[error("Network error: {0}")]
    Network(String),

    /// A uniqueness constraint rejected an insert.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The referenced row no longer exists.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend refused the write (policy or validation).
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Failure reported by the device location API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Timed out waiting for a location fix")]
    Timeout,

    #[error("Location unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Backend collaborators
// ---------------------------------------------------------------------------

/// Authentication and profile collaborator.
#[async_trait]
pub trait ProfileBackend: Send + Sync {
    /// Identifier of the authenticated user.
    async fn current_user(&self) -> Result<UserId, BackendError>;

    async fn read_profile(&self, id: UserId) -> Result<ProfileRow, BackendError>;

    /// Apply a field-level patch and return the updated row.
    async fn patch_profile(&self, id: UserId, patch: &ProfilePatch) -> Result<ProfileRow, BackendError>;
}

/// Filtered reads and the realtime change feed.
#[async_trait]
pub trait PresenceBackend: Send + Sync {
    /// Profiles matching the visibility predicates, excluding `me`.
    async fn fetch_visible_profiles(&self, me: UserId) -> Result<Vec<SnapshotEntry>, BackendError>;

    /// Users `me` has blocked.
    async fn fetch_blocked_by_me(&self, me: UserId) -> Result<Vec<UserId>, BackendError>;

    /// Users who have blocked `me`.
    async fn fetch_blocking_me(&self, me: UserId) -> Result<Vec<UserId>, BackendError>;

    /// Every relationship row where `me` is a party.
    async fn fetch_relationships(&self, me: UserId) -> Result<Vec<RelationshipRow>, BackendError>;

    /// Messages addressed to `me`.
    async fn fetch_inbox(&self, me: UserId) -> Result<Vec<MessageRow>, BackendError>;

    /// Open a change-feed subscription that ends when `cancel` fires.
    fn subscribe(&self, tables: &[Table], cancel: CancellationToken) -> FeedSubscription;
}

/// Writes on relationship and block-list rows.
#[async_trait]
pub trait RelationshipBackend: Send + Sync {
    async fn insert_relationship(&self, row: &NewRelationship) -> Result<RelationshipRow, BackendError>;

    async fn update_relationship(
        &self,
        id: RowId,
        patch: &RelationshipPatch,
    ) -> Result<RelationshipRow, BackendError>;

    async fn delete_relationship(&self, id: RowId) -> Result<(), BackendError>;

    /// Insert a block. A duplicate pair yields [`BackendError::Conflict`].
    async fn insert_block(&self, blocker: UserId, blocked: UserId) -> Result<BlockRow, BackendError>;
}

/// Everything the engine needs from the backend.
pub trait Backend: ProfileBackend + PresenceBackend + RelationshipBackend {}

impl<T> Backend for T where T: ProfileBackend + PresenceBackend + RelationshipBackend + ?Sized {}

// ---------------------------------------------------------------------------
// Device location
// ---------------------------------------------------------------------------

/// One position callback from the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub position: Coordinates,
    pub at: Timestamp,
}

impl Fix {
    pub fn now(position: Coordinates) -> Self {
        Self {
            position,
            at: Utc::now(),
        }
    }
}

/// Device geolocation API.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// One-shot high-accuracy fix.
    async fn current_position(&self, timeout: Duration) -> Result<Fix, LocationError>;

    /// Start a continuous watch. Dropping the receiver stops it.
    async fn watch(&self) -> Result<mpsc::Receiver<Result<Fix, LocationError>>, LocationError>;
}
