//! Profile rows, the visibility predicate, and the roster entity.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::geo::Coordinates;
use crate::relationship::RelationshipLink;
use crate::types::{Timestamp, UserId};

/// How long an ephemeral status stays visible after it was posted.
pub const DEFAULT_STATUS_TTL_HOURS: i64 = 24;

// ---------------------------------------------------------------------------
// Wire rows
// ---------------------------------------------------------------------------

/// A row of the profiles table as returned by reads and the change feed.
///
/// Every column except `id` defaults so that key-only delete payloads decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileRow {
    pub id: UserId,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location_enabled: bool,
    pub ghost_mode: bool,
    pub last_active_at: Option<Timestamp>,
    pub status_text: Option<String>,
    pub status_updated_at: Option<Timestamp>,
}

impl ProfileRow {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// The position to render, or `None` when the profile must be hidden.
    ///
    /// Visible iff location sharing is on, ghost mode is off, and both
    /// coordinate columns are set. Block filtering is applied by the roster.
    pub fn visible_position(&self) -> Option<Coordinates> {
        if !self.location_enabled || self.ghost_mode {
            return None;
        }
        Coordinates::from_columns(self.latitude, self.longitude)
    }

    pub fn status(&self) -> Option<StatusUpdate> {
        match (&self.status_text, self.status_updated_at) {
            (Some(text), Some(posted_at)) if !text.trim().is_empty() => Some(StatusUpdate {
                text: text.clone(),
                posted_at,
            }),
            _ => None,
        }
    }

    /// Apply a field patch in place. Absent patch fields are left untouched.
    pub fn apply_patch(&mut self, patch: &ProfilePatch) {
        if let Some(lat) = patch.latitude {
            self.latitude = lat;
        }
        if let Some(lng) = patch.longitude {
            self.longitude = lng;
        }
        if let Some(enabled) = patch.location_enabled {
            self.location_enabled = enabled;
        }
        if let Some(ghost) = patch.ghost_mode {
            self.ghost_mode = ghost;
        }
        if let Some(at) = patch.last_active_at {
            self.last_active_at = Some(at);
        }
    }
}

/// Field-level patch for the local user's profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<Option<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<Option<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ghost_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<Timestamp>,
}

impl ProfilePatch {
    /// Share a fresh position and make sure the profile is visible.
    pub fn share_position(position: Coordinates, at: Timestamp) -> Self {
        Self {
            latitude: Some(Some(position.lat)),
            longitude: Some(Some(position.lng)),
            location_enabled: Some(true),
            ghost_mode: Some(false),
            last_active_at: Some(at),
        }
    }

    /// Explicit "no position" marker written when sharing stops.
    pub fn stop_sharing() -> Self {
        Self {
            latitude: Some(None),
            longitude: Some(None),
            location_enabled: Some(false),
            ..Default::default()
        }
    }

    pub fn ghost(on: bool) -> Self {
        if on {
            Self {
                latitude: Some(None),
                longitude: Some(None),
                ghost_mode: Some(true),
                ..Default::default()
            }
        } else {
            Self {
                ghost_mode: Some(false),
                ..Default::default()
            }
        }
    }
}

/// One row of a full re-fetch.
///
/// The query is deliberately narrow: story flags are optional and
/// relationship fields are never part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub profile: ProfileRow,
    #[serde(default)]
    pub stories: Option<StoryFlags>,
}

impl From<ProfileRow> for SnapshotEntry {
    fn from(profile: ProfileRow) -> Self {
        Self {
            profile,
            stories: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Roster entity
// ---------------------------------------------------------------------------

/// Ephemeral status text with its posting time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub text: String,
    pub posted_at: Timestamp,
}

impl StatusUpdate {
    pub fn is_active(&self, now: Timestamp, ttl: Duration) -> bool {
        self.posted_at + ttl > now
    }
}

/// Derived story indicator flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryFlags {
    pub has_story: bool,
    pub has_unseen_story: bool,
}

/// Another user currently rendered as nearby.
///
/// Only visible profiles become entities, so `position` is never null here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyUser {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub position: Coordinates,
    pub last_active_at: Option<Timestamp>,
    pub status: Option<StatusUpdate>,
    pub relationship: Option<RelationshipLink>,
    pub stories: StoryFlags,
}

impl NearbyUser {
    /// Build an entity from a visible profile row, carrying forward the
    /// relationship and story fields the row does not contain.
    pub fn from_profile(
        row: &ProfileRow,
        position: Coordinates,
        relationship: Option<RelationshipLink>,
        stories: StoryFlags,
    ) -> Self {
        Self {
            id: row.id,
            display_name: row.display_name.clone().unwrap_or_default(),
            avatar_url: row.avatar_url.clone(),
            position,
            last_active_at: row.last_active_at,
            status: row.status(),
            relationship,
            stories,
        }
    }

    /// Overwrite only the columns a profile row carries.
    pub fn merge_profile(&mut self, row: &ProfileRow, position: Coordinates) {
        if let Some(name) = &row.display_name {
            self.display_name = name.clone();
        }
        self.avatar_url = row.avatar_url.clone().or(self.avatar_url.take());
        self.position = position;
        self.last_active_at = row.last_active_at.or(self.last_active_at);
        self.status = row.status();
    }

    /// Status text if it has not expired at `now`.
    pub fn active_status(&self, now: Timestamp, ttl: Duration) -> Option<&str> {
        self.status
            .as_ref()
            .filter(|s| s.is_active(now, ttl))
            .map(|s| s.text.as_str())
    }
}
