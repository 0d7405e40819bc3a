//! Location tracking state machine, write throttle, and the self marker.
//!
//! Everything here is synchronous and clock-injected so the async tracker in
//! `nearby-sync` can drive it from device callbacks while tests drive it with
//! fabricated instants.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::profile::ProfileRow;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Minimum gap between two remote position writes from the continuous watch.
pub const DEFAULT_WRITE_THROTTLE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Coordinates
// ---------------------------------------------------------------------------

/// A WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    /// Build a position, rejecting non-finite or out-of-range values.
    pub fn new(lat: f64, lng: f64) -> Result<Self, CoreError> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(CoreError::Validation(format!(
                "Coordinates must be finite, got ({lat}, {lng})"
            )));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoreError::Validation(format!(
                "Latitude must be within -90..=90, got {lat}"
            )));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(CoreError::Validation(format!(
                "Longitude must be within -180..=180, got {lng}"
            )));
        }
        Ok(Self { lat, lng })
    }

    /// Build a position from two nullable columns. Both must be present.
    pub fn from_columns(lat: Option<f64>, lng: Option<f64>) -> Option<Self> {
        match (lat, lng) {
            (Some(lat), Some(lng)) => Self::new(lat, lng).ok(),
            _ => None,
        }
    }

    /// Planar distance in degrees. Only meaningful for nearby points.
    pub fn degree_distance(&self, other: &Coordinates) -> f64 {
        (self.lat - other.lat).hypot(self.lng - other.lng)
    }
}

// ---------------------------------------------------------------------------
// Tracking state machine
// ---------------------------------------------------------------------------

/// Device tracking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    /// Initial state, and terminal when the user declines permission.
    #[default]
    Disabled,
    /// The device API was called and the first fix is pending.
    Acquiring,
    /// A fix was obtained and the continuous watch is running.
    Active,
}

/// Inputs that drive [`TrackingState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingEvent {
    EnableRequested,
    FixObtained,
    PermissionDenied,
    Failed,
    DisableRequested,
}

impl TrackingState {
    /// Total transition function. Events that do not apply in the current
    /// state leave it unchanged (e.g. a late fix after `disable()`).
    pub fn next(self, event: TrackingEvent) -> TrackingState {
        use TrackingEvent::*;
        use TrackingState::*;

        match (self, event) {
            (_, DisableRequested) => Disabled,
            (Disabled, EnableRequested) => Acquiring,
            (Acquiring, FixObtained) => Active,
            (Acquiring, PermissionDenied | Failed) => Disabled,
            // A revoked permission ends the watch; transient watch errors do not.
            (Active, PermissionDenied) => Disabled,
            (state, _) => state,
        }
    }

    pub fn is_tracking(self) -> bool {
        matches!(self, TrackingState::Acquiring | TrackingState::Active)
    }
}

impl std::fmt::Display for TrackingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrackingState::Disabled => "disabled",
            TrackingState::Acquiring => "acquiring",
            TrackingState::Active => "active",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Write throttle
// ---------------------------------------------------------------------------

/// Gate for remote position writes.
///
/// Local cache updates are never throttled; only the backend write is.
#[derive(Debug, Clone)]
pub struct WriteThrottle {
    min_interval: Duration,
    last_write: Option<Instant>,
}

impl WriteThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_write: None,
        }
    }

    /// Returns `true` and records `now` if a write is allowed at `now`.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let allowed = match self.last_write {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        };
        if allowed {
            self.last_write = Some(now);
        }
        allowed
    }

    /// Record a write that bypassed the gate (the one-shot enable fix).
    pub fn mark_written(&mut self, now: Instant) {
        self.last_write = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_write = None;
    }
}

impl Default for WriteThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_THROTTLE)
    }
}

// ---------------------------------------------------------------------------
// Self marker
// ---------------------------------------------------------------------------

/// The local user's own marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelfMarker {
    pub position: Option<Coordinates>,
    pub enabled: bool,
    pub ghost: bool,
    pub loading: bool,
}

impl SelfMarker {
    pub fn begin_acquiring(&mut self) {
        self.loading = true;
    }

    /// Apply an accepted device fix.
    pub fn record_fix(&mut self, position: Coordinates) {
        self.position = Some(position);
        self.enabled = true;
        self.ghost = false;
        self.loading = false;
    }

    pub fn disable(&mut self) {
        self.position = None;
        self.enabled = false;
        self.loading = false;
    }

    /// Ghost mode hides the user and drops the position.
    pub fn set_ghost(&mut self, ghost: bool) {
        self.ghost = ghost;
        if ghost {
            self.position = None;
            self.loading = false;
        }
    }

    /// Reconcile against the authoritative backend profile.
    pub fn reconcile(&mut self, row: &ProfileRow) {
        self.enabled = row.location_enabled;
        self.ghost = row.ghost_mode;
        self.position = if row.ghost_mode || !row.location_enabled {
            None
        } else {
            Coordinates::from_columns(row.latitude, row.longitude).or(self.position)
        };
        self.loading = false;
    }

    /// Whether other users can currently see this marker.
    pub fn is_visible(&self) -> bool {
        self.enabled && !self.ghost && self.position.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
