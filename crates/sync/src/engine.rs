//! The engine facade exposed to the UI shell.
//!
//! [`SyncEngine::start`] resolves the signed-in user, hydrates the self
//! marker from the local cache, reconciles it with the backend, subscribes
//! to the change feed and spawns the feed pump and the poller under one
//! [`CancellationToken`]. Everything spawned for a session is torn down by
//! [`SyncEngine::stop`], by [`SyncEngine::logout`], by starting for a
//! different user, or by dropping the engine.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use indexmap::IndexMap;
use nearby_core::feed::ALL_TABLES;
use nearby_core::geo::{Coordinates, SelfMarker, TrackingState};
use nearby_core::notifications::Badges;
use nearby_core::profile::NearbyUser;
use nearby_core::relationship::RelationshipLink;
use nearby_core::spiral;
use nearby_core::types::{Timestamp, UserId};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, LocationProvider};
use crate::cache::{CachedProfile, ProfileCache};
use crate::config::SyncConfig;
use crate::error::{Notice, SyncError};
use crate::geo_tracker::{GeoTracker, TrackerSettings};
use crate::poller::{PollSummary, Poller};
use crate::pump;
use crate::relationships::{BlockOutcome, PokeOutcome, RelationshipMachine};
use crate::state::{SessionState, SharedSession};
use crate::supervisor::Supervisor;

/// A roster entity with its de-overlapped display position.
///
/// `display_position` is a presentation transform and is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedUser {
    pub user: NearbyUser,
    pub display_position: Coordinates,
}

/// Components of a running session, cloned out of the lock per call.
#[derive(Clone)]
struct Handles {
    session: SharedSession,
    tracker: GeoTracker,
    relationships: RelationshipMachine,
    poller: Poller,
}

struct Running {
    handles: Handles,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    async fn shutdown(self) {
        let me = self.handles.session.me();
        self.cancel.cancel();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::warn!(user_id = %me, error = %e, "Session task ended abnormally");
            }
        }
        tracing::info!(user_id = %me, "Sync session stopped");
    }
}

pub struct SyncEngine {
    backend: Arc<dyn Backend>,
    location: Arc<dyn LocationProvider>,
    cache: Arc<dyn ProfileCache>,
    config: SyncConfig,
    supervisor: Supervisor,
    badges: watch::Sender<Badges>,
    running: Mutex<Option<Running>>,
}

impl SyncEngine {
    pub fn new(
        backend: Arc<dyn Backend>,
        location: Arc<dyn LocationProvider>,
        cache: Arc<dyn ProfileCache>,
        config: SyncConfig,
    ) -> Self {
        let (badges, _) = watch::channel(Badges::default());
        Self {
            backend,
            location,
            cache,
            config,
            supervisor: Supervisor::default(),
            badges,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start syncing for the signed-in user. Returns their identifier.
    ///
    /// Idempotent for the same user; a different user stops the previous
    /// session first.
    pub async fn start(&self) -> Result<UserId, SyncError> {
        let me = self
            .supervisor
            .observe("start", async { Ok(self.backend.current_user().await?) })
            .await?;

        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if current.handles.session.me() == me {
                return Ok(me);
            }
        }
        if let Some(previous) = running.take() {
            tracing::info!(previous = %previous.handles.session.me(), next = %me, "Signed-in user changed");
            previous.shutdown().await;
        }

        self.badges.send_replace(Badges::default());
        let marker = self.hydrate(me).await;
        let session = SharedSession::new(SessionState::new(me, marker), self.badges.clone());
        self.reconcile(&session).await;

        let cancel = CancellationToken::new();
        let resync = Arc::new(Notify::new());
        // Subscribe before the first read so no change falls in between.
        let subscription = self.backend.subscribe(ALL_TABLES, cancel.child_token());

        let poller = Poller::new(
            session.clone(),
            Arc::clone(&self.backend),
            self.supervisor.clone(),
            Arc::clone(&resync),
        );
        self.supervisor.guard("initial_poll", poller.poll_once()).await;
        self.supervisor
            .guard("initial_badges", poller.refresh_badges())
            .await;

        let tracker = GeoTracker::new(
            session.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.location),
            Arc::clone(&self.cache),
            self.supervisor.clone(),
            TrackerSettings {
                write_throttle: self.config.location_write_throttle,
                fix_timeout: self.config.location_timeout,
            },
            cancel.clone(),
        );
        let relationships = RelationshipMachine::new(session.clone(), Arc::clone(&self.backend));

        let tasks = vec![
            tokio::spawn(pump::run(subscription, session.clone(), Arc::clone(&resync))),
            tokio::spawn(poller.clone().run(
                self.config.poll_interval,
                self.config.badge_refresh_interval,
                cancel.clone(),
            )),
        ];

        *running = Some(Running {
            handles: Handles {
                session,
                tracker,
                relationships,
                poller,
            },
            cancel,
            tasks,
        });
        tracing::info!(user_id = %me, "Sync session started");
        Ok(me)
    }

    /// Tear down the feed subscription, the poller and the location watch.
    pub async fn stop(&self) {
        let previous = self.running.lock().await.take();
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
    }

    /// Stop everything, clear the local cache and reset all state.
    pub async fn logout(&self) -> Result<(), SyncError> {
        let previous = self.running.lock().await.take();
        if let Some(previous) = previous {
            previous.handles.tracker.stop_watch().await;
            previous.shutdown().await;
        }
        self.badges.send_replace(Badges::default());
        self.supervisor
            .observe("logout", self.cache.clear())
            .await?;
        tracing::info!("Logged out, local state cleared");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    async fn hydrate(&self, me: UserId) -> SelfMarker {
        match self.supervisor.guard("hydrate_cache", self.cache.load()).await {
            Some(Some(cached)) if cached.user_id == me => {
                tracing::debug!(user_id = %me, "Self marker hydrated from cache");
                cached.marker
            }
            _ => SelfMarker::default(),
        }
    }

    async fn reconcile(&self, session: &SharedSession) {
        let me = session.me();
        let row = match self.backend.read_profile(me).await {
            Ok(row) => row,
            Err(e) => {
                // Keep the cached marker until the backend answers.
                self.supervisor.report("reconcile_profile", &e.into());
                return;
            }
        };
        let marker = session
            .update(|s| {
                s.marker.reconcile(&row);
                s.marker.clone()
            })
            .await;
        self.supervisor
            .guard("profile_cache", self.cache.store(&CachedProfile::new(me, marker)))
            .await;
    }

    async fn handles(&self) -> Result<Handles, SyncError> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.handles.clone())
            .ok_or(SyncError::NotStarted)
    }

    async fn session(&self) -> Option<SharedSession> {
        self.handles().await.ok().map(|h| h.session)
    }

    // -----------------------------------------------------------------------
    // Read model
    // -----------------------------------------------------------------------

    pub async fn me(&self) -> Option<UserId> {
        self.session().await.map(|s| s.me())
    }

    /// Nearby users in insertion order. Empty when not started.
    pub async fn roster(&self) -> IndexMap<UserId, NearbyUser> {
        match self.session().await {
            Some(session) => session.read(|s| s.roster.entities().clone()).await,
            None => IndexMap::new(),
        }
    }

    /// The roster with coincident users spread on a spiral, in roster order.
    pub async fn placed_roster(&self) -> Vec<PlacedUser> {
        let entities = self.roster().await;
        let points: Vec<(UserId, Coordinates)> =
            entities.values().map(|u| (u.id, u.position)).collect();
        let placed = spiral::spread(&points, &self.config.spiral);

        entities
            .into_values()
            .zip(placed)
            .map(|(user, (_, display_position))| PlacedUser {
                user,
                display_position,
            })
            .collect()
    }

    pub async fn self_marker(&self) -> SelfMarker {
        match self.session().await {
            Some(session) => session.read(|s| s.marker.clone()).await,
            None => SelfMarker::default(),
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.badges.borrow().pending_requests
    }

    pub async fn unread_count(&self) -> usize {
        self.badges.borrow().unread_conversations
    }

    /// Badge counts, updated whenever they change.
    pub fn badges(&self) -> watch::Receiver<Badges> {
        self.badges.subscribe()
    }

    /// Notices for failures and benign conflicts.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.supervisor.subscribe()
    }

    /// The relationship with `user`, whether or not they are visible.
    pub async fn relationship_with(&self, user: UserId) -> Option<RelationshipLink> {
        let session = self.session().await?;
        session
            .read(|s| s.roster.relationship_with(&user).cloned())
            .await
    }

    /// Whether the local user currently mutes `user`, evaluated at `now`.
    pub async fn is_muted(&self, user: UserId, now: Timestamp) -> bool {
        self.relationship_with(user)
            .await
            .is_some_and(|link| link.is_muted(now))
    }

    /// The status text of `user` if it has not expired.
    pub async fn active_status(&self, user: UserId) -> Option<String> {
        let session = self.session().await?;
        let ttl = self.config.status_ttl;
        session
            .read(|s| {
                s.roster
                    .get(&user)
                    .and_then(|u| u.active_status(Utc::now(), ttl))
                    .map(str::to_string)
            })
            .await
    }

    pub async fn tracking_state(&self) -> TrackingState {
        match self.handles().await {
            Ok(handles) => handles.tracker.state().await,
            Err(_) => TrackingState::Disabled,
        }
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    pub async fn poke(&self, target: UserId) -> Result<PokeOutcome, SyncError> {
        self.supervisor
            .observe("poke", async {
                self.handles().await?.relationships.poke(target).await
            })
            .await
    }

    pub async fn cancel(&self, target: UserId) -> Result<(), SyncError> {
        self.supervisor
            .observe("cancel", async {
                self.handles().await?.relationships.cancel(target).await
            })
            .await
    }

    pub async fn decline(&self, target: UserId) -> Result<(), SyncError> {
        self.supervisor
            .observe("decline", async {
                self.handles().await?.relationships.decline(target).await
            })
            .await
    }

    pub async fn mute(&self, target: UserId, until: Option<Timestamp>) -> Result<(), SyncError> {
        self.supervisor
            .observe("mute", async {
                self.handles().await?.relationships.mute(target, until).await
            })
            .await
    }

    pub async fn block(&self, target: UserId) -> Result<BlockOutcome, SyncError> {
        self.supervisor
            .observe("block", async {
                self.handles().await?.relationships.block(target).await
            })
            .await
    }

    pub async fn enable_location(&self) -> Result<TrackingState, SyncError> {
        self.supervisor
            .observe("enable_location", async {
                self.handles().await?.tracker.enable().await
            })
            .await
    }

    pub async fn disable_location(&self) -> Result<(), SyncError> {
        self.supervisor
            .observe("disable_location", async {
                self.handles().await?.tracker.disable().await
            })
            .await
    }

    pub async fn set_ghost_mode(&self, on: bool) -> Result<(), SyncError> {
        self.supervisor
            .observe("set_ghost_mode", async {
                self.handles().await?.tracker.set_ghost_mode(on).await
            })
            .await
    }

    /// Run a full re-fetch now instead of waiting for the next tick.
    pub async fn poll_now(&self) -> Result<PollSummary, SyncError> {
        self.supervisor
            .observe("poll", async { self.handles().await?.poller.poll_once().await })
            .await
    }

    pub async fn refresh_badges(&self) -> Result<Badges, SyncError> {
        self.supervisor
            .observe("badge_refresh", async {
                self.handles().await?.poller.refresh_badges().await
            })
            .await
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}
