//! Device location tracking for the local user.
//!
//! Drives [`TrackingState`] from permission and position callbacks. Every
//! accepted fix updates the self marker and the local cache; remote writes
//! from the continuous watch go through a [`WriteThrottle`]. The watch runs
//! as a child of the session's cancellation token, so it can never outlive
//! the session.

use std::sync::Arc;
use std::time::Duration;

use nearby_core::geo::{SelfMarker, TrackingEvent, TrackingState, WriteThrottle};
use nearby_core::profile::ProfilePatch;
use nearby_core::types::UserId;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, Fix, LocationError, LocationProvider};
use crate::cache::{CachedProfile, ProfileCache};
use crate::error::SyncError;
use crate::state::SharedSession;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    /// Minimum gap between remote position writes from the watch.
    pub write_throttle: Duration,
    /// Timeout of the one-shot fix issued by [`GeoTracker::enable`].
    pub fix_timeout: Duration,
}

#[derive(Debug)]
struct TrackerInner {
    state: TrackingState,
    throttle: WriteThrottle,
    watch: Option<CancellationToken>,
}

impl TrackerInner {
    /// Move to `Disabled` and stop the continuous watch.
    fn halt(&mut self) {
        self.state = self.state.next(TrackingEvent::DisableRequested);
        self.throttle.reset();
        if let Some(watch) = self.watch.take() {
            watch.cancel();
        }
    }
}

#[derive(Clone)]
pub struct GeoTracker {
    session: SharedSession,
    backend: Arc<dyn Backend>,
    location: Arc<dyn LocationProvider>,
    cache: Arc<dyn ProfileCache>,
    supervisor: Supervisor,
    settings: TrackerSettings,
    scope: CancellationToken,
    inner: Arc<Mutex<TrackerInner>>,
}

impl GeoTracker {
    pub fn new(
        session: SharedSession,
        backend: Arc<dyn Backend>,
        location: Arc<dyn LocationProvider>,
        cache: Arc<dyn ProfileCache>,
        supervisor: Supervisor,
        settings: TrackerSettings,
        scope: CancellationToken,
    ) -> Self {
        Self {
            session,
            backend,
            location,
            cache,
            supervisor,
            settings,
            scope,
            inner: Arc::new(Mutex::new(TrackerInner {
                state: TrackingState::Disabled,
                throttle: WriteThrottle::new(settings.write_throttle),
                watch: None,
            })),
        }
    }

    fn me(&self) -> UserId {
        self.session.me()
    }

    pub async fn state(&self) -> TrackingState {
        self.inner.lock().await.state
    }

    /// Request a one-shot fix, persist it locally and remotely, then start
    /// the continuous watch.
    ///
    /// Permission errors and timeouts leave the tracker `Disabled` and are
    /// returned to the caller; nothing is retried until the next `enable`.
    pub async fn enable(&self) -> Result<TrackingState, SyncError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_tracking() {
                return Ok(inner.state);
            }
            inner.state = inner.state.next(TrackingEvent::EnableRequested);
            self.session.update(|s| s.marker.begin_acquiring()).await;
        }
        tracing::info!(user_id = %self.me(), "Location tracking enabling");

        let fix = match self.location.current_position(self.settings.fix_timeout).await {
            Ok(fix) => fix,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.state = inner.state.next(failure_event(&e));
                if inner.state == TrackingState::Disabled {
                    self.session.update(|s| s.marker.disable()).await;
                }
                tracing::info!(user_id = %self.me(), error = %e, "Location tracking could not start");
                return Err(e.into());
            }
        };

        let marker = {
            let mut inner = self.inner.lock().await;
            let next = inner.state.next(TrackingEvent::FixObtained);
            if next != TrackingState::Active {
                tracing::debug!(state = %next, "Discarding fix that arrived after disable");
                return Ok(next);
            }
            inner.state = next;
            inner.throttle.mark_written(now());
            self.session
                .update(|s| {
                    s.marker.record_fix(fix.position);
                    s.marker.clone()
                })
                .await
        };

        self.persist_local(marker).await;
        let patch = ProfilePatch::share_position(fix.position, fix.at);
        if let Err(e) = self.backend.patch_profile(self.me(), &patch).await {
            // The next unthrottled watch write retries.
            self.supervisor.report("enable_location", &e.into());
        }

        self.start_watch().await?;
        let state = self.state().await;
        tracing::info!(user_id = %self.me(), %state, "Location tracking enabled");
        Ok(state)
    }

    /// Stop the watch, clear the local position and write an explicit
    /// "no position" marker remotely.
    pub async fn disable(&self) -> Result<(), SyncError> {
        let marker = {
            let mut inner = self.inner.lock().await;
            inner.halt();
            self.session
                .update(|s| {
                    s.marker.disable();
                    s.marker.clone()
                })
                .await
        };
        tracing::info!(user_id = %self.me(), "Location tracking disabled");

        self.persist_local(marker).await;
        self.backend
            .patch_profile(self.me(), &ProfilePatch::stop_sharing())
            .await?;
        Ok(())
    }

    /// Toggle ghost mode.
    ///
    /// Activation stops the watch, drops the position and writes the ghost
    /// marker. Deactivation only writes the flag; location sharing has to be
    /// re-enabled explicitly.
    pub async fn set_ghost_mode(&self, on: bool) -> Result<(), SyncError> {
        let marker = {
            let mut inner = self.inner.lock().await;
            if on {
                inner.halt();
            }
            self.session
                .update(|s| {
                    s.marker.set_ghost(on);
                    s.marker.clone()
                })
                .await
        };
        tracing::info!(user_id = %self.me(), ghost = on, "Ghost mode changed");

        self.persist_local(marker).await;
        self.backend
            .patch_profile(self.me(), &ProfilePatch::ghost(on))
            .await?;
        Ok(())
    }

    /// Stop the watch without any remote write (logout, session teardown).
    pub async fn stop_watch(&self) {
        self.inner.lock().await.halt();
    }

    // -----------------------------------------------------------------------
    // Continuous watch
    // -----------------------------------------------------------------------

    async fn start_watch(&self) -> Result<(), SyncError> {
        let receiver = match self.location.watch().await {
            Ok(receiver) => receiver,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.halt();
                self.session.update(|s| s.marker.disable()).await;
                return Err(e.into());
            }
        };

        let token = self.scope.child_token();
        {
            let mut inner = self.inner.lock().await;
            if inner.state != TrackingState::Active {
                return Ok(());
            }
            if let Some(previous) = inner.watch.replace(token.clone()) {
                previous.cancel();
            }
        }

        let tracker = self.clone();
        tokio::spawn(async move { tracker.run_watch(receiver, token).await });
        Ok(())
    }

    async fn run_watch(
        self,
        mut receiver: mpsc::Receiver<Result<Fix, LocationError>>,
        token: CancellationToken,
    ) {
        tracing::debug!(user_id = %self.me(), "Location watch started");
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                update = receiver.recv() => match update {
                    Some(Ok(fix)) => self.on_fix(fix).await,
                    Some(Err(e)) => {
                        if !self.on_watch_error(e).await {
                            break;
                        }
                    }
                    None => {
                        tracing::info!(user_id = %self.me(), "Location watch closed by provider");
                        break;
                    }
                },
            }
        }
        tracing::debug!(user_id = %self.me(), "Location watch stopped");
    }

    async fn on_fix(&self, fix: Fix) {
        let (marker, write) = {
            let mut inner = self.inner.lock().await;
            if inner.state != TrackingState::Active {
                return;
            }
            let write = inner.throttle.try_acquire(now());
            let marker = self
                .session
                .update(|s| {
                    s.marker.record_fix(fix.position);
                    s.marker.clone()
                })
                .await;
            (marker, write)
        };

        self.persist_local(marker).await;
        if !write {
            tracing::trace!("Remote position write throttled");
            return;
        }
        let patch = ProfilePatch::share_position(fix.position, fix.at);
        if let Err(e) = self.backend.patch_profile(self.me(), &patch).await {
            self.supervisor.report("location_watch", &e.into());
        }
    }

    /// Returns `false` when the error ended tracking.
    async fn on_watch_error(&self, err: LocationError) -> bool {
        let mut inner = self.inner.lock().await;
        inner.state = inner.state.next(failure_event(&err));
        if inner.state != TrackingState::Disabled {
            tracing::warn!(error = %err, "Transient location watch error");
            return true;
        }

        inner.halt();
        self.session.update(|s| s.marker.disable()).await;
        drop(inner);
        self.supervisor.report("location_watch", &err.into());
        false
    }

    async fn persist_local(&self, marker: SelfMarker) {
        let cached = CachedProfile::new(self.me(), marker);
        if let Err(e) = self.cache.store(&cached).await {
            self.supervisor.report("profile_cache", &e);
        }
    }
}

fn failure_event(err: &LocationError) -> TrackingEvent {
    match err {
        LocationError::PermissionDenied => TrackingEvent::PermissionDenied,
        LocationError::Timeout | LocationError::Unavailable(_) => TrackingEvent::Failed,
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}
