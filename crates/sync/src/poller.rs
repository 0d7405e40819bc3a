//! Periodic full re-fetch and coarse badge recomputation.
//!
//! A poll cycle issues a snapshot ticket before any read is sent, runs the
//! reads concurrently, and merges the results under that ticket so nothing
//! the change feed delivered in the meantime is overwritten.

use std::sync::Arc;
use std::time::Duration;

use nearby_core::blocking::BlockedSet;
use nearby_core::notifications::Badges;
use nearby_core::roster::SnapshotSummary;
use tokio::sync::Notify;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::error::SyncError;
use crate::state::SharedSession;
use crate::supervisor::Supervisor;

/// What one poll cycle merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub profiles: SnapshotSummary,
    pub relationships: SnapshotSummary,
    pub evicted_blocked: usize,
}

#[derive(Clone)]
pub struct Poller {
    session: SharedSession,
    backend: Arc<dyn Backend>,
    supervisor: Supervisor,
    resync: Arc<Notify>,
}

impl Poller {
    pub fn new(
        session: SharedSession,
        backend: Arc<dyn Backend>,
        supervisor: Supervisor,
        resync: Arc<Notify>,
    ) -> Self {
        Self {
            session,
            backend,
            supervisor,
            resync,
        }
    }

    /// Run one full re-fetch and merge it into the roster.
    pub async fn poll_once(&self) -> Result<PollSummary, SyncError> {
        let me = self.session.me();
        let tickets = self.session.read(|s| s.begin_snapshot()).await;

        let (profiles, blocked_by_me, blocking_me, relationships) = tokio::try_join!(
            self.backend.fetch_visible_profiles(me),
            self.backend.fetch_blocked_by_me(me),
            self.backend.fetch_blocking_me(me),
            self.backend.fetch_relationships(me),
        )?;

        let summary = self
            .session
            .update(|s| {
                let blocked = BlockedSet::from_queries(blocked_by_me, blocking_me);
                let evicted_blocked = s.roster.apply_blocked_snapshot(tickets.roster, blocked);
                let profiles = s.roster.apply_snapshot(tickets.roster, profiles);
                let relationship_summary = s
                    .roster
                    .apply_relationship_snapshot(tickets.roster, relationships.iter().cloned());
                s.aggregator
                    .replace_relationships(tickets.badges, relationships);
                PollSummary {
                    profiles,
                    relationships: relationship_summary,
                    evicted_blocked,
                }
            })
            .await;

        tracing::debug!(
            user_id = %me,
            upserted = summary.profiles.upserted,
            removed = summary.profiles.removed,
            stale = summary.profiles.stale,
            "Poll cycle merged"
        );
        Ok(summary)
    }

    /// Re-derive both badge counts from a full read.
    pub async fn refresh_badges(&self) -> Result<Badges, SyncError> {
        let me = self.session.me();
        let ticket = self.session.read(|s| s.aggregator.begin_snapshot()).await;
        let (relationships, inbox) = tokio::try_join!(
            self.backend.fetch_relationships(me),
            self.backend.fetch_inbox(me),
        )?;

        Ok(self
            .session
            .update(|s| {
                s.aggregator.replace_relationships(ticket, relationships);
                s.aggregator.replace_messages(ticket, inbox);
                s.aggregator.badges()
            })
            .await)
    }

    /// Poll on `poll_every`, refresh badges on `badges_every`, and poll
    /// immediately whenever a resync is requested. Runs until `cancel`.
    ///
    /// Failed cycles are reported and retried on the next tick only.
    pub async fn run(self, poll_every: Duration, badges_every: Duration, cancel: CancellationToken) {
        tracing::info!(
            user_id = %self.session.me(),
            poll_secs = poll_every.as_secs(),
            badge_secs = badges_every.as_secs(),
            "Poller started"
        );

        let mut poll = interval_at(Instant::now() + poll_every, poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut badges = interval_at(Instant::now() + badges_every, badges_every);
        badges.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Poller stopping");
                    break;
                }
                _ = self.resync.notified() => {
                    tracing::info!("Resync requested, polling now");
                    self.supervisor.guard("resync", self.poll_once()).await;
                    poll.reset();
                }
                _ = poll.tick() => {
                    self.supervisor.guard("poll", self.poll_once()).await;
                }
                _ = badges.tick() => {
                    self.supervisor.guard("badge_refresh", self.refresh_badges()).await;
                }
            }
        }
    }
}
