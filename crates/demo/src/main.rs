//! Scripted walkthrough of one session against the in-process backend.
//!
//! Seeds a handful of neighbours, signs in, shares a position, accepts a
//! friend request, reads the badges and the de-overlapped roster, then logs
//! out. Configuration comes from `NEARBY_*` environment variables (see
//! `SyncConfig::from_env`), optionally via a `.env` file.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nearby_core::geo::Coordinates;
use nearby_core::profile::ProfileRow;
use nearby_core::relationship::NewRelationship;
use nearby_core::types::UserId;
use nearby_sync::backend::RelationshipBackend;
use nearby_sync::cache::{JsonFileCache, MemoryCache, ProfileCache};
use nearby_sync::memory::{MemoryBackend, ScriptedLocation};
use nearby_sync::{SyncConfig, SyncEngine};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nearby_sync=debug,nearby_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = SyncConfig::from_env().context("invalid NEARBY_* configuration")?;
    tracing::info!(
        poll_interval = ?config.poll_interval,
        write_throttle = ?config.location_write_throttle,
        cache = ?config.cache_path,
        "Loaded sync configuration"
    );

    // --- Profile cache ---
    let cache: Arc<dyn ProfileCache> = match &config.cache_path {
        Some(path) => Arc::new(JsonFileCache::new(path)),
        None => Arc::new(MemoryCache::new()),
    };

    // --- Backend ---
    let backend = MemoryBackend::with_capacity(config.feed_capacity);
    let cafe = Coordinates::new(52.3676, 4.9041)?;
    let me = Uuid::new_v4();
    let neighbours = seed_neighbours(&backend, cafe).await?;
    tracing::info!(user_id = %me, neighbours = neighbours.len(), "Backend seeded");

    // --- Engine ---
    let location = Arc::new(ScriptedLocation::at(cafe));
    let engine = SyncEngine::new(
        Arc::new(backend.session(me)),
        location.clone(),
        cache,
        config,
    );
    engine.start().await?;

    let mut notices = engine.notices();
    let notice_log = tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            tracing::info!(kind = ?notice.kind, message = %notice.message, "Notice");
        }
    });

    tracing::info!(visible = engine.roster().await.len(), "Initial roster");

    // --- Location ---
    let state = engine.enable_location().await?;
    tracing::info!(%state, marker = ?engine.self_marker().await, "Location sharing");
    location.push_fix(Coordinates::new(52.3679, 4.9045)?).await;

    // --- Friend request ---
    let friend = neighbours[0];
    backend
        .session(friend)
        .insert_relationship(&NewRelationship::request(friend, me))
        .await?;
    let mut badges = engine.badges();
    tokio::time::timeout(WAIT, badges.wait_for(|b| b.pending_requests > 0))
        .await
        .context("friend request never arrived")??;
    tracing::info!(pending = engine.pending_count().await, "Friend request received");

    let outcome = engine.poke(friend).await?;
    tracing::info!(friend_id = %friend, ?outcome, "Poked back");

    backend.send_message(friend, me).await?;
    tokio::time::timeout(WAIT, badges.wait_for(|b| b.unread_conversations > 0))
        .await
        .context("message never arrived")??;
    tracing::info!(
        pending = engine.pending_count().await,
        unread = engine.unread_count().await,
        "Badges"
    );

    // --- Map ---
    let placed = engine.placed_roster().await;
    for entry in &placed {
        tracing::info!(
            name = %entry.user.display_name,
            lat = entry.user.position.lat,
            lng = entry.user.position.lng,
            display_lat = entry.display_position.lat,
            display_lng = entry.display_position.lng,
            "Placed"
        );
    }
    tracing::debug!(json = %serde_json::to_string(&placed)?, "Placed roster");

    // --- Teardown ---
    engine.set_ghost_mode(true).await?;
    engine.logout().await?;
    notice_log.abort();
    tracing::info!("Demo finished");
    Ok(())
}

/// Three users sharing the cafe's coordinates and one across town.
async fn seed_neighbours(backend: &MemoryBackend, cafe: Coordinates) -> anyhow::Result<Vec<UserId>> {
    let spots = [
        ("Ada", cafe),
        ("Brendan", cafe),
        ("Chioma", cafe),
        ("Dries", Coordinates::new(52.3600, 4.8852)?),
    ];

    let mut ids = Vec::with_capacity(spots.len());
    for (name, at) in spots {
        let id = Uuid::new_v4();
        backend
            .upsert_profile(ProfileRow {
                display_name: Some(name.to_string()),
                latitude: Some(at.lat),
                longitude: Some(at.lng),
                location_enabled: true,
                ..ProfileRow::new(id)
            })
            .await?;
        ids.push(id);
    }
    Ok(ids)
}
