//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use nearby_core::geo::Coordinates;
use nearby_core::profile::ProfileRow;
use nearby_core::types::UserId;
use nearby_sync::cache::{MemoryCache, ProfileCache};
use nearby_sync::memory::{MemoryBackend, ScriptedLocation};
use nearby_sync::{SyncConfig, SyncEngine};
use uuid::Uuid;

/// Poll `$cond` (which may contain `.await`) until it holds, or panic.
macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..300 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(held, "condition never held: {}", stringify!($cond));
    }};
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("nearby_sync=debug")
        .with_test_writer()
        .try_init();
}

/// Config whose timers never fire during a test.
pub fn quiet_config() -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_secs(3600),
        badge_refresh_interval: Duration::from_secs(3600),
        ..SyncConfig::default()
    }
}

pub fn at(lat: f64, lng: f64) -> Coordinates {
    Coordinates { lat, lng }
}

/// A profile that passes the visibility predicate.
pub fn visible_profile(id: UserId, name: &str, position: Coordinates) -> ProfileRow {
    ProfileRow {
        display_name: Some(name.to_string()),
        latitude: Some(position.lat),
        longitude: Some(position.lng),
        location_enabled: true,
        ..ProfileRow::new(id)
    }
}

/// One signed-in user with their own engine, device and cache.
pub struct Client {
    pub id: UserId,
    pub engine: SyncEngine,
    pub location: Arc<ScriptedLocation>,
    pub cache: Arc<MemoryCache>,
}

impl Client {
    pub async fn start(backend: &MemoryBackend, id: UserId, config: SyncConfig) -> Self {
        let location = Arc::new(ScriptedLocation::at(at(52.37, 4.89)));
        let cache = Arc::new(MemoryCache::new());
        Self::start_with(backend, id, config, location, cache).await
    }

    pub async fn start_with(
        backend: &MemoryBackend,
        id: UserId,
        config: SyncConfig,
        location: Arc<ScriptedLocation>,
        cache: Arc<MemoryCache>,
    ) -> Self {
        let engine = SyncEngine::new(
            Arc::new(backend.session(id)),
            location.clone(),
            cache.clone() as Arc<dyn ProfileCache>,
            config,
        );
        let me = engine.start().await.expect("engine starts");
        assert_eq!(me, id);
        Self {
            id,
            engine,
            location,
            cache,
        }
    }
}

/// Seed `count` visible users around `center` and return their ids.
pub async fn seed_visible(backend: &MemoryBackend, center: Coordinates, count: usize) -> Vec<UserId> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let id = Uuid::new_v4();
        let position = at(center.lat + i as f64 * 0.01, center.lng);
        backend
            .upsert_profile(visible_profile(id, &format!("user-{i}"), position))
            .await
            .expect("seed profile");
        ids.push(id);
    }
    ids
}
