//! Local profile cache: hydrate on start, reconcile, clear on logout.
//!
//! The cache is an explicit store injected into the engine. It only ever
//! holds the local user's own marker so the map can render instantly
//! before the backend answers.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use nearby_core::geo::SelfMarker;
use nearby_core::types::{Timestamp, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::SyncError;

/// What the cache persists between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedProfile {
    pub user_id: UserId,
    pub marker: SelfMarker,
    pub updated_at: Timestamp,
}

impl CachedProfile {
    pub fn new(user_id: UserId, marker: SelfMarker) -> Self {
        Self {
            user_id,
            marker,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ProfileCache: Send + Sync {
    async fn load(&self) -> Result<Option<CachedProfile>, SyncError>;

    async fn store(&self, profile: &CachedProfile) -> Result<(), SyncError>;

    async fn clear(&self) -> Result<(), SyncError>;
}

// ---------------------------------------------------------------------------
// In-memory cache
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryCache {
    slot: Mutex<Option<CachedProfile>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileCache for MemoryCache {
    async fn load(&self) -> Result<Option<CachedProfile>, SyncError> {
        Ok(self.slot.lock().await.clone())
    }

    async fn store(&self, profile: &CachedProfile) -> Result<(), SyncError> {
        *self.slot.lock().await = Some(profile.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), SyncError> {
        *self.slot.lock().await = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON file cache
// ---------------------------------------------------------------------------

/// Cache persisted as a single JSON document.
///
/// Writes go to a sibling temporary file and are renamed into place.
#[derive(Debug)]
pub struct JsonFileCache {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "profile-cache".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ProfileCache for JsonFileCache {
    async fn load(&self) -> Result<Option<CachedProfile>, SyncError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::Cache(format!("read {}: {e}", self.path.display()))),
        };

        match serde_json::from_slice(&bytes) {
            Ok(profile) => Ok(Some(profile)),
            Err(e) => {
                // Treated as empty; the backend profile repopulates it.
                tracing::warn!(path = %self.path.display(), error = %e, "Discarding unreadable profile cache");
                Ok(None)
            }
        }
    }

    async fn store(&self, profile: &CachedProfile) -> Result<(), SyncError> {
        let bytes = serde_json::to_vec_pretty(profile)
            .map_err(|e| SyncError::Cache(format!("encode profile cache: {e}")))?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::Cache(format!("create {}: {e}", parent.display())))?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|e| SyncError::Cache(format!("write {}: {e}", temp.display())))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| SyncError::Cache(format!("rename into {}: {e}", self.path.display())))?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Cache(format!("remove {}: {e}", self.path.display()))),
        }
    }
}
