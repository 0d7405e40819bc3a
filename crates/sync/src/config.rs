use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use nearby_core::geo::DEFAULT_WRITE_THROTTLE;
use nearby_core::profile::DEFAULT_STATUS_TTL_HOURS;
use nearby_core::spiral::{SpiralParams, DEFAULT_BASE_SPACING_DEG, DEFAULT_CLUSTER_THRESHOLD_DEG};
use nearby_events::bus::DEFAULT_CAPACITY;

use crate::error::SyncError;

/// Upper bound of every interval, throttle and timeout (one week).
pub const MAX_PERIOD_SECS: u64 = 7 * 24 * 60 * 60;

/// Upper bound of the status lifetime (one year).
pub const MAX_STATUS_TTL_HOURS: i64 = 365 * 24;

/// Upper bound of the change-feed buffer.
pub const MAX_FEED_CAPACITY: usize = 1 << 20;

/// Engine configuration loaded from environment variables.
///
/// All fields have defaults suitable for a mobile client.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Period of the full re-fetch (default: 30 s).
    pub poll_interval: Duration,
    /// Period of the coarse badge recomputation (default: 60 s).
    pub badge_refresh_interval: Duration,
    /// Minimum gap between remote position writes (default: 5 s).
    pub location_write_throttle: Duration,
    /// Timeout of the one-shot fix issued by `enable_location` (default: 15 s).
    pub location_timeout: Duration,
    /// Clustering threshold and base spacing of the spiral placement.
    pub spiral: SpiralParams,
    /// Lifetime of an ephemeral status (default: 24 h).
    pub status_ttl: chrono::Duration,
    /// Buffer of the change-feed broadcast channel (default: 1024).
    pub feed_capacity: usize,
    /// JSON file backing the local profile cache. In-memory when unset.
    pub cache_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            badge_refresh_interval: Duration::from_secs(60),
            location_write_throttle: DEFAULT_WRITE_THROTTLE,
            location_timeout: Duration::from_secs(15),
            spiral: SpiralParams::default(),
            status_ttl: chrono::Duration::hours(DEFAULT_STATUS_TTL_HOURS),
            feed_capacity: DEFAULT_CAPACITY,
            cache_path: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                               | Default  |
    /// |---------------------------------------|----------|
    /// | `NEARBY_POLL_INTERVAL_SECS`           | `30`     |
    /// | `NEARBY_BADGE_REFRESH_SECS`           | `60`     |
    /// | `NEARBY_LOCATION_WRITE_THROTTLE_SECS` | `5`      |
    /// | `NEARBY_LOCATION_TIMEOUT_SECS`        | `15`     |
    /// | `NEARBY_CLUSTER_THRESHOLD_DEG`        | `0.003`  |
    /// | `NEARBY_SPIRAL_SPACING_DEG`           | `0.0003` |
    /// | `NEARBY_STATUS_TTL_HOURS`             | `24`     |
    /// | `NEARBY_FEED_CAPACITY`                | `1024`   |
    /// | `NEARBY_CACHE_PATH`                   | unset    |
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let poll_secs: u64 = parse_var(&lookup, "NEARBY_POLL_INTERVAL_SECS", 30)?;
        let badge_secs: u64 = parse_var(&lookup, "NEARBY_BADGE_REFRESH_SECS", 60)?;
        let throttle_secs: u64 = parse_var(
            &lookup,
            "NEARBY_LOCATION_WRITE_THROTTLE_SECS",
            DEFAULT_WRITE_THROTTLE.as_secs(),
        )?;
        let timeout_secs: u64 = parse_var(&lookup, "NEARBY_LOCATION_TIMEOUT_SECS", 15)?;
        let cluster_threshold: f64 = parse_var(
            &lookup,
            "NEARBY_CLUSTER_THRESHOLD_DEG",
            DEFAULT_CLUSTER_THRESHOLD_DEG,
        )?;
        let base_spacing: f64 =
            parse_var(&lookup, "NEARBY_SPIRAL_SPACING_DEG", DEFAULT_BASE_SPACING_DEG)?;
        let ttl_hours: i64 = parse_var(&lookup, "NEARBY_STATUS_TTL_HOURS", DEFAULT_STATUS_TTL_HOURS)?;
        let feed_capacity: usize = parse_var(&lookup, "NEARBY_FEED_CAPACITY", DEFAULT_CAPACITY)?;
        let cache_path = lookup("NEARBY_CACHE_PATH")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        require(poll_secs > 0, "NEARBY_POLL_INTERVAL_SECS must be positive")?;
        require(badge_secs > 0, "NEARBY_BADGE_REFRESH_SECS must be positive")?;
        require(timeout_secs > 0, "NEARBY_LOCATION_TIMEOUT_SECS must be positive")?;
        for (key, secs) in [
            ("NEARBY_POLL_INTERVAL_SECS", poll_secs),
            ("NEARBY_BADGE_REFRESH_SECS", badge_secs),
            ("NEARBY_LOCATION_WRITE_THROTTLE_SECS", throttle_secs),
            ("NEARBY_LOCATION_TIMEOUT_SECS", timeout_secs),
        ] {
            require(
                secs <= MAX_PERIOD_SECS,
                &format!("{key} must be at most {MAX_PERIOD_SECS}"),
            )?;
        }
        require(
            cluster_threshold.is_finite() && cluster_threshold >= 0.0,
            "NEARBY_CLUSTER_THRESHOLD_DEG must be a non-negative number",
        )?;
        require(
            base_spacing.is_finite() && base_spacing > 0.0,
            "NEARBY_SPIRAL_SPACING_DEG must be a positive number",
        )?;
        require(
            ttl_hours > 0 && ttl_hours <= MAX_STATUS_TTL_HOURS,
            &format!("NEARBY_STATUS_TTL_HOURS must be between 1 and {MAX_STATUS_TTL_HOURS}"),
        )?;
        let status_ttl = chrono::Duration::try_hours(ttl_hours).ok_or_else(|| {
            SyncError::Config(format!("NEARBY_STATUS_TTL_HOURS is out of range: {ttl_hours}"))
        })?;
        require(
            feed_capacity > 0 && feed_capacity <= MAX_FEED_CAPACITY,
            &format!("NEARBY_FEED_CAPACITY must be between 1 and {MAX_FEED_CAPACITY}"),
        )?;

        Ok(Self {
            poll_interval: Duration::from_secs(poll_secs),
            badge_refresh_interval: Duration::from_secs(badge_secs),
            location_write_throttle: Duration::from_secs(throttle_secs),
            location_timeout: Duration::from_secs(timeout_secs),
            spiral: SpiralParams {
                cluster_threshold,
                base_spacing,
            },
            status_ttl,
            feed_capacity,
            cache_path,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, SyncError>
where
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SyncError::Config(format!("{key} has invalid value {raw:?}"))),
    }
}

fn require(ok: bool, message: &str) -> Result<(), SyncError> {
    if ok {
        Ok(())
    } else {
        Err(SyncError::Config(message.to_string()))
    }
}
