// ── Runtime engine configuration ──
//
// Timeouts, horizons, and schedule periods for the agent. Built by the
// binary (usually from printfleet-config) and handed in; core never
// reads config files.

use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

/// Smallest per-device query timeout the engine will use.
pub const MIN_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Retention horizons for the finer metrics tiers. Monthly rows are
/// kept forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub raw_days: u32,
    pub hourly_days: u32,
    pub daily_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            raw_days: 7,
            hourly_days: 30,
            daily_days: 365,
        }
    }
}

/// Garbage-collection horizons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcPolicy {
    pub scan_history_days: u32,
    pub hidden_device_days: u32,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            scan_history_days: 30,
            hidden_device_days: 30,
        }
    }
}

impl GcPolicy {
    pub fn scan_history_horizon(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.scan_history_days))
    }

    pub fn hidden_device_horizon(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.hidden_device_days))
    }
}

/// Configuration for one agent instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on every liveness/full query and metrics read.
    pub query_timeout: Duration,
    /// Bound on the deep probe, which walks far more of the device.
    pub deep_scan_timeout: Duration,
    /// How long `stop` waits for a listener to unwind before aborting it.
    pub listener_stop_timeout: Duration,
    /// Per-protocol throttle window for passive listeners.
    pub throttle_window: Duration,
    /// Minimum gap between repeated warnings for the same key.
    pub warn_interval: Duration,
    pub retention: RetentionPolicy,
    pub gc: GcPolicy,
    pub downsample_interval: Duration,
    pub downsample_initial_delay: Duration,
    pub gc_interval: Duration,
    /// Where the in-memory store snapshots its tables, if anywhere.
    pub state_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(5),
            deep_scan_timeout: Duration::from_secs(30),
            listener_stop_timeout: Duration::from_secs(5),
            throttle_window: Duration::from_secs(10 * 60),
            warn_interval: Duration::from_secs(5 * 60),
            retention: RetentionPolicy::default(),
            gc: GcPolicy::default(),
            downsample_interval: Duration::from_secs(6 * 60 * 60),
            downsample_initial_delay: Duration::from_secs(30),
            gc_interval: Duration::from_secs(24 * 60 * 60),
            state_file: None,
        }
    }
}

impl EngineConfig {
    /// Query timeout with the floor applied.
    pub fn effective_query_timeout(&self) -> Duration {
        self.query_timeout.max(MIN_QUERY_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_timeout_has_floor() {
        let cfg = EngineConfig {
            query_timeout: Duration::from_millis(500),
            ..EngineConfig::default()
        };
        assert_eq!(cfg.effective_query_timeout(), MIN_QUERY_TIMEOUT);
    }

    #[test]
    fn default_horizons() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.retention.raw_days, 7);
        assert_eq!(cfg.gc.scan_history_horizon(), TimeDelta::days(30));
        assert_eq!(cfg.throttle_window, Duration::from_secs(600));
    }
}
