// ── Storage interfaces ──
//
// The registry and metrics store are collaborators: the core calls
// them through these traits and assumes they own their own row-level
// locking. `MemoryStore` is the bundled implementation.

mod memory;
mod tiered;

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::{Device, MetricsSnapshot, ScanSnapshot, Tier};

pub use memory::MemoryStore;
pub use tiered::TieredSeries;

// ── Filters & reports ────────────────────────────────────────────────

/// Narrowing for `DeviceRegistry::list`. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub is_saved: Option<bool>,
    pub visible: Option<bool>,
    pub ip: Option<IpAddr>,
    pub serial: Option<String>,
    /// Case-insensitive substring match.
    pub manufacturer: Option<String>,
    pub last_seen_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl DeviceFilter {
    pub fn visible_at(ip: IpAddr) -> Self {
        Self {
            visible: Some(true),
            ip: Some(ip),
            ..Self::default()
        }
    }

    pub fn saved_and_visible() -> Self {
        Self {
            is_saved: Some(true),
            visible: Some(true),
            ..Self::default()
        }
    }

    pub fn matches(&self, device: &Device) -> bool {
        if self.is_saved.is_some_and(|v| device.is_saved != v)
            || self.visible.is_some_and(|v| device.visible != v)
            || self.ip.is_some_and(|ip| device.ip != ip)
            || self
                .last_seen_after
                .is_some_and(|after| device.last_seen <= after)
        {
            return false;
        }
        if let Some(serial) = &self.serial {
            if device.serial != *serial {
                return false;
            }
        }
        if let Some(needle) = &self.manufacturer {
            let needle = needle.to_lowercase();
            let found = device
                .attributes
                .manufacturer
                .as_deref()
                .is_some_and(|m| m.to_lowercase().contains(&needle));
            if !found {
                return false;
            }
        }
        true
    }
}

/// Per-tier counters for one downsampling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownsampleReport {
    /// Rollup rows written for the first time, keyed by target tier.
    pub created: BTreeMap<Tier, u64>,
    /// Rollup rows rewritten because their inputs changed.
    pub updated: BTreeMap<Tier, u64>,
    /// Finer rows removed after being rolled up, keyed by their tier.
    pub pruned: BTreeMap<Tier, u64>,
    /// Finer rows discarded because their window was already sealed.
    pub late_dropped: u64,
}

impl DownsampleReport {
    pub fn total_created(&self) -> u64 {
        self.created.values().sum()
    }

    pub fn total_updated(&self) -> u64 {
        self.updated.values().sum()
    }

    pub fn total_pruned(&self) -> u64 {
        self.pruned.values().sum()
    }

    /// True when the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.total_created() == 0
            && self.total_updated() == 0
            && self.total_pruned() == 0
            && self.late_dropped == 0
    }

    pub(crate) fn bump(map: &mut BTreeMap<Tier, u64>, tier: Tier, by: u64) {
        if by > 0 {
            *map.entry(tier).or_insert(0) += by;
        }
    }
}

// ── Traits ───────────────────────────────────────────────────────────

/// Durable device records, keyed by serial.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn get(&self, serial: &str) -> Result<Option<Device>, CoreError>;

    async fn upsert(&self, device: &Device) -> Result<(), CoreError>;

    /// Matching devices, most recently seen first.
    async fn list(&self, filter: &DeviceFilter) -> Result<Vec<Device>, CoreError>;

    /// Hard delete, cascading to scan history. Returns whether the
    /// device existed.
    async fn delete(&self, serial: &str) -> Result<bool, CoreError>;

    async fn mark_saved(&self, serial: &str) -> Result<(), CoreError>;

    /// Write the device, its audit snapshot and its metrics snapshot as
    /// one unit. Either everything is visible afterwards or nothing is.
    async fn store_discovery_atomic(
        &self,
        device: &Device,
        scan: Option<&ScanSnapshot>,
        metrics: Option<&MetricsSnapshot>,
    ) -> Result<(), CoreError>;

    /// Audit rows for `serial`, oldest first.
    async fn scan_history(&self, serial: &str) -> Result<Vec<ScanSnapshot>, CoreError>;

    async fn delete_old_scans(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError>;

    /// Hidden, unsaved devices last seen before `cutoff`.
    async fn delete_old_hidden_devices(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError>;
}

/// Four-tier metrics series.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Append a raw row and return its id. A second row for the same
    /// serial and timestamp is not stored twice.
    async fn save_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<u64, CoreError>;

    /// Newest raw row, falling back to the newest rollup.
    async fn get_latest(&self, serial: &str) -> Result<Option<MetricsSnapshot>, CoreError>;

    /// Best-resolution series covering `[since, until]`, stitched
    /// across tiers and ordered by time.
    async fn get_tiered_history(
        &self,
        serial: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<MetricsSnapshot>, CoreError>;

    async fn perform_full_downsampling(&self) -> Result<DownsampleReport, CoreError>;

    /// Returns whether a row was removed.
    async fn delete_metric_by_id(&self, tier: Tier, id: u64) -> Result<bool, CoreError>;
}

/// Key-value settings documents, stored as submitted (post-migration).
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_settings(&self, key: &str) -> Result<Option<serde_json::Value>, CoreError>;

    async fn save_settings(&self, key: &str, document: &serde_json::Value) -> Result<(), CoreError>;
}

/// Something that can persist its state on demand.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn checkpoint(&self) -> Result<(), CoreError>;
}
