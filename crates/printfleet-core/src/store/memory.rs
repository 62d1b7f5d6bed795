// ── In-memory store ──
//
// Devices, scan history, metrics tiers and settings documents behind a
// single short-held lock. Every trait method is one critical section,
// which is what makes `store_discovery_atomic` atomic. Optionally
// snapshots itself to a JSON state file (write temp, then rename).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::RetentionPolicy;
use crate::error::CoreError;
use crate::model::{Device, MetricsSnapshot, ScanSnapshot, Tier};

use super::{
    Checkpoint, DeviceFilter, DeviceRegistry, DownsampleReport, MetricsStore, SettingsStore,
    TieredSeries,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    devices: BTreeMap<String, Device>,
    #[serde(default)]
    scans: Vec<ScanSnapshot>,
    #[serde(default)]
    next_scan_id: u64,
    #[serde(default)]
    metrics: TieredSeries,
    #[serde(default)]
    settings: BTreeMap<String, serde_json::Value>,
}

impl Tables {
    fn push_scan(&mut self, scan: &ScanSnapshot) -> u64 {
        self.next_scan_id += 1;
        let mut row = scan.clone();
        row.id = self.next_scan_id;
        self.scans.push(row);
        self.next_scan_id
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    clock: Arc<dyn Clock>,
    retention: RetentionPolicy,
    state_file: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>, retention: RetentionPolicy) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            clock,
            retention,
            state_file: None,
        }
    }

    /// Open a store backed by `path`, loading it if it exists.
    pub fn open(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        retention: RetentionPolicy,
    ) -> Result<Self, CoreError> {
        let path = path.into();
        let tables = if path.exists() {
            let tables = read_state(&path)?;
            info!(
                path = %path.display(),
                devices = tables.devices.len(),
                "loaded state file"
            );
            tables
        } else {
            Tables::default()
        };
        Ok(Self {
            tables: Mutex::new(tables),
            clock,
            retention,
            state_file: Some(path),
        })
    }

    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the current tables to `path` via a temp file and rename.
    /// The file work runs on the blocking pool.
    pub async fn save_to(&self, path: &Path) -> Result<(), CoreError> {
        let bytes = {
            let tables = self.lock();
            serde_json::to_vec_pretty(&*tables).map_err(CoreError::storage)?
        };
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || write_state(&target, &bytes))
            .await
            .map_err(CoreError::storage)??;
        debug!(path = %path.display(), "state file written");
        Ok(())
    }

    pub fn metrics_rows(&self, tier: Tier, serial: &str) -> Vec<MetricsSnapshot> {
        self.lock().metrics.rows(tier, serial)
    }
}

fn read_state(path: &Path) -> Result<Tables, CoreError> {
    let bytes = std::fs::read(path).map_err(CoreError::storage)?;
    serde_json::from_slice(&bytes).map_err(|e| CoreError::Storage {
        message: format!("{}: {e}", path.display()),
    })
}

fn write_state(path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(CoreError::storage)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).map_err(CoreError::storage)?;
    std::fs::rename(&tmp, path).map_err(CoreError::storage)
}

fn require_serial(serial: &str) -> Result<(), CoreError> {
    if serial.trim().is_empty() {
        return Err(CoreError::ValidationFailed {
            message: "device serial must not be empty".into(),
        });
    }
    Ok(())
}

// ── Registry ─────────────────────────────────────────────────────────

#[async_trait]
impl DeviceRegistry for MemoryStore {
    async fn get(&self, serial: &str) -> Result<Option<Device>, CoreError> {
        Ok(self.lock().devices.get(serial).cloned())
    }

    async fn upsert(&self, device: &Device) -> Result<(), CoreError> {
        require_serial(&device.serial)?;
        self.lock()
            .devices
            .insert(device.serial.clone(), device.clone());
        Ok(())
    }

    async fn list(&self, filter: &DeviceFilter) -> Result<Vec<Device>, CoreError> {
        let mut devices: Vec<Device> = self
            .lock()
            .devices
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        devices.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.serial.cmp(&b.serial))
        });
        if let Some(limit) = filter.limit {
            devices.truncate(limit);
        }
        Ok(devices)
    }

    async fn delete(&self, serial: &str) -> Result<bool, CoreError> {
        let mut tables = self.lock();
        let existed = tables.devices.remove(serial).is_some();
        tables.scans.retain(|s| s.serial != serial);
        Ok(existed)
    }

    async fn mark_saved(&self, serial: &str) -> Result<(), CoreError> {
        let mut tables = self.lock();
        let device = tables
            .devices
            .get_mut(serial)
            .ok_or_else(|| CoreError::DeviceNotFound {
                serial: serial.to_owned(),
            })?;
        device.is_saved = true;
        device.visible = true;
        Ok(())
    }

    async fn store_discovery_atomic(
        &self,
        device: &Device,
        scan: Option<&ScanSnapshot>,
        metrics: Option<&MetricsSnapshot>,
    ) -> Result<(), CoreError> {
        require_serial(&device.serial)?;
        if let Some(scan) = scan.filter(|s| s.serial != device.serial) {
            return Err(CoreError::ValidationFailed {
                message: format!(
                    "scan snapshot serial {} does not match device {}",
                    scan.serial, device.serial
                ),
            });
        }
        if let Some(metrics) = metrics.filter(|m| m.serial != device.serial) {
            return Err(CoreError::ValidationFailed {
                message: format!(
                    "metrics snapshot serial {} does not match device {}",
                    metrics.serial, device.serial
                ),
            });
        }

        let mut tables = self.lock();
        tables
            .devices
            .insert(device.serial.clone(), device.clone());
        if let Some(scan) = scan {
            tables.push_scan(scan);
        }
        match metrics {
            Some(m) if m.is_empty_reading() => {
                debug!(serial = %device.serial, "skipping all-zero metrics snapshot");
            }
            Some(m) => {
                tables.metrics.insert_raw(m);
            }
            None => {}
        }
        Ok(())
    }

    async fn scan_history(&self, serial: &str) -> Result<Vec<ScanSnapshot>, CoreError> {
        let mut rows: Vec<ScanSnapshot> = self
            .lock()
            .scans
            .iter()
            .filter(|s| s.serial == serial)
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.taken_at, s.id));
        Ok(rows)
    }

    async fn delete_old_scans(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let mut tables = self.lock();
        let before = tables.scans.len();
        tables.scans.retain(|s| s.taken_at >= cutoff);
        Ok((before - tables.scans.len()) as u64)
    }

    async fn delete_old_hidden_devices(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let mut tables = self.lock();
        let doomed: Vec<String> = tables
            .devices
            .values()
            .filter(|d| !d.visible && !d.is_saved && d.last_seen < cutoff)
            .map(|d| d.serial.clone())
            .collect();
        for serial in &doomed {
            tables.devices.remove(serial);
        }
        tables.scans.retain(|s| !doomed.contains(&s.serial));
        Ok(doomed.len() as u64)
    }
}

// ── Metrics ──────────────────────────────────────────────────────────

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn save_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<u64, CoreError> {
        require_serial(&snapshot.serial)?;
        if snapshot.tier != Tier::Raw {
            return Err(CoreError::ValidationFailed {
                message: format!("only raw snapshots can be saved, got {}", snapshot.tier),
            });
        }
        Ok(self.lock().metrics.insert_raw(snapshot))
    }

    async fn get_latest(&self, serial: &str) -> Result<Option<MetricsSnapshot>, CoreError> {
        Ok(self.lock().metrics.latest(serial))
    }

    async fn get_tiered_history(
        &self,
        serial: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<MetricsSnapshot>, CoreError> {
        if until < since {
            return Err(CoreError::ValidationFailed {
                message: format!("history window ends ({until}) before it starts ({since})"),
            });
        }
        Ok(self.lock().metrics.history(serial, since, until))
    }

    async fn perform_full_downsampling(&self) -> Result<DownsampleReport, CoreError> {
        let now = self.clock.now();
        Ok(self.lock().metrics.downsample(now, &self.retention))
    }

    async fn delete_metric_by_id(&self, tier: Tier, id: u64) -> Result<bool, CoreError> {
        Ok(self.lock().metrics.delete(tier, id))
    }
}

// ── Settings documents & checkpoints ─────────────────────────────────

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn load_settings(&self, key: &str) -> Result<Option<serde_json::Value>, CoreError> {
        Ok(self.lock().settings.get(key).cloned())
    }

    async fn save_settings(&self, key: &str, document: &serde_json::Value) -> Result<(), CoreError> {
        self.lock()
            .settings
            .insert(key.to_owned(), document.clone());
        Ok(())
    }
}

#[async_trait]
impl Checkpoint for MemoryStore {
    async fn checkpoint(&self) -> Result<(), CoreError> {
        match &self.state_file {
            Some(path) => self.save_to(path).await,
            None => Ok(()),
        }
    }
}
