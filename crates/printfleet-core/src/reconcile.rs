// ── Reconciliation engine ──
//
// Folds an observation into the registry. Every write for one serial
// happens under that serial's mutex; different serials never contend.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::CoreError;
use crate::events::{EventKind, EventSink};
use crate::model::{
    Device, DeviceAttributes, DeviceField, FieldLock, LockField, MetricsReading, MetricsSnapshot,
    ScanSnapshot, SettingsSource, USER_LOCKED,
};
use crate::query::DeviceQuery;
use crate::store::DeviceRegistry;

/// What a discovery or refresh saw for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub serial: String,
    pub ip: IpAddr,
    pub attributes: DeviceAttributes,
    pub discovery_method: Option<String>,
    pub raw_data: Option<serde_json::Value>,
    pub metrics: Option<MetricsReading>,
}

impl Observation {
    pub fn new(serial: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            serial: serial.into(),
            ip,
            attributes: DeviceAttributes::default(),
            discovery_method: None,
            raw_data: None,
            metrics: None,
        }
    }
}

/// Result of one `reconcile` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub is_new: bool,
    /// Fields whose stored value changed. Empty for a new device.
    pub changed: Vec<DeviceField>,
}

/// Result of locking a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOutcome {
    /// `false` when the field was already locked.
    pub newly_locked: bool,
    pub learned_oid: Option<String>,
}

pub struct Reconciler {
    registry: Arc<dyn DeviceRegistry>,
    query: Arc<dyn DeviceQuery>,
    events: Arc<dyn EventSink>,
    settings: Arc<dyn SettingsSource>,
    clock: Arc<dyn Clock>,
    search_timeout: Duration,
    device_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        query: Arc<dyn DeviceQuery>,
        events: Arc<dyn EventSink>,
        settings: Arc<dyn SettingsSource>,
        clock: Arc<dyn Clock>,
        search_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            query,
            events,
            settings,
            clock,
            search_timeout,
            device_locks: DashMap::new(),
        }
    }

    fn device_lock(&self, serial: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.device_locks
                .entry(serial.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    async fn load(&self, serial: &str) -> Result<Device, CoreError> {
        self.registry
            .get(serial)
            .await?
            .ok_or_else(|| CoreError::DeviceNotFound {
                serial: serial.to_owned(),
            })
    }

    // ── Reconcile ────────────────────────────────────────────────────

    /// Merge `obs` into the registry with a single atomic write.
    ///
    /// Unlocked fields take the observed value, `last_seen` always
    /// moves, and an audit snapshot is written for new devices and for
    /// real changes only.
    pub async fn reconcile(&self, obs: &Observation) -> Result<ReconcileOutcome, CoreError> {
        let serial = obs.serial.trim();
        if serial.is_empty() {
            return Err(CoreError::ValidationFailed {
                message: "observation has no serial".into(),
            });
        }

        let lock = self.device_lock(serial);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        let Some(mut device) = self.registry.get(serial).await? else {
            let mut device = Device::discovered(serial, obs.ip, now);
            device.merge(obs.ip, &obs.attributes);
            device.discovery_method.clone_from(&obs.discovery_method);
            device.raw_data.clone_from(&obs.raw_data);
            if self.settings.current().autosave_discovered_devices {
                device.is_saved = true;
            }

            let scan = ScanSnapshot::of(&device, now);
            let metrics = metrics_row(serial, now, obs.metrics.as_ref());
            self.registry
                .store_discovery_atomic(&device, Some(&scan), metrics.as_ref())
                .await?;

            info!(
                serial = %serial,
                ip = %obs.ip,
                method = obs.discovery_method.as_deref().unwrap_or("manual"),
                "new device discovered"
            );
            self.events.publish(
                EventKind::DeviceDiscovered,
                json!({
                    "serial": serial,
                    "ip": obs.ip.to_string(),
                    "discovery_method": obs.discovery_method,
                    "is_saved": device.is_saved,
                }),
            );
            return Ok(ReconcileOutcome {
                is_new: true,
                changed: Vec::new(),
            });
        };

        let changed = device.merge(obs.ip, &obs.attributes);
        let raw_changed = obs.raw_data.is_some() && obs.raw_data != device.raw_data;
        if raw_changed {
            device.raw_data.clone_from(&obs.raw_data);
        }
        device.last_seen = now.max(device.last_seen);

        let scan = (!changed.is_empty() || raw_changed).then(|| ScanSnapshot::of(&device, now));
        let metrics = metrics_row(serial, now, obs.metrics.as_ref());
        self.registry
            .store_discovery_atomic(&device, scan.as_ref(), metrics.as_ref())
            .await?;

        if changed.is_empty() {
            debug!(serial = %serial, "device refreshed, nothing changed");
        } else {
            let fields: Vec<String> = changed.iter().map(ToString::to_string).collect();
            debug!(serial = %serial, fields = ?fields, "device updated");
            self.events.publish(
                EventKind::DeviceUpdated,
                json!({ "serial": serial, "changed": fields }),
            );
        }

        Ok(ReconcileOutcome {
            is_new: false,
            changed,
        })
    }

    /// Refresh `last_seen` only. Used when a known device was heard
    /// from but could not be queried.
    pub async fn touch(&self, serial: &str) -> Result<(), CoreError> {
        let lock = self.device_lock(serial);
        let _guard = lock.lock().await;
        let mut device = self.load(serial).await?;
        device.last_seen = self.clock.now().max(device.last_seen);
        self.registry.upsert(&device).await
    }

    // ── Field locks ──────────────────────────────────────────────────

    /// Pin `field`, optionally to `current_value`.
    ///
    /// When a value is supplied, the query collaborator is asked once
    /// for the identifier yielding it. An inconclusive or failed search
    /// never prevents the lock.
    pub async fn lock_field(
        &self,
        serial: &str,
        field: LockField,
        current_value: Option<&str>,
        locked_by: Option<&str>,
    ) -> Result<LockOutcome, CoreError> {
        let snapshot = self.load(serial).await?;
        let value = current_value.map(str::trim).filter(|v| !v.is_empty());

        // The search is device I/O: run it before taking the device lock.
        let learned_oid = match value {
            Some(value) => self.search(&snapshot, field, value).await,
            None => None,
        };

        let lock = self.device_lock(serial);
        let _guard = lock.lock().await;
        let mut device = self.load(serial).await?;
        let now = self.clock.now();

        if let (Some(value), LockField::Attribute(attr)) = (value, field) {
            if attr == DeviceField::Ip {
                match value.parse() {
                    Ok(ip) => device.ip = ip,
                    Err(_) => {
                        return Err(CoreError::ValidationFailed {
                            message: format!("'{value}' is not an IP address"),
                        });
                    }
                }
            } else if !device.attributes.set_text(attr, value) {
                debug!(serial = %serial, field = %attr, "list field locked without a curated value");
            }
        }

        let newly_locked = device.lock(FieldLock {
            field,
            reason: USER_LOCKED.into(),
            locked_at: now,
            locked_by: locked_by.map(str::to_owned),
        });
        if let Some(oid) = &learned_oid {
            device.learned_oids.record(field, oid.clone(), now);
        }
        self.registry.upsert(&device).await?;

        info!(serial = %serial, field = %field, learned = learned_oid.is_some(), "field locked");
        self.events.publish(
            EventKind::FieldLocked,
            json!({
                "serial": serial,
                "field": field.to_string(),
                "learned_oid": learned_oid,
            }),
        );
        Ok(LockOutcome {
            newly_locked,
            learned_oid,
        })
    }

    async fn search(&self, device: &Device, field: LockField, value: &str) -> Option<String> {
        match self
            .query
            .search_value(device.ip, device.vendor_hint(), field, value, self.search_timeout)
            .await
        {
            Ok(Some(oid)) => Some(oid),
            Ok(None) => {
                debug!(serial = %device.serial, field = %field, "value search inconclusive");
                None
            }
            Err(e) => {
                warn!(serial = %device.serial, field = %field, error = %e, "value search failed (non-fatal)");
                None
            }
        }
    }

    /// Remove the lock on `field`. Returns whether one existed.
    pub async fn unlock_field(&self, serial: &str, field: LockField) -> Result<bool, CoreError> {
        let lock = self.device_lock(serial);
        let _guard = lock.lock().await;
        let mut device = self.load(serial).await?;
        if !device.unlock(field) {
            return Ok(false);
        }
        self.registry.upsert(&device).await?;
        self.events.publish(
            EventKind::FieldUnlocked,
            json!({ "serial": serial, "field": field.to_string() }),
        );
        Ok(true)
    }

    /// Forget the per-device mutex of a deleted device.
    pub(crate) fn forget(&self, serial: &str) {
        self.device_locks.remove(serial);
    }
}

fn metrics_row(
    serial: &str,
    at: chrono::DateTime<chrono::Utc>,
    reading: Option<&MetricsReading>,
) -> Option<MetricsSnapshot> {
    reading.map(|r| MetricsSnapshot::raw(serial, at, r.clone()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetentionPolicy;
    use crate::model::{Counter, DiscoverySettings, SharedSettings};
    use crate::store::{MemoryStore, MetricsStore};
    use crate::testing::{FakeQuery, RecordingSink};
    use chrono::{TimeDelta, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    struct Harness {
        reconciler: Reconciler,
        store: Arc<MemoryStore>,
        query: Arc<FakeQuery>,
        events: Arc<RecordingSink>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(settings: DiscoverySettings) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new(clock.clone(), RetentionPolicy::default()));
        let query = Arc::new(FakeQuery::default());
        let events = Arc::new(RecordingSink::default());
        let reconciler = Reconciler::new(
            store.clone(),
            query.clone(),
            events.clone(),
            Arc::new(SharedSettings::new(settings)),
            clock.clone(),
            Duration::from_secs(5),
        );
        Harness {
            reconciler,
            store,
            query,
            events,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(DiscoverySettings::default())
    }

    fn observation() -> Observation {
        let mut obs = Observation::new("ABC123", "10.0.0.5".parse().unwrap());
        obs.discovery_method = Some("mdns".into());
        obs.attributes.manufacturer = Some("HP".into());
        obs.attributes.model = Some("LaserJet M404".into());
        obs.attributes.hostname = Some("npi0a1b2c".into());
        obs.metrics = Some(MetricsReading {
            counters: [(Counter::PageCount, 1500)].into(),
            supplies: [("black".to_owned(), 60)].into(),
        });
        obs
    }

    #[tokio::test]
    async fn new_device_is_visible_and_unsaved() {
        let h = harness();
        let outcome = h.reconciler.reconcile(&observation()).await.unwrap();
        assert!(outcome.is_new);

        let device = h.store.get("ABC123").await.unwrap().unwrap();
        assert!(device.visible);
        assert!(!device.is_saved);
        assert_eq!(device.first_seen, device.last_seen);
        assert_eq!(device.discovery_method.as_deref(), Some("mdns"));
        assert_eq!(h.store.scan_history("ABC123").await.unwrap().len(), 1);
        assert!(h.store.get_latest("ABC123").await.unwrap().is_some());
        assert_eq!(h.events.kinds(), vec![EventKind::DeviceDiscovered]);
    }

    #[tokio::test]
    async fn autosave_promotes_new_devices() {
        let h = harness_with(DiscoverySettings {
            autosave_discovered_devices: true,
            ..DiscoverySettings::default()
        });
        h.reconciler.reconcile(&observation()).await.unwrap();
        assert!(h.store.get("ABC123").await.unwrap().unwrap().is_saved);
    }

    #[tokio::test]
    async fn reconciling_twice_only_moves_last_seen() {
        let h = harness();
        let obs = observation();
        h.reconciler.reconcile(&obs).await.unwrap();
        let first = h.store.get("ABC123").await.unwrap().unwrap();

        h.clock.advance(TimeDelta::minutes(3));
        let outcome = h.reconciler.reconcile(&obs).await.unwrap();
        assert!(!outcome.is_new);
        assert!(outcome.changed.is_empty());

        let second = h.store.get("ABC123").await.unwrap().unwrap();
        assert!(second.last_seen > first.last_seen);
        assert_eq!(
            Device {
                last_seen: first.last_seen,
                ..second
            },
            first
        );
        assert_eq!(h.store.scan_history("ABC123").await.unwrap().len(), 1);
        assert_eq!(h.events.count(EventKind::DeviceUpdated), 0);
    }

    #[tokio::test]
    async fn locked_fields_survive_reconcile() {
        let h = harness();
        h.reconciler.reconcile(&observation()).await.unwrap();
        h.reconciler
            .lock_field(
                "ABC123",
                LockField::Attribute(DeviceField::Hostname),
                Some("front-desk"),
                Some("admin"),
            )
            .await
            .unwrap();

        let mut obs = observation();
        obs.attributes.hostname = Some("npi-renamed".into());
        obs.attributes.firmware = Some("20250101".into());
        h.clock.advance(TimeDelta::minutes(1));
        let outcome = h.reconciler.reconcile(&obs).await.unwrap();

        assert_eq!(outcome.changed, vec![DeviceField::Firmware]);
        let device = h.store.get("ABC123").await.unwrap().unwrap();
        assert_eq!(device.attributes.hostname.as_deref(), Some("front-desk"));
        assert_eq!(device.attributes.firmware.as_deref(), Some("20250101"));
        assert_eq!(h.store.scan_history("ABC123").await.unwrap().len(), 2);
        assert_eq!(h.events.count(EventKind::DeviceUpdated), 1);
    }

    #[tokio::test]
    async fn lock_records_learned_oid_when_search_succeeds() {
        let h = harness();
        h.reconciler.reconcile(&observation()).await.unwrap();
        h.query.search_finds("1.3.6.1.2.1.43.10.2.1.4.1.1");

        let outcome = h
            .reconciler
            .lock_field("ABC123", LockField::Counter(Counter::PageCount), Some("1500"), None)
            .await
            .unwrap();
        assert!(outcome.newly_locked);

        let device = h.store.get("ABC123").await.unwrap().unwrap();
        assert_eq!(
            device.learned_oids.page_count.as_deref(),
            Some("1.3.6.1.2.1.43.10.2.1.4.1.1")
        );
        assert!(device.learned_oids.learned_at.is_some());
    }

    #[tokio::test]
    async fn lock_applies_even_when_search_is_inconclusive_or_fails() {
        let h = harness();
        h.reconciler.reconcile(&observation()).await.unwrap();

        let outcome = h
            .reconciler
            .lock_field("ABC123", LockField::Counter(Counter::PageCount), Some("1500"), None)
            .await
            .unwrap();
        assert!(outcome.newly_locked);
        assert_eq!(outcome.learned_oid, None);

        h.query.search_fails("device went away");
        let outcome = h
            .reconciler
            .lock_field("ABC123", LockField::Attribute(DeviceField::Model), Some("M404dn"), None)
            .await
            .unwrap();
        assert!(outcome.newly_locked);

        let device = h.store.get("ABC123").await.unwrap().unwrap();
        assert!(device.is_locked(LockField::Counter(Counter::PageCount)));
        assert_eq!(device.attributes.model.as_deref(), Some("M404dn"));
        assert!(device.learned_oids.is_empty());
        assert_eq!(h.events.count(EventKind::FieldLocked), 2);
    }

    #[tokio::test]
    async fn unlock_restores_enrichment() {
        let h = harness();
        h.reconciler.reconcile(&observation()).await.unwrap();
        let field = LockField::Attribute(DeviceField::Hostname);
        h.reconciler
            .lock_field("ABC123", field, Some("pinned"), None)
            .await
            .unwrap();

        assert!(h.reconciler.unlock_field("ABC123", field).await.unwrap());
        assert!(!h.reconciler.unlock_field("ABC123", field).await.unwrap());

        h.reconciler.reconcile(&observation()).await.unwrap();
        let device = h.store.get("ABC123").await.unwrap().unwrap();
        assert_eq!(device.attributes.hostname.as_deref(), Some("npi0a1b2c"));
        assert_eq!(h.events.count(EventKind::FieldUnlocked), 1);
    }

    #[tokio::test]
    async fn touch_only_moves_last_seen() {
        let h = harness();
        h.reconciler.reconcile(&observation()).await.unwrap();
        let before = h.store.get("ABC123").await.unwrap().unwrap();

        h.clock.advance(TimeDelta::seconds(30));
        h.reconciler.touch("ABC123").await.unwrap();
        let after = h.store.get("ABC123").await.unwrap().unwrap();
        assert_eq!(after.last_seen, before.last_seen + TimeDelta::seconds(30));
        assert_eq!(after.attributes, before.attributes);

        assert!(matches!(
            h.reconciler.touch("MISSING").await,
            Err(CoreError::DeviceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn blank_serial_is_rejected() {
        let h = harness();
        let obs = Observation::new("  ", "10.0.0.5".parse().unwrap());
        assert!(matches!(
            h.reconciler.reconcile(&obs).await,
            Err(CoreError::ValidationFailed { .. })
        ));
    }
}
