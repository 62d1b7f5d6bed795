// ── Enrichment pipeline ──
//
// Turns a bare address from any discovery source into a reconcile
// call: cheap refresh for known devices, full identify (then one deep
// probe) for new ones.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::model::DiscoveryProtocol;
use crate::query::{DeviceQuery, Identification, QueryMode};
use crate::ratelimit::WarnLimiter;
use crate::reconcile::{Observation, Reconciler};
use crate::store::{DeviceFilter, DeviceRegistry};
use crate::discovery::AddressHandler;

/// How one address was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichOutcome {
    /// Known device answered the liveness query.
    Refreshed { serial: String, changed: bool },
    /// Known device did not answer; only `last_seen` moved.
    Touched { serial: String },
    Discovered { serial: String },
    /// Unknown address turned out to be a known serial (e.g. new IP).
    Updated { serial: String },
    /// The device answered but neither identify yielded a serial.
    NoSerial,
    Failed,
}

pub struct EnrichmentPipeline {
    registry: Arc<dyn DeviceRegistry>,
    query: Arc<dyn DeviceQuery>,
    reconciler: Arc<Reconciler>,
    limiter: WarnLimiter,
    query_timeout: Duration,
    deep_timeout: Duration,
}

impl EnrichmentPipeline {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        query: Arc<dyn DeviceQuery>,
        reconciler: Arc<Reconciler>,
        limiter: WarnLimiter,
        query_timeout: Duration,
        deep_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            query,
            reconciler,
            limiter,
            query_timeout,
            deep_timeout,
        }
    }

    /// Handle one address reported by `method`.
    ///
    /// Device failures become `Failed`/`Touched`/`NoSerial`; only
    /// storage errors are returned.
    pub async fn process(&self, addr: IpAddr, method: &str) -> Result<EnrichOutcome, CoreError> {
        let known = self
            .registry
            .list(&DeviceFilter {
                limit: Some(1),
                ..DeviceFilter::visible_at(addr)
            })
            .await?
            .into_iter()
            .next();

        if let Some(device) = known {
            match self
                .query
                .query(addr, QueryMode::Liveness, device.vendor_hint(), self.query_timeout)
                .await
            {
                Ok(id) if id.stable_serial().is_none_or(|s| s == device.serial) => {
                    let obs = self.observation(&device.serial, addr, method, id, false);
                    let outcome = self.reconciler.reconcile(&obs).await?;
                    return Ok(EnrichOutcome::Refreshed {
                        serial: device.serial,
                        changed: !outcome.changed.is_empty(),
                    });
                }
                Ok(id) => {
                    debug!(
                        ip = %addr,
                        was = %device.serial,
                        now = id.stable_serial().unwrap_or_default(),
                        "different device answered at known address"
                    );
                }
                Err(e) => {
                    self.note_failure(method, addr, "liveness refresh failed", &e);
                    self.reconciler.touch(&device.serial).await?;
                    return Ok(EnrichOutcome::Touched {
                        serial: device.serial,
                    });
                }
            }
        }

        self.identify(addr, method).await
    }

    async fn identify(&self, addr: IpAddr, method: &str) -> Result<EnrichOutcome, CoreError> {
        let full = match self
            .query
            .query(addr, QueryMode::Full, None, self.query_timeout)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.note_failure(method, addr, "identify failed", &e);
                return Ok(EnrichOutcome::Failed);
            }
        };

        let id = if full.stable_serial().is_some() {
            full
        } else {
            debug!(ip = %addr, method, "no serial from full identify, trying deep probe");
            let hint = full.attributes.manufacturer.as_deref();
            match self
                .query
                .query(addr, QueryMode::Deep, hint, self.deep_timeout)
                .await
            {
                Ok(deep) if deep.stable_serial().is_some() => merge_identifications(full, deep),
                Ok(_) => {
                    self.note_failure(method, addr, "device reported no serial", &"deep probe inconclusive");
                    return Ok(EnrichOutcome::NoSerial);
                }
                Err(e) => {
                    self.note_failure(method, addr, "deep probe failed", &e);
                    return Ok(EnrichOutcome::Failed);
                }
            }
        };

        let Some(serial) = id.stable_serial().map(str::to_owned) else {
            return Ok(EnrichOutcome::NoSerial);
        };
        let obs = self.observation(&serial, addr, method, id, true);
        let outcome = self.reconciler.reconcile(&obs).await?;
        if outcome.is_new {
            Ok(EnrichOutcome::Discovered { serial })
        } else {
            Ok(EnrichOutcome::Updated { serial })
        }
    }

    fn observation(
        &self,
        serial: &str,
        addr: IpAddr,
        method: &str,
        id: Identification,
        with_metrics: bool,
    ) -> Observation {
        Observation {
            serial: serial.to_owned(),
            ip: addr,
            attributes: id.attributes,
            discovery_method: Some(method.to_owned()),
            raw_data: id.raw,
            metrics: if with_metrics { id.metrics } else { None },
        }
    }

    fn note_failure(&self, method: &str, addr: IpAddr, what: &str, err: &dyn fmt::Display) {
        let key = format!("{method}_detect_{addr}");
        if self.limiter.should_warn(&key) {
            warn!(ip = %addr, method, error = %err, "{what}");
        } else {
            debug!(ip = %addr, method, error = %err, "{what} (suppressed)");
        }
    }
}

/// Deep results win; anything only the full identify reported is kept.
fn merge_identifications(full: Identification, deep: Identification) -> Identification {
    let mut attributes = full.attributes;
    attributes.merge_from(&deep.attributes, |_| false);
    Identification {
        serial: deep.serial,
        attributes,
        metrics: deep.metrics.or(full.metrics),
        raw: deep.raw.or(full.raw),
    }
}

#[async_trait]
impl AddressHandler for EnrichmentPipeline {
    async fn handle(&self, addr: IpAddr, protocol: DiscoveryProtocol) {
        match self.process(addr, &protocol.to_string()).await {
            Ok(outcome) => debug!(ip = %addr, %protocol, ?outcome, "address enriched"),
            Err(e) => warn!(ip = %addr, %protocol, error = %e, "enrichment failed (non-fatal)"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetentionPolicy;
    use crate::model::SharedSettings;
    use crate::store::MemoryStore;
    use crate::testing::{FakeQuery, RecordingSink};
    use chrono::{TimeDelta, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    struct Harness {
        pipeline: EnrichmentPipeline,
        store: Arc<MemoryStore>,
        query: Arc<FakeQuery>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new(clock.clone(), RetentionPolicy::default()));
        let query = Arc::new(FakeQuery::default());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            query.clone(),
            Arc::new(RecordingSink::default()),
            Arc::new(SharedSettings::default()),
            clock.clone(),
            Duration::from_secs(5),
        ));
        let pipeline = EnrichmentPipeline::new(
            store.clone(),
            query.clone(),
            reconciler,
            WarnLimiter::default(),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        Harness {
            pipeline,
            store,
            query,
            clock,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn unknown_address_gets_full_identify() {
        let h = harness();
        h.query.answer("10.0.0.5", "ABC123", "M404");

        let outcome = h.pipeline.process(ip("10.0.0.5"), "mdns").await.unwrap();
        assert_eq!(outcome, EnrichOutcome::Discovered { serial: "ABC123".into() });
        assert_eq!(h.query.calls(), vec![(ip("10.0.0.5"), QueryMode::Full)]);
    }

    #[tokio::test]
    async fn missing_serial_escalates_once_to_deep_probe() {
        let h = harness();
        h.query.answer_deep_only("10.0.0.7", "XYZ789");

        let outcome = h.pipeline.process(ip("10.0.0.7"), "ssdp").await.unwrap();
        assert_eq!(outcome, EnrichOutcome::Discovered { serial: "XYZ789".into() });
        assert_eq!(
            h.query.calls(),
            vec![(ip("10.0.0.7"), QueryMode::Full), (ip("10.0.0.7"), QueryMode::Deep)]
        );
    }

    #[tokio::test]
    async fn no_serial_after_deep_probe_gives_up() {
        let h = harness();
        h.query.answer_deep_only("10.0.0.8", "  ");

        let outcome = h.pipeline.process(ip("10.0.0.8"), "ssdp").await.unwrap();
        assert_eq!(outcome, EnrichOutcome::NoSerial);
        assert_eq!(h.query.calls().len(), 2);
        assert!(h.store.list(&DeviceFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn known_device_gets_cheap_refresh() {
        let h = harness();
        h.query.answer("10.0.0.5", "ABC123", "M404");
        h.pipeline.process(ip("10.0.0.5"), "mdns").await.unwrap();

        let outcome = h.pipeline.process(ip("10.0.0.5"), "ssdp").await.unwrap();
        assert_eq!(
            outcome,
            EnrichOutcome::Refreshed {
                serial: "ABC123".into(),
                changed: false
            }
        );
        assert_eq!(h.query.calls().last(), Some(&(ip("10.0.0.5"), QueryMode::Liveness)));
    }

    #[tokio::test]
    async fn unreachable_known_device_is_touched_not_dropped() {
        let h = harness();
        h.query.answer("10.0.0.5", "ABC123", "M404");
        h.pipeline.process(ip("10.0.0.5"), "mdns").await.unwrap();
        let before = h.store.get("ABC123").await.unwrap().unwrap();

        h.query.fail("10.0.0.5");
        h.clock.advance(TimeDelta::minutes(2));
        let outcome = h.pipeline.process(ip("10.0.0.5"), "mdns").await.unwrap();
        assert_eq!(outcome, EnrichOutcome::Touched { serial: "ABC123".into() });

        let after = h.store.get("ABC123").await.unwrap().unwrap();
        assert!(after.visible);
        assert!(after.last_seen > before.last_seen);
        assert_eq!(after.attributes, before.attributes);

        h.query.recover("10.0.0.5");
        let outcome = h.pipeline.process(ip("10.0.0.5"), "mdns").await.unwrap();
        assert!(matches!(outcome, EnrichOutcome::Refreshed { .. }));
    }

    #[tokio::test]
    async fn unreachable_unknown_address_fails_quietly() {
        let h = harness();
        h.query.fail("10.0.0.9");
        let outcome = h.pipeline.process(ip("10.0.0.9"), "llmnr").await.unwrap();
        assert_eq!(outcome, EnrichOutcome::Failed);
        assert_eq!(h.query.calls().len(), 1);
    }

    #[tokio::test]
    async fn hidden_device_is_identified_afresh() {
        let h = harness();
        h.query.answer("10.0.0.5", "ABC123", "M404");
        h.pipeline.process(ip("10.0.0.5"), "mdns").await.unwrap();

        let mut device = h.store.get("ABC123").await.unwrap().unwrap();
        device.visible = false;
        h.store.upsert(&device).await.unwrap();

        let outcome = h.pipeline.process(ip("10.0.0.5"), "mdns").await.unwrap();
        assert_eq!(outcome, EnrichOutcome::Updated { serial: "ABC123".into() });
        assert_eq!(h.query.calls().last(), Some(&(ip("10.0.0.5"), QueryMode::Full)));
    }
}
