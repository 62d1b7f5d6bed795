// ── Metrics collection ──
//
// Reads counters from a device and appends a raw row. The rescan loop
// walks every saved, visible device on a period taken from settings;
// one device failing never stops the pass.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::CoreError;
use crate::events::{EventKind, EventSink};
use crate::model::MetricsSnapshot;
use crate::query::{DeviceQuery, with_deadline};
use crate::ratelimit::WarnLimiter;
use crate::store::{DeviceFilter, DeviceRegistry, MetricsStore};

/// Counts from one rescan pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescanReport {
    pub attempted: usize,
    pub collected: usize,
    pub failed: usize,
}

pub struct MetricsCollector {
    registry: Arc<dyn DeviceRegistry>,
    metrics: Arc<dyn MetricsStore>,
    query: Arc<dyn DeviceQuery>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    limiter: WarnLimiter,
    timeout: Duration,
}

impl MetricsCollector {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        metrics: Arc<dyn MetricsStore>,
        query: Arc<dyn DeviceQuery>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        limiter: WarnLimiter,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            query,
            events,
            clock,
            limiter,
            timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Read counters from `addr` and store them as a raw row for
    /// `serial`.
    ///
    /// Learned identifiers recorded on the device are passed along so
    /// the query can target them directly. A reading with no primary
    /// counters is returned but not stored.
    pub async fn collect(
        &self,
        serial: &str,
        addr: IpAddr,
        vendor_hint: Option<&str>,
        timeout: Duration,
    ) -> Result<MetricsSnapshot, CoreError> {
        let learned = self
            .registry
            .get(serial)
            .await?
            .map(|d| d.learned_oids)
            .unwrap_or_default();

        let reading = with_deadline(
            addr,
            timeout,
            self.query.collect_metrics(addr, vendor_hint, &learned, timeout),
        )
        .await?;

        let mut snapshot = MetricsSnapshot::raw(serial, self.clock.now(), reading);
        if snapshot.is_empty_reading() {
            debug!(serial = %serial, ip = %addr, "empty metrics reading, not stored");
            return Ok(snapshot);
        }

        snapshot.id = self.metrics.save_snapshot(&snapshot).await?;
        self.events.publish(
            EventKind::MetricsCollected,
            json!({
                "serial": serial,
                "id": snapshot.id,
                "timestamp": snapshot.timestamp,
                "learned_oids": !learned.is_empty(),
            }),
        );
        Ok(snapshot)
    }

    /// Collect from every saved, visible device once.
    pub async fn rescan_pass(&self) -> Result<RescanReport, CoreError> {
        let devices = self
            .registry
            .list(&DeviceFilter::saved_and_visible())
            .await?;

        let mut report = RescanReport::default();
        for device in devices {
            report.attempted += 1;
            match self
                .collect(&device.serial, device.ip, device.vendor_hint(), self.timeout)
                .await
            {
                Ok(_) => report.collected += 1,
                Err(e) => {
                    report.failed += 1;
                    let key = format!("metrics_collect_{}", device.serial);
                    if self.limiter.should_warn(&key) {
                        warn!(serial = %device.serial, ip = %device.ip, error = %e, "metrics collection failed");
                    } else {
                        debug!(serial = %device.serial, error = %e, "metrics collection failed (suppressed)");
                    }
                }
            }
        }

        info!(
            attempted = report.attempted,
            collected = report.collected,
            failed = report.failed,
            "metrics rescan complete"
        );
        Ok(report)
    }

    /// Rescan every period until cancelled. The first pass runs one
    /// period after start.
    pub async fn run(self: Arc<Self>, mut period: watch::Receiver<Duration>, cancel: CancellationToken) {
        let mut period_open = true;
        let mut next = tokio::time::Instant::now() + *period.borrow_and_update();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep_until(next) => {
                    if let Err(e) = self.rescan_pass().await {
                        warn!(error = %e, "metrics rescan failed");
                    }
                    next = tokio::time::Instant::now() + *period.borrow_and_update();
                }
                changed = period.changed(), if period_open => {
                    if changed.is_err() {
                        period_open = false;
                    } else {
                        next = tokio::time::Instant::now() + *period.borrow_and_update();
                    }
                }
            }
        }
    }
}
