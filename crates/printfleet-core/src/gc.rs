// ── Garbage collection ──

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::GcPolicy;
use crate::error::CoreError;
use crate::events::{EventKind, EventSink};
use crate::store::DeviceRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub scans_deleted: u64,
    pub devices_deleted: u64,
}

pub struct GarbageCollector {
    registry: Arc<dyn DeviceRegistry>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    policy: GcPolicy,
}

impl GarbageCollector {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        policy: GcPolicy,
    ) -> Self {
        Self {
            registry,
            events,
            clock,
            policy,
        }
    }

    /// Delete old scan history and long-hidden unsaved devices.
    ///
    /// The two deletions are independent: if one fails the other still
    /// runs, and the first error is returned after both were tried.
    pub async fn run_once(&self) -> Result<GcReport, CoreError> {
        let now = self.clock.now();
        let mut report = GcReport::default();
        let mut first_error = None;

        match self
            .registry
            .delete_old_scans(now - self.policy.scan_history_horizon())
            .await
        {
            Ok(n) => report.scans_deleted = n,
            Err(e) => {
                warn!(error = %e, "scan history cleanup failed");
                first_error = Some(e);
            }
        }

        match self
            .registry
            .delete_old_hidden_devices(now - self.policy.hidden_device_horizon())
            .await
        {
            Ok(n) => report.devices_deleted = n,
            Err(e) => {
                warn!(error = %e, "hidden device cleanup failed");
                first_error.get_or_insert(e);
            }
        }

        info!(
            scans_deleted = report.scans_deleted,
            devices_deleted = report.devices_deleted,
            "garbage collection complete"
        );
        self.events
            .publish(EventKind::GarbageCollected, json!(report));

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}
