// ── Discovery manager ──
//
// Owns one lifecycle slot per protocol plus the metrics rescan task and
// keeps them in step with the current settings. Every settings change,
// whether a single toggle or a whole document, funnels through `sync`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use strum::IntoEnumIterator;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::lifecycle::ListenerTask;
use super::listener::ListenerFactory;
use super::scanner::ActiveScanner;
use super::sink::{AddressHandler, AddressSink};
use crate::collect::MetricsCollector;
use crate::error::CoreError;
use crate::model::{DiscoveryProtocol, DiscoverySettings, SettingsSource, SharedSettings};
use crate::query::DeviceQuery;
use crate::throttle::ThrottleMap;

/// How long shutdown waits for in-flight enrichment.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ManagerParts {
    pub settings: Arc<SharedSettings>,
    pub factory: Arc<dyn ListenerFactory>,
    pub handler: Arc<dyn AddressHandler>,
    pub query: Arc<dyn DeviceQuery>,
    /// Runs the metrics rescan when settings enable it.
    pub collector: Option<Arc<MetricsCollector>>,
    pub query_timeout: Duration,
    pub throttle_window: Duration,
    pub stop_timeout: Duration,
}

pub struct DiscoveryManager {
    settings: Arc<SharedSettings>,
    factory: Arc<dyn ListenerFactory>,
    handler: Arc<dyn AddressHandler>,
    query: Arc<dyn DeviceQuery>,
    collector: Option<Arc<MetricsCollector>>,
    query_timeout: Duration,
    listeners: BTreeMap<DiscoveryProtocol, ListenerTask>,
    throttles: BTreeMap<DiscoveryProtocol, Arc<ThrottleMap>>,
    rescan: ListenerTask,
    scan_period: watch::Sender<Duration>,
    rescan_period: watch::Sender<Duration>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    sync_lock: Mutex<()>,
}

impl DiscoveryManager {
    pub fn new(parts: ManagerParts, cancel: CancellationToken) -> Self {
        let current = parts.settings.current();
        let listeners = DiscoveryProtocol::iter()
            .map(|p| (p, ListenerTask::new(p.to_string(), parts.stop_timeout)))
            .collect();
        let throttles = DiscoveryProtocol::iter()
            .filter(|p| p.is_passive())
            .map(|p| (p, Arc::new(ThrottleMap::new(parts.throttle_window))))
            .collect();
        let (scan_period, _) = watch::channel(current.active_scan_interval());
        let (rescan_period, _) = watch::channel(current.metrics_rescan_interval());

        Self {
            settings: parts.settings,
            factory: parts.factory,
            handler: parts.handler,
            query: parts.query,
            collector: parts.collector,
            query_timeout: parts.query_timeout,
            listeners,
            throttles,
            rescan: ListenerTask::new("metrics_rescan", parts.stop_timeout),
            scan_period,
            rescan_period,
            tracker: TaskTracker::new(),
            cancel,
            sync_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> Arc<DiscoverySettings> {
        self.settings.current()
    }

    pub fn throttle(&self, protocol: DiscoveryProtocol) -> Option<&Arc<ThrottleMap>> {
        self.throttles.get(&protocol)
    }

    /// Sink that feeds `protocol`'s addresses into enrichment, throttled
    /// for passive protocols.
    pub fn sink(&self, protocol: DiscoveryProtocol) -> AddressSink {
        AddressSink::new(
            protocol,
            self.throttles.get(&protocol).cloned(),
            self.handler.clone(),
            self.tracker.clone(),
        )
    }

    // ── Settings entry points ────────────────────────────────────────

    /// Flip one protocol's own flag and bring listeners in line.
    ///
    /// Idempotent. The master switch still applies: enabling a protocol
    /// while automatic discovery is off records the flag but starts
    /// nothing.
    pub async fn set_enabled(&self, protocol: DiscoveryProtocol, enabled: bool) {
        self.settings
            .update(|next| next.set_protocol_flag(protocol, enabled));
        self.sync().await;
    }

    /// Flip the master switch. Off stops every automatic source.
    pub async fn set_auto_discover(&self, enabled: bool) {
        self.settings.update(|next| next.auto_discover_enabled = enabled);
        self.sync().await;
    }

    /// Parse, migrate, and validate `document`, then swap it in.
    /// Nothing changes when the document is rejected.
    pub async fn apply_settings(&self, document: Value) -> Result<Arc<DiscoverySettings>, CoreError> {
        let settings = DiscoverySettings::from_document(document)?;
        self.apply(settings).await
    }

    pub async fn apply(&self, settings: DiscoverySettings) -> Result<Arc<DiscoverySettings>, CoreError> {
        settings.validate()?;
        self.settings.replace(settings);
        self.sync().await;
        Ok(self.settings.current())
    }

    // ── Reconciling tasks with settings ──────────────────────────────

    /// Start what the settings enable and stop what they do not.
    pub async fn sync(&self) {
        let _guard = self.sync_lock.lock().await;
        let settings = self.settings.current();

        self.scan_period
            .send_if_modified(|p| replace_if_changed(p, settings.active_scan_interval()));
        self.rescan_period
            .send_if_modified(|p| replace_if_changed(p, settings.metrics_rescan_interval()));

        for (protocol, task) in &self.listeners {
            if settings.protocol_enabled(*protocol) {
                self.start_protocol(*protocol, task).await;
            } else if task.stop().await {
                if let Some(throttle) = self.throttles.get(protocol) {
                    throttle.clear();
                }
                info!(%protocol, "discovery source stopped");
            }
        }

        match &self.collector {
            Some(collector) if settings.metrics_rescan_enabled => {
                let collector = collector.clone();
                let period = self.rescan_period.subscribe();
                if self
                    .rescan
                    .start(&self.cancel, move |cancel| collector.run(period, cancel))
                    .await
                {
                    info!("metrics rescan started");
                }
            }
            _ => {
                if self.rescan.stop().await {
                    info!("metrics rescan stopped");
                }
            }
        }
    }

    async fn start_protocol(&self, protocol: DiscoveryProtocol, task: &ListenerTask) {
        if task.is_running().await {
            return;
        }
        let sink = self.sink(protocol);

        let started = if protocol == DiscoveryProtocol::ActiveScan {
            let scanner = ActiveScanner::new(
                self.query.clone(),
                self.settings.clone(),
                sink,
                self.query_timeout,
            );
            let period = self.scan_period.subscribe();
            task.start(&self.cancel, move |cancel| scanner.run(period, cancel))
                .await
        } else {
            let Some(listener) = self.factory.create(protocol) else {
                warn!(%protocol, "no listener available for protocol");
                return;
            };
            task.start(&self.cancel, move |cancel| async move {
                if let Err(e) = listener.run(sink, cancel).await {
                    warn!(%protocol, error = %e, "listener stopped (non-fatal)");
                }
            })
            .await
        };
        if started {
            info!(%protocol, "discovery source started");
        }
    }

    // ── Introspection & shutdown ─────────────────────────────────────

    pub async fn is_running(&self, protocol: DiscoveryProtocol) -> bool {
        match self.listeners.get(&protocol) {
            Some(task) => task.is_running().await,
            None => false,
        }
    }

    /// Protocols whose task is currently alive.
    pub async fn running(&self) -> Vec<DiscoveryProtocol> {
        let mut out = Vec::new();
        for (protocol, task) in &self.listeners {
            if task.is_running().await {
                out.push(*protocol);
            }
        }
        out
    }

    pub async fn rescan_running(&self) -> bool {
        self.rescan.is_running().await
    }

    /// Stop every task and wait (bounded) for in-flight enrichment.
    pub async fn stop_all(&self) {
        let _guard = self.sync_lock.lock().await;
        for task in self.listeners.values() {
            task.stop().await;
        }
        self.rescan.stop().await;

        self.tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(pending = self.tracker.len(), "enrichment tasks still running at shutdown");
        }
        debug!("discovery stopped");
    }
}

fn replace_if_changed(current: &mut Duration, next: Duration) -> bool {
    if *current == next {
        false
    } else {
        *current = next;
        true
    }
}
