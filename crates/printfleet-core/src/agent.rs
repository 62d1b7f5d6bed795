// ── Agent ──
//
// The facade the binary talks to. Wires the stores, query client and
// event sink into the reconciler, enrichment pipeline, discovery
// manager and maintenance schedulers, and owns their background tasks.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::collect::{MetricsCollector, RescanReport};
use crate::config::EngineConfig;
use crate::discovery::{DiscoveryManager, ListenerFactory, ManagerParts};
use crate::enrich::{EnrichOutcome, EnrichmentPipeline};
use crate::error::CoreError;
use crate::events::{EventKind, EventSink};
use crate::gc::{GarbageCollector, GcReport};
use crate::model::{
    DiscoveryProtocol, DiscoverySettings, LockField, MetricsSnapshot, SettingsSource,
    SharedSettings,
};
use crate::query::DeviceQuery;
use crate::ratelimit::WarnLimiter;
use crate::reconcile::{LockOutcome, Observation, ReconcileOutcome, Reconciler};
use crate::store::{
    Checkpoint, DeviceRegistry, DownsampleReport, MemoryStore, MetricsStore, SettingsStore,
};

/// Key of the discovery settings document in the settings store.
pub const SETTINGS_KEY: &str = "discovery";

/// Collaborators an agent is built from.
pub struct AgentParts {
    pub config: EngineConfig,
    /// Used until a stored settings document is found.
    pub settings: DiscoverySettings,
    pub registry: Arc<dyn DeviceRegistry>,
    pub metrics: Arc<dyn MetricsStore>,
    pub settings_store: Arc<dyn SettingsStore>,
    pub checkpoint: Option<Arc<dyn Checkpoint>>,
    pub query: Arc<dyn DeviceQuery>,
    pub events: Arc<dyn EventSink>,
    pub listeners: Arc<dyn ListenerFactory>,
    pub clock: Arc<dyn Clock>,
}

/// Cheaply cloneable handle to one running agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: EngineConfig,
    settings: Arc<SharedSettings>,
    registry: Arc<dyn DeviceRegistry>,
    metrics: Arc<dyn MetricsStore>,
    settings_store: Arc<dyn SettingsStore>,
    checkpoint: Option<Arc<dyn Checkpoint>>,
    events: Arc<dyn EventSink>,
    reconciler: Arc<Reconciler>,
    pipeline: Arc<EnrichmentPipeline>,
    collector: Arc<MetricsCollector>,
    gc: GarbageCollector,
    manager: DiscoveryManager,
    cancel: CancellationToken,
    started: AtomicBool,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(parts: AgentParts) -> Self {
        let AgentParts {
            config,
            settings,
            registry,
            metrics,
            settings_store,
            checkpoint,
            query,
            events,
            listeners,
            clock,
        } = parts;

        let settings = Arc::new(SharedSettings::new(settings));
        let query_timeout = config.effective_query_timeout();
        let cancel = CancellationToken::new();

        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            query.clone(),
            events.clone(),
            settings.clone(),
            clock.clone(),
            query_timeout,
        ));
        let pipeline = Arc::new(EnrichmentPipeline::new(
            registry.clone(),
            query.clone(),
            reconciler.clone(),
            WarnLimiter::new(config.warn_interval),
            query_timeout,
            config.deep_scan_timeout,
        ));
        let collector = Arc::new(MetricsCollector::new(
            registry.clone(),
            metrics.clone(),
            query.clone(),
            events.clone(),
            clock.clone(),
            WarnLimiter::new(config.warn_interval),
            query_timeout,
        ));
        let gc = GarbageCollector::new(registry.clone(), events.clone(), clock, config.gc);
        let manager = DiscoveryManager::new(
            ManagerParts {
                settings: settings.clone(),
                factory: listeners,
                handler: pipeline.clone(),
                query,
                collector: Some(collector.clone()),
                query_timeout,
                throttle_window: config.throttle_window,
                stop_timeout: config.listener_stop_timeout,
            },
            cancel.child_token(),
        );

        Self {
            inner: Arc::new(AgentInner {
                config,
                settings,
                registry,
                metrics,
                settings_store,
                checkpoint,
                events,
                reconciler,
                pipeline,
                collector,
                gc,
                manager,
                cancel,
                started: AtomicBool::new(false),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Agent over a `MemoryStore`, loaded from and checkpointed to
    /// `config.state_file` when one is set.
    pub fn with_memory_store(
        config: EngineConfig,
        settings: DiscoverySettings,
        query: Arc<dyn DeviceQuery>,
        events: Arc<dyn EventSink>,
        listeners: Arc<dyn ListenerFactory>,
    ) -> Result<Self, CoreError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(match &config.state_file {
            Some(path) => MemoryStore::open(path, clock.clone(), config.retention)?,
            None => MemoryStore::new(clock.clone(), config.retention),
        });
        Ok(Self::new(AgentParts {
            config,
            settings,
            registry: store.clone(),
            metrics: store.clone(),
            settings_store: store.clone(),
            checkpoint: Some(store),
            query,
            events,
            listeners,
            clock,
        }))
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.inner.registry
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsStore> {
        &self.inner.metrics
    }

    pub fn settings(&self) -> Arc<DiscoverySettings> {
        self.inner.settings.current()
    }

    pub fn manager(&self) -> &DiscoveryManager {
        &self.inner.manager
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Load stored settings, start discovery, and spawn the
    /// downsampling and garbage-collection loops.
    pub async fn start(&self) -> Result<(), CoreError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            warn!("agent already started");
            return Ok(());
        }
        if let Err(e) = self.apply_initial_settings().await {
            self.inner.started.store(false, Ordering::Release);
            return Err(e);
        }

        let config = &self.inner.config;
        let mut handles = self.inner.task_handles.lock().await;
        handles.push(tokio::spawn(downsample_task(
            self.clone(),
            config.downsample_initial_delay,
            config.downsample_interval,
            self.inner.cancel.clone(),
        )));
        handles.push(tokio::spawn(gc_task(
            self.clone(),
            config.gc_interval,
            self.inner.cancel.clone(),
        )));
        drop(handles);

        let running = self.inner.manager.running().await;
        info!(?running, "agent started");
        Ok(())
    }

    /// Stored settings win over the configured ones unless they fail
    /// validation.
    async fn apply_initial_settings(&self) -> Result<(), CoreError> {
        let settings = match self.inner.settings_store.load_settings(SETTINGS_KEY).await? {
            Some(document) => match DiscoverySettings::from_document(document) {
                Ok(stored) => {
                    debug!("using stored discovery settings");
                    stored
                }
                Err(e) => {
                    warn!(error = %e, "stored discovery settings rejected, using configured defaults");
                    (*self.inner.settings.current()).clone()
                }
            },
            None => (*self.inner.settings.current()).clone(),
        };
        self.inner.manager.apply(settings).await?;
        Ok(())
    }

    /// Stop every task and persist state.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        drop(handles);

        self.inner.manager.stop_all().await;
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "final state save failed");
        }
        info!("agent stopped");
    }

    async fn checkpoint(&self) -> Result<(), CoreError> {
        match &self.inner.checkpoint {
            Some(checkpoint) => checkpoint.checkpoint().await,
            None => Ok(()),
        }
    }

    // ── Discovery control ────────────────────────────────────────────

    pub async fn set_discovery_enabled(
        &self,
        protocol: DiscoveryProtocol,
        enabled: bool,
    ) -> Result<(), CoreError> {
        self.inner.manager.set_enabled(protocol, enabled).await;
        self.persist_settings().await
    }

    /// Validate and apply a settings document (any supported version),
    /// then store its normalised form.
    pub async fn apply_settings(&self, document: Value) -> Result<Arc<DiscoverySettings>, CoreError> {
        let applied = self.inner.manager.apply_settings(document).await?;
        self.persist_settings().await?;
        Ok(applied)
    }

    async fn persist_settings(&self) -> Result<(), CoreError> {
        let document =
            serde_json::to_value(&*self.inner.settings.current()).map_err(CoreError::storage)?;
        self.inner
            .settings_store
            .save_settings(SETTINGS_KEY, &document)
            .await
    }

    /// Feed an address into `protocol`'s sink, as a listener would.
    /// Returns whether it passed the throttle.
    pub fn offer(&self, protocol: DiscoveryProtocol, addr: IpAddr) -> bool {
        self.inner.manager.sink(protocol).offer(addr)
    }

    /// Enrich one address now, bypassing throttles.
    pub async fn enrich(&self, addr: IpAddr, method: &str) -> Result<EnrichOutcome, CoreError> {
        self.inner.pipeline.process(addr, method).await
    }

    // ── Devices ──────────────────────────────────────────────────────

    pub async fn reconcile(&self, obs: &Observation) -> Result<ReconcileOutcome, CoreError> {
        self.inner.reconciler.reconcile(obs).await
    }

    pub async fn lock_field(
        &self,
        serial: &str,
        field: LockField,
        current_value: Option<&str>,
        locked_by: Option<&str>,
    ) -> Result<LockOutcome, CoreError> {
        self.inner
            .reconciler
            .lock_field(serial, field, current_value, locked_by)
            .await
    }

    pub async fn unlock_field(&self, serial: &str, field: LockField) -> Result<bool, CoreError> {
        self.inner.reconciler.unlock_field(serial, field).await
    }

    pub async fn mark_saved(&self, serial: &str) -> Result<(), CoreError> {
        self.inner.registry.mark_saved(serial).await
    }

    pub async fn delete_device(&self, serial: &str) -> Result<bool, CoreError> {
        let deleted = self.inner.registry.delete(serial).await?;
        self.inner.reconciler.forget(serial);
        Ok(deleted)
    }

    // ── Metrics & maintenance ────────────────────────────────────────

    /// Collect counters for one device. `timeout` defaults to the
    /// configured query timeout.
    pub async fn collect_metrics(
        &self,
        serial: &str,
        addr: IpAddr,
        vendor_hint: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<MetricsSnapshot, CoreError> {
        let timeout = timeout.unwrap_or_else(|| self.inner.collector.default_timeout());
        self.inner
            .collector
            .collect(serial, addr, vendor_hint, timeout)
            .await
    }

    pub async fn rescan_metrics_now(&self) -> Result<RescanReport, CoreError> {
        self.inner.collector.rescan_pass().await
    }

    pub async fn run_garbage_collection_now(&self) -> Result<GcReport, CoreError> {
        self.inner.gc.run_once().await
    }

    /// Downsample every tier, then persist state.
    pub async fn run_downsampling_now(&self) -> Result<DownsampleReport, CoreError> {
        let report = self.inner.metrics.perform_full_downsampling().await?;
        info!(
            created = report.total_created(),
            updated = report.total_updated(),
            pruned = report.total_pruned(),
            late_dropped = report.late_dropped,
            "downsampling complete"
        );
        self.inner.events.publish(
            EventKind::DownsamplingCompleted,
            json!({
                "created": report.total_created(),
                "updated": report.total_updated(),
                "pruned": report.total_pruned(),
            }),
        );
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "state save after downsampling failed (non-fatal)");
        }
        Ok(report)
    }
}

// ── Background tasks ─────────────────────────────────────────────────

async fn downsample_task(
    agent: Agent,
    initial_delay: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        () = tokio::time::sleep(initial_delay) => {}
    }

    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = agent.run_downsampling_now().await {
                    warn!(error = %e, "scheduled downsampling failed");
                }
            }
        }
    }
}

/// Runs once at startup, then every `every`.
async fn gc_task(agent: Agent, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = agent.run_garbage_collection_now().await {
                    warn!(error = %e, "scheduled garbage collection failed");
                }
            }
        }
    }
}
