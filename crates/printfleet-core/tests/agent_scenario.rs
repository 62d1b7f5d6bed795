#![allow(clippy::unwrap_used)]

// End-to-end behaviour of the agent through its public API, with an
// in-memory store, a manual clock and a scripted device query.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, TimeZone, Utc};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast::error::TryRecvError;

use printfleet_core::{
    Agent, AgentParts, BroadcastSink, CoreError, DeviceAttributes, DeviceField, DeviceQuery,
    DeviceRegistry, DiscoveryListener, DiscoveryProtocol, DiscoverySettings, EngineConfig,
    EventKind, Identification, LearnedOids, ListenerFactory, LockField, ManualClock, MemoryStore,
    MetricsReading, Observation, QueryMode, RetentionPolicy,
};

// ── Fakes ────────────────────────────────────────────────────────────

/// Answers every query for one printer.
#[derive(Debug)]
struct OnePrinter {
    ip: IpAddr,
    serial: String,
    queries: AtomicUsize,
    modes: Mutex<Vec<QueryMode>>,
}

impl OnePrinter {
    fn new(ip: &str, serial: &str) -> Self {
        Self {
            ip: ip.parse().unwrap(),
            serial: serial.into(),
            queries: AtomicUsize::new(0),
            modes: Mutex::new(Vec::new()),
        }
    }

    fn identification(&self) -> Identification {
        Identification {
            serial: Some(self.serial.clone()),
            attributes: DeviceAttributes {
                manufacturer: Some("Brother".into()),
                model: Some("HL-L8360CDW".into()),
                location: Some("Lobby".into()),
                ..DeviceAttributes::default()
            },
            ..Identification::default()
        }
    }
}

#[async_trait]
impl DeviceQuery for OnePrinter {
    async fn query(
        &self,
        addr: IpAddr,
        mode: QueryMode,
        _vendor_hint: Option<&str>,
        _timeout: Duration,
    ) -> Result<Identification, CoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.modes.lock().unwrap().push(mode);
        if addr == self.ip {
            Ok(self.identification())
        } else {
            Err(CoreError::Timeout {
                address: addr.to_string(),
                timeout_secs: 2,
            })
        }
    }

    async fn collect_metrics(
        &self,
        _addr: IpAddr,
        _vendor_hint: Option<&str>,
        _learned: &LearnedOids,
        _timeout: Duration,
    ) -> Result<MetricsReading, CoreError> {
        Ok(MetricsReading::default())
    }

    async fn search_value(
        &self,
        _addr: IpAddr,
        _vendor_hint: Option<&str>,
        _field: LockField,
        _value: &str,
        _timeout: Duration,
    ) -> Result<Option<String>, CoreError> {
        Ok(None)
    }
}

/// No sockets in tests.
struct NoListeners;

impl ListenerFactory for NoListeners {
    fn create(&self, _protocol: DiscoveryProtocol) -> Option<Arc<dyn DiscoveryListener>> {
        None
    }
}

struct World {
    agent: Agent,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    query: Arc<OnePrinter>,
    events: Arc<BroadcastSink>,
}

fn world() -> World {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::new(clock.clone(), RetentionPolicy::default()));
    let query = Arc::new(OnePrinter::new("10.0.0.5", "ABC123"));
    let events = Arc::new(BroadcastSink::default());

    let agent = Agent::new(AgentParts {
        config: EngineConfig::default(),
        settings: DiscoverySettings::default(),
        registry: store.clone(),
        metrics: store.clone(),
        settings_store: store.clone(),
        checkpoint: None,
        query: query.clone(),
        events: events.clone(),
        listeners: Arc::new(NoListeners),
        clock: clock.clone(),
    });

    World {
        agent,
        store,
        clock,
        query,
        events,
    }
}

/// Poll until `check` holds; enrichment runs on spawned tasks.
async fn eventually<F>(mut check: F)
where
    F: AsyncFnMut() -> bool,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn mdns_then_snmptrap_discovery_of_the_same_printer() {
    let w = world();
    let mut rx = w.events.subscribe();
    let ip: IpAddr = "10.0.0.5".parse().unwrap();

    assert!(w.agent.offer(DiscoveryProtocol::Mdns, ip));
    eventually(async || w.store.get("ABC123").await.unwrap().is_some()).await;

    let first = w.store.get("ABC123").await.unwrap().unwrap();
    assert!(first.visible);
    assert!(!first.is_saved);
    assert_eq!(first.first_seen, first.last_seen);
    assert_eq!(first.discovery_method.as_deref(), Some("mdns"));

    w.clock.advance(TimeDelta::minutes(1));

    // Same protocol inside its window: dropped. Other protocol: its own map.
    assert!(!w.agent.offer(DiscoveryProtocol::Mdns, ip));
    assert!(w.agent.offer(DiscoveryProtocol::SnmpTrap, ip));
    eventually(async || {
        w.store.get("ABC123").await.unwrap().unwrap().last_seen > first.last_seen
    })
    .await;

    let second = w.store.get("ABC123").await.unwrap().unwrap();
    assert_eq!(second.first_seen, first.first_seen);
    assert_eq!(second.last_seen, first.last_seen + TimeDelta::minutes(1));
    assert_eq!(second.attributes, first.attributes);
    assert_eq!(second.visible, first.visible);
    assert_eq!(second.is_saved, first.is_saved);
    assert_eq!(w.store.scan_history("ABC123").await.unwrap().len(), 1);

    let modes = w.query.modes.lock().unwrap().clone();
    assert_eq!(modes, vec![QueryMode::Full, QueryMode::Liveness]);

    let mut kinds = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => kinds.push(event.kind),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => {}
        }
    }
    assert_eq!(kinds, vec![EventKind::DeviceDiscovered]);
}

#[tokio::test]
async fn burst_of_announcements_enriches_once() {
    let w = world();
    let ip: IpAddr = "10.0.0.5".parse().unwrap();

    let admitted = (0..25)
        .filter(|_| w.agent.offer(DiscoveryProtocol::Mdns, ip))
        .count();
    assert_eq!(admitted, 1);

    eventually(async || w.store.get("ABC123").await.unwrap().is_some()).await;
    assert_eq!(w.query.queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn locked_field_survives_rediscovery() {
    let w = world();
    let ip: IpAddr = "10.0.0.5".parse().unwrap();
    w.agent.enrich(ip, "manual").await.unwrap();

    let outcome = w
        .agent
        .lock_field(
            "ABC123",
            LockField::Attribute(DeviceField::Location),
            Some("Finance, 3rd floor"),
            Some("admin"),
        )
        .await
        .unwrap();
    assert!(outcome.newly_locked);
    assert!(outcome.learned_oid.is_none());

    let mut obs = Observation::new("ABC123", ip);
    obs.attributes.location = Some("Lobby".into());
    w.agent.reconcile(&obs).await.unwrap();
    w.agent.enrich(ip, "ssdp").await.unwrap();

    let device = w.store.get("ABC123").await.unwrap().unwrap();
    assert_eq!(device.attributes.location.as_deref(), Some("Finance, 3rd floor"));

    assert!(w
        .agent
        .unlock_field("ABC123", LockField::Attribute(DeviceField::Location))
        .await
        .unwrap());
    w.agent.reconcile(&obs).await.unwrap();
    let device = w.store.get("ABC123").await.unwrap().unwrap();
    assert_eq!(device.attributes.location.as_deref(), Some("Lobby"));
}

#[tokio::test]
async fn reconciling_twice_only_moves_last_seen() {
    let w = world();
    let ip: IpAddr = "10.0.0.5".parse().unwrap();
    let mut obs = Observation::new("XYZ789", ip);
    obs.attributes.model = Some("M404dn".into());

    assert!(w.agent.reconcile(&obs).await.unwrap().is_new);
    let once = w.store.get("XYZ789").await.unwrap().unwrap();

    w.clock.advance(TimeDelta::seconds(30));
    let outcome = w.agent.reconcile(&obs).await.unwrap();
    let twice = w.store.get("XYZ789").await.unwrap().unwrap();

    assert!(!outcome.is_new);
    assert!(outcome.changed.is_empty());
    assert!(twice.last_seen > once.last_seen);
    assert_eq!(
        printfleet_core::Device {
            last_seen: once.last_seen,
            ..twice
        },
        once
    );
}

#[tokio::test]
async fn unreachable_address_is_not_fatal() {
    let w = world();
    let outcome = w
        .agent
        .enrich("10.0.0.99".parse().unwrap(), "wsd")
        .await
        .unwrap();
    assert_eq!(outcome, printfleet_core::EnrichOutcome::Failed);
    assert!(w.store.list(&printfleet_core::DeviceFilter::default()).await.unwrap().is_empty());
}
