// printfleet-core: discovery orchestration, device reconciliation and
// tiered metrics retention for a fleet of network printers.

pub mod agent;
pub mod clock;
pub mod collect;
pub mod config;
pub mod discovery;
pub mod enrich;
pub mod error;
pub mod events;
pub mod gc;
pub mod model;
pub mod query;
pub mod ratelimit;
pub mod reconcile;
pub mod store;
pub mod throttle;

#[cfg(test)]
mod testing;

// ── Primary re-exports ──────────────────────────────────────────────
pub use agent::{Agent, AgentParts, SETTINGS_KEY};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collect::{MetricsCollector, RescanReport};
pub use config::{EngineConfig, GcPolicy, RetentionPolicy};
pub use discovery::{
    AddressHandler, AddressSink, DiscoveryListener, DiscoveryManager, ListenerFactory,
    UdpListenerFactory,
};
pub use enrich::{EnrichOutcome, EnrichmentPipeline};
pub use error::CoreError;
pub use events::{BroadcastSink, ChannelSink, EventKind, EventSink, FleetEvent, NullSink};
pub use gc::{GarbageCollector, GcReport};
pub use query::{DeviceQuery, GatewayQuery, Identification, QueryMode};
pub use reconcile::{LockOutcome, Observation, ReconcileOutcome, Reconciler};
pub use store::{
    Checkpoint, DeviceFilter, DeviceRegistry, DownsampleReport, MemoryStore, MetricsStore,
    SettingsStore,
};
pub use throttle::{PASSIVE_THROTTLE_WINDOW, ThrottleMap};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    Counter, Device, DeviceAttributes, DeviceField, DiscoveryProtocol, DiscoverySettings,
    FieldLock, LearnedOids, LockField, MetricsReading, MetricsSnapshot, ScanSnapshot,
    SettingsSource, SharedSettings, Tier,
};
