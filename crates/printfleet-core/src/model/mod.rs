// ── Domain model ──

pub mod device;
pub mod metrics;
pub mod protocol;
pub mod settings;
pub mod snapshot;

pub use device::{
    Device, DeviceAttributes, DeviceField, FieldLock, LearnedOids, LockField, USER_LOCKED,
};
pub use metrics::{
    AggregationRule, Counter, MetricsReading, MetricsSnapshot, SUPPLY_RULE, Tier, aggregate,
};
pub use protocol::DiscoveryProtocol;
pub use settings::{DiscoverySettings, SETTINGS_VERSION, SettingsSource, SharedSettings};
pub use snapshot::ScanSnapshot;
