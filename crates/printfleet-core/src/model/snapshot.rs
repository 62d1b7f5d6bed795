// ── Scan history ──

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::device::{Device, DeviceAttributes};

/// Immutable audit record of what a device looked like at one moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    /// Assigned by the store. Zero before saving.
    #[serde(default)]
    pub id: u64,
    pub serial: String,
    pub ip: IpAddr,
    pub taken_at: DateTime<Utc>,
    #[serde(default)]
    pub discovery_method: Option<String>,
    pub attributes: DeviceAttributes,
    #[serde(default)]
    pub raw_data: Option<serde_json::Value>,
}

impl ScanSnapshot {
    pub fn of(device: &Device, taken_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            serial: device.serial.clone(),
            ip: device.ip,
            taken_at,
            discovery_method: device.discovery_method.clone(),
            attributes: device.attributes.clone(),
            raw_data: device.raw_data.clone(),
        }
    }
}
