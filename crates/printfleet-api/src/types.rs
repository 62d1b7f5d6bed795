// Wire types for the device-query gateway.
//
// Field names are snake_case on the wire. Every response field the
// gateway may omit carries `#[serde(default)]`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Requests ─────────────────────────────────────────────────────────

/// How hard the gateway should work to identify a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// A handful of scalar reads confirming the device still answers.
    Liveness,
    /// Vendor-aware identification (serial, model, network config).
    Full,
    /// Exhaustive walk, used when `Full` yields no serial.
    Deep,
}

/// Body of `POST v1/query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub address: String,
    pub mode: QueryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_hint: Option<String>,
    pub timeout_secs: u64,
}

/// Body of `POST v1/metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRequest {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_hint: Option<String>,
    /// Field name → identifier learned from an earlier value search.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub learned_oids: BTreeMap<String, String>,
    pub timeout_secs: u64,
}

/// Body of `POST v1/search`: find the identifier currently yielding `value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_hint: Option<String>,
    pub field: String,
    pub value: String,
    pub timeout_secs: u64,
}

// ── Responses ────────────────────────────────────────────────────────

/// Identification result for one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub subnet_mask: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub dhcp_server: Option<String>,
    #[serde(default)]
    pub web_ui_url: Option<String>,
    #[serde(default)]
    pub consumables: Vec<String>,
    #[serde(default)]
    pub status_messages: Vec<String>,
    /// Counters read during a `Full` or `Deep` query, if any.
    #[serde(default)]
    pub metrics: Option<MetricsReading>,
    /// Vendor payload passed through untouched.
    #[serde(default)]
    pub raw: Option<serde_json::Value>,
}

/// Counter and supply readings for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsReading {
    /// Counter name (e.g. `page_count`, `jam_events`) → value.
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    /// Supply name → remaining percentage.
    #[serde(default)]
    pub supplies: BTreeMap<String, u8>,
}

/// Outcome of a value search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub oid: Option<String>,
}

/// `GET v1/health` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}
