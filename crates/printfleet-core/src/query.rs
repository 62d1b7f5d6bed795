// ── Device query capability ──
//
// The core never speaks SNMP. Everything it needs from a device goes
// through `DeviceQuery`; `GatewayQuery` backs it with the HTTP gateway
// client, tests back it with fakes.

use std::future::Future;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use printfleet_api::QueryClient;
use tracing::debug;

use crate::error::CoreError;
use crate::model::{Counter, DeviceAttributes, LearnedOids, LockField, MetricsReading};

/// How much work an identify may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryMode {
    /// Cheap refresh of an already-known device.
    Liveness,
    Full,
    /// Exhaustive enumeration, used once when `Full` yields no serial.
    Deep,
}

/// What an identify returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identification {
    pub serial: Option<String>,
    pub attributes: DeviceAttributes,
    pub metrics: Option<MetricsReading>,
    pub raw: Option<serde_json::Value>,
}

impl Identification {
    /// The serial, if it is non-blank.
    pub fn stable_serial(&self) -> Option<&str> {
        self.serial
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[async_trait]
pub trait DeviceQuery: Send + Sync {
    async fn query(
        &self,
        addr: IpAddr,
        mode: QueryMode,
        vendor_hint: Option<&str>,
        timeout: Duration,
    ) -> Result<Identification, CoreError>;

    async fn collect_metrics(
        &self,
        addr: IpAddr,
        vendor_hint: Option<&str>,
        learned: &LearnedOids,
        timeout: Duration,
    ) -> Result<MetricsReading, CoreError>;

    /// Find the identifier that currently yields `value` for `field`.
    /// `Ok(None)` means the search ran but found nothing.
    async fn search_value(
        &self,
        addr: IpAddr,
        vendor_hint: Option<&str>,
        field: LockField,
        value: &str,
        timeout: Duration,
    ) -> Result<Option<String>, CoreError>;
}

/// Bound `fut` by `timeout`; an elapsed deadline is an ordinary query
/// failure for `addr`.
pub async fn with_deadline<T, F>(addr: IpAddr, timeout: Duration, fut: F) -> Result<T, CoreError>
where
    F: Future<Output = Result<T, CoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout {
            address: addr.to_string(),
            timeout_secs: timeout.as_secs(),
        }),
    }
}

// ── Gateway adapter ──────────────────────────────────────────────────

/// `DeviceQuery` over the query gateway's HTTP API.
#[derive(Debug, Clone)]
pub struct GatewayQuery {
    client: QueryClient,
}

impl GatewayQuery {
    pub fn new(client: QueryClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeviceQuery for GatewayQuery {
    async fn query(
        &self,
        addr: IpAddr,
        mode: QueryMode,
        vendor_hint: Option<&str>,
        timeout: Duration,
    ) -> Result<Identification, CoreError> {
        let request = printfleet_api::QueryRequest {
            address: addr.to_string(),
            mode: match mode {
                QueryMode::Liveness => printfleet_api::QueryMode::Liveness,
                QueryMode::Full => printfleet_api::QueryMode::Full,
                QueryMode::Deep => printfleet_api::QueryMode::Deep,
            },
            vendor_hint: vendor_hint.map(str::to_owned),
            timeout_secs: timeout.as_secs().max(1),
        };
        let info = with_deadline(addr, timeout, async {
            self.client.query(&request).await.map_err(|e| attribute(e, addr))
        })
        .await?;
        Ok(identification_from_info(info))
    }

    async fn collect_metrics(
        &self,
        addr: IpAddr,
        vendor_hint: Option<&str>,
        learned: &LearnedOids,
        timeout: Duration,
    ) -> Result<MetricsReading, CoreError> {
        let request = printfleet_api::MetricsRequest {
            address: addr.to_string(),
            vendor_hint: vendor_hint.map(str::to_owned),
            learned_oids: learned.as_map(),
            timeout_secs: timeout.as_secs().max(1),
        };
        let reading = with_deadline(addr, timeout, async {
            self.client
                .collect_metrics(&request)
                .await
                .map_err(|e| attribute(e, addr))
        })
        .await?;
        Ok(reading_from_wire(reading))
    }

    async fn search_value(
        &self,
        addr: IpAddr,
        vendor_hint: Option<&str>,
        field: LockField,
        value: &str,
        timeout: Duration,
    ) -> Result<Option<String>, CoreError> {
        let request = printfleet_api::SearchRequest {
            address: addr.to_string(),
            vendor_hint: vendor_hint.map(str::to_owned),
            field: field.to_string(),
            value: value.to_owned(),
            timeout_secs: timeout.as_secs().max(1),
        };
        let result = with_deadline(addr, timeout, async {
            self.client
                .search_value(&request)
                .await
                .map_err(|e| attribute(e, addr))
        })
        .await?;
        Ok(result.oid.filter(|oid| !oid.trim().is_empty()))
    }
}

/// Gateway errors carry no device address; pin them to `addr`.
fn attribute(err: printfleet_api::Error, addr: IpAddr) -> CoreError {
    match CoreError::from(err) {
        CoreError::QueryFailed { reason, .. } => CoreError::QueryFailed {
            address: addr.to_string(),
            reason,
        },
        CoreError::Timeout { timeout_secs, .. } => CoreError::Timeout {
            address: addr.to_string(),
            timeout_secs,
        },
        other => other,
    }
}

fn identification_from_info(info: printfleet_api::DeviceInfo) -> Identification {
    Identification {
        serial: info.serial,
        attributes: DeviceAttributes {
            manufacturer: info.manufacturer,
            model: info.model,
            hostname: info.hostname,
            firmware: info.firmware,
            mac_address: info.mac_address,
            subnet_mask: info.subnet_mask,
            gateway: info.gateway,
            dns_servers: info.dns_servers,
            dhcp_server: info.dhcp_server,
            web_ui_url: info.web_ui_url,
            consumables: info.consumables,
            status_messages: info.status_messages,
            ..DeviceAttributes::default()
        },
        metrics: info.metrics.map(reading_from_wire),
        raw: info.raw,
    }
}

/// Counter names the core does not model are dropped.
fn reading_from_wire(wire: printfleet_api::MetricsReading) -> MetricsReading {
    let mut counters = std::collections::BTreeMap::new();
    for (name, value) in wire.counters {
        match Counter::from_str(&name) {
            Ok(counter) => {
                counters.insert(counter, value);
            }
            Err(_) => debug!(counter = %name, "ignoring unknown counter from gateway"),
        }
    }
    MetricsReading {
        counters,
        supplies: wire.supplies,
    }
}
