// ── Discovery settings document ──
//
// Typed, versioned replacement for the flat key/value document older
// agents persisted. Legacy documents are migrated key by key onto the
// defaults; current documents are parsed strictly.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::discovery::ranges::{DEFAULT_MAX_ADDRESSES, RangeError, parse_ranges};
use crate::error::CoreError;

use super::protocol::DiscoveryProtocol;

/// Version written by this agent.
pub const SETTINGS_VERSION: u32 = 2;

const MAX_INTERVAL_MINUTES: u32 = 1440;
const MAX_INTERVAL_SECONDS: u32 = 86_400;
const MAX_CONCURRENCY: usize = 1024;

/// Runtime-changeable discovery configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoverySettings {
    pub version: u32,

    // ── Active scanning ──
    pub ip_scanning_enabled: bool,
    pub subnet_scan: bool,
    /// CIDR of the local subnet, e.g. `192.168.1.0/24`.
    pub detected_subnet: String,
    pub manual_ranges: bool,
    pub ranges_text: String,
    pub concurrency: usize,
    pub auto_discover_interval_minutes: u32,

    // ── Probe methods ──
    pub arp_enabled: bool,
    pub icmp_enabled: bool,
    pub tcp_enabled: bool,
    pub snmp_enabled: bool,
    pub mdns_enabled: bool,

    // ── Automatic discovery ──
    /// Master switch for every automatic source.
    pub auto_discover_enabled: bool,
    pub autosave_discovered_devices: bool,
    pub passive_discovery_enabled: bool,
    pub auto_discover_live_mdns: bool,
    pub auto_discover_live_wsd: bool,
    pub auto_discover_live_ssdp: bool,
    pub auto_discover_live_snmptrap: bool,
    pub auto_discover_live_llmnr: bool,

    // ── Metrics collection ──
    pub metrics_rescan_enabled: bool,
    pub metrics_rescan_interval_minutes: u32,
    /// Sub-minute override; wins over the minutes value when set.
    pub metrics_rescan_interval_seconds: Option<u32>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            ip_scanning_enabled: true,
            subnet_scan: true,
            detected_subnet: String::new(),
            manual_ranges: false,
            ranges_text: String::new(),
            concurrency: 50,
            auto_discover_interval_minutes: 15,
            arp_enabled: true,
            icmp_enabled: true,
            tcp_enabled: true,
            snmp_enabled: true,
            mdns_enabled: false,
            auto_discover_enabled: false,
            autosave_discovered_devices: false,
            passive_discovery_enabled: true,
            auto_discover_live_mdns: true,
            auto_discover_live_wsd: true,
            auto_discover_live_ssdp: false,
            auto_discover_live_snmptrap: false,
            auto_discover_live_llmnr: false,
            metrics_rescan_enabled: false,
            metrics_rescan_interval_minutes: 60,
            metrics_rescan_interval_seconds: None,
        }
    }
}

impl DiscoverySettings {
    /// Parse a stored or submitted document, migrating legacy layouts.
    /// The result is validated; nothing partial is ever returned.
    pub fn from_document(document: Value) -> Result<Self, CoreError> {
        let Value::Object(map) = document else {
            return Err(invalid("settings document must be a JSON object"));
        };

        let version = map.get("version").and_then(Value::as_u64);
        let settings = match version {
            Some(v) if v > u64::from(SETTINGS_VERSION) => {
                return Err(invalid(format!("unsupported settings version {v}")));
            }
            Some(v) if v == u64::from(SETTINGS_VERSION) => {
                serde_json::from_value(Value::Object(map)).map_err(|e| invalid(e.to_string()))?
            }
            _ => migrate_legacy(map)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Check every bound, collecting all problems.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut problems = Vec::new();

        if self.version != SETTINGS_VERSION {
            problems.push(format!("version must be {SETTINGS_VERSION}"));
        }
        for (name, value) in [
            ("auto_discover_interval_minutes", self.auto_discover_interval_minutes),
            ("metrics_rescan_interval_minutes", self.metrics_rescan_interval_minutes),
        ] {
            if !(1..=MAX_INTERVAL_MINUTES).contains(&value) {
                problems.push(format!("{name} must be between 1 and {MAX_INTERVAL_MINUTES}"));
            }
        }
        let seconds_ok = self
            .metrics_rescan_interval_seconds
            .is_none_or(|s| (1..=MAX_INTERVAL_SECONDS).contains(&s));
        if !seconds_ok {
            problems.push(format!(
                "metrics_rescan_interval_seconds must be between 1 and {MAX_INTERVAL_SECONDS}"
            ));
        }
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            problems.push(format!("concurrency must be between 1 and {MAX_CONCURRENCY}"));
        }
        if let Err(errors) = parse_ranges(&self.ranges_text, DEFAULT_MAX_ADDRESSES) {
            problems.extend(errors.into_iter().map(|e| format!("ranges_text {e}")));
        }
        let subnet = self.detected_subnet.trim();
        if !subnet.is_empty()
            && (!subnet.contains('/') || parse_ranges(subnet, DEFAULT_MAX_ADDRESSES).is_err())
        {
            problems.push(format!("detected_subnet '{subnet}' is not a usable CIDR block"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidSettings { problems })
        }
    }

    /// Whether `protocol` should be running under these settings.
    ///
    /// The master switch gates everything; passive listeners also need
    /// the passive toggle and their own flag.
    pub fn protocol_enabled(&self, protocol: DiscoveryProtocol) -> bool {
        if !self.auto_discover_enabled {
            return false;
        }
        let passive = self.passive_discovery_enabled;
        match protocol {
            DiscoveryProtocol::ActiveScan => self.ip_scanning_enabled,
            DiscoveryProtocol::Mdns => passive && self.auto_discover_live_mdns,
            DiscoveryProtocol::Ssdp => passive && self.auto_discover_live_ssdp,
            DiscoveryProtocol::WsDiscovery => passive && self.auto_discover_live_wsd,
            DiscoveryProtocol::SnmpTrap => passive && self.auto_discover_live_snmptrap,
            DiscoveryProtocol::Llmnr => passive && self.auto_discover_live_llmnr,
        }
    }

    /// Flip the individual flag behind `protocol`. The master switch is
    /// left alone.
    pub fn set_protocol_flag(&mut self, protocol: DiscoveryProtocol, enabled: bool) {
        let flag = match protocol {
            DiscoveryProtocol::ActiveScan => &mut self.ip_scanning_enabled,
            DiscoveryProtocol::Mdns => &mut self.auto_discover_live_mdns,
            DiscoveryProtocol::Ssdp => &mut self.auto_discover_live_ssdp,
            DiscoveryProtocol::WsDiscovery => &mut self.auto_discover_live_wsd,
            DiscoveryProtocol::SnmpTrap => &mut self.auto_discover_live_snmptrap,
            DiscoveryProtocol::Llmnr => &mut self.auto_discover_live_llmnr,
        };
        *flag = enabled;
    }

    pub fn active_scan_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.auto_discover_interval_minutes.max(1)) * 60)
    }

    pub fn metrics_rescan_interval(&self) -> Duration {
        match self.metrics_rescan_interval_seconds {
            Some(secs) if secs > 0 => Duration::from_secs(u64::from(secs)),
            _ => Duration::from_secs(u64::from(self.metrics_rescan_interval_minutes.max(1)) * 60),
        }
    }

    /// Addresses the active scanner sweeps: manual ranges when enabled,
    /// plus the detected subnet when subnet scanning is on.
    pub fn scan_targets(&self) -> Result<Vec<Ipv4Addr>, Vec<RangeError>> {
        let mut text = String::new();
        if self.manual_ranges {
            text.push_str(&self.ranges_text);
            text.push('\n');
        }
        if self.subnet_scan {
            text.push_str(self.detected_subnet.trim());
        }
        parse_ranges(&text, DEFAULT_MAX_ADDRESSES)
    }
}

// ── Live settings ────────────────────────────────────────────────────

/// Read-only access to the current settings. Callers re-read at every
/// decision point instead of holding on to a copy.
pub trait SettingsSource: Send + Sync {
    fn current(&self) -> Arc<DiscoverySettings>;
}

/// Lock-free swappable settings cell.
#[derive(Debug)]
pub struct SharedSettings {
    inner: ArcSwap<DiscoverySettings>,
}

impl SharedSettings {
    pub fn new(settings: DiscoverySettings) -> Self {
        Self {
            inner: ArcSwap::from_pointee(settings),
        }
    }

    pub fn replace(&self, settings: DiscoverySettings) {
        self.inner.store(Arc::new(settings));
    }

    /// Edit a copy of the current settings and swap it in. A concurrent
    /// swap makes `edit` run again on the newer value, so no update is lost.
    pub fn update(&self, edit: impl Fn(&mut DiscoverySettings)) {
        self.inner.rcu(|current| {
            let mut next = DiscoverySettings::clone(current);
            edit(&mut next);
            next
        });
    }
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self::new(DiscoverySettings::default())
    }
}

impl SettingsSource for SharedSettings {
    fn current(&self) -> Arc<DiscoverySettings> {
        self.inner.load_full()
    }
}

fn invalid(problem: impl Into<String>) -> CoreError {
    CoreError::InvalidSettings {
        problems: vec![problem.into()],
    }
}

// ── Legacy migration ─────────────────────────────────────────────────

/// Coerce each recognised legacy key onto the defaults, using the
/// default's JSON type as the target type.
fn migrate_legacy(legacy: Map<String, Value>) -> Result<DiscoverySettings, CoreError> {
    let Value::Object(mut merged) =
        serde_json::to_value(DiscoverySettings::default()).map_err(|e| invalid(e.to_string()))?
    else {
        return Err(invalid("default settings did not serialize to an object"));
    };

    let mut problems = Vec::new();
    for (key, value) in legacy {
        if key == "version" {
            continue;
        }
        let Some(default) = merged.get(&key) else {
            debug!(key = %key, "ignoring unknown legacy settings key");
            continue;
        };
        match coerce(default, &value) {
            Ok(coerced) => {
                merged.insert(key, coerced);
            }
            Err(reason) => problems.push(format!("{key}: {reason}")),
        }
    }
    if !problems.is_empty() {
        return Err(CoreError::InvalidSettings { problems });
    }

    merged.insert("version".into(), Value::from(SETTINGS_VERSION));
    serde_json::from_value(Value::Object(merged)).map_err(|e| invalid(e.to_string()))
}

fn coerce(default: &Value, value: &Value) -> Result<Value, String> {
    match default {
        Value::Bool(_) => coerce_bool(value).map(Value::Bool),
        Value::Number(_) => coerce_number(value)?
            .map(Value::from)
            .ok_or_else(|| "expected a number".to_owned()),
        // Optional numbers: zero or empty means "unset".
        Value::Null => Ok(coerce_number(value)?
            .filter(|n| *n > 0)
            .map_or(Value::Null, Value::from)),
        Value::String(_) => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            Value::Null => Ok(Value::String(String::new())),
            _ => Err("expected a string".into()),
        },
        _ => Err("unsupported legacy value".into()),
    }
}

fn coerce_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_u64().is_none_or(|v| v != 0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" | "" => Ok(false),
            other => Err(format!("'{other}' is not a boolean")),
        },
        Value::Null => Ok(false),
        _ => Err("expected a boolean".into()),
    }
}

fn coerce_number(value: &Value) -> Result<Option<u64>, String> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("{n} is not a non-negative integer")),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("'{s}' is not a non-negative integer")),
        Value::Null => Ok(None),
        _ => Err("expected a number".into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        let settings = DiscoverySettings::default();
        settings.validate().unwrap();
        assert!(!settings.protocol_enabled(DiscoveryProtocol::Mdns));
        assert_eq!(settings.metrics_rescan_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn master_switch_gates_everything() {
        let mut settings = DiscoverySettings {
            auto_discover_enabled: true,
            ..DiscoverySettings::default()
        };
        assert!(settings.protocol_enabled(DiscoveryProtocol::Mdns));
        assert!(settings.protocol_enabled(DiscoveryProtocol::WsDiscovery));
        assert!(!settings.protocol_enabled(DiscoveryProtocol::Ssdp));
        assert!(settings.protocol_enabled(DiscoveryProtocol::ActiveScan));

        settings.set_protocol_flag(DiscoveryProtocol::Ssdp, true);
        assert!(settings.protocol_enabled(DiscoveryProtocol::Ssdp));

        settings.auto_discover_enabled = false;
        for protocol in [
            DiscoveryProtocol::Mdns,
            DiscoveryProtocol::Ssdp,
            DiscoveryProtocol::ActiveScan,
        ] {
            assert!(!settings.protocol_enabled(protocol));
        }
    }

    #[test]
    fn current_document_is_strict() {
        let doc = json!({ "version": 2, "auto_discover_enabled": true, "bogus": 1 });
        assert!(DiscoverySettings::from_document(doc).is_err());

        let doc = json!({ "version": 2, "auto_discover_enabled": true, "concurrency": 8 });
        let settings = DiscoverySettings::from_document(doc).unwrap();
        assert!(settings.auto_discover_enabled);
        assert_eq!(settings.concurrency, 8);
        assert!(settings.auto_discover_live_mdns);
    }

    #[test]
    fn legacy_document_is_migrated() {
        let doc = json!({
            "auto_discover_enabled": "true",
            "auto_discover_live_ssdp": 1,
            "metrics_rescan_interval_minutes": "15",
            "metrics_rescan_interval_seconds": 0,
            "ranges_text": "10.0.0.1-5",
            "manual_ranges": "yes",
            "show_discover_button_anyway": true
        });
        let settings = DiscoverySettings::from_document(doc).unwrap();

        assert_eq!(settings.version, SETTINGS_VERSION);
        assert!(settings.auto_discover_enabled);
        assert!(settings.auto_discover_live_ssdp);
        assert_eq!(settings.metrics_rescan_interval_minutes, 15);
        assert_eq!(settings.metrics_rescan_interval_seconds, None);
        assert_eq!(settings.scan_targets().unwrap().len(), 5);
    }

    #[test]
    fn validation_collects_every_problem() {
        let doc = json!({
            "version": 2,
            "concurrency": 0,
            "metrics_rescan_interval_minutes": 5000,
            "ranges_text": "10.0.0.1\nnot-an-ip"
        });
        let Err(CoreError::InvalidSettings { problems }) = DiscoverySettings::from_document(doc)
        else {
            panic!("expected invalid settings");
        };
        assert_eq!(problems.len(), 3);
        assert!(problems.iter().any(|p| p.contains("line 2")));
    }

    #[test]
    fn legacy_type_errors_are_rejected() {
        let doc = json!({ "auto_discover_enabled": "perhaps" });
        assert!(DiscoverySettings::from_document(doc).is_err());
        assert!(DiscoverySettings::from_document(json!([1, 2])).is_err());
        assert!(DiscoverySettings::from_document(json!({ "version": 9 })).is_err());
    }

    #[test]
    fn seconds_override_wins() {
        let settings = DiscoverySettings {
            metrics_rescan_interval_seconds: Some(30),
            ..DiscoverySettings::default()
        };
        assert_eq!(settings.metrics_rescan_interval(), Duration::from_secs(30));
    }

    #[test]
    fn concurrent_updates_keep_every_flag() {
        for _ in 0..200 {
            let shared = Arc::new(SharedSettings::default());
            let handles: Vec<_> = [DiscoveryProtocol::Ssdp, DiscoveryProtocol::SnmpTrap, DiscoveryProtocol::Llmnr]
                .into_iter()
                .map(|protocol| {
                    let shared = shared.clone();
                    std::thread::spawn(move || shared.update(|s| s.set_protocol_flag(protocol, true)))
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let current = shared.current();
            assert!(current.auto_discover_live_ssdp);
            assert!(current.auto_discover_live_snmptrap);
            assert!(current.auto_discover_live_llmnr);
        }
    }
}
