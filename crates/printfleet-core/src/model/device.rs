// ── Device domain types ──

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{Display, EnumIter, EnumString};

use super::metrics::Counter;

/// Lock reason recorded when a user pins a field from the UI or API.
pub const USER_LOCKED: &str = "user_locked";

// ── Lockable fields ──────────────────────────────────────────────────

/// Mutable descriptive attribute of a device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DeviceField {
    Ip,
    Manufacturer,
    Model,
    Hostname,
    Firmware,
    MacAddress,
    SubnetMask,
    Gateway,
    DnsServers,
    DhcpServer,
    AssetNumber,
    Location,
    Description,
    WebUiUrl,
    Consumables,
    StatusMessages,
}

/// Anything a user can lock: a device attribute, or a counter whose
/// read path should be pinned to a learned identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockField {
    Attribute(DeviceField),
    Counter(Counter),
}

impl fmt::Display for LockField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attribute(field) => write!(f, "{field}"),
            Self::Counter(counter) => write!(f, "{counter}"),
        }
    }
}

impl FromStr for LockField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        if let Ok(field) = DeviceField::from_str(name) {
            return Ok(Self::Attribute(field));
        }
        if let Ok(counter) = Counter::from_str(name) {
            return Ok(Self::Counter(counter));
        }
        Err(format!("'{name}' is not a lockable field"))
    }
}

impl Serialize for LockField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LockField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A user-applied pin on one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLock {
    pub field: LockField,
    pub reason: String,
    pub locked_at: DateTime<Utc>,
    #[serde(default)]
    pub locked_by: Option<String>,
}

// ── Learned identifiers ──────────────────────────────────────────────

/// Vendor identifiers found by value search, reused on later polls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnedOids {
    #[serde(default)]
    pub page_count: Option<String>,
    #[serde(default)]
    pub mono_pages: Option<String>,
    #[serde(default)]
    pub color_pages: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Everything without a dedicated slot, keyed by field name.
    #[serde(default)]
    pub vendor_specific: BTreeMap<String, String>,
    #[serde(default)]
    pub learned_at: Option<DateTime<Utc>>,
}

impl LearnedOids {
    pub fn record(&mut self, field: LockField, oid: String, at: DateTime<Utc>) {
        match field {
            LockField::Counter(Counter::PageCount) => self.page_count = Some(oid),
            LockField::Counter(Counter::MonoPages) => self.mono_pages = Some(oid),
            LockField::Counter(Counter::ColorPages) => self.color_pages = Some(oid),
            LockField::Attribute(DeviceField::Model) => self.model = Some(oid),
            other => {
                self.vendor_specific.insert(other.to_string(), oid);
            }
        }
        self.learned_at = Some(at);
    }

    /// Flatten into field name → identifier for the query gateway.
    pub fn as_map(&self) -> BTreeMap<String, String> {
        let mut map = self.vendor_specific.clone();
        let slots = [
            ("page_count", &self.page_count),
            ("mono_pages", &self.mono_pages),
            ("color_pages", &self.color_pages),
            ("model", &self.model),
        ];
        for (name, value) in slots {
            if let Some(oid) = value {
                map.insert(name.to_owned(), oid.clone());
            }
        }
        map
    }

    pub fn is_empty(&self) -> bool {
        self.as_map().is_empty()
    }
}

// ── Attributes ───────────────────────────────────────────────────────

/// Descriptive attributes, as observed or as stored.
///
/// An observation leaves a field `None` (or empty) when the device did
/// not report it; merging never erases a stored value with "unknown".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttributes {
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
    pub asset_number: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub web_ui_url: Option<String>,
    #[serde(default)]
    pub consumables: Vec<String>,
    #[serde(default)]
    pub status_messages: Vec<String>,
}

impl DeviceAttributes {
    /// Overwrite a text field with a curated value. Returns `false` for
    /// fields that are not single strings.
    pub fn set_text(&mut self, field: DeviceField, value: &str) -> bool {
        let value = Some(value.to_owned());
        match field {
            DeviceField::Manufacturer => self.manufacturer = value,
            DeviceField::Model => self.model = value,
            DeviceField::Hostname => self.hostname = value,
            DeviceField::Firmware => self.firmware = value,
            DeviceField::MacAddress => self.mac_address = value,
            DeviceField::SubnetMask => self.subnet_mask = value,
            DeviceField::Gateway => self.gateway = value,
            DeviceField::DhcpServer => self.dhcp_server = value,
            DeviceField::AssetNumber => self.asset_number = value,
            DeviceField::Location => self.location = value,
            DeviceField::Description => self.description = value,
            DeviceField::WebUiUrl => self.web_ui_url = value,
            DeviceField::Ip
            | DeviceField::DnsServers
            | DeviceField::Consumables
            | DeviceField::StatusMessages => return false,
        }
        true
    }

    /// Apply every reported, unlocked value from `observed`.
    ///
    /// Returns the fields whose stored value actually changed.
    pub fn merge_from(
        &mut self,
        observed: &Self,
        is_locked: impl Fn(DeviceField) -> bool,
    ) -> Vec<DeviceField> {
        let mut changed = Vec::new();
        let mut text = |field: DeviceField, stored: &mut Option<String>, seen: &Option<String>| {
            let Some(value) = seen.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
                return;
            };
            if is_locked(field) || stored.as_deref() == Some(value) {
                return;
            }
            *stored = Some(value.to_owned());
            changed.push(field);
        };

        text(DeviceField::Manufacturer, &mut self.manufacturer, &observed.manufacturer);
        text(DeviceField::Model, &mut self.model, &observed.model);
        text(DeviceField::Hostname, &mut self.hostname, &observed.hostname);
        text(DeviceField::Firmware, &mut self.firmware, &observed.firmware);
        text(DeviceField::MacAddress, &mut self.mac_address, &observed.mac_address);
        text(DeviceField::SubnetMask, &mut self.subnet_mask, &observed.subnet_mask);
        text(DeviceField::Gateway, &mut self.gateway, &observed.gateway);
        text(DeviceField::DhcpServer, &mut self.dhcp_server, &observed.dhcp_server);
        text(DeviceField::AssetNumber, &mut self.asset_number, &observed.asset_number);
        text(DeviceField::Location, &mut self.location, &observed.location);
        text(DeviceField::Description, &mut self.description, &observed.description);
        text(DeviceField::WebUiUrl, &mut self.web_ui_url, &observed.web_ui_url);

        let mut list = |field: DeviceField, stored: &mut Vec<String>, seen: &Vec<String>| {
            if seen.is_empty() || is_locked(field) || stored == seen {
                return;
            }
            stored.clone_from(seen);
            changed.push(field);
        };

        list(DeviceField::DnsServers, &mut self.dns_servers, &observed.dns_servers);
        list(DeviceField::Consumables, &mut self.consumables, &observed.consumables);
        list(
            DeviceField::StatusMessages,
            &mut self.status_messages,
            &observed.status_messages,
        );

        changed
    }
}

// ── Device ───────────────────────────────────────────────────────────

/// Canonical fleet entity, keyed by vendor serial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub serial: String,
    pub ip: IpAddr,
    #[serde(flatten)]
    pub attributes: DeviceAttributes,

    /// Soft-delete flag. Hidden devices are skipped by refresh and
    /// eventually removed by GC unless saved.
    pub visible: bool,
    /// Promoted from "discovered" to "tracked".
    pub is_saved: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// How the device was first found. Never rewritten afterwards.
    #[serde(default)]
    pub discovery_method: Option<String>,

    #[serde(default)]
    pub locked_fields: Vec<FieldLock>,
    #[serde(default)]
    pub learned_oids: LearnedOids,
    /// Vendor payload from the most recent identify.
    #[serde(default)]
    pub raw_data: Option<serde_json::Value>,
}

impl Device {
    /// A freshly discovered device: visible, unsaved, first seen now.
    pub fn discovered(serial: impl Into<String>, ip: IpAddr, at: DateTime<Utc>) -> Self {
        Self {
            serial: serial.into(),
            ip,
            attributes: DeviceAttributes::default(),
            visible: true,
            is_saved: false,
            first_seen: at,
            last_seen: at,
            created_at: at,
            discovery_method: None,
            locked_fields: Vec::new(),
            learned_oids: LearnedOids::default(),
            raw_data: None,
        }
    }

    pub fn is_locked(&self, field: LockField) -> bool {
        self.locked_fields.iter().any(|l| l.field == field)
    }

    pub fn is_attribute_locked(&self, field: DeviceField) -> bool {
        self.is_locked(LockField::Attribute(field))
    }

    /// Record a lock. Re-locking an already locked field keeps the
    /// original entry and returns `false`.
    pub fn lock(&mut self, lock: FieldLock) -> bool {
        if self.is_locked(lock.field) {
            return false;
        }
        self.locked_fields.push(lock);
        true
    }

    /// Drop the lock on `field`. Returns whether one existed.
    pub fn unlock(&mut self, field: LockField) -> bool {
        let before = self.locked_fields.len();
        self.locked_fields.retain(|l| l.field != field);
        before != self.locked_fields.len()
    }

    /// Merge an observed address and attributes, honouring locks.
    ///
    /// Timestamps are left to the caller.
    pub fn merge(&mut self, ip: IpAddr, observed: &DeviceAttributes) -> Vec<DeviceField> {
        let locks: Vec<LockField> = self.locked_fields.iter().map(|l| l.field).collect();
        let is_locked = |f: DeviceField| locks.contains(&LockField::Attribute(f));

        let mut changed = self.attributes.merge_from(observed, is_locked);
        if self.ip != ip && !is_locked(DeviceField::Ip) {
            self.ip = ip;
            changed.insert(0, DeviceField::Ip);
        }
        changed
    }

    /// Name used when asking the gateway for vendor-specific handling.
    pub fn vendor_hint(&self) -> Option<&str> {
        self.attributes.manufacturer.as_deref()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn device() -> Device {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut d = Device::discovered("ABC123", "10.0.0.5".parse().unwrap(), at);
        d.attributes.model = Some("M404".into());
        d
    }

    fn lock(field: LockField) -> FieldLock {
        FieldLock {
            field,
            reason: USER_LOCKED.into(),
            locked_at: Utc::now(),
            locked_by: None,
        }
    }

    #[test]
    fn merge_skips_empty_and_locked_values() {
        let mut d = device();
        d.lock(lock(LockField::Attribute(DeviceField::Hostname)));
        d.attributes.hostname = Some("front-desk".into());

        let observed = DeviceAttributes {
            model: Some("   ".into()),
            hostname: Some("npi1234".into()),
            firmware: Some("2.1".into()),
            ..DeviceAttributes::default()
        };
        let changed = d.merge("10.0.0.5".parse().unwrap(), &observed);

        assert_eq!(changed, vec![DeviceField::Firmware]);
        assert_eq!(d.attributes.model.as_deref(), Some("M404"));
        assert_eq!(d.attributes.hostname.as_deref(), Some("front-desk"));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut d = device();
        let observed = DeviceAttributes {
            manufacturer: Some("HP".into()),
            dns_servers: vec!["10.0.0.1".into()],
            ..DeviceAttributes::default()
        };
        let ip = "10.0.0.9".parse().unwrap();
        assert_eq!(d.merge(ip, &observed).len(), 3);
        assert!(d.merge(ip, &observed).is_empty());
    }

    #[test]
    fn locked_ip_is_kept() {
        let mut d = device();
        d.lock(lock(LockField::Attribute(DeviceField::Ip)));
        let changed = d.merge("10.0.0.99".parse().unwrap(), &DeviceAttributes::default());
        assert!(changed.is_empty());
        assert_eq!(d.ip, "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn lock_and_unlock() {
        let mut d = device();
        let field = LockField::Counter(Counter::PageCount);
        assert!(d.lock(lock(field)));
        assert!(!d.lock(lock(field)));
        assert!(d.unlock(field));
        assert!(!d.unlock(field));
    }

    #[test]
    fn lock_field_names() {
        assert_eq!(
            "Hostname".parse::<LockField>().unwrap(),
            LockField::Attribute(DeviceField::Hostname)
        );
        assert_eq!(
            "page_count".parse::<LockField>().unwrap(),
            LockField::Counter(Counter::PageCount)
        );
        assert!("serial".parse::<LockField>().is_err());
        assert_eq!(LockField::Attribute(DeviceField::WebUiUrl).to_string(), "web_ui_url");
    }

    #[test]
    fn learned_oids_map() {
        let mut oids = LearnedOids::default();
        assert!(oids.is_empty());
        oids.record(LockField::Counter(Counter::PageCount), "1.2.3".into(), Utc::now());
        oids.record(LockField::Counter(Counter::DuplexSheets), "1.2.4".into(), Utc::now());
        let map = oids.as_map();
        assert_eq!(map.get("page_count").map(String::as_str), Some("1.2.3"));
        assert_eq!(map.get("duplex_sheets").map(String::as_str), Some("1.2.4"));
    }

    #[test]
    fn device_round_trips_through_json() {
        let mut d = device();
        d.lock(lock(LockField::Attribute(DeviceField::Location)));
        let json = serde_json::to_string(&d).unwrap();
        let back: Device = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
