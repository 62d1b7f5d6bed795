// ── Discovery protocols ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// One independently toggleable discovery source.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DiscoveryProtocol {
    Mdns,
    Ssdp,
    #[strum(to_string = "wsd", serialize = "ws_discovery")]
    #[serde(rename = "wsd")]
    WsDiscovery,
    #[strum(to_string = "snmptrap", serialize = "snmp_trap")]
    #[serde(rename = "snmptrap")]
    SnmpTrap,
    Llmnr,
    /// Periodic sweep over configured ranges.
    ActiveScan,
}

impl DiscoveryProtocol {
    /// Passive listeners react to traffic and are throttled per address.
    pub fn is_passive(self) -> bool {
        !matches!(self, Self::ActiveScan)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn names_match_settings_keys() {
        assert_eq!(DiscoveryProtocol::WsDiscovery.to_string(), "wsd");
        assert_eq!(DiscoveryProtocol::SnmpTrap.to_string(), "snmptrap");
        assert_eq!(DiscoveryProtocol::ActiveScan.to_string(), "active_scan");
        assert_eq!(
            "snmp_trap".parse::<DiscoveryProtocol>().unwrap(),
            DiscoveryProtocol::SnmpTrap
        );
        assert!(!DiscoveryProtocol::ActiveScan.is_passive());
        assert!(DiscoveryProtocol::Llmnr.is_passive());
    }
}
