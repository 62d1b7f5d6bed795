// ── Discovery ──
//
// Passive listeners, the active range scanner, and the manager that
// starts and stops them as settings change.

mod lifecycle;
mod listener;
mod manager;
pub mod packets;
pub mod ranges;
mod scanner;
mod sink;

pub use lifecycle::ListenerTask;
pub use listener::{DiscoveryListener, ListenerFactory, UdpListener, UdpListenerFactory, extract_addresses};
pub use manager::{DiscoveryManager, ManagerParts};
pub use ranges::{DEFAULT_MAX_ADDRESSES, RangeError, parse_ranges};
pub use scanner::{ActiveScanner, ScanPass};
pub use sink::{AddressHandler, AddressSink};
