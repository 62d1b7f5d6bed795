// printfleet-api: Async Rust client for the printfleet device-query gateway
//
// The gateway owns the SNMP wire layer (vendor OID tables, PDU decoding).
// This crate only speaks its JSON surface.

pub mod client;
pub mod error;
pub mod transport;
pub mod types;

pub use client::QueryClient;
pub use error::Error;
pub use transport::{TlsMode, TransportConfig};
pub use types::{
    DeviceInfo, HealthStatus, MetricsReading, MetricsRequest, QueryMode, QueryRequest,
    SearchRequest, SearchResult,
};
