// ── Core error types ──
//
// Errors surfaced by printfleet-core. Gateway transport details never
// leak past this boundary: the `From<printfleet_api::Error>` impl folds
// them into query-level variants that the enrichment path treats as
// ordinary device failures.

use thiserror::Error;

use crate::model::Tier;

/// Errors raised by the engine, its stores and the query collaborator.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Device errors ────────────────────────────────────────────────
    #[error("Device not found: {serial}")]
    DeviceNotFound { serial: String },

    #[error("Device at {address} did not report a serial number")]
    NoSerial { address: String },

    // ── Query errors ─────────────────────────────────────────────────
    #[error("Query to {address} failed: {reason}")]
    QueryFailed { address: String, reason: String },

    #[error("Query to {address} timed out after {timeout_secs}s")]
    Timeout { address: String, timeout_secs: u64 },

    #[error("Query gateway rejected the configured API key")]
    Unauthorized,

    // ── Listener errors ──────────────────────────────────────────────
    #[error("{protocol} listener failed: {reason}")]
    Listener { protocol: String, reason: String },

    // ── Storage errors ───────────────────────────────────────────────
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Metric row {id} not found in {tier} tier")]
    MetricNotFound { tier: Tier, id: u64 },

    // ── Validation errors ────────────────────────────────────────────
    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Invalid settings document: {}", .problems.join("; "))]
    InvalidSettings { problems: Vec<String> },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Device-communication failures are retried on the next schedule
    /// tick; everything else is surfaced to the caller.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            Self::QueryFailed { .. } | Self::Timeout { .. } | Self::NoSerial { .. }
        )
    }

    pub(crate) fn storage(message: impl std::fmt::Display) -> Self {
        Self::Storage {
            message: message.to_string(),
        }
    }
}

// ── Conversion from gateway errors ───────────────────────────────────

impl From<printfleet_api::Error> for CoreError {
    fn from(err: printfleet_api::Error) -> Self {
        match err {
            printfleet_api::Error::InvalidApiKey => CoreError::Unauthorized,
            printfleet_api::Error::Authentication { message } => CoreError::Config { message },
            printfleet_api::Error::Transport(ref e) => CoreError::QueryFailed {
                address: e
                    .url()
                    .and_then(|u| u.host_str().map(str::to_owned))
                    .unwrap_or_else(|| "<gateway>".into()),
                reason: e.to_string(),
            },
            printfleet_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid gateway URL: {e}"),
            },
            printfleet_api::Error::Timeout { timeout_secs } => CoreError::Timeout {
                address: "<gateway>".into(),
                timeout_secs,
            },
            printfleet_api::Error::Tls(msg) => CoreError::Config {
                message: format!("TLS error: {msg}"),
            },
            printfleet_api::Error::Gateway {
                ref message,
                status,
                ..
            } => CoreError::QueryFailed {
                address: "<gateway>".into(),
                reason: match err.api_error_code() {
                    Some(code) => format!("HTTP {status} ({code}): {message}"),
                    None => format!("HTTP {status}: {message}"),
                },
            },
            printfleet_api::Error::Deserialization { message, body: _ } => {
                CoreError::QueryFailed {
                    address: "<gateway>".into(),
                    reason: format!("malformed gateway response: {message}"),
                }
            }
        }
    }
}
