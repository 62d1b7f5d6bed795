use thiserror::Error;

/// Top-level error type for the `printfleet-api` crate.
///
/// Covers every failure mode of the gateway surface: transport,
/// authentication, structured gateway errors, and decoding.
/// `printfleet-core` folds these into ordinary query failures.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// API key rejected by the gateway.
    #[error("Invalid API key")]
    InvalidApiKey,

    /// Header value could not be built from the configured key.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The gateway gave up waiting on the device.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Gateway ─────────────────────────────────────────────────────
    /// Structured error from the gateway (`{message, code}` body).
    #[error("Gateway error (HTTP {status}): {message}")]
    Gateway {
        message: String,
        code: Option<String>,
        status: u16,
    },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying on
    /// the next schedule tick.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } => true,
            Self::Gateway { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if the gateway reported the device as unreachable.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::Gateway { code: Some(code), .. } if code == "unreachable"
        )
    }

    /// Extract the gateway error code, if available.
    pub fn api_error_code(&self) -> Option<&str> {
        match self {
            Self::Gateway { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}
