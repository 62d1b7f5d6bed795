//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use printfleet_config::ConfigError;
use printfleet_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Gateway ──────────────────────────────────────────────────────

    #[error("Could not query {address}")]
    #[diagnostic(
        code(printfleet::query_failed),
        help(
            "Check that the query gateway is running and can reach the device.\n\
             Gateway URL is set under [gateway] in: printfleet config path"
        )
    )]
    QueryFailed {
        address: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Query gateway rejected the API key")]
    #[diagnostic(
        code(printfleet::auth_failed),
        help(
            "Store a new key with: printfleet config set-api-key\n\
             Or point gateway.api_key_env at a variable holding it."
        )
    )]
    AuthFailed,

    #[error("Request timed out after {seconds}s")]
    #[diagnostic(
        code(printfleet::timeout),
        help("Raise engine.query_timeout or check gateway responsiveness.")
    )]
    Timeout { seconds: u64 },

    // ── Resources ────────────────────────────────────────────────────

    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(
        code(printfleet::not_found),
        help("Run: printfleet {list_command} to see what is recorded")
    )]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    #[error("No state file at {path}")]
    #[diagnostic(
        code(printfleet::no_state),
        help(
            "The agent writes its state after downsampling and at shutdown.\n\
             Start it with: printfleet run"
        )
    )]
    NoStateFile { path: String },

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(printfleet::validation))]
    Validation { field: String, reason: String },

    #[error("Settings document rejected")]
    #[diagnostic(code(printfleet::invalid_settings), help("{problems}"))]
    InvalidSettings { problems: String },

    #[error("Range text rejected")]
    #[diagnostic(code(printfleet::invalid_ranges), help("{problems}"))]
    InvalidRanges { problems: String },

    // ── Agent ────────────────────────────────────────────────────────

    #[error("{protocol} listener failed: {reason}")]
    #[diagnostic(
        code(printfleet::listener),
        help("Another process may hold the port, or binding it needs elevated privileges.")
    )]
    Listener { protocol: String, reason: String },

    #[error("Storage error: {message}")]
    #[diagnostic(code(printfleet::storage))]
    Storage { message: String },

    #[error("Internal error: {message}")]
    #[diagnostic(code(printfleet::internal))]
    Internal { message: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error(transparent)]
    #[diagnostic(
        code(printfleet::config),
        help("Inspect the resolved configuration with: printfleet config show")
    )]
    Config(Box<ConfigError>),

    #[error("Prompt failed: {reason}")]
    #[diagnostic(
        code(printfleet::interactive),
        help("Use --yes (-y) to accept defaults in non-interactive contexts.")
    )]
    Prompt { reason: String },

    // ── IO / Serialization ───────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(printfleet::json), help("Check the JSON file contents and try again."))]
    Json(#[from] serde_json::Error),

    #[error("YAML rendering failed: {0}")]
    #[diagnostic(code(printfleet::yaml))]
    Yaml(#[from] serde_yaml::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::QueryFailed { .. } => exit_code::CONNECTION,
            Self::AuthFailed => exit_code::AUTH,
            Self::NotFound { .. } | Self::NoStateFile { .. } => exit_code::NOT_FOUND,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. }
            | Self::InvalidSettings { .. }
            | Self::InvalidRanges { .. }
            | Self::Json(_) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }

    pub fn prompt(e: impl std::fmt::Display) -> Self {
        Self::Prompt {
            reason: e.to_string(),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::DeviceNotFound { serial } => CliError::NotFound {
                resource_type: "device".into(),
                identifier: serial,
                list_command: "devices list --all".into(),
            },

            CoreError::MetricNotFound { tier, id } => CliError::NotFound {
                resource_type: format!("{tier} metric row"),
                identifier: id.to_string(),
                list_command: "devices list".into(),
            },

            CoreError::NoSerial { address } => CliError::QueryFailed {
                address,
                source: "device did not report a serial number".into(),
            },

            CoreError::QueryFailed { address, reason } => CliError::QueryFailed {
                address,
                source: reason.into(),
            },

            CoreError::Timeout { timeout_secs, .. } => CliError::Timeout {
                seconds: timeout_secs,
            },

            CoreError::Unauthorized => CliError::AuthFailed,

            CoreError::Listener { protocol, reason } => CliError::Listener { protocol, reason },

            CoreError::Storage { message } => CliError::Storage { message },

            CoreError::ValidationFailed { message } => CliError::Validation {
                field: "input".into(),
                reason: message,
            },

            CoreError::InvalidSettings { problems } => CliError::InvalidSettings {
                problems: problems.join("\n"),
            },

            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },

            CoreError::Internal(message) => CliError::Internal { message },
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::Io(e) => CliError::Io(e),
            other => CliError::Config(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_problems_are_usage_errors() {
        let err = CliError::from(CoreError::InvalidSettings {
            problems: vec!["concurrency must be between 1 and 1024".into()],
        });
        assert_eq!(err.exit_code(), exit_code::USAGE);
    }

    #[test]
    fn gateway_failures_map_to_distinct_codes() {
        assert_eq!(CliError::from(CoreError::Unauthorized).exit_code(), exit_code::AUTH);
        let timeout = CliError::from(CoreError::Timeout {
            address: "10.0.0.5".into(),
            timeout_secs: 5,
        });
        assert_eq!(timeout.exit_code(), exit_code::TIMEOUT);
        let missing = CliError::from(CoreError::DeviceNotFound {
            serial: "ABC123".into(),
        });
        assert_eq!(missing.exit_code(), exit_code::NOT_FOUND);
    }
}
