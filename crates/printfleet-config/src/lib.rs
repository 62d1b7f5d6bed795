//! Configuration for the printfleet agent.
//!
//! TOML file + `PRINTFLEET_` environment, gateway credential resolution
//! (env + keyring + plaintext), and translation into the core's
//! `EngineConfig` and the gateway `QueryClient`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use printfleet_api::{QueryClient, TlsMode, TransportConfig};
use printfleet_core::config::MIN_QUERY_TIMEOUT;
use printfleet_core::{DiscoverySettings, EngineConfig, GcPolicy, RetentionPolicy};

/// Keyring service under which gateway API keys are stored.
pub const KEYRING_SERVICE: &str = "printfleet";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("gateway client: {0}")]
    Gateway(#[from] printfleet_api::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub retention: RetentionSection,

    #[serde(default)]
    pub gc: GcSection,

    /// Discovery settings used until the agent has stored its own.
    #[serde(default)]
    pub discovery: DiscoverySettings,
}

/// The device-query gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Name used for the keyring entry (`printfleet/<name>`).
    #[serde(default = "default_gateway_name")]
    pub name: String,

    /// Gateway base URL (e.g., "http://127.0.0.1:8931").
    #[serde(default = "default_gateway_url")]
    pub url: String,

    /// API key (plaintext, prefer keyring or env var).
    pub api_key: Option<String>,

    /// Environment variable name containing the API key.
    pub api_key_env: Option<String>,

    /// Path to custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub insecure: bool,

    /// Whole-request timeout for gateway calls, in seconds.
    #[serde(default = "default_gateway_timeout")]
    pub timeout: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: default_gateway_name(),
            url: default_gateway_url(),
            api_key: None,
            api_key_env: None,
            ca_cert: None,
            insecure: false,
            timeout: default_gateway_timeout(),
        }
    }
}

fn default_gateway_name() -> String {
    "default".into()
}
fn default_gateway_url() -> String {
    "http://127.0.0.1:8931".into()
}
fn default_gateway_timeout() -> u64 {
    60
}

/// Timeouts and schedule periods, all in whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSection {
    pub query_timeout: u64,
    pub deep_scan_timeout: u64,
    pub listener_stop_timeout: u64,
    pub throttle_window: u64,
    pub warn_interval: u64,
    pub downsample_interval: u64,
    pub downsample_initial_delay: u64,
    pub gc_interval: u64,
    /// Defaults to `state.json` in the platform data directory.
    pub state_file: Option<PathBuf>,
}

impl Default for EngineSection {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            query_timeout: engine.query_timeout.as_secs(),
            deep_scan_timeout: engine.deep_scan_timeout.as_secs(),
            listener_stop_timeout: engine.listener_stop_timeout.as_secs(),
            throttle_window: engine.throttle_window.as_secs(),
            warn_interval: engine.warn_interval.as_secs(),
            downsample_interval: engine.downsample_interval.as_secs(),
            downsample_initial_delay: engine.downsample_initial_delay.as_secs(),
            gc_interval: engine.gc_interval.as_secs(),
            state_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionSection {
    pub raw_days: u32,
    pub hourly_days: u32,
    pub daily_days: u32,
}

impl Default for RetentionSection {
    fn default() -> Self {
        let policy = RetentionPolicy::default();
        Self {
            raw_days: policy.raw_days,
            hourly_days: policy.hourly_days,
            daily_days: policy.daily_days,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GcSection {
    pub scan_history_days: u32,
    pub hidden_device_days: u32,
}

impl Default for GcSection {
    fn default() -> Self {
        let policy = GcPolicy::default();
        Self {
            scan_history_days: policy.scan_history_days,
            hidden_device_days: policy.hidden_device_days,
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "printfleet", "printfleet")
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback().join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Where the agent keeps its state file unless told otherwise.
pub fn default_state_path() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback().join("state.json"),
        |dirs| dirs.data_local_dir().join("state.json"),
    )
}

fn home_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("printfleet");
    p
}

// ── Loading & saving ────────────────────────────────────────────────

/// Load from the canonical path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(None)
}

/// Load from `path` (or the canonical path) + environment.
///
/// Environment keys use `__` between levels:
/// `PRINTFLEET_GATEWAY__URL`, `PRINTFLEET_ENGINE__QUERY_TIMEOUT`.
pub fn load_config_from(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    debug!(path = %path.display(), "loading config");

    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("PRINTFLEET_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the gateway API key: named env var, then keyring, then the
/// plaintext field. `None` when the gateway needs no key.
pub fn resolve_api_key(gateway: &GatewayConfig) -> Option<SecretString> {
    // 1. Named env var
    if let Some(val) = gateway
        .api_key_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok())
    {
        return Some(SecretString::from(val));
    }

    // 2. System keyring
    if let Some(secret) = keyring::Entry::new(KEYRING_SERVICE, &gateway.name)
        .ok()
        .and_then(|entry| entry.get_password().ok())
    {
        return Some(SecretString::from(secret));
    }

    // 3. Plaintext in config
    gateway.api_key.clone().map(SecretString::from)
}

// ── Translation ─────────────────────────────────────────────────────

/// Build the core's runtime configuration, rejecting unusable values.
pub fn to_engine_config(cfg: &Config) -> Result<EngineConfig, ConfigError> {
    let engine = &cfg.engine;
    if engine.query_timeout < MIN_QUERY_TIMEOUT.as_secs() {
        return Err(ConfigError::Validation {
            field: "engine.query_timeout".into(),
            reason: format!("must be at least {}s", MIN_QUERY_TIMEOUT.as_secs()),
        });
    }
    for (field, value) in [
        ("engine.deep_scan_timeout", engine.deep_scan_timeout),
        ("engine.listener_stop_timeout", engine.listener_stop_timeout),
        ("engine.downsample_interval", engine.downsample_interval),
        ("engine.gc_interval", engine.gc_interval),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation {
                field: field.into(),
                reason: "must be greater than zero".into(),
            });
        }
    }
    let retention = &cfg.retention;
    if retention.raw_days == 0 || retention.hourly_days == 0 || retention.daily_days == 0 {
        return Err(ConfigError::Validation {
            field: "retention".into(),
            reason: "every horizon must be at least one day".into(),
        });
    }

    Ok(EngineConfig {
        query_timeout: Duration::from_secs(engine.query_timeout),
        deep_scan_timeout: Duration::from_secs(engine.deep_scan_timeout),
        listener_stop_timeout: Duration::from_secs(engine.listener_stop_timeout),
        throttle_window: Duration::from_secs(engine.throttle_window),
        warn_interval: Duration::from_secs(engine.warn_interval),
        retention: RetentionPolicy {
            raw_days: retention.raw_days,
            hourly_days: retention.hourly_days,
            daily_days: retention.daily_days,
        },
        gc: GcPolicy {
            scan_history_days: cfg.gc.scan_history_days,
            hidden_device_days: cfg.gc.hidden_device_days,
        },
        downsample_interval: Duration::from_secs(engine.downsample_interval),
        downsample_initial_delay: Duration::from_secs(engine.downsample_initial_delay),
        gc_interval: Duration::from_secs(engine.gc_interval),
        state_file: Some(
            engine
                .state_file
                .clone()
                .unwrap_or_else(default_state_path),
        ),
    })
}

/// The configured discovery settings, validated.
pub fn discovery_settings(cfg: &Config) -> Result<DiscoverySettings, ConfigError> {
    cfg.discovery
        .validate()
        .map_err(|e| ConfigError::Validation {
            field: "discovery".into(),
            reason: e.to_string(),
        })?;
    Ok(cfg.discovery.clone())
}

/// Transport settings for the gateway client.
pub fn gateway_transport(gateway: &GatewayConfig) -> TransportConfig {
    let tls = if gateway.insecure {
        TlsMode::DangerAcceptInvalid
    } else if let Some(ref ca_path) = gateway.ca_cert {
        TlsMode::CustomCa(ca_path.clone())
    } else {
        TlsMode::System
    };
    TransportConfig {
        tls,
        timeout: Duration::from_secs(gateway.timeout.max(1)),
    }
}

/// Build the gateway client with resolved credentials.
pub fn build_query_client(cfg: &Config) -> Result<QueryClient, ConfigError> {
    let gateway = &cfg.gateway;
    url::Url::parse(&gateway.url).map_err(|_| ConfigError::Validation {
        field: "gateway.url".into(),
        reason: format!("invalid URL: {}", gateway.url),
    })?;

    let api_key = resolve_api_key(gateway);
    if api_key.is_none() {
        debug!(gateway = %gateway.name, "no API key configured for gateway");
    }
    Ok(QueryClient::new(
        &gateway.url,
        api_key.as_ref(),
        &gateway_transport(gateway),
    )?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_engine_defaults() {
        let cfg = Config::default();
        let engine = to_engine_config(&cfg).unwrap();
        let reference = EngineConfig::default();

        assert_eq!(engine.query_timeout, reference.query_timeout);
        assert_eq!(engine.deep_scan_timeout, Duration::from_secs(30));
        assert_eq!(engine.retention, reference.retention);
        assert_eq!(engine.gc, reference.gc);
        assert_eq!(engine.downsample_interval, Duration::from_secs(6 * 3600));
        assert!(engine.state_file.is_some());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[gateway]
url = "https://gw.example.net:8443"
insecure = true

[engine]
query_timeout = 8
state_file = "/var/lib/printfleet/state.json"

[retention]
raw_days = 3

[discovery]
auto_discover_enabled = true
auto_discover_live_snmptrap = true
"#,
        )
        .unwrap();

        let cfg = load_config_from(Some(&path)).unwrap();
        assert_eq!(cfg.gateway.url, "https://gw.example.net:8443");
        assert_eq!(cfg.retention.raw_days, 3);
        assert_eq!(cfg.retention.daily_days, 365);
        assert!(cfg.discovery.auto_discover_live_snmptrap);

        let engine = to_engine_config(&cfg).unwrap();
        assert_eq!(engine.query_timeout, Duration::from_secs(8));
        assert_eq!(
            engine.state_file.as_deref(),
            Some(Path::new("/var/lib/printfleet/state.json"))
        );
        assert!(matches!(
            gateway_transport(&cfg.gateway).tls,
            TlsMode::DangerAcceptInvalid
        ));
    }

    #[test]
    fn query_timeout_floor_is_enforced() {
        let mut cfg = Config::default();
        cfg.engine.query_timeout = 1;
        let err = to_engine_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "engine.query_timeout"));
    }

    #[test]
    fn invalid_discovery_settings_are_rejected() {
        let mut cfg = Config::default();
        cfg.discovery.concurrency = 0;
        assert!(discovery_settings(&cfg).is_err());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut cfg = Config::default();
        cfg.gateway.api_key_env = Some("PF_TEST_KEY".into());
        cfg.gc.hidden_device_days = 14;

        save_config_to(&cfg, &path).unwrap();
        let loaded = load_config_from(Some(&path)).unwrap();
        assert_eq!(loaded.gateway.api_key_env.as_deref(), Some("PF_TEST_KEY"));
        assert_eq!(loaded.gc.hidden_device_days, 14);
    }

    #[test]
    fn plaintext_key_is_last_resort() {
        let gateway = GatewayConfig {
            name: "printfleet-test-no-such-entry".into(),
            api_key: Some("plain".into()),
            api_key_env: Some("PRINTFLEET_TEST_UNSET_VARIABLE".into()),
            ..GatewayConfig::default()
        };
        let key = resolve_api_key(&gateway).unwrap();
        assert_eq!(secrecy::ExposeSecret::expose_secret(&key), "plain");
    }
}
