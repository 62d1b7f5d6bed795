// Async HTTP client for the device-query gateway.
//
// Base path: <gateway>/v1/
// Auth: optional X-API-KEY header

use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::types::{
    DeviceInfo, HealthStatus, MetricsReading, MetricsRequest, QueryRequest, SearchRequest,
    SearchResult,
};
use crate::{Error, TransportConfig};

// ── Error response shape from the gateway ────────────────────────────

#[derive(serde::Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

// ── Client ───────────────────────────────────────────────────────────

/// Async client for the device-query gateway.
///
/// Cheap to clone; the underlying `reqwest::Client` pools connections.
#[derive(Clone)]
pub struct QueryClient {
    http: reqwest::Client,
    base_url: Url,
}

// The API key rides in the client's default headers; keep it out of logs.
impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl QueryClient {
    // ── Constructors ─────────────────────────────────────────────────

    /// Build from a base URL, an optional API key, and transport config.
    ///
    /// When a key is given it is injected as `X-API-KEY` on every request.
    pub fn new(
        base_url: &str,
        api_key: Option<&SecretString>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            let mut key_value = HeaderValue::from_str(key.expose_secret()).map_err(|e| {
                Error::Authentication {
                    message: format!("invalid API key header value: {e}"),
                }
            })?;
            key_value.set_sensitive(true);
            headers.insert("X-API-KEY", key_value);
        }

        let http = transport.build_client(headers)?;
        let base_url = Self::normalize_base_url(base_url)?;
        Ok(Self { http, base_url })
    }

    /// Wrap an existing `reqwest::Client` (caller manages auth headers).
    pub fn from_reqwest(base_url: &str, http: reqwest::Client) -> Result<Self, Error> {
        let base_url = Self::normalize_base_url(base_url)?;
        Ok(Self { http, base_url })
    }

    /// Ensure the base path ends with `/` so relative joins append.
    fn normalize_base_url(raw: &str) -> Result<Url, Error> {
        let mut url = Url::parse(raw)?;
        let path = url.path().trim_end_matches('/').to_owned();
        url.set_path(&format!("{path}/"));
        Ok(url)
    }

    /// The normalized gateway base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── Endpoints ────────────────────────────────────────────────────

    /// Identify the device at `request.address`.
    pub async fn query(&self, request: &QueryRequest) -> Result<DeviceInfo, Error> {
        self.post("v1/query", request).await
    }

    /// Read counters and supply levels.
    pub async fn collect_metrics(&self, request: &MetricsRequest) -> Result<MetricsReading, Error> {
        self.post("v1/metrics", request).await
    }

    /// Search for the identifier currently yielding `request.value`.
    pub async fn search_value(&self, request: &SearchRequest) -> Result<SearchResult, Error> {
        self.post("v1/search", request).await
    }

    /// Gateway liveness.
    pub async fn health(&self) -> Result<HealthStatus, Error> {
        let url = self.url("v1/health")?;
        debug!("GET {url}");

        let resp = self.http.get(url).send().await?;
        self.handle_response(resp).await
    }

    // ── HTTP verbs ───────────────────────────────────────────────────

    fn url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(path)?)
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let url = self.url(path)?;
        debug!("POST {url}");

        let resp = self.http.post(url).json(body).send().await?;
        self.handle_response(resp).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        resp: reqwest::Response,
    ) -> Result<T, Error> {
        let status = resp.status();
        if status.is_success() {
            let body = resp.text().await?;
            serde_json::from_str(&body).map_err(|e| {
                let preview: String = body.chars().take(200).collect();
                Error::Deserialization {
                    message: format!("{e} (body preview: {preview:?})"),
                    body,
                }
            })
        } else {
            Err(self.parse_error(status, resp).await)
        }
    }

    async fn parse_error(&self, status: reqwest::StatusCode, resp: reqwest::Response) -> Error {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Error::InvalidApiKey;
        }

        let raw = resp.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<ErrorResponse>(&raw).ok();

        if status == reqwest::StatusCode::GATEWAY_TIMEOUT {
            let timeout_secs = parsed.and_then(|e| e.timeout_secs).unwrap_or(0);
            return Error::Timeout { timeout_secs };
        }

        if let Some(err) = parsed {
            Error::Gateway {
                status: status.as_u16(),
                message: err.message.unwrap_or_else(|| status.to_string()),
                code: err.code,
            }
        } else {
            Error::Gateway {
                status: status.as_u16(),
                message: if raw.is_empty() {
                    status.to_string()
                } else {
                    raw
                },
                code: None,
            }
        }
    }
}
