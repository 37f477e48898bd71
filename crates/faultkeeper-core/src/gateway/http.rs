//! HTTP client for the Toxiproxy control API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::trace;

use super::{GatewayError, ProxyApi, TOXIC_TIMEOUT_MS, ToxicDirection};
use crate::catalog::ProxySpec;

/// Per-request timeout; the engine runs on the same container network,
/// so anything slower than this is treated as unreachable.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct ProxyBody<'a> {
    name: &'a str,
    listen: &'a str,
    upstream: &'a str,
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct ToxicBody {
    name: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    stream: &'static str,
    toxicity: f64,
    attributes: TimeoutAttributes,
}

#[derive(Debug, Serialize)]
struct TimeoutAttributes {
    timeout: u64,
}

/// Client for a Toxiproxy control endpoint (e.g. `http://toxiproxy:8474`).
#[derive(Debug, Clone)]
pub struct ToxiproxyClient {
    http: reqwest::Client,
    base_url: String,
}

impl ToxiproxyClient {
    /// Creates a client for the given control endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        if base_url.is_empty() {
            return Err(GatewayError::InvalidUrl("empty base URL".to_string()));
        }
        Ok(Self { http, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Converts a non-success response into a typed API error.
    async fn check(response: reqwest::Response) -> Result<(), GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(GatewayError::Api {
            status: status.as_u16(),
            message,
        })
    }

    fn transport(error: reqwest::Error) -> GatewayError {
        GatewayError::Network(error.to_string())
    }
}

#[async_trait]
impl ProxyApi for ToxiproxyClient {
    async fn create_proxy(&self, spec: &ProxySpec) -> Result<(), GatewayError> {
        let body = ProxyBody {
            name: &spec.name,
            listen: &spec.listen,
            upstream: &spec.upstream,
            enabled: true,
        };
        trace!(proxy = %spec.name, "POST /proxies");
        let response = self
            .http
            .post(self.url("/proxies"))
            .json(&body)
            .send()
            .await
            .map_err(Self::transport)?;
        Self::check(response).await
    }

    async fn has_toxic(&self, proxy: &str, toxic: &str) -> Result<bool, GatewayError> {
        trace!(proxy, toxic, "GET toxic");
        let response = self
            .http
            .get(self.url(&format!("/proxies/{proxy}/toxics/{toxic}")))
            .send()
            .await
            .map_err(Self::transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }

    async fn add_toxic(&self, proxy: &str, direction: ToxicDirection) -> Result<(), GatewayError> {
        let body = ToxicBody {
            name: direction.toxic_name(),
            kind: "timeout",
            stream: direction.stream(),
            toxicity: 1.0,
            attributes: TimeoutAttributes {
                timeout: TOXIC_TIMEOUT_MS,
            },
        };
        trace!(proxy, toxic = direction.toxic_name(), "POST toxic");
        let response = self
            .http
            .post(self.url(&format!("/proxies/{proxy}/toxics")))
            .json(&body)
            .send()
            .await
            .map_err(Self::transport)?;
        Self::check(response).await
    }

    async fn remove_toxic(&self, proxy: &str, toxic: &str) -> Result<(), GatewayError> {
        trace!(proxy, toxic, "DELETE toxic");
        let response = self
            .http
            .delete(self.url(&format!("/proxies/{proxy}/toxics/{toxic}")))
            .send()
            .await
            .map_err(Self::transport)?;
        Self::check(response).await
    }

    async fn delete_proxy(&self, proxy: &str) -> Result<(), GatewayError> {
        trace!(proxy, "DELETE proxy");
        let response = self
            .http
            .delete(self.url(&format!("/proxies/{proxy}")))
            .send()
            .await
            .map_err(Self::transport)?;
        Self::check(response).await
    }
}
