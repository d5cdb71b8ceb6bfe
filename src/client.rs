//! Client for a running proxy

use std::time::Duration;

use reqwest::{Client, header};
use tracing::debug;

use crate::request::ProxyRequest;
use crate::{Error, Result};

/// Ships encoded requests to a proxy's `/proxy` endpoint
#[derive(Clone)]
pub struct ProxyClient {
    client: Client,
    endpoint: String,
}

impl ProxyClient {
    /// Client for the proxy at `server` (e.g. `http://localhost:8080`)
    pub fn new(server: &str) -> Result<Self> {
        let base = url::Url::parse(server)
            .map_err(|e| Error::Config(format!("invalid proxy address {server}: {e}")))?;
        let endpoint = base
            .join("proxy")
            .map_err(|e| Error::Config(format!("invalid proxy address {server}: {e}")))?;
        let client = Client::builder()
            .user_agent(format!("hproxy-client/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// `GET url` through the proxy with the given TTLs.
    ///
    /// Returns the proxy's JSON reply whatever its status: either the cached
    /// response envelope or an `{"error": ...}` object.
    pub async fn fetch(&self, url: &str, min_ttl: Duration, max_ttl: Duration) -> Result<serde_json::Value> {
        self.send(&ProxyRequest::get(url), min_ttl, max_ttl).await
    }

    /// Send an arbitrary request through the proxy
    pub async fn send(
        &self,
        request: &ProxyRequest,
        min_ttl: Duration,
        max_ttl: Duration,
    ) -> Result<serde_json::Value> {
        let body = request.encode()?;
        let min = humantime::format_duration(min_ttl).to_string();
        let max = humantime::format_duration(max_ttl).to_string();

        debug!(endpoint = %self.endpoint, url = %request.url, min_ttl = %min, max_ttl = %max, "Sending to proxy");
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("min_ttl", min.as_str()), ("max_ttl", max.as_str())])
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Origin(format!("proxy unreachable: {e}")))?;

        let status = response.status();
        let raw = response
            .bytes()
            .await
            .map_err(|e| Error::Origin(format!("reading proxy reply: {e}")))?;
        serde_json::from_slice(&raw).map_err(|e| {
            Error::Origin(format!("proxy replied {status} with a non-JSON body: {e}"))
        })
    }
}
