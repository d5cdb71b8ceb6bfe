//! Origin calls and the response envelope cached for them

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::Clock;
use crate::config::ForwardConfig;
use crate::request::ProxyRequest;
use crate::{Error, Result};

/// Envelope returned to proxy clients and stored as the cached value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    /// Status line, e.g. `"200 OK"`
    pub status: String,
    /// Numeric status code
    pub status_code: u16,
    /// Origin body, decoded as UTF-8 (lossy)
    pub body: String,
    /// When this response was fetched from the origin
    pub refreshed: DateTime<Utc>,
}

/// Executes decoded requests against their origin
#[derive(Clone)]
pub struct ForwardExecutor {
    client: Client,
    clock: Arc<dyn Clock>,
}

impl ForwardExecutor {
    /// Create an executor with the configured timeout and user agent
    pub fn new(config: &ForwardConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client, clock })
    }

    /// Perform exactly one origin call for `request` and return the
    /// serialized [`ProxyResponse`].
    ///
    /// Any HTTP status counts as a successful fetch; only transport failures,
    /// timeouts and cancellation are errors.
    pub async fn execute(&self, request: &ProxyRequest, cancel: CancellationToken) -> Result<Bytes> {
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Shutdown),
            response = self.fetch(request) => response?,
        };
        serde_json::to_vec(&response)
            .map(Bytes::from)
            .map_err(Error::from)
    }

    async fn fetch(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::Encoding(format!("invalid method: {}", request.method)))?;
        let url = url::Url::parse(&request.url)
            .map_err(|e| Error::Encoding(format!("invalid URL {}: {e}", request.url)))?;

        let mut builder = self.client.request(method.clone(), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        debug!(method = %method, url = %request.url, "Forwarding to origin");
        let response = builder.send().await.map_err(origin_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(origin_error)?;

        info!(
            method = %method,
            url = %request.url,
            status = status.as_u16(),
            bytes = body.len(),
            "Origin responded"
        );

        Ok(ProxyResponse {
            status: match status.canonical_reason() {
                Some(reason) => format!("{} {reason}", status.as_u16()),
                None => status.as_u16().to_string(),
            },
            status_code: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
            refreshed: self.clock.now(),
        })
    }
}

fn origin_error(err: reqwest::Error) -> Error {
    if err.is_builder() {
        Error::Encoding(err.to_string())
    } else if err.is_timeout() {
        Error::Origin(format!("origin timed out: {err}"))
    } else {
        Error::Origin(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn executor() -> ForwardExecutor {
        let config = ForwardConfig {
            timeout: Duration::from_secs(2),
            ..ForwardConfig::default()
        };
        ForwardExecutor::new(&config, Arc::new(ManualClock::default())).unwrap()
    }

    #[test]
    fn envelope_uses_camel_case_status_code() {
        let response = ProxyResponse {
            status: "200 OK".into(),
            status_code: 200,
            body: "hi".into(),
            refreshed: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["status"], "200 OK");
        assert_eq!(json["refreshed"], "2023-11-14T22:13:20Z");
    }

    #[tokio::test]
    async fn unreachable_origin_is_an_origin_error() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = executor()
            .execute(
                &ProxyRequest::get(format!("http://{addr}/a")),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Origin(_)), "{err}");
    }

    #[tokio::test]
    async fn malformed_url_is_an_encoding_error() {
        let err = executor()
            .execute(&ProxyRequest::get("not a url"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let err = executor()
            .execute(&ProxyRequest::get("http://127.0.0.1:9/"), token)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}
