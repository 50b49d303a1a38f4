// Numan Thabit 2025
//! HTTP boundary: request/response values and the client seam.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::{Client, Method};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

/// A received response. Header names are lower-cased.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub timing: Duration,
}

impl Response {
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Anything able to execute one request. Retries are never performed here.
pub trait HttpClient: Send + Sync + 'static {
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

/// `reqwest`-backed client shared by all virtual users.
#[derive(Clone)]
pub struct ReqwestClient {
    client: Client,
    default_timeout: Duration,
}

impl ReqwestClient {
    pub fn new(default_timeout: Duration, pool_max_idle_per_host: usize) -> Result<Self> {
        let client = Client::builder()
            .tcp_keepalive(Some(Duration::from_secs(15)))
            .tcp_nodelay(true)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build()
            .context("failed to construct http client")?;
        Ok(Self {
            client,
            default_timeout,
        })
    }
}

impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<Response, TransportError> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let start = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|err| classify(err, timeout))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| classify(err, timeout))?;

        Ok(Response {
            status,
            headers,
            body,
            timing: start.elapsed(),
        })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_builder() {
        TransportError::Build(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}
