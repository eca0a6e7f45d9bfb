//! Outbound HTTP seam.
//!
//! [`OutboundRequest`] describes one call; an [`HttpTransport`] performs it.
//! The transport knows nothing of caching or rate limits.

use crate::keys;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Authorization scheme sent to Discord.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// OAuth2 access token of a dashboard user.
    Bearer(String),
    /// Bot token.
    Bot(String),
}

impl Credentials {
    pub fn header_value(&self) -> String {
        match self {
            Credentials::Bearer(token) => format!("Bearer {}", token),
            Credentials::Bot(token) => format!("Bot {}", token),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Credentials::Bot(_) => f.write_str("Bot(<redacted>)"),
        }
    }
}

/// One outbound call, consumed by the executor.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: String,
    pub credentials: Option<Credentials>,
    pub body: Option<Value>,
    pub cache_key: Option<String>,
    pub cache_ttl: u64,
    /// Write through on success but do not serve from cache.
    pub skip_cache_read: bool,
    pub max_retries: u32,
}

impl OutboundRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            credentials: None,
            body: None,
            cache_key: None,
            cache_ttl: 0,
            skip_cache_read: false,
            max_retries: 0,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.credentials = Some(Credentials::Bearer(token.to_string()));
        self
    }

    pub fn bot(mut self, token: &str) -> Self {
        self.credentials = Some(Credentials::Bot(token.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn cached(mut self, key: impl Into<String>, ttl_seconds: u64) -> Self {
        self.cache_key = Some(key.into());
        self.cache_ttl = ttl_seconds;
        self
    }

    pub fn skip_cache_read(mut self, skip: bool) -> Self {
        self.skip_cache_read = skip;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn endpoint_id(&self) -> String {
        keys::endpoint_id(&self.url)
    }
}

/// Raw upstream answer. Header names are lower-case.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// No HTTP answer was obtained.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError>;
}

/// Production transport over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("discord-gate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.as_reqwest(), &request.url)
            .header("accept", "application/json");

        if let Some(credentials) = &request.credentials {
            builder = builder.header("authorization", credentials.header_value());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError(format!("Request to {} failed: {}", request.url, e)))?;

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
            .text()
            .await
            .map_err(|e| TransportError(format!("Failed to read response body: {}", e)))?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
