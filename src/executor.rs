//! Cache-first, rate-limit aware execution of a single outbound call.
//!
//! ```text
//! cache check ─hit──────────────────────────────────────────▶ value
//!      │miss
//! gate check ─limited──────────────────────────────────────▶ RateLimited
//!      │clear
//! execute ─2xx──▶ write through ────────────────────────────▶ value
//!      ├─429──▶ record penalty ─────────────────────────────▶ RateLimited
//!      └─other / transport failure ─────────────────────────▶ Upstream / Connection
//! ```
//!
//! No locking happens across these steps. Concurrent callers may each miss the
//! cache and each call Discord; the duplicate is bounded by the cache TTL.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gate::RateLimitGate;
use crate::metrics::{FetchOutcome, MetricsCollector};
use crate::store::CacheStore;
use crate::transport::{HttpTransport, OutboundRequest, TransportResponse};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DISCORD_RESET_AFTER_HEADER: &str = "x-ratelimit-reset-after";

#[derive(Clone)]
pub struct CachedFetcher {
    transport: Arc<dyn HttpTransport>,
    store: CacheStore,
    gate: RateLimitGate,
    metrics: MetricsCollector,
    default_retry_after_secs: u64,
    retry_backoff: Duration,
}

impl CachedFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, store: CacheStore, gate: RateLimitGate) -> Self {
        Self {
            transport,
            store,
            gate,
            metrics: MetricsCollector::new(),
            default_retry_after_secs: 60,
            retry_backoff: Duration::from_millis(250),
        }
    }

    pub fn from_config(
        transport: Arc<dyn HttpTransport>,
        store: CacheStore,
        config: &Config,
    ) -> Self {
        let gate = RateLimitGate::from_config(store.clone(), config);
        Self {
            default_retry_after_secs: config.default_retry_after_secs,
            retry_backoff: config.retry_backoff(),
            ..Self::new(transport, store, gate)
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn gate(&self) -> &RateLimitGate {
        &self.gate
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Cached entries that do not decode as `T` count as misses; a 2xx that
    /// does not decode is an `Upstream` error and is never cached.
    pub async fn fetch_with_policy<T: DeserializeOwned>(
        &self,
        request: &OutboundRequest,
    ) -> Result<T> {
        let endpoint = request.endpoint_id();

        if !request.skip_cache_read {
            if let Some(key) = request.cache_key.as_deref() {
                if let Some(cached) = self.store.get::<T>(key).await {
                    debug!(endpoint = %endpoint, cache_key = key, "Cache hit");
                    self.metrics.record(&endpoint, FetchOutcome::CacheHit, false).await;
                    return Ok(cached);
                }
            }
        }

        let status = self.gate.check(&endpoint).await;
        if status.limited {
            let retry_after = status.retry_after.unwrap_or_default();
            warn!(endpoint = %endpoint, retry_after, "Endpoint is rate limited, not calling Discord");
            self.metrics.record(&endpoint, FetchOutcome::RateLimited, false).await;
            return Err(Error::RateLimited { retry_after });
        }

        let response = match self.execute(request).await {
            Ok(response) => response,
            Err(err) => {
                self.metrics.record(&endpoint, FetchOutcome::Failed, false).await;
                return Err(err);
            }
        };

        if response.is_success() {
            let (decoded, body) = match decode_body::<T>(&response) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(endpoint = %endpoint, error = %err, "Discord answered with an unusable body");
                    self.metrics.record(&endpoint, FetchOutcome::Failed, true).await;
                    return Err(err);
                }
            };
            if let Some(key) = request.cache_key.as_deref() {
                self.store.put(key, &body, request.cache_ttl).await;
            }
            self.metrics.record(&endpoint, FetchOutcome::Fetched, true).await;
            return Ok(decoded);
        }

        if response.status == 429 {
            let advertised = retry_after_secs(&response).unwrap_or(self.default_retry_after_secs);
            let penalty = self.gate.record_penalty(&endpoint, advertised).await;
            self.metrics.record(&endpoint, FetchOutcome::RateLimited, true).await;
            return Err(Error::RateLimited {
                retry_after: penalty,
            });
        }

        self.metrics.record(&endpoint, FetchOutcome::Failed, true).await;
        Err(Error::Upstream {
            status: response.status,
            message: upstream_message(&response),
        })
    }

    /// Send with transport-level retries. HTTP answers, 429 included, are never retried.
    async fn execute(&self, request: &OutboundRequest) -> Result<TransportResponse> {
        let mut attempt = 0;
        loop {
            match self.transport.send(request).await {
                Ok(response) => return Ok(response),
                Err(err) if attempt < request.max_retries => {
                    let delay = self.retry_backoff * 2u32.saturating_pow(attempt);
                    warn!(
                        url = %request.url,
                        attempt = attempt + 1,
                        max_retries = request.max_retries,
                        error = %err,
                        "Transport failure, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(Error::Connection(err.0)),
            }
        }
    }
}

/// Decoded payload plus the raw JSON that gets cached.
fn decode_body<T: DeserializeOwned>(response: &TransportResponse) -> Result<(T, Value)> {
    let body = if response.body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&response.body).map_err(|e| Error::Upstream {
            status: response.status,
            message: format!("invalid JSON body: {}", e),
        })?
    };
    let decoded = serde_json::from_value(body.clone()).map_err(|e| Error::Upstream {
        status: response.status,
        message: format!("unexpected payload: {}", e),
    })?;
    Ok((decoded, body))
}

/// Seconds Discord asked us to wait: headers first, then the JSON body.
/// Fractions round up; zero and negative values count as absent.
pub fn retry_after_secs(response: &TransportResponse) -> Option<u64> {
    let from_header = |name: &str| {
        response
            .header(name)
            .and_then(|value| value.trim().parse::<f64>().ok())
    };
    let from_body = || {
        serde_json::from_str::<Value>(&response.body)
            .ok()?
            .get("retry_after")?
            .as_f64()
    };

    let positive = |secs: &f64| secs.is_finite() && *secs > 0.0;

    from_header("retry-after")
        .filter(positive)
        .or_else(|| from_header(DISCORD_RESET_AFTER_HEADER).filter(positive))
        .or_else(|| from_body().filter(positive))
        .map(|secs| secs.ceil() as u64)
}

fn upstream_message(response: &TransportResponse) -> String {
    serde_json::from_str::<Value>(&response.body)
        .ok()
        .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {}", response.status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<std::result::Result<TransportResponse, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn push(&self, response: std::result::Result<TransportResponse, TransportError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(
            &self,
            _request: &OutboundRequest,
        ) -> std::result::Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError("script exhausted".into())))
        }
    }

    fn fetcher() -> (CachedFetcher, Arc<ScriptedTransport>, CacheStore) {
        let transport = Arc::new(ScriptedTransport::default());
        let store = CacheStore::in_memory();
        let gate = RateLimitGate::new(store.clone(), 60, 30);
        let fetcher = CachedFetcher::new(transport.clone(), store.clone(), gate)
            .with_retry_backoff(Duration::from_millis(1));
        (fetcher, transport, store)
    }

    const URL: &str = "https://discord.com/api/v10/users/@me";

    #[tokio::test]
    async fn test_cache_hit_skips_gate_and_network() {
        let (fetcher, transport, store) = fetcher();
        store.put("me:abc", &json!({"id": "1"}), 600).await;
        fetcher.gate().record_penalty("/api/v10/users/@me", 60).await;

        let request = OutboundRequest::get(URL).cached("me:abc", 600);
        let value = fetcher.fetch_with_policy::<Value>(&request).await.unwrap();

        assert_eq!(value, json!({"id": "1"}));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_gate_blocks_uncached_calls() {
        let (fetcher, transport, _) = fetcher();
        fetcher.gate().record_penalty("/api/v10/users/@me", 60).await;

        let err = fetcher
            .fetch_with_policy::<Value>(&OutboundRequest::get(URL))
            .await
            .unwrap_err();

        assert_eq!(err, Error::RateLimited { retry_after: 30 });
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_success_writes_through() {
        let (fetcher, transport, store) = fetcher();
        transport.push(Ok(TransportResponse::new(200, r#"{"id":"7"}"#)));

        let request = OutboundRequest::get(URL).cached("me:abc", 600);
        fetcher.fetch_with_policy::<Value>(&request).await.unwrap();

        assert_eq!(store.get::<Value>("me:abc").await, Some(json!({"id": "7"})));
        let ttl = store.ttl("me:abc").await.unwrap();
        assert!((598..=600).contains(&ttl));
    }

    #[tokio::test]
    async fn test_429_records_penalty_and_is_not_retried() {
        let (fetcher, transport, store) = fetcher();
        transport.push(Ok(
            TransportResponse::new(429, r#"{"message":"You are being rate limited.","retry_after":12.5}"#),
        ));

        let request = OutboundRequest::get(URL).max_retries(3);
        let err = fetcher.fetch_with_policy::<Value>(&request).await.unwrap_err();

        assert_eq!(err, Error::RateLimited { retry_after: 13 });
        assert_eq!(transport.calls(), 1);
        assert!(store.exists("ratelimit:/api/v10/users/@me").await);
    }

    #[tokio::test]
    async fn test_429_without_wait_uses_default() {
        let (fetcher, transport, store) = fetcher();
        transport.push(Ok(TransportResponse::new(429, "")));

        let err = fetcher
            .fetch_with_policy::<Value>(&OutboundRequest::get(URL))
            .await
            .unwrap_err();

        assert_eq!(err, Error::RateLimited { retry_after: 60 });
        assert!(store.ttl("ratelimit:/api/v10/users/@me").await.unwrap() <= 60);
    }

    #[tokio::test]
    async fn test_other_status_is_upstream_error_and_leaves_gate_alone() {
        let (fetcher, transport, store) = fetcher();
        transport.push(Ok(TransportResponse::new(404, r#"{"message":"Unknown Guild","code":10004}"#)));

        let err = fetcher
            .fetch_with_policy::<Value>(&OutboundRequest::get(URL).cached("me:abc", 60))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            Error::Upstream {
                status: 404,
                message: "Unknown Guild".into()
            }
        );
        assert!(!store.exists("ratelimit:/api/v10/users/@me").await);
        assert!(store.get::<Value>("me:abc").await.is_none());
    }

    #[tokio::test]
    async fn test_transport_failures_are_retried_within_budget() {
        let (fetcher, transport, _) = fetcher();
        transport.push(Err(TransportError("timeout".into())));
        transport.push(Err(TransportError("timeout".into())));
        transport.push(Ok(TransportResponse::new(200, "[]")));

        let value = fetcher
            .fetch_with_policy::<Value>(&OutboundRequest::get(URL).max_retries(2))
            .await
            .unwrap();

        assert_eq!(value, json!([]));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_yield_connection_error() {
        let (fetcher, transport, store) = fetcher();
        transport.push(Err(TransportError("dns".into())));
        transport.push(Err(TransportError("dns".into())));

        let err = fetcher
            .fetch_with_policy::<Value>(&OutboundRequest::get(URL).max_retries(1))
            .await
            .unwrap_err();

        assert_eq!(err, Error::Connection("dns".into()));
        assert_eq!(transport.calls(), 2);
        assert!(!store.exists("ratelimit:/api/v10/users/@me").await);
    }

    #[tokio::test]
    async fn test_skip_cache_read_still_writes_through() {
        let (fetcher, transport, store) = fetcher();
        store.put("me:abc", &json!({"id": "old"}), 600).await;
        transport.push(Ok(TransportResponse::new(200, r#"{"id":"new"}"#)));

        let request = OutboundRequest::get(URL)
            .cached("me:abc", 600)
            .skip_cache_read(true);
        let value = fetcher.fetch_with_policy::<Value>(&request).await.unwrap();

        assert_eq!(value, json!({"id": "new"}));
        assert_eq!(transport.calls(), 1);
        assert_eq!(store.get::<Value>("me:abc").await, Some(json!({"id": "new"})));
    }

    #[test]
    fn test_retry_after_sources() {
        let header = TransportResponse::new(429, "").with_header("Retry-After", "7");
        assert_eq!(retry_after_secs(&header), Some(7));

        let reset_after =
            TransportResponse::new(429, "").with_header("X-RateLimit-Reset-After", "0.25");
        assert_eq!(retry_after_secs(&reset_after), Some(1));

        let body = TransportResponse::new(429, r#"{"retry_after": 45}"#);
        assert_eq!(retry_after_secs(&body), Some(45));

        let garbage = TransportResponse::new(429, "<html>").with_header("Retry-After", "soon");
        assert_eq!(retry_after_secs(&garbage), None);
    }

    #[test]
    fn test_zero_header_does_not_hide_body_wait() {
        let response = TransportResponse::new(429, r#"{"retry_after": 0.4}"#)
            .with_header("Retry-After", "0");
        assert_eq!(retry_after_secs(&response), Some(1));
    }

    #[derive(Debug, serde::Deserialize)]
    struct Shaped {
        #[allow(dead_code)]
        id: String,
    }

    #[tokio::test]
    async fn test_mismatched_payload_is_not_cached() {
        let (fetcher, transport, store) = fetcher();
        transport.push(Ok(TransportResponse::new(200, r#"{"name":"no id"}"#)));
        transport.push(Ok(TransportResponse::new(200, r#"{"id":"1"}"#)));
        let request = OutboundRequest::get(URL).cached("guild:1", 600);

        let err = fetcher.fetch_with_policy::<Shaped>(&request).await.unwrap_err();
        assert!(matches!(err, Error::Upstream { status: 200, .. }));
        assert!(store.get::<Value>("guild:1").await.is_none());

        fetcher.fetch_with_policy::<Shaped>(&request).await.unwrap();
        assert_eq!(transport.calls(), 2);
        assert_eq!(store.get::<Value>("guild:1").await, Some(json!({"id": "1"})));
    }

    #[tokio::test]
    async fn test_invalid_json_counts_as_network_failure() {
        let (fetcher, transport, _) = fetcher();
        transport.push(Ok(TransportResponse::new(200, "<html>")));

        let err = fetcher
            .fetch_with_policy::<Value>(&OutboundRequest::get(URL))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Upstream { status: 200, .. }));
        let metrics = fetcher.metrics().endpoint("/api/v10/users/@me").await.unwrap();
        assert_eq!(metrics.network_calls, 1);
        assert_eq!(metrics.failures, 1);
    }
}
