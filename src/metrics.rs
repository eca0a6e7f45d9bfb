use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// How a single `fetch_with_policy` call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    CacheHit,
    Fetched,
    RateLimited,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointMetrics {
    pub cache_hits: u64,
    pub network_calls: u64,
    pub rate_limited: u64,
    pub failures: u64,
    pub last_seen: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub totals: EndpointMetrics,
    pub endpoints: HashMap<String, EndpointMetrics>,
}

/// Per-endpoint counters for the outbound layer.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    endpoints: Arc<RwLock<HashMap<String, EndpointMetrics>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `network` marks calls that reached Discord, including 429s and errors.
    pub async fn record(&self, endpoint_id: &str, outcome: FetchOutcome, network: bool) {
        let mut endpoints = self.endpoints.write().await;
        let metrics = endpoints.entry(endpoint_id.to_string()).or_default();

        match outcome {
            FetchOutcome::CacheHit => metrics.cache_hits += 1,
            FetchOutcome::Fetched => {}
            FetchOutcome::RateLimited => metrics.rate_limited += 1,
            FetchOutcome::Failed => metrics.failures += 1,
        }
        if network {
            metrics.network_calls += 1;
        }
        metrics.last_seen = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
    }

    pub async fn endpoint(&self, endpoint_id: &str) -> Option<EndpointMetrics> {
        self.endpoints.read().await.get(endpoint_id).cloned()
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let endpoints = self.endpoints.read().await.clone();
        let mut totals = EndpointMetrics::default();

        for metrics in endpoints.values() {
            totals.cache_hits += metrics.cache_hits;
            totals.network_calls += metrics.network_calls;
            totals.rate_limited += metrics.rate_limited;
            totals.failures += metrics.failures;
            totals.last_seen = totals.last_seen.max(metrics.last_seen);
        }

        MetricsSnapshot { totals, endpoints }
    }
}
