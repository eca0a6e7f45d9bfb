use crate::config::Config;
use crate::keys;
use crate::store::CacheStore;
use serde::Serialize;
use tracing::warn;

/// Marker value stored under a rate-limit flag key.
const FLAG_VALUE: &str = "blocked";

/// Outcome of a gate check for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub limited: bool,
    pub retry_after: Option<u64>,
}

impl RateLimitStatus {
    pub fn clear() -> Self {
        Self {
            limited: false,
            retry_after: None,
        }
    }

    pub fn limited(retry_after: u64) -> Self {
        Self {
            limited: true,
            retry_after: Some(retry_after),
        }
    }
}

/// Per-endpoint "may we call Discord right now" switch, stored in the shared cache.
#[derive(Clone)]
pub struct RateLimitGate {
    store: CacheStore,
    max_penalty_secs: u64,
    suggested_wait_secs: u64,
}

impl RateLimitGate {
    pub fn new(store: CacheStore, max_penalty_secs: u64, suggested_wait_secs: u64) -> Self {
        Self {
            store,
            max_penalty_secs: max_penalty_secs.max(1),
            suggested_wait_secs,
        }
    }

    pub fn from_config(store: CacheStore, config: &Config) -> Self {
        Self::new(store, config.max_penalty_secs, config.suggested_wait_secs)
    }

    /// Callers are told a fixed short wait, not the remaining penalty.
    pub async fn check(&self, endpoint_id: &str) -> RateLimitStatus {
        if self.store.exists(&keys::rate_limit_flag(endpoint_id)).await {
            RateLimitStatus::limited(self.suggested_wait_secs)
        } else {
            RateLimitStatus::clear()
        }
    }

    /// Block `endpoint_id` for the upstream's wait, clamped to the ceiling.
    /// Returns the penalty actually stored.
    pub async fn record_penalty(&self, endpoint_id: &str, retry_after_secs: u64) -> u64 {
        let penalty = retry_after_secs.clamp(1, self.max_penalty_secs);
        warn!(
            endpoint = endpoint_id,
            requested = retry_after_secs,
            penalty,
            "Recording Discord rate-limit penalty"
        );
        self.store
            .put(&keys::rate_limit_flag(endpoint_id), FLAG_VALUE, penalty)
            .await;
        penalty
    }

    pub fn max_penalty_secs(&self) -> u64 {
        self.max_penalty_secs
    }
}
