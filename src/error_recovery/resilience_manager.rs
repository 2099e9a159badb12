//! Resilience manager combining circuit breakers and retry policies
//!
//! Every remote call made by the engine goes through
//! [`ResilienceManager::execute`]: the endpoint's breaker gates the call, the
//! retry executor runs it, and the final outcome is reported back to the
//! breaker. Raw [`BackendError`]s are normalized into [`QueryError`] here.

use crate::error::{QueryError, Result};
use crate::error_recovery::{
    Admission, CircuitBreakerConfig, CircuitBreakerListener, CircuitBreakerManager,
    CircuitBreakerStats, RetryExecutor, RetryPolicy, RetryStats,
};
use crate::storage::BackendError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Resilience configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// When false calls pass straight through; errors are still normalized
    pub enabled: bool,
    /// Circuit breaker defaults
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry policy defaults
    pub retry_policy: RetryPolicy,
    /// Per-endpoint tuning keyed by endpoint name
    pub endpoints: HashMap<String, EndpointOverride>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            circuit_breaker: CircuitBreakerConfig::default(),
            retry_policy: RetryPolicy::default(),
            endpoints: HashMap::new(),
        }
    }
}

/// Endpoint-specific overrides of the defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointOverride {
    pub failure_threshold: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub cool_down: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl ResilienceConfig {
    /// Breaker configuration for an endpoint, overrides applied
    pub fn breaker_config(&self, endpoint: &str) -> CircuitBreakerConfig {
        let mut config = self.circuit_breaker.clone();
        if let Some(o) = self.endpoints.get(endpoint) {
            if let Some(threshold) = o.failure_threshold {
                config.failure_threshold = threshold;
            }
            if let Some(cool_down) = o.cool_down {
                config.cool_down = cool_down;
            }
        }
        config
    }

    /// Retry policy for an endpoint, overrides applied
    pub fn retry_policy(&self, endpoint: &str) -> RetryPolicy {
        let mut policy = self.retry_policy.clone();
        if let Some(retries) = self.endpoints.get(endpoint).and_then(|o| o.max_retries) {
            policy.max_retries = retries;
        }
        policy
    }
}

/// Resilience statistics of one endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceStats {
    /// Circuit breaker statistics
    pub circuit_breaker: Option<CircuitBreakerStats>,
    /// Retry statistics
    pub retry: Option<RetryStats>,
}

/// Resilience manager for coordinating error recovery strategies
pub struct ResilienceManager {
    config: ResilienceConfig,
    circuit_breaker_manager: CircuitBreakerManager,
    retry_executors: RwLock<HashMap<String, Arc<RetryExecutor>>>,
}

impl ResilienceManager {
    /// Create new resilience manager
    pub fn new(config: ResilienceConfig) -> Self {
        let overrides = config
            .endpoints
            .keys()
            .map(|endpoint| (endpoint.clone(), config.breaker_config(endpoint)))
            .collect();
        let circuit_breaker_manager =
            CircuitBreakerManager::new(config.circuit_breaker.clone()).with_overrides(overrides);

        Self {
            config,
            circuit_breaker_manager,
            retry_executors: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Circuit breaker registry
    pub fn breakers(&self) -> &CircuitBreakerManager {
        &self.circuit_breaker_manager
    }

    /// Listener receiving every breaker event
    pub async fn add_listener(&self, listener: Arc<dyn CircuitBreakerListener>) {
        self.circuit_breaker_manager.add_listener(listener).await;
    }

    async fn executor(&self, endpoint: &str) -> Arc<RetryExecutor> {
        if let Some(executor) = self.retry_executors.read().await.get(endpoint) {
            return executor.clone();
        }
        let mut executors = self.retry_executors.write().await;
        executors
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(RetryExecutor::new(self.config.retry_policy(endpoint))))
            .clone()
    }

    /// Execute a backend operation with full resilience protection
    pub async fn execute<F, T, Fut>(&self, endpoint: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        if !self.config.enabled {
            return operation().await.map_err(QueryError::from);
        }

        let breaker = self.circuit_breaker_manager.get_breaker(endpoint).await;
        // Dropping this future mid-call frees a half-open trial slot
        let guard = breaker.admit().await;
        let admission = guard.admission();
        if let Admission::Rejected { retry_after } = admission {
            warn!(endpoint, ?retry_after, "Circuit breaker open, failing fast");
            return Err(QueryError::circuit_open(endpoint, retry_after));
        }

        let executor = self.executor(endpoint).await;
        let result = executor
            .execute(|| {
                let attempt = operation();
                async move { attempt.await.map_err(QueryError::from) }
            })
            .await;

        match &result {
            Ok(_) => breaker.record_success(admission).await,
            Err(error) => {
                debug!(endpoint, %error, "Resilient call failed");
                breaker.record_failure(admission, error).await;
            }
        }
        drop(guard);
        result
    }

    /// Get resilience statistics for an endpoint
    pub async fn get_stats(&self, endpoint: &str) -> ResilienceStats {
        let retry = {
            let executor = self.retry_executors.read().await.get(endpoint).cloned();
            match executor {
                Some(executor) => Some(executor.get_stats().await),
                None => None,
            }
        };

        ResilienceStats {
            circuit_breaker: self.circuit_breaker_manager.get_stats(endpoint).await,
            retry,
        }
    }

    /// Statistics of every endpoint seen so far
    pub async fn get_all_stats(&self) -> BTreeMap<String, ResilienceStats> {
        let mut endpoints: BTreeSet<String> = self
            .circuit_breaker_manager
            .get_all_stats()
            .await
            .into_keys()
            .collect();
        endpoints.extend(self.retry_executors.read().await.keys().cloned());

        let mut stats = BTreeMap::new();
        for endpoint in endpoints {
            let endpoint_stats = self.get_stats(&endpoint).await;
            stats.insert(endpoint, endpoint_stats);
        }
        stats
    }

    /// Force an endpoint's breaker closed; false if the endpoint is unknown
    pub async fn reset_service(&self, endpoint: &str) -> bool {
        let reset = self.circuit_breaker_manager.reset(endpoint).await;
        if reset {
            info!(endpoint, "Reset resilience components");
        }
        reset
    }

    /// Force every breaker closed
    pub async fn reset_all(&self) {
        self.circuit_breaker_manager.reset_all().await;
        info!("Reset all circuit breakers");
    }
}
