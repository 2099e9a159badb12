//! Per-endpoint usage counters

use crate::error_recovery::ResilienceStats;
use crate::query::cache::CacheStats;
use crate::sharding::{Region, RouteSummary};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct EndpointCounters {
    calls: AtomicU64,
    failures: AtomicU64,
    regional: AtomicU64,
    cross_regional: AtomicU64,
    unsharded: AtomicU64,
    fallbacks: AtomicU64,
    partial: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Snapshot of one endpoint's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointUsage {
    pub calls: u64,
    pub failures: u64,
    /// Calls served by at least one partition
    pub regional: u64,
    pub cross_regional: u64,
    pub unsharded: u64,
    pub fallbacks: u64,
    pub partial: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl From<&EndpointCounters> for EndpointUsage {
    fn from(c: &EndpointCounters) -> Self {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Self {
            calls: load(&c.calls),
            failures: load(&c.failures),
            regional: load(&c.regional),
            cross_regional: load(&c.cross_regional),
            unsharded: load(&c.unsharded),
            fallbacks: load(&c.fallbacks),
            partial: load(&c.partial),
            cache_hits: load(&c.cache_hits),
            cache_misses: load(&c.cache_misses),
        }
    }
}

/// Counter updates for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageEvent {
    Call,
    Failure,
    Fallback,
    Partial,
    CacheHit,
    CacheMiss,
}

/// Registry of per-endpoint counters
#[derive(Debug, Default)]
pub struct UsageStats {
    endpoints: RwLock<HashMap<String, Arc<EndpointCounters>>>,
}

impl UsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    async fn counters(&self, endpoint: &str) -> Arc<EndpointCounters> {
        if let Some(counters) = self.endpoints.read().await.get(endpoint) {
            return counters.clone();
        }
        self.endpoints
            .write()
            .await
            .entry(endpoint.to_string())
            .or_default()
            .clone()
    }

    pub async fn record(&self, endpoint: &str, event: UsageEvent) {
        let counters = self.counters(endpoint).await;
        let counter = match event {
            UsageEvent::Call => &counters.calls,
            UsageEvent::Failure => &counters.failures,
            UsageEvent::Fallback => &counters.fallbacks,
            UsageEvent::Partial => &counters.partial,
            UsageEvent::CacheHit => &counters.cache_hits,
            UsageEvent::CacheMiss => &counters.cache_misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count how a routed read was served
    pub async fn record_route(&self, endpoint: &str, route: &RouteSummary) {
        let counters = self.counters(endpoint).await;
        if route.partitions > 0 {
            counters.regional.fetch_add(1, Ordering::Relaxed);
        }
        if route.cross_regional {
            counters.cross_regional.fetch_add(1, Ordering::Relaxed);
        }
        if route.unsharded {
            counters.unsharded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn usage(&self, endpoint: &str) -> EndpointUsage {
        self.endpoints
            .read()
            .await
            .get(endpoint)
            .map(|c| EndpointUsage::from(c.as_ref()))
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, EndpointUsage> {
        self.endpoints
            .read()
            .await
            .iter()
            .map(|(name, c)| (name.clone(), EndpointUsage::from(c.as_ref())))
            .collect()
    }
}

/// Engine-wide statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatistics {
    pub endpoints: BTreeMap<String, EndpointUsage>,
    pub resilience: BTreeMap<String, ResilienceStats>,
    pub available_partitions: BTreeSet<Region>,
    pub cache: Option<CacheStats>,
}
