//! Shared fixtures for integration tests
#![allow(dead_code)]

use regional_query_engine::config::EngineConfig;
use regional_query_engine::error_recovery::{CircuitBreakerConfig, ResilienceConfig, RetryPolicy};
use regional_query_engine::storage::{Document, InMemoryStore};
use regional_query_engine::QueryEngine;
use rstest::fixture;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const COLLECTION: &str = "jobs";

/// Fixed reference time for timestamps (2024-06-01T00:00:00Z, epoch ms)
pub const BASE_MS: i64 = 1_717_200_000_000;

const STATES: &[&str] = &["NY", "FL", "OH", "TX", "CA"];

/// One job posting
pub fn job(id: &str, state: &str, local: i64, minutes_ago: i64) -> Document {
    Document::new(
        id,
        json!({
            "state": state,
            "local": local,
            "constructionType": if local % 2 == 0 { "commercial" } else { "residential" },
            "hours": 30 + local % 20,
            "timestamp": BASE_MS - minutes_ago * 60_000,
            "deleted": false,
        }),
    )
}

/// 48 jobs over five regions plus unmappable ones; two timestamp ties
#[fixture]
pub fn dataset() -> Vec<Document> {
    let mut docs: Vec<Document> = (0..40)
        .map(|i| job(&format!("job-{i:03}"), STATES[i % STATES.len()], i as i64, i as i64 * 10))
        .collect();

    // Same timestamp as job-005, ordered by id
    docs.push(job("job-005b", "WA", 5, 50));
    docs.push(job("job-005a", "NV", 5, 50));

    for i in 0..4 {
        docs.push(Document::new(
            format!("abroad-{i}"),
            json!({
                "location": "Toronto, ON",
                "timestamp": BASE_MS - (400 + i) * 60_000,
                "deleted": false,
            }),
        ));
    }

    let mut deleted = job("job-deleted", "NY", 7, 1);
    deleted.data.insert("deleted".into(), json!(true));
    docs.push(deleted);
    docs.push(Document::new(
        "no-fields",
        json!({"timestamp": BASE_MS - 999 * 60_000}),
    ));
    docs
}

/// Engine configuration with fast, deterministic resilience
#[fixture]
pub fn config() -> EngineConfig {
    EngineConfig {
        resilience: ResilienceConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                cool_down: Duration::from_secs(60),
                ..Default::default()
            },
            retry_policy: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

pub async fn store_with(docs: Vec<Document>) -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::with_documents(COLLECTION, docs).await)
}

pub fn engine(config: EngineConfig, store: Arc<InMemoryStore>) -> QueryEngine {
    QueryEngine::new(config, store).expect("valid engine configuration")
}

pub fn ids(docs: &[Document]) -> Vec<String> {
    docs.iter().map(|d| d.id.clone()).collect()
}
