//! End-to-end tests of the query facade over the in-memory store

mod common;

use common::{config, dataset, engine, ids, job, store_with};
use pretty_assertions::assert_eq;
use regional_query_engine::config::EngineConfig;
use regional_query_engine::error_recovery::CircuitState;
use regional_query_engine::query::{PageRequest, QueryFilters, SearchInput};
use regional_query_engine::search::{QueryPreferences, ResultSource};
use regional_query_engine::sharding::{MigrationMode, Region, RegionInference};
use regional_query_engine::storage::{BackendCode, BackendError, Document, StoreOp};
use regional_query_engine::{ErrorKind, QueryEngine};
use rstest::rstest;
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn collect_pages(engine: &QueryEngine, filters: QueryFilters, page_size: usize) -> Vec<Document> {
    let mut items = Vec::new();
    let mut cursor = None;
    for _ in 0..100 {
        let page = engine
            .get_page(PageRequest {
                filters: filters.clone(),
                page_size,
                cursor,
            })
            .await
            .unwrap();
        assert!(page.items.len() <= page_size);
        assert_eq!(page.has_more, page.next_cursor.is_some());
        items.extend(page.items);
        if !page.has_more {
            return items;
        }
        cursor = page.next_cursor;
    }
    panic!("pagination did not terminate");
}

fn recency_order(mut docs: Vec<Document>) -> Vec<String> {
    docs.sort_by(|a, b| {
        b.i64_field("timestamp")
            .cmp(&a.i64_field("timestamp"))
            .then_with(|| b.id.cmp(&a.id))
    });
    ids(&docs)
}

fn visible(docs: &[Document]) -> Vec<Document> {
    docs.iter()
        .filter(|d| d.bool_field("deleted") != Some(true))
        .cloned()
        .collect()
}

#[rstest]
#[case(1)]
#[case(7)]
#[case(47)]
#[case(100)]
#[tokio::test]
async fn test_pagination_round_trip_is_gap_and_duplicate_free(
    dataset: Vec<Document>,
    config: EngineConfig,
    #[case] page_size: usize,
) {
    let expected = recency_order(visible(&dataset));
    let engine = engine(config, store_with(dataset).await);

    let collected = ids(&collect_pages(&engine, QueryFilters::default(), page_size).await);
    assert_eq!(collected, expected);
    assert_eq!(collected.len(), 47);
}

#[rstest]
#[tokio::test]
async fn test_timestamp_ties_break_on_id_desc(dataset: Vec<Document>, config: EngineConfig) {
    let engine = engine(config, store_with(dataset).await);
    let all = ids(&collect_pages(&engine, QueryFilters::default(), 10).await);

    let position = |id: &str| all.iter().position(|x| x == id).unwrap();
    assert!(position("job-005b") < position("job-005a"));
    assert!(position("job-005a") < position("job-005"));
    assert_eq!(all.last().map(String::as_str), Some("no-fields"));
}

#[rstest]
#[case(1)]
#[case(2)]
#[tokio::test]
async fn test_documents_without_timestamp_page_once_each(
    config: EngineConfig,
    #[case] page_size: usize,
) {
    let docs = vec![
        Document::new("a", json!({"state": "OH"})),
        Document::new("b", json!({"state": "OH", "timestamp": null})),
        Document::new("c", json!({"state": "OH"})),
        job("d", "OH", 1, 5),
        job("e", "TX", 1, 6),
    ];
    let engine = engine(config, store_with(docs).await);

    let all = ids(&collect_pages(&engine, QueryFilters::default(), page_size).await);
    assert_eq!(all, vec!["d", "e", "c", "b", "a"]);

    // Cross-regional scan resumes from the same positions
    let midwest = QueryFilters::regions([Region::Midwest]);
    let regional = ids(&collect_pages(&engine, midwest, page_size).await);
    assert_eq!(regional, vec!["d", "c", "b", "a"]);
}

#[rstest]
#[tokio::test]
async fn test_disabled_sharding_still_filters_by_region(
    dataset: Vec<Document>,
    mut config: EngineConfig,
) {
    config.sharding.enabled = false;
    let engine = engine(config, store_with(dataset).await);
    engine
        .run_migration(MigrationMode::Live, CancellationToken::new(), |_| {})
        .await
        .unwrap();

    let page = engine
        .get_page(PageRequest {
            filters: QueryFilters::regions([Region::Midwest]),
            page_size: 100,
            cursor: None,
        })
        .await
        .unwrap();
    assert_eq!(page.items.len(), 8);
    assert!(page.items.iter().all(|d| d.str_field("state") == Some("OH")));
    assert_eq!(page.route.partitions, 0);
    assert!(page.route.cross_regional);
}

#[rstest]
#[tokio::test]
async fn test_cross_regional_pages_before_migration(dataset: Vec<Document>, config: EngineConfig) {
    let engine = engine(config, store_with(dataset).await);
    let filters = QueryFilters::regions([Region::Midwest]);

    let first = engine
        .get_page(PageRequest {
            filters: filters.clone(),
            page_size: 3,
            cursor: None,
        })
        .await
        .unwrap();
    assert!(first.route.cross_regional);
    assert_eq!(first.route.partitions, 0);

    let items = collect_pages(&engine, filters, 3).await;
    assert_eq!(items.len(), 8);
    assert!(items.iter().all(|d| d.str_field("state") == Some("OH")));
}

#[rstest]
#[tokio::test]
async fn test_partitioned_pages_match_source_filtering(dataset: Vec<Document>, config: EngineConfig) {
    let inference = RegionInference::new(&config.schema);
    let regions = BTreeSet::from([Region::Northeast, Region::West]);
    let expected = recency_order(
        visible(&dataset)
            .into_iter()
            .filter(|d| regions.contains(&inference.infer(d)))
            .collect(),
    );

    let engine = engine(config, store_with(dataset).await);
    engine
        .run_migration(MigrationMode::Live, CancellationToken::new(), |_| {})
        .await
        .unwrap();

    let filters = QueryFilters {
        regions: regions.clone(),
        ..Default::default()
    };
    let first = engine
        .get_page(PageRequest {
            filters: filters.clone(),
            page_size: 5,
            cursor: None,
        })
        .await
        .unwrap();
    assert_eq!(first.route.partitions, 2);
    assert!(!first.route.cross_regional);

    let collected = ids(&collect_pages(&engine, filters, 5).await);
    assert_eq!(collected, expected);
    assert_eq!(collected.len(), 18);

    let stats = engine.get_statistics().await;
    assert_eq!(stats.available_partitions.len(), Region::ALL.len());
    assert!(stats.endpoints["jobs.query"].regional >= 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_retries_absorb_transient_failures(dataset: Vec<Document>, config: EngineConfig) {
    let store = store_with(dataset).await;
    store
        .inject_failures(
            StoreOp::Query,
            2,
            BackendError::new(BackendCode::Unavailable, "blip"),
        )
        .await;
    let engine = engine(config, store.clone());

    let page = engine.get_page(PageRequest::default()).await.unwrap();
    assert_eq!(page.items.len(), 20);
    assert_eq!(store.call_count(StoreOp::Query), 3);

    let stats = engine.get_statistics().await;
    let breaker = stats.resilience["jobs.query"].circuit_breaker.clone().unwrap();
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures, 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_open_circuit_fails_fast_then_recovers(dataset: Vec<Document>, config: EngineConfig) {
    let store = store_with(dataset).await;
    store
        .fail_always(
            StoreOp::Query,
            BackendError::new(BackendCode::Unavailable, "region outage"),
        )
        .await;
    let engine = engine(config, store.clone());

    for _ in 0..3 {
        let err = engine.get_page(PageRequest::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
    // Three calls, three attempts each
    assert_eq!(store.call_count(StoreOp::Query), 9);

    let err = engine.get_page(PageRequest::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert_eq!(store.call_count(StoreOp::Query), 9);

    tokio::time::advance(Duration::from_secs(61)).await;
    store.clear_faults().await;
    engine.get_page(PageRequest::default()).await.unwrap();

    let stats = engine.get_statistics().await;
    let breaker = stats.resilience["jobs.query"].circuit_breaker.clone().unwrap();
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures, 0);
    assert_eq!(breaker.circuit_open_count, 1);
    assert_eq!(stats.endpoints["jobs.query"].failures, 4);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_abandoned_trial_page_does_not_block_recovery(
    dataset: Vec<Document>,
    config: EngineConfig,
) {
    let store = store_with(dataset).await;
    store
        .fail_always(
            StoreOp::Query,
            BackendError::new(BackendCode::Unavailable, "region outage"),
        )
        .await;
    let engine = engine(config, store.clone());
    for _ in 0..3 {
        assert!(engine.get_page(PageRequest::default()).await.is_err());
    }

    tokio::time::advance(Duration::from_secs(61)).await;
    store.clear_faults().await;
    store.set_latency(Some(Duration::from_secs(30))).await;
    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        engine.get_page(PageRequest::default()),
    )
    .await;
    assert!(abandoned.is_err());

    store.set_latency(None).await;
    tokio::time::advance(Duration::from_secs(3600)).await;
    let page = engine.get_page(PageRequest::default()).await.unwrap();
    assert_eq!(page.items.len(), 20);

    let stats = engine.get_statistics().await;
    let breaker = stats.resilience["jobs.query"].circuit_breaker.clone().unwrap();
    assert_eq!(breaker.state, CircuitState::Closed);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_operator_reset_closes_circuit(dataset: Vec<Document>, config: EngineConfig) {
    let store = store_with(dataset).await;
    store
        .inject_failures(
            StoreOp::Query,
            9,
            BackendError::new(BackendCode::DeadlineExceeded, "slow"),
        )
        .await;
    let engine = engine(config, store.clone());
    for _ in 0..3 {
        assert!(engine.get_page(PageRequest::default()).await.is_err());
    }

    assert!(!engine.reset_circuit_breaker("jobs.unknown").await);
    assert!(engine.reset_circuit_breaker("jobs.query").await);
    assert!(engine.get_page(PageRequest::default()).await.is_ok());
}

#[rstest]
#[tokio::test]
async fn test_fatal_errors_are_not_retried(dataset: Vec<Document>, config: EngineConfig) {
    let store = store_with(dataset).await;
    store
        .fail_always(
            StoreOp::Query,
            BackendError::new(BackendCode::PermissionDenied, "rules"),
        )
        .await;
    let engine = engine(config, store.clone());

    let outcome = engine.page_or_reason(PageRequest::default()).await;
    assert!(outcome.page.items.is_empty());
    assert!(!outcome.page.has_more);
    let reason = outcome.reason.unwrap();
    assert_eq!(reason.kind, ErrorKind::Fatal);
    assert_eq!(store.call_count(StoreOp::Query), 1);
}

#[rstest]
#[tokio::test]
async fn test_partition_failure_propagates(dataset: Vec<Document>, config: EngineConfig) {
    let store = store_with(dataset).await;
    let engine = engine(config, store.clone());
    engine
        .run_migration(MigrationMode::Live, CancellationToken::new(), |_| {})
        .await
        .unwrap();
    store
        .inject_collection_failures(
            StoreOp::Query,
            "jobs_regions/west/jobs",
            10,
            BackendError::new(BackendCode::NotFound, "partition dropped"),
        )
        .await;

    let err = engine
        .get_page(PageRequest {
            filters: QueryFilters::regions([Region::West, Region::Midwest]),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
}

fn search_dataset() -> Vec<Document> {
    vec![
        job("a", "OH", 3, 1),
        job("b", "OH", 7, 30),
        job("c", "TX", 5, 2),
        job("d", "CA", 7, 60),
        job("e", "NY", 9, 3),
    ]
}

#[rstest]
#[case(SearchInput::Preferences(QueryPreferences { preferred_groups: vec![7], ..Default::default() }))]
#[case(SearchInput::Text("local 7".to_string()))]
#[tokio::test]
async fn test_preferred_group_ranks_first(config: EngineConfig, #[case] input: SearchInput) {
    let engine = engine(config, store_with(search_dataset()).await);

    let results = engine.search(input, 5).await;
    let ranked: Vec<_> = results.items.iter().map(|r| r.id()).collect();
    assert_eq!(&ranked[..2], &["b", "d"]);
    assert_eq!(results.items[0].score, Some(100));
    assert_eq!(results.items.len(), 5);
    assert_eq!(results.source, ResultSource::PrimaryWithTopUp);

    let unique: HashSet<_> = ranked.iter().collect();
    assert_eq!(unique.len(), ranked.len());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_transient_search_failure_serves_recency_fallback(config: EngineConfig) {
    let store = store_with(search_dataset()).await;
    // Exhausts the primary query's three attempts
    store
        .inject_failures(
            StoreOp::Query,
            3,
            BackendError::new(BackendCode::Unavailable, "backend down"),
        )
        .await;
    let engine = engine(config, store);

    let results = engine
        .search(
            SearchInput::Preferences(QueryPreferences {
                preferred_groups: vec![7],
                ..Default::default()
            }),
            3,
        )
        .await;

    let ids: Vec<_> = results.items.iter().map(|r| r.id()).collect();
    assert_eq!(ids, vec!["a", "c", "e"]);
    assert!(results.items.iter().all(|r| r.score.is_none()));
    assert_eq!(results.source, ResultSource::Fallback);
    assert_eq!(
        results.degraded_reason.map(|r| r.kind),
        Some(ErrorKind::Transient)
    );

    let usage = engine.get_statistics().await.endpoints["jobs.search"].clone();
    assert_eq!((usage.calls, usage.failures, usage.fallbacks), (1, 1, 1));
}

#[rstest]
#[tokio::test]
async fn test_regional_search_through_partitions(config: EngineConfig) {
    let engine = engine(config, store_with(search_dataset()).await);
    engine
        .run_migration(MigrationMode::Live, CancellationToken::new(), |_| {})
        .await
        .unwrap();

    let results = engine
        .search(SearchInput::Text("7 midwest".to_string()), 1)
        .await;
    assert_eq!(results.items.len(), 1);
    assert_eq!(results.items[0].id(), "b");
    assert_eq!(results.route.map(|r| r.partitions), Some(1));
}
