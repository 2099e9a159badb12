//! Error normalization at the engine boundary

mod common;

use common::{config, dataset, engine, store_with};
use regional_query_engine::config::EngineConfig;
use regional_query_engine::error::{ErrorCode, ErrorReporter, ErrorSeverity};
use regional_query_engine::log_structured_error;
use regional_query_engine::query::{PageRequest, QueryFilters};
use regional_query_engine::storage::{BackendCode, BackendError, Document, Filter, StoreOp};
use regional_query_engine::{ErrorKind, QueryError};
use rstest::rstest;
use serde_json::json;

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_open_circuit_reason_carries_retry_after(dataset: Vec<Document>, config: EngineConfig) {
    let store = store_with(dataset).await;
    store
        .fail_always(
            StoreOp::Query,
            BackendError::new(BackendCode::ResourceExhausted, "quota"),
        )
        .await;
    let engine = engine(config, store);

    for _ in 0..3 {
        let outcome = engine.page_or_reason(PageRequest::default()).await;
        assert_eq!(outcome.reason.map(|r| r.kind), Some(ErrorKind::Transient));
    }

    let outcome = engine.page_or_reason(PageRequest::default()).await;
    let reason = outcome.reason.unwrap();
    assert_eq!(reason.kind, ErrorKind::CircuitOpen);
    assert_eq!(reason.code, ErrorCode::CircuitOpen.as_number());
    assert!(reason.retry_after.is_some());

    let json = serde_json::to_value(&reason).unwrap();
    assert_eq!(json["kind"], "circuit_open");
    assert!(json["retry_after"].is_string());
}

#[rstest]
#[tokio::test]
async fn test_malformed_cursor_is_invalid_input(dataset: Vec<Document>, config: EngineConfig) {
    let store = store_with(dataset).await;
    let engine = engine(config, store.clone());

    let err = engine
        .get_page(PageRequest {
            cursor: Some("not-a-cursor!".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::InvalidInput(_)), "{err}");
    assert_eq!(store.call_count(StoreOp::Query), 0);
}

#[rstest]
#[tokio::test]
async fn test_oversized_in_filter_rejected_before_backend(dataset: Vec<Document>, config: EngineConfig) {
    let store = store_with(dataset).await;
    let engine = engine(config, store.clone());
    let values = (0..31).map(|i| json!(i)).collect();

    let err = engine
        .get_page(PageRequest {
            filters: QueryFilters::default().condition(Filter::is_in("local", values)),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_error_code(), ErrorCode::InvalidInput);
    assert_eq!(store.call_count(StoreOp::Query), 0);
}

#[rstest]
#[tokio::test]
async fn test_subscribe_failure_is_normalized(dataset: Vec<Document>, config: EngineConfig) {
    let store = store_with(dataset).await;
    store
        .inject_failures(
            StoreOp::Subscribe,
            1,
            BackendError::new(BackendCode::Unauthenticated, "token expired"),
        )
        .await;
    let engine = engine(config, store);

    let err = match engine.watch_document("job-001").await {
        Ok(_) => panic!("subscribe should fail"),
        Err(err) => err,
    };
    assert!(err.is_auth_error());
    assert_eq!(err.severity(), ErrorSeverity::Critical);
    assert!(engine.watch_document("job-001").await.is_ok());
}

#[test]
fn test_structured_logging_macro() {
    let error = QueryError::index_not_ready("jobs(local, timestamp)");
    log_structured_error!(error, "query_engine", "get_page");

    let structured = error.to_structured_error("query_engine", "get_page");
    assert_eq!(structured.category, "backend");
    assert_eq!(structured.severity, ErrorSeverity::Warning);
    assert!(!structured.is_retryable);

    let body = ErrorReporter::format_api_error(&error);
    assert_eq!(body["error"]["kind"], "index_not_ready");
}
