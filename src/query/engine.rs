//! Unified query facade
//!
//! Single entry point composing resilience, regional routing and ranking.
//! Every remote call goes through the engine's [`ResilienceManager`], so the
//! circuit state of each endpoint lives in this instance and is shared by all
//! callers.

use crate::config::{EngineConfig, SchemaConfig, BACKEND_MAX_IN_VALUES};
use crate::error::{ErrorReason, ErrorReporter, QueryError, Result};
use crate::error_recovery::ResilienceManager;
use crate::query::cache::{PageCache, PageKey};
use crate::query::cursor::{fingerprint, PageCursor};
use crate::query::stats::{EngineStatistics, UsageEvent, UsageStats};
use crate::search::{QueryPreferences, Ranker, ResultSource, SearchPipeline, SearchResults, WeightedRanker};
use crate::sharding::{
    MigrationMode, MigrationReport, MigrationStream, Migrator, QueryRouter, Region,
    RegionInference, RegionalRouter, RouteSummary, ShardedReader,
};
use crate::storage::{
    Direction, Document, DocumentStore, DocumentStream, Filter, FilterOp, StoreQuery,
    WatchTarget, DOCUMENT_ID,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Filter set of a paginated read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilters {
    /// Regions to read; empty means all
    pub regions: BTreeSet<Region>,
    /// Additional field predicates
    pub conditions: Vec<Filter>,
    /// Return soft-deleted documents too
    pub include_deleted: bool,
}

impl QueryFilters {
    pub fn regions<I: IntoIterator<Item = Region>>(regions: I) -> Self {
        Self {
            regions: regions.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn condition(mut self, filter: Filter) -> Self {
        self.conditions.push(filter);
        self
    }
}

/// Paginated read request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageRequest {
    pub filters: QueryFilters,
    /// 0 selects the configured default
    pub page_size: usize,
    /// Token returned by the previous page
    pub cursor: Option<String>,
}

/// One page of documents
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Page {
    pub items: Vec<Document>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    /// Page was cut at a cross-regional scan horizon
    pub partial: bool,
    pub route: RouteSummary,
}

/// Page or the reason it could not be produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageOutcome {
    pub page: Page,
    pub reason: Option<ErrorReason>,
}

/// Search request: free text or structured preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchInput {
    Text(String),
    Preferences(QueryPreferences),
}

impl SearchInput {
    pub fn into_preferences(self) -> QueryPreferences {
        match self {
            SearchInput::Text(text) => QueryPreferences::from_text(&text),
            SearchInput::Preferences(prefs) => prefs,
        }
    }
}

/// Builder for [`QueryEngine`]
pub struct QueryEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn DocumentStore>>,
    router: Option<Arc<dyn QueryRouter>>,
    ranker: Option<Arc<dyn Ranker>>,
}

impl QueryEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            router: None,
            ranker: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the regional router
    pub fn router(mut self, router: Arc<dyn QueryRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Replace the weighted ranker
    pub fn ranker(mut self, ranker: Arc<dyn Ranker>) -> Self {
        self.ranker = Some(ranker);
        self
    }

    pub fn build(self) -> Result<QueryEngine> {
        let config = self.config;
        config.validate()?;
        let store = self
            .store
            .ok_or_else(|| QueryError::config("a document store is required"))?;

        let schema = config.schema.clone();
        let resilience = Arc::new(ResilienceManager::new(config.resilience.clone()));
        let router = self
            .router
            .unwrap_or_else(|| Arc::new(RegionalRouter::new(&config.sharding)));
        let ranker = self.ranker.unwrap_or_else(|| {
            Arc::new(WeightedRanker::new(
                config.search.weights.clone(),
                schema.clone(),
            ))
        });
        let inference = RegionInference::new(&schema);

        let reader = Arc::new(ShardedReader::new(
            store.clone(),
            resilience.clone(),
            router.clone(),
            inference.clone(),
            schema.collection.clone(),
            config.sharding.fallback_scan_window,
            config.sharding.max_fallback_scan_batches,
        ));
        let pipeline = SearchPipeline::new(
            reader.clone(),
            ranker,
            config.search.clone(),
            schema.clone(),
        );
        let migrator = Arc::new(Migrator::new(
            store.clone(),
            resilience.clone(),
            router.clone(),
            inference,
            schema.collection.clone(),
            config.sharding.migration_batch_size,
        ));
        let cache = config
            .cache
            .enabled
            .then(|| PageCache::new(config.cache.ttl, config.cache.max_entries));

        info!(
            collection = %schema.collection,
            resilience = config.resilience.enabled,
            sharding = config.sharding.enabled,
            ranking = config.search.ranking_enabled,
            cache = config.cache.enabled,
            "Query engine initialized"
        );

        Ok(QueryEngine {
            query_endpoint: format!("{}.query", schema.collection),
            get_endpoint: format!("{}.get", schema.collection),
            subscribe_endpoint: format!("{}.subscribe", schema.collection),
            config,
            schema,
            store,
            resilience,
            router,
            reader,
            pipeline,
            migrator,
            stats: UsageStats::new(),
            cache,
        })
    }
}

/// Resilient sharded query engine
pub struct QueryEngine {
    config: EngineConfig,
    schema: SchemaConfig,
    store: Arc<dyn DocumentStore>,
    resilience: Arc<ResilienceManager>,
    router: Arc<dyn QueryRouter>,
    reader: Arc<ShardedReader>,
    pipeline: SearchPipeline,
    migrator: Arc<Migrator>,
    stats: UsageStats,
    cache: Option<PageCache<PageKey, Page>>,
    query_endpoint: String,
    get_endpoint: String,
    subscribe_endpoint: String,
}

impl QueryEngine {
    pub fn builder(config: EngineConfig) -> QueryEngineBuilder {
        QueryEngineBuilder::new(config)
    }

    /// Engine with the default router and ranker
    pub fn new(config: EngineConfig, store: Arc<dyn DocumentStore>) -> Result<Self> {
        Self::builder(config).store(store).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resilience(&self) -> &Arc<ResilienceManager> {
        &self.resilience
    }

    pub fn router(&self) -> &Arc<dyn QueryRouter> {
        &self.router
    }

    pub fn query_endpoint(&self) -> &str {
        &self.query_endpoint
    }

    /// Clamp to `[1, max]`; 0 selects the default
    pub fn effective_page_size(&self, requested: usize) -> usize {
        let pagination = &self.config.pagination;
        if requested == 0 {
            pagination.default_page_size
        } else {
            requested.clamp(1, pagination.max_page_size)
        }
    }

    /// Store query for a filter set in (recency desc, id desc) order
    pub fn page_query(&self, filters: &QueryFilters) -> StoreQuery {
        let mut query = StoreQuery::new().filters(filters.conditions.iter().cloned());
        if !filters.include_deleted {
            query = query.filter(Filter::not_eq(&self.schema.deleted_field, Value::Bool(true)));
        }
        query
            .order_by(&self.schema.timestamp_field, Direction::Descending)
            .order_by(DOCUMENT_ID, Direction::Descending)
    }

    /// Fetch one page
    ///
    /// Same cursor and filters resume exactly after the last item of the
    /// previous page. A cursor issued for a different filter set is rejected.
    #[instrument(skip(self, request), fields(endpoint = %self.query_endpoint))]
    pub async fn get_page(&self, request: PageRequest) -> Result<Page> {
        let endpoint = self.query_endpoint.as_str();
        self.stats.record(endpoint, UsageEvent::Call).await;

        let result = self.fetch_page(&request).await;
        match &result {
            Ok(page) => {
                self.stats.record_route(endpoint, &page.route).await;
                if page.partial {
                    self.stats.record(endpoint, UsageEvent::Partial).await;
                }
            }
            Err(error) => {
                self.stats.record(endpoint, UsageEvent::Failure).await;
                ErrorReporter::log_error(error, "query_engine", "get_page");
            }
        }
        result
    }

    /// Like [`Self::get_page`], but failures become an empty page with a reason
    pub async fn page_or_reason(&self, request: PageRequest) -> PageOutcome {
        match self.get_page(request).await {
            Ok(page) => PageOutcome { page, reason: None },
            Err(error) => PageOutcome {
                page: Page::default(),
                reason: Some(error.reason()),
            },
        }
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        validate_filters(&request.filters)?;
        let page_size = self.effective_page_size(request.page_size);
        let fingerprint = fingerprint(&request.filters)?;
        let start_after = request
            .cursor
            .as_deref()
            .map(|token| PageCursor::resume(token, &fingerprint))
            .transpose()?;

        let key = PageKey {
            endpoint: self.query_endpoint.clone(),
            fingerprint: fingerprint.clone(),
            cursor: request.cursor.clone(),
            page_size,
        };
        if let Some(cache) = &self.cache {
            if let Some(page) = cache.get(&key).await {
                self.stats.record(&self.query_endpoint, UsageEvent::CacheHit).await;
                debug!(page_size, "Serving page from cache");
                return Ok(page);
            }
            self.stats.record(&self.query_endpoint, UsageEvent::CacheMiss).await;
        }

        let query = self.page_query(&request.filters);
        let routed = self
            .reader
            .read(
                &self.query_endpoint,
                &request.filters.regions,
                &query,
                page_size,
                start_after,
            )
            .await?;

        let next_cursor = routed
            .next_position
            .map(|position| PageCursor::new(position, fingerprint).encode())
            .transpose()?;
        let page = Page {
            items: routed.documents,
            has_more: next_cursor.is_some(),
            next_cursor,
            partial: routed.summary.horizon_cut,
            route: routed.summary,
        };
        debug!(returned = page.items.len(), has_more = page.has_more, "Page fetched");

        if let Some(cache) = &self.cache {
            cache.put(key, page.clone()).await;
        }
        Ok(page)
    }

    /// Ranked search; never fails
    pub async fn search(&self, input: SearchInput, limit: usize) -> SearchResults {
        let prefs = input.into_preferences();
        let limit = self.effective_page_size(limit);
        let endpoint = self.pipeline.primary_endpoint();
        self.stats.record(endpoint, UsageEvent::Call).await;

        let results = self.pipeline.search(&prefs, limit).await;

        if let Some(route) = &results.route {
            self.stats.record_route(endpoint, route).await;
        }
        if results.degraded_reason.is_some() {
            self.stats.record(endpoint, UsageEvent::Failure).await;
        }
        if results.source != ResultSource::Primary {
            self.stats
                .record(self.pipeline.fallback_endpoint(), UsageEvent::Call)
                .await;
            self.stats.record(endpoint, UsageEvent::Fallback).await;
        }
        if results.partial {
            self.stats.record(endpoint, UsageEvent::Partial).await;
        }
        results
    }

    pub async fn get_statistics(&self) -> EngineStatistics {
        let cache = match &self.cache {
            Some(cache) => Some(cache.stats().await),
            None => None,
        };
        EngineStatistics {
            endpoints: self.stats.snapshot().await,
            resilience: self.resilience.get_all_stats().await,
            available_partitions: self.router.available_partitions().await,
            cache,
        }
    }

    /// Operator action: force an endpoint's breaker closed
    pub async fn reset_circuit_breaker(&self, endpoint: &str) -> bool {
        self.resilience.reset_service(endpoint).await
    }

    pub async fn reset_all_circuit_breakers(&self) {
        self.resilience.reset_all().await;
    }

    /// Run a migration to completion, reporting progress lines
    pub async fn run_migration<F>(
        &self,
        mode: MigrationMode,
        token: CancellationToken,
        on_progress: F,
    ) -> Result<MigrationReport>
    where
        F: FnMut(&str),
    {
        let report = self.migrator.clone().run(mode, token, on_progress).await?;
        if mode == MigrationMode::Live && !report.cancelled {
            self.clear_cache().await;
        }
        Ok(report)
    }

    /// Migration as a cancellable stream of progress events
    pub fn migration_stream(&self, mode: MigrationMode, token: CancellationToken) -> MigrationStream {
        self.migrator.clone().stream(mode, token)
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let collection = &self.schema.collection;
        self.stats.record(&self.get_endpoint, UsageEvent::Call).await;
        let result = self
            .resilience
            .execute(&self.get_endpoint, || self.store.get(collection, id))
            .await;
        if result.is_err() {
            self.stats.record(&self.get_endpoint, UsageEvent::Failure).await;
        }
        result
    }

    /// Live changes of one document; only opening the stream is protected
    pub async fn watch_document(&self, id: &str) -> Result<DocumentStream> {
        let collection = &self.schema.collection;
        self.stats
            .record(&self.subscribe_endpoint, UsageEvent::Call)
            .await;
        let result = self
            .resilience
            .execute(&self.subscribe_endpoint, || {
                self.store
                    .subscribe(collection, WatchTarget::Document(id.to_string()))
            })
            .await;
        if result.is_err() {
            self.stats
                .record(&self.subscribe_endpoint, UsageEvent::Failure)
                .await;
        }
        result
    }

    pub async fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear().await;
        }
    }
}

fn validate_filters(filters: &QueryFilters) -> Result<()> {
    for filter in &filters.conditions {
        if filter.field.trim().is_empty() {
            return Err(QueryError::invalid_input("filter field cannot be empty"));
        }
        if let FilterOp::In(values) = &filter.op {
            if values.is_empty() || values.len() > BACKEND_MAX_IN_VALUES {
                return Err(QueryError::invalid_input(format!(
                    "'{}' IN filter needs 1 to {} values, got {}",
                    filter.field,
                    BACKEND_MAX_IN_VALUES,
                    values.len()
                )));
            }
        }
    }
    Ok(())
}
