//! Ranked search with recency fallback
//!
//! Primary path: an indexed query constrained by the most selective
//! preference filter, routed through sharding, refined client-side, scored and
//! ordered. When the primary path is unusable the caller still gets the most
//! recent items, unranked. Search never fails.

use crate::config::{SchemaConfig, SearchConfig};
use crate::error::ErrorReason;
use crate::search::ranking::{has_flags, matches_category, rank_order};
use crate::search::{QueryPreferences, RankedResult, Ranker};
use crate::sharding::{RoutePlan, RouteSummary, ShardedReader};
use crate::storage::{Direction, Document, Filter, StoreQuery, DOCUMENT_ID};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the returned items came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// Primary path only
    Primary,
    /// Primary results topped up with recency items
    PrimaryWithTopUp,
    /// Recency fallback only
    Fallback,
}

/// Search outcome
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub items: Vec<RankedResult>,
    pub source: ResultSource,
    /// Why the primary path was abandoned, if it was
    pub degraded_reason: Option<ErrorReason>,
    /// Best-effort results that do not fully honour the preferences
    pub partial: bool,
    /// Routing of the primary query
    pub route: Option<RouteSummary>,
}

/// Preference search over the document set
pub struct SearchPipeline {
    reader: Arc<ShardedReader>,
    ranker: Arc<dyn Ranker>,
    config: SearchConfig,
    schema: SchemaConfig,
    primary_endpoint: String,
    fallback_endpoint: String,
}

impl SearchPipeline {
    pub fn new(
        reader: Arc<ShardedReader>,
        ranker: Arc<dyn Ranker>,
        config: SearchConfig,
        schema: SchemaConfig,
    ) -> Self {
        Self {
            primary_endpoint: format!("{}.search", schema.collection),
            fallback_endpoint: format!("{}.fallback", schema.collection),
            reader,
            ranker,
            config,
            schema,
        }
    }

    pub fn primary_endpoint(&self) -> &str {
        &self.primary_endpoint
    }

    pub fn fallback_endpoint(&self) -> &str {
        &self.fallback_endpoint
    }

    /// Indexed query for the preferences: the most selective filter plus the
    /// deleted flag, in (recency desc, id desc) order
    pub fn primary_query(&self, prefs: &QueryPreferences) -> StoreQuery {
        let schema = &self.schema;
        let max_in = self.config.max_in_values;
        let mut query =
            StoreQuery::new().filter(Filter::not_eq(&schema.deleted_field, Value::Bool(true)));

        if (1..=max_in).contains(&prefs.preferred_groups.len()) {
            let groups = prefs.preferred_groups.iter().map(|g| Value::from(*g)).collect();
            query = query.filter(Filter::is_in(&schema.group_field, groups));
        } else if (1..=max_in).contains(&prefs.categories.len()) {
            let categories = prefs
                .categories
                .iter()
                .map(|c| Value::String(c.clone()))
                .collect();
            query = query.filter(Filter::is_in(&schema.category_field, categories));
        }

        query
            .order_by(&schema.timestamp_field, Direction::Descending)
            .order_by(DOCUMENT_ID, Direction::Descending)
    }

    /// Client-side refinement; each criterion can be switched to scoring only
    pub fn refine(&self, doc: &Document, prefs: &QueryPreferences) -> bool {
        let policy = &self.config.refinement;
        let schema = &self.schema;

        if policy.categories && !prefs.categories.is_empty() {
            let matched = doc
                .str_field(&schema.category_field)
                .is_some_and(|c| matches_category(c, &prefs.categories));
            if !matched {
                return false;
            }
        }

        if policy.numeric_range {
            if let Some(range) = prefs.numeric_range.filter(|r| !r.is_unbounded()) {
                let within = doc
                    .f64_field(&schema.numeric_field)
                    .is_some_and(|v| range.contains(v));
                if !within {
                    return false;
                }
            }
        }

        if policy.required_flags && !prefs.required_flags.is_empty() {
            return has_flags(doc, &prefs.required_flags);
        }

        true
    }

    pub async fn search(&self, prefs: &QueryPreferences, limit: usize) -> SearchResults {
        let limit = limit.max(1);

        if prefs.is_empty() {
            debug!("No preferences, serving recency fallback");
            return SearchResults {
                items: self.fallback(limit, &HashSet::new()).await,
                source: ResultSource::Fallback,
                degraded_reason: None,
                partial: false,
                route: None,
            };
        }

        let query = self.primary_query(prefs);
        let fetch = limit.saturating_mul(self.config.overfetch.max(1));
        let page = match self
            .reader
            .read(&self.primary_endpoint, &prefs.regions, &query, fetch, None)
            .await
        {
            Ok(page) => page,
            Err(error) => {
                warn!(%error, kind = ?error.kind(), "Primary search failed, serving recency fallback");
                return SearchResults {
                    items: self.fallback(limit, &HashSet::new()).await,
                    source: ResultSource::Fallback,
                    degraded_reason: Some(error.reason()),
                    partial: true,
                    route: None,
                };
            }
        };

        let now = Utc::now();
        let mut items: Vec<RankedResult> = page
            .documents
            .into_iter()
            .filter(|doc| self.refine(doc, prefs))
            .map(|document| {
                let score = self
                    .config
                    .ranking_enabled
                    .then(|| self.ranker.score(&document, prefs, now));
                RankedResult {
                    timestamp: document.timestamp(&self.schema.timestamp_field),
                    document,
                    score,
                }
            })
            .collect();
        items.sort_by(rank_order);
        items.truncate(limit);

        let mut source = ResultSource::Primary;
        let mut partial = page.summary.horizon_cut;
        if items.len() < limit && self.config.top_up {
            let seen: HashSet<String> = items.iter().map(|r| r.id().to_string()).collect();
            let extra = self.fallback(limit - items.len(), &seen).await;
            if !extra.is_empty() {
                info!(
                    ranked = items.len(),
                    topped_up = extra.len(),
                    "Topping up short ranked results with recent items"
                );
                source = ResultSource::PrimaryWithTopUp;
                partial = true;
                items.extend(extra);
            }
        }

        SearchResults {
            items,
            source,
            degraded_reason: None,
            partial,
            route: Some(page.summary),
        }
    }

    /// Most recent non-deleted items, unranked; failures yield an empty list
    ///
    /// The deleted flag is checked client-side so the query needs no
    /// composite index.
    pub async fn fallback(&self, limit: usize, exclude: &HashSet<String>) -> Vec<RankedResult> {
        let query = StoreQuery::new()
            .order_by(&self.schema.timestamp_field, Direction::Descending)
            .order_by(DOCUMENT_ID, Direction::Descending);
        let fetch = (limit + exclude.len()).saturating_mul(self.config.overfetch.max(1));

        let page = match self
            .reader
            .read_plan(&self.fallback_endpoint, &RoutePlan::source(), &query, fetch, None)
            .await
        {
            Ok(page) => page,
            Err(error) => {
                warn!(%error, "Recency fallback failed, returning no results");
                return Vec::new();
            }
        };

        page.documents
            .into_iter()
            .filter(|doc| doc.bool_field(&self.schema.deleted_field) != Some(true))
            .filter(|doc| !exclude.contains(&doc.id))
            .take(limit)
            .map(|document| RankedResult {
                timestamp: document.timestamp(&self.schema.timestamp_field),
                document,
                score: None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardingConfig;
    use crate::error::ErrorKind;
    use crate::error_recovery::{ResilienceConfig, ResilienceManager, RetryPolicy};
    use crate::search::WeightedRanker;
    use crate::sharding::{RegionInference, RegionalRouter};
    use crate::storage::{BackendCode, BackendError, InMemoryStore, StoreOp};
    use serde_json::json;

    fn job(id: &str, local: i64, minutes_ago: i64) -> Document {
        let ts = Utc::now().timestamp_millis() - minutes_ago * 60_000;
        Document::new(
            id,
            json!({"local": local, "timestamp": ts, "deleted": false, "state": "OH"}),
        )
    }

    fn pipeline(store: Arc<InMemoryStore>, config: SearchConfig) -> SearchPipeline {
        let schema = SchemaConfig::default();
        let resilience = Arc::new(ResilienceManager::new(ResilienceConfig {
            retry_policy: RetryPolicy {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        }));
        let reader = Arc::new(ShardedReader::new(
            store,
            resilience,
            Arc::new(RegionalRouter::new(&ShardingConfig::default())),
            RegionInference::new(&schema),
            schema.collection.clone(),
            100,
            10,
        ));
        let ranker = Arc::new(WeightedRanker::new(config.weights.clone(), schema.clone()));
        SearchPipeline::new(reader, ranker, config, schema)
    }

    fn dataset() -> Vec<Document> {
        vec![
            job("a", 3, 1),
            job("b", 7, 30),
            job("c", 5, 2),
            job("d", 7, 60),
            job("e", 9, 3),
        ]
    }

    #[tokio::test]
    async fn test_preferred_group_items_rank_first() {
        let store = Arc::new(InMemoryStore::with_documents("jobs", dataset()).await);
        let pipeline = pipeline(store, SearchConfig::default());
        let prefs = QueryPreferences {
            preferred_groups: vec![7],
            ..Default::default()
        };

        let results = pipeline.search(&prefs, 5).await;
        let ids: Vec<_> = results.items.iter().map(|r| r.id()).collect();
        assert_eq!(&ids[..2], &["b", "d"]);
        assert_eq!(results.items[0].score, Some(110));
        assert_eq!(results.source, ResultSource::PrimaryWithTopUp);
        assert!(results.items[2..].iter().all(|r| r.score.is_none()));
    }

    #[tokio::test]
    async fn test_transient_primary_failure_falls_back_to_recency() {
        let store = Arc::new(InMemoryStore::with_documents("jobs", dataset()).await);
        store
            .inject_failures(
                StoreOp::Query,
                1,
                BackendError::new(BackendCode::Unavailable, "backend down"),
            )
            .await;
        let pipeline = pipeline(store, SearchConfig::default());
        let prefs = QueryPreferences {
            preferred_groups: vec![7],
            ..Default::default()
        };

        let results = pipeline.search(&prefs, 3).await;
        let ids: Vec<_> = results.items.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["a", "c", "e"]);
        assert!(results.items.iter().all(|r| r.score.is_none()));
        assert_eq!(results.source, ResultSource::Fallback);
        assert_eq!(
            results.degraded_reason.map(|r| r.kind),
            Some(ErrorKind::Transient)
        );
    }

    #[tokio::test]
    async fn test_building_index_degrades_with_reason() {
        let store = Arc::new(InMemoryStore::with_documents("jobs", dataset()).await);
        store.set_index_ready("jobs", false).await;
        let pipeline = pipeline(store, SearchConfig::default());

        let results = pipeline
            .search(&QueryPreferences::from_text("7"), 2)
            .await;
        assert_eq!(results.items.len(), 2);
        assert_eq!(
            results.degraded_reason.map(|r| r.kind),
            Some(ErrorKind::IndexNotReady)
        );
    }

    #[tokio::test]
    async fn test_fallback_never_fails() {
        let store = Arc::new(InMemoryStore::with_documents("jobs", dataset()).await);
        store
            .fail_always(
                StoreOp::Query,
                BackendError::new(BackendCode::PermissionDenied, "rules"),
            )
            .await;
        let pipeline = pipeline(store, SearchConfig::default());

        let results = pipeline.search(&QueryPreferences::default(), 3).await;
        assert!(results.items.is_empty());
        assert_eq!(results.source, ResultSource::Fallback);
    }

    #[tokio::test]
    async fn test_ranking_disabled_keeps_recency_order() {
        let store = Arc::new(InMemoryStore::with_documents("jobs", dataset()).await);
        let config = SearchConfig {
            ranking_enabled: false,
            top_up: false,
            ..Default::default()
        };
        let pipeline = pipeline(store, config);
        let prefs = QueryPreferences {
            preferred_groups: vec![7, 9],
            ..Default::default()
        };

        let results = pipeline.search(&prefs, 10).await;
        let ids: Vec<_> = results.items.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["e", "b", "d"]);
        assert!(results.items.iter().all(|r| r.score.is_none()));
        assert_eq!(results.source, ResultSource::Primary);
    }

    #[test]
    fn test_primary_filter_selection() {
        let prefs = QueryPreferences {
            preferred_groups: (1..=11).collect(),
            categories: vec!["commercial".into()],
            ..Default::default()
        };
        let store = Arc::new(InMemoryStore::new());
        let pipeline = pipeline(store, SearchConfig::default());
        let query = pipeline.primary_query(&prefs);
        assert_eq!(query.filters.len(), 2);
        assert_eq!(query.filters[1].field, "constructionType");
    }
}
