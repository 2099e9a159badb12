//! Execution of routed queries
//!
//! Partition targets are queried concurrently, cross-regional targets are
//! served by a bounded scan of the unsharded source, and the per-target
//! results are merged into one deterministically ordered page.

use crate::error::Result;
use crate::error_recovery::ResilienceManager;
use crate::sharding::{QueryRouter, Region, RegionInference, RoutePlan, RouteTarget};
use crate::storage::{Document, DocumentStore, StoreQuery};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// How a routed read was served
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteSummary {
    /// Partition collections queried
    pub partitions: usize,
    /// Whether some regions were served from the source by client-side filtering
    pub cross_regional: bool,
    pub unsharded: bool,
    /// Source windows read by cross-regional scans
    pub scanned_batches: usize,
    /// Whether the page was cut at a fallback scan horizon
    pub horizon_cut: bool,
}

/// Merged result of a routed read
#[derive(Debug, Clone)]
pub struct RoutedPage {
    pub documents: Vec<Document>,
    /// Position the next page starts after
    pub next_position: Option<Vec<Value>>,
    pub summary: RouteSummary,
}

impl RoutedPage {
    pub fn has_more(&self) -> bool {
        self.next_position.is_some()
    }
}

struct TargetPage {
    documents: Vec<Document>,
    /// Last position a budget-limited scan reached
    horizon: Option<Vec<Value>>,
    scanned_batches: usize,
}

/// Executes route plans against the store through the resilience layer
pub struct ShardedReader {
    store: Arc<dyn DocumentStore>,
    resilience: Arc<ResilienceManager>,
    router: Arc<dyn QueryRouter>,
    inference: RegionInference,
    source_collection: String,
    scan_window: usize,
    max_scan_batches: usize,
}

impl ShardedReader {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        resilience: Arc<ResilienceManager>,
        router: Arc<dyn QueryRouter>,
        inference: RegionInference,
        source_collection: String,
        scan_window: usize,
        max_scan_batches: usize,
    ) -> Self {
        Self {
            store,
            resilience,
            router,
            inference,
            source_collection,
            scan_window: scan_window.max(1),
            max_scan_batches: max_scan_batches.max(1),
        }
    }

    pub fn router(&self) -> &Arc<dyn QueryRouter> {
        &self.router
    }

    pub fn inference(&self) -> &RegionInference {
        &self.inference
    }

    /// Read up to `limit` documents after `start_after` for the requested regions
    ///
    /// `base` carries the filters and the total ordering; its own limit and
    /// position are ignored.
    pub async fn read(
        &self,
        endpoint: &str,
        regions: &BTreeSet<Region>,
        base: &StoreQuery,
        limit: usize,
        start_after: Option<Vec<Value>>,
    ) -> Result<RoutedPage> {
        let plan = self.router.plan(regions).await;
        self.read_plan(endpoint, &plan, base, limit, start_after)
            .await
    }

    pub async fn read_plan(
        &self,
        endpoint: &str,
        plan: &RoutePlan,
        base: &StoreQuery,
        limit: usize,
        start_after: Option<Vec<Value>>,
    ) -> Result<RoutedPage> {
        let limit = limit.max(1);
        let targets = plan.targets.iter().map(|target| {
            self.read_target(endpoint, target, base, limit, start_after.clone())
        });
        let pages = try_join_all(targets).await?;

        let mut summary = RouteSummary {
            partitions: plan.partitions(),
            cross_regional: plan.is_cross_regional(),
            unsharded: plan.is_unsharded(),
            ..Default::default()
        };

        let mut horizon: Option<Vec<Value>> = None;
        let mut merged = Vec::new();
        for page in pages {
            summary.scanned_batches += page.scanned_batches;
            if let Some(h) = page.horizon {
                // Keep the earliest horizon under the query ordering
                let earlier = match &horizon {
                    Some(current) => base.compare_positions(&h, current) == Ordering::Less,
                    None => true,
                };
                if earlier {
                    horizon = Some(h);
                }
            }
            merged.extend(page.documents);
        }

        merged.sort_by(|a, b| base.compare(a, b));
        let mut seen = HashSet::new();
        merged.retain(|doc| seen.insert(doc.id.clone()));

        if let Some(h) = &horizon {
            let before = merged.len();
            merged.retain(|doc| !base.is_after(doc, h));
            summary.horizon_cut = merged.len() < before || merged.len() < limit;
        }
        merged.truncate(limit);

        let next_position = if merged.len() == limit {
            merged.last().map(|doc| base.position_of(doc))
        } else {
            horizon
        };

        if summary.horizon_cut {
            warn!(
                endpoint,
                returned = merged.len(),
                "Cross-regional scan budget reached, page cut at scan horizon"
            );
        }

        Ok(RoutedPage {
            documents: merged,
            next_position,
            summary,
        })
    }

    async fn read_target(
        &self,
        endpoint: &str,
        target: &RouteTarget,
        base: &StoreQuery,
        limit: usize,
        start_after: Option<Vec<Value>>,
    ) -> Result<TargetPage> {
        match target {
            RouteTarget::Partition { collection, .. } => {
                let documents = self
                    .query_window(endpoint, collection, base, limit, start_after)
                    .await?;
                Ok(TargetPage {
                    documents,
                    horizon: None,
                    scanned_batches: 0,
                })
            }
            RouteTarget::Source => {
                let documents = self
                    .query_window(endpoint, &self.source_collection, base, limit, start_after)
                    .await?;
                Ok(TargetPage {
                    documents,
                    horizon: None,
                    scanned_batches: 0,
                })
            }
            RouteTarget::CrossRegional { regions } => {
                self.scan_source(endpoint, regions, base, limit, start_after)
                    .await
            }
        }
    }

    async fn query_window(
        &self,
        endpoint: &str,
        collection: &str,
        base: &StoreQuery,
        limit: usize,
        start_after: Option<Vec<Value>>,
    ) -> Result<Vec<Document>> {
        let query = base.clone().limit(limit).start_after(start_after);
        self.resilience
            .execute(endpoint, || self.store.query(collection, &query))
            .await
    }

    /// Scan source windows until `limit` matches, exhaustion or the budget
    async fn scan_source(
        &self,
        endpoint: &str,
        regions: &BTreeSet<Region>,
        base: &StoreQuery,
        limit: usize,
        start_after: Option<Vec<Value>>,
    ) -> Result<TargetPage> {
        let mut matches = Vec::new();
        let mut position = start_after;

        for batch in 1..=self.max_scan_batches {
            let window = self
                .query_window(
                    endpoint,
                    &self.source_collection,
                    base,
                    self.scan_window,
                    position.clone(),
                )
                .await?;
            let exhausted = window.len() < self.scan_window;
            if let Some(last) = window.last() {
                position = Some(base.position_of(last));
            }
            matches.extend(
                window
                    .into_iter()
                    .filter(|doc| regions.contains(&self.inference.infer(doc))),
            );

            if matches.len() >= limit || exhausted {
                debug!(endpoint, batch, matched = matches.len(), "Cross-regional scan complete");
                return Ok(TargetPage {
                    documents: matches,
                    horizon: None,
                    scanned_batches: batch,
                });
            }
        }

        debug!(
            endpoint,
            matched = matches.len(),
            budget = self.max_scan_batches,
            "Cross-regional scan stopped at budget"
        );
        Ok(TargetPage {
            documents: matches,
            horizon: position,
            scanned_batches: self.max_scan_batches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SchemaConfig, ShardingConfig};
    use crate::error_recovery::ResilienceConfig;
    use crate::sharding::RegionalRouter;
    use crate::storage::{Direction, InMemoryStore, StoreOp, DOCUMENT_ID};
    use serde_json::json;

    fn job(id: &str, ts: i64, state: &str) -> Document {
        Document::new(id, json!({"timestamp": ts, "state": state}))
    }

    fn base() -> StoreQuery {
        StoreQuery::new()
            .order_by("timestamp", Direction::Descending)
            .order_by(DOCUMENT_ID, Direction::Descending)
    }

    async fn reader(
        store: Arc<InMemoryStore>,
        available: Vec<Region>,
        window: usize,
        budget: usize,
    ) -> ShardedReader {
        let router = Arc::new(RegionalRouter::new(&ShardingConfig {
            available_partitions: available,
            ..Default::default()
        }));
        ShardedReader::new(
            store,
            Arc::new(ResilienceManager::new(ResilienceConfig::default())),
            router,
            RegionInference::new(&SchemaConfig::default()),
            "jobs".to_string(),
            window,
            budget,
        )
    }

    #[tokio::test]
    async fn test_cross_regional_scan_filters_by_inferred_region() {
        let docs: Vec<_> = (0..10)
            .map(|i| job(&format!("d{i}"), i, if i % 2 == 0 { "NY" } else { "TX" }))
            .collect();
        let store = Arc::new(InMemoryStore::with_documents("jobs", docs).await);
        let reader = reader(store.clone(), vec![], 3, 10).await;

        let page = reader
            .read("jobs.query", &BTreeSet::from([Region::Northeast]), &base(), 2, None)
            .await
            .unwrap();

        let ids: Vec<_> = page.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d8", "d6"]);
        assert!(page.has_more());
        assert!(page.summary.cross_regional);
        assert!(!page.summary.horizon_cut);
    }

    #[tokio::test]
    async fn test_scan_budget_cuts_at_horizon_without_gaps() {
        // Only the oldest document matches the requested region
        let mut docs: Vec<_> = (1..10).map(|i| job(&format!("d{i}"), i, "TX")).collect();
        docs.push(job("d0", 0, "NY"));
        let store = Arc::new(InMemoryStore::with_documents("jobs", docs).await);
        let reader = reader(store.clone(), vec![], 2, 2).await;
        let regions = BTreeSet::from([Region::Northeast]);

        let mut cursor = None;
        let mut collected = Vec::new();
        for _ in 0..10 {
            let page = reader
                .read("jobs.query", &regions, &base(), 5, cursor.clone())
                .await
                .unwrap();
            collected.extend(page.documents.iter().map(|d| d.id.clone()));
            if !page.has_more() {
                break;
            }
            assert!(page.summary.horizon_cut);
            cursor = page.next_position;
        }
        assert_eq!(collected, vec!["d0".to_string()]);
    }

    #[tokio::test]
    async fn test_partition_and_fallback_merge() {
        let store = Arc::new(
            InMemoryStore::with_documents("jobs", vec![job("m1", 5, "OH"), job("w1", 9, "CA")])
                .await,
        );
        store
            .insert_many("jobs_regions/west/jobs", vec![job("w1", 9, "CA")])
            .await;
        let reader = reader(store.clone(), vec![Region::West], 10, 3).await;

        let page = reader
            .read(
                "jobs.query",
                &BTreeSet::from([Region::West, Region::Midwest]),
                &base(),
                10,
                None,
            )
            .await
            .unwrap();

        let ids: Vec<_> = page.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["w1", "m1"]);
        assert!(!page.has_more());
        assert_eq!(page.summary.partitions, 1);
        assert_eq!(store.call_count(StoreOp::Query), 2);
    }
}
