//! One-way migration of the unsharded source into regional partitions
//!
//! The source is paged in identity order, every document is classified by
//! region inference and, in live mode, upserted into its partition under the
//! same id. The source is never modified, so a run can be repeated or resumed
//! after cancellation without harm.

use crate::error::{QueryError, Result};
use crate::error_recovery::ResilienceManager;
use crate::sharding::{QueryRouter, Region, RegionInference};
use crate::storage::{
    Direction, Document, DocumentStore, StoreQuery, WriteOp, DOCUMENT_ID, MAX_BATCH_OPERATIONS,
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Whether a run writes partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationMode {
    /// Classify and count without writing
    DryRun,
    Live,
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationMode::DryRun => f.write_str("dry-run"),
            MigrationMode::Live => f.write_str("live"),
        }
    }
}

/// Outcome of a migration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub mode: MigrationMode,
    /// Documents per partition, every partition listed
    pub partition_counts: BTreeMap<Region, usize>,
    pub total: usize,
    pub documents_written: usize,
    pub write_batches: usize,
    /// `1 - mean(count / total)` over non-empty partitions
    pub estimated_scope_reduction: f64,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl MigrationReport {
    /// Multi-line human-readable summary
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Migration {} ({}) {}: {} documents",
            self.run_id,
            self.mode,
            if self.cancelled { "cancelled" } else { "completed" },
            self.total
        )];
        for (region, count) in &self.partition_counts {
            lines.push(format!("  {region:<10} {count}"));
        }
        lines.push(format!(
            "  estimated scope reduction: {:.1}%",
            self.estimated_scope_reduction * 100.0
        ));
        if self.mode == MigrationMode::Live {
            lines.push(format!(
                "  written: {} documents in {} batches",
                self.documents_written, self.write_batches
            ));
        }
        lines.join("\n")
    }
}

/// Progress event of a running migration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MigrationEvent {
    Started { run_id: Uuid, mode: MigrationMode },
    Progress { processed: usize },
    BatchWritten { region: Region, documents: usize },
    Cancelled { report: MigrationReport },
    Completed { report: MigrationReport },
}

impl MigrationEvent {
    /// Human-readable progress line
    pub fn describe(&self) -> String {
        match self {
            MigrationEvent::Started { run_id, mode } => {
                format!("Starting {mode} migration {run_id}")
            }
            MigrationEvent::Progress { processed } => {
                format!("Processed {processed} documents")
            }
            MigrationEvent::BatchWritten { region, documents } => {
                format!("Wrote {documents} documents to {region}")
            }
            MigrationEvent::Cancelled { report } => format!(
                "Migration cancelled after {} documents; rerun to resume",
                report.total
            ),
            MigrationEvent::Completed { report } => report.summary(),
        }
    }
}

pub type MigrationStream = Pin<Box<dyn Stream<Item = Result<MigrationEvent>> + Send>>;

/// `1 - mean(count / total)` over non-empty partitions; 0 for an empty source
pub fn estimate_scope_reduction(counts: &BTreeMap<Region, usize>) -> f64 {
    let total: usize = counts.values().sum();
    let non_empty: Vec<usize> = counts.values().copied().filter(|c| *c > 0).collect();
    if total == 0 || non_empty.is_empty() {
        return 0.0;
    }
    let mean = non_empty
        .iter()
        .map(|c| *c as f64 / total as f64)
        .sum::<f64>()
        / non_empty.len() as f64;
    1.0 - mean
}

/// Migrates the source collection into regional partitions
pub struct Migrator {
    store: Arc<dyn DocumentStore>,
    resilience: Arc<ResilienceManager>,
    router: Arc<dyn QueryRouter>,
    inference: RegionInference,
    source_collection: String,
    batch_size: usize,
    read_endpoint: String,
    write_endpoint: String,
}

impl Migrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        resilience: Arc<ResilienceManager>,
        router: Arc<dyn QueryRouter>,
        inference: RegionInference,
        source_collection: String,
        batch_size: usize,
    ) -> Self {
        Self {
            read_endpoint: format!("{source_collection}.migration.read"),
            write_endpoint: format!("{source_collection}.migration.write"),
            store,
            resilience,
            router,
            inference,
            source_collection,
            batch_size: batch_size.clamp(1, MAX_BATCH_OPERATIONS),
        }
    }

    /// Run as a stream of progress events
    ///
    /// Cancellation is checked between batches; the final event is
    /// `Cancelled` or `Completed`. Errors end the stream.
    pub fn stream(self: Arc<Self>, mode: MigrationMode, token: CancellationToken) -> MigrationStream {
        Box::pin(async_stream::try_stream! {
            let run_id = Uuid::new_v4();
            let started_at = Utc::now();
            info!(%run_id, %mode, source = %self.source_collection, "Migration started");
            yield MigrationEvent::Started { run_id, mode };

            let mut counts: BTreeMap<Region, usize> =
                Region::ALL.into_iter().map(|region| (region, 0)).collect();
            let base = StoreQuery::new().order_by(DOCUMENT_ID, Direction::Ascending);
            let mut position = None;
            let mut processed = 0;
            let mut written = 0;
            let mut write_batches = 0;
            let mut cancelled = false;

            loop {
                if token.is_cancelled() {
                    warn!(%run_id, processed, "Migration cancelled");
                    cancelled = true;
                    break;
                }

                let query = base.clone().limit(self.batch_size).start_after(position.clone());
                let page = self
                    .resilience
                    .execute(&self.read_endpoint, || {
                        self.store.query(&self.source_collection, &query)
                    })
                    .await?;
                if page.is_empty() {
                    break;
                }
                let exhausted = page.len() < self.batch_size;
                position = page.last().map(|doc| base.position_of(doc));
                processed += page.len();

                let mut groups: BTreeMap<Region, Vec<Document>> = BTreeMap::new();
                for doc in page {
                    groups.entry(self.inference.infer(&doc)).or_default().push(doc);
                }

                for (region, docs) in groups {
                    *counts.entry(region).or_default() += docs.len();
                    if mode == MigrationMode::Live {
                        let collection = self.router.partition_collection(region);
                        let ops: Vec<WriteOp> =
                            docs.iter().map(|doc| WriteOp::set(&collection, doc)).collect();
                        let documents = ops.len();
                        self.resilience
                            .execute(&self.write_endpoint, || self.store.batch_write(ops.clone()))
                            .await?;
                        written += documents;
                        write_batches += 1;
                        yield MigrationEvent::BatchWritten { region, documents };
                    }
                }

                yield MigrationEvent::Progress { processed };
                if exhausted {
                    break;
                }
            }

            let total = counts.values().sum();
            let report = MigrationReport {
                run_id,
                mode,
                estimated_scope_reduction: estimate_scope_reduction(&counts),
                partition_counts: counts,
                total,
                documents_written: written,
                write_batches,
                cancelled,
                started_at,
                finished_at: Utc::now(),
            };

            if cancelled {
                yield MigrationEvent::Cancelled { report };
            } else {
                if mode == MigrationMode::Live {
                    for region in Region::ALL {
                        self.router.set_available(region, true).await;
                    }
                }
                info!(%run_id, total, written, "Migration completed");
                yield MigrationEvent::Completed { report };
            }
        })
    }

    /// Run to the end, reporting each event as a progress line
    pub async fn run<F>(
        self: Arc<Self>,
        mode: MigrationMode,
        token: CancellationToken,
        mut on_progress: F,
    ) -> Result<MigrationReport>
    where
        F: FnMut(&str),
    {
        let mut events = self.stream(mode, token);
        let mut report = None;
        while let Some(event) = events.next().await {
            let event = event?;
            on_progress(&event.describe());
            if let MigrationEvent::Completed { report: r } | MigrationEvent::Cancelled { report: r } =
                event
            {
                report = Some(r);
            }
        }
        report.ok_or_else(|| QueryError::internal("migration ended without a report"))
    }
}
