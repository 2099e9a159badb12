//! In-memory document store
//!
//! Backs the CLI and the test suites. Besides plain storage it simulates the
//! behaviours of a remote document database the engine has to survive:
//! composite indexes that are still building, pushed change notifications,
//! injected failures and added latency.

use super::{
    BackendCode, BackendError, BackendResult, ChangeKind, Document, DocumentChange,
    DocumentStore, DocumentStream, StoreQuery, WatchTarget, WriteOp, MAX_BATCH_OPERATIONS,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, trace};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Store primitive, used to target fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOp {
    Get,
    Query,
    Subscribe,
    BatchWrite,
}

#[derive(Debug, Clone)]
struct Fault {
    op: StoreOp,
    collection: Option<String>,
    /// `None` fails forever
    remaining: Option<usize>,
    error: BackendError,
}

impl Fault {
    fn applies(&self, op: StoreOp, collection: Option<&str>) -> bool {
        if self.op != op || self.remaining == Some(0) {
            return false;
        }
        match (&self.collection, collection) {
            (None, _) => true,
            (Some(expected), Some(actual)) => expected == actual,
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Default)]
struct CallCounters {
    get: AtomicU64,
    query: AtomicU64,
    subscribe: AtomicU64,
    batch_write: AtomicU64,
}

impl CallCounters {
    fn counter(&self, op: StoreOp) -> &AtomicU64 {
        match op {
            StoreOp::Get => &self.get,
            StoreOp::Query => &self.query,
            StoreOp::Subscribe => &self.subscribe,
            StoreOp::BatchWrite => &self.batch_write,
        }
    }
}

type Collection = BTreeMap<String, Map<String, Value>>;

/// In-process [`DocumentStore`] implementation
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
    building_indexes: RwLock<HashSet<String>>,
    faults: Mutex<Vec<Fault>>,
    latency: RwLock<Option<Duration>>,
    calls: CallCounters,
    changes: broadcast::Sender<DocumentChange>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            collections: RwLock::new(HashMap::new()),
            building_indexes: RwLock::new(HashSet::new()),
            faults: Mutex::new(Vec::new()),
            latency: RwLock::new(None),
            calls: CallCounters::default(),
            changes,
        }
    }

    /// Create a store holding the given documents in one collection
    pub async fn with_documents<I>(collection: &str, documents: I) -> Self
    where
        I: IntoIterator<Item = Document>,
    {
        let store = Self::new();
        store.insert_many(collection, documents).await;
        store
    }

    /// Insert or replace documents without counting calls or notifying
    pub async fn insert_many<I>(&self, collection: &str, documents: I) -> usize
    where
        I: IntoIterator<Item = Document>,
    {
        let mut collections = self.collections.write().await;
        let target = collections.entry(collection.to_string()).or_default();
        let mut inserted = 0;
        for doc in documents {
            target.insert(doc.id, doc.data);
            inserted += 1;
        }
        inserted
    }

    /// Load a JSON array of objects, each carrying an `id` field
    pub async fn load_json(&self, collection: &str, value: Value) -> BackendResult<usize> {
        let Value::Array(items) = value else {
            return Err(BackendError::new(
                BackendCode::InvalidArgument,
                "dataset must be a JSON array of documents",
            ));
        };
        let mut documents = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let doc = Document::from_json(item).ok_or_else(|| {
                BackendError::new(
                    BackendCode::InvalidArgument,
                    format!("dataset entry {index} is not an object with an id"),
                )
            })?;
            documents.push(doc);
        }
        Ok(self.insert_many(collection, documents).await)
    }

    /// All documents of a collection in identity order
    pub async fn documents(&self, collection: &str) -> Vec<Document> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| Document {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn count(&self, collection: &str) -> usize {
        let collections = self.collections.read().await;
        collections.get(collection).map_or(0, BTreeMap::len)
    }

    /// Mark the composite indexes of a collection as built or building
    pub async fn set_index_ready(&self, collection: &str, ready: bool) {
        let mut building = self.building_indexes.write().await;
        if ready {
            building.remove(collection);
        } else {
            building.insert(collection.to_string());
        }
    }

    /// Fail the next `count` calls of `op` on any collection
    pub async fn inject_failures(&self, op: StoreOp, count: usize, error: BackendError) {
        self.push_fault(op, None, Some(count), error).await;
    }

    /// Fail the next `count` calls of `op` on one collection
    pub async fn inject_collection_failures(
        &self,
        op: StoreOp,
        collection: &str,
        count: usize,
        error: BackendError,
    ) {
        self.push_fault(op, Some(collection.to_string()), Some(count), error)
            .await;
    }

    /// Fail every call of `op` until [`InMemoryStore::clear_faults`]
    pub async fn fail_always(&self, op: StoreOp, error: BackendError) {
        self.push_fault(op, None, None, error).await;
    }

    pub async fn clear_faults(&self) {
        self.faults.lock().await.clear();
    }

    /// Delay every call by `latency`
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().await = latency;
    }

    /// Number of calls received for `op`, failed ones included
    pub fn call_count(&self, op: StoreOp) -> u64 {
        self.calls.counter(op).load(Ordering::Relaxed)
    }

    pub fn total_calls(&self) -> u64 {
        [
            StoreOp::Get,
            StoreOp::Query,
            StoreOp::Subscribe,
            StoreOp::BatchWrite,
        ]
        .into_iter()
        .map(|op| self.call_count(op))
        .sum()
    }

    async fn push_fault(
        &self,
        op: StoreOp,
        collection: Option<String>,
        remaining: Option<usize>,
        error: BackendError,
    ) {
        debug!(?op, ?collection, ?remaining, code = %error.code, "Injecting store fault");
        self.faults.lock().await.push(Fault {
            op,
            collection,
            remaining,
            error,
        });
    }

    /// Count the call, apply latency and fire a pending fault
    async fn enter(&self, op: StoreOp, collection: Option<&str>) -> BackendResult<()> {
        self.calls.counter(op).fetch_add(1, Ordering::Relaxed);

        let latency = *self.latency.read().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self.faults.lock().await;
        if let Some(fault) = faults.iter_mut().find(|f| f.applies(op, collection)) {
            if let Some(remaining) = fault.remaining.as_mut() {
                *remaining -= 1;
            }
            trace!(?op, ?collection, "Store fault fired");
            return Err(fault.error.clone());
        }
        faults.retain(|f| f.remaining != Some(0));
        Ok(())
    }

    async fn snapshot(&self, collection: &str, target: &WatchTarget) -> Vec<Document> {
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Vec::new();
        };
        match target {
            WatchTarget::Document(id) => docs
                .get(id)
                .map(|data| Document {
                    id: id.clone(),
                    data: data.clone(),
                })
                .into_iter()
                .collect(),
            WatchTarget::Query(query) => run_query(docs, query),
        }
    }
}

fn run_query(docs: &Collection, query: &StoreQuery) -> Vec<Document> {
    let mut matched: Vec<Document> = docs
        .iter()
        .map(|(id, data)| Document {
            id: id.clone(),
            data: data.clone(),
        })
        .filter(|doc| query.matches(doc))
        .collect();
    matched.sort_by(|a, b| query.compare(a, b));
    if let Some(position) = &query.start_after {
        matched.retain(|doc| query.is_after(doc, position));
    }
    if let Some(limit) = query.limit {
        matched.truncate(limit);
    }
    matched
}

fn watch_matches(target: &WatchTarget, doc: &Document) -> bool {
    match target {
        WatchTarget::Document(id) => &doc.id == id,
        WatchTarget::Query(query) => query.matches(doc),
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, collection: &str, id: &str) -> BackendResult<Option<Document>> {
        self.enter(StoreOp::Get, Some(collection)).await?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|data| Document {
                id: id.to_string(),
                data: data.clone(),
            }))
    }

    async fn query(&self, collection: &str, query: &StoreQuery) -> BackendResult<Vec<Document>> {
        self.enter(StoreOp::Query, Some(collection)).await?;

        if query.needs_composite_index()
            && self.building_indexes.read().await.contains(collection)
        {
            return Err(BackendError::new(
                BackendCode::IndexNotReady,
                format!("the query requires an index on '{collection}' that is still building"),
            ));
        }

        let collections = self.collections.read().await;
        let results = collections
            .get(collection)
            .map(|docs| run_query(docs, query))
            .unwrap_or_default();
        trace!(collection, returned = results.len(), "In-memory query executed");
        Ok(results)
    }

    async fn subscribe(
        &self,
        collection: &str,
        target: WatchTarget,
    ) -> BackendResult<DocumentStream> {
        self.enter(StoreOp::Subscribe, Some(collection)).await?;

        let mut receiver = self.changes.subscribe();
        let initial = self.snapshot(collection, &target).await;
        let collection = collection.to_string();

        let stream = async_stream::stream! {
            for document in initial {
                yield DocumentChange {
                    collection: collection.clone(),
                    kind: ChangeKind::Upserted,
                    document,
                };
            }
            loop {
                match receiver.recv().await {
                    Ok(change) => {
                        if change.collection == collection && watch_matches(&target, &change.document) {
                            yield change;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Subscriber lagged behind change feed");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn batch_write(&self, operations: Vec<WriteOp>) -> BackendResult<()> {
        self.enter(StoreOp::BatchWrite, None).await?;

        if operations.len() > MAX_BATCH_OPERATIONS {
            return Err(BackendError::new(
                BackendCode::InvalidArgument,
                format!(
                    "batch of {} operations exceeds the limit of {MAX_BATCH_OPERATIONS}",
                    operations.len()
                ),
            ));
        }

        let mut changes = Vec::with_capacity(operations.len());
        {
            let mut collections = self.collections.write().await;
            for op in operations {
                match op {
                    WriteOp::Set {
                        collection,
                        id,
                        data,
                    } => {
                        collections
                            .entry(collection.clone())
                            .or_default()
                            .insert(id.clone(), data.clone());
                        changes.push(DocumentChange {
                            collection,
                            kind: ChangeKind::Upserted,
                            document: Document { id, data },
                        });
                    }
                    WriteOp::Delete { collection, id } => {
                        let removed = collections
                            .get_mut(&collection)
                            .and_then(|docs| docs.remove(&id));
                        if let Some(data) = removed {
                            changes.push(DocumentChange {
                                collection,
                                kind: ChangeKind::Removed,
                                document: Document { id, data },
                            });
                        }
                    }
                }
            }
        }

        for change in changes {
            // No receivers is not an error
            let _ = self.changes.send(change);
        }
        Ok(())
    }
}
