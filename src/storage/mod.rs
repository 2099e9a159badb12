//! Document database boundary
//!
//! The engine talks to the remote document database exclusively through the
//! [`DocumentStore`] trait:
//! - `get` a single document
//! - `query` a collection with filters, ordering, limit and a start-after cursor
//! - `subscribe` to live changes
//! - `batch_write` an all-or-nothing group of operations
//!
//! Failures are reported as [`BackendError`] carrying a [`BackendCode`]. These
//! raw errors are normalized into [`crate::error::QueryError`] by the
//! resilience layer and never reach engine callers.
//!
//! Available implementations:
//! - [`InMemoryStore`]: in-process store with composite-index simulation,
//!   change broadcasting and fault injection

pub mod document;
pub mod memory;

pub use document::{compare_values, values_equal, Document, DOCUMENT_ID};
pub use memory::{InMemoryStore, StoreOp};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::pin::Pin;

/// Maximum number of operations accepted in one batch write
pub const MAX_BATCH_OPERATIONS: usize = 500;

/// Backend status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendCode {
    Unavailable,
    DeadlineExceeded,
    Aborted,
    ResourceExhausted,
    Internal,
    Unknown,
    Cancelled,
    /// A composite index required by the query is still building
    IndexNotReady,
    Unauthenticated,
    PermissionDenied,
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    AlreadyExists,
    DataLoss,
}

impl fmt::Display for BackendCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unavailable => "unavailable",
            Self::DeadlineExceeded => "deadline-exceeded",
            Self::Aborted => "aborted",
            Self::ResourceExhausted => "resource-exhausted",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
            Self::Cancelled => "cancelled",
            Self::IndexNotReady => "index-not-ready",
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission-denied",
            Self::InvalidArgument => "invalid-argument",
            Self::NotFound => "not-found",
            Self::FailedPrecondition => "failed-precondition",
            Self::AlreadyExists => "already-exists",
            Self::DataLoss => "data-loss",
        };
        f.write_str(name)
    }
}

/// Raw error raised by a [`DocumentStore`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: BackendCode,
    pub message: String,
}

impl BackendError {
    pub fn new<S: Into<String>>(code: BackendCode, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Comparison applied by a [`Filter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum FilterOp {
    Eq(Value),
    /// Also matches documents missing the field
    NotEq(Value),
    In(Vec<Value>),
    Gte(Value),
    Lte(Value),
}

/// Single-field query predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    #[serde(flatten)]
    pub op: FilterOp,
}

impl Filter {
    pub fn eq<S: Into<String>>(field: S, value: Value) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq(value),
        }
    }

    pub fn not_eq<S: Into<String>>(field: S, value: Value) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::NotEq(value),
        }
    }

    pub fn is_in<S: Into<String>>(field: S, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::In(values),
        }
    }

    pub fn gte<S: Into<String>>(field: S, value: Value) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Gte(value),
        }
    }

    pub fn lte<S: Into<String>>(field: S, value: Value) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Lte(value),
        }
    }

    /// Evaluate the predicate against a document
    pub fn matches(&self, doc: &Document) -> bool {
        let value = doc.sort_value(&self.field);
        match (&self.op, value.as_ref()) {
            (FilterOp::Eq(expected), Some(actual)) => values_equal(actual, expected),
            (FilterOp::NotEq(expected), Some(actual)) => !values_equal(actual, expected),
            (FilterOp::NotEq(_), None) => true,
            (FilterOp::In(options), Some(actual)) => {
                options.iter().any(|option| values_equal(actual, option))
            }
            (FilterOp::Gte(bound), Some(actual)) => {
                comparable(actual, bound)
                    && compare_values(Some(actual), Some(bound)) != Ordering::Less
            }
            (FilterOp::Lte(bound), Some(actual)) => {
                comparable(actual, bound)
                    && compare_values(Some(actual), Some(bound)) != Ordering::Greater
            }
            _ => false,
        }
    }
}

fn comparable(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_))
    )
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ascending,
    Descending,
}

/// One ordering term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Query against one collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreQuery {
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    /// Values of the `order_by` fields of the last document already seen
    pub start_after: Option<Vec<Value>>,
}

impl StoreQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filters<I: IntoIterator<Item = Filter>>(mut self, filters: I) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn order_by<S: Into<String>>(mut self, field: S, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, position: Option<Vec<Value>>) -> Self {
        self.start_after = position;
        self
    }

    /// Whether every filter matches the document
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Order two documents by the query's ordering, then by identity
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for order in &self.order_by {
            let ord = compare_values(
                Some(&sort_key(a, &order.field)),
                Some(&sort_key(b, &order.field)),
            );
            let ord = match order.direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id.cmp(&b.id)
    }

    /// Position of a document under this query's ordering
    pub fn position_of(&self, doc: &Document) -> Vec<Value> {
        self.order_by
            .iter()
            .map(|order| sort_key(doc, &order.field))
            .collect()
    }

    /// Whether the document sorts strictly after the given position
    pub fn is_after(&self, doc: &Document, position: &[Value]) -> bool {
        for (i, order) in self.order_by.iter().enumerate() {
            let ord = compare_values(Some(&sort_key(doc, &order.field)), position.get(i));
            let ord = match order.direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord == Ordering::Greater;
            }
        }
        false
    }

    /// Order two positions produced by [`StoreQuery::position_of`]
    pub fn compare_positions(&self, a: &[Value], b: &[Value]) -> Ordering {
        for (i, order) in self.order_by.iter().enumerate() {
            let ord = compare_values(a.get(i), b.get(i));
            let ord = match order.direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Filtered queries ordered on a non-identity field need a composite index
    pub fn needs_composite_index(&self) -> bool {
        !self.filters.is_empty() && self.order_by.iter().any(|o| o.field != DOCUMENT_ID)
    }
}

/// Write operation inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WriteOp {
    /// Create or fully replace a document
    Set {
        collection: String,
        id: String,
        data: Map<String, Value>,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl WriteOp {
    pub fn set(collection: &str, doc: &Document) -> Self {
        Self::Set {
            collection: collection.to_string(),
            id: doc.id.clone(),
            data: doc.data.clone(),
        }
    }
}

/// What a subscription follows
#[derive(Debug, Clone, PartialEq)]
pub enum WatchTarget {
    Document(String),
    Query(StoreQuery),
}

/// Kind of a pushed change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Upserted,
    Removed,
}

/// Change pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub collection: String,
    pub kind: ChangeKind,
    pub document: Document,
}

/// Live stream of changes
pub type DocumentStream = Pin<Box<dyn Stream<Item = DocumentChange> + Send>>;

/// Primitive operations of the remote document database
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document
    async fn get(&self, collection: &str, id: &str) -> BackendResult<Option<Document>>;

    /// Execute a query and return one page of documents
    async fn query(&self, collection: &str, query: &StoreQuery) -> BackendResult<Vec<Document>>;

    /// Open a live stream of changes
    async fn subscribe(&self, collection: &str, target: WatchTarget)
        -> BackendResult<DocumentStream>;

    /// Apply all operations or none
    async fn batch_write(&self, operations: Vec<WriteOp>) -> BackendResult<()>;
}

/// Sort key of a field; a missing field orders as `null` so that positions
/// taken from a document compare equal to the document itself
fn sort_key(doc: &Document, field: &str) -> Value {
    doc.sort_value(field).unwrap_or(Value::Null)
}
