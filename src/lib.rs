//! Resilient regional query engine
//!
//! A data-access layer between application code and a remote, eventually
//! consistent document database. It serves paginated, filtered and ranked
//! reads under unreliable network conditions.
//!
//! # Features
//!
//! - Per-endpoint circuit breakers and bounded exponential retry
//! - Regional partitions with deterministic fallback to the unsharded source
//! - Resumable, non-destructive partition migration with dry-run
//! - Relevance-ranked search that degrades to a recency fallback
//! - Opaque pagination cursors bound to their filter set
//!
//! ```no_run
//! use regional_query_engine::{EngineConfig, InMemoryStore, PageRequest, QueryEngine};
//! use std::sync::Arc;
//!
//! # async fn demo() -> regional_query_engine::Result<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let engine = QueryEngine::new(EngineConfig::default(), store)?;
//! let page = engine.get_page(PageRequest::default()).await?;
//! println!("{} items, more: {}", page.items.len(), page.has_more);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod error_recovery;
pub mod logging;
pub mod query;
pub mod search;
pub mod sharding;
pub mod storage;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use error::{ErrorKind, ErrorReason, QueryError, Result};
pub use query::{
    EngineStatistics, Page, PageOutcome, PageRequest, QueryEngine, QueryEngineBuilder,
    QueryFilters, SearchInput,
};
pub use search::{QueryPreferences, RankedResult, ResultSource, SearchResults};
pub use sharding::{MigrationEvent, MigrationMode, MigrationReport, Region};
pub use storage::{Document, DocumentStore, Filter, InMemoryStore};
