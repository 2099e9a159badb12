//! Query facade: pagination, cursors, page cache and usage statistics

pub mod cache;
pub mod cursor;
pub mod engine;
pub mod stats;

pub use cache::{CacheStats, PageCache, PageKey};
pub use cursor::{fingerprint, PageCursor};
pub use engine::{
    Page, PageOutcome, PageRequest, QueryEngine, QueryEngineBuilder, QueryFilters, SearchInput,
};
pub use stats::{EndpointUsage, EngineStatistics, UsageEvent, UsageStats};
