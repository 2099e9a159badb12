//! Preference search and relevance ranking

pub mod pipeline;
pub mod preferences;
pub mod ranking;

pub use pipeline::{ResultSource, SearchPipeline, SearchResults};
pub use preferences::{NumericRange, QueryPreferences};
pub use ranking::{rank_order, RankedResult, Ranker, WeightedRanker};
