//! Configuration management for the regional query engine
//!
//! Every section has a `Default` matching the production policy, so an empty
//! file is a valid configuration. [`EngineConfig::load`] layers an optional
//! TOML file and `RQE_`-prefixed environment variables (`__` between nested
//! keys, e.g. `RQE_PAGINATION__MAX_PAGE_SIZE=50`).

use crate::error::{QueryError, Result};
use crate::error_recovery::ResilienceConfig;
use crate::sharding::Region;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "RQE";

/// Hard limit of the backend's `IN` operator
pub const BACKEND_MAX_IN_VALUES: usize = 30;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Collection and field names
    pub schema: SchemaConfig,

    /// Circuit breaker and retry policy
    pub resilience: ResilienceConfig,

    /// Regional partitioning and migration
    pub sharding: ShardingConfig,

    /// Relevance ranking
    pub search: SearchConfig,

    /// Page sizes
    pub pagination: PaginationConfig,

    /// Page cache
    pub cache: CacheConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Names of the source collection and of the document fields the engine reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Unsharded source collection
    pub collection: String,
    /// Preferred-group identifier (integer or numeric string)
    pub group_field: String,
    pub category_field: String,
    /// Numeric field matched against the preference range
    pub numeric_field: String,
    /// Recency field (epoch milliseconds or RFC 3339)
    pub timestamp_field: String,
    /// Soft-delete flag
    pub deleted_field: String,
    /// Explicit partition name
    pub region_field: String,
    /// Two-letter state code or full state name
    pub state_field: String,
    /// Free-form location such as `"Albany, NY"`
    pub location_field: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            collection: "jobs".to_string(),
            group_field: "local".to_string(),
            category_field: "constructionType".to_string(),
            numeric_field: "hours".to_string(),
            timestamp_field: "timestamp".to_string(),
            deleted_field: "deleted".to_string(),
            region_field: "region".to_string(),
            state_field: "state".to_string(),
            location_field: "location".to_string(),
        }
    }
}

/// Regional sharding configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Route regional queries to partitions
    pub enabled: bool,
    /// Partitions known to be migrated at startup
    pub available_partitions: Vec<Region>,
    /// Partition collection path; `{region}` is replaced by the partition name
    pub partition_collection_template: String,
    /// Documents read and written per migration batch
    pub migration_batch_size: usize,
    /// Source windows read by one cross-regional fallback scan
    pub max_fallback_scan_batches: usize,
    /// Documents per fallback scan window
    pub fallback_scan_window: usize,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            available_partitions: Vec::new(),
            partition_collection_template: "jobs_regions/{region}/jobs".to_string(),
            migration_batch_size: crate::storage::MAX_BATCH_OPERATIONS,
            max_fallback_scan_batches: 10,
            fallback_scan_window: 100,
        }
    }
}

/// Relevance weights and recency windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevanceWeights {
    pub group: i64,
    pub category: i64,
    pub numeric_range: i64,
    pub requirement: i64,
    pub short_recency_bonus: i64,
    #[serde(with = "humantime_serde")]
    pub short_recency_window: Duration,
    pub medium_recency_bonus: i64,
    #[serde(with = "humantime_serde")]
    pub medium_recency_window: Duration,
}

impl Default for RelevanceWeights {
    fn default() -> Self {
        Self {
            group: 100,
            category: 50,
            numeric_range: 30,
            requirement: 20,
            short_recency_bonus: 10,
            short_recency_window: Duration::from_secs(24 * 60 * 60),
            medium_recency_bonus: 5,
            medium_recency_window: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Which preference criteria discard non-matching items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementPolicy {
    pub categories: bool,
    pub numeric_range: bool,
    pub required_flags: bool,
}

impl Default for RefinementPolicy {
    fn default() -> Self {
        Self {
            categories: true,
            numeric_range: true,
            required_flags: true,
        }
    }
}

/// Search and ranking configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Score and order results; when false results keep recency order
    pub ranking_enabled: bool,
    pub weights: RelevanceWeights,
    /// Primary query fetches `limit * overfetch` items before refinement
    pub overfetch: usize,
    /// Largest value list sent in one `IN` filter
    pub max_in_values: usize,
    pub refinement: RefinementPolicy,
    /// Top up short primary results with recency items
    pub top_up: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            ranking_enabled: true,
            weights: RelevanceWeights::default(),
            overfetch: 3,
            max_in_values: 10,
            refinement: RefinementPolicy::default(),
            top_up: true,
        }
    }
}

/// Pagination configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    /// Size used when a request asks for 0 items
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

/// Page cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: Duration::from_secs(30),
            max_entries: 256,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of plain text
    pub json_format: bool,
    /// Daily-rotated log file
    pub file: Option<PathBuf>,
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            file: None,
            stderr: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(QueryError::config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("sharding.available_partitions"),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(source)
            .map_err(|e| QueryError::config(format!("invalid TOML configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| QueryError::config(format!("cannot render configuration: {e}")))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.schema.collection.trim().is_empty() {
            return Err(QueryError::config("schema.collection cannot be empty"));
        }

        let pagination = &self.pagination;
        if pagination.default_page_size == 0 {
            return Err(QueryError::config(
                "pagination.default_page_size must be greater than zero",
            ));
        }
        if pagination.max_page_size < pagination.default_page_size {
            return Err(QueryError::config(
                "pagination.max_page_size must be at least default_page_size",
            ));
        }

        let retry = &self.resilience.retry_policy;
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(QueryError::config(
                "resilience.retry_policy.multiplier must be a finite value >= 1.0",
            ));
        }
        if retry.base_delay > retry.max_delay {
            return Err(QueryError::config(
                "resilience.retry_policy.base_delay cannot exceed max_delay",
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter.factor) {
            return Err(QueryError::config(
                "resilience.retry_policy.jitter.factor must be between 0.0 and 1.0",
            ));
        }
        if matches!(retry.attempt_timeout, Some(t) if t.is_zero()) {
            return Err(QueryError::config(
                "resilience.retry_policy.attempt_timeout must be greater than zero",
            ));
        }
        if self.resilience.circuit_breaker.failure_threshold == 0
            || self
                .resilience
                .endpoints
                .values()
                .any(|o| o.failure_threshold == Some(0))
        {
            return Err(QueryError::config(
                "circuit breaker failure_threshold must be at least 1",
            ));
        }

        let sharding = &self.sharding;
        if !sharding.partition_collection_template.contains("{region}") {
            return Err(QueryError::config(
                "sharding.partition_collection_template must contain '{region}'",
            ));
        }
        if sharding.migration_batch_size == 0
            || sharding.migration_batch_size > crate::storage::MAX_BATCH_OPERATIONS
        {
            return Err(QueryError::config(format!(
                "sharding.migration_batch_size must be between 1 and {}",
                crate::storage::MAX_BATCH_OPERATIONS
            )));
        }
        if sharding.max_fallback_scan_batches == 0 || sharding.fallback_scan_window == 0 {
            return Err(QueryError::config(
                "sharding fallback scan budget must be greater than zero",
            ));
        }

        let search = &self.search;
        if search.overfetch == 0 {
            return Err(QueryError::config("search.overfetch must be at least 1"));
        }
        if search.max_in_values == 0 || search.max_in_values > BACKEND_MAX_IN_VALUES {
            return Err(QueryError::config(format!(
                "search.max_in_values must be between 1 and {BACKEND_MAX_IN_VALUES}"
            )));
        }
        if search.weights.short_recency_window > search.weights.medium_recency_window {
            return Err(QueryError::config(
                "search.weights.short_recency_window cannot exceed medium_recency_window",
            ));
        }

        if self.cache.enabled && (self.cache.max_entries == 0 || self.cache.ttl.is_zero()) {
            return Err(QueryError::config(
                "cache.max_entries and cache.ttl must be non-zero when caching is enabled",
            ));
        }

        Ok(())
    }
}
