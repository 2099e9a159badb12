//! Query routing between regional partitions and the unsharded source

use crate::config::ShardingConfig;
use crate::sharding::Region;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Where one part of a logical query is executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum RouteTarget {
    /// A migrated partition queried in its own collection
    Partition { region: Region, collection: String },
    /// The unsharded source, keeping only documents of these regions
    CrossRegional { regions: BTreeSet<Region> },
    /// The unsharded source without region filtering
    Source,
}

/// Targets of one logical query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutePlan {
    pub targets: Vec<RouteTarget>,
}

impl RoutePlan {
    pub fn source() -> Self {
        Self {
            targets: vec![RouteTarget::Source],
        }
    }

    pub fn partitions(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| matches!(t, RouteTarget::Partition { .. }))
            .count()
    }

    pub fn is_cross_regional(&self) -> bool {
        self.targets
            .iter()
            .any(|t| matches!(t, RouteTarget::CrossRegional { .. }))
    }

    pub fn is_unsharded(&self) -> bool {
        self.targets.iter().any(|t| matches!(t, RouteTarget::Source))
    }
}

/// Maps requested regions to query targets
#[async_trait]
pub trait QueryRouter: Send + Sync {
    /// Plan the targets serving the requested regions
    async fn plan(&self, regions: &BTreeSet<Region>) -> RoutePlan;

    /// Collection holding one partition
    fn partition_collection(&self, region: Region) -> String;

    /// Record whether a partition has been migrated
    async fn set_available(&self, region: Region, available: bool);

    async fn available_partitions(&self) -> BTreeSet<Region>;
}

/// Router backed by the partition-availability table
pub struct RegionalRouter {
    enabled: bool,
    template: String,
    available: RwLock<BTreeSet<Region>>,
}

impl RegionalRouter {
    pub fn new(config: &ShardingConfig) -> Self {
        Self {
            enabled: config.enabled,
            template: config.partition_collection_template.clone(),
            available: RwLock::new(config.available_partitions.iter().copied().collect()),
        }
    }
}

#[async_trait]
impl QueryRouter for RegionalRouter {
    async fn plan(&self, regions: &BTreeSet<Region>) -> RoutePlan {
        if regions.is_empty() {
            return RoutePlan::source();
        }
        if !self.enabled {
            return RoutePlan {
                targets: vec![RouteTarget::CrossRegional {
                    regions: regions.clone(),
                }],
            };
        }

        let available = self.available.read().await;
        let mut targets = Vec::new();
        let mut missing = BTreeSet::new();
        for region in regions {
            if available.contains(region) {
                targets.push(RouteTarget::Partition {
                    region: *region,
                    collection: self.partition_collection(*region),
                });
            } else {
                missing.insert(*region);
            }
        }

        if !missing.is_empty() {
            debug!(?missing, "Partitions unavailable, using cross-regional fallback");
            targets.push(RouteTarget::CrossRegional { regions: missing });
        }
        RoutePlan { targets }
    }

    fn partition_collection(&self, region: Region) -> String {
        self.template.replace("{region}", region.as_str())
    }

    async fn set_available(&self, region: Region, available: bool) {
        let mut partitions = self.available.write().await;
        let changed = if available {
            partitions.insert(region)
        } else {
            partitions.remove(&region)
        };
        if changed {
            info!(%region, available, "Partition availability changed");
        }
    }

    async fn available_partitions(&self) -> BTreeSet<Region> {
        self.available.read().await.clone()
    }
}
