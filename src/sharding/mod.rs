//! Regional sharding
//!
//! Documents are partitioned by inferred US region into per-region
//! collections. Queries for specific regions are routed to the partitions
//! that have been migrated; regions without a partition are served from the
//! unsharded source with client-side region filtering.

pub mod migration;
pub mod reader;
pub mod region;
pub mod router;

pub use migration::{
    estimate_scope_reduction, MigrationEvent, MigrationMode, MigrationReport, MigrationStream,
    Migrator,
};
pub use reader::{RouteSummary, RoutedPage, ShardedReader};
pub use region::{region_for_state, Region, RegionInference};
pub use router::{QueryRouter, RegionalRouter, RoutePlan, RouteTarget};
