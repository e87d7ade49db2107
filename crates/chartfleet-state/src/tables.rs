//! redb table definitions for the chartfleet resource store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized objects).
//! Keys follow the pattern `{namespace}/{name}`, so a namespace is a prefix scan.

use redb::TableDefinition;

/// Clusters keyed by `{namespace}/{name}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Chart deployments keyed by `{namespace}/{name}`.
pub const CHART_DEPLOYMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("chart_deployments");

/// Per-cluster releases keyed by `{namespace}/{name}`.
pub const CLUSTER_RELEASES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("cluster_releases");

/// Every table the store creates on open.
pub const ALL_TABLES: [TableDefinition<&str, &[u8]>; 3] =
    [CLUSTERS, CHART_DEPLOYMENTS, CLUSTER_RELEASES];
