//! Custom Resource Definitions for the Cassandra operator.

mod cluster;
pub mod topology;

pub use cluster::{
    ActionKind, ActionStatus, CassandraCluster, CassandraClusterSpec, CassandraClusterStatus,
    ClusterPhase, Dc, LastAction, OperationName, PodLastOperation, Rack, RackStatus,
    ResourceRequirements, ResourceSpec, Topology,
};
pub use topology::{ANNOTATION_LAST_APPLIED, dc_rack_name, merge_seed_list};
