//! Cassandra Kubernetes Operator
//!
//! This crate provides a Kubernetes operator that runs Apache Cassandra
//! clusters as one StatefulSet per datacenter/rack pair and drives topology
//! changes (scaling, seed list updates, image or configuration rollouts) one
//! rack and one node at a time.
//!
//! # Custom Resource Definitions
//!
//! - **CassandraCluster**: a Cassandra cluster spread over datacenters and racks
//!
//! # Example
//!
//! ```yaml
//! apiVersion: db.orange.com/v1alpha1
//! kind: CassandraCluster
//! metadata:
//!   name: demo
//! spec:
//!   nodesPerRacks: 3
//!   baseImage: cassandra
//!   version: "3.11"
//!   dataCapacity: 10Gi
//!   autoPilot: true
//!   topology:
//!     dc:
//!       - name: dc1
//!         rack:
//!           - name: rack1
//!           - name: rack2
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod node_control;
pub mod resources;
pub mod store;
pub mod testing;

pub use config::OperatorConfig;
pub use crd::{CassandraCluster, CassandraClusterSpec, CassandraClusterStatus};
pub use error::{OperatorError, OperatorResult};
