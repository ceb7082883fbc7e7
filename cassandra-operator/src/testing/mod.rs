//! Test doubles for the controller.
//!
//! The controller reaches the outside world through two seams:
//! [`crate::store::ObjectStore`] for Kubernetes objects and
//! [`crate::node_control::NodeControlFactory`] for Cassandra nodes. This
//! module provides in-memory implementations of both, plus fixtures to seed
//! them, so whole reconcile passes run without a cluster.
//!
//! # Example
//!
//! ```
//! use cassandra_operator::testing::{FakeNodeFactory, MemoryStore, MockClock, fixtures};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let nodes = Arc::new(FakeNodeFactory::default());
//! let clock = Arc::new(MockClock::default());
//!
//! let cc = fixtures::cluster("demo", 3, &[("dc1", &["rack1"])]);
//! store.insert(fixtures::NAMESPACE, &cc);
//! let ctx = fixtures::context(store, nodes, clock);
//! assert_eq!(ctx.config.operator_name, fixtures::OPERATOR_NAME);
//! ```

pub mod fixtures;
mod nodes;
mod store;

pub use crate::clock::MockClock;
pub use nodes::{FakeNodeControl, FakeNodeFactory, NodeCall};
pub use store::MemoryStore;
