// Cluster services: membership, election, replication, dispatch and lifecycle

pub mod cluster;
pub mod dispatcher;
pub mod election;
pub mod event;
pub mod lifecycle;
pub mod registry;
pub mod replication;
pub mod scheduler;

// Re-export commonly used types
pub use cluster::{ClusterCommand, ClusterConfig, ClusterService, CommandReply, CommandResponse};
