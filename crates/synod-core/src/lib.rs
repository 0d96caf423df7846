//! Synod Core - an in-process cluster of stateful members
//!
//! This crate provides:
//! - A node registry with per-member datasets
//! - Coordinator election (highest Active id wins)
//! - Synchronous replication with per-target failure isolation
//! - Load-balanced dispatch of work items
//! - Crash/restart lifecycle with delayed failover and automatic restart

pub mod config;
pub mod error;
pub mod model;
pub mod seed;
pub mod service;

// Re-export commonly used types
pub use crate::config::Configuration;
pub use crate::error::{ClusterError, ErrorKind, Result};
pub use crate::model::{DispatchPolicy, Member, MemberId, MemberStatus, WorkItem};
pub use service::cluster::{
    ClusterCommand, ClusterConfig, ClusterHealthSummary, ClusterService, ClusterSnapshot,
    CommandReply, CommandResponse,
};
pub use service::event::{ClusterEvent, ClusterEventListener};
