//! Configuration access for the cluster core
//!
//! Wraps a layered `config::Config` and turns it into the typed component
//! configurations. Missing keys fall back to defaults; present but invalid
//! values are reported as `ClusterError::Config`.

use std::time::Duration;

use crate::error::{ClusterError, Result};
use crate::model::DispatchPolicy;
use crate::service::cluster::ClusterConfig;
use crate::service::dispatcher::DispatcherConfig;
use crate::service::lifecycle::LifecycleConfig;

pub const CLUSTER_SIZE: &str = "cluster.size";
pub const DISPATCH_POLICY: &str = "dispatch.policy";
pub const DISPATCH_HEALTH_TICK_MS: &str = "dispatch.health_tick_ms";
pub const DISPATCH_MIN_LATENCY_MS: &str = "dispatch.min_latency_ms";
pub const DISPATCH_MAX_LATENCY_MS: &str = "dispatch.max_latency_ms";
pub const LIFECYCLE_DETECTION_DELAY_MS: &str = "lifecycle.detection_delay_ms";
pub const LIFECYCLE_BROADCAST_DELAY_MS: &str = "lifecycle.broadcast_delay_ms";
pub const LIFECYCLE_AUTO_RESTART_MS: &str = "lifecycle.auto_restart_ms";
pub const EVENTS_QUEUE_SIZE: &str = "events.queue_size";
pub const EVENTS_LOG: &str = "events.log";

pub const DEFAULT_CLUSTER_SIZE: i64 = 6;
pub const MAX_CLUSTER_SIZE: i64 = 1024;

/// Layered application configuration
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: config::Config,
}

impl Configuration {
    pub fn from_config(config: config::Config) -> Self {
        Self { config }
    }

    pub fn cluster_size(&self) -> i64 {
        self.config.get_int(CLUSTER_SIZE).unwrap_or(DEFAULT_CLUSTER_SIZE)
    }

    /// Initial dispatch policy (default: round robin)
    pub fn dispatch_policy(&self) -> Result<DispatchPolicy> {
        match self.config.get_string(DISPATCH_POLICY) {
            Ok(value) => value
                .parse()
                .map_err(|e: ClusterError| ClusterError::Config(format!("{}: {}", DISPATCH_POLICY, e))),
            Err(config::ConfigError::NotFound(_)) => Ok(DispatchPolicy::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn health_tick_ms(&self) -> i64 {
        self.config.get_int(DISPATCH_HEALTH_TICK_MS).unwrap_or(5000)
    }

    pub fn min_latency_ms(&self) -> i64 {
        self.config.get_int(DISPATCH_MIN_LATENCY_MS).unwrap_or(20)
    }

    pub fn max_latency_ms(&self) -> i64 {
        self.config.get_int(DISPATCH_MAX_LATENCY_MS).unwrap_or(200)
    }

    pub fn detection_delay_ms(&self) -> i64 {
        self.config.get_int(LIFECYCLE_DETECTION_DELAY_MS).unwrap_or(1000)
    }

    pub fn broadcast_delay_ms(&self) -> i64 {
        self.config.get_int(LIFECYCLE_BROADCAST_DELAY_MS).unwrap_or(500)
    }

    pub fn auto_restart_ms(&self) -> i64 {
        self.config.get_int(LIFECYCLE_AUTO_RESTART_MS).unwrap_or(30_000)
    }

    pub fn event_queue_size(&self) -> i64 {
        self.config.get_int(EVENTS_QUEUE_SIZE).unwrap_or(1024)
    }

    pub fn log_events(&self) -> bool {
        self.config.get_bool(EVENTS_LOG).unwrap_or(true)
    }

    /// Validated cluster configuration
    pub fn cluster_config(&self) -> Result<ClusterConfig> {
        let size = self.cluster_size();
        if !(1..=MAX_CLUSTER_SIZE).contains(&size) {
            return Err(ClusterError::Config(format!(
                "{} must be between 1 and {}, got {}",
                CLUSTER_SIZE, MAX_CLUSTER_SIZE, size
            )));
        }

        let min_latency = millis(DISPATCH_MIN_LATENCY_MS, self.min_latency_ms())?;
        let max_latency = millis(DISPATCH_MAX_LATENCY_MS, self.max_latency_ms())?;
        if min_latency > max_latency {
            return Err(ClusterError::Config(format!(
                "{} must not exceed {}",
                DISPATCH_MIN_LATENCY_MS, DISPATCH_MAX_LATENCY_MS
            )));
        }

        let health_tick_interval = millis(DISPATCH_HEALTH_TICK_MS, self.health_tick_ms())?;
        if health_tick_interval.is_zero() {
            return Err(ClusterError::Config(format!(
                "{} must be positive",
                DISPATCH_HEALTH_TICK_MS
            )));
        }

        let queue_size = self.event_queue_size();
        if queue_size < 1 {
            return Err(ClusterError::Config(format!(
                "{} must be positive, got {}",
                EVENTS_QUEUE_SIZE, queue_size
            )));
        }

        Ok(ClusterConfig {
            size: size as u32,
            dispatcher: DispatcherConfig {
                policy: self.dispatch_policy()?,
                health_tick_interval,
                min_latency,
                max_latency,
            },
            lifecycle: LifecycleConfig {
                detection_delay: millis(LIFECYCLE_DETECTION_DELAY_MS, self.detection_delay_ms())?,
                broadcast_delay: millis(LIFECYCLE_BROADCAST_DELAY_MS, self.broadcast_delay_ms())?,
                auto_restart_timeout: millis(LIFECYCLE_AUTO_RESTART_MS, self.auto_restart_ms())?,
            },
            event_queue_size: queue_size as usize,
            log_events: self.log_events(),
        })
    }
}

fn millis(key: &str, value: i64) -> Result<Duration> {
    u64::try_from(value)
        .map(Duration::from_millis)
        .map_err(|_| ClusterError::Config(format!("{} must not be negative, got {}", key, value)))
}
