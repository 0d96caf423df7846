//! Dispatcher: load-balanced routing of work items to Active members
//!
//! Provides four selection policies over the Active member list and keeps
//! per-member load metrics up to date.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ClusterError, Result};
use crate::model::{DispatchPolicy, Member, MemberId, Mutation, WorkItem};

use super::registry::NodeRegistry;

pub const MIN_WEIGHT: f64 = 0.1;
pub const MAX_WEIGHT: f64 = 10.0;

/// Smoothing factor for the latency moving average
const LATENCY_ALPHA: f64 = 0.2;

/// Response-time penalty per in-flight request
const CONGESTION_FACTOR: f64 = 0.1;

/// Dispatcher configuration
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Initial selection policy
    pub policy: DispatchPolicy,
    /// Period of the background health tick
    pub health_tick_interval: Duration,
    /// Simulated processing latency lower bound
    pub min_latency: Duration,
    /// Simulated processing latency upper bound
    pub max_latency: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            policy: DispatchPolicy::RoundRobin,
            health_tick_interval: Duration::from_millis(5000),
            min_latency: Duration::from_millis(20),
            max_latency: Duration::from_millis(200),
        }
    }
}

/// Load metrics for one member
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMetrics {
    pub active_requests: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
    /// Exponential moving average of completion latency in milliseconds
    pub avg_latency_ms: f64,
    pub weight: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub health_score: f64,
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self {
            active_requests: 0,
            total_requests: 0,
            failed_requests: 0,
            avg_latency_ms: 0.0,
            weight: 1.0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            health_score: 100.0,
        }
    }
}

impl DispatchMetrics {
    /// Latency adjusted for the current number of in-flight requests
    pub fn response_score(&self) -> f64 {
        self.avg_latency_ms * (1.0 + self.active_requests as f64 * CONGESTION_FACTOR)
    }

    fn record_completion(&mut self, sample_ms: f64) {
        self.active_requests = self.active_requests.saturating_sub(1);
        self.avg_latency_ms = self.avg_latency_ms * (1.0 - LATENCY_ALPHA) + sample_ms * LATENCY_ALPHA;
    }
}

/// Metrics of one member as exposed in snapshots
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDispatchStats {
    pub member_id: MemberId,
    #[serde(flatten)]
    pub metrics: DispatchMetrics,
}

/// A work item that was accepted by a member
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatched {
    pub member_id: MemberId,
    pub mutation: Mutation,
}

/// Dispatcher
pub struct Dispatcher {
    registry: Arc<NodeRegistry>,
    config: DispatcherConfig,
    policy: RwLock<DispatchPolicy>,
    metrics: Arc<DashMap<MemberId, DispatchMetrics>>,
    round_robin_index: AtomicUsize,
    order_sequence: AtomicU64,
    rng: Arc<Mutex<StdRng>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("policy", &*self.policy.read())
            .field("members", &self.metrics.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<NodeRegistry>, config: DispatcherConfig) -> Self {
        Self::with_rng(registry, config, StdRng::from_os_rng())
    }

    /// Create a dispatcher with a deterministic random source
    pub fn with_seed(registry: Arc<NodeRegistry>, config: DispatcherConfig, seed: u64) -> Self {
        Self::with_rng(registry, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(registry: Arc<NodeRegistry>, config: DispatcherConfig, rng: StdRng) -> Self {
        let metrics = DashMap::new();
        for id in registry.ids() {
            metrics.insert(id, DispatchMetrics::default());
        }

        Self {
            registry,
            policy: RwLock::new(config.policy),
            config,
            metrics: Arc::new(metrics),
            round_robin_index: AtomicUsize::new(0),
            order_sequence: AtomicU64::new(0),
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn policy(&self) -> DispatchPolicy {
        *self.policy.read()
    }

    pub fn set_policy(&self, policy: DispatchPolicy) {
        let mut current = self.policy.write();
        if *current != policy {
            debug!("Dispatch policy changed {} -> {}", *current, policy);
            *current = policy;
        }
    }

    /// Set a member's weight, clamped to `[0.1, 10]`. Returns the applied weight.
    pub fn set_weight(&self, id: MemberId, weight: f64) -> Result<f64> {
        if !weight.is_finite() {
            return Err(ClusterError::InvalidArgument(format!(
                "weight must be a finite number, got {}",
                weight
            )));
        }
        let clamped = weight.clamp(MIN_WEIGHT, MAX_WEIGHT);
        let mut entry = self
            .metrics
            .get_mut(&id)
            .ok_or(ClusterError::MemberNotFound(id))?;
        entry.weight = clamped;
        Ok(clamped)
    }

    pub fn metrics(&self, id: MemberId) -> Option<DispatchMetrics> {
        self.metrics.get(&id).map(|e| e.value().clone())
    }

    /// Metrics of every member, ascending by id
    pub fn stats(&self) -> Vec<MemberDispatchStats> {
        let mut stats: Vec<MemberDispatchStats> = self
            .metrics
            .iter()
            .map(|e| MemberDispatchStats {
                member_id: *e.key(),
                metrics: e.value().clone(),
            })
            .collect();
        stats.sort_by_key(|s| s.member_id);
        stats
    }

    /// Pick an Active member according to the current policy
    pub fn select_member(&self) -> Result<Member> {
        let id = self.select_member_id()?;
        self.registry.find(id)
    }

    pub fn select_member_id(&self) -> Result<MemberId> {
        let active = self.registry.active_ids();
        self.select_from(&active)
    }

    fn select_from(&self, active: &[MemberId]) -> Result<MemberId> {
        if active.is_empty() {
            return Err(ClusterError::NoAvailableMembers);
        }

        let selected = match self.policy() {
            DispatchPolicy::RoundRobin => {
                // Position in the current Active list, not a fixed identity
                let index = self.round_robin_index.fetch_add(1, Ordering::SeqCst);
                active[index % active.len()]
            }
            DispatchPolicy::LeastConnections => {
                self.arg_min(active, |m| m.active_requests as f64)
            }
            DispatchPolicy::Weighted => self.weighted_pick(active),
            DispatchPolicy::LeastResponseTime => self.arg_min(active, DispatchMetrics::response_score),
        };

        Ok(selected)
    }

    /// First member with the smallest score; ties keep the lower id
    fn arg_min(&self, active: &[MemberId], score: impl Fn(&DispatchMetrics) -> f64) -> MemberId {
        let mut best = active[0];
        let mut best_score = f64::INFINITY;
        for id in active {
            let value = self.metrics.get(id).map(|m| score(m.value())).unwrap_or(0.0);
            if value < best_score {
                best = *id;
                best_score = value;
            }
        }
        best
    }

    fn weighted_pick(&self, active: &[MemberId]) -> MemberId {
        let weights: Vec<(MemberId, f64)> = active
            .iter()
            .map(|id| (*id, self.metrics.get(id).map(|m| m.weight).unwrap_or(1.0)))
            .collect();

        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        let draw = self.rng.lock().random::<f64>() * total;

        let mut cumulative = 0.0;
        for (id, weight) in &weights {
            cumulative += weight;
            if draw < cumulative {
                return *id;
            }
        }

        // Rounding at the upper edge
        weights[weights.len() - 1].0
    }

    /// Route a work item to a member and apply it there.
    ///
    /// Business-rule rejections happen before anything is written. On success
    /// a completion is scheduled after a simulated processing latency; this
    /// needs a Tokio runtime, without one the completion is recorded inline.
    pub fn dispatch(&self, work: &WorkItem) -> Result<Dispatched> {
        let policy = self.policy();
        let member_id = self.select_member_id()?;
        self.begin_request(member_id);

        let order_id = format!(
            "ord-{}",
            self.order_sequence.fetch_add(1, Ordering::SeqCst) + 1
        );
        let now = chrono::Utc::now().timestamp_millis();

        let applied = self
            .registry
            .with_member_mut(member_id, |member| {
                if !member.is_active() {
                    return Err(ClusterError::MemberUnavailable(member_id));
                }
                member.dataset.execute(work, &order_id, now)
            })
            .and_then(|r| r);

        match applied {
            Ok(mutation) => {
                metrics::counter!("synod_dispatch_total", "policy" => policy.as_str()).increment(1);
                debug!(
                    "Dispatched {} {} to {} via {}",
                    mutation.operation,
                    mutation.entity.kind(),
                    member_id,
                    policy
                );
                self.schedule_completion(member_id);
                Ok(Dispatched {
                    member_id,
                    mutation,
                })
            }
            Err(e) => {
                metrics::counter!("synod_dispatch_rejected_total").increment(1);
                warn!("Work rejected on {}: {}", member_id, e);
                self.fail_request(member_id);
                Err(e)
            }
        }
    }

    fn begin_request(&self, id: MemberId) {
        let mut entry = self.metrics.entry(id).or_default();
        entry.active_requests += 1;
        entry.total_requests += 1;
    }

    fn fail_request(&self, id: MemberId) {
        if let Some(mut entry) = self.metrics.get_mut(&id) {
            entry.active_requests = entry.active_requests.saturating_sub(1);
            entry.failed_requests += 1;
        }
    }

    fn sample_latency(&self) -> Duration {
        let min = self.config.min_latency.as_millis() as u64;
        let max = (self.config.max_latency.as_millis() as u64).max(min);
        Duration::from_millis(self.rng.lock().random_range(min..=max))
    }

    fn schedule_completion(&self, id: MemberId) {
        let latency = self.sample_latency();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let metrics = self.metrics.clone();
                handle.spawn(async move {
                    let started = tokio::time::Instant::now();
                    tokio::time::sleep(latency).await;
                    let sample = started.elapsed().as_secs_f64() * 1000.0;
                    if let Some(mut entry) = metrics.get_mut(&id) {
                        entry.record_completion(sample);
                    }
                });
            }
            Err(_) => self.complete(id, latency.as_secs_f64() * 1000.0),
        }
    }

    /// Record a finished request on `id` with the observed latency
    pub fn complete(&self, id: MemberId, sample_ms: f64) {
        if let Some(mut entry) = self.metrics.get_mut(&id) {
            entry.record_completion(sample_ms);
        }
    }

    /// Recompute simulated CPU, memory and health for every Active member
    pub fn health_tick(&self) {
        for id in self.registry.active_ids() {
            let (cpu_jitter, memory_jitter) = {
                let mut rng = self.rng.lock();
                (rng.random_range(0.0..20.0), rng.random_range(0.0..10.0))
            };

            if let Some(mut entry) = self.metrics.get_mut(&id) {
                let load = entry.active_requests as f64;
                entry.cpu_usage = (load * 10.0 + cpu_jitter).min(100.0);
                entry.memory_usage = (30.0 + load * 5.0 + memory_jitter).min(100.0);
                entry.health_score = (100.0 - (entry.cpu_usage + entry.memory_usage) / 2.0).max(0.0);
            }
        }
    }
}
