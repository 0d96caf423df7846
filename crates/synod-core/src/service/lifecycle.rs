//! Lifecycle controller
//!
//! Crash and restart transitions. A coordinator crash goes through two
//! deliberate delays before the new coordinator is announced:
//!
//! ```text
//! crash(id) ──detection delay──► re-election ──broadcast delay──► CoordinatorElected
//!     └──────────────auto-restart timeout──────────────► restart(id)
//! ```
//!
//! Every delayed step is a keyed task in the [`TaskScheduler`], so a manual
//! restart cancels the pending auto-restart of that member and nothing else.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};
use crate::model::{Member, MemberId, MemberStatus};

use super::election::{CoordinatorElection, ElectionOutcome};
use super::event::{ClusterEvent, ClusterEventPublisher};
use super::registry::NodeRegistry;
use super::replication::ReplicationEngine;
use super::scheduler::{TaskKey, TaskScheduler};

/// Lifecycle timing configuration
#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    /// Time between a coordinator crash and the re-election
    pub detection_delay: Duration,
    /// Time between the re-election and the coordinator announcement
    pub broadcast_delay: Duration,
    /// A crashed member restarts itself after this long
    pub auto_restart_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            detection_delay: Duration::from_millis(1000),
            broadcast_delay: Duration::from_millis(500),
            auto_restart_timeout: Duration::from_millis(30_000),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartTrigger {
    Manual,
    Automatic,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashOutcome {
    pub member: Member,
    pub was_coordinator: bool,
    /// Whether a re-election is pending
    pub failover_scheduled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartOutcome {
    pub member: Member,
    pub trigger: RestartTrigger,
    /// Coordinator the dataset was copied from, if any
    pub synced_from: Option<MemberId>,
    pub synced_entities: usize,
    pub election: Option<ElectionOutcome>,
}

/// Lifecycle controller
#[derive(Clone)]
pub struct LifecycleController {
    registry: Arc<NodeRegistry>,
    election: Arc<CoordinatorElection>,
    replication: Arc<ReplicationEngine>,
    events: Arc<ClusterEventPublisher>,
    scheduler: TaskScheduler,
    config: LifecycleConfig,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<NodeRegistry>,
        election: Arc<CoordinatorElection>,
        replication: Arc<ReplicationEngine>,
        events: Arc<ClusterEventPublisher>,
        scheduler: TaskScheduler,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            registry,
            election,
            replication,
            events,
            scheduler,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Take a member down.
    ///
    /// Rejected with `AlreadyCrashed` when the member is not Active. If the
    /// member was coordinator, re-election runs after the detection delay.
    /// An automatic restart is scheduled in every case.
    pub async fn crash(&self, id: MemberId) -> Result<CrashOutcome> {
        let change = self
            .registry
            .transition(id, MemberStatus::Active, MemberStatus::Crashed)?;

        if change.was_coordinator {
            self.election.forget_coordinator(id);
        }
        self.record_active_members();
        info!(
            "Member {} crashed{}",
            id,
            if change.was_coordinator { " (was coordinator)" } else { "" }
        );

        self.events
            .publish(ClusterEvent::member_status_changed(
                id,
                MemberStatus::Crashed,
                false,
                change.previous,
            ))
            .await;

        if change.was_coordinator {
            let controller = self.clone();
            self.scheduler
                .schedule(TaskKey::failover(id), self.config.detection_delay, async move {
                    controller.fail_over(id).await;
                });
        }

        let controller = self.clone();
        self.scheduler.schedule(
            TaskKey::auto_restart(id),
            self.config.auto_restart_timeout,
            async move {
                match controller.restart_with(id, RestartTrigger::Automatic).await {
                    Ok(_) => info!("Member {} restarted automatically", id),
                    Err(e) => debug!("Automatic restart of {} skipped: {}", id, e),
                }
            },
        );

        Ok(CrashOutcome {
            member: change.member,
            was_coordinator: change.was_coordinator,
            failover_scheduled: change.was_coordinator,
        })
    }

    /// Bring a crashed member back manually, cancelling its automatic restart
    pub async fn restart(&self, id: MemberId) -> Result<RestartOutcome> {
        self.restart_with(id, RestartTrigger::Manual).await
    }

    async fn restart_with(&self, id: MemberId, trigger: RestartTrigger) -> Result<RestartOutcome> {
        let change = self
            .registry
            .transition(id, MemberStatus::Crashed, MemberStatus::Active)?;

        if self.scheduler.cancel(TaskKey::auto_restart(id)) {
            debug!("Cancelled automatic restart of {}", id);
        }
        // The restart election below supersedes a pending failover
        self.scheduler.cancel(TaskKey::failover(id));
        self.record_active_members();
        info!("Member {} restarted ({:?})", id, trigger);

        self.events
            .publish(ClusterEvent::member_status_changed(
                id,
                MemberStatus::Active,
                false,
                change.previous,
            ))
            .await;

        let (synced_from, synced_entities) = match self.election.current_coordinator() {
            Some(coordinator) if coordinator.id != id => {
                match self.replication.sync_with_leader(id, coordinator.id) {
                    Ok(size) => (Some(coordinator.id), size),
                    Err(e) => {
                        warn!("Failed to sync {} from {}: {}", id, coordinator.id, e);
                        (None, 0)
                    }
                }
            }
            _ => {
                debug!("No coordinator to sync {} from", id);
                (None, 0)
            }
        };

        let election = match self.election.start_election(id) {
            Ok(outcome) => {
                if let Some(coordinator) = outcome.coordinator() {
                    self.events
                        .publish(ClusterEvent::coordinator_elected(coordinator))
                        .await;
                }
                Some(outcome)
            }
            Err(e) => {
                warn!("Election after restart of {} failed: {}", id, e);
                None
            }
        };

        let member = self.registry.find(id)?;
        Ok(RestartOutcome {
            member,
            trigger,
            synced_from,
            synced_entities,
            election,
        })
    }

    /// Re-elect after a coordinator crash and schedule the announcement
    async fn fail_over(&self, crashed: MemberId) {
        match self.election.on_member_crashed(crashed) {
            Ok(ElectionOutcome::Elected { coordinator, .. }) => {
                info!("Failover after {} crash elected {}", crashed, coordinator);
                let controller = self.clone();
                self.scheduler.schedule(
                    TaskKey::coordinator_broadcast(),
                    self.config.broadcast_delay,
                    async move {
                        controller.broadcast_coordinator().await;
                    },
                );
            }
            Ok(ElectionOutcome::AlreadyInProgress) => {
                debug!("Failover after {} crash deferred to the running election", crashed);
            }
            Err(ClusterError::NoActiveMembers) => {
                warn!("Failover after {} crash found no active members", crashed);
            }
            Err(e) => warn!("Failover after {} crash failed: {}", crashed, e),
        }
    }

    /// Announce whoever is coordinator now
    async fn broadcast_coordinator(&self) {
        match self.election.current_coordinator() {
            Some(coordinator) => {
                self.events
                    .publish(ClusterEvent::coordinator_elected(coordinator.id))
                    .await;
            }
            None => debug!("No coordinator to broadcast"),
        }
    }

    fn record_active_members(&self) {
        metrics::gauge!("synod_members_active").set(self.registry.active_ids().len() as f64);
    }
}
