// Cluster service
// Owns the cluster context and routes inbound commands to the components

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{info, warn};

use crate::error::{ClusterError, ErrorKind, Result};
use crate::model::{Dataset, DispatchPolicy, MemberId, MemberStatus, Mutation, WorkItem};
use crate::seed::seed_dataset;

use super::dispatcher::{Dispatcher, DispatcherConfig, MemberDispatchStats};
use super::election::{CoordinatorElection, ElectionOutcome, ElectionState};
use super::event::{ClusterEvent, ClusterEventPublisher, LoggingEventListener};
use super::lifecycle::{CrashOutcome, LifecycleConfig, LifecycleController, RestartOutcome};
use super::registry::NodeRegistry;
use super::replication::{ConsistencyReport, ReplicationEngine, ReplicationReport};
use super::scheduler::{TaskKey, TaskScheduler};

/// Cluster configuration
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Members are created with ids `1..=size`
    pub size: u32,
    pub dispatcher: DispatcherConfig,
    pub lifecycle: LifecycleConfig,
    /// Capacity of the event broadcast channel
    pub event_queue_size: usize,
    /// Register the logging listener on start
    pub log_events: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            size: 6,
            dispatcher: DispatcherConfig::default(),
            lifecycle: LifecycleConfig::default(),
            event_queue_size: 1024,
            log_events: true,
        }
    }
}

/// Inbound command
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClusterCommand {
    #[serde(rename_all = "camelCase")]
    CrashMember { member_id: MemberId },
    #[serde(rename_all = "camelCase")]
    RestartMember { member_id: MemberId },
    PlaceWork { work: WorkItem },
    #[serde(rename_all = "camelCase")]
    TriggerElection { initiator_id: MemberId },
    SetPolicy { policy: DispatchPolicy },
    #[serde(rename_all = "camelCase")]
    SetWeight { member_id: MemberId, weight: f64 },
    GetState,
    CheckConsistency,
    #[serde(rename_all = "camelCase")]
    SyncMember { member_id: MemberId },
}

impl ClusterCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterCommand::CrashMember { .. } => "crash_member",
            ClusterCommand::RestartMember { .. } => "restart_member",
            ClusterCommand::PlaceWork { .. } => "place_work",
            ClusterCommand::TriggerElection { .. } => "trigger_election",
            ClusterCommand::SetPolicy { .. } => "set_policy",
            ClusterCommand::SetWeight { .. } => "set_weight",
            ClusterCommand::GetState => "get_state",
            ClusterCommand::CheckConsistency => "check_consistency",
            ClusterCommand::SyncMember { .. } => "sync_member",
        }
    }
}

/// Accepted work item with its replication outcome
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkReceipt {
    pub member_id: MemberId,
    pub mutation: Mutation,
    pub replication: ReplicationReport,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReceipt {
    pub member_id: MemberId,
    pub coordinator_id: MemberId,
    pub entities: usize,
}

/// Successful command result
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CommandReply {
    Crashed(CrashOutcome),
    Restarted(RestartOutcome),
    WorkAccepted(WorkReceipt),
    Election(ElectionOutcome),
    #[serde(rename_all = "camelCase")]
    PolicySet { policy: DispatchPolicy },
    #[serde(rename_all = "camelCase")]
    WeightSet { member_id: MemberId, weight: f64 },
    State(Box<ClusterSnapshot>),
    Consistency(ConsistencyReport),
    Synced(SyncReceipt),
}

/// Command outcome as reported to the caller
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandResponse {
    Ok { reply: CommandReply },
    Rejected {
        code: String,
        kind: ErrorKind,
        reason: String,
    },
}

impl CommandResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandResponse::Ok { .. })
    }
}

impl From<Result<CommandReply>> for CommandResponse {
    fn from(result: Result<CommandReply>) -> Self {
        match result {
            Ok(reply) => CommandResponse::Ok { reply },
            Err(e) => CommandResponse::Rejected {
                code: e.reason_code().to_string(),
                kind: e.kind(),
                reason: e.to_string(),
            },
        }
    }
}

/// A member as shown in snapshots
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberView {
    pub id: MemberId,
    pub status: MemberStatus,
    pub is_coordinator: bool,
    pub entity_count: usize,
    pub dataset: Dataset,
    pub status_changed_at: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealthSummary {
    pub total: usize,
    pub active: usize,
    pub crashed: usize,
}

impl ClusterHealthSummary {
    pub fn is_healthy(&self) -> bool {
        self.active > self.total / 2
    }
}

/// Point-in-time view of the whole cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub members: Vec<MemberView>,
    pub coordinator_id: Option<MemberId>,
    pub election: ElectionState,
    pub policy: DispatchPolicy,
    pub dispatch: Vec<MemberDispatchStats>,
    pub health: ClusterHealthSummary,
    pub taken_at: i64,
}

/// Cluster service
///
/// Cheap to clone; every clone drives the same cluster.
#[derive(Clone)]
pub struct ClusterService {
    config: ClusterConfig,
    registry: Arc<NodeRegistry>,
    election: Arc<CoordinatorElection>,
    replication: Arc<ReplicationEngine>,
    dispatcher: Arc<Dispatcher>,
    lifecycle: LifecycleController,
    events: Arc<ClusterEventPublisher>,
    scheduler: TaskScheduler,
    running: Arc<RwLock<bool>>,
}

impl ClusterService {
    /// Build a cluster where every member starts from the seed dataset
    pub fn new(config: ClusterConfig) -> Result<Self> {
        Self::with_dataset(config, seed_dataset())
    }

    pub fn with_dataset(config: ClusterConfig, dataset: Dataset) -> Result<Self> {
        Self::build(config, dataset, Dispatcher::new)
    }

    /// Like [`ClusterService::with_dataset`] with a deterministic dispatcher
    pub fn with_dispatch_seed(config: ClusterConfig, dataset: Dataset, seed: u64) -> Result<Self> {
        Self::build(config, dataset, |registry, config| {
            Dispatcher::with_seed(registry, config, seed)
        })
    }

    fn build(
        config: ClusterConfig,
        dataset: Dataset,
        dispatcher: impl FnOnce(Arc<NodeRegistry>, DispatcherConfig) -> Dispatcher,
    ) -> Result<Self> {
        if config.size == 0 {
            return Err(ClusterError::Config("cluster size must be at least 1".to_string()));
        }

        let registry = Arc::new(NodeRegistry::new((1..=config.size).map(MemberId), &dataset));
        let election = Arc::new(CoordinatorElection::new(registry.clone()));
        let replication = Arc::new(ReplicationEngine::new(registry.clone()));
        let dispatcher = Arc::new(dispatcher(registry.clone(), config.dispatcher.clone()));
        let events = Arc::new(ClusterEventPublisher::new(config.event_queue_size));
        let scheduler = TaskScheduler::new();
        let lifecycle = LifecycleController::new(
            registry.clone(),
            election.clone(),
            replication.clone(),
            events.clone(),
            scheduler.clone(),
            config.lifecycle.clone(),
        );

        Ok(Self {
            config,
            registry,
            election,
            replication,
            dispatcher,
            lifecycle,
            events,
            scheduler,
            running: Arc::new(RwLock::new(false)),
        })
    }

    /// Elect the initial coordinator and start background activity.
    /// Must be called from within a Tokio runtime.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }

        info!(
            "Starting cluster with {} members, policy {}",
            self.registry.len(),
            self.dispatcher.policy()
        );

        self.events.start().await;
        if self.config.log_events {
            self.events
                .register_listener(Arc::new(LoggingEventListener))
                .await;
        }

        match self.election.initialize() {
            Ok(coordinator) => {
                self.events
                    .publish(ClusterEvent::coordinator_elected(coordinator))
                    .await;
            }
            Err(e) => warn!("Initial election failed: {}", e),
        }

        let dispatcher = self.dispatcher.clone();
        self.scheduler.schedule_periodic(
            TaskKey::health_tick(),
            self.config.dispatcher.health_tick_interval,
            move || dispatcher.health_tick(),
        );

        metrics::gauge!("synod_members_active").set(self.registry.active_ids().len() as f64);

        *running = true;
        info!("Cluster started");
        Ok(())
    }

    /// Cancel every pending timer and stop publishing events
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if !*running {
            return;
        }

        info!("Stopping cluster");
        self.scheduler.shutdown();
        self.events.stop().await;
        *running = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Run a command, reporting rejection as a structured response
    pub async fn execute(&self, command: ClusterCommand) -> CommandResponse {
        let name = command.name();
        let result = self.handle(command).await;
        if let Err(e) = &result {
            warn!("Command {} rejected: {}", name, e);
        }
        result.into()
    }

    pub async fn handle(&self, command: ClusterCommand) -> Result<CommandReply> {
        match command {
            ClusterCommand::CrashMember { member_id } => {
                self.lifecycle.crash(member_id).await.map(CommandReply::Crashed)
            }
            ClusterCommand::RestartMember { member_id } => self
                .lifecycle
                .restart(member_id)
                .await
                .map(CommandReply::Restarted),
            ClusterCommand::PlaceWork { work } => {
                self.place_work(work).await.map(CommandReply::WorkAccepted)
            }
            ClusterCommand::TriggerElection { initiator_id } => self
                .trigger_election(initiator_id)
                .await
                .map(CommandReply::Election),
            ClusterCommand::SetPolicy { policy } => {
                self.dispatcher.set_policy(policy);
                Ok(CommandReply::PolicySet { policy })
            }
            ClusterCommand::SetWeight { member_id, weight } => {
                let weight = self.dispatcher.set_weight(member_id, weight)?;
                Ok(CommandReply::WeightSet { member_id, weight })
            }
            ClusterCommand::GetState => {
                let snapshot = self.snapshot();
                self.events
                    .publish(ClusterEvent::state_snapshot(snapshot.clone()))
                    .await;
                Ok(CommandReply::State(Box::new(snapshot)))
            }
            ClusterCommand::CheckConsistency => {
                Ok(CommandReply::Consistency(self.replication.check_consistency()))
            }
            ClusterCommand::SyncMember { member_id } => {
                self.sync_member(member_id).map(CommandReply::Synced)
            }
        }
    }

    /// Dispatch a work item and replicate its mutation from the chosen member
    pub async fn place_work(&self, work: WorkItem) -> Result<WorkReceipt> {
        let dispatched = match self.dispatcher.dispatch(&work) {
            Ok(dispatched) => dispatched,
            Err(e) => {
                self.events.publish(ClusterEvent::work_rejected(&e)).await;
                return Err(e);
            }
        };

        let mutation = dispatched.mutation;
        let replication =
            self.replication
                .replicate(mutation.operation, &mutation.entity, dispatched.member_id);
        if let Some(partial) = replication.partial_failure() {
            warn!("Work on {}: {}", dispatched.member_id, partial);
        }

        self.events
            .publish(ClusterEvent::work_accepted(
                dispatched.member_id,
                mutation.clone(),
                replication.clone(),
            ))
            .await;

        Ok(WorkReceipt {
            member_id: dispatched.member_id,
            mutation,
            replication,
        })
    }

    pub async fn trigger_election(&self, initiator: MemberId) -> Result<ElectionOutcome> {
        let outcome = self.election.start_election(initiator)?;
        if let Some(coordinator) = outcome.coordinator() {
            self.events
                .publish(ClusterEvent::coordinator_elected(coordinator))
                .await;
        }
        Ok(outcome)
    }

    /// Resync an Active member from the current coordinator
    pub fn sync_member(&self, member_id: MemberId) -> Result<SyncReceipt> {
        if !self.registry.status(member_id)?.is_active() {
            return Err(ClusterError::MemberUnavailable(member_id));
        }
        let coordinator = self
            .election
            .current_coordinator()
            .ok_or(ClusterError::NoActiveMembers)?;
        let entities = self.replication.sync_with_leader(member_id, coordinator.id)?;

        Ok(SyncReceipt {
            member_id,
            coordinator_id: coordinator.id,
            entities,
        })
    }

    pub fn health_summary(&self) -> ClusterHealthSummary {
        let mut summary = ClusterHealthSummary::default();
        for member in self.registry.list_all() {
            summary.total += 1;
            match member.status {
                MemberStatus::Active => summary.active += 1,
                MemberStatus::Crashed => summary.crashed += 1,
            }
        }
        summary
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let members: Vec<MemberView> = self
            .registry
            .list_all()
            .into_iter()
            .map(|m| MemberView {
                id: m.id,
                status: m.status,
                is_coordinator: m.is_coordinator,
                entity_count: m.dataset.len(),
                dataset: m.dataset,
                status_changed_at: m.status_changed_at,
            })
            .collect();

        let health = ClusterHealthSummary {
            total: members.len(),
            active: members.iter().filter(|m| m.status.is_active()).count(),
            crashed: members.iter().filter(|m| !m.status.is_active()).count(),
        };

        ClusterSnapshot {
            coordinator_id: members.iter().find(|m| m.is_coordinator).map(|m| m.id),
            members,
            election: self.election.state(),
            policy: self.dispatcher.policy(),
            dispatch: self.dispatcher.stats(),
            health,
            taken_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn election(&self) -> &Arc<CoordinatorElection> {
        &self.election
    }

    pub fn replication(&self) -> &Arc<ReplicationEngine> {
        &self.replication
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn events(&self) -> &Arc<ClusterEventPublisher> {
        &self.events
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }
}
