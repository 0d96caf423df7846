// Cluster event handling
// Outbound notifications for status changes, elections and work outcomes

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::model::{MemberId, MemberStatus, Mutation};

use super::cluster::ClusterSnapshot;
use super::replication::ReplicationReport;

/// Outbound cluster notification
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    #[serde(rename_all = "camelCase")]
    MemberStatusChanged {
        member_id: MemberId,
        status: MemberStatus,
        is_coordinator: bool,
        previous_status: MemberStatus,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    CoordinatorElected { member_id: MemberId, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    WorkAccepted {
        member_id: MemberId,
        mutation: Mutation,
        replication: ReplicationReport,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    WorkRejected {
        code: String,
        reason: String,
        timestamp: i64,
    },
    StateSnapshot(Box<ClusterSnapshot>),
}

impl ClusterEvent {
    pub fn member_status_changed(
        member_id: MemberId,
        status: MemberStatus,
        is_coordinator: bool,
        previous_status: MemberStatus,
    ) -> Self {
        ClusterEvent::MemberStatusChanged {
            member_id,
            status,
            is_coordinator,
            previous_status,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn coordinator_elected(member_id: MemberId) -> Self {
        ClusterEvent::CoordinatorElected {
            member_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn work_accepted(member_id: MemberId, mutation: Mutation, replication: ReplicationReport) -> Self {
        ClusterEvent::WorkAccepted {
            member_id,
            mutation,
            replication,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn work_rejected(error: &ClusterError) -> Self {
        ClusterEvent::WorkRejected {
            code: error.reason_code().to_string(),
            reason: error.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn state_snapshot(snapshot: ClusterSnapshot) -> Self {
        ClusterEvent::StateSnapshot(Box::new(snapshot))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClusterEvent::MemberStatusChanged { .. } => "MEMBER_STATUS_CHANGED",
            ClusterEvent::CoordinatorElected { .. } => "COORDINATOR_ELECTED",
            ClusterEvent::WorkAccepted { .. } => "WORK_ACCEPTED",
            ClusterEvent::WorkRejected { .. } => "WORK_REJECTED",
            ClusterEvent::StateSnapshot(_) => "STATE_SNAPSHOT",
        }
    }
}

/// Trait for handling cluster events
#[async_trait::async_trait]
pub trait ClusterEventListener: Send + Sync {
    async fn on_event(&self, event: &ClusterEvent);
}

/// Cluster event publisher
/// Broadcasts events to subscribers and registered listeners
pub struct ClusterEventPublisher {
    broadcast_tx: broadcast::Sender<ClusterEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn ClusterEventListener>>>>,
    running: Arc<RwLock<bool>>,
}

impl ClusterEventPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size.max(1));

        Self {
            broadcast_tx,
            listeners: Arc::new(RwLock::new(Vec::new())),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        info!("Starting cluster event publisher");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Stopped cluster event publisher");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn register_listener(&self, listener: Arc<dyn ClusterEventListener>) {
        let mut listeners = self.listeners.write().await;
        listeners.push(listener);
        debug!("Registered cluster event listener, total: {}", listeners.len());
    }

    /// Publish an event. Dropped silently while the publisher is stopped.
    pub async fn publish(&self, event: ClusterEvent) {
        if !*self.running.read().await {
            return;
        }

        debug!("Publishing cluster event: {}", event.name());

        // No subscribers is fine
        let _ = self.broadcast_tx.send(event.clone());

        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_event(&event).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.broadcast_tx.subscribe()
    }
}

/// Logs every event
pub struct LoggingEventListener;

#[async_trait::async_trait]
impl ClusterEventListener for LoggingEventListener {
    async fn on_event(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::MemberStatusChanged {
                member_id,
                status,
                previous_status,
                is_coordinator,
                ..
            } => {
                info!(
                    "[ClusterEvent] {} status changed ({} -> {}, coordinator: {})",
                    member_id, previous_status, status, is_coordinator
                );
            }
            ClusterEvent::CoordinatorElected { member_id, .. } => {
                info!("[ClusterEvent] {} is the coordinator", member_id);
            }
            ClusterEvent::WorkAccepted {
                member_id,
                mutation,
                replication,
                ..
            } => {
                info!(
                    "[ClusterEvent] {} accepted {} {} '{}' (replicated {}/{})",
                    member_id,
                    mutation.operation,
                    mutation.entity.kind(),
                    mutation.entity.id(),
                    replication.success_count,
                    replication.target_count
                );
            }
            ClusterEvent::WorkRejected { code, reason, .. } => {
                warn!("[ClusterEvent] Work rejected [{}]: {}", code, reason);
            }
            ClusterEvent::StateSnapshot(snapshot) => {
                debug!(
                    "[ClusterEvent] Snapshot: {}/{} active, coordinator {:?}",
                    snapshot.health.active, snapshot.health.total, snapshot.coordinator_id
                );
            }
        }
    }
}
