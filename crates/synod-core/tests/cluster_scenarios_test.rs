// Integration tests for cluster scenarios
// Drives the cluster through its command surface with a paused clock

use std::time::Duration;

use synod_core::model::{EntityKind, MemberStatus};
use synod_core::seed::seed_dataset;
use synod_core::service::dispatcher::DispatcherConfig;
use synod_core::service::lifecycle::LifecycleConfig;
use synod_core::{
    ClusterCommand, ClusterConfig, ClusterEvent, ClusterService, CommandReply, CommandResponse,
    DispatchPolicy, MemberId, WorkItem,
};

fn config(size: u32) -> ClusterConfig {
    ClusterConfig {
        size,
        log_events: false,
        ..Default::default()
    }
}

async fn started(config: ClusterConfig) -> ClusterService {
    let service = ClusterService::with_dispatch_seed(config, seed_dataset(), 42).unwrap();
    service.start().await.unwrap();
    service
}

fn coordinator(service: &ClusterService) -> Option<MemberId> {
    service.snapshot().coordinator_id
}

async fn crash(service: &ClusterService, id: u32) {
    let response = service
        .execute(ClusterCommand::CrashMember {
            member_id: MemberId(id),
        })
        .await;
    assert!(response.is_ok(), "crash {} failed: {:?}", id, response);
}

#[tokio::test(start_paused = true)]
async fn test_failover_sequence_over_six_members() {
    let service = started(config(6)).await;
    assert_eq!(coordinator(&service), Some(MemberId(6)));

    crash(&service, 6).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(coordinator(&service), Some(MemberId(5)));

    crash(&service, 3).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(coordinator(&service), Some(MemberId(5)));

    crash(&service, 5).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(coordinator(&service), Some(MemberId(4)));
    let active: Vec<MemberId> = service.registry().active_ids();
    assert_eq!(active, vec![MemberId(1), MemberId(2), MemberId(4)]);

    let reply = service
        .handle(ClusterCommand::RestartMember {
            member_id: MemberId(3),
        })
        .await
        .unwrap();
    let CommandReply::Restarted(outcome) = reply else {
        panic!("unexpected reply");
    };
    assert_eq!(outcome.synced_from, Some(MemberId(4)));
    assert_eq!(outcome.election.and_then(|e| e.coordinator()), Some(MemberId(4)));
    assert_eq!(coordinator(&service), Some(MemberId(4)));
    assert_eq!(service.registry().coordinator_count(), 1);

    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_coordinator_announcements_follow_failover() {
    let service = started(config(6)).await;
    let mut events = service.subscribe();

    crash(&service, 6).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut elected = Vec::new();
    let mut crashed = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ClusterEvent::CoordinatorElected { member_id, .. } => elected.push(member_id),
            ClusterEvent::MemberStatusChanged {
                member_id,
                status: MemberStatus::Crashed,
                ..
            } => crashed.push(member_id),
            _ => {}
        }
    }
    assert_eq!(crashed, vec![MemberId(6)]);
    assert_eq!(elected, vec![MemberId(5)]);
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_stock_changes_nothing() {
    let service = started(config(3)).await;
    let mut events = service.subscribe();
    let before = service.snapshot().members;
    let stock = seed_dataset().product("p-103").map(|p| p.stock).unwrap();

    let response = service
        .execute(ClusterCommand::PlaceWork {
            work: WorkItem::PlaceOrder {
                product_id: "p-103".to_string(),
                quantity: stock + 1,
                customer: "erin".to_string(),
            },
        })
        .await;

    let CommandResponse::Rejected { code, .. } = response else {
        panic!("order should be rejected");
    };
    assert_eq!(code, "INSUFFICIENT_STOCK");
    assert_eq!(service.snapshot().members, before);

    let mut accepted = 0;
    let mut rejected = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ClusterEvent::WorkAccepted { .. } => accepted += 1,
            ClusterEvent::WorkRejected { .. } => rejected += 1,
            _ => {}
        }
    }
    assert_eq!(accepted, 0);
    assert_eq!(rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_orders_spread_and_replicate() {
    let service = started(config(3)).await;

    let mut served = Vec::new();
    for _ in 0..9 {
        let reply = service
            .handle(ClusterCommand::PlaceWork {
                work: WorkItem::PlaceOrder {
                    product_id: "p-102".to_string(),
                    quantity: 1,
                    customer: "frank".to_string(),
                },
            })
            .await
            .unwrap();
        let CommandReply::WorkAccepted(receipt) = reply else {
            panic!("unexpected reply");
        };
        assert_eq!(receipt.mutation.entity.kind(), EntityKind::Order);
        assert_eq!(receipt.replication.success_count, 2);
        served.push(receipt.member_id);
    }

    for id in 1..=3 {
        assert_eq!(served.iter().filter(|m| **m == MemberId(id)).count(), 3);
    }

    // Every member saw all nine orders and the same stock
    let seeded = seed_dataset().product("p-102").map(|p| p.stock).unwrap();
    for member in service.snapshot().members {
        assert_eq!(member.dataset.orders.len(), 9);
        assert_eq!(member.dataset.product("p-102").map(|p| p.stock), Some(seeded - 9));
    }
}

#[tokio::test(start_paused = true)]
async fn test_crashed_member_misses_writes_until_restart() {
    let service = started(config(4)).await;
    crash(&service, 2).await;

    service
        .handle(ClusterCommand::SetPolicy {
            policy: DispatchPolicy::LeastConnections,
        })
        .await
        .unwrap();
    service
        .handle(ClusterCommand::PlaceWork {
            work: WorkItem::DeleteProduct {
                id: "p-104".to_string(),
            },
        })
        .await
        .unwrap();

    let frozen = service.registry().dataset(MemberId(2)).unwrap();
    assert!(frozen.product("p-104").is_some());
    let report = service.replication().check_consistency();
    // Crashed members are not checked
    assert!(report.is_consistent());

    service
        .handle(ClusterCommand::RestartMember {
            member_id: MemberId(2),
        })
        .await
        .unwrap();
    assert!(service.registry().dataset(MemberId(2)).unwrap().product("p-104").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commands_keep_single_coordinator() {
    let config = ClusterConfig {
        size: 6,
        dispatcher: DispatcherConfig {
            min_latency: Duration::from_millis(1),
            max_latency: Duration::from_millis(5),
            ..Default::default()
        },
        lifecycle: LifecycleConfig {
            detection_delay: Duration::from_millis(10),
            broadcast_delay: Duration::from_millis(5),
            auto_restart_timeout: Duration::from_millis(80),
        },
        log_events: false,
        ..Default::default()
    };
    let service = started(config).await;

    let mut handles = Vec::new();
    for round in 0..8u32 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let id = MemberId(round % 6 + 1);
            let _ = service.handle(ClusterCommand::CrashMember { member_id: id }).await;
            let _ = service
                .handle(ClusterCommand::PlaceWork {
                    work: WorkItem::PlaceOrder {
                        product_id: "p-101".to_string(),
                        quantity: 1,
                        customer: format!("c-{}", round),
                    },
                })
                .await;
            let _ = service
                .handle(ClusterCommand::TriggerElection { initiator_id: MemberId(1) })
                .await;
            assert!(service.registry().coordinator_count() <= 1);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Let failovers and automatic restarts settle
    tokio::time::sleep(Duration::from_millis(500)).await;

    let snapshot = service.snapshot();
    assert_eq!(snapshot.health.active, 6);
    assert_eq!(snapshot.coordinator_id, Some(MemberId(6)));
    assert_eq!(service.registry().coordinator_count(), 1);
    assert!(!snapshot.election.in_progress);

    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_crashes_succeed_once() {
    let service = started(config(3)).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .handle(ClusterCommand::CrashMember {
                    member_id: MemberId(2),
                })
                .await
                .is_ok()
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
    assert!(
        service
            .scheduler()
            .is_scheduled(synod_core::service::scheduler::TaskKey::auto_restart(MemberId(2)))
    );

    service.stop().await;
}
