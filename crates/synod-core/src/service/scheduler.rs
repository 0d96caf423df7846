// Cancellable delayed and periodic tasks keyed by purpose and member
// Scheduling under an existing key aborts the previous task, so a key never owns two timers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::model::MemberId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Crash detection delay before re-electing
    Failover,
    /// Self-restart of a crashed member
    AutoRestart,
    /// Coordinator announcement after an election
    CoordinatorBroadcast,
    /// Periodic dispatcher health tick
    HealthTick,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub kind: TaskKind,
    pub member: Option<MemberId>,
}

impl TaskKey {
    pub fn failover(member: MemberId) -> Self {
        Self {
            kind: TaskKind::Failover,
            member: Some(member),
        }
    }

    pub fn auto_restart(member: MemberId) -> Self {
        Self {
            kind: TaskKind::AutoRestart,
            member: Some(member),
        }
    }

    pub fn coordinator_broadcast() -> Self {
        Self {
            kind: TaskKind::CoordinatorBroadcast,
            member: None,
        }
    }

    pub fn health_tick() -> Self {
        Self {
            kind: TaskKind::HealthTick,
            member: None,
        }
    }
}

struct ScheduledTask {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Owner of every timer in the cluster core
///
/// Must be used from within a Tokio runtime.
#[derive(Clone, Default)]
pub struct TaskScheduler {
    tasks: Arc<Mutex<HashMap<TaskKey, ScheduledTask>>>,
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once after `delay`.
    ///
    /// When the delay elapses the task detaches itself from the table before
    /// running, so `cancel` only ever stops a task that has not started.
    pub fn schedule<F>(&self, key: TaskKey, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let tasks = self.tasks.clone();

        // Hold the table while spawning so the task cannot look itself up before it is inserted
        let mut table = self.tasks.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut table = tasks.lock();
                match table.get(&key) {
                    Some(entry) if entry.generation == generation => {
                        table.remove(&key);
                    }
                    _ => return,
                }
            }
            task.await;
        });

        if let Some(previous) = table.insert(key, ScheduledTask { generation, handle }) {
            debug!("Replacing pending task {:?}", key);
            previous.handle.abort();
        }
    }

    /// Call `tick` every `period`, first after one full period
    pub fn schedule_periodic<F>(&self, key: TaskKey, period: Duration, mut tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                tick();
            }
        });

        if let Some(previous) = self
            .tasks
            .lock()
            .insert(key, ScheduledTask { generation, handle })
        {
            previous.handle.abort();
        }
    }

    /// Abort the pending task under `key`. Returns whether one was pending.
    pub fn cancel(&self, key: TaskKey) -> bool {
        match self.tasks.lock().remove(&key) {
            Some(entry) => {
                entry.handle.abort();
                debug!("Cancelled task {:?}", key);
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: TaskKey) -> bool {
        self.tasks.lock().contains_key(&key)
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Abort everything
    pub fn shutdown(&self) {
        let mut table = self.tasks.lock();
        for (_, entry) in table.drain() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_delayed_task_runs_once_and_detaches() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let key = TaskKey::auto_restart(MemberId(1));

        scheduler.schedule(key, Duration::from_secs(30), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.is_scheduled(key));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled(key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_exactly_one_task() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for id in [1, 2] {
            let counter = runs.clone();
            scheduler.schedule(TaskKey::auto_restart(MemberId(id)), Duration::from_secs(5), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(scheduler.cancel(TaskKey::auto_restart(MemberId(1))));
        assert!(!scheduler.cancel(TaskKey::auto_restart(MemberId(1))));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_replaces_previous_task() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let key = TaskKey::coordinator_broadcast();

        for _ in 0..3 {
            let counter = runs.clone();
            scheduler.schedule(key, Duration::from_millis(500), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(scheduler.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_until_shutdown() {
        let scheduler = TaskScheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        scheduler.schedule_periodic(TaskKey::health_tick(), Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(15_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.pending_count(), 0);
    }
}
