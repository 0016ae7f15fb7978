//! Supervision of detached chain workers
//!
//! Workers run fire-and-forget from the caller's point of view, but every one
//! of them is registered here for as long as it runs so operators can see
//! what is in flight and shutdown can drain it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What a supervised task is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStage {
    /// Fee estimation and broadcast
    Dispatch,
    /// Waiting for block depth
    Confirmation,
}

/// Supervisory record of one outstanding task
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: u64,
    pub intent_id: String,
    pub chain_id: u64,
    pub stage: TaskStage,
    pub started_at: DateTime<Utc>,
}

struct Registry {
    tasks: DashMap<u64, TaskRecord>,
    idle: Notify,
}

/// Removes the record when the task finishes, panics, or is aborted
struct TaskGuard {
    task_id: u64,
    registry: Arc<Registry>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.registry.tasks.remove(&self.task_id);
        let outstanding = self.registry.tasks.len();
        crate::metrics::set_outstanding_tasks(outstanding);
        if outstanding == 0 {
            self.registry.idle.notify_waiters();
        }
    }
}

/// Spawns worker tasks and tracks the ones still running
pub struct TaskSupervisor {
    next_id: AtomicU64,
    registry: Arc<Registry>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            registry: Arc::new(Registry {
                tasks: DashMap::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// Spawn `task` onto the runtime under supervision
    pub fn spawn<F>(
        &self,
        intent_id: &str,
        chain_id: u64,
        stage: TaskStage,
        task: F,
    ) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.tasks.insert(
            task_id,
            TaskRecord {
                task_id,
                intent_id: intent_id.to_string(),
                chain_id,
                stage,
                started_at: Utc::now(),
            },
        );
        crate::metrics::set_outstanding_tasks(self.registry.tasks.len());
        debug!(task_id, intent_id, chain_id, ?stage, "Task spawned");

        let guard = TaskGuard {
            task_id,
            registry: self.registry.clone(),
        };

        tokio::spawn(async move {
            let _guard = guard;
            task.await;
        })
    }

    /// Snapshot of outstanding tasks, oldest first
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .registry
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|r| r.task_id);
        records
    }

    /// Outstanding tasks for one intent
    pub fn for_intent(&self, intent_id: &str) -> Vec<TaskRecord> {
        self.snapshot()
            .into_iter()
            .filter(|r| r.intent_id == intent_id)
            .collect()
    }

    pub fn outstanding(&self) -> usize {
        self.registry.tasks.len()
    }

    /// Wait until no task is outstanding. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.registry.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.registry.tasks.is_empty() {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    outstanding = self.outstanding(),
                    "Timed out waiting for workers to drain"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_records_live_tasks() {
        let supervisor = TaskSupervisor::new();
        let (tx, rx) = oneshot::channel::<()>();

        let handle = supervisor.spawn("0xabc", 10, TaskStage::Dispatch, async move {
            let _ = rx.await;
        });

        let records = supervisor.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].intent_id, "0xabc");
        assert_eq!(records[0].chain_id, 10);
        assert_eq!(records[0].stage, TaskStage::Dispatch);
        assert_eq!(supervisor.for_intent("0xabc").len(), 1);
        assert!(supervisor.for_intent("0xdef").is_empty());

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(supervisor.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_is_deregistered() {
        let supervisor = TaskSupervisor::new();
        let handle = supervisor.spawn("0xabc", 137, TaskStage::Confirmation, async {
            panic!("boom");
        });

        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(supervisor.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let supervisor = TaskSupervisor::new();
        assert!(supervisor.wait_idle(Duration::from_millis(10)).await);

        for chain_id in [10, 137, 8453] {
            supervisor.spawn("0xabc", chain_id, TaskStage::Dispatch, async move {
                tokio::time::sleep(Duration::from_millis(20 * chain_id % 7)).await;
            });
        }
        assert!(supervisor.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(supervisor.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_times_out() {
        let supervisor = TaskSupervisor::new();
        let (_tx, rx) = oneshot::channel::<()>();
        supervisor.spawn("0xabc", 10, TaskStage::Confirmation, async move {
            let _ = rx.await;
        });

        assert!(!supervisor.wait_idle(Duration::from_millis(20)).await);
        assert_eq!(supervisor.outstanding(), 1);
    }
}
