//! The periodic reconciler.
//!
//! Two duties: mark tasks FAILED whose owning worker stopped heartbeating
//! (crash, OOM, node loss), and enforce retention — per-task streams of
//! long-terminal tasks are deleted and soft-deleted records purged.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use flowrunner_proto::{Envelope, RunnerResult, Task, TaskStatus};

use crate::bus::{keys, StreamBus};
use crate::config::Config;
use crate::store::{TaskPatch, TaskStore};

/// Seconds after its last record write before an active task without a
/// heartbeat is considered orphaned.
const ORPHAN_SLACK_SECS: i64 = 60;

const SWEEP_PERIOD: Duration = Duration::from_secs(30);

pub struct Reaper {
    bus: Arc<dyn StreamBus>,
    store: Arc<dyn TaskStore>,
    config: Arc<Config>,
}

impl Reaper {
    pub fn new(bus: Arc<dyn StreamBus>, store: Arc<dyn TaskStore>, config: Arc<Config>) -> Self {
        Self { bus, store, config }
    }

    /// Sweep until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SWEEP_PERIOD);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        tracing::warn!(error = %err, "reconciler sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("reconciler stopped");
    }

    /// One reconciliation sweep.
    pub async fn run_once(&self) -> RunnerResult<()> {
        self.reap_orphans().await?;
        self.enforce_retention().await
    }

    async fn reap_orphans(&self) -> RunnerResult<()> {
        for task in self.store.list_active().await? {
            let dispatched = matches!(
                task.status,
                TaskStatus::Running | TaskStatus::WaitingForInput
            );
            if !dispatched {
                continue;
            }
            if self.bus.exists(&keys::alive(&task.id)).await? {
                continue;
            }
            if Utc::now() - task.updated_at < chrono::Duration::seconds(ORPHAN_SLACK_SECS) {
                // Recently written; the worker may not have heartbeat yet.
                continue;
            }
            self.fail_orphan(&task).await;
        }
        Ok(())
    }

    async fn fail_orphan(&self, task: &Task) {
        tracing::warn!(task_id = %task.id, status = %task.status, "reaping orphaned task");
        let summary = serde_json::json!({
            "reason": "infrastructure",
            "diagnostic": "worker heartbeat lost",
        });
        match self
            .store
            .update_status(
                &task.id,
                task.status,
                TaskStatus::Failed,
                TaskPatch::with_results(summary.clone()),
            )
            .await
        {
            Ok(_) => {
                let _ = self
                    .bus
                    .publish(
                        &keys::ctl(&task.id),
                        &Envelope::status(&task.id, TaskStatus::Failed),
                    )
                    .await;
                let _ = self
                    .bus
                    .xadd(&keys::out(&task.id), &Envelope::termination(&task.id, summary))
                    .await;
            }
            // The worker came back and finished the race; its word stands.
            Err(err) => tracing::debug!(task_id = %task.id, error = %err, "orphan reap lost race"),
        }
    }

    async fn enforce_retention(&self) -> RunnerResult<()> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.retention_days));
        for task in self.store.list_terminal_before(cutoff).await? {
            tracing::debug!(task_id = %task.id, "expiring task streams");
            self.bus.delete(&keys::out(&task.id)).await?;
            self.bus.delete(&keys::alive(&task.id)).await?;
            if task.soft_deleted {
                self.store.purge(&task.id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::store::MemoryTaskStore;
    use serde_json::json;

    struct Fixture {
        bus: Arc<MemoryBus>,
        store: Arc<MemoryTaskStore>,
        reaper: Reaper,
    }

    fn fixture(retention_days: u32) -> Fixture {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryTaskStore::new());
        let mut config = Config::default();
        config.retention_days = retention_days;
        let reaper = Reaper::new(bus.clone(), store.clone(), Arc::new(config));
        Fixture { bus, store, reaper }
    }

    #[tokio::test]
    async fn test_reaps_heartbeatless_running_task() {
        let f = fixture(7);
        // A task whose worker died five minutes ago: Running, stale
        // record, no heartbeat key.
        let mut task = Task::new("acme", "demo.flow", 180, 0);
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now() - chrono::Duration::minutes(5));
        task.updated_at = Utc::now() - chrono::Duration::minutes(5);
        f.store.create(&task).await.unwrap();

        f.reaper.run_once().await.unwrap();

        let after = f.store.get(&task.id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Failed);
        assert_eq!(after.results.unwrap()["reason"], "infrastructure");
        let out = f.bus.xrange(&keys::out(&task.id), "-", "+").await.unwrap();
        assert!(out.iter().any(|(_, e)| e.kind() == "termination"));
    }

    #[tokio::test]
    async fn test_slack_protects_recently_written_task() {
        let f = fixture(7);
        let task = Task::new("acme", "demo.flow", 180, 0);
        f.store.create(&task).await.unwrap();
        f.store
            .update_status(&task.id, TaskStatus::Pending, TaskStatus::Running, TaskPatch::default())
            .await
            .unwrap();

        // No heartbeat yet, but the record was written moments ago.
        f.reaper.run_once().await.unwrap();
        let after = f.store.get(&task.id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_heartbeat_protects_running_task() {
        let f = fixture(7);
        let task = Task::new("acme", "demo.flow", 180, 0);
        f.store.create(&task).await.unwrap();
        f.store
            .update_status(&task.id, TaskStatus::Pending, TaskStatus::Running, TaskPatch::default())
            .await
            .unwrap();
        f.bus
            .set_ex(&keys::alive(&task.id), "1", Duration::from_secs(15))
            .await
            .unwrap();

        f.reaper.run_once().await.unwrap();
        let after = f.store.get(&task.id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_retention_deletes_streams_and_purges_soft_deleted() {
        let f = fixture(0);
        let task = Task::new("acme", "demo.flow", 180, 0);
        f.store.create(&task).await.unwrap();
        f.store
            .update_status(&task.id, TaskStatus::Pending, TaskStatus::Cancelled, TaskPatch::default())
            .await
            .unwrap();
        f.store.soft_delete(&task.id).await.unwrap();
        f.bus
            .xadd(&keys::out(&task.id), &Envelope::print(&task.id, json!("x")))
            .await
            .unwrap();

        // retention_days == 0 makes anything terminal already expired.
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.reaper.run_once().await.unwrap();

        let out = f.bus.xrange(&keys::out(&task.id), "-", "+").await.unwrap();
        assert!(out.is_empty());
        assert!(f.store.get(&task.id).await.is_err());
    }

    #[tokio::test]
    async fn test_pending_tasks_are_not_reaped() {
        let f = fixture(7);
        let task = Task::new("acme", "demo.flow", 180, 0);
        f.store.create(&task).await.unwrap();
        f.reaper.run_once().await.unwrap();
        assert_eq!(
            f.store.get(&task.id).await.unwrap().status,
            TaskStatus::Pending
        );
    }
}
