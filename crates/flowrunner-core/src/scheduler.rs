//! Scheduler / Admission — accepts submissions, enforces quota and
//! permission, and dispatches queued tasks to the worker pool.
//!
//! Dispatch is FIFO through a single shared queue: per-client order and
//! the global created_at tie-break both fall out of push order. Back
//! pressure is by queueing — a saturated worker set never rejects a
//! submission.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;

use flowrunner_proto::{RunnerError, RunnerResult, Task};

use crate::auth::PermissionOracle;
use crate::bus::{keys, StreamBus};
use crate::config::Config;
use crate::control;
use crate::runner::TaskRunner;
use crate::storage::{flow_path, ObjectStore};
use crate::store::{TaskPatch, TaskStore};

/// Submission options alongside the flow blob.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Original filename of the uploaded flow.
    pub file_name: String,
    /// Per-task override of the default input timeout.
    pub input_timeout: Option<u64>,
    /// Per-task override of the default maximum duration.
    pub max_duration: Option<u64>,
}

/// Admission and task-facing operations behind the HTTP surface.
pub struct Scheduler {
    pub bus: Arc<dyn StreamBus>,
    pub store: Arc<dyn TaskStore>,
    pub storage: Arc<dyn ObjectStore>,
    pub oracle: Arc<dyn PermissionOracle>,
    pub config: Arc<Config>,
}

impl Scheduler {
    pub fn new(
        bus: Arc<dyn StreamBus>,
        store: Arc<dyn TaskStore>,
        storage: Arc<dyn ObjectStore>,
        oracle: Arc<dyn PermissionOracle>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            bus,
            store,
            storage,
            oracle,
            config,
        }
    }

    /// Validate, admit, persist, and enqueue one submission.
    pub async fn submit(
        &self,
        client_id: &str,
        flow: &[u8],
        options: SubmitOptions,
    ) -> RunnerResult<Task> {
        validate_flow(&options.file_name, flow, self.config.max_flow_size)?;
        self.oracle.may_run(client_id).await?;

        let active = self.store.count_active(client_id).await?;
        if active >= self.config.client_task_limit {
            return Err(RunnerError::QuotaExceeded(format!(
                "client {client_id} has {active} active tasks (limit {})",
                self.config.client_task_limit
            )));
        }

        let task = Task::new(
            client_id,
            &options.file_name,
            options.input_timeout.unwrap_or(self.config.input_timeout),
            options.max_duration.unwrap_or(self.config.max_task_duration),
        );

        self.storage.put(&flow_path(&task), flow).await?;
        self.store.create(&task).await?;

        if let Err(err) = self.bus.queue_push(keys::TASK_QUEUE, &task.id).await {
            // The record exists but can never dispatch; fail it in place.
            let _ = self
                .store
                .update_status(
                    &task.id,
                    flowrunner_proto::TaskStatus::Pending,
                    flowrunner_proto::TaskStatus::Failed,
                    TaskPatch::with_results(serde_json::json!({
                        "reason": "infrastructure",
                        "diagnostic": err.to_string(),
                    })),
                )
                .await;
            return Err(err);
        }

        tracing::info!(
            task_id = %task.id,
            client_id,
            file = %options.file_name,
            "task submitted"
        );
        Ok(task)
    }

    /// Fetch a task owned by the caller. Other clients' tasks and
    /// soft-deleted records read as absent.
    pub async fn owned(&self, client_id: &str, task_id: &str) -> RunnerResult<Task> {
        let task = self.store.get(task_id).await?;
        if task.client_id != client_id || task.soft_deleted {
            return Err(RunnerError::NotFound(format!("task {task_id}")));
        }
        Ok(task)
    }

    /// Cancel a task. Idempotent: cancelling a terminal task returns the
    /// record unchanged.
    pub async fn cancel(&self, client_id: &str, task_id: &str) -> RunnerResult<Task> {
        let task = self.owned(client_id, task_id).await?;
        if task.is_terminal() {
            return Ok(task);
        }

        if task.status == flowrunner_proto::TaskStatus::Pending {
            match self
                .store
                .update_status(
                    task_id,
                    flowrunner_proto::TaskStatus::Pending,
                    flowrunner_proto::TaskStatus::Cancelled,
                    TaskPatch::default(),
                )
                .await
            {
                Ok(cancelled) => {
                    // Never dispatched, so no actor will announce the end.
                    let status = flowrunner_proto::Envelope::status(
                        task_id,
                        flowrunner_proto::TaskStatus::Cancelled,
                    );
                    let _ = self.bus.xadd(&keys::out(task_id), &status).await;
                    let _ = self.bus.publish(&keys::ctl(task_id), &status).await;
                    return Ok(cancelled);
                }
                // Dispatched in the meantime; fall through to the actor.
                Err(RunnerError::Conflict(_)) => {}
                Err(err) => return Err(err),
            }
        }

        control::request_cancel(self.bus.as_ref(), task_id).await?;
        self.store.get(task_id).await
    }

    /// Soft-delete a task record. Active tasks require `force`, which
    /// requests cancellation first.
    pub async fn delete(&self, client_id: &str, task_id: &str, force: bool) -> RunnerResult<()> {
        let task = self.owned(client_id, task_id).await?;
        if task.is_active() {
            if !force {
                return Err(RunnerError::Conflict(format!(
                    "task {task_id} is {}; pass force to delete an active task",
                    task.status
                )));
            }
            let _ = self.cancel(client_id, task_id).await?;
        }
        self.store.soft_delete(task_id).await
    }
}

/// Reject bad submissions before any record exists.
pub fn validate_flow(file_name: &str, flow: &[u8], max_size: u64) -> RunnerResult<()> {
    if file_name.is_empty() {
        return Err(RunnerError::ValidationFailed(
            "flow file name is required".into(),
        ));
    }
    if file_name.contains('/') || file_name.contains('\\') || file_name.contains("..") {
        return Err(RunnerError::ValidationFailed(format!(
            "flow file name {file_name:?} must not contain path separators"
        )));
    }
    if flow.is_empty() {
        return Err(RunnerError::ValidationFailed("flow file is empty".into()));
    }
    if flow.len() as u64 > max_size {
        return Err(RunnerError::ValidationFailed(format!(
            "flow file exceeds {max_size} bytes"
        )));
    }
    Ok(())
}

/// A fixed-size set of workers pulling from the dispatch queue; each
/// worker holds at most one task at a time.
pub struct WorkerPool {
    runner: Arc<TaskRunner>,
    shutdown: watch::Receiver<bool>,
}

impl WorkerPool {
    pub fn new(runner: Arc<TaskRunner>, shutdown: watch::Receiver<bool>) -> Self {
        Self { runner, shutdown }
    }

    /// Run `count` workers until shutdown.
    pub async fn run(&self, count: usize) {
        let mut set = JoinSet::new();
        for index in 0..count {
            let runner = Arc::clone(&self.runner);
            let shutdown = self.shutdown.clone();
            set.spawn(worker_loop(index, runner, shutdown));
        }
        while set.join_next().await.is_some() {}
    }
}

async fn worker_loop(index: usize, runner: Arc<TaskRunner>, mut shutdown: watch::Receiver<bool>) {
    use std::time::Duration;

    tracing::info!(worker = index, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match runner.bus.queue_pop(keys::TASK_QUEUE).await {
            Ok(Some(task_id)) => {
                tracing::debug!(worker = index, task_id = %task_id, "task claimed");
                runner.run(&task_id).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(err) => {
                tracing::warn!(worker = index, error = %err, "queue pop failed");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    tracing::info!(worker = index, "worker stopped");
}
