//! The per-task control actor.
//!
//! One worker runs one task end-to-end through this loop: it is the single
//! authoritative writer of the task's status, owner of the pending-input
//! table (through the mediator), and the only holder of the child handle.
//! Everything else — gateway, input endpoint, cancel endpoint — talks to
//! the actor over the task's channels.
//!
//! Every transition is journaled to the store before observers are
//! notified, so a crash-restart never rolls visible state backwards.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use flowrunner_proto::{FailureReason, RunnerError, RunnerResult, Task, TaskStatus};

use crate::bus::{keys, retry, EnvelopeStream, StreamBus};
use crate::config::Config;
use crate::control;
use crate::mediator::{Mediator, Routed};
use crate::results;
use crate::storage::{flow_path, ObjectStore};
use crate::store::{TaskPatch, TaskStore};
use crate::supervisor::{ChildHandle, ExitDisposition, Supervisor};

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);
const HEARTBEAT_TTL: Duration = Duration::from_secs(15);

/// Executes tasks popped from the dispatch queue.
pub struct TaskRunner {
    pub bus: Arc<dyn StreamBus>,
    pub store: Arc<dyn TaskStore>,
    pub storage: Arc<dyn ObjectStore>,
    pub config: Arc<Config>,
}

/// How supervision ended; consumed by finalization.
struct Outcome {
    /// The status the actor last journaled (the CAS `from`).
    from: TaskStatus,
    to: TaskStatus,
    reason: Option<FailureReason>,
    disposition: Option<ExitDisposition>,
    detail: Option<String>,
}

impl Outcome {
    fn from_exit(from: TaskStatus, disposition: ExitDisposition) -> Self {
        let to = if disposition.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        Self {
            from,
            to,
            reason: None,
            disposition: Some(disposition),
            detail: None,
        }
    }

    fn cancelled(from: TaskStatus, disposition: ExitDisposition) -> Self {
        Self {
            from,
            to: TaskStatus::Cancelled,
            reason: None,
            disposition: Some(disposition),
            detail: None,
        }
    }

    fn timed_out(from: TaskStatus, disposition: ExitDisposition) -> Self {
        Self {
            from,
            to: TaskStatus::Failed,
            reason: Some(FailureReason::Timeout),
            disposition: Some(disposition),
            detail: Some("maximum task duration exceeded".into()),
        }
    }

    fn protocol(from: TaskStatus, detail: String) -> Self {
        Self {
            from,
            to: TaskStatus::Failed,
            reason: Some(FailureReason::Protocol),
            disposition: None,
            detail: Some(detail),
        }
    }

    fn infra(from: TaskStatus, detail: String) -> Self {
        Self {
            from,
            to: TaskStatus::Failed,
            reason: Some(FailureReason::Infrastructure),
            disposition: None,
            detail: Some(detail),
        }
    }
}

impl TaskRunner {
    pub fn new(
        bus: Arc<dyn StreamBus>,
        store: Arc<dyn TaskStore>,
        storage: Arc<dyn ObjectStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            bus,
            store,
            storage,
            config,
        }
    }

    /// Run one task to its terminal state. Errors are terminal for the
    /// task, never for the worker.
    pub async fn run(&self, task_id: &str) {
        if let Err(err) = self.execute(task_id).await {
            tracing::error!(task_id, error = %err, "task execution aborted");
        }
    }

    async fn execute(&self, task_id: &str) -> RunnerResult<()> {
        let task = self.store.get(task_id).await?;
        if task.is_terminal() {
            tracing::debug!(task_id, "task already terminal, skipping dispatch");
            return Ok(());
        }
        if task.status != TaskStatus::Pending {
            tracing::warn!(task_id, status = %task.status, "refusing to dispatch non-pending task");
            return Ok(());
        }

        let mut mediator = Mediator::new(Arc::clone(&self.bus), &task);

        // Subscribe before anything can publish, so nothing is missed.
        let mut child_out = self.bus.subscribe(&keys::child_out(&task.id)).await?;
        let mut in_resp = self.bus.subscribe(&keys::in_resp(&task.id)).await?;
        let mut ctl = self.bus.subscribe(&keys::ctl(&task.id)).await?;

        let task = match self
            .journal(
                &task.id,
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskPatch::default(),
                &mut mediator,
            )
            .await
        {
            Ok(task) => task,
            Err(RunnerError::Conflict(_)) => {
                // Lost the CAS: cancelled between pop and dispatch.
                let current = self.store.get(&task.id).await?;
                if current.is_terminal() {
                    tracing::debug!(task_id, "task cancelled before dispatch");
                    return Ok(());
                }
                return Err(RunnerError::Conflict(format!(
                    "task {task_id} in unexpected status {}",
                    current.status
                )));
            }
            Err(err) => return Err(err),
        };

        let storage = Arc::clone(&self.storage);
        let path = flow_path(&task);
        let flow = match retry("flow fetch", || {
            let storage = Arc::clone(&storage);
            let path = path.clone();
            async move { storage.get(&path).await }
        })
        .await
        {
            Ok(flow) => flow,
            Err(err) => {
                return self
                    .fail_without_child(&task.id, TaskStatus::Running, err.to_string(), &mut mediator)
                    .await;
            }
        };

        let supervisor = Supervisor::new(&self.config);
        let handle = match supervisor.launch(&task, &flow).await {
            Ok(handle) => handle,
            Err(err) => {
                return self
                    .fail_without_child(&task.id, TaskStatus::Running, err.to_string(), &mut mediator)
                    .await;
            }
        };

        let mut handle = handle;
        let outcome = self
            .supervise(&task, &mut handle, &mut mediator, &mut child_out, &mut in_resp, &mut ctl)
            .await;
        self.finalize(&task.id, outcome, handle, &mut mediator, &mut child_out)
            .await;
        Ok(())
    }

    /// The select loop: child exit, child envelopes, consumer responses,
    /// control messages, prompt deadline, task deadline, heartbeat.
    async fn supervise(
        &self,
        task: &Task,
        handle: &mut ChildHandle,
        mediator: &mut Mediator,
        child_out: &mut EnvelopeStream,
        in_resp: &mut EnvelopeStream,
        ctl: &mut EnvelopeStream,
    ) -> Outcome {
        use futures::StreamExt;

        let grace = self.config.grace();
        let max_deadline = (task.max_duration > 0)
            .then(|| Instant::now() + Duration::from_secs(task.max_duration));
        let far_future = Instant::now() + Duration::from_secs(366 * 24 * 3600);

        let mut heartbeat = tokio::time::interval(HEARTBEAT_PERIOD);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut status = TaskStatus::Running;
        let mut out_open = true;
        let mut resp_open = true;
        let mut ctl_open = true;

        loop {
            let input_deadline = mediator.input_deadline();

            tokio::select! {
                result = handle.wait() => {
                    return match result {
                        Ok(disposition) => Outcome::from_exit(status, disposition),
                        Err(err) => Outcome::infra(status, err.to_string()),
                    };
                }

                envelope = child_out.next(), if out_open => {
                    let Some(envelope) = envelope else {
                        out_open = false;
                        continue;
                    };
                    match mediator.ingest_from_child(envelope).await {
                        Ok(Routed::PromptOpened { request_id }) => {
                            match self
                                .journal(
                                    &task.id,
                                    status,
                                    TaskStatus::WaitingForInput,
                                    TaskPatch::with_input_request(&request_id),
                                    mediator,
                                )
                                .await
                            {
                                Ok(_) => status = TaskStatus::WaitingForInput,
                                Err(err) => {
                                    let _ = control::shutdown_child(handle, grace).await;
                                    return Outcome::infra(status, err.to_string());
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(err @ RunnerError::ProtocolViolation(_)) => {
                            tracing::warn!(task_id = %task.id, error = %err, "child protocol violation");
                            let _ = control::shutdown_child(handle, grace).await;
                            return Outcome::protocol(status, err.to_string());
                        }
                        Err(err) => {
                            let _ = control::shutdown_child(handle, grace).await;
                            return Outcome::infra(status, err.to_string());
                        }
                    }
                }

                envelope = in_resp.next(), if resp_open => {
                    let Some(envelope) = envelope else {
                        resp_open = false;
                        continue;
                    };
                    match mediator.accept_response(envelope).await {
                        Ok(Routed::PromptAnswered) => {
                            match self
                                .journal(
                                    &task.id,
                                    status,
                                    TaskStatus::Running,
                                    TaskPatch::default(),
                                    mediator,
                                )
                                .await
                            {
                                Ok(_) => status = TaskStatus::Running,
                                Err(err) => {
                                    let _ = control::shutdown_child(handle, grace).await;
                                    return Outcome::infra(status, err.to_string());
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(
                            err @ (RunnerError::NotWaiting(_)
                            | RunnerError::InputMismatch(_)
                            | RunnerError::ValidationFailed(_)),
                        ) => {
                            // Late, duplicate, or malformed responses change
                            // no state.
                            tracing::debug!(task_id = %task.id, error = %err, "response rejected");
                        }
                        Err(err) => {
                            let _ = control::shutdown_child(handle, grace).await;
                            return Outcome::infra(status, err.to_string());
                        }
                    }
                }

                envelope = ctl.next(), if ctl_open => {
                    let Some(envelope) = envelope else {
                        ctl_open = false;
                        continue;
                    };
                    if envelope.is_cancel_request() {
                        tracing::info!(task_id = %task.id, "cancel requested");
                        return match control::shutdown_child(handle, grace).await {
                            Ok(disposition) => Outcome::cancelled(status, disposition),
                            Err(err) => Outcome::infra(status, err.to_string()),
                        };
                    }
                }

                _ = tokio::time::sleep_until(input_deadline.unwrap_or(far_future)),
                    if input_deadline.is_some() =>
                {
                    match mediator.expire_prompt().await {
                        Ok(Some(request_id)) => {
                            tracing::info!(
                                task_id = %task.id,
                                %request_id,
                                "input timeout, synthesized default response"
                            );
                            match self
                                .journal(
                                    &task.id,
                                    status,
                                    TaskStatus::Running,
                                    TaskPatch::default(),
                                    mediator,
                                )
                                .await
                            {
                                Ok(_) => status = TaskStatus::Running,
                                Err(err) => {
                                    let _ = control::shutdown_child(handle, grace).await;
                                    return Outcome::infra(status, err.to_string());
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            let _ = control::shutdown_child(handle, grace).await;
                            return Outcome::infra(status, err.to_string());
                        }
                    }
                }

                _ = tokio::time::sleep_until(max_deadline.unwrap_or(far_future)),
                    if max_deadline.is_some() =>
                {
                    tracing::warn!(task_id = %task.id, "maximum duration exceeded");
                    return match control::shutdown_child(handle, grace).await {
                        Ok(disposition) => Outcome::timed_out(status, disposition),
                        Err(err) => Outcome::infra(status, err.to_string()),
                    };
                }

                _ = heartbeat.tick() => {
                    if let Err(err) = self
                        .bus
                        .set_ex(&keys::alive(&task.id), "1", HEARTBEAT_TTL)
                        .await
                    {
                        tracing::debug!(task_id = %task.id, error = %err, "heartbeat write failed");
                    }
                }
            }
        }
    }

    /// Drain, archive, journal the terminal state, announce, release.
    async fn finalize(
        &self,
        task_id: &str,
        outcome: Outcome,
        mut handle: ChildHandle,
        mediator: &mut Mediator,
        child_out: &mut EnvelopeStream,
    ) {
        mediator.discard_pending();

        let drained =
            results::drain_child_output(mediator, child_out, self.config.drain_window()).await;

        let stderr = handle.stderr_tail().await;
        let mut diagnostic = outcome.detail.clone().unwrap_or_default();
        if !stderr.is_empty() {
            if !diagnostic.is_empty() {
                diagnostic.push('\n');
            }
            diagnostic.push_str(&stderr);
        }

        let archive = match results::archive_workdir(
            self.storage.as_ref(),
            task_id,
            &handle.workdir,
        )
        .await
        {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::warn!(task_id, error = %err, "result archive failed");
                None
            }
        };
        results::cleanup_workdir(&handle.workdir).await;

        let summary = results::summary(
            outcome.disposition.as_ref(),
            outcome.reason,
            Some(diagnostic.as_str()),
            archive.as_deref(),
            drained,
        );

        match self
            .journal(
                task_id,
                outcome.from,
                outcome.to,
                TaskPatch::with_results(summary.clone()),
                mediator,
            )
            .await
        {
            Ok(_) => {
                if let Err(err) = mediator.emit_termination(summary).await {
                    tracing::warn!(task_id, error = %err, "termination announce failed");
                }
            }
            Err(err) => {
                // Lost to a concurrent terminal write (reaper, admin);
                // the terminal state that won stands.
                tracing::warn!(task_id, error = %err, "terminal journal failed");
            }
        }

        let _ = self.bus.delete(&keys::alive(task_id)).await;
        tracing::info!(task_id, status = %outcome.to, "task finished");
    }

    /// Terminal failure for a task whose child never launched.
    async fn fail_without_child(
        &self,
        task_id: &str,
        from: TaskStatus,
        detail: String,
        mediator: &mut Mediator,
    ) -> RunnerResult<()> {
        let summary = results::summary(
            None,
            Some(FailureReason::Infrastructure),
            Some(detail.as_str()),
            None,
            0,
        );
        self.journal(
            task_id,
            from,
            TaskStatus::Failed,
            TaskPatch::with_results(summary.clone()),
            mediator,
        )
        .await?;
        let _ = mediator.emit_termination(summary).await;
        let _ = self.bus.delete(&keys::alive(task_id)).await;
        Ok(())
    }

    /// Journal a transition (retried on transient persistence errors),
    /// then notify observers.
    async fn journal(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        patch: TaskPatch,
        mediator: &mut Mediator,
    ) -> RunnerResult<Task> {
        let store = Arc::clone(&self.store);
        let task = retry("status journal", || {
            let store = Arc::clone(&store);
            let patch = patch.clone();
            let task_id = task_id.to_string();
            async move { store.update_status(&task_id, from, to, patch).await }
        })
        .await?;

        if let Err(err) = mediator.emit_status(to).await {
            tracing::warn!(task_id, status = %to, error = %err, "status announce failed");
        }
        Ok(task)
    }
}
