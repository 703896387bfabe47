//! Task — one execution of one agent-flow file.
//!
//! Tasks have a bounded lifetime with well-defined terminal states:
//!
//! ```text
//! PENDING ──dispatch──► RUNNING ◄──response / input-timeout──┐
//!    │                     │ ──child prompts──► WAITING_FOR_INPUT
//!    │                     │
//!    └──cancel──► CANCELLED (terminal)
//!                 COMPLETED (terminal, child exit 0)
//!                 FAILED    (terminal, non-zero exit / protocol / timeout)
//! ```
//!
//! Invariants: a task outside a terminal state is "active" and counts
//! against its client's quota; `input_request_id` is non-null exactly while
//! the task is `WAITING_FOR_INPUT`; `ended_at` is set exactly on terminal
//! states.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A task — one execution of one flow with an owner and a lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier for this task.
    pub id: String,

    /// The client that submitted the task.
    pub client_id: String,

    /// Identifier of the uploaded flow artifact.
    pub flow_id: String,

    /// Original filename of the flow artifact.
    pub file_name: String,

    /// Current lifecycle state.
    pub status: TaskStatus,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the task record was last written.
    pub updated_at: DateTime<Utc>,

    /// When the task was dispatched to a worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Seconds an outstanding prompt may wait before a default answer is
    /// synthesized.
    pub input_timeout: u64,

    /// Maximum task runtime in seconds. `0` disables the bound.
    pub max_duration: u64,

    /// Correlation id of the outstanding prompt, while waiting for input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_request_id: Option<String>,

    /// Results summary attached on the terminal transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,

    /// Soft-deleted records are hidden from listings until purged.
    #[serde(default)]
    pub soft_deleted: bool,

    /// Monotonically increasing status version, for optimistic concurrency.
    #[serde(default)]
    pub version: u64,
}

impl Task {
    /// Create a pending task for `client_id` with a generated id.
    pub fn new(
        client_id: impl Into<String>,
        file_name: impl Into<String>,
        input_timeout: u64,
        max_duration: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.into(),
            flow_id: Uuid::new_v4().to_string(),
            file_name: file_name.into(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            input_timeout,
            max_duration,
            input_request_id: None,
            results: None,
            soft_deleted: false,
            version: 0,
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Active tasks count against the per-client quota.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Transition the task to a new state, enforcing the lifecycle guards.
    ///
    /// Side effects on success: `updated_at` and `version` advance,
    /// `started_at` is stamped on dispatch, `ended_at` on terminal states,
    /// and `input_request_id` is cleared whenever the task leaves
    /// `WAITING_FOR_INPUT`.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.may_transition_to(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }

        let now = Utc::now();
        if self.status == TaskStatus::Pending && to == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if to != TaskStatus::WaitingForInput {
            self.input_request_id = None;
        }
        if to.is_terminal() {
            self.ended_at = Some(now);
        }
        self.status = to;
        self.updated_at = now;
        self.version += 1;
        Ok(())
    }
}

/// The lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Accepted and queued, not yet dispatched.
    Pending,

    /// A worker is executing the child process.
    Running,

    /// The child is blocked on an outstanding input prompt.
    WaitingForInput,

    /// Child exited 0 (terminal).
    Completed,

    /// Child exited non-zero, violated the protocol, exceeded its maximum
    /// duration, or infrastructure gave up (terminal).
    Failed,

    /// Cancelled by the client or an administrator (terminal).
    Cancelled,
}

impl TaskStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// The transition guard of the task state machine.
    pub fn may_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, WaitingForInput) => true,
            (WaitingForInput, Running) => true,
            (Running | WaitingForInput, Completed | Failed | Cancelled) => true,
            // Pending tasks that never dispatch can still fail on
            // infrastructure grounds (reaper).
            (Pending, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::WaitingForInput => "WAITING_FOR_INPUT",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Machine-readable reason attached to a FAILED task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Maximum task duration exceeded.
    Timeout,
    /// The child violated the stream protocol.
    Protocol,
    /// Transient infrastructure errors exhausted their retries, or the
    /// owning worker disappeared.
    Infrastructure,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Protocol => "protocol",
            FailureReason::Infrastructure => "infrastructure",
        };
        write!(f, "{s}")
    }
}

/// Error for transitions the lifecycle guard rejects.
#[derive(Debug)]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid task transition from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// One page of task records for the authenticated client.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskPage {
    pub items: Vec<Task>,
    pub page: usize,
    pub size: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("client-1", "greet.flow", 180, 0)
    }

    #[test]
    fn test_task_lifecycle() {
        let mut t = task();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.is_active());
        assert!(t.started_at.is_none());

        t.transition(TaskStatus::Running).unwrap();
        assert!(t.started_at.is_some());
        assert!(t.ended_at.is_none());

        t.transition(TaskStatus::WaitingForInput).unwrap();
        t.input_request_id = Some("R1".into());

        t.transition(TaskStatus::Running).unwrap();
        assert_eq!(t.input_request_id, None);

        t.transition(TaskStatus::Completed).unwrap();
        assert!(t.is_terminal());
        assert!(t.ended_at.is_some());

        // No transition out of a terminal state.
        assert!(t.transition(TaskStatus::Running).is_err());
        assert!(t.transition(TaskStatus::Cancelled).is_err());
    }

    #[test]
    fn test_cancel_before_dispatch() {
        let mut t = task();
        t.transition(TaskStatus::Cancelled).unwrap();
        assert!(t.is_terminal());
        assert!(t.started_at.is_none());
        assert!(t.ended_at.is_some());
    }

    #[test]
    fn test_waiting_requires_running() {
        let mut t = task();
        assert!(t.transition(TaskStatus::WaitingForInput).is_err());
        t.transition(TaskStatus::Running).unwrap();
        t.transition(TaskStatus::WaitingForInput).unwrap();
        t.transition(TaskStatus::Cancelled).unwrap();
    }

    #[test]
    fn test_version_advances_per_transition() {
        let mut t = task();
        t.transition(TaskStatus::Running).unwrap();
        t.transition(TaskStatus::Completed).unwrap();
        assert_eq!(t.version, 2);
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&TaskStatus::WaitingForInput).unwrap();
        assert_eq!(json, "\"WAITING_FOR_INPUT\"");
        let t = task();
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"status\":\"PENDING\""));
        assert!(json.contains("\"clientId\""));
    }
}
