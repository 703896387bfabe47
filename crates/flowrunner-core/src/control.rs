//! Cancellation & timeout control.
//!
//! Cancellation sources — explicit client request, administrator action,
//! max-duration — all converge on the task's control channel and on signal
//! escalation at the supervisor boundary: SIGTERM, a grace window, then
//! SIGKILL. Cancellation is idempotent; a cancel after termination is a
//! no-op.

use std::time::Duration;

use flowrunner_proto::{Envelope, RunnerResult};

use crate::bus::{keys, retry, StreamBus};
use crate::supervisor::{ChildHandle, ExitDisposition, Sig};

/// Ask the task's owning control actor to cancel. Safe to call from any
/// process; the actor is the only writer of the CANCELLED transition.
pub async fn request_cancel(bus: &dyn StreamBus, task_id: &str) -> RunnerResult<()> {
    let topic = keys::ctl(task_id);
    let envelope = Envelope::cancel_request(task_id);
    retry("cancel request", || async {
        bus.publish(&topic, &envelope).await
    })
    .await
}

/// Terminate a child: SIGTERM, wait out the grace window, then SIGKILL.
pub async fn shutdown_child(
    handle: &mut ChildHandle,
    grace: Duration,
) -> RunnerResult<ExitDisposition> {
    handle.signal(Sig::Term);
    match tokio::time::timeout(grace, handle.wait()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(task_id = %handle.task_id, "grace window elapsed, sending SIGKILL");
            handle.signal(Sig::Kill);
            handle.wait().await
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::supervisor::Supervisor;
    use flowrunner_proto::Task;

    #[tokio::test]
    async fn test_shutdown_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.agent_cmd = "sh".into();
        let sup = Supervisor::new(&config);
        let task = Task::new("acme", "stubborn.sh", 180, 0);

        // A flow that ignores SIGTERM, so only SIGKILL ends it.
        let mut handle = sup
            .launch(&task, b"trap '' TERM\nsleep 30\n")
            .await
            .unwrap();
        // Let the shell install its trap before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let disposition = shutdown_child(&mut handle, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(disposition.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_shutdown_honors_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.agent_cmd = "sh".into();
        let sup = Supervisor::new(&config);
        let task = Task::new("acme", "patient.sh", 180, 0);

        let mut handle = sup.launch(&task, b"sleep 30\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let disposition = shutdown_child(&mut handle, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(disposition.signal, Some(libc::SIGTERM));
    }
}
