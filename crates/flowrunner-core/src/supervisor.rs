//! Process Supervisor — owns child processes.
//!
//! Launch prepares a fresh isolated working directory, materializes the
//! flow file there, and starts the child in its own process group so that
//! signals reach descendants. Domain I/O travels over the Stream Bus (the
//! child is handed its task id and channel names through environment
//! variables); the supervisor only captures stderr as an opaque failure
//! diagnostic.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use flowrunner_proto::{RunnerError, RunnerResult, Task};

use crate::bus::keys;
use crate::config::Config;

/// Bytes of stderr kept as the failure diagnostic.
const STDERR_TAIL_LIMIT: usize = 16 * 1024;

/// Signals the supervisor can deliver to a child's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sig {
    Term,
    Kill,
}

/// How a child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitDisposition {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub success: bool,
}

impl From<std::process::ExitStatus> for ExitDisposition {
    #[cfg(unix)]
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        Self {
            code: status.code(),
            signal: status.signal(),
            success: status.success(),
        }
    }

    #[cfg(not(unix))]
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: None,
            success: status.success(),
        }
    }
}

/// Launches children for tasks.
pub struct Supervisor {
    agent_cmd: String,
    bus_url: String,
    workdir_base: PathBuf,
}

impl Supervisor {
    pub fn new(config: &Config) -> Self {
        Self {
            agent_cmd: config.agent_cmd.clone(),
            bus_url: config.bus_url.clone(),
            workdir_base: config.storage_dir.join("work"),
        }
    }

    /// Provision the isolated environment and start the child.
    pub async fn launch(&self, task: &Task, flow: &[u8]) -> RunnerResult<ChildHandle> {
        let workdir = self.workdir_base.join(&task.id);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| RunnerError::Internal(format!("workdir {}: {e}", workdir.display())))?;
        tokio::fs::write(workdir.join(&task.file_name), flow)
            .await
            .map_err(|e| RunnerError::Internal(format!("materialize flow: {e}")))?;

        let mut parts = self.agent_cmd.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| RunnerError::ValidationFailed("agent command is empty".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(parts)
            .arg(&task.file_name)
            .current_dir(&workdir)
            .env("FLOWRUNNER_TASK_ID", &task.id)
            .env("FLOWRUNNER_BUS_URL", &self.bus_url)
            .env("FLOWRUNNER_CHANNEL_OUT", keys::child_out(&task.id))
            .env("FLOWRUNNER_CHANNEL_IN", keys::child_in(&task.id))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // New process group, so cancellation can signal the whole tree.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::Internal(format!("spawn {program:?}: {e}")))?;

        let pgid = child.id().map(|pid| pid as i32);
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_tail(s)));

        tracing::info!(
            task_id = %task.id,
            workdir = %workdir.display(),
            pid = ?child.id(),
            "child launched"
        );

        Ok(ChildHandle {
            task_id: task.id.clone(),
            workdir,
            child,
            pgid,
            stderr_task,
            reaped: false,
        })
    }
}

async fn read_tail(mut stderr: ChildStderr) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_LIMIT {
                    let cut = tail.len() - STDERR_TAIL_LIMIT;
                    tail.drain(..cut);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// A running (or exited) child owned by one task.
pub struct ChildHandle {
    pub task_id: String,
    pub workdir: PathBuf,
    child: Child,
    pgid: Option<i32>,
    stderr_task: Option<JoinHandle<String>>,
    reaped: bool,
}

impl ChildHandle {
    /// Deliver a signal to the child's process group.
    pub fn signal(&mut self, sig: Sig) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            let signo = match sig {
                Sig::Term => libc::SIGTERM,
                Sig::Kill => libc::SIGKILL,
            };
            unsafe {
                libc::kill(-pgid, signo);
            }
            return;
        }

        if sig == Sig::Kill {
            let _ = self.child.start_kill();
        }
    }

    /// Wait for the child to exit. Cancel-safe.
    pub async fn wait(&mut self) -> RunnerResult<ExitDisposition> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| RunnerError::Internal(format!("wait on child: {e}")))?;
        self.reaped = true;
        Ok(status.into())
    }

    /// The captured stderr tail, available after exit.
    pub async fn stderr_tail(&mut self) -> String {
        match self.stderr_task.take() {
            Some(handle) => {
                match tokio::time::timeout(std::time::Duration::from_secs(2), handle).await {
                    Ok(Ok(tail)) => tail,
                    _ => String::new(),
                }
            }
            None => String::new(),
        }
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        if !self.reaped {
            self.signal(Sig::Kill);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Config;

    fn supervisor(dir: &std::path::Path) -> Supervisor {
        let mut config = Config::default();
        config.storage_dir = dir.to_path_buf();
        config.agent_cmd = "true".into();
        Supervisor::new(&config)
    }

    #[tokio::test]
    async fn test_launch_materializes_flow_and_exits_clean() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let task = Task::new("acme", "demo.flow", 180, 0);

        let mut handle = sup.launch(&task, b"flow-bytes").await.unwrap();
        let disposition = handle.wait().await.unwrap();
        assert!(disposition.success);
        assert_eq!(disposition.code, Some(0));

        let written = std::fs::read(handle.workdir.join("demo.flow")).unwrap();
        assert_eq!(written, b"flow-bytes");
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.agent_cmd = "false".into();
        let sup = Supervisor::new(&config);
        let task = Task::new("acme", "demo.flow", 180, 0);

        let mut handle = sup.launch(&task, b"x").await.unwrap();
        let disposition = handle.wait().await.unwrap();
        assert!(!disposition.success);
        assert_eq!(disposition.code, Some(1));
        assert_eq!(disposition.signal, None);
    }

    #[tokio::test]
    async fn test_kill_reports_signal_disposition() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.agent_cmd = "sh".into();
        let sup = Supervisor::new(&config);
        let task = Task::new("acme", "napping.sh", 180, 0);

        let mut handle = sup.launch(&task, b"sleep 30\n").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        handle.signal(Sig::Kill);
        let disposition = handle.wait().await.unwrap();
        assert!(!disposition.success);
        assert_eq!(disposition.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_missing_program_fails_launch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.agent_cmd = "definitely-not-a-real-binary".into();
        let sup = Supervisor::new(&config);
        let task = Task::new("acme", "demo.flow", 180, 0);

        assert!(sup.launch(&task, b"x").await.is_err());
    }
}
