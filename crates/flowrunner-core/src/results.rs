//! Result Collector & Cleanup.
//!
//! On any terminal transition: drain straggler output from the child's
//! egress channel within a bounded window, package the isolated working
//! directory into a gzipped tar stored through the object storage
//! collaborator, attach a results summary to the task record, and tear the
//! working directory down. Cleanup failures are logged and never change
//! the task's terminal status.

use std::path::Path;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::time::Instant;

use flowrunner_proto::{EnvelopeBody, FailureReason, RunnerResult};

use crate::bus::EnvelopeStream;
use crate::mediator::Mediator;
use crate::storage::{archive_path, ObjectStore};
use crate::supervisor::ExitDisposition;

/// Forward any print envelopes still in flight after exit. Returns the
/// number of envelopes drained.
pub async fn drain_child_output(
    mediator: &mut Mediator,
    child_out: &mut EnvelopeStream,
    window: Duration,
) -> usize {
    use futures::StreamExt;

    let deadline = Instant::now() + window;
    let mut drained = 0usize;
    loop {
        let envelope = match tokio::time::timeout_at(deadline, child_out.next()).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) | Err(_) => break,
        };
        match &envelope.body {
            EnvelopeBody::Print { .. } => {
                if mediator.ingest_from_child(envelope).await.is_ok() {
                    drained += 1;
                }
            }
            // Prompts after exit have no one to answer them.
            _ => tracing::debug!(kind = envelope.kind(), "ignoring post-exit envelope"),
        }
    }
    drained
}

/// Package the working directory and store it. Returns the archive's
/// storage path.
pub async fn archive_workdir(
    storage: &dyn ObjectStore,
    task_id: &str,
    workdir: &Path,
) -> RunnerResult<String> {
    let root = workdir.to_path_buf();
    let bytes = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", &root)?;
        builder.into_inner()?.finish()
    })
    .await
    .map_err(|e| flowrunner_proto::RunnerError::Internal(format!("archive task: {e}")))?
    .map_err(|e| flowrunner_proto::RunnerError::Internal(format!("archive build: {e}")))?;

    let path = archive_path(task_id);
    storage.put(&path, &bytes).await?;
    Ok(path)
}

/// Remove the isolated working directory. Best effort.
pub async fn cleanup_workdir(workdir: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(workdir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(
                workdir = %workdir.display(),
                error = %err,
                "failed to remove working directory"
            );
        }
    }
}

/// The results summary attached to the task record on terminal transition.
pub fn summary(
    disposition: Option<&ExitDisposition>,
    reason: Option<FailureReason>,
    diagnostic: Option<&str>,
    archive: Option<&str>,
    drained: usize,
) -> serde_json::Value {
    let mut value = serde_json::json!({
        "exit_code": disposition.and_then(|d| d.code),
        "signal": disposition.and_then(|d| d.signal),
        "drained": drained,
    });
    let map = value.as_object_mut().expect("summary is an object");
    if let Some(reason) = reason {
        map.insert("reason".into(), serde_json::json!(reason.to_string()));
    }
    if let Some(diagnostic) = diagnostic.filter(|d| !d.is_empty()) {
        map.insert("diagnostic".into(), serde_json::json!(diagnostic));
    }
    if let Some(archive) = archive {
        map.insert("archive".into(), serde_json::json!(archive));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsObjectStore;
    use flate2::read::GzDecoder;

    #[tokio::test]
    async fn test_archive_round_trip() {
        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("output.txt"), b"hello").unwrap();

        let storage_dir = tempfile::tempdir().unwrap();
        let storage = FsObjectStore::new(storage_dir.path());

        let path = archive_workdir(&storage, "t-1", work.path()).await.unwrap();
        assert_eq!(path, "results/t-1.tar.gz");

        let bytes = storage.get(&path).await.unwrap();
        assert!(!bytes.is_empty());

        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n.contains("output.txt")));
    }

    #[tokio::test]
    async fn test_cleanup_tolerates_missing_dir() {
        cleanup_workdir(Path::new("/definitely/not/here")).await;
    }

    #[test]
    fn test_summary_shape() {
        let disposition = ExitDisposition {
            code: Some(1),
            signal: None,
            success: false,
        };
        let value = summary(
            Some(&disposition),
            Some(FailureReason::Protocol),
            Some("duplicate prompt"),
            Some("results/t-1.tar.gz"),
            2,
        );
        assert_eq!(value["exit_code"], 1);
        assert_eq!(value["reason"], "protocol");
        assert_eq!(value["diagnostic"], "duplicate prompt");
        assert_eq!(value["archive"], "results/t-1.tar.gz");
        assert_eq!(value["drained"], 2);
    }

    #[test]
    fn test_summary_omits_empty_diagnostic() {
        let value = summary(None, None, Some(""), None, 0);
        assert!(value.get("diagnostic").is_none());
        assert!(value.get("reason").is_none());
    }
}
