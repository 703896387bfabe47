//! Object storage collaborator.
//!
//! Flow artifacts go in at submission; result archives come out of the
//! collector. The bundled implementation is a local directory tree; an
//! S3-style backend plugs in behind the same trait.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use flowrunner_proto::{RunnerError, RunnerResult, Task};

/// Storage path of a task's uploaded flow artifact.
pub fn flow_path(task: &Task) -> String {
    format!("flows/{}/{}", task.flow_id, task.file_name)
}

/// Storage path of a task's result archive.
pub fn archive_path(task_id: &str) -> String {
    format!("results/{task_id}.tar.gz")
}

/// The object storage abstraction.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, data: &[u8]) -> RunnerResult<()>;
    async fn get(&self, path: &str) -> RunnerResult<Vec<u8>>;
    async fn delete(&self, path: &str) -> RunnerResult<()>;
}

/// Objects as files under a root directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve an object path under the root, rejecting traversal.
    fn resolve(&self, path: &str) -> RunnerResult<PathBuf> {
        let rel = Path::new(path);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !clean {
            return Err(RunnerError::ValidationFailed(format!(
                "invalid object path {path:?}"
            )));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, data: &[u8]) -> RunnerResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RunnerError::StorageUnavailable(e.to_string()))?;
        }
        tokio::fs::write(&full, data)
            .await
            .map_err(|e| RunnerError::StorageUnavailable(e.to_string()))
    }

    async fn get(&self, path: &str) -> RunnerResult<Vec<u8>> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RunnerError::NotFound(format!("object {path}")))
            }
            Err(e) => Err(RunnerError::StorageUnavailable(e.to_string())),
        }
    }

    async fn delete(&self, path: &str) -> RunnerResult<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RunnerError::StorageUnavailable(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store.put("flows/f-1/hello.flow", b"content").await.unwrap();
        assert_eq!(store.get("flows/f-1/hello.flow").await.unwrap(), b"content");

        store.delete("flows/f-1/hello.flow").await.unwrap();
        let err = store.get("flows/f-1/hello.flow").await.unwrap_err();
        assert!(matches!(err, RunnerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.delete("results/none.tar.gz").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.get("../escape").await.is_err());
        assert!(store.put("/abs/path", b"x").await.is_err());
        assert!(store.put("", b"x").await.is_err());
    }
}
