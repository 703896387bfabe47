//! Persistent store collaborator for task records.
//!
//! Status transitions are compare-and-swap on the current status, so the
//! single authoritative writer per task (the owning worker's control loop)
//! can never be silently overtaken by the reconciler or the HTTP surface.
//! Every transition is journaled here before observers are notified.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use flowrunner_proto::{RunnerError, RunnerResult, Task, TaskPage, TaskStatus};

/// Fields an update may set alongside a status transition.
#[derive(Debug, Default, Clone)]
pub struct TaskPatch {
    /// `Some(Some(id))` records the outstanding prompt; `Some(None)`
    /// clears it explicitly. Leaving `WAITING_FOR_INPUT` always clears it.
    pub input_request_id: Option<Option<String>>,

    /// Results summary, attached on terminal transitions.
    pub results: Option<serde_json::Value>,
}

impl TaskPatch {
    pub fn with_input_request(request_id: impl Into<String>) -> Self {
        Self {
            input_request_id: Some(Some(request_id.into())),
            ..Self::default()
        }
    }

    pub fn with_results(results: serde_json::Value) -> Self {
        Self {
            results: Some(results),
            ..Self::default()
        }
    }

    fn apply(self, task: &mut Task) {
        if let Some(request_id) = self.input_request_id {
            task.input_request_id = request_id;
        }
        if let Some(results) = self.results {
            task.results = Some(results);
        }
    }
}

/// The persistence abstraction consumed by the core.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new record; the id must be unused.
    async fn create(&self, task: &Task) -> RunnerResult<()>;

    /// Fetch one record (soft-deleted included).
    async fn get(&self, id: &str) -> RunnerResult<Task>;

    /// Transition `from → to` with CAS on `from`; `Conflict` when the
    /// stored status differs or the lifecycle guard rejects the move.
    async fn update_status(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        patch: TaskPatch,
    ) -> RunnerResult<Task>;

    /// One page of the client's records, newest submissions last,
    /// soft-deleted hidden.
    async fn list(&self, client_id: &str, page: usize, size: usize) -> RunnerResult<TaskPage>;

    /// Number of the client's non-terminal tasks (the quota input).
    async fn count_active(&self, client_id: &str) -> RunnerResult<usize>;

    /// All non-terminal tasks, for the reconciler.
    async fn list_active(&self) -> RunnerResult<Vec<Task>>;

    /// Terminal tasks that ended before `cutoff`, for retention cleanup.
    async fn list_terminal_before(&self, cutoff: DateTime<Utc>) -> RunnerResult<Vec<Task>>;

    /// Hide a record from listings.
    async fn soft_delete(&self, id: &str) -> RunnerResult<()>;

    /// Remove a record permanently.
    async fn purge(&self, id: &str) -> RunnerResult<()>;
}

fn transition_record(
    mut task: Task,
    from: TaskStatus,
    to: TaskStatus,
    patch: TaskPatch,
) -> RunnerResult<Task> {
    if task.status != from {
        return Err(RunnerError::Conflict(format!(
            "task {} is {}, expected {from}",
            task.id, task.status
        )));
    }
    task.transition(to)?;
    patch.apply(&mut task);
    Ok(task)
}

// ── In-memory store ──────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    tasks: HashMap<String, Task>,
    order: Vec<String>,
}

/// Process-local [`TaskStore`] for tests and single-node development.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: &Task) -> RunnerResult<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.tasks.contains_key(&task.id) {
            return Err(RunnerError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        inner.order.push(task.id.clone());
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> RunnerResult<Task> {
        self.inner
            .read()
            .unwrap()
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| RunnerError::NotFound(format!("task {id}")))
    }

    async fn update_status(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        patch: TaskPatch,
    ) -> RunnerResult<Task> {
        let mut inner = self.inner.write().unwrap();
        let current = inner
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| RunnerError::NotFound(format!("task {id}")))?;
        let updated = transition_record(current, from, to, patch)?;
        inner.tasks.insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn list(&self, client_id: &str, page: usize, size: usize) -> RunnerResult<TaskPage> {
        let inner = self.inner.read().unwrap();
        let matching: Vec<Task> = inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|t| t.client_id == client_id && !t.soft_deleted)
            .cloned()
            .collect();
        Ok(paginate(matching, page, size))
    }

    async fn count_active(&self, client_id: &str) -> RunnerResult<usize> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.client_id == client_id && t.is_active())
            .count())
    }

    async fn list_active(&self) -> RunnerResult<Vec<Task>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.tasks.values().filter(|t| t.is_active()).cloned().collect())
    }

    async fn list_terminal_before(&self, cutoff: DateTime<Utc>) -> RunnerResult<Vec<Task>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.is_terminal() && t.ended_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect())
    }

    async fn soft_delete(&self, id: &str) -> RunnerResult<()> {
        let mut inner = self.inner.write().unwrap();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| RunnerError::NotFound(format!("task {id}")))?;
        task.soft_deleted = true;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn purge(&self, id: &str) -> RunnerResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.tasks.remove(id);
        inner.order.retain(|t| t != id);
        Ok(())
    }
}

fn paginate(items: Vec<Task>, page: usize, size: usize) -> TaskPage {
    let size = size.clamp(1, 100);
    let total = items.len();
    let start = page.saturating_mul(size).min(total);
    let end = (start + size).min(total);
    TaskPage {
        items: items[start..end].to_vec(),
        page,
        size,
        total,
    }
}

// ── Redis store ──────────────────────────────────────────────

const TASK_INDEX: &str = "tasks:index";

/// Lua CAS: replace the record only while its status still matches.
const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if not cur then return -1 end
if cjson.decode(cur)['status'] ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

/// [`TaskStore`] over Redis: JSON records under `task:{id}` plus a global
/// creation-ordered index list.
pub struct RedisTaskStore {
    conn: ConnectionManager,
    cas: redis::Script,
}

impl RedisTaskStore {
    pub async fn connect(url: &str) -> RunnerResult<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = client.get_connection_manager().await.map_err(store_err)?;
        Ok(Self {
            conn,
            cas: redis::Script::new(CAS_SCRIPT),
        })
    }

    fn key(id: &str) -> String {
        format!("task:{id}")
    }

    async fn load_all(&self) -> RunnerResult<Vec<Task>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.lrange(TASK_INDEX, 0, -1).await.map_err(store_err)?;
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn.get(Self::key(&id)).await.map_err(store_err)?;
            if let Some(raw) = raw {
                tasks.push(decode_task(&raw)?);
            }
        }
        Ok(tasks)
    }
}

fn store_err(err: redis::RedisError) -> RunnerError {
    RunnerError::PersistenceUnavailable(err.to_string())
}

fn encode_task(task: &Task) -> RunnerResult<String> {
    serde_json::to_string(task).map_err(|e| RunnerError::Internal(format!("task encode: {e}")))
}

fn decode_task(raw: &str) -> RunnerResult<Task> {
    serde_json::from_str(raw)
        .map_err(|e| RunnerError::PersistenceUnavailable(format!("corrupt task record: {e}")))
}

fn status_wire(status: TaskStatus) -> String {
    status.to_string()
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn create(&self, task: &Task) -> RunnerResult<()> {
        let mut conn = self.conn.clone();
        let fresh: bool = conn
            .set_nx(Self::key(&task.id), encode_task(task)?)
            .await
            .map_err(store_err)?;
        if !fresh {
            return Err(RunnerError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        let _: i64 = conn.rpush(TASK_INDEX, &task.id).await.map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> RunnerResult<Task> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::key(id)).await.map_err(store_err)?;
        match raw {
            Some(raw) => decode_task(&raw),
            None => Err(RunnerError::NotFound(format!("task {id}"))),
        }
    }

    async fn update_status(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        patch: TaskPatch,
    ) -> RunnerResult<Task> {
        let current = self.get(id).await?;
        let updated = transition_record(current, from, to, patch)?;

        let mut conn = self.conn.clone();
        let verdict: i64 = self
            .cas
            .key(Self::key(id))
            .arg(status_wire(from))
            .arg(encode_task(&updated)?)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        match verdict {
            1 => Ok(updated),
            0 => Err(RunnerError::Conflict(format!(
                "task {id} changed status concurrently"
            ))),
            _ => Err(RunnerError::NotFound(format!("task {id}"))),
        }
    }

    async fn list(&self, client_id: &str, page: usize, size: usize) -> RunnerResult<TaskPage> {
        let matching: Vec<Task> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|t| t.client_id == client_id && !t.soft_deleted)
            .collect();
        Ok(paginate(matching, page, size))
    }

    async fn count_active(&self, client_id: &str) -> RunnerResult<usize> {
        Ok(self
            .load_all()
            .await?
            .iter()
            .filter(|t| t.client_id == client_id && t.is_active())
            .count())
    }

    async fn list_active(&self) -> RunnerResult<Vec<Task>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(Task::is_active)
            .collect())
    }

    async fn list_terminal_before(&self, cutoff: DateTime<Utc>) -> RunnerResult<Vec<Task>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|t| t.is_terminal() && t.ended_at.is_some_and(|at| at < cutoff))
            .collect())
    }

    async fn soft_delete(&self, id: &str) -> RunnerResult<()> {
        // Record-level flag flip; transitions still go through the CAS path.
        let mut task = self.get(id).await?;
        task.soft_deleted = true;
        task.updated_at = Utc::now();
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(Self::key(id), encode_task(&task)?)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn purge(&self, id: &str) -> RunnerResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(Self::key(id)).await.map_err(store_err)?;
        let _: i64 = conn.lrem(TASK_INDEX, 0, id).await.map_err(store_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(client: &str) -> Task {
        Task::new(client, "demo.flow", 180, 0)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryTaskStore::new();
        let t = task("acme");
        store.create(&t).await.unwrap();
        let loaded = store.get(&t.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);

        let err = store.create(&t).await.unwrap_err();
        assert!(matches!(err, RunnerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cas_transition() {
        let store = MemoryTaskStore::new();
        let t = task("acme");
        store.create(&t).await.unwrap();

        let running = store
            .update_status(&t.id, TaskStatus::Pending, TaskStatus::Running, TaskPatch::default())
            .await
            .unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());
        assert_eq!(running.version, 1);

        // Stale CAS loses.
        let err = store
            .update_status(&t.id, TaskStatus::Pending, TaskStatus::Running, TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_waiting_patch_sets_and_clears_request_id() {
        let store = MemoryTaskStore::new();
        let t = task("acme");
        store.create(&t).await.unwrap();
        store
            .update_status(&t.id, TaskStatus::Pending, TaskStatus::Running, TaskPatch::default())
            .await
            .unwrap();

        let waiting = store
            .update_status(
                &t.id,
                TaskStatus::Running,
                TaskStatus::WaitingForInput,
                TaskPatch::with_input_request("R1"),
            )
            .await
            .unwrap();
        assert_eq!(waiting.input_request_id.as_deref(), Some("R1"));

        let resumed = store
            .update_status(
                &t.id,
                TaskStatus::WaitingForInput,
                TaskStatus::Running,
                TaskPatch::default(),
            )
            .await
            .unwrap();
        assert_eq!(resumed.input_request_id, None);
    }

    #[tokio::test]
    async fn test_quota_counting_ignores_terminal() {
        let store = MemoryTaskStore::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let t = task("acme");
            ids.push(t.id.clone());
            store.create(&t).await.unwrap();
        }
        store.create(&task("other")).await.unwrap();
        assert_eq!(store.count_active("acme").await.unwrap(), 3);

        store
            .update_status(&ids[0], TaskStatus::Pending, TaskStatus::Cancelled, TaskPatch::default())
            .await
            .unwrap();
        assert_eq!(store.count_active("acme").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_list_pagination_hides_soft_deleted() {
        let store = MemoryTaskStore::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let t = task("acme");
            ids.push(t.id.clone());
            store.create(&t).await.unwrap();
        }
        store.soft_delete(&ids[0]).await.unwrap();

        let page = store.list("acme", 0, 3).await.unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.items[0].id, ids[1]);

        let page = store.list("acme", 1, 3).await.unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn test_retention_listing() {
        let store = MemoryTaskStore::new();
        let t = task("acme");
        store.create(&t).await.unwrap();
        store
            .update_status(&t.id, TaskStatus::Pending, TaskStatus::Cancelled, TaskPatch::default())
            .await
            .unwrap();

        let future = Utc::now() + chrono::Duration::days(1);
        let expired = store.list_terminal_before(future).await.unwrap();
        assert_eq!(expired.len(), 1);

        let past = Utc::now() - chrono::Duration::days(1);
        assert!(store.list_terminal_before(past).await.unwrap().is_empty());
    }
}
