//! Task endpoints: submit, fetch, list, cancel, input injection,
//! download, delete.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use flowrunner_core::bus::keys;
use flowrunner_core::storage::archive_path;
use flowrunner_core::SubmitOptions;
use flowrunner_proto::{Envelope, RunnerError, Task, TaskPage, TaskStatus};

use super::error::{ApiError, ApiResult};
use super::{AppState, Authenticated};

/// POST /tasks — multipart submission with a `file` part and optional
/// `input_timeout` / `max_duration` fields.
pub async fn submit(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut input_timeout: Option<u64> = None;
    let mut max_duration: Option<u64> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RunnerError::ValidationFailed(format!("multipart: {e}")))?
    {
        match field.name() {
            Some("file") => {
                let name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        RunnerError::ValidationFailed("file part needs a filename".into())
                    })?;
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| RunnerError::ValidationFailed(format!("file part: {e}")))?;
                file = Some((name, data.to_vec()));
            }
            Some("input_timeout") => {
                input_timeout = Some(parse_seconds(&field_text(field).await?, "input_timeout")?);
            }
            Some("max_duration") => {
                max_duration = Some(parse_seconds(&field_text(field).await?, "max_duration")?);
            }
            _ => {}
        }
    }

    let (file_name, data) = file.ok_or_else(|| {
        ApiError(RunnerError::ValidationFailed(
            "multipart field `file` is required".into(),
        ))
    })?;

    let task = state
        .scheduler
        .submit(
            &claims.subject,
            &data,
            SubmitOptions {
                file_name,
                input_timeout,
                max_duration,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(|e| ApiError(RunnerError::ValidationFailed(format!("multipart: {e}"))))
}

fn parse_seconds(raw: &str, what: &str) -> Result<u64, ApiError> {
    raw.trim().parse().map_err(|_| {
        ApiError(RunnerError::ValidationFailed(format!(
            "{what} must be a non-negative number of seconds"
        )))
    })
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub size: usize,
}

fn default_page_size() -> usize {
    20
}

/// GET /tasks
pub async fn list(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<TaskPage>> {
    let page = state
        .store
        .list(&claims.subject, query.page, query.size)
        .await?;
    Ok(Json(page))
}

/// GET /tasks/{id}
pub async fn fetch(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Task>> {
    let task = state.scheduler.owned(&claims.subject, &task_id).await?;
    Ok(Json(task))
}

/// POST /tasks/{id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Task>> {
    let task = state.scheduler.cancel(&claims.subject, &task_id).await?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct InputBody {
    pub request_id: String,
    pub data: serde_json::Value,
}

/// POST /tasks/{id}/input — single-shot injection of an input_response.
///
/// Verifies the task is waiting and the request_id matches before handing
/// the response to the mediator; the actor's own validation decides the
/// race against a concurrent WebSocket answer (first acceptance wins).
pub async fn input(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Path(task_id): Path<String>,
    Json(body): Json<InputBody>,
) -> ApiResult<StatusCode> {
    let task = state.scheduler.owned(&claims.subject, &task_id).await?;
    if task.status != TaskStatus::WaitingForInput {
        return Err(ApiError(RunnerError::NotWaiting(format!(
            "task {task_id} is {}",
            task.status
        ))));
    }
    match &task.input_request_id {
        Some(outstanding) if *outstanding == body.request_id => {}
        outstanding => {
            return Err(ApiError(RunnerError::InputMismatch(format!(
                "expected {}, got {}",
                outstanding.as_deref().unwrap_or("none"),
                body.request_id
            ))));
        }
    }

    state
        .bus
        .publish(
            &keys::in_resp(&task_id),
            &Envelope::input_response(&task_id, &body.request_id, body.data),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /tasks/{id}/download — the result archive of a terminal task.
pub async fn download(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Path(task_id): Path<String>,
) -> ApiResult<Response> {
    let task = state.scheduler.owned(&claims.subject, &task_id).await?;
    if !task.is_terminal() {
        return Err(ApiError(RunnerError::Conflict(format!(
            "task {task_id} is {}; results are available after termination",
            task.status
        ))));
    }
    let bytes = state.storage.get(&archive_path(&task_id)).await?;
    let headers = [
        (header::CONTENT_TYPE, "application/gzip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{task_id}.tar.gz\""),
        ),
    ];
    Ok((headers, bytes).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
}

/// DELETE /tasks/{id}
pub async fn delete(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Path(task_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<StatusCode> {
    state
        .scheduler
        .delete(&claims.subject, &task_id, query.force)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
