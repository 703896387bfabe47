//! HTTP + WebSocket surface.
//!
//! - `POST   /tasks`              — submit a flow (multipart)
//! - `GET    /tasks`              — list the client's tasks (paginated)
//! - `GET    /tasks/{id}`         — fetch one task record
//! - `POST   /tasks/{id}/cancel`  — request cancellation
//! - `POST   /tasks/{id}/input`   — inject an input_response
//! - `GET    /tasks/{id}/download`— download the result archive
//! - `DELETE /tasks/{id}`         — soft-delete (`?force=` for active)
//! - `GET    /ws/{id}`            — per-task duplex stream

pub mod error;
pub mod tasks;
pub mod ws;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use flowrunner_core::{AuthVerifier, Config, ObjectStore, Scheduler, StreamBus, TaskStore};
use flowrunner_proto::{Claims, RunnerError};

use error::ApiError;

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn TaskStore>,
    pub storage: Arc<dyn ObjectStore>,
    pub bus: Arc<dyn StreamBus>,
    pub verifier: Arc<dyn AuthVerifier>,
    pub config: Arc<Config>,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    // Leave headroom for multipart framing around the flow itself.
    let body_limit = (state.config.max_flow_size as usize).saturating_add(64 * 1024);

    Router::new()
        .route("/health", get(health))
        .route("/tasks", post(tasks::submit).get(tasks::list))
        .route("/tasks/:id", get(tasks::fetch).delete(tasks::delete))
        .route("/tasks/:id/cancel", post(tasks::cancel))
        .route("/tasks/:id/input", post(tasks::input))
        .route("/tasks/:id/download", get(tasks::download))
        .route("/ws/:id", get(ws::upgrade))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors_layer(&state.config))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<axum::http::HeaderValue> = config
        .trusted_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    if origins.is_empty() {
        // Wildcard — suitable for development; set trusted origins in
        // production.
        CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods(Any)
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_headers(Any)
            .allow_methods(Any)
    }
}

/// Extract the bearer token from an Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Verified caller identity; rejects with 401 when absent or invalid.
pub struct Authenticated(pub Claims);

#[axum::async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| RunnerError::AuthInvalid("missing bearer token".into()))?;
        let claims = state.verifier.verify(token).await?;
        Ok(Self(claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Bearer acme:s3cret".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("acme:s3cret"));

        headers.insert(AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
