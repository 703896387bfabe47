//! WebSocket gateway — per-task duplex bridge between clients and the
//! Stream Bus.
//!
//! Outbound: follows `out:{task_id}` (from "now" unless replay is
//! requested) and forwards every envelope as a JSON text frame; a
//! whole-task termination envelope closes the socket with 1000. Inbound:
//! only input_response envelopes are accepted and handed to the mediator
//! via the task's response channel. The stream itself is the
//! order-of-truth across reconnects.
//!
//! Authentication is accepted via the Authorization header, the
//! ("tasks-api", token) subprotocol pair, an access_token cookie, or an
//! `access_token` query parameter.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::header::{COOKIE, SEC_WEBSOCKET_PROTOCOL};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use flowrunner_core::bus::keys;
use flowrunner_core::StreamFrom;
use flowrunner_proto::{Claims, Envelope, EnvelopeBody};

use super::{bearer_token, AppState};

/// Close code for a credential that verified once but does not own the
/// task (or was revoked).
const CLOSE_FORBIDDEN: u16 = 4003;

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub access_token: Option<String>,
    pub replay: Option<String>,
}

impl WsQuery {
    fn wants_replay(&self) -> bool {
        matches!(
            self.replay.as_deref(),
            Some("earliest") | Some("true") | Some("1")
        )
    }
}

/// GET /ws/{task_id}
pub async fn upgrade(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = request_token(&headers, &query);
    let replay = query.wants_replay();
    let ws = if offers_tasks_protocol(&headers) {
        ws.protocols(["tasks-api"])
    } else {
        ws
    };
    ws.on_upgrade(move |socket| session(state, socket, task_id, token, replay))
}

/// Token extraction order: Authorization header, subprotocol pair,
/// cookie, query parameter.
fn request_token(headers: &HeaderMap, query: &WsQuery) -> Option<String> {
    if let Some(token) = bearer_token(headers) {
        return Some(token.to_string());
    }
    if let Some(token) = subprotocol_token(headers) {
        return Some(token);
    }
    if let Some(token) = cookie_token(headers) {
        return Some(token);
    }
    query.access_token.clone()
}

/// The ("tasks-api", token) subprotocol pair.
fn subprotocol_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    let mut offered = raw.split(',').map(str::trim);
    if offered.next()? != "tasks-api" {
        return None;
    }
    offered.next().map(str::to_string)
}

fn offers_tasks_protocol(headers: &HeaderMap) -> bool {
    headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(|raw| raw.split(',').any(|p| p.trim() == "tasks-api"))
        .unwrap_or(false)
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    raw.split(';').map(str::trim).find_map(|pair| {
        pair.strip_prefix("access_token=")
            .map(|value| value.to_string())
    })
}

async fn session(
    state: AppState,
    mut socket: WebSocket,
    task_id: String,
    token: Option<String>,
    replay: bool,
) {
    // Policy checks happen post-upgrade so the close code reaches the
    // client.
    let claims: Option<Claims> = match token {
        Some(token) => state.verifier.verify(&token).await.ok(),
        None => None,
    };
    let Some(claims) = claims else {
        close(&mut socket, close_code::POLICY, "authentication required").await;
        return;
    };

    let owns_task = matches!(
        state.store.get(&task_id).await,
        Ok(task) if task.client_id == claims.subject && !task.soft_deleted
    );
    if !owns_task {
        close(&mut socket, CLOSE_FORBIDDEN, "task not accessible").await;
        return;
    }

    let from = if replay {
        StreamFrom::Earliest
    } else {
        StreamFrom::Latest
    };
    let mut outbound = match state.bus.follow(&keys::out(&task_id), from).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(%task_id, error = %err, "stream follow failed");
            close(&mut socket, close_code::ERROR, "stream unavailable").await;
            return;
        }
    };

    tracing::debug!(%task_id, client = %claims.subject, replay, "websocket attached");
    let (mut sink, mut inbound) = socket.split();

    loop {
        tokio::select! {
            envelope = outbound.next() => {
                let Some(envelope) = envelope else {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::ERROR,
                            reason: "stream ended".into(),
                        })))
                        .await;
                    break;
                };
                let is_final = matches!(
                    &envelope.body,
                    EnvelopeBody::Termination { request_id: None, .. }
                );
                let frame = match serde_json::to_string(&envelope) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
                if is_final {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "task finished".into(),
                        })))
                        .await;
                    break;
                }
            }

            message = inbound.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&state, &task_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    tracing::debug!(%task_id, "websocket detached");
}

/// Inbound frames: only well-formed input_response envelopes for this
/// task are forwarded; everything else is dropped.
async fn handle_inbound(state: &AppState, task_id: &str, text: &str) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::debug!(task_id, error = %err, "dropping malformed frame");
            return;
        }
    };
    if !matches!(envelope.body, EnvelopeBody::InputResponse { .. }) {
        tracing::debug!(task_id, kind = envelope.kind(), "dropping non-response frame");
        return;
    }
    let mut envelope = envelope;
    envelope.task_id = task_id.to_string();
    if let Err(err) = state.bus.publish(&keys::in_resp(task_id), &envelope).await {
        tracing::warn!(task_id, error = %err, "response forward failed");
    }
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    fn headers(pairs: &[(axum::http::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), value.parse().unwrap());
        }
        map
    }

    #[test]
    fn test_token_priority_header_first() {
        let map = headers(&[
            (AUTHORIZATION, "Bearer from-header"),
            (SEC_WEBSOCKET_PROTOCOL, "tasks-api, from-proto"),
            (COOKIE, "access_token=from-cookie"),
        ]);
        let query = WsQuery {
            access_token: Some("from-query".into()),
            replay: None,
        };
        assert_eq!(request_token(&map, &query).as_deref(), Some("from-header"));
    }

    #[test]
    fn test_subprotocol_pair() {
        let map = headers(&[(SEC_WEBSOCKET_PROTOCOL, "tasks-api, tok-123")]);
        assert_eq!(
            request_token(&map, &WsQuery::default()).as_deref(),
            Some("tok-123")
        );
        assert!(offers_tasks_protocol(&map));

        // A lone protocol offer carries no token.
        let map = headers(&[(SEC_WEBSOCKET_PROTOCOL, "tasks-api")]);
        assert_eq!(request_token(&map, &WsQuery::default()), None);

        // Unrelated protocols yield nothing.
        let map = headers(&[(SEC_WEBSOCKET_PROTOCOL, "graphql-ws, tok-123")]);
        assert_eq!(request_token(&map, &WsQuery::default()), None);
        assert!(!offers_tasks_protocol(&map));
    }

    #[test]
    fn test_cookie_token() {
        let map = headers(&[(COOKIE, "theme=dark; access_token=tok-9; lang=en")]);
        assert_eq!(
            request_token(&map, &WsQuery::default()).as_deref(),
            Some("tok-9")
        );
    }

    #[test]
    fn test_query_token_is_last_resort() {
        let query = WsQuery {
            access_token: Some("tok-q".into()),
            replay: None,
        };
        assert_eq!(
            request_token(&HeaderMap::new(), &query).as_deref(),
            Some("tok-q")
        );
    }

    #[test]
    fn test_replay_flag_values() {
        for (value, wanted) in [
            (Some("earliest"), true),
            (Some("true"), true),
            (Some("1"), true),
            (Some("latest"), false),
            (None, false),
        ] {
            let query = WsQuery {
                access_token: None,
                replay: value.map(str::to_string),
            };
            assert_eq!(query.wants_replay(), wanted, "replay={value:?}");
        }
    }
}
