//! Envelope — the JSON unit of communication on the Stream Bus.
//!
//! Every message between the child process, the mediator, and remote
//! consumers travels as an envelope: a shared header (task id, millisecond
//! timestamp) plus a payload discriminated by `type`. Within a single
//! per-task stream, timestamps are non-decreasing.
//!
//! Wire shape (all fields case-sensitive):
//!
//! ```json
//! { "type": "input_request",
//!   "task_id": "…",
//!   "timestamp": 1722500000123,
//!   "data": "name?",
//!   "request_id": "…",
//!   "password": false }
//! ```

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskStatus;

/// A single unit on any per-task stream or channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Envelope {
    /// The task this envelope belongs to.
    pub task_id: String,

    /// Milliseconds since epoch. Non-decreasing within one stream.
    pub timestamp: i64,

    /// Payload, discriminated by `type` on the wire. Unknown types are
    /// rejected at deserialization.
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

/// The payload of an [`Envelope`], tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnvelopeBody {
    /// A unit of task output.
    Print {
        /// Opaque output: a plain string or a structured object.
        data: serde_json::Value,
    },

    /// The child is blocked on a prompt and wants input.
    InputRequest {
        /// Correlation id. A child may omit it; the mediator then assigns
        /// one before the request is visible to consumers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// The prompt text or structured prompt description.
        data: serde_json::Value,
        /// Whether the prompt is a secret (consumers should mask input).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<bool>,
    },

    /// A consumer's answer to an outstanding prompt.
    InputResponse {
        /// Must match the request_id of the outstanding prompt.
        request_id: String,
        /// The answer payload.
        data: serde_json::Value,
    },

    /// End of a task or of a single prompt window.
    Termination {
        /// Present when the termination closes one prompt (input-timeout)
        /// rather than the whole task.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Opaque detail (exit disposition, timeout marker, …).
        data: serde_json::Value,
    },

    /// A lifecycle transition or control message.
    Status {
        /// `{ "status": "...", ... }` for transitions, `{ "control": "..." }`
        /// for control-plane requests.
        data: serde_json::Value,
    },
}

impl Envelope {
    fn new(task_id: impl Into<String>, body: EnvelopeBody) -> Self {
        Self {
            task_id: task_id.into(),
            timestamp: Utc::now().timestamp_millis(),
            body,
        }
    }

    /// A `print` envelope with opaque output data.
    pub fn print(task_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(task_id, EnvelopeBody::Print { data })
    }

    /// An `input_request` envelope.
    pub fn input_request(
        task_id: impl Into<String>,
        request_id: impl Into<String>,
        data: serde_json::Value,
        password: bool,
    ) -> Self {
        Self::new(
            task_id,
            EnvelopeBody::InputRequest {
                request_id: Some(request_id.into()),
                data,
                password: password.then_some(true),
            },
        )
    }

    /// An `input_response` envelope.
    pub fn input_response(
        task_id: impl Into<String>,
        request_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::new(
            task_id,
            EnvelopeBody::InputResponse {
                request_id: request_id.into(),
                data,
            },
        )
    }

    /// A `termination` envelope for the whole task.
    pub fn termination(task_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(
            task_id,
            EnvelopeBody::Termination {
                request_id: None,
                data,
            },
        )
    }

    /// A `termination` hint that closes a single prompt (input-timeout).
    pub fn prompt_termination(task_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::new(
            task_id,
            EnvelopeBody::Termination {
                request_id: Some(request_id.into()),
                data: serde_json::json!({ "reason": "input_timeout" }),
            },
        )
    }

    /// A `status` envelope announcing a lifecycle transition.
    pub fn status(task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self::new(
            task_id,
            EnvelopeBody::Status {
                data: serde_json::json!({ "status": status.to_string() }),
            },
        )
    }

    /// A control-plane cancel request, published on the task's `ctl` channel.
    pub fn cancel_request(task_id: impl Into<String>) -> Self {
        Self::new(
            task_id,
            EnvelopeBody::Status {
                data: serde_json::json!({ "control": "cancel" }),
            },
        )
    }

    /// Whether this envelope is a control-plane cancel request.
    pub fn is_cancel_request(&self) -> bool {
        matches!(&self.body, EnvelopeBody::Status { data } if data.get("control")
            .and_then(|v| v.as_str()) == Some("cancel"))
    }

    /// The `type` discriminant as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self.body {
            EnvelopeBody::Print { .. } => "print",
            EnvelopeBody::InputRequest { .. } => "input_request",
            EnvelopeBody::InputResponse { .. } => "input_response",
            EnvelopeBody::Termination { .. } => "termination",
            EnvelopeBody::Status { .. } => "status",
        }
    }

    /// The correlation id, for payloads that carry one.
    pub fn request_id(&self) -> Option<&str> {
        match &self.body {
            EnvelopeBody::InputRequest { request_id, .. }
            | EnvelopeBody::Termination { request_id, .. } => request_id.as_deref(),
            EnvelopeBody::InputResponse { request_id, .. } => Some(request_id.as_str()),
            _ => None,
        }
    }

    /// Deduplication key for at-least-once consumers.
    ///
    /// Publishes may be retried; two envelopes with the same key are the
    /// same logical message.
    pub fn dedupe_key(&self) -> (String, i64, &'static str, Option<String>) {
        (
            self.task_id.clone(),
            self.timestamp,
            self.kind(),
            self.request_id().map(str::to_owned),
        )
    }

    /// Generate an opaque correlation id for a prompt.
    pub fn fresh_request_id() -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_print_wire_shape() {
        let env = Envelope::print("t-1", serde_json::json!("hello"));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "print");
        assert_eq!(json["task_id"], "t-1");
        assert_eq!(json["data"], "hello");
        assert!(json["timestamp"].is_i64());
    }

    #[test]
    fn test_input_request_round_trip() {
        let env = Envelope::input_request("t-1", "R1", serde_json::json!("name?"), true);
        let json = serde_json::to_string(&env).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, env);
        assert_eq!(parsed.kind(), "input_request");
        assert_eq!(parsed.request_id(), Some("R1"));
    }

    #[test]
    fn test_child_may_omit_request_id() {
        let raw = r#"{"type":"input_request","task_id":"t-2","timestamp":7,"data":"pick one"}"#;
        let parsed: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.request_id(), None);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = r#"{"type":"telemetry","task_id":"t-3","timestamp":1,"data":{}}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn test_cancel_request_discriminator() {
        let cancel = Envelope::cancel_request("t-4");
        assert!(cancel.is_cancel_request());

        let status = Envelope::status("t-4", TaskStatus::Running);
        assert!(!status.is_cancel_request());
    }

    #[test]
    fn test_dedupe_key_distinguishes_kinds() {
        let mut a = Envelope::print("t-5", serde_json::json!("x"));
        let mut b = Envelope::status("t-5", TaskStatus::Running);
        a.timestamp = 100;
        b.timestamp = 100;
        assert_ne!(a.dedupe_key(), b.dedupe_key());
    }
}
