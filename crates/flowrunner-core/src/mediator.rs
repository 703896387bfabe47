//! I/O Mediator — routes output and interactive input between the child
//! process and remote consumers, correlated by request_id.
//!
//! Sink side (from the child): print envelopes fan out to the per-task and
//! global output streams; an input_request opens the task's single pending
//! entry and is announced to consumers. Source side (to the child):
//! candidate input_response envelopes from the WebSocket gateway or the
//! input endpoint are validated against the pending entry; the first match
//! wins and is forwarded on the child's ingress channel.
//!
//! At most one prompt is outstanding per task at any instant; a second
//! input_request while one is outstanding is a fatal protocol violation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use flowrunner_proto::{Envelope, EnvelopeBody, RunnerError, RunnerResult, Task, TaskStatus};

use crate::bus::{keys, retry, StreamBus};

/// The single tracked prompt of one task.
#[derive(Debug, Clone)]
pub struct PendingInput {
    pub request_id: String,
    pub opened_at: Instant,
    pub deadline: Instant,
}

/// Per-task pending-input table. Single-writer: only the task's control
/// actor touches it.
#[derive(Debug, Default)]
pub struct PendingTable {
    entry: Option<PendingInput>,
}

impl PendingTable {
    /// Record a new outstanding prompt. A prompt opened while another is
    /// outstanding is a protocol violation that terminates the task.
    pub fn open(&mut self, request_id: String, timeout: Duration) -> RunnerResult<()> {
        if let Some(existing) = &self.entry {
            return Err(RunnerError::ProtocolViolation(format!(
                "input_request {request_id} while {} is outstanding",
                existing.request_id
            )));
        }
        let now = Instant::now();
        self.entry = Some(PendingInput {
            request_id,
            opened_at: now,
            deadline: now + timeout,
        });
        Ok(())
    }

    /// Resolve the outstanding prompt against a response's request_id.
    pub fn resolve(&mut self, request_id: &str) -> RunnerResult<PendingInput> {
        match &self.entry {
            None => Err(RunnerError::NotWaiting(
                "no prompt is outstanding".to_string(),
            )),
            Some(pending) if pending.request_id != request_id => {
                Err(RunnerError::InputMismatch(format!(
                    "expected {}, got {request_id}",
                    pending.request_id
                )))
            }
            Some(_) => Ok(self.entry.take().expect("entry present")),
        }
    }

    /// Take the outstanding prompt on timeout fire.
    pub fn expire(&mut self) -> Option<PendingInput> {
        self.entry.take()
    }

    pub fn outstanding(&self) -> Option<&PendingInput> {
        self.entry.as_ref()
    }

    /// Discarded on terminal transitions.
    pub fn clear(&mut self) {
        self.entry = None;
    }
}

/// Per-stream monotonic timestamp source. Wall-clock steps backwards must
/// not reorder a stream, so emitted timestamps never decrease.
#[derive(Debug, Default)]
pub struct MonotonicStamp {
    last: i64,
}

impl MonotonicStamp {
    /// Stamp for a locally created envelope.
    pub fn next(&mut self) -> i64 {
        self.observe(Utc::now().timestamp_millis())
    }

    /// Fold an incoming timestamp into the stream's timeline.
    pub fn observe(&mut self, ts: i64) -> i64 {
        let ts = ts.max(self.last);
        self.last = ts;
        ts
    }
}

/// What the control actor must do after the mediator routed an envelope.
#[derive(Debug)]
pub enum Routed {
    /// Output fanned out; nothing else to do.
    Printed,
    /// A prompt opened; flip the task to `WAITING_FOR_INPUT`.
    PromptOpened { request_id: String },
    /// A response was accepted and forwarded; flip back to `RUNNING`.
    PromptAnswered,
    /// The child announced its own termination; the exit status still
    /// arrives through the supervisor.
    ChildFinished { data: serde_json::Value },
}

/// The per-task mediator. Owned by the task's control actor.
pub struct Mediator {
    bus: Arc<dyn StreamBus>,
    task_id: String,
    input_timeout: Duration,
    pending: PendingTable,
    stamp: MonotonicStamp,
}

impl Mediator {
    pub fn new(bus: Arc<dyn StreamBus>, task: &Task) -> Self {
        Self {
            bus,
            task_id: task.id.clone(),
            input_timeout: Duration::from_secs(task.input_timeout.max(1)),
            pending: PendingTable::default(),
            stamp: MonotonicStamp::default(),
        }
    }

    /// Deadline of the outstanding prompt, if any.
    pub fn input_deadline(&self) -> Option<Instant> {
        self.pending.outstanding().map(|p| p.deadline)
    }

    pub fn outstanding_request(&self) -> Option<String> {
        self.pending.outstanding().map(|p| p.request_id.clone())
    }

    /// Route one envelope emitted by the child.
    ///
    /// Accepts print, input_request, and termination; anything else from
    /// the child is a protocol violation.
    pub async fn ingest_from_child(&mut self, mut envelope: Envelope) -> RunnerResult<Routed> {
        envelope.task_id = self.task_id.clone();
        envelope.timestamp = self.stamp.observe(envelope.timestamp);

        match envelope.body.clone() {
            EnvelopeBody::Print { .. } => {
                self.fan_out(&envelope).await?;
                Ok(Routed::Printed)
            }
            EnvelopeBody::InputRequest {
                request_id,
                data,
                password,
            } => {
                let request_id = request_id.unwrap_or_else(Envelope::fresh_request_id);
                self.pending.open(request_id.clone(), self.input_timeout)?;

                let mut announced = Envelope::input_request(
                    &self.task_id,
                    &request_id,
                    data,
                    password.unwrap_or(false),
                );
                announced.timestamp = self.stamp.next();
                self.fan_out(&announced).await?;
                self.publish(&keys::in_req(&self.task_id), &announced).await?;
                Ok(Routed::PromptOpened { request_id })
            }
            EnvelopeBody::Termination { data, .. } => {
                self.fan_out(&envelope).await?;
                Ok(Routed::ChildFinished { data })
            }
            EnvelopeBody::InputResponse { .. } | EnvelopeBody::Status { .. } => {
                Err(RunnerError::ProtocolViolation(format!(
                    "child emitted {} envelope",
                    envelope.kind()
                )))
            }
        }
    }

    /// Validate a candidate response from a consumer and forward it to the
    /// child. Mismatches change no state.
    pub async fn accept_response(&mut self, envelope: Envelope) -> RunnerResult<Routed> {
        let kind = envelope.kind();
        let (request_id, data) = match envelope.body {
            EnvelopeBody::InputResponse { request_id, data } => (request_id, data),
            _ => {
                return Err(RunnerError::ValidationFailed(format!(
                    "expected input_response, got {kind}"
                )))
            }
        };
        self.pending.resolve(&request_id)?;
        self.forward_to_child(&request_id, data).await?;
        Ok(Routed::PromptAnswered)
    }

    /// The input-timeout fired: answer the prompt with the default (a
    /// single newline) and publish a termination hint for it.
    pub async fn expire_prompt(&mut self) -> RunnerResult<Option<String>> {
        let Some(pending) = self.pending.expire() else {
            return Ok(None);
        };
        self.forward_to_child(&pending.request_id, serde_json::json!("\n"))
            .await?;

        let mut hint = Envelope::prompt_termination(&self.task_id, &pending.request_id);
        hint.timestamp = self.stamp.next();
        self.fan_out(&hint).await?;
        Ok(Some(pending.request_id))
    }

    /// Announce a journaled lifecycle transition on the control channel
    /// and the output streams.
    pub async fn emit_status(&mut self, status: TaskStatus) -> RunnerResult<()> {
        let mut envelope = Envelope::status(&self.task_id, status);
        envelope.timestamp = self.stamp.next();
        self.fan_out(&envelope).await?;
        self.publish(&keys::ctl(&self.task_id), &envelope).await
    }

    /// Emit the final termination envelope for the task.
    pub async fn emit_termination(&mut self, data: serde_json::Value) -> RunnerResult<()> {
        let mut envelope = Envelope::termination(&self.task_id, data);
        envelope.timestamp = self.stamp.next();
        self.fan_out(&envelope).await?;
        self.publish(&keys::ctl(&self.task_id), &envelope).await
    }

    /// Drop transient state on terminal transition.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    async fn forward_to_child(
        &mut self,
        request_id: &str,
        data: serde_json::Value,
    ) -> RunnerResult<()> {
        let mut response = Envelope::input_response(&self.task_id, request_id, data);
        response.timestamp = self.stamp.next();
        self.publish(&keys::child_in(&self.task_id), &response).await
    }

    async fn fan_out(&self, envelope: &Envelope) -> RunnerResult<()> {
        let per_task = keys::out(&self.task_id);
        self.append(&per_task, envelope).await?;
        self.append(keys::OUT_ALL, envelope).await
    }

    async fn append(&self, stream: &str, envelope: &Envelope) -> RunnerResult<()> {
        let bus = Arc::clone(&self.bus);
        retry("stream append", || {
            let bus = Arc::clone(&bus);
            let stream = stream.to_string();
            let envelope = envelope.clone();
            async move { bus.xadd(&stream, &envelope).await.map(|_| ()) }
        })
        .await
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> RunnerResult<()> {
        let bus = Arc::clone(&self.bus);
        retry("topic publish", || {
            let bus = Arc::clone(&bus);
            let topic = topic.to_string();
            let envelope = envelope.clone();
            async move { bus.publish(&topic, &envelope).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, StreamBus};
    use futures::StreamExt;
    use serde_json::json;

    fn fixture() -> (Arc<MemoryBus>, Mediator, Task) {
        let bus = Arc::new(MemoryBus::new());
        let task = Task::new("acme", "demo.flow", 2, 0);
        let mediator = Mediator::new(bus.clone(), &task);
        (bus, mediator, task)
    }

    #[test]
    fn test_pending_table_single_entry() {
        let mut table = PendingTable::default();
        table.open("R1".into(), Duration::from_secs(1)).unwrap();
        let err = table.open("R2".into(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RunnerError::ProtocolViolation(_)));
        assert_eq!(table.outstanding().unwrap().request_id, "R1");
    }

    #[test]
    fn test_pending_table_resolution() {
        let mut table = PendingTable::default();
        assert!(matches!(
            table.resolve("R1").unwrap_err(),
            RunnerError::NotWaiting(_)
        ));

        table.open("R1".into(), Duration::from_secs(1)).unwrap();
        assert!(matches!(
            table.resolve("R2").unwrap_err(),
            RunnerError::InputMismatch(_)
        ));
        // Mismatch changed nothing.
        assert!(table.outstanding().is_some());

        table.resolve("R1").unwrap();
        assert!(table.outstanding().is_none());
        // Resolves exactly once.
        assert!(matches!(
            table.resolve("R1").unwrap_err(),
            RunnerError::NotWaiting(_)
        ));
    }

    #[test]
    fn test_monotonic_stamp_never_decreases() {
        let mut stamp = MonotonicStamp::default();
        let a = stamp.observe(1_000);
        let b = stamp.observe(500);
        let c = stamp.next();
        assert_eq!(a, 1_000);
        assert!(b >= a);
        assert!(c >= b);
    }

    #[tokio::test]
    async fn test_print_fans_out_to_both_streams() {
        let (bus, mut mediator, task) = fixture();
        let env = Envelope::print(&task.id, json!("hello"));
        let routed = mediator.ingest_from_child(env).await.unwrap();
        assert!(matches!(routed, Routed::Printed));

        let per_task = bus.xrange(&keys::out(&task.id), "-", "+").await.unwrap();
        let global = bus.xrange(keys::OUT_ALL, "-", "+").await.unwrap();
        assert_eq!(per_task.len(), 1);
        assert_eq!(global.len(), 1);
        assert_eq!(per_task[0].1.kind(), "print");
    }

    #[tokio::test]
    async fn test_prompt_assigns_request_id_and_announces() {
        let (bus, mut mediator, task) = fixture();
        let mut announcements = bus.subscribe(&keys::in_req(&task.id)).await.unwrap();

        let raw = Envelope {
            task_id: String::new(),
            timestamp: 0,
            body: EnvelopeBody::InputRequest {
                request_id: None,
                data: json!("name?"),
                password: None,
            },
        };
        let routed = mediator.ingest_from_child(raw).await.unwrap();
        let Routed::PromptOpened { request_id } = routed else {
            panic!("expected PromptOpened");
        };
        assert!(!request_id.is_empty());
        assert_eq!(mediator.outstanding_request().as_deref(), Some(request_id.as_str()));

        let announced = announcements.next().await.unwrap();
        assert_eq!(announced.request_id(), Some(request_id.as_str()));

        // The prompt is also visible on the output stream for consumers
        // that only follow `out:{id}`.
        let out = bus.xrange(&keys::out(&task.id), "-", "+").await.unwrap();
        assert_eq!(out.last().unwrap().1.kind(), "input_request");
    }

    #[tokio::test]
    async fn test_second_prompt_is_fatal() {
        let (_bus, mut mediator, task) = fixture();
        let first = Envelope::input_request(&task.id, "R1", json!("a?"), false);
        mediator.ingest_from_child(first).await.unwrap();

        let second = Envelope::input_request(&task.id, "R2", json!("b?"), false);
        let err = mediator.ingest_from_child(second).await.unwrap_err();
        assert!(matches!(err, RunnerError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_response_round_trip() {
        let (bus, mut mediator, task) = fixture();
        let mut to_child = bus.subscribe(&keys::child_in(&task.id)).await.unwrap();

        let prompt = Envelope::input_request(&task.id, "R1", json!("name?"), false);
        mediator.ingest_from_child(prompt).await.unwrap();

        let response = Envelope::input_response(&task.id, "R1", json!("Alice"));
        let routed = mediator.accept_response(response.clone()).await.unwrap();
        assert!(matches!(routed, Routed::PromptAnswered));

        let forwarded = to_child.next().await.unwrap();
        match forwarded.body {
            EnvelopeBody::InputResponse { request_id, data } => {
                assert_eq!(request_id, "R1");
                assert_eq!(data, json!("Alice"));
            }
            _ => panic!("expected input_response"),
        }

        // The second identical response resolves nothing.
        let err = mediator.accept_response(response).await.unwrap_err();
        assert!(matches!(err, RunnerError::NotWaiting(_)));
    }

    #[tokio::test]
    async fn test_mismatched_response_changes_nothing() {
        let (_bus, mut mediator, task) = fixture();
        let prompt = Envelope::input_request(&task.id, "R1", json!("name?"), false);
        mediator.ingest_from_child(prompt).await.unwrap();

        let wrong = Envelope::input_response(&task.id, "R9", json!("Mallory"));
        let err = mediator.accept_response(wrong).await.unwrap_err();
        assert!(matches!(err, RunnerError::InputMismatch(_)));
        assert_eq!(mediator.outstanding_request().as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn test_expire_prompt_defaults_to_newline() {
        let (bus, mut mediator, task) = fixture();
        let mut to_child = bus.subscribe(&keys::child_in(&task.id)).await.unwrap();

        let prompt = Envelope::input_request(&task.id, "R2", json!("anything?"), false);
        mediator.ingest_from_child(prompt).await.unwrap();

        let expired = mediator.expire_prompt().await.unwrap();
        assert_eq!(expired.as_deref(), Some("R2"));
        assert!(mediator.outstanding_request().is_none());

        let forwarded = to_child.next().await.unwrap();
        match forwarded.body {
            EnvelopeBody::InputResponse { request_id, data } => {
                assert_eq!(request_id, "R2");
                assert_eq!(data, json!("\n"));
            }
            _ => panic!("expected input_response"),
        }

        // A termination hint for the prompt landed on the output stream.
        let out = bus.xrange(&keys::out(&task.id), "-", "+").await.unwrap();
        let hint = &out.last().unwrap().1;
        assert_eq!(hint.kind(), "termination");
        assert_eq!(hint.request_id(), Some("R2"));

        // Nothing further to expire.
        assert_eq!(mediator.expire_prompt().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_child_may_not_send_responses() {
        let (_bus, mut mediator, task) = fixture();
        let bogus = Envelope::input_response(&task.id, "R1", json!("self-answer"));
        let err = mediator.ingest_from_child(bogus).await.unwrap_err();
        assert!(matches!(err, RunnerError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_output_stream_timestamps_monotonic() {
        let (bus, mut mediator, task) = fixture();
        for i in 0..4 {
            let mut env = Envelope::print(&task.id, json!(i));
            // Simulate a child clock stepping backwards.
            env.timestamp -= i * 10;
            mediator.ingest_from_child(env).await.unwrap();
        }
        let out = bus.xrange(&keys::out(&task.id), "-", "+").await.unwrap();
        let stamps: Vec<i64> = out.iter().map(|(_, e)| e.timestamp).collect();
        let mut sorted = stamps.clone();
        sorted.sort_unstable();
        assert_eq!(stamps, sorted);
    }
}
