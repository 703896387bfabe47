//! Stream Bus — typed pub/sub and append-only streams over Redis
//! primitives.
//!
//! Guarantees: within a single stream, readers observe envelopes in
//! publisher-append order; cross-stream ordering is not guaranteed.
//! Publishes are at-least-once; consumers dedupe by
//! [`Envelope::dedupe_key`](flowrunner_proto::Envelope::dedupe_key).
//!
//! Two implementations: [`RedisBus`] for production and [`MemoryBus`] for
//! tests and single-node development.

mod memory;
mod redis;

pub use self::memory::MemoryBus;
pub use self::redis::RedisBus;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use flowrunner_proto::{Envelope, RunnerResult};

/// A live sequence of envelopes from one stream or topic.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

/// Where a stream follow starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrom {
    /// Only envelopes appended after the subscription (no backlog).
    Latest,
    /// Replay the whole stream, then tail.
    Earliest,
    /// Resume strictly after a known entry id.
    Id(String),
}

/// The stream backend abstraction.
///
/// Errors map to `BusUnavailable`; callers on critical paths retry with
/// [`Backoff`] before surfacing failure.
#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Fan out an envelope to the current subscribers of a topic.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> RunnerResult<()>;

    /// Live subscription to a pub/sub topic, from now.
    async fn subscribe(&self, topic: &str) -> RunnerResult<EnvelopeStream>;

    /// Append an envelope to a stream; returns the entry id.
    async fn xadd(&self, stream: &str, envelope: &Envelope) -> RunnerResult<String>;

    /// Bounded range read. `-` and `+` select the stream's ends.
    async fn xrange(
        &self,
        stream: &str,
        from: &str,
        to: &str,
    ) -> RunnerResult<Vec<(String, Envelope)>>;

    /// Follow a stream: optionally replay backlog, then tail live appends.
    async fn follow(&self, stream: &str, from: StreamFrom) -> RunnerResult<EnvelopeStream>;

    /// Delete a stream or key.
    async fn delete(&self, key: &str) -> RunnerResult<()>;

    /// FIFO dispatch queue: push one value.
    async fn queue_push(&self, queue: &str, value: &str) -> RunnerResult<()>;

    /// FIFO dispatch queue: pop the oldest value, if any.
    async fn queue_pop(&self, queue: &str) -> RunnerResult<Option<String>>;

    /// Set a key with a TTL (worker heartbeats).
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> RunnerResult<()>;

    /// Whether a key currently exists.
    async fn exists(&self, key: &str) -> RunnerResult<bool>;

    /// Round-trip health check.
    async fn ping(&self) -> RunnerResult<()>;
}

/// Key naming for the per-task stream set and shared keys.
pub mod keys {
    /// The global output stream, carrying envelopes for all tasks.
    pub const OUT_ALL: &str = "out:all";

    /// The FIFO dispatch queue workers pop task ids from.
    pub const TASK_QUEUE: &str = "tasks:queue";

    /// Per-task consumer-facing output stream.
    pub fn out(task_id: &str) -> String {
        format!("out:{task_id}")
    }

    /// Per-task prompt announcement channel (mediator → consumers).
    pub fn in_req(task_id: &str) -> String {
        format!("in-req:{task_id}")
    }

    /// Per-task candidate-response channel (consumers → mediator).
    pub fn in_resp(task_id: &str) -> String {
        format!("in-resp:{task_id}")
    }

    /// Per-task control channel (cancel requests, status envelopes).
    pub fn ctl(task_id: &str) -> String {
        format!("ctl:{task_id}")
    }

    /// Per-task child egress channel (child → mediator).
    pub fn child_out(task_id: &str) -> String {
        format!("child-out:{task_id}")
    }

    /// Per-task child ingress channel (mediator → child).
    pub fn child_in(task_id: &str) -> String {
        format!("child-in:{task_id}")
    }

    /// Worker heartbeat key for an active task.
    pub fn alive(task_id: &str) -> String {
        format!("alive:{task_id}")
    }
}

/// Capped exponential backoff: 50 ms doubling to a 5 s cap, at most 6
/// attempts, after which the error surfaces to the task owner.
#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub const MAX_ATTEMPTS: u32 = 6;
    const BASE_MS: u64 = 50;
    const CAP_MS: u64 = 5_000;

    /// The next delay to sleep before retrying, or `None` once attempts
    /// are exhausted.
    pub fn delay(&mut self) -> Option<Duration> {
        if self.attempt >= Self::MAX_ATTEMPTS {
            return None;
        }
        let ms = Self::BASE_MS
            .saturating_mul(1u64 << self.attempt)
            .min(Self::CAP_MS);
        self.attempt += 1;
        Some(Duration::from_millis(ms))
    }
}

/// Run `op` until it succeeds, retrying transient errors with [`Backoff`].
///
/// Non-transient errors surface immediately.
pub async fn retry<T, F, Fut>(what: &str, mut op: F) -> RunnerResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = RunnerResult<T>>,
{
    let mut backoff = Backoff::default();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => match backoff.delay() {
                Some(delay) => {
                    tracing::warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "{what}: transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(error = %err, "{what}: retries exhausted");
                    return Err(err);
                }
            },
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![50, 100, 200, 400, 800, 1_600]);
        assert_eq!(backoff.delay(), None);
    }

    #[test]
    fn test_key_naming() {
        assert_eq!(keys::out("t-1"), "out:t-1");
        assert_eq!(keys::in_resp("t-1"), "in-resp:t-1");
        assert_eq!(keys::child_in("t-1"), "child-in:t-1");
        assert_eq!(keys::alive("t-1"), "alive:t-1");
    }

    #[tokio::test]
    async fn test_retry_surfaces_non_transient_immediately() {
        use flowrunner_proto::RunnerError;

        let mut calls = 0u32;
        let result: RunnerResult<()> = retry("op", || {
            calls += 1;
            async { Err(RunnerError::ValidationFailed("bad".into())) }
        })
        .await;
        assert!(matches!(result, Err(RunnerError::ValidationFailed(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_transient() {
        use flowrunner_proto::RunnerError;

        let mut calls = 0u32;
        let result: RunnerResult<()> = retry("op", || {
            calls += 1;
            async { Err(RunnerError::BusUnavailable("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(RunnerError::BusUnavailable(_))));
        assert_eq!(calls, Backoff::MAX_ATTEMPTS + 1);
    }
}
