//! In-memory Stream Bus for tests and single-node development.
//!
//! Mirrors the Redis implementation's semantics: per-stream append order,
//! topic fan-out to live subscribers only, FIFO queues, TTL'd keys.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use flowrunner_proto::{Envelope, RunnerResult};

use super::{EnvelopeStream, StreamBus, StreamFrom};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Inner {
    topics: HashMap<String, broadcast::Sender<Envelope>>,
    streams: HashMap<String, Vec<(String, Envelope)>>,
    tails: HashMap<String, broadcast::Sender<(u64, Envelope)>>,
    queues: HashMap<String, VecDeque<String>>,
    kv: HashMap<String, (String, Instant)>,
    seq: u64,
}

impl Inner {
    fn topic(&mut self, name: &str) -> broadcast::Sender<Envelope> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn tail(&mut self, name: &str) -> broadcast::Sender<(u64, Envelope)> {
        self.tails
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// A process-local [`StreamBus`].
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Sequence component of an entry id (`"<millis>-<seq>"`).
fn entry_seq(id: &str) -> u64 {
    id.rsplit_once('-')
        .and_then(|(_, seq)| seq.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl StreamBus for MemoryBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> RunnerResult<()> {
        let sender = self.inner.lock().unwrap().topic(topic);
        // No subscribers is not an error; pub/sub is fire-and-forget.
        let _ = sender.send(envelope.clone());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> RunnerResult<EnvelopeStream> {
        let receiver = self.inner.lock().unwrap().topic(topic).subscribe();
        let stream = BroadcastStream::new(receiver)
            .filter_map(|item| futures::future::ready(item.ok()));
        Ok(Box::pin(stream))
    }

    async fn xadd(&self, stream: &str, envelope: &Envelope) -> RunnerResult<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        let seq = inner.seq;
        let id = format!("{}-{seq}", Utc::now().timestamp_millis());
        inner
            .streams
            .entry(stream.to_string())
            .or_default()
            .push((id.clone(), envelope.clone()));
        let tail = inner.tail(stream);
        let _ = tail.send((seq, envelope.clone()));
        Ok(id)
    }

    async fn xrange(
        &self,
        stream: &str,
        from: &str,
        to: &str,
    ) -> RunnerResult<Vec<(String, Envelope)>> {
        let inner = self.inner.lock().unwrap();
        let entries = inner.streams.get(stream).cloned().unwrap_or_default();
        let lo = match from {
            "-" | "0" | "0-0" => 0,
            id => entry_seq(id),
        };
        let hi = match to {
            "+" => u64::MAX,
            id => entry_seq(id),
        };
        Ok(entries
            .into_iter()
            .filter(|(id, _)| {
                let seq = entry_seq(id);
                seq >= lo && seq <= hi
            })
            .collect())
    }

    async fn follow(&self, stream: &str, from: StreamFrom) -> RunnerResult<EnvelopeStream> {
        let (backlog, last_seen, receiver) = {
            let mut inner = self.inner.lock().unwrap();
            let receiver = inner.tail(stream).subscribe();
            let entries = inner.streams.get(stream).cloned().unwrap_or_default();
            let newest = entries.last().map(|(id, _)| entry_seq(id)).unwrap_or(0);
            match from {
                StreamFrom::Latest => (Vec::new(), newest, receiver),
                StreamFrom::Earliest => {
                    let backlog: Vec<Envelope> =
                        entries.into_iter().map(|(_, env)| env).collect();
                    (backlog, newest, receiver)
                }
                StreamFrom::Id(id) => {
                    let mark = entry_seq(&id);
                    let backlog: Vec<Envelope> = entries
                        .into_iter()
                        .filter(|(id, _)| entry_seq(id) > mark)
                        .map(|(_, env)| env)
                        .collect();
                    (backlog, newest, receiver)
                }
            }
        };

        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            futures::future::ready(match item {
                Ok((seq, env)) if seq > last_seen => Some(env),
                _ => None,
            })
        });
        Ok(Box::pin(futures::stream::iter(backlog).chain(live)))
    }

    async fn delete(&self, key: &str) -> RunnerResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.streams.remove(key);
        inner.tails.remove(key);
        inner.topics.remove(key);
        inner.queues.remove(key);
        inner.kv.remove(key);
        Ok(())
    }

    async fn queue_push(&self, queue: &str, value: &str) -> RunnerResult<()> {
        self.inner
            .lock()
            .unwrap()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn queue_pop(&self, queue: &str) -> RunnerResult<Option<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .queues
            .get_mut(queue)
            .and_then(|q| q.pop_front()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> RunnerResult<()> {
        self.inner
            .lock()
            .unwrap()
            .kv
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn exists(&self, key: &str) -> RunnerResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.kv.get(key) {
            Some((_, expires)) if *expires > Instant::now() => Ok(true),
            Some(_) => {
                inner.kv.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> RunnerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::keys;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_live_subscriber() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("ctl:t-1").await.unwrap();
        bus.publish("ctl:t-1", &Envelope::cancel_request("t-1"))
            .await
            .unwrap();
        let env = sub.next().await.unwrap();
        assert!(env.is_cancel_request());
    }

    #[tokio::test]
    async fn test_stream_preserves_append_order() {
        let bus = MemoryBus::new();
        let stream = keys::out("t-1");
        for i in 0..5 {
            bus.xadd(&stream, &Envelope::print("t-1", json!(i)))
                .await
                .unwrap();
        }
        let entries = bus.xrange(&stream, "-", "+").await.unwrap();
        let values: Vec<_> = entries
            .iter()
            .map(|(_, env)| match &env.body {
                flowrunner_proto::EnvelopeBody::Print { data } => data.as_i64().unwrap(),
                _ => panic!("unexpected envelope"),
            })
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_follow_earliest_replays_backlog() {
        let bus = MemoryBus::new();
        let stream = keys::out("t-2");
        bus.xadd(&stream, &Envelope::print("t-2", json!("a")))
            .await
            .unwrap();
        bus.xadd(&stream, &Envelope::print("t-2", json!("b")))
            .await
            .unwrap();

        let mut follow = bus.follow(&stream, StreamFrom::Earliest).await.unwrap();
        assert_eq!(follow.next().await.unwrap().kind(), "print");
        assert_eq!(follow.next().await.unwrap().kind(), "print");

        bus.xadd(&stream, &Envelope::print("t-2", json!("c")))
            .await
            .unwrap();
        let live = follow.next().await.unwrap();
        assert_eq!(live.kind(), "print");
    }

    #[tokio::test]
    async fn test_follow_latest_skips_backlog() {
        let bus = MemoryBus::new();
        let stream = keys::out("t-3");
        bus.xadd(&stream, &Envelope::print("t-3", json!("old")))
            .await
            .unwrap();

        let mut follow = bus.follow(&stream, StreamFrom::Latest).await.unwrap();
        bus.xadd(&stream, &Envelope::print("t-3", json!("new")))
            .await
            .unwrap();

        let env = follow.next().await.unwrap();
        match env.body {
            flowrunner_proto::EnvelopeBody::Print { data } => assert_eq!(data, json!("new")),
            _ => panic!("unexpected envelope"),
        }
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let bus = MemoryBus::new();
        bus.queue_push(keys::TASK_QUEUE, "t-1").await.unwrap();
        bus.queue_push(keys::TASK_QUEUE, "t-2").await.unwrap();
        assert_eq!(
            bus.queue_pop(keys::TASK_QUEUE).await.unwrap(),
            Some("t-1".into())
        );
        assert_eq!(
            bus.queue_pop(keys::TASK_QUEUE).await.unwrap(),
            Some("t-2".into())
        );
        assert_eq!(bus.queue_pop(keys::TASK_QUEUE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_keys_expire() {
        let bus = MemoryBus::new();
        bus.set_ex("alive:t-1", "1", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(bus.exists("alive:t-1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!bus.exists("alive:t-1").await.unwrap());
    }
}
