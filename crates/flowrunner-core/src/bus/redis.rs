//! Redis-backed Stream Bus.
//!
//! Commands go through a shared multiplexed [`ConnectionManager`];
//! subscriptions and stream follows each take a dedicated connection so
//! blocking reads never stall unrelated traffic.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use flowrunner_proto::{Envelope, RunnerError, RunnerResult};

use super::{EnvelopeStream, StreamBus, StreamFrom};

/// Milliseconds one blocking XREAD waits before re-arming.
const FOLLOW_BLOCK_MS: usize = 1_000;
/// Entries fetched per XREAD.
const FOLLOW_COUNT: usize = 64;
/// Consecutive read failures before a follow stream ends.
const FOLLOW_MAX_ERRORS: u32 = 6;

/// A [`StreamBus`] over a Redis server.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    /// Connect to the stream backend.
    pub async fn connect(url: &str) -> RunnerResult<Self> {
        let client = redis::Client::open(url).map_err(bus_err)?;
        let conn = client.get_connection_manager().await.map_err(bus_err)?;
        Ok(Self { client, conn })
    }
}

fn bus_err(err: redis::RedisError) -> RunnerError {
    RunnerError::BusUnavailable(err.to_string())
}

fn encode(envelope: &Envelope) -> RunnerResult<String> {
    serde_json::to_string(envelope)
        .map_err(|e| RunnerError::Internal(format!("envelope encode: {e}")))
}

fn decode(raw: &str) -> Option<Envelope> {
    match serde_json::from_str(raw) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            tracing::warn!(error = %err, "dropping undecodable envelope");
            None
        }
    }
}

fn decode_entry(entry: &redis::streams::StreamId) -> Option<Envelope> {
    let value = entry.map.get("data")?;
    let raw: String = redis::from_redis_value(value).ok()?;
    decode(&raw)
}

struct FollowState {
    conn: MultiplexedConnection,
    stream: String,
    last_id: String,
    errors: u32,
}

#[async_trait]
impl StreamBus for RedisBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> RunnerResult<()> {
        let payload = encode(envelope)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(topic, payload).await.map_err(bus_err)?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> RunnerResult<EnvelopeStream> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(bus_err)?;
        pubsub.subscribe(topic).await.map_err(bus_err)?;
        let stream = pubsub.into_on_message().filter_map(|msg| {
            futures::future::ready(
                msg.get_payload::<String>()
                    .ok()
                    .and_then(|raw| decode(&raw)),
            )
        });
        Ok(Box::pin(stream))
    }

    async fn xadd(&self, stream: &str, envelope: &Envelope) -> RunnerResult<String> {
        let payload = encode(envelope)?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(stream, "*", &[("data", payload)])
            .await
            .map_err(bus_err)?;
        Ok(id)
    }

    async fn xrange(
        &self,
        stream: &str,
        from: &str,
        to: &str,
    ) -> RunnerResult<Vec<(String, Envelope)>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrange(stream, from, to).await.map_err(bus_err)?;
        Ok(reply
            .ids
            .iter()
            .filter_map(|entry| decode_entry(entry).map(|env| (entry.id.clone(), env)))
            .collect())
    }

    async fn follow(&self, stream: &str, from: StreamFrom) -> RunnerResult<EnvelopeStream> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(bus_err)?;

        // Resolve "latest" to a concrete id up front; re-sending `$` on
        // every XREAD would drop entries that land between reads.
        let last_id = match from {
            StreamFrom::Earliest => "0-0".to_string(),
            StreamFrom::Id(id) => id,
            StreamFrom::Latest => {
                let reply: StreamRangeReply = redis::cmd("XREVRANGE")
                    .arg(stream)
                    .arg("+")
                    .arg("-")
                    .arg("COUNT")
                    .arg(1)
                    .query_async(&mut conn)
                    .await
                    .map_err(bus_err)?;
                reply
                    .ids
                    .first()
                    .map(|entry| entry.id.clone())
                    .unwrap_or_else(|| "0-0".to_string())
            }
        };

        let state = FollowState {
            conn,
            stream: stream.to_string(),
            last_id,
            errors: 0,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            loop {
                let opts = StreamReadOptions::default()
                    .count(FOLLOW_COUNT)
                    .block(FOLLOW_BLOCK_MS);
                let reply: Result<Option<StreamReadReply>, _> = st
                    .conn
                    .xread_options(&[st.stream.as_str()], &[st.last_id.as_str()], &opts)
                    .await;
                match reply {
                    Ok(Some(reply)) => {
                        st.errors = 0;
                        let mut batch = Vec::new();
                        for key in reply.keys {
                            for entry in key.ids {
                                st.last_id = entry.id.clone();
                                if let Some(env) = decode_entry(&entry) {
                                    batch.push(env);
                                }
                            }
                        }
                        if batch.is_empty() {
                            continue;
                        }
                        return Some((futures::stream::iter(batch), st));
                    }
                    // Block timeout: nothing new yet.
                    Ok(None) => continue,
                    Err(err) => {
                        st.errors += 1;
                        if st.errors >= FOLLOW_MAX_ERRORS {
                            tracing::error!(
                                error = %err,
                                stream = %st.stream,
                                "stream follow giving up"
                            );
                            return None;
                        }
                        tracing::warn!(error = %err, stream = %st.stream, "stream read failed");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        })
        .flatten();

        Ok(Box::pin(stream))
    }

    async fn delete(&self, key: &str) -> RunnerResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(bus_err)?;
        Ok(())
    }

    async fn queue_push(&self, queue: &str, value: &str) -> RunnerResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(queue, value).await.map_err(bus_err)?;
        Ok(())
    }

    async fn queue_pop(&self, queue: &str) -> RunnerResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.lpop(queue, None).await.map_err(bus_err)?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> RunnerResult<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, seconds).await.map_err(bus_err)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> RunnerResult<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(bus_err)
    }

    async fn ping(&self) -> RunnerResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(bus_err)?;
        Ok(())
    }
}
