//! Redis Streams event log.
//!
//! One stream key per session, `events:{id}`. Publish is `XADD` with
//! `MAXLEN ~` trimming; history is `XREVRANGE`; the live subscription is
//! a blocking `XREAD` loop that re-checks the cancel signal between
//! blocks. Redis assigns the `"<ms>-<seq>"` ids, which parse directly
//! into [`EventId`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Pool, Runtime};
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::warn;

use super::{CancelSignal, EventBatchStream, EventStream};
use crate::error::{Error, Result};
use crate::event::{Event, EventId, EventType, NewEvent};

const XREAD_BLOCK_MS: usize = 1_000;

/// Redis Streams-backed event log.
pub struct RedisEventStream {
    pool: Pool,
    max_len: usize,
    ttl_secs: i64,
}

impl std::fmt::Debug for RedisEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEventStream")
            .field("max_len", &self.max_len)
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl RedisEventStream {
    /// Create a stream from a connection URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] when the pool cannot be built.
    pub fn new(url: &str, pool_max: usize, max_len: usize, ttl_secs: u64) -> Result<Self> {
        let mut cfg = Config::from_url(url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(pool_max));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::store(e.to_string()))?;
        Ok(Self {
            pool,
            max_len,
            ttl_secs: ttl_secs as i64,
        })
    }

    fn stream_key(session_id: &str) -> String {
        format!("events:{session_id}")
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::store(e.to_string()))
    }

    fn decode_entry(
        session_id: &str,
        id: &str,
        fields: &HashMap<String, redis::Value>,
    ) -> Result<Event> {
        let text = |name: &str| -> Result<String> {
            match fields.get(name) {
                Some(value) => redis::from_redis_value(value)
                    .map_err(|e| Error::store(format!("bad field '{name}': {e}"))),
                None => Err(Error::store(format!(
                    "event {id} in {session_id} missing field '{name}'"
                ))),
            }
        };

        let event_type: EventType =
            serde_json::from_value(serde_json::Value::String(text("type")?))?;
        let step_index = text("step_index")?
            .parse()
            .map_err(|_| Error::store(format!("malformed step_index in event {id}")))?;
        let timestamp = text("timestamp")?
            .parse()
            .map_err(|_| Error::store(format!("malformed timestamp in event {id}")))?;
        let data = serde_json::from_str(&text("data")?)?;

        Ok(Event {
            id: id
                .parse()
                .map_err(|_| Error::store(format!("malformed stream id {id}")))?,
            event_type,
            step_index,
            session_id: session_id.to_string(),
            timestamp,
            data,
        })
    }
}

#[async_trait]
impl EventStream for RedisEventStream {
    async fn publish(&self, session_id: &str, event: NewEvent) -> Result<EventId> {
        let key = Self::stream_key(session_id);
        let data = serde_json::to_string(&event.data)?;
        let fields = [
            ("type", event.event_type.as_str().to_string()),
            ("step_index", event.step_index.to_string()),
            ("session_id", session_id.to_string()),
            ("data", data),
            ("timestamp", Utc::now().timestamp_millis().to_string()),
        ];

        let mut conn = self.connection().await?;
        let id: String = conn
            .xadd_maxlen(&key, StreamMaxlen::Approx(self.max_len), "*", &fields)
            .await?;
        let _: () = conn.expire(&key, self.ttl_secs).await?;

        id.parse()
            .map_err(|_| Error::store(format!("redis returned malformed stream id {id}")))
    }

    async fn history(&self, session_id: &str, count: usize) -> Result<Vec<Event>> {
        let key = Self::stream_key(session_id);
        let mut conn = self.connection().await?;
        let reply: redis::streams::StreamRangeReply =
            conn.xrevrange_count(&key, "+", "-", count).await?;

        reply
            .ids
            .iter()
            .map(|entry| Self::decode_entry(session_id, &entry.id, &entry.map))
            .collect()
    }

    async fn subscribe(
        &self,
        session_id: &str,
        from_id: EventId,
        cancel: CancelSignal,
    ) -> Result<EventBatchStream> {
        let key = Self::stream_key(session_id);
        let session_id = session_id.to_string();
        let pool = self.pool.clone();
        let mut cancel = cancel;

        let stream = async_stream::stream! {
            let mut cursor = from_id.to_string();
            let mut conn = match pool.get().await {
                Ok(conn) => conn,
                Err(e) => {
                    yield Err(Error::store(e.to_string()));
                    return;
                }
            };

            loop {
                if cancel.is_cancelled() {
                    return;
                }

                let options = StreamReadOptions::default().block(XREAD_BLOCK_MS).count(100);
                let keys = [&key];
                let cursors = [cursor.as_str()];
                let read = tokio::select! {
                    _ = cancel.cancelled() => return,
                    read = conn.xread_options::<_, _, StreamReadReply>(
                        &keys,
                        &cursors,
                        &options,
                    ) => read,
                };

                let reply = match read {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "event stream read failed");
                        yield Err(Error::from(e));
                        return;
                    }
                };

                let mut batch = Vec::new();
                for stream_key in reply.keys {
                    for entry in stream_key.ids {
                        match Self::decode_entry(&session_id, &entry.id, &entry.map) {
                            Ok(event) => {
                                cursor = entry.id.clone();
                                batch.push(event);
                            }
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                    }
                }

                if !batch.is_empty() {
                    yield Ok(batch);
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn cleanup(&self, session_id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(Self::stream_key(session_id)).await?;
        Ok(())
    }
}
