//! In-memory event stream.
//!
//! One bounded `VecDeque` log per session behind a `tokio::sync::RwLock`,
//! with a `watch` channel carrying the latest assigned id so subscribers
//! wake without polling. Used for development and as the substitutable
//! backend in integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};

use super::{CancelSignal, EventBatchStream, EventStream};
use crate::error::Result;
use crate::event::{Event, EventId, NewEvent};

#[derive(Debug)]
struct SessionLog {
    events: VecDeque<Event>,
    last_id: EventId,
    notify: watch::Sender<EventId>,
    expires_at: DateTime<Utc>,
}

impl SessionLog {
    fn new(expires_at: DateTime<Utc>) -> Self {
        let (notify, _) = watch::channel(EventId::ZERO);
        Self {
            events: VecDeque::new(),
            last_id: EventId::ZERO,
            notify,
            expires_at,
        }
    }
}

/// In-memory event stream with bounded per-session logs.
#[derive(Debug)]
pub struct MemoryEventStream {
    logs: RwLock<HashMap<String, Arc<RwLock<SessionLog>>>>,
    max_len: usize,
    ttl: Duration,
}

impl MemoryEventStream {
    /// Create a stream with the given retention settings.
    #[must_use]
    pub fn new(max_len: usize, ttl: Duration) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            max_len,
            ttl,
        }
    }

    /// Create a stream with the default bounds (1000 events, 1h TTL).
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(1_000, Duration::from_secs(3_600))
    }

    fn deadline(&self) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1))
    }

    async fn log_handle(&self, session_id: &str) -> Arc<RwLock<SessionLog>> {
        if let Some(log) = self.logs.read().await.get(session_id) {
            return Arc::clone(log);
        }
        let mut logs = self.logs.write().await;
        Arc::clone(
            logs.entry(session_id.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(SessionLog::new(self.deadline())))),
        )
    }

    fn next_id(last: EventId, now_ms: i64) -> EventId {
        if now_ms > last.ms {
            EventId::new(now_ms, 0)
        } else {
            // Same millisecond, or clock went backwards: keep monotonic.
            EventId::new(last.ms, last.seq + 1)
        }
    }
}

#[async_trait]
impl EventStream for MemoryEventStream {
    async fn publish(&self, session_id: &str, event: NewEvent) -> Result<EventId> {
        let handle = self.log_handle(session_id).await;
        let mut log = handle.write().await;

        let now = Utc::now();
        let id = Self::next_id(log.last_id, now.timestamp_millis());
        let canonical = Event {
            id,
            event_type: event.event_type,
            step_index: event.step_index,
            session_id: session_id.to_string(),
            timestamp: now.timestamp_millis(),
            data: event.data,
        };

        log.events.push_back(canonical);
        while log.events.len() > self.max_len {
            log.events.pop_front();
        }
        log.last_id = id;
        log.expires_at = self.deadline();
        let _ = log.notify.send(id);
        Ok(id)
    }

    async fn history(&self, session_id: &str, count: usize) -> Result<Vec<Event>> {
        let Some(handle) = self.logs.read().await.get(session_id).map(Arc::clone) else {
            return Ok(Vec::new());
        };
        let log = handle.read().await;
        if log.expires_at <= Utc::now() {
            return Ok(Vec::new());
        }
        Ok(log.events.iter().rev().take(count).cloned().collect())
    }

    async fn subscribe(
        &self,
        session_id: &str,
        from_id: EventId,
        cancel: CancelSignal,
    ) -> Result<EventBatchStream> {
        let handle = self.log_handle(session_id).await;
        let mut notify = handle.read().await.notify.subscribe();
        let mut cancel = cancel;
        let mut cursor = from_id;

        let stream = async_stream::stream! {
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                // Mark the latest id as seen before reading so a publish
                // racing with the read still wakes the next iteration.
                notify.borrow_and_update();

                let batch: Vec<Event> = {
                    let log = handle.read().await;
                    log.events
                        .iter()
                        .filter(|event| event.id > cursor)
                        .cloned()
                        .collect()
                };

                if let Some(last) = batch.last() {
                    cursor = last.id;
                    yield Ok(batch);
                    continue;
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = notify.changed() => {
                        if changed.is_err() {
                            // Log dropped (session cleanup): end the stream.
                            return;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn cleanup(&self, session_id: &str) -> Result<()> {
        self.logs.write().await.remove(session_id);
        Ok(())
    }
}
