//! In-process timer queue.
//!
//! Each scheduled task becomes a spawned tokio task that sleeps for the
//! computed delay and then delivers into the bound [`StepDispatcher`],
//! retrying retriable failures up to the attempt limit. Per-session
//! ordering holds because the engine only schedules step N+1 after step
//! N has persisted.
//!
//! The dispatcher is bound after construction ([`TimerQueue::bind`])
//! because the engine that implements it also holds the queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    QueueHealth, QueueStats, StepDispatcher, StepTask, TaskId, WorkQueue, MAX_DELIVERY_ATTEMPTS,
};
use crate::error::{Error, Result};

const RETRY_PAUSE: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// In-process delayed dispatch built on `tokio::time`.
pub struct TimerQueue {
    dispatcher: OnceLock<Arc<dyn StepDispatcher>>,
    pending: Arc<Mutex<HashMap<TaskId, JoinHandle<()>>>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue")
            .field("bound", &self.dispatcher.get().is_some())
            .finish_non_exhaustive()
    }
}

impl TimerQueue {
    /// Create an unbound queue; call [`TimerQueue::bind`] before scheduling.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dispatcher: OnceLock::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Bind the dispatcher that receives deliveries. Later binds are ignored.
    pub fn bind(&self, dispatcher: Arc<dyn StepDispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    /// Abort all pending deliveries. Used at shutdown.
    pub async fn drain(&self) {
        let mut pending = self.pending.lock().await;
        for (_, handle) in pending.drain() {
            handle.abort();
        }
    }

    async fn deliver(dispatcher: Arc<dyn StepDispatcher>, counters: Arc<Counters>, task: StepTask) {
        for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
            match dispatcher.dispatch(task.clone()).await {
                Ok(()) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) if e.is_retriable() && attempt < MAX_DELIVERY_ATTEMPTS => {
                    warn!(
                        session_id = %task.session_id,
                        step_index = task.step_index,
                        attempt,
                        error = %e,
                        "step delivery failed, retrying"
                    );
                    counters.retried.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(RETRY_PAUSE * attempt).await;
                }
                Err(e) if e.is_retriable() => {
                    warn!(
                        session_id = %task.session_id,
                        step_index = task.step_index,
                        error = %e,
                        "step delivery abandoned after final attempt"
                    );
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    // Terminal outcome (missing session, logic error):
                    // acknowledged, never redelivered.
                    debug!(
                        session_id = %task.session_id,
                        step_index = task.step_index,
                        error = %e,
                        "step delivery terminally acknowledged"
                    );
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for TimerQueue {
    async fn schedule_next_step(&self, task: StepTask, delay: Duration) -> Result<TaskId> {
        let dispatcher = self
            .dispatcher
            .get()
            .ok_or_else(|| Error::queue("timer queue has no dispatcher bound"))?
            .clone();

        let task_id = TaskId(Uuid::new_v4().to_string());
        let counters = Arc::clone(&self.counters);
        let pending = Arc::clone(&self.pending);
        let handle_key = task_id.clone();

        debug!(
            session_id = %task.session_id,
            step_index = task.step_index,
            delay_ms = delay.as_millis() as u64,
            "scheduling step"
        );

        let handle = tokio::spawn({
            let handle_key = handle_key.clone();
            async move {
                tokio::time::sleep(delay).await;
                Self::deliver(dispatcher, counters, task).await;
                pending.lock().await.remove(&handle_key);
            }
        });

        self.pending
            .lock()
            .await
            .insert(task_id.clone(), handle);
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        Ok(task_id)
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<bool> {
        let Some(handle) = self.pending.lock().await.remove(task_id) else {
            return Ok(false);
        };
        handle.abort();
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn stats(&self) -> QueueStats {
        QueueStats {
            scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    async fn health(&self) -> QueueHealth {
        let bound = self.dispatcher.get().is_some();
        QueueHealth {
            healthy: bound,
            provider: "in-process-timer".to_string(),
            detail: (!bound).then(|| "no dispatcher bound".to_string()),
        }
    }
}
