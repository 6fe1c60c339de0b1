//! The per-session event stream.
//!
//! An append-only, bounded, replayable log per session with three
//! essential capabilities: append, range-read backward, and
//! subscribe-live-from-id. Producers publish to the store and never push
//! to subscribers directly; subscribers are independent readers that
//! resume from an id, which gives late joiners replay for free.
//!
//! Within one session the published sequence is totally ordered and ids
//! are monotonic. No ordering is implied across sessions.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::watch;

use crate::error::Result;
use crate::event::{Event, EventId, NewEvent};

mod memory;
#[cfg(feature = "redis-backend")]
mod redis;
pub mod sse;

pub use memory::MemoryEventStream;
#[cfg(feature = "redis-backend")]
pub use redis::RedisEventStream;

/// Ordered batches of events delivered to one subscriber.
pub type EventBatchStream = Pin<Box<dyn Stream<Item = Result<Vec<Event>>> + Send>>;

/// Sets the paired [`CancelSignal`]s. Dropping the handle also cancels.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fire the cancellation signal.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observes cancellation; clonable so one handle can stop many readers.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
    // Keeps the sender alive for signals with no external handle.
    _keepalive: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl CancelSignal {
    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until cancellation is requested (or the handle is dropped).
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped: treat as cancelled so readers terminate.
                return;
            }
        }
    }

    /// A signal that never fires, for subscriptions without a
    /// caller-provided lifetime.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(std::sync::Arc::new(tx)),
        }
    }
}

/// Create a linked cancellation pair.
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle { tx },
        CancelSignal {
            rx,
            _keepalive: None,
        },
    )
}

/// Append-only, bounded, replayable event log per session.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Canonicalize and append an event; returns the assigned id.
    ///
    /// The log keeps approximately the newest `max_len` events and its
    /// TTL is refreshed by every publish.
    async fn publish(&self, session_id: &str, event: NewEvent) -> Result<EventId>;

    /// The most recent `count` events, reverse-chronological.
    async fn history(&self, session_id: &str, count: usize) -> Result<Vec<Event>>;

    /// Read the log live, starting strictly after `from_id`, in id order,
    /// delivering batches until `cancel` fires (the stream then ends
    /// without error).
    async fn subscribe(
        &self,
        session_id: &str,
        from_id: EventId,
        cancel: CancelSignal,
    ) -> Result<EventBatchStream>;

    /// Delete the session's log.
    async fn cleanup(&self, session_id: &str) -> Result<()>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_pair_links_handle_and_signal() {
        let (handle, mut signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn dropping_handle_cancels() {
        let (handle, mut signal) = cancel_pair();
        drop(handle);
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn never_signal_stays_pending() {
        let mut signal = CancelSignal::never();
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(20), signal.cancelled()).await;
        assert!(result.is_err());
    }
}
