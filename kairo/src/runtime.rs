//! Runtime assembly and lifecycle.
//!
//! The store, the event stream, and the queue are process-wide
//! collaborators, but never module-level globals: [`AgentRuntime`] owns
//! them behind `Arc`s with an explicit init/shutdown lifecycle, and
//! integration tests assemble the same runtime over in-memory backends.

use std::sync::Arc;

use futures::Stream;
use tracing::info;

use crate::config::{QueueConfig, RuntimeConfig, StoreBackend};
use crate::coordinator::SessionCoordinator;
use crate::engine::StepEngine;
use crate::error::{Error, Result};
use crate::executor::{ExecutorDeps, ModelAdapter, ToolHost};
use crate::instruction::{DefaultRunner, InstructionRunner};
use crate::queue::{TimerQueue, WorkQueue};
use crate::store::{MemorySessionStore, SessionStore};
use crate::stream::sse::{sse_frames, SseRequest};
use crate::stream::{CancelSignal, EventStream, MemoryEventStream};

/// The assembled runtime: every component behind its seam.
pub struct AgentRuntime {
    config: RuntimeConfig,
    store: Arc<dyn SessionStore>,
    events: Arc<dyn EventStream>,
    queue: Arc<dyn WorkQueue>,
    engine: Arc<StepEngine>,
    coordinator: Arc<SessionCoordinator>,
    timer: Option<Arc<TimerQueue>>,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("store", &self.config.store.backend)
            .field("queue", &queue_label(&self.config.queue))
            .finish_non_exhaustive()
    }
}

/// Provider label for logs; never the config itself, which may carry
/// a token.
fn queue_label(queue: &QueueConfig) -> &'static str {
    match queue {
        QueueConfig::InProcess => "in-process",
        QueueConfig::Http { .. } => "http",
    }
}

impl AgentRuntime {
    /// Build a runtime from configuration with the default runner.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when the configuration names a backend the
    /// build does not carry or omits a required URL;
    /// [`Error::StoreUnavailable`] when a Redis pool cannot be created.
    pub fn init(
        config: RuntimeConfig,
        model: Arc<dyn ModelAdapter>,
        tools: Arc<dyn ToolHost>,
    ) -> Result<Self> {
        let (store, events) = Self::build_backends(&config)?;
        Self::assemble(config, store, events, model, tools, Arc::new(DefaultRunner))
    }

    /// Assemble a runtime over explicit store and stream backends.
    ///
    /// This is the seam integration tests use to substitute in-memory
    /// implementations.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when the configured queue is unavailable.
    pub fn assemble(
        config: RuntimeConfig,
        store: Arc<dyn SessionStore>,
        events: Arc<dyn EventStream>,
        model: Arc<dyn ModelAdapter>,
        tools: Arc<dyn ToolHost>,
        runner: Arc<dyn InstructionRunner>,
    ) -> Result<Self> {
        let deps = ExecutorDeps { model, tools };

        let (queue, timer): (Arc<dyn WorkQueue>, Option<Arc<TimerQueue>>) = match &config.queue {
            QueueConfig::InProcess => {
                let timer = Arc::new(TimerQueue::new());
                (Arc::clone(&timer) as Arc<dyn WorkQueue>, Some(timer))
            }
            #[cfg(feature = "http-queue")]
            QueueConfig::Http {
                token,
                endpoint,
                callback_url,
            } => (
                Arc::new(crate::queue::HttpDispatchQueue::new(
                    endpoint.clone(),
                    token.clone(),
                    callback_url.clone(),
                )),
                None,
            ),
            #[cfg(not(feature = "http-queue"))]
            QueueConfig::Http { .. } => {
                return Err(Error::validation(
                    "http queue configured but the http-queue feature is disabled",
                ));
            }
        };

        let engine = Arc::new(StepEngine::new(
            Arc::clone(&store),
            Arc::clone(&events),
            Arc::clone(&queue),
            deps,
            runner,
            config.clone(),
        ));
        if let Some(ref timer) = timer {
            timer.bind(Arc::clone(&engine) as Arc<dyn crate::queue::StepDispatcher>);
        }

        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&events),
            Arc::clone(&queue),
            config.clone(),
        ));

        info!(
            store = ?config.store.backend,
            queue = queue_label(&config.queue),
            "runtime assembled"
        );
        Ok(Self {
            config,
            store,
            events,
            queue,
            engine,
            coordinator,
            timer,
        })
    }

    fn build_backends(
        config: &RuntimeConfig,
    ) -> Result<(Arc<dyn SessionStore>, Arc<dyn EventStream>)> {
        match config.store.backend {
            StoreBackend::Memory => Ok((
                Arc::new(MemorySessionStore::new(config.session_ttl())),
                Arc::new(MemoryEventStream::new(
                    config.event_log_max,
                    config.event_ttl(),
                )),
            )),
            #[cfg(feature = "redis-backend")]
            StoreBackend::Redis => {
                let url = config
                    .store
                    .url
                    .as_deref()
                    .ok_or_else(|| Error::validation("redis backend requires store.url"))?;
                let store = crate::store::RedisSessionStore::new(
                    url,
                    config.store.pool_max,
                    config.session_ttl_secs,
                )?;
                let events = crate::stream::RedisEventStream::new(
                    url,
                    config.store.pool_max,
                    config.event_log_max,
                    config.event_ttl_secs,
                )?;
                Ok((Arc::new(store), Arc::new(events)))
            }
            #[cfg(not(feature = "redis-backend"))]
            StoreBackend::Redis => Err(Error::validation(
                "redis backend configured but the redis-backend feature is disabled",
            )),
        }
    }

    /// The runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// The event stream.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventStream> {
        &self.events
    }

    /// The work queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    /// The step engine; the transport's step callback dispatches here.
    #[must_use]
    pub fn engine(&self) -> &Arc<StepEngine> {
        &self.engine
    }

    /// The session coordinator backing the public endpoints.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    /// SSE frame stream for one subscriber, per the wire contract.
    pub fn subscribe_sse(
        &self,
        request: SseRequest,
        cancel: CancelSignal,
    ) -> impl Stream<Item = String> + Send {
        sse_frames(
            Arc::clone(&self.events),
            request,
            self.config.history_slice,
            self.config.heartbeat(),
            cancel,
        )
    }

    /// Stop accepting in-process deliveries and drop pending timers.
    pub async fn shutdown(&self) {
        if let Some(ref timer) = self.timer {
            timer.drain().await;
        }
        info!("runtime shut down");
    }
}
