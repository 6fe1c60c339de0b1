//! The delayed work queue.
//!
//! Steps are never invoked by a function return: the engine finishes a
//! step, computes a delay, and schedules the next step here. The queue
//! guarantees at-least-once delivery back into the step dispatcher, so
//! every step must be idempotent (the engine acknowledges stale
//! deliveries by step index).
//!
//! Two implementations: [`TimerQueue`] for development (in-process
//! `tokio::time` timers) and [`HttpDispatchQueue`] for production (a
//! third-party delayed HTTP dispatcher posting back to this service).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::StepContext;
use crate::error::Result;
use crate::message::ToolCall;

mod timer;

#[cfg(feature = "http-queue")]
mod http;

pub use timer::TimerQueue;

#[cfg(feature = "http-queue")]
pub use http::HttpDispatchQueue;

/// Delay applied by [`WorkQueue::schedule_immediate`].
pub const IMMEDIATE_DELAY: Duration = Duration::from_millis(100);

/// Maximum delivery attempts per task.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Scheduling priority of a queued step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Human-facing work: interventions, session starts.
    High,
    /// Ordinary step continuation.
    #[default]
    Normal,
    /// Background work.
    Low,
}

impl Priority {
    /// Base scheduling delay for this priority.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        match self {
            Self::High => Duration::from_millis(200),
            Self::Normal => Duration::from_millis(1_000),
            Self::Low => Duration::from_millis(5_000),
        }
    }
}

/// Inputs to the delay policy, all derived from the finished step.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayInput {
    /// Priority of the step being scheduled.
    pub priority: Priority,
    /// Index of the step being scheduled.
    pub step_index: u64,
    /// Whether the previous step emitted any tool result.
    pub has_tool_calls: bool,
    /// Whether the previous step emitted any error event.
    pub has_errors: bool,
}

/// Pure delay policy: base delay per priority, a pacing penalty after
/// tool results, and a capped backoff after errors.
#[must_use]
pub fn calculate_delay(input: DelayInput) -> Duration {
    let mut delay = input.priority.base_delay();
    if input.has_tool_calls {
        delay += Duration::from_millis(1_000);
    }
    if input.has_errors {
        delay += Duration::from_millis((input.step_index * 1_000).min(10_000));
    }
    delay
}

/// The serialized body of one queued step dispatch.
///
/// Field names follow the step-callback wire format, so this struct is
/// both the queue payload and the `POST /execute-step` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTask {
    /// The session to advance.
    pub session_id: String,
    /// The step index this dispatch expects to execute.
    pub step_index: u64,
    /// Context carried from the previous step, absent on cold starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<StepContext>,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Suppress continuation after this step.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_complete: bool,
    /// An approved tool call from a human intervention.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_tool_call: Option<ToolCall>,
    /// A rejection reason from a human intervention.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// A human prompt answer or selection payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_input: Option<Value>,
}

impl StepTask {
    /// Create a bare task with no context or intervention payload.
    #[must_use]
    pub fn new(session_id: impl Into<String>, step_index: u64) -> Self {
        Self {
            session_id: session_id.into(),
            step_index,
            context: None,
            priority: Priority::default(),
            force_complete: false,
            approved_tool_call: None,
            rejection_reason: None,
            human_input: None,
        }
    }

    /// Attach the carried context.
    #[must_use]
    pub fn with_context(mut self, context: StepContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Set the scheduling priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether this task carries any human-intervention payload.
    #[must_use]
    pub const fn has_intervention(&self) -> bool {
        self.approved_tool_call.is_some()
            || self.rejection_reason.is_some()
            || self.human_input.is_some()
    }
}

/// Identifier of a scheduled task, for best-effort cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery counters, cumulative since queue construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks accepted for scheduling.
    pub scheduled: u64,
    /// Tasks delivered successfully.
    pub delivered: u64,
    /// Delivery attempts that failed and were retried.
    pub retried: u64,
    /// Tasks abandoned after exhausting attempts.
    pub failed: u64,
    /// Tasks cancelled before delivery.
    pub cancelled: u64,
}

/// Queue liveness report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHealth {
    /// Whether the queue can currently accept and deliver work.
    pub healthy: bool,
    /// Implementation name.
    pub provider: String,
    /// Optional diagnostic detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Receives queue deliveries; implemented by the step engine.
#[async_trait]
pub trait StepDispatcher: Send + Sync {
    /// Execute the delivered task.
    ///
    /// # Errors
    ///
    /// A retriable error ([`crate::Error::is_retriable`]) makes the queue
    /// redeliver, up to the attempt limit; any other error acknowledges
    /// the task as terminally handled.
    async fn dispatch(&self, task: StepTask) -> Result<()>;
}

/// At-least-once delayed dispatch of step-execution callbacks.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Schedule a step after `delay`.
    async fn schedule_next_step(&self, task: StepTask, delay: Duration) -> Result<TaskId>;

    /// Schedule a step at high priority with the ~100ms immediate delay.
    async fn schedule_immediate(&self, task: StepTask) -> Result<TaskId> {
        self.schedule_next_step(task.with_priority(Priority::High), IMMEDIATE_DELAY)
            .await
    }

    /// Schedule several steps, preserving order of acceptance.
    async fn schedule_batch(&self, tasks: Vec<(StepTask, Duration)>) -> Result<Vec<TaskId>> {
        let mut ids = Vec::with_capacity(tasks.len());
        for (task, delay) in tasks {
            ids.push(self.schedule_next_step(task, delay).await?);
        }
        Ok(ids)
    }

    /// Best-effort cancellation. Returns `false` when the task was
    /// already delivered or the provider cannot cancel.
    async fn cancel(&self, task_id: &TaskId) -> Result<bool>;

    /// Current delivery counters.
    async fn stats(&self) -> QueueStats;

    /// Liveness report.
    async fn health(&self) -> QueueHealth;
}
