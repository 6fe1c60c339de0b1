//! Instruction executors.
//!
//! An executor takes `(instruction, state)` and produces events, a new
//! state, and — for the non-halting instructions — the context for the
//! next step. The halting executors (`finish` and the three human
//! pauses) return [`Continuation::Halt`]; the type system, not a
//! convention, is what stops the engine from scheduling after them.
//!
//! Executors publish through an [`EventSink`], which appends to the live
//! event stream and records the step's event list for the history entry
//! in one call. Executors never retry; retries live at the queue
//! dispatch boundary only.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::context::StepContext;
use crate::error::Result;
use crate::event::{Event, EventId, EventType, NewEvent};
use crate::instruction::Instruction;
use crate::session::SessionState;
use crate::stream::EventStream;

mod finish;
mod human;
mod llm;
mod tool;

pub use llm::{ChunkAggregator, ModelAdapter, ModelChunk, ModelRequest, ModelStream};
pub use tool::{ToolHost, ToolInvocation};

/// External collaborators the executors dispatch into.
#[derive(Clone)]
pub struct ExecutorDeps {
    /// The model adapter producing streaming chunks.
    pub model: Arc<dyn ModelAdapter>,
    /// The tool host executing tool calls.
    pub tools: Arc<dyn ToolHost>,
}

impl std::fmt::Debug for ExecutorDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorDeps")
            .field("model", &self.model.name())
            .finish_non_exhaustive()
    }
}

/// Publishes to the session's event stream while recording the step's
/// event list.
pub struct EventSink {
    stream: Arc<dyn EventStream>,
    session_id: String,
    step_index: u64,
    recorded: Vec<Event>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("session_id", &self.session_id)
            .field("step_index", &self.step_index)
            .field("recorded", &self.recorded.len())
            .finish_non_exhaustive()
    }
}

impl EventSink {
    /// Create a sink for one step of one session.
    #[must_use]
    pub fn new(stream: Arc<dyn EventStream>, session_id: impl Into<String>, step_index: u64) -> Self {
        Self {
            stream,
            session_id: session_id.into(),
            step_index,
            recorded: Vec::new(),
        }
    }

    /// Publish an event and record it for the step history.
    pub async fn emit(&mut self, event_type: EventType, data: Value) -> Result<EventId> {
        let id = self
            .stream
            .publish(
                &self.session_id,
                NewEvent::new(event_type, self.step_index, data.clone()),
            )
            .await?;
        self.recorded.push(Event {
            id,
            event_type,
            step_index: self.step_index,
            session_id: self.session_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            data,
        });
        Ok(id)
    }

    /// Events published through this sink so far, in order.
    #[must_use]
    pub fn recorded(&self) -> &[Event] {
        &self.recorded
    }

    /// Whether any `error` event went through this sink.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.recorded
            .iter()
            .any(|event| event.event_type == EventType::Error)
    }

    /// Number of events published through this sink.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.recorded.len() as u64
    }

    /// The step this sink publishes for.
    #[must_use]
    pub const fn step_index(&self) -> u64 {
        self.step_index
    }
}

/// Whether and how the session continues after a step.
#[derive(Debug, Clone)]
pub enum Continuation {
    /// Schedule a next step with this context.
    Next(StepContext),
    /// Do not schedule; the session paused or terminated.
    Halt,
}

impl Continuation {
    /// The carried context, when continuing.
    #[must_use]
    pub const fn context(&self) -> Option<&StepContext> {
        match self {
            Self::Next(context) => Some(context),
            Self::Halt => None,
        }
    }
}

/// Terminal details recorded by the `finish` executor.
#[derive(Debug, Clone)]
pub struct FinishInfo {
    /// Machine-readable completion reason.
    pub reason: String,
    /// Human-readable detail.
    pub reason_detail: Option<String>,
}

/// What one executor run produced.
#[derive(Debug)]
pub struct ExecutorOutput {
    /// The post-step session state.
    pub state: SessionState,
    /// Whether the session continues.
    pub continuation: Continuation,
    /// Set by the `finish` executor only.
    pub finish: Option<FinishInfo>,
}

impl ExecutorOutput {
    /// A continuing output.
    #[must_use]
    pub const fn next(state: SessionState, context: StepContext) -> Self {
        Self {
            state,
            continuation: Continuation::Next(context),
            finish: None,
        }
    }

    /// A halting output.
    #[must_use]
    pub const fn halt(state: SessionState) -> Self {
        Self {
            state,
            continuation: Continuation::Halt,
            finish: None,
        }
    }
}

/// Dispatch an instruction to its executor.
pub async fn execute(
    instruction: Instruction,
    state: SessionState,
    deps: &ExecutorDeps,
    sink: &mut EventSink,
) -> Result<ExecutorOutput> {
    match instruction {
        Instruction::CallLlm => llm::execute(state, deps, sink).await,
        Instruction::CallTool { calls } => tool::execute(&calls, state, deps, sink).await,
        Instruction::RequestHumanApprove { calls } => human::approve(calls, state, sink).await,
        Instruction::RequestHumanPrompt { prompt } => human::prompt(prompt, state, sink).await,
        Instruction::RequestHumanSelect { prompt, options } => {
            human::select(prompt, options, state, sink).await
        }
        Instruction::Finish {
            reason,
            reason_detail,
        } => finish::execute(reason, reason_detail, state),
    }
}
