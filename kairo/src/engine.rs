//! The per-step driver.
//!
//! One queue delivery, one step: load state, handle any human
//! intervention carried by the task, ask the runner for an instruction,
//! execute it under the wall-clock budget, persist the commit, publish
//! the bookkeeping events, and decide whether to enqueue the next step.
//!
//! At-least-once delivery is absorbed here: a task whose `step_index`
//! is below the stored `step_count` is acknowledged without executing,
//! and a task arriving for a terminal or interrupted session is
//! acknowledged and dropped. Executor faults propagate as retriable
//! errors so the queue redelivers; logic errors and budget overruns
//! transition the session to `error` and are acknowledged so the queue
//! does not loop.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::context::{Phase, PhaseData, SessionSnapshot, StepContext};
use crate::error::{Error, Result};
use crate::event::EventType;
use crate::executor::{self, Continuation, EventSink, ExecutorDeps, FinishInfo};
use crate::instruction::InstructionRunner;
use crate::message::{Message, Role};
use crate::queue::{calculate_delay, DelayInput, Priority, StepDispatcher, StepTask, WorkQueue};
use crate::session::{SessionState, SessionStatus, StepRecord};
use crate::store::{SessionStore, StepCommit};
use crate::stream::EventStream;
use crate::usage::OnExceeded;

/// How a delivered task was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDisposition {
    /// The step executed and committed.
    Executed,
    /// The task replayed an already-persisted step; acknowledged.
    Stale,
    /// The session was terminal or interrupted at load; acknowledged.
    Aborted,
}

/// Structured summary of one step execution, returned to the transport.
#[derive(Debug, Clone)]
pub struct StepSummary {
    /// The session advanced.
    pub session_id: String,
    /// The step index that ran (or was acknowledged).
    pub step_index: u64,
    /// How the delivery was handled.
    pub disposition: StepDisposition,
    /// Session status after the step.
    pub status: SessionStatus,
    /// Wall time the step took.
    pub execution_time_ms: u64,
    /// Whether the step produced a context for a successor.
    pub has_next_context: bool,
    /// Whether a successor was enqueued.
    pub scheduled_next: bool,
    /// Events published during the step.
    pub events_published: u64,
}

impl StepSummary {
    fn acknowledged(task: &StepTask, disposition: StepDisposition, status: SessionStatus) -> Self {
        Self {
            session_id: task.session_id.clone(),
            step_index: task.step_index,
            disposition,
            status,
            execution_time_ms: 0,
            has_next_context: false,
            scheduled_next: false,
            events_published: 0,
        }
    }
}

/// The per-step driver (C5).
pub struct StepEngine {
    store: Arc<dyn SessionStore>,
    events: Arc<dyn EventStream>,
    queue: Arc<dyn WorkQueue>,
    deps: ExecutorDeps,
    runner: Arc<dyn InstructionRunner>,
    config: RuntimeConfig,
}

impl std::fmt::Debug for StepEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepEngine").finish_non_exhaustive()
    }
}

impl StepEngine {
    /// Assemble an engine from its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        events: Arc<dyn EventStream>,
        queue: Arc<dyn WorkQueue>,
        deps: ExecutorDeps,
        runner: Arc<dyn InstructionRunner>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            events,
            queue,
            deps,
            runner,
            config,
        }
    }

    /// Execute one queue delivery.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the session state is missing (terminal
    /// to the queue), retriable errors on store or executor faults so
    /// the queue redelivers.
    pub async fn execute_step(&self, task: StepTask) -> Result<StepSummary> {
        let Some(mut state) = self.store.load_state(&task.session_id).await? else {
            return Err(Error::not_found(format!("session {}", task.session_id)));
        };

        if task.step_index < state.step_count {
            debug!(
                session_id = %task.session_id,
                task_step = task.step_index,
                step_count = state.step_count,
                "stale delivery acknowledged"
            );
            return Ok(StepSummary::acknowledged(
                &task,
                StepDisposition::Stale,
                state.status,
            ));
        }

        if state.status.is_terminal() || state.status == SessionStatus::Interrupted {
            debug!(
                session_id = %task.session_id,
                status = %state.status,
                "delivery for inactive session acknowledged"
            );
            return Ok(StepSummary::acknowledged(
                &task,
                StepDisposition::Aborted,
                state.status,
            ));
        }

        // A waiting session advances only through an intervention.
        if state.status == SessionStatus::WaitingForHumanInput && !task.has_intervention() {
            return Err(Error::conflict(format!(
                "session {} is waiting for human input",
                task.session_id
            )));
        }

        let step_index = state.step_count;
        let started = Instant::now();
        let cost_before = state.cost.total;
        let mut sink = EventSink::new(Arc::clone(&self.events), task.session_id.as_str(), step_index);

        sink.emit(EventType::StepStart, json!({ "status": state.status }))
            .await?;

        if state.status == SessionStatus::Idle {
            state.status = SessionStatus::Running;
        }

        // Human-intervention branch. Intervention events are published
        // before any follow-up step's work begins.
        let mut context = task.context.clone();
        if let Some(ref approved) = task.approved_tool_call {
            if state.status != SessionStatus::WaitingForHumanInput
                || state.pending_tools_calling.is_none()
            {
                return Err(Error::conflict(format!(
                    "session {} is not waiting for tool approval",
                    task.session_id
                )));
            }
            // Merge the approval into the original batch: sibling calls
            // still awaiting approval ride along so the runner can pause
            // for them again (or execute everything once all are cleared).
            let mut calls = state.pending_tools_calling.clone().unwrap_or_default();
            if let Some(slot) = calls.iter_mut().find(|call| call.id == approved.id) {
                *slot = approved.clone();
            } else {
                calls.push(approved.clone());
            }
            state.resume_running();
            state.approved_tool_call_ids.push(approved.id.clone());
            let payload = PhaseData::llm_result(None, calls);
            let snapshot = SessionSnapshot::of(&state, sink.count());
            context = Some(StepContext::new(payload, snapshot));
            info!(session_id = %task.session_id, call_id = %approved.id, "tool call approved");
        } else if let Some(ref reason) = task.rejection_reason {
            state.resume_running();
            state.status = SessionStatus::Done;
            let elapsed = self
                .commit(&mut state, &sink, step_index, &started, cost_before)
                .await?;
            self.publish_step_complete(&mut sink, &state, elapsed, false)
                .await?;
            sink.emit(
                EventType::Done,
                json!({ "reason": "rejected", "reason_detail": reason }),
            )
            .await?;
            info!(session_id = %task.session_id, reason = %reason, "session rejected");
            return Ok(StepSummary {
                session_id: task.session_id,
                step_index,
                disposition: StepDisposition::Executed,
                status: state.status,
                execution_time_ms: elapsed,
                has_next_context: false,
                scheduled_next: false,
                events_published: sink.count(),
            });
        } else if let Some(ref input) = task.human_input {
            let pending = state.pending_kind();
            if state.status != SessionStatus::WaitingForHumanInput || pending.is_none() {
                return Err(Error::conflict(format!(
                    "session {} is not waiting for human input",
                    task.session_id
                )));
            }
            state.resume_running();
            state.push_message(human_input_message(input));
            let payload = PhaseData::HumanInput {
                response: input.clone(),
            };
            let snapshot = SessionSnapshot::of(&state, sink.count());
            context = Some(StepContext::new(payload, snapshot));
        }

        // Cold dispatches carry no context; synthesize the initial phase
        // from the latest user message.
        let context = context.unwrap_or_else(|| {
            let message = state
                .messages
                .iter()
                .rev()
                .find(|message| message.role == Role::User)
                .cloned();
            StepContext::new(
                PhaseData::UserInput { message },
                SessionSnapshot::of(&state, sink.count()),
            )
        });

        let instruction = match self.runner.decide(&context, &state) {
            Ok(instruction) => instruction,
            Err(e) => {
                return self
                    .fail_step(task, state, sink, step_index, started, cost_before, "runner", e)
                    .await;
            }
        };
        debug!(
            session_id = %task.session_id,
            step_index,
            phase = context.phase().as_str(),
            instruction = instruction.tag(),
            "instruction decided"
        );

        let tag = instruction.tag();
        let execution = executor::execute(instruction, state.clone(), &self.deps, &mut sink);
        let outcome = tokio::time::timeout(self.config.step_budget(), execution).await;
        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                // Executor fault: the error event is already on the
                // stream; propagate so the queue redelivers.
                return Err(e);
            }
            Err(_) => {
                let budget = Error::executor(
                    tag,
                    format!("step exceeded wall-clock budget of {}ms", self.config.step_budget_ms),
                );
                sink.emit(
                    EventType::Error,
                    json!({ "phase": "step_budget", "error": budget.to_string() }),
                )
                .await?;
                return self
                    .fail_step(task, state, sink, step_index, started, cost_before, tag, budget)
                    .await;
            }
        };

        let mut state = output.state;

        // Crossing the cost limit with `interrupt` suspends the session
        // before the commit; `stop` only blocks continuation below.
        if let Some(ref limit) = state.cost_limit {
            if limit.is_exceeded(&state.cost)
                && limit.on_exceeded == OnExceeded::Interrupt
                && !state.status.is_terminal()
            {
                state.interrupt("cost_limit_exceeded", true);
            }
        }

        let elapsed = self
            .commit(&mut state, &sink, step_index, &started, cost_before)
            .await?;

        let has_next_context = matches!(output.continuation, Continuation::Next(_));
        self.publish_step_complete(&mut sink, &state, elapsed, has_next_context)
            .await?;

        if state.status == SessionStatus::Done {
            let info = output.finish.unwrap_or(FinishInfo {
                reason: "done".to_string(),
                reason_detail: None,
            });
            sink.emit(
                EventType::Done,
                json!({ "reason": info.reason, "reason_detail": info.reason_detail }),
            )
            .await?;
        }

        let scheduled_next = match output.continuation {
            Continuation::Next(next_context) if self.should_continue(&task, &state) => {
                self.schedule_next(&task.session_id, &state, next_context, &sink)
                    .await
            }
            _ => false,
        };

        Ok(StepSummary {
            session_id: task.session_id,
            step_index,
            disposition: StepDisposition::Executed,
            status: state.status,
            execution_time_ms: elapsed,
            has_next_context,
            scheduled_next,
            events_published: sink.count(),
        })
    }

    /// Commit the step: bump the step counter, stamp the state, and
    /// write state + history + metadata as one logical batch.
    async fn commit(
        &self,
        state: &mut SessionState,
        sink: &EventSink,
        step_index: u64,
        started: &Instant,
        cost_before: f64,
    ) -> Result<u64> {
        state.step_count = step_index + 1;
        state.last_modified = Utc::now();
        let elapsed = started.elapsed().as_millis() as u64;

        let commit = StepCommit {
            state: state.clone(),
            record: StepRecord {
                step_index,
                execution_time_ms: elapsed,
                timestamp: Utc::now(),
                status: state.status,
                cost_delta: state.cost.total - cost_before,
                events: sink.recorded().to_vec(),
            },
        };
        self.store.save_step_result(&state.session_id, &commit).await?;
        Ok(elapsed)
    }

    async fn publish_step_complete(
        &self,
        sink: &mut EventSink,
        state: &SessionState,
        elapsed: u64,
        has_next_context: bool,
    ) -> Result<()> {
        sink.emit(
            EventType::StepComplete,
            json!({
                "status": state.status,
                "total_steps": state.step_count,
                "execution_time_ms": elapsed,
                "has_next_context": has_next_context,
            }),
        )
        .await?;
        Ok(())
    }

    /// Terminal handling for runner and budget failures: error status,
    /// commit, acknowledge. The queue must not redeliver these.
    #[allow(clippy::too_many_arguments)]
    async fn fail_step(
        &self,
        task: StepTask,
        mut state: SessionState,
        mut sink: EventSink,
        step_index: u64,
        started: Instant,
        cost_before: f64,
        phase: &str,
        cause: Error,
    ) -> Result<StepSummary> {
        warn!(
            session_id = %task.session_id,
            step_index,
            phase,
            error = %cause,
            "step failed terminally"
        );
        if !sink.has_errors() {
            sink.emit(
                EventType::Error,
                json!({ "phase": phase, "error": cause.to_string() }),
            )
            .await?;
        }
        state.fail(cause.to_string(), Some(phase.to_string()));
        let elapsed = self
            .commit(&mut state, &sink, step_index, &started, cost_before)
            .await?;
        self.publish_step_complete(&mut sink, &state, elapsed, false)
            .await?;
        Ok(StepSummary {
            session_id: task.session_id,
            step_index,
            disposition: StepDisposition::Executed,
            status: state.status,
            execution_time_ms: elapsed,
            has_next_context: false,
            scheduled_next: false,
            events_published: sink.count(),
        })
    }

    /// The continuation rule. All conditions must hold.
    fn should_continue(&self, task: &StepTask, state: &SessionState) -> bool {
        if task.force_complete {
            return false;
        }
        if !matches!(state.status, SessionStatus::Running | SessionStatus::Idle) {
            return false;
        }
        if let Some(max_steps) = state.max_steps {
            if state.step_count >= max_steps {
                debug!(session_id = %state.session_id, max_steps, "step ceiling reached");
                return false;
            }
        }
        if let Some(ref limit) = state.cost_limit {
            if limit.is_exceeded(&state.cost) && limit.on_exceeded == OnExceeded::Stop {
                info!(
                    session_id = %state.session_id,
                    total_cost = state.cost.total,
                    "cost limit reached, stopping"
                );
                return false;
            }
        }
        true
    }

    async fn schedule_next(
        &self,
        session_id: &str,
        state: &SessionState,
        next_context: StepContext,
        sink: &EventSink,
    ) -> bool {
        let delay = calculate_delay(DelayInput {
            priority: Priority::Normal,
            step_index: state.step_count,
            has_tool_calls: next_context.phase() == Phase::ToolResult,
            has_errors: sink.has_errors(),
        });
        let next = StepTask::new(session_id, state.step_count).with_context(next_context);

        match self.queue.schedule_next_step(next, delay).await {
            Ok(task_id) => {
                debug!(
                    session_id = %session_id,
                    next_step = state.step_count,
                    delay_ms = delay.as_millis() as u64,
                    task_id = %task_id,
                    "next step scheduled"
                );
                true
            }
            Err(e) => {
                // The step itself is committed; a lost continuation is
                // recoverable through an explicit start.
                warn!(session_id = %session_id, error = %e, "failed to schedule next step");
                false
            }
        }
    }
}

/// Prompt answers and selections re-enter the conversation as the
/// user's own words; structured payloads are flattened to text.
fn human_input_message(input: &serde_json::Value) -> Message {
    let text = match input {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(serde_json::Value::as_str) {
                text.to_string()
            } else if let Some(selections) =
                map.get("selections").and_then(serde_json::Value::as_array)
            {
                selections
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            } else {
                input.to_string()
            }
        }
        other => other.to_string(),
    };
    Message::user(text)
}

#[async_trait]
impl StepDispatcher for StepEngine {
    async fn dispatch(&self, task: StepTask) -> Result<()> {
        self.execute_step(task).await.map(|_| ())
    }
}
