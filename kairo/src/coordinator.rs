//! The public session surface.
//!
//! Thin orchestration over the store, the event stream, and the queue:
//! create a session (optionally enqueuing step 0), accept human
//! interventions, report status, list pending interventions, and delete.
//! Each method maps 1:1 to an endpoint of the HTTP surface; the structs
//! here are the request/response bodies.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::context::{PhaseData, SessionSnapshot, StepContext};
use crate::error::{Error, Result};
use crate::event::{Event, EventType, NewEvent};
use crate::message::{Message, Role, ToolCall};
use crate::queue::{Priority, StepTask, TaskId, WorkQueue};
use crate::session::{
    AgentConfig, ModelConfig, PendingKind, SessionMetadata, SessionState, SessionStatus,
    StepRecord,
};
use crate::store::{MetadataInit, SessionStore};
use crate::stream::EventStream;
use crate::usage::{CostLimit, OnExceeded, Usage};

/// Delay before step 0 of an auto-started session.
const AUTO_START_DELAY: Duration = Duration::from_millis(500);

/// Body of `POST /session`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Explicit session id; generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Initial conversation, copied into the state.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Model configuration; `model` and `provider` are required.
    pub model_config: ModelConfig,
    /// Agent behavior knobs.
    #[serde(default)]
    pub agent_config: Option<AgentConfig>,
    /// Owning user for listing and filtering.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Enqueue step 0 immediately after creation.
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    /// Step ceiling.
    #[serde(default)]
    pub max_steps: Option<u64>,
    /// Spending ceiling.
    #[serde(default)]
    pub cost_limit: Option<CostLimit>,
}

const fn default_auto_start() -> bool {
    true
}

/// Response of `POST /session`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    /// The session's id.
    pub session_id: String,
    /// Status after creation.
    pub status: SessionStatus,
    /// Whether step 0 was enqueued.
    pub auto_started: bool,
    /// The queued task, when auto-started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Body of `POST /start`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// The session to start.
    pub session_id: String,
    /// Context for the first step; synthesized from state when absent.
    #[serde(default)]
    pub context: Option<StepContext>,
    /// Scheduling priority, `high` by default.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Delay override in milliseconds.
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

/// The human's decision in `POST /human-intervention`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterventionAction {
    /// Approve a pending tool call.
    Approve,
    /// Reject the pending tool calls and finish the session.
    Reject,
    /// Answer a pending prompt.
    Input,
    /// Answer a pending selection.
    Select,
}

/// Body of `POST /human-intervention`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionRequest {
    /// The waiting session.
    pub session_id: String,
    /// The decision kind.
    pub action: InterventionAction,
    /// Action payload: `approvedToolCall`, `text`, or `selections`.
    #[serde(default)]
    pub data: Value,
    /// Reason, for rejections.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Response of `POST /human-intervention`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionResponse {
    /// The session the intervention applies to.
    pub session_id: String,
    /// The immediately-scheduled follow-up step.
    pub task_id: TaskId,
}

/// Query of `GET /session`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    /// The session to describe.
    pub session_id: String,
    /// Include the step-record history.
    #[serde(default)]
    pub include_history: bool,
    /// History entries to include (default 10).
    #[serde(default)]
    pub history_limit: Option<usize>,
}

/// Aggregate counters for the status report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Steps persisted.
    pub total_steps: u64,
    /// Cost accumulated.
    pub total_cost: f64,
    /// Messages in the conversation.
    pub message_count: u64,
    /// Token usage accumulated.
    pub usage: Usage,
}

/// Response of `GET /session`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusReport {
    /// The full state blob.
    pub current_state: SessionState,
    /// The metadata record, when present.
    pub metadata: Option<SessionMetadata>,
    /// Aggregate counters.
    pub stats: SessionStats,
    /// Step history, newest first, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_history: Option<Vec<StepRecord>>,
    /// The most recent events on the stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_events: Option<Vec<Event>>,
    /// Whether the session is progressing and may still schedule steps.
    pub is_active: bool,
    /// Whether the session finished successfully.
    pub is_completed: bool,
    /// Whether the session failed.
    pub has_error: bool,
    /// Whether the session awaits a human intervention.
    pub needs_human_input: bool,
}

/// One entry of `GET /human-intervention`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingIntervention {
    /// The waiting session.
    pub session_id: String,
    /// What kind of input is awaited.
    pub kind: PendingKind,
    /// Calls awaiting approval, for `tool_approval`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Question text, for `prompt` and `select`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Valid choices, for `select`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    /// When the session started waiting.
    pub since: DateTime<Utc>,
}

/// Filter of `GET /human-intervention`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFilter {
    /// Restrict to one session.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Restrict to one user's sessions.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// The public surface over store, stream, and queue (C6).
pub struct SessionCoordinator {
    store: Arc<dyn SessionStore>,
    events: Arc<dyn EventStream>,
    queue: Arc<dyn WorkQueue>,
    config: RuntimeConfig,
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator").finish_non_exhaustive()
    }
}

impl SessionCoordinator {
    /// Assemble a coordinator from its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        events: Arc<dyn EventStream>,
        queue: Arc<dyn WorkQueue>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            events,
            queue,
            config,
        }
    }

    /// Create a session and, by default, enqueue its first step.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when `model_config.model` or
    /// `model_config.provider` is empty; store and queue errors
    /// propagate.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse> {
        if request.model_config.model.trim().is_empty() {
            return Err(Error::validation("model_config.model is required"));
        }
        if request.model_config.provider.trim().is_empty() {
            return Err(Error::validation("model_config.provider is required"));
        }

        let session_id = request
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut state = SessionState::new(&session_id, request.model_config.clone());
        state.messages = request.messages;
        state.max_steps = request.max_steps;
        state.cost_limit = request.cost_limit;
        if let Some(agent_config) = request.agent_config.clone() {
            state.agent_config = agent_config;
        }

        self.store.save_state(&session_id, &state).await?;
        self.store
            .create_metadata(
                &session_id,
                MetadataInit {
                    user_id: request.user_id,
                    model_config: serde_json::to_value(&request.model_config)?,
                    agent_config: serde_json::to_value(&state.agent_config)?,
                },
            )
            .await?;

        let task_id = if request.auto_start {
            let message = state
                .messages
                .iter()
                .rev()
                .find(|message| message.role == Role::User)
                .cloned();
            let context = StepContext::new(
                PhaseData::UserInput { message },
                SessionSnapshot::of(&state, 0),
            );
            let task = StepTask::new(&session_id, 0)
                .with_context(context)
                .with_priority(Priority::High);
            Some(self.queue.schedule_next_step(task, AUTO_START_DELAY).await?)
        } else {
            None
        };

        info!(
            session_id = %session_id,
            auto_started = task_id.is_some(),
            "session created"
        );
        Ok(CreateSessionResponse {
            session_id,
            status: state.status,
            auto_started: task_id.is_some(),
            task_id,
        })
    }

    /// Enqueue a step for an existing session.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown sessions.
    pub async fn start(&self, request: StartRequest) -> Result<TaskId> {
        let Some(state) = self.store.load_state(&request.session_id).await? else {
            return Err(Error::not_found(format!("session {}", request.session_id)));
        };

        let priority = request.priority.unwrap_or(Priority::High);
        let delay = request
            .delay_ms
            .map_or(AUTO_START_DELAY, Duration::from_millis);

        let mut task = StepTask::new(&request.session_id, state.step_count).with_priority(priority);
        if let Some(context) = request.context {
            task = task.with_context(context);
        }
        self.queue.schedule_next_step(task, delay).await
    }

    /// Validate an intervention against the session's pending field and
    /// enqueue an immediate step carrying it.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown sessions, [`Error::Conflict`]
    /// when the session is not waiting for human input,
    /// [`Error::Validation`] when the payload does not match what the
    /// session is waiting for. A queue failure surfaces as
    /// [`Error::Queue`]; no state was changed at that point.
    pub async fn process_intervention(
        &self,
        request: InterventionRequest,
    ) -> Result<InterventionResponse> {
        let Some(state) = self.store.load_state(&request.session_id).await? else {
            return Err(Error::not_found(format!("session {}", request.session_id)));
        };
        if state.status != SessionStatus::WaitingForHumanInput {
            return Err(Error::conflict(format!(
                "session {} is {}, not waiting_for_human_input",
                request.session_id, state.status
            )));
        }

        let mut task =
            StepTask::new(&request.session_id, state.step_count).with_priority(Priority::High);

        match request.action {
            InterventionAction::Approve => {
                let Some(pending) = state.pending_tools_calling.as_ref() else {
                    return Err(Error::conflict("session has no pending tool approval"));
                };
                let approved: ToolCall = serde_json::from_value(
                    request
                        .data
                        .get("approvedToolCall")
                        .cloned()
                        .ok_or_else(|| Error::validation("data.approvedToolCall is required"))?,
                )?;
                if !pending.iter().any(|call| call.id == approved.id) {
                    return Err(Error::validation(format!(
                        "tool call '{}' is not awaiting approval",
                        approved.id
                    )));
                }
                task.approved_tool_call = Some(approved);
            }
            InterventionAction::Reject => {
                let reason = request
                    .reason
                    .or_else(|| {
                        request
                            .data
                            .get("reason")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| "rejected".to_string());
                task.rejection_reason = Some(reason);
            }
            InterventionAction::Input => {
                if state.pending_human_prompt.is_none() {
                    return Err(Error::conflict("session has no pending prompt"));
                }
                if request.data.get("text").and_then(Value::as_str).is_none() {
                    return Err(Error::validation("data.text is required"));
                }
                task.human_input = Some(request.data);
            }
            InterventionAction::Select => {
                let Some(pending) = state.pending_human_select.as_ref() else {
                    return Err(Error::conflict("session has no pending selection"));
                };
                let selections = request
                    .data
                    .get("selections")
                    .and_then(Value::as_array)
                    .ok_or_else(|| Error::validation("data.selections is required"))?;
                for selection in selections {
                    let choice = selection
                        .as_str()
                        .ok_or_else(|| Error::validation("selections must be strings"))?;
                    if !pending.options.iter().any(|option| option == choice) {
                        return Err(Error::validation(format!(
                            "'{choice}' is not one of the offered options"
                        )));
                    }
                }
                task.human_input = Some(request.data);
            }
        }

        let task_id = self.queue.schedule_immediate(task).await?;
        info!(
            session_id = %request.session_id,
            action = ?request.action,
            task_id = %task_id,
            "intervention scheduled"
        );
        Ok(InterventionResponse {
            session_id: request.session_id,
            task_id,
        })
    }

    /// Describe a session.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown sessions.
    pub async fn get_status(&self, request: StatusRequest) -> Result<SessionStatusReport> {
        let Some(state) = self.store.load_state(&request.session_id).await? else {
            return Err(Error::not_found(format!("session {}", request.session_id)));
        };
        let metadata = self.store.get_metadata(&request.session_id).await?;

        let execution_history = if request.include_history {
            let limit = request.history_limit.unwrap_or(10);
            Some(self.store.get_history(&request.session_id, limit).await?)
        } else {
            None
        };
        let recent_events = Some(
            self.events
                .history(&request.session_id, self.config.history_slice)
                .await?,
        );

        let stats = SessionStats {
            total_steps: state.step_count,
            total_cost: state.cost.total,
            message_count: state.messages.len() as u64,
            usage: state.usage,
        };

        Ok(SessionStatusReport {
            is_active: is_effectively_active(&state),
            is_completed: state.status == SessionStatus::Done,
            has_error: state.status == SessionStatus::Error || state.error.is_some(),
            needs_human_input: state.status == SessionStatus::WaitingForHumanInput,
            stats,
            metadata,
            execution_history,
            recent_events,
            current_state: state,
        })
    }

    /// List sessions waiting for a human, by session or by user.
    pub async fn list_pending_interventions(
        &self,
        filter: PendingFilter,
    ) -> Result<Vec<PendingIntervention>> {
        let mut session_ids = Vec::new();
        if let Some(session_id) = filter.session_id {
            session_ids.push(session_id);
        } else {
            let sessions = self.store.list_active().await?;
            for meta in sessions {
                if meta.status != SessionStatus::WaitingForHumanInput {
                    continue;
                }
                if let Some(ref user_id) = filter.user_id {
                    if meta.user_id.as_ref() != Some(user_id) {
                        continue;
                    }
                }
                session_ids.push(meta.session_id);
            }
        }

        let mut pending = Vec::new();
        for session_id in session_ids {
            let Some(state) = self.store.load_state(&session_id).await? else {
                continue;
            };
            let Some(kind) = state.pending_kind() else {
                continue;
            };
            pending.push(PendingIntervention {
                session_id,
                kind,
                tool_calls: state.pending_tools_calling,
                prompt: state
                    .pending_human_prompt
                    .map(|prompt| prompt.prompt)
                    .or_else(|| {
                        state
                            .pending_human_select
                            .as_ref()
                            .map(|select| select.prompt.clone())
                    }),
                options: state.pending_human_select.map(|select| select.options),
                since: state.last_modified,
            });
        }
        Ok(pending)
    }

    /// Delete a session and its event log.
    ///
    /// A running session is first transitioned to `interrupted`
    /// (`can_resume = false`) and an `error` event notes the deletion,
    /// so an in-flight step aborts at its next load.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown sessions.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let Some(mut state) = self.store.load_state(session_id).await? else {
            return Err(Error::not_found(format!("session {session_id}")));
        };

        if state.status == SessionStatus::Running {
            state.interrupt("deleted by user", false);
            self.store.save_state(session_id, &state).await?;
            if let Err(e) = self
                .events
                .publish(
                    session_id,
                    NewEvent::new(
                        EventType::Error,
                        state.step_count,
                        json!({
                            "phase": "session_lifecycle",
                            "error": "session deleted by user",
                        }),
                    ),
                )
                .await
            {
                warn!(session_id = %session_id, error = %e, "deletion event not published");
            }
        }

        self.store.delete_session(session_id).await?;
        self.events.cleanup(session_id).await?;
        info!(session_id = %session_id, "session deleted");
        Ok(())
    }
}

/// Active means the session may still schedule steps on its own: the
/// status is progressing and neither ceiling has been reached.
fn is_effectively_active(state: &SessionState) -> bool {
    if !state.status.is_active() {
        return false;
    }
    if let Some(max_steps) = state.max_steps {
        if state.step_count >= max_steps {
            return false;
        }
    }
    if let Some(ref limit) = state.cost_limit {
        if limit.is_exceeded(&state.cost) && limit.on_exceeded == OnExceeded::Stop {
            return false;
        }
    }
    true
}
