//! Durable session state, metadata, and step history records.
//!
//! A session is the unit of durability: everything the step engine needs
//! to resume after a process death lives in [`SessionState`], which is
//! written back to the state store after every step. [`SessionMetadata`]
//! is the denormalized companion used for listing and statistics, and
//! [`StepRecord`] is one entry of the bounded execution history.
//!
//! The pending-human fields are mutually exclusive: `waiting_for_human_input`
//! holds exactly when one of them is set. Mutation goes through the
//! checked setters below so the invariant cannot drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Event;
use crate::instruction::ApprovalPolicy;
use crate::message::{Message, ToolCall};
use crate::usage::{Cost, CostLimit, Usage};

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, no step executed yet.
    Idle,
    /// A step is executing or scheduled.
    Running,
    /// Paused awaiting an external approval, prompt answer, or selection.
    WaitingForHumanInput,
    /// Finished successfully; no further steps will run.
    Done,
    /// Failed; no further steps will run.
    Error,
    /// Cancelled or suspended by an external actor.
    Interrupted,
}

impl SessionStatus {
    /// Get the string representation of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::WaitingForHumanInput => "waiting_for_human_input",
            Self::Done => "done",
            Self::Error => "error",
            Self::Interrupted => "interrupted",
        }
    }

    /// Whether no further steps may ever be enqueued for this status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Whether the session is still progressing on its own.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Idle | Self::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model configuration a session was created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier, e.g. `"gpt-4.1"`.
    pub model: String,
    /// Provider identifier, e.g. `"openai"`.
    pub provider: String,
    /// Sampling temperature, when the provider supports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl ModelConfig {
    /// Create a configuration with the required fields.
    #[must_use]
    pub fn new(model: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
            temperature: None,
        }
    }
}

/// Agent behavior configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// When tool calls require a human approval pause.
    #[serde(default)]
    pub approval: ApprovalPolicy,
}

/// A pending free-text question to the human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanPrompt {
    /// The question shown to the human.
    pub prompt: String,
}

/// A pending selection request to the human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanSelect {
    /// The question shown to the human.
    pub prompt: String,
    /// Valid choices; every submitted selection must be one of these.
    pub options: Vec<String>,
}

/// Which kind of human input a waiting session expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    /// Tool calls awaiting approval.
    ToolApproval,
    /// A free-text prompt awaiting an answer.
    Prompt,
    /// A selection awaiting choices.
    Select,
}

/// Why and how a session was interrupted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interruption {
    /// Human-readable reason.
    pub reason: String,
    /// Whether the session may be resumed later.
    pub can_resume: bool,
    /// When the interruption happened.
    pub interrupted_at: DateTime<Utc>,
}

/// Error descriptor attached to a failed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    /// The error message.
    pub message: String,
    /// The phase or component that produced it, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// The durable per-session state blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Opaque session identifier.
    pub session_id: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Number of successfully persisted steps; strictly increases.
    pub step_count: u64,
    /// Ordered conversation; append-only outside intervention rewrites.
    pub messages: Vec<Message>,
    /// Accumulated cost; monotonically non-decreasing.
    pub cost: Cost,
    /// Accumulated token usage.
    pub usage: Usage,
    /// Step ceiling, when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u64>,
    /// Spending ceiling, when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_limit: Option<CostLimit>,
    /// Model the session runs against.
    pub model_config: ModelConfig,
    /// Agent behavior knobs.
    #[serde(default)]
    pub agent_config: AgentConfig,
    /// Last state mutation time; drives TTL refresh.
    pub last_modified: DateTime<Utc>,
    /// Ids of tool calls a human has already approved; the runner does
    /// not pause for these again.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approved_tool_call_ids: Vec<String>,
    /// Tool calls awaiting human approval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_tools_calling: Option<Vec<ToolCall>>,
    /// Free-text question awaiting an answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_human_prompt: Option<HumanPrompt>,
    /// Selection awaiting choices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_human_select: Option<HumanSelect>,
    /// Present when the session was interrupted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interruption: Option<Interruption>,
    /// Present when the session failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionError>,
}

impl SessionState {
    /// Create a fresh idle session.
    #[must_use]
    pub fn new(session_id: impl Into<String>, model_config: ModelConfig) -> Self {
        Self {
            session_id: session_id.into(),
            status: SessionStatus::Idle,
            step_count: 0,
            messages: Vec::new(),
            cost: Cost::default(),
            usage: Usage::zero(),
            max_steps: None,
            cost_limit: None,
            model_config,
            agent_config: AgentConfig::default(),
            last_modified: Utc::now(),
            approved_tool_call_ids: Vec::new(),
            pending_tools_calling: None,
            pending_human_prompt: None,
            pending_human_select: None,
            interruption: None,
            error: None,
        }
    }

    /// Append a message; the conversation is append-only outside
    /// human-intervention rewrites.
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Which pending human input is set, if any.
    #[must_use]
    pub const fn pending_kind(&self) -> Option<PendingKind> {
        match (
            &self.pending_tools_calling,
            &self.pending_human_prompt,
            &self.pending_human_select,
        ) {
            (Some(_), None, None) => Some(PendingKind::ToolApproval),
            (None, Some(_), None) => Some(PendingKind::Prompt),
            (None, None, Some(_)) => Some(PendingKind::Select),
            _ => None,
        }
    }

    /// Pause the session awaiting approval of `calls`.
    pub fn await_tool_approval(&mut self, calls: Vec<ToolCall>) {
        self.clear_pending_fields();
        self.pending_tools_calling = Some(calls);
        self.status = SessionStatus::WaitingForHumanInput;
    }

    /// Pause the session awaiting a free-text answer.
    pub fn await_prompt(&mut self, prompt: HumanPrompt) {
        self.clear_pending_fields();
        self.pending_human_prompt = Some(prompt);
        self.status = SessionStatus::WaitingForHumanInput;
    }

    /// Pause the session awaiting a selection.
    pub fn await_select(&mut self, select: HumanSelect) {
        self.clear_pending_fields();
        self.pending_human_select = Some(select);
        self.status = SessionStatus::WaitingForHumanInput;
    }

    /// Clear all pending fields and return to `running`.
    pub fn resume_running(&mut self) {
        self.clear_pending_fields();
        self.status = SessionStatus::Running;
    }

    /// Mark the session interrupted.
    pub fn interrupt(&mut self, reason: impl Into<String>, can_resume: bool) {
        self.clear_pending_fields();
        self.status = SessionStatus::Interrupted;
        self.interruption = Some(Interruption {
            reason: reason.into(),
            can_resume,
            interrupted_at: Utc::now(),
        });
    }

    /// Mark the session failed with the given descriptor.
    pub fn fail(&mut self, message: impl Into<String>, phase: Option<String>) {
        self.clear_pending_fields();
        self.status = SessionStatus::Error;
        self.error = Some(SessionError {
            message: message.into(),
            phase,
        });
    }

    /// `waiting_for_human_input` iff exactly one pending field is set.
    #[must_use]
    pub fn waiting_invariant_holds(&self) -> bool {
        let pending = [
            self.pending_tools_calling.is_some(),
            self.pending_human_prompt.is_some(),
            self.pending_human_select.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        match self.status {
            SessionStatus::WaitingForHumanInput => pending == 1,
            _ => pending == 0,
        }
    }

    fn clear_pending_fields(&mut self) {
        self.pending_tools_calling = None;
        self.pending_human_prompt = None;
        self.pending_human_select = None;
    }
}

/// Denormalized companion record for listing and statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// The session this record describes.
    pub session_id: String,
    /// Owning user, when supplied at creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time; drives TTL expiry.
    pub last_active_at: DateTime<Utc>,
    /// Denormalized from the state blob on every save.
    pub status: SessionStatus,
    /// Denormalized accumulated cost.
    pub total_cost: f64,
    /// Denormalized step count.
    pub total_steps: u64,
    /// Model configuration blob.
    pub model_config: Value,
    /// Agent configuration blob.
    pub agent_config: Value,
}

/// One entry of a session's bounded execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Index of the step this record describes.
    pub step_index: u64,
    /// Wall time the step took.
    pub execution_time_ms: u64,
    /// When the step committed.
    pub timestamp: DateTime<Utc>,
    /// Session status after the step.
    pub status: SessionStatus,
    /// Cost added by the step.
    pub cost_delta: f64,
    /// Events the step produced, in publish order.
    pub events: Vec<Event>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new("s-1", ModelConfig::new("gpt-4.1", "openai"))
    }

    mod status {
        use super::*;

        #[test]
        fn terminal_statuses() {
            assert!(SessionStatus::Done.is_terminal());
            assert!(SessionStatus::Error.is_terminal());
            assert!(!SessionStatus::Interrupted.is_terminal());
            assert!(!SessionStatus::WaitingForHumanInput.is_terminal());
        }

        #[test]
        fn serializes_snake_case() {
            assert_eq!(
                serde_json::to_string(&SessionStatus::WaitingForHumanInput).unwrap(),
                r#""waiting_for_human_input""#
            );
        }
    }

    mod pending_invariant {
        use super::*;

        #[test]
        fn fresh_state_holds_invariant() {
            let state = state();
            assert_eq!(state.status, SessionStatus::Idle);
            assert!(state.waiting_invariant_holds());
            assert!(state.pending_kind().is_none());
        }

        #[test]
        fn await_tool_approval_sets_exactly_one_pending() {
            let mut state = state();
            state.await_tool_approval(vec![ToolCall::function("t1", "calc", "{}")]);
            assert_eq!(state.status, SessionStatus::WaitingForHumanInput);
            assert_eq!(state.pending_kind(), Some(PendingKind::ToolApproval));
            assert!(state.waiting_invariant_holds());
        }

        #[test]
        fn switching_pending_kind_clears_the_previous_one() {
            let mut state = state();
            state.await_tool_approval(vec![ToolCall::function("t1", "calc", "{}")]);
            state.await_prompt(HumanPrompt {
                prompt: "continue?".into(),
            });
            assert_eq!(state.pending_kind(), Some(PendingKind::Prompt));
            assert!(state.pending_tools_calling.is_none());
            assert!(state.waiting_invariant_holds());
        }

        #[test]
        fn resume_running_clears_all_pending() {
            let mut state = state();
            state.await_select(HumanSelect {
                prompt: "pick".into(),
                options: vec!["a".into(), "b".into()],
            });
            state.resume_running();
            assert_eq!(state.status, SessionStatus::Running);
            assert!(state.pending_kind().is_none());
            assert!(state.waiting_invariant_holds());
        }

        #[test]
        fn interrupt_clears_pending_and_records_reason() {
            let mut state = state();
            state.await_prompt(HumanPrompt {
                prompt: "q".into(),
            });
            state.interrupt("deleted by user", false);
            assert_eq!(state.status, SessionStatus::Interrupted);
            assert!(state.pending_kind().is_none());
            let interruption = state.interruption.unwrap();
            assert_eq!(interruption.reason, "deleted by user");
            assert!(!interruption.can_resume);
        }

        #[test]
        fn fail_records_error_descriptor() {
            let mut state = state();
            state.fail("boom", Some("call_llm".into()));
            assert_eq!(state.status, SessionStatus::Error);
            assert_eq!(state.error.as_ref().unwrap().message, "boom");
            assert!(state.waiting_invariant_holds());
        }
    }

    mod serde_roundtrip {
        use super::*;

        #[test]
        fn state_roundtrips_deeply_equal() {
            let mut state = state();
            state.push_message(Message::user("hi"));
            state.cost.add(0.02);
            state.usage += Usage::new(10, 5);
            state.max_steps = Some(8);
            state.await_tool_approval(vec![ToolCall::function("t1", "calc", r#"{"x":2}"#)]);

            let json = serde_json::to_string(&state).unwrap();
            let parsed: SessionState = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, state);
        }

        #[test]
        fn absent_optionals_are_omitted() {
            let json = serde_json::to_string(&state()).unwrap();
            assert!(!json.contains("pending_tools_calling"));
            assert!(!json.contains("interruption"));
            assert!(!json.contains("max_steps"));
        }
    }
}
