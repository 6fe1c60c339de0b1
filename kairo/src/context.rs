//! The phase-tagged context passed from one step to the next.
//!
//! Context is not persisted in the state store; it rides inside each
//! queued step dispatch, by value. The phase and its payload are one
//! adjacently-tagged enum so a context can never claim one phase while
//! carrying another phase's payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, ToolCall};
use crate::session::{SessionState, SessionStatus};

/// Which transition produced this context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// A fresh user message entered the session.
    UserInput,
    /// A model call finished.
    LlmResult,
    /// A tool invocation finished.
    ToolResult,
    /// A human answered a prompt or selection.
    HumanInput,
    /// A previous step failed and the session is recovering.
    ErrorRecovery,
}

impl Phase {
    /// Get the string representation of the phase.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UserInput => "user_input",
            Self::LlmResult => "llm_result",
            Self::ToolResult => "tool_result",
            Self::HumanInput => "human_input",
            Self::ErrorRecovery => "error_recovery",
        }
    }
}

/// Phase plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "payload", rename_all = "snake_case")]
pub enum PhaseData {
    /// The latest user message, when one triggered the step.
    UserInput {
        /// The triggering message, absent when resuming from stored history.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<Message>,
    },
    /// The model's output for the previous step.
    LlmResult {
        /// Final text content, when any was produced.
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        /// Tool calls the model requested.
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
        /// Convenience flag mirroring `!tool_calls.is_empty()`.
        #[serde(default)]
        has_tool_calls: bool,
    },
    /// The result of the previous step's tool invocation.
    ToolResult {
        /// The tool's JSON result.
        result: Value,
        /// The call this result answers.
        tool_call_id: String,
    },
    /// The human response that unblocked the session.
    HumanInput {
        /// The response payload (text or selections).
        response: Value,
    },
    /// Details of the failure being recovered from.
    ErrorRecovery {
        /// The error message.
        error: String,
    },
}

impl PhaseData {
    /// The phase tag of this payload.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self {
            Self::UserInput { .. } => Phase::UserInput,
            Self::LlmResult { .. } => Phase::LlmResult,
            Self::ToolResult { .. } => Phase::ToolResult,
            Self::HumanInput { .. } => Phase::HumanInput,
            Self::ErrorRecovery { .. } => Phase::ErrorRecovery,
        }
    }

    /// Build an `llm_result` payload from the model output.
    #[must_use]
    pub fn llm_result(result: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        let has_tool_calls = !tool_calls.is_empty();
        Self::LlmResult {
            result,
            tool_calls,
            has_tool_calls,
        }
    }
}

/// Read-only view of the session at context-construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Steps persisted so far.
    pub step_count: u64,
    /// Messages in the conversation.
    pub message_count: u64,
    /// Events published so far in the producing step.
    pub event_count: u64,
    /// Status at snapshot time.
    pub status: SessionStatus,
}

impl SessionSnapshot {
    /// Snapshot the given state.
    #[must_use]
    pub fn of(state: &SessionState, event_count: u64) -> Self {
        Self {
            step_count: state.step_count,
            message_count: state.messages.len() as u64,
            event_count,
            status: state.status,
        }
    }
}

/// The argument passed from step N to step N+1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepContext {
    /// Phase and payload.
    #[serde(flatten)]
    pub data: PhaseData,
    /// Session view when the context was produced.
    pub session: SessionSnapshot,
}

impl StepContext {
    /// Create a context from a payload and session view.
    #[must_use]
    pub const fn new(data: PhaseData, session: SessionSnapshot) -> Self {
        Self { data, session }
    }

    /// The phase tag.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.data.phase()
    }
}
