//! Instructions and the runner that decides them.
//!
//! An [`Instruction`] is the tagged union of everything a step can do.
//! The [`InstructionRunner`] is a pure decision function from
//! `(context, state)` to the next instruction; the engine executes it
//! and never second-guesses it. [`DefaultRunner`] ships the standard
//! tool-loop policy; embedders substitute their own runner for custom
//! agent behavior.

use serde::{Deserialize, Serialize};

use crate::context::{PhaseData, StepContext};
use crate::error::Result;
use crate::message::ToolCall;
use crate::session::SessionState;

/// What the next step does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Instruction {
    /// Invoke the configured model with the session's messages.
    CallLlm,
    /// Dispatch the given tool calls to the tool host.
    CallTool {
        /// Calls to execute, in order.
        calls: Vec<ToolCall>,
    },
    /// Pause for human approval of the given tool calls.
    RequestHumanApprove {
        /// Calls awaiting approval.
        calls: Vec<ToolCall>,
    },
    /// Pause for a free-text answer from the human.
    RequestHumanPrompt {
        /// The question to ask.
        prompt: String,
    },
    /// Pause for a selection from the human.
    RequestHumanSelect {
        /// The question to ask.
        prompt: String,
        /// Valid choices.
        options: Vec<String>,
    },
    /// Terminate the session.
    Finish {
        /// Machine-readable completion reason.
        reason: String,
        /// Human-readable detail, when available.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason_detail: Option<String>,
    },
}

impl Instruction {
    /// The instruction's tag, used in logs and error context.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::CallLlm => "call_llm",
            Self::CallTool { .. } => "call_tool",
            Self::RequestHumanApprove { .. } => "request_human_approve",
            Self::RequestHumanPrompt { .. } => "request_human_prompt",
            Self::RequestHumanSelect { .. } => "request_human_select",
            Self::Finish { .. } => "finish",
        }
    }

    /// Whether this instruction halts continuation by construction.
    #[must_use]
    pub const fn is_halting(&self) -> bool {
        matches!(
            self,
            Self::Finish { .. }
                | Self::RequestHumanApprove { .. }
                | Self::RequestHumanPrompt { .. }
                | Self::RequestHumanSelect { .. }
        )
    }
}

/// When tool calls require a human approval pause.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Execute tools without asking.
    #[default]
    Never,
    /// Every tool call pauses for approval.
    Always,
    /// Only the named tools pause for approval.
    Tools(Vec<String>),
}

impl ApprovalPolicy {
    /// Whether any of `calls` requires approval under this policy.
    #[must_use]
    pub fn requires_approval(&self, calls: &[ToolCall]) -> bool {
        match self {
            Self::Never => false,
            Self::Always => !calls.is_empty(),
            Self::Tools(names) => calls
                .iter()
                .any(|call| names.iter().any(|name| name == call.name())),
        }
    }
}

/// The pure decision function mapping `(context, state)` to an instruction.
pub trait InstructionRunner: Send + Sync {
    /// Decide what the step should do.
    ///
    /// # Errors
    ///
    /// Implementations return [`crate::Error::Logic`] when no valid
    /// instruction exists for the context; the engine turns that into an
    /// `error` event and an `error` status without retrying.
    fn decide(&self, context: &StepContext, state: &SessionState) -> Result<Instruction>;
}

/// The standard tool-loop runner.
///
/// Fresh input and tool results go to the model; model output with tool
/// calls goes to the tool host (pausing for approval when the session's
/// policy demands it); model output without tool calls finishes the
/// session. Human answers re-enter the model so the session resumes with
/// full context.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRunner;

impl InstructionRunner for DefaultRunner {
    fn decide(&self, context: &StepContext, state: &SessionState) -> Result<Instruction> {
        let instruction = match &context.data {
            PhaseData::UserInput { .. } | PhaseData::HumanInput { .. } => Instruction::CallLlm,
            PhaseData::LlmResult {
                tool_calls,
                has_tool_calls,
                result,
            } => {
                if *has_tool_calls && !tool_calls.is_empty() {
                    // Calls a human already approved do not pause again.
                    let unapproved: Vec<ToolCall> = tool_calls
                        .iter()
                        .filter(|call| !state.approved_tool_call_ids.contains(&call.id))
                        .cloned()
                        .collect();
                    if state.agent_config.approval.requires_approval(&unapproved) {
                        Instruction::RequestHumanApprove {
                            calls: tool_calls.clone(),
                        }
                    } else {
                        Instruction::CallTool {
                            calls: tool_calls.clone(),
                        }
                    }
                } else {
                    Instruction::Finish {
                        reason: "final_output".to_string(),
                        reason_detail: result.clone(),
                    }
                }
            }
            PhaseData::ToolResult { .. } => Instruction::CallLlm,
            PhaseData::ErrorRecovery { error } => Instruction::Finish {
                reason: "error_recovery".to_string(),
                reason_detail: Some(error.clone()),
            },
        };
        Ok(instruction)
    }
}
