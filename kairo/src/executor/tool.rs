//! The `call_tool` executor and the tool host contract.
//!
//! Arguments arrive as the raw JSON string the model emitted; they are
//! parsed here, at dispatch time. A malformed payload publishes an
//! `error` event and fails the step. A fault from the host itself is
//! softer: the error is published and the state returned unchanged with
//! an `error_recovery` context, leaving the recovery decision to the
//! runner.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{EventSink, ExecutorDeps, ExecutorOutput};
use crate::context::{PhaseData, SessionSnapshot, StepContext};
use crate::error::{Error, Result};
use crate::event::EventType;
use crate::message::{Message, ToolCall};
use crate::session::{SessionState, SessionStatus};

/// A parsed, ready-to-dispatch tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// The originating call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Parsed arguments.
    pub arguments: Value,
}

/// Abstraction over the external tool host.
#[async_trait]
pub trait ToolHost: Send + Sync {
    /// Execute one tool call and return its JSON result.
    async fn invoke(&self, invocation: &ToolInvocation) -> Result<Value>;
}

pub(super) async fn execute(
    calls: &[ToolCall],
    state: SessionState,
    deps: &ExecutorDeps,
    sink: &mut EventSink,
) -> Result<ExecutorOutput> {
    // Kept pristine so a host fault can hand back an unchanged state.
    let entry_state = state.clone();
    let mut state = state;
    let mut last_result: Option<(Value, String)> = None;

    for call in calls {
        sink.emit(EventType::ToolStart, json!({ "tool_call": call }))
            .await?;

        let arguments: Value = match call.parse_arguments() {
            Ok(arguments) => arguments,
            Err(e) => {
                sink.emit(
                    EventType::Error,
                    json!({
                        "phase": "tool_arguments",
                        "tool": call.name(),
                        "error": e.to_string(),
                    }),
                )
                .await?;
                return Err(Error::executor(
                    "call_tool",
                    format!("malformed arguments for '{}': {e}", call.name()),
                ));
            }
        };

        let invocation = ToolInvocation {
            id: call.id.clone(),
            name: call.name().to_string(),
            arguments,
        };

        let started = Utc::now();
        match deps.tools.invoke(&invocation).await {
            Ok(result) => {
                let elapsed_ms = (Utc::now() - started).num_milliseconds().max(0);
                debug!(
                    session_id = %state.session_id,
                    tool = %invocation.name,
                    elapsed_ms,
                    "tool call completed"
                );

                let stringified = serde_json::to_string(&result)?;
                state.push_message(Message::tool(&call.id, stringified));

                sink.emit(
                    EventType::ToolComplete,
                    json!({
                        "tool_call_id": call.id,
                        "tool": invocation.name,
                        "execution_time_ms": elapsed_ms,
                        "result": result,
                    }),
                )
                .await?;

                last_result = Some((result, call.id.clone()));
            }
            Err(e) => {
                warn!(
                    session_id = %state.session_id,
                    tool = %invocation.name,
                    error = %e,
                    "tool host fault"
                );
                sink.emit(
                    EventType::Error,
                    json!({
                        "phase": "tool_execution",
                        "tool": invocation.name,
                        "error": e.to_string(),
                    }),
                )
                .await?;

                // State unchanged; the runner decides retry or recovery.
                let payload = PhaseData::ErrorRecovery {
                    error: format!("tool '{}' failed: {e}", invocation.name),
                };
                let snapshot = SessionSnapshot::of(&entry_state, sink.count());
                return Ok(ExecutorOutput::next(
                    entry_state,
                    StepContext::new(payload, snapshot),
                ));
            }
        }
    }

    let Some((result, tool_call_id)) = last_result else {
        return Err(Error::logic("call_tool instruction carried no calls"));
    };

    state.status = SessionStatus::Running;
    let payload = PhaseData::ToolResult {
        result,
        tool_call_id,
    };
    let snapshot = SessionSnapshot::of(&state, sink.count());
    Ok(ExecutorOutput::next(
        state,
        StepContext::new(payload, snapshot),
    ))
}
