//! The human-pause executors.
//!
//! All three set `waiting_for_human_input` with exactly one pending
//! field, publish a `human_approval_request` event describing what is
//! needed, and halt. The approval variant additionally publishes a
//! `stream_chunk` of `chunk_type = tool_calls` so UIs can render the
//! calls being approved with the same code path as live model output.

use serde_json::json;
use tracing::info;

use super::{EventSink, ExecutorOutput};
use crate::error::Result;
use crate::event::EventType;
use crate::message::ToolCall;
use crate::session::{HumanPrompt, HumanSelect, SessionState};

pub(super) async fn approve(
    calls: Vec<ToolCall>,
    mut state: SessionState,
    sink: &mut EventSink,
) -> Result<ExecutorOutput> {
    info!(
        session_id = %state.session_id,
        calls = calls.len(),
        "pausing for tool approval"
    );

    sink.emit(
        EventType::HumanApprovalRequest,
        json!({
            "kind": "tool_approval",
            "tool_calls": &calls,
        }),
    )
    .await?;
    sink.emit(
        EventType::StreamChunk,
        json!({
            "chunk_type": "tool_calls",
            "content": "",
            "full_content": "",
            "tool_calls": &calls,
        }),
    )
    .await?;

    state.await_tool_approval(calls);
    Ok(ExecutorOutput::halt(state))
}

pub(super) async fn prompt(
    prompt: String,
    mut state: SessionState,
    sink: &mut EventSink,
) -> Result<ExecutorOutput> {
    info!(session_id = %state.session_id, "pausing for human prompt");

    sink.emit(
        EventType::HumanApprovalRequest,
        json!({
            "kind": "prompt",
            "prompt": &prompt,
        }),
    )
    .await?;

    state.await_prompt(HumanPrompt { prompt });
    Ok(ExecutorOutput::halt(state))
}

pub(super) async fn select(
    prompt: String,
    options: Vec<String>,
    mut state: SessionState,
    sink: &mut EventSink,
) -> Result<ExecutorOutput> {
    info!(
        session_id = %state.session_id,
        options = options.len(),
        "pausing for human selection"
    );

    sink.emit(
        EventType::HumanApprovalRequest,
        json!({
            "kind": "select",
            "prompt": &prompt,
            "options": &options,
        }),
    )
    .await?;

    state.await_select(HumanSelect { prompt, options });
    Ok(ExecutorOutput::halt(state))
}
