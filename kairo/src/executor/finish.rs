//! The `finish` executor.

use tracing::info;

use super::{ExecutorOutput, FinishInfo};
use crate::error::Result;
use crate::session::{SessionState, SessionStatus};

/// Terminate the session. Returns no continuation by construction; the
/// engine publishes the closing `done` event after the step commits.
pub(super) fn execute(
    reason: String,
    reason_detail: Option<String>,
    mut state: SessionState,
) -> Result<ExecutorOutput> {
    info!(
        session_id = %state.session_id,
        reason = %reason,
        "session finished"
    );
    state.status = SessionStatus::Done;
    let mut output = ExecutorOutput::halt(state);
    output.finish = Some(FinishInfo {
        reason,
        reason_detail,
    });
    Ok(output)
}
