//! The durable state store.
//!
//! Three logical keyspaces per session: `state:{id}` (the serialized
//! [`SessionState`] blob), `steps:{id}` (bounded step history, newest
//! first), and `meta:{id}` (field-addressable [`SessionMetadata`]).
//! All TTLs default to 24h and refresh on every write.
//!
//! Per-session writes are serialized by the queue guarantee that at most
//! one step per session is in flight; the store itself provides no
//! cross-session transactions.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::session::{SessionMetadata, SessionState, StepRecord};

mod memory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::MemorySessionStore;
#[cfg(feature = "redis-backend")]
pub use redis::RedisSessionStore;

/// Maximum step records retained per session.
pub const STEP_HISTORY_LIMIT: usize = 200;

/// The state blob and history entry committed together after a step.
#[derive(Debug, Clone)]
pub struct StepCommit {
    /// The post-step session state; replaces the stored blob.
    pub state: SessionState,
    /// The history entry for the step.
    pub record: StepRecord,
}

/// Initial values for a fresh metadata record.
#[derive(Debug, Clone, Default)]
pub struct MetadataInit {
    /// Owning user, when known.
    pub user_id: Option<String>,
    /// Model configuration blob.
    pub model_config: Value,
    /// Agent configuration blob.
    pub agent_config: Value,
}

/// Durable per-session state, step history, and metadata with TTL.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Replace the state blob, refresh TTLs on all three keyspaces, and
    /// denormalize status/cost/steps/activity into the metadata record.
    async fn save_state(&self, id: &str, state: &SessionState) -> Result<()>;

    /// Load the state blob. `None` when the key is missing or expired.
    async fn load_state(&self, id: &str) -> Result<Option<SessionState>>;

    /// Commit a step: overwrite state, prepend the record to history
    /// (trimmed to [`STEP_HISTORY_LIMIT`]), refresh TTLs, and update the
    /// denormalized metadata — one logical batch.
    ///
    /// Idempotent: replaying a commit whose `step_index` is below the
    /// stored `step_count` refreshes TTLs and changes nothing else.
    async fn save_step_result(&self, id: &str, commit: &StepCommit) -> Result<()>;

    /// Initialize a fresh metadata record with zero counters.
    async fn create_metadata(&self, id: &str, init: MetadataInit) -> Result<SessionMetadata>;

    /// Load the metadata record.
    async fn get_metadata(&self, id: &str) -> Result<Option<SessionMetadata>>;

    /// List metadata for all live sessions, most recently active first.
    async fn list_active(&self) -> Result<Vec<SessionMetadata>>;

    /// Load up to `limit` step records, newest first.
    async fn get_history(&self, id: &str, limit: usize) -> Result<Vec<StepRecord>>;

    /// Delete all three keyspaces for the session.
    async fn delete_session(&self, id: &str) -> Result<()>;

    /// Delete sessions whose `last_active_at` is older than the TTL.
    /// Returns the number of sessions removed.
    async fn cleanup_expired(&self) -> Result<usize>;
}

/// Whether a commit is a replay of an already-persisted step.
pub(crate) fn is_stale_commit(existing: Option<&SessionState>, commit: &StepCommit) -> bool {
    existing.is_some_and(|state| commit.record.step_index < state.step_count)
}
