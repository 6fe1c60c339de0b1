//! In-memory state store.
//!
//! [`MemorySessionStore`] keeps the three keyspaces in `HashMap`s behind
//! a `tokio::sync::RwLock`, with TTL deadlines checked on read. Data is
//! lost when the process exits. Used for development and as the
//! substitutable backend in integration tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{MetadataInit, SessionStore, StepCommit, STEP_HISTORY_LIMIT};
use crate::error::Result;
use crate::session::{SessionMetadata, SessionState, SessionStatus, StepRecord};

#[derive(Debug, Default)]
struct Keyspaces {
    states: HashMap<String, (SessionState, DateTime<Utc>)>,
    steps: HashMap<String, (VecDeque<StepRecord>, DateTime<Utc>)>,
    meta: HashMap<String, (SessionMetadata, DateTime<Utc>)>,
}

/// In-memory session store with TTL semantics.
#[derive(Debug)]
pub struct MemorySessionStore {
    inner: RwLock<Keyspaces>,
    ttl: Duration,
}

impl MemorySessionStore {
    /// Create a store with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Keyspaces::default()),
            ttl,
        }
    }

    /// Create a store with the default 24h TTL.
    #[must_use]
    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(86_400))
    }

    fn deadline(&self) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(24))
    }

    fn denormalize(meta: &mut SessionMetadata, state: &SessionState) {
        meta.status = state.status;
        meta.total_cost = state.cost.total;
        meta.total_steps = state.step_count;
        meta.last_active_at = Utc::now();
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save_state(&self, id: &str, state: &SessionState) -> Result<()> {
        let deadline = self.deadline();
        let mut inner = self.inner.write().await;
        inner
            .states
            .insert(id.to_string(), (state.clone(), deadline));
        if let Some((steps, steps_deadline)) = inner.steps.get_mut(id) {
            let _ = steps;
            *steps_deadline = deadline;
        }
        if let Some((meta, meta_deadline)) = inner.meta.get_mut(id) {
            Self::denormalize(meta, state);
            *meta_deadline = deadline;
        }
        Ok(())
    }

    async fn load_state(&self, id: &str) -> Result<Option<SessionState>> {
        let inner = self.inner.read().await;
        Ok(inner.states.get(id).and_then(|(state, deadline)| {
            (*deadline > Utc::now()).then(|| state.clone())
        }))
    }

    async fn save_step_result(&self, id: &str, commit: &StepCommit) -> Result<()> {
        let deadline = self.deadline();
        let mut inner = self.inner.write().await;

        let existing = inner.states.get(id).map(|(state, _)| state);
        if super::is_stale_commit(existing, commit) {
            // Replayed delivery: refresh TTLs only.
            if let Some((_, state_deadline)) = inner.states.get_mut(id) {
                *state_deadline = deadline;
            }
            if let Some((_, steps_deadline)) = inner.steps.get_mut(id) {
                *steps_deadline = deadline;
            }
            if let Some((_, meta_deadline)) = inner.meta.get_mut(id) {
                *meta_deadline = deadline;
            }
            return Ok(());
        }

        inner
            .states
            .insert(id.to_string(), (commit.state.clone(), deadline));

        let (steps, steps_deadline) = inner
            .steps
            .entry(id.to_string())
            .or_insert_with(|| (VecDeque::new(), deadline));
        if steps
            .iter()
            .all(|record| record.step_index != commit.record.step_index)
        {
            steps.push_front(commit.record.clone());
            steps.truncate(STEP_HISTORY_LIMIT);
        }
        *steps_deadline = deadline;

        if let Some((meta, meta_deadline)) = inner.meta.get_mut(id) {
            Self::denormalize(meta, &commit.state);
            *meta_deadline = deadline;
        }

        Ok(())
    }

    async fn create_metadata(&self, id: &str, init: MetadataInit) -> Result<SessionMetadata> {
        let now = Utc::now();
        let meta = SessionMetadata {
            session_id: id.to_string(),
            user_id: init.user_id,
            created_at: now,
            last_active_at: now,
            status: SessionStatus::Idle,
            total_cost: 0.0,
            total_steps: 0,
            model_config: init.model_config,
            agent_config: init.agent_config,
        };
        let deadline = self.deadline();
        self.inner
            .write()
            .await
            .meta
            .insert(id.to_string(), (meta.clone(), deadline));
        Ok(meta)
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<SessionMetadata>> {
        let inner = self.inner.read().await;
        Ok(inner
            .meta
            .get(id)
            .and_then(|(meta, deadline)| (*deadline > Utc::now()).then(|| meta.clone())))
    }

    async fn list_active(&self) -> Result<Vec<SessionMetadata>> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        let mut sessions: Vec<SessionMetadata> = inner
            .meta
            .values()
            .filter(|(_, deadline)| *deadline > now)
            .map(|(meta, _)| meta.clone())
            .collect();
        sessions.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(sessions)
    }

    async fn get_history(&self, id: &str, limit: usize) -> Result<Vec<StepRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .steps
            .get(id)
            .filter(|(_, deadline)| *deadline > Utc::now())
            .map(|(steps, _)| steps.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.states.remove(id);
        inner.steps.remove(id);
        inner.meta.remove(id);
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        let cutoff = Utc::now() - ttl;
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .meta
            .iter()
            .filter(|(_, (meta, _))| meta.last_active_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.states.remove(id);
            inner.steps.remove(id);
            inner.meta.remove(id);
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::session::ModelConfig;

    fn state(id: &str) -> SessionState {
        SessionState::new(id, ModelConfig::new("gpt-4.1", "openai"))
    }

    fn record(step_index: u64) -> StepRecord {
        StepRecord {
            step_index,
            execution_time_ms: 12,
            timestamp: Utc::now(),
            status: SessionStatus::Running,
            cost_delta: 0.0,
            events: Vec::new(),
        }
    }

    fn commit(id: &str, step_index: u64) -> StepCommit {
        let mut state = state(id);
        state.status = SessionStatus::Running;
        state.step_count = step_index + 1;
        StepCommit {
            state,
            record: record(step_index),
        }
    }

    mod state_blob {
        use super::*;

        #[tokio::test]
        async fn save_then_load_is_deep_equal() {
            let store = MemorySessionStore::with_default_ttl();
            let mut original = state("s-1");
            original.push_message(crate::message::Message::user("hi"));
            store.save_state("s-1", &original).await.unwrap();

            let loaded = store.load_state("s-1").await.unwrap().unwrap();
            assert_eq!(loaded, original);
        }

        #[tokio::test]
        async fn load_missing_returns_none() {
            let store = MemorySessionStore::with_default_ttl();
            assert!(store.load_state("nope").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn expired_state_reads_as_missing() {
            let store = MemorySessionStore::new(Duration::from_secs(0));
            store.save_state("s-1", &state("s-1")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(store.load_state("s-1").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn save_replaces_rather_than_merges() {
            let store = MemorySessionStore::with_default_ttl();
            let mut first = state("s-1");
            first.push_message(crate::message::Message::user("one"));
            store.save_state("s-1", &first).await.unwrap();

            let second = state("s-1");
            store.save_state("s-1", &second).await.unwrap();

            let loaded = store.load_state("s-1").await.unwrap().unwrap();
            assert!(loaded.messages.is_empty());
        }
    }

    mod step_commits {
        use super::*;

        #[tokio::test]
        async fn commit_updates_state_history_and_metadata() {
            let store = MemorySessionStore::with_default_ttl();
            store
                .create_metadata("s-1", MetadataInit::default())
                .await
                .unwrap();
            store.save_state("s-1", &state("s-1")).await.unwrap();

            let mut c = commit("s-1", 0);
            c.state.cost.add(0.05);
            store.save_step_result("s-1", &c).await.unwrap();

            let loaded = store.load_state("s-1").await.unwrap().unwrap();
            assert_eq!(loaded.step_count, 1);

            let history = store.get_history("s-1", 10).await.unwrap();
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].step_index, 0);

            let meta = store.get_metadata("s-1").await.unwrap().unwrap();
            assert_eq!(meta.total_steps, 1);
            assert!((meta.total_cost - 0.05).abs() < f64::EPSILON);
            assert_eq!(meta.status, SessionStatus::Running);
        }

        #[tokio::test]
        async fn replayed_commit_is_idempotent() {
            let store = MemorySessionStore::with_default_ttl();
            store.save_state("s-1", &state("s-1")).await.unwrap();

            let first = commit("s-1", 0);
            store.save_step_result("s-1", &first).await.unwrap();
            let second = commit("s-1", 1);
            store.save_step_result("s-1", &second).await.unwrap();

            // Redeliver step 0: state and history must be unchanged.
            store.save_step_result("s-1", &first).await.unwrap();

            let loaded = store.load_state("s-1").await.unwrap().unwrap();
            assert_eq!(loaded.step_count, 2);
            let history = store.get_history("s-1", 10).await.unwrap();
            assert_eq!(history.len(), 2);
            assert_eq!(history[0].step_index, 1);
        }

        #[tokio::test]
        async fn same_index_never_duplicates_history() {
            let store = MemorySessionStore::with_default_ttl();
            store.save_state("s-1", &state("s-1")).await.unwrap();
            let c = commit("s-1", 0);
            store.save_step_result("s-1", &c).await.unwrap();
            store.save_step_result("s-1", &c).await.unwrap();

            let history = store.get_history("s-1", 10).await.unwrap();
            assert_eq!(history.len(), 1);
        }

        #[tokio::test]
        async fn history_is_bounded_and_newest_first() {
            let store = MemorySessionStore::with_default_ttl();
            store.save_state("s-1", &state("s-1")).await.unwrap();
            for index in 0..(STEP_HISTORY_LIMIT as u64 + 20) {
                store
                    .save_step_result("s-1", &commit("s-1", index))
                    .await
                    .unwrap();
            }

            let history = store.get_history("s-1", usize::MAX).await.unwrap();
            assert_eq!(history.len(), STEP_HISTORY_LIMIT);
            assert_eq!(history[0].step_index, STEP_HISTORY_LIMIT as u64 + 19);
            assert!(history.windows(2).all(|w| w[0].step_index > w[1].step_index));
        }

        #[tokio::test]
        async fn get_history_honors_limit() {
            let store = MemorySessionStore::with_default_ttl();
            store.save_state("s-1", &state("s-1")).await.unwrap();
            for index in 0..5 {
                store
                    .save_step_result("s-1", &commit("s-1", index))
                    .await
                    .unwrap();
            }
            let history = store.get_history("s-1", 2).await.unwrap();
            assert_eq!(history.len(), 2);
            assert_eq!(history[0].step_index, 4);
        }
    }

    mod metadata {
        use super::*;

        #[tokio::test]
        async fn create_initializes_idle_with_zero_counters() {
            let store = MemorySessionStore::with_default_ttl();
            let meta = store
                .create_metadata(
                    "s-1",
                    MetadataInit {
                        user_id: Some("u-1".into()),
                        model_config: serde_json::json!({"model": "gpt-4.1"}),
                        agent_config: serde_json::Value::Null,
                    },
                )
                .await
                .unwrap();
            assert_eq!(meta.status, SessionStatus::Idle);
            assert_eq!(meta.total_steps, 0);
            assert_eq!(meta.user_id.as_deref(), Some("u-1"));
        }

        #[tokio::test]
        async fn list_active_sorts_by_recency() {
            let store = MemorySessionStore::with_default_ttl();
            store
                .create_metadata("old", MetadataInit::default())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            store
                .create_metadata("new", MetadataInit::default())
                .await
                .unwrap();

            let listed = store.list_active().await.unwrap();
            assert_eq!(listed.len(), 2);
            assert_eq!(listed[0].session_id, "new");
        }
    }

    mod deletion_and_expiry {
        use super::*;

        #[tokio::test]
        async fn delete_removes_all_keyspaces() {
            let store = MemorySessionStore::with_default_ttl();
            store
                .create_metadata("s-1", MetadataInit::default())
                .await
                .unwrap();
            store.save_state("s-1", &state("s-1")).await.unwrap();
            store
                .save_step_result("s-1", &commit("s-1", 0))
                .await
                .unwrap();

            store.delete_session("s-1").await.unwrap();

            assert!(store.load_state("s-1").await.unwrap().is_none());
            assert!(store.get_metadata("s-1").await.unwrap().is_none());
            assert!(store.get_history("s-1", 10).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn delete_missing_session_is_a_noop() {
            let store = MemorySessionStore::with_default_ttl();
            store.delete_session("ghost").await.unwrap();
        }

        #[tokio::test]
        async fn cleanup_removes_only_stale_sessions() {
            let store = MemorySessionStore::new(Duration::from_millis(10));
            store
                .create_metadata("stale", MetadataInit::default())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(25)).await;
            store
                .create_metadata("fresh", MetadataInit::default())
                .await
                .unwrap();

            let removed = store.cleanup_expired().await.unwrap();
            assert_eq!(removed, 1);
            assert!(store.get_metadata("fresh").await.unwrap().is_some());
        }
    }
}
