//! Redis state store.
//!
//! Key layout per session: `state:{id}` holds the serialized
//! [`SessionState`] blob, `steps:{id}` is a list of step records (newest
//! first, `LTRIM`med to the history limit), and `meta:{id}` is a hash of
//! metadata fields. Every write refreshes the TTL on all three keys;
//! [`SessionStore::save_step_result`] issues one pipeline so the commit
//! is a single round trip.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use tracing::debug;

use super::{MetadataInit, SessionStore, StepCommit, STEP_HISTORY_LIMIT};
use crate::error::{Error, Result};
use crate::session::{SessionMetadata, SessionState, SessionStatus, StepRecord};

/// Redis-backed session store.
pub struct RedisSessionStore {
    pool: Pool,
    ttl_secs: i64,
}

impl std::fmt::Debug for RedisSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSessionStore")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl RedisSessionStore {
    /// Create a store from a connection URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] when the pool cannot be built.
    pub fn new(url: &str, pool_max: usize, ttl_secs: u64) -> Result<Self> {
        let mut cfg = Config::from_url(url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(pool_max));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::store(e.to_string()))?;
        Ok(Self {
            pool,
            ttl_secs: ttl_secs as i64,
        })
    }

    fn state_key(id: &str) -> String {
        format!("state:{id}")
    }

    fn steps_key(id: &str) -> String {
        format!("steps:{id}")
    }

    fn meta_key(id: &str) -> String {
        format!("meta:{id}")
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::store(e.to_string()))
    }

    /// Add the denormalized metadata fields and TTL refreshes to a pipeline.
    fn pipe_denormalize(pipe: &mut redis::Pipeline, id: &str, state: &SessionState, ttl: i64) {
        let meta_key = Self::meta_key(id);
        pipe.hset(&meta_key, "status", state.status.as_str());
        pipe.hset(&meta_key, "total_cost", state.cost.total);
        pipe.hset(&meta_key, "total_steps", state.step_count);
        pipe.hset(&meta_key, "last_active_at", Utc::now().to_rfc3339());
        pipe.expire(Self::state_key(id), ttl);
        pipe.expire(Self::steps_key(id), ttl);
        pipe.expire(meta_key, ttl);
    }

    fn parse_metadata(id: &str, fields: Vec<(String, String)>) -> Result<SessionMetadata> {
        let mut meta = SessionMetadata {
            session_id: id.to_string(),
            user_id: None,
            created_at: Utc::now(),
            last_active_at: Utc::now(),
            status: SessionStatus::Idle,
            total_cost: 0.0,
            total_steps: 0,
            model_config: serde_json::Value::Null,
            agent_config: serde_json::Value::Null,
        };
        for (field, value) in fields {
            match field.as_str() {
                "user_id" => meta.user_id = Some(value),
                "created_at" => meta.created_at = parse_rfc3339(&value)?,
                "last_active_at" => meta.last_active_at = parse_rfc3339(&value)?,
                "status" => {
                    meta.status = serde_json::from_value(serde_json::Value::String(value))?;
                }
                "total_cost" => {
                    meta.total_cost = value.parse().map_err(|_| {
                        Error::store(format!("malformed total_cost in meta:{id}"))
                    })?;
                }
                "total_steps" => {
                    meta.total_steps = value.parse().map_err(|_| {
                        Error::store(format!("malformed total_steps in meta:{id}"))
                    })?;
                }
                "model_config" => meta.model_config = serde_json::from_str(&value)?,
                "agent_config" => meta.agent_config = serde_json::from_str(&value)?,
                _ => {}
            }
        }
        Ok(meta)
    }

    async fn scan_meta_keys(&self, conn: &mut deadpool_redis::Connection) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("meta:*")
                .arg("COUNT")
                .arg(100)
                .query_async(conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::store(e.to_string()))
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn save_state(&self, id: &str, state: &SessionState) -> Result<()> {
        let blob = serde_json::to_string(state)?;
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.set(Self::state_key(id), blob);
        Self::pipe_denormalize(&mut pipe, id, state, self.ttl_secs);
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn load_state(&self, id: &str) -> Result<Option<SessionState>> {
        let mut conn = self.connection().await?;
        let blob: Option<String> = conn.get(Self::state_key(id)).await?;
        blob.map(|raw| serde_json::from_str(&raw).map_err(Error::from))
            .transpose()
    }

    async fn save_step_result(&self, id: &str, commit: &StepCommit) -> Result<()> {
        let existing = self.load_state(id).await?;
        let mut conn = self.connection().await?;

        if super::is_stale_commit(existing.as_ref(), commit) {
            debug!(
                session_id = %id,
                step_index = commit.record.step_index,
                "stale step commit, refreshing ttl only"
            );
            let mut pipe = redis::pipe();
            pipe.expire(Self::state_key(id), self.ttl_secs);
            pipe.expire(Self::steps_key(id), self.ttl_secs);
            pipe.expire(Self::meta_key(id), self.ttl_secs);
            pipe.query_async::<()>(&mut conn).await?;
            return Ok(());
        }

        let state_blob = serde_json::to_string(&commit.state)?;
        let record_blob = serde_json::to_string(&commit.record)?;

        let mut pipe = redis::pipe();
        pipe.set(Self::state_key(id), state_blob);
        pipe.lpush(Self::steps_key(id), record_blob);
        pipe.ltrim(Self::steps_key(id), 0, STEP_HISTORY_LIMIT as isize - 1);
        Self::pipe_denormalize(&mut pipe, id, &commit.state, self.ttl_secs);
        pipe.query_async::<()>(&mut conn).await?;
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

        let key = Self::meta_key(id);
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        if let Some(ref user_id) = meta.user_id {
            pipe.hset(&key, "user_id", user_id);
        }
        pipe.hset(&key, "created_at", now.to_rfc3339());
        pipe.hset(&key, "last_active_at", now.to_rfc3339());
        pipe.hset(&key, "status", meta.status.as_str());
        pipe.hset(&key, "total_cost", 0.0);
        pipe.hset(&key, "total_steps", 0u64);
        pipe.hset(&key, "model_config", serde_json::to_string(&meta.model_config)?);
        pipe.hset(&key, "agent_config", serde_json::to_string(&meta.agent_config)?);
        pipe.expire(&key, self.ttl_secs);
        pipe.query_async::<()>(&mut conn).await?;
        Ok(meta)
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<SessionMetadata>> {
        let mut conn = self.connection().await?;
        let fields: Vec<(String, String)> = conn.hgetall(Self::meta_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Self::parse_metadata(id, fields).map(Some)
    }

    async fn list_active(&self) -> Result<Vec<SessionMetadata>> {
        let mut conn = self.connection().await?;
        let keys = self.scan_meta_keys(&mut conn).await?;

        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            let id = key.trim_start_matches("meta:").to_string();
            let fields: Vec<(String, String)> = conn.hgetall(&key).await?;
            if !fields.is_empty() {
                sessions.push(Self::parse_metadata(&id, fields)?);
            }
        }
        sessions.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(sessions)
    }

    async fn get_history(&self, id: &str, limit: usize) -> Result<Vec<StepRecord>> {
        let mut conn = self.connection().await?;
        let raw: Vec<String> = conn
            .lrange(Self::steps_key(id), 0, limit as isize - 1)
            .await?;
        raw.iter()
            .map(|blob| serde_json::from_str(blob).map_err(Error::from))
            .collect()
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .del(&[Self::state_key(id), Self::steps_key(id), Self::meta_key(id)])
            .await?;
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let mut conn = self.connection().await?;
        let keys = self.scan_meta_keys(&mut conn).await?;
        let cutoff = Utc::now() - chrono::Duration::seconds(self.ttl_secs);

        let mut removed = 0;
        for key in keys {
            let last_active: Option<String> = conn.hget(&key, "last_active_at").await?;
            let Some(last_active) = last_active else {
                continue;
            };
            if parse_rfc3339(&last_active)? < cutoff {
                let id = key.trim_start_matches("meta:").to_string();
                self.delete_session(&id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
