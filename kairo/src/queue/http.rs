//! Delayed HTTP dispatch queue.
//!
//! Hands tasks to a third-party delayed-dispatch provider which POSTs
//! the serialized [`StepTask`] back to this service's step-execution
//! callback after the requested delay. The provider owns delivery
//! retries (up to the attempt limit on non-2xx responses); this client
//! only publishes.
//!
//! Wire contract: `POST {endpoint}` with a bearer token, the callback
//! URL and delay in headers, and the task JSON as the body. The provider
//! answers `{"taskId": "..."}`; cancellation is `DELETE {endpoint}/{id}`
//! and is best-effort.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{QueueHealth, QueueStats, StepTask, TaskId, WorkQueue};
use crate::error::{Error, Result};

/// Client for a third-party delayed HTTP dispatcher.
pub struct HttpDispatchQueue {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    callback_url: String,
    scheduled: AtomicU64,
    cancelled: AtomicU64,
}

impl std::fmt::Debug for HttpDispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDispatchQueue")
            .field("endpoint", &self.endpoint)
            .field("callback_url", &self.callback_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    task_id: Option<String>,
}

impl HttpDispatchQueue {
    /// Create a client for the given provider endpoint.
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            token: token.into(),
            callback_url: callback_url.into(),
            scheduled: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl WorkQueue for HttpDispatchQueue {
    async fn schedule_next_step(&self, task: StepTask, delay: Duration) -> Result<TaskId> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .header("X-Callback-Url", &self.callback_url)
            .header("X-Delay-Ms", delay.as_millis().to_string())
            .json(&task)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::queue(format!(
                "dispatch provider answered {} for session {}",
                response.status(),
                task.session_id
            )));
        }

        let body: PublishResponse = response.json().await.unwrap_or(PublishResponse {
            task_id: None,
        });
        let task_id = TaskId(
            body.task_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        );

        debug!(
            session_id = %task.session_id,
            step_index = task.step_index,
            task_id = %task_id,
            delay_ms = delay.as_millis() as u64,
            "step handed to dispatch provider"
        );
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        Ok(task_id)
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<bool> {
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), task_id);
        match self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) => {
                // Cancellation is best-effort; dispatched tasks cannot be
                // recalled anyway.
                warn!(task_id = %task_id, error = %e, "cancel request failed");
                Ok(false)
            }
        }
    }

    async fn stats(&self) -> QueueStats {
        QueueStats {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            // Delivery outcomes live with the provider.
            ..QueueStats::default()
        }
    }

    async fn health(&self) -> QueueHealth {
        let reachable = self
            .client
            .get(&self.endpoint)
            .bearer_auth(&self.token)
            .send()
            .await
            .is_ok();
        QueueHealth {
            healthy: reachable,
            provider: "http-dispatch".to_string(),
            detail: (!reachable).then(|| format!("endpoint {} unreachable", self.endpoint)),
        }
    }
}
