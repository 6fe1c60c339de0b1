//! Server-sent-events framing for session subscriptions.
//!
//! The transport layer owns the socket; this module owns the bytes.
//! [`sse_frames`] combines a history replay with a live subscription and
//! yields ready-to-write `data: {json}\n\n` frames: a `connected` frame
//! first, then (optionally) the filtered history tail in chronological
//! order, then live events, with a `heartbeat` frame on every idle
//! interval so intermediaries keep the connection open.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt as _};
use serde::Serialize;
use tracing::debug;

use super::{CancelSignal, EventStream};
use crate::event::{Event, EventId};

/// Response headers the transport must set on an SSE response.
pub const RESPONSE_HEADERS: [(&str, &str); 7] = [
    ("Content-Type", "text/event-stream"),
    ("Cache-Control", "no-cache, no-transform"),
    ("Connection", "keep-alive"),
    ("X-Accel-Buffering", "no"),
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET"),
    ("Access-Control-Allow-Headers", "Cache-Control, Last-Event-ID"),
];

/// Subscription parameters, as carried by the query string.
#[derive(Debug, Clone)]
pub struct SseRequest {
    /// The session to watch.
    pub session_id: String,
    /// The subscriber's last seen event id; `"0"` replays everything.
    pub last_event_id: String,
    /// Whether to deliver the recent history tail before the live feed.
    pub include_history: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedFrame<'a> {
    last_event_id: &'a str,
    session_id: &'a str,
    timestamp: i64,
    #[serde(rename = "type")]
    frame_type: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatFrame<'a> {
    session_id: &'a str,
    timestamp: i64,
    #[serde(rename = "type")]
    frame_type: &'a str,
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'a str,
    data: ErrorFrameData<'a>,
}

#[derive(Serialize)]
struct ErrorFrameData<'a> {
    phase: &'a str,
    error: String,
}

/// Wrap compact JSON in SSE framing.
fn frame(json: &str) -> String {
    format!("data: {json}\n\n")
}

fn serialize_frame<T: Serialize>(value: &T) -> String {
    // Frame structs serialize infallibly; fall back to an empty object
    // rather than poisoning the stream.
    frame(&serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()))
}

/// The first frame delivered after connect.
#[must_use]
pub fn connected_frame(session_id: &str, last_event_id: &str) -> String {
    serialize_frame(&ConnectedFrame {
        last_event_id,
        session_id,
        timestamp: Utc::now().timestamp_millis(),
        frame_type: "connected",
    })
}

/// The keep-alive frame emitted on idle intervals.
#[must_use]
pub fn heartbeat_frame(session_id: &str) -> String {
    serialize_frame(&HeartbeatFrame {
        session_id,
        timestamp: Utc::now().timestamp_millis(),
        frame_type: "heartbeat",
    })
}

/// The terminal frame emitted when the subscription itself fails.
#[must_use]
pub fn subscription_error_frame(error: &crate::error::Error) -> String {
    serialize_frame(&ErrorFrame {
        frame_type: "error",
        data: ErrorFrameData {
            phase: "stream_subscription",
            error: error.to_string(),
        },
    })
}

/// Frame a published event.
#[must_use]
pub fn event_frame(event: &Event) -> String {
    serialize_frame(event)
}

/// Produce the full frame sequence for one subscriber.
///
/// History events are filtered to those whose timestamp compares
/// strictly greater than the numeric value of `last_event_id` (an
/// unparseable id replays everything), and the live feed resumes
/// strictly after the newest id already delivered, so no event repeats
/// across the history/live boundary.
pub fn sse_frames(
    events: Arc<dyn EventStream>,
    request: SseRequest,
    history_slice: usize,
    heartbeat: Duration,
    cancel: CancelSignal,
) -> impl Stream<Item = String> + Send {
    async_stream::stream! {
        let SseRequest {
            session_id,
            last_event_id,
            include_history,
        } = request;
        let mut cancel = cancel;

        yield connected_frame(&session_id, &last_event_id);

        let threshold_ms: i64 = last_event_id.parse().unwrap_or(0);
        let mut resume = last_event_id.parse().unwrap_or(EventId::ZERO);

        if include_history {
            match events.history(&session_id, history_slice).await {
                Ok(tail) => {
                    // Reverse-chronological slice, replayed oldest first.
                    for event in tail.into_iter().rev() {
                        if event.timestamp > threshold_ms {
                            if event.id > resume {
                                resume = event.id;
                            }
                            yield event_frame(&event);
                        }
                    }
                }
                Err(e) => {
                    yield subscription_error_frame(&e);
                    return;
                }
            }
        }

        let mut live = match events
            .subscribe(&session_id, resume, cancel.clone())
            .await
        {
            Ok(live) => live,
            Err(e) => {
                yield subscription_error_frame(&e);
                return;
            }
        };

        let start = tokio::time::Instant::now() + heartbeat;
        let mut ticker = tokio::time::interval_at(start, heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(session_id = %session_id, "sse subscriber disconnected");
                    return;
                }
                _ = ticker.tick() => {
                    yield heartbeat_frame(&session_id);
                }
                batch = live.next() => match batch {
                    Some(Ok(batch)) => {
                        for event in batch {
                            yield event_frame(&event);
                        }
                    }
                    Some(Err(e)) => {
                        yield subscription_error_frame(&e);
                        return;
                    }
                    None => return,
                },
            }
        }
    }
}
