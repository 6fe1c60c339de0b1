//! Session event types.
//!
//! Events are immutable records appended to a per-session log. Ids are
//! assigned by the stream at publish time and are strictly monotonic
//! within a session; they use the `"<millis>-<seq>"` form so the Redis
//! stream backend can expose its native ids unchanged.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// The kind of an event on a session's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// First frame delivered to a new subscriber.
    Connected,
    /// Keep-alive frame emitted to live subscriptions.
    Heartbeat,
    /// A step began executing.
    StepStart,
    /// A step finished executing.
    StepComplete,
    /// A model stream opened.
    StreamStart,
    /// A partial model output chunk.
    StreamChunk,
    /// A model stream finished.
    StreamEnd,
    /// A tool invocation began.
    ToolStart,
    /// A tool invocation finished.
    ToolComplete,
    /// The session is waiting for a human approval decision.
    HumanApprovalRequest,
    /// A recoverable or fatal error was surfaced.
    Error,
    /// The session reached a terminal result.
    Done,
}

impl EventType {
    /// Get the string representation of the event type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Heartbeat => "heartbeat",
            Self::StepStart => "step_start",
            Self::StepComplete => "step_complete",
            Self::StreamStart => "stream_start",
            Self::StreamChunk => "stream_chunk",
            Self::StreamEnd => "stream_end",
            Self::ToolStart => "tool_start",
            Self::ToolComplete => "tool_complete",
            Self::HumanApprovalRequest => "human_approval_request",
            Self::Error => "error",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream-assigned event id, ordered by `(ms, seq)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventId {
    /// Millisecond timestamp component.
    pub ms: i64,
    /// Sequence number within the millisecond.
    pub seq: u64,
}

impl EventId {
    /// The id before every real event; subscribing from here replays all.
    pub const ZERO: Self = Self { ms: 0, seq: 0 };

    /// Create an id from its components.
    #[must_use]
    pub const fn new(ms: i64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EventId {
    type Err = std::num::ParseIntError;

    /// Parse `"<ms>-<seq>"`; a bare `"<ms>"` parses with `seq = 0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((ms, seq)) => Ok(Self {
                ms: ms.parse()?,
                seq: seq.parse()?,
            }),
            None => Ok(Self {
                ms: s.parse()?,
                seq: 0,
            }),
        }
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An immutable, timestamped record on a session's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stream-assigned id, monotonic within the session.
    pub id: EventId,
    /// The event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Index of the step that produced the event.
    pub step_index: u64,
    /// The owning session.
    pub session_id: String,
    /// Publish time in milliseconds since the epoch.
    pub timestamp: i64,
    /// Type-specific payload.
    pub data: Value,
}

/// The caller-supplied part of an event; the stream assigns the rest.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// The event kind.
    pub event_type: EventType,
    /// Index of the step producing the event.
    pub step_index: u64,
    /// Type-specific payload.
    pub data: Value,
}

impl NewEvent {
    /// Create a new event payload.
    #[must_use]
    pub const fn new(event_type: EventType, step_index: u64, data: Value) -> Self {
        Self {
            event_type,
            step_index,
            data,
        }
    }
}
