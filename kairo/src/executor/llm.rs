//! The `call_llm` executor and the model adapter contract.
//!
//! The adapter is the abstraction boundary to concrete providers: it
//! turns one request into a stream of [`ModelChunk`]s. This executor
//! consumes that stream, accumulating content while re-publishing each
//! delta as a `stream_chunk` event so subscribers render output in real
//! time. When the producer ends, the accumulated result becomes an
//! assistant message, usage and cost land on the state, and the next
//! context carries the `llm_result` phase.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt as _};
use serde_json::{json, Value};
use tracing::{debug, error};

use super::{EventSink, ExecutorDeps, ExecutorOutput};
use crate::context::{PhaseData, SessionSnapshot, StepContext};
use crate::error::{Error, Result};
use crate::event::EventType;
use crate::message::{Message, ToolCall};
use crate::session::{SessionState, SessionStatus};
use crate::usage::Usage;

/// A request to the configured model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    /// Conversation to complete.
    pub messages: Vec<Message>,
    /// Model identifier.
    pub model: String,
    /// Provider identifier.
    pub provider: String,
    /// Sampling temperature, when set on the session.
    pub temperature: Option<f64>,
}

/// One unit of streaming model output.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    /// Text content delta.
    Text(String),
    /// Reasoning content delta.
    Reasoning(String),
    /// A produced image reference.
    Image(String),
    /// Start of a tool call.
    ToolUseStart {
        /// Index of this call in the response.
        index: usize,
        /// Unique call id.
        id: String,
        /// Function name.
        name: String,
    },
    /// Partial arguments for an in-progress tool call.
    ToolUseDelta {
        /// Index of the call being updated.
        index: usize,
        /// Partial JSON arguments.
        partial_json: String,
    },
    /// Token usage and cost for the call, usually last.
    Usage {
        /// Token counts.
        usage: Usage,
        /// Monetary cost of the call, when the adapter prices it.
        cost: Option<f64>,
    },
    /// The producer finished.
    Done,
}

/// The streaming chunk producer an adapter returns.
pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk>> + Send>>;

/// Abstraction over concrete LLM providers.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Start a streaming completion.
    async fn stream_chat(&self, request: &ModelRequest) -> Result<ModelStream>;

    /// Adapter name, for logs and diagnostics.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates streamed chunks into the final content and tool calls.
#[derive(Debug, Clone, Default)]
pub struct ChunkAggregator {
    text: String,
    reasoning: String,
    images: Vec<String>,
    tool_calls: BTreeMap<usize, ToolCallBuilder>,
    usage: Usage,
    cost: f64,
}

impl ChunkAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the accumulation.
    pub fn apply(&mut self, chunk: &ModelChunk) {
        match chunk {
            ModelChunk::Text(delta) => self.text.push_str(delta),
            ModelChunk::Reasoning(delta) => self.reasoning.push_str(delta),
            ModelChunk::Image(reference) => self.images.push(reference.clone()),
            ModelChunk::ToolUseStart { index, id, name } => {
                self.tool_calls.insert(
                    *index,
                    ToolCallBuilder {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: String::new(),
                    },
                );
            }
            ModelChunk::ToolUseDelta {
                index,
                partial_json,
            } => {
                if let Some(builder) = self.tool_calls.get_mut(index) {
                    builder.arguments.push_str(partial_json);
                }
            }
            ModelChunk::Usage { usage, cost } => {
                self.usage += *usage;
                if let Some(cost) = cost {
                    self.cost += cost;
                }
            }
            ModelChunk::Done => {}
        }
    }

    /// The accumulated text so far.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The accumulated reasoning so far.
    #[must_use]
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Whether any tool call has started.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// The tool calls assembled so far, in index order.
    #[must_use]
    pub fn build_tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls
            .values()
            .map(|builder| ToolCall::function(&builder.id, &builder.name, &builder.arguments))
            .collect()
    }
}

fn chunk_event_data(chunk: &ModelChunk, aggregator: &ChunkAggregator) -> Option<Value> {
    match chunk {
        ModelChunk::Text(delta) => Some(json!({
            "chunk_type": "text",
            "content": delta,
            "full_content": aggregator.text(),
        })),
        ModelChunk::Reasoning(delta) => Some(json!({
            "chunk_type": "reasoning",
            "content": delta,
            "full_content": aggregator.reasoning(),
        })),
        ModelChunk::Image(reference) => Some(json!({
            "chunk_type": "image",
            "content": reference,
            "full_content": aggregator.text(),
        })),
        ModelChunk::ToolUseStart { .. } | ModelChunk::ToolUseDelta { .. } => Some(json!({
            "chunk_type": "tool_calls",
            "content": "",
            "full_content": aggregator.text(),
            "tool_calls": aggregator.build_tool_calls(),
        })),
        ModelChunk::Usage { .. } | ModelChunk::Done => None,
    }
}

pub(super) async fn execute(
    mut state: SessionState,
    deps: &ExecutorDeps,
    sink: &mut EventSink,
) -> Result<ExecutorOutput> {
    let request = ModelRequest {
        messages: state.messages.clone(),
        model: state.model_config.model.clone(),
        provider: state.model_config.provider.clone(),
        temperature: state.model_config.temperature,
    };

    sink.emit(
        EventType::StreamStart,
        json!({
            "model": request.model,
            "provider": request.provider,
        }),
    )
    .await?;

    let mut producer = match deps.model.stream_chat(&request).await {
        Ok(producer) => producer,
        Err(e) => {
            return fault(sink, e).await;
        }
    };

    let mut aggregator = ChunkAggregator::new();
    while let Some(item) = producer.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                return fault(sink, e).await;
            }
        };

        aggregator.apply(&chunk);
        if let Some(data) = chunk_event_data(&chunk, &aggregator) {
            sink.emit(EventType::StreamChunk, data).await?;
        }
    }

    let tool_calls = aggregator.build_tool_calls();
    let final_content = aggregator.text().to_string();

    sink.emit(
        EventType::StreamEnd,
        json!({
            "final_content": &final_content,
            "tool_calls": &tool_calls,
            "reasoning": aggregator.reasoning(),
            "grounding": Value::Null,
            "image_list": &aggregator.images,
        }),
    )
    .await?;

    debug!(
        session_id = %state.session_id,
        model = %request.model,
        content_len = final_content.len(),
        tool_calls = tool_calls.len(),
        "model stream finished"
    );

    let message = if tool_calls.is_empty() {
        Message::assistant(final_content.clone())
    } else {
        let content = (!final_content.is_empty()).then(|| final_content.clone());
        Message::assistant_with_tool_calls(content, tool_calls.clone())
    };
    state.push_message(message);
    state.usage += aggregator.usage;
    state.cost.add(aggregator.cost);
    state.status = SessionStatus::Running;

    let result = (!final_content.is_empty()).then_some(final_content);
    let payload = PhaseData::llm_result(result, tool_calls);
    let snapshot = SessionSnapshot::of(&state, sink.count());
    Ok(ExecutorOutput::next(
        state,
        StepContext::new(payload, snapshot),
    ))
}

async fn fault(sink: &mut EventSink, e: Error) -> Result<ExecutorOutput> {
    error!(error = %e, "model stream failed");
    sink.emit(
        EventType::Error,
        json!({
            "phase": "llm_stream",
            "error": e.to_string(),
        }),
    )
    .await?;
    Err(Error::executor("call_llm", e.to_string()))
}
