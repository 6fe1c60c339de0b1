//! End-to-end runtime scenarios over in-memory backends.
//!
//! Each test assembles a full runtime (memory store, memory event
//! stream, in-process timer queue) with a scripted model adapter and a
//! recording tool host, then drives sessions through the coordinator
//! exactly as the HTTP surface would.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use serde_json::{json, Value};

use kairo::config::RuntimeConfig;
use kairo::coordinator::{
    CreateSessionRequest, InterventionAction, InterventionRequest, StatusRequest,
};
use kairo::engine::StepDisposition;
use kairo::error::{Error, Result};
use kairo::event::EventType;
use kairo::executor::{ModelAdapter, ModelChunk, ModelRequest, ModelStream, ToolHost, ToolInvocation};
use kairo::instruction::{ApprovalPolicy, DefaultRunner};
use kairo::message::Role;
use kairo::queue::{StepTask, WorkQueue as _};
use kairo::runtime::AgentRuntime;
use kairo::session::{AgentConfig, ModelConfig, PendingKind, SessionState, SessionStatus};
use kairo::store::{MemorySessionStore, SessionStore as _};
use kairo::stream::sse::SseRequest;
use kairo::stream::{cancel_pair, EventStream as _, MemoryEventStream};
use kairo::usage::{CostLimit, OnExceeded, Usage};

/// Model adapter that replays one scripted chunk list per call.
struct ScriptedModel {
    turns: Mutex<VecDeque<Vec<ModelChunk>>>,
}

impl ScriptedModel {
    fn new(turns: Vec<Vec<ModelChunk>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
        }
    }
}

#[async_trait]
impl ModelAdapter for ScriptedModel {
    async fn stream_chat(&self, _request: &ModelRequest) -> Result<ModelStream> {
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::executor("call_llm", "model script exhausted"))?;
        Ok(Box::pin(futures::stream::iter(turn.into_iter().map(Ok))))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Tool host that records invocations and returns a fixed result.
struct RecordingToolHost {
    invocations: Mutex<Vec<ToolInvocation>>,
    result: Value,
}

impl RecordingToolHost {
    fn new(result: Value) -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            result,
        }
    }

    fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolHost for RecordingToolHost {
    async fn invoke(&self, invocation: &ToolInvocation) -> Result<Value> {
        self.invocations.lock().unwrap().push(invocation.clone());
        Ok(self.result.clone())
    }
}

fn runtime_with(
    turns: Vec<Vec<ModelChunk>>,
    tool_result: Value,
) -> (AgentRuntime, Arc<RecordingToolHost>) {
    let tools = Arc::new(RecordingToolHost::new(tool_result));
    let runtime = AgentRuntime::assemble(
        RuntimeConfig::default(),
        Arc::new(MemorySessionStore::with_default_ttl()),
        Arc::new(MemoryEventStream::with_defaults()),
        Arc::new(ScriptedModel::new(turns)),
        Arc::clone(&tools) as Arc<dyn ToolHost>,
        Arc::new(DefaultRunner),
    )
    .unwrap();
    (runtime, tools)
}

fn create_request(messages: Vec<kairo::message::Message>) -> CreateSessionRequest {
    serde_json::from_value::<CreateSessionRequest>(json!({
        "messages": messages,
        "modelConfig": { "model": "gpt-4.1", "provider": "openai" },
    }))
    .unwrap()
}

async fn wait_for<F>(runtime: &AgentRuntime, session_id: &str, predicate: F) -> SessionState
where
    F: Fn(&SessionState) -> bool,
{
    for _ in 0..3_000 {
        if let Some(state) = runtime.store().load_state(session_id).await.unwrap() {
            if predicate(&state) {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {session_id} never reached the expected state");
}

async fn event_types(runtime: &AgentRuntime, session_id: &str) -> Vec<EventType> {
    let mut history = runtime.events().history(session_id, 1_000).await.unwrap();
    history.reverse();
    history.into_iter().map(|event| event.event_type).collect()
}

fn tool_call_turn() -> Vec<ModelChunk> {
    vec![
        ModelChunk::ToolUseStart {
            index: 0,
            id: "t1".into(),
            name: "calc".into(),
        },
        ModelChunk::ToolUseDelta {
            index: 0,
            partial_json: r#"{"x":2}"#.into(),
        },
    ]
}

mod s1_happy_path {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn streams_then_finishes() {
        let (runtime, _tools) = runtime_with(
            vec![vec![
                ModelChunk::Text("hel".into()),
                ModelChunk::Text("lo".into()),
                ModelChunk::Usage {
                    usage: Usage::new(3, 2),
                    cost: None,
                },
            ]],
            json!({}),
        );

        let created = runtime
            .coordinator()
            .create_session(create_request(vec![kairo::message::Message::user("hi")]))
            .await
            .unwrap();
        assert!(created.auto_started);

        let state = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::Done
        })
        .await;

        assert_eq!(state.step_count, 2);
        let last = state.messages.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.text(), Some("hello"));
        assert_eq!(state.usage.total_tokens, 5);

        assert_eq!(
            event_types(&runtime, &created.session_id).await,
            vec![
                EventType::StepStart,
                EventType::StreamStart,
                EventType::StreamChunk,
                EventType::StreamChunk,
                EventType::StreamEnd,
                EventType::StepComplete,
                EventType::StepStart,
                EventType::StepComplete,
                EventType::Done,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn creation_queues_exactly_one_step_zero() {
        let (runtime, _tools) = runtime_with(
            vec![vec![ModelChunk::Text("hello".into())]],
            json!({}),
        );

        let created = runtime
            .coordinator()
            .create_session(create_request(vec![kairo::message::Message::user("hi")]))
            .await
            .unwrap();

        let stats = runtime.queue().stats().await;
        assert_eq!(stats.scheduled, 1);
        let state = runtime
            .store()
            .load_state(&created.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, SessionStatus::Idle);
        assert_eq!(state.step_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_event_step_index_is_within_step_count() {
        let (runtime, _tools) = runtime_with(
            vec![vec![ModelChunk::Text("hello".into())]],
            json!({}),
        );

        let created = runtime
            .coordinator()
            .create_session(create_request(vec![kairo::message::Message::user("hi")]))
            .await
            .unwrap();
        let state = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::Done
        })
        .await;

        let history = runtime
            .events()
            .history(&created.session_id, 1_000)
            .await
            .unwrap();
        assert!(!history.is_empty());
        for event in history {
            assert!(event.step_index <= state.step_count);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_step_is_acknowledged_without_effect() {
        let (runtime, _tools) = runtime_with(
            vec![vec![ModelChunk::Text("hello".into())]],
            json!({}),
        );

        let created = runtime
            .coordinator()
            .create_session(create_request(vec![kairo::message::Message::user("hi")]))
            .await
            .unwrap();
        let done = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::Done
        })
        .await;

        let events_before = event_types(&runtime, &created.session_id).await.len();
        let summary = runtime
            .engine()
            .execute_step(StepTask::new(&created.session_id, 0))
            .await
            .unwrap();

        assert_eq!(summary.disposition, StepDisposition::Stale);
        let state_after = runtime
            .store()
            .load_state(&created.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state_after, done);
        assert_eq!(
            event_types(&runtime, &created.session_id).await.len(),
            events_before
        );
    }
}

mod s2_tool_loop {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn executes_tool_and_feeds_result_back() {
        let (runtime, tools) = runtime_with(
            vec![tool_call_turn(), vec![ModelChunk::Text("4".into())]],
            json!({"ok": true, "v": 4}),
        );

        let created = runtime
            .coordinator()
            .create_session(create_request(vec![kairo::message::Message::user(
                "what is 2+2",
            )]))
            .await
            .unwrap();

        let state = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::Done
        })
        .await;

        assert_eq!(tools.invocation_count(), 1);

        let roles: Vec<Role> = state.messages.iter().map(|message| message.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );

        let assistant = &state.messages[1];
        assert!(assistant.has_tool_calls());
        assert_eq!(assistant.tool_calls.as_ref().unwrap()[0].id, "t1");

        let tool = &state.messages[2];
        assert_eq!(tool.tool_call_id.as_deref(), Some("t1"));
        assert_eq!(tool.text(), Some(r#"{"ok":true,"v":4}"#));

        assert_eq!(state.messages[3].text(), Some("4"));

        let types = event_types(&runtime, &created.session_id).await;
        assert!(types.contains(&EventType::ToolStart));
        assert!(types.contains(&EventType::ToolComplete));
    }
}

mod s3_approval_pause {
    use super::*;

    fn approval_request(messages: Vec<kairo::message::Message>) -> CreateSessionRequest {
        let mut request = create_request(messages);
        request.agent_config = Some(AgentConfig {
            approval: ApprovalPolicy::Always,
        });
        request
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_and_resumes_on_approval() {
        let (runtime, tools) = runtime_with(
            vec![tool_call_turn(), vec![ModelChunk::Text("done".into())]],
            json!({"ok": true}),
        );

        let created = runtime
            .coordinator()
            .create_session(approval_request(vec![kairo::message::Message::user("go")]))
            .await
            .unwrap();

        let waiting = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::WaitingForHumanInput
        })
        .await;

        // Exactly one pending field set (the waiting invariant).
        assert!(waiting.waiting_invariant_holds());
        assert_eq!(waiting.pending_kind(), Some(PendingKind::ToolApproval));
        let pending = waiting.pending_tools_calling.as_ref().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "t1");
        assert_eq!(tools.invocation_count(), 0);

        let types = event_types(&runtime, &created.session_id).await;
        assert!(types.contains(&EventType::HumanApprovalRequest));

        // No further step was enqueued while waiting.
        let scheduled_while_waiting = runtime.queue().stats().await.scheduled;

        let report = runtime
            .coordinator()
            .get_status(StatusRequest {
                session_id: created.session_id.clone(),
                include_history: false,
                history_limit: None,
            })
            .await
            .unwrap();
        assert!(report.needs_human_input);
        assert!(!report.is_active);

        runtime
            .coordinator()
            .process_intervention(InterventionRequest {
                session_id: created.session_id.clone(),
                action: InterventionAction::Approve,
                data: json!({
                    "approvedToolCall": {
                        "id": "t1",
                        "type": "function",
                        "function": { "name": "calc", "arguments": "{\"x\":2}" },
                    }
                }),
                reason: None,
            })
            .await
            .unwrap();
        assert_eq!(
            runtime.queue().stats().await.scheduled,
            scheduled_while_waiting + 1
        );

        let state = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::Done
        })
        .await;
        assert_eq!(tools.invocation_count(), 1);
        assert!(state.pending_tools_calling.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn multi_call_batch_survives_incremental_approval() {
        let two_call_turn = vec![
            ModelChunk::ToolUseStart {
                index: 0,
                id: "t1".into(),
                name: "calc".into(),
            },
            ModelChunk::ToolUseDelta {
                index: 0,
                partial_json: r#"{"x":2}"#.into(),
            },
            ModelChunk::ToolUseStart {
                index: 1,
                id: "t2".into(),
                name: "calc".into(),
            },
            ModelChunk::ToolUseDelta {
                index: 1,
                partial_json: r#"{"x":3}"#.into(),
            },
        ];
        let (runtime, tools) = runtime_with(
            vec![two_call_turn, vec![ModelChunk::Text("done".into())]],
            json!({"ok": true}),
        );

        let created = runtime
            .coordinator()
            .create_session(approval_request(vec![kairo::message::Message::user("go")]))
            .await
            .unwrap();

        let waiting = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::WaitingForHumanInput
        })
        .await;
        let pending = waiting.pending_tools_calling.as_ref().unwrap();
        assert_eq!(pending.len(), 2);

        let approve = |id: &str, args: &str| InterventionRequest {
            session_id: created.session_id.clone(),
            action: InterventionAction::Approve,
            data: json!({
                "approvedToolCall": {
                    "id": id,
                    "type": "function",
                    "function": { "name": "calc", "arguments": args },
                }
            }),
            reason: None,
        };

        // Approving one call must not drop its sibling: the session
        // pauses again with the full batch until every call is cleared.
        runtime
            .coordinator()
            .process_intervention(approve("t1", "{\"x\":2}"))
            .await
            .unwrap();
        let waiting_again = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::WaitingForHumanInput
                && state.approved_tool_call_ids.len() == 1
        })
        .await;
        let pending = waiting_again.pending_tools_calling.as_ref().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(tools.invocation_count(), 0);

        runtime
            .coordinator()
            .process_intervention(approve("t2", "{\"x\":3}"))
            .await
            .unwrap();
        let state = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::Done
        })
        .await;

        // Both calls executed, and both tool_call_ids were answered.
        assert_eq!(tools.invocation_count(), 2);
        let tool_ids: Vec<&str> = state
            .messages
            .iter()
            .filter(|message| message.role == Role::Tool)
            .filter_map(|message| message.tool_call_id.as_deref())
            .collect();
        assert_eq!(tool_ids, vec!["t1", "t2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn intervention_on_non_waiting_session_conflicts() {
        let (runtime, _tools) = runtime_with(
            vec![vec![ModelChunk::Text("hello".into())]],
            json!({}),
        );

        let created = runtime
            .coordinator()
            .create_session(create_request(vec![kairo::message::Message::user("hi")]))
            .await
            .unwrap();
        wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::Done
        })
        .await;

        let err = runtime
            .coordinator()
            .process_intervention(InterventionRequest {
                session_id: created.session_id,
                action: InterventionAction::Reject,
                data: Value::Null,
                reason: Some("late".into()),
            })
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 409);
    }
}

mod s4_rejection {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rejection_finishes_without_running_the_tool() {
        let (runtime, tools) = runtime_with(vec![tool_call_turn()], json!({"ok": true}));

        let mut request = create_request(vec![kairo::message::Message::user("go")]);
        request.agent_config = Some(AgentConfig {
            approval: ApprovalPolicy::Always,
        });
        let created = runtime.coordinator().create_session(request).await.unwrap();

        // Step 0 ran the model, step 1 paused for approval.
        let waiting = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::WaitingForHumanInput
        })
        .await;
        assert_eq!(waiting.step_count, 2);

        runtime
            .coordinator()
            .process_intervention(InterventionRequest {
                session_id: created.session_id.clone(),
                action: InterventionAction::Reject,
                data: Value::Null,
                reason: Some("no".into()),
            })
            .await
            .unwrap();

        let state = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::Done
        })
        .await;

        // Exactly one more step ran, and no tool was invoked.
        assert_eq!(state.step_count, 3);
        assert_eq!(tools.invocation_count(), 0);

        let mut history = runtime
            .events()
            .history(&created.session_id, 1_000)
            .await
            .unwrap();
        history.reverse();
        let last = history.last().unwrap();
        assert_eq!(last.event_type, EventType::Done);
        assert_eq!(last.data["reason_detail"], "no");
    }
}

mod s5_cost_stop {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cost_ceiling_suppresses_continuation() {
        let (runtime, _tools) = runtime_with(
            vec![vec![
                ModelChunk::Text("expensive".into()),
                ModelChunk::Usage {
                    usage: Usage::new(100, 50),
                    cost: Some(0.02),
                },
            ]],
            json!({}),
        );

        let mut request = create_request(vec![kairo::message::Message::user("hi")]);
        request.cost_limit = Some(CostLimit {
            max_total_cost: 0.01,
            currency: "USD".into(),
            on_exceeded: OnExceeded::Stop,
        });
        let created = runtime.coordinator().create_session(request).await.unwrap();

        let state = wait_for(&runtime, &created.session_id, |state| {
            state.step_count == 1
        })
        .await;

        // Status stays as the executor left it; the session is simply
        // not rescheduled.
        assert_eq!(state.status, SessionStatus::Running);
        assert!(state.cost.total >= 0.01);

        // Give any stray continuation a chance to fire, then confirm
        // only step 0 was ever scheduled.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runtime.queue().stats().await.scheduled, 1);
        let after = runtime
            .store()
            .load_state(&created.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.step_count, 1);

        let report = runtime
            .coordinator()
            .get_status(StatusRequest {
                session_id: created.session_id,
                include_history: false,
                history_limit: None,
            })
            .await
            .unwrap();
        assert!(!report.is_active);
        assert!(!report.is_completed);
    }

    #[tokio::test(start_paused = true)]
    async fn cost_interrupt_suspends_the_session() {
        let (runtime, _tools) = runtime_with(
            vec![vec![
                ModelChunk::Text("expensive".into()),
                ModelChunk::Usage {
                    usage: Usage::new(10, 10),
                    cost: Some(0.05),
                },
            ]],
            json!({}),
        );

        let mut request = create_request(vec![kairo::message::Message::user("hi")]);
        request.cost_limit = Some(CostLimit {
            max_total_cost: 0.01,
            currency: "USD".into(),
            on_exceeded: OnExceeded::Interrupt,
        });
        let created = runtime.coordinator().create_session(request).await.unwrap();

        let state = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::Interrupted
        })
        .await;
        let interruption = state.interruption.unwrap();
        assert_eq!(interruption.reason, "cost_limit_exceeded");
        assert!(interruption.can_resume);
    }
}

mod s6_replay {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_replays_history_then_heartbeats() {
        let (runtime, _tools) = runtime_with(
            vec![vec![
                ModelChunk::Text("hel".into()),
                ModelChunk::Text("lo".into()),
            ]],
            json!({}),
        );

        let created = runtime
            .coordinator()
            .create_session(create_request(vec![kairo::message::Message::user("hi")]))
            .await
            .unwrap();
        wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::Done
        })
        .await;

        let (handle, cancel) = cancel_pair();
        let frames = runtime.subscribe_sse(
            SseRequest {
                session_id: created.session_id.clone(),
                last_event_id: "0".into(),
                include_history: true,
            },
            cancel,
        );
        futures::pin_mut!(frames);

        let parse = |frame: String| -> Value {
            serde_json::from_str(frame.trim_start_matches("data: ").trim_end()).unwrap()
        };

        let connected = parse(frames.next().await.unwrap());
        assert_eq!(connected["type"], "connected");
        assert_eq!(connected["sessionId"], created.session_id);

        // All nine historical events, in order, each exactly once.
        let mut ids = Vec::new();
        let mut types = Vec::new();
        for _ in 0..9 {
            let event = parse(frames.next().await.unwrap());
            ids.push(event["id"].as_str().unwrap().to_string());
            types.push(event["type"].as_str().unwrap().to_string());
        }
        assert_eq!(types.first().map(String::as_str), Some("step_start"));
        assert_eq!(types.last().map(String::as_str), Some("done"));
        let mut deduped = ids.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), 9, "no event repeats");

        // Then the idle heartbeat.
        let beat = parse(frames.next().await.unwrap());
        assert_eq!(beat["type"], "heartbeat");
        handle.cancel();
    }
}

mod deletion {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn delete_removes_state_and_event_log() {
        let (runtime, _tools) = runtime_with(
            vec![vec![ModelChunk::Text("hello".into())]],
            json!({}),
        );

        let created = runtime
            .coordinator()
            .create_session(create_request(vec![kairo::message::Message::user("hi")]))
            .await
            .unwrap();
        wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::Done
        })
        .await;

        runtime
            .coordinator()
            .delete_session(&created.session_id)
            .await
            .unwrap();

        assert!(runtime
            .store()
            .load_state(&created.session_id)
            .await
            .unwrap()
            .is_none());
        assert!(runtime
            .events()
            .history(&created.session_id, 10)
            .await
            .unwrap()
            .is_empty());

        let err = runtime
            .coordinator()
            .get_status(StatusRequest {
                session_id: created.session_id,
                include_history: false,
                history_limit: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }
}

mod human_prompt {
    use super::*;

    /// Runner that asks the human a question on the first model result.
    struct PromptingRunner;

    impl kairo::instruction::InstructionRunner for PromptingRunner {
        fn decide(
            &self,
            context: &kairo::context::StepContext,
            state: &SessionState,
        ) -> Result<kairo::instruction::Instruction> {
            use kairo::context::PhaseData;
            use kairo::instruction::Instruction;
            match &context.data {
                PhaseData::UserInput { .. } => Ok(Instruction::CallLlm),
                PhaseData::LlmResult { .. } => Ok(Instruction::RequestHumanPrompt {
                    prompt: "continue?".into(),
                }),
                PhaseData::HumanInput { .. } => Ok(Instruction::Finish {
                    reason: "final_output".into(),
                    reason_detail: state
                        .messages
                        .last()
                        .and_then(|message| message.text())
                        .map(str::to_string),
                }),
                _ => Ok(Instruction::Finish {
                    reason: "done".into(),
                    reason_detail: None,
                }),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_answer_resumes_with_a_user_message() {
        let tools = Arc::new(RecordingToolHost::new(json!({})));
        let runtime = AgentRuntime::assemble(
            RuntimeConfig::default(),
            Arc::new(MemorySessionStore::with_default_ttl()),
            Arc::new(MemoryEventStream::with_defaults()),
            Arc::new(ScriptedModel::new(vec![vec![ModelChunk::Text(
                "thinking".into(),
            )]])),
            Arc::clone(&tools) as Arc<dyn ToolHost>,
            Arc::new(PromptingRunner),
        )
        .unwrap();

        let created = runtime
            .coordinator()
            .create_session(create_request(vec![kairo::message::Message::user("hi")]))
            .await
            .unwrap();

        let waiting = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::WaitingForHumanInput
        })
        .await;
        assert_eq!(waiting.pending_kind(), Some(PendingKind::Prompt));
        assert_eq!(
            waiting.pending_human_prompt.as_ref().unwrap().prompt,
            "continue?"
        );

        runtime
            .coordinator()
            .process_intervention(InterventionRequest {
                session_id: created.session_id.clone(),
                action: InterventionAction::Input,
                data: json!({"text": "yes please"}),
                reason: None,
            })
            .await
            .unwrap();

        let state = wait_for(&runtime, &created.session_id, |state| {
            state.status == SessionStatus::Done
        })
        .await;
        let answer = state
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .unwrap();
        assert_eq!(answer.text(), Some("yes please"));
    }
}

mod validation {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn create_rejects_empty_model() {
        let (runtime, _tools) = runtime_with(vec![], json!({}));
        let err = runtime
            .coordinator()
            .create_session(
                serde_json::from_value::<CreateSessionRequest>(json!({
                    "modelConfig": { "model": "", "provider": "openai" },
                }))
                .unwrap(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_session_status_is_not_found() {
        let (runtime, _tools) = runtime_with(vec![], json!({}));
        let err = runtime
            .coordinator()
            .get_status(StatusRequest {
                session_id: "ghost".into(),
                include_history: false,
                history_limit: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_session_step_is_terminal_to_the_queue() {
        let (runtime, _tools) = runtime_with(vec![], json!({}));
        let err = runtime
            .engine()
            .execute_step(StepTask::new("ghost", 0))
            .await
            .unwrap_err();
        assert!(!err.is_retriable());
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test(start_paused = true)]
    async fn state_roundtrip_is_deep_equal() {
        let (runtime, _tools) = runtime_with(vec![], json!({}));
        let mut state = SessionState::new("rt-1", ModelConfig::new("gpt-4.1", "openai"));
        state.push_message(kairo::message::Message::user("hi"));
        state.cost.add(0.5);
        runtime.store().save_state("rt-1", &state).await.unwrap();
        let loaded = runtime.store().load_state("rt-1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }
}
