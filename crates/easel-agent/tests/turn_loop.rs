use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use easel_agent::{AgentEvent, Conversation, Engine, EngineError, EngineSettings};
use easel_canvas::SessionManager;
use easel_core::config::Config;
use easel_core::types::{ContentPart, Message, Role, ToolResultContent};
use easel_providers::{ChatRequest, EventStream, LlmProvider, StopReason, StreamEvent};
use easel_tools::{Tool, ToolContext, ToolOutput, ToolRegistry};

/// One scripted backend reply: the events to stream, or an error opening it.
enum Reply {
    Events(Vec<StreamEvent>),
    Fail(&'static str),
    FailMidStream(Vec<StreamEvent>),
}

/// Backend that replays scripted replies and records each request's history.
struct ScriptedProvider {
    replies: Mutex<VecDeque<Reply>>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn stream(&self, request: &ChatRequest<'_>) -> anyhow::Result<EventStream> {
        self.seen.lock().unwrap().push(request.messages.to_vec());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("backend called more often than scripted");

        let items: Vec<anyhow::Result<StreamEvent>> = match reply {
            Reply::Fail(message) => anyhow::bail!(message),
            Reply::Events(events) => events.into_iter().map(Ok).collect(),
            Reply::FailMidStream(events) => events
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(anyhow::anyhow!("connection reset"))))
                .collect(),
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Records the order of its invocations.
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for Recorder {
    fn name(&self) -> &str {
        "record"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {"label": {"type": "string"}}})
    }

    fn description(&self) -> &str {
        "Records a label"
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let label = params["label"].as_str().unwrap_or_default().to_string();
        if label == "bad" {
            anyhow::bail!("label rejected");
        }
        self.log.lock().unwrap().push(label.clone());
        Ok(ToolOutput::text(format!("recorded {label}")))
    }
}

fn text(t: &str) -> StreamEvent {
    StreamEvent::TextDelta { text: t.into() }
}

fn finished(reason: StopReason) -> StreamEvent {
    StreamEvent::TurnFinished { reason }
}

fn call(id: &str, input: serde_json::Value) -> Vec<StreamEvent> {
    let raw = input.to_string();
    let (head, tail) = raw.split_at(raw.len() / 2);
    vec![
        StreamEvent::ToolCallStarted {
            id: id.into(),
            name: "record".into(),
        },
        StreamEvent::ToolCallInputDelta {
            id: id.into(),
            partial: head.into(),
        },
        StreamEvent::ToolCallInputDelta {
            id: id.into(),
            partial: tail.into(),
        },
    ]
}

struct Harness {
    engine: Engine,
    provider: Arc<ScriptedProvider>,
    log: Arc<Mutex<Vec<String>>>,
    _workspace: tempfile::TempDir,
}

fn harness(replies: Vec<Reply>, settings: EngineSettings) -> Harness {
    let workspace = tempfile::tempdir().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(Box::new(Recorder { log: log.clone() }));

    let context = ToolContext {
        workspace: workspace.path().to_path_buf(),
        restrict_to_workspace: true,
        sessions: Arc::new(SessionManager::from_config(&Config::default())),
    };
    let provider = ScriptedProvider::new(replies);
    let engine = Engine::new(provider.clone(), Arc::new(tools), context, settings);
    Harness {
        engine,
        provider,
        log,
        _workspace: workspace,
    }
}

#[tokio::test]
async fn plain_answer_takes_one_backend_call() {
    let h = harness(
        vec![Reply::Events(vec![
            text("A square "),
            text("it is."),
            finished(StopReason::EndTurn),
        ])],
        EngineSettings::default(),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conversation = Conversation::new();

    let outcome = h.engine.submit(&mut conversation, "draw a square", &tx).await.unwrap();
    assert_eq!(outcome.text, "A square it is.");
    assert_eq!(outcome.backend_calls, 1);
    assert_eq!(outcome.tool_calls, 0);
    assert_eq!(h.provider.calls(), 1);

    let roles: Vec<Role> = conversation.messages().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);

    drop(tx);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(
        events.last(),
        Some(&AgentEvent::BlockReply {
            text: "A square it is.".into()
        })
    );
}

#[tokio::test]
async fn tool_call_round_trip() {
    let mut first = vec![text("Recording.")];
    first.extend(call("c1", json!({"label": "one"})));
    first.push(finished(StopReason::ToolUse));

    let h = harness(
        vec![
            Reply::Events(first),
            Reply::Events(vec![text("Done."), finished(StopReason::EndTurn)]),
        ],
        EngineSettings::default(),
    );
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut conversation = Conversation::new();

    let outcome = h.engine.submit(&mut conversation, "go", &tx).await.unwrap();
    assert_eq!(h.provider.calls(), 2);
    assert_eq!(outcome.tool_calls, 1);
    assert_eq!(outcome.text, "Done.");

    let messages = conversation.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].text(), "go");
    assert_eq!(
        messages[1].tool_uses().collect::<Vec<_>>(),
        vec![("c1", "record", &json!({"label": "one"}))]
    );
    assert_eq!(
        messages[2].content,
        vec![ContentPart::ToolResult {
            tool_use_id: "c1".into(),
            content: ToolResultContent::Text("recorded one".into()),
            is_error: false,
        }]
    );
    assert_eq!(messages[3].text(), "Done.");

    // The follow-up request saw the tool result.
    let seen = h.provider.seen.lock().unwrap();
    assert_eq!(seen[1].len(), 3);
    assert_eq!(seen[1][2].role, Role::Tool);
}

#[tokio::test]
async fn tools_run_sequentially_in_call_order_with_error_flags() {
    let mut first = Vec::new();
    first.extend(call("a", json!({"label": "first"})));
    first.extend(call("b", json!({"label": "bad"})));
    first.extend(call("c", json!({"label": "third"})));
    first.push(finished(StopReason::ToolUse));

    let h = harness(
        vec![
            Reply::Events(first),
            Reply::Events(vec![text("ok"), finished(StopReason::EndTurn)]),
        ],
        EngineSettings::default(),
    );
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut conversation = Conversation::new();
    h.engine.submit(&mut conversation, "go", &tx).await.unwrap();

    assert_eq!(*h.log.lock().unwrap(), vec!["first", "third"]);

    let results: Vec<(String, bool)> = conversation.messages()[2..5]
        .iter()
        .map(|m| match &m.content[0] {
            ContentPart::ToolResult {
                tool_use_id,
                is_error,
                ..
            } => (tool_use_id.clone(), *is_error),
            other => panic!("expected tool result, got {other:?}"),
        })
        .collect();
    assert_eq!(
        results,
        vec![("a".into(), false), ("b".into(), true), ("c".into(), false)]
    );
}

#[tokio::test]
async fn backend_failure_appends_nothing() {
    let h = harness(vec![Reply::Fail("503 overloaded")], EngineSettings::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut conversation = Conversation::new();

    let err = h.engine.submit(&mut conversation, "hi", &tx).await.unwrap_err();
    assert!(matches!(err, EngineError::Backend(_)));
    assert!(err.to_string().contains("503 overloaded"));
    assert_eq!(conversation.len(), 1, "only the user message remains");
}

#[tokio::test]
async fn mid_stream_failure_drops_partial_message() {
    let mut first = vec![text("Working")];
    first.extend(call("x", json!({"label": "never"})));

    let h = harness(vec![Reply::FailMidStream(first)], EngineSettings::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut conversation = Conversation::new();

    let err = h.engine.submit(&mut conversation, "hi", &tx).await.unwrap_err();
    assert!(matches!(err, EngineError::Backend(_)));
    assert_eq!(conversation.len(), 1);
    assert!(h.log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn iteration_limit_stops_tool_loop() {
    let looping = || {
        let mut events = call("loop", json!({"label": "again"}));
        events.push(finished(StopReason::ToolUse));
        Reply::Events(events)
    };
    let settings = EngineSettings {
        max_iterations: Some(2),
        ..EngineSettings::default()
    };
    // Distinct ids per round so the history accepts each result.
    let mut second = call("loop2", json!({"label": "again"}));
    second.push(finished(StopReason::ToolUse));
    let h = harness(vec![looping(), Reply::Events(second)], settings);
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut conversation = Conversation::new();

    let err = h.engine.submit(&mut conversation, "spin", &tx).await.unwrap_err();
    assert!(matches!(err, EngineError::IterationLimit(2)));
    assert_eq!(h.provider.calls(), 2);
    // user, (assistant, result) x 2
    assert_eq!(conversation.len(), 5);
    assert_eq!(conversation.messages()[4].role, Role::Tool);
}

#[tokio::test]
async fn auto_compaction_summarizes_before_turn() {
    let settings = EngineSettings {
        auto_compact: true,
        max_context_tokens: 10,
        keep_recent: 2,
        ..EngineSettings::default()
    };
    let h = harness(
        vec![
            Reply::Events(vec![text("They discussed a floor plan."), finished(StopReason::EndTurn)]),
            Reply::Events(vec![text("Continuing."), finished(StopReason::EndTurn)]),
        ],
        settings,
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conversation = Conversation::new();
    for i in 0..3 {
        conversation
            .append(Message::user_text(format!("a fairly long message number {i}")))
            .unwrap();
    }

    h.engine.submit(&mut conversation, "next", &tx).await.unwrap();
    assert_eq!(h.provider.calls(), 2);

    let messages = conversation.messages();
    assert_eq!(
        messages[0].text(),
        "[Previous conversation summary]\nThey discussed a floor plan."
    );
    assert_eq!(messages[1].text(), "a fairly long message number 2");
    assert_eq!(messages[2].text(), "next");
    assert_eq!(messages[3].text(), "Continuing.");

    drop(tx);
    let mut compacted = false;
    while let Some(event) = rx.recv().await {
        compacted |= matches!(event, AgentEvent::Compacted { removed: 2 });
    }
    assert!(compacted);
}
