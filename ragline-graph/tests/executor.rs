use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ragline_core::{
    Checkpoint, CheckpointMetadata, CheckpointStore, ConversationState, FailureMark,
    InMemoryCheckpointStore, LlmRequest, LlmResponse, Message, RaglineError, RetryPolicy,
    RunStatus, StoreError, SuspendReason, ToolCall, ToolCallingLlm,
};
use ragline_graph::{
    scratch_keys, ActiveRun, AgentNode, ExecutionConfig, ExecutionOptions, GraphBuilder,
    GraphError, GraphExecutor, NodeContext, NodeError, NodeOutput, NodeUpdate, Observer,
    RetrievalResponderNode, RuleSupervisor, RunHandle,
};
use ragline_retrieval::{BaseRetriever, RetrievalError, RetrievedChunk, SearchRequest};
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct ScriptedLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
        })
    }
}

#[async_trait]
impl ToolCallingLlm for ScriptedLlm {
    async fn invoke(&self, _request: LlmRequest) -> Result<LlmResponse, RaglineError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RaglineError::LlmProvider("script exhausted".to_string()))
    }
}

fn text(content: &str) -> LlmResponse {
    LlmResponse {
        content: content.to_string(),
        tool_calls: Vec::new(),
    }
}

fn tool_call(name: &str, args: serde_json::Value) -> LlmResponse {
    LlmResponse {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: "model-chosen".to_string(),
            name: name.to_string(),
            args,
        }],
    }
}

struct PolicyRetriever;

#[async_trait]
impl BaseRetriever for PolicyRetriever {
    async fn search(
        &self,
        _query: &str,
        _request: &SearchRequest,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        Ok(vec![RetrievedChunk {
            document_id: "refund-policy".to_string(),
            text: "Refunds are accepted within 30 days of purchase.".to_string(),
            score: 0.92,
            distance: 0.08,
        }])
    }
}

fn responder(llm: Arc<ScriptedLlm>) -> RetrievalResponderNode {
    RetrievalResponderNode::builder()
        .llm(llm)
        .retriever(Arc::new(PolicyRetriever))
        .model("test-model")
        .build()
        .unwrap()
}

fn asking(run_id: &str, question: &str) -> ActiveRun {
    let mut run = ActiveRun::fresh(RunHandle::new("conv-1", run_id), "supervisor");
    run.state.push_message(Message::user(question));
    run
}

#[tokio::test]
async fn refund_question_completes_in_one_step() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let llm = ScriptedLlm::new(vec![text("Refunds are accepted within 30 days.")]);
    let executor = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("responder"))
        .add_node("responder", responder(llm))
        .with_checkpoint_store(store.clone())
        .build()
        .unwrap();

    let outcome = executor
        .run(asking("run-1", "What is the refund policy?"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.reply.as_deref(), Some("Refunds are accepted within 30 days."));
    assert_eq!(outcome.handle.last_step, 1);

    let saved = store.load_latest("run-1").await.unwrap().unwrap();
    assert_eq!(saved.step, 1);
    assert_eq!(saved.next_node, "supervisor");
    assert_eq!(saved.status, RunStatus::Completed);
    assert!(saved.state.scratch(scratch_keys::RETRIEVED_CHUNKS).is_some());
    assert_eq!(
        store
            .latest_for_conversation("conv-1")
            .await
            .unwrap()
            .unwrap()
            .run_id,
        "run-1"
    );
}

#[tokio::test]
async fn tool_call_suspends_and_resumes_after_restart() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let build = |llm: Arc<ScriptedLlm>| {
        GraphBuilder::new()
            .supervisor(RuleSupervisor::new("responder").after_tool("responder"))
            .add_node("responder", responder(llm))
            .with_checkpoint_store(store.clone())
            .build()
            .unwrap()
    };

    let first = build(ScriptedLlm::new(vec![tool_call(
        "lookup_order",
        json!({"order_id": "A-17"}),
    )]));
    let outcome = first
        .run(asking("run-7", "Can I return order A-17?"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        outcome.status,
        RunStatus::Suspended {
            reason: SuspendReason::AwaitingTool {
                call_id: "run-7:1".to_string(),
                tool: "lookup_order".to_string(),
            }
        }
    );
    drop(first);

    let restarted = build(ScriptedLlm::new(vec![text("Order A-17 can be refunded.")]));
    let checkpoint = restarted.store().load_latest("run-7").await.unwrap().unwrap();
    let (mut run, status) = ActiveRun::from_checkpoint(checkpoint);
    let (call_id, _) = status.awaiting_tool().unwrap();
    run.state
        .push_message(Message::tool_result(call_id, r#"{"purchased_days_ago": 12}"#));

    let outcome = restarted.run(run, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.reply.as_deref(), Some("Order A-17 can be refunded."));
    assert_eq!(outcome.handle.last_step, 2);
    assert_eq!(store.history("run-7").await.unwrap().len(), 2);
}

struct Router(&'static str);

#[async_trait]
impl AgentNode for Router {
    async fn execute(
        &self,
        _state: &ConversationState,
        _ctx: &NodeContext,
    ) -> Result<NodeUpdate, NodeError> {
        Ok(NodeOutput::route(self.0).into())
    }
}

#[tokio::test]
async fn endless_routing_hits_step_limit() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let executor = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("ping"))
        .add_agent("ping", Arc::new(Router("pong")))
        .add_agent("pong", Arc::new(Router("ping")))
        .with_checkpoint_store(store.clone())
        .with_default_config(ExecutionConfig {
            max_steps: 3,
            ..ExecutionConfig::default()
        })
        .build()
        .unwrap();

    let failure = executor
        .run(asking("run-loop", "hello"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        GraphError::StepLimitExceeded { limit: 3, steps: 3 }
    ));
    assert_eq!(failure.handle.last_step, 3);
    let latest = store.load_latest("run-loop").await.unwrap().unwrap();
    assert_eq!(latest.step, 3);
    assert_eq!(latest.status, RunStatus::Running);
}

#[tokio::test]
async fn per_call_options_override_step_limit() {
    let executor = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("ping"))
        .add_agent("ping", Arc::new(Router("pong")))
        .add_agent("pong", Arc::new(Router("ping")))
        .build()
        .unwrap();
    let options = ExecutionOptions {
        max_steps: Some(1),
        ..ExecutionOptions::default()
    };

    let failure = executor
        .run_with_options(asking("run-opt", "hi"), &options, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        failure.error,
        GraphError::StepLimitExceeded { limit: 1, .. }
    ));
}

struct NoteTaker;

#[async_trait]
impl AgentNode for NoteTaker {
    async fn execute(
        &self,
        state: &ConversationState,
        ctx: &NodeContext,
    ) -> Result<NodeUpdate, NodeError> {
        Ok(NodeUpdate::new(NodeOutput::route("responder")).with_scratch(
            "notes",
            json!({"step": ctx.step, "messages_seen": state.messages.len()}),
        ))
    }
}

fn researched(store: Arc<InMemoryCheckpointStore>, answer: &str) -> GraphExecutor {
    GraphBuilder::new()
        .supervisor(RuleSupervisor::new("researcher"))
        .add_agent("researcher", Arc::new(NoteTaker))
        .add_node("responder", responder(ScriptedLlm::new(vec![text(answer)])))
        .with_checkpoint_store(store)
        .build()
        .unwrap()
}

#[tokio::test]
async fn restart_mid_run_reaches_the_same_final_state() {
    let answer = "Refunds are accepted within 30 days.";
    let question = "What is the refund policy?";

    let straight_store = Arc::new(InMemoryCheckpointStore::new());
    let straight = researched(straight_store, answer)
        .run(asking("run-same", question), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(straight.status, RunStatus::Completed);
    assert_eq!(straight.handle.last_step, 2);

    let store = Arc::new(InMemoryCheckpointStore::new());
    let interrupted = researched(store.clone(), answer);
    let options = ExecutionOptions {
        max_steps: Some(1),
        ..ExecutionOptions::default()
    };
    let failure = interrupted
        .run_with_options(asking("run-same", question), &options, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(failure.handle.last_step, 1);
    drop(interrupted);

    let restarted = researched(store.clone(), answer);
    let checkpoint = restarted.store().load_latest("run-same").await.unwrap().unwrap();
    assert_eq!(checkpoint.status, RunStatus::Running);
    let (run, _) = ActiveRun::from_checkpoint(checkpoint);
    let resumed = restarted.run(run, &CancellationToken::new()).await.unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.handle.last_step, straight.handle.last_step);
    assert_eq!(resumed.reply, straight.reply);
    assert_eq!(resumed.state.to_blob().unwrap(), straight.state.to_blob().unwrap());
    assert_eq!(store.history("run-same").await.unwrap().len(), 2);
}

struct Slow;

#[async_trait]
impl AgentNode for Slow {
    async fn execute(
        &self,
        _state: &ConversationState,
        _ctx: &NodeContext,
    ) -> Result<NodeUpdate, NodeError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(NodeOutput::respond("too late").into())
    }
}

#[tokio::test]
async fn timed_out_node_is_absorbed_and_supervisor_answers() {
    let executor = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("slow").fallback_reply("Please try again later."))
        .add_agent("slow", Arc::new(Slow))
        .with_default_config(ExecutionConfig {
            node_timeout_ms: 20,
            node_retry: RetryPolicy::none(),
            ..ExecutionConfig::default()
        })
        .build()
        .unwrap();

    let outcome = executor
        .run(asking("run-slow", "hi"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.reply.as_deref(), Some("Please try again later."));
    assert_eq!(outcome.handle.last_step, 2);
    assert!(outcome.state.scratch(scratch_keys::LAST_ERROR).is_none());
    assert!(outcome
        .state
        .messages
        .iter()
        .any(|message| message.content.contains("timed out")));
}

struct Flaky {
    calls: Mutex<u32>,
}

#[async_trait]
impl AgentNode for Flaky {
    async fn execute(
        &self,
        _state: &ConversationState,
        ctx: &NodeContext,
    ) -> Result<NodeUpdate, NodeError> {
        *self.calls.lock().unwrap() += 1;
        if ctx.attempt == 1 {
            return Err(NodeError::Recoverable("rate limited".to_string()));
        }
        Ok(NodeOutput::respond("recovered").into())
    }
}

#[tokio::test]
async fn recoverable_failure_is_retried_within_the_step() {
    let flaky = Arc::new(Flaky {
        calls: Mutex::new(0),
    });
    let executor = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("flaky"))
        .add_agent("flaky", flaky.clone())
        .with_default_config(ExecutionConfig {
            node_retry: RetryPolicy::default()
                .with_max_attempts(2)
                .with_initial_backoff(Duration::from_millis(1)),
            ..ExecutionConfig::default()
        })
        .build()
        .unwrap();

    let outcome = executor
        .run(asking("run-flaky", "hi"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.reply.as_deref(), Some("recovered"));
    assert_eq!(outcome.handle.last_step, 1);
    assert_eq!(*flaky.calls.lock().unwrap(), 2);
}

struct Broken;

#[async_trait]
impl AgentNode for Broken {
    async fn execute(
        &self,
        _state: &ConversationState,
        _ctx: &NodeContext,
    ) -> Result<NodeUpdate, NodeError> {
        Err(NodeError::Fatal("corrupt prompt".to_string()))
    }
}

#[tokio::test]
async fn fatal_error_fails_without_committing() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let executor = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("broken"))
        .add_agent("broken", Arc::new(Broken))
        .with_checkpoint_store(store.clone())
        .build()
        .unwrap();

    let failure = executor
        .run(asking("run-broken", "hi"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(failure.error, GraphError::NodeFailed { ref node, .. } if node == "broken"));
    assert_eq!(failure.handle.last_step, 0);
    assert!(store.load_latest("run-broken").await.unwrap().is_none());
}

#[tokio::test]
async fn routing_to_unknown_node_fails_the_run() {
    let executor = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("router"))
        .add_agent("router", Arc::new(Router("nowhere")))
        .build()
        .unwrap();

    let failure = executor
        .run(asking("run-lost", "hi"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(failure.error, GraphError::UnknownNode { ref node } if node == "nowhere"));
}

struct CancelsThenRoutes {
    token: CancellationToken,
}

#[async_trait]
impl AgentNode for CancelsThenRoutes {
    async fn execute(
        &self,
        _state: &ConversationState,
        _ctx: &NodeContext,
    ) -> Result<NodeUpdate, NodeError> {
        self.token.cancel();
        Ok(NodeOutput::route("finisher").into())
    }
}

struct Finisher;

#[async_trait]
impl AgentNode for Finisher {
    async fn execute(
        &self,
        _state: &ConversationState,
        _ctx: &NodeContext,
    ) -> Result<NodeUpdate, NodeError> {
        Ok(NodeOutput::respond("done").into())
    }
}

#[tokio::test]
async fn cancellation_lets_the_in_flight_node_finish_and_checkpoints() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let token = CancellationToken::new();
    let executor = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("canceller"))
        .add_agent(
            "canceller",
            Arc::new(CancelsThenRoutes {
                token: token.clone(),
            }),
        )
        .add_agent("finisher", Arc::new(Finisher))
        .with_checkpoint_store(store.clone())
        .build()
        .unwrap();

    let outcome = executor
        .run(asking("run-cancel", "hi"), &token)
        .await
        .unwrap();
    assert_eq!(
        outcome.status,
        RunStatus::Suspended {
            reason: SuspendReason::Cancelled
        }
    );
    assert_eq!(outcome.handle.last_step, 1);
    let saved = store.load_latest("run-cancel").await.unwrap().unwrap();
    assert_eq!(saved.next_node, "finisher");

    let (run, _) = ActiveRun::from_checkpoint(saved);
    let resumed = executor.run(run, &CancellationToken::new()).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.reply.as_deref(), Some("done"));
    assert_eq!(resumed.handle.last_step, 2);
}

#[tokio::test]
async fn cancelled_before_first_step_writes_nothing() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let executor = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("finisher"))
        .add_agent("finisher", Arc::new(Finisher))
        .with_checkpoint_store(store.clone())
        .build()
        .unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let outcome = executor.run(asking("run-early", "hi"), &token).await.unwrap();
    assert!(matches!(outcome.status, RunStatus::Suspended { .. }));
    assert!(store.load_latest("run-early").await.unwrap().is_none());
}

struct DownStore;

#[async_trait]
impl CheckpointStore for DownStore {
    async fn save(&self, _checkpoint: &Checkpoint) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk detached".to_string()))
    }

    async fn load_latest(&self, _run_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(None)
    }

    async fn load_at(&self, _run_id: &str, _step: u64) -> Result<Option<Checkpoint>, StoreError> {
        Ok(None)
    }

    async fn latest_for_conversation(
        &self,
        _conversation_id: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        Ok(None)
    }

    async fn history(&self, _run_id: &str) -> Result<Vec<CheckpointMetadata>, StoreError> {
        Ok(Vec::new())
    }

    async fn mark_failed(&self, _mark: &FailureMark) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk detached".to_string()))
    }

    async fn failure(&self, _run_id: &str) -> Result<Option<FailureMark>, StoreError> {
        Ok(None)
    }

    async fn clear_failure(&self, _run_id: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn store_failure_aborts_step_without_advancing() {
    let executor = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("finisher"))
        .add_agent("finisher", Arc::new(Finisher))
        .with_checkpoint_store(Arc::new(DownStore))
        .with_store_retry(
            RetryPolicy::default()
                .with_max_attempts(2)
                .with_initial_backoff(Duration::from_millis(1)),
        )
        .build()
        .unwrap();

    let failure = executor
        .run(asking("run-down", "hi"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        GraphError::Store(StoreError::RetriesExhausted { attempts: 2, .. })
    ));
    assert_eq!(failure.handle.last_step, 0);
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Observer for Recorder {
    fn on_node_enter(&self, node: &str, step: u64) {
        self.events.lock().unwrap().push(format!("enter:{node}:{step}"));
    }

    fn on_checkpoint_saved(&self, _run_id: &str, step: u64) {
        self.events.lock().unwrap().push(format!("saved:{step}"));
    }

    fn on_status(&self, _run_id: &str, status: &RunStatus) {
        self.events.lock().unwrap().push(format!("status:{status:?}"));
    }
}

#[tokio::test]
async fn observer_sees_nodes_and_commits_in_order() {
    let recorder = Arc::new(Recorder::default());
    let executor = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("finisher"))
        .add_agent("finisher", Arc::new(Finisher))
        .with_observer(recorder.clone())
        .build()
        .unwrap();

    executor
        .run(asking("run-obs", "hi"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        recorder.events.lock().unwrap().as_slice(),
        [
            "status:Running",
            "enter:supervisor:1",
            "enter:finisher:1",
            "saved:1",
            "status:Completed",
        ]
    );
}

#[test]
fn builder_rejects_missing_supervisor_and_dangling_routes() {
    let missing = GraphBuilder::new()
        .add_agent("finisher", Arc::new(Finisher))
        .build();
    assert!(matches!(missing, Err(GraphError::InvalidGraph(_))));

    let dangling = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("responder"))
        .build();
    assert!(matches!(dangling, Err(GraphError::InvalidGraph(ref msg)) if msg.contains("responder")));

    let duplicate = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("finisher"))
        .add_agent("finisher", Arc::new(Finisher))
        .add_agent("finisher", Arc::new(Finisher))
        .build();
    assert!(matches!(duplicate, Err(GraphError::InvalidGraph(_))));
}

#[test]
fn executor_exposes_configured_supervisor() {
    let executor: GraphExecutor = GraphBuilder::new()
        .supervisor(RuleSupervisor::new("finisher"))
        .add_agent("finisher", Arc::new(Finisher))
        .build()
        .unwrap();
    assert_eq!(executor.supervisor_id(), "supervisor");
    assert!(executor.registry().contains("finisher"));
}
