use std::sync::Arc;

use ragline_core::{
    CheckpointMetadata, CheckpointStore, ConversationState, FailureMark, Message, RunStatus,
    SuspendReason, ToolError, ToolExecutor, Value,
};
use ragline_graph::{
    scratch_keys, ActiveRun, ExecutionOptions, GraphBuilder, GraphError, GraphExecutor, RunHandle,
    RunOutcome,
};
use serde_json::json;

use crate::slot::{RunSlot, SlotMap, SlotState};
use crate::{ConfigError, ServiceConfig, SessionError};

/// Result of one activation as seen by the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageReply {
    pub handle: RunHandle,
    pub status: RunStatus,
    /// Final answer when the run completed during this activation.
    pub reply: Option<String>,
}

impl From<RunOutcome> for MessageReply {
    fn from(outcome: RunOutcome) -> Self {
        Self {
            handle: outcome.handle,
            status: outcome.status,
            reply: outcome.reply,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageRequest {
    pub conversation_id: String,
    pub text: String,
    pub uploaded_files: Option<Vec<String>>,
    /// Overrides `ServiceConfig::strict_resume` for this call.
    pub strict: Option<bool>,
}

impl MessageRequest {
    pub fn new(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_uploaded_files(mut self, files: Vec<String>) -> Self {
        self.uploaded_files = Some(files);
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = Some(strict);
        self
    }
}

/// Entry point for conversations: maps conversation ids onto runs, serializes
/// activations per conversation and dispatches tool calls.
pub struct SessionManager {
    executor: Arc<GraphExecutor>,
    tools: Option<Arc<dyn ToolExecutor>>,
    config: Arc<ServiceConfig>,
    slots: SlotMap,
}

pub struct SessionManagerBuilder {
    config: ServiceConfig,
    graph: Option<GraphBuilder>,
    tools: Option<Arc<dyn ToolExecutor>>,
}

impl SessionManagerBuilder {
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Node graph to run; execution settings and store retry come from the config.
    pub fn graph(mut self, graph: GraphBuilder) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Runs requested tools in-process instead of waiting for `submit_tool_result`.
    pub fn tool_executor(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn build(self) -> Result<SessionManager, SessionError> {
        self.config.validate()?;
        let graph = self
            .graph
            .ok_or_else(|| ConfigError::Invalid("a node graph is required".to_string()))?;
        let executor = graph
            .with_default_config(self.config.execution.clone())
            .with_store_retry(self.config.store_retry.clone())
            .build()?;
        Ok(SessionManager {
            executor: Arc::new(executor),
            tools: self.tools,
            config: Arc::new(self.config),
            slots: SlotMap::default(),
        })
    }
}

impl SessionManager {
    pub fn builder() -> SessionManagerBuilder {
        SessionManagerBuilder {
            config: ServiceConfig::default(),
            graph: None,
            tools: None,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn executor(&self) -> &GraphExecutor {
        &self.executor
    }

    /// Conversations currently holding in-memory state: an activation in
    /// flight or a run with no committed step yet.
    pub fn tracked_conversations(&self) -> usize {
        self.slots.len()
    }

    /// Handle of the conversation's current run, creating one when none exists
    /// (or failing with `NotFound` under strict resume).
    pub async fn start_or_resume(&self, conversation_id: &str) -> Result<RunHandle, SessionError> {
        validate_id(conversation_id)?;
        let slot = self.slots.lease(conversation_id);
        let mut state = slot.gate.lock().await;
        let loaded = self
            .load(conversation_id, &mut state, self.config.strict_resume)
            .await?;
        Ok(loaded.run.handle)
    }

    pub async fn handle_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<MessageReply, SessionError> {
        self.handle(MessageRequest::new(conversation_id, text)).await
    }

    /// Appends the user message and runs until the run completes or suspends.
    pub async fn handle(&self, request: MessageRequest) -> Result<MessageReply, SessionError> {
        let conversation_id = request.conversation_id.as_str();
        validate_id(conversation_id)?;
        if request.text.trim().is_empty() {
            return Err(SessionError::InvalidRequest(
                "message text is empty".to_string(),
            ));
        }
        let strict = request.strict.unwrap_or(self.config.strict_resume);

        let slot = self.slots.lease(conversation_id);
        let mut state = slot.gate.lock().await;
        let Loaded { mut run, status } = self
            .load(conversation_id, &mut state, strict)
            .await?
            .runnable(conversation_id)?;
        if let Some((call_id, tool)) = status.awaiting_tool() {
            return Err(SessionError::AwaitingTool {
                conversation_id: conversation_id.to_string(),
                call_id: call_id.to_string(),
                tool: tool.to_string(),
            });
        }

        run.state.push_message(Message::user(request.text.clone()));
        if let Some(files) = &request.uploaded_files {
            run.state
                .set_scratch(scratch_keys::UPLOADED_FILES, json!(files));
        }
        tracing::info!(
            conversation_id,
            run_id = %run.handle.run_id,
            step = run.handle.last_step,
            "handling message"
        );
        self.drive(&slot, &mut state, run).await
    }

    /// Feeds the result of an externally executed tool back into a suspended run.
    pub async fn submit_tool_result(
        &self,
        conversation_id: &str,
        call_id: &str,
        result: Result<Value, ToolError>,
    ) -> Result<MessageReply, SessionError> {
        validate_id(conversation_id)?;
        let slot = self.slots.lease(conversation_id);
        let mut state = slot.gate.lock().await;
        let Loaded { mut run, status } = self
            .load(conversation_id, &mut state, true)
            .await?
            .runnable(conversation_id)?;
        let tool = match status.awaiting_tool() {
            None => return Err(SessionError::NotAwaitingTool(conversation_id.to_string())),
            Some((pending, _)) if pending != call_id => {
                return Err(SessionError::UnexpectedToolResult {
                    expected: pending.to_string(),
                    got: call_id.to_string(),
                })
            }
            Some((_, tool)) => tool.to_string(),
        };

        match self.tool_message(call_id, &tool, result) {
            Ok(message) => run.state.push_message(message),
            Err(err) => return Err(self.record_failure(&run.handle, err).await),
        }
        self.drive(&slot, &mut state, run).await
    }

    /// Continues a run interrupted by cancellation or a crash, without new input.
    pub async fn resume(&self, conversation_id: &str) -> Result<MessageReply, SessionError> {
        validate_id(conversation_id)?;
        let slot = self.slots.lease(conversation_id);
        let mut state = slot.gate.lock().await;
        let loaded = self
            .load(conversation_id, &mut state, true)
            .await?
            .runnable(conversation_id)?;
        self.continue_run(conversation_id, &slot, &mut state, loaded)
            .await
    }

    /// Clears a failure mark and continues from the last good checkpoint.
    pub async fn replay(&self, conversation_id: &str) -> Result<MessageReply, SessionError> {
        validate_id(conversation_id)?;
        let slot = self.slots.lease(conversation_id);
        let mut state = slot.gate.lock().await;
        let LoadedRun {
            run,
            status,
            failure,
        } = self.load(conversation_id, &mut state, true).await?;
        if let Some(mark) = failure {
            self.executor
                .store()
                .clear_failure(&mark.run_id)
                .await?;
            tracing::info!(
                conversation_id,
                run_id = %mark.run_id,
                reason = %mark.reason,
                "replaying failed run"
            );
        }
        self.continue_run(conversation_id, &slot, &mut state, Loaded { run, status })
            .await
    }

    /// Requests a graceful stop of the conversation's running activation.
    /// Returns false when nothing is running.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let cancelled = self.slots.cancel(conversation_id);
        if cancelled {
            tracing::info!(conversation_id, "cancellation requested");
        }
        cancelled
    }

    /// Starts the conversation over on a new run id. Earlier runs stay in the
    /// store; a failure mark on the replaced run is cleared.
    pub async fn reset(&self, conversation_id: &str) -> Result<RunHandle, SessionError> {
        validate_id(conversation_id)?;
        let slot = self.slots.lease(conversation_id);
        let mut state = slot.gate.lock().await;
        match self.load(conversation_id, &mut state, true).await {
            Ok(loaded) => {
                if let Some(mark) = loaded.failure {
                    self.executor
                        .store()
                        .clear_failure(&mark.run_id)
                        .await?;
                }
            }
            Err(SessionError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        let handle = RunHandle::fresh(conversation_id);
        tracing::info!(conversation_id, run_id = %handle.run_id, "conversation reset");
        state.handle = Some(handle.clone());
        Ok(handle)
    }

    /// `Running` while an activation holds the conversation, otherwise the
    /// status of the last committed step (`Idle` when nothing was committed).
    pub async fn status(&self, conversation_id: &str) -> Result<RunStatus, SessionError> {
        validate_id(conversation_id)?;
        let Some(slot) = self.slots.existing(conversation_id) else {
            return self
                .settled_status(conversation_id, &mut SlotState::default())
                .await;
        };
        let Ok(mut state) = slot.gate.try_lock() else {
            return Ok(RunStatus::Running);
        };
        self.settled_status(conversation_id, &mut state).await
    }

    /// Committed steps of the conversation's current run.
    pub async fn history(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<CheckpointMetadata>, SessionError> {
        let handle = self.start_or_resume_strict(conversation_id).await?;
        Ok(self.executor.store().history(&handle.run_id).await?)
    }

    async fn start_or_resume_strict(&self, conversation_id: &str) -> Result<RunHandle, SessionError> {
        validate_id(conversation_id)?;
        let slot = self.slots.lease(conversation_id);
        let mut state = slot.gate.lock().await;
        let loaded = self.load(conversation_id, &mut state, true).await?;
        Ok(loaded.run.handle)
    }

    async fn settled_status(
        &self,
        conversation_id: &str,
        state: &mut SlotState,
    ) -> Result<RunStatus, SessionError> {
        match self.load(conversation_id, state, true).await {
            Ok(LoadedRun {
                failure: Some(mark),
                ..
            }) => Ok(RunStatus::Failed {
                reason: mark.reason,
            }),
            Ok(loaded) => Ok(loaded.status),
            Err(SessionError::NotFound(_)) => Ok(RunStatus::Idle),
            Err(err) => Err(err),
        }
    }

    async fn load(
        &self,
        conversation_id: &str,
        state: &mut SlotState,
        strict: bool,
    ) -> Result<LoadedRun, SessionError> {
        let store = self.executor.store();
        let checkpoint = match &state.handle {
            Some(handle) => store.load_latest(&handle.run_id).await?,
            None => store.latest_for_conversation(conversation_id).await?,
        };
        let (run, status) = match checkpoint {
            Some(checkpoint) => ActiveRun::from_checkpoint(checkpoint),
            None => {
                let handle = match &state.handle {
                    Some(handle) => RunHandle::new(conversation_id, handle.run_id.clone()),
                    None if strict => {
                        return Err(SessionError::NotFound(conversation_id.to_string()))
                    }
                    None => RunHandle::fresh(conversation_id),
                };
                tracing::info!(conversation_id, run_id = %handle.run_id, "starting new run");
                let run = ActiveRun::fresh(handle, self.executor.supervisor_id());
                (run, RunStatus::Idle)
            }
        };
        let failure = store.failure(&run.handle.run_id).await?;
        state.handle = Some(run.handle.clone());
        Ok(LoadedRun {
            run,
            status,
            failure,
        })
    }

    async fn continue_run(
        &self,
        conversation_id: &str,
        slot: &RunSlot,
        state: &mut SlotState,
        loaded: Loaded,
    ) -> Result<MessageReply, SessionError> {
        let Loaded { mut run, status } = loaded;
        let settled = matches!(
            status,
            RunStatus::Idle
                | RunStatus::Completed
                | RunStatus::Suspended {
                    reason: SuspendReason::Requested { .. }
                }
        );
        if settled {
            return Ok(MessageReply {
                handle: run.handle,
                status,
                reply: None,
            });
        }
        if let Some((call_id, tool)) = status.awaiting_tool() {
            match self.dispatch_tool(&status, &run.state).await {
                Ok(Some(message)) => run.state.push_message(message),
                Ok(None) => {
                    return Err(SessionError::AwaitingTool {
                        conversation_id: conversation_id.to_string(),
                        call_id: call_id.to_string(),
                        tool: tool.to_string(),
                    })
                }
                Err(err) => return Err(self.record_failure(&run.handle, err).await),
            }
        }
        self.drive(slot, state, run).await
    }

    /// Runs the executor, dispatching tool calls in-process when a tool executor
    /// is configured. The step budget covers the whole activation.
    async fn drive(
        &self,
        slot: &RunSlot,
        state: &mut SlotState,
        mut run: ActiveRun,
    ) -> Result<MessageReply, SessionError> {
        let armed = slot.arm();
        let limit = self.executor.config().max_steps;
        let first_step = run.handle.last_step;
        loop {
            let used = (run.handle.last_step - first_step) as usize;
            if used >= limit {
                let error = GraphError::StepLimitExceeded { limit, steps: used };
                return Err(self.fail_run(state, run.handle, error).await);
            }
            let options = ExecutionOptions {
                max_steps: Some(limit - used),
                ..ExecutionOptions::default()
            };
            let outcome = match self
                .executor
                .run_with_options(run, &options, armed.token())
                .await
            {
                Ok(outcome) => outcome,
                Err(failure) => {
                    let error = match failure.error {
                        GraphError::StepLimitExceeded { steps, .. } => {
                            GraphError::StepLimitExceeded {
                                limit,
                                steps: used + steps,
                            }
                        }
                        other => other,
                    };
                    return Err(self.fail_run(state, failure.handle, error).await);
                }
            };
            state.handle = Some(outcome.handle.clone());

            if armed.token().is_cancelled() {
                return Ok(outcome.into());
            }
            match self.dispatch_tool(&outcome.status, &outcome.state).await {
                Ok(Some(message)) => {
                    run = outcome.into_active();
                    run.state.push_message(message);
                }
                Ok(None) => return Ok(outcome.into()),
                Err(err) => return Err(self.record_failure(&outcome.handle, err).await),
            }
        }
    }

    async fn dispatch_tool(
        &self,
        status: &RunStatus,
        conversation: &ConversationState,
    ) -> Result<Option<Message>, SessionError> {
        let (Some(tools), Some((call_id, tool))) = (&self.tools, status.awaiting_tool()) else {
            return Ok(None);
        };
        let args = conversation
            .pending_tool_call()
            .filter(|call| call.id == call_id)
            .map(|call| call.args.clone())
            .unwrap_or(Value::Null);

        let timeout = self.config.tool_timeout();
        tracing::debug!(tool, call_id, "dispatching tool call");
        let result = match tokio::time::timeout(timeout, tools.invoke(tool, args)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout(timeout)),
        };
        self.tool_message(call_id, tool, result).map(Some)
    }

    async fn fail_run(
        &self,
        state: &mut SlotState,
        handle: RunHandle,
        error: GraphError,
    ) -> SessionError {
        let error = self
            .record_failure(&handle, SessionError::Graph(error))
            .await;
        state.handle = Some(handle);
        error
    }

    /// Writes the failure mark. When the store cannot take it either, the run
    /// stays resumable from its last good checkpoint.
    async fn record_failure(&self, handle: &RunHandle, error: SessionError) -> SessionError {
        tracing::warn!(
            conversation_id = %handle.conversation_id,
            run_id = %handle.run_id,
            last_step = handle.last_step,
            error = %error,
            "run marked failed"
        );
        let mark = FailureMark::new(handle.run_id.clone(), handle.last_step, error.to_string());
        if let Err(err) = self.executor.store().mark_failed(&mark).await {
            tracing::error!(
                run_id = %handle.run_id,
                error = %err,
                "could not persist failure mark"
            );
        }
        error
    }

    fn tool_message(
        &self,
        call_id: &str,
        tool: &str,
        result: Result<Value, ToolError>,
    ) -> Result<Message, SessionError> {
        match result {
            Ok(Value::String(text)) => Ok(Message::tool_result(call_id, text)),
            Ok(value) => Ok(Message::tool_result(call_id, value.to_string())),
            Err(source) if self.config.is_critical(tool) => Err(SessionError::Tool {
                tool: tool.to_string(),
                source,
            }),
            Err(err) => {
                tracing::warn!(tool, call_id, error = %err, "tool failed, reporting to agent");
                Ok(Message::tool_result(call_id, format!("error: {err}")))
            }
        }
    }
}

fn validate_id(conversation_id: &str) -> Result<(), SessionError> {
    if conversation_id.trim().is_empty() {
        return Err(SessionError::InvalidRequest(
            "conversation id is empty".to_string(),
        ));
    }
    Ok(())
}

/// A run as found in the store, with its failure mark if any.
struct LoadedRun {
    run: ActiveRun,
    status: RunStatus,
    failure: Option<FailureMark>,
}

impl LoadedRun {
    fn runnable(self, conversation_id: &str) -> Result<Loaded, SessionError> {
        match self.failure {
            Some(mark) => Err(SessionError::RunFailed {
                conversation_id: conversation_id.to_string(),
                reason: mark.reason,
            }),
            None => Ok(Loaded {
                run: self.run,
                status: self.status,
            }),
        }
    }
}

/// A run cleared to continue.
struct Loaded {
    run: ActiveRun,
    status: RunStatus,
}
