use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ragline_core::{
    retry_with_backoff, Checkpoint, CheckpointStore, InMemoryCheckpointStore, RetryPolicy,
    RetryingStore, RunStatus, SuspendReason,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::transition::{absorb_failure, apply_update, StepFrame, Transition};
use crate::{
    ActiveRun, AgentNode, ExecutionConfig, ExecutionOptions, GraphError, NodeContext, NodeError,
    NodeOutput, NodeRegistry, NodeUpdate, Observer, RegisteredNode, RunHandle, RunOutcome,
};

/// An activation that stopped on an error. `handle.last_step` is the last
/// step that was durably committed.
#[derive(Debug)]
pub struct RunFailure {
    pub handle: RunHandle,
    pub error: GraphError,
}

impl RunFailure {
    pub fn status(&self) -> RunStatus {
        RunStatus::Failed {
            reason: self.error.to_string(),
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run '{}' failed after step {}: {}",
            self.handle.run_id, self.handle.last_step, self.error
        )
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Drives runs through the node graph one committed step at a time.
///
/// A step consults the supervisor when control sits with it, invokes the chosen
/// node, applies its output and checkpoints the result. Nothing a step produced
/// is visible until its checkpoint is written.
pub struct GraphExecutor {
    registry: NodeRegistry,
    store: Arc<dyn CheckpointStore>,
    config: ExecutionConfig,
    observer: Option<Arc<dyn Observer>>,
}

pub struct GraphBuilder {
    supervisor: Option<RegisteredNode>,
    nodes: Vec<(String, RegisteredNode)>,
    store: Option<Arc<dyn CheckpointStore>>,
    store_retry: RetryPolicy,
    config: ExecutionConfig,
    observer: Option<Arc<dyn Observer>>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            supervisor: None,
            nodes: Vec::new(),
            store: None,
            store_retry: RetryPolicy::default(),
            config: ExecutionConfig::default(),
            observer: None,
        }
    }

    pub fn supervisor(mut self, node: impl Into<RegisteredNode>) -> Self {
        self.supervisor = Some(node.into());
        self
    }

    pub fn add_node(mut self, id: &str, node: impl Into<RegisteredNode>) -> Self {
        self.nodes.push((id.to_string(), node.into()));
        self
    }

    pub fn add_agent(self, id: &str, node: Arc<dyn AgentNode>) -> Self {
        self.add_node(id, RegisteredNode::Custom(node))
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Backoff applied to transient store failures before a step is aborted.
    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    pub fn with_default_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<GraphExecutor, GraphError> {
        let supervisor_id = self.config.supervisor_id.clone();
        if supervisor_id.is_empty() {
            return Err(GraphError::InvalidGraph("supervisor id is empty".to_string()));
        }
        if self.config.max_steps == 0 {
            return Err(GraphError::InvalidGraph("max_steps must be positive".to_string()));
        }
        let supervisor = self
            .supervisor
            .ok_or_else(|| GraphError::InvalidGraph("a supervisor node is required".to_string()))?;

        let mut registry = NodeRegistry::default();
        registry.insert(supervisor_id.clone(), supervisor);
        for (id, node) in self.nodes {
            if id.is_empty() {
                return Err(GraphError::InvalidGraph("node id is empty".to_string()));
            }
            if registry.insert(id.clone(), node).is_some() {
                return Err(GraphError::InvalidGraph(format!("duplicate node id '{id}'")));
            }
        }

        for (id, node) in registry.iter() {
            for target in node.routes() {
                if !registry.contains(&target) {
                    return Err(GraphError::InvalidGraph(format!(
                        "node '{id}' routes to unknown node '{target}'"
                    )));
                }
                if id == supervisor_id && target == supervisor_id {
                    return Err(GraphError::InvalidGraph(
                        "supervisor cannot route to itself".to_string(),
                    ));
                }
            }
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new()));
        let store: Arc<dyn CheckpointStore> = Arc::new(RetryingStore::new(store, self.store_retry));

        tracing::debug!(
            nodes = ?registry.ids().collect::<Vec<_>>(),
            supervisor = %supervisor_id,
            "graph built"
        );
        Ok(GraphExecutor {
            registry,
            store,
            config: self.config,
            observer: self.observer,
        })
    }
}

impl GraphExecutor {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn supervisor_id(&self) -> &str {
        &self.config.supervisor_id
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// The checkpoint store, already wrapped with the store retry policy.
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub async fn run(
        &self,
        run: ActiveRun,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunFailure> {
        self.run_with_options(run, &ExecutionOptions::default(), cancel)
            .await
    }

    /// Runs steps until the run completes, suspends, is cancelled or fails.
    pub async fn run_with_options(
        &self,
        run: ActiveRun,
        options: &ExecutionOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunFailure> {
        let config = self.config.merge(options);
        let span = tracing::info_span!(
            "graph_run",
            run_id = %run.handle.run_id,
            conversation_id = %run.handle.conversation_id
        );
        self.drive(run, &config, cancel).instrument(span).await
    }

    async fn drive(
        &self,
        mut run: ActiveRun,
        config: &ExecutionConfig,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunFailure> {
        self.emit_status(&run.handle.run_id, &RunStatus::Running);
        let mut steps = 0usize;
        loop {
            if cancel.is_cancelled() {
                tracing::info!(step = run.handle.last_step, "run cancelled between steps");
                let status = RunStatus::Suspended {
                    reason: SuspendReason::Cancelled,
                };
                self.emit_status(&run.handle.run_id, &status);
                return Ok(RunOutcome {
                    handle: run.handle,
                    status,
                    reply: None,
                    state: run.state,
                    next_node: run.next_node,
                });
            }
            if steps >= config.max_steps {
                let error = GraphError::StepLimitExceeded {
                    limit: config.max_steps,
                    steps,
                };
                return Err(self.fail(run.handle, error));
            }

            let step = run.handle.last_step + 1;
            let transition = match self.step(&run, step, config, cancel).await {
                Ok(transition) => transition,
                Err(error) => return Err(self.fail(run.handle, error)),
            };

            let checkpoint = Checkpoint::new(
                &run.handle.run_id,
                &run.handle.conversation_id,
                transition.state.clone(),
                transition.next_node.clone(),
                transition.status.clone(),
            );
            if let Err(err) = self.store.save(&checkpoint).await {
                tracing::error!(step, error = %err, "checkpoint failed, discarding step");
                return Err(self.fail(run.handle, GraphError::Store(err)));
            }
            self.emit(|observer| observer.on_checkpoint_saved(&run.handle.run_id, step));
            tracing::debug!(step, next_node = %transition.next_node, "step committed");

            steps += 1;
            run.handle.last_step = step;
            run.state = transition.state;
            run.next_node = transition.next_node;
            if transition.status != RunStatus::Running {
                self.emit_status(&run.handle.run_id, &transition.status);
                return Ok(RunOutcome {
                    handle: run.handle,
                    status: transition.status,
                    reply: transition.reply,
                    state: run.state,
                    next_node: run.next_node,
                });
            }
        }
    }

    async fn step(
        &self,
        run: &ActiveRun,
        step: u64,
        config: &ExecutionConfig,
        cancel: &CancellationToken,
    ) -> Result<Transition, GraphError> {
        let supervisor_id = config.supervisor_id.as_str();
        let frame = StepFrame {
            run_id: &run.handle.run_id,
            step,
            supervisor_id,
            cancelled: false,
        };

        let mut carried = BTreeMap::new();
        let node_id = if run.next_node == supervisor_id {
            match self.invoke(supervisor_id, run, step, config).await? {
                Ok(NodeUpdate {
                    output: NodeOutput::Route { target },
                    scratch,
                }) => {
                    self.check_route(supervisor_id, &target, supervisor_id)?;
                    carried = scratch;
                    target
                }
                Ok(update) => {
                    let frame = StepFrame {
                        cancelled: cancel.is_cancelled(),
                        ..frame
                    };
                    return Ok(apply_update(&run.state, frame, update));
                }
                Err(error) => return self.recover(run, frame, cancel, supervisor_id, error),
            }
        } else {
            run.next_node.clone()
        };

        match self.invoke(&node_id, run, step, config).await? {
            Ok(mut update) => {
                if let NodeOutput::Route { target } = &update.output {
                    self.check_route(&node_id, target, supervisor_id)?;
                }
                if !carried.is_empty() {
                    carried.append(&mut update.scratch);
                    update.scratch = carried;
                }
                let frame = StepFrame {
                    cancelled: cancel.is_cancelled(),
                    ..frame
                };
                Ok(apply_update(&run.state, frame, update))
            }
            Err(error) => self.recover(run, frame, cancel, &node_id, error),
        }
    }

    async fn invoke(
        &self,
        node_id: &str,
        run: &ActiveRun,
        step: u64,
        config: &ExecutionConfig,
    ) -> Result<Result<NodeUpdate, NodeError>, GraphError> {
        let node = self
            .registry
            .get(node_id)
            .ok_or_else(|| GraphError::UnknownNode {
                node: node_id.to_string(),
            })?;
        self.emit(|observer| observer.on_node_enter(node_id, step));
        tracing::debug!(node = node_id, step, kind = node.kind(), "invoking node");

        let timeout = config.node_timeout();
        let mut attempt = 0u32;
        let result = retry_with_backoff(
            &config.node_retry,
            node_id,
            NodeError::is_recoverable,
            || {
                attempt += 1;
                let ctx = NodeContext {
                    run_id: run.handle.run_id.clone(),
                    conversation_id: run.handle.conversation_id.clone(),
                    node_id: node_id.to_string(),
                    step,
                    attempt,
                };
                let state = &run.state;
                async move {
                    match tokio::time::timeout(timeout, node.execute(state, &ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(NodeError::Timeout(timeout)),
                    }
                }
            },
        )
        .await
        .map_err(|exhausted| exhausted.error);

        self.emit(|observer| observer.on_node_exit(node_id, step));
        Ok(result)
    }

    fn check_route(&self, from: &str, to: &str, supervisor_id: &str) -> Result<(), GraphError> {
        if !self.registry.contains(to) {
            return Err(GraphError::UnknownNode {
                node: to.to_string(),
            });
        }
        if from == supervisor_id && to == supervisor_id {
            return Err(GraphError::InvalidRoute {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    fn recover(
        &self,
        run: &ActiveRun,
        frame: StepFrame<'_>,
        cancel: &CancellationToken,
        node_id: &str,
        error: NodeError,
    ) -> Result<Transition, GraphError> {
        self.emit(|observer| observer.on_error(node_id, &error.to_string()));
        if !error.is_recoverable() {
            return Err(GraphError::NodeFailed {
                node: node_id.to_string(),
                source: error,
            });
        }
        tracing::warn!(node = node_id, error = %error, "node failed, returning control to supervisor");
        let frame = StepFrame {
            cancelled: cancel.is_cancelled(),
            ..frame
        };
        Ok(absorb_failure(&run.state, frame, node_id, &error))
    }

    fn fail(&self, handle: RunHandle, error: GraphError) -> RunFailure {
        tracing::error!(
            run_id = %handle.run_id,
            last_step = handle.last_step,
            error = %error,
            "run failed"
        );
        let failure = RunFailure { handle, error };
        self.emit_status(&failure.handle.run_id, &failure.status());
        failure
    }

    fn emit(&self, notify: impl FnOnce(&dyn Observer)) {
        if let Some(observer) = &self.observer {
            notify(observer.as_ref());
        }
    }

    fn emit_status(&self, run_id: &str, status: &RunStatus) {
        self.emit(|observer| observer.on_status(run_id, status));
    }
}
