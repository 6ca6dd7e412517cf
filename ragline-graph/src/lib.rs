//! Supervised agent graph: nodes, the step executor and checkpoint backends.

mod config;
mod error;
mod executor;
mod file_checkpointer;
mod node;
mod observer;
mod registry;
mod responder;
mod run;
mod supervisor;
mod tool_node;
pub mod transition;

pub use config::{ExecutionConfig, ExecutionOptions};
pub use error::{GraphError, NodeError};
pub use executor::{GraphBuilder, GraphExecutor, RunFailure};
pub use file_checkpointer::FileCheckpointStore;
pub use node::{scratch_keys, AgentNode, NodeContext, NodeOutput, NodeUpdate, SUPERVISOR};
pub use observer::Observer;
pub use registry::{NodeRegistry, RegisteredNode};
pub use responder::{RetrievalFallback, RetrievalResponderNode, RetrievalResponderNodeBuilder};
pub use run::{ActiveRun, RunHandle, RunOutcome};
pub use supervisor::{LlmSupervisor, RuleSupervisor, SupervisorRule};
pub use tool_node::ToolCallNode;
