//! Supervised multi-agent RAG engine.
//!
//! Each member crate is re-exported under a short module name and gated by the
//! feature of the same name. `prelude` collects the types a typical service
//! touches when wiring a graph behind a [`SessionManager`](session::SessionManager).

pub use ragline_core as core;

#[cfg(feature = "graph")]
pub use ragline_graph as graph;

#[cfg(feature = "retrieval")]
pub use ragline_retrieval as retrieval;

#[cfg(feature = "session")]
pub use ragline_session as session;

#[cfg(feature = "sqlite")]
pub use ragline_checkpoint_sqlite as sqlite;

pub mod prelude {
    pub use ragline_core::{
        CheckpointStore, ConversationState, Document, Embedding, InMemoryCheckpointStore,
        Message, RetryPolicy, RunStatus, SuspendReason, Tool, ToolCallingLlm, ToolError,
        ToolRegistry, Value, VectorStore,
    };

    #[cfg(feature = "graph")]
    pub use ragline_graph::{
        AgentNode, ExecutionConfig, GraphBuilder, LlmSupervisor, NodeContext, NodeError,
        NodeOutput, NodeUpdate, RetrievalResponderNode, RuleSupervisor, ToolCallNode,
    };

    #[cfg(feature = "retrieval")]
    pub use ragline_retrieval::{
        BaseRetriever, HashEmbedder, InMemoryVectorStore, Retriever, SearchMode, SearchRequest,
    };

    #[cfg(feature = "session")]
    pub use ragline_session::{
        ErrorKind, MessageReply, MessageRequest, ServiceConfig, SessionError, SessionManager,
    };

    #[cfg(feature = "sqlite")]
    pub use ragline_checkpoint_sqlite::SqliteCheckpointStore;
}
