mod checkpoint;
mod document;
mod embedding;
mod error;
mod llm;
mod metadata_filter;
mod retry;
mod state;
mod tool;
mod value;
mod vector_store;

pub use checkpoint::{
    Checkpoint, CheckpointMetadata, CheckpointStore, FailureMark, InMemoryCheckpointStore,
    RunStatus, SuspendReason, WriteDecision,
};
pub use document::Document;
pub use embedding::Embedding;
pub use error::{EmbeddingError, IndexError, RaglineError, StoreError};
pub use llm::{LlmRequest, LlmResponse, Message, Role, ToolCall, ToolCallingLlm, ToolSpec};
pub use metadata_filter::MetadataFilter;
pub use retry::{retry_with_backoff, Exhausted, RetryPolicy, RetryingStore};
pub use state::ConversationState;
pub use tool::{Tool, ToolError, ToolExecutor, ToolRegistry};
pub use value::Value;
pub use vector_store::{SearchResult, VectorStore};
