mod base_retriever;
mod chunk;
mod error;
mod hash_embedder;
mod in_memory;
mod mode;
mod retriever;

pub use base_retriever::BaseRetriever;
pub use chunk::{rank_chunks, RetrievedChunk};
pub use error::RetrievalError;
pub use hash_embedder::HashEmbedder;
pub use in_memory::InMemoryVectorStore;
pub use mode::{keyword_score, SearchMode};
pub use retriever::{Retriever, SearchRequest, FILE_ID_METADATA_KEY};
