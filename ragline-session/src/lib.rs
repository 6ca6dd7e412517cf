//! Conversation sessions over the agent graph.

mod config;
mod error;
mod manager;
mod slot;

pub use config::{RetrievalSettings, ServiceConfig};
pub use error::{ConfigError, ErrorKind, SessionError};
pub use manager::{MessageReply, MessageRequest, SessionManager, SessionManagerBuilder};
