use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ragline_checkpoint_sqlite::SqliteCheckpointStore;
use ragline_core::{LlmRequest, LlmResponse, RaglineError, ToolCall, ToolCallingLlm};
use ragline_graph::{GraphBuilder, RetrievalResponderNode, RuleSupervisor};
use ragline_retrieval::{HashEmbedder, InMemoryVectorStore, Retriever};
use ragline_session::{ServiceConfig, SessionManager};
use serde_json::json;
use tracing_subscriber::EnvFilter;

struct CannedLlm {
    replies: Mutex<VecDeque<LlmResponse>>,
}

impl CannedLlm {
    fn new(replies: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
        })
    }
}

#[async_trait]
impl ToolCallingLlm for CannedLlm {
    async fn invoke(&self, _request: LlmRequest) -> Result<LlmResponse, RaglineError> {
        self.replies
            .lock()
            .map_err(|_| RaglineError::Custom("poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| RaglineError::LlmProvider("no canned reply left".to_string()))
    }
}

async fn sessions(
    store: Arc<SqliteCheckpointStore>,
    llm: Arc<CannedLlm>,
) -> anyhow::Result<SessionManager> {
    let retriever = Retriever::new(
        Arc::new(HashEmbedder::new(64)),
        Arc::new(InMemoryVectorStore::new()),
    );
    let responder = RetrievalResponderNode::builder()
        .llm(llm)
        .retriever(Arc::new(retriever))
        .model("canned")
        .build()?;
    Ok(SessionManager::builder()
        .config(ServiceConfig::from_env()?)
        .graph(
            GraphBuilder::new()
                .supervisor(RuleSupervisor::new("responder"))
                .add_node("responder", responder)
                .with_checkpoint_store(store),
        )
        .build()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::var("RAGLINE_DEMO_DB").unwrap_or_else(|_| {
        format!(
            "sqlite://{}",
            std::env::temp_dir().join("ragline-demo.db").display()
        )
    });
    let store = Arc::new(
        SqliteCheckpointStore::builder(url.as_str())
            .create_if_missing(true)
            .build()
            .await?,
    );
    tracing::info!(url = %url, "opened checkpoint store");

    let before = sessions(
        store.clone(),
        CannedLlm::new(vec![LlmResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "call".to_string(),
                name: "lookup_order".to_string(),
                args: json!({"order_id": "A-17"}),
            }],
        }]),
    )
    .await?;
    let conversation = format!("durable-{}", std::process::id());
    let suspended = before
        .handle_message(&conversation, "Can I return order A-17?")
        .await?;
    let (call_id, tool) = suspended
        .status
        .awaiting_tool()
        .map(|(call_id, tool)| (call_id.to_string(), tool.to_string()))
        .ok_or_else(|| anyhow::anyhow!("expected a tool suspension, got {:?}", suspended.status))?;
    println!("suspended at step {} waiting for {tool} ({call_id})", suspended.handle.last_step);
    drop(before);
    tracing::info!(conversation = %conversation, "manager dropped, restarting");

    let after = sessions(
        store,
        CannedLlm::new(vec![LlmResponse {
            content: "Order A-17 is within the 30 day window and can be refunded.".to_string(),
            tool_calls: Vec::new(),
        }]),
    )
    .await?;
    let done = after
        .submit_tool_result(&conversation, &call_id, Ok(json!({"purchased_days_ago": 12})))
        .await?;
    println!(
        "resumed after restart, step {}: {}",
        done.handle.last_step,
        done.reply.unwrap_or_default()
    );
    Ok(())
}
