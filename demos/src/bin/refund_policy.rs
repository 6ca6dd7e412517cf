use std::sync::Arc;

use async_trait::async_trait;
use ragline_core::{
    Document, Embedding, LlmRequest, LlmResponse, RaglineError, Role, Tool, ToolCallingLlm,
    ToolError, ToolRegistry, Value, VectorStore,
};
use ragline_graph::{GraphBuilder, RetrievalResponderNode, RuleSupervisor, ToolCallNode};
use ragline_retrieval::{HashEmbedder, InMemoryVectorStore, Retriever};
use ragline_session::{ServiceConfig, SessionManager};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Offline stand-in for a chat model: quotes the best context line, or the
/// latest tool result when there is one.
struct ExtractiveLlm;

#[async_trait]
impl ToolCallingLlm for ExtractiveLlm {
    async fn invoke(&self, request: LlmRequest) -> Result<LlmResponse, RaglineError> {
        let last = request.messages.last();
        let content = match last {
            Some(message) if message.role == Role::Tool => {
                format!("Here is what I found about your order: {}", message.content)
            }
            _ => request
                .messages
                .iter()
                .find(|message| message.role == Role::System)
                .and_then(|system| {
                    system
                        .content
                        .lines()
                        .find(|line| line.starts_with("[1]"))
                        .map(|line| format!("According to our policy: {line}"))
                })
                .unwrap_or_else(|| "I could not find that in our documents.".to_string()),
        };
        Ok(LlmResponse {
            content,
            tool_calls: Vec::new(),
        })
    }
}

struct OrderLookup;

#[async_trait]
impl Tool for OrderLookup {
    fn name(&self) -> &str {
        "lookup_order"
    }

    fn description(&self) -> &str {
        "Finds an order by id"
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {"order_id": {"type": "string"}}})
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let order_id = args["order_id"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput("order_id is required".to_string()))?;
        Ok(json!({"order_id": order_id, "purchased_days_ago": 12, "refundable": true}))
    }
}

async fn policy_retriever() -> anyhow::Result<Retriever> {
    let embedder = Arc::new(HashEmbedder::new(128));
    let index = Arc::new(InMemoryVectorStore::new());
    let policies = [
        ("refunds", "Refunds are accepted within 30 days of purchase with a receipt."),
        ("shipping", "Orders ship within two business days of payment."),
        ("exchanges", "Exchanges for a different size are free within 60 days."),
    ];
    let mut docs = Vec::with_capacity(policies.len());
    for (id, text) in policies {
        let embedding = embedder.embed(text).await?;
        docs.push(Document::new(id, text).with_embedding(embedding));
    }
    index.add(docs).await?;
    tracing::info!(documents = policies.len(), "indexed policy documents");
    Ok(Retriever::new(embedder, index))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ServiceConfig::from_env()?;
    tracing::info!(
        mode = config.retrieval.mode.name(),
        top_k = config.retrieval.top_k,
        "loaded service config"
    );
    let responder = RetrievalResponderNode::builder()
        .llm(Arc::new(ExtractiveLlm))
        .retriever(Arc::new(policy_retriever().await?))
        .model("extractive")
        .search(config.retrieval.search_request())
        .build()?;
    let orders = ToolCallNode::new("lookup_order").with_args(|state| {
        let order_id = state
            .latest_user_message()
            .and_then(|message| {
                message
                    .content
                    .split_whitespace()
                    .find(|word| word.starts_with("A-"))
                    .map(|word| word.trim_end_matches(|c: char| !c.is_alphanumeric()).to_string())
            })
            .unwrap_or_default();
        json!({ "order_id": order_id })
    });

    let sessions = SessionManager::builder()
        .config(config)
        .graph(
            GraphBuilder::new()
                .supervisor(
                    RuleSupervisor::new("responder")
                        .route_when(&["order"], "orders")
                        .after_tool("responder"),
                )
                .add_node("responder", responder)
                .add_node("orders", orders),
        )
        .tool_executor(Arc::new(ToolRegistry::new().register(Arc::new(OrderLookup))))
        .build()?;

    for question in [
        "What is the refund policy?",
        "Can I still return order A-17?",
    ] {
        let reply = sessions.handle_message("demo", question).await?;
        tracing::info!(
            run_id = %reply.handle.run_id,
            step = reply.handle.last_step,
            status = ?reply.status,
            "activation finished"
        );
        println!("user: {question}");
        println!(
            "assistant (step {}): {}",
            reply.handle.last_step,
            reply.reply.unwrap_or_default()
        );
    }

    for meta in sessions.history("demo").await? {
        println!("step {} -> {} ({:?})", meta.step, meta.next_node, meta.status);
    }
    Ok(())
}
