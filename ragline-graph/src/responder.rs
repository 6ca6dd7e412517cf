use std::sync::Arc;

use async_trait::async_trait;
use ragline_core::{ConversationState, LlmRequest, Message, ToolCallingLlm, ToolSpec};
use ragline_retrieval::{BaseRetriever, RetrievedChunk, SearchRequest};
use serde_json::json;

use crate::node::scratch_keys::{RETRIEVAL_DEGRADED, RETRIEVED_CHUNKS, UPLOADED_FILES};
use crate::{AgentNode, GraphError, NodeContext, NodeError, NodeOutput, NodeUpdate};

const DEFAULT_SYSTEM_PROMPT: &str = "You answer questions using the provided context. \
If the context does not contain the answer, say so.";

/// What the responder does when the retrieval backend is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrievalFallback {
    /// Answer without context and record the outage in scratch.
    #[default]
    Degrade,
    /// Fail the invocation with a recoverable error.
    Propagate,
}

/// Retrieves context for the latest user message and asks the model to answer.
pub struct RetrievalResponderNode {
    llm: Arc<dyn ToolCallingLlm>,
    retriever: Arc<dyn BaseRetriever>,
    model: String,
    system_prompt: String,
    request: SearchRequest,
    tools: Vec<ToolSpec>,
    fallback: RetrievalFallback,
}

pub struct RetrievalResponderNodeBuilder {
    llm: Option<Arc<dyn ToolCallingLlm>>,
    retriever: Option<Arc<dyn BaseRetriever>>,
    model: String,
    system_prompt: String,
    request: SearchRequest,
    tools: Vec<ToolSpec>,
    fallback: RetrievalFallback,
}

impl RetrievalResponderNode {
    pub fn builder() -> RetrievalResponderNodeBuilder {
        RetrievalResponderNodeBuilder {
            llm: None,
            retriever: None,
            model: String::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            request: SearchRequest::new(4),
            tools: Vec::new(),
            fallback: RetrievalFallback::default(),
        }
    }

    fn context_prompt(&self, chunks: &[RetrievedChunk]) -> String {
        if chunks.is_empty() {
            return format!("{}\n\nNo supporting documents were found.", self.system_prompt);
        }
        let mut prompt = format!("{}\n\nContext:", self.system_prompt);
        for (idx, chunk) in chunks.iter().enumerate() {
            prompt.push_str(&format!("\n[{}] ({}) {}", idx + 1, chunk.document_id, chunk.text));
        }
        prompt
    }
}

impl RetrievalResponderNodeBuilder {
    pub fn llm(mut self, llm: Arc<dyn ToolCallingLlm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn retriever(mut self, retriever: Arc<dyn BaseRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Base search parameters; the file scope is filled in per turn from scratch.
    pub fn search(mut self, request: SearchRequest) -> Self {
        self.request = request;
        self
    }

    pub fn tool(mut self, spec: ToolSpec) -> Self {
        self.tools.push(spec);
        self
    }

    pub fn tools(mut self, specs: Vec<ToolSpec>) -> Self {
        self.tools.extend(specs);
        self
    }

    pub fn fallback(mut self, fallback: RetrievalFallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn build(self) -> Result<RetrievalResponderNode, GraphError> {
        let llm = self
            .llm
            .ok_or_else(|| GraphError::InvalidGraph("responder requires an llm".to_string()))?;
        let retriever = self.retriever.ok_or_else(|| {
            GraphError::InvalidGraph("responder requires a retriever".to_string())
        })?;
        Ok(RetrievalResponderNode {
            llm,
            retriever,
            model: self.model,
            system_prompt: self.system_prompt,
            request: self.request,
            tools: self.tools,
            fallback: self.fallback,
        })
    }
}

#[async_trait]
impl AgentNode for RetrievalResponderNode {
    async fn execute(
        &self,
        state: &ConversationState,
        ctx: &NodeContext,
    ) -> Result<NodeUpdate, NodeError> {
        let query = state
            .latest_user_message()
            .map(|message| message.content.clone())
            .ok_or_else(|| NodeError::Recoverable("no user message to answer".to_string()))?;

        let mut request = self.request.clone();
        if let Some(files) = state.scratch_as::<Vec<String>>(UPLOADED_FILES) {
            request = request.with_file_scope(files);
        }

        let mut degraded = None;
        let chunks = match self.retriever.search(&query, &request).await {
            Ok(chunks) => chunks,
            Err(err) if err.is_unavailable() && self.fallback == RetrievalFallback::Degrade => {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    step = ctx.step,
                    error = %err,
                    "retrieval unavailable, answering without context"
                );
                degraded = Some(err.to_string());
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(
            run_id = %ctx.run_id,
            chunks = chunks.len(),
            mode = request.mode.name(),
            "retrieved context"
        );

        let mut messages = vec![Message::system(self.context_prompt(&chunks))];
        messages.extend(state.messages.iter().cloned());
        let response = self
            .llm
            .invoke(LlmRequest {
                model: self.model.clone(),
                messages,
                tools: self.tools.clone(),
                temperature: Some(0.0),
            })
            .await?;

        if response.tool_calls.len() > 1 {
            tracing::debug!(
                calls = response.tool_calls.len(),
                "model requested several tools; only the first is dispatched"
            );
        }
        let output = match response.tool_calls.into_iter().next() {
            Some(call) => NodeOutput::invoke(call.name, call.args),
            None => NodeOutput::respond(response.content),
        };

        let mut update =
            NodeUpdate::new(output).with_scratch(RETRIEVED_CHUNKS, serde_json::to_value(&chunks)?);
        if let Some(reason) = degraded {
            update = update.with_scratch(RETRIEVAL_DEGRADED, json!(reason));
        }
        Ok(update)
    }
}
