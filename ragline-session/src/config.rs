use std::time::Duration;

use ragline_core::RetryPolicy;
use ragline_graph::ExecutionConfig;
use ragline_retrieval::{SearchMode, SearchRequest};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Retrieval defaults applied to responder nodes built from configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub mode: SearchMode,
    pub score_threshold: Option<f32>,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 4,
            mode: SearchMode::Hybrid { alpha: 0.5 },
            score_threshold: None,
        }
    }
}

impl RetrievalSettings {
    pub fn search_request(&self) -> SearchRequest {
        let request = SearchRequest::new(self.top_k).with_mode(self.mode);
        match self.score_threshold {
            Some(threshold) => request.with_score_threshold(threshold),
            None => request,
        }
    }
}

/// Service-wide settings, loaded once at startup and shared read-only.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub execution: ExecutionConfig,
    pub store_retry: RetryPolicy,
    pub retrieval: RetrievalSettings,
    pub tool_timeout_ms: u64,
    /// Tools whose failure fails the run instead of being reported back to the agent.
    pub critical_tools: Vec<String>,
    /// Treat an unknown conversation as an error instead of starting a new run.
    pub strict_resume: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            store_retry: RetryPolicy::default(),
            retrieval: RetrievalSettings::default(),
            tool_timeout_ms: 30_000,
            critical_tools: Vec::new(),
            strict_resume: false,
        }
    }
}

impl ServiceConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn is_critical(&self, tool: &str) -> bool {
        self.critical_tools.iter().any(|name| name == tool)
    }

    /// Defaults overridden by `RAGLINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = Lookup(&lookup);

        if let Some(value) = env.parse("RAGLINE_MAX_STEPS")? {
            config.execution.max_steps = value;
        }
        if let Some(value) = env.parse("RAGLINE_NODE_TIMEOUT_MS")? {
            config.execution.node_timeout_ms = value;
        }
        if let Some(value) = env.parse("RAGLINE_NODE_RETRY_ATTEMPTS")? {
            config.execution.node_retry.max_attempts = value;
        }
        if let Some(value) = env.raw("RAGLINE_SUPERVISOR_ID") {
            config.execution.supervisor_id = value;
        }
        if let Some(value) = env.parse("RAGLINE_STORE_RETRY_ATTEMPTS")? {
            config.store_retry.max_attempts = value;
        }
        if let Some(value) = env.parse("RAGLINE_STORE_BACKOFF_MS")? {
            config.store_retry.initial_backoff_ms = value;
        }
        if let Some(value) = env.parse("RAGLINE_TOP_K")? {
            config.retrieval.top_k = value;
        }
        if let Some(mode) = env.raw("RAGLINE_SEARCH_MODE") {
            config.retrieval.mode = match mode.as_str() {
                "dense" => SearchMode::Dense,
                "sparse" => SearchMode::Sparse,
                "hybrid" => SearchMode::Hybrid {
                    alpha: env.parse("RAGLINE_SEARCH_ALPHA")?.unwrap_or(0.5),
                },
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "RAGLINE_SEARCH_MODE".to_string(),
                        value: mode,
                    })
                }
            };
        } else if let Some(alpha) = env.parse("RAGLINE_SEARCH_ALPHA")? {
            config.retrieval.mode = SearchMode::Hybrid { alpha };
        }
        if let Some(value) = env.parse("RAGLINE_SCORE_THRESHOLD")? {
            config.retrieval.score_threshold = Some(value);
        }
        if let Some(value) = env.parse("RAGLINE_TOOL_TIMEOUT_MS")? {
            config.tool_timeout_ms = value;
        }
        if let Some(value) = env.raw("RAGLINE_CRITICAL_TOOLS") {
            config.critical_tools = value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = env.parse("RAGLINE_STRICT_RESUME")? {
            config.strict_resume = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.max_steps == 0 {
            return Err(ConfigError::Invalid("max_steps must be positive".to_string()));
        }
        if self.execution.supervisor_id.is_empty() {
            return Err(ConfigError::Invalid("supervisor_id must not be empty".to_string()));
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::Invalid("retrieval top_k must be positive".to_string()));
        }
        if let SearchMode::Hybrid { alpha } = self.retrieval.mode {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(ConfigError::Invalid(format!(
                    "hybrid alpha must be within [0, 1], got {alpha}"
                )));
            }
        }
        Ok(())
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.raw(key) {
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value,
                }),
            None => Ok(None),
        }
    }
}
