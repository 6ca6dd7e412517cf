use std::time::Duration;

use ragline_core::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::node::SUPERVISOR;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Steps one activation may run before the run is failed.
    pub max_steps: usize,
    pub node_timeout_ms: u64,
    pub node_retry: RetryPolicy,
    pub supervisor_id: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            node_timeout_ms: 30_000,
            node_retry: RetryPolicy::default().with_max_attempts(2),
            supervisor_id: SUPERVISOR.to_string(),
        }
    }
}

impl ExecutionConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn merge(&self, overrides: &ExecutionOptions) -> Self {
        Self {
            max_steps: overrides.max_steps.unwrap_or(self.max_steps),
            node_timeout_ms: overrides
                .node_timeout
                .map(|timeout| timeout.as_millis() as u64)
                .unwrap_or(self.node_timeout_ms),
            node_retry: overrides
                .node_retry
                .clone()
                .unwrap_or_else(|| self.node_retry.clone()),
            supervisor_id: self.supervisor_id.clone(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionOptions {
    pub max_steps: Option<usize>,
    pub node_timeout: Option<Duration>,
    pub node_retry: Option<RetryPolicy>,
}
