use ragline_core::RunStatus;

/// In-process hooks fired by the executor. Every method defaults to a no-op.
pub trait Observer: Send + Sync {
    fn on_node_enter(&self, _node: &str, _step: u64) {}
    fn on_node_exit(&self, _node: &str, _step: u64) {}
    fn on_error(&self, _node: &str, _error: &str) {}
    fn on_checkpoint_saved(&self, _run_id: &str, _step: u64) {}
    fn on_status(&self, _run_id: &str, _status: &RunStatus) {}
}
