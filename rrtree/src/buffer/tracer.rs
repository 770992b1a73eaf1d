//! Audit hooks for entries passing through the update path.

use std::fmt::Debug;

use log::trace;

/// Receives one call per buffered operation the piggybacker classifies.
pub trait ObjectTracer: Send + Sync {
    fn trace_update_tree_entry(&self, entry: &dyn Debug, operation_tag: &str, extra: &str);
}

/// Discards every trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl ObjectTracer for NoopTracer {
    fn trace_update_tree_entry(&self, _entry: &dyn Debug, _operation_tag: &str, _extra: &str) {}
}

/// Forwards traces to the `log` facade at trace level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

impl ObjectTracer for LogTracer {
    fn trace_update_tree_entry(&self, entry: &dyn Debug, operation_tag: &str, extra: &str) {
        trace!("[{}] {:?} {}", operation_tag, entry, extra);
    }
}
