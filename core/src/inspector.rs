//! Read-only view of the agent for a local status consumer.
//!
//! The engine publishes a fresh report after every heartbeat attempt; sinks
//! must never mutate agent state and should return quickly.

use serde::Serialize;

use crate::heartbeat::HeartbeatStatus;
use crate::protocol::CallbackSnapshot;
use crate::shell::ShellDescriptor;

#[derive(Debug, Clone, Serialize)]
pub struct InspectorReport {
    #[serde(flatten)]
    pub status: HeartbeatStatus,
    pub processes: Vec<ShellDescriptor>,
    pub pending_callbacks: CallbackSnapshot,
}

pub trait InspectorSink: Send + Sync {
    fn publish(&self, report: &InspectorReport);
}

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInspector;

impl InspectorSink for NullInspector {
    fn publish(&self, _report: &InspectorReport) {}
}

/// Emits each report as a structured debug event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogInspector;

impl InspectorSink for LogInspector {
    fn publish(&self, report: &InspectorReport) {
        match serde_json::to_string(report) {
            Ok(rendered) => tracing::debug!(report = %rendered, "agent status"),
            Err(err) => tracing::debug!(error = %err, "agent status serialization failed"),
        }
    }
}
