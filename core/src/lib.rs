//! Agent control loop for a remote shell orchestration server.
//!
//! The agent keeps a heartbeat channel to the server: each POST carries host
//! telemetry, incremental output drained from every managed shell and
//! acknowledgements for earlier events; the response carries new task
//! instructions (spawn a shell, run a command, kill a shell, confirm a
//! death). Delivery is at-least-once in both directions and the server
//! tolerates duplicate acks.

mod agent;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod inspector;
pub mod ledger;
pub mod protocol;
pub mod scheduler;
pub mod shell;
pub mod tasks;
pub mod telemetry;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::AgentError;
pub use heartbeat::HeartbeatEngine;
pub use heartbeat::HeartbeatStatus;
pub use inspector::InspectorReport;
pub use inspector::InspectorSink;
pub use shell::ShellId;
pub use shell::ShellPool;
