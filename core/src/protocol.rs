//! Wire shapes exchanged with the orchestration server.
//!
//! The server's field casing (`PID`, `statusCode`) is preserved through serde
//! renames. Every inbound field defaults when absent and unknown fields are
//! ignored, because the task object is only partially typed on the server
//! side; `command` values in particular may arrive as any JSON scalar and are
//! coerced later.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::shell::ShellId;

/// The only status code under which acks and tasks are honored.
pub const STATUS_OK: i64 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    pub cli_token: String,
    pub system_info: SystemInfo,
    pub process_output: Vec<ProcessOutputEntry>,
    pub callback: CallbackSnapshot,
}

/// Host telemetry carried in every heartbeat. Each section is an opaque
/// JSON object supplied by the telemetry provider; `null` means the
/// provider could not produce that section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: Option<Value>,
    pub cpu: Option<Value>,
    pub load: Option<Value>,
    pub memory: Option<Value>,
    pub disks: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOutputEntry {
    #[serde(rename = "PID")]
    pub pid: ShellId,
    /// Unshipped output drained from the shell's ring.
    pub temp: String,
    /// Prompt-style rendering of the shell's working directory,
    /// `"{user}@{host}:{cwd}# "`.
    pub cwd: String,
    pub if_command_executed: u8,
    pub status: ShellStatus,
}

/// Derived shell state. Never stored; computed from the registry entry at
/// snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellStatus {
    Idle,
    Active,
    Executing,
    Terminated,
}

impl fmt::Display for ShellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShellStatus::Idle => write!(f, "idle"),
            ShellStatus::Active => write!(f, "active"),
            ShellStatus::Executing => write!(f, "executing"),
            ShellStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Callbacks the agent owes the server: shells that died and the most
/// recently spawned shell that has not yet been reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackSnapshot {
    pub process_death: Vec<ShellId>,
    pub process_created: Option<ShellId>,
}

impl CallbackSnapshot {
    pub fn is_empty(&self) -> bool {
        self.process_death.is_empty() && self.process_created.is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(rename = "statusCode", default)]
    pub status_code: i64,
    #[serde(default)]
    pub callback: ResponseCallback,
    #[serde(default)]
    pub tasks: TaskBatch,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseCallback {
    #[serde(default)]
    pub command_executed_confirmed: Vec<ShellId>,
    #[serde(default)]
    pub process_output_update_succeed: Vec<ShellId>,
}

/// One heartbeat response's worth of instructions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskBatch {
    #[serde(default)]
    pub confirm_process_death: Vec<ShellId>,
    #[serde(default)]
    pub if_require_new_process: i64,
    #[serde(default)]
    pub command: Vec<CommandTask>,
    #[serde(default)]
    pub kill_process: Vec<ShellId>,
}

impl TaskBatch {
    pub fn is_empty(&self) -> bool {
        self.confirm_process_death.is_empty()
            && self.if_require_new_process != 1
            && self.command.is_empty()
            && self.kill_process.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandTask {
    #[serde(rename = "PID")]
    pub pid: ShellId,
    #[serde(default)]
    pub command: Value,
}
