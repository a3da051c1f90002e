use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Stable identifier for a managed shell, assigned at spawn time.
///
/// The wire protocol calls this field `PID` because the id is the child's
/// OS pid rendered as decimal whenever one is available. Uniqueness is only
/// required for the lifetime of the agent process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShellId(String);

impl ShellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_pid(pid: u32) -> Self {
        Self(pid.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShellId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
