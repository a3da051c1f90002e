use thiserror::Error;

use crate::shell::ShellId;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is not configured: missing {missing}")]
    NotConfigured { missing: &'static str },
    #[error("heartbeat transport failed: {source}")]
    Transport {
        #[source]
        source: reqwest::Error,
    },
    #[error("server rejected heartbeat with statusCode {status_code}")]
    BadResponse { status_code: i64 },
    #[error("malformed heartbeat response: {source}")]
    MalformedResponse {
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown shell {id}")]
    UnknownShell { id: ShellId },
    #[error("failed to spawn shell: {source}")]
    Spawn {
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to write to shell {id}")]
    Write { id: ShellId },
}

impl AgentError {
    pub(crate) fn not_configured(missing: &'static str) -> Self {
        Self::NotConfigured { missing }
    }

    pub(crate) fn transport(source: reqwest::Error) -> Self {
        Self::Transport { source }
    }

    pub(crate) fn malformed_response(source: serde_json::Error) -> Self {
        Self::MalformedResponse { source }
    }

    pub(crate) fn spawn(source: anyhow::Error) -> Self {
        Self::Spawn { source }
    }

    pub(crate) fn unknown_shell(id: &ShellId) -> Self {
        Self::UnknownShell { id: id.clone() }
    }
}
