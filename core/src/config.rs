use std::env;
use std::time::Duration;

pub const CLI_TOKEN_ENV: &str = "CLI_TOKEN";
pub const SERVER_URL_ENV: &str = "SERVER_URL";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime configuration for the agent.
///
/// Token and URL may be absent: the agent still runs and schedules
/// heartbeats, recording each attempt as failed until both are present.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Bearer token echoed verbatim in every heartbeat.
    pub cli_token: Option<String>,
    /// Absolute URL of the heartbeat endpoint.
    pub server_url: Option<String>,
    /// Timeout applied to each heartbeat POST. Never shorter than the
    /// widest heartbeat interval.
    pub request_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cli_token: None,
            server_url: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self {
            cli_token: non_empty_env(CLI_TOKEN_ENV),
            server_url: non_empty_env(SERVER_URL_ENV),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn new(cli_token: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            cli_token: Some(cli_token.into()),
            server_url: Some(server_url.into()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Returns `(token, url)` when both are configured, or the name of the
    /// first missing field.
    pub fn credentials(&self) -> Result<(&str, &str), &'static str> {
        let token = self
            .cli_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or(CLI_TOKEN_ENV)?;
        let url = self
            .server_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or(SERVER_URL_ENV)?;
        Ok((token, url))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}
