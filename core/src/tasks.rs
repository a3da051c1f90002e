//! Applies one heartbeat response's task batch against the shell pool.
//!
//! Step order is fixed: death confirmations, then spawn, then commands, then
//! kills, then command-execution acks. A failure in one entry is logged and
//! never aborts the rest of the batch.

use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::protocol::ResponseCallback;
use crate::protocol::TaskBatch;
use crate::shell::ShellPool;

#[derive(Clone)]
pub struct TaskExecutor {
    pool: ShellPool,
}

impl TaskExecutor {
    pub fn new(pool: ShellPool) -> Self {
        Self { pool }
    }

    /// Runs the batch. Returns true when at least one command was written,
    /// so the caller can pull the next heartbeat forward.
    pub fn apply(&self, tasks: &TaskBatch, callback: &ResponseCallback) -> bool {
        for id in &tasks.confirm_process_death {
            self.pool.confirm_death(id);
        }

        if tasks.if_require_new_process == 1
            && let Err(err) = self.pool.spawn()
        {
            warn!(error = %err, "server-requested spawn failed");
        }

        let mut wrote_command = false;
        for task in &tasks.command {
            let command = compose_command(&normalize_command(&task.command));
            match self.pool.write(&task.pid, &command) {
                Ok(()) => wrote_command = true,
                Err(err) => warn!(shell = %task.pid, error = %err, "command task skipped"),
            }
        }

        for id in &tasks.kill_process {
            if !self.pool.kill(id) {
                debug!(shell = %id, "kill task for unknown shell");
            }
        }

        for id in &callback.command_executed_confirmed {
            self.pool.confirm_command(id);
        }

        wrote_command
    }
}

/// Undoes the accommodations the server applies to command strings before
/// sending them. Kept in one place so a stricter wire contract can replace
/// it wholesale.
pub fn normalize_command(raw: &Value) -> String {
    let mut text = match raw {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };

    // Some commands arrive pre-serialized, e.g. "\"echo hi\"".
    if (text.starts_with('"') || text.starts_with('\''))
        && let Ok(decoded) = serde_json::from_str::<String>(&text)
    {
        text = decoded;
    }

    if text.contains("\\\"") || text.contains("\\'") {
        text = text.replace("\\\"", "\"").replace("\\'", "'");
    }

    if text.starts_with("echo") && text.contains('>') {
        text = space_redirects(&text);
    }

    if text.contains('\n') {
        text = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
    }

    text
}

/// Appends the working-directory probe. The trailing `pwd` line is consumed
/// by the registry's output handler and never reaches the server.
pub fn compose_command(command: &str) -> String {
    format!("{command}; pwd\n")
}

/// Ensures whitespace around unescaped `>` runs so redirections survive a
/// server that strips spaces. `>>` is treated as one unit and `\>` is left
/// alone.
fn space_redirects(command: &str) -> String {
    let mut out = String::with_capacity(command.len() + 4);
    let mut chars = command.chars().peekable();
    let mut prev: Option<char> = None;
    while let Some(ch) = chars.next() {
        if ch == '>' && prev != Some('\\') {
            let mut run = String::from('>');
            while chars.peek() == Some(&'>') {
                chars.next();
                run.push('>');
            }
            if !out.is_empty() && !out.ends_with(' ') {
                out.push(' ');
            }
            out.push_str(&run);
            if chars.peek().is_some_and(|next| *next != ' ') {
                out.push(' ');
            }
            prev = Some('>');
        } else {
            out.push(ch);
            prev = Some(ch);
        }
    }
    out
}
