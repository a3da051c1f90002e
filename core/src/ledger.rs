//! Callbacks the agent owes the server.
//!
//! Delivery is at-least-once: entries survive failed heartbeats and are
//! resent until a successful response clears what was shipped. The server
//! tolerates duplicates, so both fields are idempotent on its side.

use std::collections::BTreeSet;

use crate::protocol::CallbackSnapshot;
use crate::shell::ShellId;

/// Pending acknowledgements. Plain data: the shell pool guards it with the
/// same lock as the registry map so that a shell id is never observable in
/// both the registry and the death set.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AckLedger {
    process_death: BTreeSet<ShellId>,
    /// Single slot: a later spawn before a successful heartbeat overwrites
    /// an earlier unshipped creation notice.
    process_created: Option<ShellId>,
}

impl AckLedger {
    pub fn record_death(&mut self, id: ShellId) {
        self.process_death.insert(id);
    }

    pub fn contains_death(&self, id: &ShellId) -> bool {
        self.process_death.contains(id)
    }

    /// A re-spawned id is alive again; it must not be reported dead.
    pub fn clear_death(&mut self, id: &ShellId) {
        self.process_death.remove(id);
    }

    pub fn record_created(&mut self, id: ShellId) {
        self.process_created = Some(id);
    }

    pub fn snapshot(&self) -> CallbackSnapshot {
        CallbackSnapshot {
            process_death: self.process_death.iter().cloned().collect(),
            process_created: self.process_created.clone(),
        }
    }

    /// Drops exactly what a successful heartbeat shipped. Deaths recorded
    /// while that heartbeat was in flight stay pending for the next one.
    pub fn clear_shipped(&mut self, shipped: &CallbackSnapshot) {
        for id in &shipped.process_death {
            self.process_death.remove(id);
        }
        if self.process_created == shipped.process_created {
            self.process_created = None;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.process_death.is_empty() && self.process_created.is_none()
    }
}
