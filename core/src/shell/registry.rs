use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::AgentError;
use crate::ledger::AckLedger;
use crate::protocol::CallbackSnapshot;
use crate::protocol::ProcessOutputEntry;
use crate::protocol::ShellStatus;
use crate::scheduler::COMMAND_RESPONSE_DELAY;
use crate::scheduler::SchedulerHandle;
use crate::shell::ring::OutputRing;
use crate::shell::session;
use crate::shell::session::PtyShell;
use crate::shell::session::ShellExit;
use crate::shell::shell_id::ShellId;

/// A shell with output newer than this (and a non-empty ring) reports as
/// `active` rather than `idle`.
const ACTIVE_OUTPUT_WINDOW: Duration = Duration::from_secs(5);

/// Read-only projection of one registry entry, for the inspector.
#[derive(Debug, Clone, Serialize)]
pub struct ShellDescriptor {
    pub id: ShellId,
    pub status: ShellStatus,
    pub cwd: String,
    pub command_pending: bool,
    pub uptime_ms: u128,
    pub buffered_bytes: usize,
}

struct ManagedShell {
    pty: PtyShell,
    ring: OutputRing,
    cwd: String,
    command_pending: bool,
    expect_pwd: bool,
    last_output_at: Instant,
    spawned_at: Instant,
    pump_task: Option<JoinHandle<()>>,
}

impl ManagedShell {
    fn status(&self) -> ShellStatus {
        if self.command_pending {
            ShellStatus::Executing
        } else if self.last_output_at.elapsed() <= ACTIVE_OUTPUT_WINDOW && !self.ring.is_empty() {
            ShellStatus::Active
        } else {
            ShellStatus::Idle
        }
    }
}

impl Drop for ManagedShell {
    fn drop(&mut self) {
        if let Some(pump) = self.pump_task.take() {
            pump.abort();
        }
    }
}

#[derive(Default)]
struct PoolState {
    shells: HashMap<ShellId, ManagedShell>,
    ledger: AckLedger,
}

struct PoolInner {
    // One lock over shells and ledger: a shell id must never be observable
    // in the registry and the death set at the same time.
    state: StdMutex<PoolState>,
    scheduler: SchedulerHandle,
    shell_count: Arc<AtomicUsize>,
    fallback_ids: AtomicU64,
    spawn_cwd: PathBuf,
    prompt_user: String,
    prompt_host: String,
}

/// Registry of live shells plus the ack ledger: the lifecycle authority.
///
/// PTY callbacks carry only a [`ShellId`] and look their entry up on each
/// event, skipping when it is gone; the pool owns every PTY handle and kills
/// it on removal.
#[derive(Clone)]
pub struct ShellPool {
    inner: Arc<PoolInner>,
}

impl ShellPool {
    pub fn new(scheduler: SchedulerHandle, shell_count: Arc<AtomicUsize>) -> Self {
        let spawn_cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let prompt_user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let prompt_host = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            inner: Arc::new(PoolInner {
                state: StdMutex::new(PoolState::default()),
                scheduler,
                shell_count,
                fallback_ids: AtomicU64::new(1),
                spawn_cwd,
                prompt_user,
                prompt_host,
            }),
        }
    }

    /// Spawns a new managed shell and publishes its creation notice.
    pub fn spawn(&self) -> Result<ShellId, AgentError> {
        let spawned = session::spawn_shell(&self.inner.spawn_cwd)?;
        let id = match spawned.pid {
            Some(pid) => ShellId::from_pid(pid),
            None => {
                let seq = self.inner.fallback_ids.fetch_add(1, Ordering::SeqCst);
                ShellId::new(format!("local-{seq}"))
            }
        };

        let now = Instant::now();
        let managed = ManagedShell {
            pty: spawned.shell,
            ring: OutputRing::new(),
            cwd: self.inner.spawn_cwd.to_string_lossy().into_owned(),
            command_pending: false,
            expect_pwd: false,
            last_output_at: now,
            spawned_at: now,
            pump_task: None,
        };

        {
            let mut state = self.lock_state();
            // A recycled pid is alive again and must not be reported dead.
            state.ledger.clear_death(&id);
            state.shells.insert(id.clone(), managed);
            state.ledger.record_created(id.clone());
            self.inner
                .shell_count
                .store(state.shells.len(), Ordering::SeqCst);
        }

        let pump = self.start_output_pump(id.clone(), spawned.output_rx);
        {
            let mut state = self.lock_state();
            match state.shells.get_mut(&id) {
                Some(shell) => shell.pump_task = Some(pump),
                // The shell died before the pump was attached; the exit
                // path already cleaned up.
                None => pump.abort(),
            }
        }
        self.start_exit_watch(id.clone(), spawned.exit_rx);

        info!(shell = %id, "spawned managed shell");
        self.inner.scheduler.nudge();
        Ok(id)
    }

    /// Writes a composed command to a shell's input and arms the cwd probe.
    pub fn write(&self, id: &ShellId, command: &str) -> Result<(), AgentError> {
        {
            let mut state = self.lock_state();
            let shell = state
                .shells
                .get_mut(id)
                .ok_or_else(|| AgentError::unknown_shell(id))?;
            if shell.pty.write(command.as_bytes().to_vec()).is_err() {
                // The writer is gone, so the child is dying; the exit watch
                // will take the death path shortly.
                warn!(shell = %id, "write to shell failed");
                return Err(AgentError::Write { id: id.clone() });
            }
            shell.command_pending = true;
            shell.expect_pwd = true;
        }
        self.inner.scheduler.schedule(Some(COMMAND_RESPONSE_DELAY));
        Ok(())
    }

    /// Kills a shell and eagerly removes it. Returns false for unknown ids.
    /// The PTY's own exit notification later is a no-op on the empty slot.
    pub fn kill(&self, id: &ShellId) -> bool {
        let removed = {
            let mut state = self.lock_state();
            let removed = state.shells.remove(id);
            if removed.is_some() {
                state.ledger.record_death(id.clone());
                self.inner
                    .shell_count
                    .store(state.shells.len(), Ordering::SeqCst);
            }
            removed
        };
        match removed {
            Some(shell) => {
                shell.pty.kill();
                info!(shell = %id, "killed managed shell");
                self.inner.scheduler.nudge();
                true
            }
            None => false,
        }
    }

    /// Best-effort teardown of every managed shell, used on shutdown.
    pub fn kill_all(&self) {
        let drained: Vec<(ShellId, ManagedShell)> = {
            let mut state = self.lock_state();
            let drained = state.shells.drain().collect();
            self.inner.shell_count.store(0, Ordering::SeqCst);
            drained
        };
        for (id, shell) in drained {
            debug!(shell = %id, "killing shell on shutdown");
            shell.pty.kill();
        }
    }

    /// Ensures an id the server believes dead is recorded as such when the
    /// registry has no trace of it. A still-live shell is left untouched.
    pub fn confirm_death(&self, id: &ShellId) {
        let mut state = self.lock_state();
        if !state.shells.contains_key(id) && !state.ledger.contains_death(id) {
            state.ledger.record_death(id.clone());
        }
    }

    /// Clears `command_pending` once the server confirms execution.
    pub fn confirm_command(&self, id: &ShellId) {
        let mut state = self.lock_state();
        if let Some(shell) = state.shells.get_mut(id) {
            shell.command_pending = false;
        }
    }

    /// Empties a shell's ring once the server confirms it stored the output.
    pub fn clear_ring(&self, id: &ShellId) {
        let mut state = self.lock_state();
        if let Some(shell) = state.shells.get_mut(id) {
            shell.ring.clear();
        }
    }

    /// One consistent view for the outbound payload: per-shell output
    /// entries (sorted by id) plus the ledger snapshot.
    pub fn heartbeat_view(&self) -> (Vec<ProcessOutputEntry>, CallbackSnapshot) {
        let state = self.lock_state();
        let mut entries: Vec<ProcessOutputEntry> = state
            .shells
            .iter()
            .map(|(id, shell)| ProcessOutputEntry {
                pid: id.clone(),
                temp: shell.ring.read(),
                cwd: self.render_prompt(&shell.cwd),
                if_command_executed: u8::from(shell.command_pending),
                status: shell.status(),
            })
            .collect();
        entries.sort_by(|a, b| a.pid.cmp(&b.pid));
        (entries, state.ledger.snapshot())
    }

    pub fn ledger_snapshot(&self) -> CallbackSnapshot {
        self.lock_state().ledger.snapshot()
    }

    /// Drops the callbacks a successful heartbeat shipped; anything recorded
    /// while it was in flight stays pending.
    pub fn clear_shipped(&self, shipped: &CallbackSnapshot) {
        self.lock_state().ledger.clear_shipped(shipped);
    }

    pub fn descriptors(&self) -> Vec<ShellDescriptor> {
        let state = self.lock_state();
        let mut descriptors: Vec<ShellDescriptor> = state
            .shells
            .iter()
            .map(|(id, shell)| ShellDescriptor {
                id: id.clone(),
                status: shell.status(),
                cwd: shell.cwd.clone(),
                command_pending: shell.command_pending,
                uptime_ms: shell.spawned_at.elapsed().as_millis(),
                buffered_bytes: shell.ring.len(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.lock_state().shells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ShellId) -> bool {
        self.lock_state().shells.contains_key(id)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn render_prompt(&self, cwd: &str) -> String {
        format!(
            "{}@{}:{}# ",
            self.inner.prompt_user, self.inner.prompt_host, cwd
        )
    }

    fn start_output_pump(
        &self,
        id: ShellId,
        mut output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            // The stream ends when the PTY reader hits EOF and drops its
            // sender.
            while let Some(chunk) = output_rx.recv().await {
                pool.handle_output(&id, &chunk);
            }
        })
    }

    fn start_exit_watch(&self, id: ShellId, exit_rx: oneshot::Receiver<ShellExit>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let exit = exit_rx.await.unwrap_or(ShellExit {
                exit_code: None,
                signal: None,
            });
            pool.handle_exit(&id, exit);
        });
    }

    /// Death path for spontaneous exits. After an eager kill the entry is
    /// already gone and this is a no-op.
    fn handle_exit(&self, id: &ShellId, exit: ShellExit) {
        let removed = {
            let mut state = self.lock_state();
            let removed = state.shells.remove(id).is_some();
            if removed {
                state.ledger.record_death(id.clone());
                self.inner
                    .shell_count
                    .store(state.shells.len(), Ordering::SeqCst);
            }
            removed
        };
        if removed {
            info!(
                shell = %id,
                exit_code = ?exit.exit_code,
                signal = ?exit.signal,
                "managed shell exited"
            );
            self.inner.scheduler.nudge();
        }
    }

    /// Ingests one output chunk from a shell's PTY reader.
    fn handle_output(&self, id: &ShellId, chunk: &[u8]) {
        let mut state = self.lock_state();
        let Some(shell) = state.shells.get_mut(id) else {
            return;
        };
        shell.last_output_at = Instant::now();

        if shell.expect_pwd
            && let Some((start, end, path)) = detect_cwd_line(chunk)
        {
            debug!(shell = %id, cwd = %path, "updated working directory from output");
            shell.cwd = path;
            shell.expect_pwd = false;
            let mut elided = Vec::with_capacity(chunk.len() - (end - start));
            elided.extend_from_slice(&chunk[..start]);
            elided.extend_from_slice(&chunk[end..]);
            shell.ring.append(&elided);
            return;
        }

        shell.ring.append(chunk);
    }
}

/// Looks at the last non-empty line of a chunk; a line that is an absolute
/// unix path or a windows drive path is taken as the shell's new working
/// directory. Returns the byte range of the matched path within the chunk.
///
/// This is a heuristic: prompts, escape codes or trailing output can hide
/// the path, in which case the previous cwd stays in effect.
fn detect_cwd_line(chunk: &[u8]) -> Option<(usize, usize, String)> {
    let mut line_start = 0usize;
    let mut best: Option<(usize, usize)> = None;
    for index in 0..=chunk.len() {
        let at_end = index == chunk.len();
        if at_end || chunk[index] == b'\n' {
            let (start, end) = trim_line(chunk, line_start, index);
            if start < end {
                best = Some((start, end));
            }
            line_start = index + 1;
        }
        if at_end {
            break;
        }
    }

    let (start, end) = best?;
    let line = std::str::from_utf8(&chunk[start..end]).ok()?;
    if looks_like_path(line) {
        Some((start, end, line.to_string()))
    } else {
        None
    }
}

fn trim_line(chunk: &[u8], mut start: usize, mut end: usize) -> (usize, usize) {
    while start < end && matches!(chunk[start], b' ' | b'\t' | b'\r') {
        start += 1;
    }
    while end > start && matches!(chunk[end - 1], b' ' | b'\t' | b'\r') {
        end -= 1;
    }
    (start, end)
}

fn looks_like_path(line: &str) -> bool {
    if line.starts_with('/') {
        return true;
    }
    let bytes = line.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_uppercase() && bytes[1] == b':' && bytes[2] == b'\\'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    fn test_pool() -> ShellPool {
        let count = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(Arc::clone(&count));
        // The receiver half is dropped; nudges land on a closed channel,
        // which the handle tolerates.
        ShellPool::new(scheduler.handle(), count)
    }

    #[test]
    fn detect_cwd_picks_last_non_empty_line() {
        let chunk = b"some output\n/home/user/project\n\n";
        let (start, end, path) = detect_cwd_line(chunk).expect("path detected");
        assert_eq!(path, "/home/user/project");
        assert_eq!(&chunk[start..end], b"/home/user/project");
    }

    #[test]
    fn detect_cwd_handles_crlf_and_windows_drives() {
        let chunk = b"dir listing\r\nC:\\Users\\dev\r\n";
        let (_, _, path) = detect_cwd_line(chunk).expect("path detected");
        assert_eq!(path, "C:\\Users\\dev");

        assert!(detect_cwd_line(b"no path here\n").is_none());
        assert!(detect_cwd_line(b"relative/path\n").is_none());
    }

    #[tokio::test]
    async fn confirm_death_records_only_unknown_ids() {
        let pool = test_pool();
        let id = ShellId::from("555");
        pool.confirm_death(&id);
        pool.confirm_death(&id);
        let snapshot = pool.ledger_snapshot();
        assert_eq!(snapshot.process_death, vec![id]);
    }

    #[tokio::test]
    async fn write_to_unknown_shell_fails() {
        let pool = test_pool();
        let err = pool
            .write(&ShellId::from("404"), "echo hi; pwd\n")
            .expect_err("unknown shell");
        assert!(matches!(err, AgentError::UnknownShell { .. }));
        assert!(!pool.kill(&ShellId::from("404")));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_write_kill_lifecycle() {
        let pool = test_pool();
        let id = pool.spawn().expect("spawn");
        assert!(pool.contains(&id));
        assert_eq!(pool.ledger_snapshot().process_created, Some(id.clone()));

        pool.write(&id, "echo lifecycle; pwd\n").expect("write");
        let (entries, _) = pool.heartbeat_view();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].if_command_executed, 1);
        assert_eq!(entries[0].status, ShellStatus::Executing);

        assert!(pool.kill(&id));
        assert!(!pool.contains(&id));
        let snapshot = pool.ledger_snapshot();
        assert!(snapshot.process_death.contains(&id));
        assert!(pool.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spontaneous_exit_takes_death_path() {
        let pool = test_pool();
        let id = pool.spawn().expect("spawn");
        pool.write(&id, "exit\n").expect("write");

        let deadline = Instant::now() + Duration::from_secs(10);
        while pool.contains(&id) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!pool.contains(&id), "shell should leave the registry");
        assert!(pool.ledger_snapshot().process_death.contains(&id));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn registry_and_death_set_stay_disjoint() {
        let pool = test_pool();
        let id = pool.spawn().expect("spawn");
        let (entries, callback) = pool.heartbeat_view();
        let live: Vec<&ShellId> = entries.iter().map(|entry| &entry.pid).collect();
        for dead in &callback.process_death {
            assert!(!live.contains(&dead));
        }
        pool.kill(&id);
        let (entries, callback) = pool.heartbeat_view();
        assert!(entries.is_empty());
        assert!(callback.process_death.contains(&id));
    }
}
