use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::AgentError;
use crate::shell::ring::OUTPUT_RING_CAP;

/// Terminal geometry is fixed at spawn; the protocol has no resize.
const PTY_ROWS: u16 = 30;
const PTY_COLS: u16 = 80;

/// One read never exceeds a shell's ring capacity, so a burst is bounded by
/// the ring, not by reader chunking.
const READ_CHUNK_SIZE: usize = OUTPUT_RING_CAP;

/// Bounds commands queued for a shell between heartbeats. The server sends
/// at most a handful per task batch; hitting this means the shell stopped
/// draining its input.
const INPUT_QUEUE_DEPTH: usize = 32;

/// Backoff for masters that surface `WouldBlock` instead of blocking.
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(20);

#[cfg(unix)]
fn default_shell() -> &'static str {
    "/bin/bash"
}

#[cfg(windows)]
fn default_shell() -> &'static str {
    "powershell.exe"
}

/// Terminal exit report, delivered exactly once per shell.
///
/// portable-pty folds signal deaths into the exit code, so `signal` is only
/// populated on platforms where the wait status distinguishes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellExit {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// Handle to one interactive shell running under a pseudo-terminal.
///
/// Dropping the handle releases the shell's input channel, which stops the
/// writer; the child itself is only terminated through [`PtyShell::kill`].
pub(crate) struct PtyShell {
    input_tx: mpsc::Sender<Vec<u8>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyShell {
    /// Non-blocking append to the shell's input. Fails when the writer is
    /// gone or the input queue is saturated.
    pub(crate) fn write(&self, bytes: Vec<u8>) -> Result<(), ()> {
        self.input_tx.try_send(bytes).map_err(|_| ())
    }

    /// Idempotent; errors (already-dead child included) are logged and
    /// swallowed.
    pub(crate) fn kill(&self) {
        if let Ok(mut killer) = self.killer.lock()
            && let Err(err) = killer.kill()
        {
            debug!(error = %err, "shell kill returned an error");
        }
    }
}

pub(crate) struct SpawnedShell {
    pub(crate) pid: Option<u32>,
    pub(crate) shell: PtyShell,
    pub(crate) output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pub(crate) exit_rx: oneshot::Receiver<ShellExit>,
}

/// Spawns the platform's interactive shell under a fresh PTY, inheriting the
/// agent's environment and the given working directory.
///
/// Output is a single-consumer stream: each shell has exactly one pump in
/// the registry, so chunks go over a plain channel and the reader stops as
/// soon as that consumer is gone.
pub(crate) fn spawn_shell(cwd: &Path) -> Result<SpawnedShell, AgentError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: PTY_ROWS,
            cols: PTY_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(AgentError::spawn)?;

    let mut command = CommandBuilder::new(default_shell());
    command.cwd(cwd);

    let mut child = pair
        .slave
        .spawn_command(command)
        .map_err(AgentError::spawn)?;
    let pid = child.process_id();
    let killer = child.clone_killer();

    // The writer owns the PTY's input handle outright and drains the queue
    // until every sender is dropped, i.e. until the registry entry goes
    // away.
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE_DEPTH);
    let mut writer = pair.master.take_writer().map_err(AgentError::spawn)?;
    tokio::task::spawn_blocking(move || {
        while let Some(bytes) = input_rx.blocking_recv() {
            if writer.write_all(&bytes).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });

    let (output_tx, output_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut reader = pair.master.try_clone_reader().map_err(AgentError::spawn)?;
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    // A closed channel means the shell left the registry;
                    // nobody wants the rest of this stream.
                    if output_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(READ_RETRY_BACKOFF);
                }
                Err(_) => break,
            }
        }
    });

    let (exit_tx, exit_rx) = oneshot::channel::<ShellExit>();
    tokio::task::spawn_blocking(move || {
        let exit = match child.wait() {
            Ok(status) => ShellExit {
                exit_code: Some(status.exit_code() as i32),
                signal: None,
            },
            Err(_) => ShellExit {
                exit_code: None,
                signal: None,
            },
        };
        let _ = exit_tx.send(exit);
    });

    Ok(SpawnedShell {
        pid,
        shell: PtyShell {
            input_tx,
            killer: StdMutex::new(killer),
        },
        output_rx,
        exit_rx,
    })
}
