//! Heartbeat timing.
//!
//! At most one timer is pending at any moment; scheduling replaces and
//! aborts the previous one. Timer fires land on an unbounded tick channel
//! consumed by the agent run loop, which drains bursts so coalesced nudges
//! produce a single heartbeat.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Interval while at least one shell is managed.
pub const ACTIVE_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2_000);
/// Interval while the registry is empty.
pub const IDLE_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5_000);
/// Retry delay when a fire finds a heartbeat or task batch still running.
pub const BUSY_RETRY_DELAY: Duration = Duration::from_millis(1_000);
/// Delay after writing a command, so its first output ships promptly.
pub const COMMAND_RESPONSE_DELAY: Duration = Duration::from_millis(1_000);

struct SchedulerInner {
    tick_tx: mpsc::UnboundedSender<()>,
    pending: StdMutex<Option<JoinHandle<()>>>,
    shell_count: Arc<AtomicUsize>,
}

/// Cloneable handle used by the pool and the heartbeat engine to request the
/// next fire. Requesting is cheap and always replaces the pending timer.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<SchedulerInner>,
}

impl SchedulerHandle {
    /// Schedules the next heartbeat. `delay` of `None` picks the default
    /// interval from the current shell count.
    pub fn schedule(&self, delay: Option<Duration>) {
        let delay = delay.unwrap_or_else(|| self.default_interval());
        let tick_tx = self.inner.tick_tx.clone();
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tick_tx.send(());
        });
        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = pending.replace(timer) {
            previous.abort();
        }
    }

    /// Spawn/kill/exit nudge: reschedule with the default interval.
    pub fn nudge(&self) {
        self.schedule(None);
    }

    fn default_interval(&self) -> Duration {
        if self.inner.shell_count.load(Ordering::SeqCst) > 0 {
            ACTIVE_HEARTBEAT_INTERVAL
        } else {
            IDLE_HEARTBEAT_INTERVAL
        }
    }
}

/// Owns the tick receiver; one per agent.
pub struct Scheduler {
    tick_rx: mpsc::UnboundedReceiver<()>,
    handle: SchedulerHandle,
}

impl Scheduler {
    pub fn new(shell_count: Arc<AtomicUsize>) -> Self {
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        Self {
            tick_rx,
            handle: SchedulerHandle {
                inner: Arc::new(SchedulerInner {
                    tick_tx,
                    pending: StdMutex::new(None),
                    shell_count,
                }),
            },
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub async fn next_tick(&mut self) -> Option<()> {
        let tick = self.tick_rx.recv().await;
        // Coalesce nudges that raced with this fire.
        while self.tick_rx.try_recv().is_ok() {}
        tick
    }
}
