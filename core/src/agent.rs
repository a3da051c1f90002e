use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::heartbeat::HeartbeatEngine;
use crate::inspector::InspectorSink;
use crate::inspector::NullInspector;
use crate::scheduler::Scheduler;
use crate::shell::ShellPool;
use crate::tasks::TaskExecutor;
use crate::telemetry::SysinfoTelemetry;
use crate::telemetry::TelemetryProvider;

/// Wires the shell pool, task executor, heartbeat engine and scheduler into
/// one unit and drives the timer loop.
pub struct Agent {
    engine: HeartbeatEngine,
    scheduler: Scheduler,
    pool: ShellPool,
}

impl Agent {
    /// Agent with the default `sysinfo` telemetry and no inspector.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        Self::with_providers(
            config,
            Arc::new(SysinfoTelemetry::new()),
            Arc::new(NullInspector),
        )
    }

    pub fn with_providers(
        config: AgentConfig,
        telemetry: Arc<dyn TelemetryProvider>,
        inspector: Arc<dyn InspectorSink>,
    ) -> Result<Self, AgentError> {
        let shell_count = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(Arc::clone(&shell_count));
        let pool = ShellPool::new(scheduler.handle(), shell_count);
        let executor = TaskExecutor::new(pool.clone());
        let engine = HeartbeatEngine::new(
            config,
            pool.clone(),
            executor,
            scheduler.handle(),
            telemetry,
            inspector,
        )?;
        Ok(Self {
            engine,
            scheduler,
            pool,
        })
    }

    pub fn pool(&self) -> &ShellPool {
        &self.pool
    }

    pub fn engine(&self) -> &HeartbeatEngine {
        &self.engine
    }

    /// Drives heartbeats until the process is told to stop. Each timer fire
    /// either performs a heartbeat or, when one is still running, backs off
    /// briefly and retries.
    pub async fn run(&mut self) {
        self.scheduler.handle().schedule(None);
        while let Some(()) = self.scheduler.next_tick().await {
            if self.engine.is_busy() {
                self.engine.schedule_retry();
            } else {
                self.engine.send_once().await;
            }
        }
    }

    /// Best-effort teardown: kill every managed shell.
    pub fn shutdown(&self) {
        self.pool.kill_all();
    }
}
