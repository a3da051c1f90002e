//! The heartbeat engine: builds the outbound payload, performs the POST,
//! applies acknowledgements from the response and hands its tasks to the
//! executor.
//!
//! At most one heartbeat is in flight and at most one task batch is
//! executing; the two are mutually exclusive. Failed sends keep the ack
//! ledger intact so deliveries are retried until the server confirms them.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::inspector::InspectorReport;
use crate::inspector::InspectorSink;
use crate::protocol::HeartbeatPayload;
use crate::protocol::HeartbeatResponse;
use crate::protocol::STATUS_OK;
use crate::scheduler::BUSY_RETRY_DELAY;
use crate::scheduler::COMMAND_RESPONSE_DELAY;
use crate::scheduler::SchedulerHandle;
use crate::shell::ShellPool;
use crate::tasks::TaskExecutor;
use crate::telemetry::TelemetryProvider;

/// Outcome of the most recent heartbeat attempt, kept for the inspector.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HeartbeatStatus {
    /// No heartbeat has completed yet.
    Pending,
    Success {
        last_sent: DateTime<Utc>,
        response: Value,
    },
    Failed {
        error: String,
        at: DateTime<Utc>,
    },
}

struct EngineInner {
    config: AgentConfig,
    client: reqwest::Client,
    pool: ShellPool,
    executor: TaskExecutor,
    telemetry: Arc<dyn TelemetryProvider>,
    inspector: Arc<dyn InspectorSink>,
    scheduler: SchedulerHandle,
    heartbeat_in_progress: AtomicBool,
    tasks_in_progress: AtomicBool,
    status: StdMutex<HeartbeatStatus>,
}

struct SendOutcome {
    raw: Value,
    wrote_command: bool,
}

#[derive(Clone)]
pub struct HeartbeatEngine {
    inner: Arc<EngineInner>,
}

impl HeartbeatEngine {
    pub fn new(
        config: AgentConfig,
        pool: ShellPool,
        executor: TaskExecutor,
        scheduler: SchedulerHandle,
        telemetry: Arc<dyn TelemetryProvider>,
        inspector: Arc<dyn InspectorSink>,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(AgentError::transport)?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                client,
                pool,
                executor,
                telemetry,
                inspector,
                scheduler,
                heartbeat_in_progress: AtomicBool::new(false),
                tasks_in_progress: AtomicBool::new(false),
                status: StdMutex::new(HeartbeatStatus::Pending),
            }),
        })
    }

    /// Performs one heartbeat. Returns immediately when another heartbeat or
    /// a task batch is still running; the scheduler retries in that case.
    pub async fn send_once(&self) {
        let inner = &self.inner;
        if inner.tasks_in_progress.load(Ordering::SeqCst) {
            return;
        }
        if inner
            .heartbeat_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let hint = match self.perform().await {
            Ok(outcome) => {
                debug!("heartbeat delivered");
                self.set_status(HeartbeatStatus::Success {
                    last_sent: Utc::now(),
                    response: outcome.raw,
                });
                outcome.wrote_command.then_some(COMMAND_RESPONSE_DELAY)
            }
            Err(err) => {
                warn!(error = %err, "heartbeat failed");
                self.set_status(HeartbeatStatus::Failed {
                    error: err.to_string(),
                    at: Utc::now(),
                });
                None
            }
        };

        inner.heartbeat_in_progress.store(false, Ordering::SeqCst);
        inner.inspector.publish(&self.report());
        inner.scheduler.schedule(hint);
    }

    async fn perform(&self) -> Result<SendOutcome, AgentError> {
        let inner = &self.inner;
        let (token, url) = inner
            .config
            .credentials()
            .map_err(AgentError::not_configured)?;

        let system_info = inner.telemetry.collect().await;
        let (process_output, callback) = inner.pool.heartbeat_view();
        let payload = HeartbeatPayload {
            cli_token: token.to_string(),
            system_info,
            process_output,
            callback: callback.clone(),
        };

        let response = inner
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(AgentError::transport)?
            .error_for_status()
            .map_err(AgentError::transport)?;
        let body = response.text().await.map_err(AgentError::transport)?;

        let raw: Value = serde_json::from_str(&body).map_err(AgentError::malformed_response)?;
        let parsed: HeartbeatResponse =
            serde_json::from_value(raw.clone()).map_err(AgentError::malformed_response)?;
        if parsed.status_code != STATUS_OK {
            return Err(AgentError::BadResponse {
                status_code: parsed.status_code,
            });
        }

        // Acks apply before this response's tasks run, so a command written
        // by the batch below cannot lose its first output to a stale clear.
        for id in &parsed.callback.command_executed_confirmed {
            inner.pool.confirm_command(id);
        }
        for id in &parsed.callback.process_output_update_succeed {
            inner.pool.clear_ring(id);
        }
        inner.pool.clear_shipped(&callback);

        let wrote_command = if parsed.tasks.is_empty() {
            false
        } else {
            inner.tasks_in_progress.store(true, Ordering::SeqCst);
            let wrote_command = inner.executor.apply(&parsed.tasks, &parsed.callback);
            inner.tasks_in_progress.store(false, Ordering::SeqCst);
            wrote_command
        };

        Ok(SendOutcome { raw, wrote_command })
    }

    pub fn is_busy(&self) -> bool {
        self.inner.heartbeat_in_progress.load(Ordering::SeqCst)
            || self.inner.tasks_in_progress.load(Ordering::SeqCst)
    }

    /// Asks the scheduler to retry shortly; used when a fire found the
    /// engine busy.
    pub fn schedule_retry(&self) {
        self.inner.scheduler.schedule(Some(BUSY_RETRY_DELAY));
    }

    pub fn status(&self) -> HeartbeatStatus {
        self.lock_status().clone()
    }

    pub fn report(&self) -> InspectorReport {
        InspectorReport {
            status: self.status(),
            processes: self.inner.pool.descriptors(),
            pending_callbacks: self.inner.pool.ledger_snapshot(),
        }
    }

    fn set_status(&self, status: HeartbeatStatus) {
        *self.lock_status() = status;
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, HeartbeatStatus> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
