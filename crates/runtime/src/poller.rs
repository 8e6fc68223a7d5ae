use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use outreach_core::config::PollerConfig;
use outreach_core::domain::scheduled_action::ScheduledAction;
use outreach_db::repositories::{MarkExecutedOutcome, RepositoryError, ScheduledActionRepository};

/// Performs one claimed action. Delivery is at-least-once, so
/// implementations must tolerate seeing the same action twice.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &ScheduledAction) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("action poller is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    pub batch_limit: u32,
    pub drain_timeout: Duration,
    pub worker_id: String,
}

impl PollerSettings {
    pub fn from_config(config: &PollerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_limit: config.batch_limit.max(1),
            drain_timeout: config.drain_timeout(),
            worker_id: config.worker_id.clone().unwrap_or_else(generate_worker_id),
        }
    }
}

fn generate_worker_id() -> String {
    format!("poller-{}", uuid::Uuid::new_v4())
}

/// Counts for a single claim-and-execute pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub executed: usize,
    pub failed: usize,
    pub released: usize,
}

struct PollerInner {
    store: Arc<dyn ScheduledActionRepository>,
    executor: Arc<dyn ActionExecutor>,
    settings: PollerSettings,
}

struct RunningLoop {
    shutdown: CancellationToken,
    /// Cancelled once the loop task has exited, including by panic.
    stopped: CancellationToken,
    /// Taken by the first `stop` call that waits on the loop.
    handle: Option<JoinHandle<()>>,
}

impl RunningLoop {
    fn is_alive(&self) -> bool {
        !self.stopped.is_cancelled()
    }
}

/// Periodically claims due actions and hands each to the executor.
///
/// Replicas coordinate only through `claim_due`. A failed execution releases
/// its claim so the next cycle retries it; an action cancelled before it is
/// claimed is never handed to the executor.
pub struct ActionPoller {
    inner: Arc<PollerInner>,
    running: Mutex<Option<RunningLoop>>,
}

impl ActionPoller {
    pub fn new(
        store: Arc<dyn ScheduledActionRepository>,
        executor: Arc<dyn ActionExecutor>,
        settings: PollerSettings,
    ) -> Self {
        Self { inner: Arc::new(PollerInner { store, executor, settings }), running: Mutex::new(None) }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.settings.worker_id
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().as_ref().is_some_and(RunningLoop::is_alive)
    }

    /// Spawns the polling loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), PollerError> {
        let mut running = self.lock_running();
        if running.as_ref().is_some_and(RunningLoop::is_alive) {
            return Err(PollerError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        let stopped = CancellationToken::new();
        let stopped_guard = stopped.clone().drop_guard();
        let inner = Arc::clone(&self.inner);
        let loop_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            let _stopped = stopped_guard;
            run_loop(inner, loop_shutdown).await;
        });
        *running = Some(RunningLoop { shutdown, stopped, handle: Some(handle) });

        info!(
            event_name = "runtime.poller.started",
            correlation_id = "bootstrap",
            worker_id = %self.inner.settings.worker_id,
            poll_interval_ms = self.inner.settings.poll_interval.as_millis() as u64,
            batch_limit = self.inner.settings.batch_limit,
            "action poller started"
        );
        Ok(())
    }

    /// Signals the loop to stop and waits up to the drain timeout for the
    /// in-flight cycle. Returns false when the timeout elapsed first; the
    /// cycle is then left to finish in the background and `start` keeps
    /// refusing until it has.
    pub async fn stop(&self) -> bool {
        let (shutdown, stopped, handle) = {
            let mut running = self.lock_running();
            let Some(current) = running.as_mut() else {
                return true;
            };
            (current.shutdown.clone(), current.stopped.clone(), current.handle.take())
        };
        shutdown.cancel();

        let drain_timeout = self.inner.settings.drain_timeout;
        let Some(handle) = handle else {
            // Another caller already holds the handle; wait on the exit signal.
            return tokio::time::timeout(drain_timeout, stopped.cancelled()).await.is_ok();
        };

        match tokio::time::timeout(drain_timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(join_error)) => {
                warn!(
                    event_name = "runtime.poller.loop_panicked",
                    correlation_id = "shutdown",
                    worker_id = %self.inner.settings.worker_id,
                    error = %join_error,
                    "action poller loop ended abnormally"
                );
                true
            }
            Err(_) => {
                warn!(
                    event_name = "runtime.poller.drain_timeout",
                    correlation_id = "shutdown",
                    worker_id = %self.inner.settings.worker_id,
                    drain_timeout_secs = self.inner.settings.drain_timeout.as_secs(),
                    "in-flight actions did not finish before drain timeout"
                );
                false
            }
        }
    }

    /// Runs a single claim-and-execute pass as of `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CycleReport, PollerError> {
        run_cycle(&self.inner, now, &CancellationToken::new()).await
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<RunningLoop>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_loop(inner: Arc<PollerInner>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(inner.settings.poll_interval) => {}
        }

        match run_cycle(&inner, Utc::now(), &shutdown).await {
            Ok(report) if report.claimed > 0 => debug!(
                event_name = "runtime.poller.cycle",
                correlation_id = "poller",
                worker_id = %inner.settings.worker_id,
                claimed = report.claimed,
                executed = report.executed,
                failed = report.failed,
                released = report.released,
                "poll cycle finished"
            ),
            Ok(_) => {}
            Err(error) => warn!(
                event_name = "runtime.poller.cycle_failed",
                correlation_id = "poller",
                worker_id = %inner.settings.worker_id,
                error = %error,
                "poll cycle failed; retrying next interval"
            ),
        }
    }

    info!(
        event_name = "runtime.poller.stopped",
        correlation_id = "shutdown",
        worker_id = %inner.settings.worker_id,
        "action poller stopped"
    );
}

async fn run_cycle(
    inner: &PollerInner,
    now: DateTime<Utc>,
    shutdown: &CancellationToken,
) -> Result<CycleReport, PollerError> {
    let worker_id = inner.settings.worker_id.as_str();
    let claimed = inner.store.claim_due(worker_id, now, inner.settings.batch_limit).await?;
    let mut report = CycleReport { claimed: claimed.len(), ..CycleReport::default() };

    for action in claimed {
        if shutdown.is_cancelled() {
            release(inner, &action, &mut report).await;
            continue;
        }

        match execute_isolated(inner, &action).await {
            Ok(()) => {
                record_execution(inner, &action).await;
                report.executed += 1;
            }
            Err(error) => {
                report.failed += 1;
                warn!(
                    event_name = "runtime.poller.action_failed",
                    action_id = %action.id,
                    subject_id = %action.subject_id,
                    action_type = action.action_type.as_str(),
                    worker_id,
                    error = %error,
                    "action execution failed; releasing claim for retry"
                );
                release(inner, &action, &mut report).await;
            }
        }
    }

    Ok(report)
}

async fn execute_isolated(inner: &PollerInner, action: &ScheduledAction) -> anyhow::Result<()> {
    let executor = Arc::clone(&inner.executor);
    let owned = action.clone();
    match tokio::spawn(async move { executor.execute(&owned).await }).await {
        Ok(result) => result,
        Err(join_error) => Err(anyhow::anyhow!("executor panicked: {join_error}")),
    }
}

async fn record_execution(inner: &PollerInner, action: &ScheduledAction) {
    match inner.store.mark_executed(&action.id).await {
        Ok(MarkExecutedOutcome::Executed) => info!(
            event_name = "runtime.poller.executed",
            action_id = %action.id,
            subject_id = %action.subject_id,
            action_type = action.action_type.as_str(),
            worker_id = %inner.settings.worker_id,
            "scheduled action executed"
        ),
        Ok(outcome) => warn!(
            event_name = "runtime.poller.mark_executed_skipped",
            action_id = %action.id,
            subject_id = %action.subject_id,
            outcome = ?outcome,
            worker_id = %inner.settings.worker_id,
            "action already reached a terminal state"
        ),
        Err(error) => warn!(
            event_name = "runtime.poller.mark_executed_failed",
            action_id = %action.id,
            subject_id = %action.subject_id,
            worker_id = %inner.settings.worker_id,
            error = %error,
            "could not record execution; action may run again after lease expiry"
        ),
    }
}

async fn release(inner: &PollerInner, action: &ScheduledAction, report: &mut CycleReport) {
    match inner.store.release_claim(&action.id, &inner.settings.worker_id).await {
        Ok(true) => report.released += 1,
        Ok(false) => {}
        Err(error) => warn!(
            event_name = "runtime.poller.release_failed",
            action_id = %action.id,
            worker_id = %inner.settings.worker_id,
            error = %error,
            "could not release claim; row is retried after lease expiry"
        ),
    }
}
