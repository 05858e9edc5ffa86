//! # Process Supervisor
//!
//! Owns the in-memory registry of live worker processes, one OS process per
//! job. The supervisor spawns workers with the fixed argument/environment
//! contract, pumps their stdout/stderr into the job log, and dispatches the
//! exit event to either the result ingestion pipeline (exit code 0) or a
//! failure transition. The registry entry is removed unconditionally when the
//! process exits, whatever the exit code.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::ingest;
use crate::models::job::{self, JobStatus};
use crate::models::job_log::LogSource;
use crate::repositories::{JobRepository, ProductRepository, TransitionOutcome};

/// How long [`Supervisor::shutdown`] waits for workers to drain.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors surfaced by [`Supervisor::spawn`].
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// A worker is already registered for this job. Spawning twice for one
    /// job would let two processes race on the same record, so the second
    /// call fails loudly instead of replacing the handle.
    #[error("a worker is already registered for job {0}")]
    AlreadyRegistered(Uuid),
    /// The OS refused to launch the worker process.
    #[error("failed to launch worker: {0}")]
    Launch(#[source] std::io::Error),
    /// The job store failed while recording the spawn outcome.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Registry entry for one live worker process.
#[derive(Debug)]
struct WorkerHandle {
    /// Cancelling this token makes the supervising task kill the process.
    stop: CancellationToken,
    pid: Option<u32>,
}

/// Why the supervising task stopped waiting on the child.
enum ExitCause {
    Exited(std::process::ExitStatus),
    StopRequested,
    TimedOut,
    WaitFailed(std::io::Error),
}

/// Supervises worker processes for the lifetime of the service.
pub struct Supervisor {
    config: Arc<AppConfig>,
    jobs: JobRepository,
    products: ProductRepository,
    registry: Mutex<HashMap<Uuid, WorkerHandle>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Creates a supervisor with an empty registry.
    pub fn new(config: Arc<AppConfig>, db: Arc<sea_orm::DatabaseConnection>) -> Self {
        Self {
            jobs: JobRepository::new(db.clone(), config.max_log_lines),
            products: ProductRepository::new(db),
            config,
            registry: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of currently registered worker processes.
    pub async fn active_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Launches the worker for a freshly created job and registers it.
    ///
    /// The registry slot is reserved before the process starts so no output
    /// can be observed for an unregistered job, and so a concurrent second
    /// spawn for the same id fails instead of double-launching. On a launch
    /// error the job is transitioned to `failed` with the OS error recorded.
    #[instrument(skip(self, record), fields(job_id = %record.id, product_name = %record.product_name))]
    pub async fn spawn(self: &Arc<Self>, record: &job::Model) -> Result<(), SpawnError> {
        let job_id = record.id;
        let stop = self.shutdown.child_token();

        {
            let mut registry = self.registry.lock().await;
            if registry.contains_key(&job_id) {
                return Err(SpawnError::AlreadyRegistered(job_id));
            }
            registry.insert(
                job_id,
                WorkerHandle {
                    stop: stop.clone(),
                    pid: None,
                },
            );
            gauge!("active_workers").set(registry.len() as f64);
        }

        let mut child = match self.build_command(record).spawn() {
            Ok(child) => child,
            Err(err) => {
                self.deregister(job_id).await;
                counter!("worker_spawn_failures_total").increment(1);
                error!(job_id = %job_id, error = %err, "Failed to launch worker");

                let message = format!("Failed to launch worker: {}", err);
                self.jobs
                    .apply_status(job_id, JobStatus::Failed, Some(&message), Some(&message))
                    .await?;
                return Err(SpawnError::Launch(err));
            }
        };

        let pid = child.id();
        if let Some(handle) = self.registry.lock().await.get_mut(&job_id) {
            handle.pid = pid;
        }
        info!(job_id = %job_id, pid = ?pid, "Worker process launched");

        let mut pumps: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_lines(
                self.jobs.clone(),
                job_id,
                LogSource::Stdout,
                stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_lines(
                self.jobs.clone(),
                job_id,
                LogSource::Stderr,
                stderr,
            )));
        }

        match self
            .jobs
            .apply_status(job_id, JobStatus::Running, Some("worker spawned"), None)
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {}
            Ok(other) => {
                // The job left `pending` before the worker came up. Nothing
                // may run for it, so take the process straight back down.
                warn!(job_id = %job_id, outcome = ?other, "Job not pending after spawn, killing worker");
                if let Err(err) = child.kill().await {
                    error!(job_id = %job_id, error = %err, "Failed to kill orphaned worker");
                }
                for pump in pumps {
                    let _ = pump.await;
                }
                self.deregister(job_id).await;
                return Ok(());
            }
            Err(err) => {
                error!(job_id = %job_id, error = ?err, "Failed to mark job running, killing worker");
                if let Err(kill_err) = child.kill().await {
                    error!(job_id = %job_id, error = %kill_err, "Failed to kill worker after store error");
                }
                for pump in pumps {
                    let _ = pump.await;
                }
                self.deregister(job_id).await;
                return Err(SpawnError::Storage(err));
            }
        }

        counter!("jobs_started_total").increment(1);

        let supervisor = Arc::clone(self);
        let product_name = record.product_name.clone();
        tokio::spawn(async move {
            supervisor
                .supervise(job_id, product_name, child, pumps, stop)
                .await;
        });

        Ok(())
    }

    /// Stops a running job: applies the `stopped` transition, then signals
    /// the live worker (if any) to be killed.
    ///
    /// The transition is applied first so the exit dispatch racing with the
    /// kill cannot overwrite the operator's decision; its own `failed` write
    /// is rejected by the status guard.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn stop(&self, job_id: Uuid) -> anyhow::Result<TransitionOutcome> {
        let outcome = self
            .jobs
            .apply_status(
                job_id,
                JobStatus::Stopped,
                Some("stop requested by operator"),
                None,
            )
            .await?;

        if matches!(outcome, TransitionOutcome::Applied(_)) {
            let handle = {
                let registry = self.registry.lock().await;
                registry.get(&job_id).map(|h| (h.stop.clone(), h.pid))
            };
            if let Some((stop, pid)) = handle {
                info!(job_id = %job_id, pid = ?pid, "Stopping worker process");
                stop.cancel();
            }
            counter!("jobs_stopped_total").increment(1);
        }

        Ok(outcome)
    }

    /// Signals every worker to terminate and waits for the registry to
    /// drain, bounded by [`SHUTDOWN_DRAIN_TIMEOUT`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        loop {
            let remaining = self.active_count().await;
            if remaining == 0 {
                info!("All workers drained");
                return;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "Shutdown drain timed out with workers still registered");
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Waits on the child and dispatches its exit.
    async fn supervise(
        self: Arc<Self>,
        job_id: Uuid,
        product_name: String,
        mut child: Child,
        pumps: Vec<JoinHandle<()>>,
        stop: CancellationToken,
    ) {
        let started = Instant::now();
        let timeout_secs = self.config.worker.timeout_secs;

        let cause = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => ExitCause::Exited(status),
                Err(err) => ExitCause::WaitFailed(err),
            },
            _ = stop.cancelled() => ExitCause::StopRequested,
            _ = worker_deadline(timeout_secs) => ExitCause::TimedOut,
        };

        if !matches!(cause, ExitCause::Exited(_)) {
            if let Err(err) = child.kill().await {
                error!(job_id = %job_id, error = %err, "Failed to kill worker process");
            }
        }

        // Let the pipe readers reach EOF so every output line is persisted
        // before the exit is dispatched.
        for pump in pumps {
            if let Err(err) = pump.await {
                debug!(job_id = %job_id, error = %err, "Output pump task aborted");
            }
        }

        self.deregister(job_id).await;
        histogram!("worker_runtime_seconds").record(started.elapsed().as_secs_f64());

        match cause {
            ExitCause::Exited(status) if status.success() => {
                debug!(job_id = %job_id, "Worker exited cleanly, running result ingestion");
                match ingest::run_ingestion(
                    &self.jobs,
                    &self.products,
                    &self.config,
                    job_id,
                    &product_name,
                )
                .await
                {
                    Ok(outcome) => {
                        if outcome.finalized {
                            counter!("jobs_completed_total").increment(1);
                        }
                        info!(
                            job_id = %job_id,
                            inserted = outcome.inserted,
                            pages = outcome.summary.pages_processed,
                            finalized = outcome.finalized,
                            "Result ingestion finished"
                        );
                    }
                    Err(err) => {
                        let message = format!("Result ingestion failed: {:#}", err);
                        error!(job_id = %job_id, error = ?err, "Result ingestion failed");
                        self.fail_job(job_id, &message).await;
                    }
                }
            }
            ExitCause::Exited(status) => {
                let message = match status.code() {
                    Some(code) => format!("Worker exited with code {}", code),
                    None => "Worker terminated by signal".to_string(),
                };
                info!(job_id = %job_id, %message, "Worker failed");
                self.fail_job(job_id, &message).await;
            }
            ExitCause::StopRequested => {
                // The stopped transition was already applied by the writer
                // that cancelled the token; nothing further to record.
                info!(job_id = %job_id, "Worker killed after stop request");
            }
            ExitCause::TimedOut => {
                counter!("worker_timeouts_total").increment(1);
                let message = format!("Worker timed out after {}s", timeout_secs);
                warn!(job_id = %job_id, timeout_secs, "Worker timed out");
                self.fail_job(job_id, &message).await;
            }
            ExitCause::WaitFailed(err) => {
                let message = format!("Failed to wait for worker: {}", err);
                error!(job_id = %job_id, error = %err, "Wait on worker process failed");
                self.fail_job(job_id, &message).await;
            }
        }
    }

    /// Applies the failure transition, tolerating a lost race with another
    /// terminal write.
    async fn fail_job(&self, job_id: Uuid, message: &str) {
        match self
            .jobs
            .apply_status(job_id, JobStatus::Failed, Some(message), Some(message))
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {
                counter!("jobs_failed_total").increment(1);
            }
            Ok(TransitionOutcome::Rejected { current }) => {
                debug!(job_id = %job_id, current = %current, "Job already terminal, failure transition skipped");
            }
            Ok(TransitionOutcome::NotFound) => {
                warn!(job_id = %job_id, "Job record missing while recording failure");
            }
            Err(err) => {
                error!(job_id = %job_id, error = ?err, "Failed to record job failure");
            }
        }
    }

    async fn deregister(&self, job_id: Uuid) {
        let mut registry = self.registry.lock().await;
        registry.remove(&job_id);
        gauge!("active_workers").set(registry.len() as f64);
    }

    /// Builds the worker invocation per the process contract: script path
    /// first, then the job flags, with the callback base URL and shared
    /// secret passed through the environment.
    fn build_command(&self, record: &job::Model) -> Command {
        let worker = &self.config.worker;

        let mut command = Command::new(&worker.command);
        command
            .arg(&worker.script)
            .arg("--job-id")
            .arg(record.id.to_string())
            .arg("--product-name")
            .arg(&record.product_name)
            .arg("--max-products")
            .arg(record.max_products.to_string())
            .arg("--max-pages")
            .arg(record.max_pages.to_string());
        if worker.headless {
            command.arg("--headless");
        }

        command
            .env("API_BASE_URL", &self.config.api_base_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(secret) = &self.config.scraper_secret {
            command.env("SCRAPER_SECRET", secret);
        }

        command
    }
}

/// Worker duration limit; 0 disables the timeout.
async fn worker_deadline(timeout_secs: u64) {
    if timeout_secs == 0 {
        std::future::pending::<()>().await
    } else {
        sleep(Duration::from_secs(timeout_secs)).await
    }
}

/// Reads lines from one worker stream and appends each as a log event.
///
/// A store error drops the line rather than retrying, so a database outage
/// cannot wedge the stream pump behind an unbounded retry loop.
async fn pump_lines<R>(jobs: JobRepository, job_id: Uuid, source: LogSource, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end_matches('\r');
                if let Err(err) = jobs.append_log(job_id, source, line).await {
                    warn!(
                        job_id = %job_id,
                        source = %source,
                        error = ?err,
                        "Dropping worker output line after store error"
                    );
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(job_id = %job_id, source = %source, error = %err, "Worker stream read failed");
                break;
            }
        }
    }
}
