//! Audit worker pool
//!
//! A fixed pool of workers drains the queue into the durable store, plus a
//! promoter task that moves due retries back to waiting and refreshes the
//! queue-depth gauges. Shutdown is explicit about the two modes the
//! harnesses need: `close(false)` drains active jobs, `close(true)` aborts
//! immediately (tests must not hang on a wedged durable store).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::queue::{backoff_ms, AuditJob, AuditQueue};
use super::repository::AuditRepository;
use crate::metrics::Metrics;

const FETCH_TIMEOUT_SECS: usize = 1;
const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);

pub struct AuditPipeline {
    queue: Arc<AuditQueue>,
    workers: Vec<JoinHandle<()>>,
    promoter: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl AuditPipeline {
    /// Spawn the worker pool and promoter
    pub fn start(
        queue: Arc<AuditQueue>,
        repository: Arc<AuditRepository>,
        metrics: Arc<Metrics>,
        worker_count: usize,
        retry_attempts: u32,
        backoff_base_ms: u64,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let repository = Arc::clone(&repository);
                let metrics = Arc::clone(&metrics);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    worker_loop(
                        worker_id,
                        queue,
                        repository,
                        metrics,
                        shutdown,
                        retry_attempts,
                        backoff_base_ms,
                    )
                    .await;
                })
            })
            .collect();

        let promoter = {
            let queue = Arc::clone(&queue);
            let metrics = Arc::clone(&metrics);
            let shutdown = shutdown_rx;
            tokio::spawn(async move {
                promoter_loop(queue, metrics, shutdown).await;
            })
        };

        Self {
            queue,
            workers,
            promoter,
            shutdown_tx,
        }
    }

    /// The sink handle the engine enqueues through
    pub fn queue(&self) -> Arc<AuditQueue> {
        Arc::clone(&self.queue)
    }

    /// `force = false` drains active jobs before returning; `force = true`
    /// aborts the pool and drops whatever is in flight
    pub async fn close(self, force: bool) {
        if force {
            for worker in &self.workers {
                worker.abort();
            }
            self.promoter.abort();
            tracing::info!("audit pipeline force-closed");
            return;
        }

        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        self.promoter.abort();
        tracing::info!("audit pipeline drained and closed");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<AuditQueue>,
    repository: Arc<AuditRepository>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
    retry_attempts: u32,
    backoff_base_ms: u64,
) {
    tracing::debug!(worker_id, "audit worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let payload = match queue.fetch(FETCH_TIMEOUT_SECS).await {
            Ok(Some(payload)) => payload,
            Ok(None) => continue, // timeout tick; shutdown re-checked
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "audit fetch failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        process(&queue, &repository, &metrics, &payload, retry_attempts, backoff_base_ms).await;
    }
    tracing::debug!(worker_id, "audit worker stopped");
}

async fn process(
    queue: &AuditQueue,
    repository: &AuditRepository,
    metrics: &Metrics,
    payload: &str,
    retry_attempts: u32,
    backoff_base_ms: u64,
) {
    let mut job: AuditJob = match serde_json::from_str(payload) {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(error = %e, payload, "undecodable audit job parked in failed bucket");
            if let Err(e) = queue.park_raw(payload).await {
                tracing::error!(error = %e, "failed-bucket move failed");
            }
            metrics.audit_jobs_total.with_label_values(&["failed"]).inc();
            return;
        }
    };

    match repository.record(&job).await {
        Ok(()) => {
            if let Err(e) = queue.ack(payload).await {
                tracing::warn!(job_id = %job.job_id, error = %e, "audit ack failed");
            }
            metrics
                .audit_jobs_total
                .with_label_values(&["completed"])
                .inc();
            tracing::debug!(
                session_id = %job.session_id,
                version = job.version,
                event_kind = %job.event_kind,
                "audit event written"
            );
        }
        Err(e) => {
            job.attempts += 1;
            if job.attempts >= retry_attempts {
                // Persistent failure: alert with the full payload for
                // post-mortem, never surface to transition callers
                tracing::error!(
                    job_id = %job.job_id,
                    session_id = %job.session_id,
                    version = job.version,
                    event_kind = %job.event_kind,
                    attempts = job.attempts,
                    error = %e,
                    payload = %serde_json::to_string(&job).unwrap_or_default(),
                    "audit write permanently failed"
                );
                if let Err(e) = queue.fail(payload, &job).await {
                    tracing::error!(job_id = %job.job_id, error = %e, "failed-bucket move failed");
                }
                metrics.audit_jobs_total.with_label_values(&["failed"]).inc();
            } else {
                let delay = backoff_ms(backoff_base_ms, job.attempts);
                let due_at = Utc::now().timestamp_millis() + delay as i64;
                tracing::warn!(
                    job_id = %job.job_id,
                    session_id = %job.session_id,
                    attempt = job.attempts,
                    retry_in_ms = delay,
                    error = %e,
                    "audit write failed, retry scheduled"
                );
                if let Err(e) = queue.retry_later(payload, &job, due_at).await {
                    tracing::error!(job_id = %job.job_id, error = %e, "retry schedule failed");
                }
                metrics.audit_jobs_total.with_label_values(&["retried"]).inc();
            }
        }
    }
}

async fn promoter_loop(
    queue: Arc<AuditQueue>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(PROMOTE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        let now_ms = Utc::now().timestamp_millis();
        if let Err(e) = queue.promote_due(now_ms).await {
            tracing::warn!(error = %e, "delayed-job promotion failed");
        }
        match queue.depths().await {
            Ok(depths) => {
                metrics
                    .audit_queue_depth
                    .with_label_values(&["waiting"])
                    .set(depths.waiting);
                metrics
                    .audit_queue_depth
                    .with_label_values(&["active"])
                    .set(depths.active);
                metrics
                    .audit_queue_depth
                    .with_label_values(&["delayed"])
                    .set(depths.delayed);
                metrics
                    .audit_queue_depth
                    .with_label_values(&["failed"])
                    .set(depths.failed);
                metrics
                    .audit_queue_depth
                    .with_label_values(&["completed"])
                    .set(depths.completed);
            }
            Err(e) => tracing::debug!(error = %e, "queue depth read failed"),
        }
    }
}
