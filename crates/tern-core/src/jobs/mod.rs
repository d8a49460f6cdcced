//! Asynchronous provider invocations.
//!
//! Each submitted job runs on its own tokio task with its own
//! [`CancellationToken`]. The orchestration loop blocks only in
//! [`JobManager::await_job`], which enforces the timeout, reports liveness
//! ticks and honors interrupts.
//!
//! Job records live in memory and, when a [`JobStore`] is attached, are
//! mirrored to disk on every status change so `tern jobs` can inspect them
//! from another process. A terminal status is final: a worker that
//! finishes after its job timed out or was cancelled never overwrites it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tern_store::models::{JobRecord, JobStatus};
use tern_store::{JobStore, StoreError};

use crate::error::TransportError;
use crate::provider::{InvocationRequest, Provider, ProviderOutput};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("step {step_id} already has a live job ({job_id})")]
    StepBusy { step_id: String, job_id: Uuid },

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of waiting on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Present whenever the provider call returned, even with a non-zero
    /// exit status.
    pub output: Option<ProviderOutput>,
    pub error: Option<TransportError>,
}

type Outcome = Result<ProviderOutput, TransportError>;

struct JobEntry {
    record: JobRecord,
    cancel: CancellationToken,
    /// Taken by the first `await_job`.
    result_rx: Option<oneshot::Receiver<Outcome>>,
    /// Set once a caller has awaited the job to completion.
    final_result: Option<JobResult>,
    logs: Vec<String>,
}

#[derive(Clone)]
pub struct JobManager {
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    store: Option<JobStore>,
    working_dir: PathBuf,
    liveness_interval: Duration,
}

fn status_for(outcome: &Outcome) -> JobStatus {
    match outcome {
        Ok(output) if output.success() => JobStatus::Succeeded,
        Ok(_) => JobStatus::Failed,
        Err(TransportError::Cancelled) => JobStatus::Cancelled,
        Err(_) => JobStatus::Failed,
    }
}

fn persist(store: Option<&JobStore>, record: &JobRecord) {
    if let Some(store) = store {
        if let Err(e) = store.put(record) {
            warn!(job_id = %record.id, error = %e, "failed to persist job record");
        }
    }
}

impl JobManager {
    /// Jobs run with `working_dir` as the provider's working directory.
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            store: None,
            working_dir: working_dir.into(),
            liveness_interval: Duration::from_secs(15),
        }
    }

    pub fn with_store(mut self, store: JobStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Start `prompt` on `provider` for `step_id` and return immediately.
    pub async fn submit(
        &self,
        step_id: &str,
        provider: Arc<dyn Provider>,
        prompt: String,
    ) -> Result<Uuid, JobError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(live) = jobs
            .values()
            .find(|e| e.record.step_id == step_id && !e.record.status.is_terminal())
        {
            return Err(JobError::StepBusy {
                step_id: step_id.to_string(),
                job_id: live.record.id,
            });
        }

        let record = JobRecord::new(step_id, provider.id());
        let job_id = record.id;
        if let Some(store) = &self.store {
            store.put(&record)?;
        }

        let cancel = CancellationToken::new();
        let (result_tx, result_rx) = oneshot::channel();
        let (line_tx, line_rx) = mpsc::unbounded_channel();

        jobs.insert(
            job_id,
            JobEntry {
                record,
                cancel: cancel.clone(),
                result_rx: Some(result_rx),
                final_result: None,
                logs: Vec::new(),
            },
        );
        drop(jobs);

        self.spawn_log_forwarder(job_id, line_rx, cancel.clone());

        let request = InvocationRequest {
            prompt,
            working_dir: self.working_dir.clone(),
            cancel,
            output: Some(line_tx),
        };
        self.spawn_worker(job_id, provider, request, result_tx);

        info!(job_id = %job_id, step_id, "job submitted");
        Ok(job_id)
    }

    fn spawn_worker(
        &self,
        job_id: Uuid,
        provider: Arc<dyn Provider>,
        request: InvocationRequest,
        result_tx: oneshot::Sender<Outcome>,
    ) {
        let jobs = Arc::clone(&self.jobs);
        let store = self.store.clone();

        tokio::spawn(async move {
            {
                let mut jobs = jobs.lock().await;
                if let Some(entry) = jobs.get_mut(&job_id) {
                    if entry.record.status == JobStatus::Pending {
                        entry.record.status = JobStatus::Running;
                        entry.record.started_at = Some(Utc::now());
                        persist(store.as_ref(), &entry.record);
                    }
                }
            }

            let outcome = provider.invoke(request).await;
            let status = status_for(&outcome);

            {
                let mut jobs = jobs.lock().await;
                if let Some(entry) = jobs.get_mut(&job_id) {
                    if entry.record.status.is_terminal() {
                        debug!(job_id = %job_id, status = %entry.record.status, "worker finished after job was closed");
                    } else {
                        entry.record.status = status;
                        entry.record.finished_at = Some(Utc::now());
                        match &outcome {
                            Ok(output) => {
                                entry.record.result = Some(output.output.clone());
                                entry.record.exit_status = Some(output.exit_status);
                            }
                            Err(e) => entry.record.error = Some(e.to_string()),
                        }
                        persist(store.as_ref(), &entry.record);
                    }
                }
            }

            // The receiver is gone if nobody is waiting any more.
            let _ = result_tx.send(outcome);
        });
    }

    fn spawn_log_forwarder(
        &self,
        job_id: Uuid,
        mut lines: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        let jobs = Arc::clone(&self.jobs);
        let store = self.store.clone();

        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    biased;
                    line = lines.recv() => match line {
                        Some(line) => line,
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                };
                if let Some(store) = &store {
                    if let Err(e) = store.append_log(job_id, &line) {
                        warn!(job_id = %job_id, error = %e, "failed to append job log");
                    }
                }
                if let Some(entry) = jobs.lock().await.get_mut(&job_id) {
                    entry.logs.push(line);
                }
            }
        });
    }

    /// Wait for a job to finish, for at most `timeout`.
    ///
    /// `on_tick` is called with the elapsed time every liveness interval.
    /// On timeout the job becomes `timed_out` and its provider call is
    /// cancelled. When `interrupt` fires the job becomes `cancelled`.
    /// Provider failures are reported in the [`JobResult`], never as `Err`.
    pub async fn await_job<F>(
        &self,
        job_id: Uuid,
        timeout: Duration,
        interrupt: &CancellationToken,
        mut on_tick: F,
    ) -> Result<JobResult, JobError>
    where
        F: FnMut(Duration) + Send,
    {
        let (rx, cancel) = {
            let mut jobs = self.jobs.lock().await;
            let entry = jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
            if let Some(result) = &entry.final_result {
                return Ok(result.clone());
            }
            (entry.result_rx.take(), entry.cancel.clone())
        };
        let Some(mut rx) = rx else {
            // Another caller is already waiting; report what is known.
            let record = self.job_status(job_id).await?;
            return Ok(JobResult {
                job_id,
                status: record.status,
                output: None,
                error: record.error.map(TransportError::Io),
            });
        };

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.liveness_interval,
            self.liveness_interval,
        );

        let result = loop {
            tokio::select! {
                received = &mut rx => {
                    let outcome = received.unwrap_or_else(|_| {
                        Err(TransportError::WorkerCrashed(
                            "worker exited without reporting a result".to_string(),
                        ))
                    });
                    break self.settle(job_id, outcome).await;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(job_id = %job_id, ?timeout, "job timed out");
                    let error = TransportError::Timeout(timeout);
                    // Close before cancelling so the worker cannot record
                    // its own cancellation first.
                    if !self.close(job_id, JobStatus::TimedOut, &error).await {
                        // The worker finished at the deadline; its result is
                        // on the way.
                        if let Ok(outcome) = (&mut rx).await {
                            break self.settle(job_id, outcome).await;
                        }
                    }
                    cancel.cancel();
                    break JobResult {
                        job_id,
                        status: JobStatus::TimedOut,
                        output: None,
                        error: Some(error),
                    };
                }
                _ = interrupt.cancelled() => {
                    info!(job_id = %job_id, "job interrupted");
                    let error = TransportError::Cancelled;
                    self.close(job_id, JobStatus::Cancelled, &error).await;
                    cancel.cancel();
                    break JobResult {
                        job_id,
                        status: JobStatus::Cancelled,
                        output: None,
                        error: Some(error),
                    };
                }
                _ = ticker.tick() => on_tick(started.elapsed()),
            }
        };

        if let Some(entry) = self.jobs.lock().await.get_mut(&job_id) {
            entry.final_result = Some(result.clone());
        }
        Ok(result)
    }

    /// Build the result for a worker that reported back. The record was
    /// already updated by the worker unless it crashed.
    async fn settle(&self, job_id: Uuid, outcome: Outcome) -> JobResult {
        let mut status = status_for(&outcome);
        if let Err(e @ TransportError::WorkerCrashed(_)) = &outcome {
            self.close(job_id, JobStatus::Failed, e).await;
        }
        if let Some(entry) = self.jobs.lock().await.get(&job_id) {
            status = entry.record.status;
        }
        match outcome {
            Ok(output) => JobResult {
                job_id,
                status,
                output: Some(output),
                error: None,
            },
            Err(error) => JobResult {
                job_id,
                status,
                output: None,
                error: Some(error),
            },
        }
    }

    /// Move a live job to a terminal status. No-op if it already finished.
    async fn close(&self, job_id: Uuid, status: JobStatus, error: &TransportError) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(entry) = jobs.get_mut(&job_id) else {
            return false;
        };
        if entry.record.status.is_terminal() {
            return false;
        }
        entry.record.status = status;
        entry.record.finished_at = Some(Utc::now());
        entry.record.error = Some(error.to_string());
        persist(self.store.as_ref(), &entry.record);
        true
    }

    /// Request cooperative cancellation. Returns `false` if the job had
    /// already finished.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, JobError> {
        let token = {
            let jobs = self.jobs.lock().await;
            let entry = jobs.get(&job_id).ok_or(JobError::NotFound(job_id))?;
            entry.cancel.clone()
        };
        let closed = self
            .close(job_id, JobStatus::Cancelled, &TransportError::Cancelled)
            .await;
        if closed {
            token.cancel();
            info!(job_id = %job_id, "job cancelled");
        }
        Ok(closed)
    }

    /// Records owned by this manager plus any found in the store, oldest
    /// first.
    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>, JobError> {
        let mut records: HashMap<Uuid, JobRecord> = match &self.store {
            Some(store) => store.list()?.into_iter().map(|r| (r.id, r)).collect(),
            None => HashMap::new(),
        };
        for (id, entry) in self.jobs.lock().await.iter() {
            records.insert(*id, entry.record.clone());
        }
        let mut records: Vec<JobRecord> = records.into_values().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<JobRecord, JobError> {
        if let Some(entry) = self.jobs.lock().await.get(&job_id) {
            return Ok(entry.record.clone());
        }
        match &self.store {
            Some(store) => store.get(job_id)?.ok_or(JobError::NotFound(job_id)),
            None => Err(JobError::NotFound(job_id)),
        }
    }

    pub async fn job_logs(&self, job_id: Uuid) -> Result<Vec<String>, JobError> {
        if let Some(entry) = self.jobs.lock().await.get(&job_id) {
            return Ok(entry.logs.clone());
        }
        match &self.store {
            Some(store) if store.get(job_id)?.is_some() => Ok(store.read_log(job_id)?),
            _ => Err(JobError::NotFound(job_id)),
        }
    }

    /// Forget finished jobs. Returns how many records were removed.
    pub async fn clear_finished(&self) -> Result<usize, JobError> {
        let removed_in_memory = {
            let mut jobs = self.jobs.lock().await;
            let before = jobs.len();
            jobs.retain(|_, e| !e.record.status.is_terminal());
            before - jobs.len()
        };
        match &self.store {
            Some(store) => Ok(store.clear_finished()?),
            None => Ok(removed_in_memory),
        }
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("working_dir", &self.working_dir)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use async_trait::async_trait;

    /// Echoes its prompt after `delay`, ignoring cancellation when `stubborn`.
    struct SlowEcho {
        delay: Duration,
        stubborn: bool,
    }

    #[async_trait]
    impl Provider for SlowEcho {
        fn id(&self) -> &str {
            "slow"
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::Api
        }

        async fn invoke(&self, request: InvocationRequest) -> Result<ProviderOutput, TransportError> {
            request.emit("working");
            if self.stubborn {
                tokio::time::sleep(self.delay).await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = request.cancel.cancelled() => return Err(TransportError::Cancelled),
                }
            }
            Ok(ProviderOutput::new(request.prompt, 0))
        }
    }

    fn slow(ms: u64) -> Arc<dyn Provider> {
        Arc::new(SlowEcho {
            delay: Duration::from_millis(ms),
            stubborn: false,
        })
    }

    #[tokio::test]
    async fn submit_and_await_success() {
        let manager = JobManager::new(std::env::temp_dir());
        let id = manager.submit("s1", slow(5), "hello".to_string()).await.unwrap();
        let result = manager
            .await_job(id, Duration::from_secs(5), &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(result.output.unwrap().output, "hello");

        let record = manager.job_status(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Succeeded);
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());

        // Lines are forwarded on their own task.
        let mut logs = Vec::new();
        for _ in 0..100 {
            logs = manager.job_logs(id).await.unwrap();
            if !logs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(logs, vec!["working".to_string()]);
    }

    #[tokio::test]
    async fn second_live_job_for_a_step_is_rejected() {
        let manager = JobManager::new(std::env::temp_dir());
        let first = manager.submit("s1", slow(200), "a".to_string()).await.unwrap();
        let err = manager.submit("s1", slow(5), "b".to_string()).await.unwrap_err();
        assert!(matches!(err, JobError::StepBusy { job_id, .. } if job_id == first));
        // A different step is fine.
        manager.submit("s2", slow(5), "c".to_string()).await.unwrap();
        manager.cancel(first).await.unwrap();
    }

    #[tokio::test]
    async fn timeout_is_final_even_if_worker_finishes_later() {
        let manager = JobManager::new(std::env::temp_dir());
        let stubborn: Arc<dyn Provider> = Arc::new(SlowEcho {
            delay: Duration::from_millis(150),
            stubborn: true,
        });
        let id = manager.submit("s1", stubborn, "x".to_string()).await.unwrap();
        let result = manager
            .await_job(id, Duration::from_millis(20), &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(result.status, JobStatus::TimedOut);
        assert!(matches!(result.error, Some(TransportError::Timeout(_))));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let record = manager.job_status(id).await.unwrap();
        assert_eq!(record.status, JobStatus::TimedOut);
        assert!(record.result.is_none());
    }

    #[tokio::test]
    async fn deadline_after_job_already_closed_reports_the_recorded_status() {
        let manager = JobManager::new(std::env::temp_dir());
        let stubborn: Arc<dyn Provider> = Arc::new(SlowEcho {
            delay: Duration::from_millis(80),
            stubborn: true,
        });
        let id = manager.submit("s1", stubborn, "x".to_string()).await.unwrap();
        let other = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            other.cancel(id).await.unwrap();
        });

        let result = manager
            .await_job(id, Duration::from_millis(30), &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        let record = manager.job_status(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(result.status, record.status);
        assert!(!matches!(result.error, Some(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn interrupt_cancels_the_job() {
        let manager = JobManager::new(std::env::temp_dir());
        let id = manager.submit("s1", slow(5_000), "x".to_string()).await.unwrap();
        let interrupt = CancellationToken::new();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = manager
            .await_job(id, Duration::from_secs(30), &interrupt, |_| {})
            .await
            .unwrap();
        assert_eq!(result.status, JobStatus::Cancelled);
        assert_eq!(
            manager.job_status(id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn cancel_on_finished_job_is_a_noop() {
        let manager = JobManager::new(std::env::temp_dir());
        let id = manager.submit("s1", slow(1), "x".to_string()).await.unwrap();
        manager
            .await_job(id, Duration::from_secs(5), &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert!(!manager.cancel(id).await.unwrap());
        assert_eq!(
            manager.job_status(id).await.unwrap().status,
            JobStatus::Succeeded
        );
        assert!(matches!(
            manager.cancel(Uuid::new_v4()).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn liveness_ticks_fire_while_waiting() {
        let manager =
            JobManager::new(std::env::temp_dir()).with_liveness_interval(Duration::from_millis(5));
        let id = manager.submit("s1", slow(60), "x".to_string()).await.unwrap();
        let mut ticks = 0;
        manager
            .await_job(id, Duration::from_secs(5), &CancellationToken::new(), |_| ticks += 1)
            .await
            .unwrap();
        assert!(ticks >= 2, "expected several ticks, got {ticks}");
    }

    #[tokio::test]
    async fn clear_finished_keeps_live_jobs() {
        let manager = JobManager::new(std::env::temp_dir());
        let done = manager.submit("s1", slow(1), "x".to_string()).await.unwrap();
        manager
            .await_job(done, Duration::from_secs(5), &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        let live = manager.submit("s2", slow(5_000), "y".to_string()).await.unwrap();

        assert_eq!(manager.clear_finished().await.unwrap(), 1);
        let ids: Vec<Uuid> = manager.list_jobs().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![live]);
        manager.cancel(live).await.unwrap();
    }
}
