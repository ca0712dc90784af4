//! Asynchronous job runner: a bounded worker pool fed by a queue of runs.
//!
//! `submit` and `reprocess` reserve a queue slot, write the job record, enqueue
//! `(id, run)` and return without waiting for the pipeline. A full queue is
//! rejected up front with [`RunnerError::QueueFull`] and nothing is written.
//! Workers drive the orchestrator in a separate task per run, so a panicking
//! stage fails its job instead of taking the worker down. Each run ends with
//! exactly one terminal transition. A heartbeat renews the lease of every run
//! this process owns; a sweep fails `processing` jobs whose lease ran out
//! (e.g. after a crash) so they can be reprocessed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use laudaflow_ai::PipelineOrchestrator;
use laudaflow_core::{DomainError, ExpectedVersion, JobId, LaudaContent};

use super::store::{JobStore, JobStoreError};
use super::types::{JobFilter, JobPatch, JobStatus, JobSummary, Page, PageRequest, ProcessingJob};

/// Job runner configuration.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Number of concurrent pipeline workers
    pub worker_count: usize,
    /// Maximum queued runs; beyond it `submit` is rejected
    pub queue_capacity: usize,
    /// Lease granted to (and renewed for) every owned run
    pub lease: Duration,
    /// How often owned leases are renewed
    pub heartbeat_interval: Duration,
    /// How often expired leases are reclaimed
    pub sweep_interval: Duration,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self::with_lease(4, 256, Duration::from_secs(120))
    }
}

impl JobRunnerConfig {
    /// Derive heartbeat and sweep intervals from the lease length.
    pub fn with_lease(worker_count: usize, queue_capacity: usize, lease: Duration) -> Self {
        Self {
            worker_count,
            queue_capacity,
            lease,
            heartbeat_interval: lease / 3,
            sweep_interval: lease / 2,
        }
    }
}

/// Job runner error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("job queue is full, try again later")]
    QueueFull,
    #[error("job runner is shutting down")]
    ShuttingDown,
}

/// One queued pipeline run.
#[derive(Debug, Clone, Copy)]
struct QueuedRun {
    id: JobId,
    attempt: u32,
}

/// Runs owned by this process, keyed by job id (value: run number).
type OwnedRuns = Arc<Mutex<HashMap<JobId, u32>>>;

/// Handle to the worker pool and its background tasks.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    config: JobRunnerConfig,
    queue: Mutex<Option<mpsc::Sender<QueuedRun>>>,
    owned: OwnedRuns,
    workers: Mutex<Vec<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
}

impl JobRunner {
    /// Reclaim stale jobs, then spawn workers, heartbeat and sweep tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(config: JobRunnerConfig, store: Arc<dyn JobStore>, orchestrator: Arc<PipelineOrchestrator>) -> Self {
        sweep_once(store.as_ref()).await;

        let (tx, rx) = mpsc::channel::<QueuedRun>(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let owned: OwnedRuns = Arc::new(Mutex::new(HashMap::new()));
        let (stop, stop_rx) = watch::channel(false);

        let workers = (0..config.worker_count.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    rx.clone(),
                    store.clone(),
                    orchestrator.clone(),
                    owned.clone(),
                ))
            })
            .collect();

        let background = vec![
            tokio::spawn(heartbeat_loop(
                store.clone(),
                owned.clone(),
                config.clone(),
                stop_rx.clone(),
            )),
            tokio::spawn(sweep_loop(store.clone(), config.sweep_interval, stop_rx)),
        ];

        info!(
            workers = config.worker_count.max(1),
            queue_capacity = config.queue_capacity,
            lease_ms = config.lease.as_millis() as u64,
            "job runner started"
        );

        Self {
            store,
            config,
            queue: Mutex::new(Some(tx)),
            owned,
            workers: Mutex::new(workers),
            background: Mutex::new(background),
            stop,
        }
    }

    /// Validate content, create a processing job and enqueue its first run.
    pub async fn submit(&self, raw_content: &str) -> Result<ProcessingJob, RunnerError> {
        let content = LaudaContent::parse(raw_content)?;
        let queue = self.sender()?;
        let slot = reserve(&queue)?;

        let now = Utc::now();
        let job = ProcessingJob::start(content, now, self.lease_from(now));
        self.store.create(&job).await?;
        info!(job_id = %job.id, "job submitted");

        self.dispatch(slot, &job);
        Ok(job)
    }

    /// Restart a terminal job in place (same id and content) as a new run.
    pub async fn reprocess(&self, id: JobId) -> Result<ProcessingJob, RunnerError> {
        let queue = self.sender()?;
        let slot = reserve(&queue)?;

        let lease_expires_at = self.lease_from(Utc::now());
        let job = self
            .store
            .update(id, ExpectedVersion::Any, JobPatch::Restart { lease_expires_at })
            .await?;
        info!(job_id = %job.id, attempt = job.attempt, "job reprocessing");

        self.dispatch(slot, &job);
        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> Result<ProcessingJob, RunnerError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list(&self, filter: JobFilter, page: PageRequest) -> Result<Page<JobSummary>, RunnerError> {
        Ok(self.store.list(filter, page).await?)
    }

    pub async fn delete(&self, id: JobId) -> Result<(), RunnerError> {
        self.store.delete(id).await?;
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Run one reconciliation sweep now.
    pub async fn sweep(&self) -> usize {
        sweep_once(self.store.as_ref()).await
    }

    /// Stop accepting work, let workers drain the queue, then stop background tasks.
    pub async fn shutdown(&self) {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner).take();
        if queue.is_none() {
            return;
        }
        drop(queue);
        info!("job runner draining");

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "job worker ended abnormally");
            }
        }

        let _ = self.stop.send(true);
        let background = std::mem::take(&mut *self.background.lock().unwrap_or_else(PoisonError::into_inner));
        for task in background {
            let _ = task.await;
        }
        info!("job runner stopped");
    }

    fn sender(&self) -> Result<mpsc::Sender<QueuedRun>, RunnerError> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RunnerError::ShuttingDown)
    }

    fn lease_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        lease_deadline(now, self.config.lease)
    }

    /// Hand a freshly written run to the workers through its reserved slot.
    fn dispatch(&self, slot: mpsc::Permit<'_, QueuedRun>, job: &ProcessingJob) {
        let run = QueuedRun {
            id: job.id,
            attempt: job.attempt,
        };
        own(&self.owned, run);
        slot.send(run);
        debug!(job_id = %run.id, attempt = run.attempt, "job queued");
    }
}

/// Claim a queue slot without waiting for one.
fn reserve(queue: &mpsc::Sender<QueuedRun>) -> Result<mpsc::Permit<'_, QueuedRun>, RunnerError> {
    queue.try_reserve().map_err(|e| match e {
        TrySendError::Full(()) => {
            warn!("job queue full, rejecting run");
            RunnerError::QueueFull
        }
        TrySendError::Closed(()) => RunnerError::ShuttingDown,
    })
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(120))
}

fn own(owned: &OwnedRuns, run: QueuedRun) {
    owned
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(run.id, run.attempt);
}

/// Forget a run, unless the job has already been handed to a newer run.
fn disown(owned: &OwnedRuns, run: QueuedRun) {
    let mut owned = owned.lock().unwrap_or_else(PoisonError::into_inner);
    if owned.get(&run.id) == Some(&run.attempt) {
        owned.remove(&run.id);
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedRun>>>,
    store: Arc<dyn JobStore>,
    orchestrator: Arc<PipelineOrchestrator>,
    owned: OwnedRuns,
) {
    debug!(worker, "job worker started");
    loop {
        let next = { queue.lock().await.recv().await };
        let Some(run) = next else {
            break;
        };
        execute_run(worker, run, store.as_ref(), &orchestrator).await;
        // Always reached: pipeline panics are contained in `execute_run`.
        disown(&owned, run);
    }
    debug!(worker, "job worker stopped");
}

/// Drive one run to its terminal write. Never propagates errors.
async fn execute_run(worker: usize, run: QueuedRun, store: &dyn JobStore, orchestrator: &Arc<PipelineOrchestrator>) {
    let job = match store.get(run.id).await {
        Ok(job) => job,
        Err(e) => {
            warn!(worker, job_id = %run.id, error = %e, "queued job could not be loaded");
            return;
        }
    };
    if job.status != JobStatus::Processing || job.attempt != run.attempt {
        debug!(worker, job_id = %run.id, status = %job.status, "queued run superseded, skipping");
        return;
    }

    info!(worker, job_id = %run.id, attempt = run.attempt, "job started");
    let pipeline = orchestrator.clone();
    let content = job.content;
    let outcome = tokio::spawn(async move { pipeline.run(&content).await }).await;

    let patch = match outcome {
        Ok(Ok(result)) => JobPatch::Complete { result },
        Ok(Err(e)) => JobPatch::Fail { message: e.to_string() },
        Err(e) => {
            error!(worker, job_id = %run.id, error = %e, "pipeline task aborted");
            JobPatch::Fail {
                message: format!("pipeline run aborted: {e}"),
            }
        }
    };
    let succeeded = matches!(patch, JobPatch::Complete { .. });

    match store.update(run.id, ExpectedVersion::Exact(run.attempt), patch).await {
        Ok(job) if succeeded => {
            info!(worker, job_id = %job.id, duration_ms = job.processing_duration_ms, "job completed");
        }
        Ok(job) => {
            warn!(
                worker,
                job_id = %job.id,
                duration_ms = job.processing_duration_ms,
                error = job.error_message.as_deref().unwrap_or_default(),
                "job failed"
            );
        }
        Err(JobStoreError::StaleRun { .. }) => {
            warn!(worker, job_id = %run.id, attempt = run.attempt, "run outcome discarded, job moved on");
        }
        Err(e) => {
            error!(worker, job_id = %run.id, error = %e, "failed to record job outcome");
        }
    }
}

async fn heartbeat_loop(
    store: Arc<dyn JobStore>,
    owned: OwnedRuns,
    config: JobRunnerConfig,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval.max(Duration::from_millis(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }

        let runs: Vec<QueuedRun> = owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, attempt)| QueuedRun {
                id: *id,
                attempt: *attempt,
            })
            .collect();

        for run in runs {
            let patch = JobPatch::Heartbeat {
                lease_expires_at: lease_deadline(Utc::now(), config.lease),
            };
            match store.update(run.id, ExpectedVersion::Exact(run.attempt), patch).await {
                Ok(_) => {}
                Err(JobStoreError::StaleRun { .. }) | Err(JobStoreError::NotFound(_)) => {
                    debug!(job_id = %run.id, attempt = run.attempt, "lease no longer ours");
                    disown(&owned, run);
                }
                Err(e) => warn!(job_id = %run.id, error = %e, "lease renewal failed"),
            }
        }
    }
}

async fn sweep_loop(store: Arc<dyn JobStore>, interval: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        sweep_once(store.as_ref()).await;
    }
}

async fn sweep_once(store: &dyn JobStore) -> usize {
    match store.reclaim_stale(Utc::now()).await {
        Ok(reclaimed) => {
            for job in &reclaimed {
                warn!(job_id = %job.id, attempt = job.attempt, "stale job reclaimed");
            }
            reclaimed.len()
        }
        Err(e) => {
            error!(error = %e, "stale job sweep failed");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{InMemoryJobStore, STALE_JOB_PREFIX};
    use laudaflow_ai::{RemoteError, RetryPolicy, StageClient, StageTarget, StageTargets};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    const CONTENT: &str = "Cartão com limite proporcional ao valor investido";

    /// Stage double: waits for a permit before every call, then answers per assistant.
    struct GatedClient {
        gate: Semaphore,
        malformed_stage2: bool,
        entered: AtomicUsize,
        calls: AtomicUsize,
    }

    impl GatedClient {
        fn open() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
                malformed_stage2: false,
                entered: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }

        fn closed() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                malformed_stage2: false,
                entered: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }

        fn malformed_stage2() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
                malformed_stage2: true,
                entered: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }

        fn release(&self) {
            self.gate.add_permits(1_000);
        }
    }

    #[async_trait::async_trait]
    impl StageClient for GatedClient {
        async fn invoke(&self, target: &StageTarget, _content: &str) -> Result<String, RemoteError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.expect("gate closed");
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = match target.assistant_id.as_str() {
                "a1" => "```json\n{\"titulo\": \"Cartão\"}\n```".to_string(),
                "a2" if self.malformed_stage2 => "{\"modulos\": ".to_string(),
                "a2" => "{\"modulos\": [\"hero\"]}".to_string(),
                _ => "{\"modulos\": [\"hero\"], \"icones\": [\"card\"]}".to_string(),
            };
            Ok(reply)
        }
    }

    /// Stage double whose every call panics.
    struct PanickingClient;

    #[async_trait::async_trait]
    impl StageClient for PanickingClient {
        async fn invoke(&self, _target: &StageTarget, _content: &str) -> Result<String, RemoteError> {
            panic!("stage client blew up");
        }
    }

    fn orchestrator(client: Arc<dyn StageClient>) -> Arc<PipelineOrchestrator> {
        Arc::new(
            PipelineOrchestrator::new(client, StageTargets::new("a1", "a2", "a3"))
                .with_retry_policy(RetryPolicy::no_retry()),
        )
    }

    fn config() -> JobRunnerConfig {
        JobRunnerConfig::with_lease(2, 16, Duration::from_secs(30))
    }

    async fn wait_for_terminal(runner: &JobRunner, id: JobId) -> ProcessingJob {
        for _ in 0..500 {
            let job = runner.get(id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not reach a terminal state");
    }

    #[tokio::test]
    async fn submit_returns_processing_then_completes() {
        let store = InMemoryJobStore::arc();
        let client = GatedClient::closed();
        let runner = JobRunner::start(config(), store.clone(), orchestrator(client.clone())).await;

        let job = runner.submit(&format!("  {CONTENT}  ")).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.content, CONTENT);
        assert!(job.started_at.is_some());

        client.release();
        let done = wait_for_terminal(&runner, job.id).await;

        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.stage1_result.is_some());
        assert!(done.stage2_result.is_some());
        assert!(done.stage3_result.is_some());
        assert_eq!(done.final_layout, done.stage3_result);
        assert!(done.completed_at.is_some());
        assert!(done.processing_duration_ms.unwrap() >= 0);
        assert!(done.error_message.is_none());

        runner.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_content_creates_no_job() {
        let store = InMemoryJobStore::arc();
        let runner = JobRunner::start(config(), store.clone(), orchestrator(GatedClient::open())).await;

        let err = runner.submit("   curto   ").await.unwrap_err();
        assert!(matches!(err, RunnerError::Validation(DomainError::Validation(_))));

        let too_long = "a".repeat(LaudaContent::MAX_CHARS + 1);
        assert!(runner.submit(&too_long).await.is_err());
        assert!(store.is_empty());

        runner.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_stage_output_fails_job_without_partial_results() {
        let store = InMemoryJobStore::arc();
        let runner = JobRunner::start(config(), store, orchestrator(GatedClient::malformed_stage2())).await;

        let job = runner.submit(CONTENT).await.unwrap();
        let done = wait_for_terminal(&runner, job.id).await;

        assert_eq!(done.status, JobStatus::Failed);
        let message = done.error_message.unwrap();
        assert!(message.contains("stage 2"), "unexpected message: {message}");
        assert!(done.stage1_result.is_none());
        assert!(done.stage2_result.is_none());
        assert!(done.final_layout.is_none());
        assert!(done.completed_at.is_some());

        runner.shutdown().await;
    }

    #[tokio::test]
    async fn reprocess_is_rejected_while_processing() {
        let store = InMemoryJobStore::arc();
        let client = GatedClient::closed();
        let runner = JobRunner::start(config(), store, orchestrator(client.clone())).await;

        let job = runner.submit(CONTENT).await.unwrap();
        let err = runner.reprocess(job.id).await.unwrap_err();
        assert!(matches!(err, RunnerError::Store(JobStoreError::InvalidState(_))));

        // The original run still completes normally.
        client.release();
        let done = wait_for_terminal(&runner, job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempt, 1);

        runner.shutdown().await;
    }

    #[tokio::test]
    async fn reprocess_restarts_failed_job_in_place() {
        let store = InMemoryJobStore::arc();
        let runner = JobRunner::start(config(), store.clone(), orchestrator(GatedClient::open())).await;

        let mut seeded = ProcessingJob::start(LaudaContent::parse(CONTENT).unwrap(), Utc::now(), Utc::now());
        seeded.status = JobStatus::Failed;
        seeded.error_message = Some("remote open failed".into());
        seeded.completed_at = Some(Utc::now());
        seeded.lease_expires_at = None;
        store.insert_raw(seeded.clone());

        let restarted = runner.reprocess(seeded.id).await.unwrap();
        assert_eq!(restarted.id, seeded.id);
        assert_eq!(restarted.status, JobStatus::Processing);
        assert_eq!(restarted.attempt, 2);
        assert!(restarted.error_message.is_none());

        let done = wait_for_terminal(&runner, seeded.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.content, CONTENT);

        runner.shutdown().await;
    }

    #[tokio::test]
    async fn delete_conflicts_while_processing_then_succeeds() {
        let store = InMemoryJobStore::arc();
        let client = GatedClient::closed();
        let runner = JobRunner::start(config(), store, orchestrator(client.clone())).await;

        let job = runner.submit(CONTENT).await.unwrap();
        assert!(matches!(
            runner.delete(job.id).await,
            Err(RunnerError::Store(JobStoreError::Conflict(_)))
        ));

        client.release();
        wait_for_terminal(&runner, job.id).await;
        runner.delete(job.id).await.unwrap();
        assert!(matches!(
            runner.get(job.id).await,
            Err(RunnerError::Store(JobStoreError::NotFound(_)))
        ));

        runner.shutdown().await;
    }

    #[tokio::test]
    async fn startup_sweep_fails_jobs_with_expired_leases() {
        let store = InMemoryJobStore::arc();
        let now = Utc::now();
        let orphan = ProcessingJob::start(
            LaudaContent::parse(CONTENT).unwrap(),
            now - chrono::Duration::minutes(30),
            now - chrono::Duration::minutes(28),
        );
        store.insert_raw(orphan.clone());

        let runner = JobRunner::start(config(), store.clone(), orchestrator(GatedClient::open())).await;

        let job = runner.get(orphan.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().starts_with(STALE_JOB_PREFIX));

        let restarted = runner.reprocess(orphan.id).await.unwrap();
        assert_eq!(restarted.status, JobStatus::Processing);
        assert_eq!(wait_for_terminal(&runner, orphan.id).await.status, JobStatus::Completed);

        runner.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_keeps_owned_jobs_alive() {
        let store = InMemoryJobStore::arc();
        let client = GatedClient::closed();
        let config = JobRunnerConfig::with_lease(1, 4, Duration::from_millis(300));
        let runner = JobRunner::start(config, store, orchestrator(client.clone())).await;

        let job = runner.submit(CONTENT).await.unwrap();
        let first_lease = job.lease_expires_at.unwrap();

        // Several lease lengths pass while the run is blocked.
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(runner.sweep().await, 0);

        let current = runner.get(job.id).await.unwrap();
        assert_eq!(current.status, JobStatus::Processing);
        assert!(current.lease_expires_at.unwrap() > first_lease);

        client.release();
        assert_eq!(wait_for_terminal(&runner, job.id).await.status, JobStatus::Completed);
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_rejects_submission_without_waiting() {
        let store = InMemoryJobStore::arc();
        let client = GatedClient::closed();
        let config = JobRunnerConfig::with_lease(1, 1, Duration::from_secs(30));
        let runner = JobRunner::start(config, store.clone(), orchestrator(client.clone())).await;

        let running = runner.submit(CONTENT).await.unwrap();
        // The single worker takes the first run off the queue and blocks in stage 1.
        for _ in 0..500 {
            if client.entered.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.entered.load(Ordering::SeqCst), 1);

        let queued = runner.submit(CONTENT).await.unwrap();
        let rejected = tokio::time::timeout(Duration::from_secs(2), runner.submit(CONTENT))
            .await
            .expect("submit waited for queue room");
        assert_eq!(rejected.unwrap_err(), RunnerError::QueueFull);
        assert_eq!(store.len(), 2);

        client.release();
        assert_eq!(wait_for_terminal(&runner, running.id).await.status, JobStatus::Completed);
        assert_eq!(wait_for_terminal(&runner, queued.id).await.status, JobStatus::Completed);

        // Room again once the backlog is drained.
        let later = runner.submit(CONTENT).await.unwrap();
        assert_eq!(wait_for_terminal(&runner, later.id).await.status, JobStatus::Completed);
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_leaves_reprocessed_job_untouched() {
        let store = InMemoryJobStore::arc();
        let client = GatedClient::closed();
        let config = JobRunnerConfig::with_lease(1, 1, Duration::from_secs(30));
        let runner = JobRunner::start(config, store.clone(), orchestrator(client.clone())).await;

        let mut failed = ProcessingJob::start(LaudaContent::parse(CONTENT).unwrap(), Utc::now(), Utc::now());
        failed.status = JobStatus::Failed;
        failed.completed_at = Some(Utc::now());
        failed.lease_expires_at = None;
        store.insert_raw(failed.clone());

        runner.submit(CONTENT).await.unwrap();
        for _ in 0..500 {
            if client.entered.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        runner.submit(CONTENT).await.unwrap();

        assert_eq!(runner.reprocess(failed.id).await.unwrap_err(), RunnerError::QueueFull);
        let current = runner.get(failed.id).await.unwrap();
        assert_eq!(current.status, JobStatus::Failed);
        assert_eq!(current.attempt, 1);

        client.release();
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_stage_fails_the_job_and_keeps_the_worker() {
        let store = InMemoryJobStore::arc();
        let config = JobRunnerConfig::with_lease(1, 4, Duration::from_millis(200));
        let runner = JobRunner::start(config, store, orchestrator(Arc::new(PanickingClient))).await;

        let first = runner.submit(CONTENT).await.unwrap();
        let second = runner.submit(CONTENT).await.unwrap();

        let first = wait_for_terminal(&runner, first.id).await;
        assert_eq!(first.status, JobStatus::Failed);
        let message = first.error_message.clone().unwrap();
        assert!(message.contains("panicked"), "unexpected message: {message}");
        assert!(first.completed_at.is_some());

        // The only worker survived and picked up the next run.
        assert_eq!(wait_for_terminal(&runner, second.id).await.status, JobStatus::Failed);

        // Nothing is left owned, so leases are no longer renewed.
        for _ in 0..100 {
            if runner.owned.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(runner.owned.lock().unwrap().is_empty());

        // The failed job is reprocessable rather than stuck in `processing`.
        let restarted = runner.reprocess(first.id).await.unwrap();
        assert_eq!(restarted.attempt, 2);
        assert_eq!(wait_for_terminal(&runner, first.id).await.status, JobStatus::Failed);

        runner.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_rejects_new_work() {
        let store = InMemoryJobStore::arc();
        let client = GatedClient::open();
        let runner = JobRunner::start(config(), store, orchestrator(client.clone())).await;

        let ids: Vec<JobId> = {
            let mut ids = Vec::new();
            for _ in 0..5 {
                ids.push(runner.submit(CONTENT).await.unwrap().id);
            }
            ids
        };
        runner.shutdown().await;

        for id in ids {
            assert_eq!(runner.get(id).await.unwrap().status, JobStatus::Completed);
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 15);
        assert_eq!(runner.submit(CONTENT).await.unwrap_err(), RunnerError::ShuttingDown);
    }
}
