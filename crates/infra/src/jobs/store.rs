//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use laudaflow_core::{ExpectedVersion, JobId};

use super::types::{JobFilter, JobPatch, JobStatus, JobSummary, Page, PageRequest, ProcessingJob};

/// Message prefix recorded on jobs reclaimed by the stale-lease sweep.
pub const STALE_JOB_PREFIX: &str = "StaleJob";

/// Job store abstraction.
///
/// Every mutation of an existing job goes through [`JobStore::update`], which
/// implementations must apply as one atomic read-modify-write per job id.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a freshly created job.
    async fn create(&self, job: &ProcessingJob) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<ProcessingJob, JobStoreError>;

    /// Apply a transition and return the updated record.
    async fn update(&self, id: JobId, expected: ExpectedVersion, patch: JobPatch) -> Result<ProcessingJob, JobStoreError>;

    /// List summaries ordered by `started_at` (newest first).
    async fn list(&self, filter: JobFilter, page: PageRequest) -> Result<Page<JobSummary>, JobStoreError>;

    /// Remove a job; refused while it is processing.
    async fn delete(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Fail every processing job whose lease expired at `now`.
    async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<Vec<ProcessingJob>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("stale run for job {id} (expected: {expected:?}, actual: {actual})")]
    StaleRun {
        id: JobId,
        expected: ExpectedVersion,
        actual: u32,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

pub(crate) fn stale_message(job: &ProcessingJob) -> String {
    let lease = job
        .lease_expires_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    format!("{STALE_JOB_PREFIX}: lease expired at {lease} without a terminal result (run {})", job.attempt)
}

pub(crate) fn delete_conflict(id: JobId) -> JobStoreError {
    JobStoreError::Conflict(format!("job {id} is processing and cannot be deleted"))
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, ProcessingJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a record as is, bypassing lifecycle rules (seeding/tests).
    pub fn insert_raw(&self, job: ProcessingJob) {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id, job);
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &ProcessingJob) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> Result<ProcessingJob, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.get(&id).cloned().ok_or(JobStoreError::NotFound(id))
    }

    async fn update(&self, id: JobId, expected: ExpectedVersion, patch: JobPatch) -> Result<ProcessingJob, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        // Work on a copy so a rejected transition leaves the record untouched.
        let mut next = job.clone();
        next.apply(expected, &patch, Utc::now())?;
        *job = next.clone();
        Ok(next)
    }

    async fn list(&self, filter: JobFilter, page: PageRequest) -> Result<Page<JobSummary>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<&ProcessingJob> = jobs
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .collect();

        // Newest first; ties broken by id so paging is stable.
        matching.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.id.as_uuid().cmp(a.id.as_uuid()))
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
            .take(page.page_size as usize)
            .map(ProcessingJob::summary)
            .collect();

        Ok(Page::new(items, total, page))
    }

    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        match jobs.get(&id) {
            None => Err(JobStoreError::NotFound(id)),
            Some(job) if job.status == JobStatus::Processing => Err(delete_conflict(id)),
            Some(_) => {
                jobs.remove(&id);
                Ok(())
            }
        }
    }

    async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<Vec<ProcessingJob>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let mut reclaimed = Vec::new();

        for job in jobs.values_mut().filter(|j| j.lease_expired(now)) {
            let run = ExpectedVersion::Exact(job.attempt);
            let patch = JobPatch::Fail {
                message: stale_message(job),
            };
            job.apply(run, &patch, now)?;
            reclaimed.push(job.clone());
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use laudaflow_ai::PipelineResult;
    use laudaflow_core::LaudaContent;
    use serde_json::json;

    fn new_job(started_at: DateTime<Utc>) -> ProcessingJob {
        let content = LaudaContent::parse("Cartão com limite proporcional ao valor investido").unwrap();
        ProcessingJob::start(content, started_at, started_at + Duration::seconds(120))
    }

    fn object(value: serde_json::Value) -> laudaflow_ai::JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let store = InMemoryJobStore::new();
        let job = new_job(Utc::now());

        let id = store.create(&job).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), job);
        assert!(matches!(
            store.create(&job).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();
        assert_eq!(store.get(id).await.unwrap_err(), JobStoreError::NotFound(id));
    }

    #[tokio::test]
    async fn rejected_update_leaves_record_untouched() {
        let store = InMemoryJobStore::new();
        let job = new_job(Utc::now());
        store.create(&job).await.unwrap();

        let err = store
            .update(job.id, ExpectedVersion::Exact(2), JobPatch::Fail { message: "late".into() })
            .await
            .unwrap_err();

        assert!(matches!(err, JobStoreError::StaleRun { .. }));
        assert_eq!(store.get(job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn only_one_terminal_write_wins() {
        let store = InMemoryJobStore::new();
        let job = new_job(Utc::now());
        store.create(&job).await.unwrap();

        let result = PipelineResult::new(object(json!({"a": 1})), object(json!({"b": 2})), object(json!({"c": 3})));
        store
            .update(job.id, ExpectedVersion::Exact(1), JobPatch::Complete { result })
            .await
            .unwrap();
        let second = store
            .update(job.id, ExpectedVersion::Exact(1), JobPatch::Fail { message: "x".into() })
            .await;

        assert!(matches!(second, Err(JobStoreError::StaleRun { .. })));
        assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn delete_refuses_processing_jobs() {
        let store = InMemoryJobStore::new();
        let job = new_job(Utc::now());
        store.create(&job).await.unwrap();

        assert!(matches!(store.delete(job.id).await, Err(JobStoreError::Conflict(_))));

        store
            .update(job.id, ExpectedVersion::Exact(1), JobPatch::Fail { message: "x".into() })
            .await
            .unwrap();
        store.delete(job.id).await.unwrap();
        assert!(matches!(store.get(job.id).await, Err(JobStoreError::NotFound(_))));
        assert!(matches!(store.delete(job.id).await, Err(JobStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_filters_pages_and_orders_newest_first() {
        let store = InMemoryJobStore::new();
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let job = new_job(base + Duration::seconds(i));
            store.create(&job).await.unwrap();
            ids.push(job.id);
        }
        store
            .update(ids[0], ExpectedVersion::Exact(1), JobPatch::Fail { message: "x".into() })
            .await
            .unwrap();

        let first = store
            .list(JobFilter::default(), PageRequest::new(Some(1), Some(2)))
            .await
            .unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.last_page, 3);
        assert_eq!(first.items.iter().map(|s| s.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);

        let last = store
            .list(JobFilter::default(), PageRequest::new(Some(3), Some(2)))
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].id, ids[0]);

        let failed = store
            .list(
                JobFilter {
                    status: Some(JobStatus::Failed),
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(failed.total, 1);
        assert_eq!(failed.items[0].error_message.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn reclaim_fails_only_expired_processing_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let mut expired = new_job(now - Duration::minutes(10));
        expired.lease_expires_at = Some(now - Duration::seconds(1));
        let live = new_job(now);
        store.insert_raw(expired.clone());
        store.create(&live).await.unwrap();

        let reclaimed = store.reclaim_stale(now).await.unwrap();

        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, expired.id);
        let stored = store.get(expired.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_message.unwrap().starts_with(STALE_JOB_PREFIX));
        assert_eq!(store.get(live.id).await.unwrap().status, JobStatus::Processing);

        // Reclaimed jobs can be reprocessed.
        let restarted = store
            .update(
                expired.id,
                ExpectedVersion::Any,
                JobPatch::Restart {
                    lease_expires_at: now + Duration::seconds(120),
                },
            )
            .await
            .unwrap();
        assert_eq!(restarted.attempt, 2);
    }
}
