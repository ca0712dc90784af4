//! Processing job record, its lifecycle transitions and listing types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use laudaflow_ai::{JsonObject, PipelineResult};
use laudaflow_core::{DomainError, ExpectedVersion, JobId, LaudaContent};

use super::store::JobStoreError;

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created but not yet started (immediately superseded by `Processing`)
    Pending,
    /// Owned by a runner; the pipeline is queued or executing
    Processing,
    /// Pipeline finished; all stage results are present
    Completed,
    /// Pipeline failed; `error_message` is present
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// A persisted pipeline run.
///
/// `attempt` counts (re)starts and identifies the run that currently owns the
/// record; `lease_expires_at` is renewed by the owning runner while the job is
/// `Processing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJob {
    pub id: JobId,
    pub content: String,
    pub status: JobStatus,
    pub stage1_result: Option<JsonObject>,
    pub stage2_result: Option<JsonObject>,
    pub stage3_result: Option<JsonObject>,
    pub final_layout: Option<JsonObject>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_duration_ms: Option<i64>,
    pub attempt: u32,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingJob {
    /// Create a job that starts processing right away (first run).
    pub fn start(content: LaudaContent, now: DateTime<Utc>, lease_expires_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            content: content.into_inner(),
            status: JobStatus::Processing,
            stage1_result: None,
            stage2_result: None,
            stage3_result: None,
            final_layout: None,
            error_message: None,
            started_at: Some(now),
            completed_at: None,
            processing_duration_ms: None,
            attempt: 1,
            lease_expires_at: Some(lease_expires_at),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the job is processing and its lease ran out at `now`.
    ///
    /// A processing job without a lease never had an owner that renews it and
    /// is treated as expired.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.lease_expires_at.is_none_or(|at| at <= now)
    }

    /// Apply a transition in place.
    ///
    /// This is the single read-modify-write used by every store, so the rules
    /// below hold for in-memory and persistent storage alike:
    /// - run writes (`Complete`, `Fail`, `Heartbeat`) require `Processing` and a
    ///   matching run, otherwise they are rejected as stale;
    /// - `Restart` is rejected while the job is `Processing`.
    pub fn apply(&mut self, expected: ExpectedVersion, patch: &JobPatch, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        match patch {
            JobPatch::Complete { result } => {
                self.ensure_current_run(expected)?;
                self.status = JobStatus::Completed;
                self.stage1_result = Some(result.stage1.clone());
                self.stage2_result = Some(result.stage2.clone());
                self.stage3_result = Some(result.stage3.clone());
                self.final_layout = Some(result.final_layout.clone());
                self.error_message = None;
                self.finish(now);
            }
            JobPatch::Fail { message } => {
                self.ensure_current_run(expected)?;
                self.status = JobStatus::Failed;
                self.error_message = Some(message.clone());
                self.finish(now);
            }
            JobPatch::Heartbeat { lease_expires_at } => {
                self.ensure_current_run(expected)?;
                self.lease_expires_at = Some(*lease_expires_at);
            }
            JobPatch::Restart { lease_expires_at } => {
                if self.status == JobStatus::Processing {
                    return Err(JobStoreError::InvalidState(format!(
                        "job {} is already processing",
                        self.id
                    )));
                }
                if !expected.matches(self.attempt) {
                    return Err(JobStoreError::StaleRun {
                        id: self.id,
                        expected,
                        actual: self.attempt,
                    });
                }
                self.status = JobStatus::Processing;
                self.stage1_result = None;
                self.stage2_result = None;
                self.stage3_result = None;
                self.final_layout = None;
                self.error_message = None;
                self.started_at = Some(now);
                self.completed_at = None;
                self.processing_duration_ms = None;
                self.attempt += 1;
                self.lease_expires_at = Some(*lease_expires_at);
            }
        }
        self.updated_at = now;
        Ok(())
    }

    fn ensure_current_run(&self, expected: ExpectedVersion) -> Result<(), JobStoreError> {
        if self.status == JobStatus::Processing && expected.matches(self.attempt) {
            Ok(())
        } else {
            Err(JobStoreError::StaleRun {
                id: self.id,
                expected,
                actual: self.attempt,
            })
        }
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.processing_duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0));
        self.lease_expires_at = None;
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            status: self.status,
            error_message: self.error_message.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            processing_duration_ms: self.processing_duration_ms,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A state change requested by a runner (or by reprocessing).
#[derive(Debug, Clone, PartialEq)]
pub enum JobPatch {
    /// Pipeline succeeded.
    Complete { result: PipelineResult },
    /// Pipeline failed (or the job was reclaimed as stale).
    Fail { message: String },
    /// Re-enter `Processing` from a terminal state as a new run.
    Restart { lease_expires_at: DateTime<Utc> },
    /// Renew the owning run's lease.
    Heartbeat { lease_expires_at: DateTime<Utc> },
}

impl JobPatch {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPatch::Complete { .. } => "complete",
            JobPatch::Fail { .. } => "fail",
            JobPatch::Restart { .. } => "restart",
            JobPatch::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Listing projection: never carries content or stage payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: JobId,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
}

/// 1-based page request with a bounded page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub const DEFAULT_PAGE_SIZE: u32 = 20;
    pub const MAX_PAGE_SIZE: u32 = 100;

    /// Missing values fall back to defaults; out-of-range values are clamped.
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size
                .unwrap_or(Self::DEFAULT_PAGE_SIZE)
                .clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of results plus pagination metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub last_page: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, request: PageRequest) -> Self {
        let pages = total.div_ceil(u64::from(request.page_size)).max(1);
        Self {
            items,
            total,
            page: request.page,
            page_size: request.page_size,
            last_page: u32::try_from(pages).unwrap_or(u32::MAX),
        }
    }
}
