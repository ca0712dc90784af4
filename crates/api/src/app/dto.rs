use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use laudaflow_core::{DomainError, JobId};
use laudaflow_infra::jobs::{JobFilter, JobStatus, PageRequest, ProcessingJob};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateLaudaRequest {
    pub content: Option<String>,
}

impl CreateLaudaRequest {
    pub fn content(&self) -> Result<&str, DomainError> {
        self.content
            .as_deref()
            .ok_or_else(|| DomainError::validation("content is required"))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: Option<u32>,
    #[serde(alias = "limit")]
    pub page_size: Option<u32>,
    pub status: Option<String>,
}

impl ListQuery {
    pub fn filter(&self) -> Result<JobFilter, DomainError> {
        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<JobStatus>()?),
        };
        Ok(JobFilter { status })
    }

    pub fn page(&self) -> PageRequest {
        PageRequest::new(self.page, self.page_size)
    }
}

// -------------------------
// Response DTOs
// -------------------------

/// Acknowledgement returned by submit and reprocess.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub id: JobId,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
}

impl From<&ProcessingJob> for JobAccepted {
    fn from(job: &ProcessingJob) -> Self {
        Self {
            id: job.id,
            status: job.status,
            started_at: job.started_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn data(data: T) -> Self {
        Self { message: None, data }
    }

    pub fn with_message(message: &'static str, data: T) -> Self {
        Self {
            message: Some(message),
            data,
        }
    }
}
