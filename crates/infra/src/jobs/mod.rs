//! Pipeline jobs: persisted records, storage and the asynchronous runner.
//!
//! ## Design
//!
//! - A job is created directly in `processing` and handed to a bounded worker pool
//! - Each (re)start is a new run; writes from an older run are rejected
//! - Owned runs hold a renewable lease; expired leases are reclaimed as failed
//! - A failed run keeps no partial stage results
//!
//! ## Components
//!
//! - `ProcessingJob`: the persisted record and its transition rules
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `JobRunner`: queue, workers, heartbeat and stale-lease sweep

pub mod postgres;
pub mod runner;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use runner::{JobRunner, JobRunnerConfig, RunnerError};
pub use store::{InMemoryJobStore, JobStore, JobStoreError, STALE_JOB_PREFIX};
pub use types::{JobFilter, JobPatch, JobStatus, JobSummary, Page, PageRequest, ProcessingJob};
