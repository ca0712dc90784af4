//! `laudaflow-ai`
//!
//! **Responsibility:** the three-stage AI pipeline boundary.
//!
//! This crate is intentionally transport- and storage-agnostic:
//! - Remote stages are reached through the [`StageClient`] trait (HTTP lives in infra).
//! - It never touches job records; callers persist whatever it returns.
//! - Every stage call is retried with a bounded, stateless exponential backoff.

pub mod orchestrator;
pub mod result;
pub mod retry;
pub mod sanitize;
pub mod stage;

pub use orchestrator::PipelineOrchestrator;
pub use result::{JsonObject, PipelineError, PipelineResult};
pub use retry::{retry, RetryPolicy};
pub use sanitize::clean;
pub use stage::{RemoteCause, RemoteError, RemotePhase, Stage, StageClient, StageTarget, StageTargets};
