//! Infrastructure layer: job storage, the job runner, config, external services.

/// Configuration loading and representation.
pub mod config;

/// External service clients/adapters.
pub mod external;

pub mod jobs;
