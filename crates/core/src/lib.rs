//! `laudaflow-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod content;
pub mod error;
pub mod id;
pub mod version;

pub use content::LaudaContent;
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use version::ExpectedVersion;
