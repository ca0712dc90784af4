//! External service clients/adapters.

pub mod openai;

pub use openai::{AssistantsClient, AssistantsConfig};
