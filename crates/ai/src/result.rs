use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::stage::{RemoteError, Stage};

/// Structured (mapping) output of a single stage.
pub type JsonObject = Map<String, JsonValue>;

/// Outputs of a complete pipeline run.
///
/// `final_layout` is exactly the third stage's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub stage1: JsonObject,
    pub stage2: JsonObject,
    pub stage3: JsonObject,
    pub final_layout: JsonObject,
}

impl PipelineResult {
    pub fn new(stage1: JsonObject, stage2: JsonObject, stage3: JsonObject) -> Self {
        let final_layout = stage3.clone();
        Self {
            stage1,
            stage2,
            stage3,
            final_layout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("invalid pipeline input: {0}")]
    Validation(String),

    #[error("{stage} failed: {source}")]
    Remote {
        stage: Stage,
        #[source]
        source: RemoteError,
    },

    #[error("failed to parse {stage} response: {message}")]
    Parse { stage: Stage, message: String },
}

impl PipelineError {
    /// The stage that failed, if the failure happened inside a stage.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Validation(_) => None,
            PipelineError::Remote { stage, .. } | PipelineError::Parse { stage, .. } => Some(*stage),
        }
    }
}
