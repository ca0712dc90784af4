//! Sequential three-stage pipeline.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value as JsonValue;
use tracing::{debug, error, info};

use crate::result::{JsonObject, PipelineError, PipelineResult};
use crate::retry::{retry, RetryPolicy};
use crate::sanitize::clean;
use crate::stage::{Stage, StageClient, StageTargets};

/// Drives content through the three stages in order.
///
/// Stage N+1 receives stage N's parsed output serialized back to (pretty)
/// JSON text. The first failing stage aborts the run; nothing computed before
/// it is returned.
pub struct PipelineOrchestrator {
    client: Arc<dyn StageClient>,
    targets: StageTargets,
    retry_policy: RetryPolicy,
}

impl PipelineOrchestrator {
    pub fn new(client: Arc<dyn StageClient>, targets: StageTargets) -> Self {
        Self {
            client,
            targets,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub async fn run(&self, content: &str) -> Result<PipelineResult, PipelineError> {
        if content.trim().is_empty() {
            return Err(PipelineError::Validation("lauda content cannot be empty".to_string()));
        }

        let started = Instant::now();
        info!("starting pipeline");

        let outcome = self.run_stages(content).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(_) => info!(elapsed_ms, "pipeline finished"),
            Err(e) => error!(elapsed_ms, error = %e, "pipeline failed"),
        }
        outcome
    }

    async fn run_stages(&self, content: &str) -> Result<PipelineResult, PipelineError> {
        let stage1 = self.run_stage(Stage::Extraction, content).await?;
        let stage2 = self.run_stage(Stage::Modules, &to_stage_input(Stage::Modules, &stage1)?).await?;
        let stage3 = self.run_stage(Stage::Icons, &to_stage_input(Stage::Icons, &stage2)?).await?;
        Ok(PipelineResult::new(stage1, stage2, stage3))
    }

    async fn run_stage(&self, stage: Stage, input: &str) -> Result<JsonObject, PipelineError> {
        let target = self.targets.get(stage);
        info!(stage = stage.as_str(), assistant_id = %target.assistant_id, "running stage");

        let client = self.client.as_ref();
        let label = format!("stage.{}", stage.as_str());
        let raw = retry(&self.retry_policy, &label, move |attempt| {
            debug!(stage = stage.as_str(), attempt, "invoking remote stage");
            client.invoke(target, input)
        })
        .await
        .map_err(|source| PipelineError::Remote { stage, source })?;

        let parsed = parse_stage_output(stage, &raw)?;
        debug!(stage = stage.as_str(), keys = parsed.len(), "stage completed");
        Ok(parsed)
    }
}

/// Render the previous stage's output as the input text of `stage`.
fn to_stage_input(stage: Stage, previous: &JsonObject) -> Result<String, PipelineError> {
    serde_json::to_string_pretty(previous).map_err(|e| PipelineError::Parse {
        stage,
        message: format!("failed to serialize stage input: {e}"),
    })
}

fn parse_stage_output(stage: Stage, raw: &str) -> Result<JsonObject, PipelineError> {
    let cleaned = clean(raw);
    match serde_json::from_str::<JsonValue>(&cleaned) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(other) => Err(PipelineError::Parse {
            stage,
            message: format!("expected a JSON object, got {}", json_kind(&other)),
        }),
        Err(e) => {
            error!(stage = stage.as_str(), response = raw, error = %e, "unparsable stage response");
            Err(PipelineError::Parse {
                stage,
                message: e.to_string(),
            })
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
