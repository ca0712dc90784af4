//! Extraction of a JSON payload from free-form model output.

use std::sync::LazyLock;

use regex::Regex;

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)```json\s*").expect("valid json fence pattern"));

static FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```\s*").expect("valid fence pattern"));

/// Strip Markdown code fences and surrounding prose from a model response.
///
/// Removes every "```json" and "```" marker (with the whitespace that follows
/// it), trims, then slices from the first `{` to the last `}` inclusive. When
/// no such pair exists the fence-stripped text is returned as is and the
/// caller's JSON parse reports the problem.
pub fn clean(raw: &str) -> String {
    let without_json_fences = JSON_FENCE.replace_all(raw, "");
    let without_fences = FENCE.replace_all(&without_json_fences, "");
    let trimmed = without_fences.trim();

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => trimmed[start..=end].to_string(),
        _ => trimmed.to_string(),
    }
}
