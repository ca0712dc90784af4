//! Submission text ("lauda") accepted by the pipeline.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Validated, trimmed lauda text.
///
/// Length is measured in characters (not bytes) after trimming surrounding
/// whitespace, and must fall within [`LaudaContent::MIN_CHARS`, `LaudaContent::MAX_CHARS`].
/// The trimmed form is what gets stored and sent to the first stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaudaContent(String);

impl LaudaContent {
    pub const MIN_CHARS: usize = 10;
    pub const MAX_CHARS: usize = 50_000;

    pub fn parse(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.trim();
        let len = trimmed.chars().count();

        if len < Self::MIN_CHARS {
            return Err(DomainError::validation(format!(
                "content must have at least {} characters (got {len})",
                Self::MIN_CHARS
            )));
        }
        if len > Self::MAX_CHARS {
            return Err(DomainError::validation(format!(
                "content must have at most {} characters (got {len})",
                Self::MAX_CHARS
            )));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl AsRef<str> for LaudaContent {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
