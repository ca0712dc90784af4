use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One of the three ordered pipeline stages.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Content extraction and structuring.
    Extraction,
    /// Visual module selection.
    Modules,
    /// Icon selection.
    Icons,
}

impl Stage {
    /// 1-based position in the pipeline.
    pub fn number(self) -> u8 {
        match self {
            Stage::Extraction => 1,
            Stage::Modules => 2,
            Stage::Icons => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Modules => "modules",
            Stage::Icons => "icons",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} ({})", self.number(), self.as_str())
    }
}

/// A stage bound to the opaque remote configuration that executes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTarget {
    pub stage: Stage,
    pub assistant_id: String,
}

/// Remote configuration identifiers for all three stages, in pipeline order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTargets {
    targets: [StageTarget; 3],
}

impl StageTargets {
    pub fn new(
        extraction: impl Into<String>,
        modules: impl Into<String>,
        icons: impl Into<String>,
    ) -> Self {
        Self {
            targets: [
                StageTarget {
                    stage: Stage::Extraction,
                    assistant_id: extraction.into(),
                },
                StageTarget {
                    stage: Stage::Modules,
                    assistant_id: modules.into(),
                },
                StageTarget {
                    stage: Stage::Icons,
                    assistant_id: icons.into(),
                },
            ],
        }
    }

    pub fn get(&self, stage: Stage) -> &StageTarget {
        &self.targets[usize::from(stage.number() - 1)]
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageTarget> {
        self.targets.iter()
    }
}

/// Sub-step of a remote stage invocation that failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemotePhase {
    /// Opening the conversational session.
    Open,
    /// Submitting the content message.
    Submit,
    /// Starting the run.
    Run,
    /// Polling the run status.
    Poll,
    /// The run did not finish within the wait ceiling.
    Timeout,
    /// The run reached a failed terminal status.
    RunFailed,
    /// Fetching the session messages.
    Fetch,
    /// The session held no usable assistant message.
    NoResponse,
}

impl RemotePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RemotePhase::Open => "open",
            RemotePhase::Submit => "submit",
            RemotePhase::Run => "run",
            RemotePhase::Poll => "poll",
            RemotePhase::Timeout => "timeout",
            RemotePhase::RunFailed => "run_failed",
            RemotePhase::Fetch => "fetch",
            RemotePhase::NoResponse => "no_response",
        }
    }
}

impl fmt::Display for RemotePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a remote sub-step failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteCause {
    /// A single network request exceeded its request timeout.
    #[error("timeout")]
    Timeout,

    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    /// The remote answered with a body we could not understand.
    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("message content cannot be empty")]
    EmptyContent,

    #[error("run ended with status {0}")]
    RunStatus(String),

    #[error("run still pending after {0:?}")]
    WaitExceeded(Duration),

    #[error("no assistant message in session")]
    MissingMessage,
}

/// Failure of one remote stage invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote {phase} failed: {cause}")]
pub struct RemoteError {
    pub phase: RemotePhase,
    pub cause: RemoteCause,
}

impl RemoteError {
    pub fn new(phase: RemotePhase, cause: RemoteCause) -> Self {
        Self { phase, cause }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, RemoteCause::Timeout | RemoteCause::WaitExceeded(_))
    }
}

/// A single authenticated call to a remote conversational stage.
///
/// Implementations open a fresh session per call, submit `content`, wait for
/// the run to finish and return the raw text of the latest assistant message.
/// They must not retry; retries are layered on top by the orchestrator and
/// every retry therefore opens a new session.
#[async_trait::async_trait]
pub trait StageClient: Send + Sync + 'static {
    async fn invoke(&self, target: &StageTarget, content: &str) -> Result<String, RemoteError>;
}
