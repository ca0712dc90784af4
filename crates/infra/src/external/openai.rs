//! HTTP stage client for an OpenAI-Assistants-style remote endpoint.
//!
//! One invocation = one thread: create it, post the content as a user
//! message, start a run against the stage's assistant, poll the run until it
//! leaves `queued`/`in_progress`, then read the newest assistant message.
//! Nothing here retries; the orchestrator does.

use std::time::Duration;

use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, instrument};

use laudaflow_ai::{RemoteCause, RemoteError, RemotePhase, StageClient, StageTarget};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Longest error body kept in a [`RemoteCause::HttpStatus`].
const MAX_ERROR_BODY: usize = 512;

/// Connection and timing settings for [`AssistantsClient`].
#[derive(Clone)]
pub struct AssistantsConfig {
    pub api_key: String,
    pub base_url: String,
    /// Bound on every single HTTP request
    pub request_timeout: Duration,
    /// Pause between run status polls
    pub poll_interval: Duration,
    /// Ceiling on waiting for a run once it has started, poll requests included
    pub max_wait: Duration,
}

impl AssistantsConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(300),
        }
    }
}

impl std::fmt::Debug for AssistantsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistantsConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("max_wait", &self.max_wait)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct Thread {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Run {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    data: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    role: String,
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    text: Option<MessageText>,
}

#[derive(Debug, Deserialize)]
struct MessageText {
    value: String,
}

/// What a run status means for the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Pending,
    Completed,
    Failed,
}

fn run_state(status: &str) -> RunState {
    match status {
        "queued" | "in_progress" => RunState::Pending,
        "completed" => RunState::Completed,
        // failed, cancelled, expired, and anything that needs input we never give.
        _ => RunState::Failed,
    }
}

/// [`StageClient`] over HTTP.
#[derive(Debug, Clone)]
pub struct AssistantsClient {
    http: reqwest::Client,
    config: AssistantsConfig,
}

impl AssistantsClient {
    pub fn new(config: AssistantsConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.config.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send<T: DeserializeOwned>(&self, phase: RemotePhase, request: RequestBuilder) -> Result<T, RemoteError> {
        let resp = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| request_error(phase, e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = truncate(resp.text().await.unwrap_or_default());
            return Err(RemoteError::new(phase, RemoteCause::HttpStatus { status, body }));
        }

        resp.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::new(phase, RemoteCause::Timeout)
            } else {
                RemoteError::new(phase, RemoteCause::Malformed(e.to_string()))
            }
        })
    }

    async fn open_thread(&self) -> Result<String, RemoteError> {
        let thread: Thread = self
            .send(RemotePhase::Open, self.http.post(self.url("/threads")).json(&json!({})))
            .await?;
        debug!(thread_id = %thread.id, "thread opened");
        Ok(thread.id)
    }

    async fn post_message(&self, thread_id: &str, content: &str) -> Result<(), RemoteError> {
        let _: serde_json::Value = self
            .send(
                RemotePhase::Submit,
                self.http
                    .post(self.url(&format!("/threads/{thread_id}/messages")))
                    .json(&json!({ "role": "user", "content": content })),
            )
            .await?;
        Ok(())
    }

    async fn start_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run, RemoteError> {
        self.send(
            RemotePhase::Run,
            self.http
                .post(self.url(&format!("/threads/{thread_id}/runs")))
                .json(&json!({ "assistant_id": assistant_id })),
        )
        .await
    }

    async fn wait_for_run(&self, thread_id: &str, run: Run) -> Result<(), RemoteError> {
        let deadline = Instant::now() + self.config.max_wait;
        let mut status = run.status;

        while run_state(&status) == RunState::Pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.wait_exceeded());
            }
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;

            // A poll may only spend what is left of the wait budget.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.wait_exceeded());
            }
            let capped = remaining < self.config.request_timeout;
            let request = self
                .http
                .get(self.url(&format!("/threads/{thread_id}/runs/{}", run.id)))
                .timeout(remaining.min(self.config.request_timeout));

            let polled: Run = match self.send(RemotePhase::Poll, request).await {
                Ok(polled) => polled,
                Err(e) if capped && e.is_timeout() => return Err(self.wait_exceeded()),
                Err(e) => return Err(e),
            };
            debug!(run_id = %run.id, status = %polled.status, "run polled");
            status = polled.status;
        }

        match run_state(&status) {
            RunState::Completed => Ok(()),
            _ => Err(RemoteError::new(RemotePhase::RunFailed, RemoteCause::RunStatus(status))),
        }
    }

    fn wait_exceeded(&self) -> RemoteError {
        RemoteError::new(RemotePhase::Timeout, RemoteCause::WaitExceeded(self.config.max_wait))
    }

    async fn latest_reply(&self, thread_id: &str) -> Result<String, RemoteError> {
        let messages: MessageList = self
            .send(
                RemotePhase::Fetch,
                self.http.get(self.url(&format!("/threads/{thread_id}/messages"))),
            )
            .await?;

        // The list is newest first.
        messages
            .data
            .into_iter()
            .find(|m| m.role == "assistant")
            .and_then(|m| m.content.into_iter().find_map(|c| c.text))
            .map(|t| t.value)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RemoteError::new(RemotePhase::NoResponse, RemoteCause::MissingMessage))
    }
}

#[async_trait::async_trait]
impl StageClient for AssistantsClient {
    #[instrument(skip(self, target, content), fields(stage = target.stage.as_str(), assistant_id = %target.assistant_id), err)]
    async fn invoke(&self, target: &StageTarget, content: &str) -> Result<String, RemoteError> {
        let thread_id = self.open_thread().await?;

        if content.trim().is_empty() {
            return Err(RemoteError::new(RemotePhase::Submit, RemoteCause::EmptyContent));
        }
        self.post_message(&thread_id, content).await?;

        let run = self.start_run(&thread_id, &target.assistant_id).await?;
        debug!(run_id = %run.id, status = %run.status, "run started");
        self.wait_for_run(&thread_id, run).await?;

        self.latest_reply(&thread_id).await
    }
}

fn request_error(phase: RemotePhase, e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::new(phase, RemoteCause::Timeout)
    } else {
        RemoteError::new(phase, RemoteCause::Transport(e.to_string()))
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
