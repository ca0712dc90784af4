//! Configuration loading and representation.
//!
//! Everything comes from environment variables and is validated once at
//! startup; a bad or missing value is fatal there rather than at request time.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use laudaflow_ai::{RetryPolicy, StageTargets};

use crate::external::openai::{AssistantsConfig, DEFAULT_BASE_URL};
use crate::jobs::JobRunnerConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Remote endpoint settings.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub assistants: AssistantsConfig,
    pub targets: StageTargets,
    pub max_attempts: u32,
}

impl RemoteConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.max_attempts)
    }
}

/// Job store selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    InMemory,
    Postgres { database_url: String },
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub runner: JobRunnerConfig,
    pub store: StoreConfig,
    pub bind_addr: SocketAddr,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let api_key = env.required("OPENAI_API_KEY")?;
        let targets = StageTargets::new(
            env.required("ASSISTANT_1_ID")?,
            env.required("ASSISTANT_2_ID")?,
            env.required("ASSISTANT_3_ID")?,
        );

        let assistants = AssistantsConfig {
            api_key,
            base_url: env.optional("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            request_timeout: Duration::from_secs(env.positive("STAGE_REQUEST_TIMEOUT_SECS", 60)?),
            poll_interval: Duration::from_millis(env.positive("STAGE_POLL_INTERVAL_MS", 2_000)?),
            max_wait: Duration::from_secs(env.positive("STAGE_MAX_WAIT_SECS", 300)?),
        };
        let max_attempts = env.positive("STAGE_MAX_ATTEMPTS", 3)?;

        let runner = JobRunnerConfig::with_lease(
            env.positive("WORKER_COUNT", 4)?,
            env.positive("QUEUE_CAPACITY", 256)?,
            Duration::from_secs(env.positive("JOB_LEASE_SECS", 120)?),
        );

        let store = if env.flag("USE_PERSISTENT_STORES")? {
            StoreConfig::Postgres {
                database_url: env.required("DATABASE_URL")?,
            }
        } else {
            StoreConfig::InMemory
        };

        let bind_addr = env.parsed("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?;

        Ok(Self {
            remote: RemoteConfig {
                assistants,
                targets,
                max_attempts,
            },
            runner,
            store,
            bind_addr,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank, trimmed.
    fn optional(&self, var: &'static str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing(var))
    }

    fn parsed<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(var) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: format!("{raw:?}: {e}"),
            }),
        }
    }

    fn positive<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default,
        T::Err: std::fmt::Display,
    {
        let value = self.parsed(var, default)?;
        if value > T::default() {
            Ok(value)
        } else {
            Err(ConfigError::Invalid {
                var,
                reason: "must be greater than zero".to_string(),
            })
        }
    }

    fn flag(&self, var: &'static str) -> Result<bool, ConfigError> {
        match self.optional(var).map(|v| v.to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var,
                    reason: format!("{v:?} is not a boolean"),
                }),
            },
        }
    }
}
