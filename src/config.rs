//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use tracing::warn;

use crate::error::ConfigError;

/// Upper bound on threads per LLM call. Matches the response schema's item cap.
pub const MAX_LLM_BATCH_SIZE: usize = 50;

/// What to do with successful LLM batches when a sibling batch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchFailurePolicy {
    /// Any failed batch aborts the phase; nothing from the phase is committed.
    #[default]
    AllOrNothing,
    /// Commit every batch that succeeded; failed batches stay uncategorized.
    CommitSuccessful,
}

impl FromStr for BatchFailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all_or_nothing" => Ok(Self::AllOrNothing),
            "commit_successful" => Ok(Self::CommitSuccessful),
            other => Err(ConfigError::InvalidValue {
                key: "TRIAGE_BATCH_FAILURE_POLICY".into(),
                message: format!("unknown policy '{other}'"),
            }),
        }
    }
}

/// Classification pipeline configuration.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Threads per LLM request.
    pub batch_size: usize,
    /// Simultaneous LLM requests per orchestrator.
    pub max_concurrent_llm_calls: usize,
    /// Wall-clock limit for a whole run.
    pub run_timeout: Duration,
    /// Default window size when the caller does not pass `n`.
    pub default_window: usize,
    /// Tag appended to the system prompt so outputs can be traced to a prompt revision.
    pub prompt_version: String,
    pub batch_failure_policy: BatchFailurePolicy,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            batch_size: 30,
            max_concurrent_llm_calls: 3,
            run_timeout: Duration::from_secs(300), // 5 minutes
            default_window: 200,
            prompt_version: "v1".to_string(),
            batch_failure_policy: BatchFailurePolicy::AllOrNothing,
        }
    }
}

impl ClassifierConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let batch_size = env_parse("TRIAGE_LLM_BATCH_SIZE", defaults.batch_size)
            .clamp(1, MAX_LLM_BATCH_SIZE);
        let max_concurrent_llm_calls =
            env_parse("TRIAGE_LLM_MAX_CONCURRENCY", defaults.max_concurrent_llm_calls).max(1);
        let run_timeout = Duration::from_secs(env_parse(
            "TRIAGE_RUN_TIMEOUT_SECS",
            defaults.run_timeout.as_secs(),
        ));
        let default_window = env_parse("TRIAGE_DEFAULT_WINDOW", defaults.default_window);
        let prompt_version =
            std::env::var("TRIAGE_PROMPT_VERSION").unwrap_or(defaults.prompt_version);
        let batch_failure_policy = env_parse(
            "TRIAGE_BATCH_FAILURE_POLICY",
            defaults.batch_failure_policy,
        );

        Self {
            batch_size,
            max_concurrent_llm_calls,
            run_timeout,
            default_window,
            prompt_version,
            batch_failure_policy,
        }
    }
}

/// Server configuration for the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: String,
    pub openai_api_key: SecretString,
    pub openai_model: String,
    pub openai_base_url: Option<String>,
    /// Per-request timeout for the remote model.
    pub llm_timeout: Duration,
}

impl ServerConfig {
    /// Build config from environment variables. `OPENAI_API_KEY` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENAI_API_KEY".into()))?;

        Ok(Self {
            port: env_parse("TRIAGE_PORT", 4000),
            db_path: std::env::var("TRIAGE_DB_PATH")
                .unwrap_or_else(|_| "./data/inbox-triage.db".to_string()),
            openai_api_key: SecretString::from(api_key),
            openai_model: std::env::var("OPENAI_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            openai_base_url: std::env::var("OPENAI_BASE_URL").ok(),
            llm_timeout: Duration::from_secs(env_parse("TRIAGE_LLM_TIMEOUT_SECS", 20)),
        })
    }
}

/// Parse an env var, keeping `default` when it is absent or malformed.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Ignoring unparsable configuration value");
                default
            }
        },
        Err(_) => default,
    }
}
