//! Environment-variable configuration surface.
//!
//! Every threshold is an independent absolute value. In particular
//! `VERA_HANDLE_MAX_IDLE_SECS` and `VERA_HANDLE_MAX_AGE_SECS` are separate
//! knobs; neither is derived from the other.

use crate::pool::HandleHealthPolicy;
use crate::retry::RetryConfig;
use crate::types::{ResearchError, Result};
use std::env;
use std::time::Duration;

/// Full configuration consumed from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote provider settings
    pub provider: ProviderConfig,
    /// Connection handle health thresholds
    pub health: HandleHealthPolicy,
    /// Retry and backoff bounds
    pub retry: RetryConfig,
    /// Orchestrator timing settings
    pub orchestrator: OrchestratorConfig,
}

/// Remote provider settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Opaque API credential; never logged
    pub api_key: String,
    /// API root URL
    pub base_url: String,
    /// Agent identifier for deep-research submissions
    pub research_agent: String,
    /// Model used for follow-up questions
    pub followup_model: String,
    /// Per-call timeout for unary requests
    pub request_timeout: Duration,
}

/// Orchestrator timing settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Delay between completion polls (default: 10 seconds)
    pub poll_interval: Duration,
    /// Overall deadline for one research task (default: 20 minutes)
    pub max_wait: Duration,
    /// Give up on a silent stream after this long without an event and
    /// reconnect from the last confirmed cursor (default: 60 seconds)
    pub idle_timeout: Duration,
    /// Safety timeout around every transport call, including waiting for
    /// the first event of a resumed stream (default: 30 seconds)
    pub request_timeout: Duration,
    /// Whether to resolve citation redirect URLs over the network
    pub resolve_citations: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(1200),
            idle_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            resolve_citations: true,
        }
    }
}

impl Config {
    /// Load configuration from the environment, reading `.env` if present.
    ///
    /// Only `GEMINI_API_KEY` is required; everything else has defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let api_key = env::var("GEMINI_API_KEY")
            .map_err(|_| ResearchError::Config("GEMINI_API_KEY is not set".to_string()))?;

        Ok(Config {
            provider: ProviderConfig {
                api_key,
                base_url: env_or(
                    "VERA_BASE_URL",
                    "https://generativelanguage.googleapis.com/v1beta",
                ),
                research_agent: env_or("VERA_RESEARCH_MODEL", "deep-research"),
                followup_model: env_or("VERA_FOLLOWUP_MODEL", "gemini-3-pro-preview"),
                request_timeout: Duration::from_secs(env_u64("VERA_REQUEST_TIMEOUT_SECS", 30)?),
            },
            health: HandleHealthPolicy::default()
                .with_max_requests(env_u64("VERA_HANDLE_MAX_REQUESTS", 100)?)
                .with_max_age(Duration::from_secs(env_u64("VERA_HANDLE_MAX_AGE_SECS", 1800)?))
                .with_max_idle(Duration::from_secs(env_u64("VERA_HANDLE_MAX_IDLE_SECS", 300)?))
                .with_max_consecutive_failures(env_u64("VERA_HANDLE_MAX_FAILURES", 3)? as u32),
            retry: RetryConfig::default()
                .with_max_attempts(env_u64("VERA_RETRY_MAX_ATTEMPTS", 5)? as u32)
                .with_max_elapsed(Duration::from_secs(env_u64(
                    "VERA_RETRY_MAX_ELAPSED_SECS",
                    300,
                )?))
                .with_base_delay(Duration::from_millis(env_u64("VERA_RETRY_BASE_MS", 500)?)),
            orchestrator: OrchestratorConfig {
                poll_interval: Duration::from_secs(env_u64("VERA_POLL_INTERVAL_SECS", 10)?),
                max_wait: Duration::from_secs(env_u64("VERA_MAX_WAIT_SECS", 1200)?),
                idle_timeout: Duration::from_secs(env_u64("VERA_IDLE_TIMEOUT_SECS", 60)?),
                request_timeout: Duration::from_secs(env_u64("VERA_REQUEST_TIMEOUT_SECS", 30)?),
                resolve_citations: env_or("VERA_RESOLVE_CITATIONS", "true") != "false",
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ResearchError::Config(format!("{key} must be an integer, got '{value}'"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_u64_default_and_parse_error() {
        assert_eq!(env_u64("VERA_TEST_UNSET_VAR", 42).unwrap(), 42);

        env::set_var("VERA_TEST_BAD_VAR", "not-a-number");
        let err = env_u64("VERA_TEST_BAD_VAR", 0).unwrap_err();
        assert!(matches!(err, ResearchError::Config(_)));
        env::remove_var("VERA_TEST_BAD_VAR");
    }

    #[test]
    fn test_orchestrator_defaults_match_provider_limits() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.max_wait, Duration::from_secs(1200));
        assert!(config.resolve_citations);
    }
}
