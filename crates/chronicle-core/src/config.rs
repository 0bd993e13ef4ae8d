//! Configuration for the history engine
//!
//! Values come from serde defaults and may be overridden from `CHRONICLE_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::CoreError;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of executions kept in the cache
    #[serde(default = "default_execution_cache_capacity")]
    pub execution_cache_capacity: usize,

    /// Attempts of the conditional-update retry loop
    #[serde(default = "default_conditional_retry_count")]
    pub conditional_retry_count: usize,

    /// Share of the parent's remaining time given to a child operation
    #[serde(default = "default_child_context_fraction")]
    pub child_context_fraction: f64,

    /// Upper bound of a child operation deadline
    #[serde(default = "default_child_context_ceiling_ms")]
    pub child_context_ceiling_ms: u64,

    /// Deadline applied when the caller supplies none
    #[serde(default = "default_operation_timeout_ms")]
    pub default_operation_timeout_ms: u64,

    /// Sticky schedule-to-start timeout when the worker does not send one
    #[serde(default = "default_sticky_schedule_to_start_timeout_secs")]
    pub default_sticky_schedule_to_start_timeout_secs: i32,

    /// Idle time after which a run falls back from its sticky task list
    #[serde(default = "default_sticky_ttl_secs")]
    pub sticky_ttl_secs: u64,
}

fn default_execution_cache_capacity() -> usize {
    512
}

fn default_conditional_retry_count() -> usize {
    5
}

fn default_child_context_fraction() -> f64 {
    0.8
}

fn default_child_context_ceiling_ms() -> u64 {
    5 * 60 * 1000 // 5 minutes
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

fn default_sticky_schedule_to_start_timeout_secs() -> i32 {
    5
}

fn default_sticky_ttl_secs() -> u64 {
    365 * 24 * 60 * 60 // 1 year
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_cache_capacity: default_execution_cache_capacity(),
            conditional_retry_count: default_conditional_retry_count(),
            child_context_fraction: default_child_context_fraction(),
            child_context_ceiling_ms: default_child_context_ceiling_ms(),
            default_operation_timeout_ms: default_operation_timeout_ms(),
            default_sticky_schedule_to_start_timeout_secs: default_sticky_schedule_to_start_timeout_secs(),
            sticky_ttl_secs: default_sticky_ttl_secs(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden from environment variables
    pub fn from_env() -> Result<Self, CoreError> {
        let mut config = Self::default();

        override_from_env("CHRONICLE_EXECUTION_CACHE_CAPACITY", &mut config.execution_cache_capacity);
        override_from_env("CHRONICLE_CONDITIONAL_RETRY_COUNT", &mut config.conditional_retry_count);
        override_from_env("CHRONICLE_CHILD_CONTEXT_FRACTION", &mut config.child_context_fraction);
        override_from_env("CHRONICLE_CHILD_CONTEXT_CEILING_MS", &mut config.child_context_ceiling_ms);
        override_from_env("CHRONICLE_DEFAULT_OPERATION_TIMEOUT_MS", &mut config.default_operation_timeout_ms);
        override_from_env(
            "CHRONICLE_STICKY_SCHEDULE_TO_START_TIMEOUT_SECS",
            &mut config.default_sticky_schedule_to_start_timeout_secs,
        );
        override_from_env("CHRONICLE_STICKY_TTL_SECS", &mut config.sticky_ttl_secs);

        config.validate()?;
        info!(
            cache_capacity = config.execution_cache_capacity,
            retry_count = config.conditional_retry_count,
            "Loaded engine configuration"
        );
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.execution_cache_capacity == 0 {
            return Err(CoreError::ConfigurationError(
                "execution_cache_capacity must be positive".to_string(),
            ));
        }
        if self.conditional_retry_count == 0 {
            return Err(CoreError::ConfigurationError(
                "conditional_retry_count must be positive".to_string(),
            ));
        }
        if !(self.child_context_fraction > 0.0 && self.child_context_fraction <= 1.0) {
            return Err(CoreError::ConfigurationError(format!(
                "child_context_fraction must be in (0, 1], got {}",
                self.child_context_fraction
            )));
        }
        if self.child_context_ceiling_ms == 0 || self.default_operation_timeout_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "timeouts must be positive".to_string(),
            ));
        }
        if self.default_sticky_schedule_to_start_timeout_secs <= 0 {
            return Err(CoreError::ConfigurationError(
                "default_sticky_schedule_to_start_timeout_secs must be positive".to_string(),
            ));
        }
        if self.sticky_ttl_secs == 0 {
            return Err(CoreError::ConfigurationError(
                "sticky_ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Upper bound of a child operation deadline
    pub fn child_context_ceiling(&self) -> Duration {
        Duration::from_millis(self.child_context_ceiling_ms)
    }

    /// Deadline applied when the caller supplies none
    pub fn default_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.default_operation_timeout_ms)
    }

    /// Idle time after which stickiness lapses
    pub fn sticky_ttl(&self) -> Duration {
        Duration::from_secs(self.sticky_ttl_secs)
    }
}

fn override_from_env<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = env::var(name) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Invalid {} value: {}", name, raw),
        }
    }
}
