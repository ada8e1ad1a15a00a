//! Engine configuration.
//!
//! Default values and environment variable names live in constant modules so
//! that embedders, tests and the engine share a single definition. Every
//! engine instance owns its own [`EngineConfig`]; nothing here is
//! process-global.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default values.
pub mod defaults {
    /// Duplicate-trigger suppression window of the dispatch queue.
    pub const HYSTERESIS_MS: u64 = 1000;
    /// Period of queue cleanup and fact-memory sweeps.
    pub const HOUSEKEEPING_INTERVAL_MS: u64 = 5000;
    /// Number of consumers draining the dispatch queue.
    pub const DISPATCH_WORKERS: usize = 2;
    /// Maximum number of retained execution records.
    pub const HISTORY_SIZE: usize = 1000;
    /// Characters of a fact value shown in logs before truncation.
    pub const FACT_MAX_VALUE_LEN: usize = 64;

    pub const PRIORITY: i32 = 100;
    pub const VALID_DELAY_MS: i64 = 0;
    /// `-1` means the fact never expires.
    pub const VALID_UNTIL_MS: i64 = -1;
}

/// Environment variable names.
pub mod env_vars {
    pub const HYSTERESIS_MS: &str = "TWIN_RULES_HYSTERESIS_MS";
    pub const HOUSEKEEPING_INTERVAL_MS: &str = "TWIN_RULES_HOUSEKEEPING_INTERVAL_MS";
    pub const DISPATCH_WORKERS: &str = "TWIN_RULES_DISPATCH_WORKERS";
    pub const HISTORY_SIZE: &str = "TWIN_RULES_HISTORY_SIZE";
    pub const FACT_MAX_VALUE_LEN: &str = "TWIN_RULES_FACT_MAX_VALUE_LEN";
    pub const DEFAULT_PRIORITY: &str = "TWIN_RULES_DEFAULT_PRIORITY";
    pub const DEFAULT_EXECUTION_TIMEOUT_MS: &str = "TWIN_RULES_DEFAULT_EXECUTION_TIMEOUT_MS";
    pub const DEFAULT_REFRACTORY_PERIOD_MS: &str = "TWIN_RULES_DEFAULT_REFRACTORY_PERIOD_MS";
    pub const DEFAULT_VALID_DELAY_MS: &str = "TWIN_RULES_DEFAULT_VALID_DELAY_MS";
    pub const DEFAULT_VALID_UNTIL_MS: &str = "TWIN_RULES_DEFAULT_VALID_UNTIL_MS";
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration for `{field}`: {message}")]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl ConfigError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Defaults applied to rules registered without an explicit definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleDefaults {
    pub priority: i32,
    pub delay_before_evaluation_ms: u64,
    pub delay_before_execute_ms: u64,
    pub refractory_period_ms: u64,
    pub parallel_execution: bool,
    pub clear_facts_after_execution: bool,
    /// `0` disables the execution deadline.
    pub execution_timeout_ms: u64,
    pub valid_delay_ms: i64,
    /// `-1` means facts never expire.
    pub valid_until_ms: i64,
}

impl Default for RuleDefaults {
    fn default() -> Self {
        Self {
            priority: defaults::PRIORITY,
            delay_before_evaluation_ms: 0,
            delay_before_execute_ms: 0,
            refractory_period_ms: 0,
            parallel_execution: false,
            clear_facts_after_execution: false,
            execution_timeout_ms: 0,
            valid_delay_ms: defaults::VALID_DELAY_MS,
            valid_until_ms: defaults::VALID_UNTIL_MS,
        }
    }
}

/// Rendering options for facts written to logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactFormat {
    pub max_value_len: usize,
}

impl Default for FactFormat {
    fn default() -> Self {
        Self {
            max_value_len: defaults::FACT_MAX_VALUE_LEN,
        }
    }
}

/// Configuration of one rule engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub hysteresis_ms: u64,
    pub housekeeping_interval_ms: u64,
    pub dispatch_workers: usize,
    pub history_size: usize,
    pub rule_defaults: RuleDefaults,
    pub fact_format: FactFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hysteresis_ms: defaults::HYSTERESIS_MS,
            housekeeping_interval_ms: defaults::HOUSEKEEPING_INTERVAL_MS,
            dispatch_workers: defaults::DISPATCH_WORKERS,
            history_size: defaults::HISTORY_SIZE,
            rule_defaults: RuleDefaults::default(),
            fact_format: FactFormat::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `TWIN_RULES_*` environment variables.
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let base = Self::default();
        let rule_defaults = RuleDefaults {
            priority: env_or(env_vars::DEFAULT_PRIORITY, base.rule_defaults.priority),
            execution_timeout_ms: env_or(
                env_vars::DEFAULT_EXECUTION_TIMEOUT_MS,
                base.rule_defaults.execution_timeout_ms,
            ),
            refractory_period_ms: env_or(
                env_vars::DEFAULT_REFRACTORY_PERIOD_MS,
                base.rule_defaults.refractory_period_ms,
            ),
            valid_delay_ms: env_or(
                env_vars::DEFAULT_VALID_DELAY_MS,
                base.rule_defaults.valid_delay_ms,
            ),
            valid_until_ms: env_or(
                env_vars::DEFAULT_VALID_UNTIL_MS,
                base.rule_defaults.valid_until_ms,
            ),
            ..base.rule_defaults
        };

        Self {
            hysteresis_ms: env_or(env_vars::HYSTERESIS_MS, base.hysteresis_ms),
            housekeeping_interval_ms: env_or(
                env_vars::HOUSEKEEPING_INTERVAL_MS,
                base.housekeeping_interval_ms,
            ),
            dispatch_workers: env_or(env_vars::DISPATCH_WORKERS, base.dispatch_workers),
            history_size: env_or(env_vars::HISTORY_SIZE, base.history_size),
            rule_defaults,
            fact_format: FactFormat {
                max_value_len: env_or(
                    env_vars::FACT_MAX_VALUE_LEN,
                    base.fact_format.max_value_len,
                ),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.housekeeping_interval_ms == 0 {
            return Err(ConfigError::new(
                "housekeeping_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.dispatch_workers == 0 {
            return Err(ConfigError::new(
                "dispatch_workers",
                "must be greater than zero",
            ));
        }
        if self.rule_defaults.valid_until_ms < -1 {
            return Err(ConfigError::new(
                "rule_defaults.valid_until_ms",
                "must be -1 (never expires) or non-negative",
            ));
        }
        Ok(())
    }

    pub fn hysteresis(&self) -> Duration {
        Duration::from_millis(self.hysteresis_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hysteresis(), Duration::from_millis(1000));
        assert_eq!(config.rule_defaults.valid_until_ms, -1);
        assert!(!config.rule_defaults.parallel_execution);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"hysteresis_ms": 250, "rule_defaults": {"priority": 5}}"#)
                .unwrap();
        assert_eq!(config.hysteresis_ms, 250);
        assert_eq!(config.rule_defaults.priority, 5);
        assert_eq!(config.rule_defaults.valid_until_ms, -1);
        assert_eq!(config.dispatch_workers, defaults::DISPATCH_WORKERS);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = EngineConfig {
            dispatch_workers: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "dispatch_workers");

        let mut config = EngineConfig::default();
        config.rule_defaults.valid_until_ms = -5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var(env_vars::HISTORY_SIZE, "17");
        std::env::set_var(env_vars::DEFAULT_PRIORITY, "not-a-number");
        let config = EngineConfig::from_env();
        std::env::remove_var(env_vars::HISTORY_SIZE);
        std::env::remove_var(env_vars::DEFAULT_PRIORITY);

        assert_eq!(config.history_size, 17);
        assert_eq!(config.rule_defaults.priority, defaults::PRIORITY);
    }
}
