//! Error types for the rules crate.

use std::time::Duration;

use twin_core::ConfigError;

use crate::expression::ExpressionError;
use crate::rule::RuleId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuleError {
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Rule {rule_id} action exceeded its {}ms deadline", timeout.as_millis())]
    Timeout { rule_id: RuleId, timeout: Duration },

    #[error("Rule not found: {0}")]
    NotFound(RuleId),

    #[error("Rule {0} was retired before its action ran")]
    Retired(RuleId),

    #[error("Rule run panicked: {0}")]
    Panicked(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RuleError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RuleError::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RuleError::NotFound(_))
    }
}

/// Result type for rule operations
pub type Result<T> = std::result::Result<T, RuleError>;
