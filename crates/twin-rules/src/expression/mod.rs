//! Expression evaluation contract.
//!
//! Conditions and actions are plain text handed to a pluggable
//! [`ExpressionEvaluator`]. The engine only relies on three things: a
//! condition yields a boolean, an action yields an opaque value, and
//! failures come back as [`ExpressionError`].

mod bindings;
mod script;

pub use bindings::{CancelFlag, CommandBinding, CommandBindings, CommandInvocation};
pub use script::ScriptEvaluator;

use std::sync::Arc;

use serde_json::Value;
use twin_core::{AttributeId, EvaluationType, NodeRef};

use crate::fact::Fact;
use crate::rule::RuleId;

/// Failure to compile or run a condition/action.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("failed to compile `{expression}`: {message}")]
    Compile { expression: String, message: String },

    #[error("failed to evaluate `{expression}`: {message}")]
    Runtime { expression: String, message: String },

    #[error("condition `{expression}` did not produce a boolean")]
    NotBoolean { expression: String },

    #[error("evaluation cancelled")]
    Cancelled,
}

/// Logging sink exposed to scripts.
#[derive(Debug, Clone)]
pub struct ScriptLogger {
    rule_id: RuleId,
}

impl ScriptLogger {
    pub fn new(rule_id: RuleId) -> Self {
        Self { rule_id }
    }

    pub fn log(&self, message: &str) {
        tracing::info!(target: "twin_rules::script", rule_id = %self.rule_id, "{}", message);
    }
}

/// Everything a condition or action can see.
#[derive(Clone)]
pub struct EvaluationContext {
    pub rule_id: RuleId,
    pub node: NodeRef,
    pub attribute: AttributeId,
    pub value: Value,
    pub evaluation_type: EvaluationType,
    /// Currently valid facts of the rule.
    pub facts: Vec<Fact>,
    pub bindings: Arc<CommandBindings>,
    pub cancel: CancelFlag,
    pub logger: ScriptLogger,
}

impl EvaluationContext {
    pub fn new(
        rule_id: RuleId,
        node: NodeRef,
        attribute: AttributeId,
        value: Value,
        evaluation_type: EvaluationType,
    ) -> Self {
        Self {
            logger: ScriptLogger::new(rule_id.clone()),
            rule_id,
            node,
            attribute,
            value,
            evaluation_type,
            facts: Vec::new(),
            bindings: Arc::new(CommandBindings::new()),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_facts(mut self, facts: Vec<Fact>) -> Self {
        self.facts = facts;
        self
    }

    pub fn with_bindings(mut self, bindings: Arc<CommandBindings>) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Pluggable scripting runtime.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` as a boolean predicate.
    fn evaluate_condition(
        &self,
        expression: &str,
        context: &EvaluationContext,
    ) -> Result<bool, ExpressionError>;

    /// Run `expression` for its effect and return its result.
    fn execute_action(
        &self,
        expression: &str,
        context: &EvaluationContext,
    ) -> Result<Value, ExpressionError>;
}
