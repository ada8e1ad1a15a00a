//! GraphTwin Rules Engine Crate
//!
//! Condition/action rules attached to vertices of a digital-twin graph.
//!
//! ## Features
//!
//! - **Rule Registry**: rules keyed by stable id, attached to vertices as
//!   attribute and property observers
//! - **Evaluation Pipeline**: listener veto, condition, action, with
//!   refractory periods, single-runner guards, cancellable delays and
//!   execution deadlines
//! - **Fact Memory**: per-rule facts with settle time and expiry
//! - **Dispatch Queue**: hysteresis-debounced priority queue drained by
//!   background workers
//! - **Expressions**: pluggable evaluator, `evalexpr` by default, with host
//!   command bindings
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use twin_core::{AttributeId, EngineConfig, InMemoryGraph, NodeRef};
//! use twin_rules::{RuleEngine, RuleId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let graph = Arc::new(InMemoryGraph::new());
//!     let engine = RuleEngine::builder(EngineConfig::from_env())
//!         .observer_host(graph.clone())
//!         .build()?;
//!
//!     engine.bindings().register_fn("alarm", |inv| {
//!         tracing::warn!(node = %inv.node, "temperature alarm");
//!         Ok(serde_json::Value::Null)
//!     });
//!     engine.register_or_update("overheat", "Boiler overheat", "value > 90", "alarm()", 10)?;
//!
//!     let boiler = NodeRef::from("boiler-1");
//!     engine.register_observer(&boiler, &RuleId::from("overheat"))?;
//!     graph
//!         .set_attribute(&boiler, &AttributeId::from("temperature"), 95.into())
//!         .await;
//!
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod error;
pub mod expression;
pub mod fact;
pub mod history;
pub mod listener;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod rule;

pub use engine::{RuleEngine, RuleEngineBuilder};
pub use error::{Result, RuleError};
pub use expression::{
    CancelFlag, CommandBinding, CommandBindings, CommandInvocation, EvaluationContext,
    ExpressionError, ExpressionEvaluator, ScriptEvaluator, ScriptLogger,
};
pub use fact::{Fact, FactDisplay};
pub use history::{ExecutionHistory, RuleExecutionRecord};
pub use listener::{EventBusListener, RuleListener, RuleRun};
pub use memory::{CachedRuleRecord, FactMemory, Validity};
pub use pipeline::{EvaluationOutcome, Pipeline, RuleTrigger, SuppressReason};
pub use queue::{HouseKeepingHandle, HysteresisQueue};
pub use registry::RuleRegistry;
pub use rule::{Rule, RuleDefinition, RuleId, RuleStats, RunnerGuard};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
