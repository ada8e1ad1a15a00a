//! Pipeline listeners.
//!
//! Listeners observe every stage of a rule run. All callbacks default to
//! no-ops so an implementation only overrides what it needs. The only
//! callback that influences the pipeline is [`RuleListener::before_evaluate`],
//! whose `false` return vetoes the run.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;
use twin_core::{AttributeId, EvaluationType, EventBus, EventMetadata, NodeRef, RuleEvent};

use crate::error::RuleError;
use crate::expression::ExpressionError;
use crate::rule::RuleId;

/// The run a listener callback refers to.
#[derive(Debug, Clone)]
pub struct RuleRun {
    pub rule_id: RuleId,
    pub label: String,
    pub node: NodeRef,
    pub attribute: AttributeId,
    pub value: Value,
    pub evaluation_type: EvaluationType,
    /// Unique per run; shared by every callback of the same run.
    pub correlation_id: String,
    pub started: Instant,
}

pub trait RuleListener: Send + Sync {
    /// Return `false` to abort the run before the condition is evaluated.
    fn before_evaluate(&self, _run: &RuleRun) -> bool {
        true
    }

    fn after_evaluate(&self, _run: &RuleRun, _condition: bool) {}

    fn before_execute(&self, _run: &RuleRun) {}

    fn after_execute(&self, _run: &RuleRun, _result: &Value) {}

    /// The condition failed to compile or run; it is treated as `false`.
    fn on_evaluation_error(&self, _run: &RuleRun, _error: &ExpressionError) {}

    fn on_failure(&self, _run: &RuleRun, _error: &RuleError) {}

    /// The run completed without error.
    fn on_success(&self, _run: &RuleRun, _condition: bool) {}
}

/// Publishes pipeline milestones on an [`EventBus`].
pub struct EventBusListener {
    bus: Arc<EventBus>,
}

impl EventBusListener {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    fn publish(&self, run: &RuleRun, event: RuleEvent) {
        let metadata =
            EventMetadata::new("twin-rules").with_correlation_id(run.correlation_id.clone());
        self.bus.publish_with_metadata(event, metadata);
    }
}

impl RuleListener for EventBusListener {
    fn after_evaluate(&self, run: &RuleRun, condition: bool) {
        self.publish(
            run,
            RuleEvent::RuleEvaluated {
                rule_id: run.rule_id.to_string(),
                rule_label: run.label.clone(),
                node: run.node.to_string(),
                condition_met: condition,
                timestamp: chrono::Utc::now().timestamp(),
            },
        );
    }

    fn after_execute(&self, run: &RuleRun, _result: &Value) {
        self.publish(
            run,
            RuleEvent::RuleExecuted {
                rule_id: run.rule_id.to_string(),
                rule_label: run.label.clone(),
                node: run.node.to_string(),
                duration_ms: run.started.elapsed().as_millis() as u64,
                timestamp: chrono::Utc::now().timestamp(),
            },
        );
    }

    fn on_failure(&self, run: &RuleRun, error: &RuleError) {
        self.publish(
            run,
            RuleEvent::RuleFailed {
                rule_id: run.rule_id.to_string(),
                rule_label: run.label.clone(),
                node: run.node.to_string(),
                error: error.to_string(),
                timestamp: chrono::Utc::now().timestamp(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run() -> RuleRun {
        RuleRun {
            rule_id: RuleId::from("r1"),
            label: "Overheat".to_string(),
            node: NodeRef::from("boiler"),
            attribute: AttributeId::from("temperature"),
            value: json!(90),
            evaluation_type: EvaluationType::Attribute,
            correlation_id: "run-1".to_string(),
            started: Instant::now(),
        }
    }

    struct Silent;
    impl RuleListener for Silent {}

    #[test]
    fn test_default_callbacks_do_not_veto() {
        assert!(Silent.before_evaluate(&run()));
    }

    #[tokio::test]
    async fn test_event_bus_listener_publishes() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let listener = EventBusListener::new(bus.clone());

        let run = run();
        listener.after_evaluate(&run, true);
        listener.on_failure(
            &run,
            &RuleError::Timeout {
                rule_id: run.rule_id.clone(),
                timeout: std::time::Duration::from_millis(5),
            },
        );

        let (first, meta) = rx.recv().await.unwrap();
        assert_eq!(first.type_name(), "RuleEvaluated");
        assert_eq!(meta.correlation_id.as_deref(), Some("run-1"));

        let (second, _) = rx.recv().await.unwrap();
        assert!(second.is_failure());
        assert_eq!(second.rule_id(), "r1");
    }
}
