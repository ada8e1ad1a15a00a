//! Events published by the rule engine.

use serde::{Deserialize, Serialize};

/// Rule lifecycle event carried on the [`EventBus`](crate::eventbus::EventBus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuleEvent {
    /// A rule condition was evaluated.
    RuleEvaluated {
        rule_id: String,
        rule_label: String,
        node: String,
        condition_met: bool,
        timestamp: i64,
    },

    /// A rule action finished.
    RuleExecuted {
        rule_id: String,
        rule_label: String,
        node: String,
        duration_ms: u64,
        timestamp: i64,
    },

    /// A rule run failed (expression error in the action, timeout or panic).
    RuleFailed {
        rule_id: String,
        rule_label: String,
        node: String,
        error: String,
        timestamp: i64,
    },
}

impl RuleEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RuleEvaluated { .. } => "RuleEvaluated",
            Self::RuleExecuted { .. } => "RuleExecuted",
            Self::RuleFailed { .. } => "RuleFailed",
        }
    }

    pub fn rule_id(&self) -> &str {
        match self {
            Self::RuleEvaluated { rule_id, .. }
            | Self::RuleExecuted { rule_id, .. }
            | Self::RuleFailed { rule_id, .. } => rule_id,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::RuleFailed { .. })
    }
}

/// Event metadata.
///
/// Attached to each event for tracking and correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event ID
    pub event_id: String,
    /// Optional correlation ID (one evaluation run)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Event source (component that published)
    pub source: String,
    /// Event timestamp
    pub timestamp: i64,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_tag() {
        let event = RuleEvent::RuleFailed {
            rule_id: "r1".to_string(),
            rule_label: "Overheat".to_string(),
            node: "boiler".to_string(),
            error: "timeout".to_string(),
            timestamp: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "RuleFailed");
        assert_eq!(event.rule_id(), "r1");
        assert!(event.is_failure());
    }

    #[test]
    fn test_metadata_correlation() {
        let meta = EventMetadata::new("pipeline").with_correlation_id("run-1");
        assert_eq!(meta.correlation_id.as_deref(), Some("run-1"));
        assert!(!meta.event_id.is_empty());
    }
}
