//! Bounded execution history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use twin_core::EvaluationType;

use crate::rule::RuleId;

/// Outcome of one pipeline run that got past the veto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleExecutionRecord {
    /// Rule that was evaluated.
    pub rule_id: RuleId,
    /// Rule label at the time of the run.
    pub label: String,
    pub evaluation_type: EvaluationType,
    /// Condition result (`false` when the condition failed to evaluate).
    pub condition: bool,
    /// Whether the action was attempted.
    pub executed: bool,
    /// Whether the run completed without error.
    pub success: bool,
    /// Error message if the run failed.
    pub error: Option<String>,
    /// Run duration.
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Ring buffer of the most recent runs across all rules.
pub struct ExecutionHistory {
    records: RwLock<VecDeque<RuleExecutionRecord>>,
    capacity: usize,
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, record: RuleExecutionRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.write();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// All records, oldest first.
    pub fn all(&self) -> Vec<RuleExecutionRecord> {
        self.records.read().iter().cloned().collect()
    }

    pub fn for_rule(&self, rule_id: &RuleId) -> Vec<RuleExecutionRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| &r.rule_id == rule_id)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(rule: &str) -> RuleExecutionRecord {
        RuleExecutionRecord {
            rule_id: RuleId::from(rule),
            label: rule.to_uppercase(),
            evaluation_type: EvaluationType::Attribute,
            condition: true,
            executed: true,
            success: true,
            error: None,
            duration_ms: 1,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let history = ExecutionHistory::new(2);
        history.push(record("a"));
        history.push(record("b"));
        history.push(record("c"));

        let ids: Vec<_> = history.all().into_iter().map(|r| r.rule_id).collect();
        assert_eq!(ids, vec![RuleId::from("b"), RuleId::from("c")]);
    }

    #[test]
    fn test_history_per_rule() {
        let history = ExecutionHistory::new(10);
        history.push(record("a"));
        history.push(record("b"));
        history.push(record("a"));
        assert_eq!(history.for_rule(&RuleId::from("a")).len(), 2);

        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let history = ExecutionHistory::new(0);
        history.push(record("a"));
        assert_eq!(history.len(), 0);
    }
}
