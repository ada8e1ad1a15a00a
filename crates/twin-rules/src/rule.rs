//! Rule definition and per-rule runtime state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, oneshot, watch};
use tokio::time::Instant;
use twin_core::{AttributeId, NodeRef, RuleDefaults};

use crate::error::{Result, RuleError};
use crate::fact::Fact;
use crate::memory::{FactMemory, Validity};

/// Stable identifier of a rule, chosen by whoever registers it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RuleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Configuration of a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDefinition {
    pub id: RuleId,
    pub label: String,
    pub condition: String,
    pub action: String,
    /// Lower values are dispatched first.
    pub priority: i32,
    pub delay_before_evaluation: Duration,
    pub delay_before_execute: Duration,
    pub refractory_period: Duration,
    pub parallel_execution: bool,
    pub clear_facts_after_execution: bool,
    /// `None` runs the action without a deadline.
    pub execution_timeout: Option<Duration>,
    /// Validity applied to facts recorded by this rule.
    pub fact_validity: Validity,
}

impl RuleDefinition {
    /// Definition using the built-in rule defaults.
    pub fn new(
        id: impl Into<RuleId>,
        label: impl Into<String>,
        condition: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self::with_defaults(id, label, condition, action, &RuleDefaults::default())
    }

    /// Definition using engine-configured defaults.
    pub fn with_defaults(
        id: impl Into<RuleId>,
        label: impl Into<String>,
        condition: impl Into<String>,
        action: impl Into<String>,
        defaults: &RuleDefaults,
    ) -> Self {
        let millis = Duration::from_millis;
        Self {
            id: id.into(),
            label: label.into(),
            condition: condition.into(),
            action: action.into(),
            priority: defaults.priority,
            delay_before_evaluation: millis(defaults.delay_before_evaluation_ms),
            delay_before_execute: millis(defaults.delay_before_execute_ms),
            refractory_period: millis(defaults.refractory_period_ms),
            parallel_execution: defaults.parallel_execution,
            clear_facts_after_execution: defaults.clear_facts_after_execution,
            execution_timeout: (defaults.execution_timeout_ms > 0)
                .then(|| millis(defaults.execution_timeout_ms)),
            fact_validity: Validity::from_millis(defaults.valid_delay_ms, defaults.valid_until_ms),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay_before_evaluation(mut self, delay: Duration) -> Self {
        self.delay_before_evaluation = delay;
        self
    }

    pub fn with_delay_before_execute(mut self, delay: Duration) -> Self {
        self.delay_before_execute = delay;
        self
    }

    pub fn with_refractory_period(mut self, period: Duration) -> Self {
        self.refractory_period = period;
        self
    }

    pub fn with_parallel_execution(mut self, parallel: bool) -> Self {
        self.parallel_execution = parallel;
        self
    }

    pub fn with_clear_facts_after_execution(mut self, clear: bool) -> Self {
        self.clear_facts_after_execution = clear;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_fact_validity(mut self, validity: Validity) -> Self {
        self.fact_validity = validity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(RuleError::Validation("rule id must not be empty".to_string()));
        }
        if self.condition.trim().is_empty() {
            return Err(RuleError::Validation(format!(
                "rule {} has an empty condition",
                self.id
            )));
        }
        if self.execution_timeout == Some(Duration::ZERO) {
            return Err(RuleError::Validation(format!(
                "rule {} has a zero execution timeout; use None to disable it",
                self.id
            )));
        }
        Ok(())
    }

    /// Whether any stage of the pipeline is deferred.
    pub fn is_deferred(&self) -> bool {
        !self.delay_before_evaluation.is_zero() || !self.delay_before_execute.is_zero()
    }
}

/// Counters of a rule since it was (re)registered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStats {
    pub trigger_count: u64,
    pub execution_count: u64,
    pub failure_count: u64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub last_executed: Option<DateTime<Utc>>,
}

/// A registered rule: definition plus runtime state.
///
/// Replacing a rule in the registry creates a fresh instance, so all of the
/// state below starts over.
pub struct Rule {
    definition: RuleDefinition,
    facts: FactMemory,
    runners: AtomicUsize,
    released: Notify,
    dirty: AtomicBool,
    paused: AtomicBool,
    last_completed: Mutex<Option<Instant>>,
    pending: Mutex<Option<(u64, oneshot::Sender<()>)>>,
    generation: AtomicU64,
    retired: watch::Sender<bool>,
    stats: Mutex<RuleStats>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.definition.id)
            .field("label", &self.definition.label)
            .field("priority", &self.definition.priority)
            .field("runners", &self.runners())
            .field("facts", &self.facts.len())
            .finish()
    }
}

impl Rule {
    pub fn new(definition: RuleDefinition) -> Self {
        Self {
            definition,
            facts: FactMemory::new(),
            runners: AtomicUsize::new(0),
            released: Notify::new(),
            dirty: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            last_completed: Mutex::new(None),
            pending: Mutex::new(None),
            generation: AtomicU64::new(0),
            retired: watch::channel(false).0,
            stats: Mutex::new(RuleStats::default()),
        }
    }

    pub fn id(&self) -> &RuleId {
        &self.definition.id
    }

    pub fn label(&self) -> &str {
        &self.definition.label
    }

    pub fn condition(&self) -> &str {
        &self.definition.condition
    }

    pub fn action(&self) -> &str {
        &self.definition.action
    }

    pub fn priority(&self) -> i32 {
        self.definition.priority
    }

    pub fn definition(&self) -> &RuleDefinition {
        &self.definition
    }

    pub fn facts(&self) -> &FactMemory {
        &self.facts
    }

    /// Number of in-flight runs.
    pub fn runners(&self) -> usize {
        self.runners.load(Ordering::SeqCst)
    }

    /// Whether facts were recorded since the condition was last evaluated.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_evaluated(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn stats(&self) -> RuleStats {
        self.stats.lock().clone()
    }

    /// Record the trigger value as a fact named after the attribute.
    pub fn record_fact(&self, node: &NodeRef, attribute: &AttributeId, value: Value) {
        self.facts.record(
            node.clone(),
            Fact::new(attribute.as_str(), value),
            self.definition.fact_validity,
        );
        self.dirty.store(true, Ordering::SeqCst);
        let mut stats = self.stats.lock();
        stats.trigger_count += 1;
        stats.last_triggered = Some(Utc::now());
    }

    /// Claim a runner slot.
    ///
    /// Non-parallel rules admit a single runner; `None` means the rule is
    /// busy and the caller must drop its notification.
    pub fn try_acquire_runner(self: &Arc<Self>) -> Option<RunnerGuard> {
        if self.definition.parallel_execution {
            self.runners.fetch_add(1, Ordering::SeqCst);
        } else if self
            .runners
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        Some(RunnerGuard { rule: self.clone() })
    }

    /// Claim a runner slot, waiting for the current runner to finish.
    pub async fn acquire_runner(self: &Arc<Self>) -> RunnerGuard {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(guard) = self.try_acquire_runner() {
                return guard;
            }
            released.await;
        }
    }

    /// Whether `now` falls inside the refractory window of the last completed action.
    pub fn in_refractory(&self, now: Instant) -> bool {
        if self.definition.refractory_period.is_zero() {
            return false;
        }
        match *self.last_completed.lock() {
            Some(done) => now.saturating_duration_since(done) < self.definition.refractory_period,
            None => false,
        }
    }

    /// Note that an action attempt finished.
    pub(crate) fn mark_completed(&self, success: bool) {
        *self.last_completed.lock() = Some(Instant::now());
        let mut stats = self.stats.lock();
        if success {
            stats.execution_count += 1;
            stats.last_executed = Some(Utc::now());
        } else {
            stats.failure_count += 1;
        }
    }

    pub(crate) fn mark_failed(&self) {
        self.stats.lock().failure_count += 1;
    }

    /// Install a new pending deferred evaluation, cancelling the previous one.
    pub(crate) fn supersede_pending(&self) -> (u64, oneshot::Receiver<()>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        let previous = self.pending.lock().replace((generation, tx));
        if let Some((old, cancel)) = previous {
            tracing::debug!(rule_id = %self.id(), generation = old, "deferred evaluation superseded");
            let _ = cancel.send(());
        }
        (generation, rx)
    }

    /// Clear the pending slot if it still belongs to `generation`.
    pub(crate) fn finish_pending(&self, generation: u64) {
        let mut pending = self.pending.lock();
        if matches!(*pending, Some((g, _)) if g == generation) {
            pending.take();
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Cancel every deferred stage of this instance. Called when the rule
    /// is replaced or deregistered.
    pub(crate) fn retire(&self) {
        self.retired.send_replace(true);
        if let Some((_, cancel)) = self.pending.lock().take() {
            let _ = cancel.send(());
        }
    }

    pub fn is_retired(&self) -> bool {
        *self.retired.borrow()
    }

    pub(crate) fn retired_signal(&self) -> watch::Receiver<bool> {
        self.retired.subscribe()
    }
}

/// Held for the duration of one run; releases the runner slot on drop.
pub struct RunnerGuard {
    rule: Arc<Rule>,
}

impl Drop for RunnerGuard {
    fn drop(&mut self) {
        self.rule.runners.fetch_sub(1, Ordering::SeqCst);
        self.rule.released.notify_waiters();
    }
}
