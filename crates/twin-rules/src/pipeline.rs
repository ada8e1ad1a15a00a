//! Evaluation pipeline.
//!
//! One run per change notification:
//!
//! ```text
//! Idle -> BeforeEvaluate -> Evaluating -> ConditionFalse -> Idle
//!                                      -> ConditionTrue -> BeforeExecute -> Executing -> AfterExecute -> Idle
//! ```
//!
//! Every failure after the veto is contained here and reported through the
//! listeners. Callers only ever see an [`EvaluationOutcome`].

use std::any::Any;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinError;
use tokio::time::Instant;
use twin_core::{AttributeId, EvaluationType, FactFormat, NodeRef};

use crate::error::RuleError;
use crate::expression::{
    CancelFlag, CommandBindings, EvaluationContext, ExpressionError, ExpressionEvaluator,
};
use crate::history::{ExecutionHistory, RuleExecutionRecord};
use crate::listener::{RuleListener, RuleRun};
use crate::rule::{Rule, RuleId};

/// A change notification addressed to one rule.
///
/// Identity ignores `value`, so the dispatch queue debounces repeated
/// changes of the same attribute regardless of the new value.
#[derive(Debug, Clone)]
pub struct RuleTrigger {
    pub rule_id: RuleId,
    pub node: NodeRef,
    pub attribute: AttributeId,
    pub value: Value,
    pub evaluation_type: EvaluationType,
}

impl RuleTrigger {
    pub fn new(
        rule_id: RuleId,
        node: NodeRef,
        attribute: AttributeId,
        value: Value,
        evaluation_type: EvaluationType,
    ) -> Self {
        Self {
            rule_id,
            node,
            attribute,
            value,
            evaluation_type,
        }
    }
}

impl PartialEq for RuleTrigger {
    fn eq(&self, other: &Self) -> bool {
        self.rule_id == other.rule_id
            && self.node == other.node
            && self.attribute == other.attribute
            && self.evaluation_type == other.evaluation_type
    }
}

impl Eq for RuleTrigger {}

impl Hash for RuleTrigger {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rule_id.hash(state);
        self.node.hash(state);
        self.attribute.hash(state);
        self.evaluation_type.hash(state);
    }
}

/// Why a notification was dropped without running the pipeline.
///
/// `Refractory` and `Retired` can also end a run after its condition held;
/// listeners then still receive a terminal callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    Paused,
    Refractory,
    /// A non-parallel rule already has a runner.
    Busy,
    /// The rule was replaced or deregistered while the run was deferred.
    Retired,
}

#[derive(Debug, Clone)]
pub enum EvaluationOutcome {
    /// A listener vetoed the run.
    Vetoed,
    Suppressed(SuppressReason),
    /// Scheduled after `delay_before_evaluation`.
    Deferred,
    Completed { condition: bool, executed: bool },
    Failed(RuleError),
}

impl EvaluationOutcome {
    pub fn executed(&self) -> bool {
        matches!(self, Self::Completed { executed: true, .. })
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self, Self::Suppressed(_))
    }
}

/// How a run claims the runner slot of a non-parallel rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Direct notifications are dropped while the rule is busy.
    DropIfBusy,
    /// Dispatched requests wait for the slot.
    Wait,
}

pub struct Pipeline {
    evaluator: Arc<dyn ExpressionEvaluator>,
    bindings: Arc<CommandBindings>,
    listeners: RwLock<Vec<Arc<dyn RuleListener>>>,
    history: Arc<ExecutionHistory>,
    fact_format: FactFormat,
}

impl Pipeline {
    pub fn new(
        evaluator: Arc<dyn ExpressionEvaluator>,
        bindings: Arc<CommandBindings>,
        history: Arc<ExecutionHistory>,
        fact_format: FactFormat,
    ) -> Self {
        Self {
            evaluator,
            bindings,
            listeners: RwLock::new(Vec::new()),
            history,
            fact_format,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn RuleListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove a previously added listener, matched by identity.
    pub fn remove_listener(&self, listener: &Arc<dyn RuleListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| Arc::as_ptr(l) as *const () != target);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Entry point for one direct notification.
    pub async fn run(self: &Arc<Self>, rule: Arc<Rule>, trigger: RuleTrigger) -> EvaluationOutcome {
        self.admit(rule, trigger, Admission::DropIfBusy).await
    }

    /// Entry point for a request taken off the dispatch queue.
    ///
    /// Same as [`Pipeline::run`], except that a busy non-parallel rule makes
    /// the request wait for the current runner instead of dropping it.
    pub async fn run_queued(
        self: &Arc<Self>,
        rule: Arc<Rule>,
        trigger: RuleTrigger,
    ) -> EvaluationOutcome {
        self.admit(rule, trigger, Admission::Wait).await
    }

    async fn admit(
        self: &Arc<Self>,
        rule: Arc<Rule>,
        trigger: RuleTrigger,
        admission: Admission,
    ) -> EvaluationOutcome {
        if rule.is_paused() {
            tracing::debug!(rule_id = %rule.id(), "rule paused, notification dropped");
            return EvaluationOutcome::Suppressed(SuppressReason::Paused);
        }
        if rule.in_refractory(Instant::now()) {
            tracing::debug!(rule_id = %rule.id(), "rule in refractory period, notification dropped");
            return EvaluationOutcome::Suppressed(SuppressReason::Refractory);
        }

        rule.record_fact(&trigger.node, &trigger.attribute, trigger.value.clone());

        let delay = rule.definition().delay_before_evaluation;
        if delay.is_zero() {
            return self.evaluate_now(rule, trigger, admission).await;
        }

        let (generation, cancelled) = rule.supersede_pending();
        let pipeline = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    rule.finish_pending(generation);
                    pipeline.evaluate_now(rule, trigger, admission).await;
                }
                _ = cancelled => {
                    tracing::debug!(rule_id = %rule.id(), generation, "deferred evaluation cancelled");
                }
            }
        });
        EvaluationOutcome::Deferred
    }

    async fn evaluate_now(
        &self,
        rule: Arc<Rule>,
        trigger: RuleTrigger,
        admission: Admission,
    ) -> EvaluationOutcome {
        if rule.is_retired() {
            return EvaluationOutcome::Suppressed(SuppressReason::Retired);
        }
        let _guard = match admission {
            Admission::DropIfBusy => match rule.try_acquire_runner() {
                Some(guard) => guard,
                None => {
                    tracing::debug!(rule_id = %rule.id(), "rule busy, notification dropped");
                    return EvaluationOutcome::Suppressed(SuppressReason::Busy);
                }
            },
            Admission::Wait => {
                let mut retired = rule.retired_signal();
                tokio::select! {
                    guard = rule.acquire_runner() => guard,
                    _ = retired.wait_for(|retired| *retired) => {
                        tracing::debug!(rule_id = %rule.id(), "rule retired while waiting for its runner");
                        return EvaluationOutcome::Suppressed(SuppressReason::Retired);
                    }
                }
            }
        };
        // A previous runner may have completed an action while this one waited.
        if rule.in_refractory(Instant::now()) {
            tracing::debug!(rule_id = %rule.id(), "rule in refractory period, notification dropped");
            return EvaluationOutcome::Suppressed(SuppressReason::Refractory);
        }

        let run = RuleRun {
            rule_id: rule.id().clone(),
            label: rule.label().to_string(),
            node: trigger.node,
            attribute: trigger.attribute,
            value: trigger.value,
            evaluation_type: trigger.evaluation_type,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            started: Instant::now(),
        };
        let listeners = self.listeners.read().clone();

        match AssertUnwindSafe(self.drive(&rule, &run, &listeners))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let error = RuleError::Panicked(panic_message(&*panic));
                tracing::error!(rule_id = %rule.id(), node = %run.node, error = %error, "rule run panicked");
                rule.mark_failed();
                self.report_failure(&run, &listeners, &error);
                self.record(&run, false, false, Some(&error));
                EvaluationOutcome::Failed(error)
            }
        }
    }

    async fn drive(
        &self,
        rule: &Arc<Rule>,
        run: &RuleRun,
        listeners: &[Arc<dyn RuleListener>],
    ) -> EvaluationOutcome {
        for listener in listeners {
            if !listener.before_evaluate(run) {
                tracing::debug!(rule_id = %run.rule_id, node = %run.node, "rule run vetoed");
                return EvaluationOutcome::Vetoed;
            }
        }

        let context = self.context(rule, run, CancelFlag::new());
        rule.mark_evaluated();
        let condition = match self.evaluator.evaluate_condition(rule.condition(), &context) {
            Ok(condition) => {
                notify(run, listeners, "after_evaluate", |l| l.after_evaluate(run, condition));
                condition
            }
            Err(error) => {
                tracing::warn!(rule_id = %run.rule_id, node = %run.node, error = %error, "condition evaluation failed");
                notify(run, listeners, "on_evaluation_error", |l| {
                    l.on_evaluation_error(run, &error)
                });
                notify(run, listeners, "on_success", |l| l.on_success(run, false));
                self.record(run, false, false, Some(&RuleError::Expression(error)));
                return EvaluationOutcome::Completed {
                    condition: false,
                    executed: false,
                };
            }
        };

        if !condition {
            notify(run, listeners, "on_success", |l| l.on_success(run, false));
            self.record(run, false, false, None);
            return EvaluationOutcome::Completed {
                condition: false,
                executed: false,
            };
        }

        // A parallel runner may have completed an action during evaluation.
        if rule.in_refractory(Instant::now()) {
            tracing::debug!(rule_id = %run.rule_id, "rule entered refractory period before execution");
            notify(run, listeners, "on_success", |l| l.on_success(run, true));
            self.record(run, true, false, None);
            return EvaluationOutcome::Suppressed(SuppressReason::Refractory);
        }

        notify(run, listeners, "before_execute", |l| l.before_execute(run));

        let delay = rule.definition().delay_before_execute;
        if !delay.is_zero() {
            let mut retired = rule.retired_signal();
            let retired_early = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = retired.wait_for(|retired| *retired) => true,
            };
            if retired_early {
                tracing::debug!(rule_id = %run.rule_id, "rule retired before execution");
                let error = RuleError::Retired(run.rule_id.clone());
                self.report_failure(run, listeners, &error);
                self.record(run, true, false, Some(&error));
                return EvaluationOutcome::Suppressed(SuppressReason::Retired);
            }
        }

        let result = self.execute(rule, run).await;
        let definition = rule.definition();
        if definition.clear_facts_after_execution {
            rule.facts().clear();
        }

        match result {
            Ok(value) => {
                rule.mark_completed(true);
                tracing::debug!(
                    rule_id = %run.rule_id,
                    node = %run.node,
                    duration_ms = run.started.elapsed().as_millis() as u64,
                    "rule action executed"
                );
                notify(run, listeners, "after_execute", |l| l.after_execute(run, &value));
                notify(run, listeners, "on_success", |l| l.on_success(run, true));
                self.record(run, true, true, None);
                EvaluationOutcome::Completed {
                    condition: true,
                    executed: true,
                }
            }
            Err(error) => {
                rule.mark_completed(false);
                tracing::warn!(rule_id = %run.rule_id, node = %run.node, error = %error, "rule action failed");
                self.report_failure(run, listeners, &error);
                self.record(run, true, true, Some(&error));
                EvaluationOutcome::Failed(error)
            }
        }
    }

    /// Run the action on the blocking pool, under the rule's deadline.
    async fn execute(&self, rule: &Rule, run: &RuleRun) -> Result<Value, RuleError> {
        let cancel = CancelFlag::new();
        let context = self.context(rule, run, cancel.clone());
        let evaluator = self.evaluator.clone();
        let action = rule.action().to_string();
        let task = tokio::task::spawn_blocking(move || evaluator.execute_action(&action, &context));

        match rule.definition().execution_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, task).await {
                Ok(joined) => flatten(joined),
                Err(_) => {
                    cancel.cancel();
                    Err(RuleError::Timeout {
                        rule_id: run.rule_id.clone(),
                        timeout,
                    })
                }
            },
            None => flatten(task.await),
        }
    }

    fn context(&self, rule: &Rule, run: &RuleRun, cancel: CancelFlag) -> EvaluationContext {
        let facts = rule.facts().valid_facts();
        if tracing::enabled!(tracing::Level::TRACE) {
            for fact in &facts {
                tracing::trace!(rule_id = %run.rule_id, fact = %fact.display_with(&self.fact_format), "valid fact");
            }
        }
        EvaluationContext::new(
            run.rule_id.clone(),
            run.node.clone(),
            run.attribute.clone(),
            run.value.clone(),
            run.evaluation_type,
        )
        .with_facts(facts)
        .with_bindings(self.bindings.clone())
        .with_cancel(cancel)
    }

    fn report_failure(&self, run: &RuleRun, listeners: &[Arc<dyn RuleListener>], error: &RuleError) {
        notify(run, listeners, "on_failure", |l| l.on_failure(run, error));
    }

    fn record(&self, run: &RuleRun, condition: bool, executed: bool, error: Option<&RuleError>) {
        self.history.push(RuleExecutionRecord {
            rule_id: run.rule_id.clone(),
            label: run.label.clone(),
            evaluation_type: run.evaluation_type,
            condition,
            executed,
            success: error.is_none(),
            error: error.map(ToString::to_string),
            duration_ms: run.started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
    }
}

/// Invoke `callback` on every listener, containing listener panics.
fn notify(
    run: &RuleRun,
    listeners: &[Arc<dyn RuleListener>],
    name: &'static str,
    callback: impl Fn(&dyn RuleListener),
) {
    for listener in listeners {
        let notified =
            std::panic::catch_unwind(AssertUnwindSafe(|| callback(listener.as_ref())));
        if notified.is_err() {
            tracing::error!(rule_id = %run.rule_id, callback = name, "listener panicked");
        }
    }
}

fn flatten(joined: Result<Result<Value, ExpressionError>, JoinError>) -> Result<Value, RuleError> {
    match joined {
        Ok(result) => result.map_err(RuleError::from),
        Err(e) if e.is_panic() => Err(RuleError::Panicked(panic_message(&*e.into_panic()))),
        Err(e) => Err(RuleError::Scheduler(e.to_string())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
