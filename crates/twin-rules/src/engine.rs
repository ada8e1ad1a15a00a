//! Rule engine façade.
//!
//! Ties the registry, the evaluation pipeline, the dispatch queue and the
//! housekeeping task together behind one handle.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use twin_core::{AttributeId, EngineConfig, EvaluationType, NodeRef, ObserverHost};

use crate::error::{Result, RuleError};
use crate::expression::{CommandBindings, ExpressionEvaluator, ScriptEvaluator};
use crate::history::{ExecutionHistory, RuleExecutionRecord};
use crate::listener::RuleListener;
use crate::pipeline::{EvaluationOutcome, Pipeline, RuleTrigger};
use crate::queue::{HouseKeepingHandle, HysteresisQueue};
use crate::registry::RuleRegistry;
use crate::rule::{Rule, RuleDefinition, RuleId, RuleStats};

/// Background tasks started by [`RuleEngine::start`].
struct Workers {
    shutdown: watch::Sender<bool>,
    dispatchers: Vec<JoinHandle<()>>,
    housekeeping: HouseKeepingHandle,
}

/// Builder for [`RuleEngine`].
pub struct RuleEngineBuilder {
    config: EngineConfig,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    bindings: Option<Arc<CommandBindings>>,
    host: Option<Arc<dyn ObserverHost>>,
}

impl RuleEngineBuilder {
    /// Use a custom expression runtime instead of [`ScriptEvaluator`].
    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn bindings(mut self, bindings: Arc<CommandBindings>) -> Self {
        self.bindings = Some(bindings);
        self
    }

    /// Graph façade rules attach to.
    pub fn observer_host(mut self, host: Arc<dyn ObserverHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn build(self) -> Result<RuleEngine> {
        self.config.validate()?;

        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(ScriptEvaluator::new()));
        let bindings = self.bindings.unwrap_or_default();
        let history = Arc::new(ExecutionHistory::new(self.config.history_size));
        let pipeline = Arc::new(Pipeline::new(
            evaluator,
            bindings.clone(),
            history.clone(),
            self.config.fact_format.clone(),
        ));

        let mut registry = RuleRegistry::new(pipeline.clone(), self.config.rule_defaults.clone());
        if let Some(host) = self.host {
            registry = registry.with_host(host);
        }

        Ok(RuleEngine {
            queue: Arc::new(HysteresisQueue::new(self.config.hysteresis())),
            config: self.config,
            registry: Arc::new(registry),
            pipeline,
            bindings,
            history,
            workers: Mutex::new(None),
        })
    }
}

/// Rule engine that manages rules and runs them on change notifications.
pub struct RuleEngine {
    config: EngineConfig,
    registry: Arc<RuleRegistry>,
    pipeline: Arc<Pipeline>,
    queue: Arc<HysteresisQueue<RuleTrigger>>,
    bindings: Arc<CommandBindings>,
    history: Arc<ExecutionHistory>,
    workers: Mutex<Option<Workers>>,
}

impl RuleEngine {
    /// Create an engine with the default evaluator and no observer host.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: EngineConfig) -> RuleEngineBuilder {
        RuleEngineBuilder {
            config,
            evaluator: None,
            bindings: None,
            host: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// Host functions callable from conditions and actions.
    pub fn bindings(&self) -> &Arc<CommandBindings> {
        &self.bindings
    }

    // --- Registry ---

    pub fn register_or_update(
        &self,
        id: impl Into<RuleId>,
        label: impl Into<String>,
        condition: impl Into<String>,
        action: impl Into<String>,
        priority: i32,
    ) -> Result<Arc<Rule>> {
        self.registry
            .register_or_update(id, label, condition, action, priority)
    }

    pub fn register_definition(&self, definition: RuleDefinition) -> Result<Arc<Rule>> {
        self.registry.register_definition(definition)
    }

    pub fn deregister(&self, id: &RuleId) -> Result<()> {
        self.registry.deregister(id).map(|_| ())
    }

    pub fn register_observer(&self, vertex: &NodeRef, id: &RuleId) -> Result<()> {
        self.registry.register_observer(vertex, id)
    }

    pub fn get_rule(&self, id: &RuleId) -> Option<Arc<Rule>> {
        self.registry.get(id)
    }

    pub fn list_rules(&self) -> Vec<Arc<Rule>> {
        self.registry.list()
    }

    fn rule(&self, id: &RuleId) -> Result<Arc<Rule>> {
        self.registry
            .get(id)
            .ok_or_else(|| RuleError::NotFound(id.clone()))
    }

    /// Pause a rule. Notifications are dropped until it is resumed.
    pub fn pause_rule(&self, id: &RuleId) -> Result<()> {
        self.rule(id)?.set_paused(true);
        tracing::info!(rule_id = %id, "rule paused");
        Ok(())
    }

    /// Resume a rule.
    pub fn resume_rule(&self, id: &RuleId) -> Result<()> {
        self.rule(id)?.set_paused(false);
        tracing::info!(rule_id = %id, "rule resumed");
        Ok(())
    }

    pub fn rule_stats(&self, id: &RuleId) -> Result<RuleStats> {
        Ok(self.rule(id)?.stats())
    }

    // --- Listeners ---

    pub fn add_listener(&self, listener: Arc<dyn RuleListener>) {
        self.pipeline.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn RuleListener>) -> bool {
        self.pipeline.remove_listener(listener)
    }

    // --- Evaluation ---

    /// Run the pipeline for an attribute change on the calling task.
    pub async fn evaluate_rule_for_attribute_changed(
        &self,
        rule: &Arc<Rule>,
        node: &NodeRef,
        attribute: &AttributeId,
        value: Value,
    ) -> EvaluationOutcome {
        self.evaluate(rule, node, attribute, value, EvaluationType::Attribute)
            .await
    }

    /// Run the pipeline for a property change on the calling task.
    pub async fn evaluate_rule_for_property_changed(
        &self,
        rule: &Arc<Rule>,
        node: &NodeRef,
        property: &AttributeId,
        value: Value,
    ) -> EvaluationOutcome {
        self.evaluate(rule, node, property, value, EvaluationType::Property)
            .await
    }

    async fn evaluate(
        &self,
        rule: &Arc<Rule>,
        node: &NodeRef,
        attribute: &AttributeId,
        value: Value,
        evaluation_type: EvaluationType,
    ) -> EvaluationOutcome {
        let trigger = RuleTrigger::new(
            rule.id().clone(),
            node.clone(),
            attribute.clone(),
            value,
            evaluation_type,
        );
        self.pipeline.run(rule.clone(), trigger).await
    }

    // --- Dispatch queue ---

    /// Queue an attribute change for the dispatch workers.
    ///
    /// Returns `false` when the request was suppressed by hysteresis.
    pub fn dispatch_attribute_changed(
        &self,
        id: &RuleId,
        node: &NodeRef,
        attribute: &AttributeId,
        value: Value,
    ) -> Result<bool> {
        self.dispatch(id, node, attribute, value, EvaluationType::Attribute)
    }

    /// Queue a property change for the dispatch workers.
    pub fn dispatch_property_changed(
        &self,
        id: &RuleId,
        node: &NodeRef,
        property: &AttributeId,
        value: Value,
    ) -> Result<bool> {
        self.dispatch(id, node, property, value, EvaluationType::Property)
    }

    fn dispatch(
        &self,
        id: &RuleId,
        node: &NodeRef,
        attribute: &AttributeId,
        value: Value,
        evaluation_type: EvaluationType,
    ) -> Result<bool> {
        let rule = self.rule(id)?;
        let trigger = RuleTrigger::new(
            id.clone(),
            node.clone(),
            attribute.clone(),
            value,
            evaluation_type,
        );
        let accepted = self.queue.offer(trigger, rule.priority());
        if !accepted {
            tracing::debug!(rule_id = %id, node = %node, "dispatch suppressed by hysteresis");
        }
        Ok(accepted)
    }

    /// Pending dispatch requests.
    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    /// Start the dispatch workers and the housekeeping task.
    pub fn start(&self) -> Result<()> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| RuleError::Scheduler(format!("no tokio runtime: {e}")))?;

        let mut workers = self.workers.lock();
        if workers.is_some() {
            return Err(RuleError::Scheduler("engine is already running".to_string()));
        }

        let (shutdown, _) = watch::channel(false);
        let dispatchers = (0..self.config.dispatch_workers)
            .map(|worker| {
                let queue = self.queue.clone();
                let registry = self.registry.clone();
                let pipeline = self.pipeline.clone();
                let mut shutdown = shutdown.subscribe();
                tokio::spawn(async move {
                    while let Some(trigger) = queue.take_until(&mut shutdown).await {
                        match registry.get(&trigger.rule_id) {
                            Some(rule) => {
                                pipeline.run_queued(rule, trigger).await;
                            }
                            None => {
                                tracing::debug!(worker, rule_id = %trigger.rule_id, "dispatched rule no longer registered");
                            }
                        }
                    }
                    tracing::debug!(worker, "dispatch worker stopped");
                })
            })
            .collect();

        let queue: Weak<HysteresisQueue<RuleTrigger>> = Arc::downgrade(&self.queue);
        let registry: Weak<RuleRegistry> = Arc::downgrade(&self.registry);
        let housekeeping =
            HouseKeepingHandle::spawn(self.config.housekeeping_interval(), move || {
                let (Some(queue), Some(registry)) = (queue.upgrade(), registry.upgrade()) else {
                    return false;
                };
                let forgotten = queue.clean_up();
                let swept = registry.sweep_expired_facts();
                if forgotten > 0 || swept > 0 {
                    tracing::debug!(forgotten, swept, "housekeeping pass");
                }
                true
            });

        *workers = Some(Workers {
            shutdown,
            dispatchers,
            housekeeping,
        });
        tracing::info!(
            workers = self.config.dispatch_workers,
            housekeeping_ms = self.config.housekeeping_interval_ms,
            "rule engine started"
        );
        Ok(())
    }

    /// Stop the background tasks and wait for them to finish.
    ///
    /// Runs in flight on a dispatch worker are allowed to complete.
    pub async fn stop(&self) -> Result<()> {
        let workers = self
            .workers
            .lock()
            .take()
            .ok_or_else(|| RuleError::Scheduler("engine is not running".to_string()))?;

        let _ = workers.shutdown.send(true);
        for handle in workers.dispatchers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "dispatch worker terminated abnormally");
            }
        }
        workers.housekeeping.stop().await;
        tracing::info!("rule engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    // --- History ---

    pub fn history(&self) -> Vec<RuleExecutionRecord> {
        self.history.all()
    }

    pub fn rule_history(&self, id: &RuleId) -> Vec<RuleExecutionRecord> {
        self.history.for_rule(id)
    }

    pub fn clear_history(&self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn engine() -> RuleEngine {
        RuleEngine::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EngineConfig {
            dispatch_workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            RuleEngine::new(config),
            Err(RuleError::Config(_))
        ));
    }

    #[test]
    fn test_pause_unknown_rule() {
        let engine = engine();
        let err = engine.pause_rule(&RuleId::from("ghost")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_start_requires_runtime() {
        let engine = engine();
        assert!(matches!(engine.start(), Err(RuleError::Scheduler(_))));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let engine = engine();
        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(engine.start().is_err());

        engine.stop().await.unwrap();
        assert!(!engine.is_running());
        assert!(engine.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_rule() {
        let engine = engine();
        let err = engine
            .dispatch_attribute_changed(
                &RuleId::from("ghost"),
                &NodeRef::from("n"),
                &AttributeId::from("a"),
                json!(1),
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let engine = engine();
        let rule = engine
            .register_or_update("r1", "l", "true", "1", 1)
            .unwrap();
        let node = NodeRef::from("n");
        let attr = AttributeId::from("a");

        engine.pause_rule(rule.id()).unwrap();
        let outcome = engine
            .evaluate_rule_for_attribute_changed(&rule, &node, &attr, json!(1))
            .await;
        assert!(outcome.is_suppressed());

        engine.resume_rule(rule.id()).unwrap();
        let outcome = engine
            .evaluate_rule_for_attribute_changed(&rule, &node, &attr, json!(1))
            .await;
        assert!(outcome.executed());
        assert_eq!(engine.rule_stats(rule.id()).unwrap().execution_count, 1);
        assert_eq!(engine.rule_history(rule.id()).len(), 1);

        engine.clear_history();
        assert!(engine.history().is_empty());
    }

    #[tokio::test]
    async fn test_deregister_cancels_deferred_evaluation() {
        let engine = engine();
        let rule = engine
            .register_definition(
                RuleDefinition::new("r1", "l", "true", "1")
                    .with_delay_before_evaluation(Duration::from_millis(50)),
            )
            .unwrap();

        let outcome = engine
            .evaluate_rule_for_property_changed(
                &rule,
                &NodeRef::from("n"),
                &AttributeId::from("mode"),
                json!("auto"),
            )
            .await;
        assert!(matches!(outcome, EvaluationOutcome::Deferred));
        assert!(rule.has_pending());

        engine.deregister(rule.id()).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(rule.stats().execution_count, 0);
        assert!(engine.history().is_empty());
    }
}
