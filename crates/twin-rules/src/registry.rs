//! Rule registry.
//!
//! Single source of truth for live rules, keyed by [`RuleId`]. Registering
//! an id that already exists builds a fresh [`Rule`] and discards the old
//! instance together with its facts, runners and pending deferrals.
//!
//! Vertex observers resolve the rule by id on every notification, so an
//! observer attached with [`RuleRegistry::register_observer`] keeps working
//! across replacements and stops at deregistration.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use twin_core::{AttributeId, ChangeObserver, EvaluationType, NodeRef, ObserverHost, RuleDefaults};

use crate::error::{Result, RuleError};
use crate::pipeline::{Pipeline, RuleTrigger};
use crate::rule::{Rule, RuleDefinition, RuleId};

type RuleMap = Arc<DashMap<RuleId, Arc<Rule>>>;

pub struct RuleRegistry {
    rules: RuleMap,
    observed: DashMap<RuleId, BTreeSet<NodeRef>>,
    host: Option<Arc<dyn ObserverHost>>,
    pipeline: Arc<Pipeline>,
    defaults: RuleDefaults,
}

impl RuleRegistry {
    pub fn new(pipeline: Arc<Pipeline>, defaults: RuleDefaults) -> Self {
        Self {
            rules: Arc::new(DashMap::new()),
            observed: DashMap::new(),
            host: None,
            pipeline,
            defaults,
        }
    }

    /// Attach rules to vertices of `host`.
    pub fn with_host(mut self, host: Arc<dyn ObserverHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn defaults(&self) -> &RuleDefaults {
        &self.defaults
    }

    /// Insert a rule built from the configured defaults, replacing any rule
    /// with the same id.
    pub fn register_or_update(
        &self,
        id: impl Into<RuleId>,
        label: impl Into<String>,
        condition: impl Into<String>,
        action: impl Into<String>,
        priority: i32,
    ) -> Result<Arc<Rule>> {
        let definition =
            RuleDefinition::with_defaults(id, label, condition, action, &self.defaults)
                .with_priority(priority);
        self.register_definition(definition)
    }

    /// Insert a rule, replacing any rule with the same id.
    pub fn register_definition(&self, definition: RuleDefinition) -> Result<Arc<Rule>> {
        definition.validate()?;
        let rule = Arc::new(Rule::new(definition));
        let id = rule.id().clone();

        match self.rules.insert(id.clone(), rule.clone()) {
            Some(previous) => {
                previous.retire();
                tracing::info!(rule_id = %id, label = %rule.label(), "rule replaced");
            }
            None => {
                tracing::info!(rule_id = %id, label = %rule.label(), priority = rule.priority(), "rule registered");
            }
        }
        Ok(rule)
    }

    /// Remove a rule and detach it from every vertex it observes.
    pub fn deregister(&self, id: &RuleId) -> Result<Arc<Rule>> {
        let (_, rule) = self
            .rules
            .remove(id)
            .ok_or_else(|| RuleError::NotFound(id.clone()))?;
        rule.retire();

        let mut detached = 0;
        if let Some((_, vertices)) = self.observed.remove(id) {
            if let Some(host) = &self.host {
                for vertex in &vertices {
                    detached += host.remove_observer(vertex, id.as_str());
                }
            }
        }
        tracing::info!(rule_id = %id, detached, "rule deregistered");
        Ok(rule)
    }

    /// Attach the rule as attribute and property observer of `vertex`.
    pub fn register_observer(&self, vertex: &NodeRef, id: &RuleId) -> Result<()> {
        if !self.rules.contains_key(id) {
            return Err(RuleError::NotFound(id.clone()));
        }
        let host = self.host.as_ref().ok_or_else(|| {
            RuleError::Validation(format!(
                "cannot observe {vertex} for rule {id}: no observer host configured"
            ))
        })?;

        let observer: Arc<dyn ChangeObserver> = Arc::new(RuleObserver {
            rule_id: id.clone(),
            rules: self.rules.clone(),
            pipeline: self.pipeline.clone(),
        });
        host.add_attribute_observer(vertex, observer.clone());
        host.add_property_observer(vertex, observer);
        self.observed
            .entry(id.clone())
            .or_default()
            .insert(vertex.clone());

        tracing::info!(rule_id = %id, vertex = %vertex, "rule observing vertex");
        Ok(())
    }

    pub fn get(&self, id: &RuleId) -> Option<Arc<Rule>> {
        self.rules.get(id).map(|r| r.value().clone())
    }

    pub fn contains(&self, id: &RuleId) -> bool {
        self.rules.contains_key(id)
    }

    /// All rules, ordered by priority then id.
    pub fn list(&self) -> Vec<Arc<Rule>> {
        let mut rules: Vec<_> = self.rules.iter().map(|r| r.value().clone()).collect();
        rules.sort_by(|a, b| a.priority().cmp(&b.priority()).then_with(|| a.id().cmp(b.id())));
        rules
    }

    /// Vertices a rule is attached to.
    pub fn observed_vertices(&self, id: &RuleId) -> Vec<NodeRef> {
        self.observed
            .get(id)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Drop expired facts of every rule. Returns the number removed.
    pub fn sweep_expired_facts(&self) -> usize {
        self.rules
            .iter()
            .map(|r| r.value().facts().sweep_expired())
            .sum()
    }
}

/// Vertex observer forwarding notifications of one rule id to the pipeline.
struct RuleObserver {
    rule_id: RuleId,
    rules: RuleMap,
    pipeline: Arc<Pipeline>,
}

impl RuleObserver {
    async fn notify(
        &self,
        node: &NodeRef,
        attribute: &AttributeId,
        value: &Value,
        evaluation_type: EvaluationType,
    ) {
        let Some(rule) = self.rules.get(&self.rule_id).map(|r| r.value().clone()) else {
            tracing::debug!(rule_id = %self.rule_id, "notification for unknown rule ignored");
            return;
        };
        let trigger = RuleTrigger::new(
            self.rule_id.clone(),
            node.clone(),
            attribute.clone(),
            value.clone(),
            evaluation_type,
        );
        self.pipeline.run(rule, trigger).await;
    }
}

#[async_trait]
impl ChangeObserver for RuleObserver {
    fn observer_key(&self) -> &str {
        self.rule_id.as_str()
    }

    async fn attribute_changed(&self, node: &NodeRef, attribute: &AttributeId, value: &Value) {
        self.notify(node, attribute, value, EvaluationType::Attribute)
            .await;
    }

    async fn property_changed(&self, node: &NodeRef, property: &AttributeId, value: &Value) {
        self.notify(node, property, value, EvaluationType::Property)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{CommandBindings, ScriptEvaluator};
    use crate::history::ExecutionHistory;
    use serde_json::json;
    use twin_core::{FactFormat, InMemoryGraph};

    fn registry(graph: Arc<InMemoryGraph>) -> RuleRegistry {
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(ScriptEvaluator::new()),
            Arc::new(CommandBindings::new()),
            Arc::new(ExecutionHistory::new(16)),
            FactFormat::default(),
        ));
        RuleRegistry::new(pipeline, RuleDefaults::default()).with_host(graph)
    }

    #[test]
    fn test_replace_resets_runtime_state() {
        let registry = registry(Arc::new(InMemoryGraph::new()));
        let first = registry
            .register_or_update("r1", "Overheat", "true", "1", 5)
            .unwrap();
        first.record_fact(&NodeRef::from("n"), &AttributeId::from("t"), json!(1));

        let second = registry
            .register_or_update("r1", "Overheat v2", "false", "1", 3)
            .unwrap();
        assert!(first.is_retired());
        assert!(second.facts().is_empty());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&RuleId::from("r1")).unwrap().label(), "Overheat v2");
    }

    #[test]
    fn test_unknown_ids_are_not_found() {
        let registry = registry(Arc::new(InMemoryGraph::new()));
        let id = RuleId::from("ghost");
        assert!(registry.deregister(&id).unwrap_err().is_not_found());
        assert!(registry
            .register_observer(&NodeRef::from("n"), &id)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_list_is_ordered_by_priority() {
        let registry = registry(Arc::new(InMemoryGraph::new()));
        registry.register_or_update("b", "b", "true", "1", 10).unwrap();
        registry.register_or_update("a", "a", "true", "1", 10).unwrap();
        registry.register_or_update("c", "c", "true", "1", -1).unwrap();

        let ids: Vec<_> = registry.list().iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_invalid_definition_is_rejected() {
        let registry = registry(Arc::new(InMemoryGraph::new()));
        let err = registry.register_or_update("r1", "l", "", "1", 1).unwrap_err();
        assert!(matches!(err, RuleError::Validation(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_observer_attach_and_detach() {
        let graph = Arc::new(InMemoryGraph::new());
        let registry = registry(graph.clone());
        let vertex = NodeRef::from("boiler");
        let id = RuleId::from("r1");

        registry.register_or_update("r1", "l", "value > 10", "1", 1).unwrap();
        registry.register_observer(&vertex, &id).unwrap();
        assert_eq!(graph.observer_count(&vertex), 2);
        assert_eq!(registry.observed_vertices(&id), vec![vertex.clone()]);

        graph
            .set_attribute(&vertex, &AttributeId::from("temperature"), json!(12))
            .await;
        let rule = registry.get(&id).unwrap();
        assert_eq!(rule.stats().execution_count, 1);

        registry.deregister(&id).unwrap();
        assert_eq!(graph.observer_count(&vertex), 0);
    }

    #[tokio::test]
    async fn test_observer_follows_replacement() {
        let graph = Arc::new(InMemoryGraph::new());
        let registry = registry(graph.clone());
        let vertex = NodeRef::from("boiler");
        let id = RuleId::from("r1");

        registry.register_or_update("r1", "l", "true", "1", 1).unwrap();
        registry.register_observer(&vertex, &id).unwrap();
        let replacement = registry.register_or_update("r1", "l", "true", "2", 1).unwrap();

        graph
            .set_property(&vertex, &AttributeId::from("mode"), json!("auto"))
            .await;
        assert_eq!(replacement.stats().execution_count, 1);
    }
}
