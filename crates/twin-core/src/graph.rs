//! Graph-facing observer contracts.
//!
//! The graph/protocol façade raises change notifications for vertices. Rules
//! subscribe through [`ObserverHost`] and receive notifications through
//! [`ChangeObserver`]. [`InMemoryGraph`] is a minimal host used by tests and
//! by embedders that do not run a full address space.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::node::{AttributeId, NodeRef};

/// Receiver of vertex change notifications.
#[async_trait]
pub trait ChangeObserver: Send + Sync {
    /// Stable key identifying this observer on a vertex.
    ///
    /// Attaching a second observer with the same key replaces the first.
    fn observer_key(&self) -> &str;

    /// A protocol attribute of `node` changed to `value`.
    async fn attribute_changed(&self, node: &NodeRef, attribute: &AttributeId, value: &Value);

    /// A graph property of `node` changed to `value`.
    async fn property_changed(&self, node: &NodeRef, property: &AttributeId, value: &Value);
}

/// Something observers can be attached to, usually the graph façade.
pub trait ObserverHost: Send + Sync {
    /// Attach an observer for attribute changes on `vertex`.
    fn add_attribute_observer(&self, vertex: &NodeRef, observer: Arc<dyn ChangeObserver>);

    /// Attach an observer for property changes on `vertex`.
    fn add_property_observer(&self, vertex: &NodeRef, observer: Arc<dyn ChangeObserver>);

    /// Detach every observer registered under `key` from `vertex`.
    ///
    /// Returns the number of attachments removed.
    fn remove_observer(&self, vertex: &NodeRef, key: &str) -> usize;
}

#[derive(Default)]
struct VertexState {
    attributes: HashMap<AttributeId, Value>,
    properties: HashMap<AttributeId, Value>,
    attribute_observers: Vec<Arc<dyn ChangeObserver>>,
    property_observers: Vec<Arc<dyn ChangeObserver>>,
}

fn attach(observers: &mut Vec<Arc<dyn ChangeObserver>>, observer: Arc<dyn ChangeObserver>) {
    observers.retain(|o| o.observer_key() != observer.observer_key());
    observers.push(observer);
}

/// In-memory vertex store that notifies attached observers on every write.
#[derive(Default)]
pub struct InMemoryGraph {
    vertices: RwLock<HashMap<NodeRef, VertexState>>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an attribute and notify attribute observers of the vertex.
    ///
    /// Observers run on the calling task, one after another.
    pub async fn set_attribute(&self, node: &NodeRef, attribute: &AttributeId, value: Value) {
        let observers = {
            let mut vertices = self.vertices.write();
            let state = vertices.entry(node.clone()).or_default();
            state.attributes.insert(attribute.clone(), value.clone());
            state.attribute_observers.clone()
        };

        for observer in observers {
            observer.attribute_changed(node, attribute, &value).await;
        }
    }

    /// Write a property and notify property observers of the vertex.
    pub async fn set_property(&self, node: &NodeRef, property: &AttributeId, value: Value) {
        let observers = {
            let mut vertices = self.vertices.write();
            let state = vertices.entry(node.clone()).or_default();
            state.properties.insert(property.clone(), value.clone());
            state.property_observers.clone()
        };

        for observer in observers {
            observer.property_changed(node, property, &value).await;
        }
    }

    pub fn attribute(&self, node: &NodeRef, attribute: &AttributeId) -> Option<Value> {
        self.vertices
            .read()
            .get(node)
            .and_then(|s| s.attributes.get(attribute).cloned())
    }

    pub fn property(&self, node: &NodeRef, property: &AttributeId) -> Option<Value> {
        self.vertices
            .read()
            .get(node)
            .and_then(|s| s.properties.get(property).cloned())
    }

    /// Number of observer attachments (attribute + property) on a vertex.
    pub fn observer_count(&self, node: &NodeRef) -> usize {
        self.vertices
            .read()
            .get(node)
            .map(|s| s.attribute_observers.len() + s.property_observers.len())
            .unwrap_or(0)
    }
}

impl ObserverHost for InMemoryGraph {
    fn add_attribute_observer(&self, vertex: &NodeRef, observer: Arc<dyn ChangeObserver>) {
        let mut vertices = self.vertices.write();
        attach(
            &mut vertices.entry(vertex.clone()).or_default().attribute_observers,
            observer,
        );
    }

    fn add_property_observer(&self, vertex: &NodeRef, observer: Arc<dyn ChangeObserver>) {
        let mut vertices = self.vertices.write();
        attach(
            &mut vertices.entry(vertex.clone()).or_default().property_observers,
            observer,
        );
    }

    fn remove_observer(&self, vertex: &NodeRef, key: &str) -> usize {
        let mut vertices = self.vertices.write();
        let Some(state) = vertices.get_mut(vertex) else {
            return 0;
        };
        let before = state.attribute_observers.len() + state.property_observers.len();
        state.attribute_observers.retain(|o| o.observer_key() != key);
        state.property_observers.retain(|o| o.observer_key() != key);
        before - (state.attribute_observers.len() + state.property_observers.len())
    }
}
