//! Core traits and types for GraphTwin.
//!
//! This crate defines the foundational abstractions shared between the
//! graph/address-space façade and the rule engine: node identities, change
//! observers, engine configuration and the event bus.

pub mod config;
pub mod event;
pub mod eventbus;
pub mod graph;
pub mod node;

pub use config::{ConfigError, EngineConfig, FactFormat, RuleDefaults};
pub use event::{EventMetadata, RuleEvent};
pub use eventbus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventBusReceiver, FilteredReceiver};
pub use graph::{ChangeObserver, InMemoryGraph, ObserverHost};
pub use node::{AttributeId, EvaluationType, NodeRef};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{EngineConfig, FactFormat, RuleDefaults, defaults, env_vars};
    pub use crate::event::{EventMetadata, RuleEvent};
    pub use crate::eventbus::EventBus;
    pub use crate::graph::{ChangeObserver, InMemoryGraph, ObserverHost};
    pub use crate::node::{AttributeId, EvaluationType, NodeRef};
}
