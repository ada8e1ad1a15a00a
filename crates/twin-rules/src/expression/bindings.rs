//! Host functions callable from conditions and actions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use twin_core::NodeRef;

use crate::rule::RuleId;

/// Cooperative cancellation signal of one action attempt.
///
/// Set when the attempt exceeds its deadline. Long-running bindings should
/// poll it and bail out.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One call of a binding from a script.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub rule_id: RuleId,
    pub node: NodeRef,
    pub args: Vec<Value>,
    pub cancel: CancelFlag,
}

/// Named host function.
pub trait CommandBinding: Send + Sync {
    fn invoke(&self, invocation: &CommandInvocation) -> Result<Value, String>;
}

struct FnBinding<F>(F);

impl<F> CommandBinding for FnBinding<F>
where
    F: Fn(&CommandInvocation) -> Result<Value, String> + Send + Sync,
{
    fn invoke(&self, invocation: &CommandInvocation) -> Result<Value, String> {
        (self.0)(invocation)
    }
}

/// Registry of named bindings shared by every rule of an engine.
#[derive(Default)]
pub struct CommandBindings {
    bindings: RwLock<HashMap<String, Arc<dyn CommandBinding>>>,
}

impl CommandBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, binding: Arc<dyn CommandBinding>) {
        self.bindings.write().insert(name.into(), binding);
    }

    pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&CommandInvocation) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnBinding(f)));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.bindings.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandBinding>> {
        self.bindings.read().get(name).cloned()
    }

    pub fn snapshot(&self) -> Vec<(String, Arc<dyn CommandBinding>)> {
        self.bindings
            .read()
            .iter()
            .map(|(name, b)| (name.clone(), b.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_and_invoke() {
        let bindings = CommandBindings::new();
        bindings.register_fn("double", |inv: &CommandInvocation| {
            let n = inv.args.first().and_then(|v| v.as_i64()).ok_or("expected int")?;
            Ok(json!(n * 2))
        });

        let invocation = CommandInvocation {
            rule_id: RuleId::from("r1"),
            node: NodeRef::from("n1"),
            args: vec![json!(21)],
            cancel: CancelFlag::new(),
        };
        let double = bindings.get("double").unwrap();
        assert_eq!(double.invoke(&invocation), Ok(json!(42)));

        assert!(bindings.unregister("double"));
        assert!(bindings.is_empty());
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
