//! Default evaluator backed by `evalexpr`.
//!
//! Scripts see the trigger as variables (`value`, `node`, `attribute`,
//! `evaluation_type`, `rule_id`), every valid fact whose name is a plain
//! identifier as a variable of that name, and the functions `log(msg)`,
//! `fact(name)` plus every registered command binding.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use evalexpr::{
    Context, ContextWithMutableFunctions, ContextWithMutableVariables, EvalexprError, Function,
    HashMapContext, Node, Value as ScriptValue,
};
use serde_json::Value;

use super::{CommandInvocation, EvaluationContext, ExpressionError, ExpressionEvaluator};

/// `evalexpr` evaluator with a compile cache keyed by expression text.
#[derive(Default)]
pub struct ScriptEvaluator {
    compiled: DashMap<String, Arc<Node>>,
}

impl ScriptEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached operator trees.
    pub fn cached(&self) -> usize {
        self.compiled.len()
    }

    pub fn clear_cache(&self) {
        self.compiled.clear();
    }

    fn compile(&self, expression: &str) -> Result<Arc<Node>, ExpressionError> {
        if let Some(node) = self.compiled.get(expression) {
            return Ok(node.clone());
        }
        let node = evalexpr::build_operator_tree(expression).map_err(|e| {
            ExpressionError::Compile {
                expression: expression.to_string(),
                message: e.to_string(),
            }
        })?;
        let node = Arc::new(node);
        self.compiled.insert(expression.to_string(), node.clone());
        Ok(node)
    }
}

impl ExpressionEvaluator for ScriptEvaluator {
    fn evaluate_condition(
        &self,
        expression: &str,
        context: &EvaluationContext,
    ) -> Result<bool, ExpressionError> {
        let node = self.compile(expression)?;
        let ctx = build_context(expression, context)?;
        node.eval_boolean_with_context(&ctx)
            .map_err(|e| runtime_error(expression, context, e))
    }

    fn execute_action(
        &self,
        expression: &str,
        context: &EvaluationContext,
    ) -> Result<Value, ExpressionError> {
        if context.cancel.is_cancelled() {
            return Err(ExpressionError::Cancelled);
        }
        let node = self.compile(expression)?;
        let mut ctx = build_context(expression, context)?;
        node.eval_with_context_mut(&mut ctx)
            .map(|v| from_script_value(&v))
            .map_err(|e| runtime_error(expression, context, e))
    }
}

fn runtime_error(
    expression: &str,
    context: &EvaluationContext,
    error: EvalexprError,
) -> ExpressionError {
    if context.cancel.is_cancelled() {
        return ExpressionError::Cancelled;
    }
    match error {
        EvalexprError::ExpectedBoolean { .. } => ExpressionError::NotBoolean {
            expression: expression.to_string(),
        },
        other => ExpressionError::Runtime {
            expression: expression.to_string(),
            message: other.to_string(),
        },
    }
}

fn build_context(
    expression: &str,
    context: &EvaluationContext,
) -> Result<HashMapContext, ExpressionError> {
    let setup_error = |e: EvalexprError| ExpressionError::Runtime {
        expression: expression.to_string(),
        message: e.to_string(),
    };

    let mut ctx = HashMapContext::new();
    ctx.set_value("value".into(), to_script_value(&context.value))
        .map_err(setup_error)?;
    ctx.set_value("node".into(), ScriptValue::String(context.node.to_string()))
        .map_err(setup_error)?;
    ctx.set_value(
        "attribute".into(),
        ScriptValue::String(context.attribute.to_string()),
    )
    .map_err(setup_error)?;
    ctx.set_value(
        "evaluation_type".into(),
        ScriptValue::String(context.evaluation_type.as_str().to_string()),
    )
    .map_err(setup_error)?;
    ctx.set_value("rule_id".into(), ScriptValue::String(context.rule_id.to_string()))
        .map_err(setup_error)?;

    // Trigger variables win over facts of the same name.
    for fact in &context.facts {
        if is_identifier(fact.name()) && ctx.get_value(fact.name()).is_none() {
            ctx.set_value(fact.name().to_string(), to_script_value(fact.value()))
                .map_err(setup_error)?;
        }
    }

    let facts: Arc<HashMap<String, Value>> = Arc::new(
        context
            .facts
            .iter()
            .map(|f| (f.name().to_string(), f.value().clone()))
            .collect(),
    );
    ctx.set_function(
        "fact".into(),
        Function::new(move |argument| match argument {
            ScriptValue::String(name) => Ok(facts
                .get(name)
                .map(to_script_value)
                .unwrap_or(ScriptValue::Empty)),
            other => Err(EvalexprError::expected_string(other.clone())),
        }),
    )
    .map_err(setup_error)?;

    let logger = context.logger.clone();
    ctx.set_function(
        "log".into(),
        Function::new(move |argument| {
            let message = match argument {
                ScriptValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            logger.log(&message);
            Ok(ScriptValue::Empty)
        }),
    )
    .map_err(setup_error)?;

    for (name, binding) in context.bindings.snapshot() {
        let rule_id = context.rule_id.clone();
        let node = context.node.clone();
        let cancel = context.cancel.clone();
        ctx.set_function(
            name,
            Function::new(move |argument| {
                if cancel.is_cancelled() {
                    return Err(EvalexprError::CustomMessage("cancelled".to_string()));
                }
                let invocation = CommandInvocation {
                    rule_id: rule_id.clone(),
                    node: node.clone(),
                    args: arguments(argument),
                    cancel: cancel.clone(),
                };
                binding
                    .invoke(&invocation)
                    .map(|v| to_script_value(&v))
                    .map_err(EvalexprError::CustomMessage)
            }),
        )
        .map_err(setup_error)?;
    }

    Ok(ctx)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

fn arguments(argument: &ScriptValue) -> Vec<Value> {
    match argument {
        ScriptValue::Empty => Vec::new(),
        ScriptValue::Tuple(items) => items.iter().map(from_script_value).collect(),
        other => vec![from_script_value(other)],
    }
}

fn to_script_value(value: &Value) -> ScriptValue {
    match value {
        Value::Null => ScriptValue::Empty,
        Value::Bool(b) => ScriptValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => ScriptValue::Int(i),
            None => ScriptValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => ScriptValue::String(s.clone()),
        Value::Array(items) => ScriptValue::Tuple(items.iter().map(to_script_value).collect()),
        Value::Object(_) => ScriptValue::String(value.to_string()),
    }
}

fn from_script_value(value: &ScriptValue) -> Value {
    match value {
        ScriptValue::String(s) => Value::String(s.clone()),
        ScriptValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ScriptValue::Int(i) => Value::from(*i),
        ScriptValue::Boolean(b) => Value::Bool(*b),
        ScriptValue::Tuple(items) => Value::Array(items.iter().map(from_script_value).collect()),
        ScriptValue::Empty => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{CancelFlag, CommandBindings};
    use crate::fact::Fact;
    use crate::rule::RuleId;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use twin_core::{AttributeId, EvaluationType, NodeRef};

    fn context(value: Value) -> EvaluationContext {
        EvaluationContext::new(
            RuleId::from("r1"),
            NodeRef::from("boiler"),
            AttributeId::from("temperature"),
            value,
            EvaluationType::Attribute,
        )
    }

    #[test]
    fn test_condition_on_trigger_value() {
        let evaluator = ScriptEvaluator::new();
        assert!(!evaluator.evaluate_condition("value > 10", &context(json!(5))).unwrap());
        assert!(evaluator.evaluate_condition("value > 10", &context(json!(20))).unwrap());
        assert!(evaluator.evaluate_condition("value > 10.5", &context(json!(20.25))).unwrap());
        assert_eq!(evaluator.cached(), 2);
    }

    #[test]
    fn test_condition_sees_facts() {
        let evaluator = ScriptEvaluator::new();
        let ctx = context(json!(1)).with_facts(vec![
            Fact::new("pressure", json!(4)),
            Fact::new("ns=2;s=Mode", json!("auto")),
        ]);
        assert!(evaluator.evaluate_condition("pressure >= 4", &ctx).unwrap());
        assert!(evaluator
            .evaluate_condition("fact(\"ns=2;s=Mode\") == \"auto\"", &ctx)
            .unwrap());
    }

    #[test]
    fn test_trigger_variables_shadow_facts() {
        let evaluator = ScriptEvaluator::new();
        let ctx = context(json!(3)).with_facts(vec![Fact::new("value", json!("text"))]);
        assert!(evaluator.evaluate_condition("value == 3", &ctx).unwrap());
    }

    #[test]
    fn test_condition_errors_are_distinguishable() {
        let evaluator = ScriptEvaluator::new();
        let ctx = context(json!(1));

        assert!(matches!(
            evaluator.evaluate_condition("(value > 1", &ctx),
            Err(ExpressionError::Compile { .. })
        ));
        assert!(matches!(
            evaluator.evaluate_condition("value + 1", &ctx),
            Err(ExpressionError::NotBoolean { .. })
        ));
        assert!(matches!(
            evaluator.evaluate_condition("unknown_var > 1", &ctx),
            Err(ExpressionError::Runtime { .. })
        ));
    }

    #[test]
    fn test_action_calls_bindings() {
        let fired = Arc::new(AtomicUsize::new(0));
        let bindings = Arc::new(CommandBindings::new());
        {
            let fired = fired.clone();
            bindings.register_fn("markFired", move |inv: &CommandInvocation| {
                assert_eq!(inv.node.as_str(), "boiler");
                assert!(inv.args.is_empty());
                fired.fetch_add(1, Ordering::SeqCst);
                Ok(json!("ok"))
            });
        }
        bindings.register_fn("scale", |inv: &CommandInvocation| {
            let a = inv.args[0].as_i64().unwrap_or(0);
            let b = inv.args[1].as_i64().unwrap_or(0);
            Ok(json!(a * b))
        });

        let evaluator = ScriptEvaluator::new();
        let ctx = context(json!(7)).with_bindings(bindings);

        assert_eq!(evaluator.execute_action("markFired()", &ctx).unwrap(), json!("ok"));
        assert_eq!(evaluator.execute_action("scale(value, 6)", &ctx).unwrap(), json!(42));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_action_binding_error() {
        let bindings = Arc::new(CommandBindings::new());
        bindings.register_fn("fail", |_: &CommandInvocation| Err("device offline".to_string()));

        let evaluator = ScriptEvaluator::new();
        let err = evaluator
            .execute_action("fail()", &context(json!(0)).with_bindings(bindings))
            .unwrap_err();
        match err {
            ExpressionError::Runtime { message, .. } => assert!(message.contains("device offline")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_action_does_not_run() {
        let evaluator = ScriptEvaluator::new();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let ctx = context(json!(0)).with_cancel(cancel);
        assert_eq!(
            evaluator.execute_action("log(\"never\")", &ctx),
            Err(ExpressionError::Cancelled)
        );
    }

    #[test]
    fn test_log_returns_empty() {
        let evaluator = ScriptEvaluator::new();
        let result = evaluator
            .execute_action("log(\"fired\")", &context(json!(4)))
            .unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn test_value_conversions() {
        let original = json!([1, 2.5, "s", true, null]);
        assert_eq!(from_script_value(&to_script_value(&original)), original);
        assert!(is_identifier("boiler.temperature"));
        assert!(!is_identifier("ns=2;s=Mode"));
        assert!(!is_identifier("1abc"));
    }
}
