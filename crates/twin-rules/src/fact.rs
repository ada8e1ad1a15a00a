//! Facts captured from trigger events.

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use twin_core::FactFormat;

/// An immutable named value.
///
/// Identity is the name alone: two facts with the same name compare equal
/// and hash identically regardless of their values, so a name-keyed
/// collection keeps only the most recent one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    name: String,
    value: Value,
    created_at: DateTime<Utc>,
}

impl Fact {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            created_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Render as `name=value`, truncating the value per `format`.
    pub fn display_with<'a>(&'a self, format: &FactFormat) -> FactDisplay<'a> {
        FactDisplay {
            fact: self,
            max_value_len: format.max_value_len,
        }
    }
}

impl PartialEq for Fact {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Fact {}

impl Hash for Fact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// Log-friendly rendering of a [`Fact`].
pub struct FactDisplay<'a> {
    fact: &'a Fact,
    max_value_len: usize,
}

impl fmt::Display for FactDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = match &self.fact.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if rendered.chars().count() > self.max_value_len {
            let head: String = rendered.chars().take(self.max_value_len).collect();
            write!(f, "{}={}...", self.fact.name, head)
        } else {
            write!(f, "{}={}", self.fact.name, rendered)
        }
    }
}
