//! Node identities shared with the graph/address-space layer.
//!
//! The rule engine never holds graph-side objects. Vertices and protocol
//! nodes are referenced by opaque string identities and resolved by the
//! façade when needed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference to a vertex / protocol node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeRef(String);

impl NodeRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Name of the attribute or property that changed on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeId(String);

impl AttributeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AttributeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AttributeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which change notification started an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationType {
    /// A protocol attribute of the node changed.
    Attribute,
    /// A graph property of the vertex changed.
    Property,
}

impl EvaluationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationType::Attribute => "attribute",
            EvaluationType::Property => "property",
        }
    }
}

impl fmt::Display for EvaluationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ref_display_and_serde() {
        let node = NodeRef::from("ns=2;s=Boiler.Temperature");
        assert_eq!(node.to_string(), "ns=2;s=Boiler.Temperature");

        let json = serde_json::to_string(&node).unwrap();
        assert_eq!(json, "\"ns=2;s=Boiler.Temperature\"");
        let back: NodeRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_evaluation_type_serde() {
        let json = serde_json::to_string(&EvaluationType::Property).unwrap();
        assert_eq!(json, "\"property\"");
        assert_eq!(EvaluationType::Attribute.to_string(), "attribute");
    }
}
