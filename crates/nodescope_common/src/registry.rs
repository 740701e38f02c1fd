//! Node type registry, as reported by the host's node-info endpoint.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NodescopeError, Result};

/// What the validator needs to know about one node type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTypeInfo {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    /// Terminal node that produces workflow results
    #[serde(default)]
    pub output_node: bool,
}

impl NodeTypeInfo {
    pub fn is_optional(&self, input: &str) -> bool {
        self.optional.iter().any(|o| o == input)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRegistry {
    types: HashMap<String, NodeTypeInfo>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, info: NodeTypeInfo) {
        self.types.insert(name.to_string(), info);
    }

    pub fn with_type(mut self, name: &str, required: &[&str], optional: &[&str], output_node: bool) -> Self {
        self.register(
            name,
            NodeTypeInfo {
                required: required.iter().map(|s| s.to_string()).collect(),
                optional: optional.iter().map(|s| s.to_string()).collect(),
                output_node,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&NodeTypeInfo> {
        self.types.get(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Parse the node-info document:
    /// `{"KSampler": {"input": {"required": {..}, "optional": {..}}, "output_node": false}}`
    pub fn from_object_info(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| NodescopeError::InvalidRegistry("expected a JSON object".to_string()))?;

        let mut registry = NodeRegistry::new();
        for (name, def) in obj {
            let input = def.get("input");
            let names = |section: &str| -> Vec<String> {
                input
                    .and_then(|i| i.get(section))
                    .and_then(Value::as_object)
                    .map(|m| m.keys().cloned().collect())
                    .unwrap_or_default()
            };
            registry.register(
                name,
                NodeTypeInfo {
                    required: names("required"),
                    optional: names("optional"),
                    output_node: def.get("output_node").and_then(Value::as_bool).unwrap_or(false),
                },
            );
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        Self::from_object_info(&value)
    }
}
