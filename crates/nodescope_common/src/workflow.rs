//! Workflow graph model.
//!
//! The host pushes its graph either in API form (`{"3": {"class_type": ..,
//! "inputs": {..}}}`) or in the editor's UI form (`{"nodes": [..], "links":
//! [..]}`), sometimes wrapped in `{"prompt": ..}` / `{"workflow": ..}`. Both are
//! parsed into the same [`WorkflowGraph`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NodescopeError, Result};

/// Node identifier. Integer ids order numerically, anything else lexically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

/// Reference to another node's output slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRef {
    pub node: NodeId,
    pub slot: u32,
}

/// Value bound to a node input. Serialized the way the API format writes it:
/// links as `[node, slot]`, literals as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum InputValue {
    Literal(Value),
    Link(LinkRef),
}

impl InputValue {
    /// Null or blank-string literal.
    pub fn is_empty_literal(&self) -> bool {
        match self {
            InputValue::Literal(Value::Null) => true,
            InputValue::Literal(Value::String(s)) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn link(&self) -> Option<&LinkRef> {
        match self {
            InputValue::Link(link) => Some(link),
            _ => None,
        }
    }
}

impl From<Value> for InputValue {
    fn from(value: Value) -> Self {
        if let Value::Array(items) = &value {
            if items.len() == 2 {
                let node = match &items[0] {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) if n.is_u64() => Some(n.to_string()),
                    _ => None,
                };
                let slot = items[1].as_u64().and_then(|s| u32::try_from(s).ok());
                if let (Some(node), Some(slot)) = (node, slot) {
                    return InputValue::Link(LinkRef {
                        node: NodeId(node),
                        slot,
                    });
                }
            }
        }
        InputValue::Literal(value)
    }
}

impl From<InputValue> for Value {
    fn from(input: InputValue) -> Self {
        match input {
            InputValue::Literal(value) => value,
            InputValue::Link(link) => Value::Array(vec![
                Value::String(link.node.0),
                Value::from(link.slot),
            ]),
        }
    }
}

/// Editor-only node types. The host drops them before execution.
const VIRTUAL_TYPES: &[&str] = &["Note", "MarkdownNote", "Reroute", "PrimitiveNode"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub class_type: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    /// Parsed from the editor format, where widget values carry no names
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub editor: bool,
    /// Editor input sockets with no link attached
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unlinked: BTreeSet<String>,
}

impl NodeSpec {
    pub fn new(class_type: &str) -> Self {
        Self {
            class_type: class_type.to_string(),
            inputs: BTreeMap::new(),
            editor: false,
            unlinked: BTreeSet::new(),
        }
    }

    /// Whether something is bound to `input`. An editor node binds every
    /// input it does not list as an unlinked socket, since its widget values
    /// fill the rest by position.
    pub fn binds(&self, input: &str) -> bool {
        self.inputs.contains_key(input) || (self.editor && !self.unlinked.contains(input))
    }

    /// Editor-only helper node (notes, reroutes, primitives).
    pub fn is_virtual(&self) -> bool {
        VIRTUAL_TYPES.contains(&self.class_type.as_str())
    }

    pub fn with_literal(mut self, name: &str, value: Value) -> Self {
        self.inputs.insert(name.to_string(), InputValue::Literal(value));
        self
    }

    pub fn with_link(mut self, name: &str, node: &str, slot: u32) -> Self {
        self.inputs.insert(
            name.to_string(),
            InputValue::Link(LinkRef {
                node: NodeId::from(node),
                slot,
            }),
        );
        self
    }

    pub fn links(&self) -> impl Iterator<Item = (&str, &LinkRef)> {
        self.inputs
            .iter()
            .filter_map(|(name, value)| value.link().map(|link| (name.as_str(), link)))
    }
}

/// Snapshot of the execution graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowGraph {
    pub nodes: BTreeMap<NodeId, NodeSpec>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, id: &str, spec: NodeSpec) -> Self {
        self.nodes.insert(NodeId::from(id), spec);
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    /// Parse any of the accepted payload shapes.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| NodescopeError::InvalidWorkflow("expected a JSON object".to_string()))?;

        // Prefer the API form when the payload carries both
        if let Some(prompt) = obj.get("prompt").filter(|v| v.is_object()) {
            return Self::from_json(prompt);
        }
        if let Some(workflow) = obj.get("workflow").filter(|v| v.is_object()) {
            return Self::from_json(workflow);
        }
        if let Some(Value::Array(nodes)) = obj.get("nodes") {
            return Self::from_ui(nodes, obj.get("links"));
        }

        let mut graph = WorkflowGraph::new();
        for (id, node) in obj {
            let Some(class_type) = node.get("class_type").and_then(Value::as_str) else {
                continue;
            };
            let mut spec = NodeSpec::new(class_type);
            if let Some(Value::Object(inputs)) = node.get("inputs") {
                for (name, value) in inputs {
                    spec.inputs.insert(name.clone(), InputValue::from(value.clone()));
                }
            }
            spec.editor = node.get("editor").and_then(Value::as_bool).unwrap_or(false);
            if let Some(Value::Array(names)) = node.get("unlinked") {
                spec.unlinked = names.iter().filter_map(Value::as_str).map(str::to_string).collect();
            }
            graph.nodes.insert(NodeId(id.clone()), spec);
        }
        Ok(graph)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(s)?;
        Self::from_json(&value)
    }

    /// Editor format: links are `[id, src_node, src_slot, dst_node, dst_slot, type]`
    /// and node inputs refer to them by id. Widget values are positional and
    /// carry no input names, so only linked inputs are recovered; sockets
    /// left unlinked are remembered by name.
    fn from_ui(nodes: &[Value], links: Option<&Value>) -> Result<Self> {
        let mut link_table: HashMap<u64, LinkRef> = HashMap::new();
        if let Some(Value::Array(links)) = links {
            for link in links {
                let Some(fields) = link.as_array() else { continue };
                if fields.len() < 4 {
                    continue;
                }
                let (Some(id), Some(src)) = (fields[0].as_u64(), id_string(&fields[1])) else {
                    continue;
                };
                let slot = fields[2].as_u64().and_then(|s| u32::try_from(s).ok()).unwrap_or(0);
                link_table.insert(
                    id,
                    LinkRef {
                        node: NodeId(src),
                        slot,
                    },
                );
            }
        }

        let mut graph = WorkflowGraph::new();
        for node in nodes {
            let id = node
                .get("id")
                .and_then(id_string)
                .ok_or_else(|| NodescopeError::InvalidWorkflow("UI node without id".to_string()))?;
            let class_type = node.get("type").and_then(Value::as_str).unwrap_or("Unknown");
            let mut spec = NodeSpec::new(class_type);
            spec.editor = true;
            if let Some(Value::Array(inputs)) = node.get("inputs") {
                for input in inputs {
                    let Some(name) = input.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    match input
                        .get("link")
                        .and_then(Value::as_u64)
                        .and_then(|id| link_table.get(&id).cloned())
                    {
                        Some(link) => {
                            spec.inputs.insert(name.to_string(), InputValue::Link(link));
                        }
                        None => {
                            spec.unlinked.insert(name.to_string());
                        }
                    }
                }
            }
            graph.nodes.insert(NodeId(id), spec);
        }
        Ok(graph)
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_id_ordering() {
        let mut ids: Vec<NodeId> = ["10", "2", "b", "1", "a"].iter().map(|s| NodeId::from(*s)).collect();
        ids.sort();
        let ordered: Vec<&str> = ids.iter().map(NodeId::as_str).collect();
        assert_eq!(ordered, vec!["1", "2", "10", "a", "b"]);
    }

    #[test]
    fn test_parse_api_format() {
        let value = json!({
            "3": {"class_type": "KSampler", "inputs": {"seed": 5, "model": ["4", 0], "positive": [6, 0]}},
            "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "sd15.safetensors"}},
            "extra": "ignored"
        });
        let graph = WorkflowGraph::from_json(&value).unwrap();
        assert_eq!(graph.len(), 2);
        let sampler = graph.get(&NodeId::from("3")).unwrap();
        assert_eq!(sampler.inputs["seed"], InputValue::Literal(json!(5)));
        assert_eq!(sampler.inputs["model"].link().unwrap().node, NodeId::from("4"));
        assert_eq!(sampler.inputs["positive"].link().unwrap().node, NodeId::from("6"));
    }

    #[test]
    fn test_parse_wrapped_prompt() {
        let value = json!({
            "workflow": {"nodes": []},
            "prompt": {"1": {"class_type": "SaveImage", "inputs": {}}}
        });
        let graph = WorkflowGraph::from_json(&value).unwrap();
        assert_eq!(graph.get(&NodeId::from("1")).unwrap().class_type, "SaveImage");
    }

    #[test]
    fn test_parse_ui_format() {
        let value = json!({
            "nodes": [
                {"id": 4, "type": "CheckpointLoaderSimple", "outputs": []},
                {"id": 9, "type": "SaveImage", "inputs": [
                    {"name": "images", "type": "IMAGE", "link": 12},
                    {"name": "mask", "type": "MASK", "link": null}
                ]}
            ],
            "links": [[12, 4, 0, 9, 0, "IMAGE"]]
        });
        let graph = WorkflowGraph::from_json(&value).unwrap();
        let save = graph.get(&NodeId::from("9")).unwrap();
        assert_eq!(save.inputs["images"].link().unwrap().node, NodeId::from("4"));
        assert!(!save.inputs.contains_key("mask"));
        assert!(save.editor);
        assert!(!save.binds("mask"));
        assert!(save.binds("filename_prefix"));
    }

    #[test]
    fn test_virtual_types() {
        assert!(NodeSpec::new("Note").is_virtual());
        assert!(NodeSpec::new("Reroute").is_virtual());
        assert!(!NodeSpec::new("KSampler").is_virtual());
    }

    #[test]
    fn test_serialize_round_trip_keeps_links() {
        let graph = WorkflowGraph::new()
            .with_node("1", NodeSpec::new("LoadImage").with_literal("image", json!("cat.png")))
            .with_node("2", NodeSpec::new("SaveImage").with_link("images", "1", 0));
        let text = serde_json::to_string(&graph).unwrap();
        assert!(text.contains(r#""images":["1",0]"#));
        assert_eq!(WorkflowGraph::from_json_str(&text).unwrap(), graph);
    }

    #[test]
    fn test_serialize_round_trip_keeps_unlinked_sockets() {
        let value = json!({
            "nodes": [{"id": 9, "type": "SaveImage", "inputs": [{"name": "images", "link": null}]}],
            "links": []
        });
        let graph = WorkflowGraph::from_json(&value).unwrap();
        let text = serde_json::to_string(&graph).unwrap();
        assert!(!text.contains("null"));

        let back = WorkflowGraph::from_json_str(&text).unwrap();
        assert_eq!(back, graph);
        let save = back.get(&NodeId::from("9")).unwrap();
        assert!(!save.binds("images"));
        assert!(save.binds("filename_prefix"));

        let api = WorkflowGraph::new().with_node("1", NodeSpec::new("SaveImage"));
        let text = serde_json::to_string(&api).unwrap();
        assert_eq!(text, r#"{"1":{"class_type":"SaveImage","inputs":{}}}"#);
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(
            WorkflowGraph::from_json(&json!([1, 2])),
            Err(NodescopeError::InvalidWorkflow(_))
        ));
    }

    #[test]
    fn test_empty_literal() {
        assert!(InputValue::Literal(Value::Null).is_empty_literal());
        assert!(InputValue::Literal(json!("  ")).is_empty_literal());
        assert!(!InputValue::Literal(json!(0)).is_empty_literal());
        assert!(!InputValue::Literal(json!(["1"])).is_empty_literal());
    }
}
