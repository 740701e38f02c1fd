//! Workflow Validator
//!
//! Structural checks on a graph snapshot, run before the graph is queued.
//! Nothing here executes nodes. The result is deterministic: graph-level issues
//! first, then issues grouped by node id in graph order, then by issue kind.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::registry::NodeRegistry;
use crate::workflow::{NodeId, WorkflowGraph};

/// Warnings listed in a rendered report before eliding the rest
const MAX_RENDERED_WARNINGS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Issue kinds, in reporting order within one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    EmptyWorkflow,
    NoOutputNode,
    UnknownType,
    DanglingLink,
    MissingInput,
    EmptyInput,
    Cycle,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub severity: Severity,
    pub node_id: Option<NodeId>,
    pub kind: IssueKind,
    pub description: String,
    /// Nodes involved, for issues spanning several (cycles)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeId>,
}

impl HealthIssue {
    fn new(severity: Severity, node_id: Option<&NodeId>, kind: IssueKind, description: String) -> Self {
        Self {
            severity,
            node_id: node_id.cloned(),
            kind,
            description,
            nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub node_count: usize,
    pub issues: Vec<HealthIssue>,
    pub summary: String,
}

impl HealthReport {
    pub fn errors(&self) -> impl Iterator<Item = &HealthIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &HealthIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    /// Plain-text report for agents.
    pub fn render(&self) -> String {
        let mut lines = vec![self.summary.clone()];

        let errors: Vec<_> = self.errors().collect();
        if !errors.is_empty() {
            lines.push(String::new());
            lines.push("Errors:".to_string());
            lines.extend(errors.iter().map(|i| format!("- {}", i.description)));
        }

        let warnings: Vec<_> = self.warnings().collect();
        if !warnings.is_empty() {
            lines.push(String::new());
            lines.push("Warnings:".to_string());
            lines.extend(
                warnings
                    .iter()
                    .take(MAX_RENDERED_WARNINGS)
                    .map(|i| format!("- {}", i.description)),
            );
            if warnings.len() > MAX_RENDERED_WARNINGS {
                lines.push(format!("- ... and {} more", warnings.len() - MAX_RENDERED_WARNINGS));
            }
        }

        lines.join("\n")
    }
}

/// Validate and summarize.
pub fn check_workflow_health(graph: &WorkflowGraph, registry: &NodeRegistry) -> HealthReport {
    let issues = validate(graph, registry);
    let errors = issues.iter().filter(|i| i.severity == Severity::Error).count();
    let warnings = issues.len() - errors;
    let node_count = graph.len();

    let summary = match (errors, warnings) {
        (0, 0) => format!("Workflow looks healthy ({} nodes)", node_count),
        (0, w) => format!("{} warning(s) found ({} nodes)", w, node_count),
        (e, w) => format!("{} error(s), {} warning(s) ({} nodes)", e, w, node_count),
    };

    HealthReport {
        healthy: errors == 0,
        node_count,
        issues,
        summary,
    }
}

/// All structural issues of `graph`. With an empty registry the type-dependent
/// checks are skipped and disconnection falls back to "no links at all".
pub fn validate(graph: &WorkflowGraph, registry: &NodeRegistry) -> Vec<HealthIssue> {
    let mut issues = Vec::new();

    if graph.is_empty() {
        issues.push(HealthIssue::new(
            Severity::Warning,
            None,
            IssueKind::EmptyWorkflow,
            "Workflow contains no nodes".to_string(),
        ));
        return issues;
    }

    let have_registry = !registry.is_empty();

    for (id, node) in &graph.nodes {
        // Editor-only helpers are not registered and never execute
        let virtual_node = node.is_virtual();
        let info = registry.get(&node.class_type).filter(|_| !virtual_node);
        if have_registry && info.is_none() && !virtual_node {
            issues.push(HealthIssue::new(
                Severity::Error,
                Some(id),
                IssueKind::UnknownType,
                format!("Node {} uses unregistered type '{}'", id, node.class_type),
            ));
        }

        for (input, link) in node.links() {
            if !graph.nodes.contains_key(&link.node) {
                issues.push(HealthIssue::new(
                    Severity::Error,
                    Some(id),
                    IssueKind::DanglingLink,
                    format!(
                        "Node {} ({}) input '{}' links to missing node {}",
                        id, node.class_type, input, link.node
                    ),
                ));
            }
        }

        if let Some(info) = info {
            for required in &info.required {
                if !node.binds(required) {
                    issues.push(HealthIssue::new(
                        Severity::Error,
                        Some(id),
                        IssueKind::MissingInput,
                        format!(
                            "Node {} ({}) is missing required input '{}'",
                            id, node.class_type, required
                        ),
                    ));
                }
            }
        }

        for (input, value) in node.inputs.iter().filter(|_| !virtual_node) {
            let optional = info.map(|i| i.is_optional(input)).unwrap_or(false);
            if value.is_empty_literal() && !optional {
                issues.push(HealthIssue::new(
                    Severity::Warning,
                    Some(id),
                    IssueKind::EmptyInput,
                    format!("Node {} ({}) has empty input '{}'", id, node.class_type, input),
                ));
            }
        }
    }

    issues.extend(find_cycles(graph));
    issues.extend(find_disconnected(graph, registry));

    order_issues(graph, issues)
}

/// Graph-level issues first, then node order, then kind. Stable within a key.
fn order_issues(graph: &WorkflowGraph, mut issues: Vec<HealthIssue>) -> Vec<HealthIssue> {
    let position: HashMap<&NodeId, usize> = graph.nodes.keys().enumerate().map(|(i, id)| (id, i)).collect();
    issues.sort_by_key(|issue| {
        let pos = issue
            .node_id
            .as_ref()
            .and_then(|id| position.get(id))
            .map(|p| p + 1)
            .unwrap_or(0);
        (pos, issue.kind)
    });
    issues
}

/// Edges as source -> consumers, restricted to nodes that exist.
fn forward_edges(graph: &WorkflowGraph) -> BTreeMap<&NodeId, BTreeSet<&NodeId>> {
    let mut edges: BTreeMap<&NodeId, BTreeSet<&NodeId>> =
        graph.nodes.keys().map(|id| (id, BTreeSet::new())).collect();
    for (target, node) in &graph.nodes {
        for (_, link) in node.links() {
            if let Some((source, _)) = graph.nodes.get_key_value(&link.node) {
                edges.entry(source).or_default().insert(target);
            }
        }
    }
    edges
}

/// One issue per strongly connected component with a cycle (Tarjan).
fn find_cycles(graph: &WorkflowGraph) -> Vec<HealthIssue> {
    struct Tarjan<'a> {
        edges: &'a BTreeMap<&'a NodeId, BTreeSet<&'a NodeId>>,
        index: HashMap<&'a NodeId, usize>,
        lowlink: HashMap<&'a NodeId, usize>,
        stack: Vec<&'a NodeId>,
        on_stack: BTreeSet<&'a NodeId>,
        next: usize,
        components: Vec<Vec<&'a NodeId>>,
    }

    impl<'a> Tarjan<'a> {
        fn enter(&mut self, v: &'a NodeId) {
            self.index.insert(v, self.next);
            self.lowlink.insert(v, self.next);
            self.next += 1;
            self.stack.push(v);
            self.on_stack.insert(v);
        }

        /// Depth-first walk from `root` on an explicit frame stack; graphs
        /// can be long chains.
        fn visit(&mut self, root: &'a NodeId) {
            let edges = self.edges;
            let successors = |v: &'a NodeId| edges.get(v).into_iter().flatten().copied();

            self.enter(root);
            let mut frames = vec![(root, successors(root))];
            while let Some((v, pending)) = frames.last_mut() {
                let v = *v;
                if let Some(w) = pending.next() {
                    if !self.index.contains_key(w) {
                        self.enter(w);
                        frames.push((w, successors(w)));
                    } else if self.on_stack.contains(w) {
                        let low = self.lowlink[v].min(self.index[w]);
                        self.lowlink.insert(v, low);
                    }
                    continue;
                }

                frames.pop();
                if self.lowlink[v] == self.index[v] {
                    let mut component = Vec::new();
                    while let Some(w) = self.stack.pop() {
                        self.on_stack.remove(w);
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    self.components.push(component);
                }
                if let Some(&(parent, _)) = frames.last() {
                    let low = self.lowlink[parent].min(self.lowlink[v]);
                    self.lowlink.insert(parent, low);
                }
            }
        }
    }

    let edges = forward_edges(graph);
    let mut tarjan = Tarjan {
        edges: &edges,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        next: 0,
        components: Vec::new(),
    };
    for id in graph.nodes.keys() {
        if !tarjan.index.contains_key(id) {
            tarjan.visit(id);
        }
    }

    let mut issues = Vec::new();
    for mut component in tarjan.components {
        let self_loop = component.len() == 1
            && edges
                .get(component[0])
                .map(|targets| targets.contains(component[0]))
                .unwrap_or(false);
        if component.len() < 2 && !self_loop {
            continue;
        }
        component.sort();
        let members: Vec<NodeId> = component.into_iter().cloned().collect();
        let listed = members.iter().map(NodeId::as_str).collect::<Vec<_>>().join(", ");
        let mut issue = HealthIssue::new(
            Severity::Error,
            members.first(),
            IssueKind::Cycle,
            format!("Cycle detected between nodes {}", listed),
        );
        issue.nodes = members;
        issues.push(issue);
    }
    issues
}

fn find_disconnected(graph: &WorkflowGraph, registry: &NodeRegistry) -> Vec<HealthIssue> {
    if registry.is_empty() {
        return find_unlinked(graph);
    }

    let outputs: Vec<&NodeId> = graph
        .nodes
        .iter()
        .filter(|(_, node)| registry.get(&node.class_type).map(|i| i.output_node).unwrap_or(false))
        .map(|(id, _)| id)
        .collect();

    if outputs.is_empty() {
        return vec![HealthIssue::new(
            Severity::Warning,
            None,
            IssueKind::NoOutputNode,
            "Workflow has no output node; nothing would be produced".to_string(),
        )];
    }

    let mut reached: BTreeSet<&NodeId> = BTreeSet::new();
    let mut queue: VecDeque<&NodeId> = outputs.into_iter().collect();
    while let Some(id) = queue.pop_front() {
        if !reached.insert(id) {
            continue;
        }
        if let Some(node) = graph.get(id) {
            for (_, link) in node.links() {
                if let Some((source, _)) = graph.nodes.get_key_value(&link.node) {
                    queue.push_back(source);
                }
            }
        }
    }

    graph
        .nodes
        .iter()
        .filter(|(id, node)| !reached.contains(id) && !node.is_virtual())
        .map(|(id, node)| {
            HealthIssue::new(
                Severity::Warning,
                Some(id),
                IssueKind::Disconnected,
                format!("Node {} ({}) does not feed any output node", id, node.class_type),
            )
        })
        .collect()
}

/// Registry-less fallback: nodes with neither inputs nor consumers.
fn find_unlinked(graph: &WorkflowGraph) -> Vec<HealthIssue> {
    if graph.len() < 2 {
        return Vec::new();
    }
    let edges = forward_edges(graph);
    let mut linked: BTreeSet<&NodeId> = BTreeSet::new();
    for (source, targets) in &edges {
        if !targets.is_empty() {
            linked.insert(source);
            linked.extend(targets.iter().copied());
        }
    }
    graph
        .nodes
        .iter()
        .filter(|(id, node)| !linked.contains(id) && !node.is_virtual())
        .map(|(id, node)| {
            HealthIssue::new(
                Severity::Warning,
                Some(id),
                IssueKind::Disconnected,
                format!("Node {} ({}) appears disconnected", id, node.class_type),
            )
        })
        .collect()
}
