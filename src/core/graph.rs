//! Graph model - validates a submitted node/edge set and builds the task DAG

use crate::error::ValidationError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

/// Node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Agent,
    Human,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Human => write!(f, "human"),
        }
    }
}

/// Configuration of an automatic agent step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(alias = "agentId")]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, alias = "maxTokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, alias = "useRag")]
    pub use_rag: bool,
}

impl AgentConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.agent_id.trim().is_empty() {
            return Err("agent_id must not be empty".to_string());
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("temperature {} outside 0.0..=2.0", t));
            }
        }
        if self.max_tokens == Some(0) {
            return Err("max_tokens must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Configuration of a step that waits for a person
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HumanConfig {
    #[serde(default, alias = "userId", skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl HumanConfig {
    /// Text shown to whoever resolves the step
    pub fn prompt(&self) -> Option<String> {
        self.instructions.clone().or_else(|| self.task.clone())
    }
}

/// Typed, validated per-kind configuration
#[derive(Debug, Clone, PartialEq)]
pub enum NodeConfig {
    Agent(AgentConfig),
    Human(HumanConfig),
}

/// A validated node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub id: String,
    pub config: NodeConfig,
}

impl NodeSpec {
    pub fn kind(&self) -> NodeKind {
        match self.config {
            NodeConfig::Agent(_) => NodeKind::Agent,
            NodeConfig::Human(_) => NodeKind::Human,
        }
    }
}

/// Node as submitted, before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNode {
    pub id: String,
    #[serde(alias = "type")]
    pub kind: String,
    #[serde(default, alias = "configuration")]
    pub config: serde_json::Value,
}

/// Dependency edge: `to` runs after `from` completes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeSpec {
    #[serde(alias = "source")]
    pub from: String,
    #[serde(alias = "target")]
    pub to: String,
}

impl EdgeSpec {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Wire form of a graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub nodes: Vec<RawNode>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

impl GraphSpec {
    /// Load a graph from a YAML or JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading graph file {}", path.display()))?;
        let spec: GraphSpec = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing graph file {}", path.display()))?;
        Ok(spec)
    }
}

/// Immutable, validated task DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "GraphSpec", try_from = "GraphSpec")]
pub struct Graph {
    nodes: Vec<NodeSpec>,
    index: HashMap<String, usize>,
    edges: Vec<EdgeSpec>,
    successors: HashMap<String, Vec<String>>,
    predecessors: HashMap<String, Vec<String>>,
}

impl Graph {
    /// Validate nodes and edges and build the graph
    pub fn build(nodes: Vec<RawNode>, edges: Vec<EdgeSpec>) -> std::result::Result<Self, ValidationError> {
        if nodes.is_empty() {
            return Err(ValidationError::EmptyGraph);
        }

        let mut specs = Vec::with_capacity(nodes.len());
        let mut index = HashMap::with_capacity(nodes.len());
        for raw in nodes {
            if index.contains_key(&raw.id) {
                return Err(ValidationError::DuplicateNode(raw.id));
            }
            let config = parse_config(&raw)?;
            index.insert(raw.id.clone(), specs.len());
            specs.push(NodeSpec { id: raw.id, config });
        }

        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(edges.len());
        for edge in edges {
            for end in [&edge.from, &edge.to] {
                if !index.contains_key(end) {
                    return Err(ValidationError::DanglingEdge {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: end.clone(),
                    });
                }
            }
            if edge.from == edge.to {
                return Err(ValidationError::SelfLoop(edge.from));
            }
            if seen.insert(edge.clone()) {
                kept.push(edge);
            }
        }

        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        for node in &specs {
            successors.insert(node.id.clone(), Vec::new());
            predecessors.insert(node.id.clone(), Vec::new());
        }
        for edge in &kept {
            if let Some(list) = successors.get_mut(&edge.from) {
                list.push(edge.to.clone());
            }
            if let Some(list) = predecessors.get_mut(&edge.to) {
                list.push(edge.from.clone());
            }
        }

        let graph = Self {
            nodes: specs,
            index,
            edges: kept,
            successors,
            predecessors,
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(ValidationError::Cycle(cycle));
        }
        Ok(graph)
    }

    pub fn from_spec(spec: GraphSpec) -> std::result::Result<Self, ValidationError> {
        Self::build(spec.nodes, spec.edges)
    }

    /// Load and validate a graph file
    pub fn from_file(path: &Path) -> Result<Self> {
        let spec = GraphSpec::from_file(path)?;
        let graph = Self::from_spec(spec)
            .with_context(|| format!("validating graph file {}", path.display()))?;
        Ok(graph)
    }

    pub fn to_spec(&self) -> GraphSpec {
        GraphSpec::from(self.clone())
    }

    /// All nodes in submission order
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn edges(&self) -> &[EdgeSpec] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes without incoming edges
    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.predecessors(&n.id).is_empty())
            .map(|n| n.id.as_str())
            .collect()
    }

    pub fn successors(&self, id: &str) -> &[String] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: &str) -> &[String] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Topological layers: every node's predecessors sit in earlier layers
    pub fn generations(&self) -> Vec<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), self.predecessors(&n.id).len()))
            .collect();

        let mut layers = Vec::new();
        let mut current: Vec<&str> = self.roots();
        while !current.is_empty() {
            let mut next = Vec::new();
            for id in &current {
                for succ in self.successors(id) {
                    if let Some(d) = indegree.get_mut(succ.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            next.push(succ.as_str());
                        }
                    }
                }
            }
            layers.push(current.iter().map(|s| s.to_string()).collect());
            current = next;
        }
        layers
    }

    /// Three-color depth-first search. Returns the first cycle found,
    /// closed on its starting node.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let succ: Vec<Vec<usize>> = self
            .nodes
            .iter()
            .map(|n| {
                self.successors(&n.id)
                    .iter()
                    .filter_map(|s| self.index.get(s).copied())
                    .collect()
            })
            .collect();

        let mut color = vec![Color::White; self.nodes.len()];
        for start in 0..self.nodes.len() {
            if color[start] != Color::White {
                continue;
            }

            let mut path = vec![start];
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            color[start] = Color::Gray;

            while let Some(&(node, child)) = stack.last() {
                if let Some(&next) = succ[node].get(child) {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    match color[next] {
                        Color::White => {
                            color[next] = Color::Gray;
                            path.push(next);
                            stack.push((next, 0));
                        }
                        Color::Gray => {
                            let from = path.iter().position(|&p| p == next).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[from..].iter().map(|&i| self.nodes[i].id.clone()).collect();
                            cycle.push(self.nodes[next].id.clone());
                            return Some(cycle);
                        }
                        Color::Black => {}
                    }
                } else {
                    color[node] = Color::Black;
                    path.pop();
                    stack.pop();
                }
            }
        }
        None
    }
}

fn parse_config(raw: &RawNode) -> std::result::Result<NodeConfig, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidConfig {
        id: raw.id.clone(),
        reason,
    };

    // a missing config block is an empty one
    let value = match &raw.config {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other.clone(),
    };

    match raw.kind.as_str() {
        "agent" => {
            let config: AgentConfig =
                serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
            config.validate().map_err(invalid)?;
            Ok(NodeConfig::Agent(config))
        }
        "human" => {
            let config: HumanConfig =
                serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
            Ok(NodeConfig::Human(config))
        }
        other => Err(ValidationError::UnknownKind {
            id: raw.id.clone(),
            kind: other.to_string(),
        }),
    }
}

impl From<Graph> for GraphSpec {
    fn from(graph: Graph) -> Self {
        let nodes = graph
            .nodes
            .into_iter()
            .map(|node| {
                let (kind, config) = match node.config {
                    NodeConfig::Agent(c) => (NodeKind::Agent, serde_json::to_value(c)),
                    NodeConfig::Human(c) => (NodeKind::Human, serde_json::to_value(c)),
                };
                RawNode {
                    id: node.id,
                    kind: kind.to_string(),
                    config: config.unwrap_or_default(),
                }
            })
            .collect();
        GraphSpec {
            nodes,
            edges: graph.edges,
        }
    }
}

impl TryFrom<GraphSpec> for Graph {
    type Error = ValidationError;

    fn try_from(spec: GraphSpec) -> std::result::Result<Self, Self::Error> {
        Graph::from_spec(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent(id: &str) -> RawNode {
        RawNode {
            id: id.to_string(),
            kind: "agent".to_string(),
            config: json!({ "agent_id": format!("agent-{}", id) }),
        }
    }

    fn human(id: &str) -> RawNode {
        RawNode {
            id: id.to_string(),
            kind: "human".to_string(),
            config: json!({ "instructions": "approve the draft" }),
        }
    }

    #[test]
    fn test_build_diamond() {
        let graph = Graph::build(
            vec![agent("a"), agent("b"), human("c"), agent("d")],
            vec![
                EdgeSpec::new("a", "b"),
                EdgeSpec::new("a", "c"),
                EdgeSpec::new("b", "d"),
                EdgeSpec::new("c", "d"),
            ],
        )
        .unwrap();

        assert_eq!(graph.roots(), vec!["a"]);
        assert_eq!(graph.successors("a"), ["b".to_string(), "c".to_string()]);
        assert_eq!(graph.predecessors("d"), ["b".to_string(), "c".to_string()]);
        assert_eq!(graph.node("c").unwrap().kind(), NodeKind::Human);
        assert_eq!(
            graph.generations(),
            vec![vec!["a".to_string()], vec!["b".into(), "c".into()], vec!["d".into()]]
        );
    }

    #[test]
    fn test_rejects_empty_graph() {
        assert_eq!(Graph::build(vec![], vec![]).unwrap_err(), ValidationError::EmptyGraph);
    }

    #[test]
    fn test_rejects_duplicate_node() {
        let err = Graph::build(vec![agent("a"), agent("a")], vec![]).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateNode("a".into()));
    }

    #[test]
    fn test_rejects_dangling_edge() {
        let err = Graph::build(vec![agent("a")], vec![EdgeSpec::new("a", "ghost")]).unwrap_err();
        assert!(matches!(err, ValidationError::DanglingEdge { missing, .. } if missing == "ghost"));
    }

    #[test]
    fn test_rejects_self_loop() {
        let err = Graph::build(vec![agent("a")], vec![EdgeSpec::new("a", "a")]).unwrap_err();
        assert_eq!(err, ValidationError::SelfLoop("a".into()));
    }

    #[test]
    fn test_cycle_reports_offending_nodes() {
        let err = Graph::build(
            vec![agent("root"), agent("a"), agent("b"), agent("c")],
            vec![
                EdgeSpec::new("root", "a"),
                EdgeSpec::new("a", "b"),
                EdgeSpec::new("b", "c"),
                EdgeSpec::new("c", "a"),
            ],
        )
        .unwrap_err();

        match err {
            ValidationError::Cycle(ids) => {
                assert_eq!(ids, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let node = RawNode {
            id: "x".into(),
            kind: "robot".into(),
            config: json!({}),
        };
        let err = Graph::build(vec![node], vec![]).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownKind { kind, .. } if kind == "robot"));
    }

    #[test]
    fn test_rejects_malformed_agent_config() {
        let missing_id = RawNode {
            id: "a".into(),
            kind: "agent".into(),
            config: serde_json::Value::Null,
        };
        assert!(matches!(
            Graph::build(vec![missing_id], vec![]).unwrap_err(),
            ValidationError::InvalidConfig { .. }
        ));

        let unknown_field = RawNode {
            id: "a".into(),
            kind: "agent".into(),
            config: json!({ "agent_id": "x", "colour": "blue" }),
        };
        assert!(matches!(
            Graph::build(vec![unknown_field], vec![]).unwrap_err(),
            ValidationError::InvalidConfig { .. }
        ));

        let hot = RawNode {
            id: "a".into(),
            kind: "agent".into(),
            config: json!({ "agent_id": "x", "temperature": 3.5 }),
        };
        assert!(matches!(
            Graph::build(vec![hot], vec![]).unwrap_err(),
            ValidationError::InvalidConfig { .. }
        ));
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let graph = Graph::build(
            vec![agent("a"), agent("b")],
            vec![EdgeSpec::new("a", "b"), EdgeSpec::new("a", "b")],
        )
        .unwrap();
        assert_eq!(graph.edges().len(), 1);
        assert_eq!(graph.predecessors("b").len(), 1);
    }

    #[test]
    fn test_accepts_front_end_field_names() {
        let spec: GraphSpec = serde_json::from_value(json!({
            "nodes": [
                { "id": "n1", "type": "agent", "configuration": { "agentId": "summarizer", "maxTokens": 512 } },
                { "id": "n2", "type": "human", "configuration": { "userId": "u-7", "task": "review" } }
            ],
            "edges": [ { "source": "n1", "target": "n2" } ]
        }))
        .unwrap();

        let graph = Graph::from_spec(spec).unwrap();
        match &graph.node("n1").unwrap().config {
            NodeConfig::Agent(c) => {
                assert_eq!(c.agent_id, "summarizer");
                assert_eq!(c.max_tokens, Some(512));
            }
            other => panic!("expected agent config, got {other:?}"),
        }
        match &graph.node("n2").unwrap().config {
            NodeConfig::Human(c) => assert_eq!(c.prompt().as_deref(), Some("review")),
            other => panic!("expected human config, got {other:?}"),
        }
    }

    #[test]
    fn test_graph_serializes_through_spec() {
        let graph = Graph::build(vec![agent("a"), human("b")], vec![EdgeSpec::new("a", "b")]).unwrap();
        let json = serde_json::to_string(&graph).unwrap();
        let back: Graph = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nodes(), graph.nodes());
        assert_eq!(back.edges(), graph.edges());
    }

    #[test]
    fn test_from_file_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.yml");
        std::fs::write(
            &path,
            "nodes:\n  - id: a\n    kind: agent\n    config:\n      agent_id: writer\n  - id: b\n    kind: human\nedges:\n  - from: a\n    to: b\n",
        )
        .unwrap();

        let graph = Graph::from_file(&path).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.roots(), vec!["a"]);
    }
}
