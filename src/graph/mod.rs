//! The project graph: workspace projects, installed packages, and the
//! dependencies between them.
//!
//! A graph is an immutable value. It is built once per invocation (or
//! loaded from the graph cache), then shared by reference; nothing
//! mutates it afterwards.

pub mod builder;
pub mod cache;

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::config::TargetConfig;
use crate::error::GraphError;

pub use builder::{ProjectGraphBuilder, Warning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    App,
    Lib,
}

/// A first-party project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectNode {
    pub name: String,
    /// Workspace-relative root directory.
    pub root: Utf8PathBuf,
    #[serde(rename = "type")]
    pub project_type: ProjectType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_root: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub targets: BTreeMap<String, TargetConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// An installed third-party package, keyed as `npm:<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalNode {
    pub package_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Static,
    Dynamic,
    Implicit,
}

/// A dependency edge. `source_file` records where an explicit edge was
/// discovered; implicit edges carry none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: EdgeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectGraph {
    pub nodes: BTreeMap<String, ProjectNode>,
    pub external_nodes: BTreeMap<String, ExternalNode>,
    /// Source project -> outgoing edges.
    pub dependencies: BTreeMap<String, Vec<Edge>>,
}

impl ProjectGraph {
    pub fn project(&self, name: &str) -> Option<&ProjectNode> {
        self.nodes.get(name)
    }

    /// Names of first-party projects this project depends on directly.
    pub fn direct_dependencies(&self, name: &str) -> Vec<&str> {
        let mut deps: Vec<&str> = self
            .dependencies
            .get(name)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|edge| self.nodes.contains_key(&edge.target))
                    .map(|edge| edge.target.as_str())
                    .collect()
            })
            .unwrap_or_default();

        deps.sort_unstable();
        deps.dedup();
        deps
    }

    /// The project owning `path`, by longest matching root.
    pub fn project_for_path(&self, path: &Utf8Path) -> Option<&ProjectNode> {
        self.nodes
            .values()
            .filter(|node| path.starts_with(&node.root))
            .max_by_key(|node| node.root.as_str().len())
    }

    /// Add an edge, deduplicating on `(source, target, kind)`. The first
    /// discovered source file is kept.
    pub(crate) fn add_edge(&mut self, edge: Edge) {
        let edges = self.dependencies.entry(edge.source.clone()).or_default();
        let exists = edges
            .iter()
            .any(|e| e.target == edge.target && e.kind == edge.kind);

        if !exists {
            edges.push(edge);
        }
    }

    /// Validate that the static first-party subgraph is acyclic, and that
    /// no edge dangles. Reports the offending path on failure.
    pub fn validate(&self) -> Result<(), GraphError> {
        for edges in self.dependencies.values() {
            for edge in edges {
                let known = self.nodes.contains_key(&edge.target)
                    || self.external_nodes.contains_key(&edge.target);
                if !known {
                    return Err(GraphError::UnknownNode(edge.target.clone()));
                }
            }
        }

        // Toposort over the static subgraph detects the cycle; the DFS
        // then recovers the actual path for the error message.
        let (graph, _) = self.petgraph();
        let static_only = petgraph::visit::EdgeFiltered::from_fn(&graph, |edge| {
            *edge.weight() == EdgeKind::Static
        });
        if petgraph::algo::toposort(&static_only, None).is_err() {
            let path = self.find_static_cycle().unwrap_or_default();
            return Err(GraphError::Cycle { path });
        }

        Ok(())
    }

    /// DFS over static first-party edges; returns a closed cycle path
    /// (`a -> b -> a`) if one exists.
    fn find_static_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        let mut stack: Vec<&str> = Vec::new();

        fn visit<'a>(
            graph: &'a ProjectGraph,
            node: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let from = stack.iter().position(|&n| n == node).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[from..].iter().map(|&n| n.to_string()).collect();
                    path.push(node.to_string());
                    return Some(path);
                }
                None => {}
            }

            marks.insert(node, Mark::Visiting);
            stack.push(node);

            if let Some(edges) = graph.dependencies.get(node) {
                for edge in edges {
                    if edge.kind != EdgeKind::Static || !graph.nodes.contains_key(&edge.target) {
                        continue;
                    }
                    if let Some(cycle) = visit(graph, &edge.target, marks, stack) {
                        return Some(cycle);
                    }
                }
            }

            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        for node in self.nodes.keys() {
            if let Some(cycle) = visit(self, node, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }

        None
    }

    /// First-party adjacency as a petgraph, for traversal algorithms.
    pub fn petgraph(&self) -> (DiGraph<&str, EdgeKind>, BTreeMap<&str, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();

        for name in self.nodes.keys() {
            index.insert(name.as_str(), graph.add_node(name.as_str()));
        }

        for edges in self.dependencies.values() {
            for edge in edges {
                if let (Some(&from), Some(&to)) = (
                    index.get(edge.source.as_str()),
                    index.get(edge.target.as_str()),
                ) {
                    graph.add_edge(from, to, edge.kind);
                }
            }
        }

        (graph, index)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn project(name: &str, root: &str) -> ProjectNode {
        ProjectNode {
            name: name.to_string(),
            root: Utf8PathBuf::from(root),
            project_type: ProjectType::Lib,
            source_root: None,
            targets: BTreeMap::new(),
            tags: Vec::new(),
        }
    }

    fn edge(source: &str, target: &str, kind: EdgeKind) -> Edge {
        Edge {
            source: source.to_string(),
            target: target.to_string(),
            kind,
            source_file: None,
        }
    }

    fn graph_of(edges: &[(&str, &str, EdgeKind)]) -> ProjectGraph {
        let mut graph = ProjectGraph::default();
        for (source, target, kind) in edges {
            for name in [source, target] {
                graph
                    .nodes
                    .entry((*name).to_string())
                    .or_insert_with(|| project(name, &format!("libs/{name}")));
            }
            graph.add_edge(edge(source, target, *kind));
        }
        graph
    }

    #[test]
    fn acyclic_graph_validates() {
        let graph = graph_of(&[
            ("a", "b", EdgeKind::Static),
            ("b", "c", EdgeKind::Static),
            ("a", "c", EdgeKind::Static),
        ]);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn static_cycle_is_reported_with_path() {
        let graph = graph_of(&[
            ("a", "b", EdgeKind::Static),
            ("b", "a", EdgeKind::Static),
        ]);

        let Err(GraphError::Cycle { path }) = graph.validate() else {
            panic!("expected a cycle");
        };

        // The path is a closed walk through both projects.
        assert_eq!(path.first(), path.last());
        assert!(path.contains(&"a".to_string()));
        assert!(path.contains(&"b".to_string()));

        // And it is actually a cycle in the graph.
        for pair in path.windows(2) {
            let edges = &graph.dependencies[&pair[0]];
            assert!(edges.iter().any(|e| e.target == pair[1]));
        }
    }

    #[test]
    fn dynamic_edges_do_not_form_cycles() {
        let graph = graph_of(&[
            ("a", "b", EdgeKind::Static),
            ("b", "a", EdgeKind::Dynamic),
        ]);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn edges_deduplicate_by_target_and_kind() {
        let mut graph = graph_of(&[("a", "b", EdgeKind::Static)]);
        graph.add_edge(edge("a", "b", EdgeKind::Static));
        graph.add_edge(edge("a", "b", EdgeKind::Dynamic));

        assert_eq!(graph.dependencies["a"].len(), 2);
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let mut graph = graph_of(&[]);
        graph.nodes.insert("a".into(), project("a", "libs/a"));
        graph.add_edge(edge("a", "ghost", EdgeKind::Static));

        assert!(matches!(
            graph.validate(),
            Err(GraphError::UnknownNode(name)) if name == "ghost"
        ));
    }

    #[test]
    fn serialized_form_round_trips() {
        let graph = graph_of(&[("a", "b", EdgeKind::Static)]);
        let json = serde_json::to_string(&graph).unwrap();
        let back: ProjectGraph = serde_json::from_str(&json).unwrap();

        assert_eq!(back.nodes.len(), 2);
        assert_eq!(back.dependencies["a"], graph.dependencies["a"]);
    }
}
