//! Directed acyclic dependency graph over declared resources.
//!
//! Nodes keep declaration order; that order is the tie-breaker for every
//! traversal so output is stable across runs.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Write;

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// An attribute of `from` references an attribute of `to`.
    Reference,
    /// `from` lists `to` in `depends_on`.
    Explicit,
}

/// A dependency edge: `from` depends on `to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Edge {
    /// Dependent resource.
    pub from: String,
    /// Dependency.
    pub to: String,
    /// Edge origin.
    pub kind: EdgeKind,
}

/// A resource in the graph.
#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    /// Resource name.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Indices of resources this one depends on, ascending.
    pub dependencies: Vec<usize>,
    /// Indices of resources depending on this one, ascending.
    pub dependents: Vec<usize>,
}

/// Dependency graph produced by the graph builder.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceGraph {
    nodes: Vec<GraphNode>,
    edges: Vec<Edge>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl ResourceGraph {
    /// Creates a graph from nodes in declaration order and the edge list.
    ///
    /// Callers must guarantee acyclicity; the graph builder does.
    pub(crate) fn from_parts(nodes: Vec<GraphNode>, edges: Vec<Edge>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        Self { nodes, edges, index }
    }

    /// Returns the number of resources.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Returns all edges, sorted by dependent then dependency declaration order.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Returns the declaration index of a resource.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Returns a node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.index_of(name).map(|i| &self.nodes[i])
    }

    /// Returns true if the graph contains `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Returns the names `name` directly depends on.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.node(name)
            .map(|n| n.dependencies.iter().map(|&i| self.nodes[i].name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Returns the names that directly depend on `name`.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.node(name)
            .map(|n| n.dependents.iter().map(|&i| self.nodes[i].name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Returns node indices in topological order, dependencies first.
    ///
    /// Kahn's algorithm; among ready nodes the earliest declared goes first.
    #[must_use]
    pub fn topological_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(current)) = ready.pop() {
            order.push(current);
            for &dependent in &self.nodes[current].dependents {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        order
    }

    /// Returns resource names in topological order.
    #[must_use]
    pub fn topological_names(&self) -> Vec<&str> {
        self.topological_order()
            .into_iter()
            .map(|i| self.nodes[i].name.as_str())
            .collect()
    }

    /// Groups resources into levels: every resource sits one level above its
    /// deepest dependency, so each level only depends on earlier levels.
    #[must_use]
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.nodes.len()];
        for i in self.topological_order() {
            depth[i] = self.nodes[i]
                .dependencies
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut levels: Vec<Vec<usize>> = Vec::new();
        for (i, &d) in depth.iter().enumerate() {
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(i);
        }
        levels
    }

    /// Returns `roots` plus everything that transitively depends on them,
    /// as sorted declaration indices.
    #[must_use]
    pub fn with_transitive_dependents(&self, roots: &[usize]) -> Vec<usize> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = roots.to_vec();
        while let Some(i) = stack.pop() {
            if i >= seen.len() || seen[i] {
                continue;
            }
            seen[i] = true;
            stack.extend(self.nodes[i].dependents.iter().copied());
        }
        seen.iter()
            .enumerate()
            .filter_map(|(i, &s)| s.then_some(i))
            .collect()
    }

    /// Renders the graph in Graphviz DOT format.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph topology {\n  rankdir = \"BT\";\n");
        for node in &self.nodes {
            let _ = writeln!(
                out,
                "  \"{}\" [label = \"{}.{}\"];",
                node.name, node.resource_type, node.name
            );
        }
        for edge in &self.edges {
            let style = match edge.kind {
                EdgeKind::Reference => "solid",
                EdgeKind::Explicit => "dashed",
            };
            let _ = writeln!(out, "  \"{}\" -> \"{}\" [style = {style}];", edge.from, edge.to);
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a graph from `(name, deps)` pairs without going through the builder.
    fn graph(spec: &[(&str, &[usize])]) -> ResourceGraph {
        let mut nodes: Vec<GraphNode> = spec
            .iter()
            .map(|(name, deps)| GraphNode {
                name: (*name).to_string(),
                resource_type: String::from("t"),
                dependencies: deps.to_vec(),
                dependents: Vec::new(),
            })
            .collect();
        let mut edges = Vec::new();
        for i in 0..nodes.len() {
            for d in nodes[i].dependencies.clone() {
                nodes[d].dependents.push(i);
                edges.push(Edge {
                    from: nodes[i].name.clone(),
                    to: nodes[d].name.clone(),
                    kind: EdgeKind::Reference,
                });
            }
        }
        ResourceGraph::from_parts(nodes, edges)
    }

    #[test]
    fn test_topological_order_breaks_ties_by_declaration() {
        // c depends on a; b is independent; d depends on b and c
        let g = graph(&[("c", &[1]), ("a", &[]), ("b", &[]), ("d", &[2, 0])]);
        assert_eq!(g.topological_names(), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn test_levels() {
        let g = graph(&[("vpc", &[]), ("igw", &[0]), ("subnet", &[0]), ("route", &[1, 2])]);
        assert_eq!(g.levels(), vec![vec![0], vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_transitive_dependents() {
        let g = graph(&[("vpc", &[]), ("subnet", &[0]), ("nat", &[1]), ("other", &[])]);
        assert_eq!(g.with_transitive_dependents(&[1]), vec![1, 2]);
        assert_eq!(g.with_transitive_dependents(&[0]), vec![0, 1, 2]);
    }

    #[test]
    fn test_dot_output() {
        let g = graph(&[("vpc", &[]), ("subnet", &[0])]);
        let dot = g.to_dot();
        assert!(dot.starts_with("digraph topology {"));
        assert!(dot.contains("\"subnet\" -> \"vpc\""));
    }
}
