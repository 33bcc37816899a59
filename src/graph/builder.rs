//! Graph construction from declared resources.
//!
//! The builder scans every attribute recursively for references, adds the
//! explicit `depends_on` edges, and runs a depth-first cycle check before
//! handing out a [`ResourceGraph`].

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::ResourceSpec;
use crate::error::GraphError;

use super::dag::{Edge, EdgeKind, GraphNode, ResourceGraph};

/// DFS colouring for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Builds dependency graphs from resource declarations.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    /// Extra edges injected without touching attributes, as `(from, to)`.
    overrides: Vec<(String, String)>,
}

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            overrides: Vec::new(),
        }
    }

    /// Injects an explicit edge: `from` depends on `to`.
    #[must_use]
    pub fn with_override(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.overrides.push((from.into(), to.into()));
        self
    }

    /// Builds the dependency graph.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateResource`] for repeated names,
    /// [`GraphError::UnknownResource`] for dangling edges, and
    /// [`GraphError::CyclicDependency`] if the graph is not acyclic.
    pub fn build(&self, resources: &[ResourceSpec]) -> Result<ResourceGraph, GraphError> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(resources.len());
        for (i, resource) in resources.iter().enumerate() {
            if index.insert(resource.name.as_str(), i).is_some() {
                return Err(GraphError::DuplicateResource {
                    name: resource.name.clone(),
                });
            }
        }

        let lookup = |from: &str, target: &str| {
            index
                .get(target)
                .copied()
                .ok_or_else(|| GraphError::UnknownResource {
                    from: from.to_string(),
                    target: target.to_string(),
                })
        };

        // (from, to) -> strongest edge kind seen; references win over explicit
        let mut edge_kinds: HashMap<(usize, usize), EdgeKind> = HashMap::new();
        let mut record = |from: usize, to: usize, kind: EdgeKind| {
            edge_kinds
                .entry((from, to))
                .and_modify(|k| *k = (*k).min(kind))
                .or_insert(kind);
        };

        for (i, resource) in resources.iter().enumerate() {
            for value in resource.attributes.values() {
                for reference in value.references() {
                    let target = lookup(&resource.name, &reference.resource)?;
                    record(i, target, EdgeKind::Reference);
                }
            }
            for dep in &resource.depends_on {
                let target = lookup(&resource.name, dep)?;
                record(i, target, EdgeKind::Explicit);
            }
        }

        for (from, to) in &self.overrides {
            let from_idx = lookup(from, from)?;
            let target = lookup(from, to)?;
            record(from_idx, target, EdgeKind::Explicit);
        }

        let mut dependencies: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); resources.len()];
        let mut dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); resources.len()];
        for &(from, to) in edge_kinds.keys() {
            dependencies[from].insert(to);
            dependents[to].insert(from);
        }

        detect_cycle(resources, &dependencies)?;

        let mut edges: Vec<(usize, usize, EdgeKind)> = edge_kinds
            .into_iter()
            .map(|((from, to), kind)| (from, to, kind))
            .collect();
        edges.sort_unstable();

        let edges = edges
            .into_iter()
            .map(|(from, to, kind)| Edge {
                from: resources[from].name.clone(),
                to: resources[to].name.clone(),
                kind,
            })
            .collect::<Vec<_>>();

        let nodes = resources
            .iter()
            .enumerate()
            .map(|(i, r)| GraphNode {
                name: r.name.clone(),
                resource_type: r.resource_type.clone(),
                dependencies: dependencies[i].iter().copied().collect(),
                dependents: dependents[i].iter().copied().collect(),
            })
            .collect();

        debug!(
            "Built dependency graph: {} resources, {} edges",
            resources.len(),
            edges.len()
        );

        Ok(ResourceGraph::from_parts(nodes, edges))
    }
}

/// Depth-first search with recursion-stack tracking.
///
/// Roots are visited in declaration order and dependencies in ascending
/// order, so the same input always reports the same cycle.
fn detect_cycle(resources: &[ResourceSpec], dependencies: &[BTreeSet<usize>]) -> Result<(), GraphError> {
    let mut marks = vec![Mark::Unvisited; resources.len()];
    let mut stack: Vec<usize> = Vec::new();

    for root in 0..resources.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }

        // Explicit stack of (node, iterator position) avoids deep recursion
        let mut frames: Vec<(usize, Vec<usize>, usize)> = Vec::new();
        marks[root] = Mark::OnStack;
        stack.push(root);
        frames.push((root, dependencies[root].iter().copied().collect(), 0));

        while let Some((node, children, pos)) = frames.last_mut() {
            if let Some(&child) = children.get(*pos) {
                *pos += 1;
                match marks[child] {
                    Mark::Unvisited => {
                        marks[child] = Mark::OnStack;
                        stack.push(child);
                        frames.push((child, dependencies[child].iter().copied().collect(), 0));
                    }
                    Mark::OnStack => {
                        let start = stack.iter().position(|&n| n == child).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|&n| resources[n].name.clone())
                            .collect();
                        cycle.push(resources[child].name.clone());
                        return Err(GraphError::CyclicDependency { cycle });
                    }
                    Mark::Done => {}
                }
            } else {
                marks[*node] = Mark::Done;
                stack.pop();
                frames.pop();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn vpc() -> ResourceSpec {
        ResourceSpec::new("main", "vpc").with_attribute("cidr_block", "10.0.0.0/16")
    }

    fn subnet(name: &str) -> ResourceSpec {
        ResourceSpec::new(name, "subnet").with_attribute("vpc_id", Value::reference("main", "id"))
    }

    #[test]
    fn test_edges_match_references() {
        let route = ResourceSpec::new("rt", "route_table")
            .with_attribute("vpc_id", Value::reference("main", "id"))
            .with_attribute(
                "associations",
                Value::List(vec![Value::reference("public_a", "id"), Value::reference("public_b", "id")]),
            );
        let resources = vec![vpc(), subnet("public_a"), subnet("public_b"), route];

        let graph = GraphBuilder::new().build(&resources).unwrap();

        let edges: Vec<(&str, &str)> = graph
            .edges()
            .iter()
            .map(|e| (e.from.as_str(), e.to.as_str()))
            .collect();
        assert_eq!(
            edges,
            vec![
                ("public_a", "main"),
                ("public_b", "main"),
                ("rt", "main"),
                ("rt", "public_a"),
                ("rt", "public_b"),
            ]
        );
        assert!(graph.edges().iter().all(|e| e.kind == EdgeKind::Reference));
        assert_eq!(graph.dependents_of("main"), vec!["public_a", "public_b", "rt"]);
    }

    #[test]
    fn test_explicit_dependencies_and_overrides() {
        let fw = ResourceSpec::new("fw", "instance").with_depends_on("public_a");
        let resources = vec![vpc(), subnet("public_a"), fw];

        let graph = GraphBuilder::new()
            .with_override("fw", "main")
            .build(&resources)
            .unwrap();

        assert_eq!(graph.dependencies_of("fw"), vec!["main", "public_a"]);
        let explicit: Vec<_> = graph
            .edges()
            .iter()
            .filter(|e| e.kind == EdgeKind::Explicit)
            .map(|e| e.to.as_str())
            .collect();
        assert_eq!(explicit, vec!["main", "public_a"]);
    }

    #[test]
    fn test_reference_wins_over_explicit_edge() {
        let sub = subnet("public_a").with_depends_on("main");
        let graph = GraphBuilder::new().build(&[vpc(), sub]).unwrap();
        assert_eq!(graph.edges().len(), 1);
        assert_eq!(graph.edges()[0].kind, EdgeKind::Reference);
    }

    #[test]
    fn test_cycle_detected_deterministically() {
        let resources = vec![
            ResourceSpec::new("a", "t").with_attribute("x", Value::reference("b", "id")),
            ResourceSpec::new("b", "t").with_attribute("x", Value::reference("c", "id")),
            ResourceSpec::new("c", "t").with_attribute("x", Value::reference("a", "id")),
            ResourceSpec::new("d", "t"),
        ];

        let builder = GraphBuilder::new();
        let first = builder.build(&resources).unwrap_err();
        let second = builder.build(&resources).unwrap_err();

        assert_eq!(first, second);
        assert_eq!(
            first,
            GraphError::CyclicDependency {
                cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()],
            }
        );
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let resources = vec![ResourceSpec::new("a", "t").with_attribute("x", Value::reference("a", "id"))];
        let err = GraphBuilder::new().build(&resources).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                cycle: vec!["a".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_unknown_target_rejected() {
        let err = GraphBuilder::new().build(&[subnet("public_a")]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownResource {
                from: "public_a".into(),
                target: "main".into()
            }
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = GraphBuilder::new().build(&[vpc(), vpc()]).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateResource { .. }));
    }
}
