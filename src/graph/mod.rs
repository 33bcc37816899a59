//! Dependency graph construction and traversal.
//!
//! - Building the DAG from references and `depends_on`
//! - Cycle detection with a deterministic cycle report
//! - Topological ordering and level grouping

mod builder;
mod dag;

pub use builder::GraphBuilder;
pub use dag::{Edge, EdgeKind, GraphNode, ResourceGraph};
