//! Dependency Graph
//!
//! This module implements the graph model of one valuation cycle: which
//! functions are applied to which targets, and how their values flow.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes apply one function to one target
//! - Edges are implied by values: if A consumes a value B produces, A depends on B
//!
//! # Design Decisions
//!
//! 1. Graphs are rebuilt every cycle by the view compiler, so node and graph
//!    equality is identity-based. Structural comparison lives in separate key
//!    types ([`DependencyNodeKey`], [`DependencyGraphKey`]) used only for plan
//!    caching.
//!
//! 2. Nodes are indexed by insertion order for O(1) lookups, and that order
//!    is the tie-breaker for every traversal, which keeps partitioning
//!    reproducible.
//!
//! 3. We maintain both forward (inputs) and reverse (dependents) edges
//!    to enable efficient traversal in both directions.

mod dependency_graph;
mod key;
mod node;
mod value;

pub use dependency_graph::{DependencyGraph, DependencyGraphBuilder};
pub use key::{DependencyGraphKey, DependencyNodeKey};
pub use node::{DependencyNode, GraphId, NodeId};
pub use value::{FunctionId, TargetSpecification, ValueRequirement, ValueSpecification};
