//! Graph Nodes
//!
//! This module defines the nodes that live in a dependency graph: one
//! application of a function to a target.

use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use super::value::{FunctionId, TargetSpecification, ValueSpecification};

/// Identity of one graph instance.
///
/// Every built graph gets a fresh id, so two structurally identical graphs
/// from consecutive cycles are still told apart by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(u64);

impl GraphId {
    /// Generate a new unique graph ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of a node within its graph, in insertion order.
///
/// Node ids are only meaningful together with the graph that minted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Get the raw index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl From<usize> for NodeId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

/// A node in the dependency graph.
///
/// There is deliberately no `PartialEq`: a node's identity is its position
/// in one graph instance. Use [`super::DependencyNodeKey`] to compare nodes
/// across graphs.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    /// Position in the owning graph.
    id: NodeId,

    /// Function applied by this node.
    function: FunctionId,

    /// What the function is applied to.
    target: TargetSpecification,

    /// Values consumed, in the order the function expects them.
    inputs: SmallVec<[ValueSpecification; 4]>,

    /// Values produced.
    outputs: SmallVec<[ValueSpecification; 2]>,

    /// Nodes producing any of our inputs (parents in the DAG).
    input_nodes: SmallVec<[NodeId; 4]>,

    /// Nodes consuming any of our outputs (children in the DAG).
    dependent_nodes: SmallVec<[NodeId; 4]>,
}

impl DependencyNode {
    pub(crate) fn new(
        id: NodeId,
        function: FunctionId,
        target: TargetSpecification,
        inputs: SmallVec<[ValueSpecification; 4]>,
        outputs: SmallVec<[ValueSpecification; 2]>,
    ) -> Self {
        Self {
            id,
            function,
            target,
            inputs,
            outputs,
            input_nodes: SmallVec::new(),
            dependent_nodes: SmallVec::new(),
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn function(&self) -> &FunctionId {
        &self.function
    }

    pub fn target(&self) -> &TargetSpecification {
        &self.target
    }

    pub fn input_values(&self) -> &[ValueSpecification] {
        &self.inputs
    }

    pub fn output_values(&self) -> &[ValueSpecification] {
        &self.outputs
    }

    /// Nodes this node depends on, in ascending id order.
    pub fn input_nodes(&self) -> &[NodeId] {
        &self.input_nodes
    }

    /// Nodes depending on this node, in ascending id order.
    pub fn dependent_nodes(&self) -> &[NodeId] {
        &self.dependent_nodes
    }

    pub(crate) fn add_input_node(&mut self, node_id: NodeId) {
        if let Err(position) = self.input_nodes.binary_search(&node_id) {
            self.input_nodes.insert(position, node_id);
        }
    }

    pub(crate) fn add_dependent_node(&mut self, node_id: NodeId) {
        if let Err(position) = self.dependent_nodes.binary_search(&node_id) {
            self.dependent_nodes.insert(position, node_id);
        }
    }
}
