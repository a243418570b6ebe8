//! Dependency Graph
//!
//! A compiled valuation cycle: an ordered collection of nodes plus the
//! terminal outputs the outside world asked for.
//!
//! Graphs are assembled with a [`DependencyGraphBuilder`] and are immutable
//! once built. Edges are not declared explicitly; they follow from value
//! specifications. A node consuming a value depends on the node producing
//! it. Inputs produced by no node are external (market data, values kept
//! from a previous cycle) and must already be in the shared cache when the
//! graph executes.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use indexmap::IndexMap;
use smallvec::SmallVec;

use super::node::{DependencyNode, GraphId, NodeId};
use super::value::{FunctionId, TargetSpecification, ValueRequirement, ValueSpecification};
use crate::error::{EngineError, EngineResult};

/// An immutable dependency graph for one calculation configuration.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Identity of this instance.
    graph_id: GraphId,

    /// Calculation configuration the graph was compiled for.
    calc_config: String,

    /// All nodes, indexed by `NodeId`, in insertion order.
    nodes: Vec<DependencyNode>,

    /// Which node produces each value.
    producers: HashMap<ValueSpecification, NodeId>,

    /// Which nodes consume each value.
    consumers: HashMap<ValueSpecification, SmallVec<[NodeId; 4]>>,

    /// Requirement -> satisfying specification, in the order requested.
    terminal_outputs: IndexMap<ValueRequirement, ValueSpecification>,

    /// Specifications named by `terminal_outputs`.
    terminal_specs: HashSet<ValueSpecification>,

    /// Rank of each node in a topological order (dependencies first,
    /// ties broken by insertion order).
    topological_rank: Vec<usize>,
}

impl DependencyGraph {
    /// Start building a graph for the given calculation configuration.
    pub fn builder(calc_config: impl Into<String>) -> DependencyGraphBuilder {
        DependencyGraphBuilder::new(calc_config)
    }

    pub fn graph_id(&self) -> GraphId {
        self.graph_id
    }

    pub fn calc_config(&self) -> &str {
        &self.calc_config
    }

    /// Number of nodes.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> + '_ {
        self.nodes.iter()
    }

    /// Look up a node by id.
    pub fn get_node(&self, id: NodeId) -> Option<&DependencyNode> {
        self.nodes.get(id.index())
    }

    /// Look up a node by id, failing if the id belongs to a larger graph.
    pub fn node(&self, id: NodeId) -> EngineResult<&DependencyNode> {
        self.get_node(id)
            .ok_or(EngineError::UnknownNode(id.index()))
    }

    /// The node producing `value`, if any node does.
    pub fn producer_of(&self, value: &ValueSpecification) -> Option<NodeId> {
        self.producers.get(value).copied()
    }

    /// Nodes consuming `value`.
    pub fn consumers_of(&self, value: &ValueSpecification) -> &[NodeId] {
        self.consumers
            .get(value)
            .map(|nodes| nodes.as_slice())
            .unwrap_or(&[])
    }

    pub fn terminal_outputs(&self) -> &IndexMap<ValueRequirement, ValueSpecification> {
        &self.terminal_outputs
    }

    /// Whether `value` is needed outside the graph.
    pub fn is_terminal_output(&self, value: &ValueSpecification) -> bool {
        self.terminal_specs.contains(value)
    }

    /// Inputs that no node in the graph produces, in first-use order.
    pub fn external_inputs(&self) -> Vec<ValueSpecification> {
        let mut seen = HashSet::new();
        let mut external = Vec::new();
        for node in &self.nodes {
            for input in node.input_values() {
                if !self.producers.contains_key(input) && seen.insert(input) {
                    external.push(input.clone());
                }
            }
        }
        external
    }

    /// Position of `id` in the topological order.
    pub fn topological_rank(&self, id: NodeId) -> usize {
        self.topological_rank
            .get(id.index())
            .copied()
            .unwrap_or(usize::MAX)
    }

    /// Node ids with every dependency before its dependents.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut order: Vec<NodeId> = (0..self.nodes.len()).map(NodeId::from).collect();
        order.sort_by_key(|id| self.topological_rank[id.index()]);
        order
    }
}

/// Mutable construction phase of a [`DependencyGraph`].
#[derive(Debug)]
pub struct DependencyGraphBuilder {
    calc_config: String,
    nodes: Vec<DependencyNode>,
    terminal_outputs: IndexMap<ValueRequirement, ValueSpecification>,
}

impl DependencyGraphBuilder {
    pub fn new(calc_config: impl Into<String>) -> Self {
        Self {
            calc_config: calc_config.into(),
            nodes: Vec::new(),
            terminal_outputs: IndexMap::new(),
        }
    }

    /// Add a node applying `function` to `target`.
    ///
    /// Nodes may be added in any order; edges are resolved by [`Self::build`].
    pub fn add_node<I, O>(
        &mut self,
        function: impl Into<FunctionId>,
        target: impl Into<TargetSpecification>,
        inputs: I,
        outputs: O,
    ) -> NodeId
    where
        I: IntoIterator<Item = ValueSpecification>,
        O: IntoIterator<Item = ValueSpecification>,
    {
        let id = NodeId::from(self.nodes.len());
        self.nodes.push(DependencyNode::new(
            id,
            function.into(),
            target.into(),
            inputs.into_iter().collect(),
            outputs.into_iter().collect(),
        ));
        id
    }

    /// Declare that `value` satisfies `requirement` for the outside world.
    pub fn add_terminal_output(
        &mut self,
        requirement: ValueRequirement,
        value: ValueSpecification,
    ) -> &mut Self {
        self.terminal_outputs.insert(requirement, value);
        self
    }

    /// Mark `value` as terminal under a requirement derived from its name and target.
    pub fn add_terminal_value(&mut self, value: ValueSpecification) -> &mut Self {
        let requirement = ValueRequirement::new(value.name(), value.target().clone());
        self.add_terminal_output(requirement, value)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Resolve edges and freeze the graph.
    pub fn build(self) -> EngineResult<DependencyGraph> {
        let Self {
            calc_config,
            mut nodes,
            terminal_outputs,
        } = self;

        let mut producers: HashMap<ValueSpecification, NodeId> = HashMap::new();
        for node in &nodes {
            for output in node.output_values() {
                if producers.insert(output.clone(), node.id()).is_some() {
                    return Err(EngineError::DuplicateProducer {
                        value: output.clone(),
                    });
                }
            }
        }

        let mut consumers: HashMap<ValueSpecification, SmallVec<[NodeId; 4]>> = HashMap::new();
        let mut edges = Vec::new();
        for node in &nodes {
            for input in node.input_values() {
                let entry = consumers.entry(input.clone()).or_default();
                if entry.last() != Some(&node.id()) {
                    entry.push(node.id());
                }
                if let Some(&producer) = producers.get(input) {
                    edges.push((producer, node.id()));
                }
            }
        }
        for (producer, consumer) in edges {
            nodes[producer.index()].add_dependent_node(consumer);
            nodes[consumer.index()].add_input_node(producer);
        }

        let topological_rank = topological_rank(&nodes).ok_or_else(|| {
            EngineError::CycleDetected {
                calc_config: calc_config.clone(),
            }
        })?;

        let terminal_specs = terminal_outputs.values().cloned().collect();

        Ok(DependencyGraph {
            graph_id: GraphId::new(),
            calc_config,
            nodes,
            producers,
            consumers,
            terminal_outputs,
            terminal_specs,
            topological_rank,
        })
    }
}

/// Kahn's algorithm, always releasing the lowest ready node id first so the
/// order is reproducible. Returns `None` when the nodes form a cycle.
fn topological_rank(nodes: &[DependencyNode]) -> Option<Vec<usize>> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.input_nodes().len()).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| Reverse(index))
        .collect();

    let mut rank = vec![usize::MAX; nodes.len()];
    let mut next = 0;
    while let Some(Reverse(index)) = ready.pop() {
        rank[index] = next;
        next += 1;
        for dependent in nodes[index].dependent_nodes() {
            let degree = &mut in_degree[dependent.index()];
            *degree -= 1;
            if *degree == 0 {
                ready.push(Reverse(dependent.index()));
            }
        }
    }

    (next == nodes.len()).then_some(rank)
}
