//! Execution Plan
//!
//! The frozen, replayable form of a fragment tree.
//!
//! # Overview
//!
//! [`ExecutionPlan::of`] renumbers the live fragments of a tree densely
//! (ascending fragment id, root last), sorts each fragment's nodes into
//! dependency order, precomputes job items and cache hints, and drops the
//! mutable arena. The result is immutable and shared through an `Arc`, so
//! one plan can be run many times, concurrently, against any graph that is
//! structurally identical to the one it was built from.
//!
//! Running a plan lives in [`super::run`].

use std::sync::Arc;

use crate::calcnode::CalculationJobItem;
use crate::graph::{DependencyGraph, NodeId};

use super::fragment::{FragmentId, FragmentTree};
use super::hints::{calculate_cache_hint, CacheSelectHint};

/// One frozen fragment.
#[derive(Debug)]
pub(crate) struct PlannedFragment {
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) items: Vec<CalculationJobItem>,
    pub(crate) hint: Arc<CacheSelectHint>,
    /// Number of input fragments.
    pub(crate) input_count: usize,
    /// Plan indices of consumers, the root included.
    pub(crate) dependents: Vec<usize>,
    pub(crate) tails: Vec<usize>,
    pub(crate) tail_of: Option<usize>,
    pub(crate) execution_id: usize,
    /// This fragment plus every tail chained below it.
    pub(crate) chain_length: usize,
    pub(crate) cost: f64,
}

/// An immutable compiled fragment tree.
#[derive(Debug)]
pub struct ExecutionPlan {
    calc_config: String,
    node_count: usize,
    fragments: Vec<PlannedFragment>,
    /// Index of the synthetic root in `fragments`.
    root: usize,
    /// Fragments with no inputs, dispatched first.
    entry: Vec<usize>,
    /// Plan index of the fragment holding each node.
    node_fragment: Vec<usize>,
}

impl ExecutionPlan {
    /// Freeze `tree`, which must have been partitioned from `graph`.
    pub fn of(tree: &FragmentTree, graph: &DependencyGraph) -> Self {
        let live = tree.fragment_ids();
        let root = live.len();
        let mut index_of = vec![root; tree.root().index() + 1];
        for (index, id) in live.iter().enumerate() {
            index_of[id.index()] = index;
        }
        let plan_index = |id: &FragmentId| index_of.get(id.index()).copied().unwrap_or(root);
        let owner = tree.fragment_of_nodes();

        let root_id = tree.root();
        let mut fragments: Vec<PlannedFragment> = Vec::with_capacity(live.len() + 1);
        for id in live.iter().chain(std::iter::once(&root_id)) {
            let Some(fragment) = tree.fragment(*id) else {
                continue;
            };
            let mut nodes = fragment.nodes().to_vec();
            nodes.sort_by_key(|node| graph.topological_rank(*node));
            let items = nodes
                .iter()
                .filter_map(|node| graph.get_node(*node))
                .map(CalculationJobItem::from_node)
                .collect();
            let hint = calculate_cache_hint(graph, &nodes, &owner);
            fragments.push(PlannedFragment {
                nodes,
                items,
                hint: Arc::new(hint),
                input_count: fragment.inputs().len(),
                dependents: fragment.outputs().iter().map(plan_index).collect(),
                tails: fragment.tails().iter().map(plan_index).collect(),
                tail_of: fragment.tail_of().as_ref().map(plan_index),
                execution_id: fragment.execution_id(),
                chain_length: 1,
                cost: fragment.cost(),
            });
        }

        for index in 0..fragments.len() {
            let length = chain_length(&fragments, index);
            fragments[index].chain_length = length;
        }

        let entry = (0..root)
            .filter(|i| fragments[*i].input_count == 0 && fragments[*i].tail_of.is_none())
            .collect();
        let node_fragment = owner.iter().map(plan_index).collect();

        Self {
            calc_config: graph.calc_config().to_string(),
            node_count: graph.size(),
            fragments,
            root,
            entry,
            node_fragment,
        }
    }

    pub fn calc_config(&self) -> &str {
        &self.calc_config
    }

    /// Number of nodes the plan covers.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Number of fragments, not counting the root.
    pub fn fragment_count(&self) -> usize {
        self.root
    }

    /// Number of separately dispatched jobs (fragments that are not tails).
    pub fn job_count(&self) -> usize {
        self.fragments[..self.root]
            .iter()
            .filter(|f| f.tail_of.is_none())
            .count()
    }

    /// Number of distinct execution ids.
    pub fn colour_count(&self) -> usize {
        let mut colours: Vec<usize> = self.fragments[..self.root]
            .iter()
            .map(|f| f.execution_id)
            .collect();
        colours.sort_unstable();
        colours.dedup();
        colours.len()
    }

    /// Sum of the estimated costs of all fragments.
    pub fn estimated_cost(&self) -> f64 {
        self.fragments.iter().map(|f| f.cost).sum()
    }

    /// Nodes of fragment `index`, in execution order.
    pub fn fragment_nodes(&self, index: usize) -> Option<&[NodeId]> {
        self.live(index).map(|f| f.nodes.as_slice())
    }

    pub fn cache_hint(&self, index: usize) -> Option<&CacheSelectHint> {
        self.live(index).map(|f| f.hint.as_ref())
    }

    /// Execution id (colour) of fragment `index`.
    pub fn execution_id(&self, index: usize) -> Option<usize> {
        self.live(index).map(|f| f.execution_id)
    }

    /// Tail fragments of fragment `index`.
    pub fn tails(&self, index: usize) -> Option<&[usize]> {
        self.live(index).map(|f| f.tails.as_slice())
    }

    /// The fragment holding `node`.
    pub fn fragment_of(&self, node: NodeId) -> Option<usize> {
        self.node_fragment.get(node.index()).copied()
    }

    pub(crate) fn fragments(&self) -> &[PlannedFragment] {
        &self.fragments
    }

    pub(crate) fn root(&self) -> usize {
        self.root
    }

    pub(crate) fn entry(&self) -> &[usize] {
        &self.entry
    }

    fn live(&self, index: usize) -> Option<&PlannedFragment> {
        if index < self.root {
            self.fragments.get(index)
        } else {
            None
        }
    }
}

fn chain_length(fragments: &[PlannedFragment], index: usize) -> usize {
    1 + fragments[index]
        .tails
        .iter()
        .map(|tail| chain_length(fragments, *tail))
        .sum::<usize>()
}
