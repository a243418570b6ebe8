//! Graph Fragments
//!
//! A fragment is a group of dependency nodes executed as one job. The
//! partitioner builds fragments in a [`FragmentTree`], a mutable arena
//! where merged-away fragments leave empty slots, and hands the finished
//! tree to [`super::ExecutionPlan::of`] to be frozen.
//!
//! # Design Decisions
//!
//! 1. Fragments are addressed by arena index ([`FragmentId`]). A merge keeps
//!    the lower id and rewires every neighbour of the absorbed fragment, so
//!    ids stay stable and iteration in id order stays deterministic.
//!
//! 2. Input and output sets are `BTreeSet`s for the same reason: every
//!    traversal visits neighbours in ascending id order.
//!
//! 3. The root is a synthetic fragment with no nodes. It consumes every
//!    fragment nobody else consumes; its completion is the completion of
//!    the whole graph.

use std::collections::BTreeSet;
use std::fmt;

use crate::graph::NodeId;

/// Index of a fragment in its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentId(usize);

impl FragmentId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl From<usize> for FragmentId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// A set of nodes assigned to one execution unit.
#[derive(Debug, Clone, Default)]
pub struct GraphFragment {
    nodes: Vec<NodeId>,
    inputs: BTreeSet<FragmentId>,
    outputs: BTreeSet<FragmentId>,
    tails: Vec<FragmentId>,
    tail_of: Option<FragmentId>,
    execution_id: usize,
    cost: f64,
}

impl GraphFragment {
    fn single(node: NodeId, cost: f64) -> Self {
        Self {
            nodes: vec![node],
            cost,
            ..Self::default()
        }
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fragments that must complete before this one starts.
    pub fn inputs(&self) -> &BTreeSet<FragmentId> {
        &self.inputs
    }

    /// Fragments consuming this one's results.
    pub fn outputs(&self) -> &BTreeSet<FragmentId> {
        &self.outputs
    }

    /// Fragments executed by the same worker straight after this one.
    pub fn tails(&self) -> &[FragmentId] {
        &self.tails
    }

    /// The fragment this one runs as a tail of.
    pub fn tail_of(&self) -> Option<FragmentId> {
        self.tail_of
    }

    /// Concurrency group ("colour").
    pub fn execution_id(&self) -> usize {
        self.execution_id
    }

    /// Estimated cost of all nodes.
    pub fn cost(&self) -> f64 {
        self.cost
    }
}

/// Arena of fragments plus the synthetic root.
#[derive(Debug, Clone)]
pub struct FragmentTree {
    fragments: Vec<Option<GraphFragment>>,
    root: FragmentId,
    node_count: usize,
}

impl FragmentTree {
    /// One fragment per node, wired by node dependencies. `node_inputs[i]`
    /// lists the nodes node `i` depends on; `costs[i]` is its estimated cost.
    pub(crate) fn singletons(node_inputs: &[&[NodeId]], costs: &[f64]) -> Self {
        let node_count = node_inputs.len();
        let mut fragments: Vec<Option<GraphFragment>> = (0..node_count)
            .map(|i| {
                Some(GraphFragment::single(
                    NodeId::from(i),
                    costs.get(i).copied().unwrap_or_default(),
                ))
            })
            .collect();

        for (consumer, inputs) in node_inputs.iter().enumerate() {
            for producer in inputs.iter() {
                if let Some(fragment) = fragments[consumer].as_mut() {
                    fragment.inputs.insert(FragmentId(producer.index()));
                }
                if let Some(fragment) = fragments[producer.index()].as_mut() {
                    fragment.outputs.insert(FragmentId(consumer));
                }
            }
        }

        // The root slot sits after every node slot and is wired by `seal`.
        fragments.push(Some(GraphFragment::default()));
        Self {
            fragments,
            root: FragmentId(node_count),
            node_count,
        }
    }

    /// The synthetic root fragment.
    pub fn root(&self) -> FragmentId {
        self.root
    }

    pub fn fragment(&self, id: FragmentId) -> Option<&GraphFragment> {
        self.fragments.get(id.0).and_then(Option::as_ref)
    }

    fn fragment_mut(&mut self, id: FragmentId) -> Option<&mut GraphFragment> {
        self.fragments.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Live fragments other than the root, in ascending id order.
    pub fn fragments(&self) -> impl Iterator<Item = (FragmentId, &GraphFragment)> + '_ {
        self.fragments
            .iter()
            .enumerate()
            .filter(move |(index, _)| *index != self.root.0)
            .filter_map(|(index, slot)| slot.as_ref().map(|f| (FragmentId(index), f)))
    }

    /// Ids of live fragments other than the root.
    pub fn fragment_ids(&self) -> Vec<FragmentId> {
        self.fragments().map(|(id, _)| id).collect()
    }

    /// Number of live fragments, not counting the root.
    pub fn len(&self) -> usize {
        self.fragments().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of nodes the tree was built over.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub(crate) fn is_live(&self, id: FragmentId) -> bool {
        self.fragment(id).is_some()
    }

    /// The fragment holding each node, indexed by node.
    pub fn fragment_of_nodes(&self) -> Vec<FragmentId> {
        let mut owner = vec![self.root; self.node_count];
        for (id, fragment) in self.fragments() {
            for node in &fragment.nodes {
                owner[node.index()] = id;
            }
        }
        owner
    }

    /// Number of distinct execution ids.
    pub fn colour_count(&self) -> usize {
        self.fragments()
            .map(|(_, f)| f.execution_id)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Fold `b` into `a`; the surviving fragment takes the lower id.
    pub(crate) fn merge(&mut self, a: FragmentId, b: FragmentId) -> FragmentId {
        let (keep, gone) = if a < b { (a, b) } else { (b, a) };
        let Some(absorbed) = self.fragments.get_mut(gone.0).and_then(Option::take) else {
            return keep;
        };

        for input in &absorbed.inputs {
            if let Some(fragment) = self.fragment_mut(*input) {
                fragment.outputs.remove(&gone);
                if *input != keep {
                    fragment.outputs.insert(keep);
                }
            }
        }
        for output in &absorbed.outputs {
            if let Some(fragment) = self.fragment_mut(*output) {
                fragment.inputs.remove(&gone);
                if *output != keep {
                    fragment.inputs.insert(keep);
                }
            }
        }

        if let Some(fragment) = self.fragment_mut(keep) {
            fragment.nodes.extend(absorbed.nodes);
            fragment.cost += absorbed.cost;
            fragment
                .inputs
                .extend(absorbed.inputs.into_iter().filter(|id| *id != keep));
            fragment
                .outputs
                .extend(absorbed.outputs.into_iter().filter(|id| *id != keep));
            fragment.inputs.remove(&gone);
            fragment.outputs.remove(&gone);
        }
        keep
    }

    /// Hang `tail` off `predecessor`.
    pub(crate) fn attach_tail(&mut self, predecessor: FragmentId, tail: FragmentId) {
        if let Some(fragment) = self.fragment_mut(tail) {
            fragment.tail_of = Some(predecessor);
        }
        if let Some(fragment) = self.fragment_mut(predecessor) {
            fragment.tails.push(tail);
        }
    }

    pub(crate) fn set_execution_id(&mut self, id: FragmentId, execution_id: usize) {
        if let Some(fragment) = self.fragment_mut(id) {
            fragment.execution_id = execution_id;
        }
    }

    /// Wire the root to every sink fragment.
    pub(crate) fn seal(&mut self) {
        let root = self.root;
        let sinks: Vec<FragmentId> = self
            .fragments()
            .filter(|(_, f)| f.outputs.is_empty())
            .map(|(id, _)| id)
            .collect();
        for sink in &sinks {
            if let Some(fragment) = self.fragment_mut(*sink) {
                fragment.outputs.insert(root);
            }
        }
        if let Some(fragment) = self.fragment_mut(root) {
            fragment.inputs = sinks.into_iter().collect();
        }
    }

    /// Fragment ids in an order where inputs come before consumers.
    pub fn dependency_order(&self) -> Vec<FragmentId> {
        let ids = self.fragment_ids();
        let mut remaining: Vec<usize> = vec![0; self.fragments.len()];
        for id in &ids {
            if let Some(fragment) = self.fragment(*id) {
                remaining[id.0] = fragment.inputs.len();
            }
        }
        let mut ready: BTreeSet<FragmentId> = ids
            .iter()
            .copied()
            .filter(|id| remaining[id.0] == 0)
            .collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            if let Some(fragment) = self.fragment(id) {
                for output in &fragment.outputs {
                    if *output == self.root {
                        continue;
                    }
                    remaining[output.0] -= 1;
                    if remaining[output.0] == 0 {
                        ready.insert(*output);
                    }
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[usize]) -> BTreeSet<FragmentId> {
        ids.iter().map(|i| FragmentId(*i)).collect()
    }

    // 0 -> 1 -> 2, 0 -> 3
    fn tree() -> FragmentTree {
        let n = |i: usize| NodeId::from(i);
        let (i1, i2, i3) = ([n(0)], [n(1)], [n(0)]);
        let inputs: Vec<&[NodeId]> = vec![&[], &i1, &i2, &i3];
        FragmentTree::singletons(&inputs[..], &[1.0, 2.0, 3.0, 4.0])
    }

    #[test]
    fn singletons_follow_node_edges() {
        let tree = tree();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.root(), FragmentId(4));
        let f0 = tree.fragment(FragmentId(0)).unwrap();
        assert_eq!(f0.outputs(), &ids(&[1, 3]));
        assert!(f0.inputs().is_empty());
        assert_eq!(tree.fragment(FragmentId(2)).unwrap().inputs(), &ids(&[1]));
    }

    #[test]
    fn merge_rewires_neighbours() {
        let mut tree = tree();
        let kept = tree.merge(FragmentId(2), FragmentId(1));
        assert_eq!(kept, FragmentId(1));
        assert!(!tree.is_live(FragmentId(2)));

        let merged = tree.fragment(kept).unwrap();
        assert_eq!(merged.nodes(), &[NodeId::from(1), NodeId::from(2)]);
        assert_eq!(merged.inputs(), &ids(&[0]));
        assert!(merged.outputs().is_empty());
        assert_eq!(merged.cost(), 5.0);
        assert_eq!(tree.fragment(FragmentId(0)).unwrap().outputs(), &ids(&[1, 3]));

        let kept = tree.merge(FragmentId(0), FragmentId(1));
        let merged = tree.fragment(kept).unwrap();
        assert!(merged.inputs().is_empty());
        assert_eq!(merged.outputs(), &ids(&[3]));
        assert_eq!(tree.fragment(FragmentId(3)).unwrap().inputs(), &ids(&[0]));
    }

    #[test]
    fn seal_wires_sinks_to_root() {
        let mut tree = tree();
        tree.seal();
        let root = tree.fragment(tree.root()).unwrap();
        assert_eq!(root.inputs(), &ids(&[2, 3]));
        assert!(root.is_empty());
        assert!(tree.fragment(FragmentId(2)).unwrap().outputs().contains(&tree.root()));
        assert_eq!(
            tree.fragment_of_nodes(),
            vec![FragmentId(0), FragmentId(1), FragmentId(2), FragmentId(3)]
        );
        assert_eq!(
            tree.dependency_order(),
            vec![FragmentId(0), FragmentId(1), FragmentId(2), FragmentId(3)]
        );
    }

    #[test]
    fn tails_record_both_ends() {
        let mut tree = tree();
        tree.attach_tail(FragmentId(0), FragmentId(3));
        tree.set_execution_id(FragmentId(3), 7);
        assert_eq!(tree.fragment(FragmentId(0)).unwrap().tails(), &[FragmentId(3)]);
        let tail = tree.fragment(FragmentId(3)).unwrap();
        assert_eq!(tail.tail_of(), Some(FragmentId(0)));
        assert_eq!(tail.execution_id(), 7);
    }
}
