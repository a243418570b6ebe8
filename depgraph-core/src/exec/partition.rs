//! Graph Partitioner
//!
//! Splits a dependency graph into fragments, each executed as one job.
//!
//! # Algorithm
//!
//! Start with one fragment per node, then repeat three merge rules until a
//! whole pass changes nothing:
//!
//! 1. **Input merge**: fragments with identical input sets are parallel
//!    branches off the same predecessors. Merge them, in id order, while the
//!    combined fragment stays within the maximum bounds.
//! 2. **Single-dependency merge**: a fragment whose only input has no other
//!    consumer collapses into that input (chain collapse).
//! 3. **Consumer merge**: a fragment with exactly one consumer is absorbed
//!    into it when it is below the minimum bounds, or when concurrency is
//!    unbounded and nothing is gained by keeping it separate.
//!
//! None of the rules can create a cycle between fragments: rule 1 only
//! merges fragments with no path between them, and rules 2 and 3 only merge
//! along an edge that is the sole way out of the absorbed side.
//!
//! After merging, each fragment may take up to `maximum_concurrency - 1`
//! tails from its consumers that depend on it alone. A tail runs on the
//! same worker right after its predecessor and shares its colour; every
//! other fragment gets a colour of its own.
//!
//! Every loop walks fragments in ascending id order, and ids start out as
//! node insertion indices, so structurally identical graphs always get
//! identical partitions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use super::fragment::{FragmentId, FragmentTree, GraphFragment};
use super::stats::FunctionCosts;
use crate::config::PartitionerConfig;
use crate::graph::{DependencyGraph, NodeId};

/// Builds [`FragmentTree`]s under the configured bounds.
#[derive(Debug, Clone)]
pub struct Partitioner {
    config: PartitionerConfig,
    costs: Arc<FunctionCosts>,
}

impl Partitioner {
    pub fn new(config: PartitionerConfig, costs: Arc<FunctionCosts>) -> Self {
        Self { config, costs }
    }

    pub fn config(&self) -> &PartitionerConfig {
        &self.config
    }

    /// Partition `graph`. Every node ends up in exactly one fragment.
    pub fn partition(&self, graph: &DependencyGraph) -> FragmentTree {
        let node_inputs: Vec<&[NodeId]> = graph.nodes().map(|node| node.input_nodes()).collect();
        let costs: Vec<f64> = graph
            .nodes()
            .map(|node| self.costs.estimate(graph.calc_config(), node.function()))
            .collect();
        let mut tree = FragmentTree::singletons(&node_inputs, &costs);

        let mut passes = 0;
        loop {
            passes += 1;
            let mut changed = self.merge_common_inputs(&mut tree);
            changed |= self.merge_single_dependencies(&mut tree);
            changed |= self.merge_into_consumers(&mut tree);
            if !changed {
                break;
            }
        }

        tree.seal();
        self.assign_tails(&mut tree);
        assign_colours(&mut tree);

        debug!(
            calc_config = graph.calc_config(),
            nodes = graph.size(),
            fragments = tree.len(),
            colours = tree.colour_count(),
            passes,
            "graph partitioned"
        );
        tree
    }

    /// Whether `a` and `b` together stay within the maximum bounds.
    fn fits(&self, tree: &FragmentTree, a: FragmentId, b: FragmentId) -> bool {
        let (Some(a), Some(b)) = (tree.fragment(a), tree.fragment(b)) else {
            return false;
        };
        a.len() + b.len() <= self.config.maximum_job_items
            && a.cost() + b.cost() <= self.config.maximum_job_cost as f64
    }

    fn undersized(&self, fragment: &GraphFragment) -> bool {
        fragment.len() < self.config.minimum_job_items
            || fragment.cost() < self.config.minimum_job_cost as f64
    }

    fn merge_common_inputs(&self, tree: &mut FragmentTree) -> bool {
        let mut groups: BTreeMap<Vec<FragmentId>, Vec<FragmentId>> = BTreeMap::new();
        for (id, fragment) in tree.fragments() {
            groups
                .entry(fragment.inputs().iter().copied().collect())
                .or_default()
                .push(id);
        }

        let mut changed = false;
        for members in groups.into_values().filter(|members| members.len() > 1) {
            let mut target = members[0];
            for &other in &members[1..] {
                if self.fits(tree, target, other) {
                    target = tree.merge(target, other);
                    changed = true;
                } else {
                    target = other;
                }
            }
        }
        changed
    }

    fn merge_single_dependencies(&self, tree: &mut FragmentTree) -> bool {
        let mut changed = false;
        for id in tree.fragment_ids() {
            let Some(fragment) = tree.fragment(id) else {
                continue;
            };
            let Some(&predecessor) = single(fragment.inputs()) else {
                continue;
            };
            let sole_consumer = tree
                .fragment(predecessor)
                .is_some_and(|p| p.outputs().len() == 1);
            if sole_consumer && self.fits(tree, predecessor, id) {
                tree.merge(predecessor, id);
                changed = true;
            }
        }
        changed
    }

    fn merge_into_consumers(&self, tree: &mut FragmentTree) -> bool {
        let absorb_all = self.config.maximum_concurrency == usize::MAX;
        let mut changed = false;
        for id in tree.fragment_ids() {
            let Some(fragment) = tree.fragment(id) else {
                continue;
            };
            if !absorb_all && !self.undersized(fragment) {
                continue;
            }
            let Some(&consumer) = single(fragment.outputs()) else {
                continue;
            };
            if self.fits(tree, id, consumer) {
                tree.merge(id, consumer);
                changed = true;
            }
        }
        changed
    }

    fn assign_tails(&self, tree: &mut FragmentTree) {
        let limit = self.config.maximum_concurrency.saturating_sub(1);
        if limit == 0 {
            return;
        }
        let root = tree.root();
        for id in tree.fragment_ids() {
            let Some(fragment) = tree.fragment(id) else {
                continue;
            };
            let tails: Vec<FragmentId> = fragment
                .outputs()
                .iter()
                .copied()
                .filter(|output| *output != root)
                .filter(|output| {
                    tree.fragment(*output)
                        .is_some_and(|consumer| consumer.inputs().len() == 1)
                })
                .take(limit)
                .collect();
            for tail in tails {
                tree.attach_tail(id, tail);
            }
        }
    }
}

/// Tails share their predecessor's colour; everything else gets a new one.
fn assign_colours(tree: &mut FragmentTree) {
    let mut next = 0;
    for id in tree.dependency_order() {
        let inherited = tree
            .fragment(id)
            .and_then(|f| f.tail_of())
            .and_then(|predecessor| tree.fragment(predecessor))
            .map(|predecessor| predecessor.execution_id());
        let colour = inherited.unwrap_or_else(|| {
            next += 1;
            next - 1
        });
        tree.set_execution_id(id, colour);
    }
}

fn single<T: Ord>(set: &BTreeSet<T>) -> Option<&T> {
    if set.len() == 1 {
        set.first()
    } else {
        None
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::FunctionInvocationStatisticsGatherer;
    use crate::graph::{FunctionId, ValueSpecification};

    fn spec(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, "T")
    }

    fn partitioner(config: PartitionerConfig) -> Partitioner {
        Partitioner::new(config, Arc::new(FunctionCosts::new()))
    }

    /// N0, N1 <- N2; N4 <- N2, N3; terminals at N0, N1, N4.
    fn fixture() -> DependencyGraph {
        let mut builder = DependencyGraph::builder("Default");
        builder.add_node("f0", "N0", [spec("v20")], [spec("v0x")]);
        builder.add_node("f1", "N1", [spec("v21")], [spec("v1x")]);
        builder.add_node("f2", "N2", [spec("vx2")], [spec("v20"), spec("v21"), spec("v24")]);
        builder.add_node("f3", "N3", [spec("vx3")], [spec("v34")]);
        builder.add_node("f4", "N4", [spec("v24"), spec("v34")], [spec("v4x")]);
        builder
            .add_terminal_value(spec("v0x"))
            .add_terminal_value(spec("v1x"))
            .add_terminal_value(spec("v4x"));
        builder.build().unwrap()
    }

    /// R -> S -> T and R -> T.
    fn triangle() -> DependencyGraph {
        let mut builder = DependencyGraph::builder("Default");
        builder.add_node("r", "R", [], [spec("r")]);
        builder.add_node("s", "S", [spec("r")], [spec("s")]);
        builder.add_node("t", "T", [spec("r"), spec("s")], [spec("t")]);
        builder.add_terminal_value(spec("t"));
        builder.build().unwrap()
    }

    fn chain(length: usize) -> DependencyGraph {
        let mut builder = DependencyGraph::builder("Default");
        for i in 0..length {
            let inputs = if i == 0 { vec![] } else { vec![spec(&format!("c{}", i - 1))] };
            builder.add_node("step", format!("S{i}"), inputs, [spec(&format!("c{i}"))]);
        }
        builder.build().unwrap()
    }

    fn node_sets(tree: &FragmentTree) -> Vec<Vec<usize>> {
        tree.fragments()
            .map(|(_, f)| {
                let mut nodes: Vec<usize> = f.nodes().iter().map(|n| n.index()).collect();
                nodes.sort_unstable();
                nodes
            })
            .collect()
    }

    fn assert_covers(tree: &FragmentTree, node_count: usize) {
        let mut seen: Vec<usize> = node_sets(tree).into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..node_count).collect::<Vec<_>>());
    }

    #[test]
    fn fixture_merges_into_one_fragment() {
        let tree = partitioner(PartitionerConfig::with_job_items(5, 5)).partition(&fixture());
        assert_eq!(node_sets(&tree), vec![vec![0, 1, 2, 3, 4]]);
        let root = tree.fragment(tree.root()).unwrap();
        assert_eq!(root.inputs().len(), 1);
    }

    #[test]
    fn unit_bounds_keep_one_fragment_per_node() {
        let tree = partitioner(PartitionerConfig::with_job_items(1, 1)).partition(&fixture());
        assert_eq!(tree.len(), 5);
        assert_covers(&tree, 5);

        // N0 and N1 depend on N2 alone, so they ride along as its tails.
        let n2 = tree.fragment(FragmentId::from(2)).unwrap();
        assert_eq!(n2.tails(), &[FragmentId::from(0), FragmentId::from(1)]);
        let n0 = tree.fragment(FragmentId::from(0)).unwrap();
        assert_eq!(n0.execution_id(), n2.execution_id());
        let n4 = tree.fragment(FragmentId::from(4)).unwrap();
        assert!(n4.tail_of().is_none());
        assert_eq!(tree.colour_count(), 3);
    }

    #[test]
    fn concurrency_bounds_tails() {
        let config = PartitionerConfig::with_job_items(1, 1).with_concurrency(2);
        let tree = partitioner(config).partition(&fixture());
        let n2 = tree.fragment(FragmentId::from(2)).unwrap();
        assert_eq!(n2.tails(), &[FragmentId::from(0)]);
        assert_eq!(tree.colour_count(), 4);

        let config = PartitionerConfig::with_job_items(1, 1).with_concurrency(1);
        let tree = partitioner(config).partition(&fixture());
        assert!(tree.fragments().all(|(_, f)| f.tails().is_empty()));
        assert_eq!(tree.colour_count(), 5);
    }

    #[test]
    fn chains_respect_maximum_items() {
        let tree = partitioner(PartitionerConfig::with_job_items(1, 3)).partition(&chain(10));
        assert_covers(&tree, 10);
        assert!(tree.fragments().all(|(_, f)| f.len() <= 3));
        assert_eq!(tree.len(), 4);

        let tree = partitioner(PartitionerConfig::unbounded()).partition(&chain(10));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn minimum_items_absorb_into_consumer() {
        let bounded = PartitionerConfig::with_job_items(1, 10).with_concurrency(4);
        let tree = partitioner(bounded).partition(&triangle());
        assert_eq!(tree.len(), 3);

        let config = PartitionerConfig::with_job_items(2, 10).with_concurrency(4);
        let tree = partitioner(config).partition(&triangle());
        assert_eq!(node_sets(&tree), vec![vec![0, 1, 2]]);

        let tree = partitioner(PartitionerConfig::unbounded()).partition(&triangle());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn cost_bounds_are_conjunctive() {
        let costs = Arc::new(FunctionCosts::new());
        costs.set_estimate("Default", &FunctionId::new("step"), 10.0);

        let config = PartitionerConfig::unbounded().with_job_cost(0, 25);
        let tree = Partitioner::new(config, costs.clone()).partition(&chain(6));
        assert_covers(&tree, 6);
        assert!(tree.fragments().all(|(_, f)| f.cost() <= 25.0));
        assert_eq!(tree.len(), 3);

        // Item bound is tighter than the cost bound here.
        let config = PartitionerConfig::with_job_items(1, 1).with_job_cost(0, 25);
        let tree = Partitioner::new(config, costs).partition(&chain(6));
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn observed_and_default_costs_share_a_scale() {
        let mut builder = DependencyGraph::builder("Default");
        builder.add_node("fresh", "A", [], [spec("a")]);
        builder.add_node("timed", "B", [spec("a")], [spec("b")]);
        let graph = builder.build().unwrap();

        let costs = Arc::new(FunctionCosts::new());
        costs.function_invoked("Default", &FunctionId::new("timed"), 1, 2_500_000.0);

        // 1ms default plus 2.5ms observed does not fit in 3ms.
        let config = PartitionerConfig::unbounded().with_job_cost(0, 3_000_000);
        let tree = Partitioner::new(config, costs.clone()).partition(&graph);
        assert_eq!(tree.len(), 2);

        let config = PartitionerConfig::unbounded().with_job_cost(0, 4_000_000);
        let tree = Partitioner::new(config, costs).partition(&graph);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn partitioning_is_deterministic() {
        let config = PartitionerConfig::with_job_items(1, 2).with_concurrency(3);
        let first = partitioner(config).partition(&fixture());
        let second = partitioner(config).partition(&fixture());
        assert_eq!(node_sets(&first), node_sets(&second));
        assert_covers(&first, 5);
    }

    #[test]
    fn single_only_picks_lone_members() {
        let mut set = BTreeSet::new();
        assert_eq!(single(&set), None);
        set.insert(FragmentId::from(3));
        assert_eq!(single(&set), Some(&FragmentId::from(3)));
        set.insert(FragmentId::from(1));
        assert_eq!(single(&set), None);
    }

    #[test]
    fn empty_graph_has_only_a_root() {
        let graph = DependencyGraph::builder("Default").build().unwrap();
        let tree = partitioner(PartitionerConfig::unbounded()).partition(&graph);
        assert!(tree.is_empty());
        assert!(tree.fragment(tree.root()).unwrap().inputs().is_empty());
    }
}
