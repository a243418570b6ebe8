//! Cache Select Hints
//!
//! Decides, per fragment, which values may stay on the worker executing it.
//!
//! A value produced in a fragment is private when every consumer of the
//! value is in the same fragment and nobody outside the graph asked for it.
//! Everything else the fragment touches (values it produces for other
//! fragments, terminal outputs, and inputs it reads from other fragments
//! or from outside the graph) is shared.
//!
//! The hint stores whichever of the two sets is smaller and answers
//! membership for both.

use std::collections::HashSet;

use crate::graph::{DependencyGraph, NodeId, ValueSpecification};

use super::fragment::FragmentId;

/// Private/shared classification of the values of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSelectHint {
    values: HashSet<ValueSpecification>,
    /// Whether `values` lists the private values (otherwise the shared ones).
    listed_private: bool,
}

impl CacheSelectHint {
    /// Every value goes to the shared cache.
    pub fn all_shared() -> Self {
        Self {
            values: HashSet::new(),
            listed_private: true,
        }
    }

    /// Every value stays on the worker.
    pub fn all_private() -> Self {
        Self {
            values: HashSet::new(),
            listed_private: false,
        }
    }

    /// The given values are private; everything else is shared.
    pub fn private_values(values: impl IntoIterator<Item = ValueSpecification>) -> Self {
        Self {
            values: values.into_iter().collect(),
            listed_private: true,
        }
    }

    /// The given values are shared; everything else is private.
    pub fn shared_values(values: impl IntoIterator<Item = ValueSpecification>) -> Self {
        Self {
            values: values.into_iter().collect(),
            listed_private: false,
        }
    }

    /// Build from a full classification, keeping the smaller list.
    pub fn from_classification(
        private: HashSet<ValueSpecification>,
        shared: HashSet<ValueSpecification>,
    ) -> Self {
        if private.len() <= shared.len() {
            Self::private_values(private)
        } else {
            Self::shared_values(shared)
        }
    }

    pub fn is_private_value(&self, value: &ValueSpecification) -> bool {
        self.values.contains(value) == self.listed_private
    }

    pub fn is_shared_value(&self, value: &ValueSpecification) -> bool {
        !self.is_private_value(value)
    }

    /// Number of values explicitly listed.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for CacheSelectHint {
    fn default() -> Self {
        Self::all_shared()
    }
}

/// Classify the values of the fragment made of `nodes`.
///
/// `owner` maps every node of `graph` to its fragment.
pub fn calculate_cache_hint(
    graph: &DependencyGraph,
    nodes: &[NodeId],
    owner: &[FragmentId],
) -> CacheSelectHint {
    let Some(fragment) = nodes.first().and_then(|node| owner.get(node.index())) else {
        return CacheSelectHint::all_shared();
    };
    let local = |node: &NodeId| owner.get(node.index()) == Some(fragment);

    let mut private = HashSet::new();
    let mut shared = HashSet::new();
    for node in nodes.iter().filter_map(|id| graph.get_node(*id)) {
        for output in node.output_values() {
            let internal = !graph.is_terminal_output(output)
                && graph.consumers_of(output).iter().all(local);
            if internal {
                private.insert(output.clone());
            } else {
                shared.insert(output.clone());
            }
        }
        for input in node.input_values() {
            if !graph.producer_of(input).is_some_and(|producer| local(&producer)) {
                shared.insert(input.clone());
            }
        }
    }
    CacheSelectHint::from_classification(private, shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, "T")
    }

    #[test]
    fn hint_answers_for_both_sets() {
        let hint = CacheSelectHint::private_values([spec("a")]);
        assert!(hint.is_private_value(&spec("a")));
        assert!(hint.is_shared_value(&spec("b")));

        let hint = CacheSelectHint::shared_values([spec("a")]);
        assert!(hint.is_shared_value(&spec("a")));
        assert!(hint.is_private_value(&spec("b")));

        assert!(CacheSelectHint::all_shared().is_shared_value(&spec("z")));
        assert!(CacheSelectHint::all_private().is_private_value(&spec("z")));
    }

    #[test]
    fn smaller_list_is_stored() {
        let private: HashSet<_> = [spec("a"), spec("b"), spec("c")].into();
        let shared: HashSet<_> = [spec("x")].into();
        let hint = CacheSelectHint::from_classification(private, shared);
        assert_eq!(hint.len(), 1);
        assert!(hint.is_private_value(&spec("b")));
        assert!(hint.is_shared_value(&spec("x")));
    }

    #[test]
    fn values_leaving_the_fragment_are_shared() {
        // a -> b -> c, with b also read by d in another fragment; c is terminal.
        let mut builder = DependencyGraph::builder("Default");
        let a = builder.add_node("f", "A", [spec("m")], [spec("va")]);
        let b = builder.add_node("f", "B", [spec("va")], [spec("vb")]);
        let c = builder.add_node("f", "C", [spec("vb")], [spec("vc")]);
        let d = builder.add_node("f", "D", [spec("vb")], [spec("vd")]);
        builder.add_terminal_value(spec("vc"));
        let graph = builder.build().unwrap();

        let f0 = FragmentId::from(0);
        let f1 = FragmentId::from(1);
        let owner = vec![f0, f0, f0, f1];
        let hint = calculate_cache_hint(&graph, &[a, b, c], &owner);

        assert!(hint.is_private_value(&spec("va")));
        assert!(hint.is_shared_value(&spec("vb")));
        assert!(hint.is_shared_value(&spec("vc")));
        assert!(hint.is_shared_value(&spec("m")));

        // Nothing reads vd and nobody asked for it, so it never leaves the worker.
        let hint = calculate_cache_hint(&graph, &[d], &owner);
        assert!(hint.is_shared_value(&spec("vb")));
        assert!(hint.is_private_value(&spec("vd")));
    }
}
