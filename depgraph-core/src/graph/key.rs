//! Structural Keys
//!
//! A new [`DependencyGraph`] is built every cycle even when nothing about the
//! view changed, so graph identity is useless for caching. These keys
//! capture the shape of a graph by value: two graphs with equal keys have
//! the same nodes (target, function, inputs, outputs) at the same positions
//! and the same terminal outputs.
//!
//! Keys are only used for cache lookup. Nothing else should compare graphs
//! structurally.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::dependency_graph::DependencyGraph;
use super::node::DependencyNode;
use super::value::{FunctionId, TargetSpecification, ValueRequirement, ValueSpecification};

/// Structural identity of one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyNodeKey {
    target: TargetSpecification,
    function: FunctionId,
    inputs: Vec<ValueSpecification>,
    outputs: Vec<ValueSpecification>,
}

impl DependencyNodeKey {
    pub fn of(node: &DependencyNode) -> Self {
        let mut inputs = node.input_values().to_vec();
        inputs.sort();
        let mut outputs = node.output_values().to_vec();
        outputs.sort();
        Self {
            target: node.target().clone(),
            function: node.function().clone(),
            inputs,
            outputs,
        }
    }

    pub fn target(&self) -> &TargetSpecification {
        &self.target
    }

    pub fn function(&self) -> &FunctionId {
        &self.function
    }
}

/// Structural identity of a whole graph.
///
/// The node list is positional: a graph whose nodes were inserted in a
/// different order gets a different key. Cached plans address nodes by
/// position, so this is what makes a hit safe to replay.
///
/// The hash is computed once at construction; lookups on large graphs then
/// only pay for the full comparison on a hash match.
#[derive(Debug, Clone)]
pub struct DependencyGraphKey {
    calc_config: String,
    nodes: Vec<DependencyNodeKey>,
    terminal_outputs: Vec<(ValueRequirement, ValueSpecification)>,
    hash: u64,
}

impl DependencyGraphKey {
    pub fn of(graph: &DependencyGraph) -> Self {
        let nodes: Vec<DependencyNodeKey> = graph.nodes().map(DependencyNodeKey::of).collect();
        let mut terminal_outputs: Vec<(ValueRequirement, ValueSpecification)> = graph
            .terminal_outputs()
            .iter()
            .map(|(requirement, spec)| (requirement.clone(), spec.clone()))
            .collect();
        terminal_outputs.sort();

        let mut hasher = DefaultHasher::new();
        graph.calc_config().hash(&mut hasher);
        nodes.hash(&mut hasher);
        terminal_outputs.hash(&mut hasher);

        Self {
            calc_config: graph.calc_config().to_string(),
            nodes,
            terminal_outputs,
            hash: hasher.finish(),
        }
    }

    pub fn calc_config(&self) -> &str {
        &self.calc_config
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl PartialEq for DependencyGraphKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.calc_config == other.calc_config
            && self.nodes == other.nodes
            && self.terminal_outputs == other.terminal_outputs
    }
}

impl Eq for DependencyGraphKey {}

impl Hash for DependencyGraphKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, "T")
    }

    fn graph(terminal: &str) -> DependencyGraph {
        let mut builder = DependencyGraph::builder("Default");
        builder.add_node("f", "A", [spec("x"), spec("y")], [spec("a")]);
        builder.add_node("g", "B", [spec("a")], [spec("b"), spec("c")]);
        builder.add_terminal_value(spec(terminal));
        builder.build().unwrap()
    }

    #[test]
    fn distinct_instances_share_a_key() {
        let first = graph("b");
        let second = graph("b");
        assert_ne!(first.graph_id(), second.graph_id());
        assert_eq!(DependencyGraphKey::of(&first), DependencyGraphKey::of(&second));
    }

    #[test]
    fn terminal_outputs_are_part_of_the_key() {
        assert_ne!(
            DependencyGraphKey::of(&graph("b")),
            DependencyGraphKey::of(&graph("c"))
        );
    }

    #[test]
    fn node_key_ignores_declaration_order_of_values() {
        let mut builder = DependencyGraph::builder("Default");
        let a = builder.add_node("f", "A", [spec("x"), spec("y")], [spec("a")]);
        let b = builder.add_node("f", "A", [spec("y"), spec("x")], [spec("b")]);
        let graph = builder.build().unwrap();

        let key_a = DependencyNodeKey::of(graph.node(a).unwrap());
        let key_b = DependencyNodeKey::of(graph.node(b).unwrap());
        // Same inputs, different outputs.
        assert_ne!(key_a, key_b);
        assert_eq!(key_a.inputs, key_b.inputs);
    }

    #[test]
    fn calc_config_is_part_of_the_key() {
        let build = |config: &str| {
            let mut builder = DependencyGraph::builder(config);
            builder.add_node("f", "A", [], [spec("a")]);
            builder.build().unwrap()
        };
        assert_ne!(
            DependencyGraphKey::of(&build("Default")),
            DependencyGraphKey::of(&build("Stressed"))
        );
    }
}
