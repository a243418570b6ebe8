//! Partitioner Criterion benchmarks.
//!
//! Measures partitioning, plan freezing and plan cache key construction on
//! layered graphs of increasing size.
//!
//! Run with: cargo bench --bench partition

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use depgraph_core::config::PartitionerConfig;
use depgraph_core::exec::{ExecutionPlan, FunctionCosts, Partitioner, PlanCacheKey};
use depgraph_core::graph::{DependencyGraph, ValueSpecification};

/// `layers` layers of `width` nodes; each node reads two nodes of the layer below.
fn layered_graph(layers: usize, width: usize) -> DependencyGraph {
    let value = |layer: usize, i: usize| ValueSpecification::new(format!("v{layer}_{i}"), "T");
    let mut builder = DependencyGraph::builder("Default");
    for layer in 0..layers {
        for i in 0..width {
            let inputs = if layer == 0 {
                vec![ValueSpecification::new("market", format!("M{i}"))]
            } else {
                let mut inputs = vec![value(layer - 1, i)];
                if width > 1 {
                    inputs.push(value(layer - 1, (i + 1) % width));
                }
                inputs
            };
            builder.add_node("f", format!("N{layer}_{i}"), inputs, [value(layer, i)]);
        }
    }
    for i in 0..width {
        builder.add_terminal_value(value(layers - 1, i));
    }
    match builder.build() {
        Ok(graph) => graph,
        Err(err) => panic!("benchmark graph is invalid: {err}"),
    }
}

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");
    let configs = [
        ("unbounded", PartitionerConfig::unbounded()),
        ("items_1_100", PartitionerConfig::with_job_items(1, 100)),
        ("items_10_50_c4", PartitionerConfig::with_job_items(10, 50).with_concurrency(4)),
    ];

    for (layers, width) in [(10, 10), (20, 50), (50, 100)] {
        let graph = layered_graph(layers, width);
        group.throughput(Throughput::Elements(graph.size() as u64));
        for (name, config) in configs {
            let partitioner = Partitioner::new(config, Arc::new(FunctionCosts::new()));
            group.bench_with_input(BenchmarkId::new(name, graph.size()), &graph, |b, graph| {
                b.iter(|| black_box(partitioner.partition(black_box(graph))));
            });
        }
    }
    group.finish();
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan");
    let partitioner = Partitioner::new(
        PartitionerConfig::with_job_items(1, 100).with_concurrency(4),
        Arc::new(FunctionCosts::new()),
    );

    for (layers, width) in [(20, 50), (50, 100)] {
        let graph = layered_graph(layers, width);
        let tree = partitioner.partition(&graph);
        group.throughput(Throughput::Elements(graph.size() as u64));

        group.bench_with_input(BenchmarkId::new("freeze", graph.size()), &graph, |b, graph| {
            b.iter(|| black_box(ExecutionPlan::of(&tree, graph)));
        });
        group.bench_with_input(BenchmarkId::new("cache_key", graph.size()), &graph, |b, graph| {
            b.iter(|| black_box(PlanCacheKey::new(graph, 0)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_partition, bench_plan);
criterion_main!(benches);
