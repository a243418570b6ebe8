//! Depgraph Core
//!
//! This crate provides an execution engine for dependency graphs of
//! calculations. It implements:
//!
//! - Dependency graph model with structural keys
//! - Partitioning of graphs into job-sized fragments
//! - Private/shared cache hints per job
//! - Reusable execution plans and a plan cache
//! - Bottom-up job dispatch with cancellation
//! - An in-process calculation node and dispatcher
//! - A cycle driving loop
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Dependency nodes, graphs and their structural keys
//! - `exec`: Partitioner, cache hints, execution plans and their execution
//! - `calcnode`: Jobs, value caches, functions and the local worker
//! - `cycle`: Triggering and running valuation cycles
//! - `config`: Engine configuration
//! - `error`: Engine error type
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use depgraph_core::prelude::*;
//!
//! let mut builder = DependencyGraph::builder("Default");
//! builder.add_node("spot", "AAPL", [], [ValueSpecification::new("Spot", "AAPL")]);
//! builder.add_terminal_value(ValueSpecification::new("Spot", "AAPL"));
//! let graph = Arc::new(builder.build()?);
//!
//! let executor = GraphExecutor::local(&config, functions, caches, costs, statistics);
//! let execution = executor.execute(executor.context(graph))?;
//! let populated = execution.wait().await?;
//! ```

pub mod calcnode;
pub mod config;
pub mod cycle;
pub mod error;
pub mod exec;
pub mod graph;

pub use error::{EngineError, EngineResult};

/// Commonly used types.
pub mod prelude {
    pub use crate::calcnode::{
        CalculationFunction, ComputationCacheSource, ComputedValue, CycleId, FunctionBlacklist,
        FunctionRepository, InMemoryComputationCacheSource, InMemoryFunctionBlacklist,
        JobDispatcher,
    };
    pub use crate::config::{CycleConfig, EngineConfig, PartitionerConfig};
    pub use crate::cycle::{CycleEvent, CycleRunner, CycleSource};
    pub use crate::error::{EngineError, EngineResult};
    pub use crate::exec::{
        ExecutionContext, ExecutionPlan, FunctionCosts, GraphExecutor, PlanExecution, PlanState,
        PopulatedGraph, TotallingGraphStatisticsGatherer,
    };
    pub use crate::graph::{DependencyGraph, TargetSpecification, ValueSpecification};
}
