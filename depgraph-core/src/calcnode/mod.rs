//! Calculation Nodes
//!
//! Everything on the worker side of the dispatch boundary: jobs and their
//! results, the value caches jobs read and write, the function repository and
//! blacklist, the in-process calculation node, and the dispatcher that feeds it.

mod blacklist;
mod cache;
mod dispatch;
mod function;
mod job;
mod node;

pub use blacklist::{EmptyFunctionBlacklist, FunctionBlacklist, InMemoryFunctionBlacklist};
pub use cache::{
    CacheValue, ComputationCacheSource, ComputedValue, InMemoryComputationCacheSource,
    InMemoryViewComputationCache, MissingOutput, ViewComputationCache,
};
pub use dispatch::{Cancelable, JobDispatcher, JobResultReceiver, LocalJobDispatcher, LocalJobHandle};
pub use function::{
    CalculationFunction, FnFunction, FunctionError, FunctionExecutionContext, FunctionInputs,
    FunctionRepository,
};
pub use job::{
    CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobResultItem,
    CalculationJobSpecification, CycleId, InvocationStatus, JobId,
};
pub use node::CalculationNode;
