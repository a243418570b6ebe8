//! Calculation Functions
//!
//! The seam between the engine and the analytics it runs. A function gets
//! its resolved inputs and the outputs it is expected to produce, and
//! returns computed values. What it computes is no concern of the engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use indexmap::IndexMap;
use thiserror::Error;

use super::cache::ComputedValue;
use super::job::CycleId;
use crate::graph::{FunctionId, TargetSpecification, ValueSpecification};

/// Failure of one function invocation.
#[derive(Debug, Error)]
pub enum FunctionError {
    /// A required input was not supplied.
    #[error("missing input {0}")]
    MissingInput(ValueSpecification),

    /// An input was supplied but had the wrong shape.
    #[error("input {value} is not {expected}")]
    InvalidInput {
        value: ValueSpecification,
        expected: &'static str,
    },

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

/// Resolved inputs of one invocation.
#[derive(Debug, Default)]
pub struct FunctionInputs {
    values: HashMap<ValueSpecification, serde_json::Value>,
    missing: Vec<ValueSpecification>,
}

impl FunctionInputs {
    pub fn new(
        values: HashMap<ValueSpecification, serde_json::Value>,
        missing: Vec<ValueSpecification>,
    ) -> Self {
        Self { values, missing }
    }

    pub fn value(&self, specification: &ValueSpecification) -> Option<&serde_json::Value> {
        self.values.get(specification)
    }

    /// First input with the given value name.
    pub fn value_named(&self, name: &str) -> Option<&serde_json::Value> {
        self.values
            .iter()
            .find(|(spec, _)| spec.name() == name)
            .map(|(_, value)| value)
    }

    /// A numeric input, failing if absent or not a number.
    pub fn f64(&self, specification: &ValueSpecification) -> Result<f64, FunctionError> {
        let value = self
            .value(specification)
            .ok_or_else(|| FunctionError::MissingInput(specification.clone()))?;
        value.as_f64().ok_or_else(|| FunctionError::InvalidInput {
            value: specification.clone(),
            expected: "a number",
        })
    }

    /// Inputs that were absent or failed upstream.
    pub fn missing(&self) -> &[ValueSpecification] {
        &self.missing
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ValueSpecification, &serde_json::Value)> {
        self.values.iter()
    }
}

/// What a function knows about the invocation besides its inputs.
#[derive(Debug, Clone)]
pub struct FunctionExecutionContext {
    pub cycle_id: CycleId,
    pub calc_config: String,
    pub valuation_time: SystemTime,
}

/// A compiled calculation function.
pub trait CalculationFunction: Send + Sync {
    /// Compute `desired_outputs` for `target`.
    ///
    /// Returning fewer values than asked for is allowed; the rest are
    /// recorded as evaluation errors.
    fn execute(
        &self,
        context: &FunctionExecutionContext,
        inputs: &FunctionInputs,
        target: &TargetSpecification,
        desired_outputs: &[ValueSpecification],
    ) -> Result<Vec<ComputedValue>, FunctionError>;

    /// Whether the function should still run when some inputs are missing.
    fn can_handle_missing_inputs(&self) -> bool {
        false
    }
}

/// Adapts a closure into a [`CalculationFunction`].
pub struct FnFunction<F> {
    f: F,
    handles_missing_inputs: bool,
}

impl<F> FnFunction<F>
where
    F: Fn(&FunctionInputs, &[ValueSpecification]) -> Result<Vec<ComputedValue>, FunctionError>
        + Send
        + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            handles_missing_inputs: false,
        }
    }

    /// Run even when inputs are missing.
    pub fn handling_missing_inputs(mut self) -> Self {
        self.handles_missing_inputs = true;
        self
    }
}

impl<F> CalculationFunction for FnFunction<F>
where
    F: Fn(&FunctionInputs, &[ValueSpecification]) -> Result<Vec<ComputedValue>, FunctionError>
        + Send
        + Sync,
{
    fn execute(
        &self,
        _context: &FunctionExecutionContext,
        inputs: &FunctionInputs,
        _target: &TargetSpecification,
        desired_outputs: &[ValueSpecification],
    ) -> Result<Vec<ComputedValue>, FunctionError> {
        (self.f)(inputs, desired_outputs)
    }

    fn can_handle_missing_inputs(&self) -> bool {
        self.handles_missing_inputs
    }
}

/// Registered functions by id.
#[derive(Default)]
pub struct FunctionRepository {
    functions: IndexMap<FunctionId, Arc<dyn CalculationFunction>>,
}

impl FunctionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function`, replacing any function with the same id.
    pub fn register(
        &mut self,
        id: impl Into<FunctionId>,
        function: impl CalculationFunction + 'static,
    ) -> &mut Self {
        self.functions.insert(id.into(), Arc::new(function));
        self
    }

    /// Register a closure.
    pub fn register_fn<F>(&mut self, id: impl Into<FunctionId>, f: F) -> &mut Self
    where
        F: Fn(&FunctionInputs, &[ValueSpecification]) -> Result<Vec<ComputedValue>, FunctionError>
            + Send
            + Sync
            + 'static,
    {
        self.register(id, FnFunction::new(f))
    }

    pub fn get(&self, id: &FunctionId) -> Option<&Arc<dyn CalculationFunction>> {
        self.functions.get(id)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Registered ids in registration order.
    pub fn function_ids(&self) -> impl Iterator<Item = &FunctionId> {
        self.functions.keys()
    }
}

impl fmt::Debug for FunctionRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRepository")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}
