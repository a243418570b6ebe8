//! Calculation Node
//!
//! Executes calculation jobs in-process.
//!
//! # Overview
//!
//! Items run in job order. For each item the node:
//!
//! 1. Asks the [`FunctionBlacklist`]; a blacklisted item is suppressed and
//!    its outputs become `Suppressed` markers.
//! 2. Looks up the function; an unknown function fails the item.
//! 3. Resolves inputs through the job's value store. An input that is
//!    absent, or present only as a [`MissingOutput`] marker, is missing.
//! 4. Skips the item when inputs are missing and the function cannot cope,
//!    writing `MissingInputs` markers for its outputs.
//! 5. Otherwise invokes the function, times it, and writes the outputs.
//!    Declared outputs the function did not produce (all of them, if it
//!    failed) become `EvaluationError` markers. A failed item is reported
//!    to the blacklist.
//!
//! A failing item never aborts the job. Downstream items see the markers
//! and fail in turn, while items that do not depend on the failure still
//! compute.
//!
//! Tail jobs run right after their predecessor on the same thread, each
//! reporting its own result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use super::blacklist::{EmptyFunctionBlacklist, FunctionBlacklist};
use super::cache::{CacheValue, ComputationCacheSource, ComputedValue, JobValueStore, MissingOutput};
use super::function::{FunctionExecutionContext, FunctionInputs, FunctionRepository};
use super::job::{CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobResultItem};
use crate::exec::FunctionInvocationStatisticsGatherer;
use crate::graph::ValueSpecification;

/// An in-process calculation node.
pub struct CalculationNode {
    node_id: String,
    functions: Arc<FunctionRepository>,
    cache_source: Arc<dyn ComputationCacheSource>,
    statistics: Arc<dyn FunctionInvocationStatisticsGatherer>,
    blacklist: Arc<dyn FunctionBlacklist>,
}

impl CalculationNode {
    pub fn new(
        node_id: impl Into<String>,
        functions: Arc<FunctionRepository>,
        cache_source: Arc<dyn ComputationCacheSource>,
        statistics: Arc<dyn FunctionInvocationStatisticsGatherer>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            functions,
            cache_source,
            statistics,
            blacklist: Arc::new(EmptyFunctionBlacklist),
        }
    }

    pub fn with_blacklist(mut self, blacklist: Arc<dyn FunctionBlacklist>) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn functions(&self) -> &FunctionRepository {
        &self.functions
    }

    /// Run `job` alone, ignoring any tails.
    ///
    /// Returns `None` when `interrupted` turned true before every item ran.
    pub fn execute_job(
        &self,
        job: &CalculationJob,
        interrupted: &dyn Fn() -> bool,
    ) -> Option<CalculationJobResult> {
        let specification = job.specification();
        let cache = self
            .cache_source
            .cache(specification.cycle_id(), specification.calc_config());
        let mut store = JobValueStore::new(cache.as_ref(), job.cache_select_hint());
        let context = FunctionExecutionContext {
            cycle_id: specification.cycle_id(),
            calc_config: specification.calc_config().to_string(),
            valuation_time: specification.valuation_time(),
        };

        let started = Instant::now();
        let mut items = Vec::with_capacity(job.items().len());
        for item in job.items() {
            if interrupted() {
                debug!(
                    job_id = %job.job_id(),
                    completed = items.len(),
                    total = job.items().len(),
                    "job interrupted"
                );
                return None;
            }
            items.push(self.execute_item(&context, item, &mut store));
        }

        trace!(
            job_id = %job.job_id(),
            private = store.private_count(),
            shared = store.shared_writes(),
            "job values written"
        );

        Some(CalculationJobResult::new(
            specification.clone(),
            items,
            started.elapsed(),
            self.node_id.clone(),
        ))
    }

    /// Run `job` and then its tails depth-first, handing each result to
    /// `deliver` as soon as it is ready.
    ///
    /// Returns `false` if interrupted.
    pub fn execute_job_chain(
        &self,
        job: &CalculationJob,
        deliver: &mut dyn FnMut(CalculationJobResult),
        interrupted: &dyn Fn() -> bool,
    ) -> bool {
        let Some(result) = self.execute_job(job, interrupted) else {
            return false;
        };
        deliver(result);
        for tail in job.tail() {
            if !self.execute_job_chain(tail, &mut *deliver, interrupted) {
                return false;
            }
        }
        true
    }

    fn execute_item(
        &self,
        context: &FunctionExecutionContext,
        item: &CalculationJobItem,
        store: &mut JobValueStore<'_>,
    ) -> CalculationJobResultItem {
        if self.blacklist.is_blacklisted(item) {
            debug!(function = %item.function(), target = %item.target(), "item suppressed");
            post_missing(store, item.outputs(), MissingOutput::Suppressed);
            return CalculationJobResultItem::suppressed();
        }

        let Some(function) = self.functions.get(item.function()) else {
            debug!(function = %item.function(), target = %item.target(), "function not found");
            post_missing(store, item.outputs(), MissingOutput::EvaluationError);
            return CalculationJobResultItem::function_not_found(item.function());
        };

        let mut values = HashMap::with_capacity(item.inputs().len());
        let mut missing = Vec::new();
        for input in item.inputs() {
            match store.get(input) {
                Some(CacheValue::Value(value)) => {
                    values.insert(input.clone(), value);
                }
                Some(CacheValue::Missing(_)) | None => missing.push(input.clone()),
            }
        }

        if !missing.is_empty() && !function.can_handle_missing_inputs() {
            debug!(
                function = %item.function(),
                target = %item.target(),
                missing = missing.len(),
                "skipping item with missing inputs"
            );
            post_missing(store, item.outputs(), MissingOutput::MissingInputs);
            return CalculationJobResultItem::missing_inputs(missing);
        }

        let inputs = FunctionInputs::new(values, missing);
        let started = Instant::now();
        let outcome = function.execute(context, &inputs, item.target(), item.outputs());
        self.statistics.function_invoked(
            &context.calc_config,
            item.function(),
            1,
            started.elapsed().as_nanos() as f64,
        );

        let results = match outcome {
            Ok(results) => results,
            Err(err) => {
                debug!(
                    function = %item.function(),
                    target = %item.target(),
                    error = %err,
                    "function failed"
                );
                self.blacklist.failed_job_item(item);
                post_missing(store, item.outputs(), MissingOutput::EvaluationError);
                return CalculationJobResultItem::function_failed(err.to_string());
            }
        };

        let mut produced = Vec::with_capacity(results.len());
        for value in results {
            if item.outputs().contains(value.specification()) {
                produced.push(value.specification().clone());
                store.put(value);
            } else {
                trace!(value = %value.specification(), "discarding undeclared output");
            }
        }
        let missing_outputs: Vec<ValueSpecification> = item
            .outputs()
            .iter()
            .filter(|output| !produced.contains(output))
            .cloned()
            .collect();
        post_missing(store, &missing_outputs, MissingOutput::EvaluationError);

        let result = if inputs.missing().is_empty() {
            CalculationJobResultItem::success()
        } else {
            CalculationJobResultItem::partial_inputs(inputs.missing().to_vec())
        };
        result.with_missing_outputs(missing_outputs)
    }
}

fn post_missing(store: &mut JobValueStore<'_>, outputs: &[ValueSpecification], reason: MissingOutput) {
    for output in outputs {
        store.put(ComputedValue::missing(output.clone(), reason));
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
