//! Function Blacklist
//!
//! Lets a calculation node skip job items known to misbehave.
//!
//! Before each item the node asks [`FunctionBlacklist::is_blacklisted`]. A
//! blacklisted item is not run: its outputs become
//! [`MissingOutput::Suppressed`](super::MissingOutput::Suppressed) markers
//! and its result reports [`InvocationStatus::Suppressed`](super::InvocationStatus::Suppressed).
//! Items whose function returns an error are reported back through
//! [`FunctionBlacklist::failed_job_item`], so an implementation can
//! blacklist them for later cycles.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;
use tracing::info;

use super::job::CalculationJobItem;
use crate::graph::{FunctionId, TargetSpecification};

/// Query and maintenance side of a blacklist.
pub trait FunctionBlacklist: Send + Sync {
    fn is_blacklisted(&self, item: &CalculationJobItem) -> bool;

    /// `item`'s function ran and failed.
    fn failed_job_item(&self, item: &CalculationJobItem);
}

/// Blacklists nothing and ignores failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyFunctionBlacklist;

impl FunctionBlacklist for EmptyFunctionBlacklist {
    fn is_blacklisted(&self, _item: &CalculationJobItem) -> bool {
        false
    }

    fn failed_job_item(&self, _item: &CalculationJobItem) {}
}

/// Rules held in memory: whole functions, or a function on one target.
#[derive(Debug, Default)]
pub struct InMemoryFunctionBlacklist {
    functions: DashSet<FunctionId>,
    invocations: DashSet<(FunctionId, TargetSpecification)>,
    blacklist_failures: bool,
    failures: AtomicU64,
}

impl InMemoryFunctionBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blacklist the function and target of every failed item.
    pub fn blacklisting_failures(mut self) -> Self {
        self.blacklist_failures = true;
        self
    }

    pub fn add_function(&self, function: impl Into<FunctionId>) {
        self.functions.insert(function.into());
    }

    pub fn add_invocation(
        &self,
        function: impl Into<FunctionId>,
        target: impl Into<TargetSpecification>,
    ) {
        self.invocations.insert((function.into(), target.into()));
    }

    pub fn remove_function(&self, function: &FunctionId) -> bool {
        self.functions.remove(function).is_some()
    }

    pub fn clear(&self) {
        self.functions.clear();
        self.invocations.clear();
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.functions.len() + self.invocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Failed items reported so far.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl FunctionBlacklist for InMemoryFunctionBlacklist {
    fn is_blacklisted(&self, item: &CalculationJobItem) -> bool {
        self.functions.contains(item.function())
            || self
                .invocations
                .contains(&(item.function().clone(), item.target().clone()))
    }

    fn failed_job_item(&self, item: &CalculationJobItem) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if self.blacklist_failures
            && self
                .invocations
                .insert((item.function().clone(), item.target().clone()))
        {
            info!(
                function = %item.function(),
                target = %item.target(),
                "blacklisting failed invocation"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ValueSpecification;

    fn item(function: &str, target: &str) -> CalculationJobItem {
        CalculationJobItem::new(
            FunctionId::new(function),
            TargetSpecification::new(target),
            Vec::new(),
            vec![ValueSpecification::new("out", target)],
        )
    }

    #[test]
    fn rules_match_function_or_invocation() {
        let blacklist = InMemoryFunctionBlacklist::new();
        blacklist.add_function("pv");
        blacklist.add_invocation("delta", "OPT-1");

        assert!(blacklist.is_blacklisted(&item("pv", "OPT-1")));
        assert!(blacklist.is_blacklisted(&item("pv", "OPT-2")));
        assert!(blacklist.is_blacklisted(&item("delta", "OPT-1")));
        assert!(!blacklist.is_blacklisted(&item("delta", "OPT-2")));
        assert_eq!(blacklist.len(), 2);

        assert!(blacklist.remove_function(&FunctionId::new("pv")));
        assert!(!blacklist.is_blacklisted(&item("pv", "OPT-1")));
    }

    #[test]
    fn failures_are_blacklisted_only_when_asked() {
        let counting = InMemoryFunctionBlacklist::new();
        counting.failed_job_item(&item("pv", "OPT-1"));
        assert_eq!(counting.failure_count(), 1);
        assert!(counting.is_empty());

        let learning = InMemoryFunctionBlacklist::new().blacklisting_failures();
        learning.failed_job_item(&item("pv", "OPT-1"));
        learning.failed_job_item(&item("pv", "OPT-1"));
        assert_eq!(learning.failure_count(), 2);
        assert_eq!(learning.len(), 1);
        assert!(learning.is_blacklisted(&item("pv", "OPT-1")));
        assert!(!learning.is_blacklisted(&item("pv", "OPT-2")));
    }
}
