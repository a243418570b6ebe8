//! Cycle Driving
//!
//! Runs valuation cycles continuously: when to run the next one
//! ([`trigger`]), and the loop that runs them ([`runner`]).

mod runner;
mod trigger;

pub use runner::{
    CycleDefinition, CycleEvent, CycleLatency, CycleResult, CycleRunner, CycleRunnerHandle,
    CycleSource,
};
pub use trigger::{CycleEligibility, CycleTrigger, TriggerResult};
