//! Cycle Trigger
//!
//! Decides when the next cycle may or must run, from the start time of
//! the previous one:
//!
//! - before `minimum_period` has passed, a cycle is not allowed;
//! - between the two periods, a cycle runs if one was requested;
//! - once `maximum_period` has passed, a cycle is forced.
//!
//! The very first cycle is eligible at once.

use std::time::{Duration, Instant};

use crate::config::CycleConfig;

/// Whether a cycle may run now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEligibility {
    /// A cycle must run.
    Force,
    /// A cycle may run if one was requested.
    Eligible,
    /// Too soon after the previous cycle.
    Ineligible,
}

/// Answer to [`CycleTrigger::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerResult {
    pub eligibility: CycleEligibility,
    /// When the eligibility next changes, if it ever does.
    pub next_state_change: Option<Instant>,
}

/// Minimum/maximum period trigger.
#[derive(Debug, Clone)]
pub struct CycleTrigger {
    minimum_period: Duration,
    maximum_period: Duration,
    last_start: Option<Instant>,
}

impl CycleTrigger {
    pub fn new(minimum_period: Duration, maximum_period: Duration) -> Self {
        Self {
            minimum_period,
            maximum_period: maximum_period.max(minimum_period),
            last_start: None,
        }
    }

    pub fn from_config(config: &CycleConfig) -> Self {
        Self::new(config.minimum_period(), config.maximum_period())
    }

    pub fn query(&self, now: Instant) -> TriggerResult {
        let Some(start) = self.last_start else {
            return TriggerResult {
                eligibility: CycleEligibility::Eligible,
                next_state_change: None,
            };
        };
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= self.maximum_period {
            TriggerResult {
                eligibility: CycleEligibility::Force,
                next_state_change: None,
            }
        } else if elapsed >= self.minimum_period {
            TriggerResult {
                eligibility: CycleEligibility::Eligible,
                next_state_change: start.checked_add(self.maximum_period),
            }
        } else {
            TriggerResult {
                eligibility: CycleEligibility::Ineligible,
                next_state_change: start.checked_add(self.minimum_period),
            }
        }
    }

    /// Record that a cycle started at `now`.
    pub fn cycle_triggered(&mut self, now: Instant) {
        self.last_start = Some(now);
    }

    pub fn last_start(&self) -> Option<Instant> {
        self.last_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cycle_is_eligible() {
        let trigger = CycleTrigger::new(Duration::from_secs(1), Duration::from_secs(10));
        let result = trigger.query(Instant::now());
        assert_eq!(result.eligibility, CycleEligibility::Eligible);
        assert_eq!(result.next_state_change, None);
    }

    #[test]
    fn periods_gate_the_next_cycle() {
        let mut trigger = CycleTrigger::new(Duration::from_secs(1), Duration::from_secs(10));
        let start = Instant::now();
        trigger.cycle_triggered(start);

        let soon = trigger.query(start + Duration::from_millis(500));
        assert_eq!(soon.eligibility, CycleEligibility::Ineligible);
        assert_eq!(soon.next_state_change, Some(start + Duration::from_secs(1)));

        let later = trigger.query(start + Duration::from_secs(2));
        assert_eq!(later.eligibility, CycleEligibility::Eligible);
        assert_eq!(later.next_state_change, Some(start + Duration::from_secs(10)));

        let overdue = trigger.query(start + Duration::from_secs(10));
        assert_eq!(overdue.eligibility, CycleEligibility::Force);
    }

    #[test]
    fn maximum_never_below_minimum() {
        let mut trigger = CycleTrigger::new(Duration::from_secs(5), Duration::from_secs(1));
        let start = Instant::now();
        trigger.cycle_triggered(start);
        assert_eq!(
            trigger.query(start + Duration::from_secs(2)).eligibility,
            CycleEligibility::Ineligible
        );
    }
}
