//! Engine Configuration
//!
//! Tunables for the partitioner, the plan cache, job dispatch and the cycle
//! driving loop. Every field has a default so a configuration document only
//! needs to name what it changes:
//!
//! ```json
//! { "partitioner": { "maximum_job_items": 200, "maximum_concurrency": 4 } }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Bounds applied when merging dependency nodes into fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionerConfig {
    /// Fragments smaller than this try to join their consumer.
    pub minimum_job_items: usize,

    /// No fragment may hold more nodes than this.
    pub maximum_job_items: usize,

    /// Fragments cheaper than this try to join their consumer.
    pub minimum_job_cost: u64,

    /// No fragment may have a higher estimated cost than this. Costs are
    /// estimated nanoseconds of function time; functions never observed
    /// count as [`DEFAULT_INVOCATION_COST`](crate::exec::DEFAULT_INVOCATION_COST).
    pub maximum_job_cost: u64,

    /// Bounds how many tails may hang off one predecessor (`c - 1`).
    pub maximum_concurrency: usize,
}

impl PartitionerConfig {
    /// Bounds that allow every merge.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Bounds fixing the number of nodes per fragment between `minimum` and `maximum`.
    pub fn with_job_items(minimum: usize, maximum: usize) -> Self {
        Self {
            minimum_job_items: minimum,
            maximum_job_items: maximum,
            ..Self::default()
        }
    }

    /// Replace the concurrency bound.
    pub fn with_concurrency(mut self, maximum_concurrency: usize) -> Self {
        self.maximum_concurrency = maximum_concurrency;
        self
    }

    /// Replace the cost bounds.
    pub fn with_job_cost(mut self, minimum: u64, maximum: u64) -> Self {
        self.minimum_job_cost = minimum;
        self.maximum_job_cost = maximum;
        self
    }

    /// Check that the bounds are usable.
    pub fn validate(&self) -> EngineResult<()> {
        if self.maximum_job_items == 0 {
            return Err(EngineError::InvalidConfig(
                "maximum_job_items must be at least 1".into(),
            ));
        }
        if self.minimum_job_items > self.maximum_job_items {
            return Err(EngineError::InvalidConfig(format!(
                "minimum_job_items ({}) exceeds maximum_job_items ({})",
                self.minimum_job_items, self.maximum_job_items
            )));
        }
        if self.minimum_job_cost > self.maximum_job_cost {
            return Err(EngineError::InvalidConfig(format!(
                "minimum_job_cost ({}) exceeds maximum_job_cost ({})",
                self.minimum_job_cost, self.maximum_job_cost
            )));
        }
        if self.maximum_concurrency == 0 {
            return Err(EngineError::InvalidConfig(
                "maximum_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PartitionerConfig {
    fn default() -> Self {
        Self {
            minimum_job_items: 1,
            maximum_job_items: usize::MAX,
            minimum_job_cost: 0,
            maximum_job_cost: u64::MAX,
            maximum_concurrency: usize::MAX,
        }
    }
}

/// Timing of the cycle driving loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// A requested cycle waits until this long after the previous start.
    pub minimum_period_ms: u64,

    /// A cycle is forced this long after the previous start.
    pub maximum_period_ms: u64,

    /// How long `terminate` waits for the loop to wind down.
    pub termination_grace_ms: u64,
}

impl CycleConfig {
    pub fn minimum_period(&self) -> Duration {
        Duration::from_millis(self.minimum_period_ms)
    }

    pub fn maximum_period(&self) -> Duration {
        Duration::from_millis(self.maximum_period_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            minimum_period_ms: 0,
            maximum_period_ms: 60_000,
            termination_grace_ms: 5_000,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub partitioner: PartitionerConfig,

    /// Number of compiled plans kept by the plan cache.
    pub plan_cache_capacity: usize,

    /// A job (per link of its tail chain) with no result after this long is lost.
    pub job_timeout_ms: u64,

    /// Concurrent job slots of the in-process dispatcher.
    pub worker_count: usize,

    pub cycle: CycleConfig,
}

impl EngineConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.partitioner.validate()?;
        if self.plan_cache_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "plan_cache_capacity must be at least 1".into(),
            ));
        }
        if self.worker_count == 0 {
            return Err(EngineError::InvalidConfig(
                "worker_count must be at least 1".into(),
            ));
        }
        if self.cycle.minimum_period_ms > self.cycle.maximum_period_ms {
            return Err(EngineError::InvalidConfig(format!(
                "cycle minimum_period_ms ({}) exceeds maximum_period_ms ({})",
                self.cycle.minimum_period_ms, self.cycle.maximum_period_ms
            )));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partitioner: PartitionerConfig::default(),
            plan_cache_capacity: 64,
            job_timeout_ms: 60_000,
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            cycle: CycleConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.partitioner.minimum_job_items, 1);
        assert_eq!(config.partitioner.maximum_job_items, usize::MAX);
        assert_eq!(config.plan_cache_capacity, 64);
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "partitioner": { "maximum_job_items": 10, "maximum_concurrency": 2 },
                 "job_timeout_ms": 250 }"#,
        )
        .unwrap();

        assert_eq!(config.partitioner.maximum_job_items, 10);
        assert_eq!(config.partitioner.maximum_concurrency, 2);
        assert_eq!(config.partitioner.minimum_job_items, 1);
        assert_eq!(config.job_timeout(), Duration::from_millis(250));
        assert_eq!(config.plan_cache_capacity, 64);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let err = EngineConfig::from_json_str(
            r#"{ "partitioner": { "minimum_job_items": 6, "maximum_job_items": 5 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));

        let config = PartitionerConfig::default().with_job_cost(10, 5);
        assert!(config.validate().is_err());

        let config = PartitionerConfig::default().with_concurrency(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = EngineConfig::from_path("/nonexistent/engine.json").unwrap_err();
        match err {
            EngineError::ConfigIo { path, .. } => {
                assert_eq!(path, Path::new("/nonexistent/engine.json"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
