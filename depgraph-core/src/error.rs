//! Engine Errors
//!
//! Errors raised by graph construction, configuration loading, plan
//! execution and the cycle driving loop.
//!
//! Function failures are not in here: a failing calculation function is
//! captured in its job result item (see [`crate::calcnode::InvocationStatus`])
//! and never surfaces as an `Err` from the engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::calcnode::JobId;
use crate::graph::ValueSpecification;

/// Crate-level error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Two nodes claim to produce the same value.
    #[error("value {value} is produced by more than one node")]
    DuplicateProducer { value: ValueSpecification },

    /// The node inputs form a cycle.
    #[error("cycle detected in dependency graph '{calc_config}'")]
    CycleDetected { calc_config: String },

    /// A node index outside the graph.
    #[error("unknown dependency node {0}")]
    UnknownNode(usize),

    /// Configuration values that cannot work together.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file could not be read.
    #[error("unable to read configuration {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is malformed.
    #[error("unable to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// A plan was run against a graph it was not compiled from.
    #[error("execution plan covers {expected} nodes but graph has {actual}")]
    PlanMismatch { expected: usize, actual: usize },

    /// The plan execution was cancelled before completion.
    #[error("graph execution cancelled")]
    Cancelled,

    /// A dispatched job never reported a result.
    #[error("job {job_id} lost: no result after {timeout:?}")]
    JobLost { job_id: JobId, timeout: Duration },

    /// Waiting for a result gave up.
    #[error("timed out after {0:?} waiting for graph execution")]
    Timeout(Duration),

    /// The cycle driving loop was terminated.
    #[error("computation job terminated")]
    Terminated,
}

/// Convenience alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = EngineError::PlanMismatch {
            expected: 5,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "execution plan covers 5 nodes but graph has 4"
        );

        let err = EngineError::JobLost {
            job_id: JobId::from(7),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "job 7 lost: no result after 2s");
    }

    #[test]
    fn parse_error_converts() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: EngineError = parse.into();
        assert!(matches!(err, EngineError::ConfigParse(_)));
    }
}
