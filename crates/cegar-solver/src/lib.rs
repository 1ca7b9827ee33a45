//! Solver clients for abstract verification queries.
//!
//! A [`SolverClient`] decides one [`Query`] under a hard wall-clock limit. The
//! scheduler owns the global budget; a client only ever sees the per-attempt
//! timeout it is handed. Dropping a `solve` future must cancel the underlying
//! work, which [`SmtProcessSolver`] guarantees by killing its child process.

pub mod smt;

pub use smt::SmtProcessSolver;

use async_trait::async_trait;
use cegar_query::{precheck_query, PrecheckVerdict, Query, QueryError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default number of bound-tightening passes used by [`SolverClient::precheck`].
pub const DEFAULT_TIGHTENING_ROUNDS: usize = 4;

/// Assignment produced by a satisfiable query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Witness {
    pub inputs: Vec<f64>,
    /// Output values claimed by the solver. Abstract queries may report
    /// outputs the concrete network never produces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<f64>>,
}

impl Witness {
    pub fn new(inputs: Vec<f64>) -> Self {
        Self {
            inputs,
            outputs: None,
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<f64>) -> Self {
        self.outputs = Some(outputs);
        self
    }
}

/// Result of a single bounded solver attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "UPPERCASE")]
pub enum AttemptOutcome {
    Unsat,
    Sat(Witness),
    Timeout,
    Error(String),
}

impl AttemptOutcome {
    /// Label used in run reports.
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Unsat => "UNSAT",
            AttemptOutcome::Sat(_) => "SAT",
            AttemptOutcome::Timeout => "TIMEOUT",
            AttemptOutcome::Error(_) => "ERROR",
        }
    }
}

/// Result of the cheap feasibility pre-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precheck {
    Infeasible,
    Inconclusive,
}

impl From<PrecheckVerdict> for Precheck {
    fn from(v: PrecheckVerdict) -> Self {
        match v {
            PrecheckVerdict::Infeasible => Precheck::Infeasible,
            PrecheckVerdict::Inconclusive => Precheck::Inconclusive,
        }
    }
}

/// Errors from solver clients.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("Failed to start solver '{binary}': {message}")]
    Spawn { binary: String, message: String },

    #[error("Solver I/O failed: {0}")]
    Io(String),

    #[error("Solver crashed ({status}): {stderr}")]
    Crashed { status: String, stderr: String },

    #[error("Malformed solver output: {0}")]
    MalformedOutput(String),

    #[error("Pre-check task failed: {0}")]
    Precheck(String),

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Configuration for solver clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Solver executable, looked up on `PATH` if not absolute.
    pub binary: String,
    /// Arguments that make the solver read a script from stdin.
    pub args: Vec<String>,
    /// Request a model after `sat`.
    pub produce_models: bool,
    /// Bound-tightening passes for the pre-check.
    pub tightening_rounds: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            binary: "z3".to_string(),
            args: vec!["-in".to_string()],
            produce_models: true,
            tightening_rounds: DEFAULT_TIGHTENING_ROUNDS,
        }
    }
}

/// Bounded, cancellable access to a decision procedure.
#[async_trait]
pub trait SolverClient: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    fn tightening_rounds(&self) -> usize {
        DEFAULT_TIGHTENING_ROUNDS
    }

    /// Decide infeasibility by bound tightening alone.
    ///
    /// Never reports a feasible query as [`Precheck::Infeasible`]. The
    /// default runs on the blocking pool so a caller's timer can fire while
    /// tightening is still in progress.
    async fn precheck(&self, query: &Query) -> Result<Precheck, SolverError> {
        let query = query.clone();
        let rounds = self.tightening_rounds();
        tokio::task::spawn_blocking(move || Precheck::from(precheck_query(&query, rounds)))
            .await
            .map_err(|e| SolverError::Precheck(e.to_string()))
    }

    /// Decide `query` within `timeout`.
    ///
    /// Must return no later than `timeout` plus a small margin and must stop
    /// all solver work when the returned future is dropped.
    async fn solve(&self, query: &Query, timeout: Duration) -> AttemptOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;
    use cegar_core::{Activation, Bound, Layer, Network, Property};
    use cegar_query::QueryBuilder;
    use ndarray::{arr1, arr2};

    struct Never;

    #[async_trait]
    impl SolverClient for Never {
        fn name(&self) -> &str {
            "never"
        }

        async fn solve(&self, _query: &Query, _timeout: Duration) -> AttemptOutcome {
            AttemptOutcome::Timeout
        }
    }

    fn query(violation: &str) -> Query {
        let h = Layer::new(arr2(&[[1.0]]), arr1(&[0.0]), Activation::Relu).unwrap();
        let out = Layer::new(arr2(&[[2.0]]), arr1(&[0.0]), Activation::Identity).unwrap();
        let net = Network::new(vec![h, out]).unwrap();
        let prop = Property::new(vec![Bound::new(-1.0, 1.0)], violation.parse().unwrap());
        QueryBuilder::new(&net, &prop).unwrap().build_full().unwrap().0
    }

    #[tokio::test]
    async fn test_default_precheck_uses_tightening() {
        assert_eq!(Never.precheck(&query("y0 <= -0.5")).await.unwrap(), Precheck::Infeasible);
        assert_eq!(Never.precheck(&query("y0 >= 1.5")).await.unwrap(), Precheck::Inconclusive);
    }

    #[tokio::test]
    async fn test_default_precheck_does_not_block_timer() {
        let query = query("y0 >= 1.5");
        let expired = tokio::time::timeout(Duration::ZERO, Never.precheck(&query)).await;
        assert!(expired.is_err());
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(AttemptOutcome::Unsat.label(), "UNSAT");
        assert_eq!(AttemptOutcome::Sat(Witness::new(vec![0.0])).label(), "SAT");
        assert_eq!(AttemptOutcome::Timeout.label(), "TIMEOUT");
        assert_eq!(AttemptOutcome::Error("boom".into()).label(), "ERROR");
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(AttemptOutcome::Sat(Witness::new(vec![0.5]))).unwrap();
        assert_eq!(json["kind"], "SAT");
        assert_eq!(json["detail"]["inputs"][0], 0.5);
        assert!(json["detail"].get("outputs").is_none());
        let json = serde_json::to_value(AttemptOutcome::Timeout).unwrap();
        assert_eq!(json["kind"], "TIMEOUT");
    }

    #[test]
    fn test_solver_config_defaults() {
        let config: SolverConfig = serde_json::from_str(r#"{"binary": "cvc5"}"#).unwrap();
        assert_eq!(config.binary, "cvc5");
        assert_eq!(config.args, vec!["-in"]);
        assert!(config.produce_models);
        assert_eq!(config.tightening_rounds, DEFAULT_TIGHTENING_ROUNDS);
    }
}
