//! Verification queries for abstracted networks.
//!
//! A [`Query`] is a flat constraint system over real variables: linear
//! relations, piecewise-linear `max(0, x)` constraints, variable bounds and a
//! violation predicate. [`QueryBuilder`] materializes one query per inclusion
//! set; units outside the set are replaced by free variables bounded by
//! interval bound propagation, so every abstract query over-approximates the
//! exact one.
//!
//! The typical workflow is:
//! 1. Compute layer-wise interval bounds once per task ([`bounds`])
//! 2. Build a query for each refinement level ([`builder`])
//! 3. Fold stable ReLUs away ([`query::simplify`])
//! 4. Either tighten bounds in-process ([`tighten`]) or render SMT-LIB for
//!    an external solver ([`encoder`], [`model_parser`])

pub mod bounds;
pub mod builder;
pub mod encoder;
pub mod model_parser;
pub mod query;
pub mod tighten;

pub use bounds::{propagate_intervals, LayerBounds};
pub use builder::QueryBuilder;
pub use encoder::{encode_smtlib, SmtScript};
pub use model_parser::{parse_model, parse_model_to_map};
pub use query::{
    simplify, LinearRelation, Query, QueryStats, ReluConstraint, VarId, VarKind, Variable,
};
pub use tighten::{precheck_query, tighten_bounds, PrecheckVerdict, Tightened};

use cegar_core::CoreError;
use thiserror::Error;

/// Errors raised while building or encoding a query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// Malformed network or property topology; fatal for the task.
    #[error("Abstraction build failed: {0}")]
    AbstractionBuild(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl From<CoreError> for QueryError {
    fn from(e: CoreError) -> Self {
        QueryError::AbstractionBuild(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
