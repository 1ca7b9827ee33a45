//! Core types for CEGAR-based robustness verification.
//!
//! This crate provides the foundational data model shared by the query
//! builder, the solver boundary and the refinement scheduler:
//! - [`Bound`]: scalar intervals used for input regions and propagated bounds
//! - [`Network`]: dense feed-forward networks with identity/ReLU activations
//! - [`Property`]: an input box plus a linear violation predicate
//! - [`VerificationTask`]: one (network, sample, policy) verification job

pub mod network;
pub mod property;
pub mod task;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use network::{Activation, Layer, Network, NetworkFile, UnitId};
pub use property::{
    Comparison, Conjunction, LinearConstraint, OutputPredicate, Property, PropertyFile, Term,
    VarRef,
};
pub use task::{PolicyKind, VerificationTask};

/// A bound on a scalar value: [lower, upper].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub lower: f64,
    pub upper: f64,
}

impl Bound {
    /// Create a new bound.
    #[inline]
    pub fn new(lower: f64, upper: f64) -> Self {
        debug_assert!(lower <= upper, "Invalid bound: {lower} > {upper}");
        Self { lower, upper }
    }

    /// Create a concrete (point) bound.
    #[inline]
    pub fn concrete(value: f64) -> Self {
        Self {
            lower: value,
            upper: value,
        }
    }

    /// The unbounded interval (-inf, +inf).
    #[inline]
    pub fn unbounded() -> Self {
        Self {
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    /// Check containment with a symmetric tolerance.
    #[inline]
    pub fn contains_with_tolerance(&self, value: f64, tolerance: f64) -> bool {
        self.lower - tolerance <= value && value <= self.upper + tolerance
    }

    /// Check if bounds have exploded to infinity.
    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.lower.is_infinite() || self.upper.is_infinite()
    }

    /// Intersect two bounds.
    #[inline]
    pub fn intersect(&self, other: &Bound) -> Option<Bound> {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper);
        if lower <= upper {
            Some(Bound { lower, upper })
        } else {
            None
        }
    }

    /// Move both endpoints outward by `pad`.
    #[inline]
    pub fn widen(&self, pad: f64) -> Bound {
        Bound {
            lower: self.lower - pad,
            upper: self.upper + pad,
        }
    }

    /// Interval image of `max(0, x)`.
    #[inline]
    pub fn relu(&self) -> Bound {
        Bound {
            lower: self.lower.max(0.0),
            upper: self.upper.max(0.0),
        }
    }

    /// Interval image of `c * x`.
    #[inline]
    pub fn scale(&self, c: f64) -> Bound {
        if c >= 0.0 {
            Bound {
                lower: c * self.lower,
                upper: c * self.upper,
            }
        } else {
            Bound {
                lower: c * self.upper,
                upper: c * self.lower,
            }
        }
    }
}

/// Error types for network, property and task construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    #[error("Invalid property: {0}")]
    InvalidProperty(String),

    #[error("Predicate parse error at column {column}: {message}")]
    Parse { column: usize, message: String },

    #[error("Failed to load {what}: {message}")]
    Load { what: String, message: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
