//! Concrete re-checking of solver witnesses.

use cegar_core::{Network, Property};
use cegar_solver::Witness;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Verdict on a witness from an abstract query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Validation {
    /// The exact network violates the property on the witness input.
    Genuine,
    /// The witness is an artifact of the over-approximation.
    Spurious,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Witness has {got} inputs but the network has {expected}")]
    Arity { expected: usize, got: usize },

    #[error("Witness input {index} is not finite")]
    NonFinite { index: usize },

    #[error("Evaluation failed: {0}")]
    Evaluation(String),
}

/// Checks witnesses against the concrete network.
#[derive(Debug, Clone, Copy)]
pub struct WitnessValidator {
    input_tolerance: f64,
}

impl Default for WitnessValidator {
    fn default() -> Self {
        Self::new(1e-6)
    }
}

impl WitnessValidator {
    pub fn new(input_tolerance: f64) -> Self {
        Self { input_tolerance }
    }

    /// Genuine iff the witness input lies in the input box and the exact
    /// network output satisfies the violation predicate.
    pub fn validate(
        &self,
        network: &Network,
        property: &Property,
        witness: &Witness,
    ) -> Result<Validation, ValidationError> {
        let input = &witness.inputs;
        if input.len() != network.input_dim() {
            return Err(ValidationError::Arity {
                expected: network.input_dim(),
                got: input.len(),
            });
        }
        if let Some(index) = input.iter().position(|v| !v.is_finite()) {
            return Err(ValidationError::NonFinite { index });
        }

        if !property.contains_input(input, self.input_tolerance) {
            debug!(?input, "Witness lies outside the input box");
            return Ok(Validation::Spurious);
        }

        let output = network
            .evaluate(input)
            .map_err(|e| ValidationError::Evaluation(e.to_string()))?;
        let verdict = if property.violation.holds(input, &output) {
            Validation::Genuine
        } else {
            Validation::Spurious
        };
        debug!(?output, ?verdict, "Validated witness");
        Ok(verdict)
    }
}
