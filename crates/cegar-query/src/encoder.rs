//! SMT-LIB rendering of verification queries.
//!
//! Queries are encoded in QF_LRA. ReLU constraints use an `ite` term, so the
//! script is exact for the units that were kept; abstracted units appear only
//! as bounded free reals.
//!
//! Only input and abstracted variables get interval asserts. Every other
//! variable is pinned by an exact relation, and its floating point bounds
//! could contradict the rational value of that relation.

use crate::query::{Query, VarKind};
use crate::{QueryError, Result};
use cegar_core::{Conjunction, LinearConstraint};
use std::fmt::Write as _;

/// A complete SMT-LIB script for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct SmtScript {
    pub text: String,
    /// Names of the network input variables, for reading back a model.
    pub input_names: Vec<String>,
    /// Names of the network output variables.
    pub output_names: Vec<String>,
}

/// Render a real constant. SMT-LIB has no negative literals and no exponent
/// notation, so `-0.5` becomes `(- 0.5)`.
fn real(value: f64) -> Result<String> {
    if !value.is_finite() {
        return Err(QueryError::Encoding(format!("non-finite constant {value}")));
    }
    let mut text = format!("{}", value.abs());
    if !text.contains('.') {
        text.push_str(".0");
    }
    if value < 0.0 {
        Ok(format!("(- {text})"))
    } else {
        Ok(text)
    }
}

fn product(coeff: f64, name: &str) -> Result<String> {
    if coeff == 1.0 {
        Ok(name.to_string())
    } else {
        Ok(format!("(* {} {})", real(coeff)?, name))
    }
}

fn sum(mut terms: Vec<String>) -> String {
    match terms.len() {
        0 => "0.0".to_string(),
        1 => terms.remove(0),
        _ => format!("(+ {})", terms.join(" ")),
    }
}

fn constraint_term(query: &Query, c: &LinearConstraint) -> Result<String> {
    let mut terms = Vec::with_capacity(c.terms.len());
    for t in &c.terms {
        let id = query.var_of(t.var).ok_or_else(|| {
            QueryError::Encoding(format!("predicate references unknown variable {}", t.var))
        })?;
        terms.push(product(t.coeff, &query.variables[id].name())?);
    }
    Ok(format!("({} {} {})", c.cmp.symbol(), sum(terms), real(c.rhs)?))
}

fn conjunction_term(query: &Query, conj: &Conjunction) -> Result<String> {
    let mut parts = conj
        .0
        .iter()
        .map(|c| constraint_term(query, c))
        .collect::<Result<Vec<_>>>()?;
    Ok(match parts.len() {
        0 => "true".to_string(),
        1 => parts.remove(0),
        _ => format!("(and {})", parts.join(" ")),
    })
}

/// Encode a query as an SMT-LIB script ending in `(check-sat)`.
///
/// With `produce_models` the script also requests the model, which the
/// caller reads back with [`crate::parse_model`].
pub fn encode_smtlib(query: &Query, produce_models: bool) -> Result<SmtScript> {
    let mut text = String::new();
    if produce_models {
        text.push_str("(set-option :produce-models true)\n");
    }
    text.push_str("(set-logic QF_LRA)\n");

    let names: Vec<String> = query.variables.iter().map(|v| v.name()).collect();
    for name in &names {
        let _ = writeln!(text, "(declare-const {name} Real)");
    }

    for (name, var) in names.iter().zip(&query.variables) {
        if !matches!(var.kind, VarKind::Input(_) | VarKind::Abstracted(_)) {
            continue;
        }
        if var.bound.lower.is_finite() {
            let _ = writeln!(text, "(assert (>= {} {}))", name, real(var.bound.lower)?);
        }
        if var.bound.upper.is_finite() {
            let _ = writeln!(text, "(assert (<= {} {}))", name, real(var.bound.upper)?);
        }
    }

    for rel in &query.relations {
        let mut terms = rel
            .terms
            .iter()
            .map(|&(v, c)| product(c, &names[v]))
            .collect::<Result<Vec<_>>>()?;
        if rel.constant != 0.0 {
            terms.push(real(rel.constant)?);
        }
        let _ = writeln!(text, "(assert (= {} {}))", names[rel.target], sum(terms));
    }

    for relu in &query.relus {
        let x = &names[relu.input];
        let _ = writeln!(
            text,
            "(assert (= {} (ite (>= {x} 0.0) {x} 0.0)))",
            names[relu.output]
        );
    }

    let mut disjuncts = query
        .violation
        .disjuncts
        .iter()
        .map(|conj| conjunction_term(query, conj))
        .collect::<Result<Vec<_>>>()?;
    let violation = match disjuncts.len() {
        0 => "false".to_string(),
        1 => disjuncts.remove(0),
        _ => format!("(or {})", disjuncts.join(" ")),
    };
    let _ = writeln!(text, "(assert {violation})");

    text.push_str("(check-sat)\n");
    if produce_models {
        text.push_str("(get-model)\n");
    }

    Ok(SmtScript {
        text,
        input_names: query.names(&query.inputs),
        output_names: query.names(&query.outputs),
    })
}
