//! Flat verification queries.

use cegar_core::{Bound, OutputPredicate, UnitId, VarRef};
use serde::{Deserialize, Serialize};

/// Index of a variable inside a [`Query`].
pub type VarId = usize;

/// What a query variable stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarKind {
    /// Network input `i`.
    Input(usize),
    /// Pre-activation value of an exactly modelled ReLU unit.
    Pre(UnitId),
    /// Post-activation value of an exactly modelled unit.
    Post(UnitId),
    /// Free variable standing in for an abstracted unit's output.
    Abstracted(UnitId),
    /// Network output `j`.
    Output(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub kind: VarKind,
    pub bound: Bound,
}

impl Variable {
    /// Solver-facing name of the variable.
    pub fn name(&self) -> String {
        match self.kind {
            VarKind::Input(i) => format!("x_{i}"),
            VarKind::Pre(u) => format!("p_{}_{}", u.layer, u.unit),
            VarKind::Post(u) => format!("h_{}_{}", u.layer, u.unit),
            VarKind::Abstracted(u) => format!("a_{}_{}", u.layer, u.unit),
            VarKind::Output(j) => format!("y_{j}"),
        }
    }
}

/// `target = Σ coeff·var + constant`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearRelation {
    pub target: VarId,
    pub terms: Vec<(VarId, f64)>,
    pub constant: f64,
}

/// `output = max(0, input)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReluConstraint {
    pub input: VarId,
    pub output: VarId,
}

/// Size of a query, reported per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    pub num_variables: usize,
    pub num_relations: usize,
    pub num_piecewise_linear_constraints: usize,
}

/// A complete verification query. Satisfiable iff the (abstracted) network
/// admits an input in the box whose output satisfies the violation predicate.
///
/// Queries are immutable once handed to a solver; every attempt owns its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub variables: Vec<Variable>,
    pub relations: Vec<LinearRelation>,
    pub relus: Vec<ReluConstraint>,
    /// Variable of each network input, in order.
    pub inputs: Vec<VarId>,
    /// Variable of each network output, in order.
    pub outputs: Vec<VarId>,
    pub violation: OutputPredicate,
}

impl Query {
    pub fn stats(&self) -> QueryStats {
        QueryStats {
            num_variables: self.variables.len(),
            num_relations: self.relations.len(),
            num_piecewise_linear_constraints: self.relus.len(),
        }
    }

    /// Variable backing a predicate reference.
    pub fn var_of(&self, var: VarRef) -> Option<VarId> {
        match var {
            VarRef::Input(i) => self.inputs.get(i).copied(),
            VarRef::Output(j) => self.outputs.get(j).copied(),
        }
    }

    pub fn names(&self, ids: &[VarId]) -> Vec<String> {
        ids.iter().map(|&id| self.variables[id].name()).collect()
    }

    /// Number of free variables standing in for abstracted units.
    pub fn num_abstracted(&self) -> usize {
        self.variables
            .iter()
            .filter(|v| matches!(v.kind, VarKind::Abstracted(_)))
            .count()
    }
}

/// Fold sign-stable ReLU constraints into linear relations.
///
/// A ReLU whose input bound is non-negative becomes `output = input`; one
/// whose input bound is non-positive becomes `output = 0`. The feasible
/// region is unchanged.
pub fn simplify(query: &Query) -> Query {
    let mut out = query.clone();
    out.relus.clear();
    for relu in &query.relus {
        let b = query.variables[relu.input].bound;
        if b.lower >= 0.0 {
            out.relations.push(LinearRelation {
                target: relu.output,
                terms: vec![(relu.input, 1.0)],
                constant: 0.0,
            });
        } else if b.upper <= 0.0 {
            out.relations.push(LinearRelation {
                target: relu.output,
                terms: Vec::new(),
                constant: 0.0,
            });
        } else {
            out.relus.push(*relu);
        }
    }
    out
}
