//! Query construction for a given inclusion set.

use crate::bounds::{propagate_intervals, LayerBounds};
use crate::query::{LinearRelation, Query, QueryStats, ReluConstraint, VarId, VarKind, Variable};
use crate::{QueryError, Result};
use cegar_core::{Activation, Bound, Network, Property, UnitId};
use std::collections::BTreeSet;
use tracing::debug;

/// Builds abstract queries for one (network, property) pair.
///
/// Interval bounds are computed once at construction and reused for every
/// inclusion set, so all levels of a task share the same bounds.
#[derive(Debug)]
pub struct QueryBuilder<'a> {
    network: &'a Network,
    property: &'a Property,
    bounds: Vec<LayerBounds>,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(network: &'a Network, property: &'a Property) -> Result<Self> {
        property.validate(network.input_dim(), network.output_dim())?;
        let bounds = propagate_intervals(network, &property.input_bounds)?;
        Ok(Self {
            network,
            property,
            bounds,
        })
    }

    pub fn layer_bounds(&self) -> &[LayerBounds] {
        &self.bounds
    }

    /// Query with every abstractable unit modelled exactly.
    pub fn build_full(&self) -> Result<(Query, QueryStats)> {
        let all: BTreeSet<UnitId> = self.network.abstractable_units().into_iter().collect();
        self.build(&all)
    }

    /// Materialize the query for an inclusion set.
    ///
    /// Units in `inclusion` keep their linear relation and ReLU constraint.
    /// Every other abstractable unit becomes a free variable bounded by its
    /// post-activation interval.
    pub fn build(&self, inclusion: &BTreeSet<UnitId>) -> Result<(Query, QueryStats)> {
        if let Some(bad) = inclusion.iter().find(|u| !self.network.is_abstractable(**u)) {
            return Err(QueryError::AbstractionBuild(format!(
                "inclusion set names {bad}, which is not an abstractable unit"
            )));
        }

        let mut variables: Vec<Variable> = Vec::new();
        let mut relations: Vec<LinearRelation> = Vec::new();
        let mut relus: Vec<ReluConstraint> = Vec::new();
        let inputs: Vec<VarId> = self
            .property
            .input_bounds
            .iter()
            .enumerate()
            .map(|(i, b)| push_var(&mut variables, VarKind::Input(i), *b))
            .collect();

        let last = self.network.num_layers() - 1;
        let mut prev = inputs.clone();
        let mut outputs = Vec::new();

        for (l, layer) in self.network.layers().iter().enumerate() {
            let lb = &self.bounds[l];
            let mut current = Vec::with_capacity(layer.units());
            for u in 0..layer.units() {
                let unit = UnitId::new(l, u);
                let relation_terms = || -> Vec<(VarId, f64)> {
                    layer
                        .weights
                        .row(u)
                        .iter()
                        .zip(prev.iter())
                        .filter(|(w, _)| **w != 0.0)
                        .map(|(w, &v)| (v, *w))
                        .collect()
                };

                let id = if l == last {
                    let id = push_var(&mut variables, VarKind::Output(u), lb.post[u]);
                    relations.push(LinearRelation {
                        target: id,
                        terms: relation_terms(),
                        constant: layer.bias[u],
                    });
                    outputs.push(id);
                    id
                } else {
                    match layer.activation {
                        Activation::Identity => {
                            let id = push_var(&mut variables, VarKind::Post(unit), lb.post[u]);
                            relations.push(LinearRelation {
                                target: id,
                                terms: relation_terms(),
                                constant: layer.bias[u],
                            });
                            id
                        }
                        Activation::Relu if inclusion.contains(&unit) => {
                            let pre = push_var(&mut variables, VarKind::Pre(unit), lb.pre[u]);
                            relations.push(LinearRelation {
                                target: pre,
                                terms: relation_terms(),
                                constant: layer.bias[u],
                            });
                            let post = push_var(&mut variables, VarKind::Post(unit), lb.post[u]);
                            relus.push(ReluConstraint {
                                input: pre,
                                output: post,
                            });
                            post
                        }
                        Activation::Relu => {
                            push_var(&mut variables, VarKind::Abstracted(unit), lb.post[u])
                        }
                    }
                };
                current.push(id);
            }
            prev = current;
        }

        let query = Query {
            variables,
            relations,
            relus,
            inputs,
            outputs,
            violation: self.property.violation.clone(),
        };
        let stats = query.stats();
        debug!(
            included = inclusion.len(),
            abstracted = query.num_abstracted(),
            variables = stats.num_variables,
            relations = stats.num_relations,
            piecewise = stats.num_piecewise_linear_constraints,
            "Built query"
        );
        Ok((query, stats))
    }
}

fn push_var(variables: &mut Vec<Variable>, kind: VarKind, bound: Bound) -> VarId {
    variables.push(Variable { kind, bound });
    variables.len() - 1
}
