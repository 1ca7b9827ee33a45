//! Bound tightening without case splitting.
//!
//! Every linear relation and predicate constraint is viewed as a row
//! `lower <= Σ aᵢ·vᵢ <= upper` and each variable is tightened against the
//! interval of the remaining terms. ReLU constraints are tightened in both
//! directions. A variable whose interval becomes empty proves the constraint
//! system infeasible.
//!
//! Arithmetic is in floating point while the constraints are exact, so every
//! derived bound is relaxed by [`ROUNDING_SLACK`] relative to the magnitudes
//! involved, and emptiness is only declared when the gap exceeds that slack.

use crate::query::{Query, VarId};
use cegar_core::{Bound, Comparison, Conjunction, LinearConstraint};
use tracing::debug;

/// Relative slack for bounds derived from a row or a ReLU.
pub const ROUNDING_SLACK: f64 = 1e-9;

fn slack(magnitude: f64) -> f64 {
    ROUNDING_SLACK * (1.0 + magnitude)
}

/// Outcome of the bound-tightening pre-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecheckVerdict {
    /// The query has no solution; the property holds.
    Infeasible,
    /// Tightening alone could not decide the query.
    Inconclusive,
}

/// Tightened variable bounds, or proof of infeasibility.
#[derive(Debug, Clone, PartialEq)]
pub enum Tightened {
    Bounds(Vec<Bound>),
    Infeasible { var: VarId },
}

/// `lower <= Σ terms <= upper`.
#[derive(Debug, Clone)]
struct Row {
    terms: Vec<(VarId, f64)>,
    lower: f64,
    upper: f64,
}

fn relation_rows(query: &Query) -> Vec<Row> {
    query
        .relations
        .iter()
        .map(|r| {
            // target - Σ terms = constant
            let mut terms = Vec::with_capacity(r.terms.len() + 1);
            terms.push((r.target, 1.0));
            terms.extend(r.terms.iter().map(|&(v, c)| (v, -c)));
            Row {
                terms,
                lower: r.constant,
                upper: r.constant,
            }
        })
        .collect()
}

fn constraint_row(query: &Query, c: &LinearConstraint) -> Option<Row> {
    let mut terms = Vec::with_capacity(c.terms.len());
    for t in &c.terms {
        terms.push((query.var_of(t.var)?, t.coeff));
    }
    // Strict comparisons are relaxed to their closure.
    let (lower, upper) = match c.cmp {
        Comparison::Le | Comparison::Lt => (f64::NEG_INFINITY, c.rhs),
        Comparison::Ge | Comparison::Gt => (c.rhs, f64::INFINITY),
    };
    Some(Row {
        terms,
        lower,
        upper,
    })
}

/// Sum of interval endpoints that tracks infinite contributions separately so
/// a single term can be removed again.
#[derive(Default)]
struct EndpointSum {
    finite: f64,
    infinite: usize,
}

impl EndpointSum {
    fn add(&mut self, v: f64) {
        if v.is_infinite() {
            self.infinite += 1;
        } else {
            self.finite += v;
        }
    }

    fn total(&self, sign: f64) -> f64 {
        if self.infinite > 0 {
            sign * f64::INFINITY
        } else {
            self.finite
        }
    }

    fn without(&self, v: f64, sign: f64) -> f64 {
        if v.is_infinite() {
            if self.infinite > 1 {
                sign * f64::INFINITY
            } else {
                self.finite
            }
        } else if self.infinite > 0 {
            sign * f64::INFINITY
        } else {
            self.finite - v
        }
    }
}

fn term_interval(bounds: &[Bound], var: VarId, coeff: f64) -> Bound {
    if coeff == 0.0 {
        Bound::concrete(0.0)
    } else {
        bounds[var].scale(coeff)
    }
}

/// Sum of the finite magnitudes in `values`.
fn magnitude(values: impl IntoIterator<Item = f64>) -> f64 {
    values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold(0.0, |acc, v| acc + v.abs())
}

/// Tighten every variable of a row. Returns `Err(var)` on an empty interval.
fn tighten_row(bounds: &mut [Bound], row: &Row) -> Result<bool, VarId> {
    let intervals: Vec<Bound> = row
        .terms
        .iter()
        .map(|&(v, c)| term_interval(bounds, v, c))
        .collect();
    let mut lo = EndpointSum::default();
    let mut hi = EndpointSum::default();
    for iv in &intervals {
        lo.add(iv.lower);
        hi.add(iv.upper);
    }
    let tol = slack(magnitude(
        intervals
            .iter()
            .flat_map(|iv| [iv.lower, iv.upper])
            .chain([row.lower, row.upper]),
    ));
    if lo.total(-1.0) > row.upper + tol || hi.total(1.0) < row.lower - tol {
        return Err(row.terms.first().map_or(0, |t| t.0));
    }

    let mut changed = false;
    for (&(var, coeff), iv) in row.terms.iter().zip(&intervals) {
        if coeff == 0.0 {
            continue;
        }
        let rest_lo = lo.without(iv.lower, -1.0);
        let rest_hi = hi.without(iv.upper, 1.0);
        // coeff·var ∈ [row.lower - rest_hi - tol, row.upper - rest_lo + tol]
        let scaled = Bound {
            lower: row.lower - rest_hi - tol,
            upper: row.upper - rest_lo + tol,
        };
        let candidate = if coeff > 0.0 {
            Bound {
                lower: scaled.lower / coeff,
                upper: scaled.upper / coeff,
            }
        } else {
            Bound {
                lower: scaled.upper / coeff,
                upper: scaled.lower / coeff,
            }
        };
        if narrow(bounds, var, candidate)? {
            changed = true;
        }
    }
    Ok(changed)
}

/// Intersect `bounds[var]` with `candidate`. A gap within rounding slack
/// leaves the variable untouched; a wider one is a contradiction.
fn narrow(bounds: &mut [Bound], var: VarId, candidate: Bound) -> Result<bool, VarId> {
    let current = bounds[var];
    let lower = if candidate.lower.is_nan() {
        current.lower
    } else {
        current.lower.max(candidate.lower)
    };
    let upper = if candidate.upper.is_nan() {
        current.upper
    } else {
        current.upper.min(candidate.upper)
    };
    if lower > upper {
        if lower - upper > slack(magnitude([lower, upper])) {
            return Err(var);
        }
        return Ok(false);
    }
    if lower > current.lower || upper < current.upper {
        bounds[var] = Bound { lower, upper };
        return Ok(true);
    }
    Ok(false)
}

/// `y = max(0, x)` in both directions.
fn tighten_relu(bounds: &mut [Bound], input: VarId, output: VarId) -> Result<bool, VarId> {
    let mut changed = narrow(bounds, output, bounds[input].relu())?;
    let y = bounds[output];
    // y >= x, and y > 0 forces x = y.
    let x_candidate = Bound {
        lower: if y.lower > 0.0 { y.lower } else { f64::NEG_INFINITY },
        upper: y.upper,
    };
    changed |= narrow(bounds, input, x_candidate)?;
    Ok(changed)
}

fn run_rounds(
    bounds: &mut [Bound],
    rows: &[Row],
    query: &Query,
    rounds: usize,
) -> Result<(), VarId> {
    for _ in 0..rounds {
        let mut changed = false;
        for row in rows {
            changed |= tighten_row(bounds, row)?;
        }
        for relu in &query.relus {
            changed |= tighten_relu(bounds, relu.input, relu.output)?;
        }
        if !changed {
            break;
        }
    }
    Ok(())
}

/// Tighten the bounds of every query variable for up to `rounds` passes.
pub fn tighten_bounds(query: &Query, rounds: usize) -> Tightened {
    let mut bounds: Vec<Bound> = query.variables.iter().map(|v| v.bound).collect();
    let rows = relation_rows(query);
    match run_rounds(&mut bounds, &rows, query, rounds) {
        Ok(()) => Tightened::Bounds(bounds),
        Err(var) => Tightened::Infeasible { var },
    }
}

fn disjunct_feasible(
    query: &Query,
    base: &[Bound],
    rows: &[Row],
    conj: &Conjunction,
    rounds: usize,
) -> bool {
    let mut extra = Vec::with_capacity(conj.0.len());
    for c in &conj.0 {
        match constraint_row(query, c) {
            Some(row) => extra.push(row),
            // A constraint on a variable the query lacks can never hold.
            None => return false,
        }
    }
    let mut bounds = base.to_vec();
    let all_rows: Vec<Row> = rows.iter().cloned().chain(extra).collect();
    run_rounds(&mut bounds, &all_rows, query, rounds).is_ok()
}

/// Decide, by tightening alone, whether the violation predicate can hold.
///
/// Each disjunct is conjoined with the query and tightened independently;
/// the query is infeasible iff every disjunct yields an empty interval.
pub fn precheck_query(query: &Query, rounds: usize) -> PrecheckVerdict {
    let rows = relation_rows(query);
    let mut base: Vec<Bound> = query.variables.iter().map(|v| v.bound).collect();
    if let Err(var) = run_rounds(&mut base, &rows, query, rounds) {
        debug!(var, "Query infeasible before predicate");
        return PrecheckVerdict::Infeasible;
    }
    let open = query
        .violation
        .disjuncts
        .iter()
        .filter(|conj| disjunct_feasible(query, &base, &rows, conj, rounds))
        .count();
    debug!(
        disjuncts = query.violation.disjuncts.len(),
        open, "Bound-tightening precheck"
    );
    if open == 0 {
        PrecheckVerdict::Infeasible
    } else {
        PrecheckVerdict::Inconclusive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::QueryBuilder;
    use cegar_core::{
        Activation, Bound, Comparison, Conjunction, Layer, LinearConstraint, Network,
        OutputPredicate, Property, Term, VarRef,
    };
    use ndarray::{arr1, arr2};

    /// y0 = relu(x0) + 1, y1 = -relu(x0)
    fn network() -> Network {
        let h = Layer::new(arr2(&[[1.0]]), arr1(&[0.0]), Activation::Relu).unwrap();
        let out = Layer::new(arr2(&[[1.0], [-1.0]]), arr1(&[1.0, 0.0]), Activation::Identity)
            .unwrap();
        Network::new(vec![h, out]).unwrap()
    }

    /// `Σ coeff·y_j cmp rhs` as a single-disjunct predicate.
    fn predicate(terms: &[(f64, usize)], cmp: Comparison, rhs: f64) -> OutputPredicate {
        let terms = terms
            .iter()
            .map(|&(coeff, j)| Term {
                coeff,
                var: VarRef::Output(j),
            })
            .collect();
        OutputPredicate {
            disjuncts: vec![Conjunction(vec![LinearConstraint::new(terms, cmp, rhs)])],
        }
    }

    #[test]
    fn test_precheck_proves_robust() {
        let net = network();
        // y1 >= y0 is impossible: y0 - y1 = 2 relu(x0) + 1 >= 1.
        let prop = Property::robustness(&[0.0], 0.5, 0, 2, None).unwrap();
        let builder = QueryBuilder::new(&net, &prop).unwrap();
        let (query, _) = builder.build_full().unwrap();
        assert_eq!(precheck_query(&query, 4), PrecheckVerdict::Infeasible);
    }

    #[test]
    fn test_precheck_inconclusive_when_violable() {
        let net = network();
        let prop = Property::new(
            vec![Bound::new(-1.0, 1.0)],
            "y0 >= 1.5".parse().unwrap(),
        );
        let builder = QueryBuilder::new(&net, &prop).unwrap();
        let (query, _) = builder.build_full().unwrap();
        assert_eq!(precheck_query(&query, 4), PrecheckVerdict::Inconclusive);
    }

    #[test]
    fn test_precheck_disjunction_needs_every_branch_closed() {
        let net = network();
        let prop = Property::new(
            vec![Bound::new(-1.0, 1.0)],
            "y0 <= 0.5 || y1 >= 0.5".parse().unwrap(),
        );
        let builder = QueryBuilder::new(&net, &prop).unwrap();
        let (query, _) = builder.build_full().unwrap();
        // y0 in [1, 2], y1 in [-1, 0]: both branches closed.
        assert_eq!(precheck_query(&query, 4), PrecheckVerdict::Infeasible);

        let prop = Property::new(
            vec![Bound::new(-1.0, 1.0)],
            "y0 <= 0.5 || y1 <= -0.5".parse().unwrap(),
        );
        let builder = QueryBuilder::new(&net, &prop).unwrap();
        let (query, _) = builder.build_full().unwrap();
        assert_eq!(precheck_query(&query, 4), PrecheckVerdict::Inconclusive);
    }

    #[test]
    fn test_tighten_backward_through_relu() {
        let net = network();
        let prop = Property::new(vec![Bound::new(-1.0, 1.0)], "y0 >= 0".parse().unwrap());
        let builder = QueryBuilder::new(&net, &prop).unwrap();
        let (mut query, _) = builder.build_full().unwrap();
        // Force y0 <= 1.25, which caps relu(x0) and hence x0 at 0.25.
        let y0 = query.outputs[0];
        query.variables[y0].bound.upper = 1.25;
        match tighten_bounds(&query, 8) {
            Tightened::Bounds(b) => {
                assert!((b[query.inputs[0]].upper - 0.25).abs() < 1e-6);
            }
            Tightened::Infeasible { .. } => panic!("query should be feasible"),
        }
    }

    #[test]
    fn test_tighten_detects_contradiction() {
        let net = network();
        let prop = Property::new(vec![Bound::new(-1.0, 1.0)], "y0 >= 0".parse().unwrap());
        let builder = QueryBuilder::new(&net, &prop).unwrap();
        let (mut query, _) = builder.build_full().unwrap();
        let y1 = query.outputs[1];
        // y1 = -relu(x0) <= 0 but we demand y1 in [0.5, 1].
        query.variables[y1].bound = Bound::new(0.5, 1.0);
        assert!(matches!(tighten_bounds(&query, 4), Tightened::Infeasible { .. }));
    }

    #[test]
    fn test_predicate_on_unknown_variable_closes_branch() {
        let net = network();
        let prop = Property::new(vec![Bound::new(-1.0, 1.0)], "y0 >= 0".parse().unwrap());
        let builder = QueryBuilder::new(&net, &prop).unwrap();
        let (mut query, _) = builder.build_full().unwrap();
        query.violation = "y7 >= 0".parse().unwrap();
        assert_eq!(precheck_query(&query, 2), PrecheckVerdict::Infeasible);
    }

    #[test]
    fn test_point_box_with_inexact_weights_stays_open() {
        // y0 = 0.1·x0 + 0.2 does not round to 0.3 at x0 = 1.
        let layer = Layer::new(arr2(&[[0.1]]), arr1(&[0.2]), Activation::Identity).unwrap();
        let net = Network::new(vec![layer]).unwrap();
        let y = net.evaluate(&[1.0]).unwrap()[0];
        for (cmp, rhs) in [(Comparison::Ge, 0.0), (Comparison::Ge, y), (Comparison::Le, y)] {
            let prop = Property::new(vec![Bound::concrete(1.0)], predicate(&[(1.0, 0)], cmp, rhs));
            let builder = QueryBuilder::new(&net, &prop).unwrap();
            let (query, _) = builder.build_full().unwrap();
            assert_eq!(precheck_query(&query, 4), PrecheckVerdict::Inconclusive, "{cmp:?} {rhs}");
        }
    }

    #[test]
    fn test_misclassified_point_is_not_proved_robust() {
        // y0 = 0.1·relu(x) + 0.2, y1 = 0.3·relu(x) + 0.1; class 1 wins at x = 1.
        let h = Layer::new(arr2(&[[1.0]]), arr1(&[0.0]), Activation::Relu).unwrap();
        let out = Layer::new(arr2(&[[0.1], [0.3]]), arr1(&[0.2, 0.1]), Activation::Identity)
            .unwrap();
        let net = Network::new(vec![h, out]).unwrap();
        assert_eq!(net.predicted_class(&[1.0]).unwrap(), 1);

        let prop = Property::robustness(&[1.0], 0.0, 0, 2, None).unwrap();
        let builder = QueryBuilder::new(&net, &prop).unwrap();
        let (query, _) = builder.build_full().unwrap();
        assert_eq!(precheck_query(&query, 4), PrecheckVerdict::Inconclusive);
        let (query, _) = builder.build(&Default::default()).unwrap();
        assert_eq!(precheck_query(&query, 4), PrecheckVerdict::Inconclusive);
    }

    mod properties {
        use super::*;
        use ndarray::{Array1, Array2};
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        fn weight() -> impl Strategy<Value = f64> {
            (-10i32..=10).prop_map(|k| k as f64 * 0.1)
        }

        fn radius() -> impl Strategy<Value = f64> {
            prop_oneof![Just(0.0), 0.0f64..0.5]
        }

        fn dense(weights: Vec<f64>, bias: Vec<f64>, rows: usize, activation: Activation) -> Layer {
            let cols = weights.len() / rows;
            let weights = Array2::from_shape_vec((rows, cols), weights).unwrap();
            Layer::new(weights, Array1::from(bias), activation).unwrap()
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            /// A predicate that holds at a concrete point of the box is never
            /// refuted, for the exact query or any abstraction of it.
            #[test]
            fn prop_satisfied_predicate_is_never_refuted(
                w1 in prop::collection::vec(weight(), 6),
                b1 in prop::collection::vec(weight(), 3),
                w2 in prop::collection::vec(weight(), 6),
                b2 in prop::collection::vec(weight(), 2),
                centre in prop::collection::vec(-1.0f64..1.0, 2),
                radii in prop::collection::vec(radius(), 2),
                along in prop::collection::vec(0.0f64..=1.0, 2),
                kind in 0usize..3,
                j in 0usize..2,
                kept in 0usize..=3,
            ) {
                let net = Network::new(vec![
                    dense(w1, b1, 3, Activation::Relu),
                    dense(w2, b2, 2, Activation::Identity),
                ])
                .unwrap();
                let input_bounds: Vec<Bound> = centre
                    .iter()
                    .zip(&radii)
                    .map(|(&c, &r)| Bound::new(c - r, c + r))
                    .collect();
                let point: Vec<f64> = input_bounds
                    .iter()
                    .zip(&along)
                    .map(|(b, &t)| (b.lower + t * (b.upper - b.lower)).clamp(b.lower, b.upper))
                    .collect();
                let y = net.evaluate(&point).unwrap();
                let k = 1 - j;
                let violation = match kind {
                    0 => predicate(&[(1.0, j)], Comparison::Ge, y[j]),
                    1 => predicate(&[(1.0, j)], Comparison::Le, y[j]),
                    _ => predicate(&[(1.0, j), (-1.0, k)], Comparison::Ge, y[j] - y[k]),
                };
                prop_assert!(violation.holds(&point, &y));

                let prop = Property::new(input_bounds, violation);
                let builder = QueryBuilder::new(&net, &prop).unwrap();
                let (query, _) = builder.build_full().unwrap();
                prop_assert_eq!(precheck_query(&query, 4), PrecheckVerdict::Inconclusive);

                let inclusion: BTreeSet<_> =
                    net.abstractable_units().into_iter().take(kept).collect();
                let (query, _) = builder.build(&inclusion).unwrap();
                prop_assert_eq!(precheck_query(&query, 4), PrecheckVerdict::Inconclusive);
            }
        }
    }
}
