//! Interval bound propagation (IBP) over dense networks.
//!
//! Bounds are propagated in centre/radius form: for `y = W·x + b` with
//! `x ∈ [c - r, c + r]`, `y ∈ [W·c + b - |W|·r, W·c + b + |W|·r]`.
//! Every interval is widened by [`ROUNDING_PAD`] relative to the magnitude of
//! the terms that produced it, which absorbs floating-point rounding, so the
//! bounds contain the exact rational image of every input in the box. They
//! are used to bound abstracted units.

use crate::{QueryError, Result};
use cegar_core::{Bound, Network};
use ndarray::Array1;
use tracing::debug;

/// Relative outward padding applied to every propagated interval.
pub const ROUNDING_PAD: f64 = 1e-9;

/// Interval bounds for one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerBounds {
    /// Bounds on `W·x + b`.
    pub pre: Vec<Bound>,
    /// Bounds after the activation.
    pub post: Vec<Bound>,
}

/// Propagate an input box through every layer of the network.
pub fn propagate_intervals(network: &Network, input: &[Bound]) -> Result<Vec<LayerBounds>> {
    if input.len() != network.input_dim() {
        return Err(QueryError::AbstractionBuild(format!(
            "input box has {} dimensions but network has {} inputs",
            input.len(),
            network.input_dim()
        )));
    }
    if let Some((idx, b)) = input
        .iter()
        .enumerate()
        .find(|(_, b)| {
            b.is_unbounded() || b.lower.is_nan() || b.upper.is_nan() || b.lower > b.upper
        })
    {
        return Err(QueryError::AbstractionBuild(format!(
            "input {idx} has invalid bound [{}, {}]",
            b.lower, b.upper
        )));
    }

    let mut center: Array1<f64> = input.iter().map(|b| 0.5 * (b.lower + b.upper)).collect();
    let mut radius: Array1<f64> = input.iter().map(|b| 0.5 * (b.upper - b.lower)).collect();
    let mut out = Vec::with_capacity(network.num_layers());

    for (idx, layer) in network.layers().iter().enumerate() {
        let abs_weights = layer.weights.mapv(f64::abs);
        let mid = layer.weights.dot(&center) + &layer.bias;
        let rad = abs_weights.dot(&radius);
        // Largest magnitude any partial sum can reach; rounding error is a
        // small multiple of it.
        let scale = abs_weights.dot(&center.mapv(f64::abs)) + layer.bias.mapv(f64::abs) + &rad;

        let pre: Vec<Bound> = mid
            .iter()
            .zip(rad.iter())
            .zip(scale.iter())
            .map(|((&m, &r), &s)| Bound::new(m - r, m + r).widen(ROUNDING_PAD * s))
            .collect();
        let post: Vec<Bound> = match layer.activation {
            cegar_core::Activation::Identity => pre.clone(),
            cegar_core::Activation::Relu => pre.iter().map(Bound::relu).collect(),
        };

        let unstable = pre.iter().filter(|b| b.lower < 0.0 && b.upper > 0.0).count();
        debug!(layer = idx, units = pre.len(), unstable, "IBP layer bounds");

        center = post.iter().map(|b| 0.5 * (b.lower + b.upper)).collect();
        radius = post.iter().map(|b| 0.5 * (b.upper - b.lower)).collect();
        out.push(LayerBounds { pre, post });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cegar_core::{Activation, Layer};
    use ndarray::{arr1, arr2};
    use proptest::prelude::*;

    /// Allowed distance between a padded bound and its hand-computed value.
    const PAD_TOLERANCE: f64 = 1e-6;

    fn assert_close(b: Bound, lower: f64, upper: f64) {
        assert!(
            b.lower <= lower && upper <= b.upper,
            "[{}, {}] misses [{lower}, {upper}]",
            b.lower,
            b.upper
        );
        assert!(lower - b.lower < PAD_TOLERANCE && b.upper - upper < PAD_TOLERANCE);
    }

    fn network() -> Network {
        let hidden = Layer::new(
            arr2(&[[1.0, -1.0], [2.0, 1.0]]),
            arr1(&[0.0, -0.5]),
            Activation::Relu,
        )
        .unwrap();
        let out = Layer::new(arr2(&[[1.0, -1.0]]), arr1(&[0.25]), Activation::Identity).unwrap();
        Network::new(vec![hidden, out]).unwrap()
    }

    #[test]
    fn test_ibp_hand_computed() {
        let net = network();
        let input = [Bound::new(0.0, 1.0), Bound::new(0.0, 1.0)];
        let bounds = propagate_intervals(&net, &input).unwrap();
        // unit 0: x0 - x1 in [-1, 1]; unit 1: 2x0 + x1 - 0.5 in [-0.5, 2.5]
        assert_close(bounds[0].pre[0], -1.0, 1.0);
        assert_close(bounds[0].pre[1], -0.5, 2.5);
        assert_close(bounds[0].post[1], 0.0, 2.5);
        // out: h0 - h1 + 0.25 in [0 - 2.5 + 0.25, 1 - 0 + 0.25]
        assert_close(bounds[1].pre[0], -2.25, 1.25);
    }

    #[test]
    fn test_ibp_point_input_is_exact() {
        let net = network();
        let x = [0.3, 0.6];
        let input = [Bound::concrete(x[0]), Bound::concrete(x[1])];
        let bounds = propagate_intervals(&net, &input).unwrap();
        let y = net.evaluate(&x).unwrap();
        assert_close(bounds[1].post[0], y[0], y[0]);
    }

    #[test]
    fn test_ibp_rounds_outward() {
        // 0.1 * 1 + 0.2 is 0.30000000000000004 in floating point but 3/10
        // over the rationals; the bound must hold both.
        let layer = Layer::new(arr2(&[[0.1]]), arr1(&[0.2]), Activation::Identity).unwrap();
        let net = Network::new(vec![layer]).unwrap();
        let bounds = propagate_intervals(&net, &[Bound::concrete(1.0)]).unwrap();
        let y = bounds[0].post[0];
        assert!(y.lower < 0.3 && 0.1f64 * 1.0 + 0.2 < y.upper);
        assert!(y.upper - y.lower < PAD_TOLERANCE);
    }

    #[test]
    fn test_ibp_zero_stays_exact() {
        let layer = Layer::new(arr2(&[[0.0, 0.0]]), arr1(&[0.0]), Activation::Relu).unwrap();
        let out = Layer::new(arr2(&[[1.0]]), arr1(&[0.0]), Activation::Identity).unwrap();
        let net = Network::new(vec![layer, out]).unwrap();
        let input = [Bound::new(-1.0, 1.0), Bound::new(0.0, 2.0)];
        let bounds = propagate_intervals(&net, &input).unwrap();
        assert_eq!(bounds[0].pre[0], Bound::concrete(0.0));
    }

    #[test]
    fn test_ibp_rejects_unbounded_input() {
        let net = network();
        let err = propagate_intervals(&net, &[Bound::unbounded(), Bound::new(0.0, 1.0)]);
        assert!(matches!(err, Err(QueryError::AbstractionBuild(_))));
    }

    #[test]
    fn test_ibp_rejects_wrong_arity() {
        let net = network();
        assert!(propagate_intervals(&net, &[Bound::new(0.0, 1.0)]).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// IBP soundness: every concrete activation lies inside the layer bounds.
        #[test]
        fn soundness_ibp_dense_relu(
            a in -1.0f64..1.0, b in -1.0f64..1.0,
            ta in 0.0f64..1.0, tb in 0.0f64..1.0,
            eps in 0.0f64..0.5,
        ) {
            let net = network();
            let input = [Bound::new(a - eps, a + eps), Bound::new(b - eps, b + eps)];
            let bounds = propagate_intervals(&net, &input).unwrap();
            let x = [a - eps + 2.0 * eps * ta, b - eps + 2.0 * eps * tb];
            let acts = net.activations(&x).unwrap();
            for (layer, values) in acts.iter().enumerate() {
                for (unit, &v) in values.iter().enumerate() {
                    let bound = bounds[layer].post[unit];
                    prop_assert!(
                        bound.contains_with_tolerance(v, 0.0),
                        "layer {} unit {}: {} not in [{}, {}]",
                        layer, unit, v, bound.lower, bound.upper
                    );
                }
            }
        }
    }
}
