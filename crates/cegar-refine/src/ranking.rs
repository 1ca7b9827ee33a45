//! Importance rankings of abstractable units.
//!
//! Every abstracting [`PolicyKind`] has one ranking strategy. A ranking is a
//! total order of the network's abstractable units, most important first;
//! the planner turns it into cumulative refinement levels. The strategies
//! shipped here are reference heuristics and can be replaced by any
//! [`PolicyRanker`].

use cegar_core::{Network, PolicyKind, Property, UnitId};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while ordering or partitioning units.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("{policy} ranking failed: {message}")]
    Ranking { policy: PolicyKind, message: String },

    #[error("{policy} ranking is not a permutation of the abstractable units: {message}")]
    NotPermutation { policy: PolicyKind, message: String },

    #[error("Batch count must be positive")]
    NoBatches,
}

/// Orders the abstractable units of a network, most important first.
pub trait PolicyRanker: Send + Sync {
    fn kind(&self) -> PolicyKind;

    fn rank(
        &self,
        network: &Network,
        sample: &[f64],
        property: &Property,
    ) -> Result<Vec<UnitId>, PolicyError>;
}

/// Inputs shared by the data-driven rankers.
#[derive(Debug, Clone, Default)]
pub struct RankerOptions {
    /// Seed for [`PolicyKind::Random`].
    pub seed: u64,
    /// Reference inputs (e.g. a training subset). When absent, data-driven
    /// rankers fall back to the verified sample alone.
    pub reference_samples: Option<Arc<Vec<Vec<f64>>>>,
}

/// Pick the ranking strategy for a policy. Called once per task.
pub fn strategy_for(kind: PolicyKind, options: &RankerOptions) -> Box<dyn PolicyRanker> {
    let reference = options.reference_samples.clone();
    match kind {
        PolicyKind::Vanilla => Box::new(NetworkOrder),
        PolicyKind::Centered => Box::new(Centered),
        PolicyKind::SampleRank => Box::new(SampleRank),
        PolicyKind::AllSamplesRank => Box::new(AllSamplesRank { reference }),
        PolicyKind::SingleClassRank => Box::new(SingleClassRank { reference }),
        PolicyKind::MajorityClassVote => Box::new(MajorityClassVote { reference }),
        PolicyKind::Random => Box::new(RandomOrder { seed: options.seed }),
    }
}

/// Mean absolute post-activation of every abstractable unit over `samples`,
/// in `network.abstractable_units()` order.
fn mean_activation(
    network: &Network,
    units: &[UnitId],
    samples: &[&[f64]],
) -> Result<Vec<f64>, String> {
    let per_sample: Vec<Vec<f64>> = samples
        .par_iter()
        .map(|s| {
            let acts = network.activations(s).map_err(|e| e.to_string())?;
            Ok::<Vec<f64>, String>(units.iter().map(|u| acts[u.layer][u.unit].abs()).collect())
        })
        .collect::<Result<_, String>>()?;

    let mut sums = vec![0.0; units.len()];
    for row in &per_sample {
        for (acc, v) in sums.iter_mut().zip(row) {
            *acc += v;
        }
    }
    let n = samples.len().max(1) as f64;
    Ok(sums.into_iter().map(|s| s / n).collect())
}

/// Sort units by descending score, ties by unit address.
fn by_score_desc(units: &[UnitId], scores: &[f64]) -> Vec<UnitId> {
    let mut indexed: Vec<(UnitId, f64)> =
        units.iter().copied().zip(scores.iter().copied()).collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    indexed.into_iter().map(|(u, _)| u).collect()
}

fn ranking_error(policy: PolicyKind) -> impl Fn(String) -> PolicyError {
    move |message| PolicyError::Ranking { policy, message }
}

fn reference_or_sample<'a>(
    reference: &'a Option<Arc<Vec<Vec<f64>>>>,
    sample: &'a [f64],
) -> Vec<&'a [f64]> {
    match reference {
        Some(samples) if !samples.is_empty() => samples.iter().map(Vec::as_slice).collect(),
        _ => vec![sample],
    }
}

/// Units in network order.
#[derive(Debug, Clone, Copy)]
pub struct NetworkOrder;

impl PolicyRanker for NetworkOrder {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Vanilla
    }

    fn rank(
        &self,
        network: &Network,
        _sample: &[f64],
        _property: &Property,
    ) -> Result<Vec<UnitId>, PolicyError> {
        Ok(network.abstractable_units())
    }
}

/// Units closest to the spatial centre of their layer first.
///
/// Layers with a shape use the trailing two dimensions as the spatial grid
/// (channels share a position); layers without one use the unit index.
#[derive(Debug, Clone, Copy)]
pub struct Centered;

impl Centered {
    fn distance(shape: Option<&[usize]>, units: usize, unit: usize) -> f64 {
        match shape {
            Some(dims) if dims.len() >= 2 => {
                let h = dims[dims.len() - 2];
                let w = dims[dims.len() - 1];
                let pos = unit % (h * w).max(1);
                let (row, col) = (pos / w.max(1), pos % w.max(1));
                let dr = row as f64 - (h as f64 - 1.0) / 2.0;
                let dc = col as f64 - (w as f64 - 1.0) / 2.0;
                (dr * dr + dc * dc).sqrt()
            }
            _ => (unit as f64 - (units as f64 - 1.0) / 2.0).abs(),
        }
    }
}

impl PolicyRanker for Centered {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Centered
    }

    fn rank(
        &self,
        network: &Network,
        _sample: &[f64],
        _property: &Property,
    ) -> Result<Vec<UnitId>, PolicyError> {
        let units = network.abstractable_units();
        let mut scored: Vec<(UnitId, f64)> = units
            .into_iter()
            .map(|u| {
                let layer = &network.layers()[u.layer];
                (u, Self::distance(layer.shape.as_deref(), layer.units(), u.unit))
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        Ok(scored.into_iter().map(|(u, _)| u).collect())
    }
}

/// Units most active on the verified sample first.
#[derive(Debug, Clone, Copy)]
pub struct SampleRank;

impl PolicyRanker for SampleRank {
    fn kind(&self) -> PolicyKind {
        PolicyKind::SampleRank
    }

    fn rank(
        &self,
        network: &Network,
        sample: &[f64],
        _property: &Property,
    ) -> Result<Vec<UnitId>, PolicyError> {
        let units = network.abstractable_units();
        let scores =
            mean_activation(network, &units, &[sample]).map_err(ranking_error(self.kind()))?;
        Ok(by_score_desc(&units, &scores))
    }
}

/// Units most active on average over all reference samples first.
#[derive(Debug, Clone, Default)]
pub struct AllSamplesRank {
    pub reference: Option<Arc<Vec<Vec<f64>>>>,
}

impl PolicyRanker for AllSamplesRank {
    fn kind(&self) -> PolicyKind {
        PolicyKind::AllSamplesRank
    }

    fn rank(
        &self,
        network: &Network,
        sample: &[f64],
        _property: &Property,
    ) -> Result<Vec<UnitId>, PolicyError> {
        let units = network.abstractable_units();
        let samples = reference_or_sample(&self.reference, sample);
        let scores =
            mean_activation(network, &units, &samples).map_err(ranking_error(self.kind()))?;
        Ok(by_score_desc(&units, &scores))
    }
}

/// Like [`AllSamplesRank`] but restricted to reference samples the network
/// assigns the same class as the verified sample.
#[derive(Debug, Clone, Default)]
pub struct SingleClassRank {
    pub reference: Option<Arc<Vec<Vec<f64>>>>,
}

impl PolicyRanker for SingleClassRank {
    fn kind(&self) -> PolicyKind {
        PolicyKind::SingleClassRank
    }

    fn rank(
        &self,
        network: &Network,
        sample: &[f64],
        _property: &Property,
    ) -> Result<Vec<UnitId>, PolicyError> {
        let err = ranking_error(self.kind());
        let units = network.abstractable_units();
        let class = network.predicted_class(sample).map_err(|e| err(e.to_string()))?;
        let mut same_class = Vec::new();
        for s in reference_or_sample(&self.reference, sample) {
            if network.predicted_class(s).map_err(|e| err(e.to_string()))? == class {
                same_class.push(s);
            }
        }
        if same_class.is_empty() {
            same_class.push(sample);
        }
        let scores = mean_activation(network, &units, &same_class).map_err(&err)?;
        Ok(by_score_desc(&units, &scores))
    }
}

/// Every class votes for the more active half of the units (by mean
/// activation over that class's reference samples); most votes first.
/// Ties fall back to the mean activation over all samples.
#[derive(Debug, Clone, Default)]
pub struct MajorityClassVote {
    pub reference: Option<Arc<Vec<Vec<f64>>>>,
}

impl PolicyRanker for MajorityClassVote {
    fn kind(&self) -> PolicyKind {
        PolicyKind::MajorityClassVote
    }

    fn rank(
        &self,
        network: &Network,
        sample: &[f64],
        _property: &Property,
    ) -> Result<Vec<UnitId>, PolicyError> {
        let err = ranking_error(self.kind());
        let units = network.abstractable_units();
        let samples = reference_or_sample(&self.reference, sample);

        let mut by_class: BTreeMap<usize, Vec<&[f64]>> = BTreeMap::new();
        for s in &samples {
            let class = network.predicted_class(s).map_err(|e| err(e.to_string()))?;
            by_class.entry(class).or_default().push(s);
        }

        let quota = units.len().div_ceil(2);
        let mut votes = vec![0usize; units.len()];
        for members in by_class.values() {
            let scores = mean_activation(network, &units, members).map_err(&err)?;
            let mut order: Vec<usize> = (0..units.len()).collect();
            order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
            for &idx in order.iter().take(quota) {
                votes[idx] += 1;
            }
        }

        let overall = mean_activation(network, &units, &samples).map_err(&err)?;
        let mut order: Vec<usize> = (0..units.len()).collect();
        order.sort_by(|&a, &b| {
            votes[b]
                .cmp(&votes[a])
                .then(overall[b].total_cmp(&overall[a]))
                .then(units[a].cmp(&units[b]))
        });
        Ok(order.into_iter().map(|i| units[i]).collect())
    }
}

/// Seeded random order; the same seed always gives the same order.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomOrder {
    pub seed: u64,
}

impl PolicyRanker for RandomOrder {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Random
    }

    fn rank(
        &self,
        network: &Network,
        _sample: &[f64],
        _property: &Property,
    ) -> Result<Vec<UnitId>, PolicyError> {
        let mut units = network.abstractable_units();
        let mut rng = StdRng::seed_from_u64(self.seed);
        units.shuffle(&mut rng);
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cegar_core::{Activation, Bound, Layer};
    use ndarray::{arr1, arr2, Array1, Array2};

    /// 1 input, 4 hidden units with activations 0.5x, 2x, 0, x (for x >= 0),
    /// 2 outputs.
    fn network() -> Network {
        let h = Layer::new(
            arr2(&[[0.5], [2.0], [-1.0], [1.0]]),
            arr1(&[0.0, 0.0, 0.0, 0.0]),
            Activation::Relu,
        )
        .unwrap();
        let out = Layer::new(
            arr2(&[[1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 1.0, 0.0]]),
            arr1(&[0.0, 0.0]),
            Activation::Identity,
        )
        .unwrap();
        Network::new(vec![h, out]).unwrap()
    }

    fn property() -> Property {
        Property::new(vec![Bound::new(0.0, 1.0)], "y0 >= y1".parse().unwrap())
    }

    fn u(unit: usize) -> UnitId {
        UnitId::new(0, unit)
    }

    #[test]
    fn test_sample_rank_orders_by_activation() {
        let order = SampleRank.rank(&network(), &[1.0], &property()).unwrap();
        assert_eq!(order, vec![u(1), u(3), u(0), u(2)]);
    }

    #[test]
    fn test_all_samples_falls_back_to_sample() {
        let ranker = AllSamplesRank { reference: None };
        let order = ranker.rank(&network(), &[1.0], &property()).unwrap();
        assert_eq!(order, SampleRank.rank(&network(), &[1.0], &property()).unwrap());
    }

    #[test]
    fn test_all_samples_uses_reference() {
        // On negative inputs only unit 2 fires.
        let ranker = AllSamplesRank {
            reference: Some(Arc::new(vec![vec![-1.0], vec![-2.0]])),
        };
        let order = ranker.rank(&network(), &[1.0], &property()).unwrap();
        assert_eq!(order[0], u(2));
    }

    #[test]
    fn test_single_class_filters_by_prediction() {
        // x = 1 predicts class 1 (y1 = 2 > y0 = 1.5); x = -1 also predicts
        // class 1 (y1 = 1 > y0 = 0), x = 0 ties and argmax picks class 0.
        let ranker = SingleClassRank {
            reference: Some(Arc::new(vec![vec![-1.0], vec![0.0]])),
        };
        let order = ranker.rank(&network(), &[1.0], &property()).unwrap();
        assert_eq!(order[0], u(2));
    }

    #[test]
    fn test_majority_vote_is_permutation() {
        let ranker = MajorityClassVote {
            reference: Some(Arc::new(vec![vec![1.0], vec![-1.0], vec![0.5], vec![0.0]])),
        };
        let mut order = ranker.rank(&network(), &[1.0], &property()).unwrap();
        order.sort();
        assert_eq!(order, network().abstractable_units());
    }

    #[test]
    fn test_centered_without_shape() {
        let order = Centered.rank(&network(), &[1.0], &property()).unwrap();
        // Centre of 4 units is 1.5: units 1 and 2 first.
        assert_eq!(order, vec![u(1), u(2), u(0), u(3)]);
    }

    #[test]
    fn test_centered_with_grid_shape() {
        let h = Layer::new(Array2::from_elem((9, 1), 1.0), Array1::zeros(9), Activation::Relu)
            .unwrap()
            .with_shape(vec![3, 3])
            .unwrap();
        let out = Layer::new(
            Array2::from_elem((1, 9), 1.0),
            Array1::zeros(1),
            Activation::Identity,
        )
        .unwrap();
        let net = Network::new(vec![h, out]).unwrap();
        let prop = Property::new(vec![Bound::new(0.0, 1.0)], "y0 <= 0".parse().unwrap());
        let order = Centered.rank(&net, &[0.5], &prop).unwrap();
        assert_eq!(order[0], u(4));
        // Edge midpoints before corners.
        assert_eq!(&order[1..5], &[u(1), u(3), u(5), u(7)]);
    }

    #[test]
    fn test_random_is_seeded() {
        let a = RandomOrder { seed: 7 }.rank(&network(), &[1.0], &property()).unwrap();
        let b = RandomOrder { seed: 7 }.rank(&network(), &[1.0], &property()).unwrap();
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, network().abstractable_units());
    }

    #[test]
    fn test_bad_reference_sample_is_policy_error() {
        let ranker = AllSamplesRank {
            reference: Some(Arc::new(vec![vec![1.0, 2.0]])),
        };
        assert!(matches!(
            ranker.rank(&network(), &[1.0], &property()),
            Err(PolicyError::Ranking { .. })
        ));
    }

    #[test]
    fn test_strategy_for_matches_kind() {
        let options = RankerOptions::default();
        for kind in PolicyKind::ALL {
            assert_eq!(strategy_for(kind, &options).kind(), kind);
        }
    }
}
