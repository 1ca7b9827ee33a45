//! Verification tasks and abstraction policies.

use crate::{CoreError, Network, Property, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Abstraction policy: how hidden units are ordered into refinement levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyKind {
    /// No abstraction: a single attempt on the full network.
    Vanilla,
    /// Units nearest the spatial centre of their layer first.
    Centered,
    /// Units ranked by activation over all reference samples.
    AllSamplesRank,
    /// Units ranked by activation over reference samples of the sample's class.
    SingleClassRank,
    /// Units ranked by per-class votes.
    MajorityClassVote,
    /// Seeded random order.
    Random,
    /// Units ranked by activation on the verified sample itself.
    SampleRank,
}

impl PolicyKind {
    pub const ALL: [PolicyKind; 7] = [
        PolicyKind::Vanilla,
        PolicyKind::Centered,
        PolicyKind::AllSamplesRank,
        PolicyKind::SingleClassRank,
        PolicyKind::MajorityClassVote,
        PolicyKind::Random,
        PolicyKind::SampleRank,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PolicyKind::Vanilla => "Vanilla",
            PolicyKind::Centered => "Centered",
            PolicyKind::AllSamplesRank => "AllSamplesRank",
            PolicyKind::SingleClassRank => "SingleClassRank",
            PolicyKind::MajorityClassVote => "MajorityClassVote",
            PolicyKind::Random => "Random",
            PolicyKind::SampleRank => "SampleRank",
        }
    }

    /// Whether the policy abstracts at all.
    pub fn is_abstracting(self) -> bool {
        self != PolicyKind::Vanilla
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PolicyKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        PolicyKind::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                CoreError::InvalidProperty(format!(
                    "unknown policy '{s}' (expected one of: {})",
                    PolicyKind::ALL.map(PolicyKind::name).join(", ")
                ))
            })
    }
}

/// One verification job: a (network, sample, policy) triple plus budgets.
///
/// Shared immutably with the scheduler for the lifetime of the run.
#[derive(Debug, Clone)]
pub struct VerificationTask {
    pub network: Arc<Network>,
    pub property: Arc<Property>,
    /// The sample the perturbation region is centred on.
    pub sample: Vec<f64>,
    pub policy: PolicyKind,
    /// Timeout for a single solver attempt.
    pub per_attempt_timeout: Duration,
    /// Budget for the sum of all attempts.
    pub global_timeout: Duration,
}

impl VerificationTask {
    /// Create a task, checking that network, property and sample agree.
    pub fn new(
        network: Arc<Network>,
        property: Arc<Property>,
        sample: Vec<f64>,
        policy: PolicyKind,
        per_attempt_timeout: Duration,
        global_timeout: Duration,
    ) -> Result<Self> {
        property.validate(network.input_dim(), network.output_dim())?;
        if sample.len() != network.input_dim() {
            return Err(CoreError::ShapeMismatch(format!(
                "sample has {} values but network has {} inputs",
                sample.len(),
                network.input_dim()
            )));
        }
        Ok(Self {
            network,
            property,
            sample,
            policy,
            per_attempt_timeout,
            global_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Activation, Layer};
    use ndarray::{arr1, arr2};

    #[test]
    fn test_policy_roundtrip_names() {
        for p in PolicyKind::ALL {
            assert_eq!(p.name().parse::<PolicyKind>().unwrap(), p);
        }
        assert_eq!(
            "singleclassrank".parse::<PolicyKind>().unwrap(),
            PolicyKind::SingleClassRank
        );
        assert!("Greedy".parse::<PolicyKind>().is_err());
    }

    #[test]
    fn test_policy_is_abstracting() {
        assert!(!PolicyKind::Vanilla.is_abstracting());
        assert!(PolicyKind::Random.is_abstracting());
    }

    #[test]
    fn test_task_validates_sample() {
        let layer = Layer::new(arr2(&[[1.0, 1.0]]), arr1(&[0.0]), Activation::Identity).unwrap();
        let network = Arc::new(Network::new(vec![layer]).unwrap());
        let property = Arc::new(Property::new(
            vec![crate::Bound::new(0.0, 1.0); 2],
            "y0 <= 0".parse().unwrap(),
        ));
        let ok = VerificationTask::new(
            network.clone(),
            property.clone(),
            vec![0.5, 0.5],
            PolicyKind::Vanilla,
            Duration::from_secs(1),
            Duration::from_secs(2),
        );
        assert!(ok.is_ok());
        let bad = VerificationTask::new(
            network,
            property,
            vec![0.5],
            PolicyKind::Vanilla,
            Duration::from_secs(1),
            Duration::from_secs(2),
        );
        assert!(bad.is_err());
    }
}
