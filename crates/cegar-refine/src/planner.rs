//! Refinement planning: from a unit ranking to cumulative inclusion sets.

use crate::config::SchedulerConfig;
use crate::ranking::{strategy_for, PolicyError, PolicyRanker, RankerOptions};
use cegar_core::{Network, PolicyKind, Property, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// One step of the refinement sequence.
///
/// `inclusion` holds the abstractable units modelled exactly at this level;
/// every other abstractable unit is over-approximated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinementLevel {
    pub index: usize,
    pub inclusion: BTreeSet<UnitId>,
}

impl RefinementLevel {
    pub fn len(&self) -> usize {
        self.inclusion.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inclusion.is_empty()
    }
}

/// Turns a policy into an ordered sequence of refinement levels.
pub struct AbstractionPlanner {
    policy: PolicyKind,
    num_batches: usize,
    ranker: Box<dyn PolicyRanker>,
}

impl std::fmt::Debug for AbstractionPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbstractionPlanner")
            .field("policy", &self.policy)
            .field("num_batches", &self.num_batches)
            .finish_non_exhaustive()
    }
}

impl AbstractionPlanner {
    /// Planner using the reference ranker for `policy`.
    pub fn new(policy: PolicyKind, config: &SchedulerConfig, options: &RankerOptions) -> Self {
        let options = RankerOptions {
            seed: config.random_seed,
            ..options.clone()
        };
        Self {
            policy,
            num_batches: config.num_batches,
            ranker: strategy_for(policy, &options),
        }
    }

    /// Planner with a custom ranking strategy.
    pub fn with_ranker(ranker: Box<dyn PolicyRanker>, num_batches: usize) -> Self {
        Self {
            policy: ranker.kind(),
            num_batches,
            ranker,
        }
    }

    pub fn policy(&self) -> PolicyKind {
        self.policy
    }

    /// Compute every refinement level for a task, coarsest first.
    ///
    /// Inclusion sets grow strictly and the last one holds every abstractable
    /// unit. Vanilla, or a network without abstractable units, yields exactly
    /// one level.
    pub fn plan(
        &self,
        network: &Network,
        sample: &[f64],
        property: &Property,
    ) -> Result<Vec<RefinementLevel>, PolicyError> {
        if self.num_batches == 0 {
            return Err(PolicyError::NoBatches);
        }
        let all = network.abstractable_units();
        if !self.policy.is_abstracting() || all.is_empty() {
            return Ok(vec![RefinementLevel {
                index: 0,
                inclusion: all.into_iter().collect(),
            }]);
        }

        let ordering = self.ranker.rank(network, sample, property)?;
        check_permutation(self.policy, &ordering, &all)?;
        let levels: Vec<RefinementLevel> = partition(&ordering, self.num_batches)
            .into_iter()
            .enumerate()
            .map(|(index, inclusion)| RefinementLevel { index, inclusion })
            .collect();

        debug!(
            policy = %self.policy,
            units = all.len(),
            levels = levels.len(),
            sizes = ?levels.iter().map(RefinementLevel::len).collect::<Vec<_>>(),
            "Planned refinement levels"
        );
        Ok(levels)
    }
}

fn check_permutation(
    policy: PolicyKind,
    ordering: &[UnitId],
    all: &[UnitId],
) -> Result<(), PolicyError> {
    let expected: BTreeSet<UnitId> = all.iter().copied().collect();
    let mut seen = BTreeSet::new();
    for unit in ordering {
        if !expected.contains(unit) {
            return Err(PolicyError::NotPermutation {
                policy,
                message: format!("{unit} is not abstractable"),
            });
        }
        if !seen.insert(*unit) {
            return Err(PolicyError::NotPermutation {
                policy,
                message: format!("{unit} ranked twice"),
            });
        }
    }
    if seen.len() != expected.len() {
        return Err(PolicyError::NotPermutation {
            policy,
            message: format!("{} of {} units ranked", seen.len(), expected.len()),
        });
    }
    Ok(())
}

/// Cumulative prefixes of `ordering`: batch `k` of `b` keeps the first
/// `⌈n·k/b⌉` units. Prefixes that would not grow are dropped, so the result
/// has `min(n, b)` strictly growing sets ending with the whole ordering.
pub fn partition(ordering: &[UnitId], num_batches: usize) -> Vec<BTreeSet<UnitId>> {
    let n = ordering.len();
    let b = num_batches.max(1);
    let mut sets = Vec::new();
    let mut previous = 0;
    for k in 1..=b {
        let take = (n * k).div_ceil(b);
        if take > previous {
            sets.push(ordering[..take].iter().copied().collect());
            previous = take;
        }
    }
    sets
}
