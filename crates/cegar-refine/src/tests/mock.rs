//! Scripted solver and fixtures for scheduler tests.

use crate::ranking::{PolicyError, PolicyRanker};
use async_trait::async_trait;
use cegar_core::{Activation, Layer, Network, PolicyKind, Property, UnitId, VerificationTask};
use cegar_query::{precheck_query, Query, QueryStats};
use cegar_solver::{AttemptOutcome, Precheck, SolverClient, SolverError, Witness};
use ndarray::{Array1, Array2};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the scripted solver does on one `solve` call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Sleep, then return the outcome.
    After(Duration, AttemptOutcome),
    /// Sleep for the whole timeout it was given, then report a timeout.
    TimeoutAtLimit,
    /// Never return; only cancellation ends the call.
    Hang,
}

pub enum PrecheckScript {
    Fixed(Precheck),
    Fail,
    /// Never finish.
    Stall,
    /// Run the real bound-tightening pre-check.
    Tighten,
}

/// In-memory [`SolverClient`] that replays a script.
pub struct ScriptedSolver {
    precheck: PrecheckScript,
    steps: Mutex<VecDeque<Step>>,
    /// Timeout passed to every `solve` call.
    pub timeouts: Mutex<Vec<Duration>>,
    /// Stats of every query handed to `solve`.
    pub stats: Mutex<Vec<QueryStats>>,
    /// `solve` futures dropped before completion.
    pub cancelled: Arc<AtomicUsize>,
}

impl ScriptedSolver {
    pub fn new(precheck: PrecheckScript, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            precheck,
            steps: Mutex::new(steps.into()),
            timeouts: Mutex::new(Vec::new()),
            stats: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn inconclusive(steps: Vec<Step>) -> Arc<Self> {
        Self::new(PrecheckScript::Fixed(Precheck::Inconclusive), steps)
    }

    pub fn calls(&self) -> usize {
        self.timeouts.lock().unwrap().len()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().unwrap().clone()
    }
}

/// Counts a cancellation if dropped before being disarmed.
struct CancelGuard {
    counter: Arc<AtomicUsize>,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SolverClient for ScriptedSolver {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn precheck(&self, query: &Query) -> Result<Precheck, SolverError> {
        match self.precheck {
            PrecheckScript::Fixed(p) => Ok(p),
            PrecheckScript::Fail => Err(SolverError::Io("precheck unavailable".to_string())),
            PrecheckScript::Stall => std::future::pending().await,
            PrecheckScript::Tighten => Ok(precheck_query(query, 4).into()),
        }
    }

    async fn solve(&self, query: &Query, timeout: Duration) -> AttemptOutcome {
        self.timeouts.lock().unwrap().push(timeout);
        self.stats.lock().unwrap().push(query.stats());
        let step = self.steps.lock().unwrap().pop_front();
        let mut guard = CancelGuard {
            counter: self.cancelled.clone(),
            armed: true,
        };
        let outcome = match step {
            Some(Step::After(delay, outcome)) => {
                tokio::time::sleep(delay).await;
                outcome
            }
            Some(Step::TimeoutAtLimit) => {
                tokio::time::sleep(timeout).await;
                AttemptOutcome::Timeout
            }
            Some(Step::Hang) => std::future::pending().await,
            None => AttemptOutcome::Error("script exhausted".to_string()),
        };
        guard.armed = false;
        outcome
    }
}

/// Ranker that forgets a unit.
pub struct Incomplete;

impl PolicyRanker for Incomplete {
    fn kind(&self) -> PolicyKind {
        PolicyKind::SampleRank
    }

    fn rank(&self, network: &Network, _: &[f64], _: &Property) -> Result<Vec<UnitId>, PolicyError> {
        let mut units = network.abstractable_units();
        units.truncate(units.len() / 2);
        Ok(units)
    }
}

pub fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

/// Two inputs, `width` hidden ReLU units alternating between copying x0
/// and x1, and two outputs summing the x0 and x1 copies respectively.
pub fn network(width: usize) -> Network {
    let mut w1 = Array2::zeros((width, 2));
    let mut w2 = Array2::zeros((2, width));
    for u in 0..width {
        w1[[u, u % 2]] = 1.0;
        w2[[u % 2, u]] = 1.0;
    }
    let hidden = Layer::new(w1, Array1::zeros(width), Activation::Relu).unwrap();
    let out = Layer::new(w2, Array1::zeros(2), Activation::Identity).unwrap();
    Network::new(vec![hidden, out]).unwrap()
}

/// Sample (0.8, 0.2) is class 0. With `epsilon` 0.1 the property holds;
/// with 0.5 the box contains inputs classified as 1.
pub fn task(
    policy: PolicyKind,
    epsilon: f64,
    per_attempt: Duration,
    global: Duration,
) -> VerificationTask {
    let net = Arc::new(network(6));
    let sample = vec![0.8, 0.2];
    let property = Arc::new(Property::robustness(&sample, epsilon, 0, 2, None).unwrap());
    VerificationTask::new(net, property, sample, policy, per_attempt, global).unwrap()
}

/// Class 0 at the sample: spurious for the class-0 robustness property.
pub fn spurious() -> AttemptOutcome {
    AttemptOutcome::Sat(Witness::new(vec![0.8, 0.2]))
}

/// Class 1 inside the 0.5 box: genuine.
pub fn genuine() -> AttemptOutcome {
    AttemptOutcome::Sat(Witness::new(vec![0.3, 0.7]))
}
