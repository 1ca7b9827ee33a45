//! The refinement loop.
//!
//! A run goes through three phases:
//! 1. Planning: rank units and cut the ranking into refinement levels
//! 2. Pre-check: bound tightening on the full query; infeasible means UNSAT
//!    without a single solver attempt
//! 3. Solving: one bounded attempt per level, coarsest first. UNSAT at any
//!    level is final because every level over-approximates the network.
//!    SAT is final only if the witness survives concrete evaluation;
//!    spurious witnesses and timeouts move on to the next level.
//!
//! The global budget is charged with the wall time of every attempt. An
//! attempt never gets more than what is left of it, and a solver that
//! overruns its timeout by more than the grace period is cancelled.

use crate::config::SchedulerConfig;
use crate::planner::AbstractionPlanner;
use crate::ranking::RankerOptions;
use crate::summary::{AttemptRecord, FinalResult, RunSummary, RunTrace};
use crate::validator::{Validation, WitnessValidator};
use cegar_core::{PolicyKind, VerificationTask};
use cegar_query::{simplify, QueryBuilder};
use cegar_solver::{AttemptOutcome, Precheck, SmtProcessSolver, SolverClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Drives one verification task through precheck and refinement.
///
/// Holds no per-task state; one scheduler can run many tasks, concurrently
/// or not.
#[derive(Clone)]
pub struct RefinementScheduler {
    solver: Arc<dyn SolverClient>,
    config: SchedulerConfig,
    ranker_options: RankerOptions,
}

impl std::fmt::Debug for RefinementScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefinementScheduler")
            .field("solver", &self.solver.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Bookkeeping for one run in progress.
struct Run {
    policy: PolicyKind,
    started: Instant,
    out_of: usize,
    trace: RunTrace,
}

impl Run {
    fn finish(
        self,
        final_result: FinalResult,
        counterexample: Option<Vec<f64>>,
        successful_runtime: Option<Duration>,
        message: Option<String>,
    ) -> RunSummary {
        let summary = RunSummary {
            policy: self.policy,
            final_result,
            counterexample,
            total_runtime: self.started.elapsed(),
            successful_runtime,
            num_runs: self.trace.len(),
            out_of: self.out_of,
            message,
            trace: self.trace,
        };
        info!(
            policy = %summary.policy,
            result = %summary.final_result,
            num_runs = summary.num_runs,
            out_of = summary.out_of,
            total = ?summary.total_runtime,
            "Verification finished"
        );
        summary
    }

    fn error(self, message: String) -> RunSummary {
        warn!(policy = %self.policy, %message, "Verification aborted");
        self.finish(FinalResult::Error, None, None, Some(message))
    }
}

impl RefinementScheduler {
    pub fn new(solver: Arc<dyn SolverClient>, config: SchedulerConfig) -> Self {
        Self {
            solver,
            config,
            ranker_options: RankerOptions::default(),
        }
    }

    /// Reference inputs for the data-driven rankers.
    pub fn with_reference_samples(mut self, samples: Arc<Vec<Vec<f64>>>) -> Self {
        self.ranker_options.reference_samples = Some(samples);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Planner for a task's policy, built from this scheduler's settings.
    pub fn planner_for(&self, policy: PolicyKind) -> AbstractionPlanner {
        AbstractionPlanner::new(policy, &self.config, &self.ranker_options)
    }

    /// Run a task with the reference ranker for its policy.
    pub async fn run(&self, task: &VerificationTask) -> RunSummary {
        let planner = self.planner_for(task.policy);
        self.run_with_planner(task, &planner).await
    }

    /// Run a task with a caller-supplied planner.
    pub async fn run_with_planner(
        &self,
        task: &VerificationTask,
        planner: &AbstractionPlanner,
    ) -> RunSummary {
        let mut run = Run {
            policy: task.policy,
            started: Instant::now(),
            out_of: 0,
            trace: RunTrace::default(),
        };

        let levels = match planner.plan(&task.network, &task.sample, &task.property) {
            Ok(levels) => levels,
            Err(e) => return run.error(e.to_string()),
        };
        run.out_of = levels.len();
        info!(policy = %task.policy, levels = levels.len(), "Planned refinement");

        let builder = match QueryBuilder::new(&task.network, &task.property) {
            Ok(builder) => builder,
            Err(e) => return run.error(e.to_string()),
        };

        // Pre-check on the full query.
        let full = match builder.build_full() {
            Ok((query, _)) => query,
            Err(e) => return run.error(e.to_string()),
        };
        let precheck_limit = self.config.precheck_timeout.min(task.global_timeout);
        let precheck_start = Instant::now();
        match timeout(precheck_limit, self.solver.precheck(&full)).await {
            Ok(Ok(Precheck::Infeasible)) => {
                let elapsed = precheck_start.elapsed();
                info!(elapsed = ?elapsed, "Pre-check proved the property");
                return run.finish(FinalResult::Unsat, None, Some(elapsed), None);
            }
            Ok(Ok(Precheck::Inconclusive)) => debug!("Pre-check inconclusive"),
            Ok(Err(e)) => warn!(error = %e, "Pre-check failed, continuing with refinement"),
            Err(_) => warn!(
                limit = ?precheck_limit,
                "Pre-check timed out, continuing with refinement"
            ),
        }
        drop(full);

        let validator = WitnessValidator::new(self.config.input_tolerance);
        let mut spent = Duration::ZERO;

        for level in &levels {
            let is_final = level.index + 1 == levels.len();
            let remaining = task.global_timeout.saturating_sub(spent);
            if remaining.is_zero() {
                let message = format!("global budget exhausted before level {}", level.index);
                return run.finish(FinalResult::GlobalTimeout, None, None, Some(message));
            }

            let (query, original_stats) = match builder.build(&level.inclusion) {
                Ok(built) => built,
                Err(e) => return run.error(e.to_string()),
            };
            let query = if self.config.simplify { simplify(&query) } else { query };
            let final_stats = query.stats();

            let attempt_timeout = task.per_attempt_timeout.min(remaining);
            info!(
                level = level.index,
                out_of = levels.len(),
                included = level.len(),
                timeout = ?attempt_timeout,
                piecewise = final_stats.num_piecewise_linear_constraints,
                "Solving refinement level"
            );

            let attempt_start = Instant::now();
            let attempt = self.solver.solve(&query, attempt_timeout);
            let outcome = match timeout(attempt_timeout + self.config.grace, attempt).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        level = level.index,
                        solver = self.solver.name(),
                        "Solver overran its timeout, cancelled"
                    );
                    AttemptOutcome::Timeout
                }
            };
            let wall_time = attempt_start.elapsed();
            spent += wall_time;
            debug!(
                level = level.index,
                outcome = outcome.label(),
                wall = ?wall_time,
                "Attempt finished"
            );

            let mut record = AttemptRecord {
                level: level.index,
                outcome: outcome.clone(),
                validation: None,
                wall_time,
                original_stats,
                final_stats,
                note: None,
            };

            match outcome {
                AttemptOutcome::Unsat => {
                    run.trace.push(record);
                    return run.finish(FinalResult::Unsat, None, Some(wall_time), None);
                }
                AttemptOutcome::Error(reason) => {
                    run.trace.push(record);
                    return run.error(reason);
                }
                AttemptOutcome::Timeout => {
                    run.trace.push(record);
                    if is_final || spent >= task.global_timeout {
                        let message = if is_final {
                            "full network timed out".to_string()
                        } else {
                            format!("global budget exhausted at level {}", level.index)
                        };
                        return run.finish(FinalResult::GlobalTimeout, None, None, Some(message));
                    }
                    info!(level = level.index, "Attempt timed out, refining");
                }
                AttemptOutcome::Sat(witness) if is_final => {
                    run.trace.push(record);
                    return run.finish(
                        FinalResult::Sat,
                        Some(witness.inputs),
                        Some(wall_time),
                        None,
                    );
                }
                AttemptOutcome::Sat(witness) => {
                    match validator.validate(&task.network, &task.property, &witness) {
                        Ok(Validation::Genuine) => {
                            record.validation = Some(Validation::Genuine);
                            run.trace.push(record);
                            return run.finish(
                                FinalResult::Sat,
                                Some(witness.inputs),
                                Some(wall_time),
                                None,
                            );
                        }
                        Ok(Validation::Spurious) => {
                            record.validation = Some(Validation::Spurious);
                            info!(level = level.index, "Spurious witness, refining");
                        }
                        Err(e) => {
                            warn!(
                                level = level.index,
                                error = %e,
                                "Malformed witness treated as spurious"
                            );
                            record.validation = Some(Validation::Spurious);
                            record.note = Some(e.to_string());
                        }
                    }
                    run.trace.push(record);
                }
            }
        }

        // The final level always terminates the loop above.
        run.error("refinement ended without a verdict".to_string())
    }

    /// Blocking wrapper around [`run`](Self::run) on a private current-thread
    /// runtime. Must not be called from inside an async context.
    pub fn run_blocking(&self, task: &VerificationTask) -> RunSummary {
        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(self.run(task)),
            Err(e) => {
                RunSummary::failed(task.policy, 0, format!("failed to start async runtime: {e}"))
            }
        }
    }
}

/// Verify a task with an external `z3` process and default settings.
pub fn run_verification(task: VerificationTask) -> RunSummary {
    RefinementScheduler::new(Arc::new(SmtProcessSolver::default()), SchedulerConfig::default())
        .run_blocking(&task)
}
