//! Run traces and summaries returned by the scheduler.

use crate::validator::Validation;
use cegar_core::PolicyKind;
use cegar_query::QueryStats;
use cegar_solver::AttemptOutcome;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Terminal result of a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinalResult {
    /// The property holds.
    Unsat,
    /// A genuine counterexample was found.
    Sat,
    /// The global budget ran out, or the full network timed out.
    GlobalTimeout,
    Error,
}

impl FinalResult {
    /// Label used in run reports.
    pub fn label(self) -> &'static str {
        match self {
            FinalResult::Unsat => "UNSAT",
            FinalResult::Sat => "SAT",
            FinalResult::GlobalTimeout => "GTIMEOUT",
            FinalResult::Error => "ERROR",
        }
    }

    /// Whether the run decided the property.
    pub fn is_solved(self) -> bool {
        matches!(self, FinalResult::Unsat | FinalResult::Sat)
    }
}

impl std::fmt::Display for FinalResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One solver attempt at one refinement level.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub level: usize,
    pub outcome: AttemptOutcome,
    /// Absent when validation was skipped (non-SAT outcomes and the full
    /// network level).
    pub validation: Option<Validation>,
    pub wall_time: Duration,
    /// Query size as built.
    pub original_stats: QueryStats,
    /// Query size as handed to the solver, after simplification.
    pub final_stats: QueryStats,
    pub note: Option<String>,
}

/// Append-only list of attempts, in level order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunTrace {
    records: Vec<AttemptRecord>,
}

impl RunTrace {
    pub(crate) fn push(&mut self, record: AttemptRecord) {
        debug_assert!(
            self.records.last().map_or(true, |last| last.level < record.level),
            "attempts must be recorded in level order"
        );
        self.records.push(record);
    }

    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of attempt wall times.
    pub fn solver_time(&self) -> Duration {
        self.records.iter().map(|r| r.wall_time).sum()
    }

    pub fn last(&self) -> Option<&AttemptRecord> {
        self.records.last()
    }
}

/// Everything a caller learns about a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub policy: PolicyKind,
    pub final_result: FinalResult,
    /// Witness input for [`FinalResult::Sat`].
    pub counterexample: Option<Vec<f64>>,
    pub total_runtime: Duration,
    /// Time of the attempt (or pre-check) that decided the run.
    pub successful_runtime: Option<Duration>,
    pub num_runs: usize,
    /// Number of planned refinement levels.
    pub out_of: usize,
    pub message: Option<String>,
    pub trace: RunTrace,
}

impl RunSummary {
    /// Summary of a run that failed before any attempt.
    pub fn failed(policy: PolicyKind, out_of: usize, message: impl Into<String>) -> Self {
        Self {
            policy,
            final_result: FinalResult::Error,
            counterexample: None,
            total_runtime: Duration::ZERO,
            successful_runtime: None,
            num_runs: 0,
            out_of,
            message: Some(message.into()),
            trace: RunTrace::default(),
        }
    }

    /// Level indices of the recorded attempts.
    pub fn levels(&self) -> Vec<usize> {
        self.trace.records().iter().map(|r| r.level).collect()
    }
}
