//! Counterexample-guided abstraction refinement (CEGAR) for robustness
//! verification.
//!
//! Given a [`VerificationTask`](cegar_core::VerificationTask), the
//! [`RefinementScheduler`] plans a sequence of increasingly precise
//! abstractions of the network, solves them coarsest first under a per-attempt
//! timeout and a global budget, re-checks every witness on the concrete
//! network and returns a [`RunSummary`] with the full attempt trace.
//!
//! ```no_run
//! use cegar_refine::{run_verification, RunReport};
//! # fn task() -> cegar_core::VerificationTask { unimplemented!() }
//! let summary = run_verification(task());
//! let report = RunReport::from_summary("sample-0", &summary);
//! println!("{} after {} of {} levels", report.result, report.num_runs, report.out_of);
//! ```

pub mod config;
pub mod planner;
pub mod ranking;
pub mod report;
pub mod scheduler;
pub mod summary;
pub mod validator;

pub use config::SchedulerConfig;
pub use planner::{partition, AbstractionPlanner, RefinementLevel};
pub use ranking::{
    strategy_for, AllSamplesRank, Centered, MajorityClassVote, NetworkOrder, PolicyError,
    PolicyRanker, RandomOrder, RankerOptions, SampleRank, SingleClassRank,
};
pub use report::{Classification, JsonRecorder, RecordError, RunRecorder, RunReport, SubResult};
pub use scheduler::{run_verification, RefinementScheduler};
pub use summary::{AttemptRecord, FinalResult, RunSummary, RunTrace};
pub use validator::{Validation, ValidationError, WitnessValidator};

#[cfg(test)]
mod tests;
