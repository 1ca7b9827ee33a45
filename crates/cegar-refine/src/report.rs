//! Persisted run reports.
//!
//! A [`RunReport`] is the serialized form of a [`RunSummary`]: result labels
//! instead of enums, runtimes in seconds, one `subResults` entry per attempt.

use crate::summary::{AttemptRecord, RunSummary};
use crate::validator::Validation;
use cegar_query::QueryStats;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// One attempt in a persisted report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubResult {
    pub level: usize,
    /// `SAT`, `UNSAT`, `TIMEOUT` or `ERROR`.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
    /// Seconds.
    pub runtime: f64,
    pub original_query_stats: QueryStats,
    pub final_query_stats: QueryStats,
    pub out_of: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl SubResult {
    fn from_record(record: &AttemptRecord, out_of: usize) -> Self {
        let note = match (&record.outcome, &record.note) {
            (_, Some(note)) => Some(note.clone()),
            (cegar_solver::AttemptOutcome::Error(reason), None) => Some(reason.clone()),
            _ => None,
        };
        Self {
            level: record.level,
            outcome: record.outcome.label().to_string(),
            validation: record.validation,
            runtime: record.wall_time.as_secs_f64(),
            original_query_stats: record.original_stats,
            final_query_stats: record.final_stats,
            out_of,
            note,
        }
    }
}

/// How much of the refinement sequence a run needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    /// Decided by the pre-check alone.
    PrecheckOnly,
    /// Decided by the first, coarsest level.
    MinimalAbstraction,
    /// Reached the full network.
    FullNetwork,
    /// Stopped at an intermediate level.
    Intermediate,
}

/// Serialized result of one verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Caller-chosen run name; also names the report file.
    pub name: String,
    pub policy: String,
    /// `SAT`, `UNSAT`, `GTIMEOUT` or `ERROR`.
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterexample: Option<Vec<f64>>,
    /// Seconds.
    pub total_runtime: f64,
    /// Seconds; present only for `SAT` and `UNSAT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_runtime: Option<f64>,
    pub num_runs: usize,
    pub out_of: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub sub_results: Vec<SubResult>,
}

impl RunReport {
    pub fn from_summary(name: impl Into<String>, summary: &RunSummary) -> Self {
        let successful_runtime = if summary.final_result.is_solved() {
            summary.successful_runtime.map(|d| d.as_secs_f64())
        } else {
            None
        };
        Self {
            name: name.into(),
            policy: summary.policy.to_string(),
            result: summary.final_result.label().to_string(),
            counterexample: summary.counterexample.clone(),
            total_runtime: summary.total_runtime.as_secs_f64(),
            successful_runtime,
            num_runs: summary.num_runs,
            out_of: summary.out_of,
            message: summary.message.clone(),
            sub_results: summary
                .trace
                .records()
                .iter()
                .map(|r| SubResult::from_record(r, summary.out_of))
                .collect(),
        }
    }

    /// Bucket used when aggregating runs. A run that needed every level
    /// counts as [`Classification::FullNetwork`] even when there is only one.
    pub fn classification(&self) -> Classification {
        match self.num_runs {
            0 => Classification::PrecheckOnly,
            n if n == self.out_of => Classification::FullNetwork,
            1 => Classification::MinimalAbstraction,
            _ => Classification::Intermediate,
        }
    }
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Consumer of finished run reports.
pub trait RunRecorder: Send + Sync {
    fn record(&self, report: &RunReport) -> Result<(), RecordError>;
}

/// Writes each report as pretty JSON to `<dir>/<name>.json`.
#[derive(Debug, Clone)]
pub struct JsonRecorder {
    dir: PathBuf,
}

impl JsonRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File a report with this name is written to.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file}.json"))
    }

    /// Read a previously written report.
    pub fn load(path: &Path) -> Result<RunReport, RecordError> {
        let text = std::fs::read_to_string(path).map_err(|source| RecordError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl RunRecorder for JsonRecorder {
    fn record(&self, report: &RunReport) -> Result<(), RecordError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| RecordError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(&report.name);
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&path, json).map_err(|source| RecordError::Io {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), result = %report.result, "Wrote run report");
        Ok(())
    }
}
