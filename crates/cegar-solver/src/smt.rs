//! SMT solver process wrapper.
//!
//! Each attempt spawns a fresh solver process, writes the SMT-LIB script to
//! its stdin and reads the verdict and model from stdout. The child is
//! spawned with `kill_on_drop`, so cancelling the attempt future kills it.

use crate::{AttemptOutcome, SolverClient, SolverConfig, SolverError, Witness};
use async_trait::async_trait;
use cegar_query::{encode_smtlib, parse_model, Query, SmtScript};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// `unknown` reasons that mean the solver ran out of time rather than failed.
const TIMEOUT_REASONS: [&str; 4] = ["timeout", "canceled", "cancelled", "resource limits"];

/// Solver driven over stdin/stdout, `z3 -in` by default.
#[derive(Debug, Clone, Default)]
pub struct SmtProcessSolver {
    config: SolverConfig,
}

/// Captured output of a finished solver process.
#[derive(Debug)]
struct RawOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl SmtProcessSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Run the script; `Ok(None)` if the limit elapsed first.
    async fn run(&self, script: &str, limit: Duration) -> Result<Option<RawOutput>, SolverError> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(binary = %self.config.binary, args = ?self.config.args, "Spawning solver");
        let mut child = cmd.spawn().map_err(|e| SolverError::Spawn {
            binary: self.config.binary.clone(),
            message: e.to_string(),
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SolverError::Io("solver stdin unavailable".to_string()))?;
        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();

        // Feed stdin while draining both output pipes, so a solver that
        // writes before it has read the whole script cannot stall on a full pipe.
        let result = timeout(limit, async {
            let (written, status, stdout, stderr) = tokio::join!(
                async {
                    stdin.write_all(script.as_bytes()).await?;
                    stdin.shutdown().await?;
                    drop(stdin);
                    Ok::<_, std::io::Error>(())
                },
                child.wait(),
                async {
                    let mut buf = String::new();
                    if let Some(mut handle) = stdout_handle {
                        let _ = handle.read_to_string(&mut buf).await;
                    }
                    buf
                },
                async {
                    let mut buf = String::new();
                    if let Some(mut handle) = stderr_handle {
                        let _ = handle.read_to_string(&mut buf).await;
                    }
                    buf
                }
            );
            // A solver may exit before consuming its input; its output decides.
            if let Err(e) = written {
                debug!(error = %e, "Solver closed stdin early");
            }
            Ok::<_, std::io::Error>(RawOutput {
                status: status?,
                stdout,
                stderr,
            })
        })
        .await;

        match result {
            Ok(Ok(output)) => Ok(Some(output)),
            Ok(Err(e)) => Err(SolverError::Io(e.to_string())),
            Err(_) => {
                warn!(limit = ?limit, binary = %self.config.binary, "Solver timed out, killing");
                let _ = child.kill().await;
                Ok(None)
            }
        }
    }
}

/// Map raw solver output onto an attempt outcome.
fn interpret(output: &RawOutput, script: &SmtScript) -> AttemptOutcome {
    let mut lines = output.stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let verdict = lines.next().unwrap_or("");
    match verdict {
        "unsat" => AttemptOutcome::Unsat,
        "sat" => {
            let rest = output.stdout.splitn(2, "sat").nth(1).unwrap_or("");
            match parse_model(rest, &script.input_names) {
                Some(inputs) => {
                    let witness = Witness::new(inputs);
                    match parse_model(rest, &script.output_names) {
                        Some(outputs) => AttemptOutcome::Sat(witness.with_outputs(outputs)),
                        None => AttemptOutcome::Sat(witness),
                    }
                }
                None => {
                    let e =
                        SolverError::MalformedOutput("sat without a model for every input".into());
                    AttemptOutcome::Error(e.to_string())
                }
            }
        }
        "unknown" => {
            let text = format!("{}\n{}", output.stdout, output.stderr).to_ascii_lowercase();
            if TIMEOUT_REASONS.iter().any(|r| text.contains(r)) {
                AttemptOutcome::Timeout
            } else {
                AttemptOutcome::Error("solver returned unknown".to_string())
            }
        }
        _ if !output.status.success() => AttemptOutcome::Error(
            SolverError::Crashed {
                status: output.status.to_string(),
                stderr: output.stderr.lines().next().unwrap_or("").to_string(),
            }
            .to_string(),
        ),
        other => AttemptOutcome::Error(
            SolverError::MalformedOutput(format!("unexpected verdict '{other}'")).to_string(),
        ),
    }
}

#[async_trait]
impl SolverClient for SmtProcessSolver {
    fn name(&self) -> &str {
        &self.config.binary
    }

    fn tightening_rounds(&self) -> usize {
        self.config.tightening_rounds
    }

    async fn solve(&self, query: &Query, limit: Duration) -> AttemptOutcome {
        let script = match encode_smtlib(query, self.config.produce_models) {
            Ok(script) => script,
            Err(e) => return AttemptOutcome::Error(e.to_string()),
        };
        debug!(bytes = script.text.len(), limit = ?limit, "Encoded query");

        let start = Instant::now();
        let outcome = match self.run(&script.text, limit).await {
            Ok(Some(output)) => interpret(&output, &script),
            Ok(None) => AttemptOutcome::Timeout,
            Err(e) => AttemptOutcome::Error(e.to_string()),
        };
        debug!(outcome = outcome.label(), elapsed = ?start.elapsed(), "Solver finished");
        outcome
    }
}
