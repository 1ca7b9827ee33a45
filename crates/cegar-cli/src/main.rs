//! cegar CLI
//!
//! # Commands
//!
//! - `cegar verify <network> <property>` - Run abstraction refinement and write a report
//! - `cegar plan <network> <property>` - Show the refinement levels a policy produces
//! - `cegar check-witness <network> <property> <values..>` - Re-check a candidate counterexample

use anyhow::{bail, Context, Result};
use cegar_core::{Network, PolicyKind, Property, PropertyFile, VerificationTask};
use cegar_query::QueryBuilder;
use cegar_refine::{
    JsonRecorder, RefinementScheduler, RunRecorder, RunReport, SchedulerConfig, Validation,
    WitnessValidator,
};
use cegar_solver::{SmtProcessSolver, SolverConfig, Witness};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cegar")]
#[command(about = "Abstraction-refinement robustness verification for ReLU networks")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Network and property inputs shared by every command.
#[derive(Args)]
struct Inputs {
    /// Network file (JSON)
    network: PathBuf,
    /// Property file (JSON)
    property: PathBuf,
}

#[derive(Args)]
struct Planning {
    /// Abstraction policy
    #[arg(short, long, default_value = "Centered")]
    policy: PolicyKind,
    /// Number of refinement levels for abstracting policies
    #[arg(short = 'b', long)]
    batches: Option<usize>,
    /// Seed for the Random policy
    #[arg(long)]
    seed: Option<u64>,
    /// Reference inputs for the data-driven rankers (JSON list of vectors)
    #[arg(long)]
    reference_samples: Option<PathBuf>,
    /// Configuration file (JSON with optional "scheduler" and "solver" sections)
    #[arg(short, long, env = "CEGAR_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a property with abstraction refinement
    Verify {
        #[command(flatten)]
        inputs: Inputs,
        #[command(flatten)]
        planning: Planning,
        /// Per-attempt solver timeout in seconds
        #[arg(long, default_value = "800")]
        timeout: u64,
        /// Global budget in seconds
        #[arg(long, default_value = "3600")]
        global_timeout: u64,
        /// Solver binary (SMT-LIB over stdin)
        #[arg(long, env = "CEGAR_SOLVER")]
        solver: Option<String>,
        /// Directory to write the JSON report to
        #[arg(long)]
        report_dir: Option<PathBuf>,
        /// Report name (defaults to <network>-<policy>)
        #[arg(long)]
        name: Option<String>,
        /// Print the report as JSON on stdout
        #[arg(long)]
        json: bool,
    },
    /// Print the refinement levels and query sizes for a policy
    Plan {
        #[command(flatten)]
        inputs: Inputs,
        #[command(flatten)]
        planning: Planning,
    },
    /// Check whether an input violates the property on the concrete network
    CheckWitness {
        #[command(flatten)]
        inputs: Inputs,
        /// Input values
        #[arg(required = true, num_args = 1.., allow_negative_numbers = true)]
        values: Vec<f64>,
        /// Tolerance for the input box check
        #[arg(long, default_value = "1e-6")]
        tolerance: f64,
    },
}

/// Contents of a `--config` file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct FileConfig {
    scheduler: SchedulerConfig,
    solver: SolverConfig,
}

impl FileConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// A loaded network and property, plus the centre of the perturbation region.
struct Loaded {
    network: Arc<Network>,
    property: Arc<Property>,
    sample: Vec<f64>,
}

fn load_inputs(inputs: &Inputs) -> Result<Loaded> {
    let network = Network::load(&inputs.network)
        .with_context(|| format!("loading {}", inputs.network.display()))?;
    let text = std::fs::read_to_string(&inputs.property)
        .with_context(|| format!("reading property {}", inputs.property.display()))?;
    let file: PropertyFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing property {}", inputs.property.display()))?;
    let explicit_sample = file.sample.clone();
    let property = file.into_property(network.output_dim())?;
    // Without an explicit sample, rank around the centre of the input box.
    let sample = explicit_sample.unwrap_or_else(|| {
        property
            .input_bounds
            .iter()
            .map(|b| (b.lower + b.upper) / 2.0)
            .collect()
    });
    Ok(Loaded {
        network: Arc::new(network),
        property: Arc::new(property),
        sample,
    })
}

fn load_reference_samples(path: &Path) -> Result<Arc<Vec<Vec<f64>>>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let samples: Vec<Vec<f64>> = serde_json::from_str(&text)
        .with_context(|| format!("parsing reference samples {}", path.display()))?;
    if samples.is_empty() {
        bail!("reference sample file {} is empty", path.display());
    }
    Ok(Arc::new(samples))
}

fn scheduler_config(planning: &Planning, mut config: SchedulerConfig) -> SchedulerConfig {
    if let Some(batches) = planning.batches {
        config = config.with_num_batches(batches);
    }
    if let Some(seed) = planning.seed {
        config = config.with_random_seed(seed);
    }
    config
}

fn scheduler(planning: &Planning, file: FileConfig) -> Result<RefinementScheduler> {
    let config = scheduler_config(planning, file.scheduler);
    let solver = Arc::new(SmtProcessSolver::new(file.solver));
    let mut scheduler = RefinementScheduler::new(solver, config);
    if let Some(path) = &planning.reference_samples {
        scheduler = scheduler.with_reference_samples(load_reference_samples(path)?);
    }
    Ok(scheduler)
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Verify {
            inputs,
            planning,
            timeout,
            global_timeout,
            solver,
            report_dir,
            name,
            json,
        } => {
            let loaded = load_inputs(&inputs)?;
            let mut file = FileConfig::load(planning.config.as_deref())?;
            if let Some(binary) = solver {
                file.solver.binary = binary;
            }
            let scheduler = scheduler(&planning, file)?;
            let task = VerificationTask::new(
                loaded.network,
                loaded.property,
                loaded.sample,
                planning.policy,
                Duration::from_secs(timeout),
                Duration::from_secs(global_timeout),
            )?;

            let summary = scheduler.run(&task).await;
            let name = name.unwrap_or_else(|| {
                let stem = inputs
                    .network
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "network".to_string());
                format!("{stem}-{}", planning.policy)
            });
            let report = RunReport::from_summary(name, &summary);

            if let Some(dir) = report_dir {
                JsonRecorder::new(dir).record(&report)?;
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{}: {} after {} of {} levels in {:.2}s",
                    report.name, report.result, report.num_runs, report.out_of, report.total_runtime
                );
                if let Some(message) = &report.message {
                    println!("  {message}");
                }
                if let Some(cex) = &report.counterexample {
                    println!("  counterexample: {cex:?}");
                }
            }
        }

        Commands::Plan { inputs, planning } => {
            let loaded = load_inputs(&inputs)?;
            let file = FileConfig::load(planning.config.as_deref())?;
            let scheduler = scheduler(&planning, file)?;
            let planner = scheduler.planner_for(planning.policy);
            let levels = planner.plan(&loaded.network, &loaded.sample, &loaded.property)?;
            let builder = QueryBuilder::new(&loaded.network, &loaded.property)?;
            info!(policy = %planning.policy, levels = levels.len(), "Planned refinement");

            println!("{} levels for {}", levels.len(), planning.policy);
            for level in &levels {
                let (query, stats) = builder.build(&level.inclusion)?;
                let simplified = cegar_query::simplify(&query).stats();
                println!(
                    "  level {}: {} units, {} vars, {} relations, {} ReLUs \
                     ({} after simplification)",
                    level.index,
                    level.len(),
                    stats.num_variables,
                    stats.num_relations,
                    stats.num_piecewise_linear_constraints,
                    simplified.num_piecewise_linear_constraints
                );
            }
        }

        Commands::CheckWitness {
            inputs,
            values,
            tolerance,
        } => {
            let loaded = load_inputs(&inputs)?;
            let validator = WitnessValidator::new(tolerance);
            let witness = Witness::new(values);
            let verdict = validator.validate(&loaded.network, &loaded.property, &witness)?;
            let outputs = loaded.network.evaluate(&witness.inputs)?;
            println!("outputs: {outputs:?}");
            println!(
                "{}",
                match verdict {
                    Validation::Genuine => "GENUINE: the input violates the property",
                    Validation::Spurious => "SPURIOUS: the input does not violate the property",
                }
            );
        }
    }

    Ok(())
}
