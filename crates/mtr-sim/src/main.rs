/// Command-line driver for mined-watershed landscape evolution runs.
///
/// `run` executes one scenario, `batch` many in parallel, `synth` writes a
/// small synthetic watershed with a ready-to-use config, and `params`
/// prints the default parameter set.
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use mtr_core::synthetic::{generate, SynthSpec};
use mtr_core::{
    run_batch, run_scenario, CancelToken, ModelParams, RunConfig, Scenario, ScenarioPreset,
    WatershedInputs,
};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "mtr-sim", version, about = "Landscape evolution of mountaintop-removal-mined watersheds")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single scenario
    Run(RunArgs),
    /// Run every scenario listed in the config (or on the command line)
    Batch(BatchArgs),
    /// Write a synthetic watershed and a matching config
    Synth(SynthArgs),
    /// Print the default model parameters as JSON
    Params,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Run configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// recovery, control-mined or control-unmined
    #[arg(short, long, default_value = "recovery")]
    preset: String,

    /// Column of the erodibility table to follow
    #[arg(short, long, default_value = "0")]
    scenario: usize,

    /// Override the config's output directory
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// Run configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Recovery scenario ids; replaces the config's scenario list
    #[arg(long, value_delimiter = ',')]
    ids: Vec<usize>,

    /// Also run both control presets
    #[arg(long)]
    controls: bool,

    /// Override the config's output directory
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SynthArgs {
    /// Directory to write the watershed into (created if absent)
    #[arg(short, long, default_value = "synthetic")]
    output: PathBuf,

    #[arg(long, default_value = "42")]
    seed: u64,

    #[arg(long, default_value = "40")]
    rows: usize,

    #[arg(long, default_value = "30")]
    cols: usize,

    /// Shorten the schedule to 20 years so the demo finishes quickly
    #[arg(long)]
    short: bool,
}

// ── Entry ────────────────────────────────────────────────────────────────────

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing log subscriber")?;

    match cli.command {
        Command::Run(args) => run(args),
        Command::Batch(args) => batch(args),
        Command::Synth(args) => synth(args),
        Command::Params => {
            println!("{}", serde_json::to_string_pretty(&ModelParams::default())?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load(config: &Path) -> Result<(RunConfig, WatershedInputs)> {
    let cfg = RunConfig::read(config).with_context(|| format!("reading config {}", config.display()))?;
    cfg.params.validate().context("invalid model parameters")?;
    let inputs = WatershedInputs::load(&cfg.watershed, &cfg.params)
        .with_context(|| format!("loading watershed {}", cfg.watershed.dem.display()))?;
    Ok((cfg, inputs))
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let preset: ScenarioPreset = args.preset.parse()?;
    let scenario = Scenario {
        preset,
        id: args.scenario,
    };
    let (cfg, inputs) = load(&args.config)?;
    let out = args.output.unwrap_or(cfg.watershed.output_dir);
    let files = run_scenario(&inputs, scenario, &cfg.params, &out, &CancelToken::new())
        .with_context(|| format!("running {scenario}"))?;
    for f in files {
        println!("{}", f.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn batch(args: BatchArgs) -> Result<ExitCode> {
    let (cfg, inputs) = load(&args.config)?;
    let mut scenarios: Vec<Scenario> = if args.ids.is_empty() {
        cfg.scenarios.clone()
    } else {
        args.ids.iter().map(|&id| Scenario::recovery(id)).collect()
    };
    if args.controls {
        scenarios.push(Scenario::control_mined(scenarios.first().map_or(0, |s| s.id)));
        scenarios.push(Scenario::control_unmined());
    }
    if scenarios.is_empty() {
        bail!("no scenarios to run: list them in the config or pass --ids");
    }

    let out = args.output.unwrap_or(cfg.watershed.output_dir);
    tracing::info!(count = scenarios.len(), dir = %out.display(), "starting batch");
    let report = run_batch(&inputs, &scenarios, &cfg.params, &out, &CancelToken::new());

    for (s, files) in &report.completed {
        println!("{s}: ok ({} files)", files.len());
    }
    for (s, e) in &report.failed {
        eprintln!("{s}: FAILED: {e}");
    }
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn synth(args: SynthArgs) -> Result<ExitCode> {
    let spec = SynthSpec {
        nrows: args.rows,
        ncols: args.cols,
        seed: args.seed,
        ..SynthSpec::default()
    };
    if spec.nrows < 3 || spec.ncols < 3 {
        bail!("synthetic grid must be at least 3x3, got {}x{}", spec.nrows, spec.ncols);
    }
    let mut paths = generate(&spec)
        .write(&args.output)
        .with_context(|| format!("writing synthetic watershed to {}", args.output.display()))?;

    // The config sits next to the inputs; store paths relative to it.
    let relative = |p: &mut PathBuf| {
        if let Ok(rel) = p.strip_prefix(&args.output) {
            *p = rel.to_path_buf();
        }
    };
    relative(&mut paths.dem);
    if let Some(m) = paths.mask.as_mut() {
        relative(m);
    }
    relative(&mut paths.erodibility_table);
    relative(&mut paths.climate);
    relative(&mut paths.output_dir);

    let params = if args.short {
        ModelParams {
            total_time: 20.0,
            recovery_period: 10.0,
            ..ModelParams::default()
        }
    } else {
        ModelParams::default()
    };
    let config = RunConfig {
        watershed: paths,
        params,
        scenarios: (0..spec.n_scenarios).map(Scenario::recovery).collect(),
    };
    let config_path = args.output.join("run_config.json");
    std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("writing {}", config_path.display()))?;
    println!("{}", config_path.display());
    Ok(ExitCode::SUCCESS)
}
