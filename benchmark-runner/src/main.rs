use anyhow::Context;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use sortbench_runner::backend;
use sortbench_runner::cancel::CancelSignal;
use sortbench_runner::config::resolve_plan_paths;
use sortbench_runner::config::Overrides;
use sortbench_runner::config::Resolver;
use sortbench_runner::controller::SweepController;
use sortbench_runner::controller::SweepOptions;
use sortbench_runner::ledger::replay;
use sortbench_runner::ledger::Ledger;
use sortbench_runner::report::render;
use sortbench_types::SweepPlan;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal::ctrl_c;
use tokio::spawn;
use tracing::error;
use tracing::info;
use tracing::warn;

/*

# Sort benchmark runner

Each folder in the cfg directory is one sweep: a `cfg.yaml` plan describing the backend, the dataset, and the axes to vary. For every sweep, the dataset is loaded once (unless the backend already has it), then every point runs one after another, each under its own timeout. Results are appended to `ledger.jsonl` in the sweep folder and each point's output is kept under `logs/`. Artifacts are written under `work/` unless the plan says otherwise, and deleted after every point.

Individual point failures and timeouts are recorded, not fatal. The exit code is non-zero only if a plan is malformed, a dataset could not be set up, or the ledger could not be written.

*/

const CANCELLED_EXIT_CODE: u8 = 130;

#[derive(Parser)]
#[command(name = "sortbench")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Runs sweeps.
  Run(RunArgs),
  /// Prints the ledger of a sweep.
  Report {
    sweep: String,

    #[arg(long, default_value = "cfg")]
    cfg_dir: PathBuf,
  },
}

#[derive(Args)]
struct RunArgs {
  /// Sweep folders to run (comma-separated). If not specified, runs all sweeps in the cfg directory.
  benchmarks: Option<String>,

  #[arg(long, default_value = "cfg")]
  cfg_dir: PathBuf,

  /// Thread count for every point that doesn't vary it (overrides config).
  #[arg(long, env = "SORTBENCH_THREADS")]
  threads: Option<String>,

  /// Memory limit for every point that doesn't vary it (overrides config).
  #[arg(long, env = "SORTBENCH_MEMORY_LIMIT")]
  memory_limit: Option<String>,

  /// Spill directory or temp tablespace (overrides config).
  #[arg(long, env = "SORTBENCH_TEMP_DIR")]
  temp_dir: Option<PathBuf>,

  /// Per-point timeout (overrides config).
  #[arg(long, env = "SORTBENCH_TIMEOUT_SECS")]
  timeout_secs: Option<u64>,

  /// Delay between points (overrides config).
  #[arg(long, env = "SORTBENCH_COOLDOWN_SECS")]
  cooldown_secs: Option<u64>,

  /// Dataset location: database file, connection string, or URL (overrides config).
  #[arg(long, env = "SORTBENCH_LOCATION")]
  location: Option<String>,

  /// Never load the dataset. Sweeps whose dataset is missing fail setup.
  #[arg(long)]
  skip_load: bool,

  /// Skips points that already have a measured success in the ledger.
  #[arg(long)]
  resume: bool,

  /// Prints every point and its command line without running anything.
  #[arg(long)]
  dry_run: bool,
}

impl RunArgs {
  fn overrides(&self) -> Overrides {
    Overrides {
      threads: self.threads.clone(),
      memory_limit: self.memory_limit.clone(),
      temp_dir: self.temp_dir.clone(),
      timeout_secs: self.timeout_secs,
      cooldown_secs: self.cooldown_secs,
      location: self.location.clone(),
    }
  }
}

fn sweep_names(args: &RunArgs) -> anyhow::Result<Vec<String>> {
  if let Some(benchmarks) = &args.benchmarks {
    return Ok(
      benchmarks
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect(),
    );
  }
  let mut names = Vec::new();
  for entry in fs::read_dir(&args.cfg_dir)
    .with_context(|| format!("read cfg directory {}", args.cfg_dir.display()))?
  {
    let entry = entry?;
    if entry.file_type()?.is_dir() && entry.path().join("cfg.yaml").is_file() {
      if let Some(name) = entry.file_name().to_str() {
        names.push(name.to_string());
      }
    }
  }
  names.sort();
  Ok(names)
}

fn load_plan(sweep_dir: &Path) -> anyhow::Result<SweepPlan> {
  let cfg_file = sweep_dir.join("cfg.yaml");
  let raw = fs::read_to_string(&cfg_file)
    .with_context(|| format!("read plan {}", cfg_file.display()))?;
  let mut plan: SweepPlan =
    serde_yaml::from_str(&raw).with_context(|| format!("parse plan {}", cfg_file.display()))?;
  resolve_plan_paths(&mut plan, sweep_dir);
  Ok(plan)
}

struct Sweep {
  dir: PathBuf,
  resolver: Resolver,
}

fn resolve_all(args: &RunArgs) -> anyhow::Result<Vec<Sweep>> {
  let overrides = args.overrides();
  let mut sweeps = Vec::new();
  for name in sweep_names(args)? {
    let dir = std::path::absolute(args.cfg_dir.join(&name))
      .with_context(|| format!("resolve sweep directory for {name}"))?;
    let plan = load_plan(&dir)?;
    let resolver = Resolver::new(name.clone(), plan, &overrides, &dir.join("work"))
      .with_context(|| format!("invalid plan for sweep {name}"))?;
    for path in [dir.join("logs"), dir.join("ledger.jsonl"), dir.join("cfg.yaml")] {
      resolver
        .check_protected(&path)
        .with_context(|| format!("invalid plan for sweep {name}"))?;
    }
    sweeps.push(Sweep { dir, resolver });
  }
  Ok(sweeps)
}

fn dry_run(sweeps: &[Sweep]) -> anyhow::Result<()> {
  for sweep in sweeps {
    let backend = backend::build(sweep.resolver.plan())?;
    let first = sweep.resolver.point(0);
    println!("# {} ({} points)", sweep.resolver.sweep(), sweep.resolver.len());
    println!("load: {}", backend.load(&first));
    for (i, cfg) in sweep.resolver.points().enumerate() {
      println!("[{i}] {}", cfg.label());
      if let Some(path) = backend.artifact_path(&cfg) {
        println!("    artifact: {}", path.display());
      }
      println!("    run: {}", backend.run(&cfg));
    }
  }
  Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
  // Every plan must be valid before anything runs.
  let sweeps = resolve_all(&args)?;
  info!(sweeps = ?sweeps.iter().map(|s| s.resolver.sweep()).collect::<Vec<_>>(), "resolved sweeps");

  if args.dry_run {
    dry_run(&sweeps)?;
    return Ok(ExitCode::SUCCESS);
  }

  let (handle, cancel) = CancelSignal::new();
  spawn(async move {
    if ctrl_c().await.is_ok() {
      warn!("interrupted, killing the current point and stopping");
      handle.cancel();
    }
  });

  let opts = SweepOptions {
    skip_load: args.skip_load,
    resume: args.resume,
  };
  let mut failed = false;
  for sweep in &sweeps {
    if cancel.is_cancelled() {
      break;
    }
    let name = sweep.resolver.sweep();
    info!(sweep = name, "running sweep");

    let backend = match backend::build(sweep.resolver.plan()) {
      Ok(b) => b,
      Err(err) => {
        error!(sweep = name, error = %err, "cannot create backend");
        failed = true;
        continue;
      }
    };
    let ledger_path = sweep.dir.join("ledger.jsonl");
    let ledger = match Ledger::open(&ledger_path) {
      Ok(l) => l,
      Err(err) => {
        error!(sweep = name, ledger = %ledger_path.display(), error = %err, "cannot open ledger");
        failed = true;
        continue;
      }
    };

    let mut controller =
      SweepController::new(backend, ledger, sweep.dir.join("logs"), opts, cancel.clone());
    match controller.run(&sweep.resolver).await {
      Ok(summary) if summary.cancelled => break,
      Ok(_) => {}
      Err(err) => {
        error!(sweep = name, error = %err, "sweep failed");
        failed = true;
      }
    };
  }

  if cancel.is_cancelled() {
    warn!("stopped before all sweeps completed");
    return Ok(ExitCode::from(CANCELLED_EXIT_CODE));
  }
  info!("all sweeps complete");
  Ok(if failed {
    ExitCode::FAILURE
  } else {
    ExitCode::SUCCESS
  })
}

fn report(sweep: &str, cfg_dir: &Path) -> anyhow::Result<()> {
  let ledger_path = cfg_dir.join(sweep).join("ledger.jsonl");
  let entries =
    replay(&ledger_path).with_context(|| format!("read ledger {}", ledger_path.display()))?;
  if entries.is_empty() {
    info!(ledger = %ledger_path.display(), "no entries");
    return Ok(());
  }
  print!("{}", render(&entries));
  Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt::init();

  let cli = Cli::parse();
  let res = match cli.command {
    Command::Run(args) => run(args).await,
    Command::Report { sweep, cfg_dir } => report(&sweep, &cfg_dir).map(|_| ExitCode::SUCCESS),
  };
  match res {
    Ok(code) => code,
    Err(err) => {
      error!("{err:#}");
      ExitCode::FAILURE
    }
  }
}
