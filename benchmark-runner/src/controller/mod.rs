
use crate::backend::Backend;
use crate::cancel::CancelSignal;
use crate::config::Resolver;
use crate::error::SetupError;
use crate::error::SweepError;
use crate::executor::Executor;
use crate::ledger::measured_configs;
use crate::ledger::replay;
use crate::ledger::Ledger;
use crate::metrics::MetricsWindow;
use crate::reclaim::FsReclaimer;
use crate::reclaim::Reclaimer;
use ahash::HashSet;
use chrono::Utc;
use sortbench_types::LedgerEntry;
use sortbench_types::RunConfig;
use sortbench_types::RunResult;
use sortbench_types::RunStatus;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::time::sleep;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
  Pending,
  Invalidating,
  Executing,
  Failed,
  TimedOut,
  Recording,
  Reclaiming,
  Done,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SweepOptions {
  /// Never load; a missing dataset fails setup.
  pub skip_load: bool,
  /// Skip points whose exact configuration already has a measured success in the ledger.
  pub resume: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
  pub loaded: bool,
  pub attempted: usize,
  pub measured: usize,
  pub unmeasured: usize,
  pub failed: usize,
  pub timed_out: usize,
  pub skipped: usize,
  /// Stopped early by the operator. Remaining points were not attempted.
  pub cancelled: bool,
}

impl SweepSummary {
  fn count(&mut self, res: &RunResult) {
    self.attempted += 1;
    match res.status {
      RunStatus::Success if res.duration_secs.is_some() => self.measured += 1,
      RunStatus::Success => self.unmeasured += 1,
      RunStatus::Failed => self.failed += 1,
      RunStatus::TimedOut => self.timed_out += 1,
    };
  }
}

/// Runs the points of one sweep strictly one after another against one backend.
pub struct SweepController {
  backend: Arc<dyn Backend>,
  executor: Executor,
  reclaimer: Arc<dyn Reclaimer>,
  ledger: Ledger,
  log_dir: PathBuf,
  opts: SweepOptions,
  cancel: CancelSignal,
}

fn enter(point: usize, phase: Phase) {
  debug!(point, %phase, "phase");
}

// Keeps log file names portable regardless of what the knob values contain.
fn file_safe(s: &str) -> String {
  s.chars()
    .map(|c| match c {
      'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' => c,
      _ => '_',
    })
    .collect()
}

impl SweepController {
  pub fn new(
    backend: Arc<dyn Backend>,
    ledger: Ledger,
    log_dir: impl Into<PathBuf>,
    opts: SweepOptions,
    cancel: CancelSignal,
  ) -> Self {
    Self {
      backend,
      executor: Executor::default(),
      reclaimer: Arc::new(FsReclaimer::default()),
      ledger,
      log_dir: log_dir.into(),
      opts,
      cancel,
    }
  }

  pub fn with_reclaimer(mut self, reclaimer: Arc<dyn Reclaimer>) -> Self {
    self.reclaimer = reclaimer;
    self
  }

  pub fn with_executor(mut self, executor: Executor) -> Self {
    self.executor = executor;
    self
  }

  fn log_path(&self, cfg: &RunConfig, what: &str) -> PathBuf {
    let ts = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    self.log_dir.join(format!(
      "{}_{}_{}_{}t_{}_{}.log",
      file_safe(&cfg.sweep),
      what,
      cfg.backend.slug(),
      file_safe(&cfg.threads),
      file_safe(&cfg.memory_limit),
      ts
    ))
  }

  /// Makes sure the dataset exists, loading it if needed. Returns whether a load happened.
  async fn setup(&self, cfg: &RunConfig, load_timeout: Duration) -> Result<bool, SetupError> {
    let present = self
      .backend
      .dataset_present(cfg)
      .await
      .map_err(SetupError::PresenceCheck)?;
    if present {
      info!(location = %cfg.location, table = %cfg.table, "dataset present, not loading");
      return Ok(false);
    }
    if self.opts.skip_load {
      return Err(SetupError::DatasetMissing);
    }

    let invocation = self.backend.load(cfg);
    let log = self.log_path(cfg, "load");
    info!(command = %invocation, log = %log.display(), "loading dataset");
    let res = self
      .executor
      .execute(&invocation, load_timeout, Some(&log), self.cancel.clone())
      .await;
    if res.status != RunStatus::Success {
      return Err(SetupError::LoadFailed {
        status: res.status,
        exit_code: res.exit_code,
        log,
      });
    }
    info!(
      duration_secs = res.duration_secs,
      wall_secs = res.wall_secs,
      "dataset loaded"
    );

    let present = self
      .backend
      .dataset_present(cfg)
      .await
      .map_err(SetupError::PresenceCheck)?;
    if !present {
      return Err(SetupError::LoadLeftNoDataset);
    }
    Ok(true)
  }

  pub async fn run(&mut self, resolver: &Resolver) -> Result<SweepSummary, SweepError> {
    let sweep = resolver.sweep();
    let plan = resolver.plan();
    let mut summary = SweepSummary::default();

    fs::create_dir_all(&self.log_dir).map_err(|source| SweepError::CreateDir {
      path: self.log_dir.clone(),
      source,
    })?;
    fs::create_dir_all(resolver.work_dir()).map_err(|source| SweepError::CreateDir {
      path: resolver.work_dir().to_path_buf(),
      source,
    })?;

    // The dataset is the same for every point.
    let first = resolver.point(0);
    debug!(sweep, "SETUP");
    summary.loaded = match self
      .setup(&first, Duration::from_secs(plan.load_timeout_secs))
      .await
    {
      Ok(loaded) => loaded,
      Err(err) => {
        error!(sweep, error = %err, "setup failed");
        return Err(err.into());
      }
    };

    let done: HashSet<RunConfig> = if self.opts.resume {
      let entries = replay(self.ledger.path()).map_err(|source| SweepError::Ledger {
        path: self.ledger.path().to_path_buf(),
        source,
      })?;
      measured_configs(&entries)
    } else {
      HashSet::default()
    };

    let cooldown = Duration::from_secs(plan.cooldown_secs);
    let total = resolver.len();
    let mut cancel = self.cancel.clone();
    for (point, cfg) in resolver.points().enumerate() {
      if cancel.is_cancelled() {
        summary.cancelled = true;
        break;
      }
      if done.contains(&cfg) {
        info!(sweep, point, config = %cfg.label(), "already measured, skipping");
        summary.skipped += 1;
        continue;
      }

      info!(sweep, point, total, config = %cfg.label(), "running point");
      let res = self.run_point(point, cfg).await?;
      summary.count(&res);

      if point + 1 < total && !cooldown.is_zero() {
        debug!(secs = cooldown.as_secs(), "cooling down");
        tokio::select! {
          _ = sleep(cooldown) => {}
          _ = cancel.cancelled() => {}
        };
      }
    }
    if cancel.is_cancelled() {
      summary.cancelled = true;
    }

    info!(
      sweep,
      attempted = summary.attempted,
      measured = summary.measured,
      unmeasured = summary.unmeasured,
      failed = summary.failed,
      timed_out = summary.timed_out,
      skipped = summary.skipped,
      cancelled = summary.cancelled,
      "sweep finished"
    );
    Ok(summary)
  }

  async fn run_point(&mut self, point: usize, cfg: RunConfig) -> Result<RunResult, SweepError> {
    enter(point, Phase::Pending);
    let artifact = self.backend.artifact_path(&cfg);
    let invocation = self.backend.run(&cfg);
    let log = self.log_path(&cfg, &format!("{point:03}"));

    enter(point, Phase::Invalidating);
    if let Err(err) = self.backend.invalidate_cache(&cfg).await {
      warn!(point, error = %err, "cache invalidation failed, continuing");
    }

    enter(point, Phase::Executing);
    debug!(point, command = %invocation, log = %log.display(), "executing");
    let window = MetricsWindow::start();
    let res = self
      .executor
      .execute(&invocation, cfg.timeout(), Some(&log), self.cancel.clone())
      .await;
    let system = window.and_then(MetricsWindow::finish);
    match res.status {
      RunStatus::Success => {}
      RunStatus::Failed => enter(point, Phase::Failed),
      RunStatus::TimedOut => enter(point, Phase::TimedOut),
    };

    enter(point, Phase::Recording);
    let entry = LedgerEntry::new(point, cfg, &res, Some(log.clone()), system);
    let recorded = self.ledger.append(&entry);
    match res.status {
      RunStatus::Success if res.duration_secs.is_some() => info!(
        point,
        duration_secs = res.duration_secs,
        wall_secs = res.wall_secs,
        "point measured"
      ),
      _ => warn!(
        point,
        outcome = entry.outcome(),
        exit_code = res.exit_code,
        wall_secs = res.wall_secs,
        log = %log.display(),
        "point not measured"
      ),
    };

    // Also runs when the append failed, so a dead ledger doesn't leave an artifact behind.
    enter(point, Phase::Reclaiming);
    if let Some(path) = &artifact {
      match self.reclaimer.reclaim(path).await {
        Ok(stats) => debug!(
          point,
          artifact = %path.display(),
          files = stats.files,
          bytes = stats.bytes,
          "artifact reclaimed"
        ),
        Err(err) => warn!(
          point,
          artifact = %path.display(),
          error = %err,
          "artifact reclamation failed, disk usage may grow"
        ),
      };
    }

    recorded.map_err(|source| SweepError::Ledger {
      path: self.ledger.path().to_path_buf(),
      source,
    })?;
    enter(point, Phase::Done);
    Ok(res)
  }
}
