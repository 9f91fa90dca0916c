use crate::error::BackendError;
use crate::executor::Invocation;
use async_trait::async_trait;
use sortbench_types::BackendKind;
use sortbench_types::RunConfig;
use sortbench_types::SweepParam;
use sortbench_types::SweepPlan;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tracing::info;
use tracing::warn;

pub mod clickhouse;
pub mod duckdb;
pub mod postgres;

/// Bound on presence checks and other metadata queries.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on user-provided cache reset scripts, which may restart a server.
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(600);

/// A system under benchmark. Load and run are external operations, returned bound to a configuration so the executor can run them under a deadline.
#[async_trait]
pub trait Backend: Send + Sync {
  fn kind(&self) -> BackendKind;

  /// Must not change any state.
  async fn dataset_present(&self, cfg: &RunConfig) -> Result<bool, BackendError>;

  /// Bulk ingest of `cfg.input`. On success `dataset_present` must return true.
  fn load(&self, cfg: &RunConfig) -> Invocation;

  /// Best effort; the caller ignores failures.
  async fn invalidate_cache(&self, cfg: &RunConfig) -> Result<(), BackendError>;

  /// One sort, writing to `artifact_path` if set, otherwise discarding output.
  fn run(&self, cfg: &RunConfig) -> Invocation;

  fn artifact_path(&self, cfg: &RunConfig) -> Option<PathBuf> {
    cfg.output.clone()
  }
}

/// Settings every backend shares.
#[derive(Clone, Debug)]
pub struct Common {
  pub loader: PathBuf,
  pub sorter: PathBuf,
  pub drop_os_caches: bool,
}

impl Common {
  pub fn from_plan(plan: &SweepPlan) -> Self {
    let slug = plan.backend.slug();
    Self {
      loader: plan
        .commands
        .loader
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("load-{slug}"))),
      sorter: plan
        .commands
        .sorter
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("sort-{slug}"))),
      drop_os_caches: plan.drop_os_caches,
    }
  }

  pub(crate) async fn maybe_drop_os_caches(&self) -> Result<(), BackendError> {
    if self.drop_os_caches {
      drop_os_caches().await?;
    }
    Ok(())
  }
}

pub fn build(plan: &SweepPlan) -> Result<Arc<dyn Backend>, BackendError> {
  let common = Common::from_plan(plan);
  if plan.backend == BackendKind::DuckDb
    && plan.duckdb.threads_flag.is_none()
    && plan.axes.iter().any(|a| a.param == SweepParam::Threads)
  {
    warn!("threads axis has no effect on DuckDB without duckdb.threads_flag");
  }
  Ok(match plan.backend {
    BackendKind::DuckDb => Arc::new(duckdb::DuckDbBackend::new(
      common,
      plan.duckdb.clone(),
    )),
    BackendKind::Postgres => Arc::new(postgres::PostgresBackend::new(
      common,
      plan.postgres.clone(),
    )),
    BackendKind::ClickHouse => Arc::new(clickhouse::ClickHouseBackend::new(
      common,
      plan.clickhouse.clone(),
    )?),
  })
}

/// Flushes dirty pages then drops the kernel page, dentry and inode caches. Requires root.
pub async fn drop_os_caches() -> Result<(), BackendError> {
  info!("dropping kernel caches");
  spawn_blocking(|| {
    unsafe {
      libc::sync();
    }
    std::fs::write("/proc/sys/vm/drop_caches", "3")
  })
  .await
  .map_err(std::io::Error::other)??;
  Ok(())
}

pub async fn run_script(script_path: &Path) -> Result<(), BackendError> {
  info!(script = %script_path.display(), "running script");
  let mut command = Command::new("bash");
  command.arg(script_path);
  let out = capture(command, SCRIPT_TIMEOUT).await?;
  if !out.trim().is_empty() {
    info!(script = %script_path.display(), output = out.trim_end(), "script output");
  }
  Ok(())
}

/// Runs a short helper command and returns its stdout. Non-zero exit is an error.
pub(crate) async fn capture(mut command: Command, limit: Duration) -> Result<String, BackendError> {
  let program = PathBuf::from(command.as_std().get_program());
  command.stdin(Stdio::null()).kill_on_drop(true);
  let output = match timeout(limit, command.output()).await {
    Ok(res) => res?,
    Err(_) => {
      return Err(BackendError::CommandTimedOut {
        program,
        secs: limit.as_secs(),
      })
    }
  };
  if !output.status.success() {
    return Err(BackendError::Command {
      program,
      status: output.status.to_string(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }
  Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use sortbench_types::DatasetFormat;

  pub(crate) fn run_config(backend: BackendKind) -> RunConfig {
    RunConfig {
      sweep: "test".to_string(),
      backend,
      input: PathBuf::from("/data/gensort.dat"),
      format: DatasetFormat::Gensort,
      location: "bench.duckdb".to_string(),
      database: None,
      table: "bench_data".to_string(),
      load_threads: 8,
      threads: "4".to_string(),
      memory_limit: "1GB".to_string(),
      temp_dir: None,
      output: Some(PathBuf::from("/work/out.parquet")),
      timeout_secs: 60,
    }
  }

  pub(crate) fn args(inv: &Invocation) -> Vec<String> {
    inv
      .args
      .iter()
      .map(|a| a.to_string_lossy().into_owned())
      .collect()
  }

  #[test]
  fn test_default_commands() {
    let plan: SweepPlan = serde_yaml::from_str(
      "backend: ClickHouse\ndataset:\n  input: in.dat\n  format: Kvbin\n  location: http://localhost:8123\n",
    )
    .unwrap();
    let common = Common::from_plan(&plan);
    assert_eq!(common.loader, PathBuf::from("load-clickhouse"));
    assert_eq!(common.sorter, PathBuf::from("sort-clickhouse"));
    assert!(common.drop_os_caches);
  }

  #[tokio::test]
  async fn test_capture() {
    let mut ok = Command::new("sh");
    ok.arg("-c").arg("echo t");
    assert_eq!(capture(ok, PROBE_TIMEOUT).await.unwrap(), "t\n");

    let mut bad = Command::new("sh");
    bad.arg("-c").arg("echo nope 1>&2; exit 2");
    match capture(bad, PROBE_TIMEOUT).await {
      Err(BackendError::Command { stderr, .. }) => assert_eq!(stderr, "nope"),
      other => panic!("unexpected {other:?}"),
    }

    let mut slow = Command::new("sh");
    slow.arg("-c").arg("sleep 30");
    assert!(matches!(
      capture(slow, Duration::from_millis(200)).await,
      Err(BackendError::CommandTimedOut { .. })
    ));
  }
}
