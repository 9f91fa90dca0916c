use super::capture;
use super::run_script;
use super::Backend;
use super::Common;
use super::PROBE_TIMEOUT;
use crate::error::BackendError;
use crate::executor::Invocation;
use crate::memory::per_worker_memory;
use async_trait::async_trait;
use sortbench_types::BackendKind;
use sortbench_types::PostgresCfg;
use sortbench_types::RunConfig;
use tokio::process::Command;
use tracing::debug;

/// Relational server, reached with the connection string in `cfg.location`.
pub struct PostgresBackend {
  common: Common,
  cfg: PostgresCfg,
}

impl PostgresBackend {
  pub fn new(common: Common, cfg: PostgresCfg) -> Self {
    Self { common, cfg }
  }

  /// `work_mem` applies per sort worker, so the budget is split across threads.
  fn work_mem(cfg: &RunConfig) -> String {
    per_worker_memory(&cfg.memory_limit, &cfg.threads).unwrap_or_else(|| cfg.memory_limit.clone())
  }

  /// The sorter has no worker count flag, so the count goes in as a session setting on the connection. The leader sorts too, so `threads` processes means one fewer parallel worker.
  fn connection(cfg: &RunConfig) -> String {
    let workers = match cfg.threads.trim().parse::<u64>() {
      Ok(n) if n >= 1 => (n - 1).to_string(),
      _ => cfg.threads.clone(),
    };
    let options = format!("-c max_parallel_workers_per_gather={workers}");
    let location = &cfg.location;
    if location.starts_with("postgres://") || location.starts_with("postgresql://") {
      let sep = if location.contains('?') { '&' } else { '?' };
      format!(
        "{location}{sep}options={}",
        options
          .replace('%', "%25")
          .replace(' ', "%20")
          .replace('=', "%3D")
          .replace('&', "%26")
      )
    } else {
      format!("{location} options='{}'", options.replace('\\', "\\\\").replace('\'', "\\'"))
    }
  }
}

fn quote_literal(s: &str) -> String {
  format!("'{}'", s.replace('\'', "''"))
}

#[async_trait]
impl Backend for PostgresBackend {
  fn kind(&self) -> BackendKind {
    BackendKind::Postgres
  }

  async fn dataset_present(&self, cfg: &RunConfig) -> Result<bool, BackendError> {
    let sql = format!(
      "SELECT to_regclass({}) IS NOT NULL",
      quote_literal(&cfg.table)
    );
    let mut command = Command::new(&self.cfg.psql);
    command
      .arg("-X")
      .arg("-t")
      .arg("-A")
      .arg("-c")
      .arg(&sql)
      .arg(&cfg.location);
    let out = capture(command, PROBE_TIMEOUT).await?;
    match out.trim() {
      "t" => Ok(true),
      "f" => Ok(false),
      other => Err(BackendError::UnexpectedResponse(other.to_string())),
    }
  }

  fn load(&self, cfg: &RunConfig) -> Invocation {
    Invocation::new(&self.common.loader)
      .flag("--format", cfg.format.to_string())
      .flag("--input", &cfg.input)
      .flag("--db", &cfg.location)
      .flag("--table", &cfg.table)
      .flag("--threads", cfg.load_threads.to_string())
  }

  // Shared buffers only empty on restart, which is what `cache_reset_script` is for.
  async fn invalidate_cache(&self, _cfg: &RunConfig) -> Result<(), BackendError> {
    let script_res = match &self.cfg.cache_reset_script {
      Some(script) => run_script(script).await,
      None => {
        debug!("no cache reset script configured");
        Ok(())
      }
    };
    let os_res = self.common.maybe_drop_os_caches().await;
    script_res.and(os_res)
  }

  fn run(&self, cfg: &RunConfig) -> Invocation {
    let mut inv = Invocation::new(&self.common.sorter)
      .flag("--db", Self::connection(cfg))
      .flag("--table", &cfg.table)
      .flag("--work-mem", Self::work_mem(cfg));
    if let Some(output) = &cfg.output {
      inv = inv.flag("--output", output);
    }
    if let Some(temp_dir) = &cfg.temp_dir {
      inv = inv.flag("--temp-tablespace", temp_dir);
    }
    inv
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::tests::args;
  use crate::backend::tests::run_config;
  use std::os::unix::fs::PermissionsExt;
  use std::path::Path;
  use std::path::PathBuf;

  fn backend(psql: PathBuf) -> PostgresBackend {
    PostgresBackend::new(
      Common {
        loader: PathBuf::from("load-postgres"),
        sorter: PathBuf::from("sort-postgres"),
        drop_os_caches: false,
      },
      PostgresCfg {
        psql,
        cache_reset_script: None,
      },
    )
  }

  fn fake_psql(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("psql");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
  }

  #[tokio::test]
  async fn test_presence_via_psql() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = run_config(BackendKind::Postgres);

    let b = backend(fake_psql(dir.path(), "echo t"));
    assert!(b.dataset_present(&cfg).await.unwrap());

    let b = backend(fake_psql(dir.path(), "echo f"));
    assert!(!b.dataset_present(&cfg).await.unwrap());

    let b = backend(fake_psql(
      dir.path(),
      "echo 'could not connect to server' 1>&2; exit 2",
    ));
    assert!(matches!(
      b.dataset_present(&cfg).await,
      Err(BackendError::Command { .. })
    ));
  }

  #[tokio::test]
  async fn test_presence_query_names_table() {
    let dir = tempfile::tempdir().unwrap();
    // Echo the SQL argument back to check it without a server.
    let b = backend(fake_psql(dir.path(), "echo \"$5\" 1>&2; exit 1"));
    let mut cfg = run_config(BackendKind::Postgres);
    cfg.table = "it's".to_string();
    match b.dataset_present(&cfg).await {
      Err(BackendError::Command { stderr, .. }) => {
        assert_eq!(stderr, "SELECT to_regclass('it''s') IS NOT NULL")
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn test_run_splits_memory_across_workers() {
    let mut cfg = run_config(BackendKind::Postgres);
    cfg.location = "postgres://bench@localhost/bench".to_string();
    cfg.temp_dir = Some(PathBuf::from("fast_ssd"));
    let inv = backend(PathBuf::from("psql")).run(&cfg);
    assert_eq!(
      args(&inv),
      vec![
        "--db",
        "postgres://bench@localhost/bench?options=-c%20max_parallel_workers_per_gather%3D3",
        "--table",
        "bench_data",
        "--work-mem",
        "262144kB",
        "--output",
        "/work/out.parquet",
        "--temp-tablespace",
        "fast_ssd"
      ]
    );
  }

  #[test]
  fn test_worker_count_goes_into_connection() {
    let mut cfg = run_config(BackendKind::Postgres);
    cfg.threads = "16".to_string();
    cfg.location = "postgresql://bench@localhost/bench?sslmode=disable".to_string();
    assert_eq!(
      PostgresBackend::connection(&cfg),
      "postgresql://bench@localhost/bench?sslmode=disable&options=-c%20max_parallel_workers_per_gather%3D15"
    );

    cfg.threads = "1".to_string();
    cfg.location = "host=localhost dbname=bench".to_string();
    assert_eq!(
      PostgresBackend::connection(&cfg),
      "host=localhost dbname=bench options='-c max_parallel_workers_per_gather=0'"
    );

    // The ledger key keeps the plain location.
    let inv = backend(PathBuf::from("psql")).run(&cfg);
    assert_eq!(cfg.location, "host=localhost dbname=bench");
    assert!(!args(&inv).iter().any(|a| a == "--threads"));
  }

  #[test]
  fn test_run_passes_malformed_memory_through() {
    let mut cfg = run_config(BackendKind::Postgres);
    cfg.memory_limit = "plenty".to_string();
    let inv = backend(PathBuf::from("psql")).run(&cfg);
    let a = args(&inv);
    let i = a.iter().position(|x| x == "--work-mem").unwrap();
    assert_eq!(a[i + 1], "plenty");
  }

  #[tokio::test]
  async fn test_cache_reset_script_failure_surfaces() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("restart.sh");
    std::fs::write(&script, "exit 1\n").unwrap();
    let mut b = backend(PathBuf::from("psql"));
    b.cfg.cache_reset_script = Some(script);
    assert!(b
      .invalidate_cache(&run_config(BackendKind::Postgres))
      .await
      .is_err());
  }
}
