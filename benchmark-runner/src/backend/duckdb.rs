use super::Backend;
use super::Common;
use crate::error::BackendError;
use crate::executor::Invocation;
use async_trait::async_trait;
use sortbench_types::BackendKind;
use sortbench_types::DuckDbCfg;
use sortbench_types::RunConfig;
use std::io::ErrorKind;
use tokio::fs::metadata;

/// Embedded engine. The dataset is a single database file at `cfg.location`, so presence is file existence.
pub struct DuckDbBackend {
  common: Common,
  cfg: DuckDbCfg,
}

impl DuckDbBackend {
  pub fn new(common: Common, cfg: DuckDbCfg) -> Self {
    Self { common, cfg }
  }
}

#[async_trait]
impl Backend for DuckDbBackend {
  fn kind(&self) -> BackendKind {
    BackendKind::DuckDb
  }

  async fn dataset_present(&self, cfg: &RunConfig) -> Result<bool, BackendError> {
    match metadata(&cfg.location).await {
      Ok(m) => Ok(m.is_file()),
      Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
      Err(err) => Err(err.into()),
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

  // The engine runs in the sorter's own process, so the only cache that outlives a run is the kernel's.
  async fn invalidate_cache(&self, _cfg: &RunConfig) -> Result<(), BackendError> {
    self.common.maybe_drop_os_caches().await
  }

  fn run(&self, cfg: &RunConfig) -> Invocation {
    let mut inv = Invocation::new(&self.common.sorter)
      .flag("--db", &cfg.location)
      .flag("--table", &cfg.table)
      .flag("--memory-limit", &cfg.memory_limit);
    if let Some(flag) = &self.cfg.threads_flag {
      inv = inv.flag(flag, &cfg.threads);
    }
    if let Some(output) = &cfg.output {
      inv = inv.flag("--output", output);
    }
    if let Some(temp_dir) = &cfg.temp_dir {
      inv = inv.flag("--temp-dir", temp_dir);
    }
    inv
  }
}
