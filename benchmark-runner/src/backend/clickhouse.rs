use super::Backend;
use super::Common;
use super::PROBE_TIMEOUT;
use crate::error::BackendError;
use crate::executor::Invocation;
use async_trait::async_trait;
use reqwest::Client;
use sortbench_types::BackendKind;
use sortbench_types::ClickHouseCfg;
use sortbench_types::RunConfig;
use tracing::debug;

const DEFAULT_DATABASE: &str = "default";

const DROP_CACHE_STATEMENTS: &[&str] = &[
  "SYSTEM DROP MARK CACHE",
  "SYSTEM DROP UNCOMPRESSED CACHE",
];

/// Columnar server, reached over its HTTP interface at `cfg.location`.
pub struct ClickHouseBackend {
  common: Common,
  cfg: ClickHouseCfg,
  client: Client,
}

impl ClickHouseBackend {
  pub fn new(common: Common, cfg: ClickHouseCfg) -> Result<Self, BackendError> {
    let client = Client::builder().timeout(PROBE_TIMEOUT).build()?;
    Ok(Self {
      common,
      cfg,
      client,
    })
  }

  fn database(cfg: &RunConfig) -> &str {
    cfg.database.as_deref().unwrap_or(DEFAULT_DATABASE)
  }

  async fn query(&self, cfg: &RunConfig, sql: &str) -> Result<String, BackendError> {
    debug!(sql, "clickhouse query");
    let mut req = self
      .client
      .post(&cfg.location)
      .query(&[("database", Self::database(cfg))])
      .body(sql.to_string());
    if let Some(user) = &self.cfg.user {
      req = req.header("X-ClickHouse-User", user);
    }
    if let Some(password) = &self.cfg.password {
      req = req.header("X-ClickHouse-Key", password);
    }
    let res = req.send().await?;
    let status = res.status();
    let body = res.text().await?;
    if !status.is_success() {
      return Err(BackendError::UnexpectedResponse(format!(
        "{status}: {}",
        body.trim()
      )));
    }
    Ok(body)
  }
}

#[async_trait]
impl Backend for ClickHouseBackend {
  fn kind(&self) -> BackendKind {
    BackendKind::ClickHouse
  }

  async fn dataset_present(&self, cfg: &RunConfig) -> Result<bool, BackendError> {
    let body = self
      .query(
        cfg,
        &format!("EXISTS TABLE {}.{}", Self::database(cfg), cfg.table),
      )
      .await?;
    match body.trim() {
      "1" => Ok(true),
      "0" => Ok(false),
      other => Err(BackendError::UnexpectedResponse(other.to_string())),
    }
  }

  fn load(&self, cfg: &RunConfig) -> Invocation {
    Invocation::new(&self.common.loader)
      .flag("--format", cfg.format.to_string())
      .flag("--input", &cfg.input)
      .flag("--url", &cfg.location)
      .flag("--database", Self::database(cfg))
      .flag("--table", &cfg.table)
      .flag("--threads", cfg.load_threads.to_string())
  }

  // Every statement is attempted even if an earlier one fails; the first error is reported.
  async fn invalidate_cache(&self, cfg: &RunConfig) -> Result<(), BackendError> {
    let mut first_err = None;
    for sql in DROP_CACHE_STATEMENTS {
      if let Err(err) = self.query(cfg, sql).await {
        first_err.get_or_insert(err);
      }
    }
    if let Err(err) = self.common.maybe_drop_os_caches().await {
      first_err.get_or_insert(err);
    }
    match first_err {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  fn run(&self, cfg: &RunConfig) -> Invocation {
    let mut inv = Invocation::new(&self.common.sorter)
      .flag("--url", &cfg.location)
      .flag("--database", Self::database(cfg))
      .flag("--table", &cfg.table)
      .flag("--memory-limit", &cfg.memory_limit)
      .flag("--threads", &cfg.threads);
    if let Some(output) = &cfg.output {
      inv = inv.flag("--output", output);
    }
    inv
  }
}
