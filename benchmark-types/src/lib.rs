use chrono::DateTime;
use chrono::Utc;
use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use strum::Display;
use strum::EnumString;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Deserialize, Serialize, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum BackendKind {
  DuckDb,
  Postgres,
  ClickHouse,
}

impl BackendKind {
  /// Lowercase name, used for default executable names and in artifact paths.
  pub fn slug(self) -> &'static str {
    match self {
      BackendKind::DuckDb => "duckdb",
      BackendKind::Postgres => "postgres",
      BackendKind::ClickHouse => "clickhouse",
    }
  }

  /// Artifact template used when the plan doesn't set `defaults.output`. ClickHouse can discard its output (`FORMAT Null`), so it doesn't need one.
  pub fn default_output_template(self) -> Option<&'static str> {
    match self {
      BackendKind::DuckDb => Some("{table}-sorted-{threads}t-{memory}.parquet"),
      BackendKind::Postgres => Some("{table}-sorted-{threads}t-{memory}.bin"),
      BackendKind::ClickHouse => None,
    }
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Deserialize, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DatasetFormat {
  Gensort,
  Kvbin,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Deserialize, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SweepParam {
  Threads,
  MemoryLimit,
}

/// How multiple axes are combined into sweep points.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize, Serialize)]
pub enum Combine {
  /// Vary one axis at a time, holding every other parameter at its default.
  #[default]
  Vary,
  /// Cartesian product of all axes, first axis outermost.
  Product,
}

/// A knob value as written by the user. Numbers are accepted and kept as text, as values are passed verbatim to the backend.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
#[serde(transparent)]
pub struct Knob(pub String);

impl Knob {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for Knob {
  fn from(value: &str) -> Self {
    Knob(value.to_string())
  }
}

impl fmt::Display for Knob {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl<'de> Deserialize<'de> for Knob {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    struct KnobVisitor;

    impl<'de> de::Visitor<'de> for KnobVisitor {
      type Value = Knob;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a string or number")
      }

      fn visit_str<E: de::Error>(self, v: &str) -> Result<Knob, E> {
        Ok(Knob(v.to_string()))
      }

      fn visit_u64<E: de::Error>(self, v: u64) -> Result<Knob, E> {
        Ok(Knob(v.to_string()))
      }

      fn visit_i64<E: de::Error>(self, v: i64) -> Result<Knob, E> {
        Ok(Knob(v.to_string()))
      }

      fn visit_f64<E: de::Error>(self, v: f64) -> Result<Knob, E> {
        Ok(Knob(v.to_string()))
      }
    }

    deserializer.deserialize_any(KnobVisitor)
  }
}

fn default_table() -> String {
  "bench_data".to_string()
}

fn default_load_threads() -> usize {
  1
}

fn default_threads() -> Knob {
  Knob::from("1")
}

fn default_memory_limit() -> Knob {
  Knob::from("1GB")
}

fn default_timeout_secs() -> u64 {
  3600
}

fn default_load_timeout_secs() -> u64 {
  4 * 3600
}

fn default_cooldown_secs() -> u64 {
  5
}

fn default_drop_os_caches() -> bool {
  true
}

fn default_psql() -> PathBuf {
  PathBuf::from("psql")
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetCfg {
  /// Raw input file handed to the loader. Relative to the sweep folder.
  pub input: PathBuf,
  pub format: DatasetFormat,
  /// DuckDB database file (relative to the sweep folder), Postgres connection string, or ClickHouse HTTP URL.
  pub location: String,
  /// Only applicable for the ClickHouse backend. Defaults to "default".
  pub database: Option<String>,
  #[serde(default = "default_table")]
  pub table: String,
  #[serde(default = "default_load_threads")]
  pub load_threads: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PointDefaults {
  #[serde(default = "default_threads")]
  pub threads: Knob,
  /// Size string with unit suffix, e.g. "4GB". Not validated; the backend interprets it.
  #[serde(default = "default_memory_limit")]
  pub memory_limit: Knob,
  /// Spill directory (DuckDB) or temp tablespace (Postgres).
  pub temp_dir: Option<PathBuf>,
  /// Artifact path template. Placeholders: {backend}, {table}, {threads}, {memory}, {point}.
  pub output: Option<String>,
}

impl Default for PointDefaults {
  fn default() -> Self {
    Self {
      threads: default_threads(),
      memory_limit: default_memory_limit(),
      temp_dir: None,
      output: None,
    }
  }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SweepAxis {
  pub param: SweepParam,
  /// Order is preserved, e.g. largest first to fail fast.
  pub values: Vec<Knob>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Commands {
  /// Defaults to `load-<backend>` on PATH.
  pub loader: Option<PathBuf>,
  /// Defaults to `sort-<backend>` on PATH.
  pub sorter: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DuckDbCfg {
  /// Flag the sorter takes for its worker count, e.g. "--threads". Without it the thread knob isn't passed, so the engine uses all cores.
  pub threads_flag: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresCfg {
  #[serde(default = "default_psql")]
  pub psql: PathBuf,
  /// Run before every point, e.g. to restart the server and empty shared buffers. Relative to the sweep folder.
  pub cache_reset_script: Option<PathBuf>,
}

impl Default for PostgresCfg {
  fn default() -> Self {
    Self {
      psql: default_psql(),
      cache_reset_script: None,
    }
  }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClickHouseCfg {
  pub user: Option<String>,
  pub password: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SweepPlan {
  pub backend: BackendKind,

  pub dataset: DatasetCfg,

  #[serde(default)]
  pub defaults: PointDefaults,

  /// No axes means a single point at the defaults.
  #[serde(default)]
  pub axes: Vec<SweepAxis>,

  #[serde(default)]
  pub combine: Combine,

  /// Per-run timeout. Defaults to 1 hour.
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,

  /// Dataset load timeout. Defaults to 4 hours.
  #[serde(default = "default_load_timeout_secs")]
  pub load_timeout_secs: u64,

  /// Delay between points. Defaults to 5 seconds.
  #[serde(default = "default_cooldown_secs")]
  pub cooldown_secs: u64,

  /// Drop the kernel page cache before every point (requires root).
  #[serde(default = "default_drop_os_caches")]
  pub drop_os_caches: bool,

  /// Relative artifact paths are placed here. Defaults to `work` inside the sweep folder, and is itself relative to the sweep folder.
  pub work_dir: Option<PathBuf>,

  #[serde(default)]
  pub commands: Commands,

  #[serde(default)]
  pub duckdb: DuckDbCfg,

  #[serde(default)]
  pub postgres: PostgresCfg,

  #[serde(default)]
  pub clickhouse: ClickHouseCfg,
}

/// Fully resolved parameters of one sweep point. Also the ledger key.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Deserialize, Serialize)]
pub struct RunConfig {
  pub sweep: String,
  pub backend: BackendKind,
  pub input: PathBuf,
  pub format: DatasetFormat,
  pub location: String,
  pub database: Option<String>,
  pub table: String,
  pub load_threads: usize,
  pub threads: String,
  pub memory_limit: String,
  pub temp_dir: Option<PathBuf>,
  pub output: Option<PathBuf>,
  pub timeout_secs: u64,
}

impl RunConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }

  pub fn label(&self) -> String {
    format!(
      "{} ({} threads, {} memory)",
      self.backend, self.threads, self.memory_limit
    )
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Deserialize, Serialize, Display)]
pub enum RunStatus {
  Success,
  Failed,
  TimedOut,
}

#[derive(Clone, Debug)]
pub struct RunResult {
  pub status: RunStatus,
  /// Self-reported by the operation. Only present on success.
  pub duration_secs: Option<f64>,
  /// Measured by the executor, for cross-checking.
  pub wall_secs: f64,
  pub exit_code: Option<i32>,
  /// Interleaved stdout and stderr.
  pub output: String,
  pub started: DateTime<Utc>,
}

impl RunResult {
  pub fn is_measured(&self) -> bool {
    self.status == RunStatus::Success && self.duration_secs.is_some()
  }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SystemMetrics {
  pub peak_memory_bytes: u64,
  pub cpu_user_secs: f64,
  pub cpu_system_secs: f64,
  pub disk_read_bytes: u64,
  pub disk_write_bytes: u64,
  pub disk_read_ops: u64,
  pub disk_write_ops: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LedgerEntry {
  pub recorded: DateTime<Utc>,
  pub point: usize,
  pub config: RunConfig,
  pub status: RunStatus,
  pub duration_secs: Option<f64>,
  pub wall_secs: f64,
  pub exit_code: Option<i32>,
  pub log: Option<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub system: Option<SystemMetrics>,
}

impl LedgerEntry {
  pub fn new(
    point: usize,
    config: RunConfig,
    result: &RunResult,
    log: Option<PathBuf>,
    system: Option<SystemMetrics>,
  ) -> Self {
    Self {
      recorded: Utc::now(),
      point,
      config,
      status: result.status,
      duration_secs: result.duration_secs,
      wall_secs: result.wall_secs,
      exit_code: result.exit_code,
      log,
      system,
    }
  }

  pub fn is_measured(&self) -> bool {
    self.status == RunStatus::Success && self.duration_secs.is_some()
  }

  /// Distinguishes a success without a timing signal from a measured one.
  pub fn outcome(&self) -> &'static str {
    match (self.status, self.duration_secs) {
      (RunStatus::Success, Some(_)) => "success",
      (RunStatus::Success, None) => "success (no timing)",
      (RunStatus::Failed, _) => "failed",
      (RunStatus::TimedOut, _) => "timed out",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const PLAN: &str = r#"
backend: DuckDb
dataset:
  input: data/gensort.dat
  format: Gensort
  location: work/bench.duckdb
defaults:
  memory_limit: 4GB
axes:
  - param: Threads
    values: [64, 16, "4"]
timeout_secs: 600
"#;

  #[test]
  fn test_plan_defaults() {
    let plan: SweepPlan = serde_yaml::from_str(PLAN).unwrap();
    assert_eq!(plan.backend, BackendKind::DuckDb);
    assert_eq!(plan.dataset.table, "bench_data");
    assert_eq!(plan.dataset.load_threads, 1);
    assert_eq!(plan.defaults.threads, Knob::from("1"));
    assert_eq!(plan.defaults.memory_limit, Knob::from("4GB"));
    assert_eq!(plan.combine, Combine::Vary);
    assert_eq!(plan.timeout_secs, 600);
    assert_eq!(plan.cooldown_secs, 5);
    assert!(plan.drop_os_caches);
    assert_eq!(plan.postgres.psql, PathBuf::from("psql"));
  }

  #[test]
  fn test_numeric_knobs_kept_as_text() {
    let plan: SweepPlan = serde_yaml::from_str(PLAN).unwrap();
    let values: Vec<&str> = plan.axes[0].values.iter().map(|v| v.as_str()).collect();
    assert_eq!(values, vec!["64", "16", "4"]);
  }

  #[test]
  fn test_unknown_field_rejected() {
    let raw = format!("{}\nthreadz: 4\n", PLAN);
    assert!(serde_yaml::from_str::<SweepPlan>(&raw).is_err());
  }

  #[test]
  fn test_backend_kind_from_str() {
    assert_eq!("duckdb".parse::<BackendKind>().unwrap(), BackendKind::DuckDb);
    assert_eq!(
      "ClickHouse".parse::<BackendKind>().unwrap(),
      BackendKind::ClickHouse
    );
    assert!("sqlite".parse::<BackendKind>().is_err());
  }

  #[test]
  fn test_format_display_is_loader_arg() {
    assert_eq!(DatasetFormat::Gensort.to_string(), "gensort");
    assert_eq!(DatasetFormat::Kvbin.to_string(), "kvbin");
  }

  #[test]
  fn test_ledger_entry_outcome() {
    let config = RunConfig {
      sweep: "s".to_string(),
      backend: BackendKind::Postgres,
      input: PathBuf::from("in.dat"),
      format: DatasetFormat::Kvbin,
      location: "postgres://localhost/bench".to_string(),
      database: None,
      table: "bench_data".to_string(),
      load_threads: 4,
      threads: "8".to_string(),
      memory_limit: "1GB".to_string(),
      temp_dir: None,
      output: None,
      timeout_secs: 60,
    };
    let mut result = RunResult {
      status: RunStatus::Success,
      duration_secs: None,
      wall_secs: 1.5,
      exit_code: Some(0),
      output: String::new(),
      started: Utc::now(),
    };
    let entry = LedgerEntry::new(0, config.clone(), &result, None, None);
    assert_eq!(entry.outcome(), "success (no timing)");
    assert!(!entry.is_measured());

    result.duration_secs = Some(1.2);
    let entry = LedgerEntry::new(1, config, &result, None, None);
    assert_eq!(entry.outcome(), "success");
    assert!(entry.is_measured());

    let json = serde_json::to_string(&entry).unwrap();
    assert!(!json.contains("system"));
    let back: LedgerEntry = serde_json::from_str(&json).unwrap();
    assert_eq!(back, entry);
  }
}
