use sortbench_types::RunStatus;
use sortbench_types::SweepParam;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The plan cannot be turned into sweep points.
#[derive(Debug, Error)]
pub enum ResolveError {
  #[error("axis {param} has no values")]
  EmptyAxis { param: SweepParam },

  #[error("axis {param} has an empty value at position {index}")]
  EmptyValue { param: SweepParam, index: usize },

  #[error("default {param} is empty")]
  EmptyDefault { param: SweepParam },

  #[error("unknown placeholder {{{name}}} in output template {template:?}")]
  UnknownPlaceholder { name: String, template: String },

  #[error("points {first} and {second} would both write artifact {path:?}; include the varying parameter in the output template")]
  ArtifactCollision {
    first: usize,
    second: usize,
    path: PathBuf,
  },

  #[error("point {point} would write artifact {artifact:?}, and reclaiming it would delete {protected:?}")]
  ArtifactOverlap {
    point: usize,
    artifact: PathBuf,
    protected: PathBuf,
  },
}

/// The dataset could not be made available. Fatal to the sweep.
#[derive(Debug, Error)]
pub enum SetupError {
  #[error("dataset presence check failed: {0}")]
  PresenceCheck(#[source] BackendError),

  #[error("dataset is not present and loading was skipped")]
  DatasetMissing,

  #[error("dataset load ended with status {status} (exit code {exit_code:?}), see {log:?}")]
  LoadFailed {
    status: RunStatus,
    exit_code: Option<i32>,
    log: PathBuf,
  },

  #[error("dataset load succeeded but the dataset is still not present")]
  LoadLeftNoDataset,
}

#[derive(Debug, Error)]
pub enum SweepError {
  #[error(transparent)]
  Setup(#[from] SetupError),

  #[error("failed to append to ledger {path:?}: {source}")]
  Ledger {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to create directory {path:?}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Failure of a backend side operation (presence check, cache invalidation).
#[derive(Debug, Error)]
pub enum BackendError {
  #[error("{0}")]
  Io(#[from] io::Error),

  #[error("http request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("{program:?} exited with {status}: {stderr}")]
  Command {
    program: PathBuf,
    status: String,
    stderr: String,
  },

  #[error("{program:?} did not finish within {secs} seconds")]
  CommandTimedOut { program: PathBuf, secs: u64 },

  #[error("unexpected response {0:?}")]
  UnexpectedResponse(String),
}
