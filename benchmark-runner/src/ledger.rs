use ahash::HashSet;
use ahash::HashSetExt;
use sortbench_types::LedgerEntry;
use sortbench_types::RunConfig;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use tracing::warn;

/// Append-only JSON Lines file, one entry per attempted sweep point.
pub struct Ledger {
  path: PathBuf,
  file: File,
}

impl Ledger {
  pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
    let path = path.into();
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Self { path, file })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Returns once the entry is on stable storage.
  pub fn append(&mut self, entry: &LedgerEntry) -> io::Result<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    self.file.write_all(&line)?;
    self.file.sync_data()
  }
}

/// All entries in the order they were appended. A missing ledger has no entries. A torn final line, left by a crash mid-append, is skipped.
pub fn replay(path: &Path) -> io::Result<Vec<LedgerEntry>> {
  let file = match File::open(path) {
    Ok(f) => f,
    Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
    Err(err) => return Err(err),
  };
  let mut lines = BufReader::new(file).lines().enumerate().peekable();
  let mut entries = Vec::new();
  while let Some((i, line)) = lines.next() {
    let line = line?;
    if line.trim().is_empty() {
      continue;
    }
    match serde_json::from_str(&line) {
      Ok(entry) => entries.push(entry),
      Err(err) if lines.peek().is_none() => {
        warn!(ledger = %path.display(), line = i + 1, error = %err, "ignoring incomplete final ledger entry");
      }
      Err(err) => {
        return Err(io::Error::new(
          ErrorKind::InvalidData,
          format!("{}:{}: {}", path.display(), i + 1, err),
        ))
      }
    }
  }
  Ok(entries)
}

/// Configurations that already have a measured success.
pub fn measured_configs(entries: &[LedgerEntry]) -> HashSet<RunConfig> {
  let mut set = HashSet::new();
  for e in entries {
    if e.is_measured() {
      set.insert(e.config.clone());
    }
  }
  set
}
