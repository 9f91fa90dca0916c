use async_trait::async_trait;
use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use tokio::task::spawn_blocking;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReclaimStats {
  pub files: u64,
  /// Bytes released by truncation, i.e. before any open handle is closed.
  pub bytes: u64,
  pub truncate_failures: u64,
}

#[async_trait]
pub trait Reclaimer: Send + Sync {
  /// A path that doesn't exist is a no-op.
  async fn reclaim(&self, path: &Path) -> io::Result<ReclaimStats>;
}

/// Truncates every regular file under the path, removes the path, then syncs. Truncating first releases disk blocks even if a backend process still holds a file open.
#[derive(Clone, Debug)]
pub struct FsReclaimer {
  pub sync: bool,
}

impl Default for FsReclaimer {
  fn default() -> Self {
    Self { sync: true }
  }
}

#[async_trait]
impl Reclaimer for FsReclaimer {
  async fn reclaim(&self, path: &Path) -> io::Result<ReclaimStats> {
    let path: PathBuf = path.to_path_buf();
    let sync = self.sync;
    spawn_blocking(move || reclaim_path(&path, sync))
      .await
      .map_err(io::Error::other)?
  }
}

pub fn reclaim_path(path: &Path, sync: bool) -> io::Result<ReclaimStats> {
  let meta = match fs::symlink_metadata(path) {
    Ok(m) => m,
    Err(err) if err.kind() == ErrorKind::NotFound => return Ok(ReclaimStats::default()),
    Err(err) => return Err(err),
  };

  let mut stats = ReclaimStats::default();
  if meta.is_dir() {
    for ent in WalkDir::new(path) {
      let ent = ent?;
      if ent.file_type().is_file() {
        truncate_into(ent.path(), &mut stats);
      }
    }
    fs::remove_dir_all(path)?;
  } else {
    // Symlinks are removed without touching their target.
    if meta.is_file() {
      truncate_into(path, &mut stats);
    }
    fs::remove_file(path)?;
  }

  if sync {
    unsafe {
      libc::sync();
    }
  }
  Ok(stats)
}

fn truncate_into(path: &Path, stats: &mut ReclaimStats) {
  stats.files += 1;
  let res = OpenOptions::new().write(true).open(path).and_then(|f| {
    let len = f.metadata()?.len();
    f.set_len(0)?;
    Ok(len)
  });
  match res {
    Ok(len) => stats.bytes += len,
    Err(err) => {
      debug!(path = %path.display(), error = %err, "truncate failed, removing anyway");
      stats.truncate_failures += 1;
    }
  }
}
