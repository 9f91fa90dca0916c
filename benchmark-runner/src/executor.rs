use crate::cancel::CancelSignal;
use crate::timing::parse_timing;
use chrono::Utc;
use parking_lot::Mutex;
use sortbench_types::RunResult;
use sortbench_types::RunStatus;
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::spawn;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

// Self-reported timings may legitimately differ slightly from our wall clock due to rounding and process startup.
const TIMING_WALL_SLACK_SECS: f64 = 1.0;

/// A backend operation bound to one configuration: an external program and its arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
  pub program: PathBuf,
  pub args: Vec<OsString>,
  pub envs: Vec<(OsString, OsString)>,
}

impl Invocation {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
      args: Vec::new(),
      envs: Vec::new(),
    }
  }

  pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
    self.args.push(arg.into());
    self
  }

  /// Adds `--flag value`.
  pub fn flag(self, flag: &str, value: impl Into<OsString>) -> Self {
    self.arg(flag).arg(value)
  }

  pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
    self.envs.push((key.into(), value.into()));
    self
  }
}

impl fmt::Display for Invocation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.program.display())?;
    for arg in &self.args {
      let arg = arg.to_string_lossy();
      if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '\'') {
        write!(f, " '{}'", arg.replace('\'', r"'\''"))?;
      } else {
        write!(f, " {}", arg)?;
      }
    }
    Ok(())
  }
}

enum Ending {
  Exited(std::io::Result<ExitStatus>),
  TimedOut,
  Cancelled,
}

/// Runs one invocation to completion or until its deadline, whichever is first.
#[derive(Clone, Debug)]
pub struct Executor {
  /// How long to keep draining output after the process has been killed. Bounds the wait when a descendant escaped the process group and still holds the pipes.
  pub drain_grace: Duration,
}

impl Default for Executor {
  fn default() -> Self {
    Self {
      drain_grace: Duration::from_secs(2),
    }
  }
}

impl Executor {
  /// Never fails: spawn errors, non-zero exits, timeouts and cancellations all become a `RunResult`. If `log` is set, output lines are appended to it as they arrive.
  pub async fn execute(
    &self,
    invocation: &Invocation,
    deadline: Duration,
    log: Option<&Path>,
    mut cancel: CancelSignal,
  ) -> RunResult {
    let started = Utc::now();
    let now = Instant::now();
    debug!(command = %invocation, timeout_secs = deadline.as_secs_f64(), "spawning");

    let log_file = match log {
      Some(path) => match File::create(path).await {
        Ok(f) => Some(f),
        Err(err) => {
          warn!(log = %path.display(), error = %err, "cannot create run log, output will only be kept in memory");
          None
        }
      },
      None => None,
    };

    let mut command = Command::new(&invocation.program);
    command
      .args(&invocation.args)
      .envs(invocation.envs.iter().map(|(k, v)| (k, v)))
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    // Own process group, so the whole tree can be killed at once.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
      Ok(child) => child,
      Err(err) => {
        let output = format!("failed to spawn {}: {}\n", invocation.program.display(), err);
        warn!(command = %invocation, error = %err, "spawn failed");
        append_note(log_file, &output).await;
        return RunResult {
          status: RunStatus::Failed,
          duration_secs: None,
          wall_secs: now.elapsed().as_secs_f64(),
          exit_code: None,
          output,
          started,
        };
      }
    };

    // The child leads its own process group (pgid == pid). Its id is gone once it has been reaped.
    let pgid = child.id();

    let output = Arc::new(Mutex::new(String::new()));
    let (tx, mut rx) = unbounded_channel::<String>();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
      readers.push(spawn(forward_lines(stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
      readers.push(spawn(forward_lines(stderr, tx.clone())));
    }
    drop(tx);
    let collector: JoinHandle<Option<File>> = spawn({
      let output = output.clone();
      let mut log_file = log_file;
      async move {
        while let Some(line) = rx.recv().await {
          trace!(line = line.trim_end(), "output");
          if let Some(f) = log_file.as_mut() {
            if let Err(err) = f.write_all(line.as_bytes()).await {
              warn!(error = %err, "run log write failed, no further output will be logged");
              log_file = None;
            }
          }
          output.lock().push_str(&line);
        }
        if let Some(f) = log_file.as_mut() {
          let _ = f.flush().await;
        }
        log_file
      }
    });

    let ending = tokio::select! {
      status = child.wait() => Ending::Exited(status),
      _ = sleep(deadline) => Ending::TimedOut,
      _ = cancel.cancelled() => Ending::Cancelled,
    };
    // Also after a normal exit: descendants left in the group would run into the next point.
    kill_group(pgid);
    if !matches!(ending, Ending::Exited(_)) {
      if let Err(err) = child.kill().await {
        debug!(error = %err, "kill after killpg");
      }
    }
    let wall_secs = now.elapsed().as_secs_f64();

    let log_file = match timeout(self.drain_grace, collector).await {
      Ok(Ok(f)) => f,
      Ok(Err(err)) => {
        warn!(error = %err, "output collector panicked");
        None
      }
      Err(_) => {
        warn!("output pipes still open after process ended, abandoning them");
        for r in &readers {
          r.abort();
        }
        None
      }
    };

    let mut output = std::mem::take(&mut *output.lock());
    let (status, exit_code, note) = match ending {
      Ending::Exited(Ok(exit)) if exit.success() => (RunStatus::Success, exit.code(), None),
      Ending::Exited(Ok(exit)) => (
        RunStatus::Failed,
        exit.code(),
        exit.code().is_none().then(|| format!("terminated by signal ({exit})")),
      ),
      Ending::Exited(Err(err)) => (
        RunStatus::Failed,
        None,
        Some(format!("failed to wait for process: {err}")),
      ),
      Ending::TimedOut => (
        RunStatus::TimedOut,
        None,
        Some(format!(
          "timed out after {:.1} seconds, process group killed",
          deadline.as_secs_f64()
        )),
      ),
      Ending::Cancelled => (
        RunStatus::Failed,
        None,
        Some("cancelled, process group killed".to_string()),
      ),
    };
    if let Some(note) = note {
      let note = format!("[sortbench] {note}\n");
      output.push_str(&note);
      match log_file {
        Some(f) => append_note(Some(f), &note).await,
        None => {
          if let Some(path) = log {
            let f = OpenOptions::new().append(true).open(path).await.ok();
            append_note(f, &note).await;
          }
        }
      }
    }

    let duration_secs = match status {
      RunStatus::Success => {
        let parsed = parse_timing(&output);
        match parsed {
          None => warn!(command = %invocation, "operation succeeded without a timing signal"),
          Some(secs) if secs > wall_secs + TIMING_WALL_SLACK_SECS => warn!(
            reported_secs = secs,
            wall_secs,
            "reported timing exceeds wall clock"
          ),
          Some(_) => {}
        };
        parsed
      }
      // A failed or interrupted operation's timing isn't a trustworthy measurement.
      RunStatus::Failed | RunStatus::TimedOut => None,
    };

    RunResult {
      status,
      duration_secs,
      wall_secs,
      exit_code,
      output,
      started,
    }
  }
}

async fn forward_lines<R: AsyncRead + Unpin>(stream: R, tx: UnboundedSender<String>) {
  let mut reader = BufReader::new(stream);
  let mut buf = Vec::new();
  loop {
    buf.clear();
    match reader.read_until(b'\n', &mut buf).await {
      Ok(0) => break,
      Ok(_) => {
        let mut line = String::from_utf8_lossy(&buf).into_owned();
        if !line.ends_with('\n') {
          line.push('\n');
        }
        if tx.send(line).is_err() {
          break;
        }
      }
      Err(err) => {
        let _ = tx.send(format!("[sortbench] output read error: {err}\n"));
        break;
      }
    }
  }
}

fn kill_group(pgid: Option<u32>) {
  #[cfg(unix)]
  {
    if let Some(pgid) = pgid {
      // ESRCH when the group is already empty.
      unsafe {
        libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
      }
    }
  }
  #[cfg(not(unix))]
  let _ = pgid;
}

async fn append_note(file: Option<File>, note: &str) {
  if let Some(mut f) = file {
    let _ = f.write_all(note.as_bytes()).await;
    let _ = f.flush().await;
  }
}
