use procfs::Current;
use procfs::CurrentSI;
use procfs::ProcResult;
use sortbench_types::SystemMetrics;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

const PEAK_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

// Used memory across the whole machine, since the backend may be a separate server process.
fn used_memory() -> ProcResult<u64> {
  let meminfo = procfs::Meminfo::current()?;
  let available = meminfo.mem_available.unwrap_or(meminfo.mem_free);
  Ok(meminfo.mem_total.saturating_sub(available))
}

struct MemoryPeakTracker {
  peak_memory: Arc<AtomicU64>,
  stop_signal: Arc<AtomicBool>,
  handle: JoinHandle<()>,
}

impl MemoryPeakTracker {
  fn start() -> Self {
    let peak_memory = Arc::new(AtomicU64::new(0));
    let stop_signal = Arc::new(AtomicBool::new(false));

    let handle = std::thread::spawn({
      let peak_memory = peak_memory.clone();
      let stop_signal = stop_signal.clone();
      move || {
        while !stop_signal.load(Ordering::Relaxed) {
          if let Ok(used) = used_memory() {
            peak_memory.fetch_max(used, Ordering::Relaxed);
          }
          std::thread::sleep(PEAK_SAMPLE_INTERVAL);
        }
      }
    });

    Self {
      peak_memory,
      stop_signal,
      handle,
    }
  }

  fn stop(self) -> u64 {
    self.stop_signal.store(true, Ordering::Relaxed);
    if self.handle.join().is_err() {
      warn!("memory sampler panicked");
    }
    self.peak_memory.load(Ordering::Relaxed)
  }
}

#[derive(Clone, Copy, Default, Debug)]
struct CpuTicks {
  user: u64,
  system: u64,
}

#[derive(Clone, Copy, Default, Debug)]
struct DiskCounters {
  read_bytes: u64,
  write_bytes: u64,
  read_ops: u64,
  write_ops: u64,
}

// Cumulative since boot, all cores combined.
fn read_cpu_ticks() -> ProcResult<CpuTicks> {
  let stat = procfs::KernelStats::current()?;
  Ok(CpuTicks {
    user: stat.total.user + stat.total.nice,
    system: stat.total.system,
  })
}

// Partitions, device mapper, md, loop and zram devices repeat I/O already counted on the disk underneath. Only whole disks have a `device` link in /sys/block.
fn is_physical_disk(name: &str) -> bool {
  Path::new("/sys/block")
    .join(name.replace('/', "!"))
    .join("device")
    .exists()
}

// Cumulative since boot, all physical disks combined. Sectors are always 512 bytes here.
fn read_disk_stats() -> ProcResult<DiskCounters> {
  let mut counters = DiskCounters::default();
  for stat in procfs::diskstats()? {
    if !is_physical_disk(&stat.name) {
      continue;
    }
    counters.read_bytes += stat.sectors_read * 512;
    counters.write_bytes += stat.sectors_written * 512;
    counters.read_ops += stat.reads;
    counters.write_ops += stat.writes;
  }
  Ok(counters)
}

/// Machine-wide resource usage over one execution window. Sampling is best effort: if /proc can't be read at the start, nothing is collected.
pub struct MetricsWindow {
  tracker: MemoryPeakTracker,
  cpu: CpuTicks,
  disk: DiskCounters,
}

impl MetricsWindow {
  pub fn start() -> Option<Self> {
    let baseline = read_cpu_ticks().and_then(|cpu| Ok((cpu, read_disk_stats()?)));
    match baseline {
      Ok((cpu, disk)) => Some(Self {
        tracker: MemoryPeakTracker::start(),
        cpu,
        disk,
      }),
      Err(err) => {
        warn!(error = %err, "cannot sample system metrics");
        None
      }
    }
  }

  pub fn finish(self) -> Option<SystemMetrics> {
    let peak_memory_bytes = self.tracker.stop();
    let end = read_cpu_ticks().and_then(|cpu| Ok((cpu, read_disk_stats()?)));
    let (cpu, disk) = match end {
      Ok(v) => v,
      Err(err) => {
        warn!(error = %err, "cannot sample system metrics");
        return None;
      }
    };
    let ticks_per_sec = procfs::ticks_per_second() as f64;
    Some(SystemMetrics {
      peak_memory_bytes,
      cpu_user_secs: cpu.user.saturating_sub(self.cpu.user) as f64 / ticks_per_sec,
      cpu_system_secs: cpu.system.saturating_sub(self.cpu.system) as f64 / ticks_per_sec,
      disk_read_bytes: disk.read_bytes.saturating_sub(self.disk.read_bytes),
      disk_write_bytes: disk.write_bytes.saturating_sub(self.disk.write_bytes),
      disk_read_ops: disk.read_ops.saturating_sub(self.disk.read_ops),
      disk_write_ops: disk.write_ops.saturating_sub(self.disk.write_ops),
    })
  }
}
