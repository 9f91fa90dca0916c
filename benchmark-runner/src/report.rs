use ahash::HashMap;
use ahash::HashMapExt;
use sortbench_types::LedgerEntry;
use sortbench_types::RunConfig;
use std::fmt::Write;

fn secs(v: Option<f64>) -> String {
  match v {
    Some(v) => format!("{v:.3}"),
    None => "-".to_string(),
  }
}

/// One line per ledger entry, in ledger order. Entries whose configuration appears more than once are marked with their attempt number.
pub fn render(entries: &[LedgerEntry]) -> String {
  let mut totals = HashMap::<&RunConfig, usize>::new();
  for e in entries {
    *totals.entry(&e.config).or_default() += 1;
  }

  let mut out = String::new();
  let _ = writeln!(
    out,
    "{:>5}  {:>8}  {:>10}  {:<20}  {:>12}  {:>10}  {}",
    "point", "threads", "memory", "outcome", "duration_s", "wall_s", "repeat"
  );
  let mut seen = HashMap::<&RunConfig, usize>::new();
  for e in entries {
    let attempt = seen.entry(&e.config).or_default();
    *attempt += 1;
    let total = totals[&e.config];
    let repeat = if total > 1 {
      format!("{}/{}", attempt, total)
    } else {
      String::new()
    };
    let _ = writeln!(
      out,
      "{:>5}  {:>8}  {:>10}  {:<20}  {:>12}  {:>10.3}  {}",
      e.point,
      e.config.threads,
      e.config.memory_limit,
      e.outcome(),
      secs(e.duration_secs),
      e.wall_secs,
      repeat
    );
  }
  out
}
