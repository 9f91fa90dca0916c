use bytesize::ByteSize;

// Postgres refuses a work_mem below this.
const MIN_WORKER_MEMORY: u64 = 64 * 1024;

/// Parses a size string such as "4GB", "512MB", "64kB" or "1.5G". Units are binary multiples, as the benchmarked backends interpret them. A bare number is bytes.
pub fn parse_size(raw: &str) -> Option<ByteSize> {
  let s = raw.trim();
  let split = s
    .find(|c: char| !(c.is_ascii_digit() || c == '.'))
    .unwrap_or(s.len());
  let (num, unit) = s.split_at(split);
  let num: f64 = num.parse().ok()?;
  if !num.is_finite() || num < 0.0 {
    return None;
  }
  let mult: u64 = match unit.trim().to_ascii_uppercase().as_str() {
    "" | "B" => 1,
    "K" | "KB" | "KIB" => 1 << 10,
    "M" | "MB" | "MIB" => 1 << 20,
    "G" | "GB" | "GIB" => 1 << 30,
    "T" | "TB" | "TIB" => 1 << 40,
    _ => return None,
  };
  Some(ByteSize::b((num * mult as f64) as u64))
}

/// Splits a total memory budget across `workers`, rounding down to whole KiB so the aggregate never exceeds the budget. Returns the size in kB notation. Returns `None` when either input doesn't parse, so the caller can pass the raw value through.
pub fn per_worker_memory(total: &str, workers: &str) -> Option<String> {
  let total = parse_size(total)?;
  let workers: u64 = workers.trim().parse().ok().filter(|w| *w > 0)?;
  let share = (total.as_u64() / workers).max(MIN_WORKER_MEMORY);
  Some(format!("{}kB", share / 1024))
}

#[cfg(test)]
mod tests {
  use super::parse_size;
  use super::per_worker_memory;
  use bytesize::ByteSize;

  #[test]
  fn test_parse_size() {
    assert_eq!(parse_size("1GB"), Some(ByteSize::gib(1)));
    assert_eq!(parse_size("512MB"), Some(ByteSize::mib(512)));
    assert_eq!(parse_size("64kB"), Some(ByteSize::kib(64)));
    assert_eq!(parse_size("1.5G"), Some(ByteSize::mib(1536)));
    assert_eq!(parse_size("2 GiB"), Some(ByteSize::gib(2)));
    assert_eq!(parse_size("4096"), Some(ByteSize::b(4096)));
    assert_eq!(parse_size("lots"), None);
    assert_eq!(parse_size("4XB"), None);
    assert_eq!(parse_size(""), None);
  }

  #[test]
  fn test_per_worker_memory_rounds_down() {
    assert_eq!(per_worker_memory("1GB", "1").as_deref(), Some("1048576kB"));
    assert_eq!(per_worker_memory("1GB", "4").as_deref(), Some("262144kB"));
    // 1 GiB / 3 = 357913941.33 bytes, 349525.33 KiB.
    assert_eq!(per_worker_memory("1GB", "3").as_deref(), Some("349525kB"));
  }

  #[test]
  fn test_per_worker_memory_floor() {
    assert_eq!(per_worker_memory("1MB", "64").as_deref(), Some("64kB"));
  }

  #[test]
  fn test_per_worker_memory_passthrough() {
    assert_eq!(per_worker_memory("a lot", "4"), None);
    assert_eq!(per_worker_memory("1GB", "many"), None);
    assert_eq!(per_worker_memory("1GB", "0"), None);
  }
}
