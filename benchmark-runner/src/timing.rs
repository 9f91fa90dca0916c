//! The timing signal is the only structured output read from backend operations.
//!
//! Grammar, per line (leading/trailing whitespace ignored):
//!
//! ```text
//! "TIMING:" SP+ <float> [SP+ <anything>]
//! ```
//!
//! e.g. `TIMING: 12.34 seconds`. The float must be finite and non-negative. If several lines match, the last one wins.

const PREFIX: &str = "TIMING:";

/// Parses a single line.
pub fn parse_timing_line(line: &str) -> Option<f64> {
  let rest = line.trim().strip_prefix(PREFIX)?;
  if !rest.starts_with(|c: char| c.is_ascii_whitespace()) {
    return None;
  }
  let secs: f64 = rest.split_ascii_whitespace().next()?.parse().ok()?;
  (secs.is_finite() && secs >= 0.0).then_some(secs)
}

/// Finds the timing signal anywhere in an operation's output.
pub fn parse_timing(output: &str) -> Option<f64> {
  output.lines().filter_map(parse_timing_line).last()
}
