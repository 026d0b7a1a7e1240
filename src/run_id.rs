//! Numeric run-identifier resolution.
//!
//! Acquisition operators name their run folders inconsistently, so the run
//! identifier handed to event building is recovered heuristically. Three
//! tiers, first match wins:
//!
//! 1. A number directly following `run_` (case-insensitive).
//! 2. The longest digit run in the name, if it has at least 3 digits;
//!    ties on length are broken by numeric value.
//! 3. The number of runs already monitored into the same output parent.

use std::path::Path;

/// Resolve the run identifier for a run named `name`.
///
/// Tiers 1 and 2 are pure functions of `name`; tier 3 counts the existing
/// subdirectories of `output_parent`.
pub fn guess_run_id(name: &str, output_parent: &Path) -> u32 {
    if let Some(id) = id_after_run_prefix(name) {
        return id;
    }
    if let Some(id) = largest_long_digit_run(name) {
        return id;
    }
    count_subdirectories(output_parent)
}

/// Best case: the name carries an explicit `run_<digits>` marker.
fn id_after_run_prefix(name: &str) -> Option<u32> {
    let bytes = name.as_bytes();
    let pos = bytes
        .windows(4)
        .position(|w| w.eq_ignore_ascii_case(b"run_"))?;
    let digits: &[u8] = &bytes[pos + 4..];
    let end = digits
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&digits[..end]).ok()?.parse().ok()
}

/// Next try: the longest digit run of at least 3 digits, largest value on
/// equal length.
fn largest_long_digit_run(name: &str) -> Option<u32> {
    let runs: Vec<&str> = name
        .split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
        .collect();
    let longest = runs.iter().map(|run| run.len()).max()?;
    if longest < 3 {
        return None;
    }
    runs.iter()
        .filter(|run| run.len() == longest)
        .filter_map(|run| run.parse::<u32>().ok())
        .max()
}

/// Last resort: this session's ordinal among the runs already monitored.
fn count_subdirectories(parent: &Path) -> u32 {
    match std::fs::read_dir(parent) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .count() as u32,
        Err(_) => 0,
    }
}
