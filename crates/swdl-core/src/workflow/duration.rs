//! Duration strings used throughout workflow definitions.
//!
//! Accepted form: one or more `<integer><unit>` segments with units
//! `ms`, `s`, `m`, `h`, `d` (e.g. `30s`, `1h30m`, `250ms`).

use std::time::Duration;

/// Upper bound for any duration in a definition. Deadlines computed from
/// larger values would leave the representable date range.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 86_400);

/// Parse a duration string. Returns `None` for anything malformed.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    let bytes = s.as_bytes();
    let mut pos = 0;
    let mut total_ms: u64 = 0;

    while pos < bytes.len() {
        let start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if start == pos {
            return None;
        }
        let value: u64 = s[start..pos].parse().ok()?;

        let unit_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_alphabetic() {
            pos += 1;
        }
        let factor = match &s[unit_start..pos] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => return None,
        };
        total_ms = total_ms.checked_add(value.checked_mul(factor)?)?;
    }

    Some(Duration::from_millis(total_ms))
}

/// Parse to whole seconds; unparsable input counts as zero.
pub fn duration_seconds_or_zero(input: &str) -> u64 {
    parse_duration(input).map(|d| d.as_secs()).unwrap_or(0)
}

/// Render seconds as `1h 2m 3s`, omitting leading zero units.
pub fn format_duration(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m {seconds}s")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
