//! Duration strings
//!
//! Intervals in a KluctlDeployment spec use the Kubernetes `metav1.Duration` format: a
//! sequence of decimal numbers with a unit suffix, such as `5m`, `1h30m`,
//! `1.5h` or `500ms`. Valid units are `ns`, `us` (or `µs`), `ms`, `s`, `m`
//! and `h`.

use std::time::Duration;
use thiserror::Error;

/// Value accepted by `deployInterval` and `validateInterval` to disable them
pub const NEVER: &str = "never";

/// Failure to parse a duration string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid duration {input:?}: {reason}")]
pub struct DurationParseError {
    input: String,
    reason: &'static str,
}

impl DurationParseError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

fn unit_nanos(unit: &str) -> Option<f64> {
    Some(match unit {
        "ns" => 1.0,
        "us" | "µs" | "μs" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60e9,
        "h" => 3600e9,
        _ => return None,
    })
}

/// Parses a duration string like `1h30m` or `500ms`
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationParseError::new(input, "empty string"));
    }
    if s.starts_with('-') {
        return Err(DurationParseError::new(input, "negative durations are not allowed"));
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| DurationParseError::new(input, "missing unit"))?;
        if num_len == 0 {
            return Err(DurationParseError::new(input, "expected a number"));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| DurationParseError::new(input, "malformed number"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos = unit_nanos(&rest[..unit_len]).ok_or_else(|| DurationParseError::new(input, "unknown unit"))?;
        rest = &rest[unit_len..];

        total_nanos += value * nanos;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(DurationParseError::new(input, "duration out of range"));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "range checked above")]
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Parses a duration that may also be [`NEVER`]. `Ok(None)` means disabled.
pub fn parse_optional_duration(input: &str) -> Result<Option<Duration>, DurationParseError> {
    if input.trim().eq_ignore_ascii_case(NEVER) {
        return Ok(None);
    }
    parse_duration(input).map(Some)
}

/// Formats a duration the way it would be written in a spec (`1h30m0s`)
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let millis = d.subsec_millis();
    if secs == 0 {
        return format!("{}ms", millis);
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if h > 0 || m > 0 {
        out.push_str(&format!("{}m", m));
    }
    out.push_str(&format!("{}s", s));
    out
}
