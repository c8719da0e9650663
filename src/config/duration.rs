//! Go-style duration strings (`300ms`, `10s`, `1h30m`) for YAML fields.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serializer};

static SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?|\.\d+)(ns|us|µs|ms|s|m|h)").unwrap());

/// Parses a duration such as `10s`, `1.5m` or `1h30m`. A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut consumed = 0;
    let mut nanos = 0f64;
    for caps in SEGMENT.captures_iter(input) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if whole.start() != consumed {
            return Err(format!("invalid duration {input:?}"));
        }
        consumed = whole.end();

        let value: f64 = caps[1]
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;
        let unit = match &caps[2] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            _ => 3600.0 * 1e9,
        };
        nanos += value * unit;
    }

    if consumed != input.len() {
        return Err(format!("invalid duration {input:?}"));
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Renders a duration in the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    for (unit, size) in [
        ("h", 3_600_000_000_000u128),
        ("m", 60_000_000_000),
        ("s", 1_000_000_000),
        ("ms", 1_000_000),
        ("us", 1_000),
    ] {
        if nanos % size == 0 {
            return format!("{}{unit}", nanos / size);
        }
    }
    format!("{nanos}ns")
}

pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*d))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(de::Error::custom)
}
