use serde_json::Value;
use tracing::warn;

pub const DEFAULT_LEVEL: u8 = 1;

/// Compress a raw 1–5 difficulty into the three public tiers.
///
/// 1–2 → 1, 3 → 2, 4–5 → 3. Anything else falls back to tier 1 with a warning.
pub fn normalize_level(raw: &Value) -> u8 {
    match raw_level(raw) {
        Some(1 | 2) => 1,
        Some(3) => 2,
        Some(4 | 5) => 3,
        _ => {
            warn!(value = %raw, "level out of range, defaulting to {DEFAULT_LEVEL}");
            DEFAULT_LEVEL
        }
    }
}

/// Level for an optional field; an empty cell is tier 1 without a warning.
pub fn normalize_optional_level(raw: Option<&Value>) -> u8 {
    raw.map(normalize_level).unwrap_or(DEFAULT_LEVEL)
}

fn raw_level(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|n| n.fract() == 0.0).map(|n| n as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        Value::Array(items) if items.len() == 1 => raw_level(&items[0]),
        _ => None,
    }
}
