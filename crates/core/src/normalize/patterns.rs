use super::{NormalizeError, RepairObserver};
use crate::domain::analysis::{DetectedPattern, PatternType};
use serde_json::{Map, Value};

const CONFIDENCE_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;

/// Strict validation of detected chart patterns.
///
/// Accepts a bare array, an object wrapping the array under `patterns`, or a single pattern
/// object. Individual entries are never repaired; any malformed entry rejects the whole batch.
pub fn normalize_patterns(
    raw: &Value,
    _observer: &mut dyn RepairObserver,
) -> Result<Vec<DetectedPattern>, NormalizeError> {
    let single;
    let entries: &[Value] = match raw {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => match obj.get("patterns") {
            Some(Value::Array(items)) => items.as_slice(),
            _ if looks_like_pattern(obj) => {
                single = [raw.clone()];
                &single[..]
            }
            _ => return Err(NormalizeError::NotAnArray { what: "patterns" }),
        },
        _ => return Err(NormalizeError::NotAnArray { what: "patterns" }),
    };

    entries
        .iter()
        .enumerate()
        .map(|(idx, entry)| parse_pattern(idx, entry))
        .collect()
}

/// Keeps the `n` most confident patterns, highest first. Ties keep their original order.
pub fn top_patterns(mut patterns: Vec<DetectedPattern>, n: usize) -> Vec<DetectedPattern> {
    patterns.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    patterns.truncate(n);
    patterns
}

fn looks_like_pattern(obj: &Map<String, Value>) -> bool {
    obj.contains_key("name") && obj.contains_key("type") && obj.contains_key("confidence")
}

fn parse_pattern(idx: usize, entry: &Value) -> Result<DetectedPattern, NormalizeError> {
    let path = |field: &str| format!("patterns[{idx}].{field}");

    let obj = entry.as_object().ok_or_else(|| {
        NormalizeError::invalid(format!("patterns[{idx}]"), "expected an object")
    })?;

    let name = match obj.get("name") {
        Some(Value::String(s)) => s.clone(),
        other => return Err(NormalizeError::invalid(path("name"), describe("a string", other))),
    };

    let pattern_type = match obj.get("type") {
        Some(Value::String(s)) => PatternType::parse(s).ok_or_else(|| {
            NormalizeError::invalid(
                path("type"),
                format!("expected bullish, bearish or neutral (got {s:?})"),
            )
        })?,
        other => {
            return Err(NormalizeError::invalid(
                path("type"),
                describe("bullish, bearish or neutral", other),
            ))
        }
    };

    let confidence = match obj.get("confidence").and_then(Value::as_f64) {
        Some(c) if CONFIDENCE_RANGE.contains(&c) => c,
        Some(c) => {
            return Err(NormalizeError::invalid(
                path("confidence"),
                format!("must be between 0 and 100 (got {c})"),
            ))
        }
        None => {
            return Err(NormalizeError::invalid(
                path("confidence"),
                describe("a number", obj.get("confidence")),
            ))
        }
    };

    Ok(DetectedPattern {
        name,
        pattern_type,
        confidence,
    })
}

fn describe(expected: &str, got: Option<&Value>) -> String {
    match got {
        None => format!("expected {expected} (missing)"),
        Some(v) => format!("expected {expected} (got {v})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Repair;
    use serde_json::json;

    fn run(raw: Value) -> Result<Vec<DetectedPattern>, NormalizeError> {
        let mut repairs: Vec<Repair> = Vec::new();
        let out = normalize_patterns(&raw, &mut repairs);
        assert!(repairs.is_empty(), "pattern validation never repairs");
        out
    }

    #[test]
    fn accepts_valid_array_unchanged() {
        let patterns = run(json!([{"name": "Double Top", "type": "bearish", "confidence": 87}]))
            .unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].name, "Double Top");
        assert_eq!(patterns[0].pattern_type, PatternType::Bearish);
        assert_eq!(patterns[0].confidence, 87.0);
    }

    #[test]
    fn unwraps_patterns_property() {
        let patterns = run(json!({
            "patterns": [
                {"name": "Cup and Handle", "type": "bullish", "confidence": 72.5},
                {"name": "Range", "type": "neutral", "confidence": 40},
            ]
        }))
        .unwrap();
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[1].pattern_type, PatternType::Neutral);
    }

    #[test]
    fn wraps_single_pattern_object() {
        let patterns =
            run(json!({"name": "Head and Shoulders", "type": "bearish", "confidence": 64})).unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].name, "Head and Shoulders");
    }

    #[test]
    fn rejects_non_string_name_without_repair() {
        let err = run(json!({"name": 123, "type": "bullish", "confidence": 50})).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidField { ref path, .. } if path == "patterns[0].name"));
    }

    #[test]
    fn one_bad_entry_rejects_batch() {
        let err = run(json!([
            {"name": "Flag", "type": "bullish", "confidence": 80},
            {"name": "Wedge", "type": "sideways", "confidence": 55},
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("patterns[1].type"));
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        assert!(run(json!([{"name": "Flag", "type": "bullish", "confidence": 101}])).is_err());
        assert!(run(json!([{"name": "Flag", "type": "bullish", "confidence": -1}])).is_err());
        assert!(run(json!([{"name": "Flag", "type": "bullish", "confidence": "80"}])).is_err());
    }

    #[test]
    fn rejects_non_array_payloads() {
        assert_eq!(
            run(json!("Double Top")).unwrap_err(),
            NormalizeError::NotAnArray { what: "patterns" }
        );
        assert_eq!(
            run(json!({"patterns": "none"})).unwrap_err(),
            NormalizeError::NotAnArray { what: "patterns" }
        );
        assert!(run(json!([1, 2])).is_err());
    }

    #[test]
    fn empty_array_is_valid() {
        assert!(run(json!([])).unwrap().is_empty());
    }

    #[test]
    fn top_patterns_keeps_most_confident() {
        let patterns = run(json!([
            {"name": "a", "type": "bullish", "confidence": 10},
            {"name": "b", "type": "bullish", "confidence": 90},
            {"name": "c", "type": "bearish", "confidence": 50},
            {"name": "d", "type": "neutral", "confidence": 90},
        ]))
        .unwrap();
        let top = top_patterns(patterns, 3);
        let names: Vec<_> = top.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["b", "d", "c"]);
    }
}
