use anyhow::Context;
use serde_json::Value;

pub fn extract_json(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        // Remove Markdown fences (```json ... ``` or ``` ... ```).
        let mut inner = trimmed;
        if let Some(after_first) = inner.splitn(2, '\n').nth(1) {
            inner = after_first;
        }
        if let Some(end) = inner.rfind("```") {
            inner = &inner[..end];
        }
        return Some(inner.trim().to_string());
    }

    // Best-effort extraction: each '{' / '[' opener in order, up to its last closer. The first
    // candidate that parses wins; otherwise the earliest one is returned for error reporting.
    let candidates: Vec<&str> = trimmed
        .match_indices(['{', '['])
        .filter_map(|(start, open)| {
            let closer = if open == "{" { '}' } else { ']' };
            let end = trimmed.rfind(closer)?;
            (end > start).then(|| &trimmed[start..=end])
        })
        .collect();
    candidates
        .iter()
        .find(|c| serde_json::from_str::<Value>(c).is_ok())
        .or(candidates.first())
        .map(|c| c.trim().to_string())
}

/// Parses free-form model text into JSON, tolerating fences and surrounding prose.
pub fn parse_model_json(text: &str) -> anyhow::Result<Value> {
    let json_str = extract_json(text).unwrap_or_else(|| text.trim().to_string());
    serde_json::from_str::<Value>(&json_str)
        .with_context(|| format!("LLM output is not valid JSON: {json_str}"))
}
