use super::{report, NormalizeError, RepairAction, RepairObserver};
use crate::domain::analysis::{Article, SentimentResult};
use serde_json::{Map, Value};

pub const UNTITLED_ARTICLE: &str = "Untitled Article";

/// Lenient validation of a news sentiment payload `{ score, articles }`.
///
/// Only a non-object payload or a non-numeric `score` is fatal. Everything else is clamped,
/// defaulted or skipped and reported to `observer`.
pub fn normalize_sentiment(
    raw: &Value,
    observer: &mut dyn RepairObserver,
) -> Result<SentimentResult, NormalizeError> {
    let obj = raw
        .as_object()
        .ok_or(NormalizeError::NotAnObject { what: "sentiment" })?;

    let score = match obj.get("score").and_then(Value::as_f64) {
        Some(score) => clamp_unit(score, "score", observer),
        None => {
            return Err(NormalizeError::invalid(
                "score",
                format!("expected a number (got {})", obj.get("score").unwrap_or(&Value::Null)),
            ))
        }
    };

    let articles = match obj.get("articles") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(idx, item)| normalize_article(idx, item, observer))
            .collect(),
        _ => {
            report(observer, "articles", RepairAction::Defaulted);
            Vec::new()
        }
    };

    Ok(SentimentResult { score, articles })
}

fn normalize_article(
    idx: usize,
    item: &Value,
    observer: &mut dyn RepairObserver,
) -> Option<Article> {
    let Some(obj) = item.as_object() else {
        report(observer, format!("articles[{idx}]"), RepairAction::Skipped);
        return None;
    };

    let mut extra: Map<String, Value> = obj.clone();
    let title = extra.remove("title");
    let sentiment = extra.remove("sentiment");

    let title = match title {
        Some(Value::String(s)) => s,
        _ => {
            report(observer, format!("articles[{idx}].title"), RepairAction::Defaulted);
            UNTITLED_ARTICLE.to_string()
        }
    };

    let sentiment = match sentiment.as_ref().and_then(Value::as_f64) {
        Some(s) => clamp_unit(s, &format!("articles[{idx}].sentiment"), observer),
        None => {
            report(observer, format!("articles[{idx}].sentiment"), RepairAction::Defaulted);
            0.0
        }
    };

    Some(Article {
        title,
        sentiment,
        extra,
    })
}

fn clamp_unit(value: f64, path: &str, observer: &mut dyn RepairObserver) -> f64 {
    let clamped = value.clamp(-1.0, 1.0);
    if clamped != value {
        report(observer, path, RepairAction::Clamped { from: value, to: clamped });
    }
    clamped
}
