use super::{report, NormalizeError, RepairAction, RepairObserver};
use crate::domain::analysis::{
    Direction, PredictionResult, TradeLeg, TradingRecommendation, Weights,
};
use serde_json::{Map, Value};

pub const DEFAULT_CONFIDENCE: f64 = 50.0;
pub const DEFAULT_EXPLANATION: &str =
    "Prediction based on the detected chart patterns and recent news sentiment.";
pub const DEFAULT_WEIGHTS: Weights = Weights {
    technical: 70.0,
    news: 30.0,
};
pub const DEFAULT_TIMEFRAME: &str = "Medium-term";
pub const QUICK_TRADE_TIMEFRAME: &str = "Intraday to 3 days";
pub const SWING_TRADE_TIMEFRAME: &str = "1-2 weeks";

pub const HEDGE_WORD: &str = "might";
pub const DISCLAIMER_MARKER: &str = "educational purposes";
pub const DISCLAIMER: &str =
    "This analysis is for educational purposes only and is not financial advice.";
pub const DEFAULT_ENTRY_CONDITION: &str = "A trader might consider entering once price action \
     confirms the expected direction. This analysis is for educational purposes only and is not \
     financial advice.";

const REC: &str = "tradingRecommendation";

/// Lenient validation of a prediction payload.
///
/// Fails only when `raw` is not an object. Every field has a default, and the result always
/// satisfies: weights sum to 100, direction is a known literal, and the entry condition is
/// hedged and carries the educational disclaimer.
pub fn normalize_prediction(
    raw: &Value,
    observer: &mut dyn RepairObserver,
) -> Result<PredictionResult, NormalizeError> {
    let obj = raw
        .as_object()
        .ok_or(NormalizeError::NotAnObject { what: "prediction" })?;

    let direction = match obj.get("direction").and_then(Value::as_str).and_then(Direction::parse) {
        Some(direction) => direction,
        None => {
            report(observer, "direction", RepairAction::Defaulted);
            Direction::Neutral
        }
    };

    let confidence = match obj.get("confidence").and_then(Value::as_f64) {
        Some(c) => {
            let clamped = c.clamp(0.0, 100.0);
            if clamped != c {
                report(observer, "confidence", RepairAction::Clamped { from: c, to: clamped });
            }
            clamped
        }
        None => {
            report(observer, "confidence", RepairAction::Defaulted);
            DEFAULT_CONFIDENCE
        }
    };

    let explanation = match obj.get("explanation") {
        Some(Value::String(s)) => s.clone(),
        _ => {
            report(observer, "explanation", RepairAction::Defaulted);
            DEFAULT_EXPLANATION.to_string()
        }
    };

    let weights = normalize_weights(obj.get("weights"), observer);

    let trading_recommendation = match obj.get(REC) {
        Some(Value::Object(rec)) => normalize_recommendation(rec, observer),
        _ => {
            report(observer, REC, RepairAction::Defaulted);
            default_recommendation()
        }
    };

    Ok(PredictionResult {
        direction,
        confidence,
        explanation,
        weights,
        trading_recommendation,
    })
}

fn normalize_weights(raw: Option<&Value>, observer: &mut dyn RepairObserver) -> Weights {
    let Some(obj) = raw.and_then(Value::as_object) else {
        report(observer, "weights", RepairAction::Defaulted);
        return DEFAULT_WEIGHTS;
    };

    let mut component = |key: &str, default: f64| match obj.get(key).and_then(Value::as_f64) {
        Some(w) if w < 0.0 => {
            report(observer, format!("weights.{key}"), RepairAction::Clamped { from: w, to: 0.0 });
            0.0
        }
        Some(w) => w,
        None => {
            report(observer, format!("weights.{key}"), RepairAction::Defaulted);
            default
        }
    };
    let technical = component("technical", DEFAULT_WEIGHTS.technical);
    let news = component("news", DEFAULT_WEIGHTS.news);

    let total = technical + news;
    if (total - 100.0).abs() < 1e-9 {
        return Weights { technical, news };
    }

    let weights = if total <= 0.0 || !total.is_finite() {
        DEFAULT_WEIGHTS
    } else {
        let technical = (technical / total * 100.0).round();
        Weights {
            technical,
            news: 100.0 - technical,
        }
    };
    report(
        observer,
        "weights",
        RepairAction::Renormalized {
            technical: weights.technical,
            news: weights.news,
        },
    );
    weights
}

fn default_recommendation() -> TradingRecommendation {
    TradingRecommendation {
        entry_price: None,
        stop_loss: None,
        take_profit: None,
        entry_condition: DEFAULT_ENTRY_CONDITION.to_string(),
        timeframe: DEFAULT_TIMEFRAME.to_string(),
        risk_reward_ratio: None,
        quick_trade: TradeLeg {
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            timeframe: QUICK_TRADE_TIMEFRAME.to_string(),
        },
        swing_trade: TradeLeg {
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            timeframe: SWING_TRADE_TIMEFRAME.to_string(),
        },
    }
}

fn normalize_recommendation(
    rec: &Map<String, Value>,
    observer: &mut dyn RepairObserver,
) -> TradingRecommendation {
    let entry_price = price(rec, REC, "entryPrice", observer);
    let stop_loss = price(rec, REC, "stopLoss", observer);
    let take_profit = price(rec, REC, "takeProfit", observer);

    let entry_condition = match rec.get("entryCondition") {
        Some(Value::String(s)) => enforce_disclaimer(s, observer),
        _ => {
            report(observer, format!("{REC}.entryCondition"), RepairAction::Defaulted);
            DEFAULT_ENTRY_CONDITION.to_string()
        }
    };

    let timeframe = string_or(rec, REC, "timeframe", DEFAULT_TIMEFRAME, observer);

    let risk_reward_ratio = match price(rec, REC, "riskRewardRatio", observer) {
        Some(r) if r < 0.0 => {
            report(observer, format!("{REC}.riskRewardRatio"), RepairAction::Coerced);
            None
        }
        other => other,
    };

    let quick_path = format!("{REC}.quickTrade");
    let quick_trade = match rec.get("quickTrade") {
        Some(Value::Object(leg)) => trade_leg(leg, &quick_path, QUICK_TRADE_TIMEFRAME, observer),
        _ => {
            report(observer, quick_path, RepairAction::Defaulted);
            TradeLeg {
                entry_price,
                stop_loss,
                take_profit: match (entry_price, take_profit) {
                    (Some(entry), Some(target)) => Some((entry + target) / 2.0),
                    _ => take_profit,
                },
                timeframe: QUICK_TRADE_TIMEFRAME.to_string(),
            }
        }
    };

    let swing_path = format!("{REC}.swingTrade");
    let swing_trade = match rec.get("swingTrade") {
        Some(Value::Object(leg)) => trade_leg(leg, &swing_path, SWING_TRADE_TIMEFRAME, observer),
        _ => {
            report(observer, swing_path, RepairAction::Defaulted);
            TradeLeg {
                entry_price,
                stop_loss,
                take_profit,
                timeframe: SWING_TRADE_TIMEFRAME.to_string(),
            }
        }
    };

    TradingRecommendation {
        entry_price,
        stop_loss,
        take_profit,
        entry_condition,
        timeframe,
        risk_reward_ratio,
        quick_trade,
        swing_trade,
    }
}

fn trade_leg(
    leg: &Map<String, Value>,
    path: &str,
    default_timeframe: &str,
    observer: &mut dyn RepairObserver,
) -> TradeLeg {
    TradeLeg {
        entry_price: price(leg, path, "entryPrice", observer),
        stop_loss: price(leg, path, "stopLoss", observer),
        take_profit: price(leg, path, "takeProfit", observer),
        timeframe: string_or(leg, path, "timeframe", default_timeframe, observer),
    }
}

/// Number or null; anything else (including a missing key) becomes null.
fn price(
    obj: &Map<String, Value>,
    parent: &str,
    key: &str,
    observer: &mut dyn RepairObserver,
) -> Option<f64> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_f64() {
            Some(n) => Some(n),
            None => {
                report(observer, format!("{parent}.{key}"), RepairAction::Coerced);
                None
            }
        },
    }
}

fn string_or(
    obj: &Map<String, Value>,
    parent: &str,
    key: &str,
    default: &str,
    observer: &mut dyn RepairObserver,
) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.clone(),
        _ => {
            report(observer, format!("{parent}.{key}"), RepairAction::Defaulted);
            default.to_string()
        }
    }
}

/// Ensures the entry condition is hedged ("might") and carries the educational disclaimer.
///
/// Both checks are exact and case-sensitive. A differently-cased occurrence is lowercased in
/// place; otherwise the hedge goes right after the first standalone "trader"/"traders" word
/// (or a hedged lead-in is prepended) and the disclaimer sentence is appended.
fn enforce_disclaimer(condition: &str, observer: &mut dyn RepairObserver) -> String {
    let path = format!("{REC}.entryCondition");
    let mut out = condition.to_string();

    if !out.contains(HEDGE_WORD) {
        if lowercase_in_place(&mut out, HEDGE_WORD) {
            report(observer, path.clone(), RepairAction::Lowercased);
        } else {
            out = insert_hedge(out.trim());
            report(observer, path.clone(), RepairAction::Hedged);
        }
    }

    if !out.contains(DISCLAIMER_MARKER) {
        if lowercase_in_place(&mut out, DISCLAIMER_MARKER) {
            report(observer, path, RepairAction::Lowercased);
        } else {
            out.truncate(out.trim_end().len());
            if !out.is_empty() && !out.ends_with(['.', '!', '?']) {
                out.push('.');
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(DISCLAIMER);
            report(observer, path, RepairAction::DisclaimerAppended);
        }
    }

    out
}

/// Rewrites the first ASCII-case-insensitive occurrence of `phrase` (lowercase ASCII) to
/// `phrase` itself. Returns false when there is none.
fn lowercase_in_place(text: &mut String, phrase: &str) -> bool {
    match text.to_ascii_lowercase().find(phrase) {
        Some(start) => {
            text.replace_range(start..start + phrase.len(), phrase);
            true
        }
        None => false,
    }
}

fn insert_hedge(condition: &str) -> String {
    if let Some(end) = trader_word_end(&condition.to_ascii_lowercase()) {
        return format!("{} {HEDGE_WORD}{}", &condition[..end], &condition[end..]);
    }

    if condition.is_empty() {
        return DEFAULT_ENTRY_CONDITION.to_string();
    }
    format!("A trader {HEDGE_WORD} consider this setup: {condition}")
}

/// Byte offset just past the first "trader"/"traders" that stands as its own word and is
/// followed by whitespace. `lower` must be ASCII-lowercased so offsets match the original.
fn trader_word_end(lower: &str) -> Option<usize> {
    lower.match_indices("trader").find_map(|(start, word)| {
        let starts_word = lower[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let mut end = start + word.len();
        if lower[end..].starts_with('s') {
            end += 1;
        }
        let ends_word = lower[end..].chars().next().is_some_and(char::is_whitespace);
        (starts_word && ends_word).then_some(end)
    })
}
