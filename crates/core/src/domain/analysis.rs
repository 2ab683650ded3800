use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    Bullish,
    Bearish,
    Neutral,
}

impl PatternType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bullish" => Some(Self::Bullish),
            "bearish" => Some(Self::Bearish),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub name: String,
    #[serde(rename = "type")]
    pub pattern_type: PatternType,
    /// 0..=100
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    /// -1..=1
    pub sentiment: f64,
    /// Source metadata (url, source, publishedAt, ...) passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentResult {
    /// -1..=1
    pub score: f64,
    pub articles: Vec<Article>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bullish" => Some(Self::Bullish),
            "bearish" => Some(Self::Bearish),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }
}

/// Relative weight of technical vs news inputs. Always sums to 100 once normalized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub technical: f64,
    pub news: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeLeg {
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub timeframe: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingRecommendation {
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub entry_condition: String,
    pub timeframe: String,
    pub risk_reward_ratio: Option<f64>,
    pub quick_trade: TradeLeg,
    pub swing_trade: TradeLeg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionResult {
    pub direction: Direction,
    /// 0..=100
    pub confidence: f64,
    pub explanation: String,
    pub weights: Weights,
    pub trading_recommendation: TradingRecommendation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub asset: String,
    /// The uploaded chart as a data URI.
    pub image_url: String,
    pub patterns: Vec<DetectedPattern>,
    pub news_sentiment: SentimentResult,
    pub prediction: PredictionResult,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageInfo {
    pub analyses_used: i64,
    pub daily_limit: Option<i64>,
    pub remaining: Option<i64>,
}

impl UsageInfo {
    pub fn new(analyses_used: i64, daily_limit: Option<i64>) -> Self {
        Self {
            analyses_used,
            daily_limit,
            remaining: daily_limit.map(|limit| (limit - analyses_used).max(0)),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.remaining, Some(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pattern_serializes_type_key() {
        let p = DetectedPattern {
            name: "Double Top".to_string(),
            pattern_type: PatternType::Bearish,
            confidence: 87.0,
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v, json!({"name": "Double Top", "type": "bearish", "confidence": 87.0}));
    }

    #[test]
    fn article_keeps_source_metadata() {
        let article: Article = serde_json::from_value(json!({
            "title": "BTC rallies",
            "sentiment": 0.4,
            "url": "https://example.com/a",
            "source": "Wire",
        }))
        .unwrap();
        assert_eq!(article.extra.get("source"), Some(&json!("Wire")));

        let back = serde_json::to_value(&article).unwrap();
        assert_eq!(back["url"], json!("https://example.com/a"));
    }

    #[test]
    fn usage_info_remaining_never_negative() {
        let usage = UsageInfo::new(12, Some(10));
        assert_eq!(usage.remaining, Some(0));
        assert!(usage.is_exhausted());

        let unlimited = UsageInfo::new(12, None);
        assert_eq!(unlimited.remaining, None);
        assert!(!unlimited.is_exhausted());
    }
}
