use crate::domain::analysis::Analysis;
use crate::llm::{ChartImage, LlmClient};
use crate::normalize::{
    normalize_patterns, normalize_prediction, normalize_sentiment, top_patterns, NormalizeError,
    Repair, RepairObserver, TracingObserver,
};
use anyhow::{ensure, Context};
use serde_json::Value;

pub const MAX_PATTERNS: usize = 3;
const MAX_ASSET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub asset: String,
    pub image: ChartImage,
}

impl AnalyzeRequest {
    pub fn try_new(asset: &str, image: ChartImage) -> anyhow::Result<Self> {
        let asset = asset.trim().to_ascii_uppercase();
        ensure!(!asset.is_empty(), "asset must be non-empty");
        ensure!(
            asset.len() <= MAX_ASSET_LEN,
            "asset must be at most {MAX_ASSET_LEN} characters"
        );
        Ok(Self { asset, image })
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub analysis: Analysis,
    /// Soft repairs applied across all stages, in order.
    pub repairs: Vec<Repair>,
}

/// Runs the three model stages in order and normalizes each response.
///
/// A hard normalizer failure aborts the analysis; soft repairs are logged and returned.
pub async fn analyze_chart(
    llm: &dyn LlmClient,
    req: AnalyzeRequest,
) -> anyhow::Result<AnalysisOutcome> {
    let AnalyzeRequest { asset, image } = req;
    let mut repairs = Vec::new();
    let t0 = std::time::Instant::now();

    let raw = llm
        .detect_patterns(&image, &asset)
        .await
        .context("pattern detection call failed")?;
    let patterns = normalize_stage("patterns", &raw, &mut repairs, normalize_patterns)?;
    let patterns = top_patterns(patterns, MAX_PATTERNS);

    let raw = llm
        .score_sentiment(&asset)
        .await
        .context("sentiment call failed")?;
    let news_sentiment = normalize_stage("sentiment", &raw, &mut repairs, normalize_sentiment)?;

    let raw = llm
        .predict(&asset, &patterns, &news_sentiment)
        .await
        .context("prediction call failed")?;
    let prediction = normalize_stage("prediction", &raw, &mut repairs, normalize_prediction)?;

    tracing::info!(
        %asset,
        provider = llm.provider().as_str(),
        patterns = patterns.len(),
        repairs = repairs.len(),
        elapsed_ms = t0.elapsed().as_millis(),
        "chart analysis complete"
    );

    Ok(AnalysisOutcome {
        analysis: Analysis {
            asset,
            image_url: image.to_data_uri(),
            patterns,
            news_sentiment,
            prediction,
            timestamp: chrono::Utc::now(),
        },
        repairs,
    })
}

fn normalize_stage<T>(
    stage: &'static str,
    raw: &Value,
    repairs: &mut Vec<Repair>,
    normalize: fn(&Value, &mut dyn RepairObserver) -> Result<T, NormalizeError>,
) -> anyhow::Result<T> {
    let mut stage_repairs = Vec::new();
    let out = normalize(raw, &mut stage_repairs).map_err(|err| {
        tracing::debug!(stage, raw = %raw, "model output rejected");
        anyhow::Error::new(err).context(format!("{stage} output failed validation"))
    })?;

    let mut tracer = TracingObserver { stage };
    for repair in stage_repairs {
        tracer.on_repair(repair.clone());
        repairs.push(repair);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::analysis::{DetectedPattern, Direction, SentimentResult};
    use crate::llm::Provider;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeLlm {
        patterns: Value,
        sentiment: Value,
        prediction: Value,
        seen_patterns: Mutex<Vec<DetectedPattern>>,
    }

    impl FakeLlm {
        fn new(patterns: Value, sentiment: Value, prediction: Value) -> Self {
            Self {
                patterns,
                sentiment,
                prediction,
                seen_patterns: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmClient for FakeLlm {
        fn provider(&self) -> Provider {
            Provider::Anthropic
        }

        async fn detect_patterns(&self, _image: &ChartImage, _asset: &str) -> anyhow::Result<Value> {
            Ok(self.patterns.clone())
        }

        async fn score_sentiment(&self, _asset: &str) -> anyhow::Result<Value> {
            Ok(self.sentiment.clone())
        }

        async fn predict(
            &self,
            _asset: &str,
            patterns: &[DetectedPattern],
            _sentiment: &SentimentResult,
        ) -> anyhow::Result<Value> {
            *self.seen_patterns.lock().unwrap() = patterns.to_vec();
            Ok(self.prediction.clone())
        }
    }

    fn request() -> AnalyzeRequest {
        let image = ChartImage::from_bytes("image/png", b"\x89PNG\r\n\x1a\n").unwrap();
        AnalyzeRequest::try_new(" btcusd ", image).unwrap()
    }

    #[tokio::test]
    async fn builds_analysis_from_all_stages() {
        let llm = FakeLlm::new(
            json!({"patterns": [
                {"name": "a", "type": "bullish", "confidence": 20},
                {"name": "b", "type": "bullish", "confidence": 95},
                {"name": "c", "type": "bearish", "confidence": 60},
                {"name": "d", "type": "neutral", "confidence": 75},
            ]}),
            json!({"score": 1.5, "articles": "not-an-array"}),
            json!({"direction": "up", "confidence": 150, "weights": {"technical": 200, "news": 100}}),
        );

        let outcome = analyze_chart(&llm, request()).await.unwrap();
        let analysis = outcome.analysis;

        assert_eq!(analysis.asset, "BTCUSD");
        assert!(analysis.image_url.starts_with("data:image/png;base64,"));
        let names: Vec<_> = analysis.patterns.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["b", "d", "c"]);
        assert_eq!(llm.seen_patterns.lock().unwrap().len(), 3);

        assert_eq!(analysis.news_sentiment.score, 1.0);
        assert_eq!(analysis.prediction.direction, Direction::Neutral);
        assert_eq!(analysis.prediction.weights.technical, 67.0);
        assert!(!outcome.repairs.is_empty());
    }

    #[tokio::test]
    async fn strict_pattern_failure_aborts() {
        let llm = FakeLlm::new(
            json!({"name": 123, "type": "bullish", "confidence": 50}),
            json!({"score": 0, "articles": []}),
            json!({}),
        );
        let err = analyze_chart(&llm, request()).await.unwrap_err();
        assert!(format!("{err:#}").contains("patterns output failed validation"));
        assert!(err.downcast_ref::<NormalizeError>().is_some());
    }

    #[test]
    fn rejects_blank_asset() {
        let image = ChartImage::from_bytes("image/png", b"png").unwrap();
        assert!(AnalyzeRequest::try_new("   ", image).is_err());
    }
}
