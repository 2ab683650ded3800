pub mod anthropic;
pub mod error;
pub mod image;
pub mod json;

pub use image::ChartImage;

use crate::domain::analysis::{DetectedPattern, SentimentResult};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
        }
    }
}

/// One model round-trip per analysis stage. Implementations return the model's JSON as-is;
/// shaping it is the job of [`crate::normalize`].
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> Provider;

    async fn detect_patterns(&self, image: &ChartImage, asset: &str) -> anyhow::Result<Value>;

    async fn score_sentiment(&self, asset: &str) -> anyhow::Result<Value>;

    async fn predict(
        &self,
        asset: &str,
        patterns: &[DetectedPattern],
        sentiment: &SentimentResult,
    ) -> anyhow::Result<Value>;
}
