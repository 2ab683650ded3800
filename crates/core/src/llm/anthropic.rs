use crate::config::Settings;
use crate::domain::analysis::{DetectedPattern, SentimentResult};
use crate::llm::error::LlmDiagnosticsError;
use crate::llm::json;
use crate::llm::{ChartImage, LlmClient, Provider};
use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
const DEFAULT_MAX_TOKENS: u32 = 2048;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

const TOOL_EMIT_PATTERNS: &str = "emit_patterns";
const TOOL_EMIT_SENTIMENT: &str = "emit_sentiment";
const TOOL_EMIT_PREDICTION: &str = "emit_prediction";

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicClient {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api_key = settings.require_anthropic_api_key()?.to_string();
        let base_url =
            std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let max_tokens = std::env::var("ANTHROPIC_MAX_TOKENS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_TOKENS);

        let timeout_secs = std::env::var("ANTHROPIC_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            http,
            api_key,
            base_url,
            model,
            max_tokens,
        })
    }

    async fn create_message(
        &self,
        req: &CreateMessageRequest,
    ) -> anyhow::Result<(Value, CreateMessageResponse)> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&self.api_key)?);
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let res = self
            .http
            .post(url)
            .headers(headers)
            .json(req)
            .send()
            .await
            .context("Anthropic request failed")?;

        let status = res.status();
        let text = res
            .text()
            .await
            .context("failed to read Anthropic response body")?;
        if !status.is_success() {
            let raw_response_json = serde_json::from_str::<Value>(&text).ok();
            return Err(LlmDiagnosticsError {
                provider: Provider::Anthropic,
                stage: "http",
                detail: format!("status={status}"),
                raw_output: Some(text),
                raw_response_json,
            }
            .into());
        }

        let raw_json = serde_json::from_str::<Value>(&text)
            .with_context(|| format!("failed to parse Anthropic response JSON: {text}"))?;
        let parsed = serde_json::from_value::<CreateMessageResponse>(raw_json.clone())
            .context("failed to decode Anthropic response into CreateMessageResponse")?;
        Ok((raw_json, parsed))
    }

    /// Runs one forced-tool call and returns the tool input, falling back to JSON found in text.
    async fn run_tool(
        &self,
        stage: &'static str,
        tool: Tool,
        content: Vec<ContentPart>,
    ) -> anyhow::Result<Value> {
        let tool_name = tool.name;
        let mut req = CreateMessageRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: Some(Self::system_prompt()),
            messages: vec![Message {
                role: "user",
                content,
            }],
            tool_choice: Some(ToolChoice::Tool { name: tool_name }),
            tools: Some(vec![tool]),
        };

        let (mut raw_json, mut res) = self.create_message(&req).await?;

        // If the model hit max_tokens, retry once with a higher ceiling.
        if matches!(res.stop_reason.as_deref(), Some("max_tokens")) {
            let bumped = self.max_tokens.saturating_mul(2).max(4096);
            tracing::warn!(
                stage,
                from = self.max_tokens,
                to = bumped,
                "Anthropic stop_reason=max_tokens; retrying once with higher max_tokens"
            );
            req.max_tokens = bumped;
            let (rj, r) = self.create_message(&req).await?;
            raw_json = rj;
            res = r;
        }

        if let Some(input) = Self::response_tool_input(&res, tool_name) {
            return Ok(input);
        }

        // Fallback to text (should be rare).
        let text = Self::response_text(&res);
        json::parse_model_json(&text).map_err(|err| {
            LlmDiagnosticsError {
                provider: Provider::Anthropic,
                stage,
                detail: format!("no {tool_name} tool call and no JSON in text: {err}"),
                raw_output: Some(text),
                raw_response_json: Some(raw_json),
            }
            .into()
        })
    }

    fn system_prompt() -> String {
        [
            "You are a technical and news analyst for a trading-chart education product.",
            "Always answer through the provided tool. Use double quotes for all JSON strings.",
            "Confidence values are percentages in [0, 100]. Sentiment values are in [-1, 1].",
            "Trading suggestions must be hedged (use \"might\") and state that they are for educational purposes only.",
        ]
        .join("\n")
    }

    fn patterns_tool() -> Tool {
        Tool {
            name: TOOL_EMIT_PATTERNS,
            description: "Emit the chart patterns visible in the screenshot",
            input_schema: serde_json::json!({
                "type": "object",
                "required": ["patterns"],
                "properties": {
                    "patterns": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["name", "type", "confidence"],
                            "properties": {
                                "name": {"type": "string"},
                                "type": {"type": "string", "enum": ["bullish", "bearish", "neutral"]},
                                "confidence": {"type": "number", "minimum": 0, "maximum": 100}
                            }
                        }
                    }
                }
            }),
        }
    }

    fn sentiment_tool() -> Tool {
        Tool {
            name: TOOL_EMIT_SENTIMENT,
            description: "Emit the aggregate news sentiment and the articles it is based on",
            input_schema: serde_json::json!({
                "type": "object",
                "required": ["score", "articles"],
                "properties": {
                    "score": {"type": "number", "minimum": -1, "maximum": 1},
                    "articles": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["title", "sentiment"],
                            "properties": {
                                "title": {"type": "string"},
                                "sentiment": {"type": "number", "minimum": -1, "maximum": 1},
                                "source": {"type": "string"},
                                "url": {"type": "string"},
                                "publishedAt": {"type": "string"}
                            }
                        }
                    }
                }
            }),
        }
    }

    fn prediction_tool() -> Tool {
        let leg = serde_json::json!({
            "type": "object",
            "properties": {
                "entryPrice": {"type": ["number", "null"]},
                "stopLoss": {"type": ["number", "null"]},
                "takeProfit": {"type": ["number", "null"]},
                "timeframe": {"type": "string"}
            }
        });
        Tool {
            name: TOOL_EMIT_PREDICTION,
            description: "Emit the directional prediction and an educational trading recommendation",
            input_schema: serde_json::json!({
                "type": "object",
                "required": ["direction", "confidence", "explanation", "weights", "tradingRecommendation"],
                "properties": {
                    "direction": {"type": "string", "enum": ["bullish", "bearish", "neutral"]},
                    "confidence": {"type": "number", "minimum": 0, "maximum": 100},
                    "explanation": {"type": "string"},
                    "weights": {
                        "type": "object",
                        "properties": {
                            "technical": {"type": "number"},
                            "news": {"type": "number"}
                        }
                    },
                    "tradingRecommendation": {
                        "type": "object",
                        "properties": {
                            "entryPrice": {"type": ["number", "null"]},
                            "stopLoss": {"type": ["number", "null"]},
                            "takeProfit": {"type": ["number", "null"]},
                            "entryCondition": {"type": "string"},
                            "timeframe": {"type": "string"},
                            "riskRewardRatio": {"type": ["number", "null"]},
                            "quickTrade": leg.clone(),
                            "swingTrade": leg
                        }
                    }
                }
            }),
        }
    }

    fn prediction_prompt(
        asset: &str,
        patterns: &[DetectedPattern],
        sentiment: &SentimentResult,
    ) -> anyhow::Result<String> {
        let patterns_json =
            serde_json::to_string(patterns).context("failed to serialize patterns for prompt")?;
        Ok(format!(
            "Asset: {asset}\n\n\
Detected chart patterns JSON:\n{patterns_json}\n\n\
News sentiment score (-1..1): {score:.2} across {count} articles.\n\n\
Combine both into a directional prediction. weights.technical + weights.news must equal 100.\n\
Include a main trade plus a quickTrade (intraday to 3 days) and a swingTrade (1-2 weeks).",
            score = sentiment.score,
            count = sentiment.articles.len(),
        ))
    }

    fn response_text(res: &CreateMessageResponse) -> String {
        let mut out = String::new();
        for block in &res.content {
            if let ContentBlock::Text { text } = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    fn response_tool_input(res: &CreateMessageResponse, tool_name: &str) -> Option<Value> {
        res.content.iter().find_map(|block| match block {
            ContentBlock::ToolUse { name, input } if name == tool_name => Some(input.clone()),
            _ => None,
        })
    }
}

#[async_trait::async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn detect_patterns(&self, image: &ChartImage, asset: &str) -> anyhow::Result<Value> {
        let content = vec![
            ContentPart::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: image.media_type.clone(),
                    data: image.data_base64.clone(),
                },
            },
            ContentPart::Text {
                text: format!(
                    "Identify the technical chart patterns in this {asset} chart. \
                     Report each with a bullish/bearish/neutral bias and a confidence percentage."
                ),
            },
        ];
        self.run_tool("patterns", Self::patterns_tool(), content).await
    }

    async fn score_sentiment(&self, asset: &str) -> anyhow::Result<Value> {
        let content = vec![ContentPart::Text {
            text: format!(
                "Summarize recent news sentiment for {asset}. \
                 Score the overall tone and each article between -1 (very negative) and 1 (very positive)."
            ),
        }];
        self.run_tool("sentiment", Self::sentiment_tool(), content).await
    }

    async fn predict(
        &self,
        asset: &str,
        patterns: &[DetectedPattern],
        sentiment: &SentimentResult,
    ) -> anyhow::Result<Value> {
        let content = vec![ContentPart::Text {
            text: Self::prediction_prompt(asset, patterns, sentiment)?,
        }];
        self.run_tool("prediction", Self::prediction_tool(), content).await
    }
}

#[derive(Debug, Clone, Serialize)]
struct CreateMessageRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,

    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateMessageResponse {
    content: Vec<ContentBlock>,

    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct Tool {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum ToolChoice {
    #[serde(rename = "tool")]
    Tool { name: &'static str },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn picks_matching_tool_input() {
        let res: CreateMessageResponse = serde_json::from_value(json!({
            "content": [
                {"type": "thinking", "thinking": "...", "signature": "sig"},
                {"type": "tool_use", "id": "toolu_1", "name": "emit_sentiment", "input": {"score": 0.1}},
                {"type": "tool_use", "id": "toolu_2", "name": TOOL_EMIT_PATTERNS, "input": {"patterns": []}},
            ],
            "stop_reason": "tool_use",
        }))
        .unwrap();

        assert_eq!(
            AnthropicClient::response_tool_input(&res, TOOL_EMIT_PATTERNS),
            Some(json!({"patterns": []}))
        );
        assert_eq!(
            AnthropicClient::response_tool_input(&res, TOOL_EMIT_PREDICTION),
            None
        );
    }

    #[test]
    fn joins_text_blocks() {
        let res: CreateMessageResponse = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "```json"},
                {"type": "text", "text": "{\"score\": 0.2, \"articles\": []}\n```"},
            ],
        }))
        .unwrap();
        let text = AnthropicClient::response_text(&res);
        assert_eq!(
            json::parse_model_json(&text).unwrap(),
            json!({"score": 0.2, "articles": []})
        );
    }

    #[test]
    fn image_block_serializes_as_base64_source() {
        let part = ContentPart::Image {
            source: ImageSource {
                kind: "base64",
                media_type: "image/png".to_string(),
                data: "iVBORw0KGgo=".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&part).unwrap(),
            json!({
                "type": "image",
                "source": {"type": "base64", "media_type": "image/png", "data": "iVBORw0KGgo="}
            })
        );
    }

    #[test]
    fn prediction_prompt_embeds_inputs() {
        let patterns = vec![DetectedPattern {
            name: "Bull Flag".to_string(),
            pattern_type: crate::domain::analysis::PatternType::Bullish,
            confidence: 81.0,
        }];
        let sentiment = SentimentResult {
            score: 0.35,
            articles: Vec::new(),
        };
        let prompt = AnthropicClient::prediction_prompt("ETHUSD", &patterns, &sentiment).unwrap();
        assert!(prompt.contains("Asset: ETHUSD"));
        assert!(prompt.contains("Bull Flag"));
        assert!(prompt.contains("0.35 across 0 articles"));
    }
}
