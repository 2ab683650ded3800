use crate::domain::analysis::Analysis;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub const MAX_LIST_LIMIT: i64 = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAnalysis {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub provider: String,
    pub repair_count: i32,
    #[serde(flatten)]
    pub analysis: Analysis,
}

type AnalysisRow = (
    Uuid,
    Option<String>,
    String,
    String,
    String,
    Value,
    Value,
    Value,
    i32,
    DateTime<Utc>,
);

const SELECT_COLUMNS: &str = "SELECT id, user_id, provider, asset, image_url, patterns, news_sentiment, prediction, repair_count, created_at \
     FROM analyses";

pub async fn persist_analysis(
    pool: &sqlx::PgPool,
    user_id: Option<&str>,
    provider: &str,
    analysis: &Analysis,
    repair_count: usize,
) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    let patterns = serde_json::to_value(&analysis.patterns).context("serialize patterns failed")?;
    let news_sentiment =
        serde_json::to_value(&analysis.news_sentiment).context("serialize news_sentiment failed")?;
    let prediction =
        serde_json::to_value(&analysis.prediction).context("serialize prediction failed")?;
    let repair_count = i32::try_from(repair_count).unwrap_or(i32::MAX);

    sqlx::query(
        "INSERT INTO analyses (id, user_id, provider, asset, image_url, patterns, news_sentiment, prediction, repair_count, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(id)
    .bind(user_id)
    .bind(provider)
    .bind(&analysis.asset)
    .bind(&analysis.image_url)
    .bind(patterns)
    .bind(news_sentiment)
    .bind(prediction)
    .bind(repair_count)
    .bind(analysis.timestamp)
    .execute(pool)
    .await
    .context("insert analyses failed")?;

    Ok(id)
}

pub async fn fetch_analysis(pool: &sqlx::PgPool, id: Uuid) -> anyhow::Result<Option<StoredAnalysis>> {
    let row = sqlx::query_as::<_, AnalysisRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("select analysis failed (id={id})"))?;

    row.map(from_row).transpose()
}

/// Newest first. `limit` is clamped to `1..=MAX_LIST_LIMIT`.
pub async fn list_analyses(
    pool: &sqlx::PgPool,
    asset: Option<&str>,
    limit: i64,
) -> anyhow::Result<Vec<StoredAnalysis>> {
    let limit = limit.clamp(1, MAX_LIST_LIMIT);
    let rows = match asset {
        Some(asset) => {
            sqlx::query_as::<_, AnalysisRow>(&format!(
                "{SELECT_COLUMNS} WHERE asset = $1 ORDER BY created_at DESC LIMIT $2"
            ))
            .bind(asset)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, AnalysisRow>(&format!(
                "{SELECT_COLUMNS} ORDER BY created_at DESC LIMIT $1"
            ))
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
    .context("select analyses failed")?;

    rows.into_iter().map(from_row).collect()
}

fn from_row(row: AnalysisRow) -> anyhow::Result<StoredAnalysis> {
    let (
        id,
        user_id,
        provider,
        asset,
        image_url,
        patterns,
        news_sentiment,
        prediction,
        repair_count,
        created_at,
    ) = row;

    let analysis = Analysis {
        asset,
        image_url,
        patterns: serde_json::from_value(patterns)
            .with_context(|| format!("invalid patterns JSON in DB for analysis id={id}"))?,
        news_sentiment: serde_json::from_value(news_sentiment)
            .with_context(|| format!("invalid news_sentiment JSON in DB for analysis id={id}"))?,
        prediction: serde_json::from_value(prediction)
            .with_context(|| format!("invalid prediction JSON in DB for analysis id={id}"))?,
        timestamp: created_at,
    };

    Ok(StoredAnalysis {
        id,
        user_id,
        provider,
        repair_count,
        analysis,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize_patterns, normalize_prediction, normalize_sentiment};
    use chrono::TimeZone;
    use serde_json::json;

    fn sample_row() -> AnalysisRow {
        let mut repairs = Vec::new();
        let patterns = normalize_patterns(
            &json!([{"name": "Double Top", "type": "bearish", "confidence": 87}]),
            &mut repairs,
        )
        .unwrap();
        let sentiment = normalize_sentiment(&json!({"score": -0.2, "articles": []}), &mut repairs)
            .unwrap();
        let prediction = normalize_prediction(&json!({"direction": "bearish"}), &mut repairs).unwrap();

        (
            Uuid::nil(),
            Some("user-1".to_string()),
            "anthropic".to_string(),
            "BTCUSD".to_string(),
            "data:image/png;base64,iVBORw0KGgo=".to_string(),
            serde_json::to_value(patterns).unwrap(),
            serde_json::to_value(sentiment).unwrap(),
            serde_json::to_value(prediction).unwrap(),
            repairs.len() as i32,
            Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap(),
        )
    }

    #[test]
    fn row_decodes_into_stored_analysis() {
        let stored = from_row(sample_row()).unwrap();
        assert_eq!(stored.analysis.asset, "BTCUSD");
        assert_eq!(stored.analysis.patterns.len(), 1);
        assert_eq!(stored.analysis.news_sentiment.score, -0.2);

        let body = serde_json::to_value(&stored).unwrap();
        assert_eq!(body["userId"], json!("user-1"));
        assert_eq!(body["prediction"]["direction"], json!("bearish"));
        assert_eq!(
            body["prediction"]["tradingRecommendation"]["swingTrade"]["timeframe"],
            json!("1-2 weeks")
        );
    }

    #[test]
    fn corrupt_json_column_is_an_error() {
        let mut row = sample_row();
        row.7 = json!({"direction": 5});
        let err = from_row(row).unwrap_err();
        assert!(err.to_string().contains("invalid prediction JSON"));
    }
}
