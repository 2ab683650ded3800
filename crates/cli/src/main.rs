use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snaptrade_core::llm::{json, ChartImage, LlmClient};
use snaptrade_core::normalize::{self, Repair, RepairObserver, TracingObserver};
use snaptrade_core::pipeline::{self, AnalyzeRequest};

#[derive(Debug, Parser)]
#[command(name = "snaptrade_cli")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Normalize a raw model response (file or stdin) and print the repaired JSON.
    Normalize {
        #[arg(long, value_enum)]
        kind: Kind,

        /// Reads stdin when omitted.
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Run the full chart analysis against the configured LLM.
    Analyze {
        /// Asset symbol, e.g. BTCUSD.
        #[arg(long)]
        asset: String,

        /// Chart screenshot (png, jpg, gif or webp).
        #[arg(long)]
        image: PathBuf,

        #[arg(long)]
        user_id: Option<String>,

        /// Do everything except writing to the database.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Kind {
    Patterns,
    Sentiment,
    Prediction,
}

impl Kind {
    fn stage(self) -> &'static str {
        match self {
            Kind::Patterns => "patterns",
            Kind::Sentiment => "sentiment",
            Kind::Prediction => "prediction",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = snaptrade_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    // stdout is reserved for JSON output.
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let result = match args.command {
        Command::Normalize { kind, input } => run_normalize(kind, input.as_deref()),
        Command::Analyze {
            asset,
            image,
            user_id,
            dry_run,
        } => run_analyze(&settings, &asset, &image, user_id.as_deref(), dry_run).await,
    };

    if let Err(err) = &result {
        sentry_anyhow::capture_anyhow(err);
    }
    result
}

fn run_normalize(kind: Kind, input: Option<&Path>) -> anyhow::Result<()> {
    let text = match input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };

    let (normalized, repairs) = normalize_text(kind, &text)?;

    let mut tracer = TracingObserver { stage: kind.stage() };
    for repair in &repairs {
        tracer.on_repair(repair.clone());
    }
    tracing::info!(kind = kind.stage(), repairs = repairs.len(), "normalized model output");

    println!("{}", serde_json::to_string_pretty(&normalized)?);
    Ok(())
}

fn normalize_text(kind: Kind, text: &str) -> anyhow::Result<(Value, Vec<Repair>)> {
    let raw = json::parse_model_json(text)?;
    let mut repairs = Vec::new();
    let context = || format!("{} output failed validation", kind.stage());

    let normalized = match kind {
        Kind::Patterns => serde_json::to_value(
            normalize::normalize_patterns(&raw, &mut repairs).with_context(context)?,
        )?,
        Kind::Sentiment => serde_json::to_value(
            normalize::normalize_sentiment(&raw, &mut repairs).with_context(context)?,
        )?,
        Kind::Prediction => serde_json::to_value(
            normalize::normalize_prediction(&raw, &mut repairs).with_context(context)?,
        )?,
    };
    Ok((normalized, repairs))
}

async fn run_analyze(
    settings: &snaptrade_core::config::Settings,
    asset: &str,
    image_path: &Path,
    user_id: Option<&str>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let media_type = ChartImage::media_type_for_path(image_path)
        .with_context(|| format!("unsupported image extension: {}", image_path.display()))?;
    let bytes = std::fs::read(image_path)
        .with_context(|| format!("failed to read {}", image_path.display()))?;
    let image = ChartImage::from_bytes(media_type, &bytes)?;
    let req = AnalyzeRequest::try_new(asset, image)?;

    let llm = snaptrade_core::llm::anthropic::AnthropicClient::from_settings(settings)?;
    let outcome = pipeline::analyze_chart(&llm, req).await?;

    if dry_run {
        tracing::info!(
            asset = %outcome.analysis.asset,
            dry_run = true,
            repairs = outcome.repairs.len(),
            "analysis complete (not persisted)"
        );
    } else {
        let db_url = settings.require_database_url()?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(db_url)
            .await
            .context("connect DATABASE_URL failed")?;
        snaptrade_core::storage::migrate(&pool).await?;

        let id = snaptrade_core::storage::analyses::persist_analysis(
            &pool,
            user_id,
            llm.provider().as_str(),
            &outcome.analysis,
            outcome.repairs.len(),
        )
        .await?;
        tracing::info!(%id, asset = %outcome.analysis.asset, "persisted analysis");
    }

    println!("{}", serde_json::to_string_pretty(&outcome.analysis)?);
    Ok(())
}

fn init_sentry(settings: &snaptrade_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_normalize_subcommand() {
        let args = Args::try_parse_from(["snaptrade_cli", "normalize", "--kind", "sentiment"]).unwrap();
        match args.command {
            Command::Normalize { kind, input } => {
                assert_eq!(kind, Kind::Sentiment);
                assert!(input.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn normalizes_fenced_sentiment() {
        let text = "```json\n{\"score\": 1.5, \"articles\": \"not-an-array\"}\n```";
        let (out, repairs) = normalize_text(Kind::Sentiment, text).unwrap();
        assert_eq!(out, json!({"score": 1.0, "articles": []}));
        assert_eq!(repairs.len(), 2);
    }

    #[test]
    fn strict_patterns_fail() {
        let err = normalize_text(Kind::Patterns, r#"{"name": 123, "type": "bullish", "confidence": 50}"#)
            .unwrap_err();
        assert!(format!("{err:#}").contains("patterns output failed validation"));
    }

    #[test]
    fn prediction_gets_disclaimer() {
        let (out, _) = normalize_text(Kind::Prediction, "{}").unwrap();
        let condition = out["tradingRecommendation"]["entryCondition"].as_str().unwrap();
        assert!(condition.contains("educational purposes"));
        assert_eq!(out["weights"], json!({"technical": 70.0, "news": 30.0}));
    }
}
