use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use snaptrade_core::domain::analysis::{Analysis, UsageInfo};
use snaptrade_core::llm::image::MAX_IMAGE_BYTES;
use snaptrade_core::llm::{ChartImage, LlmClient};
use snaptrade_core::pipeline::{self, AnalyzeRequest};
use snaptrade_core::storage::analyses::{self, StoredAnalysis};
use snaptrade_core::storage::usage::{self, SlotReservation};

mod error;

use error::ApiError;

const DEFAULT_LIST_LIMIT: i64 = 20;
/// Base64 of the largest accepted image plus room for the rest of the JSON body.
const MAX_BODY_BYTES: usize = MAX_IMAGE_BYTES.div_ceil(3) * 4 + 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = snaptrade_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match snaptrade_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let llm: Option<Arc<dyn LlmClient>> =
        match snaptrade_core::llm::anthropic::AnthropicClient::from_settings(&settings) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::error!(error = %e, "LLM client unavailable; chart analysis disabled");
                None
            }
        };

    let state = AppState {
        pool,
        llm,
        daily_limit: settings.analysis_daily_limit,
    };

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, daily_limit = ?state.daily_limit, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/analyze", post(analyze))
        .route("/api/analyses", get(list_recent))
        .route("/api/analyses/:id", get(get_analysis))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    pool: Option<PgPool>,
    llm: Option<Arc<dyn LlmClient>>,
    daily_limit: Option<i64>,
}

impl AppState {
    fn pool(&self) -> Result<&PgPool, ApiError> {
        self.pool
            .as_ref()
            .ok_or_else(|| ApiError::unavailable("Database is not configured"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeBody {
    asset: String,
    /// Chart screenshot as a `data:image/...;base64,` URI.
    image: String,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    id: Uuid,
    #[serde(flatten)]
    analysis: Analysis,
    usage_info: UsageInfo,
}

async fn analyze(
    State(state): State<AppState>,
    body: Result<Json<AnalyzeBody>, JsonRejection>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let image = ChartImage::from_data_uri(&body.image)
        .map_err(|e| ApiError::bad_request(format!("{e:#}")))?;
    let req = AnalyzeRequest::try_new(&body.asset, image)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let user_id = body
        .user_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let pool = state.pool()?;
    let llm = state
        .llm
        .as_deref()
        .ok_or_else(|| ApiError::unavailable("Chart analysis is not configured"))?;

    let since = Utc::now() - chrono::Duration::hours(24);
    let reservation = usage::reserve_slot(pool, user_id, since, state.daily_limit)
        .await
        .map_err(|e| ApiError::internal("Failed to check usage", e))?;
    let (slot_id, used) = match reservation {
        SlotReservation::Reserved { id, used } => (id, used),
        SlotReservation::Exhausted { .. } => {
            return Err(ApiError::too_many_requests(
                "Daily analysis limit reached. Try again later.",
            ))
        }
    };

    let stored = async {
        let outcome = pipeline::analyze_chart(llm, req)
            .await
            .map_err(|e| ApiError::internal("Failed to analyze chart", e))?;
        let id = analyses::persist_analysis(
            pool,
            user_id,
            llm.provider().as_str(),
            &outcome.analysis,
            outcome.repairs.len(),
        )
        .await
        .map_err(|e| ApiError::internal("Failed to save analysis", e))?;
        Ok::<_, ApiError>((id, outcome))
    }
    .await;
    let (id, outcome) = match stored {
        Ok(stored) => stored,
        Err(err) => {
            if let Err(e) = usage::release_slot(pool, slot_id).await {
                tracing::warn!(error = ?e, %slot_id, "failed to release analysis slot");
            }
            return Err(err);
        }
    };

    tracing::info!(%id, asset = %outcome.analysis.asset, repairs = outcome.repairs.len(), "analysis stored");

    Ok(Json(AnalyzeResponse {
        id,
        analysis: outcome.analysis,
        usage_info: UsageInfo::new(used + 1, state.daily_limit),
    }))
}

async fn get_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StoredAnalysis>, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::bad_request("Invalid analysis id"))?;
    let pool = state.pool()?;

    let stored = analyses::fetch_analysis(pool, id)
        .await
        .map_err(|e| ApiError::internal("Failed to load analysis", e))?
        .ok_or_else(|| ApiError::not_found("Analysis not found"))?;

    Ok(Json(stored))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    asset: Option<String>,
    limit: Option<i64>,
}

async fn list_recent(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<StoredAnalysis>>, ApiError> {
    let pool = state.pool()?;
    let asset = params
        .asset
        .as_deref()
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty());

    let items = analyses::list_analyses(
        pool,
        asset.as_deref(),
        params.limit.unwrap_or(DEFAULT_LIST_LIMIT),
    )
    .await
    .map_err(|e| ApiError::internal("Failed to list analyses", e))?;

    Ok(Json(items))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
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
