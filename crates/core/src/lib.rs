pub mod domain;
pub mod llm;
pub mod normalize;
pub mod pipeline;
pub mod storage;

pub mod config {
    use anyhow::Context;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub anthropic_api_key: Option<String>,
        pub sentry_dsn: Option<String>,
        /// Analyses allowed per user in a rolling 24h window. `None` means unlimited.
        pub analysis_daily_limit: Option<i64>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            let analysis_daily_limit = match std::env::var("ANALYSIS_DAILY_LIMIT") {
                Ok(v) if !v.trim().is_empty() => {
                    let limit = v
                        .trim()
                        .parse::<i64>()
                        .with_context(|| format!("ANALYSIS_DAILY_LIMIT is not an integer: {v}"))?;
                    anyhow::ensure!(limit >= 0, "ANALYSIS_DAILY_LIMIT must be >= 0 (got {limit})");
                    Some(limit)
                }
                _ => None,
            };

            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                analysis_daily_limit,
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_anthropic_api_key(&self) -> anyhow::Result<&str> {
            self.anthropic_api_key
                .as_deref()
                .context("ANTHROPIC_API_KEY is required")
        }
    }
}
