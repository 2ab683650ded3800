use crate::domain::analysis::UsageInfo;
use anyhow::Context;
use chrono::{DateTime, Utc};
use uuid::Uuid;

// First key of the two-key advisory lock; the second is the hashed user id.
const LOCK_NAMESPACE: i32 = 0x534E_4150; // "SNAP"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotReservation {
    /// `used` counts the slots held before this one.
    Reserved { id: Uuid, used: i64 },
    Exhausted { used: i64 },
}

/// Claims one analysis slot for `user_id` (anonymous when `None`) in the window starting at
/// `since`.
///
/// Count and insert run in one transaction under a per-user `pg_advisory_xact_lock`, so
/// concurrent requests cannot both take the last slot. Release the slot with [`release_slot`]
/// if the analysis is not stored.
pub async fn reserve_slot(
    pool: &sqlx::PgPool,
    user_id: Option<&str>,
    since: DateTime<Utc>,
    daily_limit: Option<i64>,
) -> anyhow::Result<SlotReservation> {
    let mut tx = pool.begin().await.context("begin slot transaction failed")?;

    sqlx::query("SELECT pg_advisory_xact_lock($1, hashtext(COALESCE($2, '')))")
        .persistent(false)
        .bind(LOCK_NAMESPACE)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .context("failed to acquire usage lock")?;

    let used: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM analysis_slots WHERE user_id IS NOT DISTINCT FROM $1 AND created_at >= $2",
    )
    .bind(user_id)
    .bind(since)
    .fetch_one(&mut *tx)
    .await
    .context("count analysis slots failed")?;

    if UsageInfo::new(used, daily_limit).is_exhausted() {
        tx.rollback().await.context("rollback slot transaction failed")?;
        return Ok(SlotReservation::Exhausted { used });
    }

    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO analysis_slots (id, user_id, created_at) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(user_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .context("insert analysis slot failed")?;

    tx.commit().await.context("commit slot transaction failed")?;
    Ok(SlotReservation::Reserved { id, used })
}

pub async fn release_slot(pool: &sqlx::PgPool, id: Uuid) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM analysis_slots WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .with_context(|| format!("release analysis slot failed (id={id})"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Needs a live Postgres; skipped when DATABASE_URL is unset.
    #[tokio::test]
    async fn concurrent_reservations_respect_limit() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .unwrap();
        crate::storage::migrate(&pool).await.unwrap();

        let user = format!("slot-test-{}", Uuid::new_v4());
        let since = Utc::now() - chrono::Duration::hours(24);

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let user = user.clone();
            set.spawn(async move { reserve_slot(&pool, Some(&user), since, Some(2)).await.unwrap() });
        }
        let mut reserved = Vec::new();
        while let Some(res) = set.join_next().await {
            if let SlotReservation::Reserved { id, .. } = res.unwrap() {
                reserved.push(id);
            }
        }
        assert_eq!(reserved.len(), 2);

        release_slot(&pool, reserved[0]).await.unwrap();
        assert!(matches!(
            reserve_slot(&pool, Some(&user), since, Some(2)).await.unwrap(),
            SlotReservation::Reserved { used: 1, .. }
        ));

        sqlx::query("DELETE FROM analysis_slots WHERE user_id = $1")
            .bind(&user)
            .execute(&pool)
            .await
            .unwrap();
    }
}
