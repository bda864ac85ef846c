use crate::model::{
    is_due, DigestStatus, DueSubscription, NormalizedVideo, PendingDigest, Video,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For a file-backed SQLite URL, ensure the parent directory exists.
/// In-memory URLs and non-sqlite schemes pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let path_part = rest.split('?').next().unwrap_or(rest);
    if let Some(parent) = std::path::Path::new(path_part).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    url.to_string()
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// === users ===

#[instrument(skip_all)]
pub async fn get_or_create_user(
    pool: &Pool,
    telegram_id: i64,
    username: Option<&str>,
    first_name: Option<&str>,
    last_name: Option<&str>,
    language_code: Option<&str>,
) -> Result<i64> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE telegram_id = ?")
        .bind(telegram_id)
        .fetch_optional(pool)
        .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query(
        "INSERT INTO users (telegram_id, username, first_name, last_name, language_code) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(telegram_id)
    .bind(username)
    .bind(first_name)
    .bind(last_name)
    .bind(language_code)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn mark_user_inactive(pool: &Pool, user_id: i64) -> Result<()> {
    sqlx::query("UPDATE users SET is_active = 0 WHERE id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

// === channels ===

#[instrument(skip_all)]
pub async fn upsert_channel(pool: &Pool, external_id: &str, name: &str) -> Result<i64> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM channels WHERE channel_id = ?")
        .bind(external_id)
        .fetch_optional(pool)
        .await?
    {
        // Re-activate in case the channel was deactivated and re-added later.
        sqlx::query("UPDATE channels SET is_active = 1 WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        return Ok(id);
    }

    let rec = sqlx::query(
        "INSERT INTO channels (channel_id, channel_name) VALUES (?, ?) RETURNING id",
    )
    .bind(external_id)
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn update_channel_checked(
    pool: &Pool,
    channel_pk: i64,
    ts: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE channels SET last_checked = ? WHERE id = ?")
        .bind(ts)
        .bind(channel_pk)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_channel_inactive(pool: &Pool, channel_pk: i64) -> Result<()> {
    sqlx::query("UPDATE channels SET is_active = 0 WHERE id = ?")
        .bind(channel_pk)
        .execute(pool)
        .await?;
    Ok(())
}

// === subscriptions ===

#[instrument(skip_all)]
pub async fn subscribe(
    pool: &Pool,
    user_id: i64,
    channel_pk: i64,
    frequency: &str,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO subscriptions (user_id, channel_id, digest_frequency) VALUES (?, ?, ?) \
         ON CONFLICT(user_id, channel_id) \
         DO UPDATE SET is_active = 1, digest_frequency = excluded.digest_frequency \
         RETURNING id",
    )
    .bind(user_id)
    .bind(channel_pk)
    .bind(frequency)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn unsubscribe(pool: &Pool, user_id: i64, channel_external_id: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE subscriptions SET is_active = 0 \
         WHERE user_id = ? AND channel_id = (SELECT id FROM channels WHERE channel_id = ?) \
         AND is_active = 1",
    )
    .bind(user_id)
    .bind(channel_external_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Row for the `/subscriptions` command.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionView {
    pub channel_external_id: String,
    pub channel_name: String,
    pub digest_frequency: String,
    pub last_digest_sent: Option<DateTime<Utc>>,
}

#[instrument(skip_all)]
pub async fn list_subscriptions(pool: &Pool, user_id: i64) -> Result<Vec<SubscriptionView>> {
    let rows = sqlx::query_as::<_, SubscriptionView>(
        "SELECT c.channel_id AS channel_external_id, c.channel_name, \
                s.digest_frequency, s.last_digest_sent \
         FROM subscriptions s JOIN channels c ON c.id = s.channel_id \
         WHERE s.user_id = ? AND s.is_active = 1 \
         ORDER BY c.channel_name",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn active_subscriptions(pool: &Pool) -> Result<Vec<DueSubscription>> {
    let rows = sqlx::query_as::<_, DueSubscription>(
        "SELECT s.id, s.user_id, u.telegram_id, \
                s.channel_id AS channel_pk, c.channel_id AS channel_external_id, \
                c.channel_name, c.last_checked AS channel_last_checked, \
                s.digest_frequency, s.last_digest_sent \
         FROM subscriptions s \
         JOIN users u ON u.id = s.user_id \
         JOIN channels c ON c.id = s.channel_id \
         WHERE s.is_active = 1 AND u.is_active = 1 AND c.is_active = 1 \
         ORDER BY s.id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Active subscriptions whose elapsed time since the last digest meets the
/// configured frequency (the due policy itself lives in `model::is_due`).
#[instrument(skip_all)]
pub async fn get_due_subscriptions(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<DueSubscription>> {
    let rows = active_subscriptions(pool).await?;
    Ok(rows
        .into_iter()
        .filter(|s| is_due(s.last_digest_sent, s.frequency(), now))
        .collect())
}

#[instrument(skip_all)]
pub async fn subscriptions_for_user(pool: &Pool, user_id: i64) -> Result<Vec<DueSubscription>> {
    let rows = active_subscriptions(pool).await?;
    Ok(rows.into_iter().filter(|s| s.user_id == user_id).collect())
}

#[instrument(skip_all)]
pub async fn update_subscription_sent(
    pool: &Pool,
    subscription_id: i64,
    ts: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE subscriptions SET last_digest_sent = ? WHERE id = ?")
        .bind(ts)
        .bind(subscription_id)
        .execute(pool)
        .await?;
    Ok(())
}

// === videos ===

/// Insert a batch of normalized videos for a channel, skipping any whose
/// `video_id` is already known. Dedup relies on the unique constraint so
/// concurrent fetches for the same window cannot double-insert. Returns the
/// ids of newly inserted rows only.
#[instrument(skip_all)]
pub async fn upsert_videos(
    pool: &Pool,
    channel_pk: i64,
    records: &[NormalizedVideo],
) -> Result<Vec<i64>> {
    let mut tx = pool.begin().await?;
    let mut new_ids = Vec::new();
    for rec in records {
        let inserted = sqlx::query_scalar::<_, i64>(
            "INSERT INTO videos \
             (video_id, channel_id, title, description, duration, thumbnail_url, published_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(video_id) DO NOTHING \
             RETURNING id",
        )
        .bind(&rec.video_id)
        .bind(channel_pk)
        .bind(&rec.title)
        .bind(&rec.description)
        .bind(&rec.duration)
        .bind(&rec.thumbnail_url)
        .bind(rec.published_at)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(id) = inserted {
            new_ids.push(id);
        }
    }
    tx.commit().await?;
    Ok(new_ids)
}

/// Videos for a channel not yet embedded in any digest, inside the window,
/// oldest first.
#[instrument(skip_all)]
pub async fn get_unprocessed_videos(
    pool: &Pool,
    channel_pk: i64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Video>> {
    let rows = sqlx::query_as::<_, Video>(
        "SELECT id, video_id, channel_id, title, description, duration, thumbnail_url, \
                published_at, is_processed \
         FROM videos \
         WHERE channel_id = ? AND is_processed = 0 \
           AND datetime(published_at) >= datetime(?) AND datetime(published_at) <= datetime(?) \
         ORDER BY datetime(published_at) ASC",
    )
    .bind(channel_pk)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// === digests ===

pub struct NewDigest<'a> {
    pub user_id: i64,
    pub subscription_id: i64,
    pub title: &'a str,
    pub content: &'a str,
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
    /// (video pk, per-video summary) in digest order.
    pub videos: &'a [(i64, String)],
}

/// Persist a pending digest together with its ordered video list and flag the
/// included videos processed, all in one transaction. A crash can never leave
/// videos processed without a digest or the other way around.
#[instrument(skip_all)]
pub async fn create_digest(pool: &Pool, d: &NewDigest<'_>, now: DateTime<Utc>) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let digest_id: i64 = sqlx::query(
        "INSERT INTO digests \
         (user_id, subscription_id, title, content, status, video_count, \
          date_from, date_to, next_attempt_at) \
         VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?) RETURNING id",
    )
    .bind(d.user_id)
    .bind(d.subscription_id)
    .bind(d.title)
    .bind(d.content)
    .bind(d.videos.len() as i64)
    .bind(d.date_from)
    .bind(d.date_to)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?
    .get("id");

    for (order, (video_pk, summary)) in d.videos.iter().enumerate() {
        sqlx::query(
            "INSERT INTO digest_videos (digest_id, video_id, order_in_digest, summary) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(digest_id)
        .bind(video_pk)
        .bind(order as i64)
        .bind(summary)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE videos SET is_processed = 1 WHERE id = ?")
            .bind(video_pk)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(digest_id)
}

#[instrument(skip_all)]
pub async fn due_pending_digests(
    pool: &Pool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<PendingDigest>> {
    let rows = sqlx::query_as::<_, PendingDigest>(
        "SELECT d.id, d.user_id, d.subscription_id, u.telegram_id, d.content, d.attempt \
         FROM digests d JOIN users u ON u.id = d.user_id \
         WHERE d.status = 'pending' AND datetime(d.next_attempt_at) <= datetime(?) \
         ORDER BY datetime(d.next_attempt_at) ASC LIMIT ?",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn get_pending_digest(pool: &Pool, digest_id: i64) -> Result<Option<PendingDigest>> {
    let row = sqlx::query_as::<_, PendingDigest>(
        "SELECT d.id, d.user_id, d.subscription_id, u.telegram_id, d.content, d.attempt \
         FROM digests d JOIN users u ON u.id = d.user_id \
         WHERE d.id = ? AND d.status = 'pending'",
    )
    .bind(digest_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Claim a delivery attempt: bump the attempt counter and push the next retry
/// slot forward, conditioned on the attempt count the caller read. Exactly one
/// of several concurrent claimers wins; losers see zero rows affected.
#[instrument(skip_all)]
pub async fn claim_digest_attempt(
    pool: &Pool,
    digest_id: i64,
    expected_attempt: i64,
    next_attempt_at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE digests SET attempt = attempt + 1, next_attempt_at = ? \
         WHERE id = ? AND status = 'pending' AND attempt = ?",
    )
    .bind(next_attempt_at)
    .bind(digest_id)
    .bind(expected_attempt)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// pending -> sent. Guarded on the current status so the transition is the
/// mutual-exclusion mechanism; returns false if the digest was not pending.
#[instrument(skip_all)]
pub async fn mark_digest_sent(pool: &Pool, digest_id: i64, ts: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE digests SET status = 'sent', sent_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(ts)
    .bind(digest_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// pending -> failed. Terminal; failed digests stay visible for operators.
#[instrument(skip_all)]
pub async fn mark_digest_failed(pool: &Pool, digest_id: i64, ts: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE digests SET status = 'failed', failed_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(ts)
    .bind(digest_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Row for operator inspection of terminally failed digests.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FailedDigest {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub attempt: i64,
    pub failed_at: Option<DateTime<Utc>>,
}

#[instrument(skip_all)]
pub async fn list_failed_digests(pool: &Pool, limit: i64) -> Result<Vec<FailedDigest>> {
    let rows = sqlx::query_as::<_, FailedDigest>(
        "SELECT id, user_id, title, attempt, failed_at FROM digests \
         WHERE status = 'failed' ORDER BY datetime(failed_at) DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn count_digests_by_status(pool: &Pool, status: DigestStatus) -> Result<i64> {
    let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM digests WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;
    Ok(n)
}

#[instrument(skip_all)]
pub async fn count_active_subscriptions(pool: &Pool) -> Result<i64> {
    let n =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM subscriptions WHERE is_active = 1")
            .fetch_one(pool)
            .await?;
    Ok(n)
}
