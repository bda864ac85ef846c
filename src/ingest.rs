use crate::db::{self, Pool};
use crate::model::NormalizedVideo;
use crate::youtube::VideoRecord;
use anyhow::Result;
use tracing::{debug, instrument, warn};

/// Validate a fetched batch and insert whatever is new for the channel.
/// Malformed records (missing id, title, or publish timestamp) are skipped
/// with a warning and never abort the batch. Returns newly inserted video ids.
#[instrument(skip_all, fields(channel_pk))]
pub async fn ingest_batch(
    pool: &Pool,
    channel_pk: i64,
    records: Vec<VideoRecord>,
) -> Result<Vec<i64>> {
    let mut normalized = Vec::with_capacity(records.len());
    for rec in records {
        match normalize(rec) {
            Some(v) => normalized.push(v),
            None => continue,
        }
    }

    let new_ids = db::upsert_videos(pool, channel_pk, &normalized).await?;
    debug!(
        channel_pk,
        fetched = normalized.len(),
        inserted = new_ids.len(),
        "ingested batch"
    );
    Ok(new_ids)
}

fn normalize(rec: VideoRecord) -> Option<NormalizedVideo> {
    let Some(published_at) = rec.published_at else {
        warn!(video_id = %rec.video_id, "skipping video without publish timestamp");
        return None;
    };
    if rec.video_id.trim().is_empty() {
        warn!(title = %rec.title, "skipping video without id");
        return None;
    }
    if rec.title.trim().is_empty() {
        warn!(video_id = %rec.video_id, "skipping video without title");
        return None;
    }
    Some(NormalizedVideo {
        video_id: rec.video_id,
        title: rec.title,
        description: rec.description,
        duration: rec.duration,
        thumbnail_url: rec.thumbnail_url,
        published_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, title: &str) -> VideoRecord {
        VideoRecord {
            video_id: id.to_string(),
            title: title.to_string(),
            published_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    #[test]
    fn well_formed_record_normalizes() {
        assert!(normalize(record("a", "t")).is_some());
    }

    #[test]
    fn malformed_records_are_dropped() {
        assert!(normalize(record("", "t")).is_none());
        assert!(normalize(record("a", "  ")).is_none());

        let mut no_ts = record("a", "t");
        no_ts.published_at = None;
        assert!(normalize(no_ts).is_none());
    }

    #[tokio::test]
    async fn malformed_record_does_not_abort_batch() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let channel = db::upsert_channel(&pool, "UC1", "C").await.unwrap();

        let batch = vec![record("good-1", "ok"), record("", "broken"), record("good-2", "ok")];
        let inserted = ingest_batch(&pool, channel, batch).await.unwrap();
        assert_eq!(inserted.len(), 2);
    }
}
