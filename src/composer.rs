use crate::db::{self, NewDigest, Pool};
use crate::model::{DueSubscription, Video};
use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy)]
pub struct ComposePolicy {
    pub max_videos_per_digest: usize,
}

/// Compose a pending digest for a due subscription. Returns the new digest id,
/// or `None` when the channel has no eligible videos (in which case no row is
/// written and `last_digest_sent` stays untouched, so the subscription remains
/// due next cycle).
#[instrument(skip_all, fields(subscription = sub.id))]
pub async fn compose_for_subscription(
    pool: &Pool,
    sub: &DueSubscription,
    policy: ComposePolicy,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let date_from = sub
        .last_digest_sent
        .unwrap_or_else(|| now - sub.frequency().interval());
    let date_to = now;

    let mut videos = db::get_unprocessed_videos(pool, sub.channel_pk, date_from, date_to).await?;
    if videos.is_empty() {
        debug!(subscription = sub.id, "no eligible videos; skipping digest");
        return Ok(None);
    }

    // Oldest-first truncation: overflow stays unprocessed and rolls into the
    // next cycle.
    videos.truncate(policy.max_videos_per_digest);

    let title = render_title(&sub.channel_name, videos.len());
    let entries: Vec<(i64, String)> = videos
        .iter()
        .map(|v| (v.id, render_summary(v)))
        .collect();
    let content = render_content(&title, &entries);

    let digest_id = db::create_digest(
        pool,
        &NewDigest {
            user_id: sub.user_id,
            subscription_id: sub.id,
            title: &title,
            content: &content,
            date_from,
            date_to,
            videos: &entries,
        },
        now,
    )
    .await?;

    info!(
        subscription = sub.id,
        digest_id,
        videos = entries.len(),
        "composed digest"
    );
    Ok(Some(digest_id))
}

fn render_title(channel_name: &str, count: usize) -> String {
    if count == 1 {
        format!("{channel_name}: 1 new video")
    } else {
        format!("{channel_name}: {count} new videos")
    }
}

/// Placeholder per-video summary; an external summarizer can replace this
/// text without touching composition.
fn render_summary(video: &Video) -> String {
    format!(
        "{} ({})\nhttps://www.youtube.com/watch?v={}",
        video.title,
        video.published_at.format("%Y-%m-%d"),
        video.video_id
    )
}

fn render_content(title: &str, entries: &[(i64, String)]) -> String {
    let mut out = String::from(title);
    out.push('\n');
    for (i, (_, summary)) in entries.iter().enumerate() {
        out.push('\n');
        out.push_str(&format!("{}. {}", i + 1, summary));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn video(id: i64, external: &str, title: &str) -> Video {
        Video {
            id,
            video_id: external.to_string(),
            channel_id: 1,
            title: title.to_string(),
            description: None,
            duration: None,
            thumbnail_url: None,
            published_at: Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap(),
            is_processed: false,
        }
    }

    #[test]
    fn title_pluralizes() {
        assert_eq!(render_title("Chan", 1), "Chan: 1 new video");
        assert_eq!(render_title("Chan", 3), "Chan: 3 new videos");
    }

    #[test]
    fn summary_links_the_video() {
        let s = render_summary(&video(1, "abc", "Hello"));
        assert!(s.starts_with("Hello (2026-08-01)"));
        assert!(s.contains("https://www.youtube.com/watch?v=abc"));
    }

    #[test]
    fn content_numbers_entries_in_order() {
        let entries = vec![(1, "first".to_string()), (2, "second".to_string())];
        let c = render_content("T", &entries);
        let first = c.find("1. first").unwrap();
        let second = c.find("2. second").unwrap();
        assert!(first < second);
    }
}
