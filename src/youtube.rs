use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::limiter::IntervalLimiter;

const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/";
const MAX_RESULTS: u32 = 50;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream rate limited")]
    RateLimited,
    #[error("channel not found")]
    NotFound,
    #[error("transient upstream failure: {0}")]
    Transient(String),
}

/// A video as returned by the upstream, before ingest validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoRecord {
    pub video_id: String,
    pub title: String,
    pub description: Option<String>,
    pub duration: Option<String>,
    pub thumbnail_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait VideoSource: Send + Sync {
    /// List videos published on a channel since `since`, newest window only.
    async fn list_recent_videos(
        &self,
        channel_external_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<VideoRecord>, FetchError>;
}

pub struct YouTubeClient {
    http: Client,
    base_url: Url,
    api_key: String,
    limiter: IntervalLimiter,
}

impl fmt::Debug for YouTubeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YouTubeClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl YouTubeClient {
    pub fn new(api_key: String, request_interval: Duration) -> Self {
        let base_url = Url::parse(YOUTUBE_API_BASE).expect("valid default YouTube URL");
        Self::with_base_url(api_key, request_interval, base_url)
    }

    pub fn with_base_url(api_key: String, request_interval: Duration, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("yt-digest-bot/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
            limiter: IntervalLimiter::new(request_interval),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
    snippet: Snippet,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
    #[serde(default)]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Deserialize, Default)]
struct Thumbnails {
    #[serde(default)]
    high: Option<Thumbnail>,
    #[serde(default)]
    medium: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

impl SearchItem {
    fn into_record(self) -> VideoRecord {
        let thumbnail_url = self
            .snippet
            .thumbnails
            .high
            .or(self.snippet.thumbnails.medium)
            .map(|t| t.url);
        VideoRecord {
            video_id: self.id.video_id.unwrap_or_default(),
            title: self.snippet.title,
            description: self.snippet.description,
            duration: None,
            thumbnail_url,
            published_at: self.snippet.published_at,
        }
    }
}

#[async_trait]
impl VideoSource for YouTubeClient {
    async fn list_recent_videos(
        &self,
        channel_external_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<VideoRecord>, FetchError> {
        self.limiter.acquire().await;

        let endpoint = self
            .base_url
            .join("youtube/v3/search")
            .map_err(|e| FetchError::Transient(format!("invalid YouTube base URL: {e}")))?;

        let max_results = MAX_RESULTS.to_string();
        let published_after = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let res = self
            .http
            .get(endpoint)
            .query(&[
                ("key", self.api_key.as_str()),
                ("channelId", channel_external_id),
                ("part", "snippet"),
                ("order", "date"),
                ("type", "video"),
                ("maxResults", max_results.as_str()),
                ("publishedAfter", published_after.as_str()),
            ])
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("failed to reach YouTube: {e}")))?;

        match res.status() {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => {
                // 403 is how the Data API reports an exhausted quota
                let body = res.text().await.unwrap_or_default();
                warn!(channel = channel_external_id, %body, "YouTube rate limit");
                return Err(FetchError::RateLimited);
            }
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound),
            status if !status.is_success() => {
                let body = res.text().await.unwrap_or_default();
                warn!(channel = channel_external_id, %status, %body, "YouTube API error");
                return Err(FetchError::Transient(format!("status {status}: {body}")));
            }
            _ => {}
        }

        let payload: SearchResponse = res
            .json()
            .await
            .map_err(|e| FetchError::Transient(format!("invalid YouTube response JSON: {e}")))?;

        Ok(payload.items.into_iter().map(SearchItem::into_record).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_item_maps_into_record() {
        let raw = serde_json::json!({
            "items": [{
                "id": {"kind": "youtube#video", "videoId": "abc123"},
                "snippet": {
                    "title": "A title",
                    "description": "desc",
                    "publishedAt": "2026-08-01T10:00:00Z",
                    "thumbnails": {"high": {"url": "https://i.ytimg.com/abc/hq.jpg"}}
                }
            }]
        });
        let parsed: SearchResponse = serde_json::from_value(raw).unwrap();
        let rec = parsed.items.into_iter().next().unwrap().into_record();
        assert_eq!(rec.video_id, "abc123");
        assert_eq!(rec.title, "A title");
        assert_eq!(
            rec.thumbnail_url.as_deref(),
            Some("https://i.ytimg.com/abc/hq.jpg")
        );
        assert!(rec.published_at.is_some());
    }

    #[test]
    fn missing_video_id_becomes_empty_string() {
        let raw = serde_json::json!({
            "items": [{
                "id": {"kind": "youtube#playlist"},
                "snippet": {"title": "not a video"}
            }]
        });
        let parsed: SearchResponse = serde_json::from_value(raw).unwrap();
        let rec = parsed.items.into_iter().next().unwrap().into_record();
        assert!(rec.video_id.is_empty());
        assert!(rec.published_at.is_none());
    }
}
