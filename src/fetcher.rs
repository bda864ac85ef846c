use crate::db::{self, Pool};
use crate::ingest;
use crate::youtube::{FetchError, VideoSource};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub first_check_lookback_days: i64,
}

impl FetchPolicy {
    /// Exponential backoff: base * 2^(attempt-1), capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(10);
        let delay = self.backoff_base.saturating_mul(factor);
        delay.min(self.backoff_cap)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Videos fetched and ingested; `last_checked` advanced.
    Fetched { new_videos: Vec<i64> },
    /// Upstream says the channel is gone; it was deactivated.
    ChannelGone,
}

/// Pulls new videos for due channels and hands them to ingest. Holds only its
/// client and policy; all cross-cycle state lives in the store.
pub struct FetchCoordinator {
    source: Arc<dyn VideoSource>,
    policy: FetchPolicy,
}

impl FetchCoordinator {
    pub fn new(source: Arc<dyn VideoSource>, policy: FetchPolicy) -> Self {
        Self { source, policy }
    }

    /// Check one channel: fetch the window since `last_checked` (bounded
    /// lookback on first check), ingest, then advance `last_checked` to the
    /// fetch time. On terminal upstream failure `last_checked` is left alone
    /// so the next cycle retries the same window.
    #[instrument(skip_all, fields(channel = external_id))]
    pub async fn check_channel(
        &self,
        pool: &Pool,
        channel_pk: i64,
        external_id: &str,
        last_checked: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<FetchOutcome> {
        let since = last_checked
            .unwrap_or_else(|| now - ChronoDuration::days(self.policy.first_check_lookback_days));

        let records = match self.list_with_retry(external_id, since).await {
            Ok(records) => records,
            Err(FetchError::NotFound) => {
                warn!(channel = external_id, "channel gone upstream; deactivating");
                db::mark_channel_inactive(pool, channel_pk).await?;
                return Ok(FetchOutcome::ChannelGone);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("fetch failed for channel {external_id}"))
            }
        };

        let new_videos = ingest::ingest_batch(pool, channel_pk, records).await?;
        db::update_channel_checked(pool, channel_pk, now).await?;
        if !new_videos.is_empty() {
            info!(channel = external_id, count = new_videos.len(), "new videos");
        }
        Ok(FetchOutcome::Fetched { new_videos })
    }

    async fn list_with_retry(
        &self,
        external_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<crate::youtube::VideoRecord>, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.source.list_recent_videos(external_id, since).await {
                Ok(records) => return Ok(records),
                // permanent, not worth retrying
                Err(FetchError::NotFound) => return Err(FetchError::NotFound),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        return Err(err);
                    }
                    let delay = self.policy.backoff_delay(attempt);
                    warn!(
                        channel = external_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "fetch failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> FetchPolicy {
        FetchPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(3600),
            first_check_lookback_days: 7,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff_delay(1), Duration::from_secs(5));
        assert_eq!(p.backoff_delay(2), Duration::from_secs(10));
        assert_eq!(p.backoff_delay(3), Duration::from_secs(20));
        assert_eq!(p.backoff_delay(30), Duration::from_secs(3600));
    }
}
