use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DigestStatus {
    Pending,
    Sent,
    Failed,
}

impl DigestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestStatus::Pending => "pending",
            DigestStatus::Sent => "sent",
            DigestStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DigestStatus::Pending),
            "sent" => Some(DigestStatus::Sent),
            "failed" => Some(DigestStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DigestFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl DigestFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestFrequency::Daily => "daily",
            DigestFrequency::Weekly => "weekly",
            DigestFrequency::Monthly => "monthly",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(DigestFrequency::Daily),
            "weekly" => Some(DigestFrequency::Weekly),
            "monthly" => Some(DigestFrequency::Monthly),
            _ => None,
        }
    }

    /// Delivery period for this frequency. Monthly is a fixed 30 days.
    pub fn interval(&self) -> Duration {
        match self {
            DigestFrequency::Daily => Duration::days(1),
            DigestFrequency::Weekly => Duration::weeks(1),
            DigestFrequency::Monthly => Duration::days(30),
        }
    }
}

/// Due policy: a subscription is due when at least one frequency interval has
/// elapsed since the last delivered digest, or when nothing was ever sent.
///
/// Kept as the single place the policy lives so a fixed time-of-day schedule
/// can replace it without touching the scheduler.
pub fn is_due(
    last_digest_sent: Option<DateTime<Utc>>,
    frequency: DigestFrequency,
    now: DateTime<Utc>,
) -> bool {
    match last_digest_sent {
        None => true,
        Some(last) => now - last >= frequency.interval(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Video {
    pub id: i64,
    pub video_id: String,
    pub channel_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub duration: Option<String>,
    pub thumbnail_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub is_processed: bool,
}

/// A fetched video that passed ingest validation and is ready to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedVideo {
    pub video_id: String,
    pub title: String,
    pub description: Option<String>,
    pub duration: Option<String>,
    pub thumbnail_url: Option<String>,
    pub published_at: DateTime<Utc>,
}

/// One due-evaluation unit: a subscription joined with its user and channel.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DueSubscription {
    pub id: i64,
    pub user_id: i64,
    pub telegram_id: i64,
    pub channel_pk: i64,
    pub channel_external_id: String,
    pub channel_name: String,
    pub channel_last_checked: Option<DateTime<Utc>>,
    pub digest_frequency: String,
    pub last_digest_sent: Option<DateTime<Utc>>,
}

impl DueSubscription {
    pub fn frequency(&self) -> DigestFrequency {
        DigestFrequency::from_str(&self.digest_frequency).unwrap_or(DigestFrequency::Daily)
    }
}

/// A pending digest row as seen by the delivery engine.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingDigest {
    pub id: i64,
    pub user_id: i64,
    pub subscription_id: i64,
    pub telegram_id: i64,
    pub content: String,
    pub attempt: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn frequency_round_trips() {
        for f in [
            DigestFrequency::Daily,
            DigestFrequency::Weekly,
            DigestFrequency::Monthly,
        ] {
            assert_eq!(DigestFrequency::from_str(f.as_str()), Some(f));
        }
        assert_eq!(DigestFrequency::from_str("hourly"), None);
    }

    #[test]
    fn status_round_trips() {
        for s in [
            DigestStatus::Pending,
            DigestStatus::Sent,
            DigestStatus::Failed,
        ] {
            assert_eq!(DigestStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(DigestStatus::from_str("generated"), None);
    }

    #[test]
    fn never_sent_is_due() {
        let now = Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap();
        assert!(is_due(None, DigestFrequency::Daily, now));
    }

    #[test]
    fn due_only_after_interval_elapsed() {
        let now = Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap();
        let recent = now - Duration::hours(23);
        let old = now - Duration::hours(25);
        assert!(!is_due(Some(recent), DigestFrequency::Daily, now));
        assert!(is_due(Some(old), DigestFrequency::Daily, now));
        // exact boundary counts as due
        assert!(is_due(
            Some(now - Duration::days(1)),
            DigestFrequency::Daily,
            now
        ));
        assert!(!is_due(Some(old), DigestFrequency::Weekly, now));
    }
}
