use crate::composer::{self, ComposePolicy};
use crate::db::{self, Pool};
use crate::delivery::{self, DeliveryOutcome, DeliveryPolicy};
use crate::fetcher::{FetchCoordinator, FetchOutcome};
use crate::messenger::Messenger;
use crate::model::DueSubscription;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const DELIVERY_SWEEP_LIMIT: i64 = 100;

pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub worker_concurrency: usize,
    pub compose: ComposePolicy,
    pub delivery: DeliveryPolicy,
}

/// Per-subscription cycle states. Transitions are time-driven into `Due`,
/// then walk the happy path; any stage failure drops the subscription back to
/// `Idle` without advancing `last_digest_sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Due,
    Fetching,
    Composing,
    Delivering,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOutcome {
    pub digest_id: Option<i64>,
    pub delivered: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TickSummary {
    pub due_subscriptions: usize,
    pub digests_sent: usize,
    pub cycle_failures: usize,
}

/// Single-flight guard per key: all work touching the same channel or
/// subscription is serialized, independent keys run in parallel.
#[derive(Default)]
struct KeyedLocks {
    map: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.map.lock().await;
            map.entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// The top-level driver. An explicitly constructed service object holding its
/// dependencies; lifecycle is tied to process start/stop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Pool,
    fetcher: FetchCoordinator,
    messenger: Arc<dyn Messenger>,
    cfg: SchedulerConfig,
    channel_locks: KeyedLocks,
    subscription_locks: KeyedLocks,
}

impl Scheduler {
    pub fn new(
        pool: Pool,
        fetcher: FetchCoordinator,
        messenger: Arc<dyn Messenger>,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                fetcher,
                messenger,
                cfg,
                channel_locks: KeyedLocks::default(),
                subscription_locks: KeyedLocks::default(),
            }),
        }
    }

    /// Tick loop. "Due" is evaluated at each tick rather than via absolute
    /// timers; a missed tick just means the check happens at the next one.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.inner.cfg.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler stopping");
                    break;
                }
                _ = tick.tick() => {
                    match self.run_tick(Utc::now(), &cancel).await {
                        Ok(summary) => info!(
                            due = summary.due_subscriptions,
                            sent = summary.digests_sent,
                            failures = summary.cycle_failures,
                            "tick complete"
                        ),
                        Err(err) => error!(?err, "tick aborted; retrying next tick"),
                    }
                }
            }
        }
    }

    /// One full cycle over everything currently due, then a delivery sweep
    /// for digests awaiting a retry. A store error here aborts the whole tick
    /// (retried next tick); a single subscription failure does not.
    #[instrument(skip_all)]
    pub async fn run_tick(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<TickSummary> {
        let due = db::get_due_subscriptions(&self.inner.pool, now)
            .await
            .context("store unavailable; aborting tick")?;

        let mut summary = TickSummary {
            due_subscriptions: due.len(),
            ..Default::default()
        };

        let results: Vec<Option<Result<CycleOutcome>>> = stream::iter(due)
            .map(|sub| {
                let this = self.clone();
                let cancel = cancel.clone();
                async move {
                    // cooperative checkpoint: never start a new unit of work
                    // after a stop was requested
                    if cancel.is_cancelled() {
                        return None;
                    }
                    Some(this.run_subscription_cycle(&sub, now).await)
                }
            })
            .buffer_unordered(self.inner.cfg.worker_concurrency)
            .collect()
            .await;

        for res in results.into_iter().flatten() {
            match res {
                Ok(outcome) if outcome.delivered => summary.digests_sent += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(?err, "subscription cycle failed");
                    summary.cycle_failures += 1;
                }
            }
        }

        if !cancel.is_cancelled() {
            summary.digests_sent += delivery::process_due(
                &self.inner.pool,
                self.inner.messenger.as_ref(),
                self.inner.cfg.delivery,
                now,
                DELIVERY_SWEEP_LIMIT,
            )
            .await?;
        }

        Ok(summary)
    }

    /// The happy path for one subscription:
    /// due -> fetching -> composing -> delivering -> idle.
    /// Errors propagate to the caller; nothing advances `last_digest_sent`
    /// unless a digest was actually sent.
    pub async fn run_subscription_cycle(
        &self,
        sub: &DueSubscription,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome> {
        let _flight = self.inner.subscription_locks.acquire(sub.id).await;
        enter(sub.id, CycleState::Due);

        enter(sub.id, CycleState::Fetching);
        let fetched = {
            // serialize fetches per channel so two subscribers to the same
            // channel cannot race on last_checked
            let _channel_flight = self.inner.channel_locks.acquire(sub.channel_pk).await;
            self.inner
                .fetcher
                .check_channel(
                    &self.inner.pool,
                    sub.channel_pk,
                    &sub.channel_external_id,
                    sub.channel_last_checked,
                    now,
                )
                .await?
        };
        if fetched == FetchOutcome::ChannelGone {
            enter(sub.id, CycleState::Idle);
            return Ok(CycleOutcome::default());
        }

        enter(sub.id, CycleState::Composing);
        let digest_id =
            composer::compose_for_subscription(&self.inner.pool, sub, self.inner.cfg.compose, now)
                .await?;
        let Some(digest_id) = digest_id else {
            enter(sub.id, CycleState::Idle);
            return Ok(CycleOutcome::default());
        };

        enter(sub.id, CycleState::Delivering);
        let outcome = delivery::deliver_by_id(
            &self.inner.pool,
            self.inner.messenger.as_ref(),
            self.inner.cfg.delivery,
            digest_id,
            now,
        )
        .await?;

        enter(sub.id, CycleState::Idle);
        Ok(CycleOutcome {
            digest_id: Some(digest_id),
            delivered: outcome == DeliveryOutcome::Sent,
        })
    }

    /// Manual "generate now" entry point for one user. Runs the same
    /// per-subscription cycle as the tick, bypassing only the due rule.
    #[instrument(skip_all, fields(user_id))]
    pub async fn run_user_now(&self, user_id: i64) -> Result<usize> {
        let now = Utc::now();
        let subs = db::subscriptions_for_user(&self.inner.pool, user_id).await?;
        let mut delivered = 0usize;
        for sub in &subs {
            match self.run_subscription_cycle(sub, now).await {
                Ok(outcome) if outcome.delivered => delivered += 1,
                Ok(_) => {}
                Err(err) => warn!(?err, subscription = sub.id, "manual cycle failed"),
            }
        }
        Ok(delivered)
    }
}

fn enter(subscription_id: i64, state: CycleState) {
    debug!(subscription = subscription_id, ?state, "cycle state");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::default());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks.acquire(1).await;
                let n = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(n, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keyed_locks_allow_distinct_keys_in_parallel() {
        let locks = Arc::new(KeyedLocks::default());
        let g1 = locks.acquire(1).await;
        // a different key must not block
        let g2 = tokio::time::timeout(Duration::from_millis(50), locks.acquire(2))
            .await
            .expect("distinct key should not block");
        drop(g1);
        drop(g2);
    }
}
