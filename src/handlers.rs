use crate::db::{self, Pool};
use crate::model::{DigestFrequency, DigestStatus};
use crate::scheduler::Scheduler;
use anyhow::Result;
use teloxide::prelude::*;
use tracing::{info, instrument, warn};

const HELP_TEXT: &str = "YouTube Digest Bot\n\n\
Commands:\n\
/subscribe <channel_id> [daily|weekly|monthly] - subscribe to a channel\n\
/unsubscribe <channel_id> - stop digests for a channel\n\
/subscriptions - list your subscriptions\n\
/digest - generate your digests now\n\
/status - bot status\n\
/help - this message";

#[instrument(skip_all)]
pub async fn handle_update(
    bot: &Bot,
    pool: &Pool,
    scheduler: &Scheduler,
    msg: &Message,
) -> Result<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let user_id = db::get_or_create_user(
        pool,
        user.id.0 as i64,
        user.username.as_deref(),
        Some(&user.first_name),
        user.last_name.as_deref(),
        user.language_code.as_deref(),
    )
    .await?;

    let mut parts = text.trim().split_whitespace();
    let command = parts.next().unwrap_or_default();

    match command {
        "/start" | "/help" => {
            let _ = bot.send_message(msg.chat.id, HELP_TEXT).await;
        }
        "/subscribe" => {
            let Some(channel) = parts.next() else {
                let _ = bot
                    .send_message(msg.chat.id, "Usage: /subscribe <channel_id> [daily|weekly|monthly]")
                    .await;
                return Ok(());
            };
            let frequency = match parts.next() {
                None => DigestFrequency::Daily,
                Some(raw) => match DigestFrequency::from_str(raw) {
                    Some(f) => f,
                    None => {
                        let _ = bot
                            .send_message(msg.chat.id, "Frequency must be daily, weekly or monthly.")
                            .await;
                        return Ok(());
                    }
                },
            };
            let channel_pk = db::upsert_channel(pool, channel, channel).await?;
            db::subscribe(pool, user_id, channel_pk, frequency.as_str()).await?;
            info!(user_id, channel, frequency = frequency.as_str(), "subscribed");
            let _ = bot
                .send_message(
                    msg.chat.id,
                    format!("Subscribed to {channel} ({} digest).", frequency.as_str()),
                )
                .await;
        }
        "/unsubscribe" => {
            let Some(channel) = parts.next() else {
                let _ = bot
                    .send_message(msg.chat.id, "Usage: /unsubscribe <channel_id>")
                    .await;
                return Ok(());
            };
            let removed = db::unsubscribe(pool, user_id, channel).await?;
            let reply = if removed {
                format!("Unsubscribed from {channel}.")
            } else {
                format!("No active subscription for {channel}.")
            };
            let _ = bot.send_message(msg.chat.id, reply).await;
        }
        "/subscriptions" => {
            let subs = db::list_subscriptions(pool, user_id).await?;
            if subs.is_empty() {
                let _ = bot
                    .send_message(msg.chat.id, "No subscriptions yet. Try /subscribe <channel_id>.")
                    .await;
                return Ok(());
            }
            let mut lines = vec!["Your subscriptions:".to_string()];
            for s in &subs {
                let last = s
                    .last_digest_sent
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                lines.push(format!(
                    "- {} ({}) [{}], last digest: {}",
                    s.channel_name, s.channel_external_id, s.digest_frequency, last
                ));
            }
            let _ = bot.send_message(msg.chat.id, lines.join("\n")).await;
        }
        "/digest" => {
            let _ = bot
                .send_message(msg.chat.id, "Generating your digests, hold on...")
                .await;
            // Same code path as the scheduled cycle, so all idempotency and
            // atomicity guarantees hold for manual runs too.
            let scheduler = scheduler.clone();
            let bot = bot.clone();
            let chat_id = msg.chat.id;
            tokio::spawn(async move {
                match scheduler.run_user_now(user_id).await {
                    Ok(0) => {
                        let _ = bot
                            .send_message(chat_id, "No new videos since your last digest.")
                            .await;
                    }
                    Ok(n) => {
                        info!(user_id, delivered = n, "manual digest run complete");
                    }
                    Err(err) => {
                        warn!(?err, user_id, "manual digest run failed");
                        let _ = bot
                            .send_message(chat_id, "Digest generation failed, try again later.")
                            .await;
                    }
                }
            });
        }
        "/status" => {
            let subscriptions = db::count_active_subscriptions(pool).await?;
            let pending = db::count_digests_by_status(pool, DigestStatus::Pending).await?;
            let failed = db::count_digests_by_status(pool, DigestStatus::Failed).await?;
            let mut reply = format!(
                "Bot status: online\nActive subscriptions: {subscriptions}\n\
                 Pending digests: {pending}\nFailed digests: {failed}"
            );
            if failed > 0 {
                let recent = db::list_failed_digests(pool, 5).await?;
                reply.push_str("\nRecent failures:");
                for d in &recent {
                    reply.push_str(&format!(
                        "\n- digest #{} ({} attempts)",
                        d.id, d.attempt
                    ));
                }
            }
            let _ = bot.send_message(msg.chat.id, reply).await;
        }
        cmd if cmd.starts_with('/') => {
            let _ = bot
                .send_message(msg.chat.id, "Unknown command. Type /help for the list.")
                .await;
        }
        _ => {
            let _ = bot
                .send_message(msg.chat.id, "I only understand commands. Type /help.")
                .await;
        }
    }

    Ok(())
}
