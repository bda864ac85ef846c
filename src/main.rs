use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use yt_digest_bot::composer::ComposePolicy;
use yt_digest_bot::delivery::DeliveryPolicy;
use yt_digest_bot::fetcher::{FetchCoordinator, FetchPolicy};
use yt_digest_bot::messenger::{Messenger, TelegramMessenger};
use yt_digest_bot::scheduler::{Scheduler, SchedulerConfig};
use yt_digest_bot::youtube::{VideoSource, YouTubeClient};
use yt_digest_bot::{config, db, handlers, web};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/digest.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let bot = Bot::new(cfg.telegram.bot_token.clone());

    let source: Arc<dyn VideoSource> = Arc::new(YouTubeClient::new(
        cfg.youtube.api_key.clone(),
        Duration::from_millis(cfg.youtube.request_interval_ms),
    ));
    let messenger: Arc<dyn Messenger> = Arc::new(TelegramMessenger::new(
        bot.clone(),
        Duration::from_millis(cfg.telegram.send_interval_ms),
    ));

    let fetcher = FetchCoordinator::new(
        source,
        FetchPolicy {
            max_attempts: cfg.digest.fetch_max_attempts,
            backoff_base: Duration::from_secs(cfg.digest.backoff_base_secs),
            backoff_cap: Duration::from_secs(cfg.digest.backoff_cap_secs),
            first_check_lookback_days: cfg.digest.first_check_lookback_days,
        },
    );

    let scheduler = Scheduler::new(
        pool.clone(),
        fetcher,
        messenger,
        SchedulerConfig {
            tick_interval: Duration::from_secs(cfg.app.tick_interval_secs),
            worker_concurrency: cfg.app.worker_concurrency,
            compose: ComposePolicy {
                max_videos_per_digest: cfg.digest.max_videos_per_digest,
            },
            delivery: DeliveryPolicy {
                max_attempts: cfg.digest.delivery_max_attempts,
                backoff_base_secs: cfg.digest.backoff_base_secs as i64,
                backoff_cap_secs: cfg.digest.backoff_cap_secs as i64,
            },
        },
    );

    let cancel = CancellationToken::new();

    // Background digest engine loop.
    let loop_scheduler = scheduler.clone();
    let loop_cancel = cancel.clone();
    tokio::spawn(async move { loop_scheduler.run(loop_cancel).await });

    // Health + cron HTTP surface.
    let web_state = Arc::new(web::AppState {
        pool: pool.clone(),
        scheduler: scheduler.clone(),
        cron_key: cfg.app.cron_key.clone(),
    });
    let web_addr = cfg.app.bind_addr.clone();
    let web_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = web::serve(&web_addr, web_state, web_cancel).await {
            error!(?err, "http surface exited");
        }
    });

    info!("starting telegram bot");
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let pool = pool.clone();
        let scheduler = scheduler.clone();
        async move {
            if let Err(err) = handlers::handle_update(&bot, &pool, &scheduler, &msg).await {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    cancel.cancel();
    Ok(())
}
