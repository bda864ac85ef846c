use async_trait::async_trait;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use teloxide::{ApiError, RequestError};
use thiserror::Error;

use crate::limiter::IntervalLimiter;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("messaging rate limited")]
    RateLimited,
    /// Permanent: the user blocked the bot or is gone. Never retried.
    #[error("user unreachable")]
    UserUnreachable,
    #[error("transient messaging failure: {0}")]
    Transient(String),
}

/// Proof of a confirmed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message_id: i32,
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_digest(
        &self,
        telegram_id: i64,
        text: &str,
    ) -> Result<DeliveryReceipt, SendError>;
}

pub struct TelegramMessenger {
    bot: Bot,
    limiter: IntervalLimiter,
}

impl TelegramMessenger {
    pub fn new(bot: Bot, send_interval: Duration) -> Self {
        Self {
            bot,
            limiter: IntervalLimiter::new(send_interval),
        }
    }
}

fn map_error(err: RequestError) -> SendError {
    match err {
        RequestError::RetryAfter(_) => SendError::RateLimited,
        RequestError::Api(
            ApiError::BotBlocked
            | ApiError::UserDeactivated
            | ApiError::ChatNotFound
            | ApiError::CantInitiateConversation,
        ) => SendError::UserUnreachable,
        other => SendError::Transient(other.to_string()),
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_digest(
        &self,
        telegram_id: i64,
        text: &str,
    ) -> Result<DeliveryReceipt, SendError> {
        self.limiter.acquire().await;
        let msg = self
            .bot
            .send_message(ChatId(telegram_id), text)
            .await
            .map_err(map_error)?;
        Ok(DeliveryReceipt {
            message_id: msg.id.0,
        })
    }
}
