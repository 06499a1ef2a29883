//! Best-effort delivery of command replies.
//!
//! Replies are retried on network failures and flood control with exponential
//! backoff and jitter. API refusals are returned at once.

use crate::config::{
    TELEGRAM_SEND_INITIAL_BACKOFF_MS, TELEGRAM_SEND_MAX_BACKOFF_MS, TELEGRAM_SEND_MAX_RETRIES,
};
use anyhow::{anyhow, Result};
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{Message, ParseMode};
use teloxide::RequestError;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;

const fn is_retryable(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Network(_) | RequestError::Io(_) | RequestError::RetryAfter(_)
    )
}

/// Send an HTML message, retrying transient failures.
///
/// # Errors
///
/// Returns the last error once retries are exhausted, or the first
/// non-retryable one.
pub async fn send_html_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
) -> Result<Message> {
    let text = text.into();
    let strategy = ExponentialBackoff::from_millis(TELEGRAM_SEND_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TELEGRAM_SEND_MAX_BACKOFF_MS))
        .map(jitter)
        .take(TELEGRAM_SEND_MAX_RETRIES);

    let text = &text;
    RetryIf::spawn(
        strategy,
        move || async move {
            bot.send_message(chat_id, text.clone())
                .parse_mode(ParseMode::Html)
                .await
        },
        is_retryable,
    )
    .await
    .map_err(|e| {
        warn!(chat_id = chat_id.0, error = %e, "Reply not delivered");
        anyhow!("Telegram send error: {e}")
    })
}
