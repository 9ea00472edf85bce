//! Best-effort Telegram notifications.
//!
//! Delivery failures are logged and swallowed; a notification must never
//! fail a trade operation.

use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Notifier {
    channel: Option<TelegramChannel>,
}

struct TelegramChannel {
    client: Client,
    bot_token: String,
    chat_id: String,
}

impl Notifier {
    /// Build from `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID`. Missing
    /// credentials disable delivery; messages are only logged.
    pub fn from_env() -> Self {
        let channel = match (
            std::env::var("TELEGRAM_BOT_TOKEN"),
            std::env::var("TELEGRAM_CHAT_ID"),
        ) {
            (Ok(bot_token), Ok(chat_id)) => {
                Client::builder()
                    .timeout(DEFAULT_TIMEOUT)
                    .build()
                    .map(|client| TelegramChannel {
                        client,
                        bot_token,
                        chat_id,
                    })
                    .ok()
            }
            _ => {
                debug!("Telegram credentials not set, notifications disabled");
                None
            }
        };
        Self { channel }
    }

    pub async fn send(&self, text: &str) {
        debug!(message = %text, "notify");
        let Some(channel) = &self.channel else {
            return;
        };
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            channel.bot_token
        );
        let result = channel
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": channel.chat_id,
                "text": text,
            }))
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "Telegram rejected notification");
            }
            Err(e) => warn!(error = %e, "Failed to deliver notification"),
            _ => {}
        }
    }
}
