//! Chat delivery.

use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("chat api rejected message: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), NotifyError>;
}

const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Clone)]
pub struct TelegramNotifier {
    http: Client,
    api_root: String,
    bot_token: String,
}

#[derive(Deserialize)]
struct TelegramReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self::with_api_root(TELEGRAM_API, bot_token)
    }

    pub fn with_api_root(api_root: &str, bot_token: impl Into<String>) -> Self {
        Self {
            http: build_client(),
            api_root: api_root.trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let token = std::env::var("BOT_TOKEN").ok()?;
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        Some(Self::new(token))
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_root, self.bot_token);
        let response = self
            .http
            .post(url)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown",
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .map_err(|err| NotifyError::Request(err.without_url().to_string()))?;
        let status = response.status();
        let reply: TelegramReply = response
            .json()
            .await
            .map_err(|err| NotifyError::Request(err.to_string()))?;
        if !status.is_success() || !reply.ok {
            return Err(NotifyError::Rejected(
                reply.description.unwrap_or_else(|| status.to_string()),
            ));
        }
        Ok(())
    }
}

/// Writes messages to the log instead of a chat.
#[derive(Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        info!(
            target = "logistics_watch.notify",
            chat_id,
            chars = text.chars().count(),
            text,
            "message not sent; no chat transport configured"
        );
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub sent: tokio::sync::Mutex<Vec<(i64, String)>>,
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        self.sent.lock().await.push((chat_id, text.to_string()));
        Ok(())
    }
}
