use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::error::Error as CoreError;
use crate::types::ParseMode;
use crate::TARGET_CHANNEL;

/// Hard limit the channel places on a single message payload.
pub const MESSAGE_LIMIT: usize = 4096;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Channel failures, split by whether a retry can help.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transient channel failure: {0}")]
    Transient(String),

    #[error("permanent channel failure: {0}")]
    Permanent(String),
}

impl From<ChannelError> for CoreError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Transient(reason) => CoreError::TransientSend(reason),
            ChannelError::Permanent(reason) => CoreError::PermanentSend(reason),
        }
    }
}

/// The two-operation capability the delivery worker and edit tracker
/// consume. The core assumes nothing else about the channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Sends a message, optionally threaded under an earlier one. Returns
    /// the channel-assigned message id.
    async fn send(
        &self,
        text: &str,
        mode: ParseMode,
        reply_to: Option<&str>,
    ) -> Result<String, ChannelError>;

    /// Replaces the text of an already-delivered message.
    async fn edit(&self, message_id: &str, text: &str, mode: ParseMode)
        -> Result<(), ChannelError>;
}

/// Telegram Bot API adapter.
pub struct TelegramChannel {
    client: Client,
    token: String,
    chat_id: i64,
    api_base: String,
}

impl TelegramChannel {
    pub fn new(token: String, chat_id: i64) -> Result<Self, ChannelError> {
        if token.is_empty() {
            return Err(ChannelError::Permanent("empty bot token".to_string()));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChannelError::Permanent(format!("http client: {}", e)))?;
        Ok(TelegramChannel {
            client,
            token,
            chat_id,
            api_base: "https://api.telegram.org".to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call(
        &self,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ChannelError::Transient(format!("{}: {}", method, e))
                } else {
                    ChannelError::Permanent(format!("{}: {}", method, e))
                }
            })?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ChannelError::Transient(format!("{}: malformed response: {}", method, e)))?;

        if status.as_u16() == 429 || status.is_server_error() {
            warn!(target: TARGET_CHANNEL, "{} throttled or unavailable: {}", method, status);
            return Err(ChannelError::Transient(format!("{}: HTTP {}", method, status)));
        }
        if !status.is_success() || !body["ok"].as_bool().unwrap_or(false) {
            let description = body["description"].as_str().unwrap_or("unknown error");
            error!(target: TARGET_CHANNEL, "{} rejected: {}", method, description);
            return Err(ChannelError::Permanent(format!("{}: {}", method, description)));
        }

        Ok(body)
    }
}

fn check_length(text: &str) -> Result<(), ChannelError> {
    let chars = text.chars().count();
    if chars > MESSAGE_LIMIT {
        return Err(ChannelError::Permanent(format!(
            "message of {} chars exceeds channel limit of {}",
            chars, MESSAGE_LIMIT
        )));
    }
    Ok(())
}

#[async_trait]
impl ChannelSender for TelegramChannel {
    async fn send(
        &self,
        text: &str,
        mode: ParseMode,
        reply_to: Option<&str>,
    ) -> Result<String, ChannelError> {
        check_length(text)?;

        let mut payload = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": mode.wire_name(),
            "disable_web_page_preview": true,
        });
        if let Some(parent) = reply_to {
            payload["reply_to_message_id"] = json!(parent
                .parse::<i64>()
                .map_err(|_| ChannelError::Permanent(format!("bad reply_to id: {}", parent)))?);
        }

        let body = self.call("sendMessage", payload).await?;
        let message_id = body["result"]["message_id"]
            .as_i64()
            .ok_or_else(|| ChannelError::Permanent("response missing message_id".to_string()))?;

        info!(target: TARGET_CHANNEL, "Message sent chat_id={} message_id={} len={}", self.chat_id, message_id, text.len());
        Ok(message_id.to_string())
    }

    async fn edit(
        &self,
        message_id: &str,
        text: &str,
        mode: ParseMode,
    ) -> Result<(), ChannelError> {
        check_length(text)?;

        let payload = json!({
            "chat_id": self.chat_id,
            "message_id": message_id
                .parse::<i64>()
                .map_err(|_| ChannelError::Permanent(format!("bad message id: {}", message_id)))?,
            "text": text,
            "parse_mode": mode.wire_name(),
            "disable_web_page_preview": true,
        });

        self.call("editMessageText", payload).await?;
        info!(target: TARGET_CHANNEL, "Message edited chat_id={} message_id={}", self.chat_id, message_id);
        Ok(())
    }
}
