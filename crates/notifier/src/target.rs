//! Dispatch targets: the transport that actually delivers a rendered message.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::format::NotificationMessage;

/// Why a delivery was not acknowledged.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("target rate limited the request")]
    RateLimited,

    #[error("target rejected the message (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Something that can deliver a message to a destination id.
#[async_trait]
pub trait DispatchTarget: Send + Sync {
    async fn deliver(
        &self,
        destination_id: &str,
        message: &NotificationMessage,
    ) -> Result<(), DeliveryError>;
}

/// Posts messages to Discord text channels through the bot REST API.
pub struct DiscordTarget {
    http: reqwest::Client,
    base_url: String,
    bot_token: String,
}

impl DiscordTarget {
    pub fn new(base_url: String, bot_token: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            bot_token,
        })
    }
}

/// Request body for `POST /channels/{id}/messages`. Only the watch's own role
/// may be pinged.
fn message_body(message: &NotificationMessage) -> serde_json::Value {
    let roles: Vec<&str> = message.mention_role.iter().map(String::as_str).collect();
    json!({
        "content": message.content,
        "allowed_mentions": { "parse": [], "roles": roles },
    })
}

#[async_trait]
impl DispatchTarget for DiscordTarget {
    async fn deliver(
        &self,
        destination_id: &str,
        message: &NotificationMessage,
    ) -> Result<(), DeliveryError> {
        let url = format!("{}/channels/{}/messages", self.base_url, destination_id);

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .json(&message_body(message))
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.as_u16() == 429 {
            return Err(DeliveryError::RateLimited);
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
