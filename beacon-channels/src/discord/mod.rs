//! Discord adapter.
//!
//! Posts through an incoming webhook when one is configured, otherwise
//! through the bot API. Listening reads a channel's message history with the
//! bot token.

pub mod format;

use crate::http::{join_url, segment, value_to_id, ApiClient};
use crate::poll::{poll_stream, sort_by_numeric_id, FeedItem, FeedSource};
use crate::traits::{Cursor, IncomingStream, Receipt, Transport};
use async_trait::async_trait;
use beacon_common::{DiscordConfig, Error, Result};
use beacon_core::Envelope;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Messages fetched per poll.
const PAGE_LIMIT: u32 = 50;

#[derive(Clone)]
pub struct DiscordTransport {
    inner: Arc<Inner>,
    poll_interval: Duration,
}

struct Inner {
    webhook_url: Option<String>,
    bot_token: Option<String>,
    channel_id: Option<String>,
    api_base: String,
    username: Option<String>,
    avatar_url: Option<String>,
    http: ApiClient,
}

impl DiscordTransport {
    pub fn new(config: &DiscordConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                webhook_url: config.webhook_url.clone().filter(|u| !u.is_empty()),
                bot_token: config.bot_token.clone().filter(|t| !t.is_empty()),
                channel_id: config.channel_id.clone().filter(|c| !c.is_empty()),
                api_base: config.api_base.clone(),
                username: config.username.clone(),
                avatar_url: config.avatar_url.clone(),
                http: ApiClient::new("discord", &config.http)?,
            }),
            poll_interval: Duration::from_secs(config.poll_interval_s),
        })
    }

    /// Whether a bot token and channel are configured for listening.
    pub fn can_listen(&self) -> bool {
        self.inner.bot_credentials().is_some()
    }
}

impl Inner {
    fn bot_credentials(&self) -> Option<(&str, &str)> {
        Some((self.bot_token.as_deref()?, self.channel_id.as_deref()?))
    }

    fn messages_url(&self, channel_id: &str) -> String {
        join_url(
            &self.api_base,
            &format!("/channels/{}/messages", segment(channel_id)),
        )
    }

    async fn post_webhook(&self, webhook_url: &str, payload: &Value) -> Result<Receipt> {
        let response = self
            .http
            .send(|client| {
                client
                    .post(webhook_url)
                    .query(&[("wait", "true")])
                    .json(payload)
            })
            .await?;
        tracing::info!(status = response.status, "Delivered to Discord webhook");
        Ok(Receipt::new("discord", response.status, response.id_field(&["id"])))
    }

    async fn post_bot(&self, token: &str, channel_id: &str, payload: &Value) -> Result<Receipt> {
        let url = self.messages_url(channel_id);
        let auth = format!("Bot {token}");
        let response = self
            .http
            .send(|client| {
                client
                    .post(&url)
                    .header(reqwest::header::AUTHORIZATION, &auth)
                    .json(payload)
            })
            .await?;
        tracing::info!(status = response.status, channel = channel_id, "Delivered to Discord channel");
        Ok(Receipt::new("discord", response.status, response.id_field(&["id"])))
    }
}

fn parse_messages(body: &Value) -> Vec<FeedItem> {
    let mut items: Vec<FeedItem> = body
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|message| {
            let id = message.get("id").and_then(value_to_id)?;
            let text = message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some(FeedItem { id, text })
        })
        .collect();
    // history comes back newest first
    sort_by_numeric_id(&mut items);
    items
}

#[async_trait]
impl FeedSource for Inner {
    async fn fetch(&self, cursor: &Cursor) -> Result<Vec<FeedItem>> {
        let (token, channel_id) = self.bot_credentials().ok_or_else(|| {
            Error::Config("discord listen needs bot_token and channel_id".into())
        })?;
        let url = self.messages_url(channel_id);
        let auth = format!("Bot {token}");
        let limit = PAGE_LIMIT.to_string();

        let response = self
            .http
            .send(|client| {
                let mut request = client
                    .get(&url)
                    .header(reqwest::header::AUTHORIZATION, &auth)
                    .query(&[("limit", limit.as_str())]);
                if let Some(after) = cursor.as_deref() {
                    request = request.query(&[("after", after)]);
                }
                request
            })
            .await?;
        Ok(parse_messages(&response.body))
    }
}

#[async_trait]
impl Transport for DiscordTransport {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<Receipt> {
        let inner = &self.inner;
        let payload = format::message_payload(
            envelope,
            inner.username.as_deref(),
            inner.avatar_url.as_deref(),
        );
        let span = beacon_common::transport_span!("discord", "deliver", kind = %envelope.kind);

        if let Some(webhook_url) = &inner.webhook_url {
            return inner.post_webhook(webhook_url, &payload).instrument(span).await;
        }
        match inner.bot_credentials() {
            Some((token, channel_id)) => inner.post_bot(token, channel_id, &payload).instrument(span).await,
            None => Err(Error::Config(
                "discord needs webhook_url, or bot_token with channel_id".into(),
            )),
        }
    }

    fn listen(&self, cursor: Cursor) -> Option<IncomingStream> {
        if !self.can_listen() {
            return None;
        }
        let source: Arc<dyn FeedSource> = self.inner.clone();
        Some(poll_stream(source, cursor, self.poll_interval))
    }
}
