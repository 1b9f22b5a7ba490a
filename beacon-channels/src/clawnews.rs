//! ClawNews adapter (link and bounty board).
//!
//! `bounty`, `ad` and `want` become board items whose text carries the
//! encoded envelope; `like` upvotes item `to`; other kinds are posted as
//! plain items. The board is readable, so this adapter can listen.

use crate::http::{join_url, segment, value_to_id, ApiClient};
use crate::poll::{poll_stream, sort_by_numeric_id, FeedItem, FeedSource};
use crate::traits::{Cursor, IncomingStream, Receipt, Transport};
use async_trait::async_trait;
use beacon_common::{ClawNewsConfig, Error, Result};
use beacon_core::{Envelope, Kind};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

const MAX_TITLE_CHARS: usize = 80;

#[derive(Clone)]
pub struct ClawNewsTransport {
    inner: Arc<Inner>,
    poll_interval: Duration,
}

struct Inner {
    base_url: String,
    api_key: Option<String>,
    http: ApiClient,
}

impl ClawNewsTransport {
    pub fn new(config: &ClawNewsConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                base_url: config.base_url.clone(),
                api_key: config.api_key.clone(),
                http: ApiClient::new("clawnews", &config.http)?,
            }),
            poll_interval: Duration::from_secs(config.poll_interval_s),
        })
    }
}

impl Inner {
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

/// Item type on the board for an envelope kind.
fn item_type(kind: Kind) -> &'static str {
    match kind {
        Kind::Bounty => "bounty",
        Kind::Ad => "ad",
        Kind::Want => "ask",
        _ => "post",
    }
}

fn item_title(envelope: &Envelope) -> String {
    let first_line = envelope
        .text
        .as_deref()
        .and_then(|t| t.lines().find(|l| !l.trim().is_empty()))
        .map(str::trim);
    match first_line {
        Some(line) => line.chars().take(MAX_TITLE_CHARS).collect(),
        None => format!("{} from {}", envelope.kind, envelope.from)
            .chars()
            .take(MAX_TITLE_CHARS)
            .collect(),
    }
}

/// Endpoint path and JSON body for an envelope.
fn route(envelope: &Envelope) -> Result<(String, Value)> {
    let encoded = envelope.encode();
    if envelope.kind == Kind::Like {
        let to = envelope
            .to
            .as_deref()
            .ok_or_else(|| Error::Validation("clawnews upvotes need an item id (to=)".into()))?;
        return Ok((
            format!("/api/v1/items/{}/upvote", segment(to)),
            json!({ "envelope": encoded }),
        ));
    }

    let text = match &envelope.text {
        Some(text) => format!("{text}\n\n{encoded}"),
        None => encoded,
    };
    Ok((
        "/api/v1/items".to_string(),
        json!({
            "type": item_type(envelope.kind),
            "title": item_title(envelope),
            "url": envelope.link,
            "text": text,
        }),
    ))
}

fn parse_items(body: &Value) -> Vec<FeedItem> {
    let list = match body {
        Value::Array(items) => items.as_slice(),
        other => other
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
    };
    let mut items: Vec<FeedItem> = list
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(value_to_id)?;
            let text = ["title", "text"]
                .iter()
                .filter_map(|key| item.get(*key).and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            Some(FeedItem { id, text })
        })
        .collect();
    sort_by_numeric_id(&mut items);
    items
}

#[async_trait]
impl FeedSource for Inner {
    async fn fetch(&self, cursor: &Cursor) -> Result<Vec<FeedItem>> {
        let url = join_url(&self.base_url, "/api/v1/items");
        let response = self
            .http
            .send(|client| {
                let mut request = client.get(&url);
                if let Some(since) = cursor.as_deref() {
                    request = request.query(&[("since", since)]);
                }
                self.authorize(request)
            })
            .await?;
        Ok(parse_items(&response.body))
    }
}

#[async_trait]
impl Transport for ClawNewsTransport {
    fn name(&self) -> &'static str {
        "clawnews"
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<Receipt> {
        let (path, body) = route(envelope)?;
        let url = join_url(&self.inner.base_url, &path);
        let span = beacon_common::transport_span!("clawnews", "deliver", kind = %envelope.kind);

        let response = self
            .inner
            .http
            .send(|client| self.inner.authorize(client.post(&url).json(&body)))
            .instrument(span)
            .await?;

        tracing::info!(path = %path, status = response.status, "Delivered to ClawNews");
        Ok(Receipt::new(
            "clawnews",
            response.status,
            response.id_field(&["id", "item_id"]),
        ))
    }

    fn listen(&self, cursor: Cursor) -> Option<IncomingStream> {
        let source: Arc<dyn FeedSource> = self.inner.clone();
        Some(poll_stream(source, cursor, self.poll_interval))
    }
}
