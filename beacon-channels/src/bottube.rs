//! BoTTube adapter (video platform with tipping).
//!
//! Actions target a video or an agent channel named by `to`:
//! - `like` votes on a video
//! - `follow` subscribes to an agent
//! - anything carrying value tips the video
//! - any other kind is posted as a comment containing the envelope

use crate::http::{join_url, segment, ApiClient};
use crate::traits::{Receipt, Transport};
use async_trait::async_trait;
use beacon_common::{BottubeConfig, Error, Result};
use beacon_core::{Envelope, Kind};
use serde_json::{json, Value};
use tracing::Instrument;

pub struct BottubeTransport {
    base_url: String,
    api_key: Option<String>,
    http: ApiClient,
}

impl BottubeTransport {
    pub fn new(config: &BottubeConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            http: ApiClient::new("bottube", &config.http)?,
        })
    }

    /// Endpoint path and JSON body for an envelope.
    fn route(&self, envelope: &Envelope) -> Result<(String, Value)> {
        let to = envelope
            .to
            .as_deref()
            .ok_or_else(|| Error::Validation("bottube actions need a target (to=)".into()))?;
        let target = segment(to);
        let encoded = envelope.encode();

        if let Some(value) = &envelope.value {
            return Ok((
                format!("/api/videos/{target}/tip"),
                json!({
                    "amount": value.amount.as_f64(),
                    "currency": value.currency,
                    "message": envelope.text.clone().unwrap_or_default(),
                    "envelope": encoded,
                }),
            ));
        }

        Ok(match envelope.kind {
            Kind::Like => (
                format!("/api/videos/{target}/vote"),
                json!({ "vote": 1, "envelope": encoded }),
            ),
            Kind::Follow => (
                format!("/api/agents/{target}/subscribe"),
                json!({ "envelope": encoded }),
            ),
            _ => {
                let content = match &envelope.text {
                    Some(text) => format!("{text}\n\n{encoded}"),
                    None => encoded.clone(),
                };
                (
                    format!("/api/videos/{target}/comment"),
                    json!({ "content": content, "envelope": encoded }),
                )
            }
        })
    }
}

#[async_trait]
impl Transport for BottubeTransport {
    fn name(&self) -> &'static str {
        "bottube"
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<Receipt> {
        let (path, body) = self.route(envelope)?;
        let url = join_url(&self.base_url, &path);
        let span = beacon_common::transport_span!("bottube", "deliver", kind = %envelope.kind);

        let response = self
            .http
            .send(|client| {
                let mut request = client.post(&url).json(&body);
                if let Some(key) = &self.api_key {
                    request = request.header("X-API-Key", key);
                }
                request
            })
            .instrument(span)
            .await?;

        tracing::info!(path = %path, status = response.status, "Delivered to BoTTube");
        Ok(Receipt::new(
            "bottube",
            response.status,
            response.id_field(&["id", "comment_id", "tip_id"]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::Amount;

    fn transport() -> BottubeTransport {
        BottubeTransport::new(&BottubeConfig::default()).unwrap()
    }

    #[test]
    fn test_routes_by_kind() {
        let t = transport();
        let like = Envelope::new(Kind::Like, "a").with_to("vid_1");
        assert_eq!(t.route(&like).unwrap().0, "/api/videos/vid_1/vote");

        let follow = Envelope::new(Kind::Follow, "a").with_to("agent_9");
        assert_eq!(t.route(&follow).unwrap().0, "/api/agents/agent_9/subscribe");

        let tip = Envelope::new(Kind::Like, "a")
            .with_to("vid_1")
            .with_amount(Amount::from_micros(250_000));
        let (path, body) = t.route(&tip).unwrap();
        assert_eq!(path, "/api/videos/vid_1/tip");
        assert_eq!(body["amount"], 0.25);

        let comment = Envelope::new(Kind::Want, "a").with_to("vid_1").with_text("more please");
        let (path, body) = t.route(&comment).unwrap();
        assert_eq!(path, "/api/videos/vid_1/comment");
        assert!(body["content"].as_str().unwrap().starts_with("more please\n\n[BEACON v1]"));
    }

    #[test]
    fn test_target_required() {
        let err = transport().route(&Envelope::new(Kind::Like, "a")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
