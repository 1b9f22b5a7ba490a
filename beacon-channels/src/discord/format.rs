//! Discord payload formatting.
//!
//! Discord caps message content at 2000 characters and webhook usernames at
//! 80. Envelopes are posted as the message content (so listeners can decode
//! them) plus an embed summarising kind, agent, tip and signature.

use beacon_core::Envelope;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

/// Discord's message content limit.
pub const MAX_CONTENT_CHARS: usize = 2000;

/// Discord's webhook username limit.
pub const MAX_USERNAME_CHARS: usize = 80;

const MAX_DESCRIPTION_CHARS: usize = 4096;
const MAX_AGENT_CHARS: usize = 24;
const SIGNATURE_PREVIEW_CHARS: usize = 32;

const COLOR_VALUE: u32 = 65450;
const COLOR_PLAIN: u32 = 7506394;

/// First `max` characters of `text`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Message content: optional text, then the encoded envelope.
pub fn message_content(envelope: &Envelope) -> String {
    let encoded = envelope.encode();
    let content = match &envelope.text {
        Some(text) => format!("{text}\n{encoded}"),
        None => encoded,
    };
    if content.chars().count() > MAX_CONTENT_CHARS {
        tracing::warn!(
            chars = content.chars().count(),
            "Discord content truncated; envelope may not decode on the far side"
        );
    }
    truncate_chars(&content, MAX_CONTENT_CHARS)
}

fn agent_label(from: &str) -> String {
    if from.is_empty() {
        return "unknown".to_string();
    }
    if from.chars().count() > MAX_AGENT_CHARS {
        return format!("{}...", truncate_chars(from, MAX_AGENT_CHARS));
    }
    from.to_string()
}

/// Rich embed summarising an envelope.
pub fn beacon_embed(envelope: &Envelope) -> Value {
    let mut fields = vec![
        json!({"name": "Kind", "value": envelope.kind.as_str(), "inline": true}),
        json!({"name": "Agent", "value": agent_label(&envelope.from), "inline": true}),
    ];
    if let Some(value) = &envelope.value {
        fields.push(json!({
            "name": "RTC Tip",
            "value": format!("{} {}", value.amount, value.currency),
            "inline": true,
        }));
    }
    if let Some(sig) = &envelope.signature {
        fields.push(json!({
            "name": "Signature",
            "value": truncate_chars(sig, SIGNATURE_PREVIEW_CHARS),
            "inline": true,
        }));
    }

    let timestamp = envelope
        .timestamp
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or_else(Utc::now);
    let description = envelope.text.as_deref().unwrap_or("Beacon ping");

    json!({
        "title": format!("Beacon · {}", envelope.kind.as_str().to_uppercase()),
        "description": truncate_chars(description, MAX_DESCRIPTION_CHARS),
        "color": if envelope.value.is_some() { COLOR_VALUE } else { COLOR_PLAIN },
        "fields": fields,
        "timestamp": timestamp.to_rfc3339(),
    })
}

/// Webhook or bot message body.
pub fn message_payload(envelope: &Envelope, username: Option<&str>, avatar_url: Option<&str>) -> Value {
    let mut payload = json!({
        "content": message_content(envelope),
        "embeds": [beacon_embed(envelope)],
    });
    if let Some(username) = username {
        payload["username"] = json!(truncate_chars(username, MAX_USERNAME_CHARS));
    }
    if let Some(avatar_url) = avatar_url {
        payload["avatar_url"] = json!(avatar_url);
    }
    payload
}
