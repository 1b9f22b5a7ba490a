//! Transport trait implemented by every platform adapter.

use async_trait::async_trait;
use beacon_common::Result;
use beacon_core::Envelope;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Proof of delivery returned by a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub transport: String,
    /// Platform-side id of what was created (item, message, tx hash).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// HTTP status, or 0 for datagrams.
    pub status: u16,
    pub delivered_at: DateTime<Utc>,
}

impl Receipt {
    pub fn new(transport: &str, status: u16, remote_id: Option<String>) -> Self {
        Self {
            transport: transport.to_string(),
            remote_id,
            status,
            delivered_at: Utc::now(),
        }
    }
}

/// Position in a platform feed. `None` starts from the platform's default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(pub Option<String>);

impl Cursor {
    pub fn start() -> Self {
        Self(None)
    }

    pub fn at(id: impl Into<String>) -> Self {
        Self(Some(id.into()))
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// Envelope found by a listener.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub envelope: Envelope,
    /// Platform id of the item or message it was found in.
    pub source: String,
    /// Resume point that skips this item.
    pub cursor: Cursor,
}

pub type IncomingStream = BoxStream<'static, Result<Incoming>>;

/// Platform adapter.
///
/// `deliver` performs its own retries; callers see a transient failure only
/// after the transport's policy is exhausted.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Platform name, also used as the rate-limit key.
    fn name(&self) -> &'static str;

    /// Deliver one envelope.
    async fn deliver(&self, envelope: &Envelope) -> Result<Receipt>;

    /// Lazy feed of envelopes after `cursor`, if the platform can be read.
    ///
    /// Nothing is fetched until the stream is polled. Errors are yielded as
    /// items and polling continues afterwards.
    fn listen(&self, _cursor: Cursor) -> Option<IncomingStream> {
        None
    }
}
