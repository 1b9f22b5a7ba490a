//! UDP transport: one envelope per datagram on the local network.
//!
//! Datagrams are fire-and-forget. There is no retry, ack or ordering; the
//! receipt only records that the socket accepted the bytes.

use crate::traits::{Receipt, Transport};
use async_trait::async_trait;
use beacon_common::{Error, Result, ResultExt, UdpConfig};
use beacon_core::Envelope;
use chrono::Utc;
use tokio::net::UdpSocket;
use tracing::Instrument;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

#[derive(Debug, Clone)]
pub struct UdpTransport {
    host: String,
    port: u16,
    broadcast: bool,
}

impl UdpTransport {
    pub fn new(config: &UdpConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            broadcast: config.broadcast,
        }
    }

    /// Send to an explicit destination, keeping the broadcast setting.
    pub fn to(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn destination(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn send_datagram(&self, payload: &[u8]) -> Result<usize> {
        if payload.len() > MAX_DATAGRAM_BYTES {
            return Err(Error::Validation(format!(
                "envelope is {} bytes, over the {MAX_DATAGRAM_BYTES} byte datagram limit",
                payload.len()
            )));
        }
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding UDP send socket")?;
        if self.broadcast {
            socket.set_broadcast(true).context("enabling UDP broadcast")?;
        }
        let sent = socket
            .send_to(payload, (self.host.as_str(), self.port))
            .await
            .context(format!("sending datagram to {}", self.destination()))?;
        Ok(sent)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<Receipt> {
        // nonce and ts are signed, so only unsigned envelopes may get them here
        let envelope = if envelope.signature.is_some() {
            if envelope.nonce.is_none() || envelope.timestamp.is_none() {
                return Err(Error::Validation(
                    "signed envelope needs a nonce and ts before signing".into(),
                ));
            }
            envelope.clone()
        } else {
            envelope.clone().stamped(Utc::now().timestamp())
        };
        let nonce = envelope.nonce.clone().unwrap_or_default();
        let encoded = envelope.encode();
        let span = beacon_common::transport_span!("udp", "deliver", kind = %envelope.kind);

        let sent = self.send_datagram(encoded.as_bytes()).instrument(span).await?;
        tracing::debug!(bytes = sent, to = %self.destination(), nonce = %nonce, "Datagram sent");
        Ok(Receipt::new("udp", 0, Some(nonce)))
    }
}
