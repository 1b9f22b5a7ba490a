//! RustChain adapter (RTC ledger).
//!
//! Carries signed `transfer` envelopes only. The signature is checked here,
//! before any request is built, so a tampered or unsigned transfer never
//! reaches the network.

use crate::http::{join_url, ApiClient};
use crate::traits::{Receipt, Transport};
use async_trait::async_trait;
use beacon_common::{Error, Result, RustChainConfig};
use beacon_core::known_keys::KnownKeys;
use beacon_core::signer;
use beacon_core::{Envelope, Kind};
use serde_json::{json, Value};
use tracing::Instrument;

const TRANSFER_PATH: &str = "/wallet/transfer/signed";

pub struct RustChainTransport {
    base_url: String,
    http: ApiClient,
    known_keys: Option<KnownKeys>,
}

impl RustChainTransport {
    pub fn new(config: &RustChainConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.clone(),
            http: ApiClient::new("rustchain", &config.http)?,
            known_keys: None,
        })
    }

    /// Resolve handle senders through `known_keys`.
    pub fn with_known_keys(mut self, known_keys: KnownKeys) -> Self {
        self.known_keys = Some(known_keys);
        self
    }

    /// Check the transfer and build the ledger request body.
    fn transfer_body(&self, envelope: &Envelope) -> Result<Value> {
        if envelope.kind != Kind::Transfer {
            return Err(Error::Validation(format!(
                "rustchain only carries transfers, not {}",
                envelope.kind
            )));
        }
        envelope.validate()?;

        let key = signer::resolve_key(envelope, self.known_keys.as_ref()).ok_or_else(|| {
            Error::Signature(format!("no public key known for sender {}", envelope.from))
        })?;
        if !signer::verify_with_key(envelope, &key) {
            return Err(Error::Signature("transfer signature does not verify".into()));
        }

        let nonce = envelope
            .nonce
            .as_deref()
            .ok_or_else(|| Error::Validation("transfer needs a nonce".into()))?;
        let (to, value) = match (&envelope.to, &envelope.value) {
            (Some(to), Some(value)) => (to, value),
            _ => return Err(Error::Validation("transfer requires a recipient and an amount".into())),
        };

        Ok(json!({
            "from_public_key": signer::key_hex(&key),
            "to_address": to,
            "amount_rtc": value.amount.as_f64(),
            "nonce": nonce,
            "timestamp": envelope.timestamp,
            "memo": envelope.text.clone().unwrap_or_default(),
            "signature": envelope.signature,
            "envelope": envelope.encode(),
        }))
    }
}

#[async_trait]
impl Transport for RustChainTransport {
    fn name(&self) -> &'static str {
        "rustchain"
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<Receipt> {
        let body = self.transfer_body(envelope)?;
        let url = join_url(&self.base_url, TRANSFER_PATH);
        let span = beacon_common::transport_span!("rustchain", "deliver", nonce = ?envelope.nonce);

        let response = self
            .http
            .send(|client| client.post(&url).json(&body))
            .instrument(span)
            .await?;

        let tx = response.id_field(&["tx_hash", "txid", "id"]);
        tracing::info!(tx = ?tx, status = response.status, "Transfer accepted by ledger");
        Ok(Receipt::new("rustchain", response.status, tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{Amount, Keypair, Signer};

    fn transport() -> RustChainTransport {
        RustChainTransport::new(&RustChainConfig::default()).unwrap()
    }

    fn signed_transfer(signer: &Signer) -> Envelope {
        let mut envelope = Envelope::new(Kind::Transfer, signer.public_hex().unwrap())
            .with_to("RTCdeadbeef")
            .with_amount(Amount::from_micros(1_500_000))
            .with_text("thanks")
            .stamped(1_760_000_000);
        signer.sign(&mut envelope).unwrap();
        envelope
    }

    #[test]
    fn test_body_fields() {
        let signer = Signer::from_keypair(Keypair::generate());
        let envelope = signed_transfer(&signer);
        let body = transport().transfer_body(&envelope).unwrap();
        assert_eq!(body["from_public_key"], signer.public_hex().unwrap());
        assert_eq!(body["to_address"], "RTCdeadbeef");
        assert_eq!(body["amount_rtc"], 1.5);
        assert_eq!(body["memo"], "thanks");
        assert_eq!(body["timestamp"], 1_760_000_000);
        assert!(body["envelope"].as_str().unwrap().contains("sig="));
    }

    #[test]
    fn test_unsigned_is_validation_error() {
        let mut envelope = signed_transfer(&Signer::from_keypair(Keypair::generate()));
        envelope.signature = None;
        let err = transport().transfer_body(&envelope).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_tampered_is_signature_error() {
        let mut envelope = signed_transfer(&Signer::from_keypair(Keypair::generate()));
        envelope.value = Some(beacon_core::Value::rtc(Amount::from_micros(15_000_000)));
        let err = transport().transfer_body(&envelope).unwrap_err();
        assert!(matches!(err, Error::Signature(_)));
    }

    #[test]
    fn test_only_transfers() {
        let envelope = Envelope::new(Kind::Like, "a").with_to("b");
        assert!(matches!(
            transport().transfer_body(&envelope),
            Err(Error::Validation(_))
        ));
    }
}
