//! Dispatch orchestrator.
//!
//! Sequences one action: pick the transport, build and sign the envelope,
//! consult the rate-limit guard, deliver under an overall deadline, then
//! mirror the action onto the LAN as a UDP `event` when enabled. It does no
//! network I/O of its own.

use crate::traits::{Receipt, Transport};
use crate::{BottubeTransport, ClawNewsTransport, DiscordTransport, RustChainTransport, UdpTransport};
use beacon_common::{Config, Error, Result};
use beacon_core::known_keys::KnownKeys;
use beacon_core::{signer, Amount, Clock, Envelope, Kind, RateLimitGuard, RateLimitPolicy, Signer};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Sender name used when no identity exists and none is needed.
pub const ANONYMOUS_SENDER: &str = "anon";

/// Supported platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Bottube,
    ClawNews,
    RustChain,
    Discord,
    Udp,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Bottube,
        Platform::ClawNews,
        Platform::RustChain,
        Platform::Discord,
        Platform::Udp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Bottube => "bottube",
            Platform::ClawNews => "clawnews",
            Platform::RustChain => "rustchain",
            Platform::Discord => "discord",
            Platform::Udp => "udp",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| Error::UnknownTransport(s.to_string()))
    }
}

/// One action to send.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub platform: Platform,
    pub kind: Kind,
    pub to: Option<String>,
    pub amount: Option<Amount>,
    pub link: Option<String>,
    pub text: Option<String>,
}

impl ActionRequest {
    pub fn new(platform: Platform, kind: Kind) -> Self {
        Self {
            platform,
            kind,
            to: None,
            amount: None,
            link: None,
            text: None,
        }
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn amount(mut self, amount: Amount) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

/// Outcome of the UDP side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum MirrorStatus {
    Disabled,
    Sent,
    Failed(String),
}

/// What a dispatch produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub envelope: Envelope,
    pub receipt: Receipt,
    pub mirror: MirrorStatus,
}

pub struct Dispatcher {
    transports: HashMap<Platform, Arc<dyn Transport>>,
    mirror: Option<Arc<dyn Transport>>,
    signer: Signer,
    guard: RateLimitGuard,
    known_keys: Option<KnownKeys>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Dispatcher with no transports.
    pub fn new(signer: Signer, guard: RateLimitGuard) -> Self {
        Self {
            transports: HashMap::new(),
            mirror: None,
            signer,
            guard,
            known_keys: None,
            timeout: Duration::from_secs(120),
            clock: beacon_core::system_clock(),
        }
    }

    /// Wire every platform that has a config section. UDP is always available.
    pub fn from_config(config: &Config) -> Result<Self> {
        let data_dir = config.data_dir();
        let known_keys = KnownKeys::new(&data_dir);
        let guard = RateLimitGuard::new(&data_dir, RateLimitPolicy::from_rules(&config.rate_limits));
        let mut dispatcher = Self::new(Signer::in_data_dir(&data_dir), guard)
            .with_known_keys(known_keys.clone())
            .with_timeout(Duration::from_secs(config.dispatch.timeout_s));

        if let Some(c) = &config.bottube {
            dispatcher = dispatcher.with_transport(Platform::Bottube, Arc::new(BottubeTransport::new(c)?));
        }
        if let Some(c) = &config.clawnews {
            dispatcher = dispatcher.with_transport(Platform::ClawNews, Arc::new(ClawNewsTransport::new(c)?));
        }
        if let Some(c) = &config.rustchain {
            let transport = RustChainTransport::new(c)?.with_known_keys(known_keys);
            dispatcher = dispatcher.with_transport(Platform::RustChain, Arc::new(transport));
        }
        if let Some(c) = &config.discord {
            dispatcher = dispatcher.with_transport(Platform::Discord, Arc::new(DiscordTransport::new(c)?));
        }

        let udp = Arc::new(UdpTransport::new(&config.udp));
        dispatcher = dispatcher.with_transport(Platform::Udp, udp.clone());
        if config.udp.enabled {
            dispatcher = dispatcher.with_mirror(udp);
        }
        Ok(dispatcher)
    }

    pub fn with_transport(mut self, platform: Platform, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(platform, transport);
        self
    }

    /// Mirror every non-UDP action through `transport`.
    pub fn with_mirror(mut self, transport: Arc<dyn Transport>) -> Self {
        self.mirror = Some(transport);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_known_keys(mut self, known_keys: KnownKeys) -> Self {
        self.known_keys = Some(known_keys);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Configured transport for `platform`.
    pub fn transport(&self, platform: Platform) -> Result<Arc<dyn Transport>> {
        self.transports
            .get(&platform)
            .cloned()
            .ok_or_else(|| Error::UnknownTransport(format!("{platform} is not configured")))
    }

    /// Build, and sign when value is attached, without sending.
    pub fn preview(&self, request: &ActionRequest) -> Result<Envelope> {
        let from = match request.amount {
            Some(_) => self.signer.public_hex()?,
            None => self
                .signer
                .handle()
                .unwrap_or_else(|_| ANONYMOUS_SENDER.to_string()),
        };

        let mut envelope = Envelope::new(request.kind, from);
        envelope.to = request.to.clone();
        envelope.link = request.link.clone();
        envelope.text = request.text.clone();
        if let Some(amount) = request.amount {
            envelope = envelope.with_amount(amount);
        }
        let mut envelope = envelope.stamped(self.clock.now().timestamp());

        if envelope.requires_signature() {
            self.signer.sign(&mut envelope)?;
        }
        envelope.validate()?;
        Ok(envelope)
    }

    /// Build an envelope from `request` and deliver it.
    pub async fn dispatch(&self, request: ActionRequest) -> Result<DispatchReport> {
        let transport = self.transport(request.platform)?;
        let envelope = self.preview(&request)?;
        self.deliver(request.platform, transport, envelope).await
    }

    /// Deliver a pre-built envelope. Value-bearing envelopes must verify.
    pub async fn submit(&self, platform: Platform, envelope: Envelope) -> Result<DispatchReport> {
        let transport = self.transport(platform)?;
        envelope.validate()?;
        if envelope.requires_signature() && !signer::verify(&envelope, self.known_keys.as_ref()) {
            return Err(Error::Signature(format!(
                "{} envelope from {} does not verify",
                envelope.kind, envelope.from
            )));
        }
        self.deliver(platform, transport, envelope).await
    }

    async fn deliver(
        &self,
        platform: Platform,
        transport: Arc<dyn Transport>,
        envelope: Envelope,
    ) -> Result<DispatchReport> {
        let action = envelope.kind.as_str();
        self.guard
            .allow(platform.as_str(), action)?
            .into_result(platform.as_str(), action)?;

        let receipt = match tokio::time::timeout(self.timeout, transport.deliver(&envelope)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(platform = %platform, timeout = ?self.timeout, "Dispatch deadline exceeded");
                return Err(Error::Timeout(self.timeout));
            }
        };
        tracing::info!(
            platform = %platform,
            kind = %envelope.kind,
            remote_id = ?receipt.remote_id,
            "Action delivered"
        );

        let mirror = self.mirror(platform, &envelope).await;
        Ok(DispatchReport {
            envelope,
            receipt,
            mirror,
        })
    }

    async fn mirror(&self, platform: Platform, original: &Envelope) -> MirrorStatus {
        let Some(mirror) = &self.mirror else {
            return MirrorStatus::Disabled;
        };
        if platform == Platform::Udp {
            return MirrorStatus::Disabled;
        }

        let from = self
            .signer
            .handle()
            .unwrap_or_else(|_| original.from.clone());
        let mut event = Envelope::new(Kind::Event, from)
            .with_text(format!("{platform} {}", original.kind))
            .stamped(self.clock.now().timestamp());
        event.to = original.to.clone();
        event.link = original.link.clone();

        match mirror.deliver(&event).await {
            Ok(_) => MirrorStatus::Sent,
            Err(e) => {
                tracing::warn!(error = %e, "UDP mirror failed");
                MirrorStatus::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beacon_core::Keypair;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recording {
        calls: AtomicUsize,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Transport for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn deliver(&self, envelope: &Envelope) -> Result<Receipt> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(Error::NetworkTimeout("unreachable".into()));
            }
            Ok(Receipt::new("recording", 200, envelope.nonce.clone()))
        }
    }

    fn dispatcher(dir: &TempDir) -> Dispatcher {
        Dispatcher::new(
            Signer::from_keypair(Keypair::generate()),
            RateLimitGuard::new(dir.path(), RateLimitPolicy::default()),
        )
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("ClawNews".parse::<Platform>().unwrap(), Platform::ClawNews);
        assert!(matches!(
            "myspace".parse::<Platform>(),
            Err(Error::UnknownTransport(_))
        ));
    }

    #[test]
    fn test_preview_signs_value() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);

        let plain = d
            .preview(&ActionRequest::new(Platform::Bottube, Kind::Like).to("vid"))
            .unwrap();
        assert!(plain.from.starts_with("bcn_"));
        assert!(plain.signature.is_none());
        assert!(plain.nonce.is_some());

        let tip = d
            .preview(
                &ActionRequest::new(Platform::Bottube, Kind::Like)
                    .to("vid")
                    .amount(Amount::from_micros(100_000)),
            )
            .unwrap();
        assert_eq!(tip.from.len(), 64);
        assert!(signer::verify(&tip, None));
    }

    #[test]
    fn test_value_without_key_is_signature_error() {
        let dir = TempDir::new().unwrap();
        let d = Dispatcher::new(
            Signer::in_data_dir(dir.path()),
            RateLimitGuard::new(dir.path(), RateLimitPolicy::default()),
        );
        let request = ActionRequest::new(Platform::RustChain, Kind::Transfer)
            .to("RTCx")
            .amount(Amount::from_micros(1));
        assert!(matches!(d.preview(&request), Err(Error::Signature(_))));

        let hello = d.preview(&ActionRequest::new(Platform::Udp, Kind::Hello)).unwrap();
        assert_eq!(hello.from, ANONYMOUS_SENDER);
    }

    #[tokio::test]
    async fn test_unknown_transport_consumes_no_slot() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);
        let request = ActionRequest::new(Platform::ClawNews, Kind::Bounty).text("x");
        assert!(matches!(
            d.dispatch(request).await,
            Err(Error::UnknownTransport(_))
        ));
        assert!(d.guard.last_invoked("clawnews", "bounty").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_guard_denies_second_call() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(Recording::default());
        let d = dispatcher(&dir).with_transport(Platform::Bottube, transport.clone());

        let request = ActionRequest::new(Platform::Bottube, Kind::Follow).to("agent_1");
        let report = d.dispatch(request.clone()).await.unwrap();
        assert_eq!(report.mirror, MirrorStatus::Disabled);
        assert_eq!(report.receipt.remote_id, report.envelope.nonce);

        let err = d.dispatch(request).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mirror_failure_does_not_fail_dispatch() {
        let dir = TempDir::new().unwrap();
        let primary = Arc::new(Recording::default());
        let mirror = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let d = dispatcher(&dir)
            .with_transport(Platform::Discord, primary.clone())
            .with_mirror(mirror.clone());

        let report = d
            .dispatch(ActionRequest::new(Platform::Discord, Kind::Hello).text("hi"))
            .await
            .unwrap();
        assert!(matches!(report.mirror, MirrorStatus::Failed(_)));
        assert_eq!(mirror.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tampered_submit_never_delivers() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(Recording::default());
        let d = dispatcher(&dir).with_transport(Platform::RustChain, transport.clone());

        let mut envelope = d
            .preview(
                &ActionRequest::new(Platform::RustChain, Kind::Transfer)
                    .to("RTCabc")
                    .amount(Amount::from_micros(1_500_000)),
            )
            .unwrap();
        envelope.value = Some(beacon_core::Value::rtc(Amount::from_micros(15_000_000)));

        let err = d.submit(Platform::RustChain, envelope).await.unwrap_err();
        assert!(matches!(err, Error::Signature(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout() {
        let dir = TempDir::new().unwrap();
        let slow = Arc::new(Recording {
            delay: Some(Duration::from_secs(600)),
            ..Recording::default()
        });
        let d = dispatcher(&dir)
            .with_transport(Platform::Udp, slow)
            .with_timeout(Duration::from_secs(5));

        let err = d
            .dispatch(ActionRequest::new(Platform::Udp, Kind::Hello))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_secs(5)));
    }
}
