//! UDP mesh listener.
//!
//! Receives datagrams on a bound port, admits each envelope once per
//! `(from, nonce)` inside the dedup TTL, appends it to the inbox and
//! forwards it to an optional local channel. Nothing is acknowledged.
//!
//! An envelope is only fresh while its `ts` is no older than the TTL and no
//! further ahead than the allowed skew. The dedup window spans both, so a
//! captured datagram cannot be replayed once its pair has been forgotten.
//!
//! State moves `Idle -> Bound -> Receiving -> Closed`; a socket error drops
//! back to `Bound` and the loop keeps receiving.

use beacon_common::{Result, ResultExt};
use beacon_core::inbox::{DedupWindow, Inbox, InboxRecord};
use beacon_core::known_keys::KnownKeys;
use beacon_core::{signer, Clock, Envelope};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

const RECV_BUFFER_BYTES: usize = 65_535;

const DEFAULT_MAX_SKEW_S: i64 = 300;

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Bound,
    Receiving,
    Closed,
}

/// Counters reported when the listener stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub received: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub dropped: u64,
}

/// Why a datagram was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Accept(Box<Envelope>),
    Duplicate,
    Drop(String),
}

/// Unbound listener configuration.
pub struct MeshListener {
    bind_addr: String,
    inbox: Inbox,
    ttl: chrono::Duration,
    max_skew: chrono::Duration,
    known_keys: Option<KnownKeys>,
    forward: Option<mpsc::Sender<InboxRecord>>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<ListenerState>,
}

impl MeshListener {
    pub fn new(bind_addr: impl Into<String>, inbox: Inbox, ttl: chrono::Duration) -> Self {
        let (state, _) = watch::channel(ListenerState::Idle);
        Self {
            bind_addr: bind_addr.into(),
            inbox,
            ttl,
            max_skew: chrono::Duration::seconds(DEFAULT_MAX_SKEW_S),
            known_keys: None,
            forward: None,
            clock: beacon_core::system_clock(),
            state,
        }
    }

    /// Resolve handle senders of value-bearing envelopes.
    pub fn with_known_keys(mut self, known_keys: KnownKeys) -> Self {
        self.known_keys = Some(known_keys);
        self
    }

    /// Forward admitted records; a full channel drops the forward, not the record.
    pub fn with_forward(mut self, sender: mpsc::Sender<InboxRecord>) -> Self {
        self.forward = Some(sender);
        self
    }

    /// How far ahead of the local clock a sender's `ts` may run.
    pub fn with_max_skew(mut self, max_skew: chrono::Duration) -> Self {
        self.max_skew = max_skew;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Watch state transitions.
    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Wall-clock span during which one envelope can be fresh.
    fn dedup_span(&self) -> chrono::Duration {
        self.ttl + self.max_skew
    }

    /// Bind the socket and seed the dedup window from the inbox.
    pub async fn bind(self) -> Result<BoundMeshListener> {
        let socket = UdpSocket::bind(&self.bind_addr)
            .await
            .context(format!("binding mesh listener on {}", self.bind_addr))?;
        let local_addr = socket.local_addr()?;

        let now = self.clock.now();
        let window = self.dedup_span();
        let recent = self.inbox.recent(now - window)?;
        let dedup = DedupWindow::seeded(window, &recent, now);
        tracing::info!(addr = %local_addr, seeded = dedup.len(), "Mesh listener bound");

        self.state.send_replace(ListenerState::Bound);
        Ok(BoundMeshListener {
            socket,
            local_addr,
            dedup,
            config: self,
            stats: ListenerStats::default(),
        })
    }
}

/// Listener with an open socket.
pub struct BoundMeshListener {
    socket: UdpSocket,
    local_addr: SocketAddr,
    dedup: DedupWindow,
    config: MeshListener,
    stats: ListenerStats,
}

impl BoundMeshListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.config.state()
    }

    /// Receive until `shutdown` resolves, then close the socket.
    pub async fn run<F>(mut self, shutdown: F) -> ListenerStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut buf = vec![0u8; RECV_BUFFER_BYTES];
        self.config.state.send_replace(ListenerState::Receiving);

        loop {
            let received = tokio::select! {
                () = &mut shutdown => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, peer)) => self.handle_datagram(&buf[..len], peer),
                Err(e) => {
                    tracing::warn!(error = %e, "Mesh receive failed");
                    self.config.state.send_replace(ListenerState::Bound);
                    self.config.state.send_replace(ListenerState::Receiving);
                }
            }
        }

        self.config.state.send_replace(ListenerState::Closed);
        tracing::info!(
            received = self.stats.received,
            accepted = self.stats.accepted,
            duplicates = self.stats.duplicates,
            dropped = self.stats.dropped,
            "Mesh listener closed"
        );
        self.stats
    }

    fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr) {
        self.stats.received += 1;
        match self.judge(datagram) {
            Verdict::Accept(envelope) => self.admit(*envelope, peer),
            Verdict::Duplicate => {
                self.stats.duplicates += 1;
                tracing::debug!(peer = %peer, "Duplicate beacon skipped");
            }
            Verdict::Drop(reason) => {
                self.stats.dropped += 1;
                tracing::debug!(peer = %peer, reason = %reason, "Datagram dropped");
            }
        }
    }

    fn judge(&mut self, datagram: &[u8]) -> Verdict {
        let Ok(text) = std::str::from_utf8(datagram) else {
            return Verdict::Drop("not utf-8".into());
        };
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => return Verdict::Drop(e.to_string()),
        };
        let Some(nonce) = envelope.nonce.clone() else {
            return Verdict::Drop("no nonce".into());
        };
        if let Err(e) = envelope.validate() {
            return Verdict::Drop(e.to_string());
        }
        let now = self.config.clock.now();
        let Some(ts) = envelope.timestamp else {
            return Verdict::Drop("no timestamp".into());
        };
        let age = now.timestamp().saturating_sub(ts);
        if age > self.config.ttl.num_seconds() {
            return Verdict::Drop(format!("stale by {age}s"));
        }
        if age < -self.config.max_skew.num_seconds() {
            return Verdict::Drop(format!("ts {ts} ahead of local clock"));
        }
        if envelope.value.is_some() && !signer::verify(&envelope, self.config.known_keys.as_ref()) {
            return Verdict::Drop("value-bearing envelope failed verification".into());
        }
        if self.dedup.is_duplicate(&envelope.from, &nonce, now) {
            return Verdict::Duplicate;
        }
        Verdict::Accept(Box::new(envelope))
    }

    fn admit(&mut self, envelope: Envelope, peer: SocketAddr) {
        let mut record = InboxRecord::new(envelope, peer.to_string(), "udp");
        record.received_at = self.config.clock.now();

        if let Err(e) = self.config.inbox.append(&record) {
            self.stats.dropped += 1;
            tracing::error!(error = %e, "Failed to append beacon to inbox");
            return;
        }
        if let Some(nonce) = &record.envelope.nonce {
            self.dedup.record(&record.envelope.from, nonce, record.received_at);
        }
        self.stats.accepted += 1;
        tracing::info!(
            kind = %record.envelope.kind,
            from = %record.envelope.from,
            peer = %peer,
            "Beacon received"
        );

        if let Some(forward) = &self.config.forward {
            if let Err(e) = forward.try_send(record) {
                tracing::warn!(error = %e, "Local event channel full; beacon not forwarded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{Amount, Keypair, Kind, ManualClock, Signer};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn start() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    async fn bound_at(dir: &TempDir, clock: Arc<ManualClock>) -> BoundMeshListener {
        MeshListener::new("127.0.0.1:0", Inbox::new(dir.path()), chrono::Duration::minutes(5))
            .with_max_skew(chrono::Duration::seconds(30))
            .with_clock(clock)
            .bind()
            .await
            .unwrap()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:38400".parse().unwrap()
    }

    fn hello(from: &str, nonce: &str, ts: i64) -> Vec<u8> {
        format!("[BEACON v1] kind=hello from={from} nonce={nonce} ts={ts}").into_bytes()
    }

    #[tokio::test]
    async fn test_judge_rules() {
        let dir = TempDir::new().unwrap();
        let mut listener = bound_at(&dir, Arc::new(ManualClock::new(start()))).await;
        let now = start().timestamp();

        assert!(matches!(listener.judge(&[0xff, 0xfe]), Verdict::Drop(_)));
        assert!(matches!(listener.judge(b"hello there"), Verdict::Drop(_)));
        assert!(matches!(
            listener.judge(format!("[BEACON v1] kind=hello from=a ts={now}").as_bytes()),
            Verdict::Drop(_)
        ));
        assert!(matches!(
            listener.judge(b"[BEACON v1] kind=hello from=a nonce=n1"),
            Verdict::Drop(_)
        ));

        let ok = hello("a", "n1", now);
        assert!(matches!(listener.judge(&ok), Verdict::Accept(_)));
        listener.handle_datagram(&ok, peer());
        assert_eq!(listener.judge(&ok), Verdict::Duplicate);
        assert!(matches!(listener.judge(&hello("b", "n1", now)), Verdict::Accept(_)));
    }

    #[tokio::test]
    async fn test_freshness_window() {
        let dir = TempDir::new().unwrap();
        let mut listener = bound_at(&dir, Arc::new(ManualClock::new(start()))).await;
        let now = start().timestamp();

        assert!(matches!(listener.judge(&hello("a", "old", now - 301)), Verdict::Drop(_)));
        assert!(matches!(listener.judge(&hello("a", "edge", now - 300)), Verdict::Accept(_)));
        assert!(matches!(listener.judge(&hello("a", "ahead", now + 30)), Verdict::Accept(_)));
        assert!(matches!(listener.judge(&hello("a", "future", now + 31)), Verdict::Drop(_)));
        assert!(matches!(listener.judge(&hello("a", "min", i64::MIN)), Verdict::Drop(_)));
        assert!(matches!(listener.judge(&hello("a", "max", i64::MAX)), Verdict::Drop(_)));
    }

    #[tokio::test]
    async fn test_signed_transfer_not_replayed_after_ttl() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let mut listener = bound_at(&dir, clock.clone()).await;

        let signer = Signer::from_keypair(Keypair::generate());
        let mut transfer = Envelope::new(Kind::Transfer, signer.public_hex().unwrap())
            .with_to("RTC0000000000000000000000000000000000000001")
            .with_amount(Amount::from_micros(1_500_000))
            .stamped(start().timestamp());
        signer.sign(&mut transfer).unwrap();
        let datagram = transfer.encode().into_bytes();

        listener.handle_datagram(&datagram, peer());
        assert_eq!(listener.stats.accepted, 1);

        clock.advance(chrono::Duration::hours(24));
        listener.handle_datagram(&datagram, peer());
        assert_eq!(listener.stats.accepted, 1);
        assert_eq!(listener.stats.dropped, 1);
        assert_eq!(Inbox::new(dir.path()).count(false).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_append_does_not_mark_seen() {
        let dir = TempDir::new().unwrap();
        let mut listener = bound_at(&dir, Arc::new(ManualClock::new(start()))).await;

        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        listener.config.inbox = Inbox::new(&blocker);

        let datagram = hello("a", "n1", start().timestamp());
        listener.handle_datagram(&datagram, peer());
        listener.handle_datagram(&datagram, peer());
        assert_eq!(listener.stats.dropped, 2);
        assert_eq!(listener.stats.duplicates, 0);
        assert!(listener.dedup.is_empty());

        listener.config.inbox = Inbox::new(dir.path());
        listener.handle_datagram(&datagram, peer());
        assert_eq!(listener.stats.accepted, 1);
        listener.handle_datagram(&datagram, peer());
        assert_eq!(listener.stats.duplicates, 1);
    }

    #[tokio::test]
    async fn test_unverified_value_dropped() {
        let dir = TempDir::new().unwrap();
        let mut listener = bound_at(&dir, Arc::new(ManualClock::new(start()))).await;

        let signer = Signer::from_keypair(Keypair::generate());
        let mut envelope = Envelope::new(Kind::Bounty, signer.public_hex().unwrap())
            .with_amount(Amount::from_micros(1_000_000))
            .stamped(start().timestamp());
        signer.sign(&mut envelope).unwrap();
        assert!(matches!(
            listener.judge(envelope.encode().as_bytes()),
            Verdict::Accept(_)
        ));

        envelope.value = Some(beacon_core::Value::rtc(Amount::from_micros(9_000_000)));
        envelope.nonce = Some("other".into());
        assert!(matches!(
            listener.judge(envelope.encode().as_bytes()),
            Verdict::Drop(_)
        ));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let dir = TempDir::new().unwrap();
        let listener = MeshListener::new("127.0.0.1:0", Inbox::new(dir.path()), chrono::Duration::minutes(5));
        let state = listener.state();
        assert_eq!(*state.borrow(), ListenerState::Idle);

        let bound = listener.bind().await.unwrap();
        assert_eq!(*state.borrow(), ListenerState::Bound);

        let stats = bound.run(async {}).await;
        assert_eq!(*state.borrow(), ListenerState::Closed);
        assert_eq!(stats, ListenerStats::default());
    }
}
