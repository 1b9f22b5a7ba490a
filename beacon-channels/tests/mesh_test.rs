//! UDP mesh listener and end-to-end dispatch tests on loopback.

use beacon_channels::{
    ActionRequest, Dispatcher, ListenerState, MeshListener, MirrorStatus, Platform, Transport,
    UdpTransport,
};
use beacon_common::UdpConfig;
use beacon_core::inbox::{Inbox, InboxFilter};
use beacon_core::{Envelope, Keypair, Kind, RateLimitGuard, RateLimitPolicy, Signer};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

fn ttl() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

fn hello_line(kind: &str, nonce: &str) -> Vec<u8> {
    let ts = chrono::Utc::now().timestamp();
    format!("[BEACON v1] kind={kind} from=bcn_peer nonce={nonce} ts={ts}").into_bytes()
}

async fn send_raw(port: u16, payload: &[u8]) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(payload, ("127.0.0.1", port)).await.unwrap();
}

async fn wait_for_entries(inbox: &Inbox, count: usize) {
    for _ in 0..100 {
        if inbox.count(false).unwrap() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("inbox never reached {count} entries");
}

#[tokio::test]
async fn test_duplicates_and_garbage_are_dropped() {
    let dir = TempDir::new().unwrap();
    let (forward_tx, mut forward_rx) = mpsc::channel(8);
    let listener = MeshListener::new("127.0.0.1:0", Inbox::new(dir.path()), ttl())
        .with_forward(forward_tx)
        .bind()
        .await
        .unwrap();
    let port = listener.local_addr().port();
    let mut state = listener.state();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(listener.run(async move {
        let _ = stop_rx.await;
    }));
    state.wait_for(|s| *s == ListenerState::Receiving).await.unwrap();

    let beacon = hello_line("hello", "abc123");
    send_raw(port, &beacon).await;
    send_raw(port, &beacon).await;
    send_raw(port, b"\x00\x01 not a beacon").await;
    send_raw(port, &hello_line("hello", "def456")).await;

    let inbox = Inbox::new(dir.path());
    wait_for_entries(&inbox, 2).await;
    let forwarded = forward_rx.recv().await.unwrap();
    assert_eq!(forwarded.envelope.nonce.as_deref(), Some("abc123"));
    assert_eq!(forwarded.platform, "udp");

    let _ = stop_tx.send(());
    let stats = handle.await.unwrap();
    assert_eq!(stats.received, 4);
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.dropped, 1);
    assert_eq!(*state.borrow(), ListenerState::Closed);

    let entries = inbox.read(&InboxFilter::default()).unwrap();
    assert_eq!(entries.len(), 2);
}

#[tokio::test]
async fn test_restart_remembers_recent_nonces() {
    let dir = TempDir::new().unwrap();
    let beacon = hello_line("want", "once");

    for _ in 0..2 {
        let listener = MeshListener::new("127.0.0.1:0", Inbox::new(dir.path()), ttl())
            .bind()
            .await
            .unwrap();
        let port = listener.local_addr().port();
        let mut state = listener.state();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(listener.run(async move {
            let _ = stop_rx.await;
        }));
        state.wait_for(|s| *s == ListenerState::Receiving).await.unwrap();

        send_raw(port, &beacon).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = stop_tx.send(());
        handle.await.unwrap();
    }

    assert_eq!(Inbox::new(dir.path()).count(false).unwrap(), 1);
}

#[tokio::test]
async fn test_dispatch_over_udp_with_mirror() {
    let dir = TempDir::new().unwrap();
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = receiver.local_addr().unwrap().port();

    let udp = UdpTransport::new(&UdpConfig {
        broadcast: false,
        ..UdpConfig::default()
    })
    .to("127.0.0.1", port);
    let primary: Arc<dyn Transport> = Arc::new(udp.clone());

    let dispatcher = Dispatcher::new(
        Signer::from_keypair(Keypair::generate()),
        RateLimitGuard::new(dir.path(), RateLimitPolicy::default()),
    )
    .with_transport(Platform::Udp, primary.clone())
    .with_transport(Platform::Discord, primary)
    .with_mirror(Arc::new(udp));

    let report = dispatcher
        .dispatch(ActionRequest::new(Platform::Udp, Kind::Hello).text("hi mesh"))
        .await
        .unwrap();
    assert_eq!(report.mirror, MirrorStatus::Disabled);

    let report = dispatcher
        .dispatch(ActionRequest::new(Platform::Discord, Kind::Want).text("GPU"))
        .await
        .unwrap();
    assert_eq!(report.mirror, MirrorStatus::Sent);

    let mut buf = vec![0u8; 4096];
    let mut kinds = Vec::new();
    for _ in 0..3 {
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        let envelope = Envelope::decode(std::str::from_utf8(&buf[..n]).unwrap()).unwrap();
        kinds.push(envelope.kind);
    }
    assert_eq!(kinds, vec![Kind::Hello, Kind::Want, Kind::Event]);
}
