//! Integration tests for Beacon Core.
//!
//! Exercises the envelope, signer, guard and inbox together through the
//! public API, the way a dispatcher and a listener use them.

use beacon_common::Error;
use beacon_core::signer::{self, KEY_FILE};
use beacon_core::{
    Amount, DedupWindow, Decision, Envelope, Inbox, InboxFilter, InboxRecord, Keypair, Kind,
    KnownKeys, ManualClock, RateLimitGuard, RateLimitPolicy, Signer,
};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;

// ─────────────────────────────────────────────────────────────────────────────
// Signed envelopes on the wire
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_signed_transfer_survives_the_wire() {
    let dir = TempDir::new().unwrap();
    Keypair::load_or_create(&dir.path().join(KEY_FILE)).unwrap();
    let signer = Signer::in_data_dir(dir.path());

    let mut envelope = Envelope::new(Kind::Transfer, signer.public_hex().unwrap())
        .with_to("RTC9f2c1e0d")
        .with_amount("1.5".parse().unwrap())
        .with_text("for the bug bounty")
        .stamped(1_760_000_000);
    signer.sign(&mut envelope).unwrap();

    let wire = format!("paid! {}\nthanks", envelope.encode());
    let received = Envelope::decode(&wire).unwrap();
    assert_eq!(received, envelope);
    assert!(received.validate().is_ok());
    assert!(signer::verify(&received, None));
}

#[test]
fn test_tampered_amount_fails_verification() {
    let signer = Signer::from_keypair(Keypair::generate());
    let mut envelope = Envelope::new(Kind::Transfer, signer.public_hex().unwrap())
        .with_to("RTC9f2c1e0d")
        .with_amount("1.5".parse().unwrap())
        .stamped(1_760_000_000);
    signer.sign(&mut envelope).unwrap();

    let tampered_text = envelope.encode().replace("rtc=1.5", "rtc=15");
    let tampered = Envelope::decode(&tampered_text).unwrap();
    assert_eq!(tampered.value.as_ref().unwrap().amount, Amount::from_micros(15_000_000));
    assert!(!signer::verify(&tampered, None));

    let mut rekinded = envelope.clone();
    rekinded.kind = Kind::Bounty;
    assert!(!signer::verify(&rekinded, None));
}

#[test]
fn test_handle_sender_verified_after_learning_key() {
    let dir = TempDir::new().unwrap();
    let known = KnownKeys::new(dir.path());
    let peer = Keypair::generate();

    let mut envelope = Envelope::new(Kind::Bounty, peer.handle())
        .with_amount(Amount::from_micros(2_000_000))
        .with_link("https://clawnews.io/item/9");
    envelope.signature = Some(signer::sign(&envelope, &peer));

    assert!(!signer::verify(&envelope, Some(&known)));
    known.learn(&peer.handle(), &peer.public_hex()).unwrap();
    assert!(signer::verify(&envelope, Some(&known)));

    known.revoke(&peer.handle()).unwrap();
    assert!(!signer::verify(&envelope, Some(&known)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Guard
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_guard_shared_between_instances() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()));
    let first = RateLimitGuard::new(dir.path(), RateLimitPolicy::default()).with_clock(clock.clone());
    let second = RateLimitGuard::new(dir.path(), RateLimitPolicy::default()).with_clock(clock.clone());

    assert_eq!(first.allow("clawnews", "bounty").unwrap(), Decision::Allowed);
    clock.advance(chrono::Duration::minutes(29));

    let err = second
        .allow("clawnews", "bounty")
        .unwrap()
        .into_result("clawnews", "bounty")
        .unwrap_err();
    assert!(matches!(err, Error::RateLimitedLocally { .. }));
    assert_eq!(err.status_code(), 429);

    clock.advance(chrono::Duration::minutes(2));
    assert!(second.allow("clawnews", "bounty").unwrap().is_allowed());
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbox and dedup
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_inbox_reports_verification() {
    let dir = TempDir::new().unwrap();
    let inbox = Inbox::new(dir.path()).with_known_keys(KnownKeys::new(dir.path()));
    let sender = Keypair::generate();

    let mut good = Envelope::new(Kind::Bounty, sender.public_hex())
        .with_amount(Amount::from_micros(500_000))
        .with_nonce("good");
    good.signature = Some(signer::sign(&good, &sender));
    let mut bad = good.clone().with_nonce("bad");
    bad.signature = good.signature.clone();

    inbox.append(&InboxRecord::new(good, "10.0.0.2:38400", "udp")).unwrap();
    inbox.append(&InboxRecord::new(bad, "10.0.0.2:38400", "udp")).unwrap();
    inbox
        .append(&InboxRecord::new(
            Envelope::new(Kind::Hello, "anon").with_nonce("plain"),
            "10.0.0.3:38400",
            "udp",
        ))
        .unwrap();

    let entries = inbox.read(&InboxFilter::default()).unwrap();
    let verified: Vec<Option<bool>> = entries.iter().map(|e| e.verified).collect();
    assert_eq!(verified, vec![Some(true), Some(false), None]);
}

#[test]
fn test_restarted_listener_window_rejects_seen_pairs() {
    let dir = TempDir::new().unwrap();
    let inbox = Inbox::new(dir.path());
    let ttl = chrono::Duration::seconds(600);
    let now = Utc::now();

    let mut window = DedupWindow::new(ttl);
    let envelope = Envelope::new(Kind::Hello, "alice").with_nonce("n-77");
    assert!(window.admit("alice", "n-77", now));
    inbox.append(&InboxRecord::new(envelope, "10.0.0.9:38400", "udp")).unwrap();

    let recent = inbox.recent(now - ttl).unwrap();
    let mut restarted = DedupWindow::seeded(ttl, &recent, Utc::now());
    assert!(!restarted.admit("alice", "n-77", Utc::now()));
    assert!(restarted.admit("alice", "n-78", Utc::now()));
}
