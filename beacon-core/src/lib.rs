//! Beacon Core - protocol primitives for agent-to-agent messaging.
//!
//! This crate provides:
//! - The `[BEACON v1]` envelope and its text codec
//! - Ed25519 identities, envelope signing and verification
//! - A trust-on-first-use store of peer keys
//! - A rate-limit guard persisted across processes
//! - The retry/backoff engine used by every HTTP transport
//! - The inbox of received envelopes

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod clock;
pub mod envelope;
pub mod guard;
pub mod inbox;
pub mod known_keys;
pub mod retry;
pub mod signer;
mod store;

pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use envelope::{Amount, Envelope, Kind, Value, MAX_TEXT_CHARS, TAG};
pub use guard::{Decision, RateLimitGuard, RateLimitPolicy};
pub use inbox::{DedupWindow, Inbox, InboxEntry, InboxFilter, InboxRecord};
pub use known_keys::{KnownKey, KnownKeys, TrustOutcome};
pub use retry::{execute, Attempt, RetryPolicy};
pub use signer::{Keypair, Signer};
