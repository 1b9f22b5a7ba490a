//! Trust-on-first-use store of peer public keys.
//!
//! Maps agent handles (`bcn_` + 12 hex) to Ed25519 public keys so that
//! envelopes whose `from` is a handle can still be verified. Entries expire
//! after a TTL unless they are seen again. Keys learned from the wire must
//! hash to their handle; a pinned key only changes through an explicit
//! rotation endorsed by the old key.

use crate::clock::{system_clock, Clock};
use crate::signer::{decode_signature, handle_for, HANDLE_PREFIX};
use crate::store::{self, FileLock};
use beacon_common::{Error, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default file name under the data directory.
pub const KNOWN_KEYS_FILE: &str = "known_keys.json";

/// Entries not seen for this long are treated as absent.
pub const DEFAULT_TTL_DAYS: i64 = 30;

/// Persisted record for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownKey {
    pub pubkey_hex: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub rotation_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_keys: Vec<String>,
}

/// What [`KnownKeys::trust`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustOutcome {
    Added,
    Refreshed,
    Rotated,
    /// A different key is already pinned and rotation was not allowed.
    Conflict,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnownKeysFile {
    #[serde(default)]
    keys: BTreeMap<String, KnownKey>,
}

#[derive(Debug, Clone)]
pub struct KnownKeys {
    path: PathBuf,
    lock_path: PathBuf,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl KnownKeys {
    pub fn new(data_dir: &Path) -> Self {
        Self::at(data_dir.join(KNOWN_KEYS_FILE))
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            lock_path: store::lock_path_for(&path),
            path,
            ttl: chrono::Duration::days(DEFAULT_TTL_DAYS),
            clock: system_clock(),
        }
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Pin `pubkey_hex` for `handle`.
    ///
    /// A `bcn_` handle must be the one derived from the key; other names are
    /// local aliases. An existing different key is replaced only when
    /// `allow_rotation` is set.
    pub fn trust(&self, handle: &str, pubkey_hex: &str, allow_rotation: bool) -> Result<TrustOutcome> {
        let key = parse_pubkey(pubkey_hex)?;
        if handle.starts_with(HANDLE_PREFIX) {
            check_derived(handle, &key)?;
        }
        self.pin(handle, &key, allow_rotation)
    }

    /// Trust on first use: accept a key seen on the wire.
    ///
    /// The handle must be derived from the key, and a different key already
    /// pinned for it is never replaced this way.
    pub fn learn(&self, handle: &str, pubkey_hex: &str) -> Result<TrustOutcome> {
        let key = parse_pubkey(pubkey_hex)?;
        check_derived(handle, &key)?;
        self.pin(handle, &key, false)
    }

    /// Replace the pinned key with one endorsed by it.
    ///
    /// `endorsement` is the old key's signature over the new key's 32 bytes.
    pub fn rotate(&self, handle: &str, new_pubkey_hex: &str, endorsement: &str) -> Result<TrustOutcome> {
        let new_key = parse_pubkey(new_pubkey_hex)?;
        let file: KnownKeysFile = store::read_json(&self.path)?;
        let old = file
            .keys
            .get(handle)
            .ok_or_else(|| Error::NotFound(format!("no pinned key for {handle}")))?;
        let old_key = parse_pubkey(&old.pubkey_hex)?;
        let signature = decode_signature(endorsement)?;
        old_key
            .verify_strict(new_key.as_bytes(), &signature)
            .map_err(|_| Error::Signature(format!("rotation for {handle} not signed by the pinned key")))?;
        self.pin(handle, &new_key, true)
    }

    fn pin(&self, handle: &str, key: &VerifyingKey, allow_rotation: bool) -> Result<TrustOutcome> {
        let pubkey_hex = hex::encode(key.to_bytes());

        let _lock = FileLock::acquire(&self.lock_path)?;
        let mut file: KnownKeysFile = store::read_json(&self.path)?;
        let now = self.clock.now();

        let outcome = match file.keys.get_mut(handle) {
            None => {
                file.keys.insert(
                    handle.to_string(),
                    KnownKey {
                        pubkey_hex,
                        first_seen: now,
                        last_seen: now,
                        rotation_count: 0,
                        previous_keys: Vec::new(),
                    },
                );
                TrustOutcome::Added
            }
            Some(entry) if entry.pubkey_hex == pubkey_hex => {
                entry.last_seen = now;
                TrustOutcome::Refreshed
            }
            Some(_) if !allow_rotation => {
                tracing::warn!(handle = %handle, "Refusing key change for pinned handle");
                return Ok(TrustOutcome::Conflict);
            }
            Some(entry) => {
                let old = std::mem::replace(&mut entry.pubkey_hex, pubkey_hex);
                if !entry.previous_keys.contains(&old) {
                    entry.previous_keys.push(old);
                }
                entry.rotation_count += 1;
                entry.last_seen = now;
                tracing::info!(handle = %handle, rotations = entry.rotation_count, "Rotated peer key");
                TrustOutcome::Rotated
            }
        };

        store::write_json(&self.path, &file)?;
        Ok(outcome)
    }

    /// Look up a live key for `handle`.
    pub fn get(&self, handle: &str) -> Result<Option<VerifyingKey>> {
        let file: KnownKeysFile = store::read_json(&self.path)?;
        let now = self.clock.now();
        match file.keys.get(handle) {
            Some(entry) if now - entry.last_seen <= self.ttl => Ok(Some(parse_pubkey(&entry.pubkey_hex)?)),
            Some(_) => {
                tracing::debug!(handle = %handle, "Known key expired");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Forget `handle`. Returns whether it was present.
    pub fn revoke(&self, handle: &str) -> Result<bool> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let mut file: KnownKeysFile = store::read_json(&self.path)?;
        let removed = file.keys.remove(handle).is_some();
        if removed {
            store::write_json(&self.path, &file)?;
        }
        Ok(removed)
    }

    /// All entries, optionally including expired ones.
    pub fn list(&self, include_expired: bool) -> Result<BTreeMap<String, KnownKey>> {
        let mut file: KnownKeysFile = store::read_json(&self.path)?;
        if !include_expired {
            let now = self.clock.now();
            file.keys.retain(|_, entry| now - entry.last_seen <= self.ttl);
        }
        Ok(file.keys)
    }
}

fn check_derived(handle: &str, key: &VerifyingKey) -> Result<()> {
    let derived = handle_for(key);
    if derived != handle {
        return Err(Error::Validation(format!(
            "handle {handle} does not match public key (expected {derived})"
        )));
    }
    Ok(())
}

/// Parse a 64-hex Ed25519 public key.
pub fn parse_pubkey(pubkey_hex: &str) -> Result<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(pubkey_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Signature("public key must be 64 hex characters".into()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::Signature(format!("invalid public key: {e}")))
}
