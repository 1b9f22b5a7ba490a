//! Agent identity and envelope signatures.
//!
//! Each agent owns one Ed25519 keypair, kept in a JSON key file readable only
//! by its owner. Signatures cover [`Envelope::canonical_bytes`] and travel in
//! the `sig` field as URL-safe base64 without padding.
//!
//! A verifier resolves the signer's public key from `from`: a 64-hex value is
//! the key itself; anything else is looked up in [`KnownKeys`].

use crate::envelope::Envelope;
use crate::known_keys::{parse_pubkey, KnownKeys};
use crate::store;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use beacon_common::{Error, Result, ResultExt};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer as _, SigningKey};
use once_cell::sync::OnceCell;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, Zeroizing};

pub use ed25519_dalek::VerifyingKey;

/// Key file location relative to the data directory.
pub const KEY_FILE: &str = "identity/agent.key";

/// Prefix of every derived agent handle.
pub const HANDLE_PREFIX: &str = "bcn_";
const HANDLE_HEX_LEN: usize = 12;

// ============================================================================
// Keypair
// ============================================================================

/// Ed25519 signing keypair. The secret half is zeroized on drop.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Public key as 64 lowercase hex characters.
    pub fn public_hex(&self) -> String {
        key_hex(&self.verifying_key())
    }

    /// Short agent handle derived from the public key.
    pub fn handle(&self) -> String {
        handle_for(&self.verifying_key())
    }

    /// Sign arbitrary bytes, returning the wire encoding.
    pub fn sign_bytes(&self, message: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.sign(message).to_bytes())
    }

    /// Load a key file written by [`Keypair::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let contents = Zeroizing::new(
            std::fs::read_to_string(path).context(format!("reading key file {}", path.display()))?,
        );
        let file: KeyFile =
            serde_json::from_str(&contents).context(format!("parsing key file {}", path.display()))?;

        let secret = Zeroizing::new(
            hex::decode(file.secret_key.as_str())
                .map_err(|_| Error::Signature("key file secret is not hex".into()))?,
        );
        let seed: &[u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| Error::Signature("key file secret must be 32 bytes".into()))?;
        let keypair = Self::from_seed(seed);

        if keypair.public_hex() != file.public_key {
            return Err(Error::Signature(format!(
                "key file {} is inconsistent: public key does not match secret",
                path.display()
            )));
        }
        Ok(keypair)
    }

    /// Write the key file with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = KeyFile {
            version: 1,
            secret_key: hex::encode(self.signing_key.to_bytes()),
            public_key: self.public_hex(),
            handle: self.handle(),
            created_at: Utc::now(),
        };
        let json = Zeroizing::new(serde_json::to_vec_pretty(&file)?);
        store::write_atomic(path, &json, true)
    }

    /// Load the key at `path`, generating and saving one if absent.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let keypair = Self::generate();
        keypair.save(path)?;
        tracing::info!(
            handle = %keypair.handle(),
            path = %path.display(),
            "Generated new agent identity"
        );
        Ok(keypair)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    secret_key: String,
    public_key: String,
    #[serde(default)]
    handle: String,
    created_at: DateTime<Utc>,
}

impl Drop for KeyFile {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

/// `bcn_` followed by the first 12 hex digits of SHA-256(public key).
pub fn handle_for(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let hex = hex::encode(digest);
    format!("{HANDLE_PREFIX}{}", &hex[..HANDLE_HEX_LEN])
}

/// Public key as 64 lowercase hex characters.
pub fn key_hex(key: &VerifyingKey) -> String {
    hex::encode(key.as_bytes())
}

/// Parse the wire encoding of a signature.
pub fn decode_signature(encoded: &str) -> Result<Signature> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|_| Error::Signature("signature is not base64".into()))?;
    Signature::from_slice(&bytes).map_err(|_| Error::Signature("signature must be 64 bytes".into()))
}

// ============================================================================
// Envelope signing
// ============================================================================

/// Signature over the canonical bytes of `envelope`.
pub fn sign(envelope: &Envelope, keypair: &Keypair) -> String {
    keypair.sign_bytes(&envelope.canonical_bytes())
}

/// Check `envelope.signature` against an explicit key.
pub fn verify_with_key(envelope: &Envelope, key: &VerifyingKey) -> bool {
    let Some(encoded) = envelope.signature.as_deref() else {
        return false;
    };
    match decode_signature(encoded) {
        Ok(signature) => key.verify_strict(&envelope.canonical_bytes(), &signature).is_ok(),
        Err(_) => false,
    }
}

/// Public key an envelope claims to be signed by, if it can be resolved.
pub fn resolve_key(envelope: &Envelope, known_keys: Option<&KnownKeys>) -> Option<VerifyingKey> {
    if envelope.from.len() == 64 {
        if let Ok(key) = parse_pubkey(&envelope.from) {
            return Some(key);
        }
    }
    let known_keys = known_keys?;
    match known_keys.get(&envelope.from) {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(error = %e, "Known-key lookup failed");
            None
        }
    }
}

/// Verify an envelope's signature.
///
/// False when the signature is missing or malformed, the key cannot be
/// resolved, or any signed field was altered.
pub fn verify(envelope: &Envelope, known_keys: Option<&KnownKeys>) -> bool {
    match resolve_key(envelope, known_keys) {
        Some(key) => verify_with_key(envelope, &key),
        None => false,
    }
}

// ============================================================================
// Signer
// ============================================================================

/// The local agent's signing identity.
///
/// The key file is read the first time a signature is needed, not at
/// construction, so commands that never sign never touch it.
#[derive(Debug)]
pub struct Signer {
    key_path: PathBuf,
    keypair: OnceCell<Keypair>,
}

impl Signer {
    pub fn new(key_path: PathBuf) -> Self {
        Self {
            key_path,
            keypair: OnceCell::new(),
        }
    }

    /// Signer for `<data_dir>/identity/agent.key`.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(KEY_FILE))
    }

    /// Signer around an in-memory keypair.
    pub fn from_keypair(keypair: Keypair) -> Self {
        Self {
            key_path: PathBuf::new(),
            keypair: OnceCell::with_value(keypair),
        }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn keypair(&self) -> Result<&Keypair> {
        self.keypair.get_or_try_init(|| {
            if !self.key_path.exists() {
                return Err(Error::Signature(format!(
                    "no signing key at {}; run `beacon identity init`",
                    self.key_path.display()
                )));
            }
            Keypair::load(&self.key_path)
        })
    }

    /// Public key hex, suitable as an envelope `from`.
    pub fn public_hex(&self) -> Result<String> {
        Ok(self.keypair()?.public_hex())
    }

    pub fn handle(&self) -> Result<String> {
        Ok(self.keypair()?.handle())
    }

    /// Validate the envelope's fields and attach a signature.
    pub fn sign(&self, envelope: &mut Envelope) -> Result<()> {
        envelope.validate_fields()?;
        let keypair = self.keypair()?;
        envelope.signature = None;
        envelope.signature = Some(sign(envelope, keypair));
        tracing::debug!(
            kind = %envelope.kind,
            nonce = ?envelope.nonce,
            "Signed envelope"
        );
        Ok(())
    }
}
