//! Append-only inbox of received envelopes.
//!
//! Records are JSON lines in `inbox.jsonl`; read marks live separately in
//! `inbox_state.json` as a bounded set of nonces. Appends take the same
//! exclusive lock as pruning so a listener and a CLI reader can share the
//! directory.

use crate::envelope::{Envelope, Kind};
use crate::known_keys::KnownKeys;
use crate::signer;
use crate::store::{self, FileLock};
use beacon_common::{Result, ResultExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const INBOX_FILE: &str = "inbox.jsonl";
pub const INBOX_STATE_FILE: &str = "inbox_state.json";

/// Read marks kept before the oldest are forgotten.
pub const MAX_READ_NONCES: usize = 10_000;

/// One received envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub envelope: Envelope,
    pub received_at: DateTime<Utc>,
    /// `ip:port` for UDP, or the platform item/message id.
    pub source_address: String,
    #[serde(default)]
    pub platform: String,
}

impl InboxRecord {
    pub fn new(envelope: Envelope, source_address: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            envelope,
            received_at: Utc::now(),
            source_address: source_address.into(),
            platform: platform.into(),
        }
    }
}

/// A record as returned by [`Inbox::read`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboxEntry {
    #[serde(flatten)]
    pub record: InboxRecord,
    pub is_read: bool,
    /// `None` when the envelope carries no signature.
    pub verified: Option<bool>,
}

/// Filters for [`Inbox::read`]. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct InboxFilter {
    pub kind: Option<Kind>,
    pub from: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub unread_only: bool,
    /// Keep only the last N matches.
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InboxState {
    #[serde(default)]
    read_nonces: VecDeque<String>,
}

#[derive(Debug, Clone)]
pub struct Inbox {
    path: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
    known_keys: Option<KnownKeys>,
}

impl Inbox {
    pub fn new(data_dir: &Path) -> Self {
        let path = data_dir.join(INBOX_FILE);
        Self {
            lock_path: store::lock_path_for(&path),
            state_path: data_dir.join(INBOX_STATE_FILE),
            path,
            known_keys: None,
        }
    }

    /// Resolve handle signers through `known_keys` when reporting `verified`.
    pub fn with_known_keys(mut self, known_keys: KnownKeys) -> Self {
        self.known_keys = Some(known_keys);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to disk.
    pub fn append(&self, record: &InboxRecord) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        self.write_record(record)
    }

    /// Append unless a record with the same `(from, nonce)` is already stored.
    ///
    /// Records without a nonce match on the envelope and source address.
    /// Returns whether the record was written.
    pub fn append_if_new(&self, record: &InboxRecord) -> Result<bool> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let exists = self.load_records()?.iter().any(|stored| same_entry(stored, record));
        if exists {
            return Ok(false);
        }
        self.write_record(record)?;
        Ok(true)
    }

    /// Caller holds the inbox lock.
    fn write_record(&self, record: &InboxRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context(format!("opening {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn load_records(&self) -> Result<Vec<InboxRecord>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context(format!("reading {}", self.path.display())),
        };

        let mut records = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<InboxRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::debug!(line = index + 1, error = %e, "Skipping malformed inbox line"),
            }
        }
        Ok(records)
    }

    fn read_nonces(&self) -> Result<HashSet<String>> {
        let state: InboxState = store::read_json(&self.state_path)?;
        Ok(state.read_nonces.into_iter().collect())
    }

    fn to_entry(&self, record: InboxRecord, read: &HashSet<String>) -> InboxEntry {
        let is_read = record
            .envelope
            .nonce
            .as_ref()
            .is_some_and(|nonce| read.contains(nonce));
        let verified = record
            .envelope
            .signature
            .as_ref()
            .map(|_| signer::verify(&record.envelope, self.known_keys.as_ref()));
        InboxEntry {
            record,
            is_read,
            verified,
        }
    }

    /// Records matching `filter`, oldest first.
    pub fn read(&self, filter: &InboxFilter) -> Result<Vec<InboxEntry>> {
        let read = self.read_nonces()?;
        let mut entries: Vec<InboxEntry> = self
            .load_records()?
            .into_iter()
            .filter(|r| filter.kind.map_or(true, |k| r.envelope.kind == k))
            .filter(|r| filter.from.as_deref().map_or(true, |f| r.envelope.from == f))
            .filter(|r| filter.since.map_or(true, |s| r.received_at >= s))
            .map(|r| self.to_entry(r, &read))
            .filter(|e| !filter.unread_only || !e.is_read)
            .collect();

        if let Some(limit) = filter.limit {
            let skip = entries.len().saturating_sub(limit);
            entries.drain(..skip);
        }
        Ok(entries)
    }

    pub fn count(&self, unread_only: bool) -> Result<usize> {
        let filter = InboxFilter {
            unread_only,
            ..Default::default()
        };
        Ok(self.read(&filter)?.len())
    }

    /// Most recent record carrying `nonce`.
    pub fn get_by_nonce(&self, nonce: &str) -> Result<Option<InboxEntry>> {
        let read = self.read_nonces()?;
        Ok(self
            .load_records()?
            .into_iter()
            .rev()
            .find(|r| r.envelope.nonce.as_deref() == Some(nonce))
            .map(|r| self.to_entry(r, &read)))
    }

    /// Remember `nonce` as read. The set keeps the newest marks only.
    pub fn mark_read(&self, nonce: &str) -> Result<()> {
        let _lock = FileLock::acquire(&store::lock_path_for(&self.state_path))?;
        let mut state: InboxState = store::read_json(&self.state_path)?;
        if state.read_nonces.iter().any(|n| n == nonce) {
            return Ok(());
        }
        state.read_nonces.push_back(nonce.to_string());
        while state.read_nonces.len() > MAX_READ_NONCES {
            state.read_nonces.pop_front();
        }
        store::write_json(&self.state_path, &state)
    }

    /// Records received at or after `since`, for seeding a dedup window.
    pub fn recent(&self, since: DateTime<Utc>) -> Result<Vec<InboxRecord>> {
        Ok(self
            .load_records()?
            .into_iter()
            .filter(|r| r.received_at >= since)
            .collect())
    }

    /// Drop records received before `cutoff`. Returns how many were removed.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let records = self.load_records()?;
        let before = records.len();
        let kept: Vec<&InboxRecord> = records.iter().filter(|r| r.received_at >= cutoff).collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut out = String::new();
        for record in kept {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        store::write_atomic(&self.path, out.as_bytes(), false)?;
        tracing::info!(removed = removed, "Pruned inbox");
        Ok(removed)
    }
}

fn same_entry(stored: &InboxRecord, incoming: &InboxRecord) -> bool {
    match &incoming.envelope.nonce {
        Some(nonce) => {
            stored.envelope.from == incoming.envelope.from
                && stored.envelope.nonce.as_deref() == Some(nonce.as_str())
        }
        None => {
            stored.envelope == incoming.envelope && stored.source_address == incoming.source_address
        }
    }
}

// ============================================================================
// Dedup window
// ============================================================================

/// Remembers `(from, nonce)` pairs for a fixed TTL.
#[derive(Debug)]
pub struct DedupWindow {
    ttl: chrono::Duration,
    seen: HashMap<(String, String), DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
}

impl DedupWindow {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            ttl,
            seen: HashMap::new(),
            last_sweep: None,
        }
    }

    /// Window pre-filled from records still inside the TTL.
    pub fn seeded(ttl: chrono::Duration, records: &[InboxRecord], now: DateTime<Utc>) -> Self {
        let mut window = Self::new(ttl);
        for record in records {
            if let Some(nonce) = &record.envelope.nonce {
                if now - record.received_at <= ttl {
                    window
                        .seen
                        .insert((record.envelope.from.clone(), nonce.clone()), record.received_at);
                }
            }
        }
        window
    }

    /// Record the pair; false when it was already seen inside the TTL.
    pub fn admit(&mut self, from: &str, nonce: &str, now: DateTime<Utc>) -> bool {
        if self.is_duplicate(from, nonce, now) {
            return false;
        }
        self.record(from, nonce, now);
        true
    }

    /// True when the pair was seen inside the TTL. Does not record it.
    pub fn is_duplicate(&self, from: &str, nonce: &str, now: DateTime<Utc>) -> bool {
        let key = (from.to_string(), nonce.to_string());
        matches!(self.seen.get(&key), Some(at) if now - *at <= self.ttl)
    }

    pub fn record(&mut self, from: &str, nonce: &str, now: DateTime<Utc>) {
        self.sweep(now);
        self.seen.insert((from.to_string(), nonce.to_string()), now);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn sweep(&mut self, now: DateTime<Utc>) {
        let due = self.last_sweep.map_or(true, |last| now - last >= self.ttl);
        if !due {
            return;
        }
        let ttl = self.ttl;
        self.seen.retain(|_, at| now - *at <= ttl);
        self.last_sweep = Some(now);
    }
}
