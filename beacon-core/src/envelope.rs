//! The `[BEACON v1]` envelope and its text codec.
//!
//! An envelope is one line of text:
//!
//! ```text
//! [BEACON v1] kind=<kind> from=<id> [to=<id>] [rtc=<decimal>] [link=<url>] [text=<string>] [sig=<base64>] [nonce=<token>] [ts=<epoch>]
//! ```
//!
//! Keys are written in that order. A value that contains whitespace, `=`, `%`,
//! `[`, `]` or a control character is percent-encoded; any other value is
//! written as is. The decoder looks for the tag anywhere in its input and only
//! parses forward from it, so an envelope can ride inside a chat message or a
//! board post. Parsing ends at the end of the line or at the first token that
//! is not `key=value`.

use beacon_common::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Protocol version literal.
pub const VERSION: &str = "BEACON v1";

/// Tag that opens every encoded envelope.
pub const TAG: &str = "[BEACON v1]";

/// Unit of value carried by envelopes.
pub const CURRENCY: &str = "RTC";

/// Upper bound on `text`, in characters.
pub const MAX_TEXT_CHARS: usize = 2000;

// ============================================================================
// Kind
// ============================================================================

/// Closed set of envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Like,
    Follow,
    Want,
    Bounty,
    Ad,
    Transfer,
    Hello,
    Event,
}

impl Kind {
    pub const ALL: [Kind; 8] = [
        Kind::Like,
        Kind::Follow,
        Kind::Want,
        Kind::Bounty,
        Kind::Ad,
        Kind::Transfer,
        Kind::Hello,
        Kind::Event,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Like => "like",
            Kind::Follow => "follow",
            Kind::Want => "want",
            Kind::Bounty => "bounty",
            Kind::Ad => "ad",
            Kind::Transfer => "transfer",
            Kind::Hello => "hello",
            Kind::Event => "event",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Kind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::decode(format!("kind={s}"), "unknown kind"))
    }
}

// ============================================================================
// Amount
// ============================================================================

/// Fixed-point RTC amount with six fractional digits.
///
/// Stored as micro-RTC so that parsing and formatting are exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Amount(u64);

impl Amount {
    /// Fractional digits carried by an amount.
    pub const DECIMALS: u32 = 6;
    const SCALE: u64 = 1_000_000;

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn micros(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Lossy conversion for display and JSON payloads.
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / Self::SCALE;
        let frac = self.0 % Self::SCALE;
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{frac:06}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |reason: &str| Error::decode(format!("rtc={s}"), reason);

        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad("amount must be a non-negative decimal"));
        }
        if s.contains('.') && frac.is_empty() {
            return Err(bad("missing fractional digits"));
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad("amount must be a non-negative decimal"));
        }
        if frac.len() > Self::DECIMALS as usize {
            return Err(bad("more than 6 fractional digits"));
        }

        let whole: u64 = whole.parse().map_err(|_| bad("amount out of range"))?;
        let mut frac_micros: u64 = 0;
        if !frac.is_empty() {
            let padded = format!("{frac:0<6}");
            frac_micros = padded.parse().map_err(|_| bad("amount out of range"))?;
        }

        whole
            .checked_mul(Self::SCALE)
            .and_then(|w| w.checked_add(frac_micros))
            .map(Self)
            .ok_or_else(|| bad("amount out of range"))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Value attached to an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub amount: Amount,
    pub currency: String,
}

impl Value {
    pub fn rtc(amount: Amount) -> Self {
        Self {
            amount,
            currency: CURRENCY.to_string(),
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// One unit of agent-to-agent communication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: Kind,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// Start an envelope with only the mandatory fields.
    pub fn new(kind: Kind, from: impl Into<String>) -> Self {
        Self {
            kind,
            from: from.into(),
            to: None,
            value: None,
            link: None,
            text: None,
            signature: None,
            nonce: None,
            timestamp: None,
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_amount(mut self, amount: Amount) -> Self {
        self.value = Some(Value::rtc(amount));
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn with_timestamp(mut self, ts: i64) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Fill in a timestamp and nonce where missing.
    pub fn stamped(mut self, now: i64) -> Self {
        self.timestamp.get_or_insert(now);
        if self.nonce.is_none() {
            self.nonce = Some(fresh_nonce());
        }
        self
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    /// Value-bearing and transfer envelopes must be signed; nothing else may be.
    pub fn requires_signature(&self) -> bool {
        self.value.is_some() || self.kind == Kind::Transfer
    }

    /// Bytes covered by the signature: the encoded envelope with `sig` left out.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        unsigned.encode().into_bytes()
    }

    /// Check field contents, ignoring whether a signature is present.
    pub fn validate_fields(&self) -> Result<()> {
        if self.from.trim().is_empty() {
            return Err(Error::Validation("from must not be empty".into()));
        }
        let optional = [
            ("to", &self.to),
            ("link", &self.link),
            ("text", &self.text),
            ("sig", &self.signature),
            ("nonce", &self.nonce),
        ];
        for (name, field) in optional {
            if matches!(field, Some(v) if v.is_empty()) {
                return Err(Error::Validation(format!("{name} must not be empty")));
            }
        }
        if let Some(text) = &self.text {
            if text.chars().count() > MAX_TEXT_CHARS {
                return Err(Error::Validation(format!(
                    "text exceeds {MAX_TEXT_CHARS} characters"
                )));
            }
        }
        if let Some(value) = &self.value {
            if value.currency != CURRENCY {
                return Err(Error::Validation(format!(
                    "unsupported currency {}",
                    value.currency
                )));
            }
            if value.amount.is_zero() {
                return Err(Error::Validation("amount must be positive".into()));
            }
        }
        if self.kind == Kind::Transfer && (self.value.is_none() || self.to.is_none()) {
            return Err(Error::Validation(
                "transfer requires a recipient and an amount".into(),
            ));
        }
        Ok(())
    }

    /// Full check, including the signature-presence rule.
    ///
    /// Does not verify the signature cryptographically; see [`crate::signer`].
    pub fn validate(&self) -> Result<()> {
        self.validate_fields()?;
        match (self.requires_signature(), self.signature.is_some()) {
            (true, false) => Err(Error::Validation(
                "value-bearing envelope is unsigned".into(),
            )),
            (false, true) => Err(Error::Validation(
                "signature present on an envelope without value".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Encode as a single `[BEACON v1]` line.
    pub fn encode(&self) -> String {
        let mut out = String::from(TAG);
        push_field(&mut out, "kind", self.kind.as_str());
        push_field(&mut out, "from", &self.from);
        if let Some(to) = &self.to {
            push_field(&mut out, "to", to);
        }
        if let Some(value) = &self.value {
            push_field(&mut out, "rtc", &value.amount.to_string());
        }
        if let Some(link) = &self.link {
            push_field(&mut out, "link", link);
        }
        if let Some(text) = &self.text {
            push_field(&mut out, "text", text);
        }
        if let Some(sig) = &self.signature {
            push_field(&mut out, "sig", sig);
        }
        if let Some(nonce) = &self.nonce {
            push_field(&mut out, "nonce", nonce);
        }
        if let Some(ts) = self.timestamp {
            push_field(&mut out, "ts", &ts.to_string());
        }
        out
    }

    /// Decode the first envelope found in `text`.
    pub fn decode(text: &str) -> Result<Self> {
        let Some(start) = text.find(TAG) else {
            return Err(missing_tag(text));
        };
        parse_fields(&text[start + TAG.len()..])
    }

    /// Decode every well-formed envelope embedded in `text`.
    pub fn decode_all(text: &str) -> Vec<Self> {
        text.match_indices(TAG)
            .filter_map(|(start, _)| match parse_fields(&text[start + TAG.len()..]) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping malformed embedded envelope");
                    None
                }
            })
            .collect()
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Envelope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

/// Random 12-hex-character token.
pub fn fresh_nonce() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ============================================================================
// Codec internals
// ============================================================================

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || c.is_control() || matches!(c, '=' | '%' | '[' | ']')
}

fn escape(value: &str) -> std::borrow::Cow<'_, str> {
    if value.chars().any(is_delimiter) {
        urlencoding::encode(value)
    } else {
        std::borrow::Cow::Borrowed(value)
    }
}

fn push_field(out: &mut String, key: &str, value: &str) {
    out.push(' ');
    out.push_str(key);
    out.push('=');
    out.push_str(&escape(value));
}

fn missing_tag(text: &str) -> Error {
    // A different version is reported with the tag it carried.
    if let Some(start) = text.find("[BEACON") {
        let rest = &text[start..];
        let token = match rest.find(']') {
            Some(end) => &rest[..=end],
            None => rest.split_whitespace().next().unwrap_or(rest),
        };
        return Error::decode(token, "unsupported envelope version");
    }
    let preview: String = text.chars().take(32).collect();
    Error::decode(preview, "missing [BEACON v1] tag")
}

fn parse_fields(after_tag: &str) -> Result<Envelope> {
    let line = after_tag.split(['\n', '\r']).next().unwrap_or("");

    let mut kind = None;
    let mut envelope = Envelope::new(Kind::Hello, String::new());
    let mut from = None;
    let mut seen = HashSet::new();

    for token in line.split_whitespace() {
        let Some((key, raw)) = token.split_once('=') else {
            break;
        };
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            break;
        }

        let known = matches!(
            key,
            "kind" | "from" | "to" | "rtc" | "link" | "text" | "sig" | "nonce" | "ts"
        );
        if !known {
            continue;
        }
        if !seen.insert(key) {
            return Err(Error::decode(token, "duplicate key"));
        }
        if raw.is_empty() {
            return Err(Error::decode(token, "empty value"));
        }
        let value = urlencoding::decode(raw)
            .map_err(|_| Error::decode(token, "invalid percent-encoding"))?
            .into_owned();

        match key {
            "kind" => kind = Some(value.parse::<Kind>()?),
            "from" => from = Some(value),
            "to" => envelope.to = Some(value),
            "rtc" => envelope.value = Some(Value::rtc(value.parse()?)),
            "link" => envelope.link = Some(value),
            "text" => envelope.text = Some(value),
            "sig" => envelope.signature = Some(value),
            "nonce" => envelope.nonce = Some(value),
            "ts" => {
                envelope.timestamp = Some(
                    value
                        .parse()
                        .map_err(|_| Error::decode(token, "timestamp must be an integer"))?,
                )
            }
            _ => unreachable!("filtered by `known`"),
        }
    }

    envelope.kind = kind.ok_or_else(|| Error::decode(TAG, "missing kind"))?;
    envelope.from = from.ok_or_else(|| Error::decode(TAG, "missing from"))?;
    Ok(envelope)
}
