//! Configuration for Beacon.
//!
//! A single JSON file at `~/.beacon/config.json`. Every section enumerates the
//! options it recognizes and rejects anything else, so a typo in a key is a
//! load error instead of a silently ignored setting.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (BEACON_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `BEACON_DATA_DIR` → data_dir
//! - `BEACON_LOG_LEVEL` → observability.log_level
//! - `BEACON_DISCORD_WEBHOOK` → discord.webhook_url
//! - `BEACON_UDP_PORT` → udp.port

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default UDP port for LAN beacons.
pub const DEFAULT_UDP_PORT: u16 = 38400;

/// Get the default data directory (`~/.beacon`).
pub fn default_data_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".beacon"),
        |dirs| dirs.home_dir().join(".beacon"),
    )
}

/// Get the default configuration file path.
pub fn config_path() -> PathBuf {
    default_data_dir().join("config.json")
}

// ============================================================================
// HTTP policy
// ============================================================================

/// Retry/timeout policy for one HTTP transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpPolicyConfig {
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,

    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in seconds (doubles every attempt).
    #[serde(default = "default_base_delay_s")]
    pub base_delay_s: f64,

    /// Cap for a single backoff sleep, in seconds.
    #[serde(default = "default_max_delay_s")]
    pub max_delay_s: f64,
}

impl Default for HttpPolicyConfig {
    fn default() -> Self {
        Self {
            timeout_s: default_timeout_s(),
            max_attempts: default_max_attempts(),
            base_delay_s: default_base_delay_s(),
            max_delay_s: default_max_delay_s(),
        }
    }
}

/// Upper bound for `base_delay_s` and `max_delay_s` (one day).
pub const MAX_RETRY_DELAY_S: f64 = 86_400.0;

/// Upper bound for the mesh dedup TTL and clock skew, in seconds.
pub const MAX_UDP_WINDOW_S: u64 = 604_800;

fn default_timeout_s() -> u64 {
    20
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_s() -> f64 {
    1.0
}

fn default_max_delay_s() -> f64 {
    60.0
}

// ============================================================================
// Platform sections
// ============================================================================

/// BoTTube (video tipping platform).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BottubeConfig {
    #[serde(default = "default_bottube_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub http: HttpPolicyConfig,
}

impl Default for BottubeConfig {
    fn default() -> Self {
        Self {
            base_url: default_bottube_url(),
            api_key: None,
            http: HttpPolicyConfig::default(),
        }
    }
}

fn default_bottube_url() -> String {
    "https://bottube.ai".into()
}

/// ClawNews (link and bounty board).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClawNewsConfig {
    #[serde(default = "default_clawnews_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Seconds between feed polls while listening.
    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: u64,

    #[serde(default)]
    pub http: HttpPolicyConfig,
}

impl Default for ClawNewsConfig {
    fn default() -> Self {
        Self {
            base_url: default_clawnews_url(),
            api_key: None,
            poll_interval_s: default_poll_interval_s(),
            http: HttpPolicyConfig::default(),
        }
    }
}

fn default_clawnews_url() -> String {
    "https://clawnews.io".into()
}

fn default_poll_interval_s() -> u64 {
    30
}

/// RustChain (RTC value-transfer ledger).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RustChainConfig {
    #[serde(default = "default_rustchain_url")]
    pub base_url: String,

    #[serde(default)]
    pub http: HttpPolicyConfig,
}

impl Default for RustChainConfig {
    fn default() -> Self {
        Self {
            base_url: default_rustchain_url(),
            http: HttpPolicyConfig::default(),
        }
    }
}

fn default_rustchain_url() -> String {
    "https://rustchain.org".into()
}

/// Discord: a webhook for posting, a bot token for posting and reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default)]
    pub bot_token: Option<String>,

    /// Channel read by the bot path and used for bot-token posting.
    #[serde(default)]
    pub channel_id: Option<String>,

    #[serde(default = "default_discord_api")]
    pub api_base: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub avatar_url: Option<String>,

    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: u64,

    #[serde(default)]
    pub http: HttpPolicyConfig,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            bot_token: None,
            channel_id: None,
            api_base: default_discord_api(),
            username: None,
            avatar_url: None,
            poll_interval_s: default_poll_interval_s(),
            http: HttpPolicyConfig::default(),
        }
    }
}

fn default_discord_api() -> String {
    "https://discord.com/api/v10".into()
}

/// LAN broadcast transport and mesh listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UdpConfig {
    /// Mirror every dispatched action as a UDP `event` beacon.
    #[serde(default)]
    pub enabled: bool,

    /// Destination for outgoing datagrams.
    #[serde(default = "default_udp_host")]
    pub host: String,

    #[serde(default = "default_udp_port")]
    pub port: u16,

    /// Set SO_BROADCAST on the sending socket.
    #[serde(default = "default_true")]
    pub broadcast: bool,

    /// Dedup window for `(from, nonce)` pairs, in seconds.
    #[serde(default = "default_udp_ttl")]
    pub ttl: u64,

    /// How far ahead of the local clock an envelope `ts` may be, in seconds.
    #[serde(default = "default_udp_max_skew")]
    pub max_skew_s: u64,

    /// Address the mesh listener binds to.
    #[serde(default = "default_udp_bind")]
    pub bind_host: String,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_udp_host(),
            port: default_udp_port(),
            broadcast: true,
            ttl: default_udp_ttl(),
            max_skew_s: default_udp_max_skew(),
            bind_host: default_udp_bind(),
        }
    }
}

fn default_udp_host() -> String {
    "255.255.255.255".into()
}

fn default_udp_port() -> u16 {
    DEFAULT_UDP_PORT
}

fn default_udp_ttl() -> u64 {
    600
}

fn default_udp_max_skew() -> u64 {
    300
}

fn default_udp_bind() -> String {
    "0.0.0.0".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Core sections
// ============================================================================

/// Override for one `(platform, action)` minimum interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitRule {
    pub platform: String,
    /// Envelope kind, or `*` for every kind on the platform.
    pub action: String,
    pub min_interval_s: u64,
}

/// Dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    /// Overall deadline for one delivery, retries included.
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_s: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_s: default_dispatch_timeout(),
        }
    }
}

fn default_dispatch_timeout() -> u64 {
    120
}

/// Inbox retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboxConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

fn default_retention_days() -> u64 {
    30
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration.
///
/// A platform whose section is absent is not configured; dispatching to it
/// fails with `UnknownTransport`. UDP is always available.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory for identity, inbox and rate-limit state.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub bottube: Option<BottubeConfig>,

    #[serde(default)]
    pub clawnews: Option<ClawNewsConfig>,

    #[serde(default)]
    pub rustchain: Option<RustChainConfig>,

    #[serde(default)]
    pub discord: Option<DiscordConfig>,

    #[serde(default)]
    pub udp: UdpConfig,

    /// Overrides merged over the built-in interval table.
    #[serde(default)]
    pub rate_limits: Vec<RateLimitRule>,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub inbox: InboxConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load, apply environment overrides, and validate.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("BEACON_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }

        if let Ok(level) = std::env::var("BEACON_LOG_LEVEL") {
            self.observability.log_level = level;
        }

        if let Ok(webhook) = std::env::var("BEACON_DISCORD_WEBHOOK") {
            self.discord
                .get_or_insert_with(DiscordConfig::default)
                .webhook_url = Some(webhook);
        }

        if let Ok(port) = std::env::var("BEACON_UDP_PORT") {
            if let Ok(p) = port.parse() {
                self.udp.port = p;
            }
        }
    }

    /// Reject values that deserialize but cannot work.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let policies = [
            ("bottube", self.bottube.as_ref().map(|c| &c.http)),
            ("clawnews", self.clawnews.as_ref().map(|c| &c.http)),
            ("rustchain", self.rustchain.as_ref().map(|c| &c.http)),
            ("discord", self.discord.as_ref().map(|c| &c.http)),
        ];
        for (name, policy) in policies {
            let Some(policy) = policy else { continue };
            if policy.max_attempts == 0 {
                problems.push(format!("{name}.http.max_attempts must be at least 1"));
            }
            if policy.timeout_s == 0 {
                problems.push(format!("{name}.http.timeout_s must be at least 1"));
            }
            if !policy.base_delay_s.is_finite()
                || !policy.max_delay_s.is_finite()
                || policy.base_delay_s < 0.0
                || policy.max_delay_s < policy.base_delay_s
                || policy.max_delay_s > MAX_RETRY_DELAY_S
            {
                problems.push(format!(
                    "{name}.http delays must satisfy 0 <= base_delay_s <= max_delay_s <= {MAX_RETRY_DELAY_S}"
                ));
            }
        }

        if let Some(discord) = &self.discord {
            if discord.webhook_url.is_none() && discord.bot_token.is_none() {
                problems.push("discord needs webhook_url or bot_token".to_string());
            }
            if discord.bot_token.is_some() && discord.channel_id.is_none() {
                problems.push("discord.bot_token requires discord.channel_id".to_string());
            }
        }

        if self.udp.port == 0 {
            problems.push("udp.port must be between 1 and 65535".to_string());
        }
        if self.udp.ttl == 0 || self.udp.ttl > MAX_UDP_WINDOW_S {
            problems.push(format!("udp.ttl must be between 1 and {MAX_UDP_WINDOW_S}"));
        }
        if self.udp.max_skew_s > MAX_UDP_WINDOW_S {
            problems.push(format!("udp.max_skew_s must be at most {MAX_UDP_WINDOW_S}"));
        }
        if self.dispatch.timeout_s == 0 {
            problems.push("dispatch.timeout_s must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration: {}", problems.join("; "))
        }
    }

    /// Effective data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}
