//! Persistent per-(platform, action) rate-limit guard.
//!
//! Each pair has a minimum interval between invocations. The last invocation
//! time lives in a JSON file shared by every process on the machine, so a
//! restart cannot be used to skip the wait. Check and update happen under one
//! exclusive file lock; the new stamp is on disk before `allow` returns.

use crate::clock::{system_clock, Clock};
use crate::store::{self, FileLock};
use beacon_common::{Error, RateLimitRule, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default file name under the data directory.
pub const RATE_LIMITS_FILE: &str = "rate_limits.json";

/// Wildcard action matching every kind on a platform.
pub const ANY_ACTION: &str = "*";

/// Stamps are kept at least this long regardless of configured intervals.
const MIN_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of a guard check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied { retry_in: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Turn a denial into the matching error.
    pub fn into_result(self, platform: &str, action: &str) -> Result<()> {
        match self {
            Decision::Allowed => Ok(()),
            Decision::Denied { retry_in } => Err(Error::RateLimitedLocally {
                platform: platform.to_string(),
                action: action.to_string(),
                retry_in,
            }),
        }
    }
}

// ============================================================================
// Intervals
// ============================================================================

/// Minimum intervals by (platform, action).
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    intervals: HashMap<(String, String), Duration>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        let mut policy = Self::empty();
        policy.set("clawnews", "bounty", Duration::from_secs(30 * 60));
        policy.set("clawnews", "ad", Duration::from_secs(30 * 60));
        policy.set("bottube", "like", Duration::from_secs(10));
        policy.set("bottube", "follow", Duration::from_secs(60));
        policy.set("rustchain", "transfer", Duration::from_secs(5));
        policy.set("discord", ANY_ACTION, Duration::from_secs(2));
        policy.set("udp", ANY_ACTION, Duration::ZERO);
        policy
    }
}

impl RateLimitPolicy {
    pub fn empty() -> Self {
        Self {
            intervals: HashMap::new(),
        }
    }

    /// Defaults overlaid with configured rules.
    pub fn from_rules(rules: &[RateLimitRule]) -> Self {
        let mut policy = Self::default();
        for rule in rules {
            policy.set(&rule.platform, &rule.action, Duration::from_secs(rule.min_interval_s));
        }
        policy
    }

    pub fn set(&mut self, platform: &str, action: &str, interval: Duration) {
        self.intervals
            .insert((platform.to_string(), action.to_string()), interval);
    }

    /// Exact pair first, then the platform wildcard, else no limit.
    pub fn interval_for(&self, platform: &str, action: &str) -> Duration {
        let exact = (platform.to_string(), action.to_string());
        if let Some(interval) = self.intervals.get(&exact) {
            return *interval;
        }
        let wildcard = (platform.to_string(), ANY_ACTION.to_string());
        self.intervals.get(&wildcard).copied().unwrap_or(Duration::ZERO)
    }

    fn retention(&self) -> Duration {
        self.intervals
            .values()
            .copied()
            .max()
            .unwrap_or(Duration::ZERO)
            .max(MIN_RETENTION)
    }
}

// ============================================================================
// Guard
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct RateLimitState {
    #[serde(default)]
    last_invoked: BTreeMap<String, DateTime<Utc>>,
}

fn state_key(platform: &str, action: &str) -> String {
    format!("{platform}/{action}")
}

#[derive(Debug, Clone)]
pub struct RateLimitGuard {
    path: PathBuf,
    lock_path: PathBuf,
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
}

impl RateLimitGuard {
    pub fn new(data_dir: &Path, policy: RateLimitPolicy) -> Self {
        let path = data_dir.join(RATE_LIMITS_FILE);
        Self {
            lock_path: store::lock_path_for(&path),
            path,
            policy,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Check the pair and, when allowed, record now as its last invocation.
    pub fn allow(&self, platform: &str, action: &str) -> Result<Decision> {
        let interval = self.policy.interval_for(platform, action);
        let key = state_key(platform, action);

        let _lock = FileLock::acquire(&self.lock_path)?;
        let mut state: RateLimitState = store::read_json(&self.path)?;
        let now = self.clock.now();

        if let Some(last) = state.last_invoked.get(&key) {
            let elapsed = (now - *last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < interval {
                let retry_in = interval - elapsed;
                tracing::info!(
                    platform = %platform,
                    action = %action,
                    retry_in_s = retry_in.as_secs(),
                    "Rate limit guard denied action"
                );
                return Ok(Decision::Denied { retry_in });
            }
        }

        state.last_invoked.insert(key, now);
        if let Ok(retention) = chrono::Duration::from_std(self.policy.retention()) {
            state.last_invoked.retain(|_, at| now - *at <= retention);
        }
        store::write_json(&self.path, &state)?;

        tracing::debug!(platform = %platform, action = %action, "Rate limit guard allowed action");
        Ok(Decision::Allowed)
    }

    /// Last recorded invocation of a pair.
    pub fn last_invoked(&self, platform: &str, action: &str) -> Result<Option<DateTime<Utc>>> {
        let state: RateLimitState = store::read_json(&self.path)?;
        Ok(state.last_invoked.get(&state_key(platform, action)).copied())
    }

    /// Forget a pair so the next `allow` succeeds.
    pub fn reset(&self, platform: &str, action: &str) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let mut state: RateLimitState = store::read_json(&self.path)?;
        if state.last_invoked.remove(&state_key(platform, action)).is_some() {
            store::write_json(&self.path, &state)?;
        }
        Ok(())
    }
}
