//! Fixed-window attempt counter.
//!
//! Windows are keyed by identity and action (for example `login` plus an
//! account email) so a flood against one account leaves others untouched.
//! A window opens on the first attempt and is discarded once its duration
//! has elapsed.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_attempts: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            window: Duration::milliseconds(60_000),
        }
    }
}

/// What identifies the attempting party in a login window key.
///
/// `Account` alone is open to one client spraying many accounts;
/// `AccountAndClient` needs a trustworthy client address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RateKeyMode {
    #[default]
    Account,
    #[value(name = "account_and_client")]
    AccountAndClient,
}

/// Composite key for a rate window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey(String);

impl RateKey {
    pub fn new(action: &str, identity: &str) -> Self {
        Self(format!("{action}:{identity}"))
    }

    /// Key that also pins the attempting client, when one is known.
    pub fn with_client(action: &str, identity: &str, client: Option<&str>) -> Self {
        match client {
            Some(client) => Self(format!("{action}:{identity}|{client}")),
            None => Self::new(action, identity),
        }
    }

    /// Key for a login attempt under the given mode.
    pub fn login(mode: RateKeyMode, email: &str, client: Option<&str>) -> Self {
        match mode {
            RateKeyMode::Account => Self::new("login", email),
            RateKeyMode::AccountAndClient => Self::with_client("login", email, client),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start: DateTime<Utc>,
    count: u32,
}

/// Outcome of consulting a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateDecision {
    /// Whole seconds until the window resets, at least 1.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let ms = (self.reset_at - now).num_milliseconds().max(0) as u64;
        ms.div_ceil(1000).max(1)
    }
}

pub struct FixedWindowLimiter {
    windows: DashMap<RateKey, RateWindow>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            config,
            clock,
        }
    }

    fn decision(&self, window: Option<RateWindow>, now: DateTime<Utc>) -> RateDecision {
        match window {
            Some(w) if now < w.window_start + self.config.window => RateDecision {
                allowed: w.count < self.config.max_attempts,
                remaining: self.config.max_attempts.saturating_sub(w.count),
                reset_at: w.window_start + self.config.window,
            },
            _ => RateDecision {
                allowed: true,
                remaining: self.config.max_attempts,
                reset_at: now + self.config.window,
            },
        }
    }

    /// Count an attempt and report whether it fits in the current window.
    pub fn attempt(&self, key: &RateKey) -> RateDecision {
        let now = self.clock.now();
        let window = self.bump(key, now);
        RateDecision {
            allowed: window.count <= self.config.max_attempts,
            remaining: self.config.max_attempts.saturating_sub(window.count),
            reset_at: window.window_start + self.config.window,
        }
    }

    /// Report whether another attempt would be allowed, without counting one.
    pub fn peek(&self, key: &RateKey) -> RateDecision {
        let now = self.clock.now();
        let window = self.windows.get(key).map(|w| *w);
        self.decision(window, now)
    }

    /// Give back one attempt in the live window for `key`.
    pub fn refund(&self, key: &RateKey) {
        let now = self.clock.now();
        if let Some(mut window) = self.windows.get_mut(key) {
            if now < window.window_start + self.config.window {
                window.count = window.count.saturating_sub(1);
            }
        }
    }

    /// Drop the window for `key`.
    pub fn reset(&self, key: &RateKey) {
        self.windows.remove(key);
    }

    fn bump(&self, key: &RateKey, now: DateTime<Utc>) -> RateWindow {
        let mut entry = self.windows.entry(key.clone()).or_insert(RateWindow {
            window_start: now,
            count: 0,
        });
        if now >= entry.window_start + self.config.window {
            entry.window_start = now;
            entry.count = 0;
        }
        entry.count = entry.count.saturating_add(1);
        *entry
    }

    /// Remove windows whose duration has elapsed. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now < w.window_start + self.config.window);
        let purged = before.saturating_sub(self.windows.len());
        if purged > 0 {
            debug!(purged, "Purged elapsed rate windows");
        }
        purged
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }

    /// Periodically purge elapsed windows, once per window length.
    pub fn start_purge_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self
            .config
            .window
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(60))
            .max(std::time::Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.purge_expired();
            }
        })
    }
}
