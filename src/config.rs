use crate::core::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Debounce windows per trigger group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Tab switches and other navigation triggers.
    pub navigation_ms: u64,
    /// App returning to foreground.
    pub foreground_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            navigation_ms: 150,
            foreground_ms: 150,
        }
    }
}

/// Resubscription behavior of the real-time reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before the reconciler gives up.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
    /// Connection time after which a session counts as healthy even without
    /// live changes. Healthy sessions reset the failure count.
    pub stable_after_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 250,
            max_backoff_ms: 30_000,
            stable_after_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    /// Exponential backoff for the given 1-based attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base.saturating_mul(factor).min(max))
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }
}

/// Engine configuration
///
/// All durations are tunable defaults, not correctness constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub debounce: DebounceConfig,

    /// Minimum spacing of expensive validation passes.
    pub validation_interval_ms: u64,

    pub reconnect: ReconnectPolicy,

    /// Identical create requests inside this window are rejected.
    pub duplicate_window_ms: u64,

    /// How long a committed record survives authoritative snapshots that lack it.
    pub commit_grace_ms: u64,

    /// Finalized ledger entries kept for inspection.
    pub audit_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: DebounceConfig::default(),
            validation_interval_ms: 2_500,
            reconnect: ReconnectPolicy::default(),
            duplicate_window_ms: 2_000,
            commit_grace_ms: 5_000,
            audit_capacity: 32,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from JSON; missing keys fall back to defaults.
    ///
    /// # Examples
    ///
    /// ```
    /// # use shigodeki_sync::SyncConfig;
    /// let config = SyncConfig::from_json_str(r#"{"validation_interval_ms": 3000}"#).unwrap();
    /// assert_eq!(config.validation_interval_ms, 3000);
    /// assert_eq!(config.debounce.navigation_ms, 150);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn navigation_debounce(mut self, window: Duration) -> Self {
        self.debounce.navigation_ms = window.as_millis() as u64;
        self
    }

    pub fn foreground_debounce(mut self, window: Duration) -> Self {
        self.debounce.foreground_ms = window.as_millis() as u64;
        self
    }

    pub fn validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn duplicate_window(mut self, window: Duration) -> Self {
        self.duplicate_window_ms = window.as_millis() as u64;
        self
    }

    pub fn commit_grace(mut self, grace: Duration) -> Self {
        self.commit_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn audit_capacity(mut self, capacity: usize) -> Self {
        self.audit_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconnect.max_attempts == 0 {
            return Err(SyncError::Config(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms {
            return Err(SyncError::Config(format!(
                "reconnect.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.reconnect.initial_backoff_ms, self.reconnect.max_backoff_ms
            )));
        }
        if self.audit_capacity == 0 {
            return Err(SyncError::Config("audit_capacity must be positive".to_string()));
        }
        if self.validation_interval_ms == 0 {
            return Err(SyncError::Config(
                "validation_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn duplicate_window_duration(&self) -> Duration {
        Duration::from_millis(self.duplicate_window_ms)
    }

    pub fn commit_grace_duration(&self) -> Duration {
        Duration::from_millis(self.commit_grace_ms)
    }

    pub fn validation_interval_duration(&self) -> Duration {
        Duration::from_millis(self.validation_interval_ms)
    }
}
