use std::time::Duration;

use serde::Deserialize;

const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_RECOVERY_BACKOFF_MS: u64 = 5000;
const DEFAULT_PUBLISH_ATTEMPTS: u32 = 2;

/// RPC client configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker connection endpoint
    pub endpoint: String,
    /// Consumer loop pause between two delivery rounds
    pub poll_interval_ms: u64,
    /// Consumer loop pause after an unexpected error or a failed reconnect
    pub recovery_backoff_ms: u64,
    /// Publish attempts, including the first one. Each retry follows a reconnect
    pub publish_attempts: u32,
    /// Remove request slots of timed out calls. Timed out slots are kept otherwise
    pub sweep_abandoned: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "memory://localhost".into(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            recovery_backoff_ms: DEFAULT_RECOVERY_BACKOFF_MS,
            publish_attempts: DEFAULT_PUBLISH_ATTEMPTS,
            sweep_abandoned: false,
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_owned(),
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = whole_millis(interval);
        self
    }

    pub fn with_recovery_backoff(mut self, backoff: Duration) -> Self {
        self.recovery_backoff_ms = whole_millis(backoff);
        self
    }

    pub fn with_sweep_abandoned(mut self, sweep: bool) -> Self {
        self.sweep_abandoned = sweep;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn recovery_backoff(&self) -> Duration {
        Duration::from_millis(self.recovery_backoff_ms)
    }

    /// Check config values
    pub fn validate(&self) -> crate::Result<()> {
        if self.endpoint.is_empty() {
            return Err(crate::Error::Config("empty broker endpoint".into()));
        }

        if self.poll_interval_ms == 0 {
            return Err(crate::Error::Config("poll interval must be positive".into()));
        }

        if self.recovery_backoff_ms == 0 {
            return Err(crate::Error::Config(
                "recovery backoff must be positive".into(),
            ));
        }

        if self.publish_attempts == 0 {
            return Err(crate::Error::Config(
                "at least one publish attempt is required".into(),
            ));
        }

        Ok(())
    }
}

/// Milliseconds rounded up, saturating at `u64::MAX`. Zero stays zero
pub(crate) fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}
