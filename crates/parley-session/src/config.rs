//! Session timing, loaded from environment variables.

use std::time::Duration;

use parley_shared::constants::DEFAULT_UNANSWERED_TIMEOUT_MS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long an outgoing call rings before it is marked `not-answered`.
    /// Env: `PARLEY_UNANSWERED_TIMEOUT_MS`
    /// Default: 30 000 ms
    pub unanswered_timeout: Duration,

    /// Ringing records older than this are abandoned and never surfaced.
    /// Env: `PARLEY_STALE_RINGING_MS`
    /// Default: twice the unanswered timeout
    pub stale_ringing_after: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::with_timeout(Duration::from_millis(DEFAULT_UNANSWERED_TIMEOUT_MS))
    }
}

impl SessionConfig {
    pub fn with_timeout(unanswered_timeout: Duration) -> Self {
        Self {
            unanswered_timeout,
            stale_ringing_after: unanswered_timeout * 2,
        }
    }

    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = var("PARLEY_UNANSWERED_TIMEOUT_MS") {
            match parse_millis(&raw) {
                Some(timeout) => config = Self::with_timeout(timeout),
                None => tracing::warn!(value = %raw, "Invalid PARLEY_UNANSWERED_TIMEOUT_MS, using default"),
            }
        }

        if let Some(raw) = var("PARLEY_STALE_RINGING_MS") {
            match parse_millis(&raw) {
                Some(after) => config.stale_ringing_after = after,
                None => tracing::warn!(value = %raw, "Invalid PARLEY_STALE_RINGING_MS, using default"),
            }
        }

        config
    }

    pub(crate) fn stale_ringing_age(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_ringing_after).unwrap_or_else(|_| chrono::Duration::weeks(52))
    }
}

fn parse_millis(raw: &str) -> Option<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => None,
    }
}
