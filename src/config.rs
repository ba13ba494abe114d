//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::watch::ViewBindingConfig;

/// Tunables for [`crate::client::CacheClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Per-watch stream buffer. Slow watchers drop updates beyond this.
    pub watch_stream_capacity: usize,
    /// Delay between status polls (milliseconds).
    pub poll_interval_ms: u64,
    /// Maximum number of status polls before giving up.
    pub poll_max_attempts: u32,
    /// Collect unreachable entities after every reconciliation.
    pub gc_after_reconcile: bool,
    /// Upper bound on placeholder entities one optimistic patch may create.
    pub max_placeholders_per_mutation: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            watch_stream_capacity: 64,
            poll_interval_ms: 5_000,
            poll_max_attempts: 60,
            gc_after_reconcile: true,
            max_placeholders_per_mutation: 64,
        }
    }
}

impl CacheConfig {
    /// Parse from JSON; missing fields take their defaults. The result is validated.
    pub fn from_json_str(text: &str) -> Result<Self, ValidationError> {
        let cfg: Self = serde_json::from_str(text).map_err(|e| ValidationError::InvalidConfig { reason: e.to_string() })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject zero capacities, intervals, and limits.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.watch_stream_capacity == 0 {
            return Err(invalid("watch_stream_capacity must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be > 0"));
        }
        if self.poll_max_attempts == 0 {
            return Err(invalid("poll_max_attempts must be > 0"));
        }
        if self.max_placeholders_per_mutation == 0 {
            return Err(invalid("max_placeholders_per_mutation must be > 0"));
        }
        Ok(())
    }

    /// `poll_interval_ms` as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Watch stream settings derived from this config.
    #[must_use]
    pub fn view_binding(&self) -> ViewBindingConfig {
        ViewBindingConfig {
            stream_capacity: self.watch_stream_capacity,
            ..ViewBindingConfig::default()
        }
    }
}

fn invalid(reason: &str) -> ValidationError {
    ValidationError::InvalidConfig {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        CacheConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = CacheConfig::from_json_str(r#"{"poll_interval_ms": 250, "gc_after_reconcile": false}"#).unwrap();
        assert_eq!(cfg.poll_interval(), Duration::from_millis(250));
        assert!(!cfg.gc_after_reconcile);
        assert_eq!(cfg.poll_max_attempts, CacheConfig::default().poll_max_attempts);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(CacheConfig::from_json_str(r#"{"watch_stream_capacity": 0}"#).is_err());
        assert!(CacheConfig::from_json_str(r#"{"unknown": 1}"#).is_err());
        assert!(CacheConfig::from_json_str("not json").is_err());
    }
}
