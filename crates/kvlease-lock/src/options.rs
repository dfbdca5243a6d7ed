//! Lock configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use kvlease_common::{DEFAULT_LOCK_TTL_MS, KvError, Result};

/// Default pause between acquire attempts
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 3_000;

/// Shortest allowed renewal period
pub const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);

/// Shortest accepted TTL; leaves room for three heartbeats at the minimum period
pub const MIN_TTL: Duration = Duration::from_millis(3 * MIN_RENEW_PERIOD.as_millis() as u64);

/// Upper bound for the best-effort release issued when the caller cancels while
/// holding the lock
pub const RELEASE_ON_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-handle lock options
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease lifetime; renewed every `ttl / 3`
    pub ttl: Duration,
    /// Holder identity stored as the item value
    pub value: Vec<u8>,
    /// Fires to stop renewing without releasing; the lease then lapses
    pub renew_lock: Option<CancellationToken>,
    /// Pause between acquire attempts while another holder is live
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(DEFAULT_LOCK_TTL_MS),
            value: Vec::new(),
            renew_lock: None,
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
        }
    }
}

impl LockOptions {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_renew_lock(mut self, renew_lock: CancellationToken) -> Self {
        self.renew_lock = Some(renew_lock);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl < MIN_TTL {
            return Err(KvError::InvalidConfiguration(format!(
                "lock ttl must be at least {}ms",
                MIN_TTL.as_millis()
            )));
        }
        if self.retry_interval.is_zero() {
            return Err(KvError::InvalidConfiguration(
                "lock retry interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Heartbeat period: a third of the TTL, never below `MIN_RENEW_PERIOD`
    pub fn renew_period(&self) -> Duration {
        (self.ttl / 3).max(MIN_RENEW_PERIOD)
    }
}

/// Serializable lock settings as found in configuration files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub ttl_ms: u64,
    pub retry_interval_ms: u64,
    /// Holder value; empty means "derive one from the process"
    pub holder: String,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_LOCK_TTL_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            holder: String::new(),
        }
    }
}

impl LockSettings {
    pub fn to_options(&self) -> LockOptions {
        LockOptions {
            ttl: Duration::from_millis(self.ttl_ms),
            value: self.holder.clone().into_bytes(),
            renew_lock: None,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }
}

impl From<&LockSettings> for LockOptions {
    fn from(settings: &LockSettings) -> Self {
        settings.to_options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = LockOptions::default();
        assert_eq!(options.ttl, Duration::from_secs(20));
        assert_eq!(options.retry_interval, Duration::from_secs(3));
        assert!(options.renew_lock.is_none());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_renew_period() {
        let options = LockOptions::default();
        assert_eq!(options.renew_period(), Duration::from_nanos(6_666_666_666));

        let shortest = LockOptions::default().with_ttl(MIN_TTL);
        assert!(shortest.validate().is_ok());
        assert_eq!(shortest.renew_period(), MIN_RENEW_PERIOD);
    }

    #[test]
    fn test_ttl_below_renew_floor_rejected() {
        for ttl in [Duration::from_millis(5), Duration::from_millis(12), Duration::from_millis(29)] {
            let err = LockOptions::default().with_ttl(ttl).validate().unwrap_err();
            assert_eq!(
                err.to_string(),
                "invalid configuration: lock ttl must be at least 30ms"
            );
        }
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let err = LockOptions::default()
            .with_ttl(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, KvError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_settings_conversion() {
        let settings: LockSettings =
            serde_json::from_str(r#"{"ttl_ms": 9000, "holder": "node-1"}"#).unwrap();
        assert_eq!(settings.retry_interval_ms, DEFAULT_RETRY_INTERVAL_MS);

        let options = LockOptions::from(&settings);
        assert_eq!(options.ttl, Duration::from_secs(9));
        assert_eq!(options.value, b"node-1");
        assert_eq!(options.renew_period(), Duration::from_secs(3));
    }
}
