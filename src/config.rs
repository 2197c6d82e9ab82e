//! Link configuration.
//!
//! Values supplied by the application's settings store. Persisting them is the
//! application's concern; this crate only consumes them.

use std::time::Duration;

use crate::ble::advertising::DeviceId;
use crate::ble::uuids::DEFAULT_COMPANY_ID;
use crate::error::{Error, Result};

/// Radio scan duty cycle.
///
/// Not every platform can honour every mode; unsupported modes fall back to
/// the platform default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanMode {
    /// Lowest power, longest discovery latency.
    LowPower,
    /// Balance between power and latency.
    Balanced,
    /// Highest duty cycle.
    #[default]
    LowLatency,
    /// Only receive results of scans started by others.
    Opportunistic,
}

/// Configuration consumed by the [`DeviceManager`](crate::DeviceManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkConfig {
    /// Reconnect automatically after an unexpected link loss.
    pub auto_reconnect: bool,
    /// Company ID under which the device identifier is advertised.
    pub company_id: u16,
    /// Device identifier of the last connected unit.
    pub last_device_id: Option<DeviceId>,
    /// Total time a reconnect attempt may scan.
    pub reconnect_timeout: Duration,
    /// Interval between reconnect match polls.
    pub reconnect_retry_interval: Duration,
    /// Radio scan mode.
    pub scan_mode: ScanMode,
    /// Interval between stale-sighting cleanup passes.
    pub cleanup_interval: Duration,
    /// Age after which a sighting is considered stale.
    pub stale_after: Duration,
    /// Restrict normal scans to the motor service.
    pub filter_scan_by_service: bool,
    /// Maximum wait for a write acknowledgment.
    pub ack_timeout: Duration,
    /// Delay after link loss before reconnect scanning starts.
    pub reconnect_settle_delay: Duration,
}

impl LinkConfig {
    /// Default reconnect timeout (20 seconds).
    pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_millis(20_000);
    /// Default reconnect retry interval (500 ms).
    pub const DEFAULT_RECONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
    /// Default cleanup interval (5 seconds).
    pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_millis(5_000);
    /// Default staleness threshold (10 seconds).
    pub const DEFAULT_STALE_AFTER: Duration = Duration::from_millis(10_000);
    /// Default write acknowledgment timeout (2 seconds).
    pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(2_000);
    /// Default settle delay before reconnecting (500 ms).
    pub const DEFAULT_RECONNECT_SETTLE_DELAY: Duration = Duration::from_millis(500);

    /// Check that every interval and timeout is non-zero.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("reconnect_timeout", self.reconnect_timeout),
            ("reconnect_retry_interval", self.reconnect_retry_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("stale_after", self.stale_after),
            ("ack_timeout", self.ack_timeout),
        ];

        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::InvalidParameter {
                    name: name.to_string(),
                    value: format!("{:?}", value),
                });
            }
        }

        Ok(())
    }

    /// Whether a link loss should trigger a reconnect attempt.
    pub fn can_reconnect(&self) -> bool {
        self.auto_reconnect && self.last_device_id.is_some()
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            company_id: DEFAULT_COMPANY_ID,
            last_device_id: None,
            reconnect_timeout: Self::DEFAULT_RECONNECT_TIMEOUT,
            reconnect_retry_interval: Self::DEFAULT_RECONNECT_RETRY_INTERVAL,
            scan_mode: ScanMode::default(),
            cleanup_interval: Self::DEFAULT_CLEANUP_INTERVAL,
            stale_after: Self::DEFAULT_STALE_AFTER,
            filter_scan_by_service: true,
            ack_timeout: Self::DEFAULT_ACK_TIMEOUT,
            reconnect_settle_delay: Self::DEFAULT_RECONNECT_SETTLE_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert!(config.auto_reconnect);
        assert_eq!(config.company_id, 0x706D);
        assert_eq!(config.reconnect_timeout, Duration::from_secs(20));
        assert_eq!(config.reconnect_retry_interval, Duration::from_millis(500));
        assert_eq!(config.cleanup_interval, Duration::from_secs(5));
        assert_eq!(config.stale_after, Duration::from_secs(10));
        assert_eq!(config.ack_timeout, Duration::from_secs(2));
        assert_eq!(config.scan_mode, ScanMode::LowLatency);
        assert!(config.filter_scan_by_service);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = LinkConfig {
            cleanup_interval: Duration::ZERO,
            ..LinkConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidParameter { ref name, .. }) if name == "cleanup_interval"
        ));
    }

    #[test]
    fn test_can_reconnect() {
        let mut config = LinkConfig::default();
        assert!(!config.can_reconnect());

        config.last_device_id = Some(DeviceId::new([1, 2, 3, 4, 5, 6]));
        assert!(config.can_reconnect());

        config.auto_reconnect = false;
        assert!(!config.can_reconnect());
    }
}
