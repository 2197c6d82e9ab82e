//! Auto-reconnect parameters and matching.
//!
//! After an unexpected link loss the same unit is searched for by its
//! manufacturer-data device identifier, polling the discovery registry until
//! it shows up or the deadline passes.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::advertising::{DeviceId, ScanRequest};
use crate::ble::registry::{DiscoveryRegistry, Sighting};
use crate::config::{LinkConfig, ScanMode};
use crate::error::Result;

/// One reconnect cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPlan {
    /// Identifier of the unit to find.
    pub device_id: DeviceId,
    /// Company ID the identifier is advertised under.
    pub company_id: u16,
    /// Service the unit must advertise.
    pub service: Uuid,
    /// Total time to search.
    pub timeout: Duration,
    /// Interval between registry polls.
    pub retry_interval: Duration,
    /// Radio scan mode.
    pub mode: ScanMode,
}

impl ReconnectPlan {
    /// Build a plan from raw identifier bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDeviceId`](crate::Error::InvalidDeviceId) unless `device_id` is exactly 6 bytes.
    pub fn new(device_id: &[u8], service: Uuid, config: &LinkConfig) -> Result<Self> {
        let device_id = DeviceId::try_from(device_id)?;
        Ok(Self::for_device(device_id, service, config))
    }

    /// Build a plan for a known identifier.
    pub fn for_device(device_id: DeviceId, service: Uuid, config: &LinkConfig) -> Self {
        Self {
            device_id,
            company_id: config.company_id,
            service,
            timeout: config.reconnect_timeout,
            retry_interval: config.reconnect_retry_interval,
            mode: config.scan_mode,
        }
    }

    /// Scan restricted to this unit: exact identifier match and service.
    pub fn scan_request(&self) -> ScanRequest {
        ScanRequest::for_device(self.service, self.company_id, &self.device_id, self.mode)
    }
}

/// Progress of a reconnect cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ReconnectEvent {
    /// Scanning for the unit started.
    Started {
        /// Identifier searched for.
        device_id: DeviceId,
    },
    /// The unit was found and a connect was issued.
    Matched {
        /// Address of the matched peripheral.
        address: String,
    },
    /// The deadline passed without a match.
    TimedOut {
        /// Identifier searched for.
        device_id: DeviceId,
    },
    /// The cycle was cancelled by a manual connect, disconnect or scan.
    Cancelled,
}

/// Poll `registry` until the planned unit appears or the timeout elapses.
///
/// Checks immediately, then every `retry_interval`. Returns `None` once
/// `timeout` has elapsed since the call without a match.
pub async fn poll_for_match(registry: &DiscoveryRegistry, plan: &ReconnectPlan) -> Option<Sighting> {
    let start = Instant::now();

    while start.elapsed() < plan.timeout {
        if let Some(sighting) = registry.find_device(&plan.device_id) {
            debug!(
                "Reconnect match for {} at {} after {:?}",
                plan.device_id,
                sighting.address,
                start.elapsed()
            );
            return Some(sighting);
        }

        trace!("No reconnect match for {} yet", plan.device_id);
        let remaining = plan.timeout.saturating_sub(start.elapsed());
        tokio::time::sleep(plan.retry_interval.min(remaining)).await;
    }

    None
}
