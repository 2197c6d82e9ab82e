//! Radio transport abstraction.
//!
//! The core never talks to a BLE stack directly. It issues requests through
//! [`Transport`] and [`GattLink`], and learns about their completion through
//! [`TransportEvent`]s delivered on an mpsc channel. A request returning `Ok`
//! only means it was submitted; the outcome arrives later as an event.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::advertising::{Advertisement, ScanRequest};
use crate::error::Result;

/// Sender half handed to transports for reporting events.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half consumed by the [`DeviceManager`](crate::DeviceManager).
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the channel connecting a transport to the core.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Reference to a characteristic resolved during service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    /// UUID of the owning service.
    pub service_uuid: Uuid,
    /// UUID of the characteristic.
    pub uuid: Uuid,
    /// UUIDs of the characteristic's descriptors.
    pub descriptors: Vec<Uuid>,
}

impl CharacteristicRef {
    /// Check if the characteristic carries a descriptor.
    pub fn has_descriptor(&self, uuid: &Uuid) -> bool {
        self.descriptors.contains(uuid)
    }
}

/// A discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// UUID of the service.
    pub uuid: Uuid,
    /// Characteristics of the service.
    pub characteristics: Vec<CharacteristicRef>,
}

impl GattService {
    /// Find a characteristic by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicRef> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Asynchronous completions and unsolicited reports from the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An advertisement was received while scanning.
    Advertisement(Advertisement),
    /// The radio reported a scan failure.
    ScanFailed {
        /// Description of the failure.
        reason: String,
    },
    /// A link finished connecting.
    Connected {
        /// Address of the peripheral.
        address: String,
    },
    /// A link was lost or closed.
    Disconnected {
        /// Address of the peripheral.
        address: String,
    },
    /// Service discovery completed.
    ServicesDiscovered {
        /// Address of the peripheral.
        address: String,
        /// Services exposed by the peripheral.
        services: Vec<GattService>,
    },
    /// Service discovery failed.
    DiscoveryFailed {
        /// Address of the peripheral.
        address: String,
        /// Description of the failure.
        reason: String,
    },
    /// A characteristic value was pushed by the peripheral.
    Notification {
        /// Address of the peripheral.
        address: String,
        /// UUID of the notifying characteristic.
        characteristic: Uuid,
        /// The notified value.
        value: Vec<u8>,
    },
    /// A characteristic write was acknowledged.
    WriteComplete {
        /// Address of the peripheral.
        address: String,
        /// UUID of the written characteristic.
        characteristic: Uuid,
    },
}

/// Adapter-level radio operations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start scanning. Matching advertisements arrive as
    /// [`TransportEvent::Advertisement`].
    async fn start_scan(&self, request: &ScanRequest) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Create a link handle for a peripheral. No radio activity happens until
    /// [`GattLink::connect`] is called.
    async fn open(&self, address: &str) -> Result<Arc<dyn GattLink>>;
}

/// Operations on one peripheral link.
///
/// Only one write may be outstanding at a time; pacing is the caller's job.
#[async_trait]
pub trait GattLink: Send + Sync + std::fmt::Debug {
    /// Address of the peripheral.
    fn address(&self) -> &str;

    /// Advertised name of the peripheral, if known.
    fn name(&self) -> Option<String>;

    /// Begin connecting. Completion arrives as [`TransportEvent::Connected`]
    /// or [`TransportEvent::Disconnected`].
    async fn connect(&self) -> Result<()>;

    /// Begin service discovery. Completion arrives as
    /// [`TransportEvent::ServicesDiscovered`] or [`TransportEvent::DiscoveryFailed`].
    async fn discover_services(&self) -> Result<()>;

    /// Enable or disable local delivery of notifications for a characteristic.
    async fn set_notify(&self, characteristic: &CharacteristicRef, enabled: bool) -> Result<()>;

    /// Write a descriptor value.
    async fn write_descriptor(
        &self,
        characteristic: &CharacteristicRef,
        descriptor: &Uuid,
        value: &[u8],
    ) -> Result<()>;

    /// Write a characteristic value with response. The acknowledgment
    /// arrives as [`TransportEvent::WriteComplete`].
    async fn write(&self, characteristic: &CharacteristicRef, payload: &[u8]) -> Result<()>;

    /// Request a disconnect. Completion arrives as [`TransportEvent::Disconnected`].
    async fn disconnect(&self) -> Result<()>;

    /// Release the handle. No further events are reported for it.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;

    #[test]
    fn test_find_characteristic() {
        let service = GattService {
            uuid: MOTOR_SERVICE_UUID,
            characteristics: vec![CharacteristicRef {
                service_uuid: MOTOR_SERVICE_UUID,
                uuid: TELEMETRY_CHARACTERISTIC_UUID,
                descriptors: vec![CCCD_UUID],
            }],
        };

        let telemetry = service.characteristic(&TELEMETRY_CHARACTERISTIC_UUID).unwrap();
        assert!(telemetry.has_descriptor(&CCCD_UUID));
        assert!(service.characteristic(&COMMAND_CHARACTERISTIC_UUID).is_none());
    }
}
