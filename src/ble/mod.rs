//! BLE communication module.
//!
//! This module provides the radio abstraction and the pieces of the link
//! engine built on it: discovery registry, command queue, connection
//! bookkeeping and auto-reconnect matching.

pub mod advertising;
pub mod btleplug;
pub mod connection;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub mod transport;
pub mod uuids;

pub use advertising::{Advertisement, DeviceId, ManufacturerFilter, ScanRequest};
pub use self::btleplug::{BtleplugLink, BtleplugTransport};
pub use connection::{ConnectionEvent, ConnectionState, ConnectionSummary, MotorCharacteristics};
pub use queue::{CommandQueue, LinkSlot, QueuedOperation};
pub use reconnect::{ReconnectEvent, ReconnectPlan};
pub use registry::{DiscoveryRegistry, Sighting};
pub use transport::{
    event_channel, CharacteristicRef, EventReceiver, EventSender, GattLink, GattService,
    Transport, TransportEvent,
};
pub use uuids::*;
