//! Connection state machine types.
//!
//! A single logical link is tracked through
//! `Idle → Connecting → DiscoveringServices → Ready → Disconnecting → Idle`,
//! with `Reconnecting` entered only when a link is lost without the user
//! asking for it.

use tracing::debug;

use crate::ble::registry::Sighting;
use crate::ble::transport::{CharacteristicRef, GattService};
use crate::ble::uuids::*;
use crate::error::{Error, Result};

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No link.
    #[default]
    Idle,
    /// Link requested, waiting for the radio to connect.
    Connecting,
    /// Connected, waiting for service discovery.
    DiscoveringServices,
    /// Characteristics resolved, commands and telemetry available.
    Ready,
    /// User asked to disconnect, waiting for the radio.
    Disconnecting,
    /// Link lost unexpectedly, scanning for the same unit.
    Reconnecting,
}

impl ConnectionState {
    /// Check if the radio link is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::DiscoveringServices | Self::Ready)
    }

    /// Check if commands can be sent.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Disconnecting | Self::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Address of the session's peripheral, if any.
    pub address: Option<String>,
    /// The previous state.
    pub previous: ConnectionState,
    /// The new state.
    pub state: ConnectionState,
}

/// What the UI shows about the link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionSummary {
    /// Name of the peripheral, if known.
    pub name: Option<String>,
    /// Whether the radio link is up.
    pub connected: bool,
}

/// Command and telemetry characteristics of the motor service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotorCharacteristics {
    /// Command characteristic (write).
    pub command: CharacteristicRef,
    /// Telemetry characteristic (notify).
    pub telemetry: CharacteristicRef,
}

impl MotorCharacteristics {
    /// Resolve both characteristics from discovered services.
    pub fn resolve(services: &[GattService]) -> Result<Self> {
        let service = services
            .iter()
            .find(|s| is_motor_service(&s.uuid))
            .ok_or_else(|| {
                for s in services {
                    debug!("  Available service: {}", s.uuid);
                }
                Error::ServiceNotFound {
                    uuid: MOTOR_SERVICE_UUID.to_string(),
                }
            })?;

        let find = |uuid| {
            service
                .characteristic(&uuid)
                .cloned()
                .ok_or_else(|| Error::CharacteristicNotFound {
                    uuid: uuid.to_string(),
                })
        };

        Ok(Self {
            command: find(COMMAND_CHARACTERISTIC_UUID)?,
            telemetry: find(TELEMETRY_CHARACTERISTIC_UUID)?,
        })
    }
}

/// The single active or pending link.
#[derive(Debug, Clone, Default)]
pub(crate) struct Session {
    /// Peripheral the session targets.
    pub target: Option<Sighting>,
    /// Current state.
    pub state: ConnectionState,
    /// Resolved characteristics, present from `Ready` on.
    pub characteristics: Option<MotorCharacteristics>,
    /// Whether the next disconnect was requested by the user.
    pub user_disconnect: bool,
}

impl Session {
    /// Fresh session for `target`, keeping the current state.
    pub fn for_target(target: Sighting, state: ConnectionState) -> Self {
        Self {
            target: Some(target),
            state,
            characteristics: None,
            user_disconnect: false,
        }
    }

    pub fn address(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.address.as_str())
    }

    pub fn name(&self) -> Option<String> {
        self.target.as_ref().and_then(|t| t.name.clone())
    }

    /// Check if an event for `address` belongs to this session.
    pub fn is_for(&self, address: &str) -> bool {
        self.address() == Some(address)
    }
}
