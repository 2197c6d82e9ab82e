//! Telemetry notification decoding.
//!
//! Frame format pushed on the telemetry characteristic:
//! `[status:1][speed:int32 little-endian][position:int32 little-endian]`.
//! Frames shorter than 9 bytes are dropped; longer frames are accepted and the
//! trailing bytes ignored.

use bytes::{Buf, BufMut};

/// Motor state carried in the low nibble of the status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MotorState {
    /// Motor is stopped.
    Stopped,
    /// Motor is regulating towards a target speed.
    RunningSpeed,
    /// Motor is regulating towards a target position.
    RunningPosition,
    /// Emergency stop engaged.
    EmergencyStop,
    /// Soft start or calibration in progress.
    Restart,
    /// Hardware failure.
    Fault,
    /// A state value this crate does not know about.
    Unknown(u8),
}

impl MotorState {
    /// Mask isolating the state nibble.
    pub const MASK: u8 = 0x0F;

    /// Create from a raw status byte (flags are ignored).
    pub fn from_status(status: u8) -> Self {
        match status & Self::MASK {
            0x00 => Self::Stopped,
            0x01 => Self::RunningSpeed,
            0x02 => Self::RunningPosition,
            0x03 => Self::EmergencyStop,
            0x04 => Self::Restart,
            0x05 => Self::Fault,
            other => Self::Unknown(other),
        }
    }

    /// Whether the motor is actively driven.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::RunningSpeed | Self::RunningPosition)
    }
}

/// Diagnostic flags carried in the high nibble of the status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusFlags(u8);

impl StatusFlags {
    /// Mask isolating the flag nibble.
    pub const MASK: u8 = 0xF0;
    /// Peripheral lost sync with the client.
    pub const SYNC_BAD: u8 = 0x10;
    /// Motor driver is overheating.
    pub const OVERHEAT: u8 = 0x20;

    /// Create from a raw status byte (state nibble is ignored).
    pub fn from_status(status: u8) -> Self {
        Self(status & Self::MASK)
    }

    /// Raw flag bits.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Sync warning raised.
    pub fn sync_bad(&self) -> bool {
        self.0 & Self::SYNC_BAD != 0
    }

    /// Overheat warning raised.
    pub fn overheat(&self) -> bool {
        self.0 & Self::OVERHEAT != 0
    }

    /// Whether no flag is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// One decoded telemetry reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetryFrame {
    /// Raw status byte: flags in the high nibble, state in the low nibble.
    pub status: u8,
    /// Current speed in RPM.
    pub speed: i32,
    /// Current position in degrees.
    pub position: i32,
}

impl TelemetryFrame {
    /// Minimum notification size in bytes.
    pub const MIN_SIZE: usize = 9;

    /// Create a frame from its fields.
    pub fn new(status: u8, speed: i32, position: i32) -> Self {
        Self {
            status,
            speed,
            position,
        }
    }

    /// Decode a telemetry notification.
    ///
    /// Returns `None` for frames shorter than [`Self::MIN_SIZE`].
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::MIN_SIZE {
            return None;
        }

        let mut buf = data;
        Some(Self {
            status: buf.get_u8(),
            speed: buf.get_i32_le(),
            position: buf.get_i32_le(),
        })
    }

    /// Encode as the firmware packs it.
    pub fn to_bytes(&self) -> [u8; Self::MIN_SIZE] {
        let mut out = [0u8; Self::MIN_SIZE];
        let mut buf = &mut out[..];
        buf.put_u8(self.status);
        buf.put_i32_le(self.speed);
        buf.put_i32_le(self.position);
        out
    }

    /// Motor state decoded from the status byte.
    pub fn motor_state(&self) -> MotorState {
        MotorState::from_status(self.status)
    }

    /// Diagnostic flags decoded from the status byte.
    pub fn flags(&self) -> StatusFlags {
        StatusFlags::from_status(self.status)
    }
}
