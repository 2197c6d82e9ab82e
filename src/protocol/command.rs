//! Motor command frames.
//!
//! Frame format written to the command characteristic:
//! `[opcode:1][value:int32 little-endian]` = 5 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Command opcodes understood by the motor firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Opcode {
    /// Stop the motor (0x00).
    Shutdown = 0x00,
    /// Initialise / calibrate the motor (0x01).
    Calibrate = 0x01,
    /// Run at a target speed in RPM (0x02).
    SetSpeed = 0x02,
    /// Move to a target position in degrees (0x03).
    SetPosition = 0x03,
}

impl Opcode {
    /// Create from raw byte value.
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Shutdown),
            0x01 => Some(Self::Calibrate),
            0x02 => Some(Self::SetSpeed),
            0x03 => Some(Self::SetPosition),
            _ => None,
        }
    }

    /// Convert to raw byte value.
    pub fn to_raw(&self) -> u8 {
        *self as u8
    }

    /// Whether the value field is meaningful for this opcode.
    ///
    /// `Shutdown` and `Calibrate` always carry 0.
    pub fn takes_value(&self) -> bool {
        matches!(self, Self::SetSpeed | Self::SetPosition)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shutdown => write!(f, "Shutdown"),
            Self::Calibrate => write!(f, "Calibrate"),
            Self::SetSpeed => write!(f, "SetSpeed"),
            Self::SetPosition => write!(f, "SetPosition"),
        }
    }
}

/// A single motor command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Command {
    opcode: Opcode,
    value: i32,
}

impl Command {
    /// Encoded frame size in bytes.
    pub const FRAME_SIZE: usize = 5;

    /// Create a command. The value is forced to 0 for opcodes that take none.
    pub fn new(opcode: Opcode, value: i32) -> Self {
        let value = if opcode.takes_value() { value } else { 0 };
        Self { opcode, value }
    }

    /// Stop the motor.
    pub fn shutdown() -> Self {
        Self::new(Opcode::Shutdown, 0)
    }

    /// Calibrate the motor.
    pub fn calibrate() -> Self {
        Self::new(Opcode::Calibrate, 0)
    }

    /// Run at `rpm`.
    pub fn set_speed(rpm: i32) -> Self {
        Self::new(Opcode::SetSpeed, rpm)
    }

    /// Move to `degrees`.
    pub fn set_position(degrees: i32) -> Self {
        Self::new(Opcode::SetPosition, degrees)
    }

    /// The command opcode.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// The command value.
    pub fn value(&self) -> i32 {
        self.value
    }

    /// Encode into the 5-byte wire frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::FRAME_SIZE);
        buf.put_u8(self.opcode.to_raw());
        buf.put_i32_le(self.value);
        buf.freeze()
    }

    /// Parse a frame as the firmware would. Extra trailing bytes are ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FRAME_SIZE {
            return Err(Error::InvalidData {
                context: format!("Command frame too short: {} bytes", data.len()),
            });
        }

        let mut buf = data;
        let raw = buf.get_u8();
        let opcode = Opcode::from_raw(raw).ok_or_else(|| Error::InvalidData {
            context: format!("Unknown opcode: {:#04x}", raw),
        })?;

        Ok(Self::new(opcode, buf.get_i32_le()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_opcode_values() {
        assert_eq!(Opcode::Shutdown.to_raw(), 0x00);
        assert_eq!(Opcode::Calibrate.to_raw(), 0x01);
        assert_eq!(Opcode::SetSpeed.to_raw(), 0x02);
        assert_eq!(Opcode::SetPosition.to_raw(), 0x03);
        assert_eq!(Opcode::from_raw(0x04), None);
    }

    #[test]
    fn test_encode_set_speed() {
        let frame = Command::set_speed(1500).encode();
        assert_eq!(&frame[..], &[0x02, 0xDC, 0x05, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_negative_position() {
        let frame = Command::set_position(-1).encode();
        assert_eq!(&frame[..], &[0x03, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_shutdown_and_calibrate_zero_value() {
        assert_eq!(&Command::shutdown().encode()[..], &[0x00, 0, 0, 0, 0]);
        assert_eq!(&Command::calibrate().encode()[..], &[0x01, 0, 0, 0, 0]);

        // A value passed alongside these opcodes is dropped
        assert_eq!(Command::new(Opcode::Calibrate, 42).value(), 0);
    }

    #[test]
    fn test_parse_rejects_short_and_unknown() {
        assert!(Command::parse(&[0x02, 0x01]).is_err());
        assert!(Command::parse(&[0x09, 0, 0, 0, 0]).is_err());
    }

    proptest! {
        #[test]
        fn prop_frame_is_opcode_then_le_value(value in any::<i32>()) {
            let frame = Command::set_position(value).encode();
            prop_assert_eq!(frame.len(), Command::FRAME_SIZE);
            prop_assert_eq!(frame[0], 0x03);
            prop_assert_eq!(&frame[1..], &value.to_le_bytes()[..]);
            prop_assert_eq!(Command::parse(&frame).unwrap(), Command::set_position(value));
        }
    }
}
