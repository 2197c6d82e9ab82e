//! Protocol module for the motor controller wire formats.
//!
//! This module contains the implementations for:
//! - Command frame encoding
//! - Telemetry frame decoding and status interpretation

pub mod command;
pub mod telemetry;

pub use command::{Command, Opcode};
pub use telemetry::{MotorState, StatusFlags, TelemetryFrame};
