//! BLE Service, Characteristic and Descriptor UUIDs.
//!
//! These identifiers are baked into the motor controller firmware and must
//! not change.

use uuid::Uuid;

// Motor Service (custom)
/// Motor control service UUID. Advertised by the peripheral.
pub const MOTOR_SERVICE_UUID: Uuid = Uuid::from_u128(0xc52081ba_e90f_40e4_a99f_ccaa4fd11c15);
/// Command characteristic UUID (Write).
pub const COMMAND_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xd10b46cd_412a_4d15_a7bb_092a329eed46);
/// Telemetry characteristic UUID (Notify).
pub const TELEMETRY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x17da15e5_05b1_42df_8d9d_d7645d6d9293);

// Client Characteristic Configuration Descriptor (Standard BLE)
/// Standard CCCD UUID, written to enable notifications.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);
/// CCCD value that enables notifications (little-endian 0x0001).
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Default manufacturer company ID carried in the peripheral's advertisement.
pub const DEFAULT_COMPANY_ID: u16 = 0x706D;

/// Check if a service UUID is the motor control service.
pub fn is_motor_service(uuid: &Uuid) -> bool {
    *uuid == MOTOR_SERVICE_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            MOTOR_SERVICE_UUID.to_string(),
            "c52081ba-e90f-40e4-a99f-ccaa4fd11c15"
        );
        assert_eq!(
            COMMAND_CHARACTERISTIC_UUID.to_string(),
            "d10b46cd-412a-4d15-a7bb-092a329eed46"
        );
        assert_eq!(
            TELEMETRY_CHARACTERISTIC_UUID.to_string(),
            "17da15e5-05b1-42df-8d9d-d7645d6d9293"
        );
        assert!(CCCD_UUID.to_string().contains("2902"));
    }

    #[test]
    fn test_is_motor_service() {
        assert!(is_motor_service(&MOTOR_SERVICE_UUID));
        assert!(!is_motor_service(&COMMAND_CHARACTERISTIC_UUID));
    }
}
