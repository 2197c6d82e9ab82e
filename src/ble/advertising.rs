//! Advertising data and scan filtering.
//!
//! The peripheral advertises the motor service UUID and a manufacturer-specific
//! data field keyed by the company ID. That field carries a 6-byte hardware
//! device identifier which is used to find the same unit again after a link loss.

use std::collections::HashMap;
use std::str::FromStr;

use uuid::Uuid;

use crate::config::ScanMode;
use crate::error::{Error, Result};

/// 6-byte hardware device identifier from manufacturer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId([u8; 6]);

impl DeviceId {
    /// Size of the identifier in bytes.
    pub const LEN: usize = 6;

    /// Create from raw bytes.
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// The raw identifier bytes, in advertised order.
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl TryFrom<&[u8]> for DeviceId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        let bytes: [u8; 6] = value
            .try_into()
            .map_err(|_| Error::InvalidDeviceId { len: value.len() })?;
        Ok(Self(bytes))
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    /// Parse a 12-digit hex string such as `"A1B2C3D4E5F6"`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidParameter {
            name: "device_id".to_string(),
            value: s.to_string(),
        };

        if s.len() != Self::LEN * 2 || !s.is_ascii() {
            return Err(invalid());
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }

        Ok(Self(bytes))
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// One advertisement report from the radio.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    /// Stable hardware address (platform peripheral identifier).
    pub address: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Whether the advertisement is connectable.
    pub connectable: bool,
    /// Manufacturer-specific data keyed by company ID.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

impl Advertisement {
    /// Extract the device identifier carried under `company_id`.
    ///
    /// Returns `None` unless the field is present and exactly 6 bytes long.
    pub fn device_id(&self, company_id: u16) -> Option<DeviceId> {
        self.manufacturer_data
            .get(&company_id)
            .and_then(|data| DeviceId::try_from(data.as_slice()).ok())
    }

    /// Check if the advertisement lists a service UUID.
    pub fn advertises_service(&self, uuid: &Uuid) -> bool {
        self.services.contains(uuid)
    }
}

/// Manufacturer-data match: `(field & mask) == (data & mask)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerFilter {
    /// Company ID the field is keyed by.
    pub company_id: u16,
    /// Expected data.
    pub data: Vec<u8>,
    /// Per-byte mask. Must be the same length as `data`.
    pub mask: Vec<u8>,
}

impl ManufacturerFilter {
    /// Exact match on a device identifier (full mask).
    pub fn exact(company_id: u16, device_id: &DeviceId) -> Self {
        Self {
            company_id,
            data: device_id.as_bytes().to_vec(),
            mask: vec![0xFF; DeviceId::LEN],
        }
    }

    /// Check an advertisement against this filter.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        let Some(field) = advertisement.manufacturer_data.get(&self.company_id) else {
            return false;
        };

        if field.len() < self.data.len() {
            return false;
        }

        self.data
            .iter()
            .zip(&self.mask)
            .zip(field)
            .all(|((expected, mask), actual)| expected & mask == actual & mask)
    }
}

/// What the radio should scan for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanRequest {
    /// Only report advertisements listing one of these services. Empty means any.
    pub services: Vec<Uuid>,
    /// Only report advertisements whose manufacturer data matches.
    pub manufacturer: Option<ManufacturerFilter>,
    /// Radio duty cycle.
    pub mode: ScanMode,
}

impl ScanRequest {
    /// Report every advertisement.
    pub fn unfiltered(mode: ScanMode) -> Self {
        Self {
            services: Vec::new(),
            manufacturer: None,
            mode,
        }
    }

    /// Report advertisements listing `service`.
    pub fn by_service(service: Uuid, mode: ScanMode) -> Self {
        Self {
            services: vec![service],
            manufacturer: None,
            mode,
        }
    }

    /// Report only the unit with `device_id` advertising `service`.
    pub fn for_device(service: Uuid, company_id: u16, device_id: &DeviceId, mode: ScanMode) -> Self {
        Self {
            services: vec![service],
            manufacturer: Some(ManufacturerFilter::exact(company_id, device_id)),
            mode,
        }
    }

    /// Check an advertisement against every criterion of this request.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        let service_ok = self.services.is_empty()
            || self
                .services
                .iter()
                .any(|uuid| advertisement.advertises_service(uuid));

        let manufacturer_ok = self
            .manufacturer
            .as_ref()
            .map(|filter| filter.matches(advertisement))
            .unwrap_or(true);

        service_ok && manufacturer_ok
    }
}
