//! Raw advertisement frame handed over by a scanner backend.

use crate::decoder::PayloadVariant;
use crate::mac_address::MacAddress;
use chrono::{DateTime, Utc};

/// A single manufacturer-data capture from a BLE advertisement.
///
/// `payload` holds the bytes *after* the 16-bit company id, which TP358 sensors
/// abuse to carry temperature in its high byte.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisementFrame {
    /// When the backend received the advertisement
    pub timestamp: DateTime<Utc>,
    /// Address of the advertising device
    pub device: MacAddress,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Manufacturer-specific company id as reported by the stack
    pub company_id: u16,
    /// Manufacturer payload without the company id prefix
    pub payload: Vec<u8>,
}

impl AdvertisementFrame {
    /// Payload bytes as upper-case hex octets joined with `-` (e.g. `00-28-22-1B-01`).
    pub fn payload_hex(&self) -> String {
        self.payload
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Firmware variant implied by the payload length, if any.
    pub fn variant(&self) -> Option<PayloadVariant> {
        PayloadVariant::from_len(self.payload.len())
    }
}

/// Whether a manufacturer company id carries the ThermoPro `0xC2` marker.
///
/// Stacks disagree on byte order for these devices, so the marker is accepted
/// in either half of the id.
pub fn looks_like_tp358(company_id: u16) -> bool {
    (company_id & 0x00FF) == 0x00C2 || (company_id & 0xFF00) == 0xC200
}
