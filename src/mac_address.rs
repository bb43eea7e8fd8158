//! Bluetooth device address used as the per-sensor key.
//!
//! Every stage of the pipeline keys its state by [`MacAddress`]: the throttle
//! maps, the snapshot cache and the storage rows. The canonical text form is
//! upper-case, colon-separated hex (`AA:BB:CC:DD:EE:FF`), which is also the
//! JSON representation seen by live subscribers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A Bluetooth MAC address in transmission order (most significant byte first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Build an address from the little-endian byte order used inside HCI events.
    pub fn from_le_bytes(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        Self(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Errors returned when parsing a MAC address string.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseMacError {
    #[error("invalid MAC address: expected 6 octets, got {0}")]
    WrongOctetCount(usize),
    #[error("invalid MAC address: octet '{0}' is not two hex digits")]
    BadOctet(String),
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    /// Accepts `:` or `-` separated octets in either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<&str> = s.trim().split([':', '-']).collect();
        if octets.len() != 6 {
            return Err(ParseMacError::WrongOctetCount(octets.len()));
        }

        let mut bytes = [0u8; 6];
        for (slot, octet) in bytes.iter_mut().zip(&octets) {
            if octet.len() != 2 {
                return Err(ParseMacError::BadOctet(octet.to_string()));
            }
            *slot = u8::from_str_radix(octet, 16)
                .map_err(|_| ParseMacError::BadOctet(octet.to_string()))?;
        }

        Ok(MacAddress(bytes))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_canonical_upper_case() {
        let addr = MacAddress([0xfb, 0xb9, 0x30, 0xbb, 0x5e, 0x55]);
        assert_eq!(addr.to_string(), "FB:B9:30:BB:5E:55");
    }

    #[test]
    fn test_from_str_accepts_both_separators() {
        let colon: MacAddress = "fa:c2:7d:1a:c3:ea".parse().unwrap();
        let dash: MacAddress = "FA-C2-7D-1A-C3-EA".parse().unwrap();
        assert_eq!(colon, dash);
        assert_eq!(colon.0, [0xFA, 0xC2, 0x7D, 0x1A, 0xC3, 0xEA]);
    }

    #[test]
    fn test_from_str_rejects_malformed_input() {
        assert_eq!(
            "AA:BB:CC".parse::<MacAddress>(),
            Err(ParseMacError::WrongOctetCount(3))
        );
        assert!(matches!(
            "AA:BB:CC:DD:EE:GG".parse::<MacAddress>(),
            Err(ParseMacError::BadOctet(_))
        ));
        assert!(matches!(
            "AAA:BB:CC:DD:EE:F".parse::<MacAddress>(),
            Err(ParseMacError::BadOctet(_))
        ));
    }

    #[test]
    fn test_from_le_bytes_reverses_hci_order() {
        let addr = MacAddress::from_le_bytes([0x55, 0x5E, 0xBB, 0x30, 0xB9, 0xFB]);
        assert_eq!(addr.to_string(), "FB:B9:30:BB:5E:55");
    }

    #[test]
    fn test_serde_uses_text_form() {
        let addr = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"AA:BB:CC:DD:EE:FF\"");

        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<MacAddress>("\"nope\"").is_err());
    }
}
