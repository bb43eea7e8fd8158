//! ThermoPro TP358 / TP358S manufacturer payload decoder.
//!
//! The format is undocumented and was reverse-engineered from observed traffic.
//! Two firmware variants exist, told apart only by payload length:
//!
//! | Variant  | Length | Temperature               | Humidity | Battery heuristic        |
//! |----------|--------|---------------------------|----------|--------------------------|
//! | TP358    | 4      | `company_id >> 8` / 10 °C | byte[1]  | byte[2]                  |
//! | TP358S   | 5      | `company_id >> 8` / 10 °C | byte[1]  | byte[4]                  |
//!
//! The low byte of the company id is the vendor marker `0xC2`. Bytes 0 and 3 of
//! the 4-byte payload and bytes 0, 2 and 3 of the 5-byte payload are not
//! interpreted.

use std::fmt;
use thiserror::Error;

/// Battery value reported for frames carrying the synthetic-data marker.
pub const FAKE_BATTERY_MARKER: u8 = 255;

/// Errors returned by [`decode`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported TP358 payload length: {0}")]
    UnsupportedLength(usize),
}

/// Firmware variant of the advertising sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadVariant {
    /// 4-byte payload
    Tp358,
    /// 5-byte payload
    Tp358S,
}

impl PayloadVariant {
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            4 => Some(Self::Tp358),
            5 => Some(Self::Tp358S),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tp358 => write!(f, "TP358"),
            Self::Tp358S => write!(f, "TP358S"),
        }
    }
}

/// Physical values decoded from one advertisement.
///
/// Fields are optional because a variant may not expose a quantity, which is
/// not an error.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Reading {
    pub temperature_c: Option<f64>,
    pub humidity_percent: Option<u8>,
    pub battery_percent: Option<u8>,
}

/// Decode a TP358 manufacturer payload.
///
/// # Errors
/// Returns [`DecodeError::UnsupportedLength`] unless the payload is 4 or 5 bytes.
/// Any byte content of a correctly sized payload decodes.
pub fn decode(payload: &[u8], company_id: u16) -> Result<Reading, DecodeError> {
    let temperature_c = Some(temperature_from_company_id(company_id));

    match PayloadVariant::from_len(payload.len()) {
        Some(PayloadVariant::Tp358) => Ok(Reading {
            temperature_c,
            humidity_percent: Some(payload[1]),
            battery_percent: tp358_battery(payload[2]),
        }),
        Some(PayloadVariant::Tp358S) => Ok(Reading {
            temperature_c,
            humidity_percent: Some(payload[1]),
            battery_percent: tp358s_battery(payload[4]),
        }),
        None => Err(DecodeError::UnsupportedLength(payload.len())),
    }
}

fn temperature_from_company_id(company_id: u16) -> f64 {
    f64::from(company_id >> 8) / 10.0
}

/// Older TP358 firmware only exposes a low/ok flag.
fn tp358_battery(status: u8) -> Option<u8> {
    if status & 0x02 != 0 {
        return Some(100);
    }
    match status {
        0x01 => Some(50),
        0x00 => Some(0),
        _ => None,
    }
}

fn tp358s_battery(status: u8) -> Option<u8> {
    match status {
        0x01 => Some(100),
        0xFF => Some(FAKE_BATTERY_MARKER),
        _ => None,
    }
}
