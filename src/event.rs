//! Events that cross the boundary to live subscribers.
//!
//! Serialized field names are camelCase because the dashboard consumes them
//! as JSON.

use crate::decoder::Reading;
use crate::frame::AdvertisementFrame;
use crate::mac_address::MacAddress;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Decoded reading as forwarded to sinks and kept in the snapshot cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingEvent {
    pub timestamp: DateTime<Utc>,
    pub device_address: MacAddress,
    pub rssi: i16,
    pub temperature_c: Option<f64>,
    pub humidity_percent: Option<u8>,
    pub battery_percent: Option<u8>,
    /// Raw payload, kept for diagnostics and to tell TP358 from TP358S
    pub raw_payload_hex: String,
}

impl ReadingEvent {
    pub fn new(frame: &AdvertisementFrame, reading: Reading) -> Self {
        Self {
            timestamp: frame.timestamp,
            device_address: frame.device,
            rssi: frame.rssi,
            temperature_c: reading.temperature_c,
            humidity_percent: reading.humidity_percent,
            battery_percent: reading.battery_percent,
            raw_payload_hex: frame.payload_hex(),
        }
    }
}

/// Pipeline liveness as reported on the `bleStatus` event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BleStatus {
    pub warning: bool,
    pub message: String,
    pub last_received_at: Option<DateTime<Utc>>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// A named event published to every live subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum LiveEvent {
    #[serde(rename = "reading")]
    Reading(ReadingEvent),
    #[serde(rename = "bleStatus")]
    BleStatus(BleStatus),
}

impl LiveEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            LiveEvent::Reading(_) => "reading",
            LiveEvent::BleStatus(_) => "bleStatus",
        }
    }
}
