//! Latest decoded reading per device.

use crate::alias::{AliasMap, display_name};
use crate::event::ReadingEvent;
use crate::mac_address::MacAddress;
use chrono::Local;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::Arc;

/// Read-only view of the newest reading of every device seen so far.
///
/// Only the dispatcher writes; clones share the same map and may be queried
/// from any task at any time.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCache {
    readings: Arc<RwLock<HashMap<MacAddress, ReadingEvent>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device: &MacAddress) -> Option<ReadingEvent> {
        self.readings.read().get(device).cloned()
    }

    /// Copy of every entry, ordered by address.
    pub fn all(&self) -> BTreeMap<MacAddress, ReadingEvent> {
        self.readings
            .read()
            .iter()
            .map(|(device, event)| (*device, event.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.readings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.read().is_empty()
    }

    pub(crate) fn record(&self, event: ReadingEvent) {
        self.readings.write().insert(event.device_address, event);
    }

    /// Multi-line human-readable summary of every device.
    pub fn summary(&self, aliases: &AliasMap) -> String {
        let all = self.all();
        if all.is_empty() {
            return "no sensor data received yet".to_string();
        }

        let mut out = String::new();
        for (device, event) in &all {
            let name = display_name(aliases, device);
            let _ = writeln!(out, "{name} ({device})");
            if let Some(t) = event.temperature_c {
                let _ = writeln!(out, "  temperature: {t:.1} °C");
            }
            if let Some(h) = event.humidity_percent {
                let _ = writeln!(out, "  humidity: {h} %");
            }
            if let Some(b) = event.battery_percent {
                let _ = writeln!(out, "  battery: {b} %");
            }
            let _ = writeln!(out, "  rssi: {} dBm", event.rssi);
            let _ = writeln!(
                out,
                "  last update: {}",
                event.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
            );
        }
        out
    }
}
