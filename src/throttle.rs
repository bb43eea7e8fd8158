//! Per-device rate limiting for downstream sinks.
//!
//! The dispatcher keeps one [`Throttle`] per sink. Each throttle tracks the last
//! time a device was forwarded to its sink; the interval is supplied on every
//! check so configuration changes apply to the very next frame without
//! resetting waits that are already in progress.

use crate::mac_address::MacAddress;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Tracks the last dispatch time of each device for one sink.
///
/// A device with no record always passes. Devices are never evicted.
#[derive(Debug, Default)]
pub struct Throttle {
    last_emitted: HashMap<MacAddress, DateTime<Utc>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `device` may be forwarded at `now` given `interval`.
    ///
    /// Returns `true` when the device has no record or at least `interval` has
    /// elapsed since its last dispatch; the record is then moved to `now`.
    /// A refused check leaves the record untouched.
    ///
    /// # Example
    /// ```
    /// use chrono::{TimeDelta, Utc};
    /// use std::time::Duration;
    /// use tp358_listener::{MacAddress, Throttle};
    ///
    /// let mut throttle = Throttle::new();
    /// let mac = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    /// let t0 = Utc::now();
    ///
    /// assert!(throttle.should_emit(mac, t0, Duration::from_secs(30)));
    /// assert!(!throttle.should_emit(mac, t0 + TimeDelta::seconds(10), Duration::from_secs(30)));
    /// ```
    pub fn should_emit(
        &mut self,
        device: MacAddress,
        now: DateTime<Utc>,
        interval: Duration,
    ) -> bool {
        if let Some(last) = self.last_emitted.get(&device) {
            // A clock stepping backwards yields a negative elapsed time and
            // keeps the device throttled.
            let elapsed = now.signed_duration_since(*last);
            let window = TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX);
            if elapsed < window {
                return false;
            }
        }
        self.last_emitted.insert(device, now);
        true
    }

    /// Last dispatch time recorded for `device`.
    pub fn last_emitted(&self, device: &MacAddress) -> Option<DateTime<Utc>> {
        self.last_emitted.get(device).copied()
    }

    /// Number of devices with a dispatch record.
    pub fn len(&self) -> usize {
        self.last_emitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_emitted.is_empty()
    }
}

/// Parse a duration from a human-readable string.
///
/// Accepts an unsigned integer followed by `ms`, `s`, `m` or `h`; a bare number
/// is taken as seconds. Whitespace around the number is ignored.
///
/// # Examples
/// ```
/// use tp358_listener::throttle::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
/// assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (number, millis_per_unit) = if let Some(n) = src.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = src.strip_suffix('h') {
        (n, 3_600_000)
    } else if let Some(n) = src.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = src.strip_suffix('s') {
        (n, 1_000)
    } else {
        (src, 1_000)
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {src}"))?;
    value
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration out of range: {src}"))
}
