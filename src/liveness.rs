//! Pipeline liveness monitoring.
//!
//! The dispatcher stamps an [`ActivityClock`] for every frame it receives and
//! for every frame it decodes. The [`LivenessMonitor`] compares both stamps
//! against the configured warning threshold on a fixed tick and publishes a
//! `bleStatus` event whenever the resulting status changes.

use crate::event::{BleStatus, LiveEvent};
use crate::output::{EventSink, bounded};
use crate::settings::IntervalSettings;
use chrono::{DateTime, Local, TimeDelta, Utc};
use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Spacing of liveness evaluations.
pub const TICK_INTERVAL: Duration = Duration::from_secs(30);

const NEVER: i64 = i64::MIN;

/// Last-received and last-processed timestamps shared between the dispatcher
/// (writer) and the monitor (reader). Each is a single atomic word.
#[derive(Debug)]
pub struct ActivityClock {
    received_ms: AtomicI64,
    processed_ms: AtomicI64,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self {
            received_ms: AtomicI64::new(NEVER),
            processed_ms: AtomicI64::new(NEVER),
        }
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame arrived, valid or not.
    pub fn mark_received(&self, at: DateTime<Utc>) {
        self.received_ms.store(at.timestamp_millis(), Ordering::Release);
    }

    /// A frame decoded successfully.
    pub fn mark_processed(&self, at: DateTime<Utc>) {
        self.processed_ms.store(at.timestamp_millis(), Ordering::Release);
    }

    pub fn last_received(&self) -> Option<DateTime<Utc>> {
        load(&self.received_ms)
    }

    pub fn last_processed(&self) -> Option<DateTime<Utc>> {
        load(&self.processed_ms)
    }
}

fn load(slot: &AtomicI64) -> Option<DateTime<Utc>> {
    match slot.load(Ordering::Acquire) {
        NEVER => None,
        ms => DateTime::from_timestamp_millis(ms),
    }
}

fn is_fresh(now: DateTime<Utc>, at: Option<DateTime<Utc>>, threshold: TimeDelta) -> bool {
    at.is_some_and(|at| now.signed_duration_since(at) <= threshold)
}

fn last_seen(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// Evaluate the pipeline status at `now`.
///
/// A timestamp is fresh when it exists and is at most `threshold` old. The
/// status is a warning when either timestamp is stale; the message then lists
/// every stale dimension.
pub fn evaluate_status(
    now: DateTime<Utc>,
    last_received: Option<DateTime<Utc>>,
    last_processed: Option<DateTime<Utc>>,
    threshold: Duration,
) -> BleStatus {
    let window = TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX);
    let received_ok = is_fresh(now, last_received, window);
    let processed_ok = is_fresh(now, last_processed, window);

    if received_ok && processed_ok {
        return BleStatus {
            warning: false,
            message: String::new(),
            last_received_at: last_received,
            last_processed_at: last_processed,
        };
    }

    let minutes = (threshold.as_secs_f64() / 60.0).round().max(1.0);
    let mut issues = Vec::with_capacity(2);
    if !received_ok {
        issues.push(format!(
            "no BLE signal for {minutes:.0} min (last: {})",
            last_seen(last_received)
        ));
    }
    if !processed_ok {
        issues.push(format!(
            "no BLE signal processed for {minutes:.0} min (last: {})",
            last_seen(last_processed)
        ));
    }

    BleStatus {
        warning: true,
        message: format!("BLE WARNING: {}", issues.join(" | ")),
        last_received_at: last_received,
        last_processed_at: last_processed,
    }
}

/// Periodic status evaluation with change detection.
pub struct LivenessMonitor {
    clock: Arc<ActivityClock>,
    settings: IntervalSettings,
    events: Arc<dyn EventSink>,
    last_warning: bool,
    last_message: String,
}

impl LivenessMonitor {
    pub fn new(
        clock: Arc<ActivityClock>,
        settings: IntervalSettings,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            clock,
            settings,
            events,
            last_warning: false,
            last_message: String::new(),
        }
    }

    /// Evaluate once at `now`; returns the new status if it differs from the
    /// previous evaluation.
    ///
    /// The initial state is "OK, empty message", so a healthy pipeline never
    /// produces an event.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<BleStatus> {
        let status = evaluate_status(
            now,
            self.clock.last_received(),
            self.clock.last_processed(),
            self.settings.snapshot().warning_threshold(),
        );
        if status.warning == self.last_warning && status.message == self.last_message {
            return None;
        }

        if status.warning && !self.last_warning {
            warn!("{}", status.message);
        } else if !status.warning {
            info!("BLE activity recovered");
        }
        self.last_warning = status.warning;
        self.last_message.clone_from(&status.message);
        Some(status)
    }

    /// Tick every [`TICK_INTERVAL`] until `cancel` fires, publishing changes.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Some(status) = self.tick(Utc::now())
                && let Err(e) = bounded(self.events.publish(LiveEvent::BleStatus(status))).await
            {
                warn!("failed to publish BLE status: {e}");
            }
        }
    }
}
