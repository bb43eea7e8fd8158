//! Frame processing loop.
//!
//! Every frame from the source passes through [`Dispatcher::handle_frame`]:
//!
//! 1. stamp "received" on the activity clock (even for frames rejected below),
//! 2. reject payloads that are not 4 or 5 bytes,
//! 3. decode, skipping the frame on failure,
//! 4. stamp "processed",
//! 5. build the [`ReadingEvent`],
//! 6. check the broadcast and storage throttles independently and forward to
//!    each sink whose throttle passes,
//! 7. record the event in the snapshot cache.
//!
//! Device state lives in the dispatcher itself; it is only touched from the
//! single task running [`Dispatcher::run`].

use crate::alias::{AliasMap, display_name};
use crate::decoder::{PayloadVariant, decode};
use crate::event::{LiveEvent, ReadingEvent};
use crate::frame::AdvertisementFrame;
use crate::liveness::ActivityClock;
use crate::mac_address::MacAddress;
use crate::output::{EventSink, MeasurementRow, StorageSink, bounded};
use crate::scanner::{FrameResult, ScanError};
use crate::settings::IntervalSettings;
use crate::snapshot::SnapshotCache;
use crate::throttle::Throttle;
use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What happened to a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Payload length is not a TP358 length
    Rejected,
    /// Correct length but the decoder refused it
    Undecodable,
    /// Decoded; flags tell which sinks were called
    Decoded { broadcast: bool, stored: bool },
}

pub struct Dispatcher {
    settings: IntervalSettings,
    clock: Arc<ActivityClock>,
    snapshot: SnapshotCache,
    events: Arc<dyn EventSink>,
    storage: Arc<dyn StorageSink>,
    aliases: AliasMap,
    broadcast_throttle: Throttle,
    storage_throttle: Throttle,
    known_devices: HashSet<MacAddress>,
}

impl Dispatcher {
    pub fn new(
        settings: IntervalSettings,
        events: Arc<dyn EventSink>,
        storage: Arc<dyn StorageSink>,
    ) -> Self {
        Self {
            settings,
            clock: Arc::new(ActivityClock::new()),
            snapshot: SnapshotCache::new(),
            events,
            storage,
            aliases: AliasMap::new(),
            broadcast_throttle: Throttle::new(),
            storage_throttle: Throttle::new(),
            known_devices: HashSet::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: AliasMap) -> Self {
        self.aliases = aliases;
        self
    }

    /// Activity timestamps written by this dispatcher.
    pub fn clock(&self) -> Arc<ActivityClock> {
        Arc::clone(&self.clock)
    }

    /// Latest-reading cache written by this dispatcher.
    pub fn snapshot(&self) -> SnapshotCache {
        self.snapshot.clone()
    }

    pub fn aliases(&self) -> &AliasMap {
        &self.aliases
    }

    /// Process one frame at `now`.
    pub async fn handle_frame(
        &mut self,
        frame: AdvertisementFrame,
        now: DateTime<Utc>,
    ) -> FrameOutcome {
        self.clock.mark_received(now);

        let Some(variant) = frame.variant() else {
            trace!(
                "{}: ignoring {} byte payload {}",
                frame.device,
                frame.payload.len(),
                frame.payload_hex()
            );
            return FrameOutcome::Rejected;
        };

        let reading = match decode(&frame.payload, frame.company_id) {
            Ok(reading) => reading,
            Err(e) => {
                debug!("{}: {e} (payload {})", frame.device, frame.payload_hex());
                return FrameOutcome::Undecodable;
            }
        };
        self.clock.mark_processed(now);

        let event = ReadingEvent::new(&frame, reading);
        self.note_device(frame.device, variant);

        let config = self.settings.snapshot();
        let broadcast = self
            .broadcast_throttle
            .should_emit(frame.device, now, config.broadcast_interval());
        let stored = self
            .storage_throttle
            .should_emit(frame.device, now, config.storage_interval());

        if broadcast {
            self.broadcast(event.clone()).await;
        }
        if stored {
            self.store(&event).await;
        }

        self.snapshot.record(event);
        FrameOutcome::Decoded { broadcast, stored }
    }

    fn note_device(&mut self, device: MacAddress, variant: PayloadVariant) {
        if self.known_devices.insert(device) {
            info!(
                "sensor detected: {} ({variant})",
                display_name(&self.aliases, &device)
            );
        }
    }

    async fn broadcast(&self, event: ReadingEvent) {
        let device = event.device_address;
        if let Err(e) = bounded(self.events.publish(LiveEvent::Reading(event))).await {
            warn!("{device}: live broadcast failed: {e}");
        }
    }

    async fn store(&self, event: &ReadingEvent) {
        let row = MeasurementRow {
            device: event.device_address,
            name: display_name(&self.aliases, &event.device_address),
            temperature_c: event.temperature_c,
            humidity_percent: event.humidity_percent,
            measured_at: event.timestamp,
        };
        if let Err(e) = bounded(self.storage.store(&row)).await {
            warn!("{}: storing measurement failed: {e}", row.device);
        }
    }

    /// Consume `frames` in arrival order until the stream ends or `cancel` fires.
    ///
    /// An error item from the source is fatal and returned.
    pub async fn run(
        &mut self,
        mut frames: mpsc::Receiver<FrameResult>,
        cancel: &CancellationToken,
    ) -> Result<(), ScanError> {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                item = frames.recv() => item,
            };
            match item {
                Some(Ok(frame)) => {
                    self.handle_frame(frame, Utc::now()).await;
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }
}
