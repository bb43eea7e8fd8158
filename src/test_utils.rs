use crate::event::LiveEvent;
use crate::frame::AdvertisementFrame;
use crate::mac_address::MacAddress;
use crate::output::{EventSink, MeasurementRow, SinkError, StorageSink};
use crate::scanner::{AdvertisementSource, FrameResult, ScanError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// A second address for tests involving several devices.
pub const OTHER_MAC: MacAddress = MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

/// Fixed frame timestamp: 2023-11-14T22:13:20Z.
pub fn test_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Build a frame received at [`test_time`] with RSSI -60.
pub fn frame(device: MacAddress, company_id: u16, payload: &[u8]) -> AdvertisementFrame {
    AdvertisementFrame {
        timestamp: test_time(),
        device,
        rssi: -60,
        company_id,
        payload: payload.to_vec(),
    }
}

/// How a recording sink answers calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkMode {
    #[default]
    Accept,
    Fail,
    Stall,
}

async fn answer(mode: SinkMode) -> Result<(), SinkError> {
    match mode {
        SinkMode::Accept => Ok(()),
        SinkMode::Fail => Err(SinkError::Closed),
        SinkMode::Stall => std::future::pending().await,
    }
}

/// Event sink that keeps every published event.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    pub mode: SinkMode,
    events: Mutex<Vec<LiveEvent>>,
}

impl RecordingEventSink {
    pub fn with_mode(mode: SinkMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<LiveEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(&self, event: LiveEvent) -> Result<(), SinkError> {
        self.events.lock().push(event);
        answer(self.mode).await
    }
}

/// Storage sink that keeps every row.
#[derive(Debug, Default)]
pub struct RecordingStorage {
    pub mode: SinkMode,
    rows: Mutex<Vec<MeasurementRow>>,
}

impl RecordingStorage {
    pub fn with_mode(mode: SinkMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn rows(&self) -> Vec<MeasurementRow> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl StorageSink for RecordingStorage {
    async fn store(&self, row: &MeasurementRow) -> Result<(), SinkError> {
        self.rows.lock().push(row.clone());
        answer(self.mode).await
    }
}

/// Source replaying a fixed list of items.
///
/// The stream ends after the last item unless `hold_open` is set, in which
/// case it stays open until cancelled.
#[derive(Debug, Default)]
pub struct FakeSource {
    items: Mutex<Vec<FrameResult>>,
    start_error: Option<ScanError>,
    hold_open: bool,
}

impl FakeSource {
    pub fn new(items: Vec<FrameResult>) -> Self {
        Self {
            items: Mutex::new(items),
            ..Default::default()
        }
    }

    pub fn held_open(items: Vec<FrameResult>) -> Self {
        Self {
            hold_open: true,
            ..Self::new(items)
        }
    }

    pub fn failing_start(error: ScanError) -> Self {
        Self {
            start_error: Some(error),
            ..Default::default()
        }
    }
}

#[async_trait]
impl AdvertisementSource for FakeSource {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn watch(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<FrameResult>, ScanError> {
        if let Some(error) = &self.start_error {
            return Err(error.clone());
        }
        let items = std::mem::take(&mut *self.items.lock());
        let hold_open = self.hold_open;
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            for item in items {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
            if hold_open {
                cancel.cancelled().await;
            }
        });
        Ok(rx)
    }
}

/// In-memory writer whose contents stay readable after it was handed away.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writer whose writes block until the paired sender is used or dropped.
pub struct StalledWriter {
    release: std_mpsc::Receiver<()>,
}

impl StalledWriter {
    pub fn new() -> (Self, std_mpsc::Sender<()>) {
        let (tx, release) = std_mpsc::channel();
        (Self { release }, tx)
    }
}

impl Write for StalledWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.release.recv_timeout(Duration::from_secs(30));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
