//! Downstream sinks for decoded readings.
//!
//! Two kinds of sink receive data from the dispatcher:
//! - [`EventSink`]: live subscribers, fed with [`LiveEvent`]s.
//! - [`StorageSink`]: time-series storage, fed with [`MeasurementRow`]s.
//!
//! Sinks may fail or stall; callers bound every call with [`bounded`] and treat
//! failures as lost data for that sink only.

pub mod hub;
pub mod influxdb;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::event::LiveEvent;
use crate::mac_address::MacAddress;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for a single sink call.
pub const SINK_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors reported by sinks.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink call timed out after {0:?}")]
    Timeout(Duration),
    #[error("sink is closed")]
    Closed,
    #[error("sink I/O error: {0}")]
    Io(#[from] io::Error),
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),
}

/// One row handed to storage.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRow {
    pub device: MacAddress,
    /// Alias of the device, or its address when it has none
    pub name: String,
    pub temperature_c: Option<f64>,
    pub humidity_percent: Option<u8>,
    pub measured_at: DateTime<Utc>,
}

/// Receiver of named live events (readings and BLE status changes).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: LiveEvent) -> Result<(), SinkError>;
}

/// Receiver of throttled measurement rows.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn store(&self, row: &MeasurementRow) -> Result<(), SinkError>;
}

/// Storage that accepts and discards every row.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStorage;

#[async_trait]
impl StorageSink for NoStorage {
    async fn store(&self, _row: &MeasurementRow) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Line-oriented output over a blocking [`Write`].
///
/// Writes run on the blocking thread pool, so a stalled reader (a full pipe on
/// stdout) only stalls that thread. The caller's future stays cancellable and
/// [`bounded`] can give up on it. A write that cannot get the writer within
/// [`SINK_TIMEOUT`] because an earlier one is still stuck fails with
/// `WouldBlock` instead of queueing another thread.
#[derive(Clone)]
pub struct LineWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LineWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Write `line` plus a newline and flush.
    pub async fn write_line(&self, mut line: String) -> io::Result<()> {
        line.push('\n');
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let Some(mut writer) = inner.try_lock_for(SINK_TIMEOUT) else {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "previous write is still pending",
                ));
            };
            writer.write_all(line.as_bytes())?;
            writer.flush()
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// Run a sink call, giving up after [`SINK_TIMEOUT`].
pub async fn bounded<F>(call: F) -> Result<(), SinkError>
where
    F: Future<Output = Result<(), SinkError>>,
{
    tokio::time::timeout(SINK_TIMEOUT, call)
        .await
        .unwrap_or(Err(SinkError::Timeout(SINK_TIMEOUT)))
}
