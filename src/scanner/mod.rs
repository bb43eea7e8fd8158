//! Advertisement sources.
//!
//! A source hands the dispatcher a channel of raw [`AdvertisementFrame`]s and
//! keeps producing until its cancellation token fires. An `Err` item means the
//! source has failed and will produce nothing further.
//!
//! Real backends (`bluer`, `hci`) forward only manufacturer data that
//! [looks like a TP358](crate::frame::looks_like_tp358) with a 4 or 5 byte
//! payload. [`select_source`] picks the concrete source once at startup.

#[cfg(feature = "bluer")]
pub mod bluer;
pub mod fallback;
#[cfg(feature = "hci")]
pub mod hci;
pub mod simulated;

use crate::frame::{AdvertisementFrame, looks_like_tp358};
use crate::mac_address::MacAddress;
use async_trait::async_trait;
use chrono::Utc;
use log::info;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use fallback::FallbackSource;
pub use simulated::SimulatedSource;

/// Error type for scanner operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// The source stopped delivering frames without being cancelled
    #[error("advertisement source '{0}' stopped unexpectedly")]
    Ended(String),
}

/// One item of a source stream.
pub type FrameResult = Result<AdvertisementFrame, ScanError>;

/// Channel buffer size for frames.
pub const FRAME_CHANNEL_BUFFER_SIZE: usize = 100;

/// Vendor marker byte that leads the little-endian company id of TP358 sensors.
pub const TP358_MARKER: u8 = 0xC2;

/// Producer of advertisement frames.
#[async_trait]
pub trait AdvertisementSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Start producing frames until `cancel` fires.
    ///
    /// An error here means the source could not start at all.
    async fn watch(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<FrameResult>, ScanError>;
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Backend {
    /// Best real backend for this host, falling back to simulated data
    #[default]
    Auto,
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
    /// Synthetic frames from three fixed sensors
    Simulated,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Auto => write!(f, "auto"),
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            Backend::Simulated => write!(f, "simulated"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Backend::Auto),
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            "simulated" | "sim" | "fake" => Ok(Backend::Simulated),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Build the source for `backend`.
///
/// `Auto` uses a real backend wrapped in a [`FallbackSource`] when the host
/// exposes Bluetooth controllers, and simulated data otherwise. An explicitly
/// chosen backend is used alone, so its failures are fatal.
pub fn select_source(backend: Backend) -> Arc<dyn AdvertisementSource> {
    match backend {
        Backend::Auto => match real_source() {
            Some(primary) if bluetooth_present() => {
                info!("using {} backend with simulated fallback", primary.name());
                Arc::new(FallbackSource::new(primary, Arc::new(SimulatedSource::new())))
            }
            _ => {
                info!("no Bluetooth controller found, using simulated backend");
                Arc::new(SimulatedSource::new())
            }
        },
        #[cfg(feature = "bluer")]
        Backend::Bluer => Arc::new(bluer::BluerSource),
        #[cfg(feature = "hci")]
        Backend::Hci => Arc::new(hci::HciSource::default()),
        Backend::Simulated => Arc::new(SimulatedSource::new()),
    }
}

#[allow(unreachable_code)]
fn real_source() -> Option<Arc<dyn AdvertisementSource>> {
    #[cfg(feature = "bluer")]
    return Some(Arc::new(bluer::BluerSource));
    #[cfg(feature = "hci")]
    return Some(Arc::new(hci::HciSource::default()));
    None
}

fn bluetooth_present() -> bool {
    cfg!(target_os = "linux")
        && std::fs::read_dir("/sys/class/bluetooth")
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
}

/// Build a frame from one manufacturer data entry, or `None` if it is not TP358 data.
pub fn tp358_frame(
    device: MacAddress,
    rssi: i16,
    company_id: u16,
    payload: &[u8],
) -> Option<AdvertisementFrame> {
    if !looks_like_tp358(company_id) || !matches!(payload.len(), 4 | 5) {
        return None;
    }
    Some(AdvertisementFrame {
        timestamp: Utc::now(),
        device,
        rssi,
        company_id,
        payload: payload.to_vec(),
    })
}
