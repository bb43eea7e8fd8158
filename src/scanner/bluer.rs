//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.
//!
//! An advertisement monitor reports each matching device once; after that the
//! device's property changes (RSSI, manufacturer data) are followed so every
//! new advertisement becomes a frame.

use super::{
    AdvertisementSource, FRAME_CHANNEL_BUFFER_SIZE, FrameResult, ScanError, TP358_MARKER,
    tp358_frame,
};
use async_trait::async_trait;
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::{StreamExt, pin_mut};
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
const MANUFACTURER_DATA_TYPE: u8 = 0xff;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Source backed by the default BlueZ adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct BluerSource;

#[async_trait]
impl AdvertisementSource for BluerSource {
    fn name(&self) -> &'static str {
        "bluer"
    }

    async fn watch(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<FrameResult>, ScanError> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_BUFFER_SIZE);

        // The company id is little-endian on air, so its low byte comes first.
        let pattern = Pattern {
            data_type: MANUFACTURER_DATA_TYPE,
            start_position: 0,
            content: vec![TP358_MARKER],
        };

        let monitor_manager = adapter.monitor().await?;
        let mut monitor_handle = monitor_manager
            .register(Monitor {
                patterns: Some(vec![pattern]),
                ..Default::default()
            })
            .await?;

        // Spawn a task that owns all Bluetooth state and runs the event loop
        tokio::spawn(async move {
            let _session = session;
            let _monitor_manager = monitor_manager;
            let followed: Arc<Mutex<HashSet<Address>>> = Arc::default();

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = monitor_handle.next() => event,
                };
                let Some(event) = event else {
                    let _ = tx.send(Err(ScanError::Ended("bluer".into()))).await;
                    return;
                };
                let MonitorEvent::DeviceFound(device_id) = event else {
                    continue;
                };

                let address = device_id.device;
                if !followed.lock().insert(address) {
                    continue;
                }
                match start_following(&adapter, address, &tx).await {
                    Ok(device) => {
                        let tx = tx.clone();
                        let cancel = cancel.clone();
                        let followed = Arc::clone(&followed);
                        tokio::spawn(async move {
                            if let Err(e) = follow_device(&device, tx, cancel).await {
                                debug!("stopped following {address}: {e}");
                            }
                            followed.lock().remove(&address);
                        });
                    }
                    Err(e) => {
                        debug!("could not read {address}: {e}");
                        followed.lock().remove(&address);
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Report the device's current advertisement and return it for following.
async fn start_following(
    adapter: &Adapter,
    address: Address,
    tx: &mpsc::Sender<FrameResult>,
) -> Result<Device, ScanError> {
    let device = adapter.device(address)?;
    let rssi = device.rssi().await?.unwrap_or_default();
    if let Some(data) = device.manufacturer_data().await? {
        send_frames(address, rssi, &data, tx).await;
    }
    Ok(device)
}

/// Turn property changes of `device` into frames until cancelled.
async fn follow_device(
    device: &Device,
    tx: mpsc::Sender<FrameResult>,
    cancel: CancellationToken,
) -> Result<(), ScanError> {
    let address = device.address();
    let mut rssi = device.rssi().await?.unwrap_or_default();
    let events = device.events().await?;
    pin_mut!(events);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = events.next() => event,
        };
        let Some(DeviceEvent::PropertyChanged(property)) = event else {
            return Ok(());
        };
        match property {
            DeviceProperty::Rssi(value) => rssi = value,
            DeviceProperty::ManufacturerData(data) => {
                if !send_frames(address, rssi, &data, &tx).await {
                    return Ok(());
                }
            }
            _ => {}
        }
    }
}

/// Send every TP358 entry of `data`. Returns `false` once the receiver is gone.
async fn send_frames(
    address: Address,
    rssi: i16,
    data: &HashMap<u16, Vec<u8>>,
    tx: &mpsc::Sender<FrameResult>,
) -> bool {
    for (company_id, payload) in data {
        if let Some(frame) = tp358_frame(address.into(), rssi, *company_id, payload)
            && tx.send(Ok(frame)).await.is_err()
        {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac_address::MacAddress;

    #[test]
    fn test_address_to_mac_address() {
        let addr = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let mac: MacAddress = addr.into();
        assert_eq!(mac, MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
    }

    #[tokio::test]
    async fn test_send_frames_keeps_only_tp358_entries() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut data = HashMap::new();
        data.insert(0xCDC2, vec![0x00, 0x37, 0x02, 0x2C]);
        data.insert(0x004C, vec![0x02, 0x15, 0x00, 0x00]);

        let addr = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert!(send_frames(addr, -70, &data, &tx).await);
        drop(tx);

        let frame = rx.recv().await.unwrap().unwrap();
        assert_eq!(frame.company_id, 0xCDC2);
        assert_eq!(frame.rssi, -70);
        assert!(rx.recv().await.is_none());
    }
}
