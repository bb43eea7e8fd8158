//! Raw HCI socket backend.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{AdvertisementSource, FRAME_CHANNEL_BUFFER_SIZE, FrameResult, ScanError, tp358_frame};
use crate::frame::AdvertisementFrame;
use crate::mac_address::MacAddress;
use async_trait::async_trait;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use log::debug;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

const EVT_LE_META_EVENT: u8 = 0x3E;
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;
/// 10 ms in 0.625 ms units
const SCAN_INTERVAL: u16 = 0x0010;
const SCAN_WINDOW: u16 = 0x0010;

const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Largest HCI event: 2 header bytes + 255 parameter bytes, plus the packet type.
const MAX_EVENT_SIZE: usize = 258;

#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    /// Filter passing only LE meta events.
    fn le_meta_events() -> Self {
        let mut filter = Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        };
        filter.type_mask |= 1 << u32::from(HCI_EVENT_PKT);
        let bit = usize::from(EVT_LE_META_EVENT);
        filter.event_mask[bit / 32] |= 1 << (bit % 32);
        filter
    }
}

fn os_error(what: &str) -> ScanError {
    ScanError::Bluetooth(format!("{what}: {}", io::Error::last_os_error()))
}

/// A raw HCI socket bound to one controller.
struct HciSocket {
    fd: OwnedFd,
}

impl HciSocket {
    fn open(dev_id: u16) -> Result<Self, ScanError> {
        // SOCK_NONBLOCK is required for AsyncFd
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                SOCK_RAW | SOCK_CLOEXEC | SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(os_error("failed to create HCI socket"));
        }
        let socket = Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };
        let ret = unsafe {
            libc::bind(
                socket.fd.as_raw_fd(),
                &addr as *const SockaddrHci as *const sockaddr,
                mem::size_of::<SockaddrHci>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error(&format!("failed to bind HCI socket to hci{dev_id}")));
        }
        Ok(socket)
    }

    fn set_filter(&self, filter: &HciFilter) -> Result<(), ScanError> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                filter as *const HciFilter as *const c_void,
                mem::size_of::<HciFilter>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error("failed to set HCI filter"));
        }
        Ok(())
    }

    fn send_command(&self, ogf: u16, ocf: u16, params: &[u8]) -> Result<(), ScanError> {
        let packet = command_packet(ogf, ocf, params);
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                packet.as_ptr() as *const c_void,
                packet.len(),
            )
        };
        if ret < 0 {
            return Err(os_error("failed to send HCI command"));
        }
        Ok(())
    }

    fn set_scan_enabled(&self, enabled: bool) -> Result<(), ScanError> {
        // duplicates are kept so every advertisement becomes a frame
        self.send_command(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[u8::from(enabled), 0x00])
    }

    fn start_passive_scan(&self) -> Result<(), ScanError> {
        let [interval_lo, interval_hi] = SCAN_INTERVAL.to_le_bytes();
        let [window_lo, window_hi] = SCAN_WINDOW.to_le_bytes();
        self.send_command(
            OGF_LE_CTL,
            OCF_LE_SET_SCAN_PARAMETERS,
            &[
                LE_SCAN_PASSIVE,
                interval_lo,
                interval_hi,
                window_lo,
                window_hi,
                LE_PUBLIC_ADDRESS,
                FILTER_POLICY_ACCEPT_ALL,
            ],
        )?;
        self.set_scan_enabled(true)
    }
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.as_raw_fd()
    }
}

/// Create an HCI command packet
fn command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let [opcode_lo, opcode_hi] = ((ogf << 10) | ocf).to_le_bytes();
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.extend_from_slice(&[HCI_COMMAND_PKT, opcode_lo, opcode_hi, params.len() as u8]);
    packet.extend_from_slice(params);
    packet
}

/// Extract TP358 frames from an HCI event packet.
///
/// Non-advertising events and malformed reports yield nothing; one packet may
/// carry several reports.
fn parse_advertising_event(packet: &[u8]) -> Vec<AdvertisementFrame> {
    let mut frames = Vec::new();
    let [HCI_EVENT_PKT, EVT_LE_META_EVENT, _, EVT_LE_ADVERTISING_REPORT, num_reports, rest @ ..] =
        packet
    else {
        return frames;
    };

    let mut reports = rest;
    for _ in 0..*num_reports {
        // event_type(1) addr_type(1) addr(6) data_len(1) data(data_len) rssi(1)
        let [_, _, a0, a1, a2, a3, a4, a5, data_len, tail @ ..] = reports else {
            break;
        };
        let data_len = usize::from(*data_len);
        if tail.len() < data_len + 1 {
            break;
        }
        let device = MacAddress::from_le_bytes([*a0, *a1, *a2, *a3, *a4, *a5]);
        let rssi = i16::from(tail[data_len] as i8);

        for (company_id, payload) in manufacturer_data(&tail[..data_len]) {
            frames.extend(tp358_frame(device, rssi, company_id, payload));
        }
        reports = &tail[data_len + 1..];
    }
    frames
}

/// Iterate the manufacturer data AD structures of an advertisement.
fn manufacturer_data(mut ad: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    std::iter::from_fn(move || {
        loop {
            let (&len, rest) = ad.split_first()?;
            let len = usize::from(len);
            if len == 0 || rest.len() < len {
                return None;
            }
            let (structure, next) = rest.split_at(len);
            ad = next;
            if let [AD_TYPE_MANUFACTURER_DATA, id_lo, id_hi, payload @ ..] = structure {
                return Some((u16::from_le_bytes([*id_lo, *id_hi]), payload));
            }
        }
    })
}

/// Source reading advertising reports straight from a controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct HciSource {
    /// Controller index (`hci0` is 0)
    pub device_id: u16,
}

#[async_trait]
impl AdvertisementSource for HciSource {
    fn name(&self) -> &'static str {
        "hci"
    }

    async fn watch(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<FrameResult>, ScanError> {
        let events = HciSocket::open(self.device_id)?;
        events.set_filter(&HciFilter::le_meta_events())?;

        let commands = HciSocket::open(self.device_id)?;
        commands.start_passive_scan()?;

        let async_fd = AsyncFd::new(events)
            .map_err(|e| ScanError::Bluetooth(format!("failed to create async fd: {e}")))?;
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_BUFFER_SIZE);

        tokio::spawn(async move {
            if let Err(e) = read_events(&async_fd, &tx, &cancel).await {
                let _ = tx.send(Err(e)).await;
            }
            if let Err(e) = commands.set_scan_enabled(false) {
                debug!("could not disable LE scan: {e}");
            }
        });

        Ok(rx)
    }
}

/// Read events until cancelled or the receiver is gone.
async fn read_events(
    socket: &AsyncFd<HciSocket>,
    tx: &mpsc::Sender<FrameResult>,
    cancel: &CancellationToken,
) -> Result<(), ScanError> {
    let mut buf = [0u8; MAX_EVENT_SIZE];
    loop {
        let mut guard = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            guard = socket.readable() => guard.map_err(|e| ScanError::Bluetooth(e.to_string()))?,
        };

        // Drain all available packets before waiting again
        loop {
            let read = guard.try_io(|inner| {
                let ret = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut c_void,
                        buf.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            });
            let n = match read {
                Ok(Ok(0)) => return Err(ScanError::Ended("hci".into())),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(ScanError::Bluetooth(format!("HCI read failed: {e}"))),
                Err(_would_block) => break,
            };

            for frame in parse_advertising_event(&buf[..n]) {
                if tx.send(Ok(frame)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
