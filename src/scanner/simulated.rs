//! Synthetic advertisement source.
//!
//! Emits one frame per simulated sensor every second. Frames use the TP358S
//! layout with the fake-data battery marker (`0xFF`) so they are easy to tell
//! apart from real sensors downstream.

use super::{AdvertisementSource, FRAME_CHANNEL_BUFFER_SIZE, FrameResult, ScanError};
use crate::frame::AdvertisementFrame;
use crate::mac_address::MacAddress;
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Delay between two rounds over all sensors.
pub const ROUND_INTERVAL: Duration = Duration::from_secs(1);

const SEED: u64 = 1;
const TEMPERATURE_OFFSET: f64 = 1200.0;

/// A simulated sensor: address plus temperature (°C) and humidity (%) bias.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedSensor {
    pub device: MacAddress,
    pub temperature_bias: f64,
    pub humidity_bias: f64,
}

pub const SENSORS: [SimulatedSensor; 3] = [
    SimulatedSensor {
        device: MacAddress([0xFB, 0xB9, 0x30, 0xBB, 0x5E, 0x55]),
        temperature_bias: 1.0,
        humidity_bias: 0.5,
    },
    SimulatedSensor {
        device: MacAddress([0xF4, 0xB8, 0x2A, 0xC1, 0x37, 0xAF]),
        temperature_bias: 0.0,
        humidity_bias: 0.0,
    },
    SimulatedSensor {
        device: MacAddress([0xFA, 0xC2, 0x7D, 0x1A, 0xC3, 0xEA]),
        temperature_bias: -0.6,
        humidity_bias: 1.0,
    },
];

/// Build one synthetic frame for `sensor`.
pub fn simulated_frame(sensor: &SimulatedSensor, rng: &mut impl Rng) -> AdvertisementFrame {
    let humidity = 41.0 + rng.gen_range(0.0..2.0) + sensor.humidity_bias;
    let raw_humidity = (humidity * 256.0).round() as u16;

    let temperature = 22.0 + rng.gen_range(0.0..1.0) + sensor.temperature_bias;
    let raw_temperature = (temperature * 256.0 + TEMPERATURE_OFFSET).round() as u16;

    let [h0, h1] = raw_humidity.to_le_bytes();
    let [t0, t1] = raw_temperature.to_le_bytes();
    let company_id = 0x00C2 | (u16::from((temperature * 10.0) as u8) << 8);

    AdvertisementFrame {
        timestamp: Utc::now(),
        device: sensor.device,
        rssi: -55 - rng.gen_range(0..8),
        company_id,
        payload: vec![h0, h1, t0, t1, 0xFF],
    }
}

/// Source producing [`SENSORS`] data from a seeded random generator.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    interval: Duration,
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self::with_interval(ROUND_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl AdvertisementSource for SimulatedSource {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn watch(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<FrameResult>, ScanError> {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_BUFFER_SIZE);
        let interval = self.interval;

        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(SEED);
            loop {
                for sensor in &SENSORS {
                    let frame = simulated_frame(sensor, &mut rng);
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        Ok(rx)
    }
}
