//! Benchmarks for the TP358 processing pipeline.
//!
//! Covers the pure decoder and the dispatcher loop fed from an in-memory
//! source, with sinks that accept everything.

use async_trait::async_trait;
use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tp358_listener::settings::IntervalConfig;
use tp358_listener::{
    AdvertisementFrame, Dispatcher, EventSink, FrameResult, IntervalSettings, LiveEvent, MacAddress,
    MeasurementRow, SinkError, StorageSink, decode,
};

const TP358: [u8; 4] = [0x00, 0x37, 0x02, 0x2C];
const TP358S: [u8; 5] = [0x00, 0x28, 0x22, 0x1B, 0x01];

struct Discard;

#[async_trait]
impl EventSink for Discard {
    async fn publish(&self, event: LiveEvent) -> Result<(), SinkError> {
        black_box(event);
        Ok(())
    }
}

#[async_trait]
impl StorageSink for Discard {
    async fn store(&self, row: &MeasurementRow) -> Result<(), SinkError> {
        black_box(row);
        Ok(())
    }
}

fn frame(device: MacAddress, payload: &[u8]) -> AdvertisementFrame {
    AdvertisementFrame {
        timestamp: Utc::now(),
        device,
        rssi: -60,
        company_id: 0xCDC2,
        payload: payload.to_vec(),
    }
}

fn dispatcher() -> Dispatcher {
    let settings = IntervalSettings::new(IntervalConfig::default());
    Dispatcher::new(settings, Arc::new(Discard), Arc::new(Discard))
}

/// Push `frames` through a fresh dispatcher.
async fn run_frames(frames: Vec<AdvertisementFrame>) -> usize {
    let (tx, rx) = mpsc::channel::<FrameResult>(frames.len().max(1));
    for f in frames {
        let _ = tx.send(Ok(f)).await;
    }
    drop(tx);

    let mut dispatcher = dispatcher();
    let cancel = CancellationToken::new();
    let _ = dispatcher.run(rx, &cancel).await;
    dispatcher.snapshot().len()
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("tp358", |b| b.iter(|| decode(black_box(&TP358), black_box(0xCDC2))));
    group.bench_function("tp358s", |b| b.iter(|| decode(black_box(&TP358S), black_box(0x00C2))));
    group.bench_function("unsupported", |b| {
        b.iter(|| decode(black_box(&[0u8; 6]), black_box(0x00C2)))
    });
    group.finish();
}

/// One device, most frames throttled
fn bench_same_device(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_same_device");
    let rt = Runtime::new().unwrap();
    let mac = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

    for batch_size in [1, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &size| {
                let frames: Vec<_> = (0..size).map(|_| frame(mac, &TP358)).collect();
                b.iter(|| black_box(rt.block_on(run_frames(frames.clone()))))
            },
        );
    }
    group.finish();
}

/// Many devices, every frame dispatched
fn bench_many_devices(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_many_devices");
    let rt = Runtime::new().unwrap();

    let frames: Vec<_> = (0..100u8)
        .map(|i| frame(MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, i]), &TP358S))
        .collect();

    group.throughput(Throughput::Elements(frames.len() as u64));
    group.bench_function("100_devices", |b| {
        b.iter(|| {
            let devices = rt.block_on(run_frames(frames.clone()));
            debug_assert_eq!(devices, 100);
            black_box(devices)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_decode, bench_same_device, bench_many_devices);
criterion_main!(benches);
