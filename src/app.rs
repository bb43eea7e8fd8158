//! Core application runner (business logic) for `tp358-listener`.
//!
//! This module is intentionally decoupled from process setup (logging, signal
//! handling, exit codes) so the pipeline can be driven deterministically with
//! an injected source and injected sinks.

use crate::alias::{Alias, parse_alias, to_map};
use crate::dispatcher::Dispatcher;
use crate::event::LiveEvent;
use crate::liveness::LivenessMonitor;
use crate::output::hub::LiveHub;
use crate::output::influxdb::{DEFAULT_MEASUREMENT, InfluxDbStorage};
#[cfg(feature = "postgres")]
use crate::output::postgres::PostgresStorage;
use crate::output::{EventSink, LineWriter, NoStorage, SinkError, StorageSink};
use crate::scanner::{AdvertisementSource, Backend, ScanError, select_source};
use crate::settings::{IntervalSettings, IntervalUpdate, SettingsError};
use crate::throttle::parse_duration;
use clap::Parser;
use log::{info, warn};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SETTINGS_FILE: &str = "tp358-settings.json";

/// Where throttled measurements are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum StorageKind {
    /// Discard measurements
    None,
    /// InfluxDB line protocol on stdout
    #[default]
    #[value(name = "influxdb")]
    InfluxDb,
    /// Rows in a PostgreSQL `measurements` table
    #[cfg(feature = "postgres")]
    Postgres,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::None => write!(f, "none"),
            StorageKind::InfluxDb => write!(f, "influxdb"),
            #[cfg(feature = "postgres")]
            StorageKind::Postgres => write!(f, "postgres"),
        }
    }
}

/// Command line configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// JSON settings file holding the interval configuration.
    #[arg(long, env = "TP358_SETTINGS", default_value = DEFAULT_SETTINGS_FILE)]
    pub settings: PathBuf,

    /// Minimum spacing of live events per sensor (30s to 15m, in 30s steps).
    /// Accepts duration with suffix: 30s, 2m, 1h. Written back to the settings file.
    #[arg(long, value_parser = parse_duration)]
    pub broadcast_interval: Option<Duration>,

    /// Minimum spacing of stored measurements per sensor (30s to 15m, in 30s steps).
    /// Written back to the settings file.
    #[arg(long, value_parser = parse_duration)]
    pub storage_interval: Option<Duration>,

    /// Warn when no BLE frame was received or decoded for this long
    /// (30s to 15m, in 30s steps). Written back to the settings file.
    #[arg(long, value_parser = parse_duration)]
    pub warning_threshold: Option<Duration>,

    /// Storage for throttled measurements
    #[arg(long, default_value_t, value_enum)]
    pub storage: StorageKind,

    /// The name of the measurement in InfluxDB line protocol.
    #[arg(long, default_value = DEFAULT_MEASUREMENT)]
    pub influxdb_measurement: String,

    /// PostgreSQL connection string, required with `--storage postgres`.
    #[arg(long, env = "DATABASE_URL", required_if_eq("storage", "postgres"))]
    pub database_url: Option<String>,

    /// Specify human-readable alias for a sensor.
    /// Format: --alias FB:B9:30:BB:5E:55=Kitchen
    #[arg(long = "alias", value_parser = parse_alias, value_name = "ALIAS")]
    pub aliases: Vec<Alias>,

    /// Print live events (readings and BLE status changes) as JSON lines on stdout
    #[arg(long)]
    pub events: bool,

    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Errors returned by the application runner.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("storage setup failed: {0}")]
    Storage(#[from] SinkError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid options: {0}")]
    Options(String),
}

impl Options {
    /// Reject option combinations that clap cannot express.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.events && self.storage == StorageKind::InfluxDb {
            return Err(RunError::Options(
                "--events and --storage influxdb both write to stdout; \
                 use --storage none or postgres with --events"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn whole_seconds(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

/// Load the settings file and apply command line overrides.
pub fn load_settings(options: &Options) -> Result<IntervalSettings, RunError> {
    let stored = IntervalSettings::read_file(&options.settings)?;
    let settings = IntervalSettings::with_file(stored, &options.settings);

    let overrides = IntervalUpdate {
        broadcast_seconds: options.broadcast_interval.map(whole_seconds),
        storage_seconds: options.storage_interval.map(whole_seconds),
        warning_seconds: options.warning_threshold.map(whole_seconds),
    };
    if !overrides.is_empty() {
        settings.update(overrides);
    }
    Ok(settings)
}

async fn open_storage(options: &Options) -> Result<Arc<dyn StorageSink>, RunError> {
    let storage: Arc<dyn StorageSink> = match options.storage {
        StorageKind::None => Arc::new(NoStorage),
        StorageKind::InfluxDb => Arc::new(InfluxDbStorage::stdout(
            options.influxdb_measurement.clone(),
        )),
        #[cfg(feature = "postgres")]
        StorageKind::Postgres => {
            let url = options.database_url.as_deref().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "--database-url is required")
            })?;
            Arc::new(PostgresStorage::connect(url).await?)
        }
    };
    Ok(storage)
}

/// Write every event from `rx` to `out` as one JSON line until `cancel` fires
/// or the hub is gone.
pub fn spawn_event_printer(
    mut rx: broadcast::Receiver<LiveEvent>,
    out: LineWriter,
    cancel: CancellationToken,
) -> JoinHandle<io::Result<()>> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = rx.recv() => event,
            };
            match event {
                Ok(event) => out.write_line(serde_json::to_string(&event)?).await?,
                Err(RecvError::Lagged(skipped)) => warn!("event printer skipped {skipped} events"),
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    })
}

/// Run source, dispatcher and liveness monitor until the source ends, fails or
/// `cancel` fires.
pub async fn run_pipeline(
    source: &dyn AdvertisementSource,
    dispatcher: &mut Dispatcher,
    monitor: LivenessMonitor,
    cancel: &CancellationToken,
) -> Result<(), RunError> {
    let monitor_cancel = cancel.child_token();
    let monitor_task = tokio::spawn(monitor.run(monitor_cancel.clone()));

    let result = async {
        let frames = source.watch(cancel.clone()).await?;
        dispatcher.run(frames, cancel).await
    }
    .await;

    monitor_cancel.cancel();
    if let Err(e) = monitor_task.await {
        warn!("liveness monitor task failed: {e}");
    }
    Ok(result?)
}

/// Wire everything from `options` and run until cancelled.
///
/// The latest reading of every sensor is logged on the way out.
pub async fn run(options: Options, cancel: CancellationToken) -> Result<(), RunError> {
    options.validate()?;
    let settings = load_settings(&options)?;
    let storage = open_storage(&options).await?;

    let hub = LiveHub::default();
    let printer_cancel = cancel.child_token();
    let printer = options.events.then(|| {
        spawn_event_printer(
            hub.subscribe(),
            LineWriter::stdout(),
            printer_cancel.clone(),
        )
    });

    let events: Arc<dyn EventSink> = Arc::new(hub);
    let mut dispatcher = Dispatcher::new(settings.clone(), Arc::clone(&events), storage)
        .with_aliases(to_map(&options.aliases));
    let monitor = LivenessMonitor::new(dispatcher.clock(), settings, events);

    let source = select_source(options.backend);
    info!("listening for TP358 sensors ({} backend)", source.name());
    let result = run_pipeline(source.as_ref(), &mut dispatcher, monitor, &cancel).await;

    info!(
        "latest readings:\n{}",
        dispatcher.snapshot().summary(dispatcher.aliases())
    );

    printer_cancel.cancel();
    if let Some(printer) = printer {
        match printer.await {
            Ok(Err(e)) if result.is_ok() => return Err(e.into()),
            Ok(_) => {}
            Err(e) => warn!("event printer task failed: {e}"),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::IntervalConfig;
    use crate::test_utils::{
        FakeSource, OTHER_MAC, RecordingEventSink, RecordingStorage, SharedBuffer, TEST_MAC, frame,
    };

    const TP358: [u8; 4] = [0x00, 0x37, 0x02, 0x2C];

    fn scratch_file(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tp358-app-{}-{name}.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn parts() -> (Dispatcher, LivenessMonitor, Arc<RecordingEventSink>, Arc<RecordingStorage>) {
        let settings = IntervalSettings::new(IntervalConfig::default());
        let events = Arc::new(RecordingEventSink::default());
        let storage = Arc::new(RecordingStorage::default());
        let dispatcher = Dispatcher::new(settings.clone(), events.clone(), storage.clone());
        let monitor = LivenessMonitor::new(dispatcher.clock(), settings, events.clone());
        (dispatcher, monitor, events, storage)
    }

    #[test]
    fn test_options_defaults() {
        let options = Options::try_parse_from(["tp358-listener"]).unwrap();
        assert_eq!(options.backend, Backend::Auto);
        assert_eq!(options.storage, StorageKind::InfluxDb);
        assert_eq!(options.influxdb_measurement, "tp358_measurement");
        assert_eq!(options.broadcast_interval, None);
        assert!(!options.events);
    }

    #[test]
    fn test_options_parse() {
        let options = Options::try_parse_from([
            "tp358-listener",
            "--backend",
            "simulated",
            "--storage",
            "none",
            "--broadcast-interval",
            "2m",
            "--alias",
            "AA:BB:CC:DD:EE:FF=Kitchen",
            "--events",
        ])
        .unwrap();
        assert_eq!(options.backend, Backend::Simulated);
        assert_eq!(options.storage, StorageKind::None);
        assert_eq!(options.broadcast_interval, Some(Duration::from_secs(120)));
        assert_eq!(options.aliases[0].address, TEST_MAC);
        assert!(options.events);
    }

    #[test]
    fn test_events_conflict_with_stdout_storage() {
        let options = Options::try_parse_from(["tp358-listener", "--events"]).unwrap();
        assert!(matches!(options.validate(), Err(RunError::Options(_))));

        let options =
            Options::try_parse_from(["tp358-listener", "--events", "--storage", "none"]).unwrap();
        assert!(options.validate().is_ok());
        let options = Options::try_parse_from(["tp358-listener"]).unwrap();
        assert!(options.validate().is_ok());
    }

    #[tokio::test]
    async fn test_run_rejects_conflicting_options() {
        let options = Options::try_parse_from(["tp358-listener", "--events"]).unwrap();
        let result = run(options, CancellationToken::new()).await;
        assert!(matches!(result, Err(RunError::Options(_))));
    }

    #[test]
    fn test_options_reject_bad_alias() {
        assert!(Options::try_parse_from(["tp358-listener", "--alias", "Kitchen"]).is_err());
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn test_postgres_requires_database_url() {
        // SAFETY: no other test reads DATABASE_URL
        unsafe { std::env::remove_var("DATABASE_URL") };
        assert!(Options::try_parse_from(["tp358-listener", "--storage", "postgres"]).is_err());
        let options = Options::try_parse_from([
            "tp358-listener",
            "--storage",
            "postgres",
            "--database-url",
            "postgres://localhost/tp358",
        ])
        .unwrap();
        assert_eq!(options.storage, StorageKind::Postgres);
    }

    #[test]
    fn test_load_settings_applies_overrides() {
        let path = scratch_file("overrides");
        std::fs::write(&path, r#"{"intervals": {"storageSeconds": 600}}"#).unwrap();
        let mut options = Options::try_parse_from(["tp358-listener"]).unwrap();
        options.settings = path.clone();
        options.broadcast_interval = Some(Duration::from_secs(100));

        let config = load_settings(&options).unwrap().snapshot();
        assert_eq!(config.broadcast_interval(), Duration::from_secs(90));
        assert_eq!(config.storage_interval(), Duration::from_secs(600));
        assert_eq!(config.warning_threshold(), Duration::from_secs(300));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_pipeline_dispatches_frames() {
        let (mut dispatcher, monitor, events, storage) = parts();
        let source = FakeSource::new(vec![
            Ok(frame(TEST_MAC, 0xCDC2, &TP358)),
            Ok(frame(TEST_MAC, 0xCDC2, &TP358)),
            Ok(frame(OTHER_MAC, 0x00C2, &[0x00, 0x28, 0x00, 0x00, 0x01])),
        ]);

        run_pipeline(&source, &mut dispatcher, monitor, &CancellationToken::new())
            .await
            .unwrap();

        // second TEST_MAC frame arrives well within the default intervals
        assert_eq!(events.events().len(), 2);
        assert_eq!(storage.rows().len(), 2);
        let snapshot = dispatcher.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&OTHER_MAC).unwrap().humidity_percent, Some(0x28));
        assert_eq!(snapshot.get(&OTHER_MAC).unwrap().battery_percent, Some(100));
    }

    #[tokio::test]
    async fn test_pipeline_propagates_source_errors() {
        let (mut dispatcher, monitor, _, _) = parts();
        let source = FakeSource::new(vec![
            Ok(frame(TEST_MAC, 0xCDC2, &TP358)),
            Err(ScanError::Bluetooth("adapter removed".into())),
        ]);

        let cancel = CancellationToken::new();
        let result = run_pipeline(&source, &mut dispatcher, monitor, &cancel).await;
        assert!(matches!(result, Err(RunError::Scan(ScanError::Bluetooth(_)))));
        assert_eq!(dispatcher.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_propagates_start_errors() {
        let (mut dispatcher, monitor, _, _) = parts();
        let source = FakeSource::failing_start(ScanError::Bluetooth("no adapter".into()));

        let cancel = CancellationToken::new();
        let result = run_pipeline(&source, &mut dispatcher, monitor, &cancel).await;
        assert!(matches!(result, Err(RunError::Scan(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_stops_on_cancel() {
        let (mut dispatcher, monitor, events, _) = parts();
        let source = FakeSource::held_open(vec![Ok(frame(TEST_MAC, 0xCDC2, &TP358))]);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            canceller.cancel();
        });

        run_pipeline(&source, &mut dispatcher, monitor, &cancel)
            .await
            .unwrap();
        // one reading; the first liveness tick at 30 s sees fresh activity
        assert_eq!(events.events().len(), 1);
    }

    #[tokio::test]
    async fn test_event_printer_writes_json_lines() {
        let hub = LiveHub::default();
        let buffer = SharedBuffer::default();
        let cancel = CancellationToken::new();
        let out = LineWriter::new(Box::new(buffer.clone()));
        let printer = spawn_event_printer(hub.subscribe(), out, cancel);

        let dispatcher_events: Arc<dyn EventSink> = Arc::new(hub);
        let storage = Arc::new(RecordingStorage::default());
        let settings = IntervalSettings::new(IntervalConfig::default());
        let mut dispatcher = Dispatcher::new(settings, dispatcher_events, storage);
        dispatcher
            .handle_frame(frame(TEST_MAC, 0xCDC2, &TP358), chrono::Utc::now())
            .await;
        drop(dispatcher);

        printer.await.unwrap().unwrap();
        let output = buffer.contents();
        let line: serde_json::Value = serde_json::from_str(output.trim_end()).unwrap();
        assert_eq!(line["event"], "reading");
        assert_eq!(line["payload"]["deviceAddress"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(line["payload"]["temperatureC"], 20.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_simulated_backend() {
        let path = scratch_file("run");
        let mut options = Options::try_parse_from([
            "tp358-listener",
            "--backend",
            "simulated",
            "--storage",
            "none",
        ])
        .unwrap();
        options.settings = path.clone();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            canceller.cancel();
        });

        run(options, cancel).await.unwrap();
        // nothing was updated, so nothing was written
        assert!(!path.exists());
    }
}
