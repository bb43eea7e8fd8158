//! Process-wide interval configuration.
//!
//! The three intervals (live broadcast, storage, liveness warning) are always
//! read together, so they live in one [`IntervalConfig`] value behind a single
//! mutex. Updates swap the whole value atomically and then persist it to the
//! JSON settings file in the background; a failed write is logged and never
//! affects the in-memory configuration.

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const MIN_SECONDS: u64 = 30;
pub const MAX_SECONDS: u64 = 15 * 60;
pub const STEP_SECONDS: u64 = 30;

pub const DEFAULT_BROADCAST_SECONDS: u64 = 60;
pub const DEFAULT_STORAGE_SECONDS: u64 = 3 * 60;
pub const DEFAULT_WARNING_SECONDS: u64 = 5 * 60;

/// Key of the intervals object inside the settings file.
const INTERVALS_KEY: &str = "intervals";

/// Errors raised while reading or writing the settings file.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("settings file I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("settings file has an invalid intervals section: {0}")]
    Invalid(String),
}

/// Clamp to `[MIN_SECONDS, MAX_SECONDS]` and snap to the nearest `STEP_SECONDS` multiple.
///
/// Exact half steps round to the even multiple.
pub fn normalize_seconds(value: i64) -> u64 {
    let clamped = value.clamp(MIN_SECONDS as i64, MAX_SECONDS as i64) as f64;
    let steps = (clamped / STEP_SECONDS as f64).round_ties_even() as u64;
    (steps * STEP_SECONDS).clamp(MIN_SECONDS, MAX_SECONDS)
}

/// One consistent set of intervals. Always normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalConfig {
    broadcast_seconds: u64,
    storage_seconds: u64,
    warning_seconds: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            broadcast_seconds: DEFAULT_BROADCAST_SECONDS,
            storage_seconds: DEFAULT_STORAGE_SECONDS,
            warning_seconds: DEFAULT_WARNING_SECONDS,
        }
    }
}

impl IntervalConfig {
    pub fn new(broadcast_seconds: i64, storage_seconds: i64, warning_seconds: i64) -> Self {
        Self {
            broadcast_seconds: normalize_seconds(broadcast_seconds),
            storage_seconds: normalize_seconds(storage_seconds),
            warning_seconds: normalize_seconds(warning_seconds),
        }
    }

    /// Minimum spacing between live broadcasts of one device.
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_seconds)
    }

    /// Minimum spacing between storage writes of one device.
    pub fn storage_interval(&self) -> Duration {
        Duration::from_secs(self.storage_seconds)
    }

    /// Age after which missing BLE activity raises a warning.
    pub fn warning_threshold(&self) -> Duration {
        Duration::from_secs(self.warning_seconds)
    }

    /// Return a copy with the fields present in `update` replaced (and normalized).
    pub fn apply(mut self, update: &IntervalUpdate) -> Self {
        if let Some(v) = update.broadcast_seconds {
            self.broadcast_seconds = normalize_seconds(v);
        }
        if let Some(v) = update.storage_seconds {
            self.storage_seconds = normalize_seconds(v);
        }
        if let Some(v) = update.warning_seconds {
            self.warning_seconds = normalize_seconds(v);
        }
        self
    }

    fn to_file(self) -> IntervalUpdate {
        IntervalUpdate {
            broadcast_seconds: Some(self.broadcast_seconds as i64),
            storage_seconds: Some(self.storage_seconds as i64),
            warning_seconds: Some(self.warning_seconds as i64),
        }
    }
}

/// Partial change request; also the on-disk shape of the intervals section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_seconds: Option<i64>,
}

impl IntervalUpdate {
    pub fn is_empty(&self) -> bool {
        self.broadcast_seconds.is_none()
            && self.storage_seconds.is_none()
            && self.warning_seconds.is_none()
    }
}

#[derive(Debug)]
struct Inner {
    config: Mutex<IntervalConfig>,
    path: Option<PathBuf>,
    /// Serializes file writes so the newest configuration is the one left on disk.
    write_lock: Mutex<()>,
}

/// Shared handle to the interval configuration.
///
/// Cloning is cheap; all clones see the same configuration.
#[derive(Debug, Clone)]
pub struct IntervalSettings {
    inner: Arc<Inner>,
}

impl IntervalSettings {
    /// In-memory settings without a backing file.
    pub fn new(config: IntervalConfig) -> Self {
        Self::build(config, None)
    }

    /// Settings persisted to `path` on every update.
    pub fn with_file(config: IntervalConfig, path: impl Into<PathBuf>) -> Self {
        Self::build(config, Some(path.into()))
    }

    fn build(config: IntervalConfig, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                path,
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Read the configuration stored in `path`, falling back to defaults when the
    /// file or its intervals section does not exist.
    pub fn read_file(path: &Path) -> Result<IntervalConfig, SettingsError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("settings file {} not found, using defaults", path.display());
                return Ok(IntervalConfig::default());
            }
            Err(e) => return Err(e.into()),
        };

        let root: Value = serde_json::from_str(&text)?;
        match root.get(INTERVALS_KEY) {
            None => Ok(IntervalConfig::default()),
            Some(section) => {
                let stored: IntervalUpdate = serde_json::from_value(section.clone())
                    .map_err(|e| SettingsError::Invalid(e.to_string()))?;
                Ok(IntervalConfig::default().apply(&stored))
            }
        }
    }

    /// Current configuration as one consistent value.
    pub fn snapshot(&self) -> IntervalConfig {
        *self.inner.config.lock()
    }

    /// Apply `update` atomically and persist the result in the background.
    ///
    /// Takes effect for the next evaluation by any reader; waits already in
    /// progress are not reset.
    pub fn update(&self, update: IntervalUpdate) -> IntervalConfig {
        let updated = {
            let mut config = self.inner.config.lock();
            *config = config.apply(&update);
            *config
        };

        info!(
            "intervals updated: broadcast={}s, storage={}s, warning={}s",
            updated.broadcast_seconds, updated.storage_seconds, updated.warning_seconds
        );

        if !update.is_empty() {
            self.schedule_persist();
        }
        updated
    }

    fn schedule_persist(&self) {
        if self.inner.path.is_none() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || persist(&inner));
            }
            Err(_) => persist(&inner),
        }
    }
}

fn persist(inner: &Inner) {
    let Some(path) = inner.path.as_deref() else {
        return;
    };
    let _guard = inner.write_lock.lock();
    let config = *inner.config.lock();

    if let Err(e) = write_settings(path, config) {
        warn!("could not persist intervals to {}: {e}", path.display());
    }
}

/// Replace the intervals section of the settings file, keeping every other member.
fn write_settings(path: &Path, config: IntervalConfig) -> Result<(), SettingsError> {
    let mut root = match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Value>(&text)? {
            Value::Object(map) => map,
            _ => return Err(SettingsError::Invalid("root is not an object".into())),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Map::new(),
        Err(e) => return Err(e.into()),
    };

    let mut section = match root.remove(INTERVALS_KEY) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    if let Value::Object(fresh) = serde_json::to_value(config.to_file())? {
        section.extend(fresh);
    }
    root.insert(INTERVALS_KEY.to_string(), Value::Object(section));

    fs::write(path, serde_json::to_string_pretty(&Value::Object(root))?)?;
    Ok(())
}
