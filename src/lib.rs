//! `tp358-listener` library.
//!
//! The binary (`src/main.rs`) is responsible for logging setup, signal handling
//! and process exit codes. The pipeline itself lives in [`crate::app`] and its
//! building blocks, where it can be tested deterministically with an injected
//! source and injected sinks:
//!
//! source → [`decoder`] → [`dispatcher`] → {live events, storage, [`snapshot`]},
//! with [`liveness`] watching the dispatcher's activity clock.

pub mod alias;
pub mod app;
pub mod decoder;
pub mod dispatcher;
pub mod event;
pub mod frame;
pub mod liveness;
pub mod mac_address;
pub mod output;
pub mod scanner;
pub mod settings;
pub mod snapshot;
pub mod throttle;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use alias::{Alias, AliasMap, parse_alias, to_map};
pub use decoder::{DecodeError, PayloadVariant, Reading, decode};
pub use dispatcher::{Dispatcher, FrameOutcome};
pub use event::{BleStatus, LiveEvent, ReadingEvent};
pub use frame::AdvertisementFrame;
pub use liveness::{ActivityClock, LivenessMonitor};
pub use mac_address::MacAddress;
pub use output::{EventSink, MeasurementRow, SinkError, StorageSink};
pub use scanner::{AdvertisementSource, Backend, FrameResult, ScanError};
pub use settings::{IntervalConfig, IntervalSettings, IntervalUpdate};
pub use snapshot::SnapshotCache;
pub use throttle::{Throttle, parse_duration};
