//! InfluxDB line protocol storage.
//!
//! Each stored row becomes one line on the wrapped writer (stdout by default),
//! ready to be piped into `influx write` or Telegraf.

use super::{LineWriter, MeasurementRow, SinkError, StorageSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_MEASUREMENT: &str = "tp358_measurement";

/// Field values for InfluxDB line protocol
#[derive(Debug, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Float(num) => write!(f, "{num}"),
            FieldValue::Integer(num) => write!(f, "{num}i"),
        }
    }
}

/// Data point in InfluxDB line protocol
#[derive(Debug)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: BTreeMap<String, String>,
    pub field_set: BTreeMap<String, FieldValue>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Escape commas and spaces in a measurement name.
fn escape_measurement(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, ',' | ' ') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Escape commas, equals signs and spaces in a tag key or value.
fn escape_tag(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, ',' | '=' | ' ') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn fmt_tags(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (key, value) in data_point.tag_set.iter() {
        write!(fmt, ",{}={}", escape_tag(key), escape_tag(value))?;
    }
    Ok(())
}

fn fmt_fields(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut first = true;
    for (key, value) in data_point.field_set.iter() {
        if first {
            first = false;
        } else {
            write!(fmt, ",")?;
        }
        write!(fmt, "{}={}", key, value)?;
    }
    Ok(())
}

fn fmt_timestamp(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    // Outside the i64 nanosecond range the server assigns its own time.
    if let Some(nanos) = data_point.timestamp.and_then(|t| t.timestamp_nanos_opt()) {
        write!(fmt, " {}", nanos)?;
    }
    Ok(())
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", escape_measurement(&self.measurement))?;
        fmt_tags(self, fmt)?;
        write!(fmt, " ")?;
        fmt_fields(self, fmt)?;
        fmt_timestamp(self, fmt)
    }
}

/// Storage sink writing one line-protocol record per row.
///
/// Rows with neither temperature nor humidity carry no fields and are skipped,
/// since line protocol requires at least one.
pub struct InfluxDbStorage {
    measurement_name: String,
    writer: LineWriter,
}

impl InfluxDbStorage {
    pub fn new(measurement_name: String, writer: LineWriter) -> Self {
        Self {
            measurement_name,
            writer,
        }
    }

    pub fn stdout(measurement_name: String) -> Self {
        Self::new(measurement_name, LineWriter::stdout())
    }

    fn to_data_point(&self, row: &MeasurementRow) -> DataPoint {
        let mut tag_set = BTreeMap::new();
        tag_set.insert("mac".to_string(), row.device.to_string());
        tag_set.insert("name".to_string(), row.name.clone());

        let mut field_set = BTreeMap::new();
        if let Some(t) = row.temperature_c {
            field_set.insert("temperature".to_string(), FieldValue::Float(t));
        }
        if let Some(h) = row.humidity_percent {
            field_set.insert("humidity".to_string(), FieldValue::Integer(i64::from(h)));
        }

        DataPoint {
            measurement: self.measurement_name.clone(),
            tag_set,
            field_set,
            timestamp: Some(row.measured_at),
        }
    }
}

#[async_trait]
impl StorageSink for InfluxDbStorage {
    async fn store(&self, row: &MeasurementRow) -> Result<(), SinkError> {
        let point = self.to_data_point(row);
        if point.field_set.is_empty() {
            return Ok(());
        }
        self.writer.write_line(point.to_string()).await?;
        Ok(())
    }
}
