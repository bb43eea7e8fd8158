//! PostgreSQL storage of throttled measurements.

use super::{MeasurementRow, SinkError, StorageSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use tokio_postgres::{Client, NoTls};

const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS measurements (
        id BIGSERIAL PRIMARY KEY,
        device_mac VARCHAR(17) NOT NULL,
        name TEXT NOT NULL,
        temperature DOUBLE PRECISION,
        humidity INTEGER,
        measured_at TIMESTAMPTZ NOT NULL
    )";

const CREATE_INDEXES: &str = "
    CREATE INDEX IF NOT EXISTS measurements_device_mac_idx ON measurements (device_mac);
    CREATE INDEX IF NOT EXISTS measurements_measured_at_idx ON measurements (measured_at)";

const INSERT_ROW: &str = "
    INSERT INTO measurements (device_mac, name, temperature, humidity, measured_at)
    VALUES ($1, $2, $3, $4, $5)";

/// Storage sink inserting one row per stored measurement.
pub struct PostgresStorage {
    client: Client,
}

impl PostgresStorage {
    /// Connect to `database_url` and make sure the `measurements` table exists.
    pub async fn connect(database_url: &str) -> Result<Self, SinkError> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {e}");
            }
        });

        client.batch_execute(CREATE_TABLE).await?;
        client.batch_execute(CREATE_INDEXES).await?;
        info!("PostgreSQL storage ready, table 'measurements' exists");
        Ok(Self { client })
    }
}

/// Column values of one `measurements` row, in `INSERT_ROW` parameter order.
#[derive(Debug, PartialEq)]
struct RowParams {
    device_mac: String,
    name: String,
    temperature: Option<f64>,
    humidity: Option<i32>,
    measured_at: DateTime<Utc>,
}

impl From<&MeasurementRow> for RowParams {
    fn from(row: &MeasurementRow) -> Self {
        Self {
            device_mac: row.device.to_string(),
            name: row.name.clone(),
            temperature: row.temperature_c,
            humidity: row.humidity_percent.map(i32::from),
            measured_at: row.measured_at,
        }
    }
}

#[async_trait]
impl StorageSink for PostgresStorage {
    async fn store(&self, row: &MeasurementRow) -> Result<(), SinkError> {
        let params = RowParams::from(row);
        self.client
            .execute(
                INSERT_ROW,
                &[
                    &params.device_mac,
                    &params.name,
                    &params.temperature,
                    &params.humidity,
                    &params.measured_at,
                ],
            )
            .await?;
        debug!(
            "stored {}: temperature={:?} humidity={:?}",
            params.device_mac, params.temperature, params.humidity
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TEST_MAC, test_time};

    fn row(humidity_percent: Option<u8>) -> MeasurementRow {
        MeasurementRow {
            device: TEST_MAC,
            name: "Kitchen".to_string(),
            temperature_c: Some(20.5),
            humidity_percent,
            measured_at: test_time(),
        }
    }

    #[test]
    fn test_row_params_mapping() {
        let params = RowParams::from(&row(Some(55)));
        assert_eq!(
            params,
            RowParams {
                device_mac: "AA:BB:CC:DD:EE:FF".to_string(),
                name: "Kitchen".to_string(),
                temperature: Some(20.5),
                humidity: Some(55),
                measured_at: test_time(),
            }
        );
    }

    #[test]
    fn test_row_params_keep_missing_values_null() {
        let mut row = row(None);
        row.temperature_c = None;
        let params = RowParams::from(&row);
        assert_eq!(params.humidity, None);
        assert_eq!(params.temperature, None);
    }

    #[test]
    fn test_insert_matches_table() {
        for column in ["device_mac", "name", "temperature", "humidity", "measured_at"] {
            assert!(CREATE_TABLE.contains(column));
            assert!(INSERT_ROW.contains(column));
        }
        assert!(INSERT_ROW.contains("$5"));
        assert!(!INSERT_ROW.contains("$6"));
        // a full-width MAC fits the column
        assert_eq!(RowParams::from(&row(None)).device_mac.len(), 17);
    }
}
