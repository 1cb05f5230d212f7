use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use backon::{BlockingRetryable, ConstantBuilder};
use rusqlite::{Connection, ErrorCode, OpenFlags};

use crate::command::Query;
use crate::error::StorageError;
use crate::record::TelemetryRecord;

/// Read-only access to stored telemetry. Results are newest first.
pub trait RecordSource: Send + Sync + 'static {
    fn query_last_n(
        &self,
        device_id: i64,
        n: usize,
    ) -> Result<Vec<TelemetryRecord>, StorageError>;

    fn query_range(
        &self,
        device_id: i64,
        from: i64,
        to: i64,
    ) -> Result<Vec<TelemetryRecord>, StorageError>;

    fn fetch(&self, query: Query) -> Result<Vec<TelemetryRecord>, StorageError> {
        match query {
            Query::LastN { device_id, count } => self.query_last_n(device_id, count),
            Query::Range {
                device_id,
                from,
                to,
            } => self.query_range(device_id, from, to),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DB {
    path: PathBuf,
    busy_timeout: Duration,
    retry: ConstantBuilder,
}

impl DB {
    pub fn new<P: AsRef<Path>>(path: P, busy_timeout: Duration, retry: ConstantBuilder) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
            retry,
        }
    }

    pub fn init(&self) -> Result<(), anyhow::Error> {
        let conn = self.open_writable()?;
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS farm_data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id INTEGER NOT NULL,
                temperature REAL NOT NULL,
                humidity REAL NOT NULL,
                water_level REAL NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS farm_data_device_time
                ON farm_data (device_id, timestamp);
            ",
        )
        .context("Failed to create table")?;
        Ok(())
    }

    pub fn insert(&self, data: &TelemetryRecord) -> Result<(), anyhow::Error> {
        let conn = self.open_writable()?;
        conn.execute(
            r"
            INSERT INTO farm_data (device_id, temperature, humidity, water_level, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                data.device_id,
                data.temperature,
                data.humidity,
                data.water_level,
                data.timestamp,
            ],
        )
        .context("Failed to insert data into table")?;
        Ok(())
    }

    fn open_writable(&self) -> Result<Connection, anyhow::Error> {
        let conn = Connection::open(&self.path).context("Failed to open database file")?;
        conn.busy_timeout(self.busy_timeout)
            .context("Failed to set busy timeout")?;
        Ok(conn)
    }

    // One connection per call, so concurrent workers never share a handle.
    fn open_readonly(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    fn select(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<TelemetryRecord>, StorageError> {
        let run = || -> Result<Vec<TelemetryRecord>, rusqlite::Error> {
            let conn = self.open_readonly()?;
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, |row| {
                Ok(TelemetryRecord {
                    device_id: row.get(0)?,
                    temperature: row.get(1)?,
                    humidity: row.get(2)?,
                    water_level: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?;
            rows.collect()
        };

        let records = run
            .retry(self.retry)
            .when(is_transient)
            .notify(|e, dur| {
                log::warn!("{e}");
                log::info!("Retrying query in {:?}", dur);
            })
            .call()?;
        Ok(records)
    }
}

// Ingestion writers store `device_id` as TEXT and `timestamp` as a
// `CURRENT_TIMESTAMP` string; rows written here use integers for both.
const READINGS: &str = r"
    WITH readings AS (
        SELECT
            id,
            CAST(device_id AS INTEGER) AS device_id,
            temperature,
            humidity,
            water_level,
            CASE typeof(timestamp)
                WHEN 'text' THEN IFNULL(CAST(strftime('%s', timestamp) AS INTEGER), 0)
                ELSE CAST(timestamp AS INTEGER)
            END AS timestamp
        FROM farm_data
    )";

impl RecordSource for DB {
    fn query_last_n(
        &self,
        device_id: i64,
        n: usize,
    ) -> Result<Vec<TelemetryRecord>, StorageError> {
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let sql = format!(
            r"{READINGS}
            SELECT device_id, temperature, humidity, water_level, timestamp
            FROM readings
            WHERE device_id = ?1
            ORDER BY timestamp DESC, id DESC
            LIMIT ?2"
        );
        self.select(&sql, rusqlite::params![device_id, limit])
    }

    fn query_range(
        &self,
        device_id: i64,
        from: i64,
        to: i64,
    ) -> Result<Vec<TelemetryRecord>, StorageError> {
        let sql = format!(
            r"{READINGS}
            SELECT device_id, temperature, humidity, water_level, timestamp
            FROM readings
            WHERE device_id = ?1 AND timestamp BETWEEN ?2 AND ?3
            ORDER BY timestamp DESC, id DESC"
        );
        self.select(&sql, rusqlite::params![device_id, from, to])
    }
}

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}
