//! Persistence of pipeline output into feature groups.
//!
//! Every record is keyed by `(pickup_location_id, pickup_ts)` and written with
//! upsert semantics, so re-running a pipeline over an overlapping range
//! replaces rows instead of duplicating them.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::info;

use crate::config::{AppConfig, StorageMode};
use crate::densify::HourlyCount;
use crate::model::Prediction;
use crate::retry::{Classify, ErrorKind};
use crate::window::{FeatureRow, FeatureSchema, TargetRow};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureGroupConfig {
    pub name: String,
    pub version: u32,
    pub description: String,
    pub primary_key: Vec<String>,
    pub event_time: String,
    pub online_enabled: bool,
}

impl FeatureGroupConfig {
    fn keyed(name: &str, description: &str, online_enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            version: 1,
            description: description.to_string(),
            primary_key: vec!["pickup_location_id".to_string(), "pickup_ts".to_string()],
            event_time: "pickup_ts".to_string(),
            online_enabled,
        }
    }

    pub fn time_series_hourly() -> Self {
        Self::keyed(
            "time_series_hourly_feature_group",
            "Feature group with hourly time-series data of historical taxi rides",
            false,
        )
    }

    pub fn training_windows() -> Self {
        Self::keyed(
            "time_series_training_feature_group",
            "Sliding-window features and next-hour targets built from hourly rides",
            false,
        )
    }

    pub fn model_predictions() -> Self {
        Self::keyed(
            "model_predictions_feature_group",
            "Predictions generated by our production model",
            true,
        )
    }

    fn table_name(&self) -> Result<String, SinkError> {
        let valid = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(SinkError::InvalidGroupName(self.name.clone()));
        }
        Ok(format!("{}_v{}", self.name, self.version))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRecord {
    pub pickup_location_id: u32,
    pub pickup_ts: i64,
    pub fields: Map<String, Value>,
}

pub fn records_from_hourly(rows: &[HourlyCount]) -> Vec<SinkRecord> {
    rows.iter()
        .map(|row| {
            let mut fields = Map::new();
            fields.insert("pickup_hour".to_string(), json!(row.pickup_hour));
            fields.insert("rides".to_string(), json!(row.rides));
            SinkRecord {
                pickup_location_id: row.pickup_location_id,
                pickup_ts: row.pickup_ts(),
                fields,
            }
        })
        .collect()
}

/// `targets`, when given, must pair 1:1 with `features`.
pub fn records_from_windows(
    schema: &FeatureSchema,
    features: &[FeatureRow],
    targets: Option<&[TargetRow]>,
) -> Result<Vec<SinkRecord>, SinkError> {
    if let Some(targets) = targets {
        if targets.len() != features.len() {
            return Err(SinkError::Encoding(format!(
                "{} feature rows but {} target rows",
                features.len(),
                targets.len()
            )));
        }
    }

    Ok(features
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            let mut fields = Map::new();
            fields.insert("pickup_hour".to_string(), json!(row.pickup_hour));
            fields.insert("features".to_string(), json!(row.features));
            fields.insert(
                "schema_fingerprint".to_string(),
                json!(schema.fingerprint),
            );
            if let Some(target) = targets.and_then(|targets| targets.get(idx)) {
                fields.insert(
                    "target_rides_next_hour".to_string(),
                    json!(target.target_rides),
                );
            }
            SinkRecord {
                pickup_location_id: row.pickup_location_id,
                pickup_ts: row.pickup_ts(),
                fields,
            }
        })
        .collect())
}

pub fn records_from_predictions(predictions: &[Prediction]) -> Vec<SinkRecord> {
    predictions
        .iter()
        .map(|prediction| {
            let mut fields = Map::new();
            fields.insert("pickup_hour".to_string(), json!(prediction.pickup_hour));
            fields.insert(
                "predicted_demand".to_string(),
                json!(prediction.predicted_demand),
            );
            SinkRecord {
                pickup_location_id: prediction.pickup_location_id,
                pickup_ts: prediction.pickup_ts(),
                fields,
            }
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid feature group name '{0}'")]
    InvalidGroupName(String),
    #[error("feature store settings missing: {0}")]
    MissingSettings(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("feature store returned HTTP {status} for {url}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

impl Classify for SinkError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::HttpRequest { .. } | Self::HttpClientBuild(_) => ErrorKind::Transport,
            Self::HttpStatus { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::Throttled
            }
            Self::HttpStatus { .. } | Self::MissingSettings(_) => ErrorKind::Rejected,
            Self::Io(_) | Self::Sqlite(_) => ErrorKind::Storage,
            Self::InvalidGroupName(_) | Self::Encoding(_) => ErrorKind::Encoding,
        }
    }
}

pub trait PersistenceSink {
    /// Insert or replace `records` in `group`; returns the number written.
    fn upsert(&self, group: &FeatureGroupConfig, records: &[SinkRecord])
        -> Result<usize, SinkError>;

    fn describe(&self) -> String;
}

/// Local-file variant: one SQLite table per feature group.
pub struct SqliteSink {
    path: PathBuf,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count_rows(&self, group: &FeatureGroupConfig) -> Result<u64, SinkError> {
        let table = group.table_name()?;
        let conn = Connection::open(&self.path)?;
        ensure_table(&conn, &table)?;
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }

    /// All records of `group`, ordered by key.
    pub fn load_records(&self, group: &FeatureGroupConfig) -> Result<Vec<SinkRecord>, SinkError> {
        let table = group.table_name()?;
        let conn = Connection::open(&self.path)?;
        ensure_table(&conn, &table)?;
        let mut stmt = conn.prepare(&format!(
            "
            SELECT pickup_location_id, pickup_ts, payload
            FROM {table}
            ORDER BY pickup_location_id ASC, pickup_ts ASC
            "
        ))?;
        let mut rows = stmt.query([])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload: String = row.get(2)?;
            out.push(SinkRecord {
                pickup_location_id: row.get(0)?,
                pickup_ts: row.get(1)?,
                fields: serde_json::from_str(&payload)?,
            });
        }
        Ok(out)
    }
}

impl PersistenceSink for SqliteSink {
    fn upsert(
        &self,
        group: &FeatureGroupConfig,
        records: &[SinkRecord],
    ) -> Result<usize, SinkError> {
        let table = group.table_name()?;
        let mut conn = Connection::open(&self.path)?;
        ensure_table(&conn, &table)?;
        if records.is_empty() {
            return Ok(0);
        }

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "
                INSERT INTO {table} (pickup_location_id, pickup_ts, payload)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(pickup_location_id, pickup_ts) DO UPDATE SET
                    payload = excluded.payload
                "
            ))?;
            for record in records {
                let payload = serde_json::to_string(&record.fields)?;
                stmt.execute(params![record.pickup_location_id, record.pickup_ts, payload])?;
            }
        }
        tx.commit()?;

        info!(
            component = "sink",
            event = "sink.sqlite.upsert",
            table = %table,
            rows = records.len(),
            path = %self.path.display()
        );
        Ok(records.len())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

fn ensure_table(conn: &Connection, table: &str) -> Result<(), SinkError> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {table} (
            pickup_location_id INTEGER NOT NULL,
            pickup_ts INTEGER NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY(pickup_location_id, pickup_ts)
        ) WITHOUT ROWID;
        "
    ))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureStoreSettings {
    pub base_url: String,
    pub project: String,
    pub api_key: String,
    pub http_timeout_ms: u64,
}

/// Remote variant: posts batches to the hosted feature store's upsert endpoint.
pub struct FeatureStoreSink {
    settings: FeatureStoreSettings,
    client: reqwest::blocking::Client,
}

impl FeatureStoreSink {
    pub fn new(settings: FeatureStoreSettings) -> Result<Self, SinkError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(settings.http_timeout_ms))
            .build()
            .map_err(|err| SinkError::HttpClientBuild(err.to_string()))?;
        Ok(Self { settings, client })
    }

    pub fn upsert_url(&self, group: &FeatureGroupConfig) -> String {
        format!(
            "{}/projects/{}/feature-groups/{}/versions/{}/upsert",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.project,
            group.name,
            group.version
        )
    }
}

impl PersistenceSink for FeatureStoreSink {
    fn upsert(
        &self,
        group: &FeatureGroupConfig,
        records: &[SinkRecord],
    ) -> Result<usize, SinkError> {
        group.table_name()?;
        if records.is_empty() {
            return Ok(0);
        }

        let url = self.upsert_url(group);
        let body = serde_json::to_vec(&json!({
            "feature_group": group,
            "rows": records,
        }))?;

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("ApiKey {}", self.settings.api_key))
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .map_err(|err| SinkError::HttpRequest {
                url: url.clone(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SinkError::HttpStatus {
                url,
                status: status.as_u16(),
                body,
            });
        }

        info!(
            component = "sink",
            event = "sink.feature_store.upsert",
            feature_group = %group.name,
            version = group.version,
            rows = records.len()
        );
        Ok(records.len())
    }

    fn describe(&self) -> String {
        format!(
            "feature_store:{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.project
        )
    }
}

pub fn sink_from_config(cfg: &AppConfig) -> Result<Box<dyn PersistenceSink>, SinkError> {
    match cfg.storage_mode {
        StorageMode::Local => Ok(Box::new(SqliteSink::open(&cfg.local_store_path)?)),
        StorageMode::FeatureStore => {
            let settings = cfg
                .feature_store
                .clone()
                .ok_or(SinkError::MissingSettings(
                    "TAXI_FEATURE_STORE_URL, TAXI_FEATURE_STORE_PROJECT, TAXI_FEATURE_STORE_API_KEY",
                ))?;
            Ok(Box::new(FeatureStoreSink::new(settings)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    #[test]
    fn group_names_must_be_identifiers() {
        let mut group = FeatureGroupConfig::time_series_hourly();
        assert_eq!(
            group.table_name().unwrap(),
            "time_series_hourly_feature_group_v1"
        );
        group.name = "rides; DROP TABLE x".to_string();
        assert!(matches!(
            group.table_name(),
            Err(SinkError::InvalidGroupName(_))
        ));
    }

    #[test]
    fn window_records_require_matching_targets() {
        let schema = crate::window::build_feature_schema(&crate::window::WindowConfig {
            window_size: 2,
            step_size: 1,
        });
        let features = vec![FeatureRow {
            pickup_location_id: 1,
            features: vec![1, 2],
            pickup_hour: Utc.with_ymd_and_hms(2023, 1, 1, 2, 0, 0).unwrap(),
        }];

        let records = records_from_windows(
            &schema,
            &features,
            Some(&[TargetRow { target_rides: 4 }][..]),
        )
        .unwrap();
        assert_eq!(records[0].pickup_ts, 1_672_538_400_000);
        assert_eq!(records[0].fields["target_rides_next_hour"], json!(4));
        assert_eq!(records[0].fields["features"], json!([1, 2]));

        assert!(matches!(
            records_from_windows(&schema, &features, Some(&[][..])),
            Err(SinkError::Encoding(_))
        ));
    }

    #[test]
    fn sqlite_upsert_replaces_rows_on_same_key() {
        let temp = tempdir().unwrap();
        let sink = SqliteSink::open(&temp.path().join("store.sqlite")).unwrap();
        let group = FeatureGroupConfig::model_predictions();
        let hour = Utc.with_ymd_and_hms(2023, 1, 1, 2, 0, 0).unwrap();
        let first = records_from_predictions(&[Prediction {
            pickup_location_id: 5,
            predicted_demand: 3,
            pickup_hour: hour,
        }]);
        let second = records_from_predictions(&[Prediction {
            pickup_location_id: 5,
            predicted_demand: 8,
            pickup_hour: hour,
        }]);

        sink.upsert(&group, &first).unwrap();
        sink.upsert(&group, &second).unwrap();

        let stored = sink.load_records(&group).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].fields["predicted_demand"], json!(8));
    }

    #[test]
    fn remote_errors_classify_for_retry() {
        let busy = SinkError::HttpStatus {
            url: "u".to_string(),
            status: 503,
            body: String::new(),
        };
        let rejected = SinkError::HttpStatus {
            url: "u".to_string(),
            status: 400,
            body: String::new(),
        };
        assert_eq!(busy.kind(), ErrorKind::Throttled);
        assert_eq!(rejected.kind(), ErrorKind::Rejected);
    }

    #[test]
    fn remote_url_includes_group_and_version() {
        let sink = FeatureStoreSink::new(FeatureStoreSettings {
            base_url: "https://store.example/api/".to_string(),
            project: "taxi".to_string(),
            api_key: "k".to_string(),
            http_timeout_ms: 1_000,
        })
        .unwrap();
        assert_eq!(
            sink.upsert_url(&FeatureGroupConfig::time_series_hourly()),
            "https://store.example/api/projects/taxi/feature-groups/time_series_hourly_feature_group/versions/1/upsert"
        );
    }
}
