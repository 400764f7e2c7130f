//! Dense hourly series to sliding-window feature rows and targets.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::densify::HourlyCount;
use crate::time_index::{hours, to_unix_ms};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub window_size: usize,
    pub step_size: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: 24 * 28,
            step_size: 23,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub pickup_location_id: u32,
    /// Lagged hourly ride counts, oldest first.
    pub features: Vec<u32>,
    /// Hour of the target, right after the last feature hour.
    pub pickup_hour: DateTime<Utc>,
}

impl FeatureRow {
    pub fn pickup_ts(&self) -> i64 {
        to_unix_ms(self.pickup_hour)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRow {
    pub target_rides: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortHistory {
    pub pickup_location_id: u32,
    pub rows: usize,
    pub window_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowReport {
    pub locations: u64,
    pub windows: u64,
    pub short_histories: Vec<ShortHistory>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("invalid window config: {0}")]
    InvalidConfig(String),
    #[error(
        "misaligned hourly series for location {pickup_location_id}: expected {expected}, found {found}"
    )]
    MisalignedRange {
        pickup_location_id: u32,
        expected: DateTime<Utc>,
        found: DateTime<Utc>,
    },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

/// Number of windows a dense series of `rows` hours yields.
pub fn window_count(rows: usize, window_size: usize, step_size: usize) -> usize {
    if step_size == 0 || rows <= window_size {
        return 0;
    }
    (rows - window_size - 1) / step_size + 1
}

pub fn build_feature_schema(cfg: &WindowConfig) -> FeatureSchema {
    let columns: Vec<String> = (1..=cfg.window_size)
        .rev()
        .map(|lag| format!("rides_previous_{lag}_hour"))
        .collect();
    let fingerprint = schema_fingerprint(cfg.window_size, &columns);

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), WindowError> {
    if expected_version != actual.version {
        return Err(WindowError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(WindowError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// Slide a `window_size` history over each location's series, advancing by
/// `step_size`, pairing every window with the hour right after it.
pub fn transform_ts_into_features_and_targets(
    rows: &[HourlyCount],
    cfg: &WindowConfig,
) -> Result<(Vec<FeatureRow>, Vec<TargetRow>, WindowReport), WindowError> {
    validate_config(cfg)?;
    let by_location = group_by_location(rows)?;

    info!(
        component = "window",
        event = "window.transform.start",
        input_rows = rows.len(),
        locations = by_location.len(),
        window_size = cfg.window_size,
        step_size = cfg.step_size
    );

    let mut features = Vec::new();
    let mut targets = Vec::new();
    let mut report = WindowReport {
        locations: by_location.len() as u64,
        ..WindowReport::default()
    };

    for (location, series) in &by_location {
        let count = window_count(series.len(), cfg.window_size, cfg.step_size);
        if count == 0 {
            record_short_history(&mut report, *location, series.len(), cfg.window_size);
            continue;
        }

        for idx in 0..count {
            let first = idx * cfg.step_size;
            let target = &series[first + cfg.window_size];
            features.push(FeatureRow {
                pickup_location_id: *location,
                features: series[first..first + cfg.window_size]
                    .iter()
                    .map(|row| row.rides)
                    .collect(),
                pickup_hour: target.pickup_hour,
            });
            targets.push(TargetRow {
                target_rides: target.rides,
            });
        }
    }

    report.windows = features.len() as u64;

    info!(
        component = "window",
        event = "window.transform.finish",
        locations = report.locations,
        windows = report.windows,
        short_histories = report.short_histories.len()
    );

    Ok((features, targets, report))
}

/// One feature row per location from its newest `window_size` hours, keyed at
/// the hour right after them. No targets: that hour has not happened yet.
pub fn build_inference_features(
    rows: &[HourlyCount],
    cfg: &WindowConfig,
) -> Result<(Vec<FeatureRow>, WindowReport), WindowError> {
    validate_config(cfg)?;
    let by_location = group_by_location(rows)?;

    let mut features = Vec::with_capacity(by_location.len());
    let mut report = WindowReport {
        locations: by_location.len() as u64,
        ..WindowReport::default()
    };

    for (location, series) in &by_location {
        if series.len() < cfg.window_size {
            record_short_history(&mut report, *location, series.len(), cfg.window_size);
            continue;
        }
        let window = &series[series.len() - cfg.window_size..];
        let Some(last) = window.last() else {
            continue;
        };
        features.push(FeatureRow {
            pickup_location_id: *location,
            features: window.iter().map(|row| row.rides).collect(),
            pickup_hour: last.pickup_hour + hours(1),
        });
    }

    report.windows = features.len() as u64;

    info!(
        component = "window",
        event = "window.inference.finish",
        locations = report.locations,
        rows = report.windows,
        short_histories = report.short_histories.len()
    );

    Ok((features, report))
}

fn validate_config(cfg: &WindowConfig) -> Result<(), WindowError> {
    if cfg.window_size == 0 {
        return Err(WindowError::InvalidConfig(
            "window_size must be > 0".to_string(),
        ));
    }
    if cfg.step_size == 0 {
        return Err(WindowError::InvalidConfig(
            "step_size must be > 0".to_string(),
        ));
    }
    Ok(())
}

/// Split rows per location, keeping input order, and check every series is a
/// gap-free run of consecutive hours.
fn group_by_location(
    rows: &[HourlyCount],
) -> Result<BTreeMap<u32, Vec<&HourlyCount>>, WindowError> {
    let mut by_location: BTreeMap<u32, Vec<&HourlyCount>> = BTreeMap::new();
    for row in rows {
        by_location.entry(row.pickup_location_id).or_default().push(row);
    }

    for (location, series) in &by_location {
        for pair in series.windows(2) {
            let expected = pair[0].pickup_hour + hours(1);
            if pair[1].pickup_hour != expected {
                return Err(WindowError::MisalignedRange {
                    pickup_location_id: *location,
                    expected,
                    found: pair[1].pickup_hour,
                });
            }
        }
    }

    Ok(by_location)
}

fn record_short_history(report: &mut WindowReport, location: u32, rows: usize, window_size: usize) {
    warn!(
        component = "window",
        event = "window.insufficient_history",
        pickup_location_id = location,
        rows,
        window_size
    );
    report.short_histories.push(ShortHistory {
        pickup_location_id: location,
        rows,
        window_size,
    });
}

fn schema_fingerprint(window_size: usize, columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update(format!("window_size:{window_size};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update(":u32;");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn series(location: u32, rides: &[u32]) -> Vec<HourlyCount> {
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        rides
            .iter()
            .enumerate()
            .map(|(idx, rides)| HourlyCount {
                pickup_hour: start + hours(idx as i64),
                pickup_location_id: location,
                rides: *rides,
            })
            .collect()
    }

    #[test]
    fn window_count_follows_formula() {
        assert_eq!(window_count(10, 5, 2), 3);
        assert_eq!(window_count(6, 5, 1), 1);
        assert_eq!(window_count(5, 5, 1), 0);
        assert_eq!(window_count(3, 672, 1), 0);
        assert_eq!(window_count(673, 672, 23), 1);
        assert_eq!(window_count(100, 10, 0), 0);
    }

    #[test]
    fn schema_columns_run_oldest_first() {
        let schema = build_feature_schema(&WindowConfig {
            window_size: 3,
            step_size: 1,
        });
        assert_eq!(
            schema.columns,
            vec![
                "rides_previous_3_hour",
                "rides_previous_2_hour",
                "rides_previous_1_hour"
            ]
        );
        assert_eq!(schema.fingerprint.len(), 64);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let rows = series(1, &[1, 2, 3]);
        let cfg = WindowConfig {
            window_size: 0,
            step_size: 1,
        };
        assert!(matches!(
            transform_ts_into_features_and_targets(&rows, &cfg),
            Err(WindowError::InvalidConfig(_))
        ));
        let cfg = WindowConfig {
            window_size: 2,
            step_size: 0,
        };
        assert!(matches!(
            build_inference_features(&rows, &cfg),
            Err(WindowError::InvalidConfig(_))
        ));
    }

    #[test]
    fn inference_uses_newest_hours_and_keys_next_hour() {
        let rows = series(4, &[1, 2, 3, 4, 5]);
        let cfg = WindowConfig {
            window_size: 3,
            step_size: 1,
        };

        let (features, report) = build_inference_features(&rows, &cfg).unwrap();

        assert_eq!(features.len(), 1);
        assert_eq!(features[0].features, vec![3, 4, 5]);
        assert_eq!(
            features[0].pickup_hour,
            Utc.with_ymd_and_hms(2023, 1, 1, 5, 0, 0).unwrap()
        );
        assert!(report.short_histories.is_empty());
    }

    #[test]
    fn inference_skips_short_locations() {
        let mut rows = series(1, &[1, 2]);
        rows.extend(series(2, &[1, 2, 3]));
        let cfg = WindowConfig {
            window_size: 3,
            step_size: 1,
        };

        let (features, report) = build_inference_features(&rows, &cfg).unwrap();

        assert_eq!(features.len(), 1);
        assert_eq!(features[0].pickup_location_id, 2);
        assert_eq!(
            report.short_histories,
            vec![ShortHistory {
                pickup_location_id: 1,
                rows: 2,
                window_size: 3
            }]
        );
    }
}
