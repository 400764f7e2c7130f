//! Scoring collaborators for the inference pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::time_index::to_unix_ms;
use crate::window::FeatureRow;

const HOURS_PER_WEEK: usize = 24 * 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub pickup_location_id: u32,
    pub predicted_demand: u32,
    pub pickup_hour: DateTime<Utc>,
}

impl Prediction {
    pub fn pickup_ts(&self) -> i64 {
        to_unix_ms(self.pickup_hour)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("model '{name}' with status '{status}' not found in registry")]
    NotFound { name: String, status: String },
    #[error("model '{model}' needs {required} features, location {pickup_location_id} has {found}")]
    FeatureWidth {
        model: String,
        pickup_location_id: u32,
        required: usize,
        found: usize,
    },
}

pub trait DemandModel {
    fn name(&self) -> &str;
    /// Lagged hours a feature row must carry.
    fn min_window(&self) -> usize;
    fn predict(&self, row: &FeatureRow) -> f64;
}

/// Resolves a model by name and deployment status tag.
pub trait ModelRegistry {
    fn load(&self, name: &str, status: &str) -> Result<Box<dyn DemandModel>, ModelError>;
}

/// Demand equals the previous hour.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviousHourBaseline;

/// Demand equals the same hour one week earlier.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWeekBaseline;

/// Mean of the same hour one to four weeks earlier.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastFourWeeksBaseline;

impl DemandModel for PreviousHourBaseline {
    fn name(&self) -> &str {
        "previous_hour_baseline"
    }

    fn min_window(&self) -> usize {
        1
    }

    fn predict(&self, row: &FeatureRow) -> f64 {
        lag(row, 1)
    }
}

impl DemandModel for LastWeekBaseline {
    fn name(&self) -> &str {
        "last_week_baseline"
    }

    fn min_window(&self) -> usize {
        HOURS_PER_WEEK
    }

    fn predict(&self, row: &FeatureRow) -> f64 {
        lag(row, HOURS_PER_WEEK)
    }
}

impl DemandModel for LastFourWeeksBaseline {
    fn name(&self) -> &str {
        "last_four_weeks_baseline"
    }

    fn min_window(&self) -> usize {
        4 * HOURS_PER_WEEK
    }

    fn predict(&self, row: &FeatureRow) -> f64 {
        (1..=4).map(|weeks| lag(row, weeks * HOURS_PER_WEEK)).sum::<f64>() / 4.0
    }
}

/// `lag` hours before the target; features are stored oldest first.
fn lag(row: &FeatureRow, lag: usize) -> f64 {
    row.features
        .len()
        .checked_sub(lag)
        .and_then(|idx| row.features.get(idx))
        .map(|rides| f64::from(*rides))
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineRegistry;

impl ModelRegistry for BaselineRegistry {
    fn load(&self, name: &str, status: &str) -> Result<Box<dyn DemandModel>, ModelError> {
        let model: Box<dyn DemandModel> = match name {
            "previous_hour_baseline" => Box::new(PreviousHourBaseline),
            "last_week_baseline" => Box::new(LastWeekBaseline),
            "last_four_weeks_baseline" => Box::new(LastFourWeeksBaseline),
            _ => {
                return Err(ModelError::NotFound {
                    name: name.to_string(),
                    status: status.to_string(),
                })
            }
        };
        info!(
            component = "model",
            event = "model.loaded",
            model = name,
            status
        );
        Ok(model)
    }
}

pub fn predict_batch(
    model: &dyn DemandModel,
    rows: &[FeatureRow],
) -> Result<Vec<Prediction>, ModelError> {
    rows.iter()
        .map(|row| {
            if row.features.len() < model.min_window() {
                return Err(ModelError::FeatureWidth {
                    model: model.name().to_string(),
                    pickup_location_id: row.pickup_location_id,
                    required: model.min_window(),
                    found: row.features.len(),
                });
            }
            let estimate = model.predict(row).round().max(0.0);
            Ok(Prediction {
                pickup_location_id: row.pickup_location_id,
                predicted_demand: estimate.min(f64::from(u32::MAX)) as u32,
                pickup_hour: row.pickup_hour,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(features: Vec<u32>) -> FeatureRow {
        FeatureRow {
            pickup_location_id: 3,
            features,
            pickup_hour: Utc.with_ymd_and_hms(2023, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn previous_hour_reads_newest_feature() {
        let preds = predict_batch(&PreviousHourBaseline, &[row(vec![9, 4, 7])]).unwrap();
        assert_eq!(preds[0].predicted_demand, 7);
        assert_eq!(preds[0].pickup_location_id, 3);
    }

    #[test]
    fn four_week_mean_is_rounded() {
        let mut features = vec![0u32; 4 * HOURS_PER_WEEK];
        let len = features.len();
        features[len - HOURS_PER_WEEK] = 10;
        features[len - 2 * HOURS_PER_WEEK] = 11;
        features[len - 3 * HOURS_PER_WEEK] = 0;
        features[len - 4 * HOURS_PER_WEEK] = 1;

        let preds = predict_batch(&LastFourWeeksBaseline, &[row(features)]).unwrap();
        assert_eq!(preds[0].predicted_demand, 6);
    }

    #[test]
    fn narrow_rows_are_rejected() {
        let err = predict_batch(&LastWeekBaseline, &[row(vec![1; 24])]).unwrap_err();
        assert!(matches!(
            err,
            ModelError::FeatureWidth {
                required: 168,
                found: 24,
                ..
            }
        ));
    }

    #[test]
    fn registry_resolves_known_names_only() {
        let registry = BaselineRegistry;
        let model = registry
            .load("last_week_baseline", "Production")
            .unwrap();
        assert_eq!(model.name(), "last_week_baseline");
        assert!(matches!(
            registry.load("lightgbm", "Production"),
            Err(ModelError::NotFound { .. })
        ));
    }
}
