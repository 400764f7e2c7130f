//! Sequences event loading, densify and window for the three pipeline runs.
//!
//! Each run takes an explicit run time (truncated to the hour) and derives its
//! own fetch range from [`PipelineConfig`]. Nothing is kept between runs.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, PipelineConfig};
use crate::densify::{
    densify, densify_on_axis, observed_locations, DensifyError, DensifyReport, HourlyCount,
};
use crate::model::{predict_batch, DemandModel, ModelError, Prediction};
use crate::retry::RetryPolicy;
use crate::rides::{RideEvent, RideEventSource, RideLoadError};
use crate::sink::{FeatureGroupConfig, PersistenceSink, SinkError, SinkRecord};
use crate::time_index::{floor_hour, hours, HourAxis, HOUR_MS};
use crate::window::{
    assert_schema_compatible, build_feature_schema, build_inference_features,
    transform_ts_into_features_and_targets, FeatureRow, FeatureSchema, TargetRow, WindowError,
    WindowReport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Config,
    Fetch,
    Densify,
    Window,
    Predict,
    Persist,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Fetch => "fetch",
            Self::Densify => "densify",
            Self::Window => "window",
            Self::Predict => "predict",
            Self::Persist => "persist",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid run range: {0}")]
    InvalidRange(String),
    #[error("failed to fetch ride events: {0}")]
    Fetch(#[from] RideLoadError),
    #[error("failed to densify ride events: {0}")]
    Densify(#[from] DensifyError),
    #[error("failed to build windows: {0}")]
    Window(#[from] WindowError),
    #[error("failed to score features: {0}")]
    Predict(#[from] ModelError),
    #[error("failed to persist rows: {0}")]
    Persist(#[from] SinkError),
}

impl PipelineError {
    pub fn stage(&self) -> PipelineStage {
        match self {
            Self::Config(_) | Self::InvalidRange(_) => PipelineStage::Config,
            Self::Fetch(_) => PipelineStage::Fetch,
            Self::Densify(_) => PipelineStage::Densify,
            Self::Window(_) => PipelineStage::Window,
            Self::Predict(_) => PipelineStage::Predict,
            Self::Persist(_) => PipelineStage::Persist,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillOutput {
    pub from: DateTime<Utc>,
    pub to_exclusive: DateTime<Utc>,
    pub hourly: Vec<HourlyCount>,
    pub densify_report: DensifyReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingOutput {
    pub from: DateTime<Utc>,
    pub to_exclusive: DateTime<Utc>,
    pub hourly: Vec<HourlyCount>,
    pub densify_report: DensifyReport,
    pub schema: FeatureSchema,
    pub features: Vec<FeatureRow>,
    pub targets: Vec<TargetRow>,
    pub window_report: WindowReport,
}

/// One feature row per location, keyed at `request_hour`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceBatch {
    pub request_hour: DateTime<Utc>,
    pub schema: FeatureSchema,
    pub features: Vec<FeatureRow>,
    pub window_report: WindowReport,
}

/// `[Jan 1 of backfill_from_year, min(Jan 1 of next year, now))`.
pub fn backfill_range(
    cfg: &PipelineConfig,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), PipelineError> {
    let now = floor_hour(now);
    let from = year_start(cfg.backfill_from_year)?;
    let next_year = year_start(now.year() + 1)?;
    let to_exclusive = next_year.min(now);
    if to_exclusive <= from {
        return Err(PipelineError::InvalidRange(format!(
            "backfill year {} starts at or after the run time {now}",
            cfg.backfill_from_year
        )));
    }
    Ok((from, to_exclusive))
}

/// Lookback history plus the newest complete hour, which becomes the target.
pub fn rolling_range(
    cfg: &PipelineConfig,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), PipelineError> {
    let to_exclusive = floor_hour(now);
    let lookback = ChronoDuration::try_days(cfg.lookback_days)
        .and_then(|days| days.checked_add(&hours(1)))
        .ok_or_else(|| {
            PipelineError::InvalidRange(format!(
                "lookback of {} days is out of range",
                cfg.lookback_days
            ))
        })?;
    let from = shift_back(to_exclusive, lookback, "rolling lookback")?;
    Ok((from, to_exclusive))
}

/// Exactly `window_size` hours ending right before the request hour.
pub fn inference_range(
    cfg: &PipelineConfig,
    request: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), PipelineError> {
    let to_exclusive = floor_hour(request);
    let window = i64::try_from(cfg.window_size)
        .ok()
        .and_then(|count| count.checked_mul(HOUR_MS))
        .and_then(ChronoDuration::try_milliseconds)
        .ok_or_else(|| {
            PipelineError::InvalidRange(format!(
                "window of {} hours is out of range",
                cfg.window_size
            ))
        })?;
    let from = shift_back(to_exclusive, window, "inference window")?;
    Ok((from, to_exclusive))
}

pub struct PipelineOrchestrator<'a> {
    cfg: PipelineConfig,
    source: &'a dyn RideEventSource,
}

impl<'a> PipelineOrchestrator<'a> {
    pub fn new(cfg: PipelineConfig, source: &'a dyn RideEventSource) -> Self {
        Self { cfg, source }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// Hourly counts for the whole historical range, on the axis the events span.
    pub fn backfill(&self, now: DateTime<Utc>) -> Result<BackfillOutput, PipelineError> {
        let (from, to_exclusive) = backfill_range(&self.cfg, now)?;
        let events = self.fetch_events(from, to_exclusive)?;
        let locations = observed_locations(&events);
        let (hourly, densify_report) = densify(&events, &locations)?;
        Ok(BackfillOutput {
            from,
            to_exclusive,
            hourly,
            densify_report,
        })
    }

    pub fn rolling_update(&self, now: DateTime<Utc>) -> Result<RollingOutput, PipelineError> {
        let (from, to_exclusive) = rolling_range(&self.cfg, now)?;
        let events = self.fetch_events(from, to_exclusive)?;
        let locations = observed_locations(&events);
        let axis = HourAxis::covering(from, to_exclusive);
        let (hourly, densify_report) = densify_on_axis(&events, &locations, &axis)?;

        let window_cfg = self.cfg.window();
        let schema = build_feature_schema(&window_cfg);
        let (features, targets, window_report) =
            transform_ts_into_features_and_targets(&hourly, &window_cfg)?;

        Ok(RollingOutput {
            from,
            to_exclusive,
            hourly,
            densify_report,
            schema,
            features,
            targets,
            window_report,
        })
    }

    pub fn inference_batch(&self, request: DateTime<Utc>) -> Result<InferenceBatch, PipelineError> {
        let (from, to_exclusive) = inference_range(&self.cfg, request)?;
        let events = self.fetch_events(from, to_exclusive)?;
        let locations = observed_locations(&events);
        let axis = HourAxis::covering(from, to_exclusive);
        let (hourly, _) = densify_on_axis(&events, &locations, &axis)?;

        let window_cfg = self.cfg.window();
        let schema = build_feature_schema(&window_cfg);
        let (features, window_report) = build_inference_features(&hourly, &window_cfg)?;

        Ok(InferenceBatch {
            request_hour: to_exclusive,
            schema,
            features,
            window_report,
        })
    }

    /// Score `batch`, which must carry the feature schema of this orchestrator's
    /// window config.
    pub fn predict(
        &self,
        batch: &InferenceBatch,
        model: &dyn DemandModel,
    ) -> Result<Vec<Prediction>, PipelineError> {
        let expected = build_feature_schema(&self.cfg.window());
        assert_schema_compatible(expected.version, &expected.fingerprint, &batch.schema)?;
        let predictions = predict_batch(model, &batch.features)?;
        info!(
            component = "pipeline",
            event = "pipeline.predict.finish",
            model = model.name(),
            request_hour = %batch.request_hour,
            predictions = predictions.len()
        );
        Ok(predictions)
    }

    /// Fetch `[from, to_exclusive)` in simulated time. With a calendar offset the
    /// source is read that many days earlier and events are shifted forward.
    fn fetch_events(
        &self,
        from: DateTime<Utc>,
        to_exclusive: DateTime<Utc>,
    ) -> Result<Vec<RideEvent>, PipelineError> {
        let Some(offset_days) = self.cfg.calendar_offset_days else {
            return Ok(self.source.fetch(from, to_exclusive)?);
        };

        let offset = ChronoDuration::try_days(offset_days).ok_or_else(|| {
            PipelineError::InvalidRange(format!(
                "calendar offset of {offset_days} days is out of range"
            ))
        })?;
        let source_from = shift_back(from, offset, "calendar offset")?;
        let source_to = shift_back(to_exclusive, offset, "calendar offset")?;
        info!(
            component = "pipeline",
            event = "pipeline.calendar_offset",
            demo_mode = true,
            offset_days,
            simulated_from = %from,
            source_from = %source_from
        );
        let mut events = self.source.fetch(source_from, source_to)?;
        for event in &mut events {
            event.pickup_datetime = event
                .pickup_datetime
                .checked_add_signed(offset)
                .ok_or_else(|| {
                    PipelineError::InvalidRange(format!(
                        "event at {} cannot be shifted by {offset_days} days",
                        event.pickup_datetime
                    ))
                })?;
        }
        Ok(events)
    }
}

/// Upsert `records` into `group`, retrying failures the policy lists.
pub fn persist(
    sink: &dyn PersistenceSink,
    group: &FeatureGroupConfig,
    records: &[SinkRecord],
    retry: &RetryPolicy,
) -> Result<usize, PipelineError> {
    let written = retry.run("sink.upsert", || sink.upsert(group, records))?;
    info!(
        component = "pipeline",
        event = "pipeline.persist.finish",
        sink = %sink.describe(),
        feature_group = %group.name,
        version = group.version,
        rows = written
    );
    Ok(written)
}

fn shift_back(
    ts: DateTime<Utc>,
    by: ChronoDuration,
    what: &str,
) -> Result<DateTime<Utc>, PipelineError> {
    ts.checked_sub_signed(by)
        .ok_or_else(|| PipelineError::InvalidRange(format!("{what} cannot be applied to {ts}")))
}

fn year_start(year: i32) -> Result<DateTime<Utc>, PipelineError> {
    Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| PipelineError::InvalidRange(format!("year {year} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PreviousHourBaseline;
    use crate::rides::InMemoryRideSource;
    use std::cell::RefCell;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 3, day, hour, 0, 0).unwrap()
    }

    fn event(ts: DateTime<Utc>, location: u32) -> RideEvent {
        RideEvent {
            pickup_datetime: ts,
            pickup_location_id: location,
        }
    }

    fn small_cfg() -> PipelineConfig {
        PipelineConfig {
            window_size: 4,
            step_size: 1,
            lookback_days: 1,
            ..PipelineConfig::default()
        }
    }

    struct RecordingSource {
        calls: RefCell<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
        inner: InMemoryRideSource,
    }

    impl RideEventSource for RecordingSource {
        fn fetch(
            &self,
            from: DateTime<Utc>,
            to_exclusive: DateTime<Utc>,
        ) -> Result<Vec<RideEvent>, RideLoadError> {
            self.calls.borrow_mut().push((from, to_exclusive));
            self.inner.fetch(from, to_exclusive)
        }
    }

    #[test]
    fn ranges_follow_run_time() {
        let cfg = PipelineConfig::default();
        let now = Utc.with_ymd_and_hms(2023, 3, 10, 14, 37, 12).unwrap();

        let (from, to) = rolling_range(&cfg, now).unwrap();
        assert_eq!(to, Utc.with_ymd_and_hms(2023, 3, 10, 14, 0, 0).unwrap());
        assert_eq!((to - from).num_hours(), 28 * 24 + 1);

        let (from, to) = inference_range(&cfg, now).unwrap();
        assert_eq!((to - from).num_hours(), 672);

        let (from, to) = backfill_range(&cfg, now).unwrap();
        assert_eq!(from, Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(to, Utc.with_ymd_and_hms(2023, 3, 10, 14, 0, 0).unwrap());
    }

    #[test]
    fn backfill_from_future_year_is_config_error() {
        let cfg = PipelineConfig {
            backfill_from_year: 2030,
            ..PipelineConfig::default()
        };
        let err = backfill_range(&cfg, at(1, 0)).unwrap_err();
        assert_eq!(err.stage(), PipelineStage::Config);
    }

    #[test]
    fn rolling_update_with_defaults_yields_one_window_per_location() {
        let now = at(29, 0);
        let events = vec![event(at(1, 5), 7), event(at(28, 23), 7), event(at(15, 3), 9)];
        let source = InMemoryRideSource::new(events);
        let orchestrator = PipelineOrchestrator::new(PipelineConfig::default(), &source);

        let out = orchestrator.rolling_update(now).unwrap();

        assert_eq!(out.features.len(), 2);
        assert_eq!(out.targets.len(), 2);
        assert!(out.features.iter().all(|row| row.pickup_hour == at(28, 23)));
        assert_eq!(out.targets[0].target_rides, 1);
        assert_eq!(out.hourly.len(), 2 * 673);
    }

    #[test]
    fn inference_batch_is_keyed_at_request_hour() {
        let request = Utc.with_ymd_and_hms(2023, 3, 2, 10, 20, 0).unwrap();
        let source = InMemoryRideSource::new(vec![
            event(at(2, 9), 4),
            event(at(2, 9), 4),
            event(at(2, 7), 5),
            event(at(2, 10), 4),
        ]);
        let orchestrator = PipelineOrchestrator::new(small_cfg(), &source);

        let batch = orchestrator.inference_batch(request).unwrap();

        assert_eq!(batch.request_hour, at(2, 10));
        assert_eq!(batch.features.len(), 2);
        assert_eq!(batch.features[0].pickup_location_id, 4);
        assert_eq!(batch.features[0].features, vec![0, 0, 0, 2]);
        assert_eq!(batch.features[1].features, vec![0, 1, 0, 0]);
        assert!(batch.features.iter().all(|row| row.pickup_hour == at(2, 10)));

        let preds = orchestrator
            .predict(&batch, &PreviousHourBaseline)
            .unwrap();
        assert_eq!(preds[0].predicted_demand, 2);
        assert_eq!(preds[1].predicted_demand, 0);
    }

    #[test]
    fn calendar_offset_reads_history_and_keys_in_simulated_time() {
        let cfg = PipelineConfig {
            calendar_offset_days: Some(7),
            ..small_cfg()
        };
        let request = at(9, 10);
        let source = RecordingSource {
            calls: RefCell::new(Vec::new()),
            inner: InMemoryRideSource::new(vec![event(at(2, 9), 4)]),
        };
        let orchestrator = PipelineOrchestrator::new(cfg, &source);

        let batch = orchestrator.inference_batch(request).unwrap();

        assert_eq!(source.calls.borrow().as_slice(), &[(at(2, 6), at(2, 10))]);
        assert_eq!(batch.features.len(), 1);
        assert_eq!(batch.features[0].pickup_hour, request);
        assert_eq!(batch.features[0].features, vec![0, 0, 0, 1]);
    }

    #[test]
    fn empty_range_fails_in_densify_stage() {
        let source = InMemoryRideSource::default();
        let orchestrator = PipelineOrchestrator::new(small_cfg(), &source);
        let err = orchestrator.rolling_update(at(5, 0)).unwrap_err();
        assert_eq!(err.stage(), PipelineStage::Densify);
        assert!(matches!(
            err,
            PipelineError::Densify(DensifyError::EmptyInput)
        ));
    }

    #[test]
    fn backfill_densifies_observed_span_inside_the_range() {
        let now = at(10, 0);
        let source = InMemoryRideSource::new(vec![
            event(at(1, 5) + ChronoDuration::minutes(20), 2),
            event(at(3, 14) + ChronoDuration::minutes(10), 2),
            event(at(2, 8), 6),
        ]);
        let cfg = PipelineConfig::default();
        let orchestrator = PipelineOrchestrator::new(cfg, &source);

        let out = orchestrator.backfill(now).unwrap();

        assert_eq!((out.from, out.to_exclusive), backfill_range(&cfg, now).unwrap());
        assert_eq!(out.densify_report.hours, 58);
        assert_eq!(out.densify_report.locations, 2);
        assert_eq!(out.hourly.len(), 2 * 58);
        assert_eq!(out.hourly[0].pickup_hour, at(1, 5));
        assert_eq!(out.hourly[57].pickup_hour, at(3, 14));

        let loc2: Vec<u32> = out.hourly[..58].iter().map(|row| row.rides).collect();
        assert!(out.hourly[..58].iter().all(|row| row.pickup_location_id == 2));
        assert_eq!(loc2[0], 1);
        assert_eq!(loc2[57], 1);
        assert!(loc2[1..57].iter().all(|rides| *rides == 0));

        let loc6: Vec<u32> = out.hourly[58..].iter().map(|row| row.rides).collect();
        assert!(out.hourly[58..].iter().all(|row| row.pickup_location_id == 6));
        assert_eq!(loc6.iter().sum::<u32>(), 1);
        assert_eq!(loc6[27], 1);
    }

    #[test]
    fn backfill_without_events_fails_in_densify_stage() {
        let source = InMemoryRideSource::default();
        let orchestrator = PipelineOrchestrator::new(PipelineConfig::default(), &source);
        let err = orchestrator.backfill(at(10, 0)).unwrap_err();
        assert_eq!(err.stage(), PipelineStage::Densify);
        assert!(matches!(
            err,
            PipelineError::Densify(DensifyError::EmptyInput)
        ));
    }

    #[test]
    fn predict_rejects_batch_from_another_window_config() {
        let source = InMemoryRideSource::new(vec![event(at(2, 9), 4)]);
        let narrow = PipelineOrchestrator::new(small_cfg(), &source);
        let batch = narrow.inference_batch(at(2, 10)).unwrap();

        let wide = PipelineOrchestrator::new(
            PipelineConfig {
                window_size: 6,
                ..small_cfg()
            },
            &source,
        );
        let err = wide.predict(&batch, &PreviousHourBaseline).unwrap_err();
        assert_eq!(err.stage(), PipelineStage::Window);
        assert!(matches!(
            err,
            PipelineError::Window(WindowError::SchemaFingerprintMismatch { .. })
        ));
    }

    #[test]
    fn out_of_range_lookback_is_config_error() {
        let source = InMemoryRideSource::new(vec![event(at(2, 9), 4)]);
        for lookback_days in [i64::MAX, 100_000_000] {
            let cfg = PipelineConfig {
                lookback_days,
                ..small_cfg()
            };
            assert!(matches!(
                rolling_range(&cfg, at(3, 0)),
                Err(PipelineError::InvalidRange(_))
            ));
            let err = PipelineOrchestrator::new(cfg, &source)
                .rolling_update(at(3, 0))
                .unwrap_err();
            assert_eq!(err.stage(), PipelineStage::Config, "lookback {lookback_days}");
        }
    }

    #[test]
    fn out_of_range_window_is_config_error() {
        let source = InMemoryRideSource::new(vec![event(at(2, 9), 4)]);
        for window_size in [usize::MAX, 100_000_000_000] {
            let cfg = PipelineConfig {
                window_size,
                ..small_cfg()
            };
            let err = PipelineOrchestrator::new(cfg, &source)
                .inference_batch(at(3, 0))
                .unwrap_err();
            assert_eq!(err.stage(), PipelineStage::Config, "window {window_size}");
        }
    }

    #[test]
    fn out_of_range_calendar_offset_is_config_error() {
        let source = RecordingSource {
            calls: RefCell::new(Vec::new()),
            inner: InMemoryRideSource::new(vec![event(at(2, 9), 4)]),
        };
        for offset in [100_000_000, i64::MAX] {
            let cfg = PipelineConfig {
                calendar_offset_days: Some(offset),
                ..small_cfg()
            };
            let orchestrator = PipelineOrchestrator::new(cfg, &source);
            let err = orchestrator.rolling_update(at(3, 0)).unwrap_err();
            assert!(matches!(err, PipelineError::InvalidRange(_)), "offset {offset}");
            let err = orchestrator.backfill(at(3, 0)).unwrap_err();
            assert_eq!(err.stage(), PipelineStage::Config);
        }
        assert!(source.calls.borrow().is_empty());
    }
}
