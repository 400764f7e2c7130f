//! Taxi-demand feature pipelines.
//!
//! Raw pickup events are densified into zero-filled hourly series per pickup
//! location, then cut into sliding-window feature rows with next-hour targets.
//! Three binaries drive this: a historical backfill, a rolling feature update
//! and a batch inference run.

mod cli;
mod config;
mod densify;
mod model;
mod observability;
mod pipeline;
mod retry;
mod rides;
mod sink;
mod time_index;
mod window;

pub use cli::RunArgs;
pub use config::{
    app_config_from_env, app_config_from_lookup, AppConfig, ConfigError, PipelineConfig,
    StorageMode, MAX_HISTORY_DAYS, MAX_PERSIST_ATTEMPTS, MAX_WINDOW_HOURS,
};
pub use densify::{
    densify, densify_on_axis, observed_locations, DensifyError, DensifyReport, HourlyCount,
};
pub use model::{
    predict_batch, BaselineRegistry, DemandModel, LastFourWeeksBaseline, LastWeekBaseline,
    ModelError, ModelRegistry, Prediction, PreviousHourBaseline,
};
pub use observability::{
    init_logging, log_pipeline_failed, log_pipeline_finish, log_pipeline_start,
    log_sink_selected, logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    backfill_range, inference_range, persist, rolling_range, BackfillOutput, InferenceBatch,
    PipelineError, PipelineOrchestrator, PipelineStage, RollingOutput,
};
pub use retry::{Classify, ErrorKind, RetryPolicy};
pub use rides::{
    plan_required_months, InMemoryRideSource, MonthlyRideFiles, RawRidesConfig, RideEvent,
    RideEventSource, RideLoadError, RideMonth,
};
pub use sink::{
    records_from_hourly, records_from_predictions, records_from_windows, sink_from_config,
    FeatureGroupConfig, FeatureStoreSettings, FeatureStoreSink, PersistenceSink, SinkError,
    SinkRecord, SqliteSink,
};
pub use time_index::{
    current_hour, floor_hour, from_unix_ms, hours, parse_run_datetime, to_unix_ms, HourAxis,
    TimeIndexError, HOUR_MS, RUN_DATETIME_FORMAT,
};
pub use window::{
    assert_schema_compatible, build_feature_schema, build_inference_features,
    transform_ts_into_features_and_targets, window_count, FeatureRow, FeatureSchema, ShortHistory,
    TargetRow, WindowConfig, WindowError, WindowReport, FEATURE_SCHEMA_VERSION,
};
