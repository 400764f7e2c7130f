//! Pipeline and application settings, read from `TAXI_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::rides::RawRidesConfig;
use crate::sink::FeatureStoreSettings;
use crate::window::WindowConfig;

/// Upper bound for day-valued settings (lookback, calendar offset).
pub const MAX_HISTORY_DAYS: u64 = 3_660;
/// Upper bound for the window size, in hours.
pub const MAX_WINDOW_HOURS: u64 = MAX_HISTORY_DAYS * 24;
pub const MAX_PERSIST_ATTEMPTS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Lagged hours per feature row.
    pub window_size: usize,
    /// Hours between the starts of consecutive windows.
    pub step_size: usize,
    /// History fetched by the rolling update, in days.
    pub lookback_days: i64,
    /// Demo mode only: replay data from this many days ago as if it were current.
    pub calendar_offset_days: Option<i64>,
    pub backfill_from_year: i32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_size: 24 * 28,
            step_size: 23,
            lookback_days: 28,
            calendar_offset_days: None,
            backfill_from_year: 2022,
        }
    }
}

impl PipelineConfig {
    pub fn window(&self) -> WindowConfig {
        WindowConfig {
            window_size: self.window_size,
            step_size: self.step_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Local,
    FeatureStore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub storage_mode: StorageMode,
    pub local_store_path: PathBuf,
    pub raw_rides: RawRidesConfig,
    pub feature_store: Option<FeatureStoreSettings>,
    pub model_name: String,
    pub model_status: String,
    pub persist_retry: RetryPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            storage_mode: StorageMode::Local,
            local_store_path: PathBuf::from("data/feature_store.sqlite"),
            raw_rides: RawRidesConfig::default(),
            feature_store: None,
            model_name: "last_four_weeks_baseline".to_string(),
            model_status: "Production".to_string(),
            persist_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("{0} is required when TAXI_SAVE_FEATURE_GROUP=feature_store")]
    MissingFeatureStoreSetting(&'static str),
}

pub fn app_config_from_env() -> Result<AppConfig, ConfigError> {
    app_config_from_lookup(|key| env::var(key).ok())
}

pub fn app_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<AppConfig, ConfigError> {
    let get = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };
    let mut cfg = AppConfig::default();

    if let Some(raw) = get("TAXI_N_FEATURES") {
        cfg.pipeline.window_size = parse_bounded("TAXI_N_FEATURES", &raw, 1, MAX_WINDOW_HOURS)?;
    }
    if let Some(raw) = get("TAXI_STEP_SIZE") {
        cfg.pipeline.step_size = parse_bounded("TAXI_STEP_SIZE", &raw, 1, MAX_WINDOW_HOURS)?;
    }
    if let Some(raw) = get("TAXI_CUTOFF_DATE") {
        cfg.pipeline.lookback_days =
            parse_bounded("TAXI_CUTOFF_DATE", &raw, 1, MAX_HISTORY_DAYS)?;
    }
    if let Some(raw) = get("TAXI_PREVIOUS_YEAR") {
        let days: i64 = parse_bounded("TAXI_PREVIOUS_YEAR", &raw, 0, MAX_HISTORY_DAYS)?;
        cfg.pipeline.calendar_offset_days = (days > 0).then_some(days);
    }
    if let Some(raw) = get("TAXI_BACKFILL_FROM_YEAR") {
        cfg.pipeline.backfill_from_year = parse_number("TAXI_BACKFILL_FROM_YEAR", &raw)?;
    }

    if let Some(raw) = get("TAXI_SAVE_FEATURE_GROUP") {
        cfg.storage_mode = parse_storage_mode(&raw)?;
    }
    if let Some(raw) = get("TAXI_STORE_PATH") {
        cfg.local_store_path = PathBuf::from(raw);
    }
    if let Some(raw) = get("TAXI_RAW_DATA_ROOT") {
        cfg.raw_rides.data_root = PathBuf::from(raw);
    }
    cfg.raw_rides.download_base_url = get("TAXI_RAW_DATA_URL");

    if cfg.storage_mode == StorageMode::FeatureStore {
        let require = |key: &'static str| {
            get(key).ok_or(ConfigError::MissingFeatureStoreSetting(key))
        };
        cfg.feature_store = Some(FeatureStoreSettings {
            base_url: require("TAXI_FEATURE_STORE_URL")?,
            project: require("TAXI_FEATURE_STORE_PROJECT")?,
            api_key: require("TAXI_FEATURE_STORE_API_KEY")?,
            http_timeout_ms: 30_000,
        });
    }

    if let Some(raw) = get("TAXI_MODEL_NAME") {
        cfg.model_name = raw;
    }
    if let Some(raw) = get("TAXI_MODEL_STATUS") {
        cfg.model_status = raw;
    }
    if let Some(raw) = get("TAXI_PERSIST_MAX_ATTEMPTS") {
        cfg.persist_retry.max_attempts =
            parse_bounded("TAXI_PERSIST_MAX_ATTEMPTS", &raw, 1, MAX_PERSIST_ATTEMPTS)?;
    }
    if let Some(raw) = get("TAXI_PERSIST_RETRY_DELAY_MS") {
        cfg.persist_retry.delay =
            Duration::from_millis(parse_number("TAXI_PERSIST_RETRY_DELAY_MS", &raw)?);
    }

    Ok(cfg)
}

fn parse_storage_mode(raw: &str) -> Result<StorageMode, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "local" => Ok(StorageMode::Local),
        "feature_store" => Ok(StorageMode::FeatureStore),
        _ => Err(ConfigError::InvalidValue {
            key: "TAXI_SAVE_FEATURE_GROUP",
            value: raw.to_string(),
            reason: "expected 'local' or 'feature_store'",
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: "not a number",
    })
}

/// Parse an unsigned value in `[min, max]` and convert it to the field type.
fn parse_bounded<T: TryFrom<u64>>(
    key: &'static str,
    raw: &str,
    min: u64,
    max: u64,
) -> Result<T, ConfigError> {
    let invalid = |reason| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason,
    };
    if raw.starts_with('-') {
        return Err(invalid("must not be negative"));
    }
    let value = parse_number::<u64>(key, raw)?;
    if value < min {
        return Err(invalid(if min == 1 { "must be > 0" } else { "too small" }));
    }
    if value > max {
        return Err(invalid("too large"));
    }
    T::try_from(value).map_err(|_| invalid("too large"))
}
