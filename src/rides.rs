//! Raw ride event loading from monthly ride files.

use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::retry::{Classify, ErrorKind, RetryPolicy};

const DATETIME_COLUMNS: [&str; 2] = ["pickup_datetime", "tpep_pickup_datetime"];
const LOCATION_COLUMNS: [&str; 2] = ["pickup_location_id", "PULocationID"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RideEvent {
    pub pickup_datetime: DateTime<Utc>,
    pub pickup_location_id: u32,
}

#[derive(Debug, Error)]
pub enum RideLoadError {
    #[error("invalid ride range: {0}")]
    InvalidRange(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("raw ride file {path} is missing and no download URL is configured")]
    MissingRawFile { path: PathBuf },
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("archive at {path} has no CSV entry")]
    MissingCsvEntry { path: PathBuf },
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("ride file {path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("failed to parse field {field} value '{value}'")]
    ParseField { field: &'static str, value: String },
}

impl Classify for RideLoadError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::HttpRequest { .. } | Self::HttpClientBuild(_) => ErrorKind::Transport,
            Self::HttpStatus { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::Throttled
            }
            Self::HttpStatus { .. } => ErrorKind::Rejected,
            Self::Io(_) | Self::MissingRawFile { .. } => ErrorKind::Storage,
            Self::InvalidRange(_)
            | Self::MissingCsvEntry { .. }
            | Self::Zip(_)
            | Self::Csv(_)
            | Self::MissingColumn { .. }
            | Self::ParseField { .. } => ErrorKind::Encoding,
        }
    }
}

/// Supplies ride events with `from <= pickup_datetime < to_exclusive`.
pub trait RideEventSource {
    fn fetch(
        &self,
        from: DateTime<Utc>,
        to_exclusive: DateTime<Utc>,
    ) -> Result<Vec<RideEvent>, RideLoadError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryRideSource {
    events: Vec<RideEvent>,
}

impl InMemoryRideSource {
    pub fn new(events: Vec<RideEvent>) -> Self {
        Self { events }
    }
}

impl RideEventSource for InMemoryRideSource {
    fn fetch(
        &self,
        from: DateTime<Utc>,
        to_exclusive: DateTime<Utc>,
    ) -> Result<Vec<RideEvent>, RideLoadError> {
        validate_range(from, to_exclusive)?;
        let mut events: Vec<RideEvent> = self
            .events
            .iter()
            .filter(|event| event.pickup_datetime >= from && event.pickup_datetime < to_exclusive)
            .cloned()
            .collect();
        sort_events(&mut events);
        Ok(events)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RideMonth {
    pub year: i32,
    pub month: u32,
}

impl RideMonth {
    pub fn file_stem(self) -> String {
        format!("rides_{:04}-{:02}", self.year, self.month)
    }

    fn first_day(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    fn bounds(self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = month_start(self.first_day()?)?;
        let end = month_start(self.next().first_day()?)?;
        Some((start, end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRidesConfig {
    pub data_root: PathBuf,
    pub download_base_url: Option<String>,
    pub http_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for RawRidesConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/raw"),
            download_base_url: None,
            http_timeout_ms: 60_000,
            retry: RetryPolicy {
                max_attempts: 3,
                delay: std::time::Duration::from_millis(500),
                ..RetryPolicy::default()
            },
        }
    }
}

/// Months whose files hold rides in `[from, to_exclusive)`.
pub fn plan_required_months(from: DateTime<Utc>, to_exclusive: DateTime<Utc>) -> Vec<RideMonth> {
    if to_exclusive <= from {
        return Vec::new();
    }
    let last_inclusive = to_exclusive - chrono::Duration::milliseconds(1);
    let mut month = RideMonth {
        year: from.year(),
        month: from.month(),
    };
    let end = RideMonth {
        year: last_inclusive.year(),
        month: last_inclusive.month(),
    };

    let mut out = Vec::new();
    while month <= end {
        out.push(month);
        month = month.next();
    }
    out
}

/// Ride files stored one per month under `data_root`, as `rides_YYYY-MM.csv`
/// or a zip holding that CSV.
pub struct MonthlyRideFiles {
    cfg: RawRidesConfig,
    fetcher: Box<dyn HttpFetcher>,
}

impl MonthlyRideFiles {
    pub fn new(cfg: RawRidesConfig) -> Result<Self, RideLoadError> {
        let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
        Ok(Self {
            cfg,
            fetcher: Box::new(fetcher),
        })
    }

    fn local_file(&self, month: RideMonth) -> Option<PathBuf> {
        ["csv", "zip"]
            .iter()
            .map(|ext| self.cfg.data_root.join(format!("{}.{ext}", month.file_stem())))
            .find(|path| path.exists())
    }

    fn ensure_month(&self, month: RideMonth) -> Result<Option<PathBuf>, RideLoadError> {
        if let Some(path) = self.local_file(month) {
            debug!(
                component = "rides",
                event = "rides.file.cached",
                path = %path.display()
            );
            return Ok(Some(path));
        }

        let target = self
            .cfg
            .data_root
            .join(format!("{}.zip", month.file_stem()));
        let Some(base_url) = self.cfg.download_base_url.as_deref() else {
            return Err(RideLoadError::MissingRawFile { path: target });
        };

        let url = format!(
            "{}/{}.zip",
            base_url.trim_end_matches('/'),
            month.file_stem()
        );
        let bytes = match self
            .cfg
            .retry
            .run("rides.download", || self.fetcher.get_bytes(&url))
        {
            Ok(bytes) => bytes,
            Err(RideLoadError::HttpStatus { status: 404, .. }) => {
                warn!(
                    component = "rides",
                    event = "rides.file.not_published",
                    year = month.year,
                    month = month.month,
                    url = %url
                );
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&target, &bytes)?;
        info!(
            component = "rides",
            event = "rides.file.downloaded",
            path = %target.display(),
            bytes = bytes.len()
        );
        Ok(Some(target))
    }
}

impl RideEventSource for MonthlyRideFiles {
    fn fetch(
        &self,
        from: DateTime<Utc>,
        to_exclusive: DateTime<Utc>,
    ) -> Result<Vec<RideEvent>, RideLoadError> {
        validate_range(from, to_exclusive)?;
        let months = plan_required_months(from, to_exclusive);
        info!(
            component = "rides",
            event = "rides.fetch.start",
            from = %from,
            to_exclusive = %to_exclusive,
            month_count = months.len()
        );

        let mut events = Vec::new();
        for month in months {
            let Some(path) = self.ensure_month(month)? else {
                continue;
            };
            let Some((month_start, month_end)) = month.bounds() else {
                continue;
            };
            let parsed = parse_ride_file(&path)?;
            let total = parsed.len();
            let mut kept = 0usize;
            for event in parsed {
                // Raw files carry stray rows from neighbouring months.
                if event.pickup_datetime < month_start || event.pickup_datetime >= month_end {
                    continue;
                }
                if event.pickup_datetime >= from && event.pickup_datetime < to_exclusive {
                    events.push(event);
                    kept += 1;
                }
            }
            debug!(
                component = "rides",
                event = "rides.file.parsed",
                path = %path.display(),
                rows = total,
                kept
            );
        }

        sort_events(&mut events);
        info!(
            component = "rides",
            event = "rides.fetch.finish",
            events = events.len()
        );
        Ok(events)
    }
}

fn validate_range(from: DateTime<Utc>, to_exclusive: DateTime<Utc>) -> Result<(), RideLoadError> {
    if to_exclusive <= from {
        return Err(RideLoadError::InvalidRange(format!(
            "to ({to_exclusive}) must be after from ({from})"
        )));
    }
    Ok(())
}

fn sort_events(events: &mut [RideEvent]) {
    events.sort_by_key(|event| (event.pickup_location_id, event.pickup_datetime));
}

fn month_start(date: NaiveDate) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(date.year(), date.month(), 1, 0, 0, 0)
        .single()
}

fn parse_ride_file(path: &Path) -> Result<Vec<RideEvent>, RideLoadError> {
    let is_zip = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);
    let csv_buf = if is_zip {
        read_csv_from_zip(path)?
    } else {
        fs::read(path)?
    };
    parse_ride_csv(path, &csv_buf)
}

fn read_csv_from_zip(path: &Path) -> Result<Vec<u8>, RideLoadError> {
    let file = fs::File::open(path)?;
    let mut zip = ZipArchive::new(file)?;
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        return Ok(buf);
    }
    Err(RideLoadError::MissingCsvEntry {
        path: path.to_path_buf(),
    })
}

fn parse_ride_csv(path: &Path, csv_buf: &[u8]) -> Result<Vec<RideEvent>, RideLoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(Cursor::new(csv_buf));
    let headers = reader.headers()?.clone();
    let datetime_idx = column_index(&headers, &DATETIME_COLUMNS).ok_or_else(|| {
        RideLoadError::MissingColumn {
            path: path.to_path_buf(),
            column: DATETIME_COLUMNS[0],
        }
    })?;
    let location_idx = column_index(&headers, &LOCATION_COLUMNS).ok_or_else(|| {
        RideLoadError::MissingColumn {
            path: path.to_path_buf(),
            column: LOCATION_COLUMNS[0],
        }
    })?;

    let mut events = Vec::new();
    for record in reader.records() {
        let record = record?;
        events.push(RideEvent {
            pickup_datetime: parse_pickup_datetime(record_field(&record, datetime_idx))?,
            pickup_location_id: parse_location(record_field(&record, location_idx))?,
        });
    }
    Ok(events)
}

fn column_index(headers: &StringRecord, candidates: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|header| candidates.iter().any(|c| header.trim() == *c))
}

fn record_field(record: &StringRecord, idx: usize) -> &str {
    record.get(idx).unwrap_or_default().trim()
}

fn parse_pickup_datetime(raw: &str) -> Result<DateTime<Utc>, RideLoadError> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| RideLoadError::ParseField {
            field: "pickup_datetime",
            value: raw.to_string(),
        })
}

fn parse_location(raw: &str) -> Result<u32, RideLoadError> {
    raw.parse::<u32>().map_err(|_| RideLoadError::ParseField {
        field: "pickup_location_id",
        value: raw.to_string(),
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RideLoadError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            RideLoadError::InvalidRange(format!("invalid output path: {}", path.display()))
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

trait HttpFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, RideLoadError>;
}

struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    fn new(timeout_ms: u64) -> Result<Self, RideLoadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| RideLoadError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, RideLoadError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| RideLoadError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RideLoadError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| RideLoadError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}
