//! Hour truncation and the shared hourly axis used by densify and window.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

pub const HOUR_MS: i64 = 3_600_000;
pub const RUN_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeIndexError {
    #[error("invalid run datetime '{0}', expected YYYY-MM-DD HH:MM:SS")]
    InvalidRunDatetime(String),
    #[error("timestamp out of range: {0}")]
    OutOfRange(i64),
}

pub fn floor_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let floored_ms = ts.timestamp_millis().div_euclid(HOUR_MS) * HOUR_MS;
    Utc.timestamp_millis_opt(floored_ms)
        .single()
        .unwrap_or(ts)
}

pub fn current_hour() -> DateTime<Utc> {
    floor_hour(Utc::now())
}

/// Unix milliseconds, the `pickup_ts` encoding used as the event-time key.
pub fn to_unix_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_unix_ms(ts_ms: i64) -> Result<DateTime<Utc>, TimeIndexError> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .ok_or(TimeIndexError::OutOfRange(ts_ms))
}

pub fn hours(count: i64) -> ChronoDuration {
    ChronoDuration::milliseconds(count.saturating_mul(HOUR_MS))
}

pub fn parse_run_datetime(raw: &str) -> Result<DateTime<Utc>, TimeIndexError> {
    NaiveDateTime::parse_from_str(raw.trim(), RUN_DATETIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| TimeIndexError::InvalidRunDatetime(raw.to_string()))
}

/// A contiguous run of UTC hours, each entry the start of its hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourAxis {
    start: DateTime<Utc>,
    len: usize,
}

impl HourAxis {
    /// Axis from `first` to `last`, both truncated and inclusive.
    pub fn spanning(first: DateTime<Utc>, last: DateTime<Utc>) -> Self {
        let start = floor_hour(first);
        let end = floor_hour(last);
        if end < start {
            return Self { start, len: 0 };
        }
        let len = ((end - start).num_milliseconds() / HOUR_MS) as usize + 1;
        Self { start, len }
    }

    /// Every hour whose start lies in `[floor_hour(from), to_exclusive)`.
    pub fn covering(from: DateTime<Utc>, to_exclusive: DateTime<Utc>) -> Self {
        let start = floor_hour(from);
        if to_exclusive <= start {
            return Self { start, len: 0 };
        }
        let span_ms = (to_exclusive - start).num_milliseconds();
        let len = ((span_ms + HOUR_MS - 1) / HOUR_MS) as usize;
        Self { start, len }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end_exclusive(&self) -> DateTime<Utc> {
        self.start + hours(self.len as i64)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn hour_at(&self, idx: usize) -> Option<DateTime<Utc>> {
        (idx < self.len).then(|| self.start + hours(idx as i64))
    }

    /// Position of the hour containing `ts`, if it falls on the axis.
    pub fn index_of(&self, ts: DateTime<Utc>) -> Option<usize> {
        let offset_ms = (floor_hour(ts) - self.start).num_milliseconds();
        if offset_ms < 0 {
            return None;
        }
        let idx = (offset_ms / HOUR_MS) as usize;
        (idx < self.len).then_some(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        (0..self.len).map(move |idx| self.start + hours(idx as i64))
    }
}
