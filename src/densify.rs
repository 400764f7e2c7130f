//! Raw ride events to a dense hourly series per pickup location.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::rides::RideEvent;
use crate::time_index::{floor_hour, to_unix_ms, HourAxis};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HourlyCount {
    pub pickup_hour: DateTime<Utc>,
    pub pickup_location_id: u32,
    pub rides: u32,
}

impl HourlyCount {
    pub fn pickup_ts(&self) -> i64 {
        to_unix_ms(self.pickup_hour)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DensifyReport {
    pub input_events: u64,
    pub output_rows: u64,
    pub locations: u64,
    pub hours: u64,
    pub dropped_unexpected_location: u64,
    pub dropped_out_of_range: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DensifyError {
    #[error("no ride events to densify; an hourly axis cannot be derived")]
    EmptyInput,
    #[error("no expected pickup locations were supplied")]
    NoExpectedLocations,
    #[error("hour axis is empty")]
    EmptyAxis,
}

/// Sorted distinct pickup locations present in `events`.
pub fn observed_locations(events: &[RideEvent]) -> Vec<u32> {
    events
        .iter()
        .map(|event| event.pickup_location_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Densify onto the axis spanning the earliest to the latest event hour.
pub fn densify(
    events: &[RideEvent],
    expected_locations: &[u32],
) -> Result<(Vec<HourlyCount>, DensifyReport), DensifyError> {
    let (first, last) = event_bounds(events).ok_or(DensifyError::EmptyInput)?;
    let axis = HourAxis::spanning(first, last);
    densify_on_axis(events, expected_locations, &axis)
}

/// Densify onto a caller-supplied axis. Events outside the axis are dropped.
pub fn densify_on_axis(
    events: &[RideEvent],
    expected_locations: &[u32],
    axis: &HourAxis,
) -> Result<(Vec<HourlyCount>, DensifyReport), DensifyError> {
    if events.is_empty() {
        return Err(DensifyError::EmptyInput);
    }
    if expected_locations.is_empty() {
        return Err(DensifyError::NoExpectedLocations);
    }
    if axis.is_empty() {
        return Err(DensifyError::EmptyAxis);
    }

    let mut counts: BTreeMap<u32, Vec<u32>> = expected_locations
        .iter()
        .map(|location| (*location, vec![0u32; axis.len()]))
        .collect();

    let mut report = DensifyReport {
        input_events: events.len() as u64,
        output_rows: 0,
        locations: counts.len() as u64,
        hours: axis.len() as u64,
        dropped_unexpected_location: 0,
        dropped_out_of_range: 0,
    };

    for event in events {
        let Some(series) = counts.get_mut(&event.pickup_location_id) else {
            report.dropped_unexpected_location += 1;
            continue;
        };
        match axis.index_of(event.pickup_datetime) {
            Some(idx) => series[idx] = series[idx].saturating_add(1),
            None => report.dropped_out_of_range += 1,
        }
    }

    let mut rows = Vec::with_capacity(counts.len() * axis.len());
    for (location, series) in &counts {
        for (pickup_hour, rides) in axis.iter().zip(series.iter().copied()) {
            rows.push(HourlyCount {
                pickup_hour,
                pickup_location_id: *location,
                rides,
            });
        }
    }
    report.output_rows = rows.len() as u64;

    if report.dropped_unexpected_location > 0 || report.dropped_out_of_range > 0 {
        warn!(
            component = "densify",
            event = "densify.events_dropped",
            dropped_unexpected_location = report.dropped_unexpected_location,
            dropped_out_of_range = report.dropped_out_of_range
        );
    }

    info!(
        component = "densify",
        event = "densify.finish",
        input_events = report.input_events,
        output_rows = report.output_rows,
        locations = report.locations,
        hours = report.hours,
        axis_start = %axis.start(),
        axis_end_exclusive = %axis.end_exclusive()
    );

    Ok((rows, report))
}

fn event_bounds(events: &[RideEvent]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let first = events.iter().map(|event| event.pickup_datetime).min()?;
    let last = events.iter().map(|event| event.pickup_datetime).max()?;
    Some((floor_hour(first), floor_hour(last)))
}
