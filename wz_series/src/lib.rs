//! Core work-zone speed series aggregation library implemented in Rust.
//!
//! Takes per-vehicle speed/time point series from a work-zone study and
//! produces time-bucketed cohort aggregates with gap-aware segment splitting,
//! per-vehicle speed minimums, and fixed-width wall-clock groupings of
//! vehicles into control/test cohorts. Rendering and storage are left to
//! consumers; every entry point is a pure function of its arguments.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod aggregate;
pub mod bucket;
pub mod window;

pub use aggregate::{
    aggregate_cohorts, minimum_trend, vehicle_minimums, BinnedPoint, CohortAverages, MinimumTrend,
    VehicleMinimum, DEFAULT_AXIS_SPEED_MPH,
};
pub use bucket::{split_segments, Bucketing};
pub use window::{resample_intervals, IntervalBucket, WINDOW_MINUTES_CHOICES};

/// Fallback raw-speed axis maximum when a roster carries no samples.
pub const DEFAULT_RAW_SPEED_MPH: f64 = 100.0;

#[derive(Error, Debug)]
pub enum WzError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to parse vehicle records: {0}")]
    JsonParse(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Where bucket index 0 starts.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum OriginMode {
    /// Minimum `event_time` across the whole roster, so control and test
    /// series share bucket boundaries.
    DatasetMin,
    /// Unix epoch 0; window boundaries land on wall-clock marks.
    Epoch,
}

impl Default for OriginMode {
    fn default() -> Self {
        OriginMode::DatasetMin
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Params {
    /// Bucket width for cohort speed averaging, milliseconds.
    pub bucket_width_ms: i64,
    /// Bucket width for smoothing test-cohort minimums, milliseconds.
    pub min_bucket_width_ms: i64,
    /// Window width for interval grouping of vehicles, minutes.
    pub window_minutes: i64,
    pub origin_mode: OriginMode,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            bucket_width_ms: 60_000,
            min_bucket_width_ms: 7_200_000,
            window_minutes: 120,
            origin_mode: OriginMode::DatasetMin,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), WzError> {
        if self.bucket_width_ms <= 0 {
            return Err(WzError::InvalidParameter(format!(
                "bucket width must be positive, got {} ms",
                self.bucket_width_ms
            )));
        }
        if self.min_bucket_width_ms <= 0 {
            return Err(WzError::InvalidParameter(format!(
                "minimum-speed bucket width must be positive, got {} ms",
                self.min_bucket_width_ms
            )));
        }
        if self.window_minutes <= 0 {
            return Err(WzError::InvalidParameter(format!(
                "window width must be positive, got {} minutes",
                self.window_minutes
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SamplePoint {
    pub event_time: DateTime<Utc>,
    pub speed: f64,
    #[serde(default)]
    pub acceleration: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub vehicle_id: i64,
    /// Classification/trigger time; fixes window membership.
    pub visit_date: DateTime<Utc>,
    pub is_control_group: bool,
    #[serde(default)]
    pub district: Option<i64>,
    #[serde(default)]
    pub workzone_id: Option<String>,
    #[serde(default)]
    pub is_chins_reportable: Option<String>,
    #[serde(default)]
    pub cause: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Point series; insertion order is not guaranteed sorted by time.
    #[serde(rename = "data", default)]
    pub points: Vec<SamplePoint>,
}

impl VehicleRecord {
    /// A vehicle with no sample points. Still counts toward window
    /// membership but has no defined speed minimum.
    pub fn is_degenerate(&self) -> bool {
        self.points.is_empty()
    }

    /// Points sorted ascending by `event_time` (stored order is arbitrary).
    pub fn sorted_points(&self) -> Vec<SamplePoint> {
        let mut points = self.points.clone();
        points.sort_by_key(|p| p.event_time);
        points
    }
}

/// Parse vehicle records from bytes using the provided format hint (extension).
///
/// Accepts a JSON array of records or JSON Lines (one record per line, blank
/// lines skipped), as produced by the study's export tooling.
pub fn parse_vehicles(input: &[u8], format: &str) -> Result<Vec<VehicleRecord>, WzError> {
    let format_lc = format.to_ascii_lowercase();
    if format_lc.ends_with(".json") || format_lc == "json" {
        serde_json::from_slice(input).map_err(|e| WzError::JsonParse(e.to_string()))
    } else if format_lc.ends_with(".jsonl")
        || format_lc == "jsonl"
        || format_lc.ends_with(".ndjson")
        || format_lc == "ndjson"
    {
        let text = std::str::from_utf8(input).map_err(|e| WzError::JsonParse(e.to_string()))?;
        let mut out = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: VehicleRecord =
                serde_json::from_str(line).map_err(|e| WzError::JsonParse(e.to_string()))?;
            out.push(record);
        }
        Ok(out)
    } else {
        Err(WzError::UnsupportedFormat(format.to_string()))
    }
}

/// Minimum and maximum `event_time` across every sample in the roster.
pub fn time_extent(vehicles: &[VehicleRecord]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let mut extent: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
    for vehicle in vehicles {
        for point in &vehicle.points {
            extent = Some(match extent {
                None => (point.event_time, point.event_time),
                Some((start, end)) => (start.min(point.event_time), end.max(point.event_time)),
            });
        }
    }
    extent
}

/// Maximum raw speed across every sample, or [`DEFAULT_RAW_SPEED_MPH`] for an
/// empty roster.
pub fn max_raw_speed(vehicles: &[VehicleRecord]) -> f64 {
    vehicles
        .iter()
        .flat_map(|v| v.points.iter())
        .map(|p| OrderedFloat(p.speed))
        .max()
        .map(|m| m.0)
        .unwrap_or(DEFAULT_RAW_SPEED_MPH)
}

/// Group a mixed roster by `workzone_id`; records without one land under
/// `"unknown"`.
pub fn group_by_workzone(vehicles: &[VehicleRecord]) -> BTreeMap<String, Vec<VehicleRecord>> {
    let mut grouped: BTreeMap<String, Vec<VehicleRecord>> = BTreeMap::new();
    for vehicle in vehicles {
        let key = vehicle
            .workzone_id
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        grouped.entry(key).or_default().push(vehicle.clone());
    }
    grouped
}
