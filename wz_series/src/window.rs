//! Fixed-width wall-clock windowing of vehicles into control/test cohorts.
//!
//! Unlike sample binning, window boundaries align to the Unix epoch rather
//! than the dataset minimum: 60-minute windows start on the hour no matter
//! when the data starts. One `IntervalBucket` is the unit of data a dashboard
//! interval displays.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::bucket::Bucketing;
use crate::{VehicleRecord, WzError};

/// Window widths the dashboards offer. The engine accepts any positive
/// width; this menu is a UI convention.
pub const WINDOW_MINUTES_CHOICES: [i64; 7] = [30, 60, 120, 240, 360, 720, 1440];

const MS_PER_MINUTE: i64 = 60_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntervalBucket {
    pub start_time: DateTime<Utc>,
    /// Inclusive end at millisecond resolution: `start + width - 1 ms`.
    pub end_time: DateTime<Utc>,
    /// Control vehicles ascending by `visit_date`.
    pub control_vehicles: Vec<VehicleRecord>,
    /// Test vehicles ascending by `visit_date`.
    pub test_vehicles: Vec<VehicleRecord>,
}

impl IntervalBucket {
    pub fn vehicle_count(&self) -> usize {
        self.control_vehicles.len() + self.test_vehicles.len()
    }

    /// Consumer-side sufficiency check; the engine never drops intervals.
    pub fn has_min_control(&self, threshold: usize) -> bool {
        self.control_vehicles.len() >= threshold
    }
}

/// Group a roster into epoch-aligned windows of `window_minutes`, splitting
/// each window into control/test cohorts ordered by `visit_date`.
///
/// Every vehicle lands in exactly one bucket, degenerate ones included
/// (membership depends only on `visit_date`). Buckets come back ascending by
/// `start_time`; windows with no vehicles are not materialized.
pub fn resample_intervals(
    vehicles: &[VehicleRecord],
    window_minutes: i64,
) -> Result<Vec<IntervalBucket>, WzError> {
    if window_minutes <= 0 {
        return Err(WzError::InvalidParameter(format!(
            "window width must be positive, got {window_minutes} minutes"
        )));
    }
    let bucketing = Bucketing::aligned_to_epoch(window_minutes * MS_PER_MINUTE)?;

    let mut sorted: Vec<VehicleRecord> = vehicles.to_vec();
    sorted.sort_by_key(|v| v.visit_date);

    let mut grouped: BTreeMap<i64, IntervalBucket> = BTreeMap::new();
    for vehicle in sorted {
        let index = bucketing.index(vehicle.visit_date);
        let bucket = grouped.entry(index).or_insert_with(|| IntervalBucket {
            start_time: bucketing.start(index),
            end_time: bucketing.start(index + 1) - Duration::milliseconds(1),
            control_vehicles: Vec::new(),
            test_vehicles: Vec::new(),
        });
        if vehicle.is_control_group {
            bucket.control_vehicles.push(vehicle);
        } else {
            bucket.test_vehicles.push(vehicle);
        }
    }

    Ok(grouped.into_values().collect())
}
