//! Cohort speed averaging and per-vehicle minimum extraction.
//!
//! Control and test samples are binned against a shared origin so the two
//! series line up bucket for bucket. Test-cohort minimums get a coarser
//! second pass of the same binning to produce a smoothed trend; control
//! minimums stay as raw points.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::bucket::{split_segments, Bucketing};
use crate::{time_extent, OriginMode, Params, VehicleRecord, WzError};

/// Fallback axis maximum when a cohort has no buckets to take a maximum over.
pub const DEFAULT_AXIS_SPEED_MPH: f64 = 80.0;

/// One populated time bucket: midpoint instant, mean of the speeds that fell
/// in it, and how many did.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BinnedPoint {
    pub time: DateTime<Utc>,
    pub avg_speed: f64,
    pub count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CohortAverages {
    pub control_segments: Vec<Vec<BinnedPoint>>,
    pub test_segments: Vec<Vec<BinnedPoint>>,
    /// Maximum `avg_speed` over both cohorts' buckets, for axis scaling.
    pub max_avg_speed: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct VehicleMinimum {
    pub vehicle_id: i64,
    pub min_speed: f64,
    pub min_time: DateTime<Utc>,
    pub is_control: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MinimumTrend {
    /// Test-cohort minimums, mean-aggregated into coarse buckets and split at
    /// gaps.
    pub test_min_segments: Vec<Vec<BinnedPoint>>,
    /// Control-cohort minimums, passed through raw.
    pub control_minimums: Vec<VehicleMinimum>,
    /// Maximum `min_speed` over all vehicles, for axis scaling.
    pub max_min_speed: f64,
}

/// Bin every sample by cohort at `params.bucket_width_ms` and compute the
/// per-bucket mean speed and count, segment-split at gaps.
///
/// A roster with no samples, or a cohort with none, yields empty segment
/// lists rather than an error.
pub fn aggregate_cohorts(
    vehicles: &[VehicleRecord],
    params: &Params,
) -> Result<CohortAverages, WzError> {
    params.validate()?;

    let Some(origin) = resolve_origin(vehicles, params.origin_mode) else {
        return Ok(CohortAverages {
            control_segments: Vec::new(),
            test_segments: Vec::new(),
            max_avg_speed: DEFAULT_AXIS_SPEED_MPH,
        });
    };
    let bucketing = Bucketing::new(origin, params.bucket_width_ms)?;

    let mut control: Vec<(DateTime<Utc>, f64)> = Vec::new();
    let mut test: Vec<(DateTime<Utc>, f64)> = Vec::new();
    for vehicle in vehicles {
        let cohort = if vehicle.is_control_group {
            &mut control
        } else {
            &mut test
        };
        for point in &vehicle.points {
            cohort.push((point.event_time, point.speed));
        }
    }

    let control_bins = bin_points(&control, &bucketing);
    let test_bins = bin_points(&test, &bucketing);

    let max_avg_speed = control_bins
        .iter()
        .chain(test_bins.iter())
        .map(|(_, b)| OrderedFloat(b.avg_speed))
        .max()
        .map(|m| m.0)
        .unwrap_or(DEFAULT_AXIS_SPEED_MPH);

    Ok(CohortAverages {
        control_segments: split_segments(control_bins),
        test_segments: split_segments(test_bins),
        max_avg_speed,
    })
}

/// The minimum-speed sample of each vehicle, first occurrence winning ties
/// (by position in the stored point sequence).
///
/// Vehicles with no points have no defined minimum and are left out; they
/// still participate in window membership elsewhere.
pub fn vehicle_minimums(vehicles: &[VehicleRecord]) -> Vec<VehicleMinimum> {
    vehicles
        .iter()
        .filter_map(|vehicle| {
            let point = vehicle
                .points
                .iter()
                .min_by_key(|p| OrderedFloat(p.speed))?;
            Some(VehicleMinimum {
                vehicle_id: vehicle.vehicle_id,
                min_speed: point.speed,
                min_time: point.event_time,
                is_control: vehicle.is_control_group,
            })
        })
        .collect()
}

/// Per-vehicle minimums split by cohort: test minimums smoothed through
/// `params.min_bucket_width_ms` buckets, control minimums raw.
pub fn minimum_trend(
    vehicles: &[VehicleRecord],
    params: &Params,
) -> Result<MinimumTrend, WzError> {
    params.validate()?;

    let minimums = vehicle_minimums(vehicles);
    // No minimums means no samples at all, so there is no origin to bin
    // against either.
    let origin = resolve_origin(vehicles, params.origin_mode);
    let (Some(origin), false) = (origin, minimums.is_empty()) else {
        return Ok(MinimumTrend {
            test_min_segments: Vec::new(),
            control_minimums: Vec::new(),
            max_min_speed: DEFAULT_AXIS_SPEED_MPH,
        });
    };
    let bucketing = Bucketing::new(origin, params.min_bucket_width_ms)?;

    let max_min_speed = minimums
        .iter()
        .map(|m| OrderedFloat(m.min_speed))
        .max()
        .map(|m| m.0)
        .unwrap_or(DEFAULT_AXIS_SPEED_MPH);

    let (control_minimums, test_minimums): (Vec<VehicleMinimum>, Vec<VehicleMinimum>) =
        minimums.into_iter().partition(|m| m.is_control);

    let test_points: Vec<(DateTime<Utc>, f64)> = test_minimums
        .iter()
        .map(|m| (m.min_time, m.min_speed))
        .collect();
    let test_bins = bin_points(&test_points, &bucketing);

    Ok(MinimumTrend {
        test_min_segments: split_segments(test_bins),
        control_minimums,
        max_min_speed,
    })
}

fn resolve_origin(vehicles: &[VehicleRecord], mode: OriginMode) -> Option<DateTime<Utc>> {
    match mode {
        OriginMode::DatasetMin => time_extent(vehicles).map(|(start, _)| start),
        OriginMode::Epoch => Some(DateTime::<Utc>::UNIX_EPOCH),
    }
}

/// Group timestamped values into buckets and reduce each to its mean.
/// Returns `(bucket_index, point)` pairs ascending by index.
fn bin_points(points: &[(DateTime<Utc>, f64)], bucketing: &Bucketing) -> Vec<(i64, BinnedPoint)> {
    let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for (time, value) in points {
        buckets.entry(bucketing.index(*time)).or_default().push(*value);
    }
    buckets
        .into_iter()
        .map(|(index, values)| {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            (
                index,
                BinnedPoint {
                    time: bucketing.midpoint(index),
                    avg_speed: mean,
                    count: values.len(),
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::SamplePoint;

    fn at(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 18, 10 + minute / 60, minute % 60, second)
            .unwrap()
    }

    fn vehicle(id: i64, is_control: bool, points: &[(DateTime<Utc>, f64)]) -> VehicleRecord {
        VehicleRecord {
            vehicle_id: id,
            visit_date: points.first().map(|(t, _)| *t).unwrap_or(at(0, 0)),
            is_control_group: is_control,
            district: None,
            workzone_id: None,
            is_chins_reportable: None,
            cause: None,
            message: None,
            points: points
                .iter()
                .map(|(event_time, speed)| SamplePoint {
                    event_time: *event_time,
                    speed: *speed,
                    acceleration: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_bucket_mean_is_arithmetic_mean() {
        let vehicles = vec![vehicle(
            1,
            false,
            &[(at(0, 10), 50.0), (at(0, 20), 60.0), (at(0, 40), 70.0)],
        )];
        let averages = aggregate_cohorts(&vehicles, &Params::default()).unwrap();
        assert_eq!(averages.test_segments.len(), 1);
        let bin = averages.test_segments[0][0];
        assert_eq!(bin.count, 3);
        assert!((bin.avg_speed - 60.0).abs() < 1e-12);
        assert_eq!(averages.max_avg_speed, bin.avg_speed);
    }

    #[test]
    fn test_bucket_mean_random_multisets() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let n = rng.gen_range(1..40);
            let speeds: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..90.0)).collect();
            let points: Vec<(DateTime<Utc>, f64)> = speeds
                .iter()
                .enumerate()
                .map(|(i, s)| (at(0, (i % 60) as u32), *s))
                .collect();
            let vehicles = vec![vehicle(1, true, &points)];
            let averages = aggregate_cohorts(&vehicles, &Params::default()).unwrap();
            let expected = speeds.iter().sum::<f64>() / speeds.len() as f64;
            let bin = averages.control_segments[0][0];
            assert_eq!(bin.count, speeds.len());
            assert!((bin.avg_speed - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_cohorts_share_bucket_boundaries() {
        // Control holds the earliest sample; test samples must bin relative
        // to that same origin, not their own minimum.
        let vehicles = vec![
            vehicle(1, true, &[(at(0, 0), 55.0)]),
            vehicle(2, false, &[(at(0, 30), 48.0), (at(1, 30), 52.0)]),
        ];
        let averages = aggregate_cohorts(&vehicles, &Params::default()).unwrap();
        let test_bins: Vec<BinnedPoint> = averages.test_segments.concat();
        assert_eq!(test_bins.len(), 2);
        assert_eq!(test_bins[0].time, at(0, 30));
        assert_eq!(test_bins[1].time, at(1, 30));
    }

    #[test]
    fn test_gap_splits_average_segments() {
        let vehicles = vec![vehicle(
            1,
            false,
            &[
                (at(0, 0), 10.0),
                (at(1, 0), 12.0),
                (at(2, 0), 11.0),
                (at(5, 0), 20.0),
                (at(6, 0), 22.0),
            ],
        )];
        let averages = aggregate_cohorts(&vehicles, &Params::default()).unwrap();
        assert_eq!(averages.test_segments.len(), 2);
        assert_eq!(averages.test_segments[0].len(), 3);
        assert_eq!(averages.test_segments[1].len(), 2);
        assert_eq!(averages.max_avg_speed, 22.0);
    }

    #[test]
    fn test_empty_roster_and_empty_cohort() {
        let averages = aggregate_cohorts(&[], &Params::default()).unwrap();
        assert!(averages.control_segments.is_empty());
        assert!(averages.test_segments.is_empty());
        assert_eq!(averages.max_avg_speed, DEFAULT_AXIS_SPEED_MPH);

        // Test-only roster: control side stays empty without error.
        let vehicles = vec![vehicle(1, false, &[(at(0, 0), 42.0)])];
        let averages = aggregate_cohorts(&vehicles, &Params::default()).unwrap();
        assert!(averages.control_segments.is_empty());
        assert_eq!(averages.test_segments.len(), 1);
    }

    #[test]
    fn test_invalid_width_fails_fast() {
        let params = Params {
            bucket_width_ms: -1,
            ..Params::default()
        };
        assert!(matches!(
            aggregate_cohorts(&[], &params),
            Err(WzError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_minimum_tie_break_first_occurrence() {
        let t1 = at(0, 0);
        let t2 = at(1, 0);
        let t3 = at(2, 0);
        let vehicles = vec![vehicle(9, false, &[(t1, 30.0), (t2, 25.0), (t3, 25.0)])];
        let minimums = vehicle_minimums(&vehicles);
        assert_eq!(minimums.len(), 1);
        assert_eq!(minimums[0].min_speed, 25.0);
        assert_eq!(minimums[0].min_time, t2);
    }

    #[test]
    fn test_degenerate_vehicles_excluded_from_minimums() {
        let vehicles = vec![
            vehicle(1, true, &[]),
            vehicle(2, false, &[(at(0, 0), 31.0)]),
        ];
        let minimums = vehicle_minimums(&vehicles);
        assert_eq!(minimums.len(), 1);
        assert_eq!(minimums[0].vehicle_id, 2);
    }

    #[test]
    fn test_minimum_trend_smooths_test_cohort_only() {
        // Two test vehicles two hours apart plus a neighbor, one control
        // vehicle. 2-hour buckets -> indices 0, 0, 1 for test.
        let vehicles = vec![
            vehicle(1, false, &[(at(0, 0), 40.0)]),
            vehicle(2, false, &[(at(10, 0), 44.0)]),
            vehicle(3, false, &[(at(125, 0), 30.0)]),
            vehicle(4, true, &[(at(5, 0), 61.0)]),
        ];
        let trend = minimum_trend(&vehicles, &Params::default()).unwrap();
        assert_eq!(trend.control_minimums.len(), 1);
        assert_eq!(trend.control_minimums[0].vehicle_id, 4);
        assert_eq!(trend.test_min_segments.len(), 1);
        let bins = &trend.test_min_segments[0];
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0].count, 2);
        assert!((bins[0].avg_speed - 42.0).abs() < 1e-12);
        assert_eq!(bins[1].count, 1);
        assert_eq!(trend.max_min_speed, 61.0);
    }

    #[test]
    fn test_minimum_trend_empty_roster() {
        let trend = minimum_trend(&[], &Params::default()).unwrap();
        assert!(trend.test_min_segments.is_empty());
        assert!(trend.control_minimums.is_empty());
        assert_eq!(trend.max_min_speed, DEFAULT_AXIS_SPEED_MPH);
    }

    #[test]
    fn test_minimum_trend_all_degenerate() {
        let vehicles = vec![vehicle(1, true, &[]), vehicle(2, false, &[])];
        let trend = minimum_trend(&vehicles, &Params::default()).unwrap();
        assert!(trend.test_min_segments.is_empty());
        assert!(trend.control_minimums.is_empty());
    }
}
