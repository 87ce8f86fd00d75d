//! Fixed-width time bucketing and gap-aware segment splitting.
//!
//! Both the 1-minute cohort averaging and the 2-hour minimum-speed smoothing
//! bin through the same primitive, so nothing here assumes a particular
//! width. Segments exist so a chart never draws a line across a bucket range
//! with no data.

use chrono::{DateTime, Utc};

use crate::WzError;

/// A validated bucketing scheme: an origin instant and a positive width.
///
/// Bucket `i` covers `[origin + i*width, origin + (i+1)*width)`; timestamps
/// before the origin map to negative indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bucketing {
    origin_ms: i64,
    width_ms: i64,
}

impl Bucketing {
    pub fn new(origin: DateTime<Utc>, width_ms: i64) -> Result<Self, WzError> {
        if width_ms <= 0 {
            return Err(WzError::InvalidParameter(format!(
                "bucket width must be positive, got {width_ms} ms"
            )));
        }
        Ok(Self {
            origin_ms: origin.timestamp_millis(),
            width_ms,
        })
    }

    /// Buckets aligned to Unix epoch 0, i.e. wall-clock marks rather than
    /// dataset-relative boundaries.
    pub fn aligned_to_epoch(width_ms: i64) -> Result<Self, WzError> {
        Self::new(DateTime::<Utc>::UNIX_EPOCH, width_ms)
    }

    pub fn width_ms(&self) -> i64 {
        self.width_ms
    }

    pub fn index(&self, t: DateTime<Utc>) -> i64 {
        (t.timestamp_millis() - self.origin_ms).div_euclid(self.width_ms)
    }

    pub fn start(&self, index: i64) -> DateTime<Utc> {
        ms_to_utc(self.origin_ms + index * self.width_ms)
    }

    /// Representative instant of a bucket, its midpoint.
    pub fn midpoint(&self, index: i64) -> DateTime<Utc> {
        ms_to_utc(self.origin_ms + index * self.width_ms + self.width_ms / 2)
    }
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Split `(bucket_index, payload)` pairs, ascending by index, into maximal
/// runs of contiguous indices.
///
/// A gap greater than 1 between adjacent indices starts a new segment; a
/// single-element input yields one single-element segment and an empty input
/// yields no segments.
pub fn split_segments<T>(indexed: Vec<(i64, T)>) -> Vec<Vec<T>> {
    let mut segments: Vec<Vec<T>> = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut prev_index: Option<i64> = None;

    for (index, payload) in indexed {
        if let Some(prev) = prev_index {
            if index - prev > 1 && !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
        }
        current.push(payload);
        prev_index = Some(index);
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}
