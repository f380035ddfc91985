//! Flattening of a track into a numeric table, gap detection and summary bounds.

use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geo::distance_meters;
use crate::track::{Track, TrackPoint};
use crate::{RepairError, RepairParams};

const COL_LAT: usize = 0;
const COL_LON: usize = 1;
const COL_ELE: usize = 2;
const COL_DT: usize = 3;

/// Per-point numeric table: latitude, longitude, elevation (NaN when absent)
/// and seconds elapsed since the previous point (0 for the first point or when
/// either timestamp is missing).
#[derive(Clone, Debug, PartialEq)]
pub struct PointTable {
    data: Array2<f64>,
}

impl PointTable {
    fn from_points(points: &[TrackPoint]) -> Self {
        let mut data = Array2::<f64>::zeros((points.len(), 4));
        for (i, point) in points.iter().enumerate() {
            data[[i, COL_LAT]] = point.lat;
            data[[i, COL_LON]] = point.lon;
            data[[i, COL_ELE]] = point.elevation.unwrap_or(f64::NAN);
            if i > 0 {
                data[[i, COL_DT]] = seconds_between(points[i - 1].time, point.time).unwrap_or(0.0);
            }
        }
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lat(&self, i: usize) -> f64 {
        self.data[[i, COL_LAT]]
    }

    pub fn lon(&self, i: usize) -> f64 {
        self.data[[i, COL_LON]]
    }

    pub fn elevation(&self, i: usize) -> Option<f64> {
        let ele = self.data[[i, COL_ELE]];
        (!ele.is_nan()).then_some(ele)
    }

    pub fn latitudes(&self) -> ArrayView1<'_, f64> {
        self.data.column(COL_LAT)
    }

    pub fn longitudes(&self) -> ArrayView1<'_, f64> {
        self.data.column(COL_LON)
    }

    pub fn time_deltas(&self) -> ArrayView1<'_, f64> {
        self.data.column(COL_DT)
    }

    /// Haversine distance between rows `i - 1` and `i`.
    pub fn step_distance(&self, i: usize) -> f64 {
        distance_meters(self.lat(i - 1), self.lon(i - 1), self.lat(i), self.lon(i))
    }
}

/// A tracking hole between point `index - 1` and point `index`. A snippet that
/// fills it is inserted before `index`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub index: usize,
    pub distance_m: f64,
    pub duration_s: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackSummary {
    pub point_count: usize,
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_elevation: Option<f64>,
    pub max_elevation: Option<f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
}

impl TrackSummary {
    pub fn duration_s(&self) -> Option<f64> {
        seconds_between(self.start_time, self.finish_time)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Extraction {
    pub table: PointTable,
    pub gaps: Vec<Gap>,
    pub summary: TrackSummary,
}

/// Build the point table, detect gaps and summarise a track.
///
/// A gap is recorded at `i` only when the time since the previous point
/// exceeds `time_threshold_s` *and* the distance to it exceeds
/// `dist_threshold_m`. The function is pure, so calling it again on an
/// unchanged track yields an identical result.
pub fn extract(track: &Track, params: &RepairParams) -> Result<Extraction, RepairError> {
    if track.is_empty() {
        return Err(RepairError::EmptyTrack("track has no points".into()));
    }

    let table = PointTable::from_points(&track.points);
    let gaps = detect_gaps(&table, params);
    let summary = summarize(&table, &track.points);
    debug!(
        "Extracted {} points, {} gaps (thresholds {} s / {} m)",
        table.len(),
        gaps.len(),
        params.time_threshold_s,
        params.dist_threshold_m
    );

    Ok(Extraction {
        table,
        gaps,
        summary,
    })
}

fn detect_gaps(table: &PointTable, params: &RepairParams) -> Vec<Gap> {
    // Row 0 has no predecessor and a delta of 0.
    table
        .time_deltas()
        .iter()
        .enumerate()
        .skip(1)
        .filter(|&(_, &dt)| dt > params.time_threshold_s)
        .filter_map(|(i, &dt)| {
            let dist = table.step_distance(i);
            (dist > params.dist_threshold_m).then_some(Gap {
                index: i,
                distance_m: dist,
                duration_s: dt,
            })
        })
        .collect()
}

fn summarize(table: &PointTable, points: &[TrackPoint]) -> TrackSummary {
    let (min_lat, max_lat) = min_max(table.latitudes());
    let (min_lon, max_lon) = min_max(table.longitudes());
    let (min_elevation, max_elevation) = (0..table.len())
        .filter_map(|i| table.elevation(i))
        .fold((None, None), |(lo, hi): (Option<f64>, Option<f64>), e| {
            (
                Some(lo.map_or(e, |lo| lo.min(e))),
                Some(hi.map_or(e, |hi| hi.max(e))),
            )
        });

    TrackSummary {
        point_count: table.len(),
        min_lat,
        max_lat,
        min_lon,
        max_lon,
        min_elevation,
        max_elevation,
        start_time: points.first().and_then(|p| p.time),
        finish_time: points.last().and_then(|p| p.time),
    }
}

fn min_max(values: ArrayView1<'_, f64>) -> (f64, f64) {
    values.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    })
}

pub(crate) fn seconds_between(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Option<f64> {
    Some((to? - from?).num_milliseconds() as f64 / 1000.0)
}
