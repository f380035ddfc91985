//! Presentation rows for detected gaps, with directions links a user can
//! open to draw the missing route.

use serde::Serialize;

use crate::extract::Gap;
use crate::track::TrackPoint;

const MAPS_DIR_BASE: &str = "https://www.google.de/maps/dir/";
const MAPS_DIR_SUFFIX: &str = "/data=!4m2!4m1!3e1?hl=en";

/// Converts a drawn route into a GPX file.
pub const MAPS_TO_GPX_URL: &str = "https://mapstogpx.com/";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GapReport {
    /// 1-based, in track order.
    pub number: usize,
    pub index: usize,
    pub from: (f64, f64),
    pub to: (f64, f64),
    pub distance_m: f64,
    pub duration_s: f64,
    pub link: String,
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn coordinate(point: &TrackPoint) -> String {
    format!("{},{}", round4(point.lat), round4(point.lon))
}

pub fn gap_link(from: &TrackPoint, to: &TrackPoint) -> String {
    format!(
        "{MAPS_DIR_BASE}{}/{}{MAPS_DIR_SUFFIX}",
        coordinate(from),
        coordinate(to)
    )
}

/// Directions ending at the first recorded point.
pub fn missing_start_link(first: &TrackPoint) -> String {
    format!("{MAPS_DIR_BASE}/{}{MAPS_DIR_SUFFIX}", coordinate(first))
}

/// Directions starting at the last recorded point.
pub fn missing_end_link(last: &TrackPoint) -> String {
    format!("{MAPS_DIR_BASE}{}{MAPS_DIR_SUFFIX}", coordinate(last))
}

/// One row per gap. Gaps whose index does not fit `points` are skipped.
pub fn gap_reports(points: &[TrackPoint], gaps: &[Gap]) -> Vec<GapReport> {
    gaps.iter()
        .filter_map(|gap| {
            let before = points.get(gap.index.checked_sub(1)?)?;
            let after = points.get(gap.index)?;
            Some((gap, before, after))
        })
        .enumerate()
        .map(|(i, (gap, before, after))| GapReport {
            number: i + 1,
            index: gap.index,
            from: (round4(before.lat), round4(before.lon)),
            to: (round4(after.lat), round4(after.lon)),
            distance_m: gap.distance_m,
            duration_s: gap.duration_s,
            link: gap_link(before, after),
        })
        .collect()
}
