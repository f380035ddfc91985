//! Timestamp assignment for snippet points.
//!
//! Snippet points are walked in order and stamped with the travel time from
//! the previously emitted point at an effective speed. Between two recorded
//! anchors the speed comes from the reference distance and the time the
//! recording was interrupted; at the edges of a track a fixed fallback speed
//! is used instead.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::matcher::InsertionKind;
use crate::track::TrackPoint;
use crate::{validate_reference_distance, RepairError, RepairParams};

/// Drops points that lie within `min_spacing_m` of the last emitted point.
///
/// A dropped point does not become the new reference, so a slow drift of
/// jittery fixes is still emitted once it adds up to more than the spacing.
#[derive(Clone, Debug)]
pub struct SpacingFilter {
    min_spacing_m: f64,
    last: Option<(f64, f64)>,
}

impl SpacingFilter {
    /// Filter whose reference is an already emitted point, if any.
    pub fn seeded(min_spacing_m: f64, last_emitted: Option<&TrackPoint>) -> Self {
        Self {
            min_spacing_m,
            last: last_emitted.map(|p| (p.lat, p.lon)),
        }
    }

    /// Distance from the last emitted point if `point` is to be emitted.
    /// The first point seen by an unseeded filter is always admitted.
    pub fn admit(&mut self, point: &TrackPoint) -> Option<f64> {
        let step = match self.last {
            None => 0.0,
            Some((lat, lon)) => {
                let d = crate::geo::distance_meters(lat, lon, point.lat, point.lon);
                if d <= self.min_spacing_m {
                    return None;
                }
                d
            }
        };
        self.last = Some((point.lat, point.lon));
        Some(step)
    }
}

/// Recorded points on either side of the insertion index.
#[derive(Clone, Copy, Debug, Default)]
pub struct Anchors<'a> {
    pub before: Option<&'a TrackPoint>,
    pub after: Option<&'a TrackPoint>,
}

impl<'a> Anchors<'a> {
    pub fn around(main: &'a [TrackPoint], index: usize) -> Self {
        Self {
            before: index.checked_sub(1).and_then(|i| main.get(i)),
            after: main.get(index),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnippetDiagnostics {
    /// Sum of haversine steps between consecutive raw snippet points.
    pub estimated_snippet_distance_m: f64,
    /// `estimated / reference - 1`; positive when the snippet overestimates.
    pub distance_error_fraction: f64,
    pub average_speed_mps: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetimedSnippet {
    pub points: Vec<TrackPoint>,
    /// Reference speed: reference distance over the interrupted time, or the
    /// fallback speed at the track edges.
    pub speed_mps: f64,
    /// Speed actually used for stepping. Higher than `speed_mps` only when the
    /// emitted path is longer than the reference distance.
    pub applied_speed_mps: f64,
    /// Snippet points dropped by the spacing rule.
    pub skipped: usize,
    /// Only present for interior insertions.
    pub diagnostics: Option<SnippetDiagnostics>,
}

/// Assign timestamps to `snippet` for insertion of the given kind.
pub fn retime(
    snippet: &[TrackPoint],
    anchors: Anchors<'_>,
    reference_distance_m: f64,
    kind: InsertionKind,
    params: &RepairParams,
) -> Result<RetimedSnippet, RepairError> {
    let reference_distance_m = validate_reference_distance(reference_distance_m)?;
    if snippet.is_empty() {
        return Err(RepairError::EmptyTrack("snippet has no points".into()));
    }

    match kind {
        InsertionKind::Interior => retime_interior(snippet, anchors, reference_distance_m, params),
        InsertionKind::LeadingEdge => retime_leading(snippet, anchors, reference_distance_m, params),
        InsertionKind::TrailingEdge => retime_trailing(snippet, anchors, params),
    }
}

fn retime_interior(
    snippet: &[TrackPoint],
    anchors: Anchors<'_>,
    reference_distance_m: f64,
    params: &RepairParams,
) -> Result<RetimedSnippet, RepairError> {
    let (before, after) = match (anchors.before, anchors.after) {
        (Some(before), Some(after)) => (before, after),
        _ => {
            return Err(RepairError::InvalidParameter(
                "interior insertion needs a recorded point on both sides".into(),
            ))
        }
    };
    let t_before = anchor_time(before, "point before the gap")?;
    let t_after = anchor_time(after, "point after the gap")?;

    let elapsed_s = (t_after - t_before).num_milliseconds() as f64 / 1000.0;
    if elapsed_s <= 0.0 {
        return Err(RepairError::DegenerateTiming(format!(
            "{elapsed_s} s elapse between the anchors of the gap"
        )));
    }
    let speed_mps = reference_distance_m / elapsed_s;
    if speed_mps <= 0.0 {
        return Err(RepairError::DegenerateTiming(
            "a reference distance of 0 m leaves no travel time for the snippet".into(),
        ));
    }

    let estimated = path_length(snippet);
    let diagnostics = SnippetDiagnostics {
        estimated_snippet_distance_m: estimated,
        distance_error_fraction: estimated / reference_distance_m - 1.0,
        average_speed_mps: speed_mps,
    };

    let (kept, skipped) = select_points(snippet, Some(before), params.min_spacing_m);
    let chained = chain_length(&kept, after);
    let applied_speed_mps = if chained > reference_distance_m {
        warn!(
            "Snippet path ({:.0} m) is longer than the reference distance ({:.0} m); \
             compressing it into the {:.1} s gap",
            chained, reference_distance_m, elapsed_s
        );
        chained / elapsed_s
    } else {
        speed_mps
    };

    let points = stamp(&kept, t_before, applied_speed_mps)?;
    debug!(
        "Interior retime: {} of {} points, {:.2} m/s over {:.1} s",
        points.len(),
        snippet.len(),
        applied_speed_mps,
        elapsed_s
    );

    Ok(RetimedSnippet {
        points,
        speed_mps,
        applied_speed_mps,
        skipped,
        diagnostics: Some(diagnostics),
    })
}

fn retime_leading(
    snippet: &[TrackPoint],
    anchors: Anchors<'_>,
    reference_distance_m: f64,
    params: &RepairParams,
) -> Result<RetimedSnippet, RepairError> {
    let first_recorded = anchors.after.ok_or_else(|| {
        RepairError::InvalidParameter("leading insertion needs the track's first point".into())
    })?;
    let t_first = anchor_time(first_recorded, "first point of the track")?;
    let speed_mps = params.fallback_speed_mps;

    // The snippet's first point is the synthetic start; it is always emitted.
    let (head, rest) = snippet.split_at(1);
    let (mut kept, skipped) = select_points(rest, Some(&head[0]), params.min_spacing_m);
    kept.insert(0, (&head[0], 0.0));

    let chained = chain_length(&kept, first_recorded);
    let lead_m = reference_distance_m.max(chained);
    let start = duration_from_secs(lead_m / speed_mps)
        .and_then(|lead| t_first.checked_sub_signed(lead))
        .ok_or_else(|| {
            RepairError::DegenerateTiming(format!(
                "starting {lead_m} m ahead of the track at {speed_mps} m/s is out of range"
            ))
        })?;

    let points = stamp(&kept, start, speed_mps)?;
    debug!(
        "Leading retime: {} of {} points starting {:.1} s before the track",
        points.len(),
        snippet.len(),
        lead_m / speed_mps
    );

    Ok(RetimedSnippet {
        points,
        speed_mps,
        applied_speed_mps: speed_mps,
        skipped,
        diagnostics: None,
    })
}

fn retime_trailing(
    snippet: &[TrackPoint],
    anchors: Anchors<'_>,
    params: &RepairParams,
) -> Result<RetimedSnippet, RepairError> {
    let last_recorded = anchors.before.ok_or_else(|| {
        RepairError::InvalidParameter("trailing insertion needs the track's last point".into())
    })?;
    let t_last = anchor_time(last_recorded, "last point of the track")?;
    let speed_mps = params.fallback_speed_mps;

    let (kept, skipped) = select_points(snippet, Some(last_recorded), params.min_spacing_m);
    let points = stamp(&kept, t_last, speed_mps)?;
    debug!(
        "Trailing retime: {} of {} points",
        points.len(),
        snippet.len()
    );

    Ok(RetimedSnippet {
        points,
        speed_mps,
        applied_speed_mps: speed_mps,
        skipped,
        diagnostics: None,
    })
}

fn anchor_time(point: &TrackPoint, what: &str) -> Result<DateTime<Utc>, RepairError> {
    point
        .time
        .ok_or_else(|| RepairError::MissingTimestamp(what.to_string()))
}

/// Points surviving the spacing rule, each with its step from the previous
/// emitted point (or from `seed`).
fn select_points<'a>(
    points: &'a [TrackPoint],
    seed: Option<&TrackPoint>,
    min_spacing_m: f64,
) -> (Vec<(&'a TrackPoint, f64)>, usize) {
    let mut filter = SpacingFilter::seeded(min_spacing_m, seed);
    let mut kept = Vec::with_capacity(points.len());
    let mut skipped = 0;
    for point in points {
        match filter.admit(point) {
            Some(step) => kept.push((point, step)),
            None => skipped += 1,
        }
    }
    (kept, skipped)
}

fn stamp(
    kept: &[(&TrackPoint, f64)],
    start: DateTime<Utc>,
    speed_mps: f64,
) -> Result<Vec<TrackPoint>, RepairError> {
    // Offsets accumulate in f64 so rounding to microseconds does not drift.
    let mut offset_s = 0.0;
    kept.iter()
        .map(|(point, step)| {
            offset_s += step / speed_mps;
            duration_from_secs(offset_s)
                .and_then(|offset| start.checked_add_signed(offset))
                .map(|time| point.retimed(time))
                .ok_or_else(|| {
                    RepairError::DegenerateTiming(format!(
                        "{offset_s} s after {start} is out of range"
                    ))
                })
        })
        .collect()
}

/// Emitted steps plus the closing leg to the recorded point that follows.
fn chain_length(kept: &[(&TrackPoint, f64)], next: &TrackPoint) -> f64 {
    let steps: f64 = kept.iter().map(|(_, step)| step).sum();
    let closing = kept.last().map(|(p, _)| p.distance_to(next)).unwrap_or(0.0);
    steps + closing
}

fn path_length(points: &[TrackPoint]) -> f64 {
    points.windows(2).map(|w| w[0].distance_to(&w[1])).sum()
}

/// `None` when the offset does not fit a timestamp.
fn duration_from_secs(secs: f64) -> Option<Duration> {
    let micros = (secs * 1e6).round();
    if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
        return None;
    }
    Some(Duration::microseconds(micros as i64))
}
