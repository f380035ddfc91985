//! Choice of the place in the main track where a snippet belongs.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::extract::Gap;
use crate::track::TrackPoint;
use crate::RepairError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsertionKind {
    /// Between two recorded points, filling a detected gap.
    Interior,
    /// Before the first recorded point: the recording started late.
    LeadingEdge,
    /// After the last recorded point: the recording stopped early.
    TrailingEdge,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub index: usize,
    pub kind: InsertionKind,
    pub distance_m: f64,
}

/// Snippet points are inserted before `main[index]`; `index == main.len()`
/// appends them.
pub type InsertionPoint = Candidate;

/// Pick the gap (or track edge) whose anchor lies closest to the snippet.
///
/// Gap candidates measure from the point before the hole to the snippet's
/// first point. Index 0 measures from the track's first point to the snippet's
/// last point, index `main.len()` from the track's last point to the snippet's
/// first point. On ties the earlier candidate wins, in that order.
pub fn select_insertion_point(
    main: &[TrackPoint],
    gaps: &[Gap],
    snippet_first: &TrackPoint,
    snippet_last: &TrackPoint,
    dist_threshold_m: f64,
) -> Result<(InsertionPoint, Vec<Candidate>), RepairError> {
    let (first, last) = match (main.first(), main.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(RepairError::EmptyTrack("main track has no points".into())),
    };

    let mut candidates = Vec::with_capacity(gaps.len() + 2);
    for gap in gaps {
        let anchor = gap
            .index
            .checked_sub(1)
            .and_then(|i| main.get(i))
            .ok_or_else(|| {
                RepairError::InvalidParameter(format!(
                    "gap index {} is outside a track of {} points",
                    gap.index,
                    main.len()
                ))
            })?;
        candidates.push(Candidate {
            index: gap.index,
            kind: InsertionKind::Interior,
            distance_m: anchor.distance_to(snippet_first),
        });
    }
    candidates.push(Candidate {
        index: 0,
        kind: InsertionKind::LeadingEdge,
        distance_m: first.distance_to(snippet_last),
    });
    candidates.push(Candidate {
        index: main.len(),
        kind: InsertionKind::TrailingEdge,
        distance_m: last.distance_to(snippet_first),
    });

    // min_by_key keeps the first of equal minima.
    let best = *candidates
        .iter()
        .min_by_key(|c| OrderedFloat(c.distance_m))
        .ok_or_else(|| RepairError::EmptyTrack("no insertion candidates".into()))?;

    debug!(
        "Best insertion candidate: index {} ({:?}) at {:.1} m of {} candidates",
        best.index,
        best.kind,
        best.distance_m,
        candidates.len()
    );

    if best.distance_m > dist_threshold_m {
        return Err(RepairError::NoPlausibleMatch {
            distance_m: best.distance_m,
            threshold_m: dist_threshold_m,
        });
    }
    Ok((best, candidates))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ~111 m per 0.001 degree of latitude.
    fn p(lat: f64, lon: f64) -> TrackPoint {
        TrackPoint::new(lat, lon)
    }

    fn main_track() -> Vec<TrackPoint> {
        vec![
            p(47.000, 8.0),
            p(47.001, 8.0),
            p(47.010, 8.0), // hole before index 2
            p(47.011, 8.0),
            p(47.030, 8.0), // hole before index 4
            p(47.031, 8.0),
        ]
    }

    fn gaps() -> Vec<Gap> {
        vec![
            Gap {
                index: 2,
                distance_m: 1000.0,
                duration_s: 60.0,
            },
            Gap {
                index: 4,
                distance_m: 2100.0,
                duration_s: 120.0,
            },
        ]
    }

    #[test]
    fn picks_gap_nearest_to_snippet_start() {
        let main = main_track();
        let (best, candidates) = select_insertion_point(
            &main,
            &gaps(),
            &p(47.0112, 8.0),
            &p(47.0298, 8.0),
            400.0,
        )
        .unwrap();
        assert_eq!(best.index, 4);
        assert_eq!(best.kind, InsertionKind::Interior);
        assert_eq!(candidates.len(), 4);
        assert_eq!(candidates[2].index, 0);
        assert_eq!(candidates[3].index, main.len());
    }

    #[test]
    fn prefers_leading_edge_when_snippet_ends_at_track_start() {
        let main = main_track();
        let (best, _) = select_insertion_point(
            &main,
            &gaps(),
            &p(46.990, 8.0),
            &p(46.9999, 8.0),
            400.0,
        )
        .unwrap();
        assert_eq!(best.index, 0);
        assert_eq!(best.kind, InsertionKind::LeadingEdge);
    }

    #[test]
    fn prefers_trailing_edge_when_snippet_starts_at_track_end() {
        let main = main_track();
        let (best, _) = select_insertion_point(
            &main,
            &gaps(),
            &p(47.0311, 8.0),
            &p(47.040, 8.0),
            400.0,
        )
        .unwrap();
        assert_eq!(best.index, main.len());
        assert_eq!(best.kind, InsertionKind::TrailingEdge);
    }

    #[test]
    fn ties_go_to_the_earliest_candidate() {
        // Both gap anchors coincide, so both candidates are equally close.
        let main = vec![p(47.0, 8.0), p(47.1, 8.0), p(47.0, 8.0), p(47.1, 8.0)];
        let gaps = vec![
            Gap {
                index: 1,
                distance_m: 11_000.0,
                duration_s: 600.0,
            },
            Gap {
                index: 3,
                distance_m: 11_000.0,
                duration_s: 600.0,
            },
        ];
        let (best, _) =
            select_insertion_point(&main, &gaps, &p(47.0005, 8.0), &p(47.05, 8.0), 400.0)
                .unwrap();
        assert_eq!(best.index, 1);
    }

    #[test]
    fn threshold_is_inclusive() {
        let main = main_track();
        let first = p(47.0315, 8.0);
        let last = p(47.040, 8.0);
        let exact = main[5].distance_to(&first);

        let (best, _) = select_insertion_point(&main, &gaps(), &first, &last, exact).unwrap();
        assert_eq!(best.kind, InsertionKind::TrailingEdge);
        assert_eq!(best.distance_m, exact);

        let just_below = f64::from_bits(exact.to_bits() - 1);
        let err =
            select_insertion_point(&main, &gaps(), &first, &last, just_below).unwrap_err();
        assert!(matches!(err, RepairError::NoPlausibleMatch { .. }));
    }

    #[test]
    fn distant_snippet_is_rejected() {
        let main = main_track();
        // Roughly 50 km south of everything in the main track.
        let err = select_insertion_point(
            &main,
            &gaps(),
            &p(46.55, 8.0),
            &p(46.56, 8.0),
            400.0,
        )
        .unwrap_err();
        match err {
            RepairError::NoPlausibleMatch {
                distance_m,
                threshold_m,
            } => {
                assert!(distance_m > 40_000.0);
                assert_eq!(threshold_m, 400.0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_main_track_is_rejected() {
        let err = select_insertion_point(&[], &[], &p(47.0, 8.0), &p(47.0, 8.0), 400.0)
            .unwrap_err();
        assert!(matches!(err, RepairError::EmptyTrack(_)));
    }
}
