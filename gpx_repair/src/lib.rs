//! Repair of GPX recordings with tracking holes.
//!
//! A main track is scanned for gaps, a separately recorded snippet is matched
//! to the closest gap (or to the start/end of the track), re-timed against a
//! reference distance and spliced in.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub mod extract;
pub mod geo;
pub mod gpx_io;
pub mod matcher;
pub mod report;
pub mod retime;
pub mod splice;
pub mod track;

pub use extract::{extract, Extraction, Gap, PointTable, TrackSummary};
pub use geo::distance_meters;
pub use gpx_io::{parse_track, read_track, write_track, write_track_file};
pub use matcher::{select_insertion_point, Candidate, InsertionKind, InsertionPoint};
pub use report::{gap_reports, GapReport, MAPS_TO_GPX_URL};
pub use retime::{retime, Anchors, RetimedSnippet, SnippetDiagnostics, SpacingFilter};
pub use splice::splice;
pub use track::{ExtensionFields, Track, TrackPoint};

#[derive(Error, Debug)]
pub enum RepairError {
    #[error("empty track: {0}")]
    EmptyTrack(String),
    #[error("snippet does not match the track: closest candidate is {distance_m:.0} m away (limit {threshold_m:.0} m)")]
    NoPlausibleMatch { distance_m: f64, threshold_m: f64 },
    #[error("degenerate timing: {0}")]
    DegenerateTiming(String),
    #[error("invalid reference distance: {0}")]
    InvalidReferenceDistance(String),
    #[error("missing timestamp on the {0}")]
    MissingTimestamp(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("failed to parse GPX file: {0}")]
    GpxParse(String),
    #[error("failed to write GPX file: {0}")]
    GpxWrite(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Default pace assumed when a snippet extends the track at either end.
pub const FALLBACK_SPEED_MPS: f64 = 15.0 / 3.6;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairParams {
    /// A gap needs more than this many seconds between consecutive points.
    pub time_threshold_s: f64,
    /// ... and more than this many meters. Also the largest accepted distance
    /// between a snippet and its insertion point.
    pub dist_threshold_m: f64,
    /// Snippet points this close to the previously emitted point are dropped.
    pub min_spacing_m: f64,
    pub fallback_speed_mps: f64,
}

impl Default for RepairParams {
    fn default() -> Self {
        Self {
            time_threshold_s: 5.0,
            dist_threshold_m: 400.0,
            min_spacing_m: 10.0,
            fallback_speed_mps: FALLBACK_SPEED_MPS,
        }
    }
}

impl RepairParams {
    /// Load parameters from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, RepairError> {
        let data = fs::read_to_string(path)?;
        let params: RepairParams = serde_json::from_str(&data)
            .map_err(|e| RepairError::InvalidParameter(format!("{}: {e}", path.display())))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), RepairError> {
        let positive = [
            ("time_threshold_s", self.time_threshold_s),
            ("dist_threshold_m", self.dist_threshold_m),
            ("fallback_speed_mps", self.fallback_speed_mps),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(RepairError::InvalidParameter(format!(
                    "{name} must be a positive number, got {value}"
                )));
            }
        }
        if !self.min_spacing_m.is_finite() || self.min_spacing_m < 0.0 {
            return Err(RepairError::InvalidParameter(format!(
                "min_spacing_m must not be negative, got {}",
                self.min_spacing_m
            )));
        }
        Ok(())
    }
}

pub(crate) fn validate_reference_distance(meters: f64) -> Result<f64, RepairError> {
    if !meters.is_finite() {
        return Err(RepairError::InvalidReferenceDistance(format!(
            "{meters} is not a finite number"
        )));
    }
    if meters < 0.0 {
        return Err(RepairError::InvalidReferenceDistance(format!(
            "{meters} m is negative"
        )));
    }
    Ok(meters)
}

/// Parse a reference distance in meters as typed by a user.
pub fn parse_reference_distance(raw: &str) -> Result<f64, RepairError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RepairError::InvalidReferenceDistance(
            "no distance given".into(),
        ));
    }
    let meters: f64 = trimmed.parse().map_err(|_| {
        RepairError::InvalidReferenceDistance(format!("'{trimmed}' is not a number"))
    })?;
    validate_reference_distance(meters)
}

#[derive(Clone, Copy, Debug)]
pub struct RepairRequest<'a> {
    pub main: &'a Track,
    pub snippet: &'a Track,
    /// Ground-truth length of the snippet, e.g. from a routing service.
    pub reference_distance_m: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct RepairedTrack {
    pub track: Track,
    pub insertion: InsertionPoint,
    pub candidates: Vec<Candidate>,
    pub speed_mps: f64,
    pub applied_speed_mps: f64,
    pub inserted_points: usize,
    pub skipped_points: usize,
    /// Only present when the snippet was inserted between two recorded points.
    pub diagnostics: Option<SnippetDiagnostics>,
    /// The repaired track run through the extractor again.
    pub extraction: Extraction,
}

/// Splice `request.snippet` into the best matching gap of `request.main`.
///
/// Nothing is produced unless every stage succeeds; the result carries the
/// new track together with its fresh extraction.
pub fn repair(request: RepairRequest<'_>, params: &RepairParams) -> Result<RepairedTrack, RepairError> {
    params.validate()?;
    let reference_distance_m = request
        .reference_distance_m
        .ok_or_else(|| RepairError::InvalidReferenceDistance("no distance given".into()))
        .and_then(validate_reference_distance)?;

    let main = &request.main.points;
    let snippet = &request.snippet.points;
    let (snippet_first, snippet_last) = match (snippet.first(), snippet.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(RepairError::EmptyTrack("snippet has no points".into())),
    };

    let before = extract(request.main, params)?;
    debug!("Main track has {} gaps before repair", before.gaps.len());

    let (insertion, candidates) = select_insertion_point(
        main,
        &before.gaps,
        snippet_first,
        snippet_last,
        params.dist_threshold_m,
    )?;

    let retimed = retime(
        snippet,
        Anchors::around(main, insertion.index),
        reference_distance_m,
        insertion.kind,
        params,
    )?;

    let points = splice(main, insertion.index, &retimed.points, params.min_spacing_m)?;
    let inserted_points = points.len() - main.len();
    let track = Track::new(request.main.name.clone(), points);
    let extraction = extract(&track, params)?;

    info!(
        "Inserted {} snippet points at index {} ({:?}); {} gaps remain",
        inserted_points,
        insertion.index,
        insertion.kind,
        extraction.gaps.len()
    );
    if let Some(diag) = retimed.diagnostics.as_ref() {
        info!(
            "Snippet path {:.0} m vs reference {:.0} m ({:+.1} %), average speed {:.2} km/h",
            diag.estimated_snippet_distance_m,
            reference_distance_m,
            diag.distance_error_fraction * 100.0,
            diag.average_speed_mps * 3.6
        );
    }

    Ok(RepairedTrack {
        track,
        insertion,
        candidates,
        speed_mps: retimed.speed_mps,
        applied_speed_mps: retimed.applied_speed_mps,
        inserted_points,
        skipped_points: retimed.skipped,
        diagnostics: retimed.diagnostics,
        extraction,
    })
}
