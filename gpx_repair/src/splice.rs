use crate::retime::SpacingFilter;
use crate::track::TrackPoint;
use crate::RepairError;

/// Stitch `main[..index]`, the retimed snippet and `main[index..]` together.
///
/// Snippet points pass through the same spacing rule the retimer applies,
/// measured from the last emitted original point. Original points are always
/// emitted as they are.
pub fn splice(
    main: &[TrackPoint],
    insertion_index: usize,
    timed_snippet: &[TrackPoint],
    min_spacing_m: f64,
) -> Result<Vec<TrackPoint>, RepairError> {
    if insertion_index > main.len() {
        return Err(RepairError::InvalidParameter(format!(
            "insertion index {insertion_index} is past the end of a track of {} points",
            main.len()
        )));
    }

    let (head, tail) = main.split_at(insertion_index);
    let mut out = Vec::with_capacity(main.len() + timed_snippet.len());
    out.extend_from_slice(head);

    let mut filter = SpacingFilter::seeded(min_spacing_m, head.last());
    out.extend(
        timed_snippet
            .iter()
            .filter(|p| filter.admit(p).is_some())
            .cloned(),
    );

    out.extend_from_slice(tail);
    Ok(out)
}
