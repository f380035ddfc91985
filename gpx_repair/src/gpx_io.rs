//! Reading and writing GPX files.
//!
//! Positions, elevations, times and the track name come from the `gpx` crate.
//! It drops `<extensions>`, so per-point extension fields are collected in a
//! second pass over the raw XML. Writing goes through `quick-xml` so every
//! point gets its `gpxtpx:TrackPointExtension` block back.

use std::error::Error;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::debug;

use crate::track::{ExtensionFields, Track, TrackPoint};
use crate::RepairError;

pub const GPX_NAMESPACE: &str = "http://www.topografix.com/GPX/1/1";
pub const TRACK_POINT_EXTENSION_NAMESPACE: &str =
    "http://www.garmin.com/xmlschemas/TrackPointExtension/v1";
const CREATOR: &str = "gpx_repair";

/// Parse the first segment of the first track in a GPX document.
pub fn parse_track(input: &[u8]) -> Result<Track, RepairError> {
    let gpx = gpx::read(Cursor::new(input)).map_err(|e| RepairError::GpxParse(e.to_string()))?;
    let track = gpx
        .tracks
        .into_iter()
        .next()
        .ok_or_else(|| RepairError::EmptyTrack("GPX file contains no track".into()))?;
    let name = track.name;
    let segment = track
        .segments
        .into_iter()
        .next()
        .ok_or_else(|| RepairError::EmptyTrack("GPX track contains no segment".into()))?;

    let extensions = read_extension_fields(input)?;
    if extensions.len() != segment.points.len() {
        return Err(RepairError::GpxParse(format!(
            "found extension data for {} points but the segment has {}",
            extensions.len(),
            segment.points.len()
        )));
    }

    let points = segment
        .points
        .into_iter()
        .zip(extensions)
        .map(|(waypoint, extensions)| {
            let time = match waypoint.time {
                Some(time) => Some(to_utc(time)?),
                None => None,
            };
            let point_geo = waypoint.point();
            Ok(TrackPoint {
                lat: point_geo.y(),
                lon: point_geo.x(),
                elevation: waypoint.elevation,
                time,
                extensions,
            })
        })
        .collect::<Result<Vec<_>, RepairError>>()?;

    debug!("Parsed GPX track {:?} with {} points", name, points.len());
    Ok(Track::new(name, points))
}

/// Read a GPX file. A track without a name is named after the file.
pub fn read_track(path: &Path) -> Result<Track, RepairError> {
    let data = fs::read(path)?;
    let mut track = parse_track(&data)?;
    if track.name.is_none() {
        track.name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string);
    }
    Ok(track)
}

fn to_utc(time: gpx::Time) -> Result<DateTime<Utc>, RepairError> {
    let iso = time
        .format()
        .map_err(|e| RepairError::GpxParse(e.to_string()))?;
    Ok(DateTime::parse_from_rfc3339(&iso)
        .map_err(|e| RepairError::GpxParse(e.to_string()))?
        .with_timezone(&Utc))
}

/// Extension fields of every point in the first segment of the first track.
///
/// Fields are the children of the elements directly below `<extensions>`,
/// e.g. `gpxtpx:TrackPointExtension/gpxtpx:hr`, keyed by local name.
fn read_extension_fields(input: &[u8]) -> Result<Vec<ExtensionFields>, RepairError> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut out: Vec<ExtensionFields> = Vec::new();
    let mut tracks = 0usize;
    let mut segments = 0usize;
    let mut in_point = false;
    // Depth below <extensions>; 0 is the <extensions> element itself.
    let mut ext_depth: Option<usize> = None;
    let mut field: Option<(String, String)> = None;

    loop {
        let target = tracks == 1 && segments == 1;
        match reader.read_event_into(&mut buf) {
            Err(e) => {
                return Err(RepairError::GpxParse(format!(
                    "error at position {}: {e}",
                    reader.buffer_position()
                )))
            }
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let name = local_name(e.local_name().as_ref());
                match ext_depth {
                    Some(depth) => {
                        ext_depth = Some(depth + 1);
                        if depth + 1 == 2 {
                            field = Some((name, String::new()));
                        }
                    }
                    None => match name.as_str() {
                        "trk" => {
                            tracks += 1;
                            segments = 0;
                        }
                        "trkseg" => segments += 1,
                        "trkpt" => {
                            in_point = true;
                            if target {
                                out.push(ExtensionFields::new());
                            }
                        }
                        "extensions" if in_point => ext_depth = Some(0),
                        _ => {}
                    },
                }
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(e.local_name().as_ref());
                match ext_depth {
                    Some(1) => {
                        if let (true, Some(fields)) = (target && in_point, out.last_mut()) {
                            fields.insert(name, "");
                        }
                    }
                    Some(_) => {}
                    None => match name.as_str() {
                        "trk" => {
                            tracks += 1;
                            segments = 0;
                        }
                        "trkseg" => segments += 1,
                        "trkpt" if target => out.push(ExtensionFields::new()),
                        _ => {}
                    },
                }
            }
            Ok(Event::Text(e)) => {
                if let Some((_, value)) = field.as_mut() {
                    let text = e
                        .unescape()
                        .map_err(|err| RepairError::GpxParse(err.to_string()))?;
                    value.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match ext_depth {
                Some(0) => ext_depth = None,
                Some(depth) => {
                    if depth == 2 {
                        if let Some((key, value)) = field.take() {
                            if let (true, Some(fields)) = (target && in_point, out.last_mut()) {
                                fields.insert(key, value);
                            }
                        }
                    }
                    ext_depth = Some(depth - 1);
                }
                None => {
                    if e.local_name().as_ref() == b"trkpt" {
                        in_point = false;
                    }
                }
            },
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

/// Render a track as a GPX 1.1 document.
pub fn write_track(track: &Track) -> Result<String, RepairError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    write_document(&mut writer, track).map_err(|e| RepairError::GpxWrite(e.to_string()))?;
    String::from_utf8(writer.into_inner()).map_err(|e| RepairError::GpxWrite(e.to_string()))
}

fn write_document<W: Write>(w: &mut Writer<W>, track: &Track) -> Result<(), Box<dyn Error>> {
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    let mut root = BytesStart::new("gpx");
    root.push_attribute(("version", "1.1"));
    root.push_attribute(("creator", CREATOR));
    root.push_attribute(("xmlns", GPX_NAMESPACE));
    root.push_attribute(("xmlns:gpxtpx", TRACK_POINT_EXTENSION_NAMESPACE));
    w.write_event(Event::Start(root))?;

    w.write_event(Event::Start(BytesStart::new("trk")))?;
    if let Some(name) = track.name.as_deref() {
        text_element(w, "name", name)?;
    }
    w.write_event(Event::Start(BytesStart::new("trkseg")))?;

    for point in &track.points {
        let mut trkpt = BytesStart::new("trkpt");
        trkpt.push_attribute(("lat", point.lat.to_string().as_str()));
        trkpt.push_attribute(("lon", point.lon.to_string().as_str()));
        w.write_event(Event::Start(trkpt))?;

        if let Some(ele) = point.elevation {
            text_element(w, "ele", &ele.to_string())?;
        }
        if let Some(time) = point.time {
            text_element(w, "time", &time.to_rfc3339_opts(SecondsFormat::AutoSi, true))?;
        }
        if !point.extensions.is_empty() {
            w.write_event(Event::Start(BytesStart::new("extensions")))?;
            w.write_event(Event::Start(BytesStart::new("gpxtpx:TrackPointExtension")))?;
            for (key, value) in point.extensions.iter() {
                text_element(w, &format!("gpxtpx:{key}"), value)?;
            }
            w.write_event(Event::End(BytesEnd::new("gpxtpx:TrackPointExtension")))?;
            w.write_event(Event::End(BytesEnd::new("extensions")))?;
        }

        w.write_event(Event::End(BytesEnd::new("trkpt")))?;
    }

    w.write_event(Event::End(BytesEnd::new("trkseg")))?;
    w.write_event(Event::End(BytesEnd::new("trk")))?;
    w.write_event(Event::End(BytesEnd::new("gpx")))?;
    Ok(())
}

fn text_element<W: Write>(w: &mut Writer<W>, name: &str, text: &str) -> Result<(), Box<dyn Error>> {
    w.write_event(Event::Start(BytesStart::new(name)))?;
    w.write_event(Event::Text(BytesText::new(text)))?;
    w.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Lowercase the name and replace spaces and path separators with `_`.
pub fn sanitize_track_name(name: &str) -> String {
    let cleaned = name
        .trim()
        .replace([' ', '/', '\\'], "_")
        .to_lowercase();
    if cleaned.is_empty() {
        "track".to_string()
    } else {
        cleaned
    }
}

pub fn repaired_file_name(track_name: &str) -> String {
    format!("{}_repaired.gpx", sanitize_track_name(track_name))
}

/// `<dir>/<name>_repaired.gpx`, or `<name>_repaired_<n>.gpx` with the
/// smallest `n >= 2` that is not taken yet.
pub fn unique_output_path(dir: &Path, track_name: &str) -> PathBuf {
    let first = dir.join(repaired_file_name(track_name));
    if !first.exists() {
        return first;
    }
    let base = sanitize_track_name(track_name);
    (2..)
        .map(|n| dir.join(format!("{base}_repaired_{n}.gpx")))
        .find(|path| !path.exists())
        .unwrap_or(first)
}

/// Render `track` and write it under a fresh name in `dir`.
///
/// The document is rendered completely before anything touches the disk.
pub fn write_track_file(dir: &Path, track: &Track) -> Result<PathBuf, RepairError> {
    let document = write_track(track)?;
    fs::create_dir_all(dir)?;
    let path = unique_output_path(dir, track.name.as_deref().unwrap_or("track"));
    fs::write(&path, document)?;
    debug!("Wrote {} points to {}", track.len(), path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1"
     xmlns:gpxtpx="http://www.garmin.com/xmlschemas/TrackPointExtension/v1">
  <trk>
    <name>Evening Run / Park</name>
    <trkseg>
      <trkpt lat="47.3769" lon="8.5417">
        <ele>408.2</ele>
        <time>2024-05-01T18:00:00Z</time>
        <extensions>
          <gpxtpx:TrackPointExtension>
            <gpxtpx:hr>121</gpxtpx:hr>
            <gpxtpx:cad>80</gpxtpx:cad>
          </gpxtpx:TrackPointExtension>
        </extensions>
      </trkpt>
      <trkpt lat="47.3772" lon="8.5420">
        <ele>409.0</ele>
        <time>2024-05-01T18:00:05Z</time>
      </trkpt>
      <trkpt lat="47.3775" lon="8.5424">
        <ele>409.6</ele>
        <time>2024-05-01T18:00:10.500Z</time>
        <extensions>
          <gpxtpx:TrackPointExtension>
            <gpxtpx:hr>125</gpxtpx:hr>
          </gpxtpx:TrackPointExtension>
        </extensions>
      </trkpt>
    </trkseg>
    <trkseg>
      <trkpt lat="47.5" lon="8.6">
        <extensions><gpxtpx:TrackPointExtension><gpxtpx:hr>99</gpxtpx:hr></gpxtpx:TrackPointExtension></extensions>
      </trkpt>
    </trkseg>
  </trk>
</gpx>"#;

    #[test]
    fn parses_points_and_extensions_of_first_segment() {
        let track = parse_track(SAMPLE.as_bytes()).unwrap();
        assert_eq!(track.name.as_deref(), Some("Evening Run / Park"));
        assert_eq!(track.len(), 3);

        let first = &track.points[0];
        assert_eq!(first.lat, 47.3769);
        assert_eq!(first.lon, 8.5417);
        assert_eq!(first.elevation, Some(408.2));
        let fields: Vec<_> = first.extensions.iter().collect();
        assert_eq!(fields, vec![("hr", "121"), ("cad", "80")]);

        assert!(track.points[1].extensions.is_empty());
        assert_eq!(track.points[2].extensions.get("hr"), Some("125"));
        let t0 = first.time.unwrap();
        let t2 = track.points[2].time.unwrap();
        assert_eq!(t2 - t0, Duration::milliseconds(10_500));
    }

    #[test]
    fn written_track_parses_back_identically() {
        let mut track = parse_track(SAMPLE.as_bytes()).unwrap();
        // Retimed points carry sub-second precision.
        let shifted = track.points[1].time.unwrap() + Duration::microseconds(123_456);
        track.points[1] = track.points[1].retimed(shifted);

        let xml = write_track(&track).unwrap();
        assert!(xml.contains(r#"xmlns:gpxtpx="http://www.garmin.com/xmlschemas/TrackPointExtension/v1""#));
        assert!(xml.contains("<gpxtpx:hr>121</gpxtpx:hr>"));

        let reread = parse_track(xml.as_bytes()).unwrap();
        assert_eq!(reread, track);
    }

    #[test]
    fn written_track_is_valid_for_the_gpx_crate() {
        let track = parse_track(SAMPLE.as_bytes()).unwrap();
        let xml = write_track(&track).unwrap();
        let gpx = gpx::read(xml.as_bytes()).unwrap();
        assert_eq!(gpx.tracks.len(), 1);
        assert_eq!(gpx.tracks[0].segments.len(), 1);
        assert_eq!(gpx.tracks[0].segments[0].points.len(), 3);
    }

    #[test]
    fn extension_values_are_escaped() {
        let fields: ExtensionFields = [("note", "a<b & c")].into_iter().collect();
        let track = Track::new(
            Some("x".into()),
            vec![TrackPoint::new(1.0, 2.0).with_extensions(fields)],
        );
        let xml = write_track(&track).unwrap();
        assert!(xml.contains("a&lt;b &amp; c"));
        let reread = parse_track(xml.as_bytes()).unwrap();
        assert_eq!(reread.points[0].extensions.get("note"), Some("a<b & c"));
    }

    #[test]
    fn malformed_input_is_a_parse_error() {
        let err = parse_track(b"<gpx version=\"1.1\"><trk><trkseg><trkpt lat=").unwrap_err();
        assert!(matches!(err, RepairError::GpxParse(_)));
    }

    #[test]
    fn file_without_track_is_empty() {
        let xml = r#"<?xml version="1.0"?><gpx version="1.1" creator="t"></gpx>"#;
        let err = parse_track(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, RepairError::EmptyTrack(_)));
    }

    #[test]
    fn track_names_are_sanitized() {
        assert_eq!(sanitize_track_name("  Evening Run / Park "), "evening_run___park");
        assert_eq!(sanitize_track_name("a\\b"), "a_b");
        assert_eq!(sanitize_track_name("   "), "track");
        assert_eq!(repaired_file_name("Morning Ride"), "morning_ride_repaired.gpx");
    }

    #[test]
    fn output_paths_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let track = parse_track(SAMPLE.as_bytes()).unwrap();

        let first = write_track_file(dir.path(), &track).unwrap();
        let second = write_track_file(dir.path(), &track).unwrap();
        assert_eq!(
            first.file_name().unwrap().to_str(),
            Some("evening_run___park_repaired.gpx")
        );
        assert_eq!(
            second.file_name().unwrap().to_str(),
            Some("evening_run___park_repaired_2.gpx")
        );
        assert_eq!(read_track(&second).unwrap(), track);
    }

    #[test]
    fn unnamed_track_takes_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lunch_loop.gpx");
        let xml = SAMPLE.replace("<name>Evening Run / Park</name>", "");
        fs::write(&path, xml).unwrap();
        let track = read_track(&path).unwrap();
        assert_eq!(track.name.as_deref(), Some("lunch_loop"));
    }
}
