use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use gpx_repair::gpx_io::{read_track, write_track_file};
use gpx_repair::report::{gap_reports, missing_end_link, missing_start_link, GapReport};
use gpx_repair::{
    extract, parse_reference_distance, repair, Candidate, InsertionPoint, RepairParams,
    RepairRequest, SnippetDiagnostics, Track, TrackSummary, MAPS_TO_GPX_URL,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const LONG_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT_HASH"), ")");

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    long_version = LONG_VERSION,
    about = "Find tracking holes in GPX recordings and fill them with snippets",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the gaps of a GPX track together with directions links
    Gaps(GapsArgs),
    /// Splice a snippet GPX into the best matching gap of a track
    Repair(RepairArgs),
}

#[derive(Args, Debug)]
struct ParamArgs {
    /// JSON file with repair parameters (flags below take precedence)
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Seconds between consecutive points above which a gap may exist
    #[arg(long)]
    time_threshold: Option<f64>,

    /// Meters between consecutive points above which a gap may exist; also the
    /// largest accepted distance between a snippet and its insertion point
    #[arg(long)]
    dist_threshold: Option<f64>,

    /// Snippet points closer than this many meters to the previous point are dropped
    #[arg(long)]
    min_spacing: Option<f64>,

    /// Speed (km/h) used to time snippets added before the start or after the end
    #[arg(long)]
    fallback_speed_kmh: Option<f64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Csv,
    Json,
}

#[derive(Parser, Debug)]
struct GapsArgs {
    /// Recorded GPX track to inspect
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output format for the gap list
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(flatten)]
    params: ParamArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct RepairArgs {
    /// Recorded GPX track with a hole
    #[arg(value_hint = ValueHint::FilePath)]
    main: PathBuf,

    /// GPX route covering the missing part
    #[arg(value_hint = ValueHint::FilePath)]
    snippet: PathBuf,

    /// Length of the snippet route in meters, e.g. as reported by the routing service
    #[arg(short, long)]
    distance: String,

    /// Directory for the repaired GPX file
    #[arg(short, long, default_value = ".", value_hint = ValueHint::DirPath)]
    output_dir: PathBuf,

    /// Optional JSON file describing the repair
    #[arg(long, value_hint = ValueHint::FilePath)]
    report: Option<PathBuf>,

    #[command(flatten)]
    params: ParamArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Serialize, Debug)]
struct GapListing<'a> {
    name: Option<&'a str>,
    summary: &'a TrackSummary,
    gaps: &'a [GapReport],
    missing_start_link: String,
    missing_end_link: String,
}

#[derive(Serialize, Debug)]
struct RepairReport<'a> {
    input: &'a Path,
    snippet: &'a Path,
    output: &'a Path,
    reference_distance_m: f64,
    insertion: &'a InsertionPoint,
    candidates: &'a [Candidate],
    speed_mps: f64,
    applied_speed_mps: f64,
    inserted_points: usize,
    skipped_points: usize,
    diagnostics: Option<&'a SnippetDiagnostics>,
    summary: &'a TrackSummary,
    remaining_gaps: &'a [GapReport],
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Gaps(args) => args.verbose,
        Command::Repair(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Gaps(args) => handle_gaps(args),
        Command::Repair(args) => handle_repair(args),
    }
}

fn resolve_params(args: &ParamArgs) -> Result<RepairParams> {
    let mut params = match args.config.as_ref() {
        Some(path) => RepairParams::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => RepairParams::default(),
    };
    if let Some(value) = args.time_threshold {
        params.time_threshold_s = value;
    }
    if let Some(value) = args.dist_threshold {
        params.dist_threshold_m = value;
    }
    if let Some(value) = args.min_spacing {
        params.min_spacing_m = value;
    }
    if let Some(value) = args.fallback_speed_kmh {
        params.fallback_speed_mps = value / 3.6;
    }
    params.validate()?;
    debug!("Using parameters {:?}", params);
    Ok(params)
}

fn load_track(path: &Path) -> Result<Track> {
    let track =
        read_track(path).with_context(|| format!("failed to read {}", path.display()))?;
    info!("Loaded {} points from {}", track.len(), path.display());
    Ok(track)
}

fn handle_gaps(args: GapsArgs) -> Result<()> {
    let params = resolve_params(&args.params)?;
    let track = load_track(&args.input)?;
    let extraction = extract(&track, &params)
        .with_context(|| format!("failed to analyse {}", args.input.display()))?;
    let rows = gap_reports(&track.points, &extraction.gaps);
    let (first, last) = match (track.first(), track.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(anyhow!("{} has no points", args.input.display())),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match args.format {
        OutputFormat::Json => {
            let listing = GapListing {
                name: track.name.as_deref(),
                summary: &extraction.summary,
                gaps: &rows,
                missing_start_link: missing_start_link(first),
                missing_end_link: missing_end_link(last),
            };
            serde_json::to_writer_pretty(&mut out, &listing)?;
            writeln!(out)?;
        }
        OutputFormat::Csv => write_gap_csv(&rows, &mut out)?,
        OutputFormat::Table => {
            print_summary(&mut out, track.name.as_deref(), &extraction.summary)?;
            if rows.is_empty() {
                writeln!(out, "No gaps found.")?;
            } else {
                print_gap_table(&mut out, &rows)?;
            }
            writeln!(out)?;
            writeln!(out, "Missing the start: {}", missing_start_link(first))?;
            writeln!(out, "Missing the end:   {}", missing_end_link(last))?;
            writeln!(out, "Convert a drawn route to GPX: {MAPS_TO_GPX_URL}")?;
        }
    }
    Ok(())
}

fn handle_repair(args: RepairArgs) -> Result<()> {
    let params = resolve_params(&args.params)?;
    let reference_distance_m = parse_reference_distance(&args.distance)
        .with_context(|| format!("invalid --distance '{}'", args.distance))?;
    let main = load_track(&args.main)?;
    let snippet = load_track(&args.snippet)?;

    let repaired = repair(
        RepairRequest {
            main: &main,
            snippet: &snippet,
            reference_distance_m: Some(reference_distance_m),
        },
        &params,
    )
    .with_context(|| {
        format!(
            "failed to splice {} into {}",
            args.snippet.display(),
            args.main.display()
        )
    })?;

    if (repaired.applied_speed_mps - repaired.speed_mps).abs() > 1e-9 {
        warn!(
            "Snippet timed at {:.2} km/h instead of {:.2} km/h to stay inside the gap",
            repaired.applied_speed_mps * 3.6,
            repaired.speed_mps * 3.6
        );
    }

    let output = write_track_file(&args.output_dir, &repaired.track)
        .with_context(|| format!("failed to write into {}", args.output_dir.display()))?;
    info!("Wrote repaired track: {}", output.display());

    let remaining = gap_reports(&repaired.track.points, &repaired.extraction.gaps);
    if let Some(path) = args.report.as_ref() {
        let report = RepairReport {
            input: &args.main,
            snippet: &args.snippet,
            output: &output,
            reference_distance_m,
            insertion: &repaired.insertion,
            candidates: &repaired.candidates,
            speed_mps: repaired.speed_mps,
            applied_speed_mps: repaired.applied_speed_mps,
            inserted_points: repaired.inserted_points,
            skipped_points: repaired.skipped_points,
            diagnostics: repaired.diagnostics.as_ref(),
            summary: &repaired.extraction.summary,
            remaining_gaps: &remaining,
        };
        let text = serde_json::to_string_pretty(&report)?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote report: {}", path.display());
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{}", output.display())?;
    if remaining.is_empty() {
        writeln!(out, "No gaps left.")?;
    } else {
        writeln!(out, "{} gaps left:", remaining.len())?;
        print_gap_table(&mut out, &remaining)?;
    }
    Ok(())
}

fn print_summary<W: Write>(out: &mut W, name: Option<&str>, summary: &TrackSummary) -> Result<()> {
    writeln!(out, "Track: {}", name.unwrap_or("(unnamed)"))?;
    writeln!(out, "Points: {}", summary.point_count)?;
    if let Some(duration) = summary.duration_s() {
        writeln!(out, "Duration: {}", format_duration(duration))?;
    }
    writeln!(
        out,
        "Bounds: lat {:.4}..{:.4}, lon {:.4}..{:.4}",
        summary.min_lat, summary.max_lat, summary.min_lon, summary.max_lon
    )?;
    if let (Some(low), Some(high)) = (summary.min_elevation, summary.max_elevation) {
        writeln!(out, "Elevation: {low:.1}..{high:.1} m")?;
    }
    writeln!(out)?;
    Ok(())
}

fn print_gap_table<W: Write>(out: &mut W, rows: &[GapReport]) -> Result<()> {
    writeln!(
        out,
        "{:>3}  {:>21}  {:>21}  {:>9}  {:>9}  link",
        "#", "from", "to", "distance", "duration"
    )?;
    for row in rows {
        writeln!(
            out,
            "{:>3}  {:>21}  {:>21}  {:>7.1} m  {:>9}  {}",
            row.number,
            format!("{:.4}, {:.4}", row.from.0, row.from.1),
            format!("{:.4}, {:.4}", row.to.0, row.to.1),
            row.distance_m,
            format_duration(row.duration_s),
            row.link
        )?;
    }
    Ok(())
}

fn write_gap_csv<W: Write>(rows: &[GapReport], out: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record([
        "number",
        "index",
        "from_lat",
        "from_lon",
        "to_lat",
        "to_lon",
        "distance_m",
        "duration_s",
        "link",
    ])?;
    for row in rows {
        writer.write_record([
            row.number.to_string(),
            row.index.to_string(),
            row.from.0.to_string(),
            row.from.1.to_string(),
            row.to.0.to_string(),
            row.to.1.to_string(),
            format!("{:.1}", row.distance_m),
            format!("{:.1}", row.duration_s),
            row.link.clone(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}
