use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use rayon::prelude::*;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wz_series::{
    aggregate_cohorts, group_by_workzone, max_raw_speed, minimum_trend, parse_vehicles,
    resample_intervals, time_extent, CohortAverages, MinimumTrend, OriginMode, Params,
    VehicleRecord, WINDOW_MINUTES_CHOICES,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Work-zone speed series aggregation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute cohort speed averages and the minimum-speed trend for a roster
    Aggregate(AggregateArgs),
    /// Report interval buckets of vehicles at a fixed window width
    Windows(WindowsArgs),
    /// Inspect roster files for cohort sizes and data coverage
    Diagnose(DiagnoseArgs),
}

#[derive(Parser, Debug)]
struct AggregateArgs {
    /// Roster files to ingest (JSON array or JSONL)
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output CSV path for cohort averages (`-` for stdout)
    #[arg(short, long, default_value = "aggregate.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Output CSV path for per-vehicle minimums and the smoothed test trend
    #[arg(long, value_hint = ValueHint::FilePath)]
    minimums: Option<PathBuf>,

    /// Output JSON report path (full aggregate + trend structures)
    #[arg(long, value_hint = ValueHint::FilePath)]
    json: Option<PathBuf>,

    /// Averaging bucket width in seconds
    #[arg(long, default_value_t = 60)]
    bucket_width: u64,

    /// Minimum-speed smoothing bucket width in seconds
    #[arg(long, default_value_t = 7200)]
    min_bucket_width: u64,

    /// Bucket origin selection
    #[arg(long, value_enum, default_value_t = OriginOpt::DatasetMin)]
    origin: OriginOpt,

    /// Restrict to a single workzone id
    #[arg(long)]
    workzone: Option<String>,

    /// Verbose logging
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct WindowsArgs {
    /// Roster files to ingest (JSON array or JSONL)
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "windows.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Window width in minutes
    #[arg(long, default_value_t = 120)]
    window_minutes: i64,

    /// Flag intervals with fewer control vehicles than this as insufficient
    #[arg(long, default_value_t = 1)]
    min_control: usize,

    /// Restrict to a single workzone id
    #[arg(long)]
    workzone: Option<String>,

    /// Verbose logging
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct DiagnoseArgs {
    /// Roster files to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OriginOpt {
    DatasetMin,
    Epoch,
}

impl From<OriginOpt> for OriginMode {
    fn from(opt: OriginOpt) -> Self {
        match opt {
            OriginOpt::DatasetMin => OriginMode::DatasetMin,
            OriginOpt::Epoch => OriginMode::Epoch,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Aggregate(args) => args.verbose,
        Command::Windows(args) => args.verbose,
        Command::Diagnose(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Aggregate(args) => handle_aggregate(args),
        Command::Windows(args) => handle_windows(args),
        Command::Diagnose(args) => handle_diagnose(args),
    }
}

fn handle_aggregate(args: AggregateArgs) -> Result<()> {
    let vehicles = load_rosters(&args.inputs)?;
    let vehicles = filter_workzone(vehicles, args.workzone.as_deref());
    if vehicles.is_empty() {
        warn!("No vehicles matched the inputs; reports will be empty");
    }

    let params = Params {
        bucket_width_ms: args.bucket_width as i64 * 1000,
        min_bucket_width_ms: args.min_bucket_width as i64 * 1000,
        origin_mode: args.origin.into(),
        ..Params::default()
    };

    let averages = aggregate_cohorts(&vehicles, &params)?;
    let trend = minimum_trend(&vehicles, &params)?;

    let control_buckets: usize = averages.control_segments.iter().map(Vec::len).sum();
    let test_buckets: usize = averages.test_segments.iter().map(Vec::len).sum();
    info!(
        "Aggregated {} vehicles: {} control buckets in {} segments, {} test buckets in {} segments",
        vehicles.len(),
        control_buckets,
        averages.control_segments.len(),
        test_buckets,
        averages.test_segments.len()
    );
    info!(
        "Minimum trend: {} test segments, {} control minimum points",
        trend.test_min_segments.len(),
        trend.control_minimums.len()
    );

    if args.output.as_os_str() == "-" {
        write_average_rows(&averages, &mut csv::Writer::from_writer(io::stdout()))?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        write_average_rows(&averages, &mut csv::Writer::from_writer(file))?;
        info!("Wrote cohort averages CSV: {}", args.output.display());
    }

    if let Some(path) = args.minimums.as_ref() {
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        write_minimum_rows(&trend, &mut csv::Writer::from_writer(file))?;
        info!("Wrote minimums CSV: {}", path.display());
    }

    if let Some(path) = args.json.as_ref() {
        write_json_report(&vehicles, &averages, &trend, path)?;
        info!("Wrote JSON report: {}", path.display());
    }

    Ok(())
}

fn handle_windows(args: WindowsArgs) -> Result<()> {
    if !WINDOW_MINUTES_CHOICES.contains(&args.window_minutes) {
        warn!(
            "Window width {} min is off the reference menu {:?}",
            args.window_minutes, WINDOW_MINUTES_CHOICES
        );
    }

    let vehicles = load_rosters(&args.inputs)?;
    let vehicles = filter_workzone(vehicles, args.workzone.as_deref());

    let intervals = resample_intervals(&vehicles, args.window_minutes)?;
    let insufficient = intervals
        .iter()
        .filter(|b| !b.has_min_control(args.min_control))
        .count();
    info!(
        "Grouped {} vehicles into {} intervals of {} min ({} below the control threshold of {})",
        vehicles.len(),
        intervals.len(),
        args.window_minutes,
        insufficient,
        args.min_control
    );

    let sink: Box<dyn Write> = if args.output.as_os_str() == "-" {
        Box::new(io::stdout())
    } else {
        Box::new(
            File::create(&args.output)
                .with_context(|| format!("failed to create {}", args.output.display()))?,
        )
    };
    let mut writer = csv::Writer::from_writer(sink);
    writer.write_record([
        "start_time",
        "end_time",
        "control_count",
        "test_count",
        "sufficient",
    ])?;
    for bucket in &intervals {
        writer.write_record([
            format_time(bucket.start_time),
            format_time(bucket.end_time),
            bucket.control_vehicles.len().to_string(),
            bucket.test_vehicles.len().to_string(),
            bucket.has_min_control(args.min_control).to_string(),
        ])?;
    }
    writer.flush()?;
    if args.output.as_os_str() != "-" {
        info!("Wrote windows CSV: {}", args.output.display());
    }

    Ok(())
}

fn handle_diagnose(args: DiagnoseArgs) -> Result<()> {
    let vehicles = load_rosters(&args.inputs)?;
    info!("Loaded {} vehicle records", vehicles.len());

    for (workzone_id, roster) in group_by_workzone(&vehicles) {
        let control = roster.iter().filter(|v| v.is_control_group).count();
        let degenerate = roster.iter().filter(|v| v.is_degenerate()).count();
        let samples: usize = roster.iter().map(|v| v.points.len()).sum();
        match time_extent(&roster) {
            Some((start, end)) => info!(
                "Workzone {}: {} vehicles ({} control / {} test), {} samples from {} to {}, max raw speed {:.1} mph, {} degenerate",
                workzone_id,
                roster.len(),
                control,
                roster.len() - control,
                samples,
                format_time(start),
                format_time(end),
                max_raw_speed(&roster),
                degenerate
            ),
            None => info!(
                "Workzone {}: {} vehicles ({} control / {} test), no samples",
                workzone_id,
                roster.len(),
                control,
                roster.len() - control
            ),
        }
    }

    Ok(())
}

/// Read roster files in parallel, preserving the input order of records.
fn load_rosters(inputs: &[PathBuf]) -> Result<Vec<VehicleRecord>> {
    let indexed: Vec<(usize, PathBuf)> = inputs.iter().cloned().enumerate().collect();
    let mut parsed: Vec<(usize, Vec<VehicleRecord>)> = indexed
        .par_iter()
        .map(|(file_id, path)| -> Result<(usize, Vec<VehicleRecord>)> {
            let data =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            let hint = format_hint(path);
            let vehicles = parse_vehicles(&data, hint)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((*file_id, vehicles))
        })
        .collect::<Result<Vec<_>>>()?;

    parsed.sort_by_key(|(id, _)| *id);
    Ok(parsed.into_iter().flat_map(|(_, v)| v).collect())
}

fn format_hint(path: &Path) -> &str {
    path.extension().and_then(|ext| ext.to_str()).unwrap_or("json")
}

fn filter_workzone(vehicles: Vec<VehicleRecord>, workzone: Option<&str>) -> Vec<VehicleRecord> {
    match workzone {
        Some(id) => vehicles
            .into_iter()
            .filter(|v| v.workzone_id.as_deref() == Some(id))
            .collect(),
        None => vehicles,
    }
}

fn write_average_rows<W: Write>(
    averages: &CohortAverages,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record(["cohort", "segment", "bucket_time", "avg_speed_mph", "count"])?;
    for (cohort, segments) in [
        ("control", &averages.control_segments),
        ("test", &averages.test_segments),
    ] {
        for (segment_id, segment) in segments.iter().enumerate() {
            for bin in segment {
                writer.write_record([
                    cohort.to_string(),
                    segment_id.to_string(),
                    format_time(bin.time),
                    format!("{:.3}", bin.avg_speed),
                    bin.count.to_string(),
                ])?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_minimum_rows<W: Write>(trend: &MinimumTrend, writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record(["kind", "segment", "vehicle_id", "time", "speed_mph", "count"])?;
    for (segment_id, segment) in trend.test_min_segments.iter().enumerate() {
        for bin in segment {
            writer.write_record([
                "test_trend".to_string(),
                segment_id.to_string(),
                String::new(),
                format_time(bin.time),
                format!("{:.3}", bin.avg_speed),
                bin.count.to_string(),
            ])?;
        }
    }
    for minimum in &trend.control_minimums {
        writer.write_record([
            "control_min".to_string(),
            String::new(),
            minimum.vehicle_id.to_string(),
            format_time(minimum.min_time),
            format!("{:.3}", minimum.min_speed),
            "1".to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_json_report(
    vehicles: &[VehicleRecord],
    averages: &CohortAverages,
    trend: &MinimumTrend,
    path: &Path,
) -> Result<()> {
    let control = vehicles.iter().filter(|v| v.is_control_group).count();
    let extent = time_extent(vehicles);
    let report = json!({
        "vehicles": vehicles.len(),
        "control_vehicles": control,
        "test_vehicles": vehicles.len() - control,
        "time_extent": extent.map(|(start, end)| json!({
            "start": format_time(start),
            "end": format_time(end),
        })),
        "max_raw_speed": max_raw_speed(vehicles),
        "averages": serde_json::to_value(averages)?,
        "minimum_trend": serde_json::to_value(trend)?,
    });
    let text = serde_json::to_string_pretty(&report)?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn format_time(t: chrono::DateTime<chrono::Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}
