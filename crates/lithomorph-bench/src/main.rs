//! lithomorph-bench: CLI tool for running analyses and collecting diagnostics.
//!
//! Decodes an image file, runs a fracture, pore, or grain analysis with
//! configurable parameters, and prints per-stage diagnostics. Useful for:
//!
//! - Tuning thresholding, morphology, and separation parameters
//! - Inspecting intermediate rasters with a stop stage and `--snapshots`
//! - Measuring per-stage durations to identify bottlenecks
//! - Exporting measurements as CSV and contours as SVG
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin lithomorph-bench -- [OPTIONS] <IMAGE_PATH>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use lithomorph_export::{CsvMetadata, SvgMetadata};
use lithomorph_pipeline::diagnostics::{Clock, PipelineDiagnostics};
use lithomorph_pipeline::{
    AnalysisContext, AnalysisKind, AnalysisParameters, Resolution, ResultRecord, SourceImage,
    StageId, resolution,
};

/// Rock-core image analysis and diagnostics for lithomorph.
///
/// Runs a fracture, pore, or grain analysis on an image and prints
/// per-stage timing, pixel counts, and feature counts.
#[derive(Parser)]
#[command(name = "lithomorph-bench", version)]
struct Cli {
    /// Path to the input image (PNG, JPEG, BMP, WebP).
    #[arg(required_unless_present = "list_params")]
    image_path: Option<PathBuf>,

    /// Analysis to run (fracture, pore, grain).
    #[arg(long, default_value_t = AnalysisKind::Fracture)]
    kind: AnalysisKind,

    /// Override one parameter, as `key=value`. Repeatable.
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Parameters as a JSON object of `key: value` pairs.
    ///
    /// Applied on top of the kind's defaults; `--param` overrides are
    /// applied after it.
    #[arg(long)]
    params_json: Option<String>,

    /// Stop after this stage (gray, blurred, binary, morph, separation,
    /// detection, measurement).
    #[arg(long)]
    stop_at: Option<StageId>,

    /// Resolution to assume, replacing any DPI in the file.
    #[arg(long)]
    dpi: Option<f64>,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,

    /// Write the measurement table as CSV.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Write the surviving contours as SVG.
    #[arg(long)]
    svg: Option<PathBuf>,

    /// Write every intermediate raster and the visualization as PNG
    /// files into this directory.
    #[arg(long, value_name = "DIR")]
    snapshots: Option<PathBuf>,

    /// Print the parameter schema of `--kind` and exit.
    #[arg(long)]
    list_params: bool,
}

/// Build the parameter set from CLI arguments.
///
/// Starts from the kind's defaults, then applies `--params-json`, then
/// each `--param`.
fn params_from_cli(cli: &Cli) -> Result<AnalysisParameters, String> {
    let schema = cli.kind.schema();
    let mut params = cli.kind.default_parameters();

    if let Some(ref json) = cli.params_json {
        let overrides: AnalysisParameters =
            serde_json::from_str(json).map_err(|e| format!("Error parsing --params-json: {e}"))?;
        for (key, value) in overrides.iter() {
            params.insert(key, value.clone());
        }
    }

    for pair in &cli.params {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("Error parsing --param `{pair}`: expected KEY=VALUE"))?;
        params
            .set_from_str(schema, key.trim(), raw.trim())
            .map_err(|e| format!("Error in --param `{pair}`: {e}"))?;
    }

    params.validate(schema).map_err(|e| e.to_string())?;
    Ok(params)
}

fn print_schema(kind: AnalysisKind) {
    println!("{} parameters\n{}", kind.name(), "=".repeat(60));
    for spec in kind.schema() {
        let default = spec.default.to_value().to_string();
        let realtime = if spec.realtime { "realtime" } else { "" };
        println!(
            "{:<36} {default:>10} {realtime:>9}  {}",
            spec.key, spec.description,
        );
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    if cli.list_params {
        print_schema(cli.kind);
        return ExitCode::SUCCESS;
    }
    let Some(ref image_path) = cli.image_path else {
        eprintln!("No image given");
        return ExitCode::FAILURE;
    };

    let params = match params_from_cli(&cli) {
        Ok(p) => p,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };
    let context = AnalysisContext::with_params(cli.kind, params);

    let image_bytes = match std::fs::read(image_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error reading {}: {e}", image_path.display());
            return ExitCode::FAILURE;
        }
    };
    let gray = match image::load_from_memory(&image_bytes) {
        Ok(decoded) => decoded.to_luma8(),
        Err(e) => {
            eprintln!("Error decoding {}: {e}", image_path.display());
            return ExitCode::FAILURE;
        }
    };
    let density = cli
        .dpi
        .map_or_else(|| resolution::read_dpi(&image_bytes), Resolution::uniform);
    let source = SourceImage::new(gray).with_resolution(density);

    eprintln!(
        "Image: {} ({} bytes, {}x{})",
        image_path.display(),
        image_bytes.len(),
        source.dimensions().width,
        source.dimensions().height,
    );
    eprintln!("Analysis: {}", cli.kind);
    eprintln!("Resolution: {density:?}");
    if let Some(stage) = cli.stop_at {
        eprintln!("Stop at: {stage}");
    }
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        match lithomorph_pipeline::analyze_with_diagnostics(
            &source,
            &context,
            cli.stop_at,
            &StdClock,
        ) {
            Ok((record, diagnostics)) => {
                if cli.json {
                    match serde_json::to_string_pretty(&diagnostics) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            eprintln!("Error serializing diagnostics: {e}");
                            return ExitCode::FAILURE;
                        }
                    }
                } else {
                    println!("{}", diagnostics.report());
                    if let Some(message) = record.message() {
                        println!("{message}");
                    }
                }

                // Write outputs on the first run only.
                if run == 0 {
                    write_outputs(&cli, image_path, &context, &record);
                }

                all_diagnostics.push(diagnostics);
            }
            Err(e) => {
                eprintln!("Analysis error: {e}");
                return ExitCode::FAILURE;
            }
        }

        if cli.runs > 1 {
            eprintln!();
        }
    }

    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    ExitCode::SUCCESS
}

/// Write the CSV, SVG, and snapshot files requested on the command line.
///
/// Failures are reported and skipped; the diagnostics already printed
/// remain valid.
fn write_outputs(cli: &Cli, image_path: &Path, context: &AnalysisContext, record: &ResultRecord) {
    let title = image_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("lithomorph");
    let params_json = serde_json::to_string(&context.params).ok();

    if let Some(ref csv_path) = cli.csv {
        let metadata = CsvMetadata {
            title: Some(title),
            params_json: params_json.as_deref(),
        };
        match lithomorph_export::record_to_csv(record, &metadata) {
            Ok(csv) => report_write(csv_path, "CSV", csv.len(), std::fs::write(csv_path, &csv)),
            Err(e) => eprintln!("Skipping CSV: {e}"),
        }
    }

    if let Some(ref svg_path) = cli.svg {
        let desc = format!("{} of {title}", context.kind.name());
        let metadata = SvgMetadata {
            title: Some(title),
            description: Some(&desc),
            params_json: params_json.as_deref(),
        };
        let svg = lithomorph_export::to_svg(
            record.features(),
            record.kind(),
            record.dimensions(),
            &metadata,
        );
        report_write(svg_path, "SVG", svg.len(), std::fs::write(svg_path, &svg));
    }

    if let Some(ref dir) = cli.snapshots {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Error creating {}: {e}", dir.display());
            return;
        }
        for (key, raster) in record.snapshots() {
            let path = dir.join(format!("{key}.png"));
            match raster.save(&path) {
                Ok(()) => eprintln!("Snapshot written to {}", path.display()),
                Err(e) => eprintln!("Error writing {}: {e}", path.display()),
            }
        }
        let path = dir.join("visualization.png");
        match record.visualization().save(&path) {
            Ok(()) => eprintln!("Visualization written to {}", path.display()),
            Err(e) => eprintln!("Error writing {}: {e}", path.display()),
        }
    }
}

fn report_write(path: &Path, what: &str, len: usize, result: std::io::Result<()>) {
    match result {
        Ok(()) => eprintln!("{what} written to {} ({len} bytes)", path.display()),
        Err(e) => eprintln!("Error writing {what} to {}: {e}", path.display()),
    }
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[PipelineDiagnostics]) {
    debug_assert!(!all_diagnostics.is_empty(), "no diagnostics to summarize");

    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    // Per-stage means.
    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    for id in StageId::ALL {
        let stage_durations: Vec<f64> = all_diagnostics
            .iter()
            .filter_map(|d| d.stage(id))
            .map(|s| s.duration.as_secs_f64() * 1000.0)
            .collect();

        if stage_durations.is_empty() {
            continue;
        }

        let stage_mean = stage_durations.iter().sum::<f64>() / stage_durations.len() as f64;
        println!("{:<24} {stage_mean:>10.3}ms", id.name());
    }
}
