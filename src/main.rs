//! # tofsignal
//!
//! Command line front end for the time-of-flight processing pipeline.
//!
//! ```bash
//! # Preprocess, calibrate and analyze a raw trace
//! tofsignal --config run.toml run trace.csv --peak 100 --window 1
//!
//! # Run a single stage on a saved table
//! tofsignal preprocess trace.csv pre_processed.txt
//! tofsignal calibrate pre_processed.txt calibrated_data.txt --masses 28,44 --times 2.61e-5,3.27e-5
//! tofsignal analyze calibrated_data.txt --peak 100 --window 1
//! ```
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use tofsignal::analysis::{AnalysisRequest, AnalysisResult};
use tofsignal::config::PipelineConfig;
use tofsignal::pipeline::Pipeline;
use tofsignal::text;

/// Baseline correction, mass calibration and peak fitting for ToF spectra
#[derive(Parser)]
#[command(name = "tofsignal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v for info, -vv for debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Append log records to this file instead of writing them to stderr
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct CalibrantArgs {
    /// Calibrant masses in amu/q, comma separated
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    masses: Vec<f64>,

    /// Calibrant flight times in seconds, comma separated
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    times: Vec<f64>,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// The mass to look for
    #[arg(long)]
    peak: f64,

    /// Width of the mass window around the target
    #[arg(long, default_value = "1.0")]
    window: f64,

    /// Minimum scaled curvature of a detected peak
    #[arg(long)]
    threshold: Option<f64>,

    /// Directory result files are written to
    #[arg(long, value_name = "DIR")]
    results_dir: Option<PathBuf>,
}

impl TargetArgs {
    fn request(&self) -> AnalysisRequest {
        let request = AnalysisRequest::new(self.peak, self.window);
        match self.threshold {
            Some(threshold) => request.threshold(threshold),
            None => request,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage on a raw `time,volts` trace
    Run {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        #[command(flatten)]
        calibrants: CalibrantArgs,

        #[command(flatten)]
        target: TargetArgs,

        /// Keep the preprocessed and calibrated traces
        #[arg(long)]
        keep_intermediates: bool,

        /// Directory intermediate traces are written to
        #[arg(long, value_name = "DIR")]
        work_dir: Option<PathBuf>,
    },

    /// Convert, baseline correct, filter and window a raw trace
    Preprocess {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        #[arg(value_name = "OUTPUT", default_value = "pre_processed.txt")]
        output: PathBuf,
    },

    /// Convert a preprocessed trace from flight time to mass
    Calibrate {
        #[arg(value_name = "INPUT", default_value = "pre_processed.txt")]
        input: PathBuf,

        #[arg(value_name = "OUTPUT", default_value = "calibrated_data.txt")]
        output: PathBuf,

        #[command(flatten)]
        calibrants: CalibrantArgs,
    },

    /// Detect and fit peaks around a target mass in a calibrated trace
    Analyze {
        #[arg(value_name = "INPUT", default_value = "calibrated_data.txt")]
        input: PathBuf,

        #[command(flatten)]
        target: TargetArgs,
    },
}

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<()> {
    let log_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level));
    builder.format_timestamp_millis();
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder
            .target(env_logger::Target::Pipe(Box::new(file)))
            .write_style(env_logger::WriteStyle::Never);
    }
    builder.try_init().context("Failed to initialize logging")?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => {
            info!("Reading configuration from {}", path.display());
            Ok(PipelineConfig::from_file(path)?)
        }
        None => Ok(PipelineConfig::default()),
    }
}

fn apply_calibrants(config: &mut PipelineConfig, calibrants: CalibrantArgs) {
    if !calibrants.masses.is_empty() {
        config.calibration.masses = calibrants.masses;
    }
    if !calibrants.times.is_empty() {
        config.calibration.times = calibrants.times;
    }
}

fn apply_target(config: &mut PipelineConfig, target: &TargetArgs) {
    if let Some(dir) = target.results_dir.as_ref() {
        config.output.results_dir = dir.clone();
    }
}

fn print_analysis(analysis: &AnalysisResult) {
    println!("{} candidate peak(s)", analysis.count);
    for report in analysis.reports.iter() {
        if let Some(calibrant) = report.calibrant() {
            println!(
                "  {:.6} amu/q  area {:.6e}  FWHM {:.6}  R {:.1}",
                calibrant.recalibrated_mz, calibrant.area, calibrant.fwhm, calibrant.resolving_power
            );
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            input,
            calibrants,
            target,
            keep_intermediates,
            work_dir,
        } => {
            apply_calibrants(&mut config, calibrants);
            apply_target(&mut config, &target);
            if keep_intermediates {
                config.output.keep_intermediates = true;
            }
            if work_dir.is_some() {
                config.output.work_dir = work_dir;
            }
            let pipeline = Pipeline::new(config);
            let output = pipeline.run(&input, &target.request())?;
            print_analysis(&output.analysis);
            println!("Summary written to {}", output.summary_path.display());
        }
        Commands::Preprocess { input, output } => {
            let pipeline = Pipeline::new(config);
            let trace = pipeline.load(&input)?;
            let processed = pipeline.preprocess(&trace)?;
            text::to_file(&processed, &output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("Wrote {} samples to {}", processed.len(), output.display());
        }
        Commands::Calibrate {
            input,
            output,
            calibrants,
        } => {
            apply_calibrants(&mut config, calibrants);
            let pipeline = Pipeline::new(config);
            let trace = pipeline.load_table(&input)?;
            let (calibration, calibrated) = pipeline.calibrate(&trace)?;
            text::to_file(&calibrated, &output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("a = {:e}, b = {:e}", calibration.a, calibration.b);
        }
        Commands::Analyze { input, target } => {
            apply_target(&mut config, &target);
            let pipeline = Pipeline::new(config);
            let trace = pipeline.load_table(&input)?;
            let analysis = pipeline.analyze(&trace, &target.request())?;
            let (summary_path, _) = pipeline.save(&analysis)?;
            print_analysis(&analysis);
            println!("Summary written to {}", summary_path.display());
        }
    }
    Ok(())
}
