//! Reading and writing the plain text tables the pipeline consumes and produces.
//!
//! Raw traces are comma separated `time,voltage` pairs without a header.
//! Intermediate tables are whitespace separated with one pair per line, and
//! analysis results are written as whitespace separated tables with `#`
//! comment headers.
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};
use log::debug;
use thiserror::Error;

use crate::analysis::AnalysisResult;
use crate::arrayops::Trace;
use crate::shape::FitReport;

#[derive(Debug, Error)]
pub enum DataLoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed comma separated data: {0}")]
    Csv(#[from] csv::Error),
    #[error("Line {line} has {found} columns, expected 2")]
    ColumnCount { line: u64, found: usize },
    #[error("Line {line} holds {value:?} which is not a number")]
    InvalidNumber { line: u64, value: String },
    #[error("No data rows were found")]
    Empty,
}

impl DataLoadError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn parse_field(value: &str, line: u64) -> Result<f64, DataLoadError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| DataLoadError::InvalidNumber {
            line,
            value: value.to_string(),
        })
}

/// Read a comma separated two column trace from `reader`
pub fn read_trace<R: Read>(reader: R) -> Result<Trace<'static>, DataLoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b',')
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut x = Vec::new();
    let mut y = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let line = record
            .position()
            .map(|p| p.line())
            .unwrap_or(i as u64 + 1);
        if record.len() != 2 {
            return Err(DataLoadError::ColumnCount {
                line,
                found: record.len(),
            });
        }
        x.push(parse_field(&record[0], line)?);
        y.push(parse_field(&record[1], line)?);
    }
    if x.is_empty() {
        return Err(DataLoadError::Empty);
    }
    Ok(Trace::from(x.into_iter().zip(y).collect::<Vec<_>>()))
}

/// Load a comma separated two column trace from the file at `path`
pub fn load_trace<P: AsRef<Path>>(path: P) -> Result<Trace<'static>, DataLoadError> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|e| DataLoadError::io(path, e))?;
    let trace = read_trace(io::BufReader::new(file))?;
    debug!("Loaded {} samples from {}", trace.len(), path.display());
    Ok(trace)
}

/// Read a whitespace separated two column table from `reader`, skipping blank
/// lines and `#` comments
pub fn read_table<R: BufRead>(reader: R) -> Result<Trace<'static>, DataLoadError> {
    let mut pairs = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| DataLoadError::io(Path::new("<table>"), e))?;
        let line_number = i as u64 + 1;
        let content = line.trim();
        if content.is_empty() || content.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = content.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(DataLoadError::ColumnCount {
                line: line_number,
                found: fields.len(),
            });
        }
        pairs.push((
            parse_field(fields[0], line_number)?,
            parse_field(fields[1], line_number)?,
        ));
    }
    if pairs.is_empty() {
        return Err(DataLoadError::Empty);
    }
    Ok(Trace::from(pairs))
}

/// Load a whitespace separated two column table from the file at `path`
pub fn load_table<P: AsRef<Path>>(path: P) -> Result<Trace<'static>, DataLoadError> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|e| DataLoadError::io(path, e))?;
    read_table(io::BufReader::new(file)).map_err(|e| match e {
        DataLoadError::Io { source, .. } => DataLoadError::io(path, source),
        e => e,
    })
}

/// Write `trace` as a whitespace separated table
pub fn write_table<W: Write>(trace: &Trace, writer: &mut W) -> io::Result<()> {
    for (x, y) in trace.iter() {
        writeln!(writer, "{x:.18e} {y:.18e}")?;
    }
    Ok(())
}

fn create<P: AsRef<Path>>(path: P) -> io::Result<io::BufWriter<fs::File>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(io::BufWriter::new(fs::File::create(path)?))
}

pub fn to_file<P: AsRef<Path>>(trace: &Trace, path: P) -> io::Result<()> {
    let mut writer = create(path)?;
    write_table(trace, &mut writer)?;
    writer.flush()
}

/// The name of the result file of the candidate at `detected_index` in the
/// detected peak list
pub fn fit_report_file_name(detected_index: usize) -> String {
    format!("spec_analysis_{detected_index}.txt")
}

/// The name of a summary file stamped with `timestamp`
pub fn analysis_file_name<Tz: TimeZone>(timestamp: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}analysis.txt", timestamp.format("%Y_%m_%d_%H_%M-%S"))
}

pub fn write_fit_report_to<W: Write>(report: &FitReport, writer: &mut W) -> io::Result<()> {
    let shape = &report.shape;
    writeln!(
        writer,
        "# shape {} sigma {:.10e} tau {:.10e} fwhm {:.10e}",
        shape.model.kind, shape.model.sigma, shape.model.tau, shape.fwhm
    )?;
    writeln!(
        writer,
        "# calibrant_mass {:.10} recalibration_factor {:.12} reduced_chi_square {:.6e} iterations {} converged {}",
        report.calibrant_mass,
        report.recalibration_factor,
        report.reduced_chi_square,
        report.iterations,
        report.converged
    )?;
    writeln!(
        writer,
        "# mz recalibrated_mz area height fwhm resolving_power calibrant"
    )?;
    for peak in report.peaks.iter() {
        writeln!(
            writer,
            "{:.10} {:.10} {:.10e} {:.10e} {:.10e} {:.3} {}",
            peak.mz,
            peak.recalibrated_mz,
            peak.area,
            peak.height,
            peak.fwhm,
            peak.resolving_power,
            u8::from(peak.is_calibrant)
        )?;
    }
    Ok(())
}

/// Write one fit report as a table with one row per fitted peak
pub fn write_fit_report<P: AsRef<Path>>(report: &FitReport, path: P) -> io::Result<()> {
    let mut writer = create(path)?;
    write_fit_report_to(report, &mut writer)?;
    writer.flush()
}

pub fn write_analysis_to<W: Write>(result: &AnalysisResult, writer: &mut W) -> io::Result<()> {
    writeln!(writer, "{}", result.count)?;
    for mz in result.peaks.iter() {
        writeln!(writer, "{mz:.10}")?;
    }
    Ok(())
}

/// Write the candidate count followed by one reported mass per line
pub fn save_analysis<P: AsRef<Path>>(result: &AnalysisResult, path: P) -> io::Result<()> {
    let mut writer = create(path)?;
    write_analysis_to(result, &mut writer)?;
    writer.flush()
}
