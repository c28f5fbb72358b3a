//! The sequential Loader → Preprocessor → Calibrator → Analyzer → Saver run.
//!
//! Each stage hands its output to the next in memory. Intermediate traces are
//! only written out when [`OutputConfig::keep_intermediates`] is set, to the
//! configured work directory or a fresh temporary directory that outlives the
//! run.
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::info;
use mzpeaks::prelude::*;
use thiserror::Error;

use crate::analysis::{AnalysisRequest, AnalysisResult, Analyzer, PeakFitEngine, ShapeFitEngine};
use crate::arrayops::Trace;
use crate::calibration::{Calibrator, MassCalibration};
use crate::config::{OutputConfig, PipelineConfig};
use crate::preprocess::Preprocessor;
use crate::text;

pub const PREPROCESSED_FILE: &str = "pre_processed.txt";
pub const CALIBRATED_FILE: &str = "calibrated_data.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Preprocess,
    Calibrate,
    Analyze,
    Save,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Load => "load",
            Self::Preprocess => "preprocess",
            Self::Calibrate => "calibrate",
            Self::Analyze => "analyze",
            Self::Save => "save",
        };
        f.write_str(name)
    }
}

/// A failure of one pipeline stage, which aborts the run
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: Box<dyn StdError + Send + Sync + 'static>,
}

impl PipelineError {
    pub fn new<E: StdError + Send + Sync + 'static>(stage: Stage, source: E) -> Self {
        Self {
            stage,
            source: Box::new(source),
        }
    }

    /// The underlying error, if it is an `E`
    pub fn cause<E: StdError + 'static>(&self) -> Option<&E> {
        self.source.downcast_ref::<E>()
    }
}

trait StageContext<T> {
    fn stage(self, stage: Stage) -> Result<T, PipelineError>;
}

impl<T, E: StdError + Send + Sync + 'static> StageContext<T> for Result<T, E> {
    fn stage(self, stage: Stage) -> Result<T, PipelineError> {
        self.map_err(|e| PipelineError::new(stage, e))
    }
}

/// Everything one run produced
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub preprocessed: Trace<'static>,
    pub calibration: MassCalibration,
    pub calibrated: Trace<'static>,
    pub analysis: AnalysisResult,
    pub summary_path: PathBuf,
    pub report_paths: Vec<PathBuf>,
    /// Where intermediate traces were written, if anywhere
    pub work_dir: Option<PathBuf>,
}

/// Resolve the directory intermediate tables go to for one run
fn prepare_work_dir(output: &OutputConfig) -> std::io::Result<Option<PathBuf>> {
    if !output.keep_intermediates {
        return Ok(None);
    }
    let dir = match &output.work_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            dir.clone()
        }
        None => {
            let dir = tempfile::Builder::new()
                .prefix("tofsignal-")
                .disable_cleanup(true)
                .tempdir()?;
            dir.path().to_path_buf()
        }
    };
    info!("Writing intermediate tables to {}", dir.display());
    Ok(Some(dir))
}

pub struct Pipeline<E: PeakFitEngine = ShapeFitEngine> {
    pub config: PipelineConfig,
    pub analyzer: Analyzer<E>,
}

impl Pipeline<ShapeFitEngine> {
    pub fn new(config: PipelineConfig) -> Self {
        let analyzer = Analyzer::new(config.analysis.clone());
        Self { config, analyzer }
    }
}

impl<E: PeakFitEngine> Pipeline<E> {
    pub fn with_engine(config: PipelineConfig, engine: E) -> Self {
        let analyzer = Analyzer::with_engine(config.analysis.clone(), engine);
        Self { config, analyzer }
    }

    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Trace<'static>, PipelineError> {
        text::load_trace(path).stage(Stage::Load)
    }

    /// Read a saved whitespace separated intermediate table
    pub fn load_table<P: AsRef<Path>>(&self, path: P) -> Result<Trace<'static>, PipelineError> {
        text::load_table(path).stage(Stage::Load)
    }

    pub fn preprocess(&self, trace: &Trace) -> Result<Trace<'static>, PipelineError> {
        Preprocessor::new(self.config.preprocess.clone())
            .process(trace)
            .stage(Stage::Preprocess)
    }

    pub fn calibrate(
        &self,
        preprocessed: &Trace,
    ) -> Result<(MassCalibration, Trace<'static>), PipelineError> {
        Calibrator::new(self.config.calibration.clone())
            .calibrate(preprocessed)
            .stage(Stage::Calibrate)
    }

    pub fn analyze(
        &self,
        calibrated: &Trace,
        request: &AnalysisRequest,
    ) -> Result<AnalysisResult, PipelineError> {
        self.analyzer
            .analyze(calibrated, request)
            .stage(Stage::Analyze)
    }

    /// Write one result file per fit report and the analysis summary into
    /// the results directory, returning the summary path and the report paths.
    ///
    /// Each result file is named by its candidate's index among the detected
    /// peaks, which is its row in the summary under [`ReportedPeaks::AllDetected`].
    ///
    /// [`ReportedPeaks::AllDetected`]: crate::analysis::ReportedPeaks::AllDetected
    pub fn save(
        &self,
        analysis: &AnalysisResult,
    ) -> Result<(PathBuf, Vec<PathBuf>), PipelineError> {
        let results_dir = &self.config.output.results_dir;
        let mut report_paths = Vec::with_capacity(analysis.reports.len());
        for (candidate, report) in analysis.candidates.iter().zip(analysis.reports.iter()) {
            let detected_index = candidate.get_index() as usize;
            let path = results_dir.join(text::fit_report_file_name(detected_index));
            text::write_fit_report(report, &path).stage(Stage::Save)?;
            report_paths.push(path);
        }
        let summary_path = results_dir.join(text::analysis_file_name(&Local::now()));
        text::save_analysis(analysis, &summary_path).stage(Stage::Save)?;
        info!("Saved analysis summary to {}", summary_path.display());
        Ok((summary_path, report_paths))
    }

    /// Run every stage on the raw trace file at `input`
    pub fn run<P: AsRef<Path>>(
        &self,
        input: P,
        request: &AnalysisRequest,
    ) -> Result<PipelineOutput, PipelineError> {
        let trace = self.load(input)?;
        self.run_trace(&trace, request)
    }

    /// Run every stage after loading on an in-memory raw `trace`
    pub fn run_trace(
        &self,
        trace: &Trace,
        request: &AnalysisRequest,
    ) -> Result<PipelineOutput, PipelineError> {
        let work_dir = prepare_work_dir(&self.config.output).stage(Stage::Save)?;

        let preprocessed = self.preprocess(trace)?;
        if let Some(dir) = work_dir.as_ref() {
            text::to_file(&preprocessed, dir.join(PREPROCESSED_FILE)).stage(Stage::Save)?;
        }

        let (calibration, calibrated) = self.calibrate(&preprocessed)?;
        if let Some(dir) = work_dir.as_ref() {
            text::to_file(&calibrated, dir.join(CALIBRATED_FILE)).stage(Stage::Save)?;
        }

        let analysis = self.analyze(&calibrated, request)?;
        let (summary_path, report_paths) = self.save(&analysis)?;

        Ok(PipelineOutput {
            preprocessed,
            calibration,
            calibrated,
            analysis,
            summary_path,
            report_paths,
            work_dir,
        })
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;
    use crate::analysis::AnalysisConfig;
    use crate::calibration::{CalibrationConfig, CalibrationError};
    use crate::preprocess::PreprocessConfig;
    use crate::analysis::ReportedPeaks;
    use crate::prelude::*;
    use crate::test_data::{raw_csv, synthetic_spectrum, true_mass, FixedEngine};
    use crate::text::DataLoadError;

    fn config(root: &Path) -> PipelineConfig {
        let times = vec![26e-6, 34e-6];
        let masses = times.iter().map(|t| true_mass(*t)).collect();
        PipelineConfig {
            preprocess: PreprocessConfig::default().window_length(16000),
            calibration: CalibrationConfig::new(masses, times).window_length(15000),
            analysis: AnalysisConfig::default(),
            output: OutputConfig {
                results_dir: root.join("results"),
                keep_intermediates: true,
                work_dir: Some(root.join("work")),
            },
        }
    }

    #[test_log::test]
    fn test_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("trace.csv");
        fs::write(&input, raw_csv()).unwrap();

        let pipeline = Pipeline::new(config(dir.path()));
        let output = pipeline
            .run(&input, &AnalysisRequest::new(100.0, 1.0))
            .unwrap();

        assert_eq!(output.preprocessed.len(), 16000);
        assert_eq!(output.calibrated.len(), 15000);
        assert!(output.calibrated.x.windows(2).all(|w| w[0] < w[1]));

        let (away_sum, away_count) = output
            .preprocessed
            .iter()
            .filter(|(t, _)| *t < 29.0 || *t > 31.0)
            .fold((0.0, 0usize), |(sum, n), (_, v)| (sum + v, n + 1));
        let away_mean = away_sum / away_count as f64;
        assert!(away_count > 10000);
        assert!(away_mean.abs() < 0.1, "{away_mean}");

        let analysis = &output.analysis;
        assert_eq!(analysis.count, 1, "{analysis:?}");
        let candidate = analysis.candidates[0];
        assert!((candidate.mz - 100.0).abs() < 1e-3, "{analysis:?}");
        let report = &analysis.reports[0];
        let calibrant = report.calibrant().unwrap();
        assert!((calibrant.mz - 100.0).abs() < 1e-3, "{report:?}");
        assert!((calibrant.recalibrated_mz - 100.0).abs() < 1e-9);

        assert_eq!(output.report_paths.len(), 1);
        let expected = text::fit_report_file_name(candidate.get_index() as usize);
        assert!(output.report_paths[0].ends_with(expected));
        assert!(output.report_paths[0].exists());
        let summary = fs::read_to_string(&output.summary_path).unwrap();
        assert_eq!(summary.lines().next(), Some("1"));

        let work_dir = output.work_dir.as_ref().unwrap();
        let reloaded = text::load_table(work_dir.join(PREPROCESSED_FILE)).unwrap();
        assert_eq!(reloaded, output.preprocessed);
        assert!(work_dir.join(CALIBRATED_FILE).exists());
    }

    #[test]
    fn test_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(config(dir.path()));
        let err = pipeline
            .run(dir.path().join("missing.csv"), &AnalysisRequest::new(100.0, 1.0))
            .unwrap_err();
        assert_eq!(err.stage, Stage::Load);
        assert!(err.to_string().starts_with("load stage failed: "));
        assert!(matches!(err.cause::<DataLoadError>(), Some(DataLoadError::Io { .. })));
    }

    #[test]
    fn test_result_files_follow_detection_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.analysis = AnalysisConfig::default().precision(0.1);
        let pipeline = Pipeline::with_engine(config, FixedEngine::new(&[99.6, 100.0]));
        let (x, y) = synthetic_spectrum(&[(100.0, 40.0)], 0.01, 99.0, 101.0, 0.002);
        let spectrum = Trace::from_vecs(x, y).unwrap();

        let analysis = pipeline
            .analyze(&spectrum, &AnalysisRequest::new(100.0, 1.0))
            .unwrap();
        assert_eq!(analysis.count, 1);
        assert_eq!(pipeline.config.analysis.reported_peaks, ReportedPeaks::AllDetected);
        assert_eq!(analysis.candidates[0].get_index(), 1);

        let (summary_path, report_paths) = pipeline.save(&analysis).unwrap();
        assert_eq!(
            report_paths,
            vec![dir.path().join("results").join("spec_analysis_1.txt")]
        );
        assert!(!dir.path().join("results").join("spec_analysis_0.txt").exists());

        let summary = fs::read_to_string(summary_path).unwrap();
        let rows: Vec<&str> = summary.lines().skip(1).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].parse::<f64>().unwrap(), analysis.candidates[0].mz);
    }

    #[test]
    fn test_load_table_failure_names_stage() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(config(dir.path()));
        let err = pipeline
            .load_table(dir.path().join("calibrated_data.txt"))
            .unwrap_err();
        assert_eq!(err.stage, Stage::Load);
        assert!(err.to_string().starts_with("load stage failed: "));

        let path = dir.path().join("bad.txt");
        fs::write(&path, "1.0 2.0\n3.0 oops\n").unwrap();
        let err = pipeline.load_table(&path).unwrap_err();
        assert!(matches!(
            err.cause::<DataLoadError>(),
            Some(DataLoadError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn test_calibration_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.calibration.masses.clear();
        config.calibration.times.clear();
        config.output.keep_intermediates = false;
        let pipeline = Pipeline::new(config);
        let trace = crate::test_data::raw_trace();
        let err = pipeline
            .run_trace(&trace, &AnalysisRequest::new(100.0, 1.0))
            .unwrap_err();
        assert_eq!(err.stage, Stage::Calibrate);
        assert_eq!(
            err.cause::<CalibrationError>(),
            Some(&CalibrationError::TooFewCalibrants(0))
        );
        assert!(!dir.path().join("results").exists());
    }
}
