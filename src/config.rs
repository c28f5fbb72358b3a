//! TOML configuration of a whole pipeline run.
//!
//! Every section and field is optional and falls back to its default:
//!
//! ```toml
//! [preprocess]
//! cutoff = 1000.0
//! sampling_rate = 10000.0
//! order = 5
//! window_length = 30000
//!
//! [calibration]
//! masses = [28.0, 44.0]
//! times = [2.61e-5, 3.27e-5]
//!
//! [analysis]
//! precision = 1.0
//! smoothing_window = "bartlett"
//! shape = "emg"
//! reported_peaks = "within-tolerance"
//!
//! [output]
//! results_dir = "results"
//! keep_intermediates = true
//! ```
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::AnalysisConfig;
use crate::calibration::CalibrationConfig;
use crate::preprocess::PreprocessConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Where results and intermediate tables are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub results_dir: PathBuf,
    /// Write the preprocessed and calibrated traces as well
    pub keep_intermediates: bool,
    /// The directory for intermediate tables. A fresh temporary directory is
    /// used when this is not set.
    pub work_dir: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            keep_intermediates: false,
            work_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub preprocess: PreprocessConfig,
    pub calibration: CalibrationConfig,
    pub analysis: AnalysisConfig,
    pub output: OutputConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }
}

impl FromStr for PipelineConfig {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::ReportedPeaks;
    use crate::shape::PeakShapeKind;
    use crate::smooth::WindowKind;

    #[test]
    fn test_parse_config() {
        let toml = r#"
            [preprocess]
            cutoff = 500.0
            sampling_rate = 20000.0
            order = 3
            window_length = 1000
            allow_truncated_window = true

            [calibration]
            masses = [28.0, 44.0]
            times = [2.61e-5, 3.27e-5]
            initial_guess = [2e11, 1e-6]

            [analysis]
            precision = 0.5
            smoothing_window = "hanning"
            smoothing_length = 11
            shape = "emg"
            reported_peaks = "within-tolerance"

            [output]
            results_dir = "out"
            keep_intermediates = true
            work_dir = "work"
        "#;

        let config: PipelineConfig = toml.parse().unwrap();
        assert_eq!(config.preprocess.cutoff, 500.0);
        assert_eq!(config.preprocess.order, 3);
        assert!(config.preprocess.allow_truncated_window);
        assert_eq!(config.calibration.masses, vec![28.0, 44.0]);
        assert_eq!(config.calibration.initial_guess, (2e11, 1e-6));
        assert_eq!(config.calibration.window_length, 30000);
        assert_eq!(config.analysis.smoothing_window, WindowKind::Hanning);
        assert_eq!(config.analysis.shape, PeakShapeKind::Emg);
        assert_eq!(config.analysis.reported_peaks, ReportedPeaks::WithinTolerance);
        assert_eq!(config.analysis.fit_range, 1.5);
        assert_eq!(config.output.work_dir, Some(PathBuf::from("work")));
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [analysis]
            precision = 0.25
        "#;
        let config: PipelineConfig = toml.parse().unwrap();
        assert_eq!(config.analysis.precision, 0.25);
        assert_eq!(config.analysis.smoothing_length, 9);
        assert_eq!(config.preprocess, PreprocessConfig::default());
        assert!(!config.output.keep_intermediates);
    }

    #[test]
    fn test_empty_config() {
        let config: PipelineConfig = "".parse().unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.output.results_dir, PathBuf::from("results"));
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            "[analysis]\nshape = \"lorentzian\"".parse::<PipelineConfig>(),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            PipelineConfig::from_file("does/not/exist.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
