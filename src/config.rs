//! Pipeline configuration loaded from YAML.
//!
//! Every section and field is optional; missing values take the defaults
//! of the component they configure.
//!
//! ```yaml
//! store:
//!   voxel_size: 0.02
//! pipeline:
//!   frame_divisor: 3
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::export::ExportConfig;
use crate::fitting::FitterConfig;
use crate::points::ExtractionConfig;
use crate::system::CoordinatorConfig;
use crate::tracking::TrackerConfig;
use crate::voxel::StoreConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tracker: TrackerConfig,
    pub store: StoreConfig,
    pub extraction: ExtractionConfig,
    pub fitter: FitterConfig,
    pub exporter: ExportConfig,
    pub pipeline: CoordinatorConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject values the components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let t = &self.tracker;
        if !(t.correction_factor > 0.0 && t.correction_factor <= 1.0) {
            return invalid(format!(
                "tracker.correction_factor must be in (0, 1], got {}",
                t.correction_factor
            ));
        }
        if !(t.velocity_damping >= 0.0 && t.velocity_damping < 1.0) {
            return invalid(format!(
                "tracker.velocity_damping must be in [0, 1), got {}",
                t.velocity_damping
            ));
        }
        if !(self.store.voxel_size.is_finite() && self.store.voxel_size > 0.0) {
            return invalid(format!(
                "store.voxel_size must be positive, got {}",
                self.store.voxel_size
            ));
        }
        if self.fitter.max_iterations == 0 {
            return invalid("fitter.max_iterations must be at least 1".into());
        }
        if !(self.fitter.convergence_threshold.is_finite() && self.fitter.convergence_threshold >= 0.0) {
            return invalid(format!(
                "fitter.convergence_threshold must be finite and non-negative, got {}",
                self.fitter.convergence_threshold
            ));
        }
        if self.exporter.chunk_size == 0 {
            return invalid("exporter.chunk_size must be at least 1".into());
        }
        let p = &self.pipeline;
        if p.frame_divisor == 0 {
            return invalid("pipeline.frame_divisor must be at least 1".into());
        }
        if p.statistics_interval_ms == 0 {
            return invalid("pipeline.statistics_interval_ms must be at least 1".into());
        }
        Ok(())
    }
}
