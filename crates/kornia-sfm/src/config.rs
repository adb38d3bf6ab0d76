//! Run configuration loadable from JSON.
//!
//! Every field is optional in the file; missing fields take their default values.
//!
//! ```json
//! {
//!   "pipeline": {
//!     "matching": { "ratio": 0.8 },
//!     "two_view": { "solver": "eight_point" },
//!     "run_final_bundle_adjustment": true
//!   },
//!   "export": { "ply_format": "binary_little_endian", "outlier_std_factor": 3.0 }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::io::{IoError, PlyFormat};
use crate::pipeline::PipelineParams;

/// Output options.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Encoding of the exported point cloud.
    pub ply_format: PlyFormat,
    /// Drop points farther from the centroid than `mean + k * std` before export.
    pub outlier_std_factor: Option<f64>,
}

/// Complete configuration of a reconstruction run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SfmConfig {
    /// Pipeline parameters.
    pub pipeline: PipelineParams,
    /// Output options.
    pub export: ExportConfig,
}

impl SfmConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, IoError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Write the configuration, including defaults, to a JSON file.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<(), IoError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
