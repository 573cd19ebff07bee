//! Hypocenter-based 3D imaging of active faults.
//!
//! The crate reconstructs planar fault patches from clustered microseismicity,
//! propagates hypocenter location uncertainty into the patch orientation by
//! Monte Carlo resampling, and scores every patch against independently
//! measured focal mechanisms. The sensitivity sweep reruns the whole pipeline
//! over a grid of search radii and time windows.

pub mod catalog;
pub mod config;
pub mod focal;
pub mod geometry;
pub mod output;
pub mod patch;
pub mod pipeline;
pub mod proximity;
pub mod resample;
pub mod sweep;
pub mod validation;

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub use catalog::{CatalogStore, GeoOrigin, HypoId, Hypocenter, LoadReport, MagnitudeType};
pub use config::{NodalPlaneRule, PipelineConfig, SearchParams, DT_NN_UNBOUNDED};
pub use focal::{FocalCatalog, FocalMechanism};
pub use output::create_timestamped_output_dir;
pub use patch::{FaultPatch, FaultPatchEstimator, PatchParams, PatchSet, RejectedCluster};
pub use pipeline::{run_pipeline, GraphStats, PipelineOutput};
pub use proximity::{Cluster, NeighborSearch, ProximityEdge, ProximityGraph};
pub use resample::{DrawIter, ResampledDraw, Resampler, UncertaintyModel};
pub use sweep::{run_sensitivity_sweep, SweepGrid, SweepReport, SweepRun};
pub use validation::{
    FocalMechanismValidator, MatchStatus, NodalPlane, ValidationParams, ValidationRecord,
    ValidationTable,
};

#[derive(Debug, Error)]
pub enum FaultNetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("data error: {0}")]
    Data(#[from] DataError),
    #[error("degenerate geometry in cluster {cluster_id}: {reason}")]
    DegenerateGeometry { cluster_id: usize, reason: String },
    #[error("{context} length mismatch: expected {expected}, got {got}")]
    LengthMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },
}

/// A malformed or missing field in one input record.
///
/// Fatal for the record it describes, never for the run.
#[derive(Debug, Clone, PartialEq)]
pub struct DataError {
    pub file: Option<PathBuf>,
    /// 1-based data row, header excluded.
    pub row: Option<usize>,
    pub id: Option<HypoId>,
    pub message: String,
}

impl DataError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            file: None,
            row: None,
            id: None,
            message: message.into(),
        }
    }

    pub fn with_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }

    pub fn with_id(mut self, id: HypoId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{}: ", file.display())?;
        }
        if let Some(row) = self.row {
            write!(f, "row {row}: ")?;
        }
        if let Some(id) = self.id {
            write!(f, "event {id}: ")?;
        }
        f.write_str(&self.message)
    }
}

impl std::error::Error for DataError {}

pub type Result<T, E = FaultNetError> = std::result::Result<T, E>;
