//! Error taxonomy for the coadd pipeline.
//!
//! Per-run and per-image failures are caught at the run boundary and turn
//! into an excluded run; only catalog-level failures abort a whole field
//! (see [`PipelineError::is_field_fatal`]).

use shared::exposure::{ExposureError, ExposureId};
use shared::image_size::PixelBox;
use std::fmt;
use thiserror::Error;

use crate::accumulate::AccumulateError;
use crate::background::{BackgroundError, FitError};
use crate::config::ConfigError;
use crate::stitch::StitchError;

/// Failure reported by an external collaborator (catalog, loader, PSF
/// matcher, warper or output sink).
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("{0}")]
    Failed(String),

    #[error("unsupported warping kernel {0:?}")]
    UnsupportedKernel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid exposure: {0}")]
    Exposure(#[from] ExposureError),
}

/// Exposure component that a loader can fail to provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Pixels,
    Mask,
    Wcs,
    Psf,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Pixels => "pixels",
            Component::Mask => "mask",
            Component::Wcs => "wcs",
            Component::Psf => "psf",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("missing {component} for {id}")]
    MissingData { id: ExposureId, component: Component },

    #[error("run {run}: loaded {loaded} of {required} sub-images")]
    IncompleteRun {
        run: u32,
        loaded: usize,
        required: usize,
    },

    #[error("background fit failed: {0}")]
    SingularFit(#[from] FitError),

    #[error("geometry mismatch: expected {expected}, got {actual}")]
    GeometryMismatch { expected: PixelBox, actual: PixelBox },

    #[error("catalog query failed: {0}")]
    CatalogQuery(#[source] CollaboratorError),

    #[error("reference run {refrun} maps to {} strips ({})", .strips.len(), .strips.join(", "))]
    AmbiguousStrip { refrun: u32, strips: Vec<String> },

    #[error("PSF matching failed: {0}")]
    PsfMatch(#[source] CollaboratorError),

    #[error("warping failed: {0}")]
    Warp(#[source] CollaboratorError),

    #[error("stitching failed: {0}")]
    Stitch(#[from] StitchError),

    #[error("invalid exposure: {0}")]
    Exposure(#[from] ExposureError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("accumulation failed: {0}")]
    Accumulate(#[from] AccumulateError),
}

impl PipelineError {
    /// Whether this error invalidates the whole field rather than one run.
    pub fn is_field_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::CatalogQuery(_) | PipelineError::AmbiguousStrip { .. }
        )
    }
}

impl From<BackgroundError> for PipelineError {
    fn from(err: BackgroundError) -> Self {
        match err {
            BackgroundError::Fit(fit) => PipelineError::SingularFit(fit),
            BackgroundError::GeometryMismatch { expected, actual } => {
                PipelineError::GeometryMismatch { expected, actual }
            }
        }
    }
}
