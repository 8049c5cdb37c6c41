//! Pipeline configuration.
//!
//! Stored as JSON. Every field has a default, so a config file only needs
//! the values it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use shared::mask::{plane_bit_mask, MaskError};
use shared::psf::PsfModel;

use crate::background::BackgroundMatcher;
use crate::selection::SelectionConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read or write config: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Mask(#[from] MaskError),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How candidates are matched against the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Each run is matched as soon as it has been warped
    #[default]
    PerRun,
    /// All runs are warped first, then matched over a shared clean-sky mask
    Batch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoaddConfig {
    /// Mask planes whose pixels never contribute to the coadd
    pub bad_mask_planes: Vec<String>,
    /// Weight of each candidate mosaic; the reference always weighs 1
    pub weight: f64,
}

impl Default for CoaddConfig {
    fn default() -> Self {
        Self {
            bad_mask_planes: vec!["BAD".to_string(), "SAT".to_string(), "NO_DATA".to_string()],
            weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchBackgroundsConfig {
    /// Resampling kernel requested from the warper
    pub warping_kernel_name: String,
    /// Chebyshev order of the background-correction surface
    pub background_order: usize,
    /// Bin size in pixels for background statistics
    pub bin_size: usize,
    /// Rows shared by consecutive fields of a run
    pub overlap_px: usize,
    /// Electrons per count, used to estimate variance from pixels
    pub gain: f64,
    /// Persist the reference, every per-run product and the coadd
    pub write_outputs: bool,
    pub output_path: PathBuf,
    /// Side length of the reference PSF kernel
    pub ref_psf_size: usize,
    pub ref_psf_sigma: f64,
    /// Stop after this many candidate runs have been loaded, stitched and warped
    pub max_runs: Option<usize>,
    pub match_mode: MatchMode,
    pub uncertainty_floor: f64,
    pub min_rcond: f64,
    /// Run the per-run chain on the rayon pool
    pub parallel: bool,
    /// Matched exposures allowed in flight ahead of the accumulator
    pub queue_depth: usize,
    pub coadd: CoaddConfig,
    pub selection: SelectionConfig,
}

impl Default for MatchBackgroundsConfig {
    fn default() -> Self {
        let matcher = BackgroundMatcher::default();
        Self {
            warping_kernel_name: "lanczos3".to_string(),
            background_order: 1,
            bin_size: 256,
            overlap_px: 128,
            gain: 1.0,
            write_outputs: true,
            output_path: PathBuf::from("/tmp"),
            ref_psf_size: 31,
            ref_psf_sigma: 4.0,
            max_runs: None,
            match_mode: MatchMode::PerRun,
            uncertainty_floor: matcher.uncertainty_floor,
            min_rcond: matcher.min_rcond,
            parallel: false,
            queue_depth: 2,
            coadd: CoaddConfig::default(),
            selection: SelectionConfig::default(),
        }
    }
}

impl MatchBackgroundsConfig {
    /// Load from JSON file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if self.bin_size == 0 {
            return invalid("bin_size", "must be at least 1");
        }
        if !(self.gain.is_finite() && self.gain > 0.0) {
            return invalid("gain", "must be positive and finite");
        }
        if self.ref_psf_size == 0 || self.ref_psf_size % 2 == 0 {
            return invalid("ref_psf_size", "must be odd");
        }
        if !(self.ref_psf_sigma.is_finite() && self.ref_psf_sigma > 0.0) {
            return invalid("ref_psf_sigma", "must be positive and finite");
        }
        if !(self.uncertainty_floor.is_finite() && self.uncertainty_floor > 0.0) {
            return invalid("uncertainty_floor", "must be positive and finite");
        }
        if !(self.min_rcond.is_finite() && self.min_rcond >= 0.0) {
            return invalid("min_rcond", "must be non-negative");
        }
        if !(self.coadd.weight.is_finite() && self.coadd.weight > 0.0) {
            return invalid("coadd.weight", "must be positive and finite");
        }
        if self.warping_kernel_name.trim().is_empty() {
            return invalid("warping_kernel_name", "must name a kernel");
        }
        if !(1..=3).contains(&self.selection.min_quality) {
            return invalid("selection.min_quality", "must be 1, 2 or 3");
        }
        if self.queue_depth == 0 {
            return invalid("queue_depth", "must be at least 1");
        }
        self.bad_mask()?;
        Ok(())
    }

    /// Bits of the configured bad mask planes
    pub fn bad_mask(&self) -> Result<u32, MaskError> {
        plane_bit_mask(&self.coadd.bad_mask_planes)
    }

    pub fn matcher(&self) -> BackgroundMatcher {
        BackgroundMatcher {
            order: self.background_order,
            bin_size: self.bin_size,
            uncertainty_floor: self.uncertainty_floor,
            min_rcond: self.min_rcond,
        }
    }

    /// The PSF every exposure is matched to
    pub fn reference_psf(&self) -> PsfModel {
        PsfModel::single_gaussian(self.ref_psf_size, self.ref_psf_sigma)
    }
}
