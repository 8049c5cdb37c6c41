//! Command-line arguments shared by the coadd binaries.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::{ConfigError, MatchBackgroundsConfig, MatchMode};

/// Comma-separated list of mask plane names, e.g. "BAD,SAT,NO_DATA"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneList(pub Vec<String>);

impl std::str::FromStr for PlaneList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let planes: Vec<String> = s
            .split(',')
            .map(|p| p.trim().to_uppercase())
            .filter(|p| !p.is_empty())
            .collect();
        if planes.is_empty() {
            return Err("at least one mask plane is required".to_string());
        }
        Ok(PlaneList(planes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MatchModeArg {
    PerRun,
    Batch,
}

impl From<MatchModeArg> for MatchMode {
    fn from(arg: MatchModeArg) -> Self {
        match arg {
            MatchModeArg::PerRun => MatchMode::PerRun,
            MatchModeArg::Batch => MatchMode::Batch,
        }
    }
}

/// Pipeline settings that can be given on the command line.
///
/// Flags left unset keep the value from `--config` (or the built-in default).
#[derive(Parser, Debug, Clone, Default)]
pub struct SharedPipelineArgs {
    /// JSON configuration file to start from
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Chebyshev order of the background-correction surface
    #[arg(long)]
    pub background_order: Option<usize>,

    /// Bin size in pixels for background statistics
    #[arg(long)]
    pub bin_size: Option<usize>,

    /// Rows shared by consecutive fields of a run
    #[arg(long)]
    pub overlap_px: Option<usize>,

    /// Attempt at most this many candidate runs per field
    #[arg(long)]
    pub max_runs: Option<usize>,

    /// How candidates are matched against the reference
    #[arg(long, value_enum)]
    pub match_mode: Option<MatchModeArg>,

    /// Mask planes excluded from the coadd (comma separated)
    #[arg(long)]
    pub bad_mask_planes: Option<PlaneList>,

    /// Directory for persisted products
    #[arg(long)]
    pub output_path: Option<PathBuf>,

    /// Interpolation kernel requested from the warper
    #[arg(long)]
    pub warping_kernel: Option<String>,

    /// Do not persist any product
    #[arg(long, default_value_t = false)]
    pub no_write: bool,

    /// Process candidate runs concurrently
    #[arg(long, default_value_t = false)]
    pub parallel: bool,
}

impl SharedPipelineArgs {
    /// Resolve the configuration: file (or defaults) overridden by flags.
    pub fn resolve_config(&self) -> Result<MatchBackgroundsConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => MatchBackgroundsConfig::load_from_file(path)?,
            None => MatchBackgroundsConfig::default(),
        };
        if let Some(order) = self.background_order {
            config.background_order = order;
        }
        if let Some(bin_size) = self.bin_size {
            config.bin_size = bin_size;
        }
        if let Some(overlap) = self.overlap_px {
            config.overlap_px = overlap;
        }
        if self.max_runs.is_some() {
            config.max_runs = self.max_runs;
        }
        if let Some(mode) = self.match_mode {
            config.match_mode = mode.into();
        }
        if let Some(PlaneList(planes)) = &self.bad_mask_planes {
            config.coadd.bad_mask_planes = planes.clone();
        }
        if let Some(path) = &self.output_path {
            config.output_path = path.clone();
        }
        if let Some(kernel) = &self.warping_kernel {
            config.warping_kernel_name = kernel.clone();
        }
        if self.no_write {
            config.write_outputs = false;
        }
        if self.parallel {
            config.parallel = true;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = SharedPipelineArgs::parse_from([
            "test",
            "--background-order",
            "0",
            "--bin-size",
            "64",
            "--match-mode",
            "batch",
            "--bad-mask-planes",
            "bad, sat",
            "--parallel",
        ]);
        let config = args.resolve_config().unwrap();
        assert_eq!(config.background_order, 0);
        assert_eq!(config.bin_size, 64);
        assert_eq!(config.match_mode, MatchMode::Batch);
        assert_eq!(config.coadd.bad_mask_planes, vec!["BAD", "SAT"]);
        assert!(config.parallel);
        assert!(config.write_outputs);
        assert_eq!(config.warping_kernel_name, "lanczos3");
        assert_eq!(config.overlap_px, 128);
    }

    #[test]
    fn test_kernel_and_write_flags() {
        let args =
            SharedPipelineArgs::parse_from(["test", "--warping-kernel", "nearest", "--no-write"]);
        let config = args.resolve_config().unwrap();
        assert_eq!(config.warping_kernel_name, "nearest");
        assert!(!config.write_outputs);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let args = SharedPipelineArgs::parse_from(["test", "--bin-size", "0"]);
        assert!(args.resolve_config().is_err());
    }
}
