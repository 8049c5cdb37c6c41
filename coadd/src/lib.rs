//! Background-matched coaddition of overlapping drift-scan exposures
//!
//! Given a reference field, the pipeline finds every other imaging run that
//! overlaps it, stitches each run's along-strip fields into one mosaic, warps
//! the mosaic onto the reference grid, removes the sky-level difference with a
//! low-order Chebyshev surface fitted over clean sky, and accumulates the
//! result into a weighted coadd.
//!
//! # Modules
//!
//! - [`stitch`]: seamless vertical stitching of one run's sub-images
//! - [`background`]: binned clean-sky statistics and the weighted surface fit
//! - [`accumulate`]: weighted coadd state with mask and edge propagation
//! - [`pipeline`]: per-field orchestration, sequential or on the rayon pool
//! - [`collaborators`]: catalog, loader, PSF matcher, warper and sink interfaces
//! - [`selection`]: candidate filtering, strip resolution and run grouping
//! - [`synthetic`]: in-memory collaborators for tests and demonstrations
//!
//! # Example
//!
//! ```
//! use coadd::synthetic::{
//!     AdoptTargetPsf, LinearBackground, NearestNeighborWarper, SyntheticRun, SyntheticSurvey,
//! };
//! use coadd::pipeline::{Collaborators, CoaddPipeline, FieldTarget};
//! use coadd::sink::NullSink;
//! use coadd::config::MatchBackgroundsConfig;
//! use shared::image_size::ImageSize;
//! use shared::synthetic::SkyScene;
//!
//! let size = ImageSize::from_width_height(64, 64);
//! let extent = SyntheticSurvey::frame_extent(size, 8, 0..=4);
//! let survey = SyntheticSurvey::new(
//!     size,
//!     8,
//!     SkyScene::random(extent, 10, 100.0, 1),
//!     vec![
//!         SyntheticRun::new(94, "N", 0..=4),
//!         SyntheticRun::new(1755, "N", 0..=4).with_background(LinearBackground::constant(5.0)),
//!     ],
//! );
//! let config = MatchBackgroundsConfig {
//!     background_order: 0,
//!     bin_size: 16,
//!     overlap_px: 8,
//!     warping_kernel_name: NearestNeighborWarper::KERNEL.to_string(),
//!     write_outputs: false,
//!     ..MatchBackgroundsConfig::default()
//! };
//! let collaborators = Collaborators {
//!     catalog: &survey,
//!     loader: &survey,
//!     psf_matcher: &AdoptTargetPsf,
//!     warper: &NearestNeighborWarper,
//!     sink: &NullSink,
//! };
//! let target = FieldTarget::new(94, 40, "r", 3);
//! let pipeline = CoaddPipeline::new(config, target, collaborators).unwrap();
//! let outcome = pipeline.process_field(2).unwrap();
//! assert_eq!(outcome.contributing_runs(), vec![1755]);
//! ```

pub mod accumulate;
pub mod background;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod naming;
pub mod pipeline;
pub mod selection;
pub mod shared_args;
pub mod sink;
pub mod stitch;
pub mod synthetic;

pub use accumulate::{AccumulateError, CoaddResult, CoaddState};
pub use background::{
    BackgroundError, BackgroundMatcher, BackgroundModel, FitError, MatchedExposure,
};
pub use config::{ConfigError, MatchBackgroundsConfig, MatchMode};
pub use error::{CollaboratorError, Component, PipelineError};
pub use pipeline::{CoaddPipeline, Collaborators, FieldOutcome, FieldTarget, RunOutcome, RunReport};
pub use stitch::{stitch, StitchError};
