//! Numerical building blocks for background matching and coaddition
//!
//! This crate provides the small, self-contained pieces of math the coadd
//! pipeline is built on:
//!
//! - **Chebyshev surfaces**: 2-D tensor-product Chebyshev polynomials defined
//!   over a pixel-coordinate box, used as smooth background models
//! - **Weighted least squares**: inverse-variance weighted normal equations
//!   with explicit singularity detection
//! - **Sample statistics**: mean / median / population standard deviation
//!   summaries used for bin observations and residual diagnostics

pub mod chebyshev;
pub mod lstsq;
pub mod stats;

pub use chebyshev::{chebyshev_values, Chebyshev2D, Domain2D};
pub use lstsq::{solve_weighted_normal_equations, LstsqError, WeightedSolution};
pub use stats::{mean_and_std, SampleStats};
