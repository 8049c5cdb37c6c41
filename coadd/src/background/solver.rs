//! Weighted least-squares fit of a Chebyshev background surface.

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use coadd_math::{solve_weighted_normal_equations, Chebyshev2D, Domain2D, LstsqError};
use shared::image_size::PixelBox;

use super::binning::BinObservation;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("{bins} usable bins cannot constrain {terms} background terms")]
    InsufficientBins { bins: usize, terms: usize },

    #[error("background normal matrix is singular (rcond {rcond:.3e})")]
    Singular { rcond: f64 },

    #[error("invalid bin observations: {0}")]
    InvalidObservations(String),
}

impl From<LstsqError> for FitError {
    fn from(err: LstsqError) -> Self {
        match err {
            LstsqError::Underdetermined { rows, cols } => FitError::InsufficientBins {
                bins: rows,
                terms: cols,
            },
            LstsqError::Singular { rcond } => FitError::Singular { rcond },
            LstsqError::ArgumentError(msg) => FitError::InvalidObservations(msg),
        }
    }
}

/// Solved background-correction surface.
///
/// Adding the surface to the candidate it was fitted against brings that
/// candidate's background onto the reference's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundModel {
    surface: Chebyshev2D,
    /// Reciprocal condition number of the normal matrix
    pub rcond: f64,
    pub chi_squared: f64,
    pub n_bins: usize,
}

impl BackgroundModel {
    pub fn order(&self) -> usize {
        self.surface.order()
    }

    pub fn coefficients(&self) -> &[f64] {
        self.surface.coefficients()
    }

    pub fn domain(&self) -> &Domain2D {
        self.surface.domain()
    }

    /// Correction at parent pixel `(x, y)`
    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        self.surface.evaluate(x, y)
    }

    /// Correction tabulated over `bbox`, shape `(height, width)`
    pub fn render(&self, bbox: PixelBox) -> Array2<f64> {
        self.surface
            .evaluate_grid(bbox.x0, bbox.y0, bbox.width, bbox.height)
    }
}

/// Fit a surface of `order` over `domain` to the bin observations.
///
/// Each observation becomes one row of the design matrix, weighted by
/// `1 / max(uncertainty, uncertainty_floor)²`.
///
/// # Errors
/// * `FitError::InsufficientBins` - fewer observations than surface terms
/// * `FitError::Singular` - normal matrix not invertible, or its reciprocal
///   condition number is below `min_rcond`
pub fn fit_surface(
    observations: &[BinObservation],
    order: usize,
    domain: Domain2D,
    uncertainty_floor: f64,
    min_rcond: f64,
) -> Result<BackgroundModel, FitError> {
    let mut surface = Chebyshev2D::zeros(order, domain);
    let terms = surface.n_terms();
    let bins = observations.len();
    if bins < terms {
        return Err(FitError::InsufficientBins { bins, terms });
    }

    let mut design = DMatrix::<f64>::zeros(bins, terms);
    let mut target = DVector::<f64>::zeros(bins);
    let mut weights = DVector::<f64>::zeros(bins);
    for (row, obs) in observations.iter().enumerate() {
        for (col, value) in surface.basis_values(obs.x, obs.y).into_iter().enumerate() {
            design[(row, col)] = value;
        }
        target[row] = obs.value;
        let sigma = obs.uncertainty.max(uncertainty_floor);
        weights[row] = 1.0 / (sigma * sigma);
    }

    let solution = solve_weighted_normal_equations(&design, &target, &weights, min_rcond)?;
    surface.set_coefficients(solution.coefficients.as_slice());

    Ok(BackgroundModel {
        surface,
        rcond: solution.rcond,
        chi_squared: solution.chi_squared,
        n_bins: bins,
    })
}
