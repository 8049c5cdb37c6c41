//! Inverse-variance weighted least squares via the normal equations.
//!
//! Solves
//!
//! ```text
//! (Mᵀ W M) x = Mᵀ W b
//! ```
//!
//! with `W = diag(w)`, by forming the (small, square) normal matrix and
//! inverting it densely. Before inverting, the reciprocal condition number of
//! the normal matrix is checked from its singular values so that a
//! rank-deficient problem is reported instead of returning meaningless
//! coefficients.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Errors that can occur while solving a weighted least squares problem
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LstsqError {
    #[error("Invalid argument: {0}")]
    ArgumentError(String),

    #[error("underdetermined system: {rows} constraints for {cols} unknowns")]
    Underdetermined { rows: usize, cols: usize },

    #[error("normal matrix is singular (reciprocal condition number {rcond:.3e})")]
    Singular { rcond: f64 },
}

/// Solution of a weighted least squares problem.
#[derive(Debug, Clone)]
pub struct WeightedSolution {
    /// Best-fit parameter vector `x`
    pub coefficients: DVector<f64>,
    /// Reciprocal condition number of `MᵀWM` (smallest / largest singular value)
    pub rcond: f64,
    /// Weighted sum of squared residuals `Σ w_k (b_k - M_k x)²`
    pub chi_squared: f64,
}

/// Solve `(MᵀWM)x = MᵀWb` for `x`.
///
/// # Arguments
/// * `design` - Design matrix `M`, one row per constraint
/// * `target` - Target vector `b`
/// * `weights` - Per-row weights `w` (typically `1/σ²`)
/// * `min_rcond` - Reciprocal condition number below which the normal matrix
///   is treated as singular
///
/// # Errors
/// * `LstsqError::ArgumentError` - Mismatched dimensions or non-finite/negative weights
/// * `LstsqError::Underdetermined` - Fewer rows than columns
/// * `LstsqError::Singular` - Normal matrix not invertible or too ill-conditioned
pub fn solve_weighted_normal_equations(
    design: &DMatrix<f64>,
    target: &DVector<f64>,
    weights: &DVector<f64>,
    min_rcond: f64,
) -> Result<WeightedSolution, LstsqError> {
    let (rows, cols) = design.shape();
    if target.len() != rows || weights.len() != rows {
        return Err(LstsqError::ArgumentError(format!(
            "design has {rows} rows but target has {} and weights have {}",
            target.len(),
            weights.len()
        )));
    }
    if cols == 0 {
        return Err(LstsqError::ArgumentError(
            "design matrix has no columns".to_string(),
        ));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(LstsqError::ArgumentError(
            "weights must be finite and non-negative".to_string(),
        ));
    }
    if rows < cols {
        return Err(LstsqError::Underdetermined { rows, cols });
    }

    // Mᵀ W, computed by scaling each column of Mᵀ by its row weight
    let mut design_t_w = design.transpose();
    for (k, w) in weights.iter().enumerate() {
        design_t_w.column_mut(k).scale_mut(*w);
    }

    let normal = &design_t_w * design;
    let rhs = &design_t_w * target;

    let singular_values = normal.singular_values();
    let s_max = singular_values.max();
    let s_min = singular_values.min();
    let rcond = if s_max > 0.0 && s_max.is_finite() {
        s_min / s_max
    } else {
        0.0
    };
    if rcond.is_nan() || rcond < min_rcond {
        return Err(LstsqError::Singular { rcond });
    }

    let inverse = normal
        .try_inverse()
        .ok_or(LstsqError::Singular { rcond })?;
    let coefficients = inverse * rhs;
    if coefficients.iter().any(|c| !c.is_finite()) {
        return Err(LstsqError::Singular { rcond });
    }

    let residuals = target - design * &coefficients;
    let chi_squared = residuals
        .iter()
        .zip(weights.iter())
        .map(|(r, w)| w * r * r)
        .sum();

    Ok(WeightedSolution {
        coefficients,
        rcond,
        chi_squared,
    })
}
