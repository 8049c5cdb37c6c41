//! Two-dimensional Chebyshev polynomial surfaces.
//!
//! A [`Chebyshev2D`] of order `N` is the tensor product
//!
//! ```text
//! f(x, y) = Σ_j Σ_i c[j·(N+1) + i] · T_i(x') · T_j(y')
//! ```
//!
//! for `i, j ∈ [0, N]`, where `T_n` is the Chebyshev polynomial of the first
//! kind and `(x', y')` are the pixel coordinates `(x, y)` mapped linearly from
//! the surface [`Domain2D`] onto `[-1, 1]²`.
//!
//! The domain is always expressed in parent pixel coordinates. Callers hand in
//! pixel positions, never normalized ones.

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Continuous rectangular domain in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Domain2D {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl Domain2D {
    pub fn new(x_min: f64, x_max: f64, y_min: f64, y_max: f64) -> Self {
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    /// Continuous box covering integer pixels `[x0, x0 + width) × [y0, y0 + height)`.
    ///
    /// Pixel centers sit on integers, so the box edges are half a pixel
    /// outside the first and last pixel centers.
    pub fn from_pixel_box(x0: i64, y0: i64, width: usize, height: usize) -> Self {
        Self {
            x_min: x0 as f64 - 0.5,
            x_max: x0 as f64 + width as f64 - 0.5,
            y_min: y0 as f64 - 0.5,
            y_max: y0 as f64 + height as f64 - 0.5,
        }
    }

    /// Map a pixel x coordinate onto `[-1, 1]`.
    pub fn normalize_x(&self, x: f64) -> f64 {
        normalize(x, self.x_min, self.x_max)
    }

    /// Map a pixel y coordinate onto `[-1, 1]`.
    pub fn normalize_y(&self, y: f64) -> f64 {
        normalize(y, self.y_min, self.y_max)
    }
}

fn normalize(v: f64, lo: f64, hi: f64) -> f64 {
    let span = hi - lo;
    if span <= 0.0 {
        return 0.0;
    }
    (2.0 * v - (lo + hi)) / span
}

/// Fill `out` with `T_0(x) .. T_{out.len()-1}(x)` using the three-term recurrence.
pub fn chebyshev_values(x: f64, out: &mut [f64]) {
    if out.is_empty() {
        return;
    }
    out[0] = 1.0;
    if out.len() > 1 {
        out[1] = x;
    }
    for n in 2..out.len() {
        out[n] = 2.0 * x * out[n - 1] - out[n - 2];
    }
}

/// Tensor-product Chebyshev surface over a pixel-coordinate domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chebyshev2D {
    order: usize,
    domain: Domain2D,
    coefficients: Vec<f64>,
}

impl Chebyshev2D {
    /// Surface of the given order with every coefficient set to zero.
    pub fn zeros(order: usize, domain: Domain2D) -> Self {
        Self {
            order,
            domain,
            coefficients: vec![0.0; Self::term_count(order)],
        }
    }

    /// Number of coefficients for a surface of `order`: `(order + 1)²`.
    pub fn term_count(order: usize) -> usize {
        (order + 1) * (order + 1)
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn domain(&self) -> &Domain2D {
        &self.domain
    }

    pub fn n_terms(&self) -> usize {
        self.coefficients.len()
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Replace all coefficients.
    ///
    /// # Panics
    /// Panics if `coefficients.len()` differs from [`Self::n_terms`].
    pub fn set_coefficients(&mut self, coefficients: &[f64]) {
        assert_eq!(
            coefficients.len(),
            self.coefficients.len(),
            "coefficient count mismatch for order {}",
            self.order
        );
        self.coefficients.copy_from_slice(coefficients);
    }

    /// Set a single coefficient `k = j·(order+1) + i`.
    pub fn set_coefficient(&mut self, k: usize, value: f64) {
        self.coefficients[k] = value;
    }

    /// Evaluate the surface at pixel position `(x, y)`.
    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        let n = self.order + 1;
        let mut tx = vec![0.0; n];
        let mut ty = vec![0.0; n];
        chebyshev_values(self.domain.normalize_x(x), &mut tx);
        chebyshev_values(self.domain.normalize_y(y), &mut ty);
        self.combine(&tx, &ty)
    }

    fn combine(&self, tx: &[f64], ty: &[f64]) -> f64 {
        let n = self.order + 1;
        let mut total = 0.0;
        for (j, &tyj) in ty.iter().enumerate() {
            let row = &self.coefficients[j * n..(j + 1) * n];
            let inner: f64 = row.iter().zip(tx).map(|(c, t)| c * t).sum();
            total += tyj * inner;
        }
        total
    }

    /// Value of every basis function at `(x, y)`.
    ///
    /// Each entry is obtained by evaluating this very surface type with one
    /// coefficient set to 1 and the rest set to 0, so the design matrix built
    /// from these rows always agrees with [`Self::evaluate`].
    pub fn basis_values(&self, x: f64, y: f64) -> Vec<f64> {
        let mut unit = Chebyshev2D::zeros(self.order, self.domain);
        let mut row = Vec::with_capacity(unit.n_terms());
        for k in 0..unit.n_terms() {
            unit.set_coefficient(k, 1.0);
            row.push(unit.evaluate(x, y));
            unit.set_coefficient(k, 0.0);
        }
        row
    }

    /// Evaluate the surface on a pixel grid of shape `(height, width)` whose
    /// first element sits at pixel `(x0, y0)`.
    ///
    /// Basis values are tabulated once per column and once per row; the
    /// per-pixel work runs on the rayon pool.
    pub fn evaluate_grid(&self, x0: i64, y0: i64, width: usize, height: usize) -> Array2<f64> {
        let n = self.order + 1;
        let tx_table: Vec<Vec<f64>> = (0..width)
            .map(|ix| {
                let mut t = vec![0.0; n];
                chebyshev_values(self.domain.normalize_x((x0 + ix as i64) as f64), &mut t);
                t
            })
            .collect();
        let ty_table: Vec<Vec<f64>> = (0..height)
            .map(|iy| {
                let mut t = vec![0.0; n];
                chebyshev_values(self.domain.normalize_y((y0 + iy as i64) as f64), &mut t);
                t
            })
            .collect();

        let mut grid = Array2::<f64>::zeros((height, width));
        Zip::indexed(&mut grid).par_for_each(|(iy, ix), value| {
            *value = self.combine(&tx_table[ix], &ty_table[iy]);
        });
        grid
    }
}
